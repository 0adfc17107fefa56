use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::filters::FilterTree;
use crate::loader::{discover, PluginLoader};
use crate::source::Source;

/// How far provider discovery has come.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryProgress {
    /// Number of candidate directories; `None` until the plugin root has been listed.
    pub total: Option<usize>,
    /// Candidates that finished loading, were skipped, or failed.
    pub settled: usize,
}

impl DiscoveryProgress {
    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if self.settled >= total)
    }
}

/// The set of loaded sources, indexed by id.
///
/// Ids are expected to be unique. When two providers report the same id the first one registered
/// is kept and the later one is rejected with a warning, so a source's default filters never
/// change once recorded.
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, Arc<dyn Source>>>,
    defaults: RwLock<HashMap<String, FilterTree>>,
    failures: Mutex<Vec<(PathBuf, String)>>,
    progress: watch::Sender<DiscoveryProgress>,
}

impl SourceRegistry {
    fn with_progress(progress: DiscoveryProgress) -> Self {
        let (progress, _) = watch::channel(progress);
        Self {
            sources: RwLock::new(HashMap::new()),
            defaults: RwLock::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
            progress,
        }
    }

    /// An empty registry with nothing left to discover. Sources are added with [`Self::register`].
    pub fn new() -> Self {
        Self::with_progress(DiscoveryProgress { total: Some(0), settled: 0 })
    }

    /// Start loading every provider directory under `root` in the background.
    pub fn discover(loader: Arc<PluginLoader>, root: PathBuf) -> Arc<Self> {
        let registry = Arc::new(Self::with_progress(DiscoveryProgress::default()));
        let task = registry.clone();
        tokio::spawn(async move { task.run_discovery(loader, root).await });
        registry
    }

    async fn run_discovery(&self, loader: Arc<PluginLoader>, root: PathBuf) {
        let candidates = discover(&root).await.unwrap_or_else(|e| {
            warn!(root = %root.display(), error = %e, "failed to list plugin directory");
            Vec::new()
        });
        info!(root = %root.display(), candidates = candidates.len(), "discovering providers");
        self.progress.send_modify(|p| p.total = Some(candidates.len()));

        let mut loads: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|dir| {
                let loader = loader.clone();
                async move {
                    let result = loader.load(&dir).await;
                    (dir, result)
                }
            })
            .collect();

        while let Some((dir, result)) = loads.next().await {
            match result {
                Ok(Some(source)) => {
                    self.register(source);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "failed to load provider");
                    self.failures
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((dir, e.to_string()));
                }
            }
            self.progress.send_modify(|p| p.settled += 1);
        }
    }

    /// Index a source and snapshot its initial filters. Returns false for a duplicate id.
    pub fn register(&self, source: Arc<dyn Source>) -> bool {
        let id = source.id().to_string();
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sources.get(&id) {
            if !Arc::ptr_eq(existing, &source) {
                warn!(id = %id, "duplicate source id; keeping the first registered provider");
            }
            return false;
        }
        self.defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
            .or_insert_with(|| source.filters());
        sources.insert(id, source);
        true
    }

    /// Lookup without waiting for discovery.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Source>> {
        self.sources.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Resolve a source by id.
    ///
    /// Returns as soon as a matching source is registered, and `None` only after every discovery
    /// candidate has settled without one.
    pub async fn query_source(&self, id: &str) -> Option<Arc<dyn Source>> {
        let mut rx = self.progress.subscribe();
        loop {
            if let Some(source) = self.get(id) {
                return Some(source);
            }
            let complete = rx.borrow_and_update().is_complete();
            if complete || rx.changed().await.is_err() {
                return self.get(id);
            }
        }
    }

    /// An independent copy of the filters a source started with.
    pub fn default_filters(&self, id: &str) -> Option<FilterTree> {
        self.defaults.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Loaded sources ordered by id.
    pub fn sources(&self) -> Vec<Arc<dyn Source>> {
        let mut all: Vec<_> = self
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub fn progress(&self) -> DiscoveryProgress {
        *self.progress.borrow()
    }

    /// Candidates that failed to load, with the reason.
    pub fn failures(&self) -> Vec<(PathBuf, String)> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Wait until every discovery candidate has settled.
    pub async fn ready(&self) {
        let mut rx = self.progress.subscribe();
        if rx.wait_for(DiscoveryProgress::is_complete).await.is_err() {
            warn!("discovery channel closed before completion");
        }
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
