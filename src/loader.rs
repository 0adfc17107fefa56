//! Provider discovery and content-addressed instantiation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::PluginLoadError;
use crate::fetch::FetchCapability;
use crate::plugins::PluginConfig;
use crate::source::{Source, SourceFactory};

/// File a provider directory must contain to be loaded.
pub const ENTRY_MODULE: &str = "main.wasm";
/// Optional per-provider settings next to the entry module.
pub const PLUGIN_CONFIG: &str = "plugin.toml";

pub const DEFAULT_RATE_LIMIT: Duration = Duration::from_millis(150);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub rate_limit: Duration,
    pub call_timeout: Duration,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self { rate_limit: DEFAULT_RATE_LIMIT, call_timeout: DEFAULT_CALL_TIMEOUT }
    }
}

type Slot = Arc<OnceCell<Arc<dyn Source>>>;

/// Loads provider directories into sources.
///
/// Instances are cached by the SHA-256 of the entry module, so identical provider code found at
/// two paths yields one shared instance (and one set of filter state). The first load of a given
/// module decides which `plugin.toml` applies to it.
pub struct PluginLoader {
    factory: Arc<dyn SourceFactory>,
    client: reqwest::Client,
    options: LoaderOptions,
    cache: Mutex<HashMap<String, Slot>>,
}

impl PluginLoader {
    pub fn new(factory: Arc<dyn SourceFactory>, client: reqwest::Client, options: LoaderOptions) -> Self {
        Self { factory, client, options, cache: Mutex::new(HashMap::new()) }
    }

    /// Load the provider in `dir`.
    ///
    /// `Ok(None)` means the directory has no entry module and is not a provider.
    pub async fn load(&self, dir: &Path) -> Result<Option<Arc<dyn Source>>, PluginLoadError> {
        let entry = dir.join(ENTRY_MODULE);
        match tokio::fs::metadata(&entry).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "no entry module; skipping");
                return Ok(None);
            }
            Err(source) => return Err(PluginLoadError::Io { path: entry, source }),
        }
        let module = tokio::fs::read(&entry)
            .await
            .map_err(|source| PluginLoadError::Io { path: entry.clone(), source })?;

        let digest = content_digest(&module);
        let slot = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(digest.clone())
            .or_default()
            .clone();
        if let Some(source) = slot.get() {
            debug!(dir = %dir.display(), id = source.id(), "provider already loaded from identical module");
            return Ok(Some(source.clone()));
        }

        let config = read_config(dir).await?;
        let source = slot
            .get_or_try_init(|| async {
                let fetch = FetchCapability::new(
                    self.client.clone(),
                    config.allowed_hosts.clone(),
                    config.rate_limit(self.options.rate_limit),
                );
                let timeout = config.call_timeout(self.options.call_timeout);
                self.factory.instantiate(module, fetch, timeout).await
            })
            .await?;
        info!(dir = %dir.display(), id = source.id(), digest = &digest[..12], "loaded provider");
        Ok(Some(source.clone()))
    }

    /// Number of distinct provider modules instantiated so far.
    pub fn cached(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}

async fn read_config(dir: &Path) -> Result<PluginConfig, PluginLoadError> {
    let path = dir.join(PLUGIN_CONFIG);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => PluginConfig::parse(&path, &text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PluginConfig::default()),
        Err(source) => Err(PluginLoadError::Io { path, source }),
    }
}

pub fn content_digest(module: &[u8]) -> String {
    hex::encode(Sha256::digest(module))
}

/// Immediate subdirectories of `root`, in name order. A missing root has no candidates.
pub async fn discover(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(root = %root.display(), "plugin directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
