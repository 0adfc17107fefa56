pub mod aggregator;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod filters;
pub mod loader;
pub mod pipeline;
pub mod plugins;
pub mod registry;
pub mod source;
pub mod storage;
pub mod types;

// --- Library API for embedding ---

/// Convenience re-exports for embedders.
pub mod prelude {
    pub use crate::aggregator::{Catalog, CatalogConfig, CatalogOutcome};
    pub use crate::config::Config;
    pub use crate::error::{PageDownloadError, PluginLoadError, SourceError};
    pub use crate::filters::{Filter, FilterTree};
    pub use crate::pipeline::{Page, PageState, PrefetchPipeline};
    pub use crate::registry::SourceRegistry;
    pub use crate::source::Source;
    pub use crate::storage::Library;
    pub use crate::types::{Chapter, Manga, Paged, SortOrder};
    pub use crate::Tankobon;
}

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::aggregator::{aggregate_chapters, Catalog, CatalogConfig};
use crate::config::Config;
use crate::db::Database;
use crate::fetch::HttpPageFetcher;
use crate::filters::FilterTree;
use crate::loader::PluginLoader;
use crate::pipeline::{PageFetcher, PrefetchPipeline};
use crate::plugins::WasmFactory;
use crate::registry::SourceRegistry;
use crate::source::Source;
use crate::storage::Library;
use crate::types::{Manga, Paged};

/// Async library entry point. Owns the source registry, the library store and settings.
pub struct Tankobon {
    config: Config,
    registry: Arc<SourceRegistry>,
    library: Arc<dyn Library>,
    page_fetcher: Arc<dyn PageFetcher>,
    // keeps the plugin engine (and its epoch ticker) alive for the loaded sources
    _loader: Option<Arc<PluginLoader>>,
}

impl Tankobon {
    /// Connect the library database, run migrations and start provider discovery.
    ///
    /// Returns before discovery finishes; use [`SourceRegistry::ready`] or
    /// [`Tankobon::source`] to wait for providers.
    pub async fn open(config: Config) -> Result<Self> {
        let db = Database::connect(config.database_url.as_deref()).await?;
        db.run_migrations().await?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("tankobon/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        let factory = WasmFactory::new(config.plugins.epoch_interval()).context("starting plugin engine")?;
        let loader = Arc::new(PluginLoader::new(
            Arc::new(factory),
            client.clone(),
            config.plugins.loader_options(),
        ));
        let registry = SourceRegistry::discover(loader.clone(), config.plugins_dir()?);
        let page_fetcher = Arc::new(HttpPageFetcher::new(client, config.prefetch.page_timeout()));

        Ok(Self {
            config,
            registry,
            library: Arc::new(db),
            page_fetcher,
            _loader: Some(loader),
        })
    }

    /// Assemble from existing parts; nothing is discovered or connected.
    pub fn with_parts(
        config: Config,
        registry: Arc<SourceRegistry>,
        library: Arc<dyn Library>,
        page_fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        Self { config, registry, library, page_fetcher, _loader: None }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn library(&self) -> &Arc<dyn Library> {
        &self.library
    }

    /// Resolve a source, waiting for discovery if it has not been registered yet.
    pub async fn source(&self, id: &str) -> Result<Arc<dyn Source>> {
        self.registry
            .query_source(id)
            .await
            .with_context(|| format!("unknown source: {id}"))
    }

    /// Search one source. Without explicit filters the source's current filter state applies.
    pub async fn search(
        &self,
        source_id: &str,
        query: &str,
        offset: usize,
        filters: Option<&FilterTree>,
    ) -> Result<Paged<Manga>> {
        let source = self.source(source_id).await?;
        let values = match filters {
            Some(tree) => tree.values(),
            None => source.filters().values(),
        };
        let mut page = source
            .search(query, offset, &values)
            .await
            .with_context(|| format!("searching {source_id}"))?;
        page.data = page
            .data
            .into_iter()
            .filter_map(|m| match m.validate() {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(source = source_id, error = %e, "dropping invalid search result");
                    None
                }
            })
            .collect();
        Ok(page)
    }

    /// Fetch a manga's details. Library entries keep their `added` time and are refreshed.
    pub async fn manga(&self, source_id: &str, id: &str) -> Result<Manga> {
        let source = self.source(source_id).await?;
        let mut manga = source
            .get_manga(id)
            .await
            .and_then(Manga::validate)
            .with_context(|| format!("fetching manga {id} from {source_id}"))?;

        match self.library.get_manga(id, source_id).await {
            Ok(Some(stored)) if stored.in_library() => {
                manga.added = stored.added;
                if let Err(e) = self.library.insert_manga(&manga).await {
                    warn!(source = source_id, id, error = %e, "failed to refresh library entry");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(source = source_id, id, error = %e, "library lookup failed"),
        }
        Ok(manga)
    }

    /// Mark a manga as added now and store it.
    pub async fn add_to_library(&self, manga: &Manga) -> Result<Manga> {
        let mut manga = manga.clone().validate()?;
        if !manga.in_library() {
            manga.added = Some(now_secs());
        }
        self.library.insert_manga(&manga).await.context("saving manga")?;
        Ok(manga)
    }

    /// Drop a manga and its stored chapters from the library.
    pub async fn remove_from_library(&self, source_id: &str, id: &str) -> Result<bool> {
        self.library
            .remove_manga(id, source_id)
            .await
            .with_context(|| format!("removing {id} from the library"))
    }

    /// Aggregate the full chapter catalog of a manga with the configured policy.
    pub async fn chapters(&self, source_id: &str, manga_id: &str) -> Result<Catalog> {
        self.chapters_with(source_id, manga_id, &self.config.catalog).await
    }

    /// Aggregate with an explicit policy. Chapters of library manga are stored as they are found.
    pub async fn chapters_with(
        &self,
        source_id: &str,
        manga_id: &str,
        config: &CatalogConfig,
    ) -> Result<Catalog> {
        let source = self.source(source_id).await?;
        let catalog = aggregate_chapters(source.as_ref(), manga_id, config).await;
        debug!(source = source_id, manga_id, chapters = catalog.chapters.len(), outcome = ?catalog.outcome, "catalog");

        let in_library = match self.library.get_manga(manga_id, source_id).await {
            Ok(stored) => stored.is_some_and(|m| m.in_library()),
            Err(e) => {
                warn!(source = source_id, manga_id, error = %e, "library lookup failed");
                false
            }
        };
        if in_library {
            for chapter in &catalog.chapters {
                if let Err(e) = self.library.insert_chapter(chapter).await {
                    warn!(source = source_id, chapter = %chapter.id, error = %e, "failed to store chapter");
                }
            }
        }
        Ok(catalog)
    }

    /// A pipeline with the configured lookahead, not yet holding a chapter.
    pub fn pipeline(&self) -> PrefetchPipeline {
        PrefetchPipeline::new(self.page_fetcher.clone(), self.config.prefetch.lookahead)
    }

    /// Resolve a chapter's pages and start prefetching them from the first page.
    pub async fn open_chapter(&self, source_id: &str, manga_id: &str, chapter_id: &str) -> Result<PrefetchPipeline> {
        let source = self.source(source_id).await?;
        let urls = source
            .get_pages(manga_id, chapter_id)
            .await
            .with_context(|| format!("resolving pages of {chapter_id}"))?;
        let pipeline = self.pipeline();
        pipeline.load_chapter(urls);
        Ok(pipeline)
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
