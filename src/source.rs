use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{PluginLoadError, SourceError};
use crate::fetch::FetchCapability;
use crate::filters::FilterTree;
use crate::types::{Chapter, Manga, Paged, SortOrder};

/// The capability contract every provider implements.
///
/// Properties (`id`, `icon`, `downloadable`, `colors`) are read once when the provider is
/// instantiated; everything else may reach the network and fails with a [`SourceError`].
#[async_trait]
pub trait Source: Send + Sync {
    fn id(&self) -> &str;

    fn icon(&self) -> &str;

    fn downloadable(&self) -> bool;

    /// Tag name to hex color.
    fn colors(&self) -> &HashMap<String, String>;

    /// Snapshot of the current filter tree.
    fn filters(&self) -> FilterTree;

    async fn tags(&self) -> Result<Vec<String>, SourceError>;

    async fn set_filters(&self, filters: FilterTree) -> Result<(), SourceError>;

    async fn get_manga(&self, id: &str) -> Result<Manga, SourceError>;

    async fn get_manga_url(&self, id: &str) -> Result<String, SourceError>;

    /// `Ok(None)` means the provider has no URL for this chapter or page.
    async fn get_chapter_url(
        &self,
        manga_id: &str,
        chapter_id: &str,
        page: Option<u32>,
    ) -> Result<Option<String>, SourceError>;

    async fn get_pages(&self, manga_id: &str, chapter_id: &str) -> Result<Vec<String>, SourceError>;

    async fn get_chapters(
        &self,
        manga_id: &str,
        offset: Option<usize>,
        order: Option<SortOrder>,
    ) -> Result<Paged<Chapter>, SourceError>;

    /// `filters` is the value map from [`FilterTree::values`].
    async fn search(
        &self,
        query: &str,
        offset: usize,
        filters: &serde_json::Value,
    ) -> Result<Paged<Manga>, SourceError>;
}

impl std::fmt::Debug for dyn Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id())
            .field("downloadable", &self.downloadable())
            .finish()
    }
}

/// Turns a provider module into a live [`Source`].
///
/// The module bytes are the only code input; `fetch` is the only I/O the provider may use.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn instantiate(
        &self,
        module: Vec<u8>,
        fetch: FetchCapability,
        call_timeout: std::time::Duration,
    ) -> Result<Arc<dyn Source>, PluginLoadError>;
}
