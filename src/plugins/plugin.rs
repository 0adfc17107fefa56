use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use wasmtime::{component::*, Engine, Store, Trap};
use wasmtime_wasi::WasiCtxBuilder;

use super::bindings::tankobon::plugin::types as wit;
use super::bindings::Provider;
use super::host::Host;
use crate::error::{PluginLoadError, SourceError};
use crate::fetch::FetchCapability;
use crate::filters::FilterTree;
use crate::source::Source;
use crate::types::{Chapter, Manga, Paged, SortOrder};

// Deadline used between calls so an idle store never trips the epoch check
const FAR_DEADLINE: u64 = 1_000_000_000;

pub(crate) struct Plugin {
    pub(crate) name: String,
    pub(crate) store: Store<Host>,
    pub(crate) bindings: Provider,
    pub(crate) slow_warn: Duration,
    pub(crate) call_timeout: Duration,
    pub(crate) epoch_interval: Duration,
}

impl Plugin {
    pub(crate) fn set_deadline(&mut self) {
        let per_tick_ms = self.epoch_interval.as_millis().max(1);
        let ticks = self.call_timeout.as_millis().div_ceil(per_tick_ms) as u64;
        self.store.set_epoch_deadline(ticks.max(1));
    }

    pub(crate) fn clear_deadline(&mut self) {
        self.store.set_epoch_deadline(FAR_DEADLINE);
    }

    pub(crate) fn warn_if_slow(&self, start: Instant, op: &str) {
        let elapsed = start.elapsed();
        if elapsed > self.slow_warn {
            tracing::warn!(plugin = %self.name, op, ?elapsed, "slow plugin call");
        }
    }

    /// Run one export under the call deadline.
    pub(crate) fn call<T, F>(&mut self, op: &str, f: F) -> Result<T, SourceError>
    where
        F: FnOnce(&Provider, &mut Store<Host>) -> wasmtime::Result<T>,
    {
        self.set_deadline();
        let start = Instant::now();
        let res = f(&self.bindings, &mut self.store);
        self.clear_deadline();
        self.warn_if_slow(start, op);
        res.map_err(|e| {
            let message = match e.downcast_ref::<Trap>() {
                Some(Trap::Interrupt) => format!("{op} timed out after {:?}", self.call_timeout),
                _ => format!("{op}: {e:#}"),
            };
            tracing::warn!(plugin = %self.name, %message, "plugin call failed");
            SourceError::Plugin(message)
        })
    }
}

/// A provider compiled to a WebAssembly component, adapted to [`Source`].
pub struct WasmSource {
    id: String,
    icon: String,
    downloadable: bool,
    colors: HashMap<String, String>,
    filters: RwLock<FilterTree>,
    plugin: Arc<Mutex<Plugin>>,
}

impl WasmSource {
    /// Instantiate a provider component. Blocking; run it off the async executor.
    ///
    /// Instantiation fails when the component does not export the whole provider world, so an
    /// incomplete provider never reaches the registry.
    pub(crate) fn new(
        engine: &Engine,
        module: &[u8],
        fetch: FetchCapability,
        runtime: tokio::runtime::Handle,
        epoch_interval: Duration,
        call_timeout: Duration,
    ) -> Result<Self, PluginLoadError> {
        let instantiate = |e: wasmtime::Error| PluginLoadError::Instantiate(format!("{e:#}"));
        let component = Component::new(engine, module).map_err(instantiate)?;

        // stdio only; network access goes through the fetch import
        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stdout().inherit_stderr();
        let wasi = builder.build();

        let host = Host {
            wasi,
            table: wasmtime::component::ResourceTable::new(),
            fetch,
            runtime,
        };
        let mut store = Store::new(engine, host);
        store.set_epoch_deadline(FAR_DEADLINE);

        let mut linker = Linker::new(engine);
        wasmtime_wasi::p2::add_to_linker_sync(&mut linker).map_err(instantiate)?;
        Provider::add_to_linker::<_, HasSelf<_>>(&mut linker, |host| host).map_err(instantiate)?;
        let bindings = Provider::instantiate(&mut store, &component, &linker).map_err(instantiate)?;

        let mut plugin = Plugin {
            name: "unknown".to_string(),
            store,
            bindings,
            slow_warn: Duration::from_secs(5),
            call_timeout,
            epoch_interval,
        };

        let id = plugin.call("id", |b, s| b.call_id(s))?;
        if id.trim().is_empty() {
            return Err(SourceError::Malformed("provider reported an empty id".into()).into());
        }
        plugin.name = id.clone();
        let icon = plugin.call("icon", |b, s| b.call_icon(s))?;
        let downloadable = plugin.call("downloadable", |b, s| b.call_downloadable(s))?;
        let colors = plugin.call("colors", |b, s| b.call_colors(s))?.into_iter().collect();
        let filters_json = plugin.call("filters", |b, s| b.call_filters(s))?;
        let filters = FilterTree::from_json(&filters_json)
            .map_err(|e| SourceError::Parse(format!("filter tree: {e}")))?;

        Ok(Self {
            id,
            icon,
            downloadable,
            colors,
            filters: RwLock::new(filters),
            plugin: Arc::new(Mutex::new(plugin)),
        })
    }

    async fn with_plugin<T, F>(&self, op: &'static str, f: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Plugin) -> Result<T, SourceError> + Send + 'static,
    {
        let plugin = self.plugin.clone();
        tokio::task::spawn_blocking(move || {
            let mut plugin = plugin.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut plugin)
        })
        .await
        .map_err(|e| SourceError::Plugin(format!("{op}: {e}")))?
    }
}

fn source_error(e: wit::SourceError) -> SourceError {
    match e {
        wit::SourceError::Network(m) => SourceError::Network(m),
        wit::SourceError::Parse(m) => SourceError::Parse(m),
        wit::SourceError::Malformed(m) => SourceError::Malformed(m),
    }
}

fn manga_from(m: wit::Manga, source: &str) -> Manga {
    Manga {
        id: m.id,
        source: source.to_string(),
        name: m.name,
        covers: m.covers,
        authors: m.authors,
        tags: m.tags,
        description: m.description,
        uploaded: m.uploaded,
        added: None,
    }
}

fn chapter_from(c: wit::Chapter, source: &str, manga_id: &str) -> Chapter {
    Chapter {
        id: c.id,
        manga_id: manga_id.to_string(),
        source: source.to_string(),
        chapter: c.chapter,
        volume: c.volume,
        title: c.title,
        scanlators: c.scanlators,
        lang: c.lang,
        pages: None,
        total: None,
        last_read: None,
        last_updated: None,
        date_uploaded: c.date_uploaded,
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[async_trait]
impl Source for WasmSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn icon(&self) -> &str {
        &self.icon
    }

    fn downloadable(&self) -> bool {
        self.downloadable
    }

    fn colors(&self) -> &HashMap<String, String> {
        &self.colors
    }

    fn filters(&self) -> FilterTree {
        self.filters.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn tags(&self) -> Result<Vec<String>, SourceError> {
        self.with_plugin("tags", |p| p.call("tags", |b, s| b.call_tags(s))?.map_err(source_error))
            .await
    }

    async fn set_filters(&self, filters: FilterTree) -> Result<(), SourceError> {
        let json = filters.to_json();
        self.with_plugin("set-filters", move |p| {
            p.call("set-filters", |b, s| b.call_set_filters(s, &json))?.map_err(source_error)
        })
        .await?;
        *self.filters.write().unwrap_or_else(PoisonError::into_inner) = filters;
        Ok(())
    }

    async fn get_manga(&self, id: &str) -> Result<Manga, SourceError> {
        let id = id.to_string();
        let m = self
            .with_plugin("get-manga", move |p| {
                p.call("get-manga", |b, s| b.call_get_manga(s, &id))?.map_err(source_error)
            })
            .await?;
        Ok(manga_from(m, &self.id))
    }

    async fn get_manga_url(&self, id: &str) -> Result<String, SourceError> {
        let id = id.to_string();
        self.with_plugin("get-manga-url", move |p| p.call("get-manga-url", |b, s| b.call_get_manga_url(s, &id)))
            .await
    }

    async fn get_chapter_url(
        &self,
        manga_id: &str,
        chapter_id: &str,
        page: Option<u32>,
    ) -> Result<Option<String>, SourceError> {
        let (manga_id, chapter_id) = (manga_id.to_string(), chapter_id.to_string());
        self.with_plugin("get-chapter-url", move |p| {
            p.call("get-chapter-url", |b, s| b.call_get_chapter_url(s, &manga_id, &chapter_id, page))
        })
        .await
    }

    async fn get_pages(&self, manga_id: &str, chapter_id: &str) -> Result<Vec<String>, SourceError> {
        let (manga_id, chapter_id) = (manga_id.to_string(), chapter_id.to_string());
        self.with_plugin("get-pages", move |p| {
            p.call("get-pages", |b, s| b.call_get_pages(s, &manga_id, &chapter_id))?.map_err(source_error)
        })
        .await
    }

    async fn get_chapters(
        &self,
        manga_id: &str,
        offset: Option<usize>,
        order: Option<SortOrder>,
    ) -> Result<Paged<Chapter>, SourceError> {
        let requested = manga_id.to_string();
        let manga_id = requested.clone();
        let offset = offset.map(to_u32);
        let order = order.map(|o| match o {
            SortOrder::Ascending => wit::SortOrder::Ascending,
            SortOrder::Descending => wit::SortOrder::Descending,
        });
        let listing = self
            .with_plugin("get-chapters", move |p| {
                p.call("get-chapters", |b, s| b.call_get_chapters(s, &manga_id, offset, order))?
                    .map_err(source_error)
            })
            .await?;
        let data = listing.data.into_iter().map(|c| chapter_from(c, &self.id, &requested)).collect();
        Ok(Paged::new(data, listing.total.map(|t| t as usize)))
    }

    async fn search(
        &self,
        query: &str,
        offset: usize,
        filters: &serde_json::Value,
    ) -> Result<Paged<Manga>, SourceError> {
        let query = query.to_string();
        let filters = filters.to_string();
        let offset = to_u32(offset);
        let listing = self
            .with_plugin("search", move |p| {
                p.call("search", |b, s| b.call_search(s, &query, offset, &filters))?.map_err(source_error)
            })
            .await?;
        let data = listing.data.into_iter().map(|m| manga_from(m, &self.id)).collect();
        Ok(Paged::new(data, listing.total.map(|t| t as usize)))
    }
}
