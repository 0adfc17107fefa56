#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Semaphore;

use tankobon::error::{PageDownloadError, PluginLoadError, SourceError};
use tankobon::fetch::FetchCapability;
use tankobon::filters::FilterTree;
use tankobon::pipeline::{PageData, PageFetcher};
use tankobon::source::{Source, SourceFactory};
use tankobon::types::{Chapter, Manga, Paged, SortOrder};

type Listing = Box<dyn Fn(usize) -> Result<Paged<Chapter>, SourceError> + Send + Sync>;

/// In-memory provider with a scripted chapter listing.
pub struct MockSource {
    id: String,
    colors: HashMap<String, String>,
    filters: Mutex<FilterTree>,
    listing: Listing,
    manga: HashMap<String, Manga>,
    pages: Vec<String>,
    pub rounds: AtomicUsize,
    pub offsets: Mutex<Vec<Option<usize>>>,
    pub last_search: Mutex<Option<serde_json::Value>>,
}

impl MockSource {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            colors: HashMap::new(),
            filters: Mutex::new(FilterTree::new()),
            listing: Box::new(|_| Ok(Paged::new(Vec::new(), Some(0)))),
            manga: HashMap::new(),
            pages: Vec::new(),
            rounds: AtomicUsize::new(0),
            offsets: Mutex::new(Vec::new()),
            last_search: Mutex::new(None),
        }
    }

    /// Answer round `n` (zero based) with `rounds[n]`, and with an empty page past the end.
    pub fn with_rounds(self, rounds: Vec<Result<Paged<Chapter>, SourceError>>) -> Self {
        self.with_listing(move |n| rounds.get(n).cloned().unwrap_or_else(|| Ok(Paged::new(Vec::new(), None))))
    }

    pub fn with_listing(
        mut self,
        f: impl Fn(usize) -> Result<Paged<Chapter>, SourceError> + Send + Sync + 'static,
    ) -> Self {
        self.listing = Box::new(f);
        self
    }

    pub fn with_filters(self, filters: FilterTree) -> Self {
        *self.filters.lock().unwrap() = filters;
        self
    }

    pub fn with_manga(mut self, manga: Manga) -> Self {
        self.manga.insert(manga.id.clone(), manga);
        self
    }

    pub fn with_pages(mut self, pages: &[&str]) -> Self {
        self.pages = pages.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn offsets(&self) -> Vec<Option<usize>> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl Source for MockSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn icon(&self) -> &str {
        "icon.png"
    }

    fn downloadable(&self) -> bool {
        true
    }

    fn colors(&self) -> &HashMap<String, String> {
        &self.colors
    }

    fn filters(&self) -> FilterTree {
        self.filters.lock().unwrap().clone()
    }

    async fn tags(&self) -> Result<Vec<String>, SourceError> {
        Ok(vec!["action".into()])
    }

    async fn set_filters(&self, filters: FilterTree) -> Result<(), SourceError> {
        *self.filters.lock().unwrap() = filters;
        Ok(())
    }

    async fn get_manga(&self, id: &str) -> Result<Manga, SourceError> {
        self.manga
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::Network(format!("404 for {id}")))
    }

    async fn get_manga_url(&self, id: &str) -> Result<String, SourceError> {
        Ok(format!("https://mock.test/manga/{id}"))
    }

    async fn get_chapter_url(
        &self,
        manga_id: &str,
        chapter_id: &str,
        page: Option<u32>,
    ) -> Result<Option<String>, SourceError> {
        Ok(Some(match page {
            Some(p) => format!("https://mock.test/{manga_id}/{chapter_id}/{p}"),
            None => format!("https://mock.test/{manga_id}/{chapter_id}"),
        }))
    }

    async fn get_pages(&self, _manga_id: &str, _chapter_id: &str) -> Result<Vec<String>, SourceError> {
        Ok(self.pages.clone())
    }

    async fn get_chapters(
        &self,
        manga_id: &str,
        offset: Option<usize>,
        _order: Option<SortOrder>,
    ) -> Result<Paged<Chapter>, SourceError> {
        let round = self.rounds.fetch_add(1, Ordering::SeqCst);
        self.offsets.lock().unwrap().push(offset);
        // stamped like the wasm host does
        let mut page = (self.listing)(round)?;
        for chapter in &mut page.data {
            chapter.source = self.id.clone();
            chapter.manga_id = manga_id.to_string();
        }
        Ok(page)
    }

    async fn search(
        &self,
        query: &str,
        _offset: usize,
        filters: &serde_json::Value,
    ) -> Result<Paged<Manga>, SourceError> {
        *self.last_search.lock().unwrap() = Some(filters.clone());
        let hits: Vec<Manga> = self.manga.values().filter(|m| m.name.contains(query)).cloned().collect();
        let total = hits.len();
        Ok(Paged::new(hits, Some(total)))
    }
}

pub fn manga(source: &str, id: &str, name: &str) -> Manga {
    Manga {
        id: id.into(),
        source: source.into(),
        name: name.into(),
        covers: vec![],
        authors: vec![],
        tags: vec![],
        description: None,
        uploaded: None,
        added: None,
    }
}

pub fn chapter(id: &str, lang: Option<&str>) -> Chapter {
    let mut c = Chapter::new(id, "m", 1.0);
    c.lang = lang.map(str::to_string);
    c
}

/// Module text understood by [`MockFactory`].
#[derive(Debug, Deserialize)]
struct MockModule {
    id: String,
    #[serde(default)]
    gated: bool,
    #[serde(default)]
    delay_ms: u64,
}

/// Instantiates TOML "modules" (`id = "..."`) as [`MockSource`]s and counts instantiations.
///
/// Modules with `gated = true` wait for [`MockFactory::release`] before finishing.
pub struct MockFactory {
    pub instantiations: AtomicUsize,
    pub allowed_hosts: Mutex<Vec<Option<Vec<String>>>>,
    pub timeouts: Mutex<Vec<Duration>>,
    gate: Semaphore,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            instantiations: AtomicUsize::new(0),
            allowed_hosts: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(1 << 20);
    }

    pub fn count(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFactory for MockFactory {
    async fn instantiate(
        &self,
        module: Vec<u8>,
        fetch: FetchCapability,
        call_timeout: Duration,
    ) -> Result<Arc<dyn Source>, PluginLoadError> {
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        let text = String::from_utf8(module).map_err(|e| PluginLoadError::Instantiate(e.to_string()))?;
        let module: MockModule = toml::from_str(&text).map_err(|e| PluginLoadError::Instantiate(e.to_string()))?;
        self.allowed_hosts.lock().unwrap().push(fetch.allowed_hosts().map(<[String]>::to_vec));
        self.timeouts.lock().unwrap().push(call_timeout);
        if module.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(module.delay_ms)).await;
        }
        if module.gated {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| PluginLoadError::Instantiate(e.to_string()))?;
        }
        Ok(Arc::new(MockSource::new(&module.id)))
    }
}

/// Page fetcher that records calls, can hold responses until released and can fail urls.
pub struct MockFetcher {
    calls: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashMap<String, usize>>,
    gate: Semaphore,
}

impl MockFetcher {
    /// Responds immediately.
    pub fn open() -> Arc<Self> {
        let fetcher = Self::gated();
        fetcher.release();
        fetcher
    }

    /// Holds every response until [`MockFetcher::release`].
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            gate: Semaphore::new(0),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(1 << 20);
    }

    /// Answer the next `times` requests for `url` with HTTP 500.
    pub fn fail(&self, url: &str, times: usize) {
        self.failures.lock().unwrap().insert(url.to_string(), times);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch_page(&self, url: &str) -> Result<PageData, PageDownloadError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| PageDownloadError::Network(e.to_string()))?;
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(url).filter(|n| **n > 0) {
                *left -= 1;
                return Err(PageDownloadError::Status(500));
            }
        }
        Ok(PageData {
            bytes: Arc::from(url.as_bytes()),
            content_size: url.len() as u64,
            content_type: Some("image/png".into()),
        })
    }
}
