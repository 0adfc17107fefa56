//! Page prefetching for the chapter being read.
//!
//! The pipeline owns the page list of exactly one chapter at a time. Every chapter load starts a
//! new generation; downloads belonging to an older generation are cancelled and, should one still
//! complete, its result is dropped instead of touching the new chapter's pages.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PageDownloadError;

/// Pages downloaded past the one being viewed.
pub const DEFAULT_LOOKAHEAD: usize = 4;

/// A downloaded page image.
#[derive(Debug, Clone, PartialEq)]
pub struct PageData {
    pub bytes: Arc<[u8]>,
    pub content_size: u64,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<PageData, PageDownloadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Idle,
    Downloading,
    Completed,
    Errored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub url: String,
    pub state: PageState,
    pub data: Option<PageData>,
    pub error: Option<PageDownloadError>,
}

impl Page {
    fn new(url: String) -> Self {
        Self { url, state: PageState::Idle, data: None, error: None }
    }

    pub fn content_size(&self) -> Option<u64> {
        self.data.as_ref().map(|d| d.content_size)
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.data.as_ref().map(|d| &*d.bytes)
    }
}

struct Session {
    generation: u64,
    order: Vec<String>,
    pages: HashMap<String, Page>,
    current: usize,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn empty() -> Self {
        Self {
            generation: 0,
            order: Vec::new(),
            pages: HashMap::new(),
            current: 0,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    fn current_page(&self) -> Option<Page> {
        self.order.get(self.current).and_then(|url| self.pages.get(url)).cloned()
    }
}

struct Shared {
    fetcher: Arc<dyn PageFetcher>,
    lookahead: usize,
    session: Mutex<Session>,
    current_tx: watch::Sender<Option<Page>>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a finished download. Returns false when the result was stale.
    fn apply(&self, generation: u64, url: &str, result: Result<PageData, PageDownloadError>) -> bool {
        let mut session = self.session();
        if session.generation != generation {
            debug!(url, generation, active = session.generation, "dropping stale page result");
            return false;
        }
        let Some(page) = session.pages.get_mut(url) else { return false };
        if page.state != PageState::Downloading {
            return false;
        }
        match result {
            Ok(data) => {
                debug!(url, bytes = data.content_size, "page completed");
                page.state = PageState::Completed;
                page.data = Some(data);
                page.error = None;
            }
            Err(e) => {
                warn!(url, error = %e, "page download failed");
                page.state = PageState::Errored;
                page.data = None;
                page.error = Some(e);
            }
        }
        if session.order.get(session.current).map(String::as_str) == Some(url) {
            self.current_tx.send_replace(session.current_page());
        }
        true
    }
}

/// Keeps the pages around the reader's position downloaded.
#[derive(Clone)]
pub struct PrefetchPipeline {
    shared: Arc<Shared>,
}

impl PrefetchPipeline {
    pub fn new(fetcher: Arc<dyn PageFetcher>, lookahead: usize) -> Self {
        let (current_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                fetcher,
                lookahead: lookahead.max(1),
                session: Mutex::new(Session::empty()),
                current_tx,
            }),
        }
    }

    pub fn lookahead(&self) -> usize {
        self.shared.lookahead
    }

    pub fn generation(&self) -> u64 {
        self.shared.session().generation
    }

    /// Replace the page list with a new chapter and start its window.
    ///
    /// Returns the generation of the new chapter session.
    pub fn load_chapter(&self, urls: Vec<String>) -> u64 {
        let mut session = self.shared.session();
        session.cancel.cancel();
        let generation = session.generation + 1;
        let mut pages = HashMap::with_capacity(urls.len());
        for url in &urls {
            pages.entry(url.clone()).or_insert_with(|| Page::new(url.clone()));
        }
        *session = Session {
            generation,
            order: urls,
            pages,
            current: 0,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        };
        debug!(generation, pages = session.order.len(), "chapter loaded");
        self.shared.current_tx.send_replace(session.current_page());
        self.fill_window(&mut session);
        generation
    }

    /// Move the reader to `index` (clamped to the page list) and extend the window.
    pub fn set_current(&self, index: usize) -> Option<usize> {
        let mut session = self.shared.session();
        if session.order.is_empty() {
            return None;
        }
        let index = index.min(session.order.len() - 1);
        if index != session.current {
            session.current = index;
            self.shared.current_tx.send_replace(session.current_page());
        }
        self.fill_window(&mut session);
        Some(index)
    }

    /// Start downloading `url` unless it is already downloading or completed.
    ///
    /// Returns whether a download was started. Errored pages are restarted.
    pub fn download_page(&self, url: &str) -> bool {
        let mut session = self.shared.session();
        match session.pages.get(url).map(|p| p.state) {
            Some(PageState::Idle) | Some(PageState::Errored) => {
                self.start(&mut session, url.to_string());
                true
            }
            _ => false,
        }
    }

    /// Restart an errored page. Other states are left alone.
    pub fn retry(&self, url: &str) -> bool {
        let mut session = self.shared.session();
        if session.pages.get(url).map(|p| p.state) != Some(PageState::Errored) {
            return false;
        }
        self.start(&mut session, url.to_string());
        true
    }

    /// Index range of the prefetch window. It always begins at the first page.
    pub fn window(&self) -> Range<usize> {
        let session = self.shared.session();
        window_end(session.current, self.shared.lookahead, session.order.len())
    }

    pub fn current_index(&self) -> Option<usize> {
        let session = self.shared.session();
        (!session.order.is_empty()).then_some(session.current)
    }

    pub fn current(&self) -> Option<Page> {
        self.shared.session().current_page()
    }

    /// Follow the page being viewed; updates when it moves or its download settles.
    pub fn watch_current(&self) -> watch::Receiver<Option<Page>> {
        self.shared.current_tx.subscribe()
    }

    pub fn page(&self, url: &str) -> Option<Page> {
        self.shared.session().pages.get(url).cloned()
    }

    /// Snapshot of every page in chapter order.
    pub fn pages(&self) -> Vec<Page> {
        let session = self.shared.session();
        session
            .order
            .iter()
            .filter_map(|url| session.pages.get(url).cloned())
            .collect()
    }

    /// Wait until no download of the active chapter is in flight.
    pub async fn settle(&self) {
        loop {
            let handles = std::mem::take(&mut self.shared.session().tasks);
            if handles.is_empty() {
                return;
            }
            for res in futures::future::join_all(handles).await {
                if let Err(e) = res {
                    warn!(error = %e, "page task join error");
                }
            }
        }
    }

    fn fill_window(&self, session: &mut Session) {
        let range = window_end(session.current, self.shared.lookahead, session.order.len());
        let idle: Vec<String> = session.order[range]
            .iter()
            .filter(|url| session.pages.get(*url).map(|p| p.state) == Some(PageState::Idle))
            .cloned()
            .collect();
        for url in idle {
            // duplicate urls in the order share one page
            if session.pages.get(&url).map(|p| p.state) == Some(PageState::Idle) {
                self.start(session, url);
            }
        }
    }

    fn start(&self, session: &mut Session, url: String) {
        let Some(page) = session.pages.get_mut(&url) else { return };
        page.state = PageState::Downloading;
        page.data = None;
        page.error = None;
        debug!(url = %url, generation = session.generation, "page downloading");
        session.tasks.retain(|h| !h.is_finished());

        let generation = session.generation;
        let token = session.cancel.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => {
                    debug!(url = %url, generation, "page download cancelled");
                    return;
                }
                r = shared.fetcher.fetch_page(&url) => r,
            };
            shared.apply(generation, &url, result);
        });
        session.tasks.push(handle);
    }
}

fn window_end(current: usize, lookahead: usize, len: usize) -> Range<usize> {
    0..current.saturating_add(lookahead).min(len)
}
