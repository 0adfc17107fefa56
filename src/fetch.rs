//! Network access: the restricted capability handed to providers and the page image fetcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use url::Url;

use crate::error::{FetchError, PageDownloadError};
use crate::pipeline::{PageData, PageFetcher};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PAGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
        }
    }
}

/// How the body of a response must be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    Json,
    #[default]
    Binary,
    Text,
}

#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub response_type: ResponseType,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

struct Inner {
    client: reqwest::Client,
    allowed_hosts: Option<Vec<String>>,
    rate_limit: Duration,
    timeout: Duration,
    last_call: Mutex<Option<Instant>>,
}

/// HTTP access restricted to a plugin's allowed hosts and throttled to its rate limit.
#[derive(Clone)]
pub struct FetchCapability {
    inner: Arc<Inner>,
}

impl FetchCapability {
    pub fn new(client: reqwest::Client, allowed_hosts: Option<Vec<String>>, rate_limit: Duration) -> Self {
        let allowed_hosts = allowed_hosts.map(|v| {
            v.iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect()
        });
        Self {
            inner: Arc::new(Inner {
                client,
                allowed_hosts,
                rate_limit,
                timeout: DEFAULT_FETCH_TIMEOUT,
                last_call: Mutex::new(None),
            }),
        }
    }

    pub fn allowed_hosts(&self) -> Option<&[String]> {
        self.inner.allowed_hosts.as_deref()
    }

    pub fn url_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else { return false };
        match parsed.scheme() {
            "http" | "https" => {}
            _ => return false,
        }
        let Some(list) = &self.inner.allowed_hosts else { return true };
        let Some(host) = parsed.host_str() else { return false };
        let host = host.to_ascii_lowercase();
        list.iter().any(|allowed| {
            if let Some(stripped) = allowed.strip_prefix("*.") {
                host == stripped || host.ends_with(&format!(".{}", stripped))
            } else {
                host == *allowed
            }
        })
    }

    async fn throttle(&self) {
        let mut last = self.inner.last_call.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.inner.rate_limit {
                tokio::time::sleep(self.inner.rate_limit - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub async fn send(&self, req: FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = Url::parse(&req.url)?;
        if !self.url_allowed(url.as_str()) {
            return Err(FetchError::Denied(url.host_str().unwrap_or(url.as_str()).to_string()));
        }
        self.throttle().await;

        let mut builder = self
            .inner
            .client
            .request(req.method.into(), url)
            .timeout(self.inner.timeout);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = resp.bytes().await?.to_vec();
        tracing::debug!(status, url = %final_url, bytes = body.len(), "provider fetch");

        check_body(req.response_type, &body)?;
        Ok(FetchResponse { status, url: final_url, headers, body })
    }
}

fn check_body(kind: ResponseType, body: &[u8]) -> Result<(), FetchError> {
    match kind {
        ResponseType::Binary => Ok(()),
        ResponseType::Text => std::str::from_utf8(body)
            .map(|_| ())
            .map_err(|e| FetchError::Decode { expected: "text", message: e.to_string() }),
        ResponseType::Json => serde_json::from_slice::<serde_json::Value>(body)
            .map(|_| ())
            .map_err(|e| FetchError::Decode { expected: "json", message: e.to_string() }),
    }
}

/// Fetches page images over HTTP with a fixed timeout.
pub struct HttpPageFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpPageFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

fn download_error(e: reqwest::Error) -> PageDownloadError {
    if e.is_timeout() {
        PageDownloadError::Timeout
    } else {
        PageDownloadError::Network(e.to_string())
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, url: &str) -> Result<PageData, PageDownloadError> {
        let resp = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(download_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PageDownloadError::Status(status.as_u16()));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = resp.content_length();
        let body = resp.bytes().await.map_err(download_error)?;
        Ok(PageData {
            content_size: content_length.unwrap_or(body.len() as u64),
            content_type,
            bytes: Arc::from(body.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(hosts: Option<Vec<&str>>) -> FetchCapability {
        FetchCapability::new(
            reqwest::Client::new(),
            hosts.map(|v| v.into_iter().map(String::from).collect()),
            Duration::ZERO,
        )
    }

    #[test]
    fn no_allow_list_allows_http_only() {
        let c = cap(None);
        assert!(c.url_allowed("https://mangadex.org/title/1"));
        assert!(!c.url_allowed("file:///etc/passwd"));
        assert!(!c.url_allowed("not a url"));
    }

    #[test]
    fn wildcard_hosts_match_subdomains() {
        let c = cap(Some(vec![" *.MangaDex.org ", "example.com"]));
        assert!(c.url_allowed("https://api.mangadex.org/manga"));
        assert!(c.url_allowed("https://mangadex.org/"));
        assert!(c.url_allowed("http://example.com/a"));
        assert!(!c.url_allowed("https://sub.example.com/a"));
        assert!(!c.url_allowed("https://evil-mangadex.org/"));
    }

    #[test]
    fn empty_allow_list_denies_everything() {
        let c = cap(Some(vec![]));
        assert!(!c.url_allowed("https://mangadex.org/"));
    }

    #[tokio::test]
    async fn denied_host_fails_before_network() {
        let c = cap(Some(vec!["example.com"]));
        let err = c.send(FetchRequest {
            url: "https://mangadex.org/".into(),
            response_type: ResponseType::Json,
            ..Default::default()
        }).await.unwrap_err();
        assert!(matches!(err, FetchError::Denied(h) if h == "mangadex.org"));
    }

    #[test]
    fn body_checks_follow_response_type() {
        assert!(check_body(ResponseType::Json, br#"{"a":1}"#).is_ok());
        assert!(check_body(ResponseType::Json, b"<html>").is_err());
        assert!(check_body(ResponseType::Text, &[0xff, 0xfe]).is_err());
        assert!(check_body(ResponseType::Binary, &[0xff, 0xfe]).is_ok());
    }
}
