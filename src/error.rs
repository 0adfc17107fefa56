use std::path::PathBuf;

use thiserror::Error;

/// Failure inside a provider call. Providers never return defaulted values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("malformed data: {0}")]
    Malformed(String),

    /// The sandboxed call trapped, timed out or could not be scheduled.
    #[error("plugin call failed: {0}")]
    Plugin(String),
}

/// A discovery candidate that had an entry module but could not be turned into a source.
#[derive(Error, Debug)]
pub enum PluginLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid plugin config {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("failed to instantiate provider: {0}")]
    Instantiate(String),

    #[error("provider failed during construction: {0}")]
    Construct(#[from] SourceError),
}

/// Per-page download failure. Marks the page errored; never aborts sibling downloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageDownloadError {
    #[error("request failed: {0}")]
    Network(String),

    #[error("server responded with status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,
}

/// Failure of the restricted fetch capability handed to providers.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("host not allowed: {0}")]
    Denied(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("response body is not valid {expected}: {message}")]
    Decode { expected: &'static str, message: String },
}
