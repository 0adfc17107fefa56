use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Sentinel for `Manga::added` meaning "not in the library".
pub const NOT_IN_LIBRARY: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manga {
    pub id: String,
    pub source: String,
    pub name: String,
    #[serde(default)]
    pub covers: Vec<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub uploaded: Option<i64>,
    #[serde(default)]
    pub added: Option<i64>,
}

impl Manga {
    /// Check the fields the library relies on and fill the `added` sentinel.
    pub fn validate(mut self) -> Result<Self, SourceError> {
        if self.id.trim().is_empty() {
            return Err(SourceError::Malformed("manga without id".into()));
        }
        if self.source.trim().is_empty() {
            return Err(SourceError::Malformed(format!("manga {} has no source", self.id)));
        }
        if self.name.trim().is_empty() {
            return Err(SourceError::Malformed(format!("manga {} has no name", self.id)));
        }
        if self.added.is_none() {
            self.added = Some(NOT_IN_LIBRARY);
        }
        Ok(self)
    }

    pub fn in_library(&self) -> bool {
        matches!(self.added, Some(t) if t != NOT_IN_LIBRARY)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub manga_id: String,
    #[serde(default)]
    pub source: String,
    /// Chapter number; fractional for extras such as 10.5.
    pub chapter: f64,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub scanlators: Vec<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub total: Option<u32>,
    #[serde(default)]
    pub last_read: Option<i64>,
    #[serde(default)]
    pub last_updated: Option<i64>,
    #[serde(default)]
    pub date_uploaded: Option<i64>,
}

impl Chapter {
    pub fn new(id: impl Into<String>, manga_id: impl Into<String>, chapter: f64) -> Self {
        Self {
            id: id.into(),
            manga_id: manga_id.into(),
            source: String::new(),
            chapter,
            volume: None,
            title: None,
            scanlators: Vec::new(),
            lang: None,
            pages: None,
            total: None,
            last_read: None,
            last_updated: None,
            date_uploaded: None,
        }
    }
}

/// One page of a paginated provider listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paged<T> {
    pub data: Vec<T>,
    /// Total size the provider claims for the whole listing, if it reports one.
    pub total: Option<usize>,
}

impl<T> Paged<T> {
    pub fn new(data: Vec<T>, total: Option<usize>) -> Self {
        Self { data, total }
    }

    /// Whether the provider says more rows exist past `offset + data.len()`.
    pub fn has_more(&self, offset: usize) -> bool {
        match self.total {
            Some(total) => offset + self.data.len() < total,
            None => !self.data.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manga(id: &str, name: &str) -> Manga {
        Manga {
            id: id.into(),
            source: "src".into(),
            name: name.into(),
            covers: vec![],
            authors: vec![],
            tags: vec![],
            description: None,
            uploaded: None,
            added: None,
        }
    }

    #[test]
    fn validate_fills_added_sentinel() {
        let m = manga("1", "Senko-san").validate().unwrap();
        assert_eq!(m.added, Some(NOT_IN_LIBRARY));
        assert!(!m.in_library());
    }

    #[test]
    fn validate_rejects_missing_name() {
        let err = manga("1", "  ").validate().unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn has_more_without_total_follows_data() {
        let p: Paged<u8> = Paged::new(vec![1, 2], None);
        assert!(p.has_more(0));
        let p: Paged<u8> = Paged::new(vec![1, 2], Some(4));
        assert!(p.has_more(0));
        assert!(!p.has_more(2));
    }
}
