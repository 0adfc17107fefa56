use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Chapter, Manga};

/// Persistence collaborator for library records.
///
/// Callers in this crate treat every failure as non-fatal and only log it.
#[async_trait]
pub trait Library: Send + Sync {
    async fn insert_manga(&self, manga: &Manga) -> Result<()>;
    async fn insert_chapter(&self, chapter: &Chapter) -> Result<()>;
    async fn get_manga(&self, id: &str, source: &str) -> Result<Option<Manga>>;
    async fn get_all_manga(&self, source: &str) -> Result<Vec<Manga>>;
    async fn get_chapters(&self, manga_id: &str, source: &str) -> Result<Vec<Chapter>>;
    /// Delete a manga and its stored chapters. Returns whether the manga was present.
    async fn remove_manga(&self, id: &str, source: &str) -> Result<bool>;
}

/// A [`Library`] kept in memory, for embedders without a database and for tests.
#[derive(Default)]
pub struct MemoryLibrary {
    manga: RwLock<BTreeMap<(String, String), Manga>>,
    chapters: RwLock<BTreeMap<(String, String, String), Chapter>>,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("library lock poisoned")
}

#[async_trait]
impl Library for MemoryLibrary {
    async fn insert_manga(&self, manga: &Manga) -> Result<()> {
        self.manga
            .write()
            .map_err(poisoned)?
            .insert((manga.source.clone(), manga.id.clone()), manga.clone());
        Ok(())
    }

    async fn insert_chapter(&self, chapter: &Chapter) -> Result<()> {
        self.chapters.write().map_err(poisoned)?.insert(
            (chapter.source.clone(), chapter.manga_id.clone(), chapter.id.clone()),
            chapter.clone(),
        );
        Ok(())
    }

    async fn get_manga(&self, id: &str, source: &str) -> Result<Option<Manga>> {
        let manga = self.manga.read().map_err(poisoned)?;
        Ok(manga.get(&(source.to_string(), id.to_string())).cloned())
    }

    async fn get_all_manga(&self, source: &str) -> Result<Vec<Manga>> {
        let manga = self.manga.read().map_err(poisoned)?;
        Ok(manga.iter().filter(|((s, _), _)| s == source).map(|(_, m)| m.clone()).collect())
    }

    async fn get_chapters(&self, manga_id: &str, source: &str) -> Result<Vec<Chapter>> {
        let chapters = self.chapters.read().map_err(poisoned)?;
        Ok(chapters
            .iter()
            .filter(|((s, m, _), _)| s == source && m == manga_id)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn remove_manga(&self, id: &str, source: &str) -> Result<bool> {
        self.chapters
            .write()
            .map_err(poisoned)?
            .retain(|(s, m, _), _| !(s == source && m == id));
        let removed = self.manga.write().map_err(poisoned)?.remove(&(source.to_string(), id.to_string()));
        Ok(removed.is_some())
    }
}
