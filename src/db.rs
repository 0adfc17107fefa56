use anyhow::{Context, Result};
use async_trait::async_trait;
use directories::ProjectDirs;
use sqlx::any::AnyPoolOptions;
use sqlx::{any::AnyConnectOptions, migrate::Migrator, AnyPool, ConnectOptions};
use std::sync::Once;
use std::{path::PathBuf, str::FromStr};
use tracing::debug;

use crate::storage::Library;
use crate::types::{Chapter, Manga};

// Ensure drivers are installed exactly once for sqlx::any
static INSTALL_DRIVERS: Once = Once::new();

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQL-backed [`Library`]. Records are stored as JSON payloads keyed by their identity.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
}

impl Database {
    // If database_url is None, use a SQLite file in the user's data directory.
    pub async fn connect(database_url: Option<&str>) -> Result<Self> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let url = match database_url {
            Some(u) if !u.trim().is_empty() => u.to_string(),
            _ => default_sqlite_url()?,
        };

        let opts = AnyConnectOptions::from_str(&url)
            .with_context(|| format!("invalid database URL: {url}"))?;
        // Quiet by default; callers can enable SQLX_LOG if they want
        let opts = opts.disable_statement_logging();

        let pool = AnyPoolOptions::new()
            .max_connections(10)
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to connect to database: {url}"))?;
        debug!(%url, "connected to library database");

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.context("running migrations")
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &str, kind: &str) -> Result<T> {
    serde_json::from_str(payload).with_context(|| format!("corrupt {kind} record"))
}

#[async_trait]
impl Library for Database {
    async fn insert_manga(&self, manga: &Manga) -> Result<()> {
        let payload = serde_json::to_string(manga)?;
        sqlx::query(
            "INSERT INTO manga(source, id, payload) VALUES (?, ?, ?)\n             ON CONFLICT(source, id) DO UPDATE SET payload=excluded.payload, updated_at=CURRENT_TIMESTAMP",
        )
        .bind(manga.source.as_str())
        .bind(manga.id.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_chapter(&self, chapter: &Chapter) -> Result<()> {
        let payload = serde_json::to_string(chapter)?;
        sqlx::query(
            "INSERT INTO chapters(source, manga_id, id, payload) VALUES (?, ?, ?, ?)\n             ON CONFLICT(source, manga_id, id) DO UPDATE SET payload=excluded.payload, updated_at=CURRENT_TIMESTAMP",
        )
        .bind(chapter.source.as_str())
        .bind(chapter.manga_id.as_str())
        .bind(chapter.id.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_manga(&self, id: &str, source: &str) -> Result<Option<Manga>> {
        let row = sqlx::query_scalar::<_, String>("SELECT payload FROM manga WHERE source = ? AND id = ?")
            .bind(source)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|p| decode(&p, "manga")).transpose()
    }

    async fn get_all_manga(&self, source: &str) -> Result<Vec<Manga>> {
        let rows = sqlx::query_scalar::<_, String>("SELECT payload FROM manga WHERE source = ? ORDER BY id")
            .bind(source)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|p| decode(p, "manga")).collect()
    }

    async fn get_chapters(&self, manga_id: &str, source: &str) -> Result<Vec<Chapter>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT payload FROM chapters WHERE source = ? AND manga_id = ? ORDER BY id",
        )
        .bind(source)
        .bind(manga_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|p| decode(p, "chapter")).collect()
    }

    async fn remove_manga(&self, id: &str, source: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chapters WHERE source = ? AND manga_id = ?")
            .bind(source)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM manga WHERE source = ? AND id = ?")
            .bind(source)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

/// `sqlite://` URL for a database file, created with the file if missing.
pub fn sqlite_url(path: &std::path::Path) -> String {
    // Encode spaces in the path for a valid sqlite URL
    let path_str = path.to_string_lossy().replace(' ', "%20");
    format!("sqlite://{path_str}?mode=rwc")
}

fn default_sqlite_url() -> Result<String> {
    let proj = ProjectDirs::from("dev", "tankobon", "tankobon")
        .context("unable to determine data directory for default sqlite path")?;
    let mut path: PathBuf = proj.data_dir().to_path_buf();
    std::fs::create_dir_all(&path).with_context(|| format!("creating data dir: {}", path.display()))?;
    path.push("library.db");
    Ok(sqlite_url(&path))
}
