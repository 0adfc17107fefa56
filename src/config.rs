//! Application settings: `config.toml` with serde defaults, then `TANKOBON_*` overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::aggregator::CatalogConfig;
use crate::fetch::DEFAULT_PAGE_TIMEOUT;
use crate::loader::{LoaderOptions, DEFAULT_CALL_TIMEOUT, DEFAULT_RATE_LIMIT};
use crate::pipeline::DEFAULT_LOOKAHEAD;
use crate::plugins::DEFAULT_EPOCH_INTERVAL;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root holding one directory per provider; defaults to `plugins/` in the data directory.
    pub plugins_dir: Option<PathBuf>,
    /// sqlx database URL; defaults to a SQLite file in the data directory.
    pub database_url: Option<String>,
    pub prefetch: PrefetchConfig,
    pub catalog: CatalogConfig,
    pub plugins: PluginSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub lookahead: usize,
    pub page_timeout_secs: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self { lookahead: DEFAULT_LOOKAHEAD, page_timeout_secs: DEFAULT_PAGE_TIMEOUT.as_secs() }
    }
}

impl PrefetchConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs.max(1))
    }
}

/// Host-wide plugin defaults; `plugin.toml` may override the first two per provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    pub call_timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub epoch_interval_ms: u64,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: DEFAULT_CALL_TIMEOUT.as_millis() as u64,
            rate_limit_ms: DEFAULT_RATE_LIMIT.as_millis() as u64,
            epoch_interval_ms: DEFAULT_EPOCH_INTERVAL.as_millis() as u64,
        }
    }
}

impl PluginSettings {
    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            rate_limit: Duration::from_millis(self.rate_limit_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }

    pub fn epoch_interval(&self) -> Duration {
        Duration::from_millis(self.epoch_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins_dir: None,
            database_url: None,
            prefetch: PrefetchConfig::default(),
            catalog: CatalogConfig::default(),
            plugins: PluginSettings::default(),
        }
    }
}

impl Config {
    /// Read `path`, or `config.toml` in the project config directory when no path is given.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match project_dirs().map(|p| p.config_dir().join(CONFIG_FILE)) {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config: {}", path.display()))
    }

    /// Apply `TANKOBON_*` overrides. Unparseable numbers are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(dir) = lookup("TANKOBON_PLUGINS_DIR").filter(|v| !v.trim().is_empty()) {
            self.plugins_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = lookup("TANKOBON_DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(n) = number("TANKOBON_LOOKAHEAD") {
            self.prefetch.lookahead = n as usize;
        }
        if let Some(n) = number("TANKOBON_PAGE_TIMEOUT_SECS") {
            self.prefetch.page_timeout_secs = n;
        }
        if let Some(n) = number("TANKOBON_MAX_ROUNDS") {
            self.catalog.max_rounds = n as usize;
        }
    }

    pub fn plugins_dir(&self) -> Result<PathBuf> {
        match &self.plugins_dir {
            Some(dir) => Ok(dir.clone()),
            None => project_dirs()
                .map(|p| p.data_dir().join("plugins"))
                .context("unable to determine data directory for plugins"),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "tankobon", "tankobon")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "plugins_dir = \"/srv/providers\"\n[prefetch]\nlookahead = 2\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.plugins_dir, Some(PathBuf::from("/srv/providers")));
        assert_eq!(config.prefetch.lookahead, 2);
        assert_eq!(config.prefetch.page_timeout_secs, 10);
        assert_eq!(config.catalog, CatalogConfig::default());
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("TANKOBON_LOOKAHEAD", "8"),
            ("TANKOBON_MAX_ROUNDS", "5"),
            ("TANKOBON_PAGE_TIMEOUT_SECS", "nope"),
            ("TANKOBON_DATABASE_URL", "sqlite://lib.db"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.prefetch.lookahead, 8);
        assert_eq!(config.catalog.max_rounds, 5);
        assert_eq!(config.prefetch.page_timeout_secs, 10);
        assert_eq!(config.database_url.as_deref(), Some("sqlite://lib.db"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
