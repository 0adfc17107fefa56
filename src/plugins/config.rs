use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::PluginLoadError;

/// Optional `plugin.toml` next to a provider's `main.wasm`.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct PluginConfig {
    /// Hosts the provider may fetch from. `*.example.com` matches subdomains; empty denies all.
    #[serde(default)]
    pub allowed_hosts: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl PluginConfig {
    pub fn parse(path: &Path, text: &str) -> Result<Self, PluginLoadError> {
        toml::from_str(text).map_err(|e| PluginLoadError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn rate_limit(&self, default: Duration) -> Duration {
        self.rate_limit_ms.map(Duration::from_millis).unwrap_or(default)
    }

    pub fn call_timeout(&self, default: Duration) -> Duration {
        self.call_timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_fields() {
        let cfg = PluginConfig::parse(
            Path::new("plugin.toml"),
            "allowed_hosts = [\"*.mangadex.org\"]\nrate_limit_ms = 250\ncall_timeout_ms = 5000\n",
        )
        .unwrap();
        assert_eq!(cfg.allowed_hosts, Some(vec!["*.mangadex.org".to_string()]));
        assert_eq!(cfg.rate_limit(Duration::ZERO), Duration::from_millis(250));
        assert_eq!(cfg.call_timeout(Duration::ZERO), Duration::from_secs(5));
    }

    #[test]
    fn defaults_apply_when_missing() {
        let cfg = PluginConfig::parse(Path::new("plugin.toml"), "").unwrap();
        assert_eq!(cfg, PluginConfig::default());
        assert_eq!(cfg.rate_limit(Duration::from_millis(150)), Duration::from_millis(150));
    }

    #[test]
    fn bad_toml_is_a_load_error() {
        let err = PluginConfig::parse(Path::new("x/plugin.toml"), "rate_limit_ms = \"fast\"").unwrap_err();
        assert!(matches!(err, PluginLoadError::Config { .. }));
    }
}
