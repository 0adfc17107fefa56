//! WebAssembly provider host.
//!
//! Providers are components implementing the `provider` world from
//! `plugin-interface/wit/provider.wit`. Each gets its own store, a WASI context limited to stdio,
//! and the restricted fetch capability as its only import with network reach.

mod config;
mod host;
mod plugin;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use wasmtime::{Config, Engine};

pub use config::PluginConfig;
pub use plugin::WasmSource;

use crate::error::PluginLoadError;
use crate::fetch::FetchCapability;
use crate::source::{Source, SourceFactory};

// Generate WIT bindings from the shared plugin interface
pub(crate) mod bindings {
    wasmtime::component::bindgen!({
        world: "provider",
        path: "plugin-interface/wit",
    });
}

pub const DEFAULT_EPOCH_INTERVAL: Duration = Duration::from_millis(10);

/// Builds [`WasmSource`]s on a shared engine with epoch-based call timeouts.
pub struct WasmFactory {
    engine: Engine,
    epoch_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl WasmFactory {
    pub fn new(epoch_interval: Duration) -> Result<Self> {
        let mut config = Config::new();
        config.wasm_component_model(true);
        config.async_support(false);
        config.epoch_interruption(true);
        let engine = Engine::new(&config)?;

        let epoch_interval = epoch_interval.max(Duration::from_millis(1));
        let stop = Arc::new(AtomicBool::new(false));
        {
            let engine = engine.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("tankobon-epoch".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(epoch_interval);
                        engine.increment_epoch();
                    }
                })
                .context("spawning epoch ticker")?;
        }

        Ok(Self { engine, epoch_interval, stop })
    }
}

impl Drop for WasmFactory {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl SourceFactory for WasmFactory {
    async fn instantiate(
        &self,
        module: Vec<u8>,
        fetch: FetchCapability,
        call_timeout: Duration,
    ) -> Result<Arc<dyn Source>, PluginLoadError> {
        let engine = self.engine.clone();
        let epoch_interval = self.epoch_interval;
        let runtime = tokio::runtime::Handle::current();
        let source = tokio::task::spawn_blocking(move || {
            WasmSource::new(&engine, &module, fetch, runtime, epoch_interval, call_timeout)
        })
        .await
        .map_err(|e| PluginLoadError::Instantiate(e.to_string()))??;
        Ok(Arc::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn garbage_module_is_a_load_error() {
        let factory = WasmFactory::new(DEFAULT_EPOCH_INTERVAL).unwrap();
        let fetch = FetchCapability::new(reqwest::Client::new(), Some(vec![]), Duration::ZERO);
        let err = factory
            .instantiate(b"definitely not wasm".to_vec(), fetch, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginLoadError::Instantiate(_)));
    }

    #[tokio::test]
    async fn component_missing_exports_fails_at_load() {
        let factory = WasmFactory::new(DEFAULT_EPOCH_INTERVAL).unwrap();
        let fetch = FetchCapability::new(reqwest::Client::new(), Some(vec![]), Duration::ZERO);
        // a valid component that exports nothing
        let err = factory
            .instantiate(b"(component)".to_vec(), fetch, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginLoadError::Instantiate(_)));
    }
}
