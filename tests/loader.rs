mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::MockFactory;
use tankobon::error::PluginLoadError;
use tankobon::loader::{LoaderOptions, PluginLoader, ENTRY_MODULE, PLUGIN_CONFIG};

fn provider(root: &Path, name: &str, module: &str) -> std::path::PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(ENTRY_MODULE), module).unwrap();
    dir
}

fn loader(factory: &Arc<MockFactory>) -> PluginLoader {
    PluginLoader::new(factory.clone(), reqwest::Client::new(), LoaderOptions::default())
}

#[tokio::test]
async fn identical_content_shares_one_instance() {
    let root = tempfile::tempdir().unwrap();
    let a = provider(root.path(), "a", "id = \"dup\"\n");
    let b = provider(root.path(), "b", "id = \"dup\"\n");
    let factory = Arc::new(MockFactory::new());
    let loader = loader(&factory);

    let first = loader.load(&a).await.unwrap().unwrap();
    let second = loader.load(&b).await.unwrap().unwrap();
    let again = loader.load(&a).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(factory.count(), 1);
    assert_eq!(loader.cached(), 1);
}

#[tokio::test]
async fn concurrent_loads_of_same_module_instantiate_once() {
    let root = tempfile::tempdir().unwrap();
    let module = "id = \"slow\"\ndelay_ms = 50\n";
    let a = provider(root.path(), "a", module);
    let b = provider(root.path(), "b", module);
    let factory = Arc::new(MockFactory::new());
    let loader = loader(&factory);

    let (x, y) = tokio::join!(loader.load(&a), loader.load(&b));
    assert!(Arc::ptr_eq(&x.unwrap().unwrap(), &y.unwrap().unwrap()));
    assert_eq!(factory.count(), 1);
}

#[tokio::test]
async fn directory_without_entry_module_is_skipped() {
    let root = tempfile::tempdir().unwrap();
    let factory = Arc::new(MockFactory::new());
    assert!(loader(&factory).load(root.path()).await.unwrap().is_none());
    assert_eq!(factory.count(), 0);
}

#[tokio::test]
async fn malformed_module_is_a_load_error() {
    let root = tempfile::tempdir().unwrap();
    let bad = provider(root.path(), "bad", "this is not a module");
    let good = provider(root.path(), "good", "id = \"good\"\n");
    let factory = Arc::new(MockFactory::new());
    let loader = loader(&factory);

    assert!(matches!(loader.load(&bad).await, Err(PluginLoadError::Instantiate(_))));
    assert_eq!(loader.load(&good).await.unwrap().unwrap().id(), "good");
}

#[tokio::test]
async fn plugin_config_shapes_the_capability() {
    let root = tempfile::tempdir().unwrap();
    let dir = provider(root.path(), "p", "id = \"p\"\n");
    std::fs::write(
        dir.join(PLUGIN_CONFIG),
        "allowed_hosts = [\"*.example.org\"]\ncall_timeout_ms = 2500\n",
    )
    .unwrap();
    let factory = Arc::new(MockFactory::new());
    loader(&factory).load(&dir).await.unwrap().unwrap();

    assert_eq!(*factory.allowed_hosts.lock().unwrap(), vec![Some(vec!["*.example.org".to_string()])]);
    assert_eq!(*factory.timeouts.lock().unwrap(), vec![Duration::from_millis(2500)]);
}

#[tokio::test]
async fn invalid_plugin_config_fails_only_that_candidate() {
    let root = tempfile::tempdir().unwrap();
    let dir = provider(root.path(), "p", "id = \"p\"\n");
    std::fs::write(dir.join(PLUGIN_CONFIG), "allowed_hosts = 42").unwrap();
    let factory = Arc::new(MockFactory::new());
    let err = loader(&factory).load(&dir).await.unwrap_err();
    assert!(matches!(err, PluginLoadError::Config { .. }));
    assert_eq!(factory.count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_entry_module_is_an_io_error() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("looped");
    std::fs::create_dir(&dir).unwrap();
    let entry = dir.join(ENTRY_MODULE);
    std::os::unix::fs::symlink(&entry, &entry).unwrap();
    let factory = Arc::new(MockFactory::new());

    let err = loader(&factory).load(&dir).await.unwrap_err();
    assert!(matches!(err, PluginLoadError::Io { ref path, .. } if *path == entry));
    assert_eq!(factory.count(), 0);
}
