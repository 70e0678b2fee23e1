//! Configuration store and reload.
//!
//! The active configuration lives in an immutable [`Snapshot`] together with
//! its compiled router and per-endpoint runtime state. A reload builds a new
//! snapshot and swaps it in atomically, so a request that loaded a snapshot
//! keeps seeing exactly that configuration, and cursors and overrides start
//! fresh with every new one.

use crate::config::{Configuration, Endpoint, EndpointKey};
use crate::error::{SimulatorError, SimulatorResult};
use crate::router::Router;
use crate::selector::EndpointState;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Where configuration documents come from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Human-readable name for logs and errors.
    fn name(&self) -> String;

    /// Read the current document bytes.
    async fn read(&self) -> std::io::Result<Vec<u8>>;
}

/// A configuration file on disk.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}

/// A configuration document held in memory, such as a bundled resource.
pub struct EmbeddedSource {
    name: String,
    content: RwLock<Arc<Vec<u8>>>,
}

impl EmbeddedSource {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: RwLock::new(Arc::new(content.into())),
        }
    }

    /// Replace the document; picked up by the next reload.
    pub fn replace(&self, content: impl Into<Vec<u8>>) {
        *self.content.write() = Arc::new(content.into());
    }
}

#[async_trait]
impl ConfigSource for EmbeddedSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn read(&self) -> std::io::Result<Vec<u8>> {
        Ok(self.content.read().as_ref().clone())
    }
}

/// An immutable configuration plus everything derived from it.
#[derive(Debug)]
pub struct Snapshot {
    pub config: Configuration,
    pub router: Router,
    states: Vec<EndpointState>,
    /// Increases with every installed configuration; 0 is the empty startup one
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
}

impl Snapshot {
    fn build(config: Configuration, version: u64) -> Self {
        let router = Router::new(&config.endpoints);
        let states = config.endpoints.iter().map(|_| EndpointState::new()).collect();
        Self {
            config,
            router,
            states,
            version,
            loaded_at: Utc::now(),
        }
    }

    /// Runtime state of the endpoint at `index`.
    pub fn state(&self, index: usize) -> Option<&EndpointState> {
        self.states.get(index)
    }

    /// Find an endpoint by method and either its path pattern (as normalized
    /// or as authored) or a concrete path it routes.
    pub fn find_endpoint(&self, method: &str, path: &str) -> Option<(usize, &Endpoint)> {
        let key = EndpointKey::new(method, path);
        if let Some(found) = self.config.endpoint(&key) {
            return Some(found);
        }

        let by_original = self.config.endpoints.iter().enumerate().find(|(_, e)| {
            e.method == key.method && e.original_path_pattern.as_deref() == Some(path)
        });
        if by_original.is_some() {
            return by_original;
        }

        self.router
            .resolve(&self.config.endpoints, method, path)
            .map(|m| (m.index, m.endpoint))
    }
}

/// Holds the active snapshot and rebuilds it from a [`ConfigSource`].
pub struct ConfigStore {
    source: Arc<dyn ConfigSource>,
    current: ArcSwap<Snapshot>,
    fingerprint: Mutex<Option<u64>>,
    version: AtomicU64,
    /// Held across read, decode and swap so reloads apply in the order they ran
    reload_lock: tokio::sync::Mutex<()>,
}

impl ConfigStore {
    /// Create a store with an empty configuration. Call [`ConfigStore::reload`]
    /// to load the source.
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            current: ArcSwap::from_pointee(Snapshot::build(Configuration::default(), 0)),
            fingerprint: Mutex::new(None),
            version: AtomicU64::new(0),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The active snapshot. One atomic load; hold on to it for a whole request.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn source_name(&self) -> String {
        self.source.name()
    }

    /// Read, parse and validate the source, then swap it in.
    ///
    /// Always installs a fresh snapshot on success, even when the document is
    /// unchanged. On failure the active snapshot is kept.
    pub async fn reload(&self) -> SimulatorResult<Arc<Snapshot>> {
        let _guard = self.reload_lock.lock().await;
        let bytes = self.fetch().await?;
        *self.fingerprint.lock() = Some(fingerprint(&bytes));
        let config = self.decode(&bytes)?;
        self.install(config)
    }

    /// Like [`ConfigStore::reload`], but only when the document changed since
    /// it was last read. A document that failed once is not retried until it
    /// changes again.
    pub async fn reload_if_changed(&self) -> SimulatorResult<Option<Arc<Snapshot>>> {
        let _guard = self.reload_lock.lock().await;
        let bytes = self.fetch().await?;
        let print = fingerprint(&bytes);
        {
            let mut last = self.fingerprint.lock();
            if *last == Some(print) {
                return Ok(None);
            }
            *last = Some(print);
        }

        debug!(source = %self.source.name(), "Configuration source changed");
        let config = self.decode(&bytes)?;
        self.install(config).map(Some)
    }

    /// Validate a configuration and make it the active one. Callers hold
    /// `reload_lock`.
    fn install(&self, config: Configuration) -> SimulatorResult<Arc<Snapshot>> {
        config
            .validate()
            .map_err(|e| SimulatorError::ConfigValidation(e.to_string()))?;

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(Snapshot::build(config, version));
        self.current.store(snapshot.clone());

        info!(
            source = %self.source.name(),
            version,
            endpoints = snapshot.config.endpoints.len(),
            "Configuration installed"
        );
        Ok(snapshot)
    }

    async fn fetch(&self) -> SimulatorResult<Vec<u8>> {
        self.source
            .read()
            .await
            .map_err(|e| SimulatorError::ConfigSource {
                source_name: self.source.name(),
                message: e.to_string(),
            })
    }

    fn decode(&self, bytes: &[u8]) -> SimulatorResult<Configuration> {
        Configuration::parse(bytes).map_err(|e| SimulatorError::ConfigParse {
            source_name: self.source.name(),
            message: e.to_string(),
        })
    }
}

fn fingerprint(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    const V1: &str = r#"
endpoints:
  - pathPattern: /users/{id}
    method: GET
    responses:
      - id: r1
"#;

    const V2: &str = r#"
endpoints:
  - pathPattern: /users/{id}
    method: GET
    responses:
      - id: r1
  - pathPattern: /health
    method: GET
    responses:
      - id: ok
"#;

    const DUPLICATE: &str = r#"
endpoints:
  - pathPattern: /a
    method: GET
  - pathPattern: /a
    method: GET
"#;

    fn embedded(content: &str) -> (Arc<EmbeddedSource>, ConfigStore) {
        let source = Arc::new(EmbeddedSource::new("test", content));
        let store = ConfigStore::new(source.clone());
        (source, store)
    }

    #[tokio::test]
    async fn test_starts_empty_until_loaded() {
        let (_, store) = embedded(V1);
        assert_eq!(store.snapshot().version, 0);
        assert!(store.snapshot().config.endpoints.is_empty());

        let snapshot = assert_ok!(store.reload().await);
        assert_eq!(snapshot.version, 1);
        assert_eq!(store.snapshot().config.endpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_if_changed() {
        let (source, store) = embedded(V1);
        assert_ok!(store.reload().await);

        assert!(assert_ok!(store.reload_if_changed().await).is_none());

        source.replace(V2);
        let snapshot = assert_ok!(store.reload_if_changed().await).unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.config.endpoints.len(), 2);
        assert!(assert_ok!(store.reload_if_changed().await).is_none());
    }

    #[tokio::test]
    async fn test_invalid_document_keeps_previous_snapshot() {
        let (source, store) = embedded(V1);
        assert_ok!(store.reload().await);

        source.replace(DUPLICATE);
        let err = assert_err!(store.reload_if_changed().await);
        assert!(matches!(err, SimulatorError::ConfigValidation(_)));
        assert_eq!(store.snapshot().version, 1);
        assert_eq!(store.snapshot().config.endpoints[0].path_pattern, "/users/{id}");

        // The same broken document is not reported twice
        assert!(assert_ok!(store.reload_if_changed().await).is_none());

        source.replace("endpoints: [ {");
        let err = assert_err!(store.reload_if_changed().await);
        assert!(matches!(err, SimulatorError::ConfigParse { .. }));
        assert_eq!(store.snapshot().version, 1);
    }

    #[tokio::test]
    async fn test_reload_resets_endpoint_state() {
        let (_, store) = embedded(V1);
        assert_ok!(store.reload().await);

        let before = store.snapshot();
        before.state(0).unwrap().set_active("r1");

        assert_ok!(store.reload().await);
        let after = store.snapshot();
        assert!(after.state(0).unwrap().active().is_none());
        // The old snapshot is untouched for requests still holding it
        assert!(before.state(0).unwrap().active().is_some());
    }

    #[tokio::test]
    async fn test_missing_file_leaves_empty_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(Arc::new(FileSource::new(dir.path().join("missing.yaml"))));

        let err = assert_err!(store.reload().await);
        assert!(matches!(err, SimulatorError::ConfigSource { .. }));
        assert!(store.snapshot().config.endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_file_source_change_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mock.yaml");
        std::fs::write(&path, V1).unwrap();

        let store = ConfigStore::new(Arc::new(FileSource::new(&path)));
        assert_ok!(store.reload().await);
        assert!(assert_ok!(store.reload_if_changed().await).is_none());

        std::fs::write(&path, V2).unwrap();
        let snapshot = assert_ok!(store.reload_if_changed().await).unwrap();
        assert_eq!(snapshot.config.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_find_endpoint() {
        let (_, store) = embedded(V2);
        assert_ok!(store.reload().await);
        let snapshot = store.snapshot();

        assert_eq!(snapshot.find_endpoint("get", "/users/{id}").unwrap().0, 0);
        assert_eq!(snapshot.find_endpoint("GET", "/users/{id}/").unwrap().0, 0);
        assert_eq!(snapshot.find_endpoint("GET", "/users/42").unwrap().0, 0);
        assert_eq!(snapshot.find_endpoint("GET", "/health").unwrap().0, 1);
        assert!(snapshot.find_endpoint("POST", "/health").is_none());
    }

    /// Serves `first` on the first read, but only once released; every later
    /// read gets `rest`.
    struct GatedSource {
        reads: AtomicUsize,
        release: Notify,
        first: &'static str,
        rest: &'static str,
    }

    #[async_trait]
    impl ConfigSource for GatedSource {
        fn name(&self) -> String {
            "gated".to_string()
        }

        async fn read(&self) -> std::io::Result<Vec<u8>> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                self.release.notified().await;
                return Ok(self.first.as_bytes().to_vec());
            }
            Ok(self.rest.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn test_concurrent_reloads_apply_in_order() {
        let source = Arc::new(GatedSource {
            reads: AtomicUsize::new(0),
            release: Notify::new(),
            first: V1,
            rest: V2,
        });
        let store = Arc::new(ConfigStore::new(source.clone()));

        // The full reload reads the old document and stalls
        let slow = tokio::spawn({
            let store = store.clone();
            async move { store.reload().await }
        });
        while source.reads.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // The change check starts later and must not overtake it
        let fast = tokio::spawn({
            let store = store.clone();
            async move { store.reload_if_changed().await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);

        source.release.notify_one();
        let first = assert_ok!(slow.await.unwrap());
        let second = assert_ok!(fast.await.unwrap()).unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(store.snapshot().version, 2);
        assert_eq!(store.snapshot().config.endpoints.len(), 2);
        assert!(assert_ok!(store.reload_if_changed().await).is_none());
    }
}
