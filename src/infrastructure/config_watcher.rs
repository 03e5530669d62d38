//! Configuration Hot Reload
//!
//! Polls the routing document on disk and reconfigures the gateway when it
//! changes. A rejected document leaves the previous table active; the
//! watcher keeps polling and picks up the next edit.

use crate::application::GatewayService;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, RwLock};

/// Outcome of a detected change.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    /// The document was compiled and activated
    Applied(PathBuf),
    /// The document was rejected, the previous table stays active
    Rejected { path: PathBuf, error: String },
}

/// Last observed state of the watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: SystemTime,
    len: u64,
}

/// Routing document watcher.
pub struct ConfigWatcher {
    path: PathBuf,
    last_seen: RwLock<Option<Fingerprint>>,
    change_tx: broadcast::Sender<ConfigChange>,
    poll_interval: Duration,
}

impl ConfigWatcher {
    /// Create a watcher. The current state of the file counts as seen.
    pub fn new(path: impl AsRef<Path>, poll_interval: Duration) -> Result<Self, ConfigWatchError> {
        let path = path.as_ref().to_path_buf();
        let fingerprint = Self::fingerprint(&path)?;
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path,
            last_seen: RwLock::new(Some(fingerprint)),
            change_tx,
            poll_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribe to applied/rejected notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    fn fingerprint(path: &Path) -> Result<Fingerprint, ConfigWatchError> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| ConfigWatchError::FileError(path.to_path_buf(), e.to_string()))?;
        let modified = metadata
            .modified()
            .map_err(|e| ConfigWatchError::FileError(path.to_path_buf(), e.to_string()))?;

        Ok(Fingerprint {
            modified,
            len: metadata.len(),
        })
    }

    /// Whether the file changed since the last call.
    async fn check_file(&self) -> bool {
        let Ok(current) = Self::fingerprint(&self.path) else {
            // vanished or unreadable; keep the running table
            return false;
        };

        let mut last = self.last_seen.write().await;
        if *last == Some(current) {
            return false;
        }
        *last = Some(current);
        true
    }

    /// Check the file once and reconfigure `service` if it changed.
    pub async fn poll_once(&self, service: &GatewayService) -> Option<ConfigChange> {
        if !self.check_file().await {
            return None;
        }

        tracing::info!(path = ?self.path, "routing configuration modified");
        let change = match service.reload_file(&self.path) {
            Ok(_) => ConfigChange::Applied(self.path.clone()),
            Err(e) => ConfigChange::Rejected {
                path: self.path.clone(),
                error: e.to_string(),
            },
        };

        let _ = self.change_tx.send(change.clone());
        Some(change)
    }

    /// Start the polling loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(self: Arc<Self>, service: Arc<GatewayService>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);

            loop {
                interval.tick().await;
                self.poll_once(&service).await;
            }
        });
    }
}

/// Errors that can occur during configuration watching.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWatchError {
    /// File operation failed
    FileError(PathBuf, String),
}

impl std::fmt::Display for ConfigWatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWatchError::FileError(path, e) => {
                write!(f, "file error for {:?}: {}", path, e)
            }
        }
    }
}

impl std::error::Error for ConfigWatchError {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{
        DashMapAffinityStore, DashMapBackendState, MemoryEventSink, ReqwestForwarder,
    };
    use crate::domain::gateway_config::GatewayConfig;
    use crate::domain::services::RoutingCompiler;
    use tempfile::NamedTempFile;

    fn document(pool_target: &str) -> String {
        format!(
            r#"{{
            "listeners": [ {{ "name": "http", "port": 8080, "protocol": "http" }} ],
            "rules": [
                {{ "name": "default", "listener": "http", "priority": 100, "path": "/*",
                  "target": {{ "backend": {{ "pool": "web", "settings": "s" }} }} }}
            ],
            "pools": [ {{ "name": "web", "targets": ["{}"] }} ],
            "settings": [ {{ "name": "s", "port": 80, "probe": "p" }} ],
            "probes": [ {{ "name": "p", "path": "/" }} ]
        }}"#,
            pool_target
        )
    }

    fn service(json: &str, events: Arc<MemoryEventSink>) -> GatewayService {
        let table = RoutingCompiler::compile(&GatewayConfig::from_json(json).unwrap()).unwrap();
        GatewayService::new(
            table,
            Arc::new(DashMapBackendState::new()),
            Arc::new(DashMapAffinityStore::new()),
            Arc::new(ReqwestForwarder::new()),
            events,
            None,
        )
    }

    fn first_target(service: &GatewayService) -> String {
        service.table().pool("web").unwrap().targets[0].clone()
    }

    #[test]
    fn test_new_missing_file() {
        let result = ConfigWatcher::new("/nonexistent/routing.json", Duration::from_secs(1));
        assert!(matches!(result, Err(ConfigWatchError::FileError(_, _))));
    }

    #[tokio::test]
    async fn test_unchanged_file_is_ignored() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), document("10.0.0.1")).unwrap();
        let service = service(&document("10.0.0.1"), Arc::new(MemoryEventSink::new(8)));

        let watcher = ConfigWatcher::new(file.path(), Duration::from_secs(1)).unwrap();
        assert_eq!(watcher.poll_once(&service).await, None);
    }

    #[tokio::test]
    async fn test_modified_file_is_applied() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), document("10.0.0.1")).unwrap();
        let service = service(&document("10.0.0.1"), Arc::new(MemoryEventSink::new(8)));
        let watcher = ConfigWatcher::new(file.path(), Duration::from_secs(1)).unwrap();
        let mut rx = watcher.subscribe();

        std::fs::write(file.path(), document("10.0.0.200")).unwrap();

        let change = watcher.poll_once(&service).await;
        assert!(matches!(change, Some(ConfigChange::Applied(_))));
        assert_eq!(first_target(&service), "10.0.0.200");
        assert!(matches!(rx.recv().await.unwrap(), ConfigChange::Applied(_)));

        // same content again is not a change
        assert_eq!(watcher.poll_once(&service).await, None);
    }

    #[tokio::test]
    async fn test_invalid_document_keeps_previous_table() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), document("10.0.0.1")).unwrap();
        let events = Arc::new(MemoryEventSink::new(8));
        let service = service(&document("10.0.0.1"), events.clone());
        let watcher = ConfigWatcher::new(file.path(), Duration::from_secs(1)).unwrap();

        std::fs::write(file.path(), "{ \"listeners\": [ broken").unwrap();

        let change = watcher.poll_once(&service).await;
        assert!(matches!(change, Some(ConfigChange::Rejected { .. })));
        assert_eq!(first_target(&service), "10.0.0.1");
        assert_eq!(events.named("configuration_rejected").len(), 1);
    }
}
