//! Infrastructure Layer
//!
//! Background loops and cross-cutting runtime components.

pub mod certificate_manager;
pub mod config_watcher;
pub mod health_monitor;
pub mod shutdown;

pub use certificate_manager::{
    CertificateManager, CertificateStatus, ListenerCertResolver, ListenerCertificate, PollSummary,
};
pub use config_watcher::{ConfigChange, ConfigWatchError, ConfigWatcher};
pub use health_monitor::HealthMonitor;
pub use shutdown::{shutdown_signal, RequestGuard, ShutdownController};
