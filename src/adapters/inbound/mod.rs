mod admin_server;
mod http_server;

pub use admin_server::{admin_router, AdminServer, AdminState};
pub use http_server::{listener_router, HttpServer, ListenerState};

// Re-export for external use (e.g., integration tests)
#[allow(unused_imports)]
pub use admin_server::{BackendStatus, HealthResponse, WafModeRequest, WafResponse};
