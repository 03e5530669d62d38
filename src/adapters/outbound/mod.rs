mod caching_secret_provider;
mod dashmap_affinity_store;
mod dashmap_backend_state;
mod file_secret_provider;
mod http_prober;
mod memory_event_sink;
mod reqwest_forwarder;
mod self_signed_secret_provider;
mod tracing_event_sink;

pub use caching_secret_provider::CachingSecretProvider;
pub use dashmap_affinity_store::DashMapAffinityStore;
pub use dashmap_backend_state::DashMapBackendState;
pub use file_secret_provider::FileSecretProvider;
pub use http_prober::HttpProber;
pub use memory_event_sink::MemoryEventSink;
pub use reqwest_forwarder::ReqwestForwarder;
pub use self_signed_secret_provider::SelfSignedSecretProvider;
pub use tracing_event_sink::{TracingEventSink, EVENT_TARGET};
