mod affinity_store;
mod backend_state;
mod event_sink;
mod forwarder;
mod prober;
mod secret_provider;
mod table_observer;

pub use affinity_store::{AffinityBinding, AffinityStore};
pub use backend_state::BackendStateReader;
pub use event_sink::EventSink;
pub use forwarder::{ForwardError, ForwardedResponse, Forwarder};
pub use prober::{ProbeTarget, Prober};
pub use secret_provider::{CertificateBundle, SecretProvider};
pub use table_observer::TableObserver;
