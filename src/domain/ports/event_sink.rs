//! Event Sink Port
//!
//! The gateway never talks to a logging or metrics backend directly.

use crate::domain::events::GatewayEvent;

/// Receiver of structured gateway events.
///
/// Implementations must not block: `emit` is called on the request path.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: GatewayEvent);
}
