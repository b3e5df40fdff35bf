//! WebSocket transport to the voice service.
//!
//! [`TransportChannel`] owns the single socket, fans inbound [`Envelope`]s
//! out to subscribers, and reconnects with a linearly increasing delay when
//! the socket drops unexpectedly.  [`EnvelopeSink`] is the narrow send-only
//! view handed to the capture pipeline.

pub mod channel;
pub mod endpoint;
pub mod message;

use std::time::Duration;

use thiserror::Error;

pub use channel::{
    ConnectionStatus, SubscriptionId, TransportChannel, TransportEvent, TransportEventKind,
};
pub use endpoint::{Endpoint, ENDPOINT_ENV};
pub use message::{AudioFormat, Envelope};

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("socket URL unavailable: {0}")]
    Endpoint(String),

    #[error("failed to open socket: {0}")]
    Connect(String),

    #[error("socket did not open within {0:?}")]
    Timeout(Duration),

    #[error("socket is not open")]
    NotConnected,

    #[error("failed to encode envelope: {0}")]
    Serialize(String),
}

// ---------------------------------------------------------------------------
// EnvelopeSink
// ---------------------------------------------------------------------------

/// Send-only access to the socket.
pub trait EnvelopeSink: Send + Sync {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;
}
