//! Error types shared by both ends of the bridge.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias for bridge results.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Failures surfaced by the forwarder and the connection manager.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The forwarder could not bind its listening socket.
    #[error("failed to bind forwarder on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The host context was started from inside its own tick.
    #[error("operation not allowed while a tick is in progress")]
    TickInProgress,

    /// A request was issued while no connection to the host exists.
    #[error("not connected to host")]
    NotConnected,

    /// No response arrived before the deadline; the channel is still intact.
    #[error("request {id} timed out after {timeout:?}")]
    RequestTimeout { id: String, timeout: Duration },

    /// The connection dropped while the request was pending.
    #[error("connection to host lost")]
    ConnectionLost,

    /// A frame could not be decoded into a message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// True when the failure means the channel is gone rather than slow.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ConnectionLost)
    }
}

/// A framed payload that could not be turned into a [`Message`].
///
/// The frame boundary is still known, so the stream stays usable.
///
/// [`Message`]: crate::transport::Message
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("frame payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Well-formed JSON whose `type` is missing or unrecognized.
    #[error("Unknown message type: {kind}")]
    UnknownType { kind: String, id: String },

    #[error("payload too large to frame: {0} bytes")]
    TooLarge(usize),
}
