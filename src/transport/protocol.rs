//! Bridge protocol message types.
//!
//! Length-prefixed JSON protocol between the external service and the
//! forwarder running inside the host. Messages are framed as:
//! [4-byte BE length][JSON payload]

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Every `type` tag the protocol knows about.
pub const MESSAGE_KINDS: [&str; 8] = [
    "ping",
    "pong",
    "execute",
    "execute_file",
    "get_state",
    "result",
    "state",
    "error",
];

/// A single protocol message, tagged on `type`.
///
/// Requests flow external service → forwarder, responses flow back. Every
/// message carries the caller-assigned correlation `id`; a missing id
/// decodes as the empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Liveness check.
    Ping {
        #[serde(default)]
        id: String,
    },
    /// Reply to `ping`.
    Pong {
        #[serde(default)]
        id: String,
        timestamp: f64,
        state: ForwarderState,
    },
    /// Run a code snippet on the host thread.
    Execute {
        #[serde(default)]
        id: String,
        #[serde(default)]
        code: String,
    },
    /// Load a script from disk and run it on the host thread.
    ExecuteFile {
        #[serde(default)]
        id: String,
        #[serde(default)]
        file: String,
    },
    /// Query the forwarder's state.
    GetState {
        #[serde(default)]
        id: String,
    },
    /// Outcome of `execute` / `execute_file`.
    Result {
        #[serde(default)]
        id: String,
        success: bool,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        logs: Option<String>,
    },
    /// Reply to `get_state`.
    State {
        #[serde(default)]
        id: String,
        state: ForwarderState,
        timestamp: f64,
    },
    /// Protocol-level error, e.g. an unrecognized request type.
    Error {
        #[serde(default)]
        id: String,
        error: String,
    },
}

impl Message {
    /// Correlation id of this message.
    pub fn id(&self) -> &str {
        match self {
            Self::Ping { id }
            | Self::Pong { id, .. }
            | Self::Execute { id, .. }
            | Self::ExecuteFile { id, .. }
            | Self::GetState { id }
            | Self::Result { id, .. }
            | Self::State { id, .. }
            | Self::Error { id, .. } => id,
        }
    }

    /// Wire name of the message kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Execute { .. } => "execute",
            Self::ExecuteFile { .. } => "execute_file",
            Self::GetState { .. } => "get_state",
            Self::Result { .. } => "result",
            Self::State { .. } => "state",
            Self::Error { .. } => "error",
        }
    }
}

/// Requests the external service can issue.
///
/// The connection manager assigns the correlation id when the request is
/// sent, so requests are built without one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    Execute { code: String },
    ExecuteFile { file: String },
    GetState,
}

impl Request {
    /// Attach a correlation id, producing the wire message.
    pub fn into_message(self, id: String) -> Message {
        match self {
            Self::Ping => Message::Ping { id },
            Self::Execute { code } => Message::Execute { id, code },
            Self::ExecuteFile { file } => Message::ExecuteFile { id, file },
            Self::GetState => Message::GetState { id },
        }
    }

    /// Whether this request runs code on the host.
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execute { .. } | Self::ExecuteFile { .. })
    }
}

/// State of the forwarder inside the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwarderState {
    #[default]
    Idle,
    Executing,
    Error,
}

impl ForwarderState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Executing => "executing",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ForwarderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The external service's view of its link to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Executing,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Executing => "executing",
        }
    }

    /// Connected, whether idle or waiting on an execution.
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Executing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds since the Unix epoch, as carried in `timestamp` fields.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
