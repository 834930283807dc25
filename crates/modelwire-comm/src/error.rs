use std::time::Duration;

use crate::driver::Direction;

/// Errors raised by comm drivers, the broker and RPC pairs.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] modelwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] modelwire_frame::FrameError),

    /// File or other I/O failure outside the frame layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An endpoint address could not be parsed.
    #[error("invalid endpoint address '{0}'")]
    InvalidAddress(String),

    /// No address was injected for the named endpoint.
    #[error("endpoint '{name}' not configured (set {var})")]
    MissingEndpoint { name: String, var: String },

    /// The operation does not match the driver's direction.
    #[error("endpoint '{name}' is an {direction} endpoint")]
    WrongDirection { name: String, direction: Direction },

    /// The broker refused a queue registration.
    #[error("queue registration rejected: {0}")]
    Registration(String),

    /// The channel can no longer carry messages.
    #[error("channel broken: {0}")]
    Broken(String),

    /// The endpoint was closed locally.
    #[error("endpoint '{0}' is closed")]
    Closed(String),

    /// A receive got nothing within its retry budget.
    #[error("no message on '{endpoint}' within {waited:?}")]
    RecvTimeout { endpoint: String, waited: Duration },

    /// An RPC call got no response within its retry budget.
    #[error("rpc call timed out after {0:?}")]
    RpcTimeout(Duration),
}

impl CommError {
    /// True when the failure is a framing protocol violation.
    pub fn is_framing(&self) -> bool {
        matches!(self, CommError::Frame(err) if err.is_protocol_violation())
    }
}

pub type Result<T> = std::result::Result<T, CommError>;
