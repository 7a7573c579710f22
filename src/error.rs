//! Error taxonomy for the connection layer.

use thiserror::Error;

use crate::transport::protocol::RpcError;

/// Library result type.
pub type Result<T> = std::result::Result<T, AcpError>;

/// Everything that can go wrong on an ACP connection.
#[derive(Debug, Error)]
pub enum AcpError {
    /// A frame could not be parsed. The stream is considered corrupted.
    #[error("protocol error: {reason} (frame: {frame})")]
    Protocol {
        /// What was wrong with the frame.
        reason: String,
        /// A bounded preview of the offending bytes.
        frame: String,
    },

    /// The peer has no handler for the requested method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The peer's handler failed and returned a structured error.
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(RpcError),

    /// The connection shut down before the call could complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// The agent subprocess could not be started.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// Program that was being launched.
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure on the underlying byte stream.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A payload could not be serialized.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AcpError {
    /// Build a [`AcpError::Protocol`] with a bounded preview of `frame`.
    pub fn protocol(reason: impl Into<String>, frame: &[u8]) -> Self {
        Self::Protocol {
            reason: reason.into(),
            frame: preview(frame),
        }
    }

    /// Map an error response from the peer onto the call-site taxonomy.
    pub fn from_remote(err: RpcError) -> Self {
        if err.code == RpcError::METHOD_NOT_FOUND {
            // Prefer the bare method name carried in `data`.
            let method = match err.data {
                Some(serde_json::Value::String(method)) => method,
                _ => err.message,
            };
            Self::MethodNotFound(method)
        } else {
            Self::Remote(err)
        }
    }
}

/// Longest frame excerpt kept in a protocol error.
const PREVIEW_BYTES: usize = 256;

fn preview(frame: &[u8]) -> String {
    let text = String::from_utf8_lossy(&frame[..frame.len().min(PREVIEW_BYTES)]);
    if frame.len() > PREVIEW_BYTES {
        format!("{text}... ({} bytes)", frame.len())
    } else {
        text.into_owned()
    }
}
