use std::time::Duration;

use thiserror::Error;
use workspace_model::SessionId;

use crate::messages::{RequestId, PROTOCOL_VERSION};

/// Failure to hand a frame to the underlying connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport failure: {message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("{operation} request {request_id} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        request_id: RequestId,
        timeout: Duration,
    },

    #[error("session '{0}' does not exist on the server")]
    SessionNotFound(SessionId),

    #[error("session '{session_id}' cannot be attached: {message}")]
    SessionUnattachable {
        session_id: SessionId,
        message: String,
    },

    #[error("server rejected the session request: {0}")]
    SessionRejected(String),

    #[error("workspace request failed: {0}")]
    Workspace(String),

    #[error("server speaks protocol version {found}; this client speaks {}", PROTOCOL_VERSION)]
    ProtocolMismatch { found: u64 },

    #[error("unexpected {response} response to {operation}")]
    UnexpectedResponse {
        operation: &'static str,
        response: &'static str,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection to the server is closed")]
    Closed,

    #[error("malformed frame: {0}")]
    Codec(String),
}

impl SyncError {
    /// Errors after which the server may still be reachable.
    #[must_use]
    pub fn is_server_reachable(&self) -> bool {
        !matches!(self, Self::Timeout { .. } | Self::Transport(_) | Self::Closed)
    }
}
