//! Error types for the master node.
//!
//! Startup failures (`WatchError`, `AcceptorError`) are fatal and surface
//! through `LifecycleError`. `PipelineError` is scoped to one connection.

use std::{io, net::SocketAddr};

use cluster_core::RegistryError;
use http::StatusCode;
use thiserror::Error;

use crate::lifecycle::LifecycleState;

// ========== Membership ==========

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("coordination registry at {address} is unavailable: {source}")]
    RegistryUnavailable {
        address: String,
        #[source]
        source: RegistryError,
    },
}

// ========== Listener ==========

#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to create connection pool: {0}")]
    Pool(#[source] io::Error),

    #[error("listener task failed: {0}")]
    Join(String),
}

// ========== Per-connection ==========

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Status written back before the connection is closed.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            CodecError::Malformed(_) => Some(StatusCode::BAD_REQUEST),
            CodecError::HeadTooLarge { .. } => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            CodecError::Io(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("request of at least {received} bytes exceeds the {limit} byte limit")]
    RequestTooLarge { limit: usize, received: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Failure signal returned by a request handler.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    status: StatusCode,
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

// ========== Lifecycle ==========

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("membership watch failed to start: {0}")]
    Watch(#[source] WatchError),

    #[error("listener failed to start: {0}")]
    Listener(#[source] AcceptorError),

    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        state: LifecycleState,
        operation: &'static str,
    },
}
