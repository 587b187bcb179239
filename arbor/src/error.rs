//! Error types for each layer of the crate.
//!
//! Library code returns these typed errors; the binary and the connection
//! plumbing wrap them in `anyhow` when they only need to be logged.

use thiserror::Error;

/// Failures while turning envelopes into wire frames or back.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("cannot encode envelope of unknown kind {0}")]
    UnknownKind(u8),
    #[error("{kind} envelope is missing required field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures surfaced by the stream actors in [`crate::io`].
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("no tokio runtime available to drive the stream")]
    NoRuntime,
    #[error("refusing to write invalid envelope: {0}")]
    InvalidInput(String),
    #[error("stream reached end of input")]
    Eof,
    #[error("malformed envelope, hanging up: {0}")]
    Malformed(String),
    #[error("stream is no longer being served")]
    Stopped,
    #[error("stream already closed")]
    AlreadyClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether the actor behind this stream has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamError::Eof
                | StreamError::Malformed(_)
                | StreamError::Stopped
                | StreamError::AlreadyClosed
                | StreamError::Io(_)
        )
    }
}

/// Reasons the tree refuses a message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("message has an empty id")]
    MissingId,
    #[error("message {0} would make its own ancestry cyclic")]
    Cycle(String),
    #[error("message {id} is already stored under parent {parent:?}")]
    Reparent { id: String, parent: String },
}

/// A peer sink could not accept a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer outbound queue is full")]
    Full,
    #[error("peer is closed")]
    Closed,
}
