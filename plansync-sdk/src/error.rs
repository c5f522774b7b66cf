//! Error taxonomy for the sync SDK.
//!
//! Transport problems recover locally (reconnect or fallback) and surface
//! only through the status signal; these variants exist for the paths where
//! the caller genuinely needs to know: a publish that was dropped, a service
//! call that failed, a payload that would not decode.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The underlying transport rejected an operation.
    #[error("transport error: {0}")]
    Transport(String),

    /// Publish attempted while the link is down. Nothing was buffered;
    /// the message is gone and the caller decides what to do about it.
    #[error("not connected; message to '{topic}' was dropped")]
    NotConnected { topic: String },

    /// A payload could not be encoded or decoded as JSON.
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The authoritative service answered with a non-success status.
    #[error("service error ({status}): {message}")]
    Service { status: u16, message: String },

    /// The HTTP call itself failed (connect, timeout, body).
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The connection driver task is gone (after `disconnect`).
    #[error("connection closed")]
    LinkClosed,
}
