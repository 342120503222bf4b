// SPDX-License-Identifier: MIT
//! Error taxonomy for the client.
//!
//! Every fallible operation in the crate returns [`Error`]. The set is closed:
//! callers can match exhaustively and the meaning of each kind is stable.
//! Kinds that originate on the wire (`-ERR` lines, handshake rejections) carry
//! the server's text so diagnostics survive the round-trip.

use std::time::Duration;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by connection, subscription and request operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A protocol line could not be parsed, or the server sent something
    /// unexpected for the current state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Network communication failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was attempted on a closed connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// No server in the pool could be reached.
    #[error("no server available for connection")]
    NoServer,

    /// The server stopped answering PINGs within the allowed window.
    #[error("stale connection")]
    StaleConnection,

    /// The client is configured for TLS but the server does not offer it.
    #[error("secure connection wanted, server does not support TLS")]
    SecureWanted,

    /// The server requires TLS but the client has no TLS configuration.
    #[error("secure connection required by server")]
    SecureRequired,

    /// The connection was lost. Depending on options it may reconnect.
    #[error("connection disconnected")]
    Disconnected,

    /// The server rejected our credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The server denied the action (permissions violation).
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// Empty subject, or a subject containing whitespace or control bytes.
    #[error("invalid subject")]
    InvalidSubject,

    /// An argument was out of range or otherwise unusable.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// The subscription has been closed or unsubscribed.
    #[error("invalid subscription")]
    InvalidSubscription,

    /// Timeouts must be positive.
    #[error("invalid timeout")]
    InvalidTimeout,

    /// The call is not valid in the current mode, e.g. `next_msg` on an
    /// asynchronous subscription.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// The subscription's pending queue exceeded its limits and messages
    /// were dropped.
    #[error("slow consumer, messages dropped")]
    SlowConsumer,

    /// Payload exceeds the server-advertised maximum.
    #[error("payload of {size} bytes exceeds server maximum of {max}")]
    MaxPayload { size: usize, max: usize },

    /// The auto-unsubscribe limit has been reached; no more messages will be
    /// delivered.
    #[error("maximum delivered messages reached")]
    MaxDelivered,

    /// The pending-publish buffer is full; the publish was rejected.
    #[error("reconnect buffer exhausted")]
    InsufficientBuffer,

    /// An allocation-backed resource could not grow.
    #[error("out of memory")]
    NoMemory,

    /// The operation did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// TLS negotiation failed.
    #[error("tls error: {0}")]
    Ssl(String),

    /// The server does not implement what the client asked for (e.g. echo
    /// suppression on an old protocol version).
    #[error("feature not supported by server: {0}")]
    NoServerSupport(&'static str),

    /// Initial connect failed but `retry_on_failed_connect` is set; the
    /// connection keeps trying in the background.
    #[error("not yet connected")]
    NotYetConnected,

    /// The connection or subscription is draining; the operation is refused.
    #[error("draining in progress")]
    Draining,

    /// Queue group names must be non-empty single tokens.
    #[error("invalid queue name")]
    InvalidQueueName,
}

impl Error {
    /// Maps a server `-ERR` text to the matching error kind.
    ///
    /// The server sends a small set of well-known phrases; everything else is
    /// a protocol-level failure carrying the raw text.
    pub(crate) fn from_server_err(text: &str) -> Error {
        let lower = text.to_ascii_lowercase();
        if lower.contains("authorization violation")
            || lower.contains("authentication")
            || lower.contains("user authentication")
        {
            Error::AuthFailed(text.to_string())
        } else if lower.contains("permissions violation") {
            Error::NotPermitted(text.to_string())
        } else if lower.contains("stale connection") {
            Error::StaleConnection
        } else {
            Error::Protocol(text.to_string())
        }
    }

}
