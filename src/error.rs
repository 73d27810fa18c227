//! Error types for the failover engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

use crate::options::RejectReason;

/// Errors that can occur during failover operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or state files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed failover message.
    ///
    /// Covers framing violations, options overrunning the message,
    /// duplicate options and wrong lengths for fixed-size options. Fatal to
    /// the connection that produced it, never to the relationship.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer's request was refused with a reject reason.
    #[error("Rejected ({reason}): {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    #[error("Socket error: {0}")]
    Socket(String),

    /// No relationship with the given name is configured.
    #[error("Unknown failover relationship: {0}")]
    UnknownRelationship(String),

    /// No lease exists for the given address.
    #[error("No lease for address {0}")]
    LeaseNotFound(Ipv4Addr),

    /// A state or lease write could not be made durable.
    ///
    /// The in-memory change that required it has been rolled back.
    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl Error {
    /// Shorthand for building a [`Error::Rejected`].
    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        Error::Rejected {
            reason,
            message: message.into(),
        }
    }
}

/// A specialized Result type for failover operations.
pub type Result<T> = std::result::Result<T, Error>;
