//! Error types for relaying to upstream servers

use thiserror::Error;

/// A destination address that cannot be used
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("destination '{0}' has no host")]
    EmptyHost(String),

    #[error("destination '{address}' has an invalid port '{port}'")]
    InvalidPort { address: String, port: String },
}

/// Why a single delivery attempt to one upstream failed
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid mailbox '{address}': {source}")]
    Mailbox {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    #[error("cannot build envelope: {0}")]
    Envelope(#[from] lettre::error::Error),

    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("delivery cancelled by shutdown")]
    Cancelled,
}

/// The primary upstream did not accept the message
#[derive(Error, Debug)]
#[error("primary relay to {target} failed: {source}")]
pub struct PrimaryRelayError {
    pub target: String,
    #[source]
    pub source: RelayError,
}
