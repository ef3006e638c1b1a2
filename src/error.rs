//! Errors surfaced by the prober.
//!
//! Only `CredentialUnavailable` and `InvalidServerUri` abort a run. An
//! `OfferCreationFailed` is contained to the server it happened on and still
//! produces a verdict.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The credential source was unreachable or answered with a non-success status.
    #[error("credentials unavailable: {0}")]
    CredentialUnavailable(String),

    /// The negotiation engine could not open a session for this server.
    #[error("offer creation failed for {server}: {reason}")]
    OfferCreationFailed { server: String, reason: String },

    #[error("invalid server URI {uri:?}: {reason}")]
    InvalidServerUri { uri: String, reason: String },
}

impl ProbeError {
    pub fn offer_failed(server: &str, reason: impl std::fmt::Display) -> Self {
        ProbeError::OfferCreationFailed {
            server: server.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_uri(uri: &str, reason: impl Into<String>) -> Self {
        ProbeError::InvalidServerUri {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;
