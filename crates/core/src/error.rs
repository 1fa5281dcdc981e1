//! Errors raised by the core codecs and the type registry.
//!
//! Every variant here describes a deployment or schema mismatch, never a transient condition:
//! callers surface them immediately instead of retrying.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The object's apiVersion/kind was never registered.
    #[error("type {api_version}/{kind} is not registered")]
    UnregisteredType { api_version: String, kind: String },

    /// The group/kind was never registered.
    #[error("group kind {0} is not registered")]
    UnregisteredGroupKind(String),

    /// The object carries no apiVersion/kind, so it cannot be identified.
    #[error("object {name:?} has no apiVersion/kind")]
    MissingTypeMeta { name: Option<String> },

    /// The object has no metadata.name.
    #[error("{kind} object has no metadata.name")]
    MissingName { kind: String },

    /// The ownership data stored on a dependent cannot be decoded.
    #[error("malformed owner claim on {object}: {reason}")]
    CorruptClaim { object: String, reason: String },

    /// A well-known field holds a value of the wrong shape.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn corrupt_claim(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptClaim { object: object.into(), reason: reason.into() }
    }

    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField { field: field.into(), reason: reason.into() }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
