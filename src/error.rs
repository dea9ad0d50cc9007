//! Error types for the Atelier operator

use thiserror::Error;

/// Main error type for Atelier operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for environment specs
    #[error("validation error: {0}")]
    Validation(String),

    /// External DNS provider error
    #[error("dns error: {0}")]
    Dns(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Finalizer bookkeeping error during reconciliation
    #[error("finalizer error: {0}")]
    Finalizer(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a DNS error with the given message
    pub fn dns(msg: impl Into<String>) -> Self {
        Self::Dns(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a finalizer error with the given message
    pub fn finalizer(msg: impl Into<String>) -> Self {
        Self::Finalizer(msg.into())
    }

    /// Returns true for conflict responses from the cluster (object
    /// already exists). Creation treats these as success.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Returns true for not-found responses from the cluster. Deletion
    /// treats these as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(e)) if e.code == 404)
    }
}
