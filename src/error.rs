//! Error types for the discovery server

use thiserror::Error;

/// Main error type for discovery server operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration supplied at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS material could not be loaded or parsed
    #[error("tls error: {0}")]
    Tls(String),

    /// Workload identity documents failed validation
    #[error("workload identity error: {0}")]
    WorkloadIdentity(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A reconciler panicked and was recovered by the watch engine
    #[error("recovered panic: {0}")]
    Panic(String),

    /// A reconcile did not finish within its deadline
    #[error("reconcile deadline exceeded after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a TLS error with the given message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a workload identity error with the given message
    pub fn workload_identity(msg: impl Into<String>) -> Self {
        Self::WorkloadIdentity(msg.into())
    }
}
