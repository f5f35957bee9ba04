//! Error types for the watchdog control loop.

use thiserror::Error;

/// Errors raised by the watchdog components and their collaborators.
#[derive(Error, Debug)]
pub enum WatchdogError {
    /// Target resource does not exist (pod deleted, register not yet created).
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// Create raced with another writer that created the object first.
    #[error("{resource} already exists")]
    AlreadyExists { resource: String },

    /// Any other cluster API failure.
    #[error("cluster API error during {operation}: {message}")]
    Cluster { operation: String, message: String },

    /// The certificate generator could not produce new CA material.
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// Rotated credentials could not be written to the secret backend.
    #[error("failed to persist rotated credentials: {0}")]
    SecretPersistence(String),

    /// A rolling restart in the restart sequence failed.
    #[error("rolling restart of {target} failed: {source}")]
    Restart {
        target: String,
        #[source]
        source: Box<WatchdogError>,
    },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, WatchdogError>;

impl WatchdogError {
    /// Map a `kube` client error, folding 404 and 409 into dedicated variants.
    pub fn from_kube(operation: impl Into<String>, resource: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref response) if response.code == 404 => Self::NotFound {
                resource: resource.to_string(),
            },
            kube::Error::Api(ref response) if response.code == 409 => Self::AlreadyExists {
                resource: resource.to_string(),
            },
            other => Self::Cluster {
                operation: operation.into(),
                message: other.to_string(),
            },
        }
    }

    /// True when the target resource was missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when another attempt could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cluster { .. } | Self::SecretPersistence(_) | Self::Io(_) => true,
            Self::Restart { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Stable label used as a structured logging field.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "conflict",
            Self::Cluster { .. } => "cluster_api",
            Self::CertificateGeneration(_) => "certificate_generation",
            Self::SecretPersistence(_) => "secret_persistence",
            Self::Restart { .. } => "restart",
            Self::Config(_) => "configuration",
            Self::Io(_) => "io",
        }
    }
}
