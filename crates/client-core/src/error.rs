use hc_types::ConfigError;
use ssh_core::{SshCoreError, topology::TopologyError};
use thiserror::Error;

/// Errors that can occur in client-core operations
#[derive(Error, Debug)]
pub enum ClientError {
    /// Configuration file could not be loaded or validated
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// SSH error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Host key verification failed
    #[error("host key verification failed: {0}")]
    HostKeyFailed(String),

    /// Cryptographic error
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// A secret could not be resolved
    #[error("secret {name}: {message}")]
    Secret { name: String, message: String },

    /// Tunnel fabric error
    #[error(transparent)]
    Fabric(#[from] SshCoreError),

    /// No hop came up
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for client-core operations
pub type ClientResult<T> = Result<T, ClientError>;

// Handler and auth failures surface through the fabric's transport seam.
impl From<ClientError> for SshCoreError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Fabric(inner) => inner,
            ClientError::Ssh(inner) => SshCoreError::Ssh(inner),
            ClientError::Io(inner) => SshCoreError::Io(inner),
            other => SshCoreError::Other(other.to_string()),
        }
    }
}
