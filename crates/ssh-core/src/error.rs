use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in tunnel fabric operations
#[derive(Error, Debug)]
pub enum SshCoreError {
    /// Port outside 1-65535
    #[error("port must be a valid number between 1-65535: {0}")]
    InvalidPort(String),

    /// Rule that cannot be opened as written
    #[error("invalid rule {rule}: {message}")]
    InvalidRule { rule: String, message: String },

    /// Empty value where one is required
    #[error("{field} must not be empty")]
    EmptyValue { field: String },

    /// Secret referenced by an auth method but never resolved
    #[error("secret {0} not setup")]
    MissingSecret(String),

    /// Credentials or host key rejected
    #[error("authentication to {destination} failed: {message}")]
    AuthRejected { destination: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// Network binding failed
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Remote listen request refused by the peer
    #[error("peer refused to listen on {address}: {message}")]
    RemoteBindFailed { address: String, message: String },

    /// Connection failed
    #[error("failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Channel open through the control connection failed
    #[error("failed to open channel to {address}: {message}")]
    ChannelFailed { address: String, message: String },

    /// Dial did not resolve in time
    #[error("timed out after {timeout:?} connecting to {address}")]
    DialTimeout { address: String, timeout: Duration },

    /// Cancellation fired before the hop finished starting
    #[error("startup of {0} was cancelled")]
    Cancelled(String),

    /// Control connection is gone
    #[error("control connection to {0} is closed")]
    ControlClosed(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for SSH core operations
pub type SshResult<T> = Result<T, SshCoreError>;

/// Coarse failure classes; they decide how far a failure propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad rule, empty destination, missing credentials. Raised before any network action.
    Configuration,
    /// Credentials or host key rejected.
    Authentication,
    /// A listener could not be opened; startup of the hop is rolled back.
    Listen,
    /// Outbound dial failed; local to one accepted connection.
    Dial,
    /// Byte copy failed; local to one tunnel instance.
    Copy,
    /// The control connection itself failed.
    Transport,
}

impl SshCoreError {
    /// Create an invalid rule error
    pub fn invalid_rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Create an empty value error
    pub fn empty(field: impl Into<String>) -> Self {
        Self::EmptyValue { field: field.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPort(_) | Self::InvalidRule { .. } | Self::EmptyValue { .. } | Self::MissingSecret(_) => ErrorKind::Configuration,
            Self::AuthRejected { .. } => ErrorKind::Authentication,
            Self::BindFailed { .. } | Self::RemoteBindFailed { .. } => ErrorKind::Listen,
            Self::ConnectionFailed { .. } | Self::ChannelFailed { .. } | Self::DialTimeout { .. } => ErrorKind::Dial,
            Self::Io(_) => ErrorKind::Copy,
            Self::Ssh(_) | Self::Cancelled(_) | Self::ControlClosed(_) | Self::Other(_) => ErrorKind::Transport,
        }
    }
}
