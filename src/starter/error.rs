use crate::adb::{AdbError, FailureKind};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type StarterResult<T> = Result<T, StarterError>;

/// Failure classes a finished attempt is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CapabilityMissing,
    DiscoveryTimeout,
    KeyGenerationFailed,
    AuthenticationRejected,
    TransportError,
    ProtocolViolation,
    Platform,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StarterError {
    #[error("Permission to write secure settings is not granted")]
    CapabilityMissing,

    #[error("No wireless debugging port discovered within {waited:?}")]
    DiscoveryTimeout { waited: Duration },

    #[error(transparent)]
    Adb(#[from] AdbError),

    #[error("Platform operation '{operation}' failed: {description}")]
    Platform {
        operation: &'static str,
        description: String,
    },

    #[error("Invalid configuration in {path:?}: {description}")]
    Config { path: PathBuf, description: String },

    #[error("Bootstrap cancelled before it finished")]
    Cancelled,

    #[error("Attempt worker panicked or was cancelled: {source}")]
    JoinError {
        #[from]
        source: tokio::task::JoinError,
    },
}

impl StarterError {
    pub(crate) fn platform(operation: &'static str, description: impl std::fmt::Display) -> Self {
        StarterError::Platform {
            operation,
            description: description.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StarterError::CapabilityMissing => ErrorKind::CapabilityMissing,
            StarterError::DiscoveryTimeout { .. } => ErrorKind::DiscoveryTimeout,
            StarterError::Adb(e) => match e.kind() {
                FailureKind::Transport => ErrorKind::TransportError,
                FailureKind::ProtocolViolation => ErrorKind::ProtocolViolation,
                FailureKind::AuthenticationRejected => ErrorKind::AuthenticationRejected,
                FailureKind::KeyGenerationFailed => ErrorKind::KeyGenerationFailed,
            },
            StarterError::Platform { .. } | StarterError::Config { .. } => ErrorKind::Platform,
            StarterError::Cancelled => ErrorKind::Cancelled,
            StarterError::JoinError { .. } => ErrorKind::TransportError,
        }
    }
}
