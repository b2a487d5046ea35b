use std::path::PathBuf;
use thiserror::Error;

/// A specialized `Result` type for ADB operations.
pub type AdbResult<T> = Result<T, AdbError>;

/// Coarse classification used by the bootstrap lifecycle to decide how an
/// attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    ProtocolViolation,
    AuthenticationRejected,
    KeyGenerationFailed,
}

/// The error type for all ADB-related operations.
#[derive(Debug, Error)]
pub enum AdbError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport I/O failed while {stage}: {source}")]
    Transport {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("ADB protocol violation: {description}")]
    ProtocolViolation { description: String },

    #[error("Device rejected our signature. The key must be trusted before wireless start can work.")]
    AuthenticationRejected,

    #[error("Failed to create or persist ADB key: {description}")]
    KeyGenerationFailed { description: String },

    #[error("ADB key store at {path:?} is unusable: {source}")]
    KeyStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to determine home directory for ADB key")]
    HomeDirectoryNotFound,

    #[error("STLS upgrade failed: {description}")]
    TlsFailed { description: String },

    #[error("Stream '{destination}' rejected by device")]
    StreamRejected { destination: String },

    #[error("A shell stream is already open on this connection")]
    StreamBusy,

    #[error("Not connected")]
    NotConnected,
}

impl AdbError {
    pub(crate) fn transport(stage: &'static str, source: std::io::Error) -> Self {
        AdbError::Transport { stage, source }
    }

    pub(crate) fn violation(description: impl Into<String>) -> Self {
        AdbError::ProtocolViolation {
            description: description.into(),
        }
    }

    pub(crate) fn key_failure(description: impl std::fmt::Display) -> Self {
        AdbError::KeyGenerationFailed {
            description: description.to_string(),
        }
    }

    /// Maps the error onto the bootstrap failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            AdbError::ConnectFailed { .. }
            | AdbError::Transport { .. }
            | AdbError::TlsFailed { .. }
            | AdbError::NotConnected => FailureKind::Transport,
            AdbError::ProtocolViolation { .. }
            | AdbError::StreamRejected { .. }
            | AdbError::StreamBusy => FailureKind::ProtocolViolation,
            AdbError::AuthenticationRejected => FailureKind::AuthenticationRejected,
            AdbError::KeyGenerationFailed { .. }
            | AdbError::KeyStore { .. }
            | AdbError::HomeDirectoryNotFound => FailureKind::KeyGenerationFailed,
        }
    }

    /// Whether the connection that produced this error can no longer be used.
    pub fn poisons_connection(&self) -> bool {
        !matches!(self, AdbError::StreamRejected { .. } | AdbError::StreamBusy)
    }
}
