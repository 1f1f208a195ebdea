use thiserror::Error;

use crate::config::LoadError;
use crate::replay::ReplayError;

/// Failures of the secondary persistent tier.
#[derive(Debug, Error)]
pub enum BackingStoreError {
    #[error("backing store unavailable: {message}")]
    Unavailable { message: String },
    #[error("backing store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backing store record is malformed: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("backing store record is corrupt: {message}")]
    Corrupt { message: String },
}

impl BackingStoreError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// The stored record can never be read back; deleting it is the only fix.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Codec(_) | Self::Corrupt { .. })
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Errors surfaced by cache writes.
///
/// The in-memory effect of the operation has already been applied whenever
/// one of these is returned.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("backing store unavailable during `{op}`")]
    BackingStoreUnavailable {
        op: &'static str,
        #[source]
        source: BackingStoreError,
    },
    #[error("failed to encode value for persistence: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CacheError {
    pub fn backing(op: &'static str, source: BackingStoreError) -> Self {
        Self::BackingStoreUnavailable { op, source }
    }
}

/// Top-level error of the `tagcache` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Backing(#[from] BackingStoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    Argument(String),
}

impl AppError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument(message.into())
    }
}
