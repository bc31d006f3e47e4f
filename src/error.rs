//! Error types for attachment uploads
//!
//! Every failure the engine can produce is classified here. The retry
//! policy in the runner and the manager is driven entirely by these
//! variants, so callers should not need to inspect HTTP details.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for upload operations
pub type Result<T> = std::result::Result<T, UploadError>;

/// How a failed transfer should be recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Keep the session, query progress and continue from the accepted offset.
    /// `Some(delay)` is a server-mandated delay; `None` uses local backoff.
    Resume(Option<Duration>),

    /// Discard the session, form and metadata and start a new session.
    Restart(Option<Duration>),

    /// The retry budget is spent; the upload record is dropped.
    NoMoreRetries,
}

impl Recovery {
    /// Server-provided delay, if any
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Resume(delay) | Self::Restart(delay) => *delay,
            Self::NoMoreRetries => None,
        }
    }
}

/// Upload error types
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid upload URL: {0}")]
    InvalidUploadUrl(String),

    #[error("Upload failed (recovery: {recovery:?})")]
    UploadFailure { recovery: Recovery },

    #[error("Missing file: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Network timeout")]
    NetworkTimeout,

    #[error("Unexpected status code: {0}")]
    UnexpectedStatusCode(u16),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Attachment cannot be uploaded: {0}")]
    NotUploadable(String),

    #[error("Unsupported CDN number: {0}")]
    UnsupportedCdn(u32),

    #[error("Copy source object not found")]
    SourceObjectNotFound,

    #[error("Invalid upload form: {0}")]
    InvalidForm(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl UploadError {
    /// Shorthand for a resumable failure
    pub fn resume(delay: Option<Duration>) -> Self {
        Self::UploadFailure {
            recovery: Recovery::Resume(delay),
        }
    }

    /// Shorthand for a restart-classified failure
    pub fn restart(delay: Option<Duration>) -> Self {
        Self::UploadFailure {
            recovery: Recovery::Restart(delay),
        }
    }

    /// Shorthand for a terminal failure
    pub fn no_more_retries() -> Self {
        Self::UploadFailure {
            recovery: Recovery::NoMoreRetries,
        }
    }

    /// Transient transport errors. These never count against the
    /// persisted attempt counter.
    pub fn is_network_failure_or_timeout(&self) -> bool {
        matches!(self, Self::NetworkFailure(_) | Self::NetworkTimeout)
    }

    /// Protocol failures that mean the remote session is presumed corrupted.
    ///
    /// Unexpected status codes and malformed session URLs are folded in here:
    /// retrying them inside the same session cannot succeed.
    pub fn is_restart(&self) -> bool {
        matches!(
            self,
            Self::UploadFailure {
                recovery: Recovery::Restart(_)
            } | Self::UnexpectedStatusCode(_)
                | Self::InvalidUploadUrl(_)
        )
    }

    /// Whether a later call may succeed.
    ///
    /// This is the only classification callers outside the engine should
    /// rely on; everything else is internal retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkFailure(_)
            | Self::NetworkTimeout
            | Self::Cancelled
            | Self::SourceObjectNotFound
            | Self::Database(_)
            | Self::Io(_) => true,
            Self::UploadFailure { recovery } => !matches!(recovery, Recovery::NoMoreRetries),
            Self::InvalidUploadUrl(_) | Self::UnexpectedStatusCode(_) => true,
            Self::MissingFile(_)
            | Self::NotUploadable(_)
            | Self::UnsupportedCdn(_)
            | Self::InvalidForm(_)
            | Self::Serialization(_)
            | Self::Unknown(_) => false,
        }
    }

    /// Cloneable copy used to fan a shared upload result out to waiters.
    ///
    /// Classified variants are preserved; wrapped library errors collapse
    /// into `Unknown` with their message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::InvalidUploadUrl(url) => Self::InvalidUploadUrl(url.clone()),
            Self::UploadFailure { recovery } => Self::UploadFailure {
                recovery: *recovery,
            },
            Self::MissingFile(path) => Self::MissingFile(path.clone()),
            Self::NetworkFailure(msg) => Self::NetworkFailure(msg.clone()),
            Self::NetworkTimeout => Self::NetworkTimeout,
            Self::UnexpectedStatusCode(code) => Self::UnexpectedStatusCode(*code),
            Self::Cancelled => Self::Cancelled,
            Self::NotUploadable(msg) => Self::NotUploadable(msg.clone()),
            Self::UnsupportedCdn(cdn) => Self::UnsupportedCdn(*cdn),
            Self::SourceObjectNotFound => Self::SourceObjectNotFound,
            Self::InvalidForm(msg) => Self::InvalidForm(msg.clone()),
            Self::Database(e) => Self::Unknown(format!("database: {}", e)),
            Self::Io(e) => Self::Unknown(format!("io: {}", e)),
            Self::Serialization(e) => Self::Unknown(format!("serialization: {}", e)),
            Self::Unknown(msg) => Self::Unknown(msg.clone()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
