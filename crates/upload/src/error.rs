//! Upload error types.

use std::path::{Path, PathBuf};

use objput_storage::BackendError;
use objput_transfer::TransferError;

/// Errors produced by an upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("cancelled")]
    Cancelled,

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// Broad classification of an [`UploadError`], used for exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    LocalIo,
    Backend,
    Invariant,
    Cancelled,
}

impl UploadError {
    /// Wraps an I/O error on `path`.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Converts a transfer error raised while reading `path`, keeping the
    /// path on I/O failures.
    pub(crate) fn reading(path: &Path, err: TransferError) -> Self {
        match err {
            TransferError::Io(source) => Self::io(path, source),
            other => Self::Transfer(other),
        }
    }

    /// Converts a backend error raised while sending `path`. A failure to
    /// read the local file while the body streamed becomes [`Self::Io`].
    pub(crate) fn sending(path: &Path, err: BackendError) -> Self {
        match err {
            BackendError::Io(source) => Self::io(path, source),
            other => Self::Backend(other),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::FileNotFound(_) | Self::Io { .. } => ErrorKind::LocalIo,
            Self::Backend(BackendError::Io(_)) => ErrorKind::LocalIo,
            Self::Backend(_) => ErrorKind::Backend,
            Self::Invariant(_) => ErrorKind::Invariant,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Transfer(e) => match e {
                TransferError::Io(_) => ErrorKind::LocalIo,
                TransferError::InvalidPlan(_) | TransferError::InvalidKey(_) => {
                    ErrorKind::Configuration
                }
                TransferError::SessionNotActive(_) | TransferError::PartMismatch(_) => {
                    ErrorKind::Invariant
                }
            },
        }
    }

    /// Returns `true` for backend failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_transient())
    }
}
