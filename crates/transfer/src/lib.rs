//! Part planning, progress tracking and session bookkeeping for object uploads.
//!
//! This crate has no knowledge of any particular object store. The storage
//! crate builds request bodies on top of [`PartReader`] and [`ProgressTracker`],
//! and the upload crate drives [`plan`] and [`UploadSession`].

mod chunked;
mod plan;
mod progress;
mod session;
mod validation;

pub use chunked::{PartReader, checksum_bytes, open_part};
pub use plan::{Part, part_count, plan};
pub use progress::{
    AggregateProgress, NoProgress, ProgressEvent, ProgressListener, ProgressReader,
    ProgressSnapshot, ProgressTracker, SpeedCalculator, Transfer,
};
pub use session::{PartResult, RemoteObject, SessionState, UploadSession};
pub use validation::validate_object_key;

/// Default part size and simple-upload threshold: 1 GiB.
pub const DEFAULT_PART_SIZE: u64 = 1 << 30;

/// Largest number of parts a single multipart upload may carry.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Read buffer used when streaming a part body (256 KiB).
pub const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid part plan: {0}")]
    InvalidPlan(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("session not active: {0}")]
    SessionNotActive(String),

    #[error("part set mismatch: {0}")]
    PartMismatch(String),
}
