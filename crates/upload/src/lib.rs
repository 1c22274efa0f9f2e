//! Upload orchestration: simple or multipart, by file size.
//!
//! [`UploadOrchestrator`] stats the source file, sends it in one request when
//! it fits under the configured threshold and otherwise drives a
//! [`MultipartSession`]: plan, initiate, upload parts (sequentially or with a
//! bounded worker pool), verify, complete. Any failure abandons the session.

pub mod config;
pub mod error;
pub mod multipart;
pub mod orchestrator;
mod retry;

pub use config::{AbandonPolicy, RetryPolicy, UploadConfig};
pub use error::{ErrorKind, UploadError};
pub use multipart::MultipartSession;
pub use orchestrator::{Strategy, UploadOrchestrator, UploadOutcome};
