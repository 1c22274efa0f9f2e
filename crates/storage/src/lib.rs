//! Object store access for objput.
//!
//! [`StorageBackend`] is the capability the upload orchestrator depends on.
//! [`Bucket`] talks to S3-compatible stores (Aliyun OSS, MinIO, AWS) through
//! `aws-sdk-s3`; [`MemoryBucket`] keeps everything in process.

mod backend;
mod bucket;
mod client;
mod error;
mod memory;

use std::time::Duration;

pub use backend::{BackendFuture, MultipartUpload, PartBody, StorageBackend};
pub use bucket::Bucket;
pub use client::{Client, Credentials};
pub use error::BackendError;
pub use memory::{Call, MemoryBucket};

/// Region used for signing when none is configured.
pub const DEFAULT_REGION: &str = "us-east-1";

/// TCP connect timeout for store requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
