//! Storage backend capability consumed by the upload orchestrator.
//!
//! The orchestrator only sees [`StorageBackend`]. [`Bucket`](crate::Bucket)
//! implements it on `aws-sdk-s3` and [`MemoryBucket`](crate::MemoryBucket) in
//! process, which keeps orchestration logic testable without a network.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use objput_transfer::{PartResult, ProgressListener, RemoteObject};
use tokio::io::AsyncRead;

use crate::error::BackendError;

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Handle of an initiated multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    /// Destination object key.
    pub key: String,
    /// Store-issued session id.
    pub upload_id: String,
}

/// Request body of a transfer call: a reader plus its exact length.
pub struct PartBody {
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    size: u64,
}

impl PartBody {
    /// Wraps a reader that yields exactly `size` bytes.
    pub fn new(reader: impl AsyncRead + Send + Sync + Unpin + 'static, size: u64) -> Self {
        Self {
            reader: Box::new(reader),
            size,
        }
    }

    /// Builds a body from an in-memory buffer.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self::new(std::io::Cursor::new(data), size)
    }

    /// Length of the body in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Consumes the body and returns its reader.
    pub fn into_reader(self) -> Box<dyn AsyncRead + Send + Sync + Unpin> {
        self.reader
    }
}

impl fmt::Debug for PartBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartBody").field("size", &self.size).finish()
    }
}

/// Abstract object store bucket.
///
/// Every transfer call reports progress to `listener` through a
/// [`ProgressTracker`](objput_transfer::ProgressTracker): `Started`, zero or
/// more `DataTransferred`, then exactly one of `Completed` / `Failed`.
pub trait StorageBackend: Send + Sync {
    /// Uploads a whole object in a single request.
    fn put_whole<'a>(
        &'a self,
        key: &'a str,
        body: PartBody,
        listener: Arc<dyn ProgressListener>,
    ) -> BackendFuture<'a, RemoteObject>;

    /// Starts a multipart upload for `key`.
    fn initiate_multipart<'a>(&'a self, key: &'a str) -> BackendFuture<'a, MultipartUpload>;

    /// Uploads one part of an initiated upload.
    fn upload_part<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        number: u32,
        body: PartBody,
        listener: Arc<dyn ProgressListener>,
    ) -> BackendFuture<'a, PartResult>;

    /// Commits `parts` (sorted by number) as one object.
    fn complete_multipart<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        parts: &'a [PartResult],
    ) -> BackendFuture<'a, RemoteObject>;

    /// Discards an upload and any parts stored for it.
    fn abort_multipart<'a>(&'a self, upload: &'a MultipartUpload) -> BackendFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn body_from_bytes_reports_size() {
        let body = PartBody::from_bytes(b"hello".to_vec());
        assert_eq!(body.size(), 5);
        assert_eq!(format!("{body:?}"), "PartBody { size: 5 }");

        let mut out = Vec::new();
        body.into_reader().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }
}
