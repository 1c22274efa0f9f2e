//! Multipart session driver.
//!
//! Pairs the store-side [`MultipartUpload`] with the local [`UploadSession`]
//! bookkeeping so that completion is only ever requested for exactly the
//! planned part set.

use std::path::Path;
use std::sync::Arc;

use objput_storage::{MultipartUpload, PartBody, StorageBackend};
use objput_transfer::{
    Part, PartResult, ProgressListener, RemoteObject, SessionState, UploadSession, open_part,
};
use tracing::{debug, info, warn};

use crate::config::{AbandonPolicy, RetryPolicy};
use crate::error::UploadError;
use crate::retry::with_retry;

/// One initiated multipart upload.
pub struct MultipartSession<'a> {
    backend: &'a dyn StorageBackend,
    retry: &'a RetryPolicy,
    upload: MultipartUpload,
    session: UploadSession,
}

impl<'a> MultipartSession<'a> {
    /// Starts a multipart upload for `key` on the store.
    pub async fn initiate(
        backend: &'a dyn StorageBackend,
        retry: &'a RetryPolicy,
        key: &str,
    ) -> Result<Self, UploadError> {
        let upload = backend.initiate_multipart(key).await?;
        let session = UploadSession::new(key);
        session.initiated(upload.upload_id.clone())?;

        info!(key, upload_id = %upload.upload_id, "multipart session initiated");

        Ok(Self {
            backend,
            retry,
            upload,
            session,
        })
    }

    /// Store-side handle of this upload.
    pub fn upload(&self) -> &MultipartUpload {
        &self.upload
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Uploads `part` of `source`, retrying transient failures.
    ///
    /// Every attempt opens its own reader positioned at the part's offset,
    /// so concurrent calls never share a file cursor.
    pub async fn upload_part(
        &self,
        part: &Part,
        source: &Path,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<PartResult, UploadError> {
        let part = *part;
        let what = format!("part {}", part.number);

        let result = with_retry(self.retry, &what, |_| {
            let listener = Arc::clone(&listener);
            async move {
                let reader = open_part(source, part.offset, part.size)
                    .await
                    .map_err(|e| UploadError::reading(source, e))?;
                let body = PartBody::new(reader, part.size);
                self.backend
                    .upload_part(&self.upload, part.number, body, listener)
                    .await
                    .map_err(|e| UploadError::sending(source, e))
            }
        })
        .await?;

        self.session.record_part(result.clone())?;
        debug!(
            key = %self.upload.key,
            part = part.number,
            size = part.size,
            etag = %result.etag,
            "part uploaded"
        );
        Ok(result)
    }

    /// Commits the upload after checking that the recorded parts are exactly
    /// `expected`. On a mismatch nothing is sent to the store.
    pub async fn complete(&self, expected: &[Part]) -> Result<RemoteObject, UploadError> {
        let parts = self
            .session
            .parts_for_completion(expected)
            .map_err(|e| UploadError::Invariant(e.to_string()))?;

        let object = self
            .backend
            .complete_multipart(&self.upload, &parts)
            .await?;
        self.session.complete()?;

        info!(
            key = %self.upload.key,
            upload_id = %self.upload.upload_id,
            parts = parts.len(),
            elapsed_secs = self.session.age().as_secs_f64(),
            "multipart session completed"
        );
        Ok(object)
    }

    /// Marks the session abandoned and applies `policy`.
    ///
    /// Abort failures are logged; the session then stays `Abandoned`.
    pub async fn abandon(&self, policy: AbandonPolicy, reason: &str) {
        self.session.abandon();
        if self.session.state() != SessionState::Abandoned {
            return;
        }

        match policy {
            AbandonPolicy::Keep => {
                warn!(
                    key = %self.upload.key,
                    upload_id = %self.upload.upload_id,
                    parts = self.session.completed_parts().len(),
                    elapsed_secs = self.session.age().as_secs_f64(),
                    reason,
                    "multipart session abandoned, parts left on store"
                );
            }
            AbandonPolicy::Abort => match self.backend.abort_multipart(&self.upload).await {
                Ok(()) => {
                    self.session.mark_aborted();
                    info!(
                        key = %self.upload.key,
                        upload_id = %self.upload.upload_id,
                        reason,
                        "multipart session aborted"
                    );
                }
                Err(e) => {
                    warn!(
                        key = %self.upload.key,
                        upload_id = %self.upload.upload_id,
                        error = %e,
                        "failed to abort multipart session"
                    );
                }
            },
        }
    }
}
