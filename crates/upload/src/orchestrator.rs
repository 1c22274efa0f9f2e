//! Upload orchestrator: picks simple or multipart upload by file size.

use std::path::Path;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use objput_storage::{PartBody, StorageBackend};
use objput_transfer::{
    AggregateProgress, NoProgress, Part, ProgressListener, RemoteObject, open_part, plan,
    validate_object_key,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::multipart::MultipartSession;
use crate::retry::with_retry;

/// How an object was uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One request carrying the whole file.
    Simple,
    /// A multipart session with this many parts.
    Multipart { parts: usize },
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub object: RemoteObject,
    pub strategy: Strategy,
    /// Bytes sent in the attempts that succeeded.
    pub bytes_uploaded: u64,
}

/// Uploads local files to one storage backend.
pub struct UploadOrchestrator {
    backend: Arc<dyn StorageBackend>,
    config: UploadConfig,
    listener: Arc<dyn ProgressListener>,
    cancel: CancellationToken,
}

impl UploadOrchestrator {
    /// Creates an orchestrator that reports no progress.
    pub fn new(backend: Arc<dyn StorageBackend>, config: UploadConfig) -> Self {
        Self {
            backend,
            config,
            listener: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    /// Sends progress events of every transfer to `listener`.
    pub fn with_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Returns a cancellation token for uploads run by this orchestrator.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads `local_path` as `key`.
    ///
    /// Files up to the configured threshold go in one request; larger files
    /// are split into parts. On failure no object is reported and a started
    /// multipart session is abandoned.
    pub async fn upload(&self, local_path: &Path, key: &str) -> Result<UploadOutcome, UploadError> {
        self.config.validate()?;
        validate_object_key(key).map_err(|e| UploadError::Config(e.to_string()))?;
        self.check_cancelled()?;

        let size = file_size(local_path).await?;
        let progress = Arc::new(AggregateProgress::new(Arc::clone(&self.listener)));
        let listener: Arc<dyn ProgressListener> = progress.clone();

        let (object, strategy) = if size <= self.config.threshold {
            info!(
                file = %local_path.display(),
                key,
                size,
                threshold = self.config.threshold,
                "uploading in a single request"
            );
            let object = self.upload_simple(local_path, key, size, listener).await?;
            (object, Strategy::Simple)
        } else {
            let parts = plan(size, self.config.part_size)?;
            info!(
                file = %local_path.display(),
                key,
                size,
                parts = parts.len(),
                part_size = self.config.part_size,
                concurrency = self.config.concurrency,
                "uploading in parts"
            );
            let object = self
                .upload_multipart(local_path, key, &parts, listener)
                .await?;
            (
                RemoteObject { size, ..object },
                Strategy::Multipart { parts: parts.len() },
            )
        };

        info!(key, etag = %object.etag, size, "upload completed");
        Ok(UploadOutcome {
            object,
            strategy,
            bytes_uploaded: progress.uploaded_bytes(),
        })
    }

    async fn upload_simple(
        &self,
        path: &Path,
        key: &str,
        size: u64,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<RemoteObject, UploadError> {
        let put = with_retry(&self.config.retry, "object", |_| {
            let listener = Arc::clone(&listener);
            async move {
                let reader = open_part(path, 0, size)
                    .await
                    .map_err(|e| UploadError::reading(path, e))?;
                let body = PartBody::new(reader, size);
                self.backend
                    .put_whole(key, body, listener)
                    .await
                    .map_err(|e| UploadError::sending(path, e))
            }
        });

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
            r = put => r,
        };
        if let Err(e) = &result {
            error!(key, error = %e, "upload failed");
        }
        result
    }

    async fn upload_multipart(
        &self,
        path: &Path,
        key: &str,
        parts: &[Part],
        listener: Arc<dyn ProgressListener>,
    ) -> Result<RemoteObject, UploadError> {
        let session = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(UploadError::Cancelled),
            s = MultipartSession::initiate(self.backend.as_ref(), &self.config.retry, key) => s?,
        };

        let uploaded = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
            r = self.upload_parts(&session, path, parts, listener) => r,
        };

        let result = match uploaded.and_then(|()| self.check_cancelled()) {
            Ok(()) => session.complete(parts).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!(
                key,
                upload_id = %session.upload().upload_id,
                error = %e,
                "multipart upload failed"
            );
            session.abandon(self.config.abandon, &e.to_string()).await;
        }
        result
    }

    /// Uploads `parts` with at most `concurrency` in flight, in ascending
    /// order of scheduling. The first failure stops scheduling and drops the
    /// transfers still running.
    async fn upload_parts(
        &self,
        session: &MultipartSession<'_>,
        path: &Path,
        parts: &[Part],
        listener: Arc<dyn ProgressListener>,
    ) -> Result<(), UploadError> {
        let mut pending = stream::iter(parts)
            .map(|part| session.upload_part(part, path, Arc::clone(&listener)))
            .buffer_unordered(self.config.concurrency);

        while let Some(result) = pending.next().await {
            result?;
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), UploadError> {
        if self.cancel.is_cancelled() {
            Err(UploadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Returns the size of the regular file at `path`.
async fn file_size(path: &Path) -> Result<u64, UploadError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            UploadError::FileNotFound(path.to_path_buf())
        } else {
            UploadError::io(path, e)
        }
    })?;
    if !metadata.is_file() {
        return Err(UploadError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    Ok(metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AbandonPolicy, RetryPolicy};
    use crate::error::ErrorKind;
    use objput_storage::{Call, MemoryBucket};
    use objput_transfer::{ProgressEvent, Transfer};
    use std::sync::Mutex;
    use std::time::Duration;

    fn config(threshold: u64, part_size: u64) -> UploadConfig {
        UploadConfig {
            threshold,
            part_size,
            concurrency: 1,
            retry: RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::ZERO,
                ..Default::default()
            },
            abandon: AbandonPolicy::Abort,
        }
    }

    fn source(len: usize) -> (tempfile::TempDir, std::path::PathBuf, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        (dir, path, data)
    }

    fn recorder() -> (Arc<Mutex<Vec<ProgressEvent>>>, Arc<dyn ProgressListener>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let listener: Arc<dyn ProgressListener> =
            Arc::new(move |e: &ProgressEvent| sink.lock().unwrap().push(e.clone()));
        (events, listener)
    }

    fn count(calls: &[Call], pred: impl Fn(&Call) -> bool) -> usize {
        calls.iter().filter(|c| pred(c)).count()
    }

    #[tokio::test]
    async fn file_at_threshold_is_simple() {
        let (_dir, path, data) = source(100);
        let bucket = Arc::new(MemoryBucket::new());
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 40));

        let outcome = orch.upload(&path, "exact.bin").await.unwrap();

        assert_eq!(outcome.strategy, Strategy::Simple);
        assert_eq!(outcome.object.size, 100);
        assert_eq!(outcome.bytes_uploaded, 100);
        assert_eq!(bucket.object("exact.bin").unwrap(), data);
        assert_eq!(
            bucket.calls(),
            vec![Call::PutWhole {
                key: "exact.bin".into(),
                size: 100
            }]
        );
    }

    #[tokio::test]
    async fn file_one_byte_over_threshold_is_multipart() {
        let (_dir, path, data) = source(101);
        let bucket = Arc::new(MemoryBucket::new());
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));

        let outcome = orch.upload(&path, "over.bin").await.unwrap();

        assert_eq!(outcome.strategy, Strategy::Multipart { parts: 2 });
        assert_eq!(outcome.object.size, 101);
        assert_eq!(bucket.object("over.bin").unwrap(), data);

        let calls = bucket.calls();
        assert!(calls.contains(&Call::UploadPart {
            upload_id: "upload-1".into(),
            number: 2,
            size: 1
        }));
    }

    #[tokio::test]
    async fn small_file_single_put_reports_full_progress() {
        let (_dir, path, _data) = source(50);
        let bucket = Arc::new(MemoryBucket::new());
        let (events, listener) = recorder();
        let orch =
            UploadOrchestrator::new(bucket.clone(), config(100, 40)).with_listener(listener);

        orch.upload(&path, "small.bin").await.unwrap();

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(ProgressEvent::Started(_))));
        let last = events.last().unwrap();
        assert!(matches!(last, ProgressEvent::Completed(_)));
        assert_eq!(last.snapshot().transfer, Transfer::Whole);
        assert_eq!(last.percent(), 100);
        assert!(!bucket.calls().iter().any(|c| matches!(c, Call::Initiate { .. })));
    }

    #[tokio::test]
    async fn large_file_splits_into_ordered_parts() {
        // Scaled version of 2.5 GiB with 1 GiB parts.
        let (_dir, path, data) = source(250);
        let bucket = Arc::new(MemoryBucket::new());
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));

        let outcome = orch.upload(&path, "big.bin").await.unwrap();

        assert_eq!(outcome.strategy, Strategy::Multipart { parts: 3 });
        assert_eq!(outcome.bytes_uploaded, 250);
        assert_eq!(bucket.object("big.bin").unwrap(), data);

        let calls = bucket.calls();
        let sizes: Vec<(u32, u64)> = calls
            .iter()
            .filter_map(|c| match c {
                Call::UploadPart { number, size, .. } => Some((*number, *size)),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![(1, 100), (2, 100), (3, 50)]);
        assert!(calls.contains(&Call::Complete {
            upload_id: "upload-1".into(),
            parts: vec![1, 2, 3]
        }));
        assert_eq!(bucket.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn failed_part_stops_upload_and_aborts_session() {
        let (_dir, path, _data) = source(250);
        let bucket = Arc::new(MemoryBucket::new());
        bucket.fail_part(2);
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));

        let err = orch.upload(&path, "big.bin").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Backend);
        let calls = bucket.calls();
        assert_eq!(
            count(&calls, |c| matches!(c, Call::UploadPart { number: 3, .. })),
            0
        );
        assert_eq!(count(&calls, |c| matches!(c, Call::Complete { .. })), 0);
        assert_eq!(count(&calls, |c| matches!(c, Call::Abort { .. })), 1);
        assert!(bucket.object("big.bin").is_none());
        assert_eq!(bucket.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn failed_part_with_keep_policy_leaves_session() {
        let (_dir, path, _data) = source(250);
        let bucket = Arc::new(MemoryBucket::new());
        bucket.fail_part(2);
        let mut cfg = config(100, 100);
        cfg.abandon = AbandonPolicy::Keep;
        let orch = UploadOrchestrator::new(bucket.clone(), cfg);

        orch.upload(&path, "big.bin").await.unwrap_err();

        assert_eq!(bucket.pending_uploads(), 1);
        assert_eq!(bucket.uploaded_parts("upload-1"), vec![1]);
        assert!(
            !bucket
                .calls()
                .iter()
                .any(|c| matches!(c, Call::Abort { .. } | Call::Complete { .. }))
        );
    }

    #[tokio::test]
    async fn failed_part_emits_failed_event_for_that_part() {
        let (_dir, path, _data) = source(250);
        let bucket = Arc::new(MemoryBucket::new());
        bucket.fail_part(2);
        let (events, listener) = recorder();
        let orch =
            UploadOrchestrator::new(bucket.clone(), config(100, 100)).with_listener(listener);

        orch.upload(&path, "big.bin").await.unwrap_err();

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(e,
            ProgressEvent::Completed(s) if s.transfer == Transfer::Part(1))));
        assert!(events.iter().any(|e| matches!(e,
            ProgressEvent::Failed(s) if s.transfer == Transfer::Part(2))));
        assert!(
            !events
                .iter()
                .any(|e| e.snapshot().transfer == Transfer::Part(3))
        );
    }

    #[tokio::test]
    async fn transient_part_failure_is_retried() {
        let (_dir, path, data) = source(250);
        let bucket = Arc::new(MemoryBucket::new());
        bucket.fail_part_transiently(2, 1);
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));

        let outcome = orch.upload(&path, "big.bin").await.unwrap();

        assert_eq!(bucket.object("big.bin").unwrap(), data);
        assert_eq!(outcome.bytes_uploaded, 250);
        assert_eq!(
            count(&bucket.calls(), |c| matches!(c, Call::UploadPart { number: 2, .. })),
            2
        );
    }

    #[tokio::test]
    async fn complete_failure_abandons_session() {
        let (_dir, path, _data) = source(250);
        let bucket = Arc::new(MemoryBucket::new());
        bucket.fail_complete();
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));

        let err = orch.upload(&path, "big.bin").await.unwrap_err();

        assert!(matches!(err, UploadError::Backend(_)));
        assert_eq!(
            count(&bucket.calls(), |c| matches!(c, Call::Abort { .. })),
            1
        );
        assert!(bucket.object("big.bin").is_none());
    }

    #[tokio::test]
    async fn concurrent_parts_are_bounded() {
        let (_dir, path, data) = source(1000);
        let bucket = Arc::new(MemoryBucket::new());
        bucket.set_part_delay(Duration::from_millis(20));
        let mut cfg = config(100, 100);
        cfg.concurrency = 3;
        let orch = UploadOrchestrator::new(bucket.clone(), cfg);

        let outcome = orch.upload(&path, "big.bin").await.unwrap();

        assert_eq!(outcome.strategy, Strategy::Multipart { parts: 10 });
        assert_eq!(bucket.object("big.bin").unwrap(), data);
        assert!(bucket.max_concurrent_parts() <= 3);
        assert!(bucket.max_concurrent_parts() > 1);
    }

    #[tokio::test]
    async fn sequential_upload_never_overlaps_parts() {
        let (_dir, path, _data) = source(300);
        let bucket = Arc::new(MemoryBucket::new());
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));

        orch.upload(&path, "big.bin").await.unwrap();

        assert_eq!(bucket.max_concurrent_parts(), 1);
    }

    #[tokio::test]
    async fn cancellation_abandons_session() {
        let (_dir, path, _data) = source(250);
        let bucket = Arc::new(MemoryBucket::new());
        bucket.set_part_delay(Duration::from_secs(30));
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));
        let cancel = orch.cancel_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = orch.upload(&path, "big.bin").await.unwrap_err();

        assert!(matches!(err, UploadError::Cancelled));
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let calls = bucket.calls();
        assert_eq!(count(&calls, |c| matches!(c, Call::Complete { .. })), 0);
        assert_eq!(count(&calls, |c| matches!(c, Call::Abort { .. })), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_touches_nothing() {
        let (_dir, path, _data) = source(10);
        let bucket = Arc::new(MemoryBucket::new());
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));
        orch.cancel_token().cancel();

        let err = orch.upload(&path, "a.bin").await.unwrap_err();

        assert!(matches!(err, UploadError::Cancelled));
        assert!(bucket.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_reported_before_any_call() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = Arc::new(MemoryBucket::new());
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));

        let err = orch
            .upload(&dir.path().join("missing.bin"), "a.bin")
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::FileNotFound(_)));
        assert_eq!(err.kind(), ErrorKind::LocalIo);
        assert!(bucket.calls().is_empty());
    }

    #[tokio::test]
    async fn directory_is_not_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = Arc::new(MemoryBucket::new());
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));

        let err = orch.upload(dir.path(), "a.bin").await.unwrap_err();

        assert!(matches!(err, UploadError::Io { .. }));
        assert!(bucket.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_key_and_config_are_rejected() {
        let (_dir, path, _data) = source(10);
        let bucket = Arc::new(MemoryBucket::new());

        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));
        let err = orch.upload(&path, "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let orch = UploadOrchestrator::new(bucket.clone(), config(0, 100));
        let err = orch.upload(&path, "a.bin").await.unwrap_err();
        assert!(matches!(err, UploadError::Config(_)));

        assert!(bucket.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_file_is_a_simple_upload() {
        let (_dir, path, _data) = source(0);
        let bucket = Arc::new(MemoryBucket::new());
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));

        let outcome = orch.upload(&path, "empty.bin").await.unwrap();

        assert_eq!(outcome.strategy, Strategy::Simple);
        assert_eq!(bucket.object("empty.bin").unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn failed_simple_upload_reports_no_object() {
        let (_dir, path, _data) = source(10);
        let bucket = Arc::new(MemoryBucket::new());
        bucket.fail_put();
        let orch = UploadOrchestrator::new(bucket.clone(), config(100, 100));

        let err = orch.upload(&path, "a.bin").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(bucket.object("a.bin").is_none());
    }

    #[tokio::test]
    async fn aggregate_progress_is_monotonic_without_failures() {
        let (_dir, path, _data) = source(1000);
        let bucket = Arc::new(MemoryBucket::new());
        let (events, listener) = recorder();
        let mut cfg = config(100, 100);
        cfg.concurrency = 4;
        let orch = UploadOrchestrator::new(bucket.clone(), cfg).with_listener(listener);

        orch.upload(&path, "big.bin").await.unwrap();

        // Per part, consumed bytes never decrease.
        let events = events.lock().unwrap();
        let mut last = std::collections::HashMap::new();
        for e in events.iter() {
            let s = e.snapshot();
            let prev = last.insert(s.transfer, s.consumed_bytes).unwrap_or(0);
            assert!(s.consumed_bytes >= prev);
        }
        let completed = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Completed(_)))
            .count();
        assert_eq!(completed, 10);
    }
}
