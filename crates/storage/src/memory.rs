//! In-process [`StorageBackend`] with fault injection, for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use objput_transfer::{
    PartResult, ProgressListener, ProgressTracker, RemoteObject, Transfer, checksum_bytes,
};
use tokio::io::AsyncReadExt;

use crate::backend::{BackendFuture, MultipartUpload, PartBody, StorageBackend};
use crate::error::BackendError;

/// A backend call, as recorded by [`MemoryBucket::calls`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PutWhole { key: String, size: u64 },
    Initiate { key: String },
    UploadPart { upload_id: String, number: u32, size: u64 },
    Complete { upload_id: String, parts: Vec<u32> },
    Abort { upload_id: String },
}

#[derive(Default)]
struct Faults {
    put: bool,
    initiate: bool,
    complete: bool,
    parts: HashMap<u32, PartFault>,
    part_delay: Option<Duration>,
}

#[derive(Clone, Copy)]
enum PartFault {
    Permanent,
    Transient { remaining: u32 },
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
    calls: Vec<Call>,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

/// A bucket held entirely in memory.
#[derive(Default)]
pub struct MemoryBucket {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    next_upload: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `put_whole` fail.
    pub fn fail_put(&self) {
        self.faults.lock().unwrap().put = true;
    }

    /// Makes every `initiate_multipart` fail.
    pub fn fail_initiate(&self) {
        self.faults.lock().unwrap().initiate = true;
    }

    /// Makes every `complete_multipart` fail.
    pub fn fail_complete(&self) {
        self.faults.lock().unwrap().complete = true;
    }

    /// Makes every upload of part `number` fail with a permanent error.
    pub fn fail_part(&self, number: u32) {
        self.faults
            .lock()
            .unwrap()
            .parts
            .insert(number, PartFault::Permanent);
    }

    /// Makes the next `times` uploads of part `number` fail with a
    /// retryable error.
    pub fn fail_part_transiently(&self, number: u32, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .parts
            .insert(number, PartFault::Transient { remaining: times });
    }

    /// Holds every part upload for `delay` before reading its body.
    pub fn set_part_delay(&self, delay: Duration) {
        self.faults.lock().unwrap().part_delay = Some(delay);
    }

    /// Returns the committed content of `key`.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    /// Returns every call made so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of multipart uploads neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    /// Part numbers stored for a pending upload.
    pub fn uploaded_parts(&self, upload_id: &str) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Largest number of part uploads observed running at once.
    pub fn max_concurrent_parts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn part_fault(&self, number: u32) -> Option<BackendError> {
        let mut faults = self.faults.lock().unwrap();
        match faults.parts.get_mut(&number) {
            Some(PartFault::Permanent) => Some(access_denied()),
            Some(PartFault::Transient { remaining }) if *remaining > 0 => {
                *remaining -= 1;
                Some(BackendError::api(503, "SlowDown", "reduce request rate"))
            }
            _ => None,
        }
    }

    async fn upload_part_inner(
        &self,
        upload: &MultipartUpload,
        number: u32,
        body: PartBody,
        listener: Arc<dyn ProgressListener>,
    ) -> Result<PartResult, BackendError> {
        let delay = self.faults.lock().unwrap().part_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let size = body.size();
        let tracker = ProgressTracker::start(listener, Transfer::Part(number), size);
        let data = match read_body(&tracker, body).await {
            Ok(data) => data,
            Err(e) => {
                tracker.fail();
                return Err(e);
            }
        };
        if let Some(err) = self.part_fault(number) {
            tracker.fail();
            return Err(err);
        }

        let etag = format!("\"{}\"", checksum_bytes(&data));
        let mut state = self.state.lock().unwrap();
        let Some(pending) = state.uploads.get_mut(&upload.upload_id) else {
            drop(state);
            tracker.fail();
            return Err(no_such_upload(&upload.upload_id));
        };
        pending.parts.insert(number, (etag.clone(), data));
        drop(state);

        tracker.complete();
        Ok(PartResult { number, etag })
    }
}

async fn read_body(tracker: &ProgressTracker, body: PartBody) -> Result<Vec<u8>, BackendError> {
    let size = body.size();
    let mut data = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    tracker.reader(body.into_reader()).read_to_end(&mut data).await?;
    if data.len() as u64 != size {
        return Err(BackendError::api(
            400,
            "IncompleteBody",
            format!("expected {size} bytes, got {}", data.len()),
        ));
    }
    Ok(data)
}

fn access_denied() -> BackendError {
    BackendError::api(403, "AccessDenied", "access denied")
}

fn no_such_upload(upload_id: &str) -> BackendError {
    BackendError::api(404, "NoSuchUpload", format!("upload {upload_id} does not exist"))
}

/// Decrements the in-flight counter when a part upload ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StorageBackend for MemoryBucket {
    fn put_whole<'a>(
        &'a self,
        key: &'a str,
        body: PartBody,
        listener: Arc<dyn ProgressListener>,
    ) -> BackendFuture<'a, RemoteObject> {
        Box::pin(async move {
            let size = body.size();
            self.record(Call::PutWhole {
                key: key.to_string(),
                size,
            });

            let tracker = ProgressTracker::start(listener, Transfer::Whole, size);
            let data = match read_body(&tracker, body).await {
                Ok(data) => data,
                Err(e) => {
                    tracker.fail();
                    return Err(e);
                }
            };
            if self.faults.lock().unwrap().put {
                tracker.fail();
                return Err(access_denied());
            }

            let etag = format!("\"{}\"", checksum_bytes(&data));
            self.state
                .lock()
                .unwrap()
                .objects
                .insert(key.to_string(), data);
            tracker.complete();

            Ok(RemoteObject {
                key: key.to_string(),
                etag,
                size,
            })
        })
    }

    fn initiate_multipart<'a>(&'a self, key: &'a str) -> BackendFuture<'a, MultipartUpload> {
        Box::pin(async move {
            self.record(Call::Initiate {
                key: key.to_string(),
            });
            if self.faults.lock().unwrap().initiate {
                return Err(access_denied());
            }

            let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst) + 1);
            self.state.lock().unwrap().uploads.insert(
                upload_id.clone(),
                PendingUpload {
                    key: key.to_string(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(MultipartUpload {
                key: key.to_string(),
                upload_id,
            })
        })
    }

    fn upload_part<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        number: u32,
        body: PartBody,
        listener: Arc<dyn ProgressListener>,
    ) -> BackendFuture<'a, PartResult> {
        Box::pin(async move {
            self.record(Call::UploadPart {
                upload_id: upload.upload_id.clone(),
                number,
                size: body.size(),
            });

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            self.upload_part_inner(upload, number, body, listener).await
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        parts: &'a [PartResult],
    ) -> BackendFuture<'a, RemoteObject> {
        Box::pin(async move {
            self.record(Call::Complete {
                upload_id: upload.upload_id.clone(),
                parts: parts.iter().map(|p| p.number).collect(),
            });
            if self.faults.lock().unwrap().complete {
                return Err(BackendError::api(500, "InternalError", "complete failed"));
            }

            let mut state = self.state.lock().unwrap();
            let pending = state
                .uploads
                .get(&upload.upload_id)
                .ok_or_else(|| no_such_upload(&upload.upload_id))?;

            if parts.is_empty() || parts.windows(2).any(|w| w[0].number >= w[1].number) {
                return Err(BackendError::api(
                    400,
                    "InvalidPartOrder",
                    "parts must be listed in ascending order",
                ));
            }

            let mut data = Vec::new();
            for part in parts {
                match pending.parts.get(&part.number) {
                    Some((etag, bytes)) if *etag == part.etag => data.extend_from_slice(bytes),
                    _ => {
                        return Err(BackendError::api(
                            400,
                            "InvalidPart",
                            format!("part {} not found or etag mismatch", part.number),
                        ));
                    }
                }
            }

            let key = pending.key.clone();
            state.uploads.remove(&upload.upload_id);
            let size = data.len() as u64;
            let etag = format!("\"{}-{}\"", checksum_bytes(&data), parts.len());
            state.objects.insert(key.clone(), data);

            Ok(RemoteObject { key, etag, size })
        })
    }

    fn abort_multipart<'a>(&'a self, upload: &'a MultipartUpload) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.record(Call::Abort {
                upload_id: upload.upload_id.clone(),
            });
            self.state
                .lock()
                .unwrap()
                .uploads
                .remove(&upload.upload_id)
                .map(|_| ())
                .ok_or_else(|| no_such_upload(&upload.upload_id))
        })
    }
}
