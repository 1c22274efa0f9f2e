use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, ReadBuf};

/// Which transfer call a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transfer {
    /// Single-request upload of the whole file.
    Whole,
    /// One part of a multipart upload, by sequence number.
    Part(u32),
}

/// Byte counts carried by every progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub transfer: Transfer,
    pub consumed_bytes: u64,
    pub total_bytes: u64,
}

/// Lifecycle event of one tracked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    Started(ProgressSnapshot),
    DataTransferred(ProgressSnapshot),
    Completed(ProgressSnapshot),
    Failed(ProgressSnapshot),
}

impl ProgressEvent {
    /// Returns the byte counts of this event.
    pub fn snapshot(&self) -> &ProgressSnapshot {
        match self {
            Self::Started(s) | Self::DataTransferred(s) | Self::Completed(s) | Self::Failed(s) => s,
        }
    }

    /// Percentage of the transfer consumed so far, 0..=100.
    ///
    /// An empty transfer reports 100.
    pub fn percent(&self) -> u64 {
        let s = self.snapshot();
        if s.total_bytes == 0 {
            return 100;
        }
        (s.consumed_bytes.min(s.total_bytes) as u128 * 100 / s.total_bytes as u128) as u64
    }

    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// Receives progress events from whichever transfer call is in flight.
///
/// Called synchronously from the transfer's I/O path, so implementations
/// must return quickly and must not panic.
pub trait ProgressListener: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Listener that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressListener for NoProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

// ---------------------------------------------------------------------------
// ProgressTracker
// ---------------------------------------------------------------------------

/// Tracks one transfer call and enforces the event lifecycle.
///
/// `Started` is emitted on construction. Exactly one of `Completed` or
/// `Failed` is emitted afterwards: explicitly through [`complete`](Self::complete)
/// or [`fail`](Self::fail), or as `Failed` when the tracker is dropped
/// unfinished (for example when the request future is cancelled).
pub struct ProgressTracker {
    listener: Arc<dyn ProgressListener>,
    transfer: Transfer,
    total: u64,
    consumed: Arc<AtomicU64>,
    finished: bool,
}

impl ProgressTracker {
    /// Begins tracking and emits `Started`.
    pub fn start(listener: Arc<dyn ProgressListener>, transfer: Transfer, total: u64) -> Self {
        listener.on_event(&ProgressEvent::Started(ProgressSnapshot {
            transfer,
            consumed_bytes: 0,
            total_bytes: total,
        }));
        Self {
            listener,
            transfer,
            total,
            consumed: Arc::new(AtomicU64::new(0)),
            finished: false,
        }
    }

    /// Wraps the request body so every read is reported as `DataTransferred`.
    pub fn reader<R>(&self, inner: R) -> ProgressReader<R> {
        ProgressReader {
            inner,
            listener: Arc::clone(&self.listener),
            transfer: self.transfer,
            total: self.total,
            consumed: Arc::clone(&self.consumed),
        }
    }

    /// Bytes consumed so far by readers created from this tracker.
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Emits `Completed`.
    pub fn complete(mut self) {
        self.finish(true);
    }

    /// Emits `Failed`.
    pub fn fail(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, ok: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let snapshot = ProgressSnapshot {
            transfer: self.transfer,
            consumed_bytes: self.consumed(),
            total_bytes: self.total,
        };
        let event = if ok {
            ProgressEvent::Completed(snapshot)
        } else {
            ProgressEvent::Failed(snapshot)
        };
        self.listener.on_event(&event);
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.finish(false);
    }
}

// ---------------------------------------------------------------------------
// ProgressReader
// ---------------------------------------------------------------------------

/// `AsyncRead` adapter that reports consumed bytes to a listener.
pub struct ProgressReader<R> {
    inner: R,
    listener: Arc<dyn ProgressListener>,
    transfer: Transfer,
    total: u64,
    consumed: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                let consumed = self.consumed.fetch_add(n, Ordering::AcqRel) + n;
                self.listener
                    .on_event(&ProgressEvent::DataTransferred(ProgressSnapshot {
                        transfer: self.transfer,
                        consumed_bytes: consumed,
                        total_bytes: self.total,
                    }));
            }
        }
        poll
    }
}

// ---------------------------------------------------------------------------
// AggregateProgress
// ---------------------------------------------------------------------------

/// Forwards events to an inner listener while keeping a file-wide byte count.
///
/// Part events may interleave when parts upload concurrently. Bytes of a
/// failed transfer are subtracted again so a retried part is not counted twice.
pub struct AggregateProgress {
    inner: Arc<dyn ProgressListener>,
    uploaded: AtomicU64,
    per_transfer: Mutex<HashMap<Transfer, u64>>,
}

impl AggregateProgress {
    /// Creates an aggregate that forwards to `inner`.
    pub fn new(inner: Arc<dyn ProgressListener>) -> Self {
        Self {
            inner,
            uploaded: AtomicU64::new(0),
            per_transfer: Mutex::new(HashMap::new()),
        }
    }

    /// Bytes of the file sent so far across all transfers.
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded.load(Ordering::Acquire)
    }
}

impl ProgressListener for AggregateProgress {
    fn on_event(&self, event: &ProgressEvent) {
        {
            let mut seen = self.per_transfer.lock().unwrap();
            match event {
                ProgressEvent::Started(s) => {
                    if let Some(stale) = seen.insert(s.transfer, 0) {
                        self.uploaded.fetch_sub(stale, Ordering::AcqRel);
                    }
                }
                ProgressEvent::DataTransferred(s) => {
                    let prev = seen.entry(s.transfer).or_insert(0);
                    if s.consumed_bytes > *prev {
                        self.uploaded
                            .fetch_add(s.consumed_bytes - *prev, Ordering::AcqRel);
                        *prev = s.consumed_bytes;
                    }
                }
                ProgressEvent::Failed(s) => {
                    if let Some(sent) = seen.remove(&s.transfer) {
                        self.uploaded.fetch_sub(sent, Ordering::AcqRel);
                    }
                }
                ProgressEvent::Completed(_) => {}
            }
        }
        self.inner.on_event(event);
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        if s.samples.len() < 2 {
            return 0.0;
        }

        let first = &s.samples[0];
        let last = &s.samples[s.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        // Bytes of the first sample were sent before the window opened.
        let total_bytes: u64 = s.samples[1..].iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }
}
