use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::TransferError;
use crate::plan::Part;

/// Acknowledgement of one uploaded part, required to finalize the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    /// 1-based part number.
    pub number: u32,
    /// Opaque checksum or ETag returned by the store.
    pub etag: String,
}

/// Object made visible in the bucket by a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub etag: String,
    pub size: u64,
}

/// Lifecycle of a multipart session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No upload id issued yet.
    Uninitiated,
    /// Upload id issued, parts may be recorded.
    Initiated,
    /// Parts committed as one object.
    Completed,
    /// Failed; will never be completed. Parts may linger on the store.
    Abandoned,
    /// Abandoned and explicitly aborted on the store.
    Aborted,
}

/// Tracks one multipart transfer (thread-safe).
pub struct UploadSession {
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    key: String,
    upload_id: Option<String>,
    state: SessionState,
    parts: BTreeMap<u32, PartResult>,
    created_at: Instant,
}

impl SessionInner {
    fn not_active(&self, action: &str) -> TransferError {
        TransferError::SessionNotActive(format!(
            "cannot {action} for {} (upload id {}) in state {:?}",
            self.key,
            self.upload_id.as_deref().unwrap_or("none"),
            self.state
        ))
    }
}

impl UploadSession {
    /// Creates an uninitiated session for `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(SessionInner {
                key: key.into(),
                upload_id: None,
                state: SessionState::Uninitiated,
                parts: BTreeMap::new(),
                created_at: Instant::now(),
            }),
        }
    }

    /// Records the upload id issued by the store.
    pub fn initiated(&self, upload_id: impl Into<String>) -> Result<(), TransferError> {
        let mut s = self.inner.write().unwrap();
        if s.state != SessionState::Uninitiated {
            return Err(s.not_active("initiate"));
        }
        s.upload_id = Some(upload_id.into());
        s.state = SessionState::Initiated;
        Ok(())
    }

    /// Records a successfully uploaded part. A retried part replaces its
    /// earlier result.
    pub fn record_part(&self, result: PartResult) -> Result<(), TransferError> {
        let mut s = self.inner.write().unwrap();
        if s.state != SessionState::Initiated {
            return Err(s.not_active(&format!("record part {}", result.number)));
        }
        s.parts.insert(result.number, result);
        Ok(())
    }

    /// Returns recorded parts in ascending part-number order.
    pub fn completed_parts(&self) -> Vec<PartResult> {
        let s = self.inner.read().unwrap();
        s.parts.values().cloned().collect()
    }

    /// Returns the parts to send on completion, after checking that the
    /// recorded part numbers are exactly those of `planned`.
    pub fn parts_for_completion(&self, planned: &[Part]) -> Result<Vec<PartResult>, TransferError> {
        let s = self.inner.read().unwrap();
        let expected: BTreeSet<u32> = planned.iter().map(|p| p.number).collect();
        let recorded: BTreeSet<u32> = s.parts.keys().copied().collect();
        if expected.len() != planned.len() {
            return Err(TransferError::PartMismatch(
                "planned parts contain duplicate numbers".into(),
            ));
        }
        if expected != recorded {
            let missing: Vec<u32> = expected.difference(&recorded).copied().collect();
            let unexpected: Vec<u32> = recorded.difference(&expected).copied().collect();
            return Err(TransferError::PartMismatch(format!(
                "missing parts {missing:?}, unexpected parts {unexpected:?}"
            )));
        }
        Ok(s.parts.values().cloned().collect())
    }

    /// Marks the session as committed.
    pub fn complete(&self) -> Result<(), TransferError> {
        let mut s = self.inner.write().unwrap();
        if s.state != SessionState::Initiated {
            return Err(s.not_active("complete"));
        }
        s.state = SessionState::Completed;
        Ok(())
    }

    /// Marks the session as abandoned.
    ///
    /// Recorded parts are kept. Has no effect on finished sessions.
    pub fn abandon(&self) {
        let mut s = self.inner.write().unwrap();
        if matches!(s.state, SessionState::Uninitiated | SessionState::Initiated) {
            s.state = SessionState::Abandoned;
        }
    }

    /// Marks an abandoned session as aborted on the store.
    pub fn mark_aborted(&self) {
        let mut s = self.inner.write().unwrap();
        if s.state == SessionState::Abandoned {
            s.state = SessionState::Aborted;
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.inner.read().unwrap().state
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.inner.read().unwrap().created_at.elapsed()
    }
}
