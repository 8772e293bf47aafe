use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{CaptureError, RetrievalError};
use crate::transport::RemotePath;

/// Identity recorded when a device exposes no readable serial number.
pub const UNKNOWN_SERIAL: &str = "unknown_serial";

/// A reachable device as seen by one discovery pass, before any session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub name: String,
    pub address: String,
}

impl DeviceDescriptor {
    /// 1-based id used for the session opened from this descriptor.
    pub fn session_id(&self) -> usize {
        self.index + 1
    }
}

/// Outcome of one device's capture in a trigger round.
#[derive(Debug)]
pub struct CaptureResult {
    pub session_id: usize,
    /// Monotonic time at which the capture call returned. The shutter itself
    /// fired somewhere between gate release and this instant.
    pub captured_at: Option<Instant>,
    /// `captured_at` relative to the gate opening.
    pub offset: Option<Duration>,
    pub outcome: Result<RemotePath, CaptureError>,
}

impl CaptureResult {
    pub fn captured(session_id: usize, remote: RemotePath, at: Instant, gate_opened_at: Instant) -> Self {
        Self {
            session_id,
            captured_at: Some(at),
            offset: Some(at.saturating_duration_since(gate_opened_at)),
            outcome: Ok(remote),
        }
    }

    pub fn failed(session_id: usize, error: CaptureError) -> Self {
        Self {
            session_id,
            captured_at: None,
            offset: None,
            outcome: Err(error),
        }
    }

    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn remote_path(&self) -> Option<&RemotePath> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&CaptureError> {
        self.outcome.as_ref().err()
    }

    /// Copy of a successful result. Failures hold errors that can't be cloned.
    pub fn success_copy(&self) -> Option<Self> {
        let remote = self.remote_path()?.clone();
        Some(Self {
            session_id: self.session_id,
            captured_at: self.captured_at,
            offset: self.offset,
            outcome: Ok(remote),
        })
    }

    /// Whether the capture returned later than `timeout` after the gate opened.
    pub fn later_than(&self, timeout: Duration) -> bool {
        self.offset.map_or(false, |offset| offset > timeout)
    }
}

/// Outcome of fetching one captured file to local storage.
#[derive(Debug)]
pub struct RetrievedFile {
    pub session_id: usize,
    pub local_path: PathBuf,
    pub elapsed: Duration,
    /// Bytes written on success.
    pub outcome: Result<u64, RetrievalError>,
}

impl RetrievedFile {
    pub fn byte_size(&self) -> Option<u64> {
        self.outcome.as_ref().ok().copied()
    }

    pub fn error(&self) -> Option<&RetrievalError> {
        self.outcome.as_ref().err()
    }
}
