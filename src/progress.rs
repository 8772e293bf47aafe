use std::time::Duration;

use crate::error::SessionError;
use crate::model::{CaptureResult, DeviceDescriptor, RetrievedFile};

/// Trait for reporting rig progress.
///
/// The CLI implements it with indicatif spinners. All methods have default
/// no-op implementations. Calls always come from the coordinating thread,
/// never from device workers.
pub trait RigReporter: Send + Sync {
    fn on_discovery_complete(&self, _devices: &[DeviceDescriptor]) {}
    fn on_open_start(&self, _total: usize) {}
    /// `Ok` carries the device identity.
    fn on_device_opened(&self, _descriptor: &DeviceDescriptor, _outcome: Result<&str, &SessionError>) {}
    fn on_armed(&self, _workers: usize) {}
    fn on_gate_open(&self, _workers: usize) {}
    fn on_device_captured(&self, _result: &CaptureResult) {}
    fn on_device_retrieved(&self, _file: &RetrievedFile) {}
    fn on_round_complete(&self, _elapsed: Duration) {}
    fn on_teardown_complete(&self, _closed: usize, _failed: usize) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl RigReporter for SilentReporter {}
