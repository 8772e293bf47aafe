use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{ConfigTree, PortBinding, PortEntry, RemotePath, Transport, TransportError};

const REMOTE_FOLDER: &str = "/store_00010001/DCIM/100SIMUL";

/// Protocol step at which a simulated device reports an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailStage {
    Init,
    Config,
    Clock,
    Capture,
    Fetch,
    Close,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatedDeviceConfig {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub serial: Option<String>,
    /// Free-text summary. Generated from the name when absent.
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub capture_latency_ms: u64,
    #[serde(default)]
    pub fetch_latency_ms: u64,
    #[serde(default = "default_payload_bytes")]
    pub payload_bytes: usize,
    #[serde(default)]
    pub fail: Vec<FailStage>,
}

fn default_payload_bytes() -> usize {
    4096
}

impl SimulatedDeviceConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            serial: None,
            summary: None,
            capture_latency_ms: 0,
            fetch_latency_ms: 0,
            payload_bytes: default_payload_bytes(),
            fail: Vec::new(),
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_capture_latency(mut self, latency: Duration) -> Self {
        self.capture_latency_ms = latency.as_millis() as u64;
        self
    }

    pub fn with_fetch_latency(mut self, latency: Duration) -> Self {
        self.fetch_latency_ms = latency.as_millis() as u64;
        self
    }

    pub fn with_payload_bytes(mut self, bytes: usize) -> Self {
        self.payload_bytes = bytes;
        self
    }

    pub fn failing_at(mut self, stage: FailStage) -> Self {
        self.fail.push(stage);
        self
    }

    fn fails_at(&self, stage: FailStage) -> bool {
        self.fail.contains(&stage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Init,
    WriteValue,
    Capture,
    Fetch,
    Close,
}

/// Timing of one driver call, for asserting ordering and concurrency.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub address: String,
    pub call: Call,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug)]
pub struct SimHandle {
    slot: usize,
    address: String,
    initialized: bool,
    captured: Vec<RemotePath>,
}

/// In-process driver standing in for real USB cameras.
///
/// Latencies are served with `thread::sleep` so concurrent callers overlap the
/// way blocking driver calls would.
#[derive(Debug, Default)]
pub struct SimulatedTransport {
    devices: Vec<SimulatedDeviceConfig>,
    enumerate_error: Option<String>,
    detached: Mutex<HashSet<String>>,
    calls: Mutex<Vec<CallRecord>>,
    live_handles: AtomicUsize,
}

impl SimulatedTransport {
    pub fn new(devices: Vec<SimulatedDeviceConfig>) -> Self {
        Self {
            devices,
            ..Self::default()
        }
    }

    /// `count` well-behaved devices with distinct serials.
    pub fn generated(count: usize) -> Self {
        let devices = (1..=count)
            .map(|i| {
                SimulatedDeviceConfig::new(
                    format!("Simulated Camera #{}", i),
                    format!("usb:001,{:03}", i + 3),
                )
                .with_serial(format!("SIM{:06}", i))
                .with_capture_latency(Duration::from_millis(40 + 15 * i as u64))
                .with_fetch_latency(Duration::from_millis(120))
            })
            .collect();
        Self::new(devices)
    }

    pub fn failing_enumeration(message: impl Into<String>) -> Self {
        Self {
            enumerate_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Simulates unplugging a device after discovery.
    pub fn detach(&self, address: &str) {
        self.detached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string());
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_of(&self, call: Call) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|record| record.call == call)
            .collect()
    }

    /// Handles bound and not yet closed.
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }

    fn device(&self, handle: &SimHandle) -> &SimulatedDeviceConfig {
        &self.devices[handle.slot]
    }

    fn record(&self, address: &str, call: Call, started: Instant) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CallRecord {
                address: address.to_string(),
                call,
                started,
                finished: Instant::now(),
            });
    }

    fn require_initialized(handle: &SimHandle) -> Result<(), TransportError> {
        if handle.initialized {
            Ok(())
        } else {
            Err(TransportError::Protocol(format!(
                "{} used before init",
                handle.address
            )))
        }
    }
}

fn generated_summary(device: &SimulatedDeviceConfig) -> String {
    format!(
        "Manufacturer: Simulated\nModel: {}\n  Version: 1.0\nVendor Extension ID: 0x0 (1.0)\n",
        device.name
    )
}

impl Transport for SimulatedTransport {
    type Handle = SimHandle;

    fn enumerate(&self) -> Result<Vec<PortEntry>, TransportError> {
        if let Some(message) = &self.enumerate_error {
            return Err(TransportError::Protocol(message.clone()));
        }
        if self.devices.is_empty() {
            return Err(TransportError::ModelNotFound);
        }
        Ok(self
            .devices
            .iter()
            .map(|device| PortEntry {
                name: device.name.clone(),
                address: device.address.clone(),
            })
            .collect())
    }

    fn lookup(&self, address: &str) -> Result<PortBinding, TransportError> {
        let detached = self.detached.lock().unwrap_or_else(PoisonError::into_inner);
        if detached.contains(address) {
            return Err(TransportError::NotFound(format!("port {}", address)));
        }
        self.devices
            .iter()
            .position(|device| device.address == address)
            .map(|port_index| PortBinding {
                address: address.to_string(),
                port_index,
            })
            .ok_or_else(|| TransportError::NotFound(format!("port {}", address)))
    }

    fn bind(&self, binding: &PortBinding) -> Result<SimHandle, TransportError> {
        if binding.port_index >= self.devices.len() {
            return Err(TransportError::NotFound(format!("port {}", binding.address)));
        }
        self.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok(SimHandle {
            slot: binding.port_index,
            address: binding.address.clone(),
            initialized: false,
            captured: Vec::new(),
        })
    }

    fn init(&self, handle: &mut SimHandle) -> Result<(), TransportError> {
        let started = Instant::now();
        let result = if self.device(handle).fails_at(FailStage::Init) {
            Err(TransportError::PermissionDenied(format!(
                "could not claim {}",
                handle.address
            )))
        } else {
            handle.initialized = true;
            Ok(())
        };
        self.record(&handle.address, Call::Init, started);
        result
    }

    fn read_config(&self, handle: &mut SimHandle) -> Result<ConfigTree, TransportError> {
        Self::require_initialized(handle)?;
        let device = self.device(handle);
        if device.fails_at(FailStage::Config) {
            return Err(TransportError::NotSupported("config tree".to_string()));
        }
        let mut tree = ConfigTree::new().with_value("cameramodel", device.name.as_str());
        if let Some(serial) = &device.serial {
            tree = tree.with_value("serialnumber", serial.as_str());
        }
        if !device.fails_at(FailStage::Clock) {
            tree = tree.with_value("datetime", "0");
        }
        Ok(tree)
    }

    fn read_summary(&self, handle: &mut SimHandle) -> Result<String, TransportError> {
        Self::require_initialized(handle)?;
        let device = self.device(handle);
        if device.fails_at(FailStage::Config) {
            return Err(TransportError::NotSupported("summary".to_string()));
        }
        Ok(device
            .summary
            .clone()
            .unwrap_or_else(|| generated_summary(device)))
    }

    fn write_value(
        &self,
        handle: &mut SimHandle,
        key: &str,
        value: &str,
    ) -> Result<(), TransportError> {
        Self::require_initialized(handle)?;
        let started = Instant::now();
        let result = if key != "datetime" || self.device(handle).fails_at(FailStage::Clock) {
            Err(TransportError::NotSupported(format!("widget '{}'", key)))
        } else {
            trace!("{}: {} = {}", handle.address, key, value);
            Ok(())
        };
        self.record(&handle.address, Call::WriteValue, started);
        result
    }

    fn capture(&self, handle: &mut SimHandle) -> Result<RemotePath, TransportError> {
        Self::require_initialized(handle)?;
        let started = Instant::now();
        let device = self.device(handle);
        let result = if device.fails_at(FailStage::Capture) {
            Err(TransportError::Busy(format!(
                "{} refused the capture request",
                handle.address
            )))
        } else {
            thread::sleep(Duration::from_millis(device.capture_latency_ms));
            let remote = RemotePath::new(
                REMOTE_FOLDER,
                format!("IMG_{:04}.JPG", handle.captured.len() + 1),
            );
            handle.captured.push(remote.clone());
            Ok(remote)
        };
        self.record(&handle.address, Call::Capture, started);
        result
    }

    fn fetch_file(
        &self,
        handle: &mut SimHandle,
        remote: &RemotePath,
    ) -> Result<Vec<u8>, TransportError> {
        Self::require_initialized(handle)?;
        let started = Instant::now();
        let device = self.device(handle);
        thread::sleep(Duration::from_millis(device.fetch_latency_ms));
        let result = if device.fails_at(FailStage::Fetch) {
            Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "transfer interrupted",
            )))
        } else if !handle.captured.contains(remote) {
            Err(TransportError::NotFound(remote.to_string()))
        } else {
            Ok((0..device.payload_bytes).map(|i| (i % 251) as u8).collect())
        };
        self.record(&handle.address, Call::Fetch, started);
        result
    }

    fn close(&self, handle: SimHandle) -> Result<(), TransportError> {
        let started = Instant::now();
        self.live_handles.fetch_sub(1, Ordering::SeqCst);
        let result = if handle.initialized && self.device(&handle).fails_at(FailStage::Close) {
            Err(TransportError::Protocol(format!(
                "{} did not acknowledge exit",
                handle.address
            )))
        } else {
            debug!("Released {}", handle.address);
            Ok(())
        };
        self.record(&handle.address, Call::Close, started);
        result
    }
}
