use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::error::Error;
use crate::model::DeviceDescriptor;

/// Furthest pipeline stage a device completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    Opened,
    Captured,
    Retrieved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Teardown {
    NotOpened,
    Closed,
    Failed,
    /// Worker was still blocked in the driver; it closes the session when the
    /// call returns.
    Deferred,
}

/// Per-device summary row. Flat so it serializes straight to CSV.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub session_id: usize,
    pub name: String,
    pub address: String,
    pub identity: Option<String>,
    pub stage: Stage,
    pub open_error: Option<String>,
    pub remote_path: Option<String>,
    pub capture_offset_ms: Option<f64>,
    pub capture_error: Option<String>,
    pub local_path: Option<String>,
    pub bytes: Option<u64>,
    pub retrieval_error: Option<String>,
    pub teardown: Teardown,
    pub close_error: Option<String>,
}

impl DeviceReport {
    pub fn discovered(descriptor: &DeviceDescriptor) -> Self {
        Self {
            session_id: descriptor.session_id(),
            name: descriptor.name.clone(),
            address: descriptor.address.clone(),
            identity: None,
            stage: Stage::Discovered,
            open_error: None,
            remote_path: None,
            capture_offset_ms: None,
            capture_error: None,
            local_path: None,
            bytes: None,
            retrieval_error: None,
            teardown: Teardown::NotOpened,
            close_error: None,
        }
    }

    pub fn reached(&self, stage: Stage) -> bool {
        self.stage >= stage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    NoDevicesFound,
    NoUsableDevices,
    Aborted,
    Completed,
}

/// Timing of the trigger round.
#[derive(Debug, Clone, Copy)]
pub struct RoundMetrics {
    pub armed: usize,
    pub captured: usize,
    /// Gate open until all workers joined.
    pub elapsed: Duration,
    /// Latest successful capture, relative to the gate opening.
    pub capture_span: Option<Duration>,
    /// Latest minus earliest successful capture.
    pub skew: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub global_timestamp: String,
    pub outcome: RunOutcome,
    pub devices: Vec<DeviceReport>,
    pub round: Option<RoundMetrics>,
}

impl RunReport {
    pub fn empty(global_timestamp: impl Into<String>, outcome: RunOutcome) -> Self {
        Self {
            global_timestamp: global_timestamp.into(),
            outcome,
            devices: Vec::new(),
            round: None,
        }
    }

    pub fn count_reached(&self, stage: Stage) -> usize {
        self.devices.iter().filter(|d| d.reached(stage)).count()
    }

    pub fn captured_count(&self) -> usize {
        self.count_reached(Stage::Captured)
    }

    /// 0 when at least one device captured, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.captured_count() > 0 {
            0
        } else {
            1
        }
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for device in &self.devices {
            writer.serialize(device)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn descriptor(index: usize) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            name: format!("Cam {}", index),
            address: format!("usb:001,{:03}", index),
        }
    }

    #[test]
    fn test_exit_code_requires_a_capture() {
        let mut report = RunReport::empty("ts", RunOutcome::Completed);
        report.devices.push(DeviceReport::discovered(&descriptor(0)));
        assert_eq!(report.exit_code(), 1);

        let mut captured = DeviceReport::discovered(&descriptor(1));
        captured.stage = Stage::Captured;
        report.devices.push(captured);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.count_reached(Stage::Discovered), 2);
    }

    #[test]
    fn test_write_csv_has_one_row_per_device() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("report.csv");

        let mut report = RunReport::empty("20240501-101500", RunOutcome::Completed);
        let mut first = DeviceReport::discovered(&descriptor(0));
        first.stage = Stage::Retrieved;
        first.identity = Some("A1".to_string());
        first.bytes = Some(4096);
        first.teardown = Teardown::Closed;
        report.devices.push(first);
        report.devices.push(DeviceReport::discovered(&descriptor(1)));
        report.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("session_id,name,address,identity,stage"));
        assert!(lines[1].contains("retrieved"));
        assert!(lines[1].contains("closed"));
        assert!(lines[2].contains("not_opened"));
    }
}
