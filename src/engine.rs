use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::discovery;
use crate::error::Error;
use crate::model::DeviceDescriptor;
use crate::progress::RigReporter;
use crate::report::{DeviceReport, RoundMetrics, RunOutcome, RunReport, Stage, Teardown};
use crate::retrieval;
use crate::session::{self, DeviceSession};
use crate::teardown;
use crate::transport::Transport;
use crate::trigger::{RoundOutcome, TriggerCoordinator};

/// Drives a full run: discover, open, trigger, retrieve, close.
pub struct CaptureEngine<T: Transport> {
    config: AppConfig,
    transport: Arc<T>,
    global_timestamp: Option<String>,
}

impl<T: Transport> CaptureEngine<T> {
    pub fn new(config: AppConfig, transport: Arc<T>) -> Self {
        Self {
            config,
            transport,
            global_timestamp: None,
        }
    }

    /// Fixes the run identifier instead of deriving it from the clock.
    pub fn with_global_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.global_timestamp = Some(timestamp.into());
        self
    }

    pub fn discover(&self) -> Result<Vec<DeviceDescriptor>, Error> {
        info!("Detecting cameras...");
        Ok(discovery::discover(self.transport.as_ref())?)
    }

    /// Opens every device to read its identity, then closes it again.
    pub fn identify(&self, reporter: &dyn RigReporter) -> Result<RunReport, Error> {
        let global_timestamp = self.global_timestamp();
        let descriptors = self.discover()?;
        reporter.on_discovery_complete(&descriptors);
        if descriptors.is_empty() {
            return Ok(RunReport::empty(global_timestamp, RunOutcome::NoDevicesFound));
        }

        let mut devices: Vec<DeviceReport> =
            descriptors.iter().map(DeviceReport::discovered).collect();
        let live = self.open_stage(&descriptors, &mut devices, reporter);
        let outcome = if live.is_empty() {
            RunOutcome::NoUsableDevices
        } else {
            RunOutcome::Completed
        };
        self.close_stage(live, &mut devices, reporter);

        Ok(RunReport {
            global_timestamp,
            outcome,
            devices,
            round: None,
        })
    }

    /// Runs the whole pipeline. `confirm` is called once every worker is
    /// parked behind the gate, with the number of armed devices; returning
    /// `false` cancels the round before anything is captured.
    pub fn run(
        &self,
        confirm: impl FnOnce(usize) -> bool,
        reporter: &dyn RigReporter,
    ) -> Result<RunReport, Error> {
        let global_timestamp = self.global_timestamp();
        let descriptors = self.discover()?;
        reporter.on_discovery_complete(&descriptors);
        if descriptors.is_empty() {
            warn!("No cameras detected.");
            return Ok(RunReport::empty(global_timestamp, RunOutcome::NoDevicesFound));
        }

        let mut devices: Vec<DeviceReport> =
            descriptors.iter().map(DeviceReport::discovered).collect();
        let live = self.open_stage(&descriptors, &mut devices, reporter);
        if live.is_empty() {
            warn!("No cameras were successfully initialized.");
            return Ok(RunReport {
                global_timestamp,
                outcome: RunOutcome::NoUsableDevices,
                devices,
                round: None,
            });
        }

        info!("Will attempt to trigger {} camera(s)", live.len());
        let coordinator = TriggerCoordinator::new(&self.config, &global_timestamp);
        let armed = coordinator.arm(live);
        reporter.on_armed(armed.len());

        if !confirm(armed.len()) {
            info!("Trigger aborted before the gate opened");
            let sessions = armed.cancel();
            self.close_stage(sessions, &mut devices, reporter);
            for report in devices.iter_mut() {
                if report.reached(Stage::Opened) && report.teardown == Teardown::NotOpened {
                    report.teardown = Teardown::Deferred;
                }
            }
            return Ok(RunReport {
                global_timestamp,
                outcome: RunOutcome::Aborted,
                devices,
                round: None,
            });
        }

        let round = armed.fire(reporter);
        let metrics = RoundMetrics {
            armed: round.devices.len(),
            captured: round.captured_count(),
            elapsed: round.elapsed,
            capture_span: round.capture_span(),
            skew: round.skew(),
        };
        let sessions = record_round(round, &mut devices);
        self.close_stage(sessions, &mut devices, reporter);

        Ok(RunReport {
            global_timestamp,
            outcome: RunOutcome::Completed,
            devices,
            round: Some(metrics),
        })
    }

    fn global_timestamp(&self) -> String {
        self.global_timestamp
            .clone()
            .unwrap_or_else(retrieval::global_timestamp)
    }

    fn open_stage(
        &self,
        descriptors: &[DeviceDescriptor],
        devices: &mut [DeviceReport],
        reporter: &dyn RigReporter,
    ) -> Vec<DeviceSession<T>> {
        reporter.on_open_start(descriptors.len());
        let results = session::open_all(&self.transport, descriptors, &self.config);

        let mut live = Vec::with_capacity(results.len());
        let rows = descriptors.iter().zip(results).zip(devices.iter_mut());
        for ((descriptor, result), report) in rows {
            match result {
                Ok(session) => {
                    reporter.on_device_opened(descriptor, Ok(session.identity()));
                    report.stage = Stage::Opened;
                    report.identity = Some(session.identity().to_string());
                    live.push(session);
                }
                Err(err) => {
                    reporter.on_device_opened(descriptor, Err(&err));
                    report.open_error = Some(err.to_string());
                }
            }
        }
        debug!("{} of {} camera(s) opened", live.len(), descriptors.len());
        live
    }

    fn close_stage(
        &self,
        sessions: Vec<DeviceSession<T>>,
        devices: &mut [DeviceReport],
        reporter: &dyn RigReporter,
    ) {
        let ids: Vec<usize> = sessions.iter().map(DeviceSession::session_id).collect();
        let results = teardown::close_all(sessions);

        let mut closed = 0;
        let mut failed = 0;
        for (session_id, result) in ids.into_iter().zip(results) {
            let Some(report) = report_for(devices, session_id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    closed += 1;
                    report.teardown = Teardown::Closed;
                }
                Err(err) => {
                    failed += 1;
                    report.teardown = Teardown::Failed;
                    report.close_error = Some(err.source.to_string());
                }
            }
        }
        reporter.on_teardown_complete(closed, failed);
    }
}

/// Copies the round's outcome into the device rows and returns the sessions
/// that came back from their workers.
fn record_round<T: Transport>(
    round: RoundOutcome<T>,
    devices: &mut [DeviceReport],
) -> Vec<DeviceSession<T>> {
    let mut sessions = Vec::with_capacity(round.devices.len());
    for device in round.devices {
        let session_id = device.capture.session_id;
        let Some(report) = report_for(devices, session_id) else {
            continue;
        };

        match &device.capture.outcome {
            Ok(remote) => {
                report.stage = Stage::Captured;
                report.remote_path = Some(remote.to_string());
                report.capture_offset_ms = device
                    .capture
                    .offset
                    .map(|offset| offset.as_secs_f64() * 1000.0);
            }
            Err(err) => report.capture_error = Some(err.to_string()),
        }

        let retrieved = device
            .retrieved
            .as_ref()
            .filter(|_| device.capture.success());
        if let Some(file) = retrieved {
            report.local_path = Some(file.local_path.to_string_lossy().into_owned());
            match &file.outcome {
                Ok(bytes) => {
                    report.stage = Stage::Retrieved;
                    report.bytes = Some(*bytes);
                }
                Err(err) => report.retrieval_error = Some(err.to_string()),
            }
        }

        match device.session {
            Some(session) => sessions.push(session),
            None => report.teardown = Teardown::Deferred,
        }
    }
    sessions
}

fn report_for(devices: &mut [DeviceReport], session_id: usize) -> Option<&mut DeviceReport> {
    devices.iter_mut().find(|report| report.session_id == session_id)
}
