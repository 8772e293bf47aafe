use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use sync_shutter::error::SessionError;
use sync_shutter::report::{RunOutcome, RunReport, Stage, Teardown};
use sync_shutter::{CaptureResult, DeviceDescriptor, RetrievedFile, RigReporter};

/// CLI progress reporter using indicatif spinners.
///
/// - Open phase: spinner, one line per camera as it opens
/// - Trigger round: spinner, one line per capture/download
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn start_spinner(&self, message: &str) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));

        let mut guard = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_spinner(&self) {
        let mut guard = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pb) = guard.take() {
            pb.finish_and_clear();
        }
    }

    /// Prints above the spinner if one is running.
    fn line(&self, text: String) {
        let guard = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(pb) => pb.println(text),
            None => eprintln!("{}", text),
        }
    }
}

fn ok_mark() -> ColoredString {
    "✓".green()
}

fn fail_mark() -> ColoredString {
    "✗".red()
}

impl RigReporter for CliReporter {
    fn on_discovery_complete(&self, devices: &[DeviceDescriptor]) {
        for device in devices {
            eprintln!("  {} {} on {}", "•".cyan(), device.name, device.address);
        }
        eprintln!("  {} Detected {} camera(s)", ok_mark(), devices.len());
    }

    fn on_open_start(&self, total: usize) {
        self.start_spinner(&format!("Opening {} camera(s)...", total));
    }

    fn on_device_opened(&self, descriptor: &DeviceDescriptor, outcome: Result<&str, &SessionError>) {
        let text = match outcome {
            Ok(identity) => format!(
                "  {} cam {} {} (serial {})",
                ok_mark(),
                descriptor.session_id(),
                descriptor.name,
                identity.bold()
            ),
            Err(err) => format!(
                "  {} cam {} {}: {}",
                fail_mark(),
                descriptor.session_id(),
                descriptor.name,
                err.to_string().red()
            ),
        };
        self.line(text);
    }

    fn on_armed(&self, workers: usize) {
        self.finish_spinner();
        eprintln!("  {} {} camera(s) armed at the gate", ok_mark(), workers);
    }

    fn on_gate_open(&self, workers: usize) {
        self.start_spinner(&format!("Triggering {} camera(s)...", workers));
    }

    fn on_device_captured(&self, result: &CaptureResult) {
        let text = match (&result.outcome, result.offset) {
            (Ok(remote), offset) => format!(
                "  {} cam {} captured {} at +{}",
                ok_mark(),
                result.session_id,
                remote,
                format!("{:.1}ms", offset.unwrap_or_default().as_secs_f64() * 1000.0).green()
            ),
            (Err(err), _) => format!(
                "  {} cam {}: {}",
                fail_mark(),
                result.session_id,
                err.to_string().red()
            ),
        };
        self.line(text);
    }

    fn on_device_retrieved(&self, file: &RetrievedFile) {
        let text = match &file.outcome {
            Ok(bytes) => format!(
                "  {} cam {} saved {} ({} bytes in {:.2}s)",
                ok_mark(),
                file.session_id,
                file.local_path.display(),
                bytes,
                file.elapsed.as_secs_f64()
            ),
            Err(err) => format!(
                "  {} cam {} download: {}",
                fail_mark(),
                file.session_id,
                err.to_string().red()
            ),
        };
        self.line(text);
    }

    fn on_round_complete(&self, elapsed: Duration) {
        self.finish_spinner();
        eprintln!(
            "  {} Trigger round completed in {:.4}s",
            ok_mark(),
            elapsed.as_secs_f64()
        );
    }

    fn on_teardown_complete(&self, closed: usize, failed: usize) {
        if failed == 0 {
            eprintln!("  {} Closed {} camera(s)", ok_mark(), closed);
        } else {
            eprintln!(
                "  {} Closed {} camera(s), {} failed to close",
                fail_mark(),
                closed,
                failed.to_string().red()
            );
        }
    }
}

pub fn print_summary(report: &RunReport) {
    println!();
    match report.outcome {
        RunOutcome::NoDevicesFound => {
            println!("{}", "No cameras detected.".red());
            return;
        }
        RunOutcome::NoUsableDevices => println!("{}", "No cameras could be opened.".red()),
        RunOutcome::Aborted => println!("{}", "Trigger aborted; nothing captured.".yellow()),
        RunOutcome::Completed => {}
    }

    println!("Run {}", report.global_timestamp.bold());
    for device in &report.devices {
        let stage = match device.stage {
            Stage::Discovered => "not opened".red(),
            Stage::Opened => "opened".yellow(),
            Stage::Captured => "captured".green(),
            Stage::Retrieved => "retrieved".green().bold(),
        };
        let identity = device.identity.as_deref().unwrap_or("-");
        let offset = device
            .capture_offset_ms
            .map(|ms| format!("+{:.1}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  cam {:<3} {:<28} {:<16} {:<11} {:>10}  {}",
            device.session_id,
            device.name,
            identity,
            stage,
            offset,
            device.local_path.as_deref().unwrap_or("")
        );

        let errors = [
            ("open", &device.open_error),
            ("capture", &device.capture_error),
            ("download", &device.retrieval_error),
            ("close", &device.close_error),
        ];
        for (stage, error) in errors {
            if let Some(error) = error {
                println!("          {} {}: {}", fail_mark(), stage, error.red());
            }
        }
        if device.teardown == Teardown::Deferred {
            println!(
                "          {} session still busy; it will be closed when the camera responds",
                "!".yellow()
            );
        }
    }

    if let Some(round) = &report.round {
        println!(
            "{} of {} camera(s) captured. Round: {}, last capture: {}, skew: {}",
            format!("{}", round.captured).green(),
            round.armed,
            format!("{:.4}s", round.elapsed.as_secs_f64()).cyan(),
            round
                .capture_span
                .map(|d| format!("{:.1}ms", d.as_secs_f64() * 1000.0))
                .unwrap_or_else(|| "-".to_string())
                .cyan(),
            round
                .skew
                .map(|d| format!("{:.1}ms", d.as_secs_f64() * 1000.0))
                .unwrap_or_else(|| "-".to_string())
                .cyan(),
        );
    }
}
