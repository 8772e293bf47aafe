use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use sync_shutter::report::{Stage, Teardown};
use sync_shutter::transport::simulated::Call;
use sync_shutter::transport::{FailStage, SimulatedDeviceConfig, SimulatedTransport};
use sync_shutter::{
    AppConfig, CaptureEngine, CaptureResult, Error, RigReporter, RunOutcome, SilentReporter,
};

const RUN_ID: &str = "20240501-101500";

fn cam(n: usize) -> SimulatedDeviceConfig {
    SimulatedDeviceConfig::new(format!("Test Cam {}", n), format!("usb:004,{:03}", n))
        .with_capture_latency(Duration::from_millis(10 * n as u64))
}

fn engine(
    devices: Vec<SimulatedDeviceConfig>,
    config: AppConfig,
) -> (CaptureEngine<SimulatedTransport>, Arc<SimulatedTransport>) {
    let transport = Arc::new(SimulatedTransport::new(devices));
    let engine =
        CaptureEngine::new(config, Arc::clone(&transport)).with_global_timestamp(RUN_ID);
    (engine, transport)
}

#[derive(Default)]
struct CountingReporter {
    captured: AtomicUsize,
    retrieved: AtomicUsize,
}

impl RigReporter for CountingReporter {
    fn on_device_captured(&self, _result: &CaptureResult) {
        self.captured.fetch_add(1, Ordering::SeqCst);
    }

    fn on_device_retrieved(&self, _file: &sync_shutter::RetrievedFile) {
        self.retrieved.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_no_devices_opens_nothing() {
    let (engine, transport) = engine(vec![], AppConfig::default());
    let mut asked = false;

    let report = engine
        .run(
            |_| {
                asked = true;
                true
            },
            &SilentReporter,
        )
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::NoDevicesFound);
    assert_eq!(report.exit_code(), 1);
    assert!(report.devices.is_empty());
    assert!(!asked);
    assert!(transport.calls().is_empty());
}

#[test]
fn test_enumeration_failure_is_an_error() {
    let transport = Arc::new(SimulatedTransport::failing_enumeration("usb bus reset"));
    let engine = CaptureEngine::new(AppConfig::default(), transport);
    let result = engine.run(|_| true, &SilentReporter);
    assert!(matches!(result, Err(Error::Discovery(_))));
}

#[test]
fn test_full_run_with_download() {
    let tmp = tempdir().unwrap();
    let config = AppConfig {
        download_after_capture: true,
        download_root: tmp.path().to_string_lossy().into_owned(),
        ..AppConfig::default()
    };
    let (engine, transport) = engine(
        vec![
            cam(1).with_serial("A1"),
            cam(2).with_summary("Model: Test Cam 2\nSerial Number: B2\n"),
            cam(3),
        ],
        config,
    );
    let reporter = CountingReporter::default();

    let report = engine.run(|armed| armed == 3, &reporter).unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.count_reached(Stage::Retrieved), 3);
    assert_eq!(reporter.captured.load(Ordering::SeqCst), 3);
    assert_eq!(reporter.retrieved.load(Ordering::SeqCst), 3);

    let expected = ["A1", "B2", "cam3"];
    for (device, dir) in report.devices.iter().zip(expected) {
        let path = tmp.path().join(dir).join(format!("{}_IMG_0001.JPG", RUN_ID));
        assert_eq!(device.local_path.as_deref(), Some(path.to_str().unwrap()));
        assert_eq!(fs::metadata(&path).unwrap().len(), 4096);
        assert_eq!(device.teardown, Teardown::Closed);
    }
    assert_eq!(report.devices[2].identity.as_deref(), Some("unknown_serial"));

    let round = report.round.unwrap();
    assert_eq!(round.armed, 3);
    assert_eq!(round.captured, 3);
    assert!(round.skew.unwrap() <= round.capture_span.unwrap());
    assert_eq!(transport.live_handles(), 0);
}

#[test]
fn test_partial_failure_still_tears_everything_down() {
    let config = AppConfig {
        sync_device_clock: false,
        ..AppConfig::default()
    };
    let (engine, transport) = engine(
        vec![
            cam(1),
            cam(2).failing_at(FailStage::Capture),
            cam(3).failing_at(FailStage::Init),
            cam(4).failing_at(FailStage::Close),
        ],
        config,
    );

    let report = engine.run(|_| true, &SilentReporter).unwrap();
    assert_eq!(report.exit_code(), 0);

    let stages: Vec<Stage> = report.devices.iter().map(|d| d.stage).collect();
    assert_eq!(
        stages,
        vec![Stage::Captured, Stage::Opened, Stage::Discovered, Stage::Captured]
    );
    assert!(report.devices[1].capture_error.is_some());
    assert!(report.devices[2].open_error.is_some());

    let teardown: Vec<Teardown> = report.devices.iter().map(|d| d.teardown).collect();
    assert_eq!(
        teardown,
        vec![
            Teardown::Closed,
            Teardown::Closed,
            Teardown::NotOpened,
            Teardown::Failed
        ]
    );
    assert!(report.devices[3].close_error.is_some());
    assert_eq!(transport.live_handles(), 0);
}

#[test]
fn test_all_captures_failing_exits_nonzero() {
    let (engine, transport) = engine(
        vec![
            cam(1).failing_at(FailStage::Capture),
            cam(2).failing_at(FailStage::Capture),
        ],
        AppConfig::default(),
    );

    let report = engine.run(|_| true, &SilentReporter).unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(transport.calls_of(Call::Close).len(), 2);
}

#[test]
fn test_no_usable_devices() {
    let (engine, transport) = engine(
        vec![cam(1).failing_at(FailStage::Init)],
        AppConfig::default(),
    );

    let report = engine.run(|_| true, &SilentReporter).unwrap();
    assert_eq!(report.outcome, RunOutcome::NoUsableDevices);
    assert_eq!(report.exit_code(), 1);
    assert!(transport.calls_of(Call::Capture).is_empty());
    assert_eq!(transport.live_handles(), 0);
}

#[test]
fn test_aborted_run_closes_without_capturing() {
    let (engine, transport) = engine(vec![cam(1), cam(2)], AppConfig::default());

    let report = engine.run(|_| false, &SilentReporter).unwrap();
    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.exit_code(), 1);
    assert!(report.round.is_none());
    assert!(transport.calls_of(Call::Capture).is_empty());
    assert!(report
        .devices
        .iter()
        .all(|d| d.stage == Stage::Opened && d.teardown == Teardown::Closed));
    assert_eq!(transport.live_handles(), 0);
}

#[test]
fn test_identify_reads_identities_and_closes() {
    let (engine, transport) = engine(
        vec![cam(1).with_serial("A1"), cam(2)],
        AppConfig::default(),
    );

    let report = engine.identify(&SilentReporter).unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    let identities: Vec<Option<&str>> =
        report.devices.iter().map(|d| d.identity.as_deref()).collect();
    assert_eq!(identities, vec![Some("A1"), Some("unknown_serial")]);
    assert!(transport.calls_of(Call::Capture).is_empty());
    assert_eq!(transport.live_handles(), 0);
}

#[test]
fn test_report_csv_written_after_run() {
    let tmp = tempdir().unwrap();
    let (engine, _transport) = engine(vec![cam(1), cam(2)], AppConfig::default());

    let report = engine.run(|_| true, &SilentReporter).unwrap();
    let path = tmp.path().join("run.csv");
    report.write_csv(&path).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 3);
    assert!(text.contains("IMG_0001.JPG"));
}

#[test]
fn test_late_capture_counts_as_failed_in_report() {
    let tmp = tempdir().unwrap();
    let config = AppConfig {
        download_after_capture: true,
        download_root: tmp.path().to_string_lossy().into_owned(),
        capture_timeout_ms: 100,
        sync_device_clock: false,
        ..AppConfig::default()
    };
    let (engine, transport) = engine(
        vec![
            SimulatedDeviceConfig::new("Slow", "usb:004,010")
                .with_serial("SLOW")
                .with_capture_latency(Duration::from_millis(300)),
            SimulatedDeviceConfig::new("Fast", "usb:004,011")
                .with_serial("FAST")
                .with_fetch_latency(Duration::from_millis(800)),
        ],
        config,
    );

    let report = engine.run(|_| true, &SilentReporter).unwrap();
    let slow = &report.devices[0];
    assert_eq!(slow.stage, Stage::Opened);
    assert!(slow.capture_error.is_some());
    assert!(slow.bytes.is_none());
    assert!(slow.local_path.is_none());
    assert!(!tmp.path().join("SLOW").exists());

    assert_eq!(report.devices[1].stage, Stage::Retrieved);
    assert_eq!(report.captured_count(), 1);
    assert_eq!(report.round.unwrap().captured, 1);
    assert_eq!(report.exit_code(), 0);

    drop(engine);
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while transport.live_handles() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(transport.live_handles(), 0);
}
