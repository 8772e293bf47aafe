use std::sync::Arc;
use std::time::Duration;

use sync_shutter::discovery;
use sync_shutter::error::SessionError;
use sync_shutter::session;
use sync_shutter::teardown;
use sync_shutter::transport::simulated::Call;
use sync_shutter::transport::{FailStage, SimulatedDeviceConfig, SimulatedTransport};
use sync_shutter::{AppConfig, UNKNOWN_SERIAL};

fn cam(n: usize) -> SimulatedDeviceConfig {
    SimulatedDeviceConfig::new(format!("Test Cam {}", n), format!("usb:002,{:03}", n))
}

fn test_config() -> AppConfig {
    AppConfig {
        sync_device_clock: false,
        ..AppConfig::default()
    }
}

#[test]
fn test_open_all_is_aligned_with_descriptors() {
    let transport = Arc::new(SimulatedTransport::new(vec![
        cam(1).with_serial("A1"),
        cam(2).with_serial("B2"),
        cam(3).with_serial("C3").failing_at(FailStage::Init),
    ]));
    let descriptors = discovery::discover(transport.as_ref()).unwrap();
    transport.detach("usb:002,002");

    let results = session::open_all(&transport, &descriptors, &test_config());
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().session_id(), 1);
    assert!(matches!(
        results[1],
        Err(SessionError::AddressResolution { .. })
    ));
    assert!(matches!(results[2], Err(SessionError::Init { .. })));

    // The failed init released its handle; only the good session is live.
    assert_eq!(transport.live_handles(), 1);

    let sessions: Vec<_> = results.into_iter().flatten().collect();
    let closed = teardown::close_all(sessions);
    assert!(closed.iter().all(Result::is_ok));
    assert_eq!(transport.live_handles(), 0);
}

#[test]
fn test_identity_structured_then_summary_then_unknown() {
    let transport = Arc::new(SimulatedTransport::new(vec![
        cam(1).with_serial("A1"),
        cam(2).with_summary("Model: Test Cam 2\n  Serial Number: B2\n"),
        cam(3),
    ]));
    let descriptors = discovery::discover(transport.as_ref()).unwrap();

    let sessions: Vec<_> = session::open_all(&transport, &descriptors, &test_config())
        .into_iter()
        .map(Result::unwrap)
        .collect();
    let identities: Vec<&str> = sessions.iter().map(|s| s.identity()).collect();
    assert_eq!(identities, vec!["A1", "B2", UNKNOWN_SERIAL]);
    assert!(sessions[0].has_known_identity());
    assert!(!sessions[2].has_known_identity());

    teardown::close_all(sessions);
}

#[test]
fn test_unreadable_config_still_opens() {
    let transport = Arc::new(SimulatedTransport::new(vec![cam(1)
        .with_serial("A1")
        .failing_at(FailStage::Config)]));
    let descriptors = discovery::discover(transport.as_ref()).unwrap();

    let opened = session::open(&transport, &descriptors[0], &test_config()).unwrap();
    assert_eq!(opened.identity(), UNKNOWN_SERIAL);
    opened.close().unwrap();
}

#[test]
fn test_parallel_open_preserves_order() {
    let devices = (1..=6)
        .map(|n| {
            cam(n)
                .with_serial(format!("S{}", n))
                .with_capture_latency(Duration::from_millis(1))
        })
        .collect();
    let transport = Arc::new(SimulatedTransport::new(devices));
    let descriptors = discovery::discover(transport.as_ref()).unwrap();
    let config = AppConfig {
        parallel_open: true,
        ..test_config()
    };

    let results = session::open_all(&transport, &descriptors, &config);
    for (descriptor, result) in descriptors.iter().zip(&results) {
        let opened = result.as_ref().unwrap();
        assert_eq!(opened.session_id(), descriptor.session_id());
        assert_eq!(opened.identity(), format!("S{}", descriptor.session_id()));
    }
    teardown::close_all(results.into_iter().flatten().collect());
    assert_eq!(transport.live_handles(), 0);
}

#[test]
fn test_clock_sync_is_best_effort() {
    let transport = Arc::new(SimulatedTransport::new(vec![
        cam(1).with_serial("A1"),
        cam(2).with_serial("B2").failing_at(FailStage::Clock),
    ]));
    let descriptors = discovery::discover(transport.as_ref()).unwrap();
    let config = AppConfig::default();
    assert!(config.sync_device_clock);

    let results = session::open_all(&transport, &descriptors, &config);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(transport.calls_of(Call::WriteValue).len(), 2);
    teardown::close_all(results.into_iter().flatten().collect());
}

#[test]
fn test_clock_sync_disabled_writes_nothing() {
    let transport = Arc::new(SimulatedTransport::generated(2));
    let descriptors = discovery::discover(transport.as_ref()).unwrap();

    let results = session::open_all(&transport, &descriptors, &test_config());
    assert!(transport.calls_of(Call::WriteValue).is_empty());
    teardown::close_all(results.into_iter().flatten().collect());
}

#[test]
fn test_dropped_session_is_closed_once() {
    let transport = Arc::new(SimulatedTransport::generated(1));
    let descriptors = discovery::discover(transport.as_ref()).unwrap();

    let opened = session::open(&transport, &descriptors[0], &test_config()).unwrap();
    assert_eq!(transport.live_handles(), 1);
    drop(opened);
    assert_eq!(transport.live_handles(), 0);
    assert_eq!(transport.calls_of(Call::Close).len(), 1);
}

#[test]
fn test_close_failure_is_reported_and_handle_released() {
    let transport = Arc::new(SimulatedTransport::new(vec![
        cam(1).failing_at(FailStage::Close),
        cam(2),
    ]));
    let descriptors = discovery::discover(transport.as_ref()).unwrap();
    let sessions: Vec<_> = session::open_all(&transport, &descriptors, &test_config())
        .into_iter()
        .flatten()
        .collect();

    let results = teardown::close_all(sessions);
    assert_eq!(results[0].as_ref().unwrap_err().session_id, 1);
    assert!(results[1].is_ok());
    assert_eq!(transport.live_handles(), 0);
    assert_eq!(transport.calls_of(Call::Close).len(), 2);
}
