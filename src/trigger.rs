//! Barrier-synchronized capture across all live sessions.
//!
//! Each session moves into its own worker thread, which parks on a shared
//! [`StartGate`]. Once every worker is parked the gate opens in one step and
//! all workers issue their capture call concurrently. Results come back over a
//! channel and are reassembled in input order.
//!
//! The timestamp recorded per device is taken when the capture call returns,
//! not when the shutter fires. Actual skew between devices is bounded by each
//! device's own command-to-shutter latency, which this layer cannot observe.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn};

use crate::config::AppConfig;
use crate::error::{CaptureError, RetrievalError};
use crate::gate::{Release, StartGate};
use crate::model::{CaptureResult, RetrievedFile};
use crate::progress::RigReporter;
use crate::retrieval::{self, DestinationLayout};
use crate::session::DeviceSession;
use crate::transport::Transport;

/// Upper bound on how long arming waits for spawned workers to reach the gate.
const PARK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for a worker's final hand-back once it has nothing left
/// to do but send it.
const HANDBACK_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct RetrievalPolicy {
    layout: DestinationLayout,
    timeout: Duration,
}

/// Runs trigger rounds with a fixed capture/retrieval policy.
#[derive(Debug, Clone)]
pub struct TriggerCoordinator {
    capture_timeout: Duration,
    retrieval: Option<RetrievalPolicy>,
}

impl TriggerCoordinator {
    /// Builds a coordinator from config. Retrieval is enabled only when
    /// `download_after_capture` is set.
    pub fn new(config: &AppConfig, global_timestamp: &str) -> Self {
        let retrieval = config.download_after_capture.then(|| RetrievalPolicy {
            layout: DestinationLayout::new(config.download_root(), global_timestamp),
            timeout: config.retrieval_timeout(),
        });
        Self {
            capture_timeout: config.capture_timeout(),
            retrieval,
        }
    }

    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    pub fn with_retrieval(mut self, layout: DestinationLayout, timeout: Duration) -> Self {
        self.retrieval = Some(RetrievalPolicy { layout, timeout });
        self
    }

    /// Spawns one worker per session and waits until all are parked behind
    /// the gate. Nothing is captured until [`ArmedRound::fire`].
    pub fn arm<T: Transport>(&self, sessions: Vec<DeviceSession<T>>) -> ArmedRound<T> {
        let gate = Arc::new(StartGate::new());
        let (tx, events) = mpsc::channel();
        let retrieval = self.retrieval.clone().map(Arc::new);

        let mut slots = Vec::with_capacity(sessions.len());
        let mut spawned = 0;
        for (slot, session) in sessions.into_iter().enumerate() {
            let session_id = session.session_id();
            let identity = session.identity().to_string();
            let worker = Worker {
                slot,
                session,
                gate: Arc::clone(&gate),
                capture_timeout: self.capture_timeout,
                retrieval: retrieval.clone(),
                tx: tx.clone(),
            };
            let spawn = thread::Builder::new()
                .name(format!("cam-{}", session_id))
                .spawn(move || worker.run());
            let join = match spawn {
                Ok(join) => {
                    spawned += 1;
                    Some(join)
                }
                Err(err) => {
                    // The closure, and the session inside it, were dropped,
                    // which closes the session.
                    error!("Cam {}: could not start worker thread: {}", session_id, err);
                    None
                }
            };
            slots.push(Slot {
                session_id,
                identity,
                join,
            });
        }
        drop(tx);

        if !gate.wait_parked(spawned, PARK_TIMEOUT) {
            warn!(
                "Only {} of {} workers parked within {:?}",
                gate.parked(),
                spawned,
                PARK_TIMEOUT
            );
        }
        debug!("{} worker(s) armed", spawned);

        ArmedRound {
            gate,
            slots,
            events,
            capture_timeout: self.capture_timeout,
            retrieval: self.retrieval.clone(),
            settled: false,
        }
    }

    /// Arms and immediately fires a round.
    pub fn trigger_all<T: Transport>(
        &self,
        sessions: Vec<DeviceSession<T>>,
        reporter: &dyn RigReporter,
    ) -> RoundOutcome<T> {
        self.arm(sessions).fire(reporter)
    }
}

enum WorkerEvent<T: Transport> {
    Captured {
        slot: usize,
        result: CaptureResult,
    },
    Finished {
        slot: usize,
        retrieved: Option<RetrievedFile>,
        session: DeviceSession<T>,
    },
}

struct Worker<T: Transport> {
    slot: usize,
    session: DeviceSession<T>,
    gate: Arc<StartGate>,
    capture_timeout: Duration,
    retrieval: Option<Arc<RetrievalPolicy>>,
    tx: Sender<WorkerEvent<T>>,
}

impl<T: Transport> Worker<T> {
    fn run(self) {
        let Worker {
            slot,
            mut session,
            gate,
            capture_timeout,
            retrieval,
            tx,
        } = self;
        let session_id = session.session_id();
        let span = info_span!("device", id = session_id);
        let _enter = span.enter();

        let opened_at = match gate.wait() {
            Release::Open(at) => at,
            Release::Cancelled => {
                debug!("Cam {} released without capture", session_id);
                let _ = tx.send(WorkerEvent::Captured {
                    slot,
                    result: CaptureResult::failed(session_id, CaptureError::Cancelled),
                });
                let _ = tx.send(WorkerEvent::Finished {
                    slot,
                    retrieved: None,
                    session,
                });
                return;
            }
        };

        info!(
            "Triggering cam {} (serial: {})...",
            session_id,
            session.identity()
        );
        let result = match session.call(|t, h| t.capture(h)) {
            Ok(remote) => {
                let at = Instant::now();
                info!(
                    "Cam {} captured {} at +{:.4}s",
                    session_id,
                    remote,
                    at.saturating_duration_since(opened_at).as_secs_f64()
                );
                CaptureResult::captured(session_id, remote, at, opened_at)
            }
            Err(err) => {
                error!("Cam {} - capture error: {}", session_id, err);
                CaptureResult::failed(session_id, CaptureError::Transport(err))
            }
        };

        // Report the capture before fetching so retrieval time never counts
        // against the capture deadline.
        let late = result.later_than(capture_timeout);
        let kept = result.success_copy();
        let _ = tx.send(WorkerEvent::Captured { slot, result });

        let retrieved = match (&retrieval, kept) {
            (Some(_), Some(_)) if late => {
                warn!(
                    "Cam {} captured after the {:?} deadline; not downloading",
                    session_id, capture_timeout
                );
                None
            }
            (Some(policy), Some(capture)) => Some(retrieval::retrieve(
                &mut session,
                &capture,
                &policy.layout,
            )),
            _ => None,
        };
        let _ = tx.send(WorkerEvent::Finished {
            slot,
            retrieved,
            session,
        });
    }
}

struct Slot {
    session_id: usize,
    identity: String,
    join: Option<JoinHandle<()>>,
}

/// Workers spawned and parked behind a closed gate.
///
/// Dropping an armed round without firing it cancels it; the workers then
/// close their sessions.
pub struct ArmedRound<T: Transport> {
    gate: Arc<StartGate>,
    slots: Vec<Slot>,
    events: Receiver<WorkerEvent<T>>,
    capture_timeout: Duration,
    retrieval: Option<RetrievalPolicy>,
    settled: bool,
}

impl<T: Transport> ArmedRound<T> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Workers currently parked at the gate.
    pub fn parked(&self) -> usize {
        self.gate.parked()
    }

    /// Opens the gate and collects one result per session, in input order.
    pub fn fire(mut self, reporter: &dyn RigReporter) -> RoundOutcome<T> {
        self.settled = true;
        let gate_opened_at = match self.gate.open() {
            Release::Open(at) => at,
            Release::Cancelled => Instant::now(),
        };
        reporter.on_gate_open(self.slots.len());
        info!("Gate open: {} camera(s) triggering", self.slots.len());

        let n = self.slots.len();
        let mut captures: Vec<Option<CaptureResult>> = (0..n).map(|_| None).collect();
        let mut handbacks: Vec<Option<Handback<T>>> = (0..n).map(|_| None).collect();
        for (slot, capture) in captures.iter_mut().enumerate() {
            if self.slots[slot].join.is_none() {
                let result =
                    CaptureResult::failed(self.slots[slot].session_id, CaptureError::WorkerLost);
                reporter.on_device_captured(&result);
                *capture = Some(result);
            }
        }

        // Phase 1: capture records, bounded by the capture timeout.
        let capture_deadline = gate_opened_at + self.capture_timeout;
        while captures.iter().any(Option::is_none) {
            match self.next_event(capture_deadline) {
                Some(event) => self.accept(event, &mut captures, &mut handbacks, reporter),
                None => break,
            }
        }
        for (slot, capture) in captures.iter_mut().enumerate() {
            if capture.is_none() {
                let session_id = self.slots[slot].session_id;
                let error = if self.worker_gone(slot) {
                    CaptureError::WorkerLost
                } else {
                    CaptureError::TimedOut(self.capture_timeout)
                };
                warn!("Cam {}: {}", session_id, error);
                let result = CaptureResult::failed(session_id, error);
                reporter.on_device_captured(&result);
                *capture = Some(result);
            }
        }

        // Phase 2: hand-backs from every worker that reported a capture.
        let handback_deadline = self.handback_deadline(&captures, &handbacks);
        while (0..n).any(|slot| self.awaiting_handback(slot, &captures, &handbacks)) {
            match self.next_event(handback_deadline) {
                Some(event) => self.accept(event, &mut captures, &mut handbacks, reporter),
                None => break,
            }
        }

        let mut devices = Vec::with_capacity(n);
        for (slot, (capture, handback)) in captures.into_iter().zip(handbacks).enumerate() {
            let capture = capture.unwrap_or_else(|| {
                CaptureResult::failed(self.slots[slot].session_id, CaptureError::WorkerLost)
            });
            let join = self.slots[slot].join.take();
            let (retrieved, session) = match handback {
                Some(handback) => {
                    if let Some(join) = join {
                        if join.join().is_err() {
                            error!("Cam {}: worker panicked", capture.session_id);
                        }
                    }
                    (handback.retrieved, Some(handback.session))
                }
                None => {
                    // The worker still owns its session and will close it when
                    // its blocking call returns.
                    warn!(
                        "Cam {}: worker did not hand back its session",
                        capture.session_id
                    );
                    let retrieved = self.abandoned_retrieval(slot, &capture, join.as_ref());
                    if let Some(file) = &retrieved {
                        reporter.on_device_retrieved(file);
                    }
                    (retrieved, None)
                }
            };
            devices.push(DeviceRound {
                capture,
                retrieved,
                session,
            });
        }

        let elapsed = gate_opened_at.elapsed();
        reporter.on_round_complete(elapsed);
        info!(
            "All camera trigger threads completed in {:.4} seconds.",
            elapsed.as_secs_f64()
        );

        RoundOutcome {
            gate_opened_at,
            elapsed,
            devices,
        }
    }

    /// Releases the workers without capturing and returns every session, in
    /// input order, for teardown.
    pub fn cancel(mut self) -> Vec<DeviceSession<T>> {
        self.settled = true;
        self.gate.cancel();
        info!("Trigger round cancelled");

        let n = self.slots.len();
        let mut sessions: Vec<Option<DeviceSession<T>>> = (0..n).map(|_| None).collect();
        let deadline = Instant::now() + PARK_TIMEOUT;
        let pending = |sessions: &[Option<DeviceSession<T>>], slots: &[Slot]| {
            sessions
                .iter()
                .zip(slots)
                .any(|(session, slot)| session.is_none() && slot.join.is_some())
        };
        while pending(&sessions, &self.slots) {
            match self.next_event(deadline) {
                Some(WorkerEvent::Finished { slot, session, .. }) => {
                    sessions[slot] = Some(session);
                }
                Some(WorkerEvent::Captured { .. }) => {}
                None => break,
            }
        }
        for slot in &mut self.slots {
            if let Some(join) = slot.join.take() {
                if join.is_finished() {
                    let _ = join.join();
                }
            }
        }
        sessions.into_iter().flatten().collect()
    }

    fn next_event(&self, deadline: Instant) -> Option<WorkerEvent<T>> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn accept(
        &self,
        event: WorkerEvent<T>,
        captures: &mut [Option<CaptureResult>],
        handbacks: &mut [Option<Handback<T>>],
        reporter: &dyn RigReporter,
    ) {
        match event {
            WorkerEvent::Captured { slot, result } => {
                // A late report after the capture deadline is dropped; the
                // slot already holds the timeout record.
                if captures[slot].is_none() {
                    reporter.on_device_captured(&result);
                    captures[slot] = Some(result);
                }
            }
            WorkerEvent::Finished {
                slot,
                mut retrieved,
                session,
            } => {
                // Only a capture the round counted as successful may be retrieved.
                let counted = captures[slot].as_ref().map_or(false, CaptureResult::success);
                if !counted && retrieved.take().is_some() {
                    warn!(
                        "Cam {}: discarding download of a capture recorded as failed",
                        session.session_id()
                    );
                }
                if let Some(file) = &retrieved {
                    reporter.on_device_retrieved(file);
                }
                handbacks[slot] = Some(Handback { retrieved, session });
            }
        }
    }

    fn worker_gone(&self, slot: usize) -> bool {
        self.slots[slot]
            .join
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    fn awaiting_handback(
        &self,
        slot: usize,
        captures: &[Option<CaptureResult>],
        handbacks: &[Option<Handback<T>>],
    ) -> bool {
        let timed_out = matches!(
            captures[slot].as_ref().and_then(CaptureResult::error),
            Some(CaptureError::TimedOut(_)) | Some(CaptureError::WorkerLost)
        );
        handbacks[slot].is_none() && !timed_out
    }

    /// Latest point at which the outstanding workers can still be expected to
    /// hand back. A worker with a file to fetch gets its capture time plus the
    /// retrieval timeout; any other worker gets a short grace period.
    fn handback_deadline(
        &self,
        captures: &[Option<CaptureResult>],
        handbacks: &[Option<Handback<T>>],
    ) -> Instant {
        let now = Instant::now();
        (0..captures.len())
            .filter(|&slot| self.awaiting_handback(slot, captures, handbacks))
            .filter_map(|slot| captures[slot].as_ref())
            .map(|capture| match (&self.retrieval, capture.captured_at) {
                (Some(policy), Some(at)) if capture.success() => at + policy.timeout,
                _ => now + HANDBACK_GRACE,
            })
            .max()
            .unwrap_or(now)
    }

    fn abandoned_retrieval(
        &self,
        slot: usize,
        capture: &CaptureResult,
        join: Option<&JoinHandle<()>>,
    ) -> Option<RetrievedFile> {
        let policy = self.retrieval.as_ref()?;
        let remote = capture.remote_path()?;
        let session_id = capture.session_id;
        let error = if join.map_or(true, JoinHandle::is_finished) {
            RetrievalError::WorkerLost
        } else {
            RetrievalError::TimedOut(policy.timeout)
        };
        Some(RetrievedFile {
            session_id,
            local_path: policy
                .layout
                .path_for(session_id, &self.slots[slot].identity, remote),
            elapsed: capture
                .captured_at
                .map(|at| at.elapsed())
                .unwrap_or_default(),
            outcome: Err(error),
        })
    }
}

impl<T: Transport> Drop for ArmedRound<T> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Armed round dropped without firing; cancelling");
            self.gate.cancel();
        }
    }
}

struct Handback<T: Transport> {
    retrieved: Option<RetrievedFile>,
    session: DeviceSession<T>,
}

/// One device's share of a trigger round.
#[derive(Debug)]
pub struct DeviceRound<T: Transport> {
    pub capture: CaptureResult,
    pub retrieved: Option<RetrievedFile>,
    /// `None` when the worker was still blocked at the deadline; it closes the
    /// session itself once the driver call returns.
    pub session: Option<DeviceSession<T>>,
}

/// Results of a fired round, aligned with the input session order.
#[derive(Debug)]
pub struct RoundOutcome<T: Transport> {
    pub gate_opened_at: Instant,
    /// Gate open until the last worker was joined or given up on.
    pub elapsed: Duration,
    pub devices: Vec<DeviceRound<T>>,
}

impl<T: Transport> RoundOutcome<T> {
    pub fn captures(&self) -> impl Iterator<Item = &CaptureResult> {
        self.devices.iter().map(|device| &device.capture)
    }

    pub fn captured_count(&self) -> usize {
        self.captures().filter(|capture| capture.success()).count()
    }

    /// Offset of the latest successful capture from the gate opening.
    pub fn capture_span(&self) -> Option<Duration> {
        self.captures().filter_map(|capture| capture.offset).max()
    }

    /// Spread between the earliest and latest successful capture.
    pub fn skew(&self) -> Option<Duration> {
        let offsets: Vec<Duration> = self.captures().filter_map(|capture| capture.offset).collect();
        let earliest = offsets.iter().min()?;
        let latest = offsets.iter().max()?;
        Some(*latest - *earliest)
    }
}
