use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How a parked worker was let through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Open(Instant),
    Cancelled,
}

#[derive(Debug)]
struct GateState {
    parked: usize,
    release: Option<Release>,
}

/// One-shot start gate shared by all workers of a trigger round.
///
/// Workers park in [`StartGate::wait`]; the coordinator waits until everyone is
/// parked, then opens (or cancels) the gate once, waking all of them with a
/// single `notify_all`. Once settled the gate never closes again.
#[derive(Debug)]
pub struct StartGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                parked: 0,
                release: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parks the calling worker until the gate is opened or cancelled.
    pub fn wait(&self) -> Release {
        let mut state = self.lock();
        state.parked += 1;
        self.cond.notify_all();
        loop {
            if let Some(release) = state.release {
                return release;
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until at least `expected` workers are parked. Returns `false` if
    /// `timeout` elapses first.
    pub fn wait_parked(&self, expected: usize, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.parked < expected)
            .unwrap_or_else(PoisonError::into_inner);
        state.parked >= expected
    }

    pub fn parked(&self) -> usize {
        self.lock().parked
    }

    /// Opens the gate and returns the instant it opened. If the gate was already
    /// settled, returns how it was settled.
    pub fn open(&self) -> Release {
        let mut state = self.lock();
        let release = *state.release.get_or_insert_with(|| Release::Open(Instant::now()));
        self.cond.notify_all();
        release
    }

    /// Releases all workers without letting them act. No-op once opened.
    pub fn cancel(&self) -> Release {
        let mut state = self.lock();
        let release = *state.release.get_or_insert(Release::Cancelled);
        self.cond.notify_all();
        release
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_workers_wait_for_open() {
        let gate = Arc::new(StartGate::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || (gate.wait(), Instant::now()))
            })
            .collect();

        assert!(gate.wait_parked(4, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        let Release::Open(opened_at) = gate.open() else {
            panic!("gate should open");
        };

        for handle in handles {
            let (release, woke_at) = handle.join().unwrap();
            assert_eq!(release, Release::Open(opened_at));
            assert!(woke_at >= opened_at);
        }
    }

    #[test]
    fn test_cancel_then_open_stays_cancelled() {
        let gate = StartGate::new();
        assert_eq!(gate.cancel(), Release::Cancelled);
        assert_eq!(gate.open(), Release::Cancelled);
        assert_eq!(gate.wait(), Release::Cancelled);
    }

    #[test]
    fn test_wait_parked_times_out() {
        let gate = StartGate::new();
        assert!(!gate.wait_parked(1, Duration::from_millis(10)));
        assert_eq!(gate.parked(), 0);
    }
}
