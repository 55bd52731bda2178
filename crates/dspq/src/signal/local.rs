use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{WaitOutcome, WAIT_INFINITE};

#[derive(Debug, Default)]
struct BellState {
    generation: u64,
    pending: bool,
    cancelled: bool,
}

/// An in-process doorbell.
///
/// Rings coalesce: any number of rings before a wait satisfy exactly one
/// wait. A ring also wakes every thread already waiting, so several waiters
/// on the same bell all get to re-check their condition.
#[derive(Debug, Default)]
pub struct LocalDoorbell {
    state: Mutex<BellState>,
    cond: Condvar,
}

impl LocalDoorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.pending = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout_us` for a ring. `0` polls.
    pub fn wait(&self, timeout_us: u32) -> WaitOutcome {
        let deadline = (timeout_us != WAIT_INFINITE)
            .then(|| Instant::now() + Duration::from_micros(timeout_us as u64));
        let mut state = self.state.lock();
        let start = state.generation;
        loop {
            if state.cancelled {
                return WaitOutcome::Cancelled;
            }
            if state.pending || state.generation != start {
                state.pending = false;
                return WaitOutcome::Signaled;
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        if state.cancelled {
                            return WaitOutcome::Cancelled;
                        }
                        if state.pending || state.generation != start {
                            state.pending = false;
                            return WaitOutcome::Signaled;
                        }
                        return WaitOutcome::TimedOut;
                    }
                }
            }
        }
    }

    /// Wake every waiter with `Cancelled`, now and until [`reset`](Self::reset).
    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Clear cancellation and any pending ring.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.cancelled = false;
        state.pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rings_coalesce() {
        let bell = LocalDoorbell::new();
        bell.ring();
        bell.ring();
        assert_eq!(bell.wait(0), WaitOutcome::Signaled);
        assert_eq!(bell.wait(0), WaitOutcome::TimedOut);
    }

    #[test]
    fn ring_wakes_blocked_waiter() {
        let bell = Arc::new(LocalDoorbell::new());
        let waiter = {
            let bell = bell.clone();
            thread::spawn(move || bell.wait(WAIT_INFINITE))
        };
        thread::sleep(Duration::from_millis(20));
        bell.ring();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Signaled);
    }

    #[test]
    fn one_ring_wakes_all_current_waiters() {
        let bell = Arc::new(LocalDoorbell::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let bell = bell.clone();
                thread::spawn(move || bell.wait(2_000_000))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        bell.ring();
        for w in waiters {
            assert_eq!(w.join().unwrap(), WaitOutcome::Signaled);
        }
    }

    #[test]
    fn cancel_is_sticky_until_reset() {
        let bell = Arc::new(LocalDoorbell::new());
        let waiter = {
            let bell = bell.clone();
            thread::spawn(move || bell.wait(WAIT_INFINITE))
        };
        thread::sleep(Duration::from_millis(20));
        bell.cancel();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Cancelled);
        assert_eq!(bell.wait(WAIT_INFINITE), WaitOutcome::Cancelled);

        bell.reset();
        assert_eq!(bell.wait(1_000), WaitOutcome::TimedOut);
    }

    #[test]
    fn short_timeout_expires() {
        let bell = LocalDoorbell::new();
        let start = Instant::now();
        assert_eq!(bell.wait(5_000), WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
