//! Fallback signaling over ordinary remote calls.
//!
//! Each domain gets one shared counter array with four `u32` counters per
//! queue slot, and two threads:
//!
//! - the send thread sleeps on a local condvar and issues one
//!   `RemoteDomain::signal` per wakeup, coalescing every send requested
//!   while the previous call was in flight;
//! - the receive thread blocks in `RemoteDomain::wait_signal` and, each time
//!   it returns, compares the counters of every active slot against the last
//!   values it saw and rings the local doorbell of any counter that moved.
//!
//! So at most two remote calls per domain are outstanding no matter how many
//! queues or packets there are.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dspq_shm::{Region, SharedBuffer, MAX_QUEUES_PER_DOMAIN};
use parking_lot::{Condvar, Mutex};

use super::{Doorbell, LocalDoorbell, SignalChannel, WaitOutcome};
use crate::domain::DomainHealth;
use crate::error::{QueueError, Result};
use crate::queue::Side;
use crate::remote::{DomainId, RemoteDomain, RemoteSignal};

/// Size of the per-domain counter array.
pub(crate) const COUNTER_ARRAY_SIZE: usize = 4096;

const _: () = assert!(MAX_QUEUES_PER_DOMAIN * 4 * 4 <= COUNTER_ARRAY_SIZE);

/// Called from a signaling thread when the remote side stops answering.
pub(crate) type FailureHook = Arc<dyn Fn(QueueError) + Send + Sync>;

type SlotBells = [LocalDoorbell; 4];

struct SlotWatch {
    bells: Arc<SlotBells>,
    seen: [u32; 4],
}

#[derive(Default)]
struct SendState {
    pending: bool,
    shutdown: bool,
}

struct Shared {
    domain: DomainId,
    side: Side,
    remote: Arc<dyn RemoteDomain>,
    // Keeps the mapping behind `counter_words` alive.
    _counters: SharedBuffer,
    counter_words: Region,
    health: Arc<DomainHealth>,
    on_failure: FailureHook,
    slots: Mutex<Vec<Option<SlotWatch>>>,
    send: Mutex<SendState>,
    send_cond: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn counter(&self, slot: u32, bell: Doorbell) -> &AtomicU32 {
        self.counter_words
            .u32_at((slot as usize * 4 + bell.index()) * 4)
    }

    fn send_loop(&self) {
        tracing::debug!(domain = %self.domain, "rpc send thread started");
        loop {
            {
                let mut state = self.send.lock();
                while !state.pending && !state.shutdown {
                    self.send_cond.wait(&mut state);
                }
                if state.shutdown {
                    break;
                }
                state.pending = false;
            }
            if self.health.error().is_some() {
                continue;
            }
            if let Err(e) = self.remote.signal() {
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                tracing::error!(domain = %self.domain, error = %e, "remote signal failed");
                (self.on_failure)(escalation(e));
                break;
            }
        }
        tracing::debug!(domain = %self.domain, "rpc send thread exiting");
    }

    fn receive_loop(&self) {
        tracing::debug!(domain = %self.domain, "rpc receive thread started");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match self.remote.wait_signal() {
                Ok(RemoteSignal::Signal) => self.fan_out(),
                // Either our own shutdown, caught at the top of the loop, or a
                // cancel left over from a previous receive thread.
                Ok(RemoteSignal::Exit) => continue,
                Err(e) => {
                    if !self.shutdown.load(Ordering::Acquire) {
                        tracing::error!(domain = %self.domain, error = %e, "wait for remote signal failed");
                        (self.on_failure)(escalation(e));
                    }
                    break;
                }
            }
        }
        tracing::debug!(domain = %self.domain, "rpc receive thread exiting");
    }

    fn fan_out(&self) {
        let watched = self.side.waited_bells();
        let mut slots = self.slots.lock();
        for (slot, watch) in slots.iter_mut().enumerate() {
            let Some(watch) = watch else { continue };
            for bell in watched {
                let now = self.counter(slot as u32, bell).load(Ordering::Acquire);
                if now != watch.seen[bell.index()] {
                    watch.seen[bell.index()] = now;
                    watch.bells[bell.index()].ring();
                }
            }
        }
    }
}

fn escalation(e: QueueError) -> QueueError {
    if e.is_domain_fatal() {
        e
    } else {
        QueueError::BadState
    }
}

/// Per-domain fallback signaling: counters plus the two threads.
pub(crate) struct RpcSignals {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcSignals {
    pub(crate) fn start(
        domain: DomainId,
        side: Side,
        remote: Arc<dyn RemoteDomain>,
        counters: SharedBuffer,
        health: Arc<DomainHealth>,
        on_failure: FailureHook,
        thread_name: &str,
    ) -> Result<Arc<Self>> {
        if counters.len() < COUNTER_ARRAY_SIZE {
            tracing::error!(%domain, len = counters.len(), "counter array too small");
            return Err(QueueError::BadState);
        }
        let shared = Arc::new(Shared {
            domain,
            side,
            remote,
            counter_words: counters.region(),
            _counters: counters,
            health,
            on_failure,
            slots: Mutex::new((0..MAX_QUEUES_PER_DOMAIN).map(|_| None).collect()),
            send: Mutex::new(SendState::default()),
            send_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let signals = Arc::new(Self {
            shared: shared.clone(),
            threads: Mutex::new(Vec::with_capacity(2)),
        });

        let send = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("{thread_name}-send-{domain}"))
                .spawn(move || shared.send_loop())
        };
        let send = send.map_err(|e| {
            tracing::error!(%domain, error = %e, "failed to spawn rpc send thread");
            QueueError::NoResources
        })?;
        signals.threads.lock().push(send);

        let receive = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("{thread_name}-recv-{domain}"))
                .spawn(move || shared.receive_loop())
        };
        match receive {
            Ok(handle) => signals.threads.lock().push(handle),
            Err(e) => {
                tracing::error!(%domain, error = %e, "failed to spawn rpc receive thread");
                signals.shutdown();
                return Err(QueueError::NoResources);
            }
        }
        Ok(signals)
    }

    /// Start watching `slot`; returns its local doorbells.
    fn activate(&self, slot: u32) -> Arc<SlotBells> {
        let bells: Arc<SlotBells> = Arc::new(Default::default());
        let seen = Doorbell::ALL.map(|bell| self.shared.counter(slot, bell).load(Ordering::Acquire));
        self.shared.slots.lock()[slot as usize] = Some(SlotWatch {
            bells: bells.clone(),
            seen,
        });
        bells
    }

    fn deactivate(&self, slot: u32) {
        self.shared.slots.lock()[slot as usize] = None;
    }

    fn kick(&self) {
        let mut state = self.shared.send.lock();
        state.pending = true;
        self.shared.send_cond.notify_one();
    }

    /// Stop both threads. Joins them unless called from one of them.
    pub(crate) fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.shared.send.lock();
            state.shutdown = true;
            self.shared.send_cond.notify_all();
        }
        if let Err(e) = self.shared.remote.cancel_wait_signal() {
            tracing::warn!(domain = %self.shared.domain, error = %e, "cancel_wait_signal failed");
        }
        let current = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(domain = %self.shared.domain, "rpc signaling thread panicked");
            }
        }
        tracing::debug!(domain = %self.shared.domain, "rpc signaling stopped");
    }
}

/// One queue's doorbells on top of [`RpcSignals`].
pub(crate) struct RpcChannel {
    signals: Arc<RpcSignals>,
    slot: u32,
    bells: Arc<SlotBells>,
}

impl RpcChannel {
    pub(crate) fn open(signals: Arc<RpcSignals>, slot: u32) -> Self {
        let bells = signals.activate(slot);
        Self {
            signals,
            slot,
            bells,
        }
    }
}

impl SignalChannel for RpcChannel {
    fn send(&self, bell: Doorbell) -> Result<()> {
        self.signals
            .shared
            .counter(self.slot, bell)
            .fetch_add(1, Ordering::AcqRel);
        self.signals.kick();
        Ok(())
    }

    fn wait(&self, bell: Doorbell, timeout_us: u32) -> Result<WaitOutcome> {
        Ok(self.bells[bell.index()].wait(timeout_us))
    }

    fn cancel(&self) {
        for bell in self.bells.iter() {
            bell.cancel();
        }
    }

    fn close(&self) {
        self.signals.deactivate(self.slot);
    }
}
