//! Per-domain registry entries.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use dspq_shm::MAX_QUEUES_PER_DOMAIN;
use parking_lot::Mutex;

use crate::alloc::SharedAllocator;
use crate::error::{QueueError, Result};
use crate::queue::{QueueInner, Side};
use crate::remote::{DomainId, RemoteDomain};
use crate::signal::rpc::{FailureHook, COUNTER_ARRAY_SIZE};
use crate::signal::RpcSignals;

/// Sticky "domain is dead" flag.
#[derive(Debug, Default)]
pub(crate) struct DomainHealth {
    code: AtomicI32,
}

impl DomainHealth {
    pub(crate) fn error(&self) -> Option<QueueError> {
        match self.code.load(Ordering::Acquire) {
            0 => None,
            code => Some(QueueError::from_code(code).unwrap_or(QueueError::BadState)),
        }
    }

    /// Record `error`. Returns false if the domain was already dead.
    fn set(&self, error: QueueError) -> bool {
        self.code
            .compare_exchange(0, error.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

enum Slot {
    Free,
    Reserved,
    Active(Weak<QueueInner>),
}

/// Everything this process tracks about one domain.
pub(crate) struct DomainEntry {
    pub(crate) id: DomainId,
    pub(crate) side: Side,
    pub(crate) remote: Arc<dyn RemoteDomain>,
    pub(crate) health: Arc<DomainHealth>,
    slots: Mutex<Vec<Slot>>,
    rpc: Mutex<Option<Arc<RpcSignals>>>,
    generation: AtomicU32,
}

impl DomainEntry {
    pub(crate) fn new(id: DomainId, side: Side, remote: Arc<dyn RemoteDomain>) -> Self {
        Self {
            id,
            side,
            remote,
            health: Arc::new(DomainHealth::default()),
            slots: Mutex::new((0..MAX_QUEUES_PER_DOMAIN).map(|_| Slot::Free).collect()),
            rpc: Mutex::new(None),
            generation: AtomicU32::new(0),
        }
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        match self.health.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reserve the lowest free slot.
    pub(crate) fn reserve_slot(&self) -> Result<u32> {
        let mut slots = self.slots.lock();
        let index = slots
            .iter()
            .position(|s| matches!(s, Slot::Free))
            .ok_or(QueueError::NoResources)?;
        slots[index] = Slot::Reserved;
        Ok(index as u32)
    }

    /// Reserve a specific slot, as chosen by the creating side.
    pub(crate) fn reserve_slot_at(&self, slot: u32) -> Result<()> {
        let mut slots = self.slots.lock();
        match slots.get_mut(slot as usize) {
            None => Err(QueueError::BadParameter),
            Some(s) if matches!(s, Slot::Free) => {
                *s = Slot::Reserved;
                Ok(())
            }
            Some(_) => Err(QueueError::ItemBusy),
        }
    }

    pub(crate) fn activate(&self, slot: u32, queue: Weak<QueueInner>) {
        self.slots.lock()[slot as usize] = Slot::Active(queue);
    }

    pub(crate) fn release_slot(&self, slot: u32) {
        if let Some(s) = self.slots.lock().get_mut(slot as usize) {
            *s = Slot::Free;
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.slots.lock().iter().all(|s| matches!(s, Slot::Free))
    }

    pub(crate) fn active_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| matches!(s, Slot::Active(_)))
            .count()
    }

    pub(crate) fn next_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// The domain's fallback signaling, started on first use.
    pub(crate) fn rpc_signals(
        self: &Arc<Self>,
        allocator: &dyn SharedAllocator,
        thread_name: &str,
    ) -> Result<Arc<RpcSignals>> {
        let mut rpc = self.rpc.lock();
        if let Some(signals) = rpc.as_ref() {
            return Ok(signals.clone());
        }

        let counters = match self.side {
            Side::Host => {
                let buffer = allocator
                    .allocate(&format!("dspq-counters-{}", self.id), COUNTER_ARRAY_SIZE)
                    .map_err(|e| {
                        tracing::warn!(domain = %self.id, error = %e, "failed to allocate counter array");
                        QueueError::NoResources
                    })?;
                self.remote.share_counters(&buffer).map_err(|e| self.escalated(e))?;
                buffer
            }
            Side::Remote => self
                .remote
                .attached_counters()
                .map_err(|e| self.escalated(e))?,
        };

        let weak = Arc::downgrade(self);
        let on_failure: FailureHook = Arc::new(move |error| {
            if let Some(entry) = weak.upgrade() {
                entry.mark_dead(error);
            }
        });
        let signals = RpcSignals::start(
            self.id,
            self.side,
            self.remote.clone(),
            counters,
            self.health.clone(),
            on_failure,
            thread_name,
        )?;
        *rpc = Some(signals.clone());
        Ok(signals)
    }

    /// Mark the domain dead if `error` is fatal for it.
    pub(crate) fn escalate(&self, error: QueueError) {
        if error.is_domain_fatal() {
            self.mark_dead(error);
        }
    }

    pub(crate) fn escalated(&self, error: QueueError) -> QueueError {
        self.escalate(error);
        error
    }

    /// Fail every queue on the domain with `error` and wake their waiters.
    pub(crate) fn mark_dead(&self, error: QueueError) {
        if !self.health.set(error) {
            return;
        }
        let queues: Vec<Arc<QueueInner>> = self
            .slots
            .lock()
            .iter()
            .filter_map(|s| match s {
                Slot::Active(q) => q.upgrade(),
                _ => None,
            })
            .collect();
        tracing::error!(domain = %self.id, %error, queues = queues.len(), "domain dead");
        for queue in queues {
            queue.cancel_waiters();
        }
    }

    /// Release domain-wide signaling. Called once the last slot is free.
    pub(crate) fn teardown(&self) {
        let rpc = self.rpc.lock().take();
        if let Some(signals) = rpc {
            signals.shutdown();
        }
        tracing::debug!(domain = %self.id, "domain released");
    }
}
