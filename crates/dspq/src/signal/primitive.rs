use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Doorbell, SignalChannel, WaitOutcome};
use crate::error::Result;
use crate::remote::DomainId;

/// The driver's cross-domain signal primitive.
///
/// Signals on one id coalesce; delivery is reliable but unordered across
/// ids. Ids are allocated by the caller from a range reserved for queues.
pub trait SignalPrimitive: Send + Sync {
    /// Whether the primitive exists on this side at all.
    fn is_available(&self) -> bool;

    fn create(&self, domain: DomainId, id: u32) -> Result<()>;

    fn destroy(&self, domain: DomainId, id: u32) -> Result<()>;

    fn signal(&self, domain: DomainId, id: u32) -> Result<()>;

    fn wait(&self, domain: DomainId, id: u32, timeout_us: u32) -> Result<WaitOutcome>;

    /// Wake every local waiter on `id` with `Cancelled`.
    fn cancel_wait(&self, domain: DomainId, id: u32) -> Result<()>;
}

/// Doorbells backed by four signal-primitive ids.
pub(crate) struct PrimitiveChannel {
    primitive: Arc<dyn SignalPrimitive>,
    domain: DomainId,
    ids: [u32; 4],
    cancelled: AtomicBool,
}

impl PrimitiveChannel {
    /// Create the four ids of `slot`. Ids already created are destroyed again
    /// if a later one fails.
    pub(crate) fn open(
        primitive: Arc<dyn SignalPrimitive>,
        domain: DomainId,
        id_base: u32,
        slot: u32,
    ) -> Result<Self> {
        let ids = Doorbell::ALL.map(|bell| id_base + slot * 4 + bell.index() as u32);
        for (i, id) in ids.iter().enumerate() {
            if let Err(e) = primitive.create(domain, *id) {
                for created in &ids[..i] {
                    let _ = primitive.destroy(domain, *created);
                }
                return Err(e);
            }
        }
        tracing::debug!(%domain, slot, first_id = ids[0], "signal primitive ids created");
        Ok(Self {
            primitive,
            domain,
            ids,
            cancelled: AtomicBool::new(false),
        })
    }

    #[inline]
    fn id(&self, bell: Doorbell) -> u32 {
        self.ids[bell.index()]
    }
}

impl SignalChannel for PrimitiveChannel {
    fn send(&self, bell: Doorbell) -> Result<()> {
        self.primitive.signal(self.domain, self.id(bell))
    }

    fn wait(&self, bell: Doorbell, timeout_us: u32) -> Result<WaitOutcome> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(WaitOutcome::Cancelled);
        }
        self.primitive.wait(self.domain, self.id(bell), timeout_us)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        for id in self.ids {
            if let Err(e) = self.primitive.cancel_wait(self.domain, id) {
                tracing::warn!(domain = %self.domain, id, error = %e, "cancel_wait failed");
            }
        }
    }

    fn close(&self) {
        for id in self.ids {
            if let Err(e) = self.primitive.destroy(self.domain, id) {
                tracing::warn!(domain = %self.domain, id, error = %e, "failed to destroy signal id");
            }
        }
    }
}
