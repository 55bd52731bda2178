//! Contracts for the remote side of a domain.
//!
//! Session bootstrap (opening the device, attaching to the remote process)
//! lives outside this crate. Everything the queue engine needs from it is
//! expressed by [`RemoteDomain`] and [`DomainConnector`].

use std::fmt;
use std::sync::Arc;

use dspq_shm::SharedBuffer;

use crate::error::Result;

/// An effective domain id: a physical domain plus a session index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(u32);

const SESSION_SHIFT: u32 = 8;
const DOMAIN_MASK: u32 = (1 << SESSION_SHIFT) - 1;

impl DomainId {
    /// Largest physical domain number.
    pub const MAX_PHYSICAL: u32 = DOMAIN_MASK;

    /// A physical domain with session 0.
    ///
    /// # Panics
    ///
    /// If `domain` is above [`MAX_PHYSICAL`](Self::MAX_PHYSICAL). Use
    /// [`try_new`](Self::try_new) for untrusted input.
    pub const fn new(domain: u32) -> Self {
        assert!(domain <= DOMAIN_MASK, "physical domain id out of range");
        Self(domain)
    }

    pub const fn try_new(domain: u32) -> Option<Self> {
        if domain > DOMAIN_MASK {
            return None;
        }
        Some(Self(domain))
    }

    /// Combine a physical domain with a session index.
    ///
    /// # Panics
    ///
    /// If `domain` is above [`MAX_PHYSICAL`](Self::MAX_PHYSICAL) or the
    /// session does not fit above it.
    pub const fn effective(domain: u32, session: u32) -> Self {
        assert!(domain <= DOMAIN_MASK, "physical domain id out of range");
        assert!(session <= u32::MAX >> SESSION_SHIFT, "session index out of range");
        Self((session << SESSION_SHIFT) | domain)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn physical(self) -> u32 {
        self.0 & DOMAIN_MASK
    }

    pub const fn session(self) -> u32 {
        self.0 >> SESSION_SHIFT
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.session() == 0 {
            write!(f, "{}", self.physical())
        } else {
            write!(f, "{}/{}", self.physical(), self.session())
        }
    }
}

/// Outcome of a blocking "wait for doorbell" call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSignal {
    /// The remote side rang the doorbell.
    Signal,
    /// The wait was cancelled; the receiving thread should exit.
    Exit,
}

/// What the remote endpoint learns when it resolves an exported queue id.
#[derive(Debug, Clone)]
pub struct ImportedQueue {
    /// The queue's shared region, mapped locally.
    pub buffer: SharedBuffer,
    /// Slot the creating side registered the queue under.
    pub slot: u32,
}

/// Calls into the process on the other side of a domain.
///
/// Host endpoints use `create_queue`, `destroy_queue` and `is_imported`;
/// remote endpoints use `import_queue` and `release_import`. Both use the
/// doorbell and counter calls for fallback signaling.
pub trait RemoteDomain: Send + Sync {
    /// Register a queue region with the remote side.
    ///
    /// The header in `buffer` carries the version and flags; a capable remote
    /// rejects the probe version with `Unsupported`.
    fn create_queue(&self, slot: u32, buffer: &SharedBuffer, generation: u32) -> Result<u64>;

    fn destroy_queue(&self, remote_id: u64) -> Result<()>;

    /// Whether the remote endpoint still has the queue imported.
    fn is_imported(&self, remote_id: u64) -> Result<bool>;

    /// Resolve an exported id. Fails with `ItemBusy` if already imported.
    fn import_queue(&self, remote_id: u64) -> Result<ImportedQueue>;

    fn release_import(&self, remote_id: u64) -> Result<()>;

    /// Block until the other side rings this side's doorbell.
    fn wait_signal(&self) -> Result<RemoteSignal>;

    /// Make a pending or future `wait_signal` return `Exit`.
    fn cancel_wait_signal(&self) -> Result<()>;

    /// Ring the other side's doorbell.
    fn signal(&self) -> Result<()>;

    /// Hand the per-domain counter array to the remote side.
    fn share_counters(&self, counters: &SharedBuffer) -> Result<()>;

    /// The counter array the creating side shared.
    fn attached_counters(&self) -> Result<SharedBuffer>;

    /// Whether the remote side can use the driver signal primitive.
    fn driver_signaling_supported(&self) -> bool {
        false
    }
}

/// Resolves domain ids to remote handles.
pub trait DomainConnector: Send + Sync {
    fn connect(&self, domain: DomainId) -> Result<Arc<dyn RemoteDomain>>;
}

impl<F> DomainConnector for F
where
    F: Fn(DomainId) -> Result<Arc<dyn RemoteDomain>> + Send + Sync,
{
    fn connect(&self, domain: DomainId) -> Result<Arc<dyn RemoteDomain>> {
        self(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_ids_keep_session() {
        let id = DomainId::effective(3, 2);
        assert_eq!(id.physical(), 3);
        assert_eq!(id.session(), 2);
        assert_eq!(id.to_string(), "3/2");
        assert_eq!(DomainId::new(3).to_string(), "3");
        assert_ne!(id, DomainId::new(3));
    }

    #[test]
    fn out_of_range_domains_are_rejected() {
        assert_eq!(DomainId::try_new(255), Some(DomainId::new(255)));
        assert_eq!(DomainId::try_new(256), None);
        assert_eq!(DomainId::try_new(257), None);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn new_panics_instead_of_aliasing() {
        let _ = DomainId::new(257);
    }
}
