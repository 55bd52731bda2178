//! Reference counting of externally mapped buffers.

use std::collections::HashMap;

use dspq_shm::{BufferFlags, BufferRef};
use parking_lot::Mutex;

use crate::error::{QueueError, Result};
use crate::remote::DomainId;

/// Cache maintenance requested by buffer flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Flush,
    Invalidate,
}

/// The buffer-mapping table owned by the session layer.
pub trait BufferMappings: Send + Sync {
    /// Adjust the reference count of the mapping of `fd` into `domain`.
    ///
    /// Fails with `NoSuchMapping` if the buffer is not mapped there.
    fn adjust_ref(&self, domain: DomainId, fd: i32, delta: i32) -> Result<()>;

    /// Perform cache maintenance on a buffer. Best effort.
    fn sync(&self, domain: DomainId, buffer: &BufferRef, op: CacheOp) -> Result<()> {
        let _ = (domain, buffer, op);
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Mapping {
    refs: u32,
    flushes: u64,
    invalidates: u64,
}

/// In-process mapping table.
#[derive(Debug, Default)]
pub struct MappingTable {
    entries: Mutex<HashMap<(DomainId, i32), Mapping>>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `fd` is mapped into `domain`.
    pub fn map(&self, domain: DomainId, fd: i32) {
        self.entries.lock().entry((domain, fd)).or_default();
    }

    /// Remove a mapping. Fails with `ItemBusy` while references remain.
    pub fn unmap(&self, domain: DomainId, fd: i32) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get(&(domain, fd)) {
            None => Err(QueueError::NoSuchMapping),
            Some(m) if m.refs > 0 => Err(QueueError::ItemBusy),
            Some(_) => {
                entries.remove(&(domain, fd));
                Ok(())
            }
        }
    }

    pub fn refs(&self, domain: DomainId, fd: i32) -> Option<u32> {
        self.entries.lock().get(&(domain, fd)).map(|m| m.refs)
    }

    /// Number of (flush, invalidate) operations recorded for a mapping.
    pub fn sync_counts(&self, domain: DomainId, fd: i32) -> Option<(u64, u64)> {
        self.entries
            .lock()
            .get(&(domain, fd))
            .map(|m| (m.flushes, m.invalidates))
    }
}

impl BufferMappings for MappingTable {
    fn adjust_ref(&self, domain: DomainId, fd: i32, delta: i32) -> Result<()> {
        let mut entries = self.entries.lock();
        let mapping = entries
            .get_mut(&(domain, fd))
            .ok_or(QueueError::NoSuchMapping)?;
        mapping.refs = mapping
            .refs
            .checked_add_signed(delta)
            .ok_or(QueueError::BadParameter)?;
        Ok(())
    }

    fn sync(&self, domain: DomainId, buffer: &BufferRef, op: CacheOp) -> Result<()> {
        let mut entries = self.entries.lock();
        let mapping = entries
            .get_mut(&(domain, buffer.fd))
            .ok_or(QueueError::NoSuchMapping)?;
        match op {
            CacheOp::Flush => mapping.flushes += 1,
            CacheOp::Invalidate => mapping.invalidates += 1,
        }
        Ok(())
    }
}

/// Reference adjustments made for one packet.
///
/// Adjustments are recorded as they are applied. If a later step fails the
/// caller rolls back exactly what was applied; dropping the transaction
/// without `commit` or `rollback` keeps the adjustments.
pub(crate) struct RefTransaction<'a> {
    mappings: &'a dyn BufferMappings,
    domain: DomainId,
    applied: Vec<(i32, i32)>,
}

impl<'a> RefTransaction<'a> {
    pub(crate) fn new(mappings: &'a dyn BufferMappings, domain: DomainId) -> Self {
        Self {
            mappings,
            domain,
            applied: Vec::new(),
        }
    }

    /// Apply `delta` to every buffer carrying `flag`. On failure, everything
    /// applied so far by this transaction is undone.
    pub(crate) fn apply_flagged(
        &mut self,
        buffers: &[BufferRef],
        flag: BufferFlags,
        delta: i32,
    ) -> Result<()> {
        for buffer in buffers.iter().filter(|b| b.flags.contains(flag)) {
            if let Err(e) = self.mappings.adjust_ref(self.domain, buffer.fd, delta) {
                self.rollback();
                return Err(e);
            }
            self.applied.push((buffer.fd, delta));
        }
        Ok(())
    }

    pub(crate) fn rollback(&mut self) {
        for (fd, delta) in self.applied.drain(..).rev() {
            if let Err(e) = self.mappings.adjust_ref(self.domain, fd, -delta) {
                tracing::warn!(domain = %self.domain, fd, error = %e, "failed to undo buffer reference");
            }
        }
    }

    pub(crate) fn commit(mut self) {
        self.applied.clear();
    }
}

/// Forward cache maintenance flags for one side of a transfer.
pub(crate) fn sync_buffers(
    mappings: &dyn BufferMappings,
    domain: DomainId,
    buffers: &[BufferRef],
    flush: BufferFlags,
    invalidate: BufferFlags,
) {
    for buffer in buffers {
        for (flag, op) in [(flush, CacheOp::Flush), (invalidate, CacheOp::Invalidate)] {
            if buffer.flags.contains(flag) {
                if let Err(e) = mappings.sync(domain, buffer, op) {
                    tracing::warn!(%domain, fd = buffer.fd, ?op, error = %e, "cache maintenance failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: DomainId = DomainId::new(1);

    fn refd(fd: i32) -> BufferRef {
        BufferRef::new(fd, 0, 64).with_flags(BufferFlags::REF)
    }

    #[test]
    fn unmapped_buffer_is_rejected() {
        let table = MappingTable::new();
        assert_eq!(table.adjust_ref(D, 5, 1), Err(QueueError::NoSuchMapping));
        table.map(D, 5);
        table.adjust_ref(D, 5, 1).unwrap();
        assert_eq!(table.refs(D, 5), Some(1));
        assert_eq!(table.unmap(D, 5), Err(QueueError::ItemBusy));
        table.adjust_ref(D, 5, -1).unwrap();
        table.unmap(D, 5).unwrap();
    }

    #[test]
    fn refs_never_go_negative() {
        let table = MappingTable::new();
        table.map(D, 1);
        assert_eq!(table.adjust_ref(D, 1, -1), Err(QueueError::BadParameter));
        assert_eq!(table.refs(D, 1), Some(0));
    }

    #[test]
    fn failed_transaction_rolls_back_earlier_adjustments() {
        let table = MappingTable::new();
        table.map(D, 1);
        table.map(D, 2);
        // fd 3 is not mapped.
        let buffers = [refd(1), refd(2), refd(3)];

        let mut tx = RefTransaction::new(&table, D);
        assert_eq!(
            tx.apply_flagged(&buffers, BufferFlags::REF, 1),
            Err(QueueError::NoSuchMapping)
        );
        assert_eq!(table.refs(D, 1), Some(0));
        assert_eq!(table.refs(D, 2), Some(0));
    }

    #[test]
    fn explicit_rollback_after_later_failure() {
        let table = MappingTable::new();
        table.map(D, 1);
        let mut tx = RefTransaction::new(&table, D);
        tx.apply_flagged(&[refd(1)], BufferFlags::REF, 1).unwrap();
        assert_eq!(table.refs(D, 1), Some(1));
        tx.rollback();
        assert_eq!(table.refs(D, 1), Some(0));

        let mut tx = RefTransaction::new(&table, D);
        tx.apply_flagged(&[refd(1)], BufferFlags::REF, 1).unwrap();
        tx.commit();
        assert_eq!(table.refs(D, 1), Some(1));
    }

    #[test]
    fn cache_flags_are_forwarded() {
        let table = MappingTable::new();
        table.map(D, 9);
        let buffer = BufferRef::new(9, 0, 16)
            .with_flags(BufferFlags::FLUSH_SENDER | BufferFlags::INVALIDATE_RECIPIENT);
        sync_buffers(&table, D, &[buffer], BufferFlags::FLUSH_SENDER, BufferFlags::INVALIDATE_SENDER);
        assert_eq!(table.sync_counts(D, 9), Some((1, 0)));
        sync_buffers(
            &table,
            D,
            &[buffer],
            BufferFlags::FLUSH_RECIPIENT,
            BufferFlags::INVALIDATE_RECIPIENT,
        );
        assert_eq!(table.sync_counts(D, 9), Some((1, 1)));
    }
}
