//! One logical queue replicated across several domains.
//!
//! Writes go to every member in order. Reads scan the members and return
//! the first packet found. If a write fails part way the members disagree,
//! so the whole queue is marked bad and every later operation fails with
//! `BadState`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use dspq_shm::{BufferRef, PacketFlags};

use crate::config::CreateOptions;
use crate::error::{QueueError, Result};
use crate::queue::Queue;
use crate::read::PacketInfo;
use crate::remote::DomainId;
use crate::runtime::Runtime;
use crate::stats::QueueStats;

/// The ordered set of domains a [`MultiDomainQueue`] spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiDomainContext {
    domains: Vec<DomainId>,
}

impl MultiDomainContext {
    /// Fails with `BadParameter` if `domains` is empty or repeats a domain.
    pub fn new(domains: Vec<DomainId>) -> Result<Self> {
        if domains.is_empty() {
            return Err(QueueError::BadParameter);
        }
        let mut seen = HashSet::with_capacity(domains.len());
        if !domains.iter().all(|d| seen.insert(*d)) {
            return Err(QueueError::BadParameter);
        }
        Ok(Self { domains })
    }

    pub fn domains(&self) -> &[DomainId] {
        &self.domains
    }
}

#[derive(Debug)]
pub struct MultiDomainQueue {
    members: Vec<Queue>,
    bad: AtomicBool,
    closed: AtomicBool,
}

impl MultiDomainQueue {
    /// Create one member queue per domain in `context`.
    ///
    /// If any member fails, the ones already created are closed again.
    pub fn create(runtime: &Runtime, context: &MultiDomainContext, options: CreateOptions) -> Result<Self> {
        let mut members = Vec::with_capacity(context.domains.len());
        for &domain in &context.domains {
            match runtime.create(domain, options.clone()) {
                Ok(queue) => members.push(queue),
                Err(e) => {
                    tracing::warn!(%domain, error = %e, "multi-domain member failed, rolling back");
                    for queue in &members {
                        if let Err(close_err) = queue.close() {
                            tracing::warn!(domain = %queue.domain(), error = %close_err, "rollback close failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            members,
            bad: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.bad.load(Ordering::Acquire) {
            return Err(QueueError::BadState);
        }
        Ok(())
    }

    pub fn members(&self) -> &[Queue] {
        &self.members
    }

    pub fn domains(&self) -> Vec<DomainId> {
        self.members.iter().map(Queue::domain).collect()
    }

    /// Remote ids of the members, in domain order.
    pub fn export(&self) -> Vec<u64> {
        self.members.iter().map(Queue::export).collect()
    }

    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }

    pub fn write_noblock(
        &self,
        flags: PacketFlags,
        buffers: &[BufferRef],
        message: &[u8],
    ) -> Result<()> {
        self.replicate(|queue| queue.write_noblock(flags, buffers, message))
    }

    pub fn write(
        &self,
        flags: PacketFlags,
        buffers: &[BufferRef],
        message: &[u8],
        timeout_us: u32,
    ) -> Result<()> {
        self.replicate(|queue| queue.write(flags, buffers, message, timeout_us))
    }

    /// Apply `op` to every member. A failure on the first member leaves the
    /// set consistent; a failure on any later one does not.
    fn replicate(&self, mut op: impl FnMut(&Queue) -> Result<()>) -> Result<()> {
        self.check_usable()?;
        for (index, queue) in self.members.iter().enumerate() {
            if let Err(e) = op(queue) {
                if index == 0 {
                    return Err(e);
                }
                tracing::error!(
                    domain = %queue.domain(),
                    member = index,
                    error = %e,
                    "partial multi-domain write, queue is now unusable"
                );
                self.bad.store(true, Ordering::Release);
                return Err(QueueError::BadState);
            }
        }
        Ok(())
    }

    /// Read the first packet available on any member.
    pub fn read_noblock(
        &self,
        buffers: &mut [BufferRef],
        message: &mut [u8],
    ) -> Result<(DomainId, PacketInfo)> {
        self.scan(|queue| queue.read_noblock(&mut *buffers, &mut *message))
    }

    pub fn peek_noblock(&self) -> Result<(DomainId, PacketInfo)> {
        self.scan(Queue::peek_noblock)
    }

    fn scan(&self, mut op: impl FnMut(&Queue) -> Result<PacketInfo>) -> Result<(DomainId, PacketInfo)> {
        self.check_usable()?;
        for queue in &self.members {
            match op(queue) {
                Err(QueueError::WouldBlock) => continue,
                Ok(info) => return Ok((queue.domain(), info)),
                Err(e) => return Err(e),
            }
        }
        Err(QueueError::WouldBlock)
    }

    /// Blocking read. Only supported with a single member.
    pub fn read(
        &self,
        buffers: &mut [BufferRef],
        message: &mut [u8],
        timeout_us: u32,
    ) -> Result<(DomainId, PacketInfo)> {
        let queue = self.single()?;
        queue
            .read(buffers, message, timeout_us)
            .map(|info| (queue.domain(), info))
    }

    /// Blocking peek. Only supported with a single member.
    pub fn peek(&self, timeout_us: u32) -> Result<(DomainId, PacketInfo)> {
        let queue = self.single()?;
        queue.peek(timeout_us).map(|info| (queue.domain(), info))
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.single()?.stats()
    }

    fn single(&self) -> Result<&Queue> {
        self.check_usable()?;
        match self.members.as_slice() {
            [queue] => Ok(queue),
            _ => Err(QueueError::Unsupported),
        }
    }

    /// Close every member. All are attempted; the first error is returned
    /// and a later call retries only the members still open.
    pub fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::BadState);
        }
        let mut first = None;
        for queue in self.members.iter().filter(|q| !q.is_closed()) {
            if let Err(e) = queue.close() {
                tracing::warn!(domain = %queue.domain(), error = %e, "member close failed");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => {
                self.closed.store(true, Ordering::Release);
                Ok(())
            }
        }
    }
}

impl Runtime {
    pub fn create_multi(&self, context: &MultiDomainContext, options: CreateOptions) -> Result<MultiDomainQueue> {
        MultiDomainQueue::create(self, context, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_rejects_empty_and_duplicates() {
        assert_eq!(MultiDomainContext::new(vec![]), Err(QueueError::BadParameter));
        assert_eq!(
            MultiDomainContext::new(vec![DomainId::new(1), DomainId::new(1)]),
            Err(QueueError::BadParameter)
        );
        let ctx = MultiDomainContext::new(vec![DomainId::new(2), DomainId::new(1)]).unwrap();
        assert_eq!(ctx.domains(), &[DomainId::new(2), DomainId::new(1)]);
    }
}
