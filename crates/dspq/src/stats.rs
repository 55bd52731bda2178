//! Per-queue statistics: live ring depths and early-wakeup accounting.

use std::sync::atomic::Ordering;

use crate::error::{QueueError, Result};
use crate::queue::Queue;
use crate::signal::SignalingMode;

/// A snapshot of one queue endpoint.
///
/// Packet and byte counts are what is queued right now, from the live ring
/// state. The early-wakeup figures accumulate between calls and are reset by
/// each call to [`Queue::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Packets waiting for this endpoint to read.
    pub read_packets: u32,
    pub read_bytes: u32,
    /// Packets this endpoint wrote that the peer has not read yet.
    pub write_packets: u32,
    pub write_bytes: u32,
    pub early_wakeup_wait_us: u64,
    pub early_wakeup_misses: u64,
    pub signaling: SignalingMode,
}

impl Queue {
    pub fn stats(&self) -> Result<QueueStats> {
        let inner = &*self.inner;
        if inner.is_closed() {
            return Err(QueueError::BadState);
        }
        inner.inbound.positions().map_err(|e| inner.corrupted(&e))?;
        inner.outbound.positions().map_err(|e| inner.corrupted(&e))?;
        Ok(QueueStats {
            read_packets: inner.inbound.queued_packets(),
            read_bytes: inner.inbound.used_bytes(),
            write_packets: inner.outbound.queued_packets(),
            write_bytes: inner.outbound.used_bytes(),
            early_wakeup_wait_us: inner.early_wakeup_wait_us.swap(0, Ordering::Relaxed),
            early_wakeup_misses: inner.early_wakeup_misses.swap(0, Ordering::Relaxed),
            signaling: self.signaling_mode(),
        })
    }
}
