//! Read and peek paths.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use dspq_shm::packet::{self, Located, PacketHeader};
use dspq_shm::{BufferFlags, BufferRef, PacketFlags};

use crate::error::{QueueError, Result};
use crate::mapping::{sync_buffers, RefTransaction};
use crate::queue::{Queue, QueueInner};

/// What a packet carries, without its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// Flags as written; ready bits are stripped.
    pub flags: PacketFlags,
    pub buffer_count: usize,
    pub message_len: usize,
}

impl From<&PacketHeader> for PacketInfo {
    fn from(header: &PacketHeader) -> Self {
        Self {
            flags: header.flags - PacketFlags::READY,
            buffer_count: header.buffer_count as usize,
            message_len: header.message_len as usize,
        }
    }
}

impl Queue {
    /// Describe the next packet without consuming it.
    pub fn peek_noblock(&self) -> Result<PacketInfo> {
        let inner = &*self.inner;
        inner.check_usable()?;
        let _guard = inner.read_lock.lock();
        inner.peek_packet()
    }

    pub fn peek(&self, timeout_us: u32) -> Result<PacketInfo> {
        let inner = &*self.inner;
        inner.block_on(
            inner.side.inbound_packet(),
            inner.inbound.read.wait_count(),
            timeout_us,
            || self.peek_noblock(),
        )
    }

    /// Read the next packet into `buffers` and `message`.
    ///
    /// Fails with `BadParameter`, leaving the packet in place, when either
    /// output is too small for it. Early-wakeup packets are consumed here:
    /// the call then polls for the real packet for up to the hinted delay
    /// before returning `WouldBlock`.
    pub fn read_noblock(&self, buffers: &mut [BufferRef], message: &mut [u8]) -> Result<PacketInfo> {
        let inner = &*self.inner;
        inner.check_usable()?;
        let _guard = inner.read_lock.lock();
        inner.read_packet(buffers, message)
    }

    pub fn read(
        &self,
        buffers: &mut [BufferRef],
        message: &mut [u8],
        timeout_us: u32,
    ) -> Result<PacketInfo> {
        let inner = &*self.inner;
        inner.block_on(
            inner.side.inbound_packet(),
            inner.inbound.read.wait_count(),
            timeout_us,
            || self.read_noblock(&mut *buffers, &mut *message),
        )
    }
}

impl QueueInner {
    /// The packet at the read position, with its position.
    fn next_packet(&self) -> Result<(u32, Located)> {
        let dir = &self.inbound;
        let ring_len = dir.ring.len();
        let (read_pos, write_pos) = dir.positions().map_err(|e| self.corrupted(&e))?;
        if read_pos == write_pos {
            return Err(QueueError::WouldBlock);
        }
        let located = packet::locate(&dir.ring, read_pos).map_err(|e| self.codec_error(e))?;

        let used = (write_pos + ring_len - read_pos) % ring_len;
        if packet::space_needed(read_pos, located.header.packet_len(), ring_len) > used {
            return Err(self.corrupted(&format_args!(
                "packet at {read_pos} extends past write position {write_pos}"
            )));
        }
        let expected = dir.read.packet_count().load(Ordering::Relaxed) as u8;
        if located.header.sequence != expected {
            return Err(self.corrupted(&format_args!(
                "sequence {} at {read_pos}, expected {expected}",
                located.header.sequence
            )));
        }
        Ok((read_pos, located))
    }

    /// Advance past a packet and tell a waiting writer about the space.
    fn consume(&self, next: u32) {
        let dir = &self.inbound;
        dir.read.position().store(next, Ordering::Release);
        dir.read.packet_count().fetch_add(1, Ordering::Release);
        self.notify(self.side.inbound_space(), dir.write.wait_count());
    }

    pub(crate) fn peek_packet(&self) -> Result<PacketInfo> {
        loop {
            let (_, located) = self.next_packet()?;
            if located.header.flags.contains(PacketFlags::WAKEUP) {
                self.consume(located.next);
                continue;
            }
            return Ok(PacketInfo::from(&located.header));
        }
    }

    pub(crate) fn read_packet(
        &self,
        buffers: &mut [BufferRef],
        message: &mut [u8],
    ) -> Result<PacketInfo> {
        let (pos, located) = self.next_packet()?;
        if located.header.flags.contains(PacketFlags::WAKEUP) {
            let hint = self.wakeup_hint(pos, &located)?;
            self.consume(located.next);
            return self.await_after_wakeup(hint, buffers, message);
        }
        self.take_packet(pos, &located, buffers, message)
    }

    fn take_packet(
        &self,
        pos: u32,
        located: &Located,
        buffers: &mut [BufferRef],
        message: &mut [u8],
    ) -> Result<PacketInfo> {
        let header = &located.header;
        let count = header.buffer_count as usize;
        if buffers.len() < count || message.len() < header.message_len as usize {
            return Err(QueueError::BadParameter);
        }
        let (_, next) = packet::decode(&self.inbound.ring, pos, buffers, message)
            .map_err(|e| self.codec_error(e))?;

        let taken = &buffers[..count];
        let domain = self.entry.id;
        let mappings = &*self.runtime.mappings;
        let mut refs = RefTransaction::new(mappings, domain);
        refs.apply_flagged(taken, BufferFlags::DEREF, -1)?;
        sync_buffers(
            mappings,
            domain,
            taken,
            BufferFlags::FLUSH_RECIPIENT,
            BufferFlags::INVALIDATE_RECIPIENT,
        );
        refs.commit();

        self.consume(next);
        Ok(PacketInfo::from(header))
    }

    fn wakeup_hint(&self, pos: u32, located: &Located) -> Result<u32> {
        let header = &located.header;
        if header.buffer_count != 0 || header.message_len > 4 {
            return Err(self.corrupted(&format_args!("malformed early wakeup packet at {pos}")));
        }
        if header.message_len < 4 {
            return Ok(0);
        }
        let mut raw = [0u8; 4];
        packet::decode(&self.inbound.ring, pos, &mut [], &mut raw).map_err(|e| self.codec_error(e))?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Poll for the packet an early wakeup announced.
    fn await_after_wakeup(
        &self,
        hint_us: u32,
        buffers: &mut [BufferRef],
        message: &mut [u8],
    ) -> Result<PacketInfo> {
        let config = &self.runtime.config;
        let budget = Duration::from_micros(hint_us.min(config.early_wakeup_max_us) as u64);
        let poll = Duration::from_micros(config.early_wakeup_poll_us.max(1) as u64);
        let start = Instant::now();
        loop {
            match self.next_packet() {
                Ok((_, located)) if located.header.flags.contains(PacketFlags::WAKEUP) => {
                    self.consume(located.next);
                    continue;
                }
                Ok((pos, located)) => {
                    self.record_wakeup_wait(start, false);
                    return self.take_packet(pos, &located, buffers, message);
                }
                Err(QueueError::WouldBlock) => {}
                Err(e) => return Err(e),
            }
            let waited = start.elapsed();
            if waited >= budget {
                self.record_wakeup_wait(start, true);
                return Err(QueueError::WouldBlock);
            }
            thread::sleep(poll.min(budget - waited));
        }
    }

    fn record_wakeup_wait(&self, start: Instant, missed: bool) {
        let waited = start.elapsed().as_micros().min(u64::MAX as u128) as u64;
        self.early_wakeup_wait_us.fetch_add(waited, Ordering::Relaxed);
        if missed {
            self.early_wakeup_misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}
