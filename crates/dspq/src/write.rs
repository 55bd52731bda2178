//! Write path.

use std::sync::atomic::Ordering;

use dspq_shm::packet::{self, PacketHeader};
use dspq_shm::{BufferFlags, BufferRef, CodecError, PacketFlags, MAX_BUFFERS, MAX_MESSAGE_SIZE};

use crate::error::{QueueError, Result};
use crate::mapping::{sync_buffers, RefTransaction};
use crate::queue::{Queue, QueueInner};

impl Queue {
    /// Write one packet if there is room for it right now.
    ///
    /// Returns `WouldBlock` without touching the ring when it is full.
    /// Buffers flagged `REF` take a mapping reference; if any of them is not
    /// mapped to the domain the call fails with `NoSuchMapping` and no
    /// reference is kept.
    pub fn write_noblock(
        &self,
        flags: PacketFlags,
        buffers: &[BufferRef],
        message: &[u8],
    ) -> Result<()> {
        let inner = &*self.inner;
        inner.check_usable()?;
        if flags.intersects(PacketFlags::INTERNAL)
            || buffers.len() > MAX_BUFFERS
            || message.len() > MAX_MESSAGE_SIZE
        {
            return Err(QueueError::BadParameter);
        }
        let _guard = inner.write_lock.lock();
        inner.write_packet(flags, buffers, message)
    }

    /// Write one packet, waiting up to `timeout_us` for room.
    ///
    /// `0` does not wait; [`WAIT_INFINITE`](crate::WAIT_INFINITE) waits
    /// until room appears or the queue is closed.
    pub fn write(
        &self,
        flags: PacketFlags,
        buffers: &[BufferRef],
        message: &[u8],
        timeout_us: u32,
    ) -> Result<()> {
        let inner = &*self.inner;
        inner.block_on(
            inner.side.outbound_space(),
            inner.outbound.write.wait_count(),
            timeout_us,
            || self.write_noblock(flags, buffers, message),
        )
    }

    /// Tell the reader a packet with `upcoming` flags is about `delay_us`
    /// away, so it can spin briefly instead of sleeping.
    ///
    /// Advisory: when the ring is full the hint is dropped and `WouldBlock`
    /// returned.
    pub fn write_early_wakeup_noblock(&self, delay_us: u32, upcoming: PacketFlags) -> Result<()> {
        let inner = &*self.inner;
        inner.check_usable()?;
        let flags = PacketFlags::WAKEUP | (upcoming - PacketFlags::INTERNAL);
        let hint = delay_us.to_le_bytes();
        let message: &[u8] = if delay_us > 0 { &hint } else { &[] };

        let _guard = inner.write_lock.lock();
        match inner.write_packet(flags, &[], message) {
            Err(QueueError::WouldBlock) => {
                tracing::warn!(domain = %inner.entry.id, slot = inner.slot, delay_us, "ring full, early wakeup dropped");
                Err(QueueError::WouldBlock)
            }
            other => other,
        }
    }
}

impl QueueInner {
    /// Encode and publish one packet. Caller holds the write lock.
    pub(crate) fn write_packet(
        &self,
        flags: PacketFlags,
        buffers: &[BufferRef],
        message: &[u8],
    ) -> Result<()> {
        let dir = &self.outbound;
        let ring_len = dir.ring.len();
        let len = packet::packet_len(buffers.len(), message.len());
        if len + 8 > ring_len {
            return Err(QueueError::BadParameter);
        }

        let (read_pos, write_pos) = dir.positions().map_err(|e| self.corrupted(&e))?;
        let used = (write_pos + ring_len - read_pos) % ring_len;
        let free = ring_len.saturating_sub(used + 8);
        if packet::space_needed(write_pos, len, ring_len) > free {
            return Err(QueueError::WouldBlock);
        }

        let domain = self.entry.id;
        let mappings = &*self.runtime.mappings;
        let mut refs = RefTransaction::new(mappings, domain);
        refs.apply_flagged(buffers, BufferFlags::REF, 1)?;

        let sequence = dir.write.packet_count().load(Ordering::Relaxed) as u8;
        let encoded = PacketHeader::new(flags, buffers.len(), message.len(), sequence)
            .and_then(|header| packet::encode(&dir.ring, write_pos, header, buffers, message));
        let next = match encoded {
            Ok(next) => next,
            Err(e) => {
                refs.rollback();
                return Err(self.codec_error(e));
            }
        };
        sync_buffers(
            mappings,
            domain,
            buffers,
            BufferFlags::FLUSH_SENDER,
            BufferFlags::INVALIDATE_SENDER,
        );
        refs.commit();

        dir.write.position().store(next, Ordering::Release);
        dir.write.packet_count().fetch_add(1, Ordering::Release);
        self.notify(self.side.outbound_packet(), dir.read.wait_count());
        Ok(())
    }

    pub(crate) fn codec_error(&self, e: CodecError) -> QueueError {
        match e {
            CodecError::Corrupted { .. } => self.corrupted(&e),
            other => other.into(),
        }
    }
}
