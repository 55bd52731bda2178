//! Single-threaded driver for one direction of a queue region.
//!
//! The writer and reader here follow the same position and count protocol
//! as the `dspq` engine, but without locks or signaling, so a fuzzer can
//! drive the codec and the state blocks through arbitrary interleavings and
//! compare the result against a plain `VecDeque`.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use dspq_shm::packet::{self, CodecError};
use dspq_shm::{
    BufferRef, Direction, DirectionView, PacketFlags, PacketHeader, QueueLayout, SharedBuffer,
    MAX_BUFFERS,
};

/// Smallest ring the fuzzer builds.
pub const MIN_RING: u32 = 64;
/// Largest ring the fuzzer builds; small rings wrap more often.
pub const MAX_RING: u32 = 1024;
/// Message bytes per packet are capped so several packets fit.
pub const MAX_FUZZ_MESSAGE: usize = 200;
pub const MAX_FUZZ_BUFFERS: usize = 4;

/// A packet as the model remembers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPacket {
    pub flags: PacketFlags,
    pub buffers: Vec<BufferRef>,
    pub message: Vec<u8>,
}

impl ModelPacket {
    /// Build a packet from fuzzer bytes.
    pub fn generate(buffer_count: u8, message_len: u16, seed: u8) -> Self {
        let buffer_count = (buffer_count as usize) % (MAX_FUZZ_BUFFERS + 1);
        let message_len = (message_len as usize) % (MAX_FUZZ_MESSAGE + 1);
        let buffers = (0..buffer_count)
            .map(|i| BufferRef::new(seed as i32 + i as i32, (i as u32) * 64, 64))
            .collect::<Vec<_>>();
        let message = (0..message_len)
            .map(|i| seed.wrapping_add(i as u8).wrapping_mul(31))
            .collect::<Vec<_>>();
        let mut flags = PacketFlags::empty();
        if !buffers.is_empty() {
            flags |= PacketFlags::BUFFERS;
        }
        if !message.is_empty() {
            flags |= PacketFlags::MESSAGE;
        }
        Self {
            flags,
            buffers,
            message,
        }
    }

    pub fn encoded_len(&self) -> u32 {
        packet::packet_len(self.buffers.len(), self.message.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelError {
    Full,
    Empty,
    Codec(CodecError),
}

impl From<CodecError> for ModelError {
    fn from(e: CodecError) -> Self {
        ModelError::Codec(e)
    }
}

/// One direction of a freshly initialized queue region.
pub struct RingModel {
    // Keeps the mapping alive for `view`.
    _buffer: SharedBuffer,
    view: DirectionView,
}

impl RingModel {
    pub fn new(ring_size: u32) -> Result<Self, String> {
        let layout = QueueLayout::new(ring_size, 0).map_err(|e| e.to_string())?;
        let buffer = SharedBuffer::heap(layout.total_size as usize).map_err(|e| e.to_string())?;
        let header = layout
            .init(&buffer.region(), 1)
            .map_err(|e| e.to_string())?;
        let view = header
            .direction_view(Direction::Request)
            .map_err(|e| e.to_string())?;
        Ok(Self {
            _buffer: buffer,
            view,
        })
    }

    pub fn view(&self) -> &DirectionView {
        &self.view
    }

    pub fn ring_len(&self) -> u32 {
        self.view.ring.len()
    }

    pub fn write(&self, packet: &ModelPacket) -> Result<(), ModelError> {
        let dir = &self.view;
        let ring_len = dir.ring.len();
        let len = packet.encoded_len();
        if len + 8 > ring_len {
            return Err(CodecError::TooLarge { len, ring_len }.into());
        }
        let (_, write_pos) = dir.positions().map_err(|_| ModelError::Codec(CodecError::Corrupted {
            pos: 0,
            reason: "positions",
        }))?;
        if packet::space_needed(write_pos, len, ring_len) > dir.free_bytes() {
            return Err(ModelError::Full);
        }
        let sequence = dir.write.packet_count().load(Ordering::Relaxed) as u8;
        let header = PacketHeader::new(
            packet.flags,
            packet.buffers.len(),
            packet.message.len(),
            sequence,
        )?;
        let next = packet::encode(&dir.ring, write_pos, header, &packet.buffers, &packet.message)?;
        dir.write.position().store(next, Ordering::Release);
        dir.write.packet_count().fetch_add(1, Ordering::Release);
        Ok(())
    }

    pub fn peek(&self) -> Result<PacketHeader, ModelError> {
        let dir = &self.view;
        let read_pos = dir.read.position().load(Ordering::Acquire);
        if read_pos == dir.write.position().load(Ordering::Acquire) {
            return Err(ModelError::Empty);
        }
        Ok(packet::peek(&dir.ring, read_pos)?)
    }

    pub fn read(&self) -> Result<ModelPacket, ModelError> {
        let dir = &self.view;
        let read_pos = dir.read.position().load(Ordering::Acquire);
        if read_pos == dir.write.position().load(Ordering::Acquire) {
            return Err(ModelError::Empty);
        }
        let mut buffers = [BufferRef::default(); MAX_BUFFERS];
        let mut message = vec![0u8; MAX_FUZZ_MESSAGE];
        let (header, next) = packet::decode(&dir.ring, read_pos, &mut buffers, &mut message)?;
        let expected = dir.read.packet_count().load(Ordering::Relaxed) as u8;
        if header.sequence != expected {
            return Err(CodecError::Corrupted {
                pos: read_pos,
                reason: "sequence mismatch",
            }
            .into());
        }
        dir.read.position().store(next, Ordering::Release);
        dir.read.packet_count().fetch_add(1, Ordering::Release);

        message.truncate(header.message_len as usize);
        Ok(ModelPacket {
            flags: header.flags - PacketFlags::READY,
            buffers: buffers[..header.buffer_count as usize].to_vec(),
            message,
        })
    }
}

/// Operations the fuzzer can apply.
#[derive(Debug, Clone, Copy)]
pub enum RingOp {
    Write {
        buffers: u8,
        message_len: u16,
        seed: u8,
    },
    Read,
    Peek,
}

/// Apply `ops` to a ring of `ring_size` bytes, checking it against a queue of
/// expected packets after every step.
pub fn execute_and_verify(ring_size: u32, ops: &[RingOp]) -> Result<(), String> {
    let ring = RingModel::new(ring_size)?;
    let ring_len = ring.ring_len();
    let mut expected: VecDeque<(ModelPacket, u32)> = VecDeque::new();
    let mut used: u32 = 0;

    for (i, op) in ops.iter().enumerate() {
        match *op {
            RingOp::Write {
                buffers,
                message_len,
                seed,
            } => {
                let packet = ModelPacket::generate(buffers, message_len, seed);
                let len = packet.encoded_len();
                let before = ring.view().write.position().load(Ordering::Relaxed);
                let needed = packet::space_needed(before, len, ring_len);
                match ring.write(&packet) {
                    Ok(()) => {
                        if used + needed + 8 > ring_len {
                            return Err(format!(
                                "op {i}: wrote {needed} bytes with {used} used in a ring of {ring_len}"
                            ));
                        }
                        used += needed;
                        expected.push_back((packet, needed));
                    }
                    Err(ModelError::Full) => {
                        if used + needed + 8 <= ring_len {
                            return Err(format!(
                                "op {i}: reported full with {used} used, {needed} needed, ring {ring_len}"
                            ));
                        }
                        let after = ring.view().write.position().load(Ordering::Relaxed);
                        if after != before {
                            return Err(format!("op {i}: full write moved position {before} -> {after}"));
                        }
                    }
                    Err(ModelError::Codec(CodecError::TooLarge { .. })) if len + 8 > ring_len => {}
                    Err(e) => return Err(format!("op {i}: write failed: {e:?}")),
                }
            }
            RingOp::Read => match (ring.read(), expected.pop_front()) {
                (Ok(got), Some((want, needed))) => {
                    if got != want {
                        return Err(format!("op {i}: read {got:?}, expected {want:?}"));
                    }
                    used -= needed;
                }
                (Err(ModelError::Empty), None) => {}
                (Ok(got), None) => return Err(format!("op {i}: read {got:?} from an empty ring")),
                (Err(e), want) => return Err(format!("op {i}: read failed with {e:?}, expected {want:?}")),
            },
            RingOp::Peek => match (ring.peek(), expected.front()) {
                (Ok(header), Some((want, _))) => {
                    if header.buffer_count as usize != want.buffers.len()
                        || header.message_len as usize != want.message.len()
                    {
                        return Err(format!("op {i}: peeked {header:?}, expected {want:?}"));
                    }
                }
                (Err(ModelError::Empty), None) => {}
                (got, want) => return Err(format!("op {i}: peek returned {got:?}, expected {want:?}")),
            },
        }

        verify_ring_invariants(&ring, expected.len(), used, i)?;
    }

    Ok(())
}

fn verify_ring_invariants(
    ring: &RingModel,
    queued: usize,
    used: u32,
    op_idx: usize,
) -> Result<(), String> {
    let view = ring.view();
    let ring_len = ring.ring_len();

    let (read, write) = view
        .positions()
        .map_err(|e| format!("after op {op_idx}: {e}"))?;
    if read % 8 != 0 || write % 8 != 0 {
        return Err(format!("after op {op_idx}: misaligned positions {read}/{write}"));
    }
    if view.queued_packets() as usize != queued {
        return Err(format!(
            "after op {op_idx}: ring holds {} packets, expected {queued}",
            view.queued_packets()
        ));
    }
    if view.used_bytes() != used {
        return Err(format!(
            "after op {op_idx}: ring uses {} bytes, expected {used}",
            view.used_bytes()
        ));
    }
    if used + 8 > ring_len {
        return Err(format!("after op {op_idx}: slack gone, {used} used of {ring_len}"));
    }
    if (queued == 0) != view.is_empty() {
        return Err(format!("after op {op_idx}: emptiness disagrees with {queued} queued"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(buffers: u8, message_len: u16, seed: u8) -> RingOp {
        RingOp::Write {
            buffers,
            message_len,
            seed,
        }
    }

    #[test]
    fn test_basic_write_read() {
        let ring = RingModel::new(256).unwrap();
        let a = ModelPacket::generate(1, 5, 7);
        let b = ModelPacket::generate(0, 0, 9);

        ring.write(&a).unwrap();
        ring.write(&b).unwrap();

        assert_eq!(ring.view().queued_packets(), 2);
        assert_eq!(ring.read().unwrap(), a);
        assert_eq!(ring.read().unwrap(), b);
        assert_eq!(ring.read(), Err(ModelError::Empty));
    }

    #[test]
    fn test_full_ring() {
        let ring = RingModel::new(64).unwrap();
        // 8-byte header + 16 message bytes = 24 bytes, two fit in 64 - 8.
        let packet = ModelPacket::generate(0, 16, 1);
        ring.write(&packet).unwrap();
        ring.write(&packet).unwrap();
        assert_eq!(ring.write(&packet), Err(ModelError::Full));
    }

    #[test]
    fn test_wrap_relocates_packet() {
        let ops = [
            write(0, 32, 1),
            write(0, 8, 2),
            RingOp::Read,
            RingOp::Read,
            // Write position is 56: a 40-byte packet must restart at 0.
            write(0, 32, 3),
            RingOp::Peek,
            RingOp::Read,
            RingOp::Read,
        ];
        execute_and_verify(64, &ops).unwrap();
    }

    #[test]
    fn test_many_rounds() {
        let mut ops = Vec::new();
        for round in 0..50u8 {
            ops.push(write(round % 3, (round as u16 * 13) % 90, round));
            ops.push(write(1, 3, round));
            ops.push(RingOp::Peek);
            ops.push(RingOp::Read);
            ops.push(RingOp::Read);
        }
        execute_and_verify(128, &ops).unwrap();
    }
}
