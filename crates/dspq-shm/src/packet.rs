//! Packet codec.
//!
//! Lays a packet out in a direction's ring and reads it back. The codec does
//! not check free space and does not publish positions; callers own that.
//!
//! A packet never straddles the end of the ring. If it does not fit before
//! the end, the body goes to offset 0 and the header word is written at both
//! the old tail and at offset 0. A reader that finds a header whose declared
//! length would cross the end knows the packet was relocated.

use std::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::region::Region;

/// Maximum buffer references in one packet.
pub const MAX_BUFFERS: usize = 64;

/// Maximum message length in one packet.
pub const MAX_MESSAGE_SIZE: usize = 64 << 10;

/// Size of one encoded buffer reference.
pub const BUFFER_RECORD_SIZE: usize = 16;

/// Size of the packet header word.
pub const HEADER_WORD_SIZE: usize = 8;

const SEQ_SHIFT: u32 = 0;
const COUNT_SHIFT: u32 = 8;
const FLAGS_SHIFT: u32 = 16;
const MSG_LEN_SHIFT: u32 = 32;
const MSG_LEN_BITS: u32 = 17;
const UNITS_SHIFT: u32 = 49;
const UNITS_BITS: u32 = 15;

const _: () = assert!(MAX_MESSAGE_SIZE < 1 << MSG_LEN_BITS);
const _: () = assert!(MSG_LEN_SHIFT + MSG_LEN_BITS == UNITS_SHIFT);
const _: () = assert!(UNITS_SHIFT + UNITS_BITS == 64);
const _: () = assert!(
    (HEADER_WORD_SIZE + MAX_BUFFERS * BUFFER_RECORD_SIZE + MAX_MESSAGE_SIZE) / 8 < 1 << UNITS_BITS
);

bitflags! {
    /// Flags carried in the packet header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u16 {
        /// The packet carries message bytes.
        const MESSAGE = 1 << 0;
        /// The packet carries buffer references.
        const BUFFERS = 1 << 1;
        /// Early-wakeup packet; consumed internally by readers.
        const WAKEUP = 1 << 2;
        /// Packet fully written by a driver-side writer.
        const DRIVER_READY = 1 << 3;
        /// Packet fully written by a user-space writer.
        const USER_READY = 1 << 4;
    }
}

impl PacketFlags {
    /// Flags only the engine may set.
    pub const INTERNAL: PacketFlags = PacketFlags::WAKEUP
        .union(PacketFlags::DRIVER_READY)
        .union(PacketFlags::USER_READY);

    /// Either ready bit.
    pub const READY: PacketFlags = PacketFlags::DRIVER_READY.union(PacketFlags::USER_READY);
}

bitflags! {
    /// Per-buffer flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Take a reference on the buffer mapping when the packet is written.
        const REF = 1 << 0;
        /// Drop a reference on the buffer mapping when the packet is read.
        const DEREF = 1 << 1;
        const FLUSH_SENDER = 1 << 2;
        const INVALIDATE_SENDER = 1 << 3;
        const FLUSH_RECIPIENT = 1 << 4;
        const INVALIDATE_RECIPIENT = 1 << 5;
    }
}

/// A reference to an externally mapped buffer carried in a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferRef {
    pub fd: i32,
    pub flags: BufferFlags,
    pub offset: u32,
    pub size: u32,
}

impl BufferRef {
    pub fn new(fd: i32, offset: u32, size: u32) -> Self {
        Self {
            fd,
            flags: BufferFlags::empty(),
            offset,
            size,
        }
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn to_bytes(&self) -> [u8; BUFFER_RECORD_SIZE] {
        let mut out = [0u8; BUFFER_RECORD_SIZE];
        out[0..4].copy_from_slice(&self.fd.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[8..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..16].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; BUFFER_RECORD_SIZE]) -> Self {
        let word = |i: usize| [raw[i], raw[i + 1], raw[i + 2], raw[i + 3]];
        Self {
            fd: i32::from_le_bytes(word(0)),
            flags: BufferFlags::from_bits_retain(u32::from_le_bytes(word(4))),
            offset: u32::from_le_bytes(word(8)),
            size: u32::from_le_bytes(word(12)),
        }
    }
}

/// Codec errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Ring contents are inconsistent.
    #[error("corrupted packet at {pos}: {reason}")]
    Corrupted { pos: u32, reason: &'static str },
    /// The caller's output buffers cannot hold the packet.
    #[error("output too small: packet has {buffers} buffers and {message_len} message bytes")]
    OutputTooSmall { buffers: usize, message_len: usize },
    /// The packet can never fit in this ring.
    #[error("packet of {len} bytes can never fit in a ring of {ring_len}")]
    TooLarge { len: u32, ring_len: u32 },
    #[error("too many buffers or message too long")]
    LimitExceeded,
}

/// Decoded packet header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub buffer_count: u8,
    pub message_len: u32,
    /// Low byte of the writer's packet count when the packet was encoded.
    pub sequence: u8,
}

impl PacketHeader {
    pub fn new(flags: PacketFlags, buffer_count: usize, message_len: usize, sequence: u8) -> Result<Self, CodecError> {
        if buffer_count > MAX_BUFFERS || message_len > MAX_MESSAGE_SIZE {
            return Err(CodecError::LimitExceeded);
        }
        Ok(Self {
            flags,
            buffer_count: buffer_count as u8,
            message_len: message_len as u32,
            sequence,
        })
    }

    /// Encoded length including header and padding.
    #[inline]
    pub fn packet_len(&self) -> u32 {
        packet_len(self.buffer_count as usize, self.message_len as usize)
    }

    pub fn to_word(&self) -> u64 {
        let units = (self.packet_len() / 8) as u64;
        (self.sequence as u64) << SEQ_SHIFT
            | (self.buffer_count as u64) << COUNT_SHIFT
            | (self.flags.bits() as u64) << FLAGS_SHIFT
            | (self.message_len as u64) << MSG_LEN_SHIFT
            | units << UNITS_SHIFT
    }

    /// Decode and validate a header word read at `pos`.
    pub fn from_word(word: u64, pos: u32) -> Result<Self, CodecError> {
        let corrupted = |reason| CodecError::Corrupted { pos, reason };

        let sequence = (word >> SEQ_SHIFT) as u8;
        let buffer_count = (word >> COUNT_SHIFT) as u8;
        let flags = PacketFlags::from_bits((word >> FLAGS_SHIFT) as u16)
            .ok_or_else(|| corrupted("unknown packet flags"))?;
        let message_len = ((word >> MSG_LEN_SHIFT) & ((1 << MSG_LEN_BITS) - 1)) as u32;
        let units = (word >> UNITS_SHIFT) as u32;

        if buffer_count as usize > MAX_BUFFERS {
            return Err(corrupted("buffer count out of range"));
        }
        if message_len as usize > MAX_MESSAGE_SIZE {
            return Err(corrupted("message length out of range"));
        }
        let header = Self {
            flags,
            buffer_count,
            message_len,
            sequence,
        };
        if header.packet_len() != units * 8 {
            return Err(corrupted("declared length disagrees with contents"));
        }
        if !flags.intersects(PacketFlags::READY) {
            return Err(corrupted("packet published without ready flag"));
        }
        Ok(header)
    }
}

/// Encoded length of a packet with these contents.
#[inline]
pub fn packet_len(buffer_count: usize, message_len: usize) -> u32 {
    let raw = HEADER_WORD_SIZE + buffer_count * BUFFER_RECORD_SIZE + message_len;
    ((raw + 7) & !7) as u32
}

/// Ring bytes a packet of `len` consumes when written at `pos`, counting the
/// gap left at the end when it has to be relocated.
#[inline]
pub fn space_needed(pos: u32, len: u32, ring_len: u32) -> u32 {
    if pos + len <= ring_len {
        len
    } else {
        (ring_len - pos) + len
    }
}

/// The data area of one direction.
#[derive(Debug, Clone, Copy)]
pub struct RingBytes {
    region: Region,
}

impl RingBytes {
    pub fn new(region: Region) -> Self {
        debug_assert_eq!(region.len() % 8, 0);
        Self { region }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.region.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    fn header_word(&self, pos: u32) -> u64 {
        self.region.u64_at(pos as usize).load(Ordering::Acquire)
    }

    fn store_header_word(&self, pos: u32, word: u64) {
        self.region.u64_at(pos as usize).store(word, Ordering::Release);
    }
}

/// Write a packet at `write_pos`. Returns the new write position.
///
/// The ready flag is added to `header` here and the header word is stored
/// last, after the body, so a concurrent reader never sees a partial packet.
pub fn encode(
    ring: &RingBytes,
    write_pos: u32,
    header: PacketHeader,
    buffers: &[BufferRef],
    message: &[u8],
) -> Result<u32, CodecError> {
    debug_assert_eq!(header.buffer_count as usize, buffers.len());
    debug_assert_eq!(header.message_len as usize, message.len());

    let ring_len = ring.len();
    let len = header.packet_len();
    if len + 8 > ring_len {
        return Err(CodecError::TooLarge { len, ring_len });
    }
    if write_pos % 8 != 0 || write_pos >= ring_len {
        return Err(CodecError::Corrupted {
            pos: write_pos,
            reason: "write position out of range",
        });
    }

    let relocated = write_pos + len > ring_len;
    let start = if relocated { 0 } else { write_pos };

    let mut at = (start as usize) + HEADER_WORD_SIZE;
    for buffer in buffers {
        ring.region.write(at, &buffer.to_bytes());
        at += BUFFER_RECORD_SIZE;
    }
    ring.region.write(at, message);
    at += message.len();
    let end = (start + len) as usize;
    if end > at {
        ring.region.fill_zero(at, end - at);
    }

    let mut ready = header;
    ready.flags = (header.flags - PacketFlags::INTERNAL)
        | (header.flags & PacketFlags::WAKEUP)
        | PacketFlags::USER_READY;
    let word = ready.to_word();
    ring.store_header_word(start, word);
    if relocated {
        ring.store_header_word(write_pos, word);
    }

    let next = start + len;
    Ok(if next == ring_len { 0 } else { next })
}

/// Where a packet found at a read position actually lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub header: PacketHeader,
    /// Offset of the packet body's header word.
    pub start: u32,
    /// Read position after consuming the packet.
    pub next: u32,
}

/// Find and validate the packet at `read_pos`.
pub fn locate(ring: &RingBytes, read_pos: u32) -> Result<Located, CodecError> {
    let ring_len = ring.len();
    if read_pos % 8 != 0 || read_pos >= ring_len {
        return Err(CodecError::Corrupted {
            pos: read_pos,
            reason: "read position out of range",
        });
    }
    let word = ring.header_word(read_pos);
    let header = PacketHeader::from_word(word, read_pos)?;
    let len = header.packet_len();
    if len + 8 > ring_len {
        return Err(CodecError::Corrupted {
            pos: read_pos,
            reason: "packet longer than ring",
        });
    }

    let start = if read_pos + len > ring_len {
        // Relocated: the replica at offset 0 must match.
        if ring.header_word(0) != word {
            return Err(CodecError::Corrupted {
                pos: read_pos,
                reason: "relocated packet header mismatch",
            });
        }
        0
    } else {
        read_pos
    };
    let next = start + len;
    Ok(Located {
        header,
        start,
        next: if next == ring_len { 0 } else { next },
    })
}

/// Read only the header of the packet at `read_pos`.
pub fn peek(ring: &RingBytes, read_pos: u32) -> Result<PacketHeader, CodecError> {
    locate(ring, read_pos).map(|l| l.header)
}

/// Copy the packet at `read_pos` out. Returns its header and the new read
/// position. Nothing is copied when the outputs are too small.
pub fn decode(
    ring: &RingBytes,
    read_pos: u32,
    out_buffers: &mut [BufferRef],
    out_message: &mut [u8],
) -> Result<(PacketHeader, u32), CodecError> {
    let located = locate(ring, read_pos)?;
    let header = located.header;
    let count = header.buffer_count as usize;
    let message_len = header.message_len as usize;
    if out_buffers.len() < count || out_message.len() < message_len {
        return Err(CodecError::OutputTooSmall {
            buffers: count,
            message_len,
        });
    }

    let mut at = located.start as usize + HEADER_WORD_SIZE;
    let mut raw = [0u8; BUFFER_RECORD_SIZE];
    for slot in out_buffers.iter_mut().take(count) {
        ring.region.read(at, &mut raw);
        *slot = BufferRef::from_bytes(&raw);
        at += BUFFER_RECORD_SIZE;
    }
    ring.region.read(at, &mut out_message[..message_len]);

    Ok((header, located.next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SharedBuffer;

    fn ring(len: usize) -> (SharedBuffer, RingBytes) {
        let buf = SharedBuffer::heap(len).unwrap();
        let ring = RingBytes::new(buf.region());
        (buf, ring)
    }

    fn header(buffers: &[BufferRef], message: &[u8], seq: u8) -> PacketHeader {
        let mut flags = PacketFlags::empty();
        if !message.is_empty() {
            flags |= PacketFlags::MESSAGE;
        }
        if !buffers.is_empty() {
            flags |= PacketFlags::BUFFERS;
        }
        PacketHeader::new(flags, buffers.len(), message.len(), seq).unwrap()
    }

    #[test]
    fn packet_lengths_are_aligned() {
        assert_eq!(packet_len(0, 0), 8);
        assert_eq!(packet_len(0, 1), 16);
        assert_eq!(packet_len(0, 8), 16);
        assert_eq!(packet_len(2, 3), 48);
        assert_eq!(packet_len(MAX_BUFFERS, MAX_MESSAGE_SIZE), 8 + 1024 + 65536);
    }

    #[test]
    fn header_word_round_trip() {
        let h = PacketHeader::new(PacketFlags::MESSAGE | PacketFlags::USER_READY, 3, 1234, 0xab).unwrap();
        let decoded = PacketHeader::from_word(h.to_word(), 0).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn header_without_ready_flag_is_corrupted() {
        let h = PacketHeader::new(PacketFlags::MESSAGE, 0, 4, 0).unwrap();
        assert!(matches!(
            PacketHeader::from_word(h.to_word(), 16),
            Err(CodecError::Corrupted { pos: 16, .. })
        ));
    }

    #[test]
    fn inconsistent_length_is_corrupted() {
        let h = PacketHeader::new(PacketFlags::MESSAGE | PacketFlags::USER_READY, 0, 4, 0).unwrap();
        let word = h.to_word() + (1 << UNITS_SHIFT);
        assert!(matches!(
            PacketHeader::from_word(word, 0),
            Err(CodecError::Corrupted { .. })
        ));
    }

    #[test]
    fn encode_decode_message_and_buffers() {
        let (_buf, ring) = ring(256);
        let buffers = [
            BufferRef::new(3, 0, 4096).with_flags(BufferFlags::REF),
            BufferRef::new(4, 64, 128),
        ];
        let msg = b"ping";
        let next = encode(&ring, 0, header(&buffers, msg, 0), &buffers, msg).unwrap();
        assert_eq!(next, packet_len(2, 4));

        let peeked = peek(&ring, 0).unwrap();
        assert_eq!(peeked.buffer_count, 2);
        assert_eq!(peeked.message_len, 4);
        assert!(peeked.flags.contains(PacketFlags::USER_READY));

        let mut out_bufs = [BufferRef::default(); 4];
        let mut out_msg = [0u8; 16];
        let (h, pos) = decode(&ring, 0, &mut out_bufs, &mut out_msg).unwrap();
        assert_eq!(pos, next);
        assert_eq!(&out_bufs[..2], &buffers);
        assert_eq!(&out_msg[..h.message_len as usize], msg);
    }

    #[test]
    fn decode_rejects_small_outputs_without_copying() {
        let (_buf, ring) = ring(128);
        let msg = [9u8; 20];
        encode(&ring, 0, header(&[], &msg, 0), &[], &msg).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(
            decode(&ring, 0, &mut [], &mut out),
            Err(CodecError::OutputTooSmall {
                buffers: 0,
                message_len: 20
            })
        );
        assert_eq!(out, [0u8; 8]);
    }

    #[test]
    fn packet_relocates_at_ring_end() {
        let (_buf, ring) = ring(64);
        // 24-byte packet at 48 would straddle the end of a 64-byte ring.
        let msg = [7u8; 16];
        let h = header(&[], &msg, 5);
        assert_eq!(space_needed(48, h.packet_len(), 64), 16 + 24);

        let next = encode(&ring, 48, h, &[], &msg).unwrap();
        assert_eq!(next, 24);

        // Both the replica at the old tail and the body copy decode the same.
        let at_tail = locate(&ring, 48).unwrap();
        assert_eq!(at_tail.start, 0);
        assert_eq!(at_tail.next, 24);
        let at_zero = locate(&ring, 0).unwrap();
        assert_eq!(at_zero.header, at_tail.header);

        let mut out = [0u8; 16];
        let (decoded, pos) = decode(&ring, 48, &mut [], &mut out).unwrap();
        assert_eq!(decoded.sequence, 5);
        assert_eq!(pos, 24);
        assert_eq!(out, msg);
    }

    #[test]
    fn relocated_header_mismatch_is_corrupted() {
        let (buf, ring) = ring(64);
        let msg = [1u8; 16];
        encode(&ring, 48, header(&[], &msg, 0), &[], &msg).unwrap();
        buf.region().u64_at(0).store(0, Ordering::Release);
        assert!(matches!(
            locate(&ring, 48),
            Err(CodecError::Corrupted { .. })
        ));
    }

    #[test]
    fn packet_that_ends_exactly_at_ring_end_wraps_position() {
        let (_buf, ring) = ring(64);
        let msg = [2u8; 8];
        let next = encode(&ring, 48, header(&[], &msg, 0), &[], &msg).unwrap();
        assert_eq!(next, 0);
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let (_buf, ring) = ring(64);
        let msg = [0u8; 56];
        assert!(matches!(
            encode(&ring, 0, header(&[], &msg, 0), &[], &msg),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn wakeup_flag_survives_encoding() {
        let (_buf, ring) = ring(64);
        let hint = 250u32.to_le_bytes();
        let h = PacketHeader::new(PacketFlags::WAKEUP | PacketFlags::MESSAGE, 0, 4, 0).unwrap();
        encode(&ring, 0, h, &[], &hint).unwrap();
        let peeked = peek(&ring, 0).unwrap();
        assert!(peeked.flags.contains(PacketFlags::WAKEUP));
        assert!(peeked.flags.contains(PacketFlags::USER_READY));
    }
}
