//! Shared header, direction headers and state blocks.
//!
//! Offsets in this module are bit-exact: an existing remote implementation
//! reads the same bytes. See the crate docs for the overall picture.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::packet::RingBytes;
use crate::region::Region;

/// Layout version written into the shared header.
pub const VERSION: u32 = 2;

/// Version used for the first registration attempt.
///
/// A remote that validates the version rejects it as unsupported; a legacy
/// remote ignores the field and accepts it.
pub const PROBE_VERSION: u32 = 0x8000_0000 | VERSION;

/// Maximum length of one ring.
pub const MAX_RING_SIZE: u32 = 16 << 20;

/// Smallest ring that can be created.
pub const MIN_RING_SIZE: u32 = 64;

/// Default request (host → remote) ring size.
pub const DEFAULT_REQUEST_SIZE: u32 = 64 << 10;

/// Default response (remote → host) ring size.
pub const DEFAULT_RESPONSE_SIZE: u32 = 16 << 10;

/// Maximum number of queue slots per domain per process.
pub const MAX_QUEUES_PER_DOMAIN: usize = 64;

/// Each state block gets its own line of this size.
pub const STATE_ALIGN: u32 = 256;

/// Size of the shared header.
pub const HEADER_SIZE: u32 = 48;

/// Shared region sizes are rounded to this.
pub const PAGE_SIZE: u32 = 4096;

const OFF_VERSION: usize = 0;
const OFF_ERROR: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_REQUEST: usize = 12;
const OFF_RESPONSE: usize = 28;
const OFF_GENERATION: usize = 44;

const DIR_QUEUE_OFFSET: usize = 0;
const DIR_QUEUE_LENGTH: usize = 4;
const DIR_READ_STATE: usize = 8;
const DIR_WRITE_STATE: usize = 12;

const STATE_POSITION: usize = 0;
const STATE_PACKET_COUNT: usize = 4;
const STATE_WAIT_COUNT: usize = 8;

/// Bytes of a state block actually used.
pub const STATE_BLOCK_SIZE: u32 = 12;

const _: () = assert!(OFF_GENERATION + 4 == HEADER_SIZE as usize);
const _: () = assert!(STATE_BLOCK_SIZE <= STATE_ALIGN);
const _: () = assert!(HEADER_SIZE <= STATE_ALIGN);

bitflags! {
    /// Capability flags stored in the shared header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeaderFlags: u32 {
        /// Both sides maintain wait counts; signals may be suppressed.
        const WAIT_COUNTS = 1 << 0;
        /// Signaling uses the driver signal primitive.
        const DRIVER_SIGNALING = 1 << 1;
    }
}

/// Errors from layout computation and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("ring size {size} exceeds maximum {max}")]
    RingTooLarge { size: u32, max: u32 },
    #[error("region of {len} bytes too small for layout needing {needed}")]
    RegionTooSmall { len: usize, needed: usize },
    #[error("unexpected header flags {0:#x}")]
    UnexpectedFlags(u32),
    #[error("unsupported layout version {0:#x}")]
    UnsupportedVersion(u32),
    #[error("invalid direction header: {0}")]
    InvalidDirection(&'static str),
}

/// One of the two one-way rings of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host → remote.
    Request,
    /// Remote → host.
    Response,
}

impl Direction {
    fn header_offset(self) -> usize {
        match self {
            Direction::Request => OFF_REQUEST,
            Direction::Response => OFF_RESPONSE,
        }
    }
}

/// Offsets of one direction, relative to the start of the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionHeader {
    pub queue_offset: u32,
    pub queue_length: u32,
    pub read_state_offset: u32,
    pub write_state_offset: u32,
}

impl DirectionHeader {
    fn validate(&self, region_len: usize) -> Result<(), LayoutError> {
        if self.queue_length > MAX_RING_SIZE {
            return Err(LayoutError::RingTooLarge {
                size: self.queue_length,
                max: MAX_RING_SIZE,
            });
        }
        if self.queue_length < MIN_RING_SIZE || self.queue_length % 8 != 0 {
            return Err(LayoutError::InvalidDirection("bad ring length"));
        }
        if self.queue_offset % 8 != 0
            || self.read_state_offset % STATE_ALIGN != 0
            || self.write_state_offset % STATE_ALIGN != 0
        {
            return Err(LayoutError::InvalidDirection("misaligned offset"));
        }
        let fits = |off: u32, len: u32| (off as usize + len as usize) <= region_len;
        if !fits(self.queue_offset, self.queue_length)
            || !fits(self.read_state_offset, STATE_BLOCK_SIZE)
            || !fits(self.write_state_offset, STATE_BLOCK_SIZE)
        {
            return Err(LayoutError::InvalidDirection("offset outside region"));
        }
        Ok(())
    }
}

/// Computed offsets for a new queue region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    pub request: DirectionHeader,
    pub response: DirectionHeader,
    pub total_size: u32,
}

impl QueueLayout {
    /// Compute a layout for the requested ring sizes. Zero selects the default.
    pub fn new(request_size: u32, response_size: u32) -> Result<Self, LayoutError> {
        let request_len = ring_len(request_size, DEFAULT_REQUEST_SIZE)?;
        let response_len = ring_len(response_size, DEFAULT_RESPONSE_SIZE)?;

        let states = STATE_ALIGN;
        let request_queue = states + 4 * STATE_ALIGN;
        let response_queue = align_up(request_queue + request_len, STATE_ALIGN);
        let total_size = align_up(response_queue + response_len, PAGE_SIZE);

        Ok(Self {
            request: DirectionHeader {
                queue_offset: request_queue,
                queue_length: request_len,
                read_state_offset: states,
                write_state_offset: states + STATE_ALIGN,
            },
            response: DirectionHeader {
                queue_offset: response_queue,
                queue_length: response_len,
                read_state_offset: states + 2 * STATE_ALIGN,
                write_state_offset: states + 3 * STATE_ALIGN,
            },
            total_size,
        })
    }

    /// Write a fresh header into `region` and zero all state blocks.
    ///
    /// The version is left at [`PROBE_VERSION`] with no flags; registration
    /// settles the final values.
    pub fn init(&self, region: &Region, generation: u32) -> Result<SharedHeader, LayoutError> {
        if region.len() < self.total_size as usize {
            return Err(LayoutError::RegionTooSmall {
                len: region.len(),
                needed: self.total_size as usize,
            });
        }
        region.fill_zero(0, (STATE_ALIGN * 5) as usize);

        region.u32_at(OFF_VERSION).store(PROBE_VERSION, Ordering::Relaxed);
        region.u32_at(OFF_ERROR).store(0, Ordering::Relaxed);
        region.u32_at(OFF_FLAGS).store(0, Ordering::Relaxed);
        write_direction(region, OFF_REQUEST, &self.request);
        write_direction(region, OFF_RESPONSE, &self.response);
        region.u32_at(OFF_GENERATION).store(generation, Ordering::Release);

        Ok(SharedHeader { region: *region })
    }
}

fn ring_len(requested: u32, default: u32) -> Result<u32, LayoutError> {
    let size = if requested == 0 { default } else { requested };
    if size > MAX_RING_SIZE {
        return Err(LayoutError::RingTooLarge {
            size,
            max: MAX_RING_SIZE,
        });
    }
    Ok(align_up(size, 8).max(MIN_RING_SIZE))
}

#[inline]
fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

fn write_direction(region: &Region, base: usize, dir: &DirectionHeader) {
    region.u32_at(base + DIR_QUEUE_OFFSET).store(dir.queue_offset, Ordering::Relaxed);
    region.u32_at(base + DIR_QUEUE_LENGTH).store(dir.queue_length, Ordering::Relaxed);
    region.u32_at(base + DIR_READ_STATE).store(dir.read_state_offset, Ordering::Relaxed);
    region.u32_at(base + DIR_WRITE_STATE).store(dir.write_state_offset, Ordering::Relaxed);
}

/// Typed view of the shared header at the start of a queue region.
#[derive(Debug, Clone, Copy)]
pub struct SharedHeader {
    region: Region,
}

impl SharedHeader {
    /// Attach to an initialized region.
    pub fn attach(region: &Region) -> Result<Self, LayoutError> {
        if region.len() < (STATE_ALIGN * 5) as usize {
            return Err(LayoutError::RegionTooSmall {
                len: region.len(),
                needed: (STATE_ALIGN * 5) as usize,
            });
        }
        let header = Self { region: *region };
        header.direction(Direction::Request)?;
        header.direction(Direction::Response)?;
        Ok(header)
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn version(&self) -> u32 {
        self.region.u32_at(OFF_VERSION).load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: u32) {
        self.region.u32_at(OFF_VERSION).store(version, Ordering::Release);
    }

    /// Capability flags; unknown bits are rejected.
    pub fn flags(&self) -> Result<HeaderFlags, LayoutError> {
        let raw = self.region.u32_at(OFF_FLAGS).load(Ordering::Acquire);
        HeaderFlags::from_bits(raw).ok_or(LayoutError::UnexpectedFlags(raw))
    }

    pub fn set_flags(&self, flags: HeaderFlags) {
        self.region.u32_at(OFF_FLAGS).store(flags.bits(), Ordering::Release);
    }

    /// Check version and flags as the importing side sees them.
    pub fn validate(&self) -> Result<HeaderFlags, LayoutError> {
        let version = self.version();
        if version != VERSION {
            return Err(LayoutError::UnsupportedVersion(version));
        }
        self.flags()
    }

    /// Sticky error code; zero means healthy.
    pub fn error(&self) -> i32 {
        self.region.u32_at(OFF_ERROR).load(Ordering::Acquire) as i32
    }

    /// Record an error unless one is already recorded. Returns the stored code.
    pub fn set_error(&self, code: i32) -> i32 {
        match self.region.u32_at(OFF_ERROR).compare_exchange(
            0,
            code as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => code,
            Err(existing) => existing as i32,
        }
    }

    pub fn generation(&self) -> u32 {
        self.region.u32_at(OFF_GENERATION).load(Ordering::Acquire)
    }

    /// Read and validate one direction's offsets.
    pub fn direction(&self, dir: Direction) -> Result<DirectionHeader, LayoutError> {
        let base = dir.header_offset();
        let r = &self.region;
        let header = DirectionHeader {
            queue_offset: r.u32_at(base + DIR_QUEUE_OFFSET).load(Ordering::Acquire),
            queue_length: r.u32_at(base + DIR_QUEUE_LENGTH).load(Ordering::Acquire),
            read_state_offset: r.u32_at(base + DIR_READ_STATE).load(Ordering::Acquire),
            write_state_offset: r.u32_at(base + DIR_WRITE_STATE).load(Ordering::Acquire),
        };
        header.validate(r.len())?;
        Ok(header)
    }

    /// Resolve a direction into its ring and state views.
    pub fn direction_view(&self, dir: Direction) -> Result<DirectionView, LayoutError> {
        let header = self.direction(dir)?;
        Ok(DirectionView {
            ring: RingBytes::new(
                self.region
                    .subregion(header.queue_offset as usize, header.queue_length as usize),
            ),
            read: StateBlock::new(self.region, header.read_state_offset as usize),
            write: StateBlock::new(self.region, header.write_state_offset as usize),
        })
    }
}

/// View of one state block.
///
/// The read state is written only by the reader role and the write state only
/// by the writer role. `wait_count` is advisory: it is raised while a thread
/// of the owning role is blocked, and read by the other role to decide whether
/// a signal is worth sending.
#[derive(Debug, Clone, Copy)]
pub struct StateBlock {
    region: Region,
    offset: usize,
}

impl StateBlock {
    fn new(region: Region, offset: usize) -> Self {
        Self { region, offset }
    }

    /// Byte position in the ring, always 8-byte aligned.
    #[inline]
    pub fn position(&self) -> &AtomicU32 {
        self.region.u32_at(self.offset + STATE_POSITION)
    }

    /// Packets produced (write state) or consumed (read state), wrapping.
    #[inline]
    pub fn packet_count(&self) -> &AtomicU32 {
        self.region.u32_at(self.offset + STATE_PACKET_COUNT)
    }

    #[inline]
    pub fn wait_count(&self) -> &AtomicU32 {
        self.region.u32_at(self.offset + STATE_WAIT_COUNT)
    }
}

/// Ring plus both state blocks of one direction.
#[derive(Debug, Clone, Copy)]
pub struct DirectionView {
    pub ring: RingBytes,
    pub read: StateBlock,
    pub write: StateBlock,
}

impl DirectionView {
    /// Read and write positions, checked against the ring.
    ///
    /// Either position may have been written by the other process, so a
    /// value out of range or misaligned is reported instead of trusted.
    pub fn positions(&self) -> Result<(u32, u32), LayoutError> {
        let len = self.ring.len();
        let read = self.read.position().load(Ordering::Acquire);
        let write = self.write.position().load(Ordering::Acquire);
        if read >= len || write >= len || read % 8 != 0 || write % 8 != 0 {
            return Err(LayoutError::InvalidDirection("ring position out of range"));
        }
        Ok((read, write))
    }

    /// Bytes currently occupied by unread packets (including wrap gaps).
    pub fn used_bytes(&self) -> u32 {
        let len = self.ring.len();
        let write = self.write.position().load(Ordering::Acquire);
        let read = self.read.position().load(Ordering::Acquire);
        write.wrapping_add(len).wrapping_sub(read) % len
    }

    /// Bytes that may still be written; 8 bytes of slack are always kept so a
    /// full ring never looks empty.
    pub fn free_bytes(&self) -> u32 {
        let len = self.ring.len();
        len.saturating_sub(self.used_bytes() + 8)
    }

    /// Packets written but not yet read.
    pub fn queued_packets(&self) -> u32 {
        let written = self.write.packet_count().load(Ordering::Acquire);
        let read = self.read.packet_count().load(Ordering::Acquire);
        written.wrapping_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        self.write.position().load(Ordering::Acquire) == self.read.position().load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SharedBuffer;

    #[test]
    fn default_layout_offsets() {
        let layout = QueueLayout::new(0, 0).unwrap();
        assert_eq!(layout.request.read_state_offset, 256);
        assert_eq!(layout.request.write_state_offset, 512);
        assert_eq!(layout.response.read_state_offset, 768);
        assert_eq!(layout.response.write_state_offset, 1024);
        assert_eq!(layout.request.queue_offset, 1280);
        assert_eq!(layout.request.queue_length, DEFAULT_REQUEST_SIZE);
        assert_eq!(layout.response.queue_length, DEFAULT_RESPONSE_SIZE);
        assert_eq!(layout.response.queue_offset % STATE_ALIGN, 0);
        assert!(layout.response.queue_offset >= 1280 + DEFAULT_REQUEST_SIZE);
        assert_eq!(layout.total_size % PAGE_SIZE, 0);
    }

    #[test]
    fn ring_sizes_are_rounded_and_bounded() {
        let layout = QueueLayout::new(100, 1).unwrap();
        assert_eq!(layout.request.queue_length, 104);
        assert_eq!(layout.response.queue_length, MIN_RING_SIZE);
        assert!(matches!(
            QueueLayout::new(MAX_RING_SIZE + 1, 0),
            Err(LayoutError::RingTooLarge { .. })
        ));
        assert!(QueueLayout::new(MAX_RING_SIZE, 0).is_ok());
    }

    #[test]
    fn init_and_attach_round_trip() {
        let layout = QueueLayout::new(1024, 512).unwrap();
        let buf = SharedBuffer::heap(layout.total_size as usize).unwrap();
        let header = layout.init(&buf.region(), 7).unwrap();
        assert_eq!(header.version(), PROBE_VERSION);
        assert_eq!(header.generation(), 7);

        let attached = SharedHeader::attach(&buf.region()).unwrap();
        assert_eq!(attached.direction(Direction::Request).unwrap(), layout.request);
        assert_eq!(attached.direction(Direction::Response).unwrap(), layout.response);
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let layout = QueueLayout::new(0, 0).unwrap();
        let buf = SharedBuffer::heap(layout.total_size as usize).unwrap();
        let header = layout.init(&buf.region(), 0).unwrap();
        header.set_version(VERSION);
        header.set_flags(HeaderFlags::WAIT_COUNTS);
        assert_eq!(header.validate(), Ok(HeaderFlags::WAIT_COUNTS));

        buf.region().u32_at(OFF_FLAGS).store(0x4, Ordering::Release);
        assert_eq!(header.validate(), Err(LayoutError::UnexpectedFlags(0x4)));
    }

    #[test]
    fn error_is_sticky() {
        let layout = QueueLayout::new(0, 0).unwrap();
        let buf = SharedBuffer::heap(layout.total_size as usize).unwrap();
        let header = layout.init(&buf.region(), 0).unwrap();
        assert_eq!(header.set_error(-5), -5);
        assert_eq!(header.set_error(-9), -5);
        assert_eq!(header.error(), -5);
    }

    #[test]
    fn corrupted_direction_header_is_rejected() {
        let layout = QueueLayout::new(0, 0).unwrap();
        let buf = SharedBuffer::heap(layout.total_size as usize).unwrap();
        layout.init(&buf.region(), 0).unwrap();
        buf.region()
            .u32_at(OFF_RESPONSE + DIR_QUEUE_LENGTH)
            .store(MAX_RING_SIZE * 2, Ordering::Release);
        assert!(matches!(
            SharedHeader::attach(&buf.region()),
            Err(LayoutError::RingTooLarge { .. })
        ));
    }

    #[test]
    fn free_space_keeps_slack() {
        let layout = QueueLayout::new(64, 64).unwrap();
        let buf = SharedBuffer::heap(layout.total_size as usize).unwrap();
        let header = layout.init(&buf.region(), 0).unwrap();
        let view = header.direction_view(Direction::Request).unwrap();
        assert!(view.is_empty());
        assert_eq!(view.free_bytes(), 56);

        view.write.position().store(48, Ordering::Release);
        assert_eq!(view.used_bytes(), 48);
        assert_eq!(view.free_bytes(), 8);

        view.read.position().store(56, Ordering::Release);
        view.write.position().store(8, Ordering::Release);
        assert_eq!(view.used_bytes(), 16);
        assert_eq!(view.positions(), Ok((56, 8)));
    }

    #[test]
    fn foreign_positions_are_checked() {
        let layout = QueueLayout::new(64, 64).unwrap();
        let buf = SharedBuffer::heap(layout.total_size as usize).unwrap();
        let header = layout.init(&buf.region(), 0).unwrap();
        let view = header.direction_view(Direction::Response).unwrap();

        view.read.position().store(u32::MAX - 7, Ordering::Release);
        assert!(view.positions().is_err());
        // Never panics, even on garbage.
        let _ = view.used_bytes();

        view.read.position().store(12, Ordering::Release);
        assert!(view.positions().is_err());
    }
}
