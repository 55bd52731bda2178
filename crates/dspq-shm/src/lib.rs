//! dspq-shm: shared memory layout for dspq packet queues.
//!
//! This crate defines the canonical, bit-exact memory layout shared between
//! the host and a remote domain, and the packet codec that moves packets in
//! and out of a direction's ring. It knows nothing about threads, signaling
//! or blocking; those live in the `dspq` crate.
//!
//! # Region layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Shared header (48 bytes)                                    │  @0
//! │    version | error | flags | req dir hdr | resp dir hdr | gen│
//! ├──────────────────────────────────────────────────────────────┤
//! │  Request read state   (own 256-byte line)                    │  @256
//! │  Request write state  (own 256-byte line)                    │  @512
//! │  Response read state  (own 256-byte line)                    │  @768
//! │  Response write state (own 256-byte line)                    │  @1024
//! ├──────────────────────────────────────────────────────────────┤
//! │  Request ring  (host → remote)                               │  @1280
//! ├──────────────────────────────────────────────────────────────┤
//! │  Response ring (remote → host)                               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Packet layout
//!
//! ```text
//! ┌────────────┬──────────────────────────┬──────────────────────┐
//! │ header u64 │ buffer refs (n × 16 B)   │ message, pad to 8 B  │
//! └────────────┴──────────────────────────┴──────────────────────┘
//! ```
//!
//! All multi-byte fields are little-endian.

pub mod layout;
pub mod packet;
pub mod region;

pub use layout::{
    Direction, DirectionHeader, DirectionView, HeaderFlags, LayoutError, QueueLayout,
    SharedHeader, StateBlock, DEFAULT_REQUEST_SIZE, DEFAULT_RESPONSE_SIZE, MAX_QUEUES_PER_DOMAIN,
    MAX_RING_SIZE, PROBE_VERSION, VERSION,
};
pub use packet::{
    BufferFlags, BufferRef, CodecError, PacketFlags, PacketHeader, RingBytes,
    BUFFER_RECORD_SIZE, MAX_BUFFERS, MAX_MESSAGE_SIZE,
};
pub use region::{Region, SharedBuffer};
