//! dspq: asynchronous packet queues between a host and remote DSP domains.
//!
//! A queue is a pair of one-way rings in a memory region mapped by both the
//! host and one remote domain. Packets carry a small message and references
//! to externally mapped buffers. Writers and readers only exchange a signal
//! when the other side has said it is waiting.
//!
//! # Endpoints
//!
//! The host [`Runtime`] creates queues and writes requests / reads responses.
//! A remote-side [`Runtime`] imports them by id and does the opposite. Both
//! ends run the same code, so the whole protocol runs inside one process in
//! tests (see `dspq-testkit`).
//!
//! # Signaling
//!
//! Each queue picks one of two signaling backends when it is created:
//!
//! - the driver signal primitive, when both ends support it;
//! - an RPC fallback: a counter array shared per domain, plus one thread that
//!   rings the remote doorbell and one that waits for it and fans wakeups
//!   out to local queues.
//!
//! # Quick start
//!
//! ```ignore
//! use dspq::{CreateOptions, DomainId, PacketFlags, Runtime, WAIT_INFINITE};
//!
//! let runtime = Runtime::builder(connector).build();
//! let queue = runtime.create(DomainId::new(3), CreateOptions::default())?;
//! let id = queue.export();
//! // ... hand `id` to the remote side, which imports it ...
//! queue.write(PacketFlags::MESSAGE, &[], b"ping", WAIT_INFINITE)?;
//! ```

mod alloc;
mod config;
mod domain;
mod error;
mod mapping;
mod multi;
mod queue;
mod read;
mod remote;
mod runtime;
pub mod signal;
mod stats;
mod write;

pub use alloc::{HeapAllocator, SharedAllocator};
#[cfg(target_os = "linux")]
pub use alloc::MemfdAllocator;
pub use config::{Callbacks, CreateOptions, ErrorCallback, PacketCallback, RuntimeConfig};
pub use error::{QueueError, Result};
pub use mapping::{BufferMappings, CacheOp, MappingTable};
pub use multi::{MultiDomainContext, MultiDomainQueue};
pub use queue::{Queue, Side};
pub use read::PacketInfo;
pub use remote::{DomainConnector, DomainId, ImportedQueue, RemoteDomain, RemoteSignal};
pub use runtime::{Runtime, RuntimeBuilder};
pub use signal::{Doorbell, SignalPrimitive, SignalingMode, WaitOutcome, WAIT_INFINITE};
pub use stats::QueueStats;

pub use dspq_shm::{
    BufferFlags, BufferRef, PacketFlags, SharedBuffer, DEFAULT_REQUEST_SIZE,
    DEFAULT_RESPONSE_SIZE, MAX_BUFFERS, MAX_MESSAGE_SIZE, MAX_QUEUES_PER_DOMAIN, MAX_RING_SIZE,
};
