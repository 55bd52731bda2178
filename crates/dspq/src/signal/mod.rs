//! Cross-domain signaling.
//!
//! Every queue has four logical doorbells. A queue picks its backend once,
//! when it is created or imported:
//!
//! - [`primitive`]: each doorbell is one id of the driver signal primitive.
//! - [`rpc`]: doorbells are counters in a per-domain shared array, carried
//!   across by two background threads per domain.
//!
//! The engine only talks to a backend through [`SignalChannel`].

mod local;
mod primitive;
pub(crate) mod rpc;

pub use local::LocalDoorbell;
pub use primitive::SignalPrimitive;
pub(crate) use primitive::PrimitiveChannel;
pub(crate) use rpc::{RpcChannel, RpcSignals};

use crate::error::Result;

/// Timeout value meaning "wait forever".
pub const WAIT_INFINITE: u32 = u32::MAX;

/// The four doorbells of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Doorbell {
    /// Host wrote a request packet.
    RequestPacket = 0,
    /// Remote freed request ring space.
    RequestSpace = 1,
    /// Remote wrote a response packet.
    ResponsePacket = 2,
    /// Host freed response ring space.
    ResponseSpace = 3,
}

impl Doorbell {
    pub const ALL: [Doorbell; 4] = [
        Doorbell::RequestPacket,
        Doorbell::RequestSpace,
        Doorbell::ResponsePacket,
        Doorbell::ResponseSpace,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// How a blocking wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    /// Waiters were cancelled; the wait will not be satisfied.
    Cancelled,
}

/// Which signaling optimizations a queue negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingMode {
    /// Old remote: no wait counts, every write signals.
    Legacy,
    /// Wait counts with RPC fallback signaling.
    Reduced,
    /// Wait counts with the driver signal primitive.
    Optimized,
}

/// A queue's signaling backend.
pub(crate) trait SignalChannel: Send + Sync {
    /// Ring `bell` on the other side.
    fn send(&self, bell: Doorbell) -> Result<()>;

    /// Wait for `bell` to be rung by the other side.
    fn wait(&self, bell: Doorbell, timeout_us: u32) -> Result<WaitOutcome>;

    /// Wake every local waiter with `Cancelled`. Sticky.
    fn cancel(&self);

    /// Release backend resources. Called once, after `cancel`.
    fn close(&self);
}
