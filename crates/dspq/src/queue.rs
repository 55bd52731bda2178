//! Queue instances.
//!
//! A [`Queue`] is one endpoint of a queue region. The host endpoint writes
//! the request ring and reads the response ring; the remote endpoint does
//! the opposite. Everything else is shared.

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dspq_shm::{Direction, DirectionView, HeaderFlags, SharedBuffer, SharedHeader};
use parking_lot::Mutex;

use crate::config::Callbacks;
use crate::domain::DomainEntry;
use crate::error::{QueueError, Result};
use crate::remote::DomainId;
use crate::runtime::RuntimeInner;
use crate::signal::{Doorbell, SignalChannel, SignalingMode, WaitOutcome, WAIT_INFINITE};

/// Which endpoint of a queue this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Creates queues; writes requests, reads responses.
    Host,
    /// Imports queues; writes responses, reads requests.
    Remote,
}

impl Side {
    pub(crate) fn outbound(self) -> Direction {
        match self {
            Side::Host => Direction::Request,
            Side::Remote => Direction::Response,
        }
    }

    pub(crate) fn inbound(self) -> Direction {
        match self {
            Side::Host => Direction::Response,
            Side::Remote => Direction::Request,
        }
    }

    /// Rung after writing a packet.
    pub(crate) fn outbound_packet(self) -> Doorbell {
        match self {
            Side::Host => Doorbell::RequestPacket,
            Side::Remote => Doorbell::ResponsePacket,
        }
    }

    /// Waited on for space to write.
    pub(crate) fn outbound_space(self) -> Doorbell {
        match self {
            Side::Host => Doorbell::RequestSpace,
            Side::Remote => Doorbell::ResponseSpace,
        }
    }

    /// Waited on for packets to read.
    pub(crate) fn inbound_packet(self) -> Doorbell {
        match self {
            Side::Host => Doorbell::ResponsePacket,
            Side::Remote => Doorbell::RequestPacket,
        }
    }

    /// Rung after consuming a packet.
    pub(crate) fn inbound_space(self) -> Doorbell {
        match self {
            Side::Host => Doorbell::ResponseSpace,
            Side::Remote => Doorbell::RequestSpace,
        }
    }

    /// Doorbells this side ever waits on.
    pub(crate) fn waited_bells(self) -> [Doorbell; 2] {
        [self.outbound_space(), self.inbound_packet()]
    }
}

/// Everything needed to assemble a queue once registration succeeded.
pub(crate) struct QueueParts {
    pub(crate) entry: Arc<DomainEntry>,
    pub(crate) side: Side,
    pub(crate) slot: u32,
    pub(crate) remote_id: u64,
    pub(crate) buffer: SharedBuffer,
    pub(crate) header: SharedHeader,
    pub(crate) outbound: DirectionView,
    pub(crate) inbound: DirectionView,
    pub(crate) flags: HeaderFlags,
    pub(crate) channel: Box<dyn SignalChannel>,
    pub(crate) callbacks: Callbacks,
}

pub(crate) struct QueueInner {
    pub(crate) runtime: Arc<RuntimeInner>,
    pub(crate) entry: Arc<DomainEntry>,
    pub(crate) side: Side,
    pub(crate) slot: u32,
    pub(crate) remote_id: u64,
    pub(crate) header: SharedHeader,
    pub(crate) outbound: DirectionView,
    pub(crate) inbound: DirectionView,
    pub(crate) flags: HeaderFlags,
    pub(crate) channel: Box<dyn SignalChannel>,
    pub(crate) write_lock: Mutex<()>,
    pub(crate) read_lock: Mutex<()>,
    pub(crate) early_wakeup_wait_us: AtomicU64,
    pub(crate) early_wakeup_misses: AtomicU64,
    callbacks: Callbacks,
    callback_thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    // Keeps the region mapped for as long as any view above is reachable.
    _buffer: SharedBuffer,
}

impl QueueInner {
    #[inline]
    pub(crate) fn wait_counts(&self) -> bool {
        self.flags.contains(HeaderFlags::WAIT_COUNTS)
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(QueueError::BadState);
        }
        self.entry.check_alive()?;
        self.sticky_error().map_or(Ok(()), Err)
    }

    fn sticky_error(&self) -> Option<QueueError> {
        match self.header.error() {
            0 => None,
            code => Some(QueueError::from_code(code).unwrap_or(QueueError::BadState)),
        }
    }

    /// The error a cancelled waiter reports.
    pub(crate) fn terminal_error(&self) -> QueueError {
        self.entry
            .health
            .error()
            .or_else(|| self.sticky_error())
            .unwrap_or(QueueError::Interrupted)
    }

    pub(crate) fn cancel_waiters(&self) {
        self.channel.cancel();
    }

    /// Record ring corruption. The queue is unusable afterwards, on both
    /// endpoints.
    pub(crate) fn corrupted(&self, detail: &dyn std::fmt::Display) -> QueueError {
        tracing::error!(
            domain = %self.entry.id,
            slot = self.slot,
            remote_id = self.remote_id,
            %detail,
            "queue corrupted"
        );
        self.header.set_error(QueueError::CorruptedItem.code());
        self.channel.cancel();
        QueueError::CorruptedItem
    }

    /// Signal `bell` unless wait counts say the peer is not waiting.
    ///
    /// Runs after a position has been published, so the operation has
    /// already happened: a failed signal is logged and escalated to the
    /// domain, never returned to the caller.
    pub(crate) fn notify(&self, bell: Doorbell, peer_waiters: &AtomicU32) {
        // Pairs with the fence in WaitMark::raise: either the peer sees our
        // update on its retry, or we see its wait count here.
        fence(Ordering::SeqCst);
        if self.wait_counts() && peer_waiters.load(Ordering::Acquire) == 0 {
            return;
        }
        if self.entry.check_alive().is_err() {
            return;
        }
        if let Err(error) = self.channel.send(bell) {
            tracing::warn!(
                domain = %self.entry.id,
                slot = self.slot,
                ?bell,
                %error,
                "doorbell signal failed after publish"
            );
            self.entry.escalate(error);
        }
    }

    /// Run `op` until it stops returning `WouldBlock`, waiting on `bell`
    /// between attempts.
    pub(crate) fn block_on<T>(
        &self,
        bell: Doorbell,
        waiters: &AtomicU32,
        timeout_us: u32,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        match op() {
            Err(QueueError::WouldBlock) => {}
            other => return other,
        }
        if timeout_us == 0 {
            return Err(QueueError::Expired);
        }
        let deadline = Deadline::after(timeout_us);
        loop {
            let _mark = WaitMark::raise(self.wait_counts(), waiters);
            // The peer may have acted between the failed attempt and the
            // mark; it only signals once it can see the mark.
            match op() {
                Err(QueueError::WouldBlock) => {}
                other => return other,
            }
            let remaining = deadline.remaining_us();
            if remaining == 0 {
                return Err(QueueError::Expired);
            }
            match self.channel.wait(bell, remaining) {
                Ok(WaitOutcome::Signaled) | Ok(WaitOutcome::TimedOut) => {}
                Ok(WaitOutcome::Cancelled) => return Err(self.terminal_error()),
                Err(e) => return Err(self.entry.escalated(e)),
            }
        }
    }
}

/// Raises a wait count for as long as it lives.
pub(crate) struct WaitMark<'a> {
    counter: Option<&'a AtomicU32>,
}

impl<'a> WaitMark<'a> {
    pub(crate) fn raise(enabled: bool, counter: &'a AtomicU32) -> Self {
        if !enabled {
            return Self { counter: None };
        }
        counter.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::SeqCst);
        Self {
            counter: Some(counter),
        }
    }
}

impl Drop for WaitMark<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.counter {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout_us: u32) -> Self {
        Self((timeout_us != WAIT_INFINITE).then(|| Instant::now() + Duration::from_micros(timeout_us as u64)))
    }

    /// Microseconds left; `WAIT_INFINITE` for no deadline.
    pub(crate) fn remaining_us(&self) -> u32 {
        match self.0 {
            None => WAIT_INFINITE,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now()).as_micros();
                left.min((WAIT_INFINITE - 1) as u128) as u32
            }
        }
    }
}

/// Handle to one endpoint of a queue.
///
/// Handles are cheap to clone and all refer to the same endpoint. The
/// endpoint stays alive until [`close`](Queue::close) is called.
#[derive(Clone)]
pub struct Queue {
    pub(crate) inner: Arc<QueueInner>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("domain", &self.inner.entry.id)
            .field("side", &self.inner.side)
            .field("slot", &self.inner.slot)
            .field("remote_id", &self.inner.remote_id)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Queue {
    pub(crate) fn assemble(runtime: Arc<RuntimeInner>, parts: QueueParts) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                runtime,
                entry: parts.entry,
                side: parts.side,
                slot: parts.slot,
                remote_id: parts.remote_id,
                header: parts.header,
                outbound: parts.outbound,
                inbound: parts.inbound,
                flags: parts.flags,
                channel: parts.channel,
                write_lock: Mutex::new(()),
                read_lock: Mutex::new(()),
                early_wakeup_wait_us: AtomicU64::new(0),
                early_wakeup_misses: AtomicU64::new(0),
                callbacks: parts.callbacks,
                callback_thread: Mutex::new(None),
                closed: AtomicBool::new(false),
                _buffer: parts.buffer,
            }),
        }
    }

    /// Start the callback thread if any callback is installed.
    pub(crate) fn start_callbacks(&self) -> Result<()> {
        if self.inner.callbacks.is_empty() {
            return Ok(());
        }
        let name = format!(
            "{}-cb-{}-{}",
            self.inner.runtime.config.thread_name, self.inner.entry.id, self.inner.slot
        );
        let queue = self.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || callback_loop(queue))
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn callback thread");
                QueueError::NoResources
            })?;
        *self.inner.callback_thread.lock() = Some(handle);
        Ok(())
    }

    /// Tear down local state of a queue whose setup failed part way.
    pub(crate) fn abandon(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.channel.cancel();
        self.join_callback_thread();
        self.inner.channel.close();
    }

    fn join_callback_thread(&self) {
        let handle = self.inner.callback_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!(slot = self.inner.slot, "callback thread panicked");
            }
        }
    }

    /// The id the remote endpoint imports this queue by.
    pub fn export(&self) -> u64 {
        self.inner.remote_id
    }

    pub fn remote_id(&self) -> u64 {
        self.inner.remote_id
    }

    pub fn domain(&self) -> DomainId {
        self.inner.entry.id
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn signaling_mode(&self) -> SignalingMode {
        if !self.inner.wait_counts() {
            SignalingMode::Legacy
        } else if self.inner.flags.contains(HeaderFlags::DRIVER_SIGNALING) {
            SignalingMode::Optimized
        } else {
            SignalingMode::Reduced
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close this endpoint.
    ///
    /// On the host, fails with `ItemBusy` while the remote endpoint still has
    /// the queue imported. Blocked callers on this endpoint return
    /// `Interrupted`. Closing twice fails with `BadState`.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(QueueError::BadState);
        }
        let domain = inner.entry.id;
        if inner.side == Side::Host && inner.entry.health.error().is_none() {
            match inner.entry.remote.is_imported(inner.remote_id) {
                Ok(true) => return Err(QueueError::ItemBusy),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(%domain, remote_id = inner.remote_id, error = %e, "is_imported failed, closing anyway");
                    inner.entry.escalate(e);
                }
            }
        }
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Err(QueueError::BadState);
        }

        inner.channel.cancel();
        self.join_callback_thread();

        if inner.entry.health.error().is_none() {
            let result = match inner.side {
                Side::Host => inner.entry.remote.destroy_queue(inner.remote_id),
                Side::Remote => inner.entry.remote.release_import(inner.remote_id),
            };
            if let Err(e) = result {
                tracing::warn!(%domain, remote_id = inner.remote_id, error = %e, "remote teardown failed");
                inner.entry.escalate(e);
            }
        }

        inner.channel.close();
        inner.runtime.release(&inner.entry, inner.slot);
        tracing::debug!(%domain, slot = inner.slot, remote_id = inner.remote_id, "queue closed");
        Ok(())
    }
}

fn callback_loop(queue: Queue) {
    let inner = &queue.inner;
    let inbound = inner.inbound;
    let bell = inner.side.inbound_packet();
    let mut seen = inbound.read.packet_count().load(Ordering::Acquire);
    tracing::debug!(domain = %inner.entry.id, slot = inner.slot, "callback thread started");

    loop {
        if inner.is_closed() {
            break;
        }
        let produced = {
            let _mark = WaitMark::raise(inner.wait_counts(), inbound.read.wait_count());
            let produced = inbound.write.packet_count().load(Ordering::Acquire);
            if produced != seen {
                produced
            } else {
                match inner.channel.wait(bell, WAIT_INFINITE) {
                    Ok(WaitOutcome::Signaled) | Ok(WaitOutcome::TimedOut) => {}
                    Ok(WaitOutcome::Cancelled) => break,
                    Err(e) => {
                        inner.entry.escalate(e);
                        break;
                    }
                }
                inbound.write.packet_count().load(Ordering::Acquire)
            }
        };
        if produced != seen && !inner.is_closed() {
            seen = produced;
            if let Some(on_packet) = &inner.callbacks.on_packet {
                on_packet(&queue);
            }
        }
    }

    if !inner.is_closed() {
        let error = inner.terminal_error();
        if let Some(on_error) = &inner.callbacks.on_error {
            on_error(&queue, error);
        }
    }
    tracing::debug!(domain = %inner.entry.id, slot = inner.slot, "callback thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sides_use_opposite_rings_and_bells() {
        for side in [Side::Host, Side::Remote] {
            assert_ne!(side.outbound(), side.inbound());
            let other = match side {
                Side::Host => Side::Remote,
                Side::Remote => Side::Host,
            };
            assert_eq!(side.outbound(), other.inbound());
            assert_eq!(side.outbound_packet(), other.inbound_packet());
            assert_eq!(side.outbound_space(), other.inbound_space());
        }
        assert_eq!(
            Side::Host.waited_bells(),
            [Doorbell::RequestSpace, Doorbell::ResponsePacket]
        );
    }

    #[test]
    fn wait_mark_is_scoped() {
        let counter = AtomicU32::new(0);
        {
            let _a = WaitMark::raise(true, &counter);
            let _b = WaitMark::raise(true, &counter);
            assert_eq!(counter.load(Ordering::Acquire), 2);
        }
        assert_eq!(counter.load(Ordering::Acquire), 0);
        let _off = WaitMark::raise(false, &counter);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn deadline_counts_down() {
        assert_eq!(Deadline::after(WAIT_INFINITE).remaining_us(), WAIT_INFINITE);
        let d = Deadline::after(50_000);
        let left = d.remaining_us();
        assert!(left <= 50_000 && left > 0);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(d.remaining_us(), 0);
    }
}
