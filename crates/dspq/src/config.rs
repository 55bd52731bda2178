//! Runtime and per-queue configuration.

use std::fmt;
use std::sync::Arc;

use crate::error::QueueError;
use crate::queue::Queue;

/// Invoked on the queue's callback thread once per batch of new packets.
pub type PacketCallback = Arc<dyn Fn(&Queue) + Send + Sync>;

/// Invoked on the queue's callback thread when the queue hits a terminal
/// error (domain death, corruption).
pub type ErrorCallback = Arc<dyn Fn(&Queue, QueueError) + Send + Sync>;

/// Process-wide settings, fixed when the [`Runtime`](crate::Runtime) is built.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Request ring size used when a queue asks for 0.
    pub request_size: u32,
    /// Response ring size used when a queue asks for 0.
    pub response_size: u32,
    /// Sleep between polls while waiting out an early-wakeup hint.
    pub early_wakeup_poll_us: u32,
    /// Upper bound on how long a single read waits out an early-wakeup hint.
    pub early_wakeup_max_us: u32,
    /// First signal-primitive id reserved for queues.
    pub signal_id_base: u32,
    /// Use the driver signal primitive when both ends support it.
    pub allow_driver_signaling: bool,
    /// Prefix for background thread names.
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            request_size: dspq_shm::DEFAULT_REQUEST_SIZE,
            response_size: dspq_shm::DEFAULT_RESPONSE_SIZE,
            early_wakeup_poll_us: 100,
            early_wakeup_max_us: 20_000,
            signal_id_base: 0x100,
            allow_driver_signaling: true,
            thread_name: "dspq".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn with_ring_sizes(mut self, request_size: u32, response_size: u32) -> Self {
        self.request_size = request_size;
        self.response_size = response_size;
        self
    }

    pub fn with_early_wakeup(mut self, poll_us: u32, max_us: u32) -> Self {
        self.early_wakeup_poll_us = poll_us.max(1);
        self.early_wakeup_max_us = max_us;
        self
    }

    pub fn with_signal_id_base(mut self, base: u32) -> Self {
        self.signal_id_base = base;
        self
    }

    pub fn with_driver_signaling(mut self, allow: bool) -> Self {
        self.allow_driver_signaling = allow;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// Optional callbacks for a queue. Installing either starts a callback
/// thread for the queue.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_packet: Option<PacketCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl Callbacks {
    pub fn on_packet(mut self, f: impl Fn(&Queue) + Send + Sync + 'static) -> Self {
        self.on_packet = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&Queue, QueueError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_packet.is_none() && self.on_error.is_none()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_packet", &self.on_packet.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Per-queue creation options. Ring sizes of 0 select the runtime default.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub request_size: u32,
    pub response_size: u32,
    pub callbacks: Callbacks,
}

impl CreateOptions {
    pub fn with_sizes(mut self, request_size: u32, response_size: u32) -> Self {
        self.request_size = request_size;
        self.response_size = response_size;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}
