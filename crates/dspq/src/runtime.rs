//! The process-wide queue service.

use std::collections::HashMap;
use std::sync::Arc;

use dspq_shm::{Direction, HeaderFlags, QueueLayout, SharedBuffer, SharedHeader, VERSION};
use parking_lot::Mutex;

use crate::alloc::{default_allocator, SharedAllocator};
use crate::config::{Callbacks, CreateOptions, RuntimeConfig};
use crate::domain::DomainEntry;
use crate::error::{QueueError, Result};
use crate::mapping::{BufferMappings, MappingTable};
use crate::queue::{Queue, QueueParts, Side};
use crate::remote::{DomainConnector, DomainId, RemoteDomain};
use crate::signal::{PrimitiveChannel, RpcChannel, SignalChannel, SignalPrimitive};

pub(crate) struct RuntimeInner {
    pub(crate) side: Side,
    pub(crate) config: RuntimeConfig,
    pub(crate) mappings: Arc<dyn BufferMappings>,
    connector: Arc<dyn DomainConnector>,
    primitive: Option<Arc<dyn SignalPrimitive>>,
    allocator: Arc<dyn SharedAllocator>,
    domains: Mutex<HashMap<DomainId, Arc<DomainEntry>>>,
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    side: Side,
    config: RuntimeConfig,
    connector: Arc<dyn DomainConnector>,
    primitive: Option<Arc<dyn SignalPrimitive>>,
    allocator: Option<Arc<dyn SharedAllocator>>,
    mappings: Option<Arc<dyn BufferMappings>>,
}

impl RuntimeBuilder {
    /// Which endpoint this runtime serves. Defaults to [`Side::Host`].
    pub fn side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn signal_primitive(mut self, primitive: Arc<dyn SignalPrimitive>) -> Self {
        self.primitive = Some(primitive);
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn SharedAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn mappings(mut self, mappings: Arc<dyn BufferMappings>) -> Self {
        self.mappings = Some(mappings);
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            inner: Arc::new(RuntimeInner {
                side: self.side,
                config: self.config,
                mappings: self
                    .mappings
                    .unwrap_or_else(|| Arc::new(MappingTable::new())),
                connector: self.connector,
                primitive: self.primitive,
                allocator: self.allocator.unwrap_or_else(default_allocator),
                domains: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Owns the per-domain registry and creates or imports queues.
///
/// A process normally has one runtime per endpoint role. Cloning is cheap.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder(connector: Arc<dyn DomainConnector>) -> RuntimeBuilder {
        RuntimeBuilder {
            side: Side::Host,
            config: RuntimeConfig::default(),
            connector,
            primitive: None,
            allocator: None,
            mappings: None,
        }
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn mappings(&self) -> &Arc<dyn BufferMappings> {
        &self.inner.mappings
    }

    /// Create a queue on `domain` and register it with the remote side.
    pub fn create(&self, domain: DomainId, options: CreateOptions) -> Result<Queue> {
        if self.inner.side != Side::Host {
            return Err(QueueError::Unsupported);
        }
        let config = &self.inner.config;
        let request_size = match options.request_size {
            0 => config.request_size,
            n => n,
        };
        let response_size = match options.response_size {
            0 => config.response_size,
            n => n,
        };
        let layout = QueueLayout::new(request_size, response_size)?;

        let (entry, slot) = self.inner.reserve(domain, None, None)?;
        match self.create_in_slot(&entry, slot, &layout, options.callbacks) {
            Ok(queue) => Ok(queue),
            Err(e) => {
                self.inner.release(&entry, slot);
                Err(e)
            }
        }
    }

    fn create_in_slot(
        &self,
        entry: &Arc<DomainEntry>,
        slot: u32,
        layout: &QueueLayout,
        callbacks: Callbacks,
    ) -> Result<Queue> {
        entry.check_alive()?;
        let domain = entry.id;
        let generation = entry.next_generation();
        let buffer = self
            .inner
            .allocator
            .allocate(&format!("dspq-{domain}-{slot}"), layout.total_size as usize)
            .map_err(|e| {
                tracing::warn!(%domain, error = %e, "failed to allocate queue region");
                QueueError::NoResources
            })?;
        let header = layout.init(&buffer.region(), generation)?;
        let outbound = header.direction_view(Direction::Request)?;
        let inbound = header.direction_view(Direction::Response)?;
        let (remote_id, flags) = self.inner.negotiate(entry, slot, &buffer, &header, generation)?;

        let queue = self
            .inner
            .open_channel(entry, slot, flags)
            .and_then(|channel| {
                self.inner.finish(QueueParts {
                    entry: entry.clone(),
                    side: Side::Host,
                    slot,
                    remote_id,
                    buffer,
                    header,
                    outbound,
                    inbound,
                    flags,
                    channel,
                    callbacks,
                })
            });
        match queue {
            Ok(queue) => {
                tracing::debug!(
                    %domain,
                    slot,
                    remote_id,
                    mode = ?queue.signaling_mode(),
                    "queue created"
                );
                Ok(queue)
            }
            Err(e) => {
                if let Err(undo) = entry.remote.destroy_queue(remote_id) {
                    tracing::warn!(%domain, remote_id, error = %undo, "failed to unregister queue");
                }
                Err(e)
            }
        }
    }

    /// Import a queue the host side created on `domain`.
    pub fn import(&self, domain: DomainId, remote_id: u64, callbacks: Callbacks) -> Result<Queue> {
        if self.inner.side != Side::Remote {
            return Err(QueueError::Unsupported);
        }
        let remote = self.inner.remote_for(domain)?;
        let imported = remote.import_queue(remote_id)?;

        let (entry, slot) = match self.inner.reserve(domain, Some(imported.slot), Some(remote.clone())) {
            Ok(reserved) => reserved,
            Err(e) => {
                if let Err(undo) = remote.release_import(remote_id) {
                    tracing::warn!(%domain, remote_id, error = %undo, "failed to release import");
                }
                return Err(e);
            }
        };
        match self.import_in_slot(&entry, slot, remote_id, imported.buffer, callbacks) {
            Ok(queue) => {
                tracing::debug!(%domain, slot, remote_id, mode = ?queue.signaling_mode(), "queue imported");
                Ok(queue)
            }
            Err(e) => {
                if let Err(undo) = remote.release_import(remote_id) {
                    tracing::warn!(%domain, remote_id, error = %undo, "failed to release import");
                }
                self.inner.release(&entry, slot);
                Err(e)
            }
        }
    }

    fn import_in_slot(
        &self,
        entry: &Arc<DomainEntry>,
        slot: u32,
        remote_id: u64,
        buffer: SharedBuffer,
        callbacks: Callbacks,
    ) -> Result<Queue> {
        entry.check_alive()?;
        let header = SharedHeader::attach(&buffer.region())?;
        let flags = header.validate()?;
        if header.error() != 0 {
            return Err(QueueError::BadState);
        }
        let outbound = header.direction_view(Direction::Response)?;
        let inbound = header.direction_view(Direction::Request)?;
        let channel = self.inner.open_channel(entry, slot, flags)?;
        self.inner.finish(QueueParts {
            entry: entry.clone(),
            side: Side::Remote,
            slot,
            remote_id,
            buffer,
            header,
            outbound,
            inbound,
            flags,
            channel,
            callbacks,
        })
    }

    /// Report that the process behind `domain` died or restarted.
    ///
    /// Every queue on the domain fails with `error` and its blocked callers
    /// wake up.
    pub fn domain_failed(&self, domain: DomainId, error: QueueError) {
        let entry = self.inner.domains.lock().get(&domain).cloned();
        match entry {
            Some(entry) => entry.mark_dead(error),
            None => tracing::debug!(%domain, %error, "failure reported for idle domain"),
        }
    }

    /// The sticky error of `domain`, if it is dead.
    pub fn domain_error(&self, domain: DomainId) -> Option<QueueError> {
        self.inner
            .domains
            .lock()
            .get(&domain)
            .and_then(|entry| entry.health.error())
    }

    /// Open queues on `domain`.
    pub fn active_queues(&self, domain: DomainId) -> usize {
        self.inner
            .domains
            .lock()
            .get(&domain)
            .map_or(0, |entry| entry.active_count())
    }

    /// Domains with at least one open or pending queue.
    pub fn domains(&self) -> Vec<DomainId> {
        let mut ids: Vec<_> = self.inner.domains.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}

impl RuntimeInner {
    fn remote_for(&self, domain: DomainId) -> Result<Arc<dyn RemoteDomain>> {
        if let Some(entry) = self.domains.lock().get(&domain) {
            return Ok(entry.remote.clone());
        }
        self.connector.connect(domain)
    }

    /// Find or create the entry for `domain` and reserve a slot in it, under
    /// the registry lock so the entry cannot be torn down in between.
    fn reserve(
        &self,
        domain: DomainId,
        slot: Option<u32>,
        remote: Option<Arc<dyn RemoteDomain>>,
    ) -> Result<(Arc<DomainEntry>, u32)> {
        let mut domains = self.domains.lock();
        let entry = match domains.get(&domain) {
            Some(entry) => entry.clone(),
            None => {
                let remote = match remote {
                    Some(remote) => remote,
                    None => self.connector.connect(domain)?,
                };
                let entry = Arc::new(DomainEntry::new(domain, self.side, remote));
                domains.insert(domain, entry.clone());
                tracing::debug!(%domain, side = ?self.side, "domain opened");
                entry
            }
        };
        let reserved = match slot {
            Some(slot) => entry.reserve_slot_at(slot).map(|()| slot),
            None => entry.reserve_slot(),
        };
        match reserved {
            Ok(slot) => Ok((entry, slot)),
            Err(e) => {
                if entry.is_idle() {
                    domains.remove(&domain);
                    entry.teardown();
                }
                Err(e)
            }
        }
    }

    /// Free `slot`; tear the domain down if it was the last one.
    pub(crate) fn release(&self, entry: &Arc<DomainEntry>, slot: u32) {
        let mut domains = self.domains.lock();
        entry.release_slot(slot);
        if !entry.is_idle() {
            return;
        }
        if domains
            .get(&entry.id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            domains.remove(&entry.id);
        }
        entry.teardown();
    }

    /// Register the queue, settling version and capability flags.
    ///
    /// The region starts out with the probe version. A remote that predates
    /// wait counts ignores the header and accepts it; a current one rejects
    /// it with `Unsupported`, and is then registered again with the real
    /// version and flags.
    fn negotiate(
        &self,
        entry: &DomainEntry,
        slot: u32,
        buffer: &SharedBuffer,
        header: &SharedHeader,
        generation: u32,
    ) -> Result<(u64, HeaderFlags)> {
        match entry.remote.create_queue(slot, buffer, generation) {
            Ok(remote_id) => {
                header.set_flags(HeaderFlags::empty());
                header.set_version(VERSION);
                tracing::debug!(domain = %entry.id, slot, "remote accepted probe, legacy signaling");
                Ok((remote_id, HeaderFlags::empty()))
            }
            Err(QueueError::Unsupported) => {
                let mut flags = HeaderFlags::WAIT_COUNTS;
                if self.driver_signaling_possible(entry) {
                    flags |= HeaderFlags::DRIVER_SIGNALING;
                }
                header.set_flags(flags);
                header.set_version(VERSION);
                let remote_id = entry
                    .remote
                    .create_queue(slot, buffer, generation)
                    .map_err(|e| entry.escalated(e))?;
                Ok((remote_id, flags))
            }
            Err(e) => Err(entry.escalated(e)),
        }
    }

    fn driver_signaling_possible(&self, entry: &DomainEntry) -> bool {
        self.config.allow_driver_signaling
            && self.primitive.as_ref().is_some_and(|p| p.is_available())
            && entry.remote.driver_signaling_supported()
    }

    fn open_channel(
        &self,
        entry: &Arc<DomainEntry>,
        slot: u32,
        flags: HeaderFlags,
    ) -> Result<Box<dyn SignalChannel>> {
        if flags.contains(HeaderFlags::DRIVER_SIGNALING) {
            let primitive = self
                .primitive
                .clone()
                .filter(|p| p.is_available())
                .ok_or(QueueError::Unsupported)?;
            let channel =
                PrimitiveChannel::open(primitive, entry.id, self.config.signal_id_base, slot)?;
            Ok(Box::new(channel))
        } else {
            let signals = entry.rpc_signals(&*self.allocator, &self.config.thread_name)?;
            Ok(Box::new(RpcChannel::open(signals, slot)))
        }
    }

    /// Assemble the queue, publish it in its slot and start callbacks.
    fn finish(self: &Arc<Self>, parts: QueueParts) -> Result<Queue> {
        let entry = parts.entry.clone();
        let slot = parts.slot;
        let queue = Queue::assemble(self.clone(), parts);
        entry.activate(slot, Arc::downgrade(&queue.inner));
        if let Err(e) = queue.start_callbacks() {
            queue.abandon();
            return Err(e);
        }
        Ok(queue)
    }
}
