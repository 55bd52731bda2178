//! A simulated remote domain.
//!
//! [`SimLink`] joins a host [`Runtime`] and one remote-side [`Runtime`] per
//! domain inside a single process. The two sides share queue regions
//! directly and talk through a simulated domain that stands in for the driver
//! session: queue registration, import bookkeeping, the RPC doorbell pair
//! and the counter array.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dspq::signal::LocalDoorbell;
use dspq::{
    Callbacks, CreateOptions, DomainId, HeapAllocator, ImportedQueue, MappingTable, Queue,
    QueueError, RemoteDomain, RemoteSignal, Runtime, RuntimeConfig, SharedBuffer, Side,
    SignalPrimitive, WaitOutcome,
};
use dspq_shm::{Direction, SharedHeader, PROBE_VERSION};
use parking_lot::Mutex;

use crate::TestError;

/// Which signaling backend queues end up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signaling {
    /// No signal primitive; the per-domain counter array and RPC threads.
    Rpc,
    /// Both sides have the driver signal primitive.
    Driver,
}

/// How the simulated remote answers the version probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// Rejects the probe, so wait counts get negotiated.
    Capable,
    /// Predates wait counts and accepts anything.
    Legacy,
}

struct QueueRecord {
    slot: u32,
    buffer: SharedBuffer,
    imported: bool,
}

/// The driver-side state of one simulated domain.
struct SimDomain {
    id: DomainId,
    negotiation: Negotiation,
    driver: bool,
    dead: AtomicBool,
    refuse_create: AtomicBool,
    queues: Mutex<HashMap<u64, QueueRecord>>,
    next_id: AtomicU64,
    counters: Mutex<Option<SharedBuffer>>,
    to_host: LocalDoorbell,
    to_remote: LocalDoorbell,
    signals: AtomicU64,
    signal_error: Mutex<Option<QueueError>>,
}

impl SimDomain {
    fn new(id: DomainId, negotiation: Negotiation, driver: bool) -> Self {
        Self {
            id,
            negotiation,
            driver,
            dead: AtomicBool::new(false),
            refuse_create: AtomicBool::new(false),
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            counters: Mutex::new(None),
            to_host: LocalDoorbell::new(),
            to_remote: LocalDoorbell::new(),
            signals: AtomicU64::new(0),
            signal_error: Mutex::new(None),
        }
    }

    fn check_alive(&self) -> dspq::Result<()> {
        if self.dead.load(Ordering::Acquire) {
            return Err(QueueError::ConnectionReset);
        }
        Ok(())
    }

    fn kill(&self) {
        self.dead.store(true, Ordering::Release);
        self.to_host.cancel();
        self.to_remote.cancel();
    }

    fn wait_on(&self, bell: &LocalDoorbell) -> dspq::Result<RemoteSignal> {
        match bell.wait(dspq::WAIT_INFINITE) {
            WaitOutcome::Cancelled => {
                self.check_alive()?;
                bell.reset();
                Ok(RemoteSignal::Exit)
            }
            WaitOutcome::Signaled | WaitOutcome::TimedOut => Ok(RemoteSignal::Signal),
        }
    }

    fn ring(&self, bell: &LocalDoorbell) -> dspq::Result<()> {
        self.check_alive()?;
        if let Some(e) = *self.signal_error.lock() {
            return Err(e);
        }
        self.signals.fetch_add(1, Ordering::Relaxed);
        bell.ring();
        Ok(())
    }

    fn is_registered(&self, remote_id: u64) -> bool {
        self.queues.lock().contains_key(&remote_id)
    }
}

/// The host's handle on a simulated domain.
struct HostView(Arc<SimDomain>);

impl RemoteDomain for HostView {
    fn create_queue(&self, slot: u32, buffer: &SharedBuffer, _generation: u32) -> dspq::Result<u64> {
        let domain = &self.0;
        domain.check_alive()?;
        if domain.refuse_create.load(Ordering::Acquire) {
            return Err(QueueError::NoResources);
        }
        if domain.negotiation == Negotiation::Capable {
            let header = SharedHeader::attach(&buffer.region())?;
            if header.version() == PROBE_VERSION {
                return Err(QueueError::Unsupported);
            }
            header.validate()?;
        }
        let remote_id = ((domain.id.raw() as u64) << 32) | domain.next_id.fetch_add(1, Ordering::Relaxed);
        domain.queues.lock().insert(
            remote_id,
            QueueRecord {
                slot,
                buffer: buffer.clone(),
                imported: false,
            },
        );
        Ok(remote_id)
    }

    fn destroy_queue(&self, remote_id: u64) -> dspq::Result<()> {
        self.0.check_alive()?;
        match self.0.queues.lock().remove(&remote_id) {
            Some(_) => Ok(()),
            None => Err(QueueError::BadParameter),
        }
    }

    fn is_imported(&self, remote_id: u64) -> dspq::Result<bool> {
        self.0.check_alive()?;
        self.0
            .queues
            .lock()
            .get(&remote_id)
            .map(|record| record.imported)
            .ok_or(QueueError::BadParameter)
    }

    fn import_queue(&self, _remote_id: u64) -> dspq::Result<ImportedQueue> {
        Err(QueueError::Unsupported)
    }

    fn release_import(&self, _remote_id: u64) -> dspq::Result<()> {
        Err(QueueError::Unsupported)
    }

    fn wait_signal(&self) -> dspq::Result<RemoteSignal> {
        self.0.wait_on(&self.0.to_host)
    }

    fn cancel_wait_signal(&self) -> dspq::Result<()> {
        self.0.to_host.cancel();
        Ok(())
    }

    fn signal(&self) -> dspq::Result<()> {
        self.0.ring(&self.0.to_remote)
    }

    fn share_counters(&self, counters: &SharedBuffer) -> dspq::Result<()> {
        self.0.check_alive()?;
        *self.0.counters.lock() = Some(counters.clone());
        Ok(())
    }

    fn attached_counters(&self) -> dspq::Result<SharedBuffer> {
        Err(QueueError::Unsupported)
    }

    fn driver_signaling_supported(&self) -> bool {
        self.0.driver
    }
}

/// The remote process's handle on its own domain.
struct RemoteView(Arc<SimDomain>);

impl RemoteDomain for RemoteView {
    fn create_queue(&self, _slot: u32, _buffer: &SharedBuffer, _generation: u32) -> dspq::Result<u64> {
        Err(QueueError::Unsupported)
    }

    fn destroy_queue(&self, _remote_id: u64) -> dspq::Result<()> {
        Err(QueueError::Unsupported)
    }

    fn is_imported(&self, _remote_id: u64) -> dspq::Result<bool> {
        Err(QueueError::Unsupported)
    }

    fn import_queue(&self, remote_id: u64) -> dspq::Result<ImportedQueue> {
        self.0.check_alive()?;
        let mut queues = self.0.queues.lock();
        let record = queues.get_mut(&remote_id).ok_or(QueueError::BadParameter)?;
        if record.imported {
            return Err(QueueError::ItemBusy);
        }
        record.imported = true;
        Ok(ImportedQueue {
            buffer: record.buffer.clone(),
            slot: record.slot,
        })
    }

    fn release_import(&self, remote_id: u64) -> dspq::Result<()> {
        self.0.check_alive()?;
        match self.0.queues.lock().get_mut(&remote_id) {
            Some(record) => {
                record.imported = false;
                Ok(())
            }
            None => Err(QueueError::BadParameter),
        }
    }

    fn wait_signal(&self) -> dspq::Result<RemoteSignal> {
        self.0.wait_on(&self.0.to_remote)
    }

    fn cancel_wait_signal(&self) -> dspq::Result<()> {
        self.0.to_remote.cancel();
        Ok(())
    }

    fn signal(&self) -> dspq::Result<()> {
        self.0.ring(&self.0.to_host)
    }

    fn share_counters(&self, _counters: &SharedBuffer) -> dspq::Result<()> {
        Err(QueueError::Unsupported)
    }

    fn attached_counters(&self) -> dspq::Result<SharedBuffer> {
        self.0.check_alive()?;
        self.0.counters.lock().clone().ok_or(QueueError::BadState)
    }

    fn driver_signaling_supported(&self) -> bool {
        self.0.driver
    }
}

type BellKey = (DomainId, u32, Side);

/// Signal ids shared by both sides of every simulated domain.
#[derive(Default)]
struct PrimitiveHub {
    bells: Mutex<HashMap<BellKey, Arc<LocalDoorbell>>>,
    dead: Mutex<HashSet<DomainId>>,
    signals: Mutex<HashMap<DomainId, u64>>,
    signal_errors: Mutex<HashMap<DomainId, QueueError>>,
}

impl PrimitiveHub {
    fn bell(&self, key: BellKey) -> Arc<LocalDoorbell> {
        self.bells.lock().entry(key).or_default().clone()
    }

    fn check_alive(&self, domain: DomainId) -> dspq::Result<()> {
        if self.dead.lock().contains(&domain) {
            return Err(QueueError::ConnectionReset);
        }
        Ok(())
    }

    fn kill(&self, domain: DomainId) {
        self.dead.lock().insert(domain);
        for (key, bell) in self.bells.lock().iter() {
            if key.0 == domain {
                bell.cancel();
            }
        }
    }
}

/// One side's view of the simulated signal primitive.
///
/// Each id has a bell per side; signalling an id rings the other side's.
pub struct SimPrimitive {
    hub: Arc<PrimitiveHub>,
    side: Side,
}

impl SimPrimitive {
    fn peer(&self) -> Side {
        match self.side {
            Side::Host => Side::Remote,
            Side::Remote => Side::Host,
        }
    }
}

impl SignalPrimitive for SimPrimitive {
    fn is_available(&self) -> bool {
        true
    }

    fn create(&self, domain: DomainId, id: u32) -> dspq::Result<()> {
        self.hub.check_alive(domain)?;
        self.hub.bell((domain, id, self.side)).reset();
        Ok(())
    }

    fn destroy(&self, domain: DomainId, id: u32) -> dspq::Result<()> {
        self.hub.bells.lock().remove(&(domain, id, self.side));
        Ok(())
    }

    fn signal(&self, domain: DomainId, id: u32) -> dspq::Result<()> {
        self.hub.check_alive(domain)?;
        if let Some(e) = self.hub.signal_errors.lock().get(&domain).copied() {
            return Err(e);
        }
        *self.hub.signals.lock().entry(domain).or_default() += 1;
        self.hub.bell((domain, id, self.peer())).ring();
        Ok(())
    }

    fn wait(&self, domain: DomainId, id: u32, timeout_us: u32) -> dspq::Result<WaitOutcome> {
        self.hub.check_alive(domain)?;
        // A destroyed id has nothing left to wait for.
        let bell = self.hub.bells.lock().get(&(domain, id, self.side)).cloned();
        Ok(bell.map_or(WaitOutcome::Cancelled, |bell| bell.wait(timeout_us)))
    }

    fn cancel_wait(&self, domain: DomainId, id: u32) -> dspq::Result<()> {
        if let Some(bell) = self.hub.bells.lock().get(&(domain, id, self.side)) {
            bell.cancel();
        }
        Ok(())
    }
}

struct SimWorld {
    negotiation: Negotiation,
    signaling: Signaling,
    domains: Mutex<HashMap<DomainId, Arc<SimDomain>>>,
    hub: Arc<PrimitiveHub>,
}

impl SimWorld {
    fn domain(&self, id: DomainId) -> Arc<SimDomain> {
        self.domains
            .lock()
            .entry(id)
            .or_insert_with(|| {
                Arc::new(SimDomain::new(
                    id,
                    self.negotiation,
                    self.signaling == Signaling::Driver,
                ))
            })
            .clone()
    }

    fn existing(&self, id: DomainId) -> Option<Arc<SimDomain>> {
        self.domains.lock().get(&id).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct SimLinkBuilder {
    signaling: Signaling,
    negotiation: Negotiation,
    config: RuntimeConfig,
}

impl Default for SimLinkBuilder {
    fn default() -> Self {
        Self {
            signaling: Signaling::Rpc,
            negotiation: Negotiation::Capable,
            config: RuntimeConfig::default(),
        }
    }
}

impl SimLinkBuilder {
    pub fn signaling(mut self, signaling: Signaling) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn negotiation(mut self, negotiation: Negotiation) -> Self {
        self.negotiation = negotiation;
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SimLink {
        let world = Arc::new(SimWorld {
            negotiation: self.negotiation,
            signaling: self.signaling,
            domains: Mutex::new(HashMap::new()),
            hub: Arc::new(PrimitiveHub::default()),
        });
        let mappings = Arc::new(MappingTable::new());

        let connector = {
            let world = world.clone();
            move |domain: DomainId| -> dspq::Result<Arc<dyn RemoteDomain>> {
                Ok(Arc::new(HostView(world.domain(domain))))
            }
        };
        let mut host = Runtime::builder(Arc::new(connector))
            .side(Side::Host)
            .config(self.config.clone())
            .allocator(Arc::new(HeapAllocator))
            .mappings(mappings.clone());
        if self.signaling == Signaling::Driver {
            host = host.signal_primitive(Arc::new(SimPrimitive {
                hub: world.hub.clone(),
                side: Side::Host,
            }));
        }

        SimLink {
            host: host.build(),
            remotes: Mutex::new(HashMap::new()),
            world,
            mappings,
            config: self.config,
        }
    }
}

/// A host runtime and its simulated remote domains.
pub struct SimLink {
    host: Runtime,
    remotes: Mutex<HashMap<DomainId, Runtime>>,
    world: Arc<SimWorld>,
    mappings: Arc<MappingTable>,
    config: RuntimeConfig,
}

impl SimLink {
    pub fn builder() -> SimLinkBuilder {
        SimLinkBuilder::default()
    }

    pub fn signaling(&self) -> Signaling {
        self.world.signaling
    }

    pub fn negotiation(&self) -> Negotiation {
        self.world.negotiation
    }

    pub fn host(&self) -> &Runtime {
        &self.host
    }

    /// The remote-side runtime serving `domain`, started on first use.
    pub fn remote(&self, domain: DomainId) -> Runtime {
        let mut remotes = self.remotes.lock();
        if let Some(runtime) = remotes.get(&domain) {
            return runtime.clone();
        }
        let world = self.world.clone();
        let connector = move |requested: DomainId| -> dspq::Result<Arc<dyn RemoteDomain>> {
            if requested != domain {
                return Err(QueueError::BadParameter);
            }
            Ok(Arc::new(RemoteView(world.domain(requested))))
        };
        let mut builder = Runtime::builder(Arc::new(connector))
            .side(Side::Remote)
            .config(self.config.clone().with_thread_name(format!("sim{}", domain.raw())))
            .allocator(Arc::new(HeapAllocator))
            .mappings(self.mappings.clone());
        if self.world.signaling == Signaling::Driver {
            builder = builder.signal_primitive(Arc::new(SimPrimitive {
                hub: self.world.hub.clone(),
                side: Side::Remote,
            }));
        }
        let runtime = builder.build();
        remotes.insert(domain, runtime.clone());
        runtime
    }

    pub fn mappings(&self) -> &MappingTable {
        &self.mappings
    }

    /// Create a queue on `domain` and import it on the remote side.
    /// Returns `(host, remote)`.
    pub fn connect(&self, domain: DomainId, options: CreateOptions) -> Result<(Queue, Queue), TestError> {
        self.connect_with(domain, options, Callbacks::default())
    }

    pub fn connect_with(
        &self,
        domain: DomainId,
        options: CreateOptions,
        remote_callbacks: Callbacks,
    ) -> Result<(Queue, Queue), TestError> {
        let host = self
            .host
            .create(domain, options)
            .map_err(|e| TestError::Setup(format!("create on {domain}: {e}")))?;
        let remote = self
            .remote(domain)
            .import(domain, host.export(), remote_callbacks)
            .map_err(|e| TestError::Setup(format!("import {} on {domain}: {e}", host.export())))?;
        Ok((host, remote))
    }

    /// Close the remote endpoint, then the host endpoint.
    pub fn disconnect(&self, host: &Queue, remote: &Queue) -> Result<(), TestError> {
        remote.close()?;
        host.close()?;
        Ok(())
    }

    /// Kill the process behind `domain`, as the session layer would see it.
    pub fn kill(&self, domain: DomainId) {
        tracing::debug!(%domain, "killing simulated domain");
        self.host.domain_failed(domain, QueueError::ConnectionReset);
        let remote = self.remotes.lock().get(&domain).cloned();
        if let Some(remote) = remote {
            remote.domain_failed(domain, QueueError::ConnectionReset);
        }
        self.world.hub.kill(domain);
        self.world.domain(domain).kill();
    }

    /// Make the domain refuse new queues with `NoResources`.
    pub fn refuse_create(&self, domain: DomainId, refuse: bool) {
        self.world.domain(domain).refuse_create.store(refuse, Ordering::Release);
    }

    /// Make every doorbell signal on `domain` fail with `error`, over both
    /// the RPC doorbells and the signal primitive. `None` restores them.
    pub fn fail_signals(&self, domain: DomainId, error: Option<QueueError>) {
        *self.world.domain(domain).signal_error.lock() = error;
        let mut errors = self.world.hub.signal_errors.lock();
        match error {
            Some(e) => {
                errors.insert(domain, e);
            }
            None => {
                errors.remove(&domain);
            }
        }
    }

    /// Doorbell signals sent on `domain` in either direction, over both the
    /// RPC doorbells and the signal primitive.
    pub fn signals_sent(&self, domain: DomainId) -> u64 {
        let rpc = self
            .world
            .existing(domain)
            .map_or(0, |d| d.signals.load(Ordering::Relaxed));
        let primitive = self.world.hub.signals.lock().get(&domain).copied().unwrap_or(0);
        rpc + primitive
    }

    /// Whether `remote_id` is still registered with the simulated domain.
    pub fn is_registered(&self, domain: DomainId, remote_id: u64) -> bool {
        self.world
            .existing(domain)
            .is_some_and(|d| d.is_registered(remote_id))
    }

    /// Overwrite the header word at the read position of one ring of a
    /// registered queue.
    pub fn scribble(&self, domain: DomainId, remote_id: u64, direction: Direction) -> Result<(), TestError> {
        let sim = self
            .world
            .existing(domain)
            .ok_or_else(|| TestError::Setup(format!("no simulated domain {domain}")))?;
        let region = sim
            .queues
            .lock()
            .get(&remote_id)
            .map(|record| record.buffer.region())
            .ok_or_else(|| TestError::Setup(format!("queue {remote_id} not registered")))?;
        let header = SharedHeader::attach(&region).map_err(|e| TestError::Setup(e.to_string()))?;
        let dir = header.direction(direction).map_err(|e| TestError::Setup(e.to_string()))?;
        let view = header.direction_view(direction).map_err(|e| TestError::Setup(e.to_string()))?;
        let read_pos = view.read.position().load(Ordering::Acquire);
        region.write((dir.queue_offset + read_pos) as usize, &[0xff; 8]);
        Ok(())
    }
}
