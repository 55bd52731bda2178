//! dspq-testkit: shared scenarios for dspq queues.
//!
//! Provides [`SimLink`], which joins a host runtime and simulated remote
//! domains inside one process, and scenario functions that every signaling
//! backend must pass.
//!
//! # Usage
//!
//! ```ignore
//! use dspq_testkit::Signaling;
//!
//! #[test]
//! fn rpc_ping_pong() {
//!     dspq_testkit::run_ping_pong(Signaling::Rpc);
//! }
//! ```

mod sim;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dspq::{
    BufferFlags, BufferMappings, BufferRef, Callbacks, CreateOptions, DomainId,
    MultiDomainContext, PacketFlags, Queue, QueueError, RuntimeConfig, SignalingMode,
    MAX_MESSAGE_SIZE, MAX_QUEUES_PER_DOMAIN, WAIT_INFINITE,
};
use dspq_shm::Direction;
use parking_lot::Mutex;

pub use sim::{Negotiation, Signaling, SimLink, SimLinkBuilder, SimPrimitive};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Queue or link setup failed.
    Setup(String),
    /// A queue operation failed unexpectedly.
    Queue(QueueError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Queue(e) => write!(f, "queue error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<QueueError> for TestError {
    fn from(e: QueueError) -> Self {
        TestError::Queue(e)
    }
}

/// Install a `tracing` subscriber for tests. `RUST_LOG` selects the level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Helpers
// ============================================================================

const D1: DomainId = DomainId::new(1);
const D2: DomainId = DomainId::new(2);

/// Upper bound for blocking calls that are expected to complete.
const LONG_WAIT_US: u32 = 5_000_000;

/// Time for a spawned thread to reach its blocking call.
const SETTLE: Duration = Duration::from_millis(20);

fn link(signaling: Signaling) -> SimLink {
    init_tracing();
    SimLink::builder().signaling(signaling).build()
}

fn check(cond: bool, what: impl FnOnce() -> String) -> Result<(), TestError> {
    if cond {
        Ok(())
    } else {
        Err(TestError::Assertion(what()))
    }
}

fn check_eq<T: PartialEq + std::fmt::Debug>(what: &str, got: T, expected: T) -> Result<(), TestError> {
    if got != expected {
        return Err(TestError::Assertion(format!(
            "{}: expected {:?}, got {:?}",
            what, expected, got
        )));
    }
    Ok(())
}

fn expect_err<T: std::fmt::Debug>(
    what: &str,
    result: dspq::Result<T>,
    expected: QueueError,
) -> Result<(), TestError> {
    match result {
        Err(e) if e == expected => Ok(()),
        other => Err(TestError::Assertion(format!(
            "{}: expected {:?}, got {:?}",
            what, expected, other
        ))),
    }
}

/// Poll `cond` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn joined<T>(handle: thread::ScopedJoinHandle<'_, T>) -> Result<T, TestError> {
    handle
        .join()
        .map_err(|_| TestError::Setup("scenario thread panicked".into()))
}

fn expected_mode(link: &SimLink) -> SignalingMode {
    match (link.negotiation(), link.signaling()) {
        (Negotiation::Legacy, _) => SignalingMode::Legacy,
        (Negotiation::Capable, Signaling::Rpc) => SignalingMode::Reduced,
        (Negotiation::Capable, Signaling::Driver) => SignalingMode::Optimized,
    }
}

/// Write 8-byte packets until the ring is full. Returns how many fit.
fn fill(queue: &Queue) -> Result<u64, TestError> {
    let mut written = 0u64;
    loop {
        match queue.write_noblock(PacketFlags::MESSAGE, &[], &written.to_le_bytes()) {
            Ok(()) => written += 1,
            Err(QueueError::WouldBlock) => return Ok(written),
            Err(e) => return Err(e.into()),
        }
        if written > 1 << 16 {
            return Err(TestError::Assertion("ring never filled".into()));
        }
    }
}

fn read_message(queue: &Queue, timeout_us: u32) -> Result<Vec<u8>, TestError> {
    let mut message = [0u8; 256];
    let info = queue.read(&mut [], &mut message, timeout_us)?;
    Ok(message[..info.message_len].to_vec())
}

/// Deterministic payload for packet `n`.
fn pattern(n: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (n as usize * 31 + i) as u8).collect()
}

/// xorshift32, so scenarios stay reproducible without a rand dependency.
struct Rng(u32);

impl Rng {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

// ============================================================================
// Test scenarios
// ============================================================================

/// One request and one response over a fresh queue, then a clean close.
pub fn run_ping_pong(signaling: Signaling) {
    let result = run_ping_pong_inner(signaling);
    if let Err(e) = result {
        panic!("run_ping_pong failed: {}", e);
    }
}

fn run_ping_pong_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default())?;
    check_eq("signaling mode", host.signaling_mode(), expected_mode(&link))?;
    check_eq("remote signaling mode", remote.signaling_mode(), expected_mode(&link))?;
    check_eq("remote id", remote.remote_id(), host.export())?;

    host.write(PacketFlags::MESSAGE, &[], b"ping", WAIT_INFINITE)?;
    let mut message = [0u8; 64];
    let info = remote.read(&mut [], &mut message, WAIT_INFINITE)?;
    check_eq("request flags", info.flags, PacketFlags::MESSAGE)?;
    check_eq("request", &message[..info.message_len], &b"ping"[..])?;

    remote.write(PacketFlags::MESSAGE, &[], b"pong", WAIT_INFINITE)?;
    check_eq("response", read_message(&host, WAIT_INFINITE)?, b"pong".to_vec())?;

    let remote_id = host.export();
    link.disconnect(&host, &remote)?;
    check_eq("open queues", link.host().active_queues(D1), 0)?;
    check(link.host().domains().is_empty(), || "domain still registered".into())?;
    check(!link.is_registered(D1, remote_id), || "queue not destroyed".into())?;
    Ok(())
}

/// Fill a small ring, check the no-op-on-full and timeout behaviour, then
/// drain it in order.
pub fn run_fill_drain(signaling: Signaling) {
    let result = run_fill_drain_inner(signaling);
    if let Err(e) = result {
        panic!("run_fill_drain failed: {}", e);
    }
}

fn run_fill_drain_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default().with_sizes(256, 256))?;

    // 16-byte packets in a 256-byte ring that always keeps 8 bytes of slack.
    let written = fill(&host)?;
    check_eq("packets that fit", written, 15)?;
    let stats = host.stats()?;
    check_eq("queued packets", stats.write_packets, 15)?;
    check_eq("queued bytes", stats.write_bytes, 240)?;
    check_eq("remote sees packets", remote.stats()?.read_packets, 15)?;

    expect_err(
        "write on full ring",
        host.write_noblock(PacketFlags::MESSAGE, &[], b"x"),
        QueueError::WouldBlock,
    )?;
    expect_err(
        "zero timeout on full ring",
        host.write(PacketFlags::MESSAGE, &[], b"x", 0),
        QueueError::Expired,
    )?;
    let start = Instant::now();
    expect_err(
        "short timeout on full ring",
        host.write(PacketFlags::MESSAGE, &[], b"x", 5_000),
        QueueError::Expired,
    )?;
    check(start.elapsed() >= Duration::from_millis(5), || {
        format!("timed out early after {:?}", start.elapsed())
    })?;
    check_eq("failed writes left ring alone", host.stats()?.write_packets, 15)?;

    for n in 0..written {
        let mut message = [0u8; 8];
        let info = remote.read_noblock(&mut [], &mut message)?;
        check_eq("message length", info.message_len, 8)?;
        check_eq("fifo order", u64::from_le_bytes(message), n)?;
    }
    expect_err("drained read", remote.read_noblock(&mut [], &mut [0u8; 8]), QueueError::WouldBlock)?;
    expect_err("drained peek", remote.peek_noblock(), QueueError::WouldBlock)?;
    expect_err("drained timed read", remote.read(&mut [], &mut [0u8; 8], 2_000), QueueError::Expired)?;
    check_eq("ring empty", host.stats()?.write_packets, 0)?;

    link.disconnect(&host, &remote)?;
    Ok(())
}

/// Invalid writes and undersized reads fail without changing the ring.
pub fn run_parameter_checks(signaling: Signaling) {
    let result = run_parameter_checks_inner(signaling);
    if let Err(e) = result {
        panic!("run_parameter_checks failed: {}", e);
    }
}

fn run_parameter_checks_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default().with_sizes(256, 256))?;

    expect_err(
        "packet larger than ring",
        host.write_noblock(PacketFlags::MESSAGE, &[], &[0u8; 300]),
        QueueError::BadParameter,
    )?;
    expect_err(
        "message over limit",
        host.write_noblock(PacketFlags::MESSAGE, &[], &vec![0u8; MAX_MESSAGE_SIZE + 1]),
        QueueError::BadParameter,
    )?;
    expect_err(
        "internal flag",
        host.write_noblock(PacketFlags::WAKEUP, &[], &[]),
        QueueError::BadParameter,
    )?;
    expect_err(
        "too many buffers",
        host.write_noblock(PacketFlags::BUFFERS, &[BufferRef::default(); 65], &[]),
        QueueError::BadParameter,
    )?;
    check_eq("nothing written", host.stats()?.write_packets, 0)?;

    // Ring length minus slack fits, but only while the ring is empty at
    // offset 0.
    let max_message = 256 - 8 - 8;
    host.write_noblock(PacketFlags::MESSAGE, &[], &vec![7u8; max_message])?;
    let mut big = vec![0u8; max_message];
    let info = remote.read_noblock(&mut [], &mut big)?;
    check_eq("largest packet", info.message_len, max_message)?;

    host.write_noblock(PacketFlags::MESSAGE, &[], b"0123456789")?;
    let peeked = remote.peek_noblock()?;
    check_eq("peeked length", peeked.message_len, 10)?;
    expect_err(
        "undersized message output",
        remote.read_noblock(&mut [], &mut [0u8; 4]),
        QueueError::BadParameter,
    )?;
    check_eq("packet still queued", remote.stats()?.read_packets, 1)?;
    let mut message = [0u8; 16];
    let info = remote.read_noblock(&mut [], &mut message)?;
    check_eq("read after retry", &message[..info.message_len], &b"0123456789"[..])?;

    link.disconnect(&host, &remote)?;
    Ok(())
}

/// Mixed packet sizes through a small ring, forcing many wraparounds.
pub fn run_wraparound(signaling: Signaling) {
    let result = run_wraparound_inner(signaling);
    if let Err(e) = result {
        panic!("run_wraparound failed: {}", e);
    }
}

fn run_wraparound_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default().with_sizes(256, 256))?;
    let mut rng = Rng(0x9e37_79b9);
    let mut pending = std::collections::VecDeque::new();
    let mut next = 0u32;
    let mut total_bytes = 0usize;

    let drain_one = |pending: &mut std::collections::VecDeque<(Vec<BufferRef>, Vec<u8>)>| -> Result<(), TestError> {
        let Some((buffers, payload)) = pending.pop_front() else {
            return Ok(());
        };
        let mut out_buffers = [BufferRef::default(); 4];
        let mut out_message = [0u8; 64];
        let info = remote.read_noblock(&mut out_buffers, &mut out_message)?;
        check_eq("buffers", &out_buffers[..info.buffer_count], &buffers[..])?;
        check_eq("payload", &out_message[..info.message_len], &payload[..])
    };

    for _ in 0..300 {
        for _ in 0..1 + rng.next() % 4 {
            let len = (rng.next() % 48) as usize;
            let buffers: Vec<BufferRef> = (0..rng.next() % 3)
                .map(|i| BufferRef::new(next as i32, i * 64, 64))
                .collect();
            let payload = pattern(next, len);
            let mut flags = PacketFlags::MESSAGE;
            if !buffers.is_empty() {
                flags |= PacketFlags::BUFFERS;
            }
            match host.write_noblock(flags, &buffers, &payload) {
                Ok(()) => {
                    total_bytes += 8 + buffers.len() * 16 + len;
                    pending.push_back((buffers, payload));
                    next += 1;
                }
                Err(QueueError::WouldBlock) => break,
                Err(e) => return Err(e.into()),
            }
        }
        for _ in 0..rng.next() % 4 {
            drain_one(&mut pending)?;
        }
    }
    while !pending.is_empty() {
        drain_one(&mut pending)?;
    }
    expect_err("drained", remote.read_noblock(&mut [], &mut [0u8; 8]), QueueError::WouldBlock)?;
    check(total_bytes > 256 * 8, || format!("only {} bytes went through", total_bytes))?;

    link.disconnect(&host, &remote)?;
    Ok(())
}

/// Several writer threads against one blocking reader. Each writer's
/// packets arrive in the order it wrote them.
pub fn run_fifo_multiple_writers(signaling: Signaling) {
    let result = run_fifo_multiple_writers_inner(signaling);
    if let Err(e) = result {
        panic!("run_fifo_multiple_writers failed: {}", e);
    }
}

fn run_fifo_multiple_writers_inner(signaling: Signaling) -> Result<(), TestError> {
    const WRITERS: u32 = 4;
    const PER_WRITER: u32 = 200;

    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default().with_sizes(512, 512))?;

    let seen = thread::scope(|s| -> Result<Vec<(u32, u32)>, TestError> {
        let reader = s.spawn(|| -> Result<Vec<(u32, u32)>, TestError> {
            let mut seen = Vec::with_capacity((WRITERS * PER_WRITER) as usize);
            let mut message = [0u8; 8];
            for _ in 0..WRITERS * PER_WRITER {
                remote.read(&mut [], &mut message, LONG_WAIT_US)?;
                let writer = u32::from_le_bytes([message[0], message[1], message[2], message[3]]);
                let n = u32::from_le_bytes([message[4], message[5], message[6], message[7]]);
                seen.push((writer, n));
            }
            Ok(seen)
        });
        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let host = &host;
                s.spawn(move || -> Result<(), TestError> {
                    for n in 0..PER_WRITER {
                        let mut message = [0u8; 8];
                        message[..4].copy_from_slice(&writer.to_le_bytes());
                        message[4..].copy_from_slice(&n.to_le_bytes());
                        host.write(PacketFlags::MESSAGE, &[], &message, LONG_WAIT_US)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for writer in writers {
            joined(writer)??;
        }
        joined(reader)?
    })?;

    let mut next = vec![0u32; WRITERS as usize];
    for (writer, n) in seen {
        let expected = next
            .get_mut(writer as usize)
            .ok_or_else(|| TestError::Assertion(format!("unknown writer {}", writer)))?;
        check_eq("per-writer order", n, *expected)?;
        *expected += 1;
    }
    check(next.iter().all(|&n| n == PER_WRITER), || format!("missing packets: {:?}", next))?;

    link.disconnect(&host, &remote)?;
    Ok(())
}

/// Blocked readers wake on a write; blocked writers wake on a read.
pub fn run_blocking_wake(signaling: Signaling) {
    let result = run_blocking_wake_inner(signaling);
    if let Err(e) = result {
        panic!("run_blocking_wake failed: {}", e);
    }
}

fn run_blocking_wake_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default().with_sizes(256, 256))?;

    thread::scope(|s| -> Result<(), TestError> {
        let reader = s.spawn(|| read_message(&remote, LONG_WAIT_US));
        thread::sleep(SETTLE);
        host.write(PacketFlags::MESSAGE, &[], b"late", 0)?;
        check_eq("woken reader", joined(reader)??, b"late".to_vec())
    })?;

    // Same the other way round, on the response ring.
    thread::scope(|s| -> Result<(), TestError> {
        let reader = s.spawn(|| read_message(&host, LONG_WAIT_US));
        thread::sleep(SETTLE);
        remote.write(PacketFlags::MESSAGE, &[], b"reply", 0)?;
        check_eq("woken host reader", joined(reader)??, b"reply".to_vec())
    })?;

    let written = fill(&host)?;
    thread::scope(|s| -> Result<(), TestError> {
        let writer = s.spawn(|| host.write(PacketFlags::MESSAGE, &[], &written.to_le_bytes(), LONG_WAIT_US));
        thread::sleep(SETTLE);
        let mut message = [0u8; 8];
        remote.read_noblock(&mut [], &mut message)?;
        joined(writer)??;
        Ok(())
    })?;
    for n in 1..=written {
        let mut message = [0u8; 8];
        remote.read_noblock(&mut [], &mut message)?;
        check_eq("order after blocked write", u64::from_le_bytes(message), n)?;
    }

    let start = Instant::now();
    expect_err("timed read", remote.read(&mut [], &mut [0u8; 8], 10_000), QueueError::Expired)?;
    check(start.elapsed() >= Duration::from_millis(10), || {
        format!("read timed out early after {:?}", start.elapsed())
    })?;
    expect_err("timed peek", remote.peek(1_000), QueueError::Expired)?;

    link.disconnect(&host, &remote)?;
    Ok(())
}

/// Closing an endpoint wakes its blocked callers.
pub fn run_close_cancels_waiters(signaling: Signaling) {
    let result = run_close_cancels_waiters_inner(signaling);
    if let Err(e) = result {
        panic!("run_close_cancels_waiters failed: {}", e);
    }
}

fn run_close_cancels_waiters_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default().with_sizes(256, 256))?;
    let written = fill(&remote)?;

    thread::scope(|s| -> Result<(), TestError> {
        let readers: Vec<_> = (0..2)
            .map(|_| s.spawn(|| remote.read(&mut [], &mut [0u8; 8], WAIT_INFINITE)))
            .collect();
        let writer = s.spawn(|| {
            remote.write(PacketFlags::MESSAGE, &[], &written.to_le_bytes(), WAIT_INFINITE)
        });
        thread::sleep(SETTLE);
        remote.close()?;
        for (i, reader) in readers.into_iter().enumerate() {
            match joined(reader)? {
                // BadState if the close landed before the reader blocked.
                Err(QueueError::Interrupted) | Err(QueueError::BadState) => {}
                other => {
                    return Err(TestError::Assertion(format!("blocked reader {i} returned {:?}", other)))
                }
            }
        }
        match joined(writer)? {
            Err(QueueError::Interrupted) | Err(QueueError::BadState) => Ok(()),
            other => Err(TestError::Assertion(format!("blocked writer returned {:?}", other))),
        }
    })?;

    expect_err("read after close", remote.read_noblock(&mut [], &mut [0u8; 8]), QueueError::BadState)?;
    expect_err("second close", remote.close(), QueueError::BadState)?;
    host.close()?;
    check(link.host().domains().is_empty(), || "domain still registered".into())?;
    Ok(())
}

/// A dead domain fails every queue on it, including blocked callers.
pub fn run_domain_death(signaling: Signaling) {
    let result = run_domain_death_inner(signaling);
    if let Err(e) = result {
        panic!("run_domain_death failed: {}", e);
    }
}

fn run_domain_death_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (h1, r1) = link.connect(D1, CreateOptions::default())?;
    let (h2, r2) = link.connect(D1, CreateOptions::default())?;
    let (other_host, other_remote) = link.connect(D2, CreateOptions::default())?;

    let written = fill(&h1)?;

    let signals_at_death = thread::scope(|s| -> Result<u64, TestError> {
        let q1_reader = s.spawn(|| h1.read(&mut [], &mut [0u8; 8], WAIT_INFINITE));
        let q1_writer = s.spawn(|| h1.write(PacketFlags::MESSAGE, &[], &written.to_le_bytes(), WAIT_INFINITE));
        let q2_host_reader = s.spawn(|| h2.read(&mut [], &mut [0u8; 8], WAIT_INFINITE));
        let q2_remote_reader = s.spawn(|| r2.read(&mut [], &mut [0u8; 8], WAIT_INFINITE));
        thread::sleep(SETTLE);
        link.kill(D1);
        let signals_at_death = link.signals_sent(D1);
        expect_err("blocked Q1 reader", joined(q1_reader)?, QueueError::ConnectionReset)?;
        expect_err("blocked Q1 writer", joined(q1_writer)?, QueueError::ConnectionReset)?;
        expect_err("blocked Q2 reader", joined(q2_host_reader)?, QueueError::ConnectionReset)?;
        expect_err("blocked Q2 remote reader", joined(q2_remote_reader)?, QueueError::ConnectionReset)?;
        Ok(signals_at_death)
    })?;

    check_eq("domain error", link.host().domain_error(D1), Some(QueueError::ConnectionReset))?;
    expect_err(
        "write on sibling",
        h2.write_noblock(PacketFlags::MESSAGE, &[], b"x"),
        QueueError::ConnectionReset,
    )?;
    expect_err("remote read", r2.read_noblock(&mut [], &mut [0u8; 8]), QueueError::ConnectionReset)?;
    expect_err("remote peek", r1.peek_noblock(), QueueError::ConnectionReset)?;

    // Other domains are unaffected.
    other_host.write_noblock(PacketFlags::MESSAGE, &[], b"alive")?;
    check_eq("other domain", read_message(&other_remote, LONG_WAIT_US)?, b"alive".to_vec())?;

    for queue in [&r1, &r2, &h1, &h2] {
        queue.close()?;
    }
    check_eq("signals after death", link.signals_sent(D1), signals_at_death)?;
    check_eq("dead domain released", link.host().active_queues(D1), 0)?;
    check_eq("domains", link.host().domains(), vec![D2])?;
    expect_err(
        "create on dead domain",
        link.host().create(D1, CreateOptions::default()),
        QueueError::ConnectionReset,
    )?;

    link.disconnect(&other_host, &other_remote)?;
    Ok(())
}

/// A doorbell that fails after a packet is published must not lose or
/// duplicate the packet: the call still succeeds and the failure goes to the
/// domain.
pub fn run_signal_failure_after_publish(signaling: Signaling) {
    let result = run_signal_failure_after_publish_inner(signaling);
    if let Err(e) = result {
        panic!("run_signal_failure_after_publish failed: {}", e);
    }
}

fn run_signal_failure_after_publish_inner(signaling: Signaling) -> Result<(), TestError> {
    init_tracing();
    // Legacy signaling sends on every publish, waiter or not.
    let link = SimLink::builder()
        .signaling(signaling)
        .negotiation(Negotiation::Legacy)
        .build();
    let (host, remote) = link.connect(D1, CreateOptions::default())?;

    link.fail_signals(D1, Some(QueueError::BadParameter));
    host.write_noblock(PacketFlags::MESSAGE, &[], b"precious")?;

    match signaling {
        Signaling::Driver => {
            let mut message = [0u8; 16];
            let info = remote.read_noblock(&mut [], &mut message)?;
            check_eq("delivered", &message[..info.message_len], &b"precious"[..])?;
            expect_err(
                "no duplicate",
                remote.read_noblock(&mut [], &mut message),
                QueueError::WouldBlock,
            )?;
            check_eq("non-fatal failure", link.host().domain_error(D1), None)?;
            check_eq("remote side", link.remote(D1).domain_error(D1), None)?;

            link.fail_signals(D1, Some(QueueError::ConnectionReset));
            host.write_noblock(PacketFlags::MESSAGE, &[], b"last")?;
            check_eq(
                "fatal failure escalated",
                link.host().domain_error(D1),
                Some(QueueError::ConnectionReset),
            )?;
            expect_err(
                "write after escalation",
                host.write_noblock(PacketFlags::MESSAGE, &[], b"x"),
                QueueError::ConnectionReset,
            )?;
        }
        Signaling::Rpc => {
            // The send thread reports the failure on its own.
            check(
                wait_until(Duration::from_secs(1), || link.host().domain_error(D1).is_some()),
                || "failed rpc signal was not escalated".into(),
            )?;
            check_eq("escalated error", link.host().domain_error(D1), Some(QueueError::BadState))?;
        }
    }

    link.fail_signals(D1, None);
    remote.close()?;
    host.close()?;
    check_eq("open queues", link.host().active_queues(D1), 0)?;
    Ok(())
}

/// With wait counts negotiated, nothing is signalled while nobody waits.
pub fn run_signal_suppression(signaling: Signaling) {
    let result = run_signal_suppression_inner(signaling);
    if let Err(e) = result {
        panic!("run_signal_suppression failed: {}", e);
    }
}

fn run_signal_suppression_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default())?;
    check(host.signaling_mode() != SignalingMode::Legacy, || "wait counts not negotiated".into())?;

    let before = link.signals_sent(D1);
    for n in 0..10u8 {
        host.write_noblock(PacketFlags::MESSAGE, &[], &[n])?;
    }
    for _ in 0..10 {
        remote.read_noblock(&mut [], &mut [0u8; 1])?;
    }
    check_eq("signals with nobody waiting", link.signals_sent(D1) - before, 0)?;

    thread::scope(|s| -> Result<(), TestError> {
        let reader = s.spawn(|| read_message(&remote, LONG_WAIT_US));
        thread::sleep(SETTLE);
        host.write_noblock(PacketFlags::MESSAGE, &[], b"wake")?;
        check_eq("woken reader", joined(reader)??, b"wake".to_vec())
    })?;
    check(
        wait_until(Duration::from_secs(1), || link.signals_sent(D1) > before),
        || "waiting reader was never signalled".into(),
    )?;

    link.disconnect(&host, &remote)?;
    Ok(())
}

/// A remote that predates wait counts gets legacy signaling, which still
/// works end to end.
pub fn run_legacy_negotiation(signaling: Signaling) {
    let result = run_legacy_negotiation_inner(signaling);
    if let Err(e) = result {
        panic!("run_legacy_negotiation failed: {}", e);
    }
}

fn run_legacy_negotiation_inner(signaling: Signaling) -> Result<(), TestError> {
    init_tracing();
    let link = SimLink::builder()
        .signaling(signaling)
        .negotiation(Negotiation::Legacy)
        .build();
    let (host, remote) = link.connect(D1, CreateOptions::default())?;
    check_eq("signaling mode", host.signaling_mode(), SignalingMode::Legacy)?;
    check_eq("remote signaling mode", remote.signaling_mode(), SignalingMode::Legacy)?;
    check_eq("stats mode", host.stats()?.signaling, SignalingMode::Legacy)?;

    let before = link.signals_sent(D1);
    host.write_noblock(PacketFlags::MESSAGE, &[], b"unasked")?;
    check(
        wait_until(Duration::from_secs(1), || link.signals_sent(D1) > before),
        || "legacy write did not signal".into(),
    )?;
    check_eq("read", read_message(&remote, LONG_WAIT_US)?, b"unasked".to_vec())?;

    thread::scope(|s| -> Result<(), TestError> {
        let reader = s.spawn(|| read_message(&host, LONG_WAIT_US));
        thread::sleep(SETTLE);
        remote.write(PacketFlags::MESSAGE, &[], b"legacy", LONG_WAIT_US)?;
        check_eq("woken reader", joined(reader)??, b"legacy".to_vec())
    })?;

    link.disconnect(&host, &remote)?;
    Ok(())
}

/// Early-wakeup hints: consumed by peek, honoured by read, and counted.
pub fn run_early_wakeup(signaling: Signaling) {
    let result = run_early_wakeup_inner(signaling);
    if let Err(e) = result {
        panic!("run_early_wakeup failed: {}", e);
    }
}

fn run_early_wakeup_inner(signaling: Signaling) -> Result<(), TestError> {
    init_tracing();
    let link = SimLink::builder()
        .signaling(signaling)
        .config(RuntimeConfig::default().with_early_wakeup(100, 50_000))
        .build();
    let (host, remote) = link.connect(D1, CreateOptions::default())?;
    let mut message = [0u8; 16];

    // Peek skips the hint.
    host.write_early_wakeup_noblock(0, PacketFlags::MESSAGE)?;
    host.write_noblock(PacketFlags::MESSAGE, &[], b"after")?;
    let info = remote.peek_noblock()?;
    check_eq("peeked flags", info.flags, PacketFlags::MESSAGE)?;
    check_eq("peeked length", info.message_len, 5)?;
    let info = remote.read_noblock(&mut [], &mut message)?;
    check_eq("read after hint", &message[..info.message_len], &b"after"[..])?;
    remote.stats()?;

    // The real packet lands inside the hinted window.
    host.write_early_wakeup_noblock(50_000, PacketFlags::MESSAGE)?;
    let info = thread::scope(|s| -> Result<dspq::PacketInfo, TestError> {
        let writer = s.spawn(|| {
            thread::sleep(Duration::from_millis(1));
            host.write_noblock(PacketFlags::MESSAGE, &[], b"soon")
        });
        let info = remote.read_noblock(&mut [], &mut message);
        joined(writer)??;
        Ok(info?)
    })?;
    check_eq("hinted packet", &message[..info.message_len], &b"soon"[..])?;
    let stats = remote.stats()?;
    check_eq("misses after hit", stats.early_wakeup_misses, 0)?;

    // Nothing follows the hint.
    host.write_early_wakeup_noblock(2_000, PacketFlags::MESSAGE)?;
    let start = Instant::now();
    expect_err("missed hint", remote.read_noblock(&mut [], &mut message), QueueError::WouldBlock)?;
    check(start.elapsed() >= Duration::from_millis(2), || {
        format!("gave up after {:?}", start.elapsed())
    })?;
    let stats = remote.stats()?;
    check_eq("misses", stats.early_wakeup_misses, 1)?;
    check(stats.early_wakeup_wait_us >= 2_000, || {
        format!("waited {}us", stats.early_wakeup_wait_us)
    })?;
    check_eq("stats reset", remote.stats()?.early_wakeup_misses, 0)?;

    // Hints are clamped to the configured maximum.
    host.write_early_wakeup_noblock(u32::MAX - 1, PacketFlags::MESSAGE)?;
    let start = Instant::now();
    expect_err("clamped hint", remote.read_noblock(&mut [], &mut message), QueueError::WouldBlock)?;
    check(start.elapsed() < Duration::from_secs(2), || {
        format!("hint not clamped, waited {:?}", start.elapsed())
    })?;
    link.disconnect(&host, &remote)?;

    // A full ring drops the hint.
    let (host, remote) = link.connect(D2, CreateOptions::default().with_sizes(256, 256))?;
    fill(&host)?;
    expect_err(
        "hint on full ring",
        host.write_early_wakeup_noblock(1_000, PacketFlags::MESSAGE),
        QueueError::WouldBlock,
    )?;
    link.disconnect(&host, &remote)?;
    Ok(())
}

/// Reference counting and cache maintenance on buffer references.
pub fn run_buffer_refs(signaling: Signaling) {
    let result = run_buffer_refs_inner(signaling);
    if let Err(e) = result {
        panic!("run_buffer_refs failed: {}", e);
    }
}

fn run_buffer_refs_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default())?;
    let mappings = link.mappings();
    mappings.map(D1, 7);

    let buffer = BufferRef::new(7, 0, 4096).with_flags(
        BufferFlags::REF
            | BufferFlags::DEREF
            | BufferFlags::FLUSH_SENDER
            | BufferFlags::INVALIDATE_RECIPIENT,
    );
    host.write_noblock(PacketFlags::BUFFERS | PacketFlags::MESSAGE, &[buffer], b"buf")?;
    check_eq("refs after write", mappings.refs(D1, 7), Some(1))?;
    check_eq("syncs after write", mappings.sync_counts(D1, 7), Some((1, 0)))?;
    expect_err("unmap while referenced", mappings.unmap(D1, 7), QueueError::ItemBusy)?;

    let stray = BufferRef::new(9, 0, 64).with_flags(BufferFlags::REF);
    expect_err(
        "unmapped buffer",
        host.write_noblock(PacketFlags::BUFFERS, &[buffer, stray], &[]),
        QueueError::NoSuchMapping,
    )?;
    check_eq("refs rolled back", mappings.refs(D1, 7), Some(1))?;
    check_eq("nothing written", host.stats()?.write_packets, 1)?;

    let mut buffers = [BufferRef::default(); 2];
    let mut message = [0u8; 8];
    expect_err(
        "no room for buffers",
        remote.read_noblock(&mut [], &mut message),
        QueueError::BadParameter,
    )?;
    check_eq("refs kept", mappings.refs(D1, 7), Some(1))?;
    let info = remote.read_noblock(&mut buffers, &mut message)?;
    check_eq("buffer count", info.buffer_count, 1)?;
    check_eq("buffer", buffers[0], buffer)?;
    check_eq("message", &message[..info.message_len], &b"buf"[..])?;
    check_eq("refs after read", mappings.refs(D1, 7), Some(0))?;
    check_eq("syncs after read", mappings.sync_counts(D1, 7), Some((1, 1)))?;
    mappings.unmap(D1, 7)?;

    // A dereference that cannot be applied leaves the packet queued.
    mappings.map(D1, 8);
    let plain = BufferRef::new(8, 0, 64).with_flags(BufferFlags::DEREF);
    host.write_noblock(PacketFlags::BUFFERS, &[plain], &[])?;
    expect_err(
        "dereference below zero",
        remote.read_noblock(&mut buffers, &mut message),
        QueueError::BadParameter,
    )?;
    check_eq("packet kept", remote.stats()?.read_packets, 1)?;
    mappings.adjust_ref(D1, 8, 1)?;
    remote.read_noblock(&mut buffers, &mut message)?;
    check_eq("refs balanced", mappings.refs(D1, 8), Some(0))?;

    link.disconnect(&host, &remote)?;
    Ok(())
}

/// Import and close rules between the two endpoints.
pub fn run_import_rules(signaling: Signaling) {
    let result = run_import_rules_inner(signaling);
    if let Err(e) = result {
        panic!("run_import_rules failed: {}", e);
    }
}

fn run_import_rules_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default())?;
    let id = host.export();

    expect_err(
        "second import",
        link.remote(D1).import(D1, id, Callbacks::default()),
        QueueError::ItemBusy,
    )?;
    expect_err(
        "import on host",
        link.host().import(D1, id, Callbacks::default()),
        QueueError::Unsupported,
    )?;
    expect_err(
        "create on remote",
        link.remote(D1).create(D1, CreateOptions::default()),
        QueueError::Unsupported,
    )?;
    expect_err(
        "unknown id",
        link.remote(D1).import(D1, 0xdead, Callbacks::default()),
        QueueError::BadParameter,
    )?;

    expect_err("close while imported", host.close(), QueueError::ItemBusy)?;
    check(!host.is_closed(), || "refused close closed the queue".into())?;
    host.write_noblock(PacketFlags::MESSAGE, &[], b"still")?;
    check_eq("still usable", read_message(&remote, LONG_WAIT_US)?, b"still".to_vec())?;

    remote.close()?;
    expect_err("second remote close", remote.close(), QueueError::BadState)?;
    host.close()?;
    expect_err("write after close", host.write_noblock(PacketFlags::MESSAGE, &[], b"x"), QueueError::BadState)?;
    expect_err("stats after close", host.stats(), QueueError::BadState)?;
    check(!link.is_registered(D1, id), || "closed queue still registered".into())?;

    // Slots are reusable.
    let (host, remote) = link.connect(D1, CreateOptions::default())?;
    link.disconnect(&host, &remote)?;
    Ok(())
}

/// A domain holds a fixed number of queues.
pub fn run_slot_exhaustion(signaling: Signaling) {
    let result = run_slot_exhaustion_inner(signaling);
    if let Err(e) = result {
        panic!("run_slot_exhaustion failed: {}", e);
    }
}

fn run_slot_exhaustion_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let options = CreateOptions::default().with_sizes(256, 256);
    let queues = (0..MAX_QUEUES_PER_DOMAIN)
        .map(|_| link.host().create(D1, options.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    check_eq("active", link.host().active_queues(D1), MAX_QUEUES_PER_DOMAIN)?;
    expect_err("one too many", link.host().create(D1, options.clone()), QueueError::NoResources)?;

    let freed = &queues[3];
    freed.close()?;
    let again = link.host().create(D1, options)?;
    let remote = link.remote(D1).import(D1, again.export(), Callbacks::default())?;
    again.write_noblock(PacketFlags::MESSAGE, &[], b"reused")?;
    check_eq("reused slot", read_message(&remote, LONG_WAIT_US)?, b"reused".to_vec())?;
    link.disconnect(&again, &remote)?;

    for (i, queue) in queues.iter().enumerate() {
        if i != 3 {
            queue.close()?;
        }
    }
    check(link.host().domains().is_empty(), || "domain still registered".into())?;
    Ok(())
}

/// Packet and error callbacks run on their own thread.
pub fn run_callbacks(signaling: Signaling) {
    let result = run_callbacks_inner(signaling);
    if let Err(e) = result {
        panic!("run_callbacks failed: {}", e);
    }
}

fn run_callbacks_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let received = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let callbacks = Callbacks::default()
        .on_packet({
            let received = received.clone();
            move |queue: &Queue| {
                let mut message = [0u8; 64];
                while let Ok(info) = queue.read_noblock(&mut [], &mut message) {
                    received.lock().push(message[..info.message_len].to_vec());
                }
            }
        })
        .on_error({
            let errors = errors.clone();
            move |_queue: &Queue, error: QueueError| errors.lock().push(error)
        });
    let (host, remote) = link.connect_with(D1, CreateOptions::default(), callbacks)?;

    for n in 0..5u8 {
        host.write(PacketFlags::MESSAGE, &[], &[n], LONG_WAIT_US)?;
    }
    check(
        wait_until(Duration::from_secs(2), || received.lock().len() == 5),
        || format!("callback saw {} packets", received.lock().len()),
    )?;
    let expected: Vec<Vec<u8>> = (0..5u8).map(|n| vec![n]).collect();
    check_eq("callback order", received.lock().clone(), expected)?;
    check(errors.lock().is_empty(), || "error callback fired early".into())?;

    link.kill(D1);
    check(
        wait_until(Duration::from_secs(2), || !errors.lock().is_empty()),
        || "error callback never fired".into(),
    )?;
    check_eq("reported error", errors.lock()[0], QueueError::ConnectionReset)?;

    link.disconnect(&host, &remote)?;
    Ok(())
}

/// A corrupted ring makes the queue unusable on both endpoints.
pub fn run_corruption(signaling: Signaling) {
    let result = run_corruption_inner(signaling);
    if let Err(e) = result {
        panic!("run_corruption failed: {}", e);
    }
}

fn run_corruption_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let (host, remote) = link.connect(D1, CreateOptions::default())?;
    host.write_noblock(PacketFlags::MESSAGE, &[], b"fine")?;
    link.scribble(D1, host.export(), Direction::Request)?;

    expect_err("read corrupted", remote.read_noblock(&mut [], &mut [0u8; 8]), QueueError::CorruptedItem)?;
    expect_err("peek corrupted", remote.peek_noblock(), QueueError::CorruptedItem)?;
    expect_err(
        "write after corruption",
        host.write_noblock(PacketFlags::MESSAGE, &[], b"x"),
        QueueError::CorruptedItem,
    )?;

    link.disconnect(&host, &remote)?;
    Ok(())
}

/// Writes fan out to every member; reads find whichever member has data.
pub fn run_multi_domain(signaling: Signaling) {
    let result = run_multi_domain_inner(signaling);
    if let Err(e) = result {
        panic!("run_multi_domain failed: {}", e);
    }
}

fn run_multi_domain_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let domains = vec![DomainId::new(1), DomainId::new(2), DomainId::new(3)];
    let context = MultiDomainContext::new(domains.clone())?;
    let multi = link.host().create_multi(&context, CreateOptions::default())?;
    check_eq("member domains", multi.domains(), domains.clone())?;

    let remotes = domains
        .iter()
        .zip(multi.export())
        .map(|(&domain, id)| link.remote(domain).import(domain, id, Callbacks::default()))
        .collect::<Result<Vec<_>, _>>()?;

    multi.write_noblock(PacketFlags::MESSAGE, &[], b"all")?;
    for remote in &remotes {
        check_eq("replicated", read_message(remote, 0)?, b"all".to_vec())?;
    }

    let mut message = [0u8; 8];
    expect_err("nothing to read", multi.read_noblock(&mut [], &mut message), QueueError::WouldBlock)?;
    remotes[1].write_noblock(PacketFlags::MESSAGE, &[], b"two")?;
    let (from, info) = multi.peek_noblock()?;
    check_eq("peek source", from, domains[1])?;
    check_eq("peek length", info.message_len, 3)?;
    let (from, info) = multi.read_noblock(&mut [], &mut message)?;
    check_eq("read source", from, domains[1])?;
    check_eq("read message", &message[..info.message_len], &b"two"[..])?;

    expect_err("blocking read", multi.read(&mut [], &mut message, 1_000), QueueError::Unsupported)?;
    expect_err("blocking peek", multi.peek(1_000), QueueError::Unsupported)?;
    expect_err("stats", multi.stats(), QueueError::Unsupported)?;

    expect_err("close while imported", multi.close(), QueueError::ItemBusy)?;
    for remote in &remotes {
        remote.close()?;
    }
    multi.close()?;
    expect_err("second close", multi.close(), QueueError::BadState)?;

    // A single member supports the blocking calls.
    let single = link
        .host()
        .create_multi(&MultiDomainContext::new(vec![D1])?, CreateOptions::default())?;
    let remote = link.remote(D1).import(D1, single.export()[0], Callbacks::default())?;
    expect_err("single blocking read", single.read(&mut [], &mut message, 1_000), QueueError::Expired)?;
    remote.write_noblock(PacketFlags::MESSAGE, &[], b"one")?;
    let (from, _) = single.read(&mut [], &mut message, LONG_WAIT_US)?;
    check_eq("single source", from, D1)?;
    check_eq("single stats", single.stats()?.read_packets, 0)?;
    remote.close()?;
    single.close()?;
    Ok(())
}

/// A write that reaches some members but not all poisons the set.
pub fn run_multi_domain_partial_failure(signaling: Signaling) {
    let result = run_multi_domain_partial_failure_inner(signaling);
    if let Err(e) = result {
        panic!("run_multi_domain_partial_failure failed: {}", e);
    }
}

fn run_multi_domain_partial_failure_inner(signaling: Signaling) -> Result<(), TestError> {
    let link = link(signaling);
    let connect_multi = |domains: Vec<DomainId>| -> Result<(dspq::MultiDomainQueue, Vec<Queue>), TestError> {
        let multi = link
            .host()
            .create_multi(&MultiDomainContext::new(domains.clone())?, CreateOptions::default())?;
        let remotes = domains
            .iter()
            .zip(multi.export())
            .map(|(&domain, id)| link.remote(domain).import(domain, id, Callbacks::default()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((multi, remotes))
    };

    let (multi, remotes) = connect_multi(vec![DomainId::new(1), DomainId::new(2)])?;
    link.kill(DomainId::new(2));
    expect_err(
        "partial write",
        multi.write_noblock(PacketFlags::MESSAGE, &[], b"half"),
        QueueError::BadState,
    )?;
    check(multi.is_bad(), || "set not marked bad".into())?;
    check_eq("first member got it", read_message(&remotes[0], 0)?, b"half".to_vec())?;
    expect_err(
        "read after partial write",
        multi.read_noblock(&mut [], &mut [0u8; 8]),
        QueueError::BadState,
    )?;
    for remote in &remotes {
        remote.close()?;
    }
    multi.close()?;

    // Failing on the first member leaves the set consistent.
    let (multi, remotes) = connect_multi(vec![DomainId::new(3), DomainId::new(4)])?;
    link.kill(DomainId::new(3));
    expect_err(
        "first member failure",
        multi.write_noblock(PacketFlags::MESSAGE, &[], b"none"),
        QueueError::ConnectionReset,
    )?;
    check(!multi.is_bad(), || "set marked bad".into())?;
    expect_err("nothing delivered", remotes[1].read_noblock(&mut [], &mut [0u8; 8]), QueueError::WouldBlock)?;
    for remote in &remotes {
        remote.close()?;
    }
    multi.close()?;

    // Creation undoes members already created.
    link.refuse_create(DomainId::new(6), true);
    let context = MultiDomainContext::new(vec![DomainId::new(5), DomainId::new(6)])?;
    expect_err(
        "create with refusing member",
        link.host().create_multi(&context, CreateOptions::default()),
        QueueError::NoResources,
    )?;
    check_eq("rolled back", link.host().active_queues(DomainId::new(5)), 0)?;
    link.refuse_create(DomainId::new(6), false);
    let multi = link.host().create_multi(&context, CreateOptions::default())?;
    multi.close()?;
    Ok(())
}
