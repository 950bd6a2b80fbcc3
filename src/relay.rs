//! Moving Ethernet frames between RNDIS and a network stack
//!
//! Received bulk data arrives in the host's completion context, which must
//! not block on the network stack. [`FrameRelay::on_receive`] copies each
//! chunk into a framed `bbq2` queue, and a consumer thread splits chunks into
//! frames for the [`NetworkInterface`]. When the queue stays full, chunks
//! are dropped.
//!
//! Outbound, [`transmit`] wraps a frame in a packet message and sends it on
//! bulk OUT.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bbq2::{
    prod_cons::framed::{FramedConsumer, FramedProducer},
    queue::BBQueue,
    traits::{
        bbqhdl::BbqHandle, coordination::cas::AtomicCoord, notifier::maitake::MaiNotSpsc,
        storage::BoxedSlice,
    },
};

use crate::cdc::DataCallback;
use crate::rndis::message::{encode_packet, Packets};
use crate::rndis::RndisSession;
use crate::{lock, Error, Result};

type ChunkQueue = Arc<BBQueue<BoxedSlice, AtomicCoord, MaiNotSpsc>>;

/// Length prefix the framed queue stores in front of each chunk
const CHUNK_HEADER_LEN: usize = core::mem::size_of::<u16>();

/// The network stack side
pub trait NetworkInterface: Send + Sync {
    /// One received Ethernet frame
    fn receive(&self, frame: &[u8]);
}

/// Buffering for received data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Bytes buffered between USB and the consumer, length prefixes included
    pub ring_capacity: usize,
    /// Chunks buffered between USB and the consumer
    pub queue_depth: usize,
    /// How long a receive waits for room before dropping its chunk
    pub push_wait: Duration,
    /// Larger chunks are dropped
    pub max_chunk_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            ring_capacity: 4096,
            queue_depth: 10,
            push_wait: Duration::from_millis(1000),
            max_chunk_size: 2048,
        }
    }
}

/// Counters since the relay was created
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Chunks queued for the consumer
    pub chunks: u64,
    /// Frames handed to the network interface
    pub frames: u64,
    /// Chunks lost to a full queue, or too large
    pub dropped_chunks: u64,
    /// Chunks that stopped at a message that isn't a well-formed packet
    pub malformed: u64,
}

#[derive(Default)]
struct Counters {
    chunks: AtomicU64,
    frames: AtomicU64,
    dropped_chunks: AtomicU64,
    malformed: AtomicU64,
}

/// Chunks committed but not yet released
#[derive(Default)]
struct Pending {
    chunks: usize,
    /// Queue bytes in use, length prefixes included
    bytes: usize,
    closed: bool,
}

pub struct FrameRelay {
    producer: FramedProducer<ChunkQueue>,
    consumer: FramedConsumer<ChunkQueue>,
    pending: Mutex<Pending>,
    changed: Condvar,
    config: RelayConfig,
    netif: Arc<dyn NetworkInterface>,
    counters: Counters,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FrameRelay {
    pub fn new(netif: Arc<dyn NetworkInterface>, config: RelayConfig) -> Arc<Self> {
        // A bip buffer can refuse a grant that fits in its free space, when
        // that space is split across the wrap. Twice the budget, plus one,
        // always has a contiguous run for any chunk within budget.
        let storage = BoxedSlice::new(2 * config.ring_capacity + 1);
        let queue: ChunkQueue = Arc::new(BBQueue::new_with_storage(storage));
        Arc::new(FrameRelay {
            producer: queue.framed_producer(),
            consumer: queue.framed_consumer(),
            pending: Mutex::new(Pending::default()),
            changed: Condvar::new(),
            config,
            netif,
            counters: Counters::default(),
            worker: Mutex::new(None),
        })
    }

    /// Queue received bulk data for the consumer
    ///
    /// Always reports the data as consumed; a chunk that can't be queued is
    /// dropped.
    pub fn on_receive(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        match self.push(data) {
            Ok(()) => {
                self.counters.chunks.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!("Dropping {} byte chunk: {}", data.len(), err);
                self.counters.dropped_chunks.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Commit one chunk, waiting up to the push wait for room
    ///
    /// Fails with [`Error::InvalidSize`] for a chunk that can never fit,
    /// [`Error::NoMemory`] if there's still no room after the wait, and
    /// [`Error::InvalidState`] once shut down.
    fn push(&self, data: &[u8]) -> Result<()> {
        let len = u16::try_from(data.len()).map_err(|_| Error::InvalidSize)?;
        let framed = data.len() + CHUNK_HEADER_LEN;
        if data.len() > self.config.max_chunk_size || framed > self.config.ring_capacity {
            return Err(Error::InvalidSize);
        }

        let deadline = Instant::now() + self.config.push_wait;
        let mut pending = lock(&self.pending);
        loop {
            if pending.closed {
                return Err(Error::InvalidState);
            }
            if pending.chunks < self.config.queue_depth
                && pending.bytes + framed <= self.config.ring_capacity
            {
                if let Ok(mut grant) = self.producer.grant(len) {
                    grant[..data.len()].copy_from_slice(data);
                    grant.commit(len);
                    pending.chunks += 1;
                    pending.bytes += framed;
                    self.changed.notify_all();
                    return Ok(());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::NoMemory);
            }
            pending = self
                .changed
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// A data callback that feeds this relay
    pub fn data_callback(self: &Arc<Self>) -> DataCallback {
        let relay = Arc::clone(self);
        Arc::new(move |data| relay.on_receive(data))
    }

    /// Wait for one chunk, and deliver its frames
    ///
    /// Frames are handed over straight from the queue, which is released
    /// once they're delivered. Returns `false` once the relay is shut down.
    pub fn process_next(&self) -> bool {
        let mut pending = lock(&self.pending);
        let chunk = loop {
            if pending.closed {
                return false;
            }
            if pending.chunks > 0 {
                if let Ok(chunk) = self.consumer.read() {
                    break chunk;
                }
            }
            pending = self
                .changed
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        };
        drop(pending);

        for frame in Packets::new(&chunk) {
            match frame {
                Ok(frame) => {
                    self.counters.frames.fetch_add(1, Ordering::Relaxed);
                    self.netif.receive(frame);
                }
                Err(err) => {
                    warn!("Malformed RNDIS data message: {}", err);
                    self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let framed = chunk.len() + CHUNK_HEADER_LEN;
        let mut pending = lock(&self.pending);
        chunk.release();
        pending.chunks = pending.chunks.saturating_sub(1);
        pending.bytes = pending.bytes.saturating_sub(framed);
        self.changed.notify_all();
        true
    }

    /// Start the consumer thread
    ///
    /// Does nothing if it's already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }
        let relay = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("rndis-relay".into())
            .spawn(move || {
                while relay.process_next() {}
                debug!("Relay consumer stopped");
            })
            .map_err(|_| Error::NoMemory)?;
        *worker = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Stop the consumer, and drop anything still queued
    ///
    /// Later receives are dropped.
    pub fn shutdown(&self) {
        lock(&self.pending).closed = true;
        self.changed.notify_all();

        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!("Relay consumer panicked");
            }
        }

        let mut pending = lock(&self.pending);
        while let Ok(chunk) = self.consumer.read() {
            chunk.release();
        }
        pending.chunks = 0;
        pending.bytes = 0;
    }

    /// Chunks waiting for the consumer
    pub fn queued(&self) -> usize {
        lock(&self.pending).chunks
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            chunks: self.counters.chunks.load(Ordering::Relaxed),
            frames: self.counters.frames.load(Ordering::Relaxed),
            dropped_chunks: self.counters.dropped_chunks.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for FrameRelay {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameRelay")
            .field("config", &self.config)
            .field("queued", &self.queued())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Send one Ethernet frame through a connected session
///
/// Returns the frame length. Fails with [`Error::InvalidState`], without any
/// USB traffic, unless the session is connected.
pub fn transmit(session: &RndisSession, frame: &[u8]) -> Result<usize> {
    if !session.is_connected() {
        return Err(Error::InvalidState);
    }
    if frame.is_empty() {
        return Err(Error::InvalidArgument);
    }
    if frame.len() > session.config().max_frame_size {
        return Err(Error::InvalidSize);
    }
    let packet = encode_packet(frame)?;
    session
        .device()
        .send_blocking(&packet, session.config().send_timeout)?;
    Ok(frame.len())
}
