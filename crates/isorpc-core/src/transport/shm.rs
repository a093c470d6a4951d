//! Shared-memory transport.
//!
//! Each direction owns a single-producer/single-consumer byte ring living in
//! a memory-mapped file. The negotiated stream stays open as a doorbell:
//! every message is announced by one byte on the stream, either
//! [`DOORBELL_RING`] (the frame is in the ring) or [`DOORBELL_INLINE`] (a
//! length-prefixed frame follows on the stream because the ring was full).
//! Doorbells are ordered, so frames are delivered in send order whichever
//! path they took.
//!
//! Ring layout:
//!
//! ```text
//! [RingHeader: magic, version, capacity, reserved, write_pos, read_pos][data; capacity]
//! ```
//!
//! Positions grow monotonically; the byte offset is `pos % capacity`.

#![allow(unsafe_code)]

use super::stream::{split_boxed, BoxedReader, BoxedWriter};
use super::Transport;
use crate::config::{TransportConfig, TransportKind};
use crate::error::{Result, RpcError};
use crate::protocol::codec::{check_frame_size, read_frame, write_frame};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// The next frame is waiting in the ring.
pub const DOORBELL_RING: u8 = 0x01;
/// A length-prefixed frame follows on the stream.
pub const DOORBELL_INLINE: u8 = 0x02;

const RING_MAGIC: u32 = 0x4953_5252; // "ISRR"
const RING_VERSION: u32 = 1;
const LEN_PREFIX: usize = 4;

#[repr(C)]
struct RingHeader {
    magic: u32,
    version: u32,
    capacity_bytes: u32,
    _reserved: u32,
    write_pos: AtomicU64,
    read_pos: AtomicU64,
}

/// One direction of shared memory.
pub(crate) struct ByteRing {
    map: MmapMut,
    capacity: usize,
}

impl ByteRing {
    fn header_size() -> usize {
        mem::size_of::<RingHeader>()
    }

    fn check_capacity(capacity: usize) -> Result<()> {
        if !(TransportConfig::SHM_MIN_CAPACITY..=TransportConfig::SHM_MAX_CAPACITY)
            .contains(&capacity)
        {
            return Err(RpcError::protocol(format!(
                "invalid ring capacity {} (allowed {}..={})",
                capacity,
                TransportConfig::SHM_MIN_CAPACITY,
                TransportConfig::SHM_MAX_CAPACITY
            )));
        }
        Ok(())
    }

    /// Create and initialize a ring file. Fails if `path` already exists.
    pub(crate) fn create(path: &Path, capacity: usize) -> Result<Self> {
        Self::check_capacity(capacity)?;
        let total = Self::header_size() + capacity;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(total as u64)?;

        // SAFETY: the file was just created by us with exclusive access and
        // sized to `total`; nothing else maps it until its path is handed out.
        let mut map = unsafe { MmapOptions::new().map_mut(&file)? };

        // SAFETY: the mapping is page-aligned and at least `header_size()`
        // bytes long, so the header write is aligned and in bounds. The data
        // region starts right after the header and spans `capacity` bytes.
        unsafe {
            let header = map.as_mut_ptr() as *mut RingHeader;
            ptr::write(
                header,
                RingHeader {
                    magic: RING_MAGIC,
                    version: RING_VERSION,
                    capacity_bytes: capacity as u32,
                    _reserved: 0,
                    write_pos: AtomicU64::new(0),
                    read_pos: AtomicU64::new(0),
                },
            );
            ptr::write_bytes(map.as_mut_ptr().add(Self::header_size()), 0, capacity);
        }
        map.flush()?;

        Ok(Self { map, capacity })
    }

    /// Map an existing ring file created by [`ByteRing::create`].
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: the file is only ever accessed through this type, whose
        // positions are atomics and whose data bytes are owned by exactly one
        // side at a time (producer before publishing, consumer after).
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        if map.len() < Self::header_size() {
            return Err(RpcError::protocol(format!(
                "ring file too small: {}",
                path.display()
            )));
        }

        // SAFETY: length checked above; the mapping is page-aligned.
        let header = unsafe { &*(map.as_ptr() as *const RingHeader) };
        if header.magic != RING_MAGIC || header.version != RING_VERSION {
            return Err(RpcError::protocol(format!(
                "invalid ring header: {}",
                path.display()
            )));
        }
        let capacity = header.capacity_bytes as usize;
        Self::check_capacity(capacity)?;
        if Self::header_size() + capacity != map.len() {
            return Err(RpcError::protocol(format!(
                "ring size mismatch for {}: expected {}, got {}",
                path.display(),
                Self::header_size() + capacity,
                map.len()
            )));
        }

        Ok(Self { map, capacity })
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: `create`/`open` verified the mapping holds a header.
        unsafe { &*(self.map.as_ptr() as *const RingHeader) }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn used(&self) -> usize {
        let header = self.header();
        let write_pos = header.write_pos.load(Ordering::Acquire);
        let read_pos = header.read_pos.load(Ordering::Acquire);
        write_pos.saturating_sub(read_pos).min(self.capacity as u64) as usize
    }

    /// Bytes that can be written right now.
    pub(crate) fn free_space(&self) -> usize {
        self.capacity - self.used()
    }

    fn copy_in(&mut self, pos: u64, input: &[u8]) {
        let start = (pos % self.capacity as u64) as usize;
        let first = input.len().min(self.capacity - start);
        let offset = Self::header_size();
        // SAFETY: `start + first <= capacity` and `input.len() - first <= capacity`,
        // so both copies stay inside the data region. The producer owns these
        // bytes until it publishes `write_pos`.
        unsafe {
            let data = self.map.as_mut_ptr().add(offset);
            ptr::copy_nonoverlapping(input.as_ptr(), data.add(start), first);
            if first < input.len() {
                ptr::copy_nonoverlapping(input.as_ptr().add(first), data, input.len() - first);
            }
        }
    }

    fn copy_out(&self, pos: u64, out: &mut [u8]) {
        let start = (pos % self.capacity as u64) as usize;
        let first = out.len().min(self.capacity - start);
        let offset = Self::header_size();
        // SAFETY: same bounds as `copy_in`. The consumer owns these bytes
        // between the producer's release of `write_pos` and its own release
        // of `read_pos`.
        unsafe {
            let data = self.map.as_ptr().add(offset);
            ptr::copy_nonoverlapping(data.add(start), out.as_mut_ptr(), first);
            if first < out.len() {
                ptr::copy_nonoverlapping(data, out.as_mut_ptr().add(first), out.len() - first);
            }
        }
    }

    /// Write a length-prefixed frame if it fits entirely. Returns `false` otherwise.
    pub(crate) fn push_frame(&mut self, frame: &[u8]) -> bool {
        let needed = LEN_PREFIX + frame.len();
        if needed > self.free_space() {
            return false;
        }

        let write_pos = self.header().write_pos.load(Ordering::Relaxed);
        self.copy_in(write_pos, &(frame.len() as u32).to_be_bytes());
        self.copy_in(write_pos + LEN_PREFIX as u64, frame);
        self.header()
            .write_pos
            .store(write_pos + needed as u64, Ordering::Release);
        true
    }

    /// Read one complete frame, or `None` if the ring is empty.
    pub(crate) fn pop_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let available = self.used();
        if available == 0 {
            return Ok(None);
        }
        if available < LEN_PREFIX {
            return Err(RpcError::protocol("ring holds a truncated length prefix"));
        }

        let read_pos = self.header().read_pos.load(Ordering::Relaxed);
        let mut len_buf = [0u8; LEN_PREFIX];
        self.copy_out(read_pos, &mut len_buf);
        let len = u32::from_be_bytes(len_buf) as usize;
        if LEN_PREFIX + len > available {
            return Err(RpcError::protocol(format!(
                "ring frame of {} bytes exceeds the {} bytes available",
                len,
                available - LEN_PREFIX
            )));
        }

        let mut frame = vec![0u8; len];
        self.copy_out(read_pos + LEN_PREFIX as u64, &mut frame);
        self.header()
            .read_pos
            .store(read_pos + (LEN_PREFIX + len) as u64, Ordering::Release);
        Ok(Some(frame))
    }
}

/// Ring files for both directions, owned by the side that created them.
///
/// Dropping this removes the backing directory.
pub struct SharedMemoryRings {
    dir: TempDir,
    to_worker: PathBuf,
    to_controller: PathBuf,
    capacity: usize,
}

impl SharedMemoryRings {
    /// Create both rings in a fresh private temporary directory.
    pub fn create(capacity: usize) -> Result<Self> {
        ByteRing::check_capacity(capacity)?;
        let dir = tempfile::Builder::new()
            .prefix(TransportConfig::SHM_DIR_PREFIX)
            .tempdir()?;
        let to_worker = dir.path().join("to-worker.ring");
        let to_controller = dir.path().join("to-controller.ring");
        ByteRing::create(&to_worker, capacity)?;
        ByteRing::create(&to_controller, capacity)?;

        debug!("Created shared-memory rings in {}", dir.path().display());
        Ok(Self {
            dir,
            to_worker,
            to_controller,
            capacity,
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn to_worker(&self) -> &Path {
        &self.to_worker
    }

    pub fn to_controller(&self) -> &Path {
        &self.to_controller
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Rings mapped by the worker before the doorbell stream is attached.
pub(crate) struct WorkerRings {
    tx: ByteRing,
    rx: ByteRing,
}

impl WorkerRings {
    pub(crate) fn open(to_worker: &Path, to_controller: &Path) -> Result<Self> {
        Ok(Self {
            tx: ByteRing::open(to_controller)?,
            rx: ByteRing::open(to_worker)?,
        })
    }
}

/// Frames through shared memory, announced on a stream.
pub struct SharedMemoryTransport {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    tx: StdMutex<ByteRing>,
    rx: StdMutex<ByteRing>,
    _rings: Option<SharedMemoryRings>,
}

impl SharedMemoryTransport {
    /// Controller side: owns the ring files.
    pub fn controller<S>(stream: S, rings: SharedMemoryRings) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let tx = ByteRing::open(rings.to_worker())?;
        let rx = ByteRing::open(rings.to_controller())?;
        Ok(Self::assemble(stream, tx, rx, Some(rings)))
    }

    /// Worker side: maps ring files created by the controller.
    pub fn worker<S>(stream: S, to_worker: &Path, to_controller: &Path) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Ok(Self::attach_worker(
            stream,
            WorkerRings::open(to_worker, to_controller)?,
        ))
    }

    pub(crate) fn attach_worker<S>(stream: S, rings: WorkerRings) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::assemble(stream, rings.tx, rings.rx, None)
    }

    fn assemble<S>(stream: S, tx: ByteRing, rx: ByteRing, rings: Option<SharedMemoryRings>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = split_boxed(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            tx: StdMutex::new(tx),
            rx: StdMutex::new(rx),
            _rings: rings,
        }
    }
}

#[async_trait::async_trait]
impl Transport for SharedMemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ShmJson
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        // A rejected frame must not leave a doorbell behind.
        check_frame_size(frame.len())?;
        // Held across the ring write so ring order matches doorbell order.
        let mut writer = self.writer.lock().await;

        let in_ring = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_frame(frame);

        if in_ring {
            writer.write_all(&[DOORBELL_RING]).await?;
            writer.flush().await?;
        } else {
            writer.write_all(&[DOORBELL_INLINE]).await?;
            write_frame(&mut *writer, frame).await?;
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;

        let mut doorbell = [0u8; 1];
        match reader.read_exact(&mut doorbell).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match doorbell[0] {
            DOORBELL_RING => {
                let frame = {
                    let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
                    rx.pop_frame()?
                };
                frame
                    .map(Some)
                    .ok_or_else(|| RpcError::protocol("doorbell rang but the ring is empty"))
            }
            DOORBELL_INLINE => read_frame(&mut *reader)
                .await?
                .map(Some)
                .ok_or(RpcError::ConnectionClosed),
            other => Err(RpcError::protocol(format!(
                "unknown doorbell byte 0x{:02x}",
                other
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pair(capacity: usize) -> (SharedMemoryTransport, SharedMemoryTransport) {
        let rings = SharedMemoryRings::create(capacity).unwrap();
        let to_worker = rings.to_worker().to_path_buf();
        let to_controller = rings.to_controller().to_path_buf();
        let (a, b) = tokio::io::duplex(TransportConfig::MEMORY_BUFFER_SIZE);

        let controller = SharedMemoryTransport::controller(a, rings).unwrap();
        let worker = SharedMemoryTransport::worker(b, &to_worker, &to_controller).unwrap();
        (controller, worker)
    }

    #[test]
    fn test_ring_push_pop_wraps() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ring");
        let capacity = TransportConfig::SHM_MIN_CAPACITY;
        let mut producer = ByteRing::create(&path, capacity).unwrap();
        let mut consumer = ByteRing::open(&path).unwrap();
        assert_eq!(consumer.capacity(), capacity);

        let frame = vec![7u8; capacity / 3];
        for round in 0..10 {
            assert!(producer.push_frame(&frame), "round {}", round);
            assert_eq!(consumer.pop_frame().unwrap(), Some(frame.clone()));
        }
        assert_eq!(consumer.pop_frame().unwrap(), None);
        assert_eq!(producer.free_space(), capacity);
    }

    #[test]
    fn test_ring_rejects_frame_that_does_not_fit() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ring");
        let mut ring = ByteRing::create(&path, TransportConfig::SHM_MIN_CAPACITY).unwrap();

        let frame = vec![1u8; TransportConfig::SHM_MIN_CAPACITY];
        assert!(!ring.push_frame(&frame));
        assert_eq!(ring.free_space(), TransportConfig::SHM_MIN_CAPACITY);
    }

    #[test]
    fn test_ring_rejects_bad_capacity_and_header() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(ByteRing::create(&dir.path().join("small"), 16).is_err());

        let garbage = dir.path().join("garbage");
        std::fs::write(&garbage, vec![0u8; 8192]).unwrap();
        assert!(ByteRing::open(&garbage).is_err());
    }

    #[tokio::test]
    async fn test_transport_roundtrip_both_directions() {
        let (controller, worker) = pair(TransportConfig::SHM_DEFAULT_CAPACITY);

        controller.send(b"to worker").await.unwrap();
        worker.send(b"to controller").await.unwrap();

        assert_eq!(worker.recv().await.unwrap(), Some(b"to worker".to_vec()));
        assert_eq!(
            controller.recv().await.unwrap(),
            Some(b"to controller".to_vec())
        );
        assert_eq!(controller.kind(), TransportKind::ShmJson);
    }

    #[tokio::test]
    async fn test_oversized_frames_go_inline_in_order() {
        let capacity = TransportConfig::SHM_MIN_CAPACITY;
        let (controller, worker) = pair(capacity);
        let controller = Arc::new(controller);

        let big = vec![9u8; capacity * 4];
        let frames = vec![b"small-1".to_vec(), big.clone(), b"small-2".to_vec()];

        let sender = {
            let controller = controller.clone();
            let frames = frames.clone();
            tokio::spawn(async move {
                for frame in frames {
                    controller.send(&frame).await.unwrap();
                }
            })
        };

        for expected in frames {
            assert_eq!(worker.recv().await.unwrap(), Some(expected));
        }
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_frame_leaves_stream_in_sync() {
        let (controller, worker) = pair(TransportConfig::SHM_MIN_CAPACITY);

        let huge = vec![0u8; crate::config::ProtocolConfig::MAX_FRAME_SIZE + 1];
        assert!(matches!(
            controller.send(&huge).await,
            Err(RpcError::FrameTooLarge { .. })
        ));

        controller.send(b"after").await.unwrap();
        assert_eq!(worker.recv().await.unwrap(), Some(b"after".to_vec()));
    }

    #[tokio::test]
    async fn test_rings_removed_with_controller() {
        let (controller, worker) = pair(TransportConfig::SHM_MIN_CAPACITY);
        let dir = controller._rings.as_ref().unwrap().dir().to_path_buf();
        assert!(dir.exists());

        drop(worker);
        drop(controller);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_eof_after_close() {
        let (controller, worker) = pair(TransportConfig::SHM_MIN_CAPACITY);
        controller.close().await.unwrap();
        assert_eq!(worker.recv().await.unwrap(), None);
    }
}
