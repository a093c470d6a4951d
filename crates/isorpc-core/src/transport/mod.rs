//! Byte transports between controller and worker.
//!
//! A [`Transport`] moves whole frames. Implementations:
//!
//! - **stream**: length-prefixed frames over a duplex byte stream
//! - **shm**: frames through memory-mapped rings with a stream doorbell
//! - **auto**: handshake that picks the first transport both sides support
//!
//! A [`Link`] pairs the negotiated main channel with a stream-based
//! interrupt channel that is read concurrently with a pending call.

pub mod auto;
pub mod shm;
pub mod stream;

pub use auto::{negotiate_worker, negotiated_memory_link, AutoTransport, ChannelRole, Handshake};
pub use shm::{SharedMemoryRings, SharedMemoryTransport};
pub use stream::{memory_pair, StreamTransport};

use crate::config::TransportKind;
use crate::error::Result;
use std::sync::Arc;

/// Moves serialized messages between two processes.
///
/// Sends and receives are serialized internally, so one transport can be
/// shared between a reader task and a writer task.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Send one frame.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Receive the next frame, or `None` once the peer has closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Close the sending side; the peer sees end of stream.
    async fn close(&self) -> Result<()>;
}

/// Main and interrupt channels of one connection.
#[derive(Clone)]
pub struct Link {
    pub main: Arc<dyn Transport>,
    pub interrupt: Arc<dyn Transport>,
}

impl Link {
    pub fn new(main: Arc<dyn Transport>, interrupt: Arc<dyn Transport>) -> Self {
        Self { main, interrupt }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("main", &self.main.kind())
            .field("interrupt", &self.interrupt.kind())
            .finish()
    }
}

/// An in-memory stream link pair, `(controller, worker)`.
pub fn memory_link() -> (Link, Link) {
    let (controller_main, worker_main) = memory_pair();
    let (controller_interrupt, worker_interrupt) = memory_pair();
    (
        Link::new(Arc::new(controller_main), Arc::new(controller_interrupt)),
        Link::new(Arc::new(worker_main), Arc::new(worker_interrupt)),
    )
}
