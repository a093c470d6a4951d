//! Message protocol.
//!
//! Defines the wire messages (call, return, exception, yield, stop,
//! interrupt, ack), their JSON encoding, and [`Protocol`], which sends and
//! receives decoded messages over a [`Link`](crate::transport::Link).
//!
//! # Architecture
//!
//! - **types**: handles, call ids, locators and call arguments
//! - **message**: the tagged message union and request kinds
//! - **codec**: JSON encoding plus length-prefixed framing for streams

pub mod codec;
pub mod message;
pub mod types;

pub use message::{Message, Request, WireValue};
pub use types::{CallArgs, CallId, Handle, Locator};

use crate::error::Result;
use crate::transport::Link;

/// Which channel of a link a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Ordered call/response traffic.
    Main,
    /// Interrupts, concurrent with a pending call.
    Interrupt,
}

/// Sends and receives decoded messages over a link.
#[derive(Clone)]
pub struct Protocol {
    link: Link,
}

impl Protocol {
    pub fn new(link: Link) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Encode and send a message on the chosen channel.
    pub async fn send(&self, message: &Message, channel: Channel) -> Result<()> {
        let payload = codec::encode(message)?;
        match channel {
            Channel::Main => self.link.main.send(&payload).await,
            Channel::Interrupt => self.link.interrupt.send(&payload).await,
        }
    }

    /// Wait for the next message on the main channel.
    ///
    /// Returns `None` once the peer has closed the channel.
    pub async fn receive(&self) -> Result<Option<Message>> {
        match self.link.main.recv().await? {
            Some(payload) => codec::decode(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Wait for the next message on the interrupt channel.
    pub async fn receive_interrupt(&self) -> Result<Option<Message>> {
        match self.link.interrupt.recv().await? {
            Some(payload) => codec::decode(&payload).map(Some),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("main", &self.link.main.kind())
            .finish()
    }
}
