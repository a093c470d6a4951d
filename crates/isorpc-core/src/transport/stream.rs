//! Stream transport: length-prefixed frames over any duplex byte stream.

use super::Transport;
use crate::config::{TransportConfig, TransportKind};
use crate::error::Result;
use crate::protocol::codec::{read_frame, write_frame};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Split a duplex stream into independently lockable halves.
pub(crate) fn split_boxed<S>(stream: S) -> (BoxedReader, BoxedWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Frames over a socket, pipe pair or in-memory duplex.
///
/// Reads and writes lock separate halves, so one task can block in `recv`
/// while another sends.
pub struct StreamTransport {
    kind: TransportKind,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = split_boxed(stream);
        Self::from_parts(reader, writer)
    }

    /// Build from separate read and write halves, such as a child's stdout and stdin.
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            kind: TransportKind::TcpJson,
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
        }
    }
}

#[async_trait::async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// A connected pair of in-memory stream transports.
pub fn memory_pair() -> (StreamTransport, StreamTransport) {
    let (a, b) = tokio::io::duplex(TransportConfig::MEMORY_BUFFER_SIZE);
    (StreamTransport::new(a), StreamTransport::new(b))
}
