//! Worker serving loop and process entry.
//!
//! [`serve`] drives a [`Worker`] over a [`Link`]: calls arriving on the main
//! channel run one at a time on the blocking pool while a separate task
//! listens on the interrupt channel.

use super::dispatcher::Worker;
use super::registry::Registry;
use crate::config::{EnvConfig, ProcessConfig, TransportKind};
use crate::error::{RemoteError, Result, RpcError};
use crate::protocol::codec::{self, peek_id};
use crate::protocol::{Channel, Message, Protocol};
use crate::transport::auto::{negotiate_worker, send_handshake, ChannelRole, Handshake};
use crate::transport::{Link, StreamTransport, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Serve calls until the controller disconnects, requests shutdown, or a call fails fatally.
///
/// On return every live instance has been released and every generator
/// session closed.
pub async fn serve(worker: Arc<Worker>, link: Link) -> Result<()> {
    let protocol = Protocol::new(link.clone());

    let listener = {
        let worker = worker.clone();
        let protocol = protocol.clone();
        tokio::spawn(async move {
            loop {
                match protocol.receive_interrupt().await {
                    Ok(Some(Message::Interrupt { call_id })) => worker.handle_interrupt(call_id),
                    Ok(Some(other)) => {
                        warn!("Unexpected {} message on interrupt channel", other.kind_name())
                    }
                    Ok(None) => break,
                    Err(e) if e.is_connection_error() => break,
                    Err(e) => warn!("Dropping malformed interrupt: {}", e),
                }
            }
            debug!("Interrupt listener stopped");
        })
    };

    let result = serve_calls(&worker, &protocol).await;

    listener.abort();
    let cleanup = worker.clone();
    match tokio::task::spawn_blocking(move || cleanup.shutdown()).await {
        Ok(released) => debug!("Worker released {} entries", released),
        Err(e) => error!("Worker cleanup failed: {}", e),
    }
    if let Err(e) = link.main.close().await {
        debug!("Closing main channel: {}", e);
    }

    match &result {
        Ok(()) => info!("Worker stopped after {} calls", worker.call_count()),
        Err(e) => error!("Worker stopped: {}", e),
    }
    result
}

async fn serve_calls(worker: &Arc<Worker>, protocol: &Protocol) -> Result<()> {
    loop {
        let frame = match protocol.link().main.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Controller closed the connection");
                return Ok(());
            }
            Err(RpcError::ConnectionClosed) => {
                info!("Controller connection lost");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let message = match codec::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable frame ({} bytes): {}", frame.len(), e);
                if let Some(id) = peek_id(&frame).filter(|id| *id != 0) {
                    let reply = Message::Exception {
                        id,
                        error: RemoteError::serialization(e.to_string()),
                    };
                    protocol.send(&reply, Channel::Main).await?;
                }
                continue;
            }
        };

        let handler = worker.clone();
        let handled = tokio::task::spawn_blocking(move || handler.handle(message))
            .await
            .map_err(|e| RpcError::protocol(format!("call task failed: {}", e)))?;

        if let Some(reply) = handled.reply {
            send_reply(protocol, &reply).await?;
        }
        if handled.terminate {
            return Ok(());
        }
    }
}

/// Send a reply, or a serialization exception in its place when it cannot be framed.
async fn send_reply(protocol: &Protocol, reply: &Message) -> Result<()> {
    let frame = match codec::encode_frame(reply) {
        Ok(frame) => frame,
        Err(e) => {
            let Some(id) = reply.reply_id() else {
                return Err(e);
            };
            warn!("Reply to call {} cannot be sent: {}", id, e);
            codec::encode(&Message::Exception {
                id,
                error: RemoteError::serialization(e.to_string()),
            })?
        }
    };
    protocol.link().main.send(&frame).await
}

/// Where and how a worker process connects back to its controller.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub endpoint: SocketAddr,
    pub session: String,
    /// Transports this worker accepts, in preference order.
    pub transports: Vec<TransportKind>,
    pub connect_timeout: Duration,
}

impl WorkerSettings {
    /// Read settings from the variables the controller sets when launching a worker.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| RpcError::LaunchFailed {
                message: format!("{} is not set; was this process started by a controller?", name),
            })
        };

        let endpoint = var(EnvConfig::ENDPOINT)?;
        let endpoint = endpoint.parse().map_err(|e| RpcError::LaunchFailed {
            message: format!("invalid {} '{}': {}", EnvConfig::ENDPOINT, endpoint, e),
        })?;
        let session = var(EnvConfig::SESSION)?;
        let transports = match std::env::var(EnvConfig::TRANSPORTS) {
            Ok(list) => TransportKind::parse_list(&list),
            Err(_) => TransportKind::ALL.to_vec(),
        };

        Ok(Self {
            endpoint,
            session,
            transports,
            connect_timeout: ProcessConfig::CONNECT_TIMEOUT,
        })
    }

    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }
}

async fn open_channel(settings: &WorkerSettings, channel: ChannelRole) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(
        settings.connect_timeout,
        TcpStream::connect(settings.endpoint),
    )
    .await
    .map_err(|_| RpcError::Timeout {
        what: format!("connecting to controller at {}", settings.endpoint),
        after: settings.connect_timeout,
    })??;
    stream.set_nodelay(true)?;

    send_handshake(
        &mut stream,
        &Handshake::Hello {
            session: settings.session.clone(),
            channel,
        },
    )
    .await?;
    Ok(stream)
}

/// Connect both channels to the controller and negotiate the main transport.
pub async fn connect(settings: &WorkerSettings) -> Result<Link> {
    let main = open_channel(settings, ChannelRole::Main).await?;
    let interrupt = open_channel(settings, ChannelRole::Interrupt).await?;
    debug!("Connected to controller at {}", settings.endpoint);

    let main = negotiate_worker(main, &settings.transports).await?;
    let interrupt: Arc<dyn Transport> = Arc::new(StreamTransport::new(interrupt));
    Ok(Link::new(main, interrupt))
}

/// Connect with `settings` and serve `registry` until the controller is done.
pub async fn run(registry: Registry, settings: WorkerSettings) -> Result<()> {
    info!(
        "Worker starting with {} registered callables (pid {})",
        registry.len(),
        std::process::id()
    );
    let link = connect(&settings).await?;
    serve(Arc::new(Worker::new(registry)), link).await
}

/// Worker process entry point: settings come from the environment.
pub async fn run_from_env(registry: Registry) -> Result<()> {
    run(registry, WorkerSettings::from_env()?).await
}
