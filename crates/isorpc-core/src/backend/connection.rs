//! Controller end of a worker connection.
//!
//! # Thread Safety
//!
//! All main-channel frames, including fire-and-forget releases scheduled
//! from `Drop`, go through one unbounded queue drained by a single writer
//! task, so frames never interleave. A reader task forwards decoded
//! replies. An async mutex admits one in-flight call at a time.

use super::{Dispatch, Release, Reply};
use crate::cancel::CancellationToken;
use crate::config::{ProcessConfig, ProtocolConfig};
use crate::error::{Result, RpcError};
use crate::protocol::codec::{self, peek_id};
use crate::protocol::{CallArgs, CallId, Message, Request};
use crate::transport::{Link, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, trace, warn};

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport reached end of stream or failed.
    Disconnected,
    /// The supervisor saw the worker process exit.
    WorkerExited { code: Option<i32>, status: String },
}

impl CloseReason {
    fn rank(&self) -> u8 {
        match self {
            CloseReason::Disconnected => 0,
            CloseReason::WorkerExited { .. } => 1,
        }
    }
}

type ConnState = Option<CloseReason>;

/// Marks a connection closed from outside, such as a process supervisor.
#[derive(Debug, Clone)]
pub struct ConnectionCloser {
    state: Arc<watch::Sender<ConnState>>,
}

impl ConnectionCloser {
    fn close(&self, reason: CloseReason) {
        self.state.send_if_modified(|state| match state {
            Some(current) if current.rank() >= reason.rank() => false,
            _ => {
                *state = Some(reason);
                true
            }
        });
    }

    /// Record that the worker process exited. Pending and future calls fail
    /// with [`RpcError::WorkerExited`].
    pub fn worker_exited(&self, code: Option<i32>, status: impl Into<String>) {
        self.close(CloseReason::WorkerExited {
            code,
            status: status.into(),
        });
    }

    pub fn disconnected(&self) {
        self.close(CloseReason::Disconnected);
    }
}

enum Inbound {
    Message(Message),
    Undecodable { id: Option<CallId>, error: RpcError },
}

async fn wait_cancel(token: &Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn closed(state: &mut watch::Receiver<ConnState>) {
    let _ = state.wait_for(Option::is_some).await;
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// A worker reached over a [`Link`].
pub struct RpcConnection {
    name: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    interrupt: Arc<dyn Transport>,
    next_id: AtomicU64,
    state: Arc<watch::Sender<ConnState>>,
    supervised: bool,
    reader: JoinHandle<()>,
}

impl RpcConnection {
    /// Start the reader and writer tasks for `link`. Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>, link: Link) -> Self {
        let name = name.into();
        let state = Arc::new(watch::channel(None).0);
        let closer = ConnectionCloser {
            state: state.clone(),
        };

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let main = link.main.clone();
        let writer_closer = closer.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = main.send(&frame).await {
                    debug!("Main channel write failed: {}", e);
                    writer_closer.disconnected();
                    return;
                }
            }
            if let Err(e) = main.close().await {
                trace!("Closing main channel: {}", e);
            }
        });

        let main = link.main.clone();
        let reader = tokio::spawn(async move {
            loop {
                let item = match main.recv().await {
                    Ok(Some(frame)) => match codec::decode(&frame) {
                        Ok(message) => Inbound::Message(message),
                        Err(error) => Inbound::Undecodable {
                            id: peek_id(&frame),
                            error,
                        },
                    },
                    Ok(None) => {
                        debug!("Worker closed the main channel");
                        break;
                    }
                    Err(e) => {
                        debug!("Main channel read failed: {}", e);
                        break;
                    }
                };
                if inbound_tx.send(item).is_err() {
                    return;
                }
            }
            closer.disconnected();
        });

        Self {
            name,
            outbound,
            inbound: Mutex::new(inbound),
            interrupt: link.interrupt,
            next_id: AtomicU64::new(1),
            state,
            supervised: false,
            reader,
        }
    }

    /// Wait briefly for a supervisor's exit status before reporting a lost connection.
    pub fn supervised(mut self) -> Self {
        self.supervised = true;
        self
    }

    /// A handle for closing this connection from a supervisor.
    pub fn closer(&self) -> ConnectionCloser {
        ConnectionCloser {
            state: self.state.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_some()
    }

    async fn close_error(&self) -> RpcError {
        let mut state = self.state.subscribe();
        if self.supervised {
            let exited = state.wait_for(|state| {
                matches!(state, Some(CloseReason::WorkerExited { .. }))
            });
            // Timing out just means the exit status is not known yet
            let _ = tokio::time::timeout(ProcessConfig::EXIT_STATUS_GRACE, exited).await;
        }
        let reason = state.borrow().clone();
        match reason {
            Some(CloseReason::WorkerExited { code, status }) => {
                RpcError::WorkerExited { code, status }
            }
            _ => RpcError::ConnectionClosed,
        }
    }

    async fn send_interrupt(&self, call_id: CallId) {
        debug!("[{}] Interrupting call {}", self.name, call_id);
        let result = match codec::encode(&Message::Interrupt { call_id }) {
            Ok(frame) => self.interrupt.send(&frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("[{}] Failed to send interrupt for call {}: {}", self.name, call_id, e);
        }
    }

    /// Drop a reply left behind by an abandoned call, releasing any handle it carries.
    fn discard_stale(&self, reply_id: CallId, message: Message) {
        match Release::orphaned_by(&message) {
            Some(orphan) => {
                debug!(
                    "[{}] Releasing {:?} from stale reply for call {}",
                    self.name, orphan, reply_id
                );
                self.release(orphan);
            }
            None => debug!("[{}] Discarding stale reply for call {}", self.name, reply_id),
        }
    }

    async fn call(
        &self,
        request: Request,
        arguments: CallArgs,
        token: Option<CancellationToken>,
    ) -> Result<Reply> {
        let mut inbound = self.inbound.lock().await;
        if self.is_closed() {
            return Err(self.close_error().await);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let op = request.op_name();
        let frame = codec::encode_frame(&Message::Call {
            id,
            request,
            arguments,
            cancellable: token.is_some(),
        })?;
        trace!("[{}] Sending call {} ({}, {} bytes)", self.name, id, op, frame.len());
        if self.outbound.send(frame).is_err() {
            return Err(self.close_error().await);
        }

        let mut state = self.state.subscribe();
        let mut drain_until: Option<Instant> = None;
        let mut resend: Option<Interval> = None;
        loop {
            tokio::select! {
                biased;
                item = inbound.recv() => {
                    let Some(item) = item else {
                        return Err(self.close_error().await);
                    };
                    match item {
                        Inbound::Message(message) => match message.reply_id() {
                            Some(reply_id) if reply_id == id => {
                                let reply = Reply::from_message(message);
                                if let (Err(RpcError::Cancelled), Some(token)) = (&reply, &token) {
                                    token.mark_observed();
                                }
                                return reply;
                            }
                            Some(reply_id) if reply_id < id => self.discard_stale(reply_id, message),
                            _ => {
                                return Err(RpcError::protocol(format!(
                                    "expected reply to call {}, got {} {:?}",
                                    id,
                                    message.kind_name(),
                                    message.reply_id()
                                )));
                            }
                        },
                        Inbound::Undecodable { id: Some(reply_id), .. } if reply_id < id => {
                            debug!("[{}] Discarding stale undecodable reply for call {}", self.name, reply_id);
                        }
                        Inbound::Undecodable { error, .. } => return Err(error),
                    }
                }
                // Replies already in flight still win over the close
                _ = closed(&mut state), if drain_until.is_none() => {
                    trace!("[{}] Connection closed while call {} is pending", self.name, id);
                    drain_until = Some(Instant::now() + ProtocolConfig::CLOSE_DRAIN_TIMEOUT);
                }
                _ = until(drain_until) => {
                    return Err(self.close_error().await);
                }
                _ = wait_cancel(&token), if resend.is_none() => {
                    self.send_interrupt(id).await;
                    let period = ProtocolConfig::INTERRUPT_RESEND_INTERVAL;
                    resend = Some(tokio::time::interval_at(Instant::now() + period, period));
                }
                _ = tick(&mut resend) => {
                    self.send_interrupt(id).await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Dispatch for RpcConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, request: Request, arguments: CallArgs) -> Result<Reply> {
        let token = CancellationToken::current();
        let _binding = token.as_ref().map(CancellationToken::bind).transpose()?;
        if let Some(token) = &token {
            if token.is_cancelled() {
                token.mark_observed();
                return Err(RpcError::Cancelled);
            }
        }
        self.call(request, arguments, token).await
    }

    fn release(&self, release: Release) {
        match codec::encode(&release.message()) {
            Ok(frame) => {
                if self.outbound.send(frame).is_err() {
                    trace!("[{}] Connection gone, dropping {:?}", self.name, release);
                }
            }
            Err(e) => warn!("[{}] Failed to encode {:?}: {}", self.name, release, e),
        }
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        // The writer drains queued releases, then closes the main channel
        self.reader.abort();
    }
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
