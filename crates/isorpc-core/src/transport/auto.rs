//! Transport negotiation.
//!
//! Connection setup runs a short handshake on the freshly connected main
//! stream before any protocol message:
//!
//! ```text
//! controller                      worker
//!     offer {transports}   ─────▶
//!                          ◀─────  select {transport, supported}
//!     shm_setup {paths}    ─────▶             (shm-json only)
//!                          ◀─────  ready | shm_failed {reason}
//! ```
//!
//! The worker picks the first offered transport it supports. If it cannot
//! map the rings it answers `shm_failed` and the controller starts over with
//! a new offer that leaves `shm-json` out. When nothing matches both sides
//! fail with [`RpcError::ProtocolNegotiation`].

use super::shm::{SharedMemoryRings, SharedMemoryTransport, WorkerRings};
use super::stream::StreamTransport;
use super::{Link, Transport};
use crate::config::{TransportConfig, TransportKind};
use crate::error::{Result, RpcError};
use crate::protocol::codec::{read_frame, write_frame};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Which channel a worker connection is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Main,
    Interrupt,
}

/// Setup messages exchanged before the protocol starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "handshake", rename_all = "snake_case")]
pub enum Handshake {
    /// First frame on every worker connection.
    Hello { session: String, channel: ChannelRole },
    Offer { transports: Vec<String> },
    Select {
        transport: Option<String>,
        supported: Vec<String>,
    },
    ShmSetup {
        to_worker: PathBuf,
        to_controller: PathBuf,
    },
    Ready,
    /// The worker could not map the rings named in `shm_setup`.
    ShmFailed { reason: String },
}

/// Write one handshake frame.
pub async fn send_handshake<S>(stream: &mut S, handshake: &Handshake) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(handshake)?;
    write_frame(stream, &payload).await
}

/// Read one handshake frame. A closed stream is [`RpcError::ConnectionClosed`].
pub async fn recv_handshake<S>(stream: &mut S) -> Result<Handshake>
where
    S: AsyncRead + Unpin,
{
    let payload = read_frame(stream).await?.ok_or(RpcError::ConnectionClosed)?;
    serde_json::from_slice(&payload)
        .map_err(|e| RpcError::protocol(format!("invalid handshake frame: {}", e)))
}

fn names(kinds: &[TransportKind]) -> Vec<String> {
    kinds.iter().map(|k| k.as_str().to_string()).collect()
}

/// Controller side of negotiation: offers transports in preference order.
#[derive(Debug, Clone)]
pub struct AutoTransport {
    offered: Vec<TransportKind>,
    shm_capacity: usize,
}

impl Default for AutoTransport {
    fn default() -> Self {
        Self::new(TransportKind::ALL.to_vec())
    }
}

impl AutoTransport {
    pub fn new(offered: Vec<TransportKind>) -> Self {
        Self {
            offered,
            shm_capacity: TransportConfig::SHM_DEFAULT_CAPACITY,
        }
    }

    /// Set the per-direction ring capacity for `shm-json`.
    pub fn with_shm_capacity(mut self, capacity: usize) -> Self {
        self.shm_capacity = capacity;
        self
    }

    pub fn offered(&self) -> &[TransportKind] {
        &self.offered
    }

    /// Negotiate over `stream` and return the agreed main-channel transport.
    pub async fn negotiate_controller<S>(&self, mut stream: S) -> Result<Arc<dyn Transport>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut remaining = self.offered.clone();
        loop {
            send_handshake(
                &mut stream,
                &Handshake::Offer {
                    transports: names(&remaining),
                },
            )
            .await?;

            let (selected, supported) = match recv_handshake(&mut stream).await? {
                Handshake::Select {
                    transport,
                    supported,
                } => (transport, supported),
                other => {
                    return Err(RpcError::protocol(format!(
                        "expected select, got {:?}",
                        other
                    )))
                }
            };

            let Some(selected) = selected else {
                return Err(RpcError::ProtocolNegotiation {
                    offered: names(&self.offered),
                    supported,
                });
            };
            let kind = TransportKind::from_str(&selected)
                .filter(|kind| remaining.contains(kind))
                .ok_or_else(|| {
                    RpcError::protocol(format!(
                        "worker selected unoffered transport '{}'",
                        selected
                    ))
                })?;

            match kind {
                TransportKind::TcpJson => {
                    info!("Negotiated {} transport", kind);
                    return Ok(Arc::new(StreamTransport::new(stream)));
                }
                TransportKind::ShmJson => {
                    let rings = SharedMemoryRings::create(self.shm_capacity)?;
                    send_handshake(
                        &mut stream,
                        &Handshake::ShmSetup {
                            to_worker: rings.to_worker().to_path_buf(),
                            to_controller: rings.to_controller().to_path_buf(),
                        },
                    )
                    .await?;
                    match recv_handshake(&mut stream).await? {
                        Handshake::Ready => {
                            info!("Negotiated {} transport", kind);
                            return Ok(Arc::new(SharedMemoryTransport::controller(
                                stream, rings,
                            )?));
                        }
                        Handshake::ShmFailed { reason } => {
                            warn!("Worker could not map shared memory: {}", reason);
                            remaining.retain(|offered| *offered != TransportKind::ShmJson);
                        }
                        other => {
                            return Err(RpcError::protocol(format!(
                                "expected ready, got {:?}",
                                other
                            )))
                        }
                    }
                }
            }
        }
    }
}

/// Worker side of negotiation.
pub async fn negotiate_worker<S>(
    mut stream: S,
    supported: &[TransportKind],
) -> Result<Arc<dyn Transport>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let offered = match recv_handshake(&mut stream).await? {
            Handshake::Offer { transports } => transports,
            other => {
                return Err(RpcError::protocol(format!(
                    "expected offer, got {:?}",
                    other
                )))
            }
        };
        debug!("Controller offered transports {:?}", offered);

        let selected = offered
            .iter()
            .filter_map(|name| TransportKind::from_str(name))
            .find(|kind| supported.contains(kind));

        send_handshake(
            &mut stream,
            &Handshake::Select {
                transport: selected.map(|kind| kind.as_str().to_string()),
                supported: names(supported),
            },
        )
        .await?;

        let Some(kind) = selected else {
            return Err(RpcError::ProtocolNegotiation {
                offered,
                supported: names(supported),
            });
        };

        match kind {
            TransportKind::TcpJson => {
                info!("Negotiated {} transport", kind);
                return Ok(Arc::new(StreamTransport::new(stream)));
            }
            TransportKind::ShmJson => {
                let (to_worker, to_controller) = match recv_handshake(&mut stream).await? {
                    Handshake::ShmSetup {
                        to_worker,
                        to_controller,
                    } => (to_worker, to_controller),
                    other => {
                        return Err(RpcError::protocol(format!(
                            "expected shm_setup, got {:?}",
                            other
                        )))
                    }
                };
                match WorkerRings::open(&to_worker, &to_controller) {
                    Ok(rings) => {
                        send_handshake(&mut stream, &Handshake::Ready).await?;
                        info!("Negotiated {} transport", kind);
                        return Ok(Arc::new(SharedMemoryTransport::attach_worker(
                            stream, rings,
                        )));
                    }
                    Err(e) => {
                        warn!("Cannot map shared memory at {:?}: {}", to_worker, e);
                        send_handshake(
                            &mut stream,
                            &Handshake::ShmFailed {
                                reason: e.to_string(),
                            },
                        )
                        .await?;
                    }
                }
            }
        }
    }
}

/// Build a negotiated in-memory link pair, `(controller, worker)`.
pub async fn negotiated_memory_link(
    offered: &[TransportKind],
    supported: &[TransportKind],
) -> Result<(Link, Link)> {
    let (controller_main, worker_main) = tokio::io::duplex(TransportConfig::MEMORY_BUFFER_SIZE);
    let (controller_interrupt, worker_interrupt) = super::stream::memory_pair();

    let auto = AutoTransport::new(offered.to_vec());
    let (controller, worker) = tokio::join!(
        auto.negotiate_controller(controller_main),
        negotiate_worker(worker_main, supported)
    );

    Ok((
        Link::new(controller?, Arc::new(controller_interrupt)),
        Link::new(worker?, Arc::new(worker_interrupt)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_common_transport_wins() {
        let (controller, worker) = negotiated_memory_link(
            &[TransportKind::ShmJson, TransportKind::TcpJson],
            &[TransportKind::TcpJson, TransportKind::ShmJson],
        )
        .await
        .unwrap();

        assert_eq!(controller.main.kind(), TransportKind::ShmJson);
        assert_eq!(worker.main.kind(), TransportKind::ShmJson);

        controller.main.send(b"ping").await.unwrap();
        assert_eq!(worker.main.recv().await.unwrap(), Some(b"ping".to_vec()));
    }

    #[tokio::test]
    async fn test_falls_back_to_supported_transport() {
        let (controller, worker) = negotiated_memory_link(
            &[TransportKind::ShmJson, TransportKind::TcpJson],
            &[TransportKind::TcpJson],
        )
        .await
        .unwrap();

        assert_eq!(controller.main.kind(), TransportKind::TcpJson);
        worker.main.send(b"pong").await.unwrap();
        assert_eq!(controller.main.recv().await.unwrap(), Some(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_no_common_transport_fails_both_sides() {
        let (a, b) = tokio::io::duplex(TransportConfig::MEMORY_BUFFER_SIZE);
        let auto = AutoTransport::new(vec![TransportKind::ShmJson]);

        let (controller, worker) = tokio::join!(
            auto.negotiate_controller(a),
            negotiate_worker(b, &[TransportKind::TcpJson])
        );

        match controller {
            Err(RpcError::ProtocolNegotiation { offered, supported }) => {
                assert_eq!(offered, vec!["shm-json".to_string()]);
                assert_eq!(supported, vec!["tcp-json".to_string()]);
            }
            other => panic!("Expected ProtocolNegotiation, got: {:?}", other.err()),
        }
        assert!(matches!(
            worker,
            Err(RpcError::ProtocolNegotiation { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_offered_names_are_skipped() {
        let (mut controller, worker) = tokio::io::duplex(TransportConfig::MEMORY_BUFFER_SIZE);

        let worker_task =
            tokio::spawn(async move { negotiate_worker(worker, &TransportKind::ALL).await });

        send_handshake(
            &mut controller,
            &Handshake::Offer {
                transports: vec!["tcp-pickle".into(), "tcp-json".into()],
            },
        )
        .await
        .unwrap();
        let reply = recv_handshake(&mut controller).await.unwrap();
        assert_eq!(
            reply,
            Handshake::Select {
                transport: Some("tcp-json".into()),
                supported: vec!["shm-json".into(), "tcp-json".into()],
            }
        );

        let transport = worker_task.await.unwrap().unwrap();
        assert_eq!(transport.kind(), TransportKind::TcpJson);
    }

    #[tokio::test]
    async fn test_worker_reports_unmappable_rings_and_falls_back() {
        let (mut controller, worker) = tokio::io::duplex(TransportConfig::MEMORY_BUFFER_SIZE);
        let worker_task =
            tokio::spawn(async move { negotiate_worker(worker, &TransportKind::ALL).await });

        send_handshake(
            &mut controller,
            &Handshake::Offer {
                transports: vec!["shm-json".into(), "tcp-json".into()],
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            recv_handshake(&mut controller).await.unwrap(),
            Handshake::Select { transport: Some(ref t), .. } if t == "shm-json"
        ));

        let missing = tempfile::TempDir::new().unwrap().path().join("gone");
        send_handshake(
            &mut controller,
            &Handshake::ShmSetup {
                to_worker: missing.join("to_worker"),
                to_controller: missing.join("to_controller"),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            recv_handshake(&mut controller).await.unwrap(),
            Handshake::ShmFailed { .. }
        ));

        send_handshake(
            &mut controller,
            &Handshake::Offer {
                transports: vec!["tcp-json".into()],
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            recv_handshake(&mut controller).await.unwrap(),
            Handshake::Select { transport: Some(ref t), .. } if t == "tcp-json"
        ));

        let transport = worker_task.await.unwrap().unwrap();
        assert_eq!(transport.kind(), TransportKind::TcpJson);
    }

    #[tokio::test]
    async fn test_controller_drops_shm_after_worker_failure() {
        let (controller, mut worker) = tokio::io::duplex(TransportConfig::MEMORY_BUFFER_SIZE);
        let fake = tokio::spawn(async move {
            let mut offers = Vec::new();
            for answer in ["shm-json", "tcp-json"] {
                match recv_handshake(&mut worker).await.unwrap() {
                    Handshake::Offer { transports } => offers.push(transports),
                    other => panic!("Expected offer, got: {:?}", other),
                }
                send_handshake(
                    &mut worker,
                    &Handshake::Select {
                        transport: Some(answer.into()),
                        supported: vec!["shm-json".into(), "tcp-json".into()],
                    },
                )
                .await
                .unwrap();
                if answer == "shm-json" {
                    assert!(matches!(
                        recv_handshake(&mut worker).await.unwrap(),
                        Handshake::ShmSetup { .. }
                    ));
                    send_handshake(
                        &mut worker,
                        &Handshake::ShmFailed {
                            reason: "no such file".into(),
                        },
                    )
                    .await
                    .unwrap();
                }
            }
            (offers, worker)
        });

        let transport = AutoTransport::default()
            .negotiate_controller(controller)
            .await
            .unwrap();
        assert_eq!(transport.kind(), TransportKind::TcpJson);

        let (offers, _worker) = fake.await.unwrap();
        assert_eq!(
            offers,
            vec![
                vec!["shm-json".to_string(), "tcp-json".to_string()],
                vec!["tcp-json".to_string()],
            ]
        );
    }

    #[test]
    fn test_hello_wire_format() {
        let hello = Handshake::Hello {
            session: "abc".into(),
            channel: ChannelRole::Interrupt,
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["handshake"], "hello");
        assert_eq!(json["channel"], "interrupt");
    }
}
