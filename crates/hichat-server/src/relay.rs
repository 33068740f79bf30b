//! Internal relay between message ingestion and dispatch.
//!
//! Every session read loop pushes raw frames into one bounded egress queue;
//! the dispatcher consumes them from the ingress side. The relay promises at
//! most once delivery and no ordering. Two transports are available:
//!
//! * [`RelayMode::InProcess`]: the egress queue is handed straight to the
//!   dispatcher.
//! * [`RelayMode::Udp`]: frames cross a loopback UDP socket, one datagram per
//!   envelope, the way the legacy HiChat deployment relayed them.

use std::net::SocketAddr;

use bytes::Bytes;
use hichat_core::RelayError;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayMode {
    InProcess,
    Udp { addr: SocketAddr },
}

impl RelayMode {
    /// The legacy loopback relay address.
    pub fn legacy_udp() -> Self {
        Self::Udp {
            addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
        }
    }
}

impl Default for RelayMode {
    fn default() -> Self {
        Self::InProcess
    }
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub mode: RelayMode,
    /// Outstanding envelopes the egress queue holds before producers wait.
    pub queue_capacity: usize,
    /// Per-datagram limit for the UDP transport.
    pub max_datagram_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::InProcess,
            queue_capacity: 1024,
            max_datagram_bytes: MAX_UDP_PAYLOAD,
        }
    }
}

/// Producer handle shared by every session read loop.
#[derive(Clone, Debug)]
pub struct RelaySender {
    tx: mpsc::Sender<Bytes>,
    max_payload: Option<usize>,
}

impl RelaySender {
    /// Enqueue a raw frame. Waits while the egress queue is full.
    pub async fn send(&self, payload: Bytes) -> Result<(), RelayError> {
        if let Some(limit) = self.max_payload {
            if payload.len() > limit {
                return Err(RelayError::Oversized {
                    size: payload.len(),
                    limit,
                });
            }
        }
        self.tx.send(payload).await.map_err(|_| RelayError::Closed)
    }
}

/// A started relay: the producer handle, the dispatcher's ingress, and the
/// transport tasks (empty for the in-process mode).
pub struct Relay {
    sender: RelaySender,
    ingress: mpsc::Receiver<Bytes>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Relay {
    pub async fn start(config: &RelayConfig) -> Result<Self, RelayError> {
        match &config.mode {
            RelayMode::InProcess => Ok(Self::in_process(config.queue_capacity)),
            RelayMode::Udp { addr } => {
                Self::udp(*addr, config.queue_capacity, config.max_datagram_bytes).await
            }
        }
    }

    pub fn in_process(queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity);
        Self {
            sender: RelaySender {
                tx,
                max_payload: None,
            },
            ingress: rx,
            tasks: Vec::new(),
            local_addr: None,
        }
    }

    /// Bind the ingress socket on `addr`, then connect an egress socket to it.
    /// Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn udp(
        addr: SocketAddr,
        queue_capacity: usize,
        max_datagram_bytes: usize,
    ) -> Result<Self, RelayError> {
        let max_datagram_bytes = max_datagram_bytes.min(MAX_UDP_PAYLOAD);

        let ingress_socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let bound = ingress_socket.local_addr()?;

        let egress_socket = UdpSocket::bind(SocketAddr::new(bound.ip(), 0))
            .await
            .map_err(|source| RelayError::Connect { addr: bound, source })?;
        egress_socket
            .connect(bound)
            .await
            .map_err(|source| RelayError::Connect { addr: bound, source })?;

        let (egress_tx, egress_rx) = mpsc::channel(queue_capacity);
        let (ingress_tx, ingress_rx) = mpsc::channel(queue_capacity);

        let egress = tokio::spawn(run_udp_egress(egress_socket, egress_rx));
        let ingress = tokio::spawn(run_udp_ingress(ingress_socket, ingress_tx, max_datagram_bytes));

        tracing::info!(addr = %bound, "UDP relay started");

        Ok(Self {
            sender: RelaySender {
                tx: egress_tx,
                max_payload: Some(max_datagram_bytes),
            },
            ingress: ingress_rx,
            tasks: vec![egress, ingress],
            local_addr: Some(bound),
        })
    }

    pub fn sender(&self) -> RelaySender {
        self.sender.clone()
    }

    /// Address the UDP ingress is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn into_parts(self) -> (RelaySender, mpsc::Receiver<Bytes>, Vec<JoinHandle<()>>) {
        (self.sender, self.ingress, self.tasks)
    }
}

async fn run_udp_egress(socket: UdpSocket, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(payload) = rx.recv().await {
        if let Err(e) = socket.send(&payload).await {
            tracing::warn!(error = %e, len = payload.len(), "Failed to send relay datagram");
        }
    }
    tracing::info!("Relay egress closed");
}

async fn run_udp_ingress(socket: UdpSocket, tx: mpsc::Sender<Bytes>, max_datagram_bytes: usize) {
    let mut buf = vec![0u8; max_datagram_bytes];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read relay datagram");
            }
        }
    }
    tracing::info!("Relay ingress closed");
}
