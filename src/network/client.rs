// Outbound transport client.
//
// `open` returns immediately in the Connecting state while the dial and
// handshake run in the background; sends issued before the handshake
// completes are buffered and flushed in order on accept, or failed with a
// closed-channel error if the connection never establishes. `connect` is the
// awaited form.

use crate::config::NetworkConfig;
use crate::error::{ClusterError, Result};
use crate::metrics::NetworkMetrics;
use crate::network::connection::{spawn_connection, ConnectionEvent, ConnectionSender};
use crate::network::frame::{read_frame, write_frame};
use crate::network::protocol::TransportFrame;
use bytes::Bytes;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
enum ReadyState {
    Pending,
    Ready,
    Failed(ClusterError),
}

struct OutboundItem {
    payload: Bytes,
    done: Option<oneshot::Sender<Result<()>>>,
}

struct ClientShared {
    remote: SocketAddr,
    protocol: String,
    state: RwLock<ClientState>,
    outbound_tx: mpsc::Sender<OutboundItem>,
    ready_tx: watch::Sender<ReadyState>,
    pause_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

/// One outbound protocol connection.
#[derive(Clone)]
pub struct NetworkClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for NetworkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkClient")
            .field("remote", &self.shared.remote)
            .field("protocol", &self.shared.protocol)
            .finish()
    }
}

impl NetworkClient {
    /// Starts connecting in the background. Sends enqueued while Connecting
    /// are flushed in order once the handshake completes.
    pub fn open(
        addr: SocketAddr,
        protocol: impl Into<String>,
        login: Bytes,
        config: &NetworkConfig,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let protocol = protocol.into();
        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundItem>(1024);
        let (ready_tx, _) = watch::channel(ReadyState::Pending);
        let (pause_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel::<ConnectionEvent>(1024);

        let shared = Arc::new(ClientShared {
            remote: addr,
            protocol,
            state: RwLock::new(ClientState::Connecting),
            outbound_tx,
            ready_tx,
            pause_tx,
            shutdown_tx,
        });

        let client = Self {
            shared: shared.clone(),
        };

        tokio::spawn(run_client(
            shared,
            login,
            config.clone(),
            outbound_rx,
            events_tx,
        ));

        (client, events_rx)
    }

    /// Connects and waits for the handshake to complete.
    pub async fn connect(
        addr: SocketAddr,
        protocol: impl Into<String>,
        login: Bytes,
        config: &NetworkConfig,
    ) -> Result<(Self, mpsc::Receiver<ConnectionEvent>)> {
        let (client, events) = Self::open(addr, protocol, login, config);
        client.ready().await?;
        Ok((client, events))
    }

    /// Resolves once the handshake completed, or fails with the connect
    /// error.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.shared.ready_tx.subscribe();
        loop {
            match rx.borrow_and_update().clone() {
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(e) => return Err(e),
                ReadyState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(self.closed_error());
            }
        }
    }

    /// Enqueues a payload; resolves when written, or fails with a
    /// closed-channel error on disconnect.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.shared
            .outbound_tx
            .send(OutboundItem {
                payload,
                done: Some(done_tx),
            })
            .await
            .map_err(|_| self.closed_error())?;
        done_rx.await.map_err(|_| self.closed_error())?
    }

    /// Fire-and-forget variant of `send`.
    pub async fn enqueue(&self, payload: Bytes) -> Result<()> {
        self.shared
            .outbound_tx
            .send(OutboundItem {
                payload,
                done: None,
            })
            .await
            .map_err(|_| self.closed_error())
    }

    pub fn pause_receiving(&self) {
        self.shared.pause_tx.send_replace(true);
    }

    pub fn resume_receiving(&self) {
        self.shared.pause_tx.send_replace(false);
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.read()
    }

    pub fn remote(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn protocol(&self) -> &str {
        &self.shared.protocol
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    pub fn disconnect(&self) {
        self.shared.shutdown_tx.send_replace(true);
    }

    fn closed_error(&self) -> ClusterError {
        ClusterError::ChannelClosed(format!("connection to {} is closed", self.shared.remote))
    }
}

async fn run_client(
    shared: Arc<ClientShared>,
    login: Bytes,
    config: NetworkConfig,
    mut outbound_rx: mpsc::Receiver<OutboundItem>,
    events_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();

    let established = tokio::select! {
        result = establish(&shared, login, &config, events_tx.clone()) => result,
        _ = shutdown_rx.changed() => Err(ClusterError::ChannelClosed(format!(
            "connection to {} is closed",
            shared.remote
        ))),
    };

    let sender = match established {
        Ok(sender) => sender,
        Err(e) => {
            *shared.state.write() = ClientState::Disconnected;
            shared.ready_tx.send_replace(ReadyState::Failed(e.clone()));
            fail_queued(&mut outbound_rx, &shared).await;
            let _ = events_tx.send(ConnectionEvent::Disconnected(Some(e))).await;
            return;
        }
    };

    *shared.state.write() = ClientState::Connected;
    shared.ready_tx.send_replace(ReadyState::Ready);

    if *shared.pause_tx.borrow() {
        sender.pause_receiving();
    }

    let mut pause_rx = shared.pause_tx.subscribe();

    // Flush buffered sends and keep forwarding until disconnect.
    loop {
        tokio::select! {
            item = outbound_rx.recv() => {
                let Some(item) = item else { break };
                let result = match &item.done {
                    Some(_) => sender.send(item.payload).await,
                    None => sender.enqueue(item.payload).await,
                };
                let failed = result.is_err();
                if let Some(done) = item.done {
                    let _ = done.send(result);
                }
                if failed {
                    break;
                }
            }
            changed = pause_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if *pause_rx.borrow() {
                    sender.pause_receiving();
                } else {
                    sender.resume_receiving();
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    sender.disconnect();
    *shared.state.write() = ClientState::Disconnected;
    fail_queued(&mut outbound_rx, &shared).await;
}

async fn establish(
    shared: &Arc<ClientShared>,
    login: Bytes,
    config: &NetworkConfig,
    events_tx: mpsc::Sender<ConnectionEvent>,
) -> Result<ConnectionSender> {
    let mut stream =
        tokio::time::timeout(config.connect_timeout, TcpStream::connect(shared.remote))
            .await
            .map_err(|_| {
                ClusterError::Timeout(format!(
                    "connect to {} timed out after {:?}",
                    shared.remote, config.connect_timeout
                ))
            })??;

    if config.tcp_no_delay {
        let _ = stream.set_nodelay(true);
    }

    let request = TransportFrame::HandshakeRequest {
        protocol: shared.protocol.clone(),
        login,
    };
    write_frame(&mut stream, &request.encode()).await?;

    let (ftype, body) = tokio::time::timeout(
        config.connect_timeout,
        read_frame(&mut stream, config.max_frame_size),
    )
    .await
    .map_err(|_| {
        ClusterError::Timeout(format!(
            "handshake with {} timed out after {:?}",
            shared.remote, config.connect_timeout
        ))
    })??;

    let params = match TransportFrame::decode(ftype, body)? {
        TransportFrame::HandshakeAccept(params) => params,
        TransportFrame::HandshakeReject { reason } => {
            return Err(ClusterError::Network(format!(
                "handshake with {} rejected: {}",
                shared.remote, reason
            )));
        }
        other => {
            return Err(ClusterError::Codec(format!(
                "unexpected handshake reply from {}: {:?}",
                shared.remote, other
            )));
        }
    };

    tracing::debug!(remote = %shared.remote, protocol = %shared.protocol, "connected");

    let (inner_events_tx, mut inner_events_rx) = mpsc::channel::<ConnectionEvent>(1024);
    let sender = spawn_connection(
        stream,
        params,
        config.max_frame_size,
        NetworkMetrics::new(),
        inner_events_tx,
    );

    // Forward inbound events to the caller's receiver and track disconnects.
    let forward_shared = shared.clone();
    tokio::spawn(async move {
        while let Some(event) = inner_events_rx.recv().await {
            let disconnected = matches!(event, ConnectionEvent::Disconnected(_));
            if disconnected {
                *forward_shared.state.write() = ClientState::Disconnected;
            }
            if events_tx.send(event).await.is_err() {
                break;
            }
            if disconnected {
                break;
            }
        }
    });

    Ok(sender)
}

async fn fail_queued(outbound_rx: &mut mpsc::Receiver<OutboundItem>, shared: &Arc<ClientShared>) {
    outbound_rx.close();
    while let Ok(item) = outbound_rx.try_recv() {
        if let Some(done) = item.done {
            let _ = done.send(Err(ClusterError::ChannelClosed(format!(
                "connection to {} is closed",
                shared.remote
            ))));
        }
    }
}
