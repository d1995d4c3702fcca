// Server side of the transport: named connectors, port-range binding,
// acceptor failover and inbound handshake validation.
//
// Each connector owns a protocol identifier, a codec factory and an optional
// handler. Inbound connections announce their protocol in the handshake; a
// missing connector or a handler rejection produces a handshake reject and a
// close.

use crate::config::NetworkConfig;
use crate::error::{ClusterError, Result};
use crate::metrics::NetworkMetrics;
use crate::network::codec::{CodecFactory, CodecRegistry, IdentityCodecFactory};
use crate::network::connection::{spawn_connection, ConnectionEvent, ConnectionSender};
use crate::network::frame::{read_frame, write_frame};
use crate::network::protocol::{HeartbeatParams, TransportFrame};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Server-side callbacks for one connector protocol.
#[async_trait]
pub trait ConnectorHandler: Send + Sync {
    /// Validates the login payload; a returned string rejects the handshake
    /// with that reason.
    async fn accept_login(
        &self,
        _login: Bytes,
        _remote: SocketAddr,
    ) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn on_message(&self, msg: Bytes, sender: &ConnectionSender);

    async fn on_disconnect(&self, _remote: SocketAddr, _error: Option<ClusterError>) {}
}

/// A named protocol endpoint.
pub struct Connector {
    pub protocol: String,
    pub codec: Arc<dyn CodecFactory>,
    pub handler: Option<Arc<dyn ConnectorHandler>>,
}

impl Connector {
    pub fn new(protocol: impl Into<String>, handler: Arc<dyn ConnectorHandler>) -> Self {
        Self {
            protocol: protocol.into(),
            codec: Arc::new(IdentityCodecFactory),
            handler: Some(handler),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn CodecFactory>) -> Self {
        self.codec = codec;
        self
    }
}

/// The shared transport: registered connectors plus the accept loop.
pub struct NetworkTransport {
    config: NetworkConfig,
    metrics: Arc<NetworkMetrics>,
    codecs: CodecRegistry,
    connectors: RwLock<HashMap<String, Arc<Connector>>>,
    local_addr: once_cell::sync::OnceCell<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
}

impl NetworkTransport {
    pub fn new(config: NetworkConfig) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            metrics: NetworkMetrics::new(),
            codecs: CodecRegistry::new(),
            connectors: RwLock::new(HashMap::new()),
            local_addr: once_cell::sync::OnceCell::new(),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<NetworkMetrics> {
        self.metrics.clone()
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Registers a connector; the protocol identifier must be unique. The
    /// connector's codec lands in the registry, where stateful codecs are
    /// instantiated per connection.
    pub fn register(&self, connector: Connector) -> Result<()> {
        self.codecs
            .register(connector.protocol.clone(), connector.codec.clone())?;
        let mut connectors = self.connectors.write();
        connectors.insert(connector.protocol.clone(), Arc::new(connector));
        Ok(())
    }

    /// The address the acceptor is bound to, once `bind` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    fn heartbeat_params(&self) -> HeartbeatParams {
        HeartbeatParams {
            interval: self.config.heartbeat_interval,
            loss_threshold: self.config.heartbeat_loss_threshold,
            disabled: self.config.heartbeats_disabled,
        }
    }

    /// Binds the acceptor, trying `port..port+port_range` in order, and
    /// spawns the accept loop.
    pub async fn bind(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = self.bind_listener()?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        tracing::info!(%addr, "transport listening");

        let transport = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let transport = transport.clone();
                            tokio::spawn(async move {
                                if let Err(e) = transport.handle_inbound(stream, peer).await {
                                    tracing::debug!(%peer, error = %e, "inbound connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            // Acceptor failover: back off and keep accepting.
                            tracing::warn!(error = %e, "accept failed, retrying");
                            tokio::time::sleep(transport.config.accept_retry_interval).await;
                        }
                    }
                }
            }
            tracing::debug!(%addr, "acceptor stopped");
        });

        Ok(addr)
    }

    fn bind_listener(&self) -> Result<TcpListener> {
        let ip = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| {
                ClusterError::Configuration(format!(
                    "cannot resolve bind host {}: {}",
                    self.config.host, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                ClusterError::Configuration(format!("cannot resolve bind host {}", self.config.host))
            })?
            .ip();

        let range = self.config.port_range.max(1);
        let mut last_error: Option<std::io::Error> = None;

        for offset in 0..range {
            let port = match self.config.port.checked_add(offset) {
                Some(p) => p,
                None => break,
            };
            let addr = SocketAddr::new(ip, port);

            match self.try_bind(addr) {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "bind attempt failed");
                    last_error = Some(e);
                }
            }
            if self.config.port == 0 {
                // OS-assigned port: retrying the same request is pointless.
                break;
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no ports attempted".to_string());
        Err(ClusterError::Network(format!(
            "failed to bind {}:{}..{}: {}",
            self.config.host,
            self.config.port,
            self.config.port as u32 + range as u32 - 1,
            last
        )))
    }

    fn try_bind(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(self.config.so_reuse_address)?;
        if let Some(size) = self.config.so_receive_buffer {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.config.so_send_buffer {
            socket.set_send_buffer_size(size)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.so_backlog as i32)?;
        TcpListener::from_std(socket.into())
    }

    async fn handle_inbound(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if self.config.tcp_no_delay {
            let _ = stream.set_nodelay(true);
        }

        // The handshake must complete within the connect timeout.
        let (ftype, body) = tokio::time::timeout(
            self.config.connect_timeout,
            read_frame(&mut stream, self.config.max_frame_size),
        )
        .await
        .map_err(|_| ClusterError::Timeout(format!("handshake from {} timed out", peer)))??;

        let (protocol, login) = match TransportFrame::decode(ftype, body)? {
            TransportFrame::HandshakeRequest { protocol, login } => (protocol, login),
            other => {
                return Err(ClusterError::Codec(format!(
                    "expected handshake request from {}, got {:?}",
                    peer, other
                )))
            }
        };

        let connector = self.connectors.read().get(&protocol).cloned();
        let Some(connector) = connector else {
            let reject = TransportFrame::HandshakeReject {
                reason: format!("unknown protocol: {}", protocol),
            };
            let _ = write_frame(&mut stream, &reject.encode()).await;
            return Err(ClusterError::Network(format!(
                "rejected {}: unknown protocol {}",
                peer, protocol
            )));
        };

        if let Some(handler) = &connector.handler {
            if let Err(reason) = handler.accept_login(login, peer).await {
                let reject = TransportFrame::HandshakeReject {
                    reason: reason.clone(),
                };
                let _ = write_frame(&mut stream, &reject.encode()).await;
                return Err(ClusterError::Network(format!(
                    "rejected {}: {}",
                    peer, reason
                )));
            }
        }

        let params = self.heartbeat_params();
        write_frame(&mut stream, &TransportFrame::HandshakeAccept(params).encode()).await?;

        tracing::debug!(%peer, protocol = %connector.protocol, "connection accepted");

        let (events_tx, mut events_rx) = mpsc::channel::<ConnectionEvent>(1024);
        let sender = spawn_connection(
            stream,
            params,
            self.config.max_frame_size,
            self.metrics.clone(),
            events_tx,
        );

        // Per-connection dispatch: decode through the registered codec and
        // hand off to the handler. Codec failures close the connection.
        let handler = connector.handler.clone();
        let codec_factory = self
            .codecs
            .get(&connector.protocol)
            .unwrap_or_else(|| connector.codec.clone());
        tokio::spawn(async move {
            let mut codec = codec_factory.create();
            while let Some(event) = events_rx.recv().await {
                match event {
                    ConnectionEvent::Message(payload) => {
                        let decoded = match codec.decode(payload) {
                            Ok(decoded) => decoded,
                            Err(e) => {
                                tracing::warn!(%peer, error = %e, "decode failed, closing connection");
                                sender.disconnect();
                                continue;
                            }
                        };
                        if let Some(handler) = &handler {
                            handler.on_message(decoded, &sender).await;
                        }
                    }
                    ConnectionEvent::Disconnected(error) => {
                        if let Some(handler) = &handler {
                            handler.on_disconnect(peer, error).await;
                        }
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stops the acceptor. Established connections close as their peers
    /// disconnect.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::client::NetworkClient;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl ConnectorHandler for EchoHandler {
        async fn on_message(&self, msg: Bytes, sender: &ConnectionSender) {
            let _ = sender.enqueue(msg).await;
        }
    }

    struct RejectingHandler {
        reason: String,
    }

    #[async_trait]
    impl ConnectorHandler for RejectingHandler {
        async fn accept_login(
            &self,
            _login: Bytes,
            _remote: SocketAddr,
        ) -> std::result::Result<(), String> {
            Err(self.reason.clone())
        }

        async fn on_message(&self, _msg: Bytes, _sender: &ConnectionSender) {}
    }

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            connect_timeout: Duration::from_millis(500),
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let transport = NetworkTransport::new(test_config());
        let addr = transport.bind().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(transport.local_addr(), Some(addr));
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_port_range_walks_past_taken_port() {
        let first = NetworkTransport::new(test_config());
        let first_addr = first.bind().await.unwrap();

        let mut config = test_config();
        config.port = first_addr.port();
        config.port_range = 4;
        config.so_reuse_address = false;

        let second = NetworkTransport::new(config);
        let second_addr = second.bind().await.unwrap();
        assert_ne!(second_addr.port(), first_addr.port());
        assert!(second_addr.port() > first_addr.port());
        assert!(second_addr.port() <= first_addr.port() + 3);

        first.shutdown();
        second.shutdown();
    }

    #[tokio::test]
    async fn test_port_range_exhaustion_fails() {
        let first = NetworkTransport::new(test_config());
        let first_addr = first.bind().await.unwrap();

        let mut config = test_config();
        config.port = first_addr.port();
        config.port_range = 1;
        config.so_reuse_address = false;

        let second = NetworkTransport::new(config);
        let err = second.bind().await.unwrap_err();
        assert!(matches!(err, ClusterError::Network(_)));

        first.shutdown();
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let transport = NetworkTransport::new(test_config());
        transport
            .register(Connector::new("echo", Arc::new(EchoHandler)))
            .unwrap();
        let addr = transport.bind().await.unwrap();

        let (client, mut events) =
            NetworkClient::connect(addr, "echo", Bytes::new(), &test_config())
                .await
                .unwrap();
        client.send(Bytes::from_static(b"hello")).await.unwrap();

        match tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ConnectionEvent::Message(m) => assert_eq!(m.as_ref(), b"hello"),
            other => panic!("unexpected: {:?}", other),
        }

        transport.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_protocol_rejected() {
        let transport = NetworkTransport::new(test_config());
        let addr = transport.bind().await.unwrap();

        let err = NetworkClient::connect(addr, "missing", Bytes::new(), &test_config())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown protocol"));

        transport.shutdown();
    }

    #[tokio::test]
    async fn test_handler_reject_reason_propagates() {
        let transport = NetworkTransport::new(test_config());
        transport
            .register(Connector::new(
                "guarded",
                Arc::new(RejectingHandler {
                    reason: "not welcome".into(),
                }),
            ))
            .unwrap();
        let addr = transport.bind().await.unwrap();

        let err = NetworkClient::connect(addr, "guarded", Bytes::new(), &test_config())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not welcome"));

        transport.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_connector_rejected() {
        let transport = NetworkTransport::new(test_config());
        transport
            .register(Connector::new("p", Arc::new(EchoHandler)))
            .unwrap();
        let err = transport
            .register(Connector::new("p", Arc::new(EchoHandler)))
            .unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
    }

    struct CountingHandler {
        seen: Arc<Mutex<Vec<Bytes>>>,
    }

    #[async_trait]
    impl ConnectorHandler for CountingHandler {
        async fn on_message(&self, msg: Bytes, _sender: &ConnectionSender) {
            self.seen.lock().push(msg);
        }
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = NetworkTransport::new(test_config());
        transport
            .register(Connector::new(
                "ordered",
                Arc::new(CountingHandler { seen: seen.clone() }),
            ))
            .unwrap();
        let addr = transport.bind().await.unwrap();

        let (client, _events) = NetworkClient::connect(addr, "ordered", Bytes::new(), &test_config())
            .await
            .unwrap();
        for i in 0..100u32 {
            client
                .send(Bytes::from(i.to_be_bytes().to_vec()))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if seen.lock().len() == 100 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let seen = seen.lock();
        for (i, msg) in seen.iter().enumerate() {
            assert_eq!(msg.as_ref(), (i as u32).to_be_bytes());
        }

        transport.shutdown();
    }
}
