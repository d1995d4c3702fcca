// Liveness probe over a dedicated connector protocol.
//
// Used by the seed-node manager to weed out dead addresses and by tests to
// assert reachability semantics: Success when a peer speaks the ping
// protocol at the address, Timeout when nothing answers in time, Failure
// when the connection is actively refused or reset.

use crate::config::NetworkConfig;
use crate::error::ClusterError;
use crate::network::connection::{ConnectionEvent, ConnectionSender};
use crate::network::client::NetworkClient;
use crate::network::transport::ConnectorHandler;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

pub const PING_PROTOCOL: &str = "hekate.ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Success,
    Timeout,
    Failure,
}

/// Server side: echo every probe back.
pub struct PingHandler;

#[async_trait]
impl ConnectorHandler for PingHandler {
    async fn on_message(&self, msg: Bytes, sender: &ConnectionSender) {
        let _ = sender.enqueue(msg).await;
    }
}

/// Probes `addr` within the configured connect timeout.
pub async fn ping(addr: SocketAddr, config: &NetworkConfig) -> PingResult {
    let connected = NetworkClient::connect(addr, PING_PROTOCOL, Bytes::new(), config).await;

    let (client, mut events) = match connected {
        Ok(pair) => pair,
        Err(ClusterError::Timeout(_)) => return PingResult::Timeout,
        Err(_) => return PingResult::Failure,
    };

    if client.send(Bytes::from_static(b"ping")).await.is_err() {
        client.disconnect();
        return PingResult::Failure;
    }

    let result = match tokio::time::timeout(config.connect_timeout, events.recv()).await {
        Err(_) => PingResult::Timeout,
        Ok(Some(ConnectionEvent::Message(_))) => PingResult::Success,
        Ok(Some(ConnectionEvent::Disconnected(Some(ClusterError::Timeout(_))))) => {
            PingResult::Timeout
        }
        Ok(_) => PingResult::Failure,
    };

    client.disconnect();
    result
}
