// Leader election built on the coordination kernel.
//
// The coordinator of the election process claims leadership and announces
// itself to every member; leadership therefore follows the oldest
// participant across topology changes. Members observe the current leader
// through a watch handle.

use crate::cluster::node::NodeId;
use crate::cluster::protocol::{read_node_id, write_node_id};
use crate::coordinate::process::{CoordinationContext, CoordinationHandler};
use crate::error::Result;
use crate::network::frame::{FrameReader, FrameWriter};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;

/// Observes leadership changes.
#[derive(Clone)]
pub struct LeaderWatch {
    rx: watch::Receiver<Option<NodeId>>,
}

impl LeaderWatch {
    /// The currently known leader, if any was announced yet.
    pub fn current(&self) -> Option<NodeId> {
        *self.rx.borrow()
    }

    /// Resolves once some leader is known.
    pub async fn leader(&mut self) -> Result<NodeId> {
        loop {
            if let Some(leader) = *self.rx.borrow_and_update() {
                return Ok(leader);
            }
            if self.rx.changed().await.is_err() {
                return Err(crate::error::ClusterError::Coordination(
                    "election ended without a leader".to_string(),
                ));
            }
        }
    }
}

/// The election handler; register it as a coordination process.
pub struct ElectionHandler {
    leader_tx: watch::Sender<Option<NodeId>>,
}

/// Builds the handler plus the watch side.
pub fn leader_election() -> (Arc<ElectionHandler>, LeaderWatch) {
    let (leader_tx, rx) = watch::channel(None);
    (Arc::new(ElectionHandler { leader_tx }), LeaderWatch { rx })
}

fn encode_leader(leader: &NodeId) -> Bytes {
    let mut w = FrameWriter::new();
    write_node_id(&mut w, leader);
    w.into_bytes()
}

fn decode_leader(payload: Bytes) -> Result<NodeId> {
    let mut r = FrameReader::new(payload);
    read_node_id(&mut r)
}

#[async_trait]
impl CoordinationHandler for ElectionHandler {
    async fn prepare(&self, _ctx: &CoordinationContext) -> Result<()> {
        Ok(())
    }

    async fn process(&self, request: Bytes, ctx: &CoordinationContext) -> Result<Bytes> {
        let leader = decode_leader(request)?;
        tracing::debug!(leader = %leader, "leader announced");
        self.leader_tx.send_replace(Some(leader));
        ctx.complete();
        Ok(Bytes::from_static(b"ack"))
    }

    async fn coordinate(&self, ctx: &CoordinationContext) -> Result<()> {
        let leader = ctx.coordinator();
        let announcement = encode_leader(&leader);

        // Members that have not configured this round yet reject the
        // broadcast; keep announcing until everyone acknowledged.
        let mut attempts = 0u32;
        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }
            match ctx.broadcast(announcement.clone()).await {
                Ok(replies) => {
                    tracing::info!(leader = %leader, acks = replies.len(), "leadership established");
                    ctx.complete();
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts > 100 {
                        return Err(e);
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_announcement_round_trip() {
        let leader = NodeId::generate();
        assert_eq!(decode_leader(encode_leader(&leader)).unwrap(), leader);
    }

    #[tokio::test]
    async fn test_watch_sees_announcement() {
        let (handler, mut watch) = leader_election();
        assert!(watch.current().is_none());

        let leader = NodeId::generate();
        handler.leader_tx.send_replace(Some(leader));

        assert_eq!(watch.leader().await.unwrap(), leader);
        assert_eq!(watch.current(), Some(leader));
    }
}
