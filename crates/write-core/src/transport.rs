//! The inter-pool transport seam.
//!
//! Sending a repacked buffer to a peer pool is itself an external concern —
//! the real implementation hangs off whatever intra-cluster RPC layer the
//! cluster already runs. This crate only needs an `async` send with a single
//! ack/reject outcome, which the Dispatcher waits on behind a per-peer
//! timeout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cluster_core::PoolId;

use crate::storage::Engine;

/// Which of the local-apply variants a peer send should run on arrival,
/// mirroring [`crate::replica::LocalTag`] but named for the wire rather than
/// the replica queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTag {
    Pool,
    TestPool,
    Server,
    TestServer,
    TestedServer,
}

/// A repacked buffer addressed to one peer pool.
#[derive(Debug, Clone)]
pub struct PeerPacket {
    pub tag: PeerTag,
    pub body: Vec<u8>,
}

/// The peer's reply to a sent packet. Transports that don't distinguish
/// partial application just return `Ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAck {
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer rejected the send outright (e.g. it doesn't own `pool`).
    /// Per design, this does *not* count toward the dispatcher's failure
    /// tally the way a timeout does.
    #[error("peer rejected send to {0}")]
    SendRejected(PoolId),
    #[error("send to {0} timed out")]
    Timeout(PoolId),
}

/// Sends a repacked buffer to the server owning `pool` and waits for its ack.
///
/// Implementations must be cheap to clone/share (`Arc`'d by the caller) and
/// internally handle their own connection pooling/retries below the single
/// attempt this trait exposes — the Dispatcher applies exactly one timeout
/// per call and does not retry.
#[async_trait::async_trait]
pub trait PoolTransport: Send + Sync {
    async fn send_to_pool(&self, pool: PoolId, pkt: PeerPacket) -> Result<PeerAck, TransportError>;

    /// A human-readable name for the server owning `pool`, used only for
    /// logging.
    fn server_name(&self, pool: PoolId) -> String {
        pool.to_string()
    }
}

/// A [`PoolTransport`] test double that applies sent packets directly to an
/// in-process peer [`Engine`] instead of going over the network, so
/// dispatcher tests can assert on what landed.
#[derive(Default)]
pub struct LoopbackTransport {
    peers: HashMap<PoolId, Arc<dyn Engine>>,
    unreachable: HashSet<PoolId>,
    names: HashMap<PoolId, String>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport::default()
    }

    pub fn add_peer(mut self, pool: PoolId, engine: Arc<dyn Engine>) -> Self {
        self.names.insert(pool, engine_name(pool));
        self.peers.insert(pool, engine);
        self
    }

    pub fn make_unreachable(mut self, pool: PoolId) -> Self {
        self.unreachable.insert(pool);
        self
    }
}

fn engine_name(pool: PoolId) -> String {
    format!("loopback-{pool}")
}

#[async_trait::async_trait]
impl PoolTransport for LoopbackTransport {
    async fn send_to_pool(&self, pool: PoolId, pkt: PeerPacket) -> Result<PeerAck, TransportError> {
        if self.unreachable.contains(&pool) {
            return Err(TransportError::Timeout(pool));
        }
        let engine = self
            .peers
            .get(&pool)
            .ok_or(TransportError::SendRejected(pool))?;
        let peer_error_bus = cluster_core::ErrorBus::new();
        crate::local_apply::apply_plain(engine.as_ref(), &peer_error_bus, &pkt.body)
            .map_err(|_| TransportError::Timeout(pool))?;
        Ok(PeerAck::Ack)
    }

    fn server_name(&self, pool: PoolId) -> String {
        self.names.get(&pool).cloned().unwrap_or_else(|| engine_name(pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemEngine;

    fn body(name: &str, ts: i64, value: i64) -> Vec<u8> {
        use cluster_core::SeriesName;
        let n = SeriesName::new(name.as_bytes().to_vec()).unwrap();
        crate::local_apply::encode_one_series_for_test(&n, &[(ts, cluster_core::Value::Integer(value))])
    }

    #[tokio::test]
    async fn unreachable_peer_times_out() {
        let transport = LoopbackTransport::new().make_unreachable(PoolId(1));
        let pkt = PeerPacket {
            tag: PeerTag::Pool,
            body: body("cpu", 1, 1),
        };
        let err = transport.send_to_pool(PoolId(1), pkt).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout(PoolId(1)));
    }

    #[tokio::test]
    async fn unknown_peer_is_rejected_not_timed_out() {
        let transport = LoopbackTransport::new();
        let pkt = PeerPacket {
            tag: PeerTag::Pool,
            body: body("cpu", 1, 1),
        };
        let err = transport.send_to_pool(PoolId(9), pkt).await.unwrap_err();
        assert_eq!(err, TransportError::SendRejected(PoolId(9)));
    }

    #[tokio::test]
    async fn reachable_peer_applies_the_packet() {
        let engine = Arc::new(MemEngine::new());
        let transport = LoopbackTransport::new().add_peer(PoolId(1), engine.clone());
        let pkt = PeerPacket {
            tag: PeerTag::Pool,
            body: body("cpu", 42, 7),
        };
        transport.send_to_pool(PoolId(1), pkt).await.unwrap();
        let n = cluster_core::SeriesName::new(b"cpu".to_vec()).unwrap();
        assert_eq!(engine.points_for(&n), vec![(42, cluster_core::Value::Integer(7))]);
    }
}
