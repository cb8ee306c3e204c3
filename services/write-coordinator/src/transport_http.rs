//! A production-shape [`PoolTransport`] that ships repacked buffers to peer
//! pools over HTTP, grounded in the same request/response shape this service
//! exposes on its own `/insert` route.
//!
//! Connection pooling and retries below the single attempt the trait exposes
//! are `reqwest`'s job; this type just maps the wire outcome onto
//! [`TransportError`].

use std::collections::HashMap;
use std::time::Duration;

use cluster_core::PoolId;
use write_core::{PeerAck, PeerPacket, PeerTag, PoolTransport, TransportError};

pub struct HttpPoolTransport {
    client: reqwest::Client,
    peers: HashMap<PoolId, String>,
}

impl HttpPoolTransport {
    pub fn new(peers: HashMap<PoolId, String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client builder failed");
        HttpPoolTransport { client, peers }
    }
}

fn tag_header_value(tag: PeerTag) -> &'static str {
    match tag {
        PeerTag::Pool => "pool",
        PeerTag::TestPool => "test-pool",
        PeerTag::Server => "server",
        PeerTag::TestServer => "test-server",
        PeerTag::TestedServer => "tested-server",
    }
}

#[async_trait::async_trait]
impl PoolTransport for HttpPoolTransport {
    async fn send_to_pool(&self, pool: PoolId, pkt: PeerPacket) -> Result<PeerAck, TransportError> {
        let base_url = self
            .peers
            .get(&pool)
            .ok_or(TransportError::SendRejected(pool))?;
        let url = format!("{}/internal/pool-insert", base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("X-Peer-Tag", tag_header_value(pkt.tag))
            .body(pkt.body)
            .send()
            .await
            .map_err(|_| TransportError::Timeout(pool))?;

        if response.status().is_success() {
            Ok(PeerAck::Ack)
        } else {
            Err(TransportError::Timeout(pool))
        }
    }

    fn server_name(&self, pool: PoolId) -> String {
        self.peers
            .get(&pool)
            .cloned()
            .unwrap_or_else(|| pool.to_string())
    }
}
