//! Wiring: the collaborators a running node needs, assembled once at
//! startup and shared into every HTTP request as `axum` state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cluster_core::{JobFlags, PoolId, TimePrecision, TimeUnit};
use tokio::sync::oneshot;
use write_core::{
    pool_registry::fnv1a_lookup, storage::MemEngine, ClientHandle, DecodeContext, Dispatcher,
    Engine, InsertJob, InsertResponse, PoolBuffer, PoolRegistry, PoolTransport,
};

use crate::config::WriteCoordinatorConfig;
use crate::transport_http::HttpPoolTransport;

/// A [`ClientHandle`] good for exactly one request: bridges the job's
/// synchronous completion callback back to the `async` HTTP handler
/// awaiting it.
pub struct OneshotClient {
    reply: Mutex<Option<oneshot::Sender<InsertResponse>>>,
}

impl OneshotClient {
    fn new(reply: oneshot::Sender<InsertResponse>) -> Self {
        OneshotClient {
            reply: Mutex::new(Some(reply)),
        }
    }
}

impl ClientHandle for OneshotClient {
    fn respond(&self, _request_id: u64, response: InsertResponse) {
        if let Some(tx) = self.reply.lock().expect("client mutex poisoned").take() {
            let _ = tx.send(response);
        }
    }
}

#[derive(Clone)]
pub struct AppState(Arc<Inner>);

struct Inner {
    own_pool: PoolId,
    node_name: String,
    engine: Arc<dyn Engine>,
    registry: Arc<PoolRegistry>,
    precision: TimePrecision,
    dispatcher: Dispatcher,
    transport: Arc<dyn PoolTransport>,
    peer_timeout: Duration,
    next_request_id: AtomicU64,
}

fn parse_time_unit(unit: &str) -> TimeUnit {
    match unit {
        "millis" => TimeUnit::Millis,
        "micros" => TimeUnit::Micros,
        "nanos" => TimeUnit::Nanos,
        _ => TimeUnit::Seconds,
    }
}

impl AppState {
    pub fn from_config(cfg: &WriteCoordinatorConfig) -> Self {
        let own_pool = PoolId(cfg.node.own_pool);
        let engine: Arc<dyn Engine> = Arc::new(MemEngine::new());
        let registry = Arc::new(PoolRegistry::new(fnv1a_lookup, cfg.pools.count));
        let precision = TimePrecision::new(
            parse_time_unit(&cfg.time_precision.unit),
            cfg.time_precision.min,
            cfg.time_precision.max,
        );

        let peers: HashMap<PoolId, String> = cfg
            .peers
            .iter()
            .map(|p| (PoolId(p.pool), p.base_url.clone()))
            .collect();
        let peer_timeout = Duration::from_millis(cfg.http.peer_timeout_ms);
        let transport: Arc<dyn PoolTransport> = Arc::new(HttpPoolTransport::new(peers, peer_timeout));

        let dispatcher = Dispatcher::new(
            own_pool,
            engine.clone(),
            registry.clone(),
            None,
            transport.clone(),
            peer_timeout,
        );

        AppState(Arc::new(Inner {
            own_pool,
            node_name: cfg.node.name.clone(),
            engine,
            registry,
            precision,
            dispatcher,
            transport,
            peer_timeout,
            next_request_id: AtomicU64::new(1),
        }))
    }

    /// Decodes `body`, dispatches it, and waits for the job to resolve.
    /// Mirrors the three pipeline stages a real front door would run before
    /// handing off to the dispatcher: decode+route+repack, then dispatch.
    pub async fn handle_insert(&self, body: &[u8], test_variant: bool) -> InsertResponse {
        let request_id = self.0.next_request_id.fetch_add(1, Ordering::SeqCst);
        let flags = if test_variant {
            JobFlags::TEST
        } else {
            JobFlags::empty()
        };

        let (tx, rx) = oneshot::channel();
        let client = Arc::new(OneshotClient::new(tx));
        let job = InsertJob::new(
            request_id,
            client,
            self.0.engine.clone(),
            flags,
            self.0.node_name.clone(),
            self.0.registry.pool_count(),
        );

        let decoded = {
            let mut buffers = job.buffers_mut().await;
            let ctx = DecodeContext {
                own_pool: self.0.own_pool,
                registry: self.0.registry.as_ref(),
                engine: self.0.engine.as_ref(),
                precision: &self.0.precision,
                error_bus: job.error_bus(),
            };
            write_core::assign(body, &ctx, &mut buffers)
        };

        match decoded {
            Ok(npoints) => {
                job.set_npoints(npoints);
                self.0.dispatcher.dispatch(job);
                rx.await.unwrap_or(InsertResponse::Critical {
                    node: self.0.node_name.clone(),
                })
            }
            Err(err) => InsertResponse::Error {
                message: format!("decode failed: {err}"),
            },
        }
    }

    /// Applies a pool buffer handed to us by a peer's
    /// [`crate::transport_http::HttpPoolTransport`]. `test_variant` mirrors
    /// the sender's `PeerTag`: set for `test-pool`/`test-server`, meaning
    /// this node should re-route series it doesn't recognize rather than
    /// assume it owns everything in the buffer.
    pub async fn apply_peer_packet(&self, test_variant: bool, body: &[u8]) -> Result<usize, String> {
        let error_bus = cluster_core::ErrorBus::new();
        if test_variant {
            let (n, forwards) = write_core::apply_test(
                self.0.engine.as_ref(),
                &error_bus,
                self.0.registry.as_ref(),
                self.0.own_pool,
                None,
                body,
            )
            .map_err(|e| e.to_string())?;

            let mut by_pool: HashMap<PoolId, PoolBuffer> = HashMap::new();
            for fragment in forwards {
                by_pool
                    .entry(fragment.pool)
                    .or_insert_with(PoolBuffer::new)
                    .push_raw_entry(&fragment.body);
            }
            for (pool, buffer) in by_pool {
                let transport = self.0.transport.clone();
                let timeout = self.0.peer_timeout;
                let pkt = write_core::PeerPacket {
                    tag: write_core::PeerTag::Server,
                    body: buffer.finish(),
                };
                tokio::spawn(async move {
                    let _ = tokio::time::timeout(timeout, transport.send_to_pool(pool, pkt)).await;
                });
            }
            Ok(n)
        } else {
            write_core::apply_plain(self.0.engine.as_ref(), &error_bus, body).map_err(|e| e.to_string())
        }
    }
}
