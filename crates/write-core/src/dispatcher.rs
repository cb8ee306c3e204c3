//! The async fan-out: split repacked buffers into "ours" and "theirs", send
//! the peer buffers out, apply the local buffer in process, and resolve the
//! job exactly once every peer has answered (or timed out).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cluster_core::{JobFlags, PoolId};

use crate::job::InsertJob;
use crate::local_apply::{self, ForwardFragment};
use crate::pool_registry::PoolRegistry;
use crate::repacker::PoolBuffer;
use crate::replica::{LocalApplyPacket, LocalTag, Replica};
use crate::storage::Engine;
use crate::transport::{PeerAck, PeerPacket, PeerTag, PoolTransport, TransportError};

/// Owns the collaborators a dispatch needs; cheap to clone (everything
/// inside is already `Arc`'d), so one `Dispatcher` can serve every insert
/// job a node handles.
#[derive(Clone)]
pub struct Dispatcher {
    own_pool: PoolId,
    engine: Arc<dyn Engine>,
    registry: Arc<PoolRegistry>,
    replica: Option<Arc<dyn Replica>>,
    transport: Arc<dyn PoolTransport>,
    peer_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        own_pool: PoolId,
        engine: Arc<dyn Engine>,
        registry: Arc<PoolRegistry>,
        replica: Option<Arc<dyn Replica>>,
        transport: Arc<dyn PoolTransport>,
        peer_timeout: Duration,
    ) -> Self {
        Dispatcher {
            own_pool,
            engine,
            registry,
            replica,
            transport,
            peer_timeout,
        }
    }

    /// Posts the dispatch task for `job`. The job's per-pool buffers must
    /// already be populated (Decoder/Repacker have run) and `job`'s
    /// `npoints` already set — the Dispatcher never recomputes it.
    pub fn dispatch(&self, job: Arc<InsertJob>) -> tokio::task::JoinHandle<()> {
        job.begin_task();
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run(job.clone()).await;
            job.end_task();
        })
    }

    async fn run(&self, job: Arc<InsertJob>) {
        let buffers = job.take_buffers().await;
        let mut peer_sends = Vec::new();
        let mut local_body = None;

        for (idx, buffer) in buffers.into_iter().enumerate() {
            if buffer.is_empty() {
                continue;
            }
            let pool = PoolId(idx as u16);
            if pool == self.own_pool {
                local_body = Some(buffer.finish());
            } else {
                let tag = if job.flags.contains(JobFlags::TEST) {
                    PeerTag::TestPool
                } else {
                    PeerTag::Pool
                };
                peer_sends.push((pool, PeerPacket { tag, body: buffer.finish() }));
            }
        }

        if let Some(body) = local_body {
            self.apply_local(&job, &body);
        }

        let mut handles = Vec::with_capacity(peer_sends.len());
        for (pool, pkt) in peer_sends {
            let transport = self.transport.clone();
            let job = job.clone();
            let timeout = self.peer_timeout;
            handles.push(tokio::spawn(async move {
                send_one_peer(transport.as_ref(), pool, pkt, timeout, &job).await;
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    fn apply_local(&self, job: &Arc<InsertJob>, body: &[u8]) {
        if let Some(replica) = &self.replica {
            let packet = if replica.initsync_idle() {
                Some(LocalApplyPacket {
                    tag: local_tag_from_flags(job.flags),
                    body: body.to_vec(),
                })
            } else {
                replica.filter(body, job.flags)
            };
            if let Some(pkt) = packet {
                if replica.enqueue(pkt).is_err() {
                    tracing::warn!(request_id = job.request_id, "replica enqueue failed");
                }
            }
        }

        let use_test_variant = job.flags.requires_test_variant(self.registry.is_reindexing());
        if use_test_variant {
            match local_apply::apply_test(
                self.engine.as_ref(),
                job.error_bus(),
                &self.registry,
                self.own_pool,
                self.replica.as_deref(),
                body,
            ) {
                Ok((_n, forwards)) => {
                    if !forwards.is_empty() {
                        self.ship_forwards(job.clone(), forwards);
                    }
                }
                Err(err) => {
                    tracing::error!(request_id = job.request_id, %err, "local apply failed critically");
                    job.error_bus().raise();
                }
            }
        } else if let Err(err) = local_apply::apply_plain(self.engine.as_ref(), job.error_bus(), body) {
            tracing::error!(request_id = job.request_id, %err, "local apply failed critically");
            job.error_bus().raise();
        }
    }

    /// Posts the second async task the test variant triggers when it
    /// accumulates fragments bound for other pools.
    fn ship_forwards(&self, job: Arc<InsertJob>, forwards: Vec<ForwardFragment>) {
        job.begin_task();
        let transport = self.transport.clone();
        let timeout = self.peer_timeout;
        tokio::spawn(async move {
            let mut grouped: HashMap<PoolId, PoolBuffer> = HashMap::new();
            for fragment in forwards {
                grouped
                    .entry(fragment.pool)
                    .or_insert_with(PoolBuffer::new)
                    .push_raw_entry(&fragment.body);
            }
            let tag = forward_tag(job.flags);
            for (pool, buffer) in grouped {
                let pkt = PeerPacket { tag, body: buffer.finish() };
                send_one_peer(transport.as_ref(), pool, pkt, timeout, &job).await;
            }
            job.end_task();
        });
    }
}

async fn send_one_peer(
    transport: &dyn PoolTransport,
    pool: PoolId,
    pkt: PeerPacket,
    timeout: Duration,
    job: &Arc<InsertJob>,
) {
    match tokio::time::timeout(timeout, transport.send_to_pool(pool, pkt)).await {
        Ok(Ok(PeerAck::Ack)) => {}
        Ok(Err(TransportError::SendRejected(_))) => {
            // Per design notes: logged, but does not count toward the
            // aggregate failure the client sees.
            tracing::warn!(request_id = job.request_id, pool = %pool, "peer rejected insert send");
        }
        Ok(Err(TransportError::Timeout(_))) | Err(_) => {
            let server = transport.server_name(pool);
            tracing::warn!(request_id = job.request_id, pool = %pool, server = %server, "peer insert send timed out");
            job.record_peer_failure(server);
        }
    }
}

fn local_tag_from_flags(flags: JobFlags) -> LocalTag {
    if flags.contains(JobFlags::TEST) {
        LocalTag::Test
    } else if flags.contains(JobFlags::TESTED) {
        LocalTag::Tested
    } else {
        LocalTag::Plain
    }
}

fn forward_tag(flags: JobFlags) -> PeerTag {
    if flags.contains(JobFlags::TEST) {
        PeerTag::TestServer
    } else if flags.contains(JobFlags::TESTED) {
        PeerTag::TestedServer
    } else {
        PeerTag::Server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{assign, DecodeContext};
    use crate::job::{InsertResponse, RecordingClient};
    use crate::pool_registry::fnv1a_lookup;
    use crate::storage::MemEngine;
    use cluster_core::{SeriesName, TimePrecision, Value};
    use wire::Writer;

    fn encode_map(entries: &[(&str, &[(i64, Value)])]) -> Vec<u8> {
        let mut w = Writer::new();
        w.map_open();
        for (name, points) in entries {
            w.raw(name.as_bytes());
            w.array_open();
            for (ts, value) in points.iter() {
                w.array2();
                w.int(*ts);
                match value {
                    Value::Integer(v) => {
                        w.int(*v);
                    }
                    Value::Float(v) => {
                        w.float(*v);
                    }
                    Value::String(bytes) => {
                        w.raw(bytes);
                    }
                }
            }
            w.array_close();
        }
        w.map_close();
        w.end();
        w.into_bytes()
    }

    #[tokio::test]
    async fn s1_single_local_series_applies_in_order_and_responds_success() {
        let engine = Arc::new(MemEngine::new());
        let registry = Arc::new(PoolRegistry::single_pool(fnv1a_lookup));
        let transport: Arc<dyn PoolTransport> = Arc::new(crate::transport::LoopbackTransport::new());
        let body = encode_map(&[("cpu", &[(100, Value::Integer(1)), (200, Value::Integer(2))])]);

        let client = Arc::new(RecordingClient::new());
        let job = InsertJob::new(1, client.clone(), engine.clone(), JobFlags::empty(), "node-a", 1);
        let precision = TimePrecision::unbounded_seconds();
        let mut buffers = job.take_buffers().await;
        {
            let ctx = DecodeContext {
                own_pool: PoolId(0),
                registry: &registry,
                engine: engine.as_ref(),
                precision: &precision,
                error_bus: job.error_bus(),
            };
            let n = assign(&body, &ctx, &mut buffers).unwrap();
            job.set_npoints(n);
        }
        job.restore_buffers_for_test(buffers);

        let dispatcher = Dispatcher::new(PoolId(0), engine.clone(), registry, None, transport, Duration::from_millis(200));
        dispatcher.dispatch(job.clone()).await.unwrap();

        assert_eq!(
            engine.points_for(&SeriesName::new(b"cpu".to_vec()).unwrap()),
            vec![(100, Value::Integer(1)), (200, Value::Integer(2))]
        );
        let responses = client.responses();
        assert_eq!(responses, vec![(1, InsertResponse::Success { npoints: 2 })]);
        assert_eq!(engine.total_points(), 2);
    }

    #[tokio::test]
    async fn s2_split_across_two_pools_acks_and_applies_locally() {
        fn lookup(name: &SeriesName, _: u16) -> PoolId {
            if name.as_bytes() == b"a" {
                PoolId(0)
            } else {
                PoolId(1)
            }
        }
        let local_engine = Arc::new(MemEngine::new());
        let peer_engine = Arc::new(MemEngine::new());
        let registry = Arc::new(PoolRegistry::new(lookup, 2));
        let transport: Arc<dyn PoolTransport> =
            Arc::new(crate::transport::LoopbackTransport::new().add_peer(PoolId(1), peer_engine.clone()));
        let body = encode_map(&[
            ("a", &[(1, Value::Float(1.0))]),
            ("b", &[(2, Value::String(b"x".to_vec()))]),
        ]);

        let client = Arc::new(RecordingClient::new());
        let job = InsertJob::new(2, client.clone(), local_engine.clone(), JobFlags::empty(), "node-a", 2);
        let precision = TimePrecision::unbounded_seconds();
        let mut buffers = job.take_buffers().await;
        let n = assign(
            &body,
            &DecodeContext {
                own_pool: PoolId(0),
                registry: &registry,
                engine: local_engine.as_ref(),
                precision: &precision,
                error_bus: job.error_bus(),
            },
            &mut buffers,
        )
        .unwrap();
        job.set_npoints(n);
        job.restore_buffers_for_test(buffers);

        let dispatcher = Dispatcher::new(
            PoolId(0),
            local_engine.clone(),
            registry,
            None,
            transport,
            Duration::from_millis(200),
        );
        dispatcher.dispatch(job.clone()).await.unwrap();

        assert!(local_engine.contains(&SeriesName::new(b"a".to_vec()).unwrap()));
        assert_eq!(
            peer_engine.points_for(&SeriesName::new(b"b".to_vec()).unwrap()),
            vec![(2, Value::String(b"x".to_vec()))]
        );
        assert_eq!(
            client.responses(),
            vec![(2, InsertResponse::Success { npoints: 2 })]
        );
        assert_eq!(local_engine.total_points(), 2);
    }

    #[tokio::test]
    async fn s5_unreachable_peer_yields_error_response_naming_its_server() {
        fn lookup(name: &SeriesName, _: u16) -> PoolId {
            if name.as_bytes() == b"a" {
                PoolId(0)
            } else {
                PoolId(1)
            }
        }
        let local_engine = Arc::new(MemEngine::new());
        let registry = Arc::new(PoolRegistry::new(lookup, 2));
        let transport: Arc<dyn PoolTransport> =
            Arc::new(crate::transport::LoopbackTransport::new().make_unreachable(PoolId(1)));
        let body = encode_map(&[
            ("a", &[(1, Value::Float(1.0))]),
            ("b", &[(2, Value::String(b"x".to_vec()))]),
        ]);

        let client = Arc::new(RecordingClient::new());
        let job = InsertJob::new(5, client.clone(), local_engine.clone(), JobFlags::empty(), "node-a", 2);
        let precision = TimePrecision::unbounded_seconds();
        let mut buffers = job.take_buffers().await;
        let n = assign(
            &body,
            &DecodeContext {
                own_pool: PoolId(0),
                registry: &registry,
                engine: local_engine.as_ref(),
                precision: &precision,
                error_bus: job.error_bus(),
            },
            &mut buffers,
        )
        .unwrap();
        job.set_npoints(n);
        job.restore_buffers_for_test(buffers);

        let dispatcher = Dispatcher::new(
            PoolId(0),
            local_engine.clone(),
            registry,
            None,
            transport,
            Duration::from_millis(50),
        );
        dispatcher.dispatch(job.clone()).await.unwrap();

        // Local apply still happened even though the peer never acked.
        assert!(local_engine.contains(&SeriesName::new(b"a".to_vec()).unwrap()));
        let responses = client.responses();
        assert_eq!(responses.len(), 1);
        match &responses[0].1 {
            InsertResponse::Error { message } => assert!(message.contains("pool-1")),
            other => panic!("expected an error response, got {other:?}"),
        }
        // A peer-failure response does not credit the cumulative counter.
        assert_eq!(local_engine.total_points(), 0);
    }

    #[tokio::test]
    async fn empty_batch_resolves_immediately_with_zero_points_and_no_peer_sends() {
        let engine = Arc::new(MemEngine::new());
        let registry = Arc::new(PoolRegistry::new(fnv1a_lookup, 3));
        let transport: Arc<dyn PoolTransport> = Arc::new(crate::transport::LoopbackTransport::new());
        let body = encode_map(&[]);

        let client = Arc::new(RecordingClient::new());
        let job = InsertJob::new(9, client.clone(), engine.clone(), JobFlags::empty(), "node-a", 3);
        let precision = TimePrecision::unbounded_seconds();
        let mut buffers = job.take_buffers().await;
        let n = assign(
            &body,
            &DecodeContext {
                own_pool: PoolId(0),
                registry: &registry,
                engine: engine.as_ref(),
                precision: &precision,
                error_bus: job.error_bus(),
            },
            &mut buffers,
        )
        .unwrap();
        assert_eq!(n, 0);
        job.set_npoints(n);
        job.restore_buffers_for_test(buffers);

        let dispatcher = Dispatcher::new(PoolId(0), engine.clone(), registry, None, transport, Duration::from_millis(200));
        dispatcher.dispatch(job.clone()).await.unwrap();

        assert_eq!(engine.series_count(), 0);
        assert_eq!(
            client.responses(),
            vec![(9, InsertResponse::Success { npoints: 0 })]
        );
        assert_eq!(engine.total_points(), 0);
    }
}
