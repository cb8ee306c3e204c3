//! The insert job: the unit of work that survives from packet arrival
//! through the async fan-out to the single client response.
//!
//! An `InsertJob` is always wrapped in `Arc`; the reference count modeled
//! here is a separate, explicit pending-task counter (see
//! [`InsertJob::begin_task`]/[`InsertJob::end_task`]), not `Arc`'s own
//! strong count — the job must run its completion ritual exactly once, at
//! the moment the *last posted async task* finishes, which is a distinct
//! event from the last `Arc` clone being dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cluster_core::{ErrorBus, JobFlags};
use tokio::sync::Mutex as AsyncMutex;

use crate::repacker::PoolBuffer;
use crate::storage::Engine;

/// The final, client-facing outcome of an insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertResponse {
    Success { npoints: usize },
    /// A peer pool failed to ack; `message` names the first such peer.
    Error { message: String },
    /// The error bus tripped during decode or apply.
    Critical { node: String },
}

impl InsertResponse {
    /// Encodes the response as the single-key TBF map the wire contract
    /// specifies: `{"success_msg": ...}` or `{"error_msg": ...}`.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut w = wire::Writer::new();
        w.map_open();
        match self {
            InsertResponse::Success { npoints } => {
                w.raw(b"success_msg");
                w.raw(format!("Inserted {npoints} point(s) successfully.").as_bytes());
            }
            InsertResponse::Error { message } => {
                w.raw(b"error_msg");
                w.raw(message.as_bytes());
            }
            InsertResponse::Critical { node } => {
                w.raw(b"error_msg");
                w.raw(format!("Critical error occurred on '{node}'").as_bytes());
            }
        }
        w.map_close();
        w.end();
        w.into_bytes()
    }
}

/// The client connection an insert job ultimately replies to.
///
/// `respond` is understood to perform the "unlock the client" half of the
/// design notes' unlock-then-free ritual; the "free the job" half happens
/// naturally once the caller's last `Arc<InsertJob>` is dropped after
/// [`InsertJob::end_task`] returns `true`.
pub trait ClientHandle: Send + Sync {
    fn respond(&self, request_id: u64, response: InsertResponse);
}

/// A [`ClientHandle`] test double that records every response it receives.
#[derive(Default)]
pub struct RecordingClient {
    responses: Mutex<Vec<(u64, InsertResponse)>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        RecordingClient::default()
    }

    pub fn responses(&self) -> Vec<(u64, InsertResponse)> {
        self.responses.lock().expect("client mutex poisoned").clone()
    }
}

impl ClientHandle for RecordingClient {
    fn respond(&self, request_id: u64, response: InsertResponse) {
        self.responses
            .lock()
            .expect("client mutex poisoned")
            .push((request_id, response));
    }
}

/// Allocated once per client insert request. `per_pool_buffer` is sized to
/// the pool count at creation time and never resized, even if the live pool
/// count changes mid-flight under a concurrent reindex.
pub struct InsertJob {
    pub request_id: u64,
    pub flags: JobFlags,
    pub node_name: String,
    client: Arc<dyn ClientHandle>,
    /// Held only to credit the database's cumulative point counter once the
    /// job resolves successfully; never consulted for decode/apply itself
    /// (that happens through the `DecodeContext`/`Dispatcher` engine
    /// references, which may be a different handle to the same engine).
    engine: Arc<dyn Engine>,
    error_bus: ErrorBus,
    npoints: AtomicUsize,
    peer_errors: Mutex<Vec<String>>,
    pending: AtomicUsize,
    buffers: AsyncMutex<Option<Vec<PoolBuffer>>>,
}

impl InsertJob {
    pub fn new(
        request_id: u64,
        client: Arc<dyn ClientHandle>,
        engine: Arc<dyn Engine>,
        flags: JobFlags,
        node_name: impl Into<String>,
        pool_count: u16,
    ) -> Arc<Self> {
        Arc::new(InsertJob {
            request_id,
            flags,
            node_name: node_name.into(),
            client,
            engine,
            error_bus: ErrorBus::new(),
            npoints: AtomicUsize::new(0),
            peer_errors: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            buffers: AsyncMutex::new(Some((0..pool_count).map(|_| PoolBuffer::new()).collect())),
        })
    }

    pub fn error_bus(&self) -> &ErrorBus {
        &self.error_bus
    }

    pub fn set_npoints(&self, npoints: usize) {
        self.npoints.store(npoints, Ordering::SeqCst);
    }

    pub fn record_peer_failure(&self, server_name: impl Into<String>) {
        self.peer_errors
            .lock()
            .expect("job mutex poisoned")
            .push(server_name.into());
    }

    /// Locks the buffer slot for the Decoder/Repacker stage to fill in
    /// place, before the Dispatcher later takes ownership with
    /// [`InsertJob::take_buffers`]. Panics if the buffers were already
    /// taken.
    pub async fn buffers_mut(&self) -> tokio::sync::MappedMutexGuard<'_, Vec<PoolBuffer>> {
        tokio::sync::MutexGuard::map(self.buffers.lock().await, |slot| {
            slot.as_mut().expect("insert job buffers already taken")
        })
    }

    /// Takes the job's per-pool buffers, leaving `None` behind. Panics if
    /// called more than once — the buffers are owned exclusively by
    /// whichever stage (Decoder/Repacker, then Dispatcher) currently holds
    /// them.
    pub async fn take_buffers(&self) -> Vec<PoolBuffer> {
        self.buffers
            .lock()
            .await
            .take()
            .expect("insert job buffers already taken")
    }

    /// Test-only: re-seeds the buffer slot after a scratch decode pass, in
    /// place of what a full pipeline would have the repack stage hand
    /// straight to the dispatcher.
    #[cfg(test)]
    pub(crate) fn restore_buffers_for_test(&self, buffers: Vec<PoolBuffer>) {
        let mut guard = self
            .buffers
            .try_lock()
            .expect("insert job buffers must not be contended in tests");
        *guard = Some(buffers);
    }

    /// Registers one more in-flight async task against this job. Call once
    /// per task posted (the dispatch task itself, and the forward task the
    /// test variant may post afterward).
    pub fn begin_task(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks one posted task complete. Returns `true` exactly once, for the
    /// call that observes the pending count drop to zero — the caller that
    /// receives `true` is the one that ran the job to completion and must
    /// not touch it again afterward.
    pub fn end_task(&self) -> bool {
        let prev = self.pending.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.finish();
            true
        } else {
            false
        }
    }

    fn finish(&self) {
        let response = if self.error_bus.raised() {
            InsertResponse::Critical {
                node: self.node_name.clone(),
            }
        } else {
            let errors = self.peer_errors.lock().expect("job mutex poisoned");
            match errors.first() {
                Some(first) => InsertResponse::Error {
                    message: format!("failed to reach pool server '{first}'"),
                },
                None => {
                    let npoints = self.npoints.load(Ordering::SeqCst);
                    self.engine.add_points(npoints as u64);
                    InsertResponse::Success { npoints }
                }
            }
        };
        self.client.respond(self.request_id, response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemEngine;

    #[test]
    fn success_response_names_the_point_count() {
        let r = InsertResponse::Success { npoints: 3 };
        let bytes = r.to_wire();
        let mut reader = wire::Reader::new(&bytes);
        assert_eq!(reader.next_token().unwrap(), wire::Token::MapOpen);
        assert_eq!(reader.next_token().unwrap(), wire::Token::Raw(b"success_msg"));
        assert_eq!(
            reader.next_token().unwrap(),
            wire::Token::Raw(b"Inserted 3 point(s) successfully.")
        );
    }

    #[tokio::test]
    async fn end_task_fires_completion_exactly_once_after_two_begins() {
        let client = Arc::new(RecordingClient::new());
        let engine = Arc::new(MemEngine::new());
        let job = InsertJob::new(7, client.clone(), engine.clone(), JobFlags::empty(), "node-a", 1);
        job.set_npoints(5);
        job.begin_task();
        job.begin_task();
        assert!(!job.end_task());
        assert!(client.responses().is_empty());
        assert!(job.end_task());
        let responses = client.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0], (7, InsertResponse::Success { npoints: 5 }));
        assert_eq!(engine.total_points(), 5);
    }

    #[tokio::test]
    async fn critical_error_bus_wins_over_peer_errors() {
        let client = Arc::new(RecordingClient::new());
        let engine = Arc::new(MemEngine::new());
        let job = InsertJob::new(1, client.clone(), engine, JobFlags::empty(), "node-a", 1);
        job.record_peer_failure("pool-1");
        job.error_bus().raise();
        job.begin_task();
        job.end_task();
        let responses = client.responses();
        assert_eq!(
            responses[0],
            (
                1,
                InsertResponse::Critical {
                    node: "node-a".to_string()
                }
            )
        );
    }

    #[tokio::test]
    async fn buffers_can_only_be_taken_once() {
        let client = Arc::new(RecordingClient::new());
        let engine = Arc::new(MemEngine::new());
        let job = InsertJob::new(1, client, engine, JobFlags::empty(), "node-a", 3);
        let buffers = job.take_buffers().await;
        assert_eq!(buffers.len(), 3);
    }
}
