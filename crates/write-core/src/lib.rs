//! The write-path routing and ingestion core for a clustered time-series
//! database: decode an insert request, route each series to its pool,
//! repack per-pool buffers, fan them out to peers, apply the local buffer
//! under the storage engine's lock discipline, and resolve the client's
//! request exactly once.
//!
//! [`cluster_core`] carries the shared vocabulary (series names, values,
//! pool/server ids, the error taxonomy, the error bus); this crate wires
//! that vocabulary into the six pipeline stages described in the module
//! docs below, in their dependency order: [`local_apply`] and [`router`]
//! sit on top of [`storage`]; [`decoder`] drives both [`router`] and
//! [`repacker`]; [`dispatcher`] drives [`local_apply`], [`replica`], and
//! [`transport`]; [`job`] is the unit of work threaded through all of them.

pub mod decoder;
pub mod dispatcher;
pub mod job;
pub mod local_apply;
pub mod pool_registry;
pub mod repacker;
pub mod replica;
pub mod router;
pub mod storage;
pub mod transport;

pub use decoder::{assign, DecodeContext};
pub use dispatcher::Dispatcher;
pub use job::{ClientHandle, InsertJob, InsertResponse};
pub use local_apply::{apply_plain, apply_test, ForwardFragment, LocalApplyError};
pub use pool_registry::{HashFn, PoolRegistry};
pub use repacker::PoolBuffer;
pub use replica::{LocalApplyPacket, LocalTag, Replica, ReplicaError};
pub use router::route;
pub use storage::{Engine, EngineGuard, SeriesHandle};
pub use transport::{PeerAck, PeerPacket, PeerTag, PoolTransport, TransportError};
