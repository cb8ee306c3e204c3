//! The replica/fifo subsystem seam.
//!
//! A replica is a peer server within the same pool that must receive a
//! durable copy of every local write. The subsystem itself (its durable
//! queue, its own sync protocol) is external; this crate only needs the
//! contract the Dispatcher and the LocalApply test variant call through.

use cluster_core::{JobFlags, SeriesName, ServerId};

/// The tag a local-apply packet carries, mirroring the job flags that
/// decided which LocalApply variant the receiver should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTag {
    Plain,
    Test,
    Tested,
}

/// A packet destined for the replica's durable queue or for this node's own
/// LocalApply.
#[derive(Debug, Clone)]
pub struct LocalApplyPacket {
    pub tag: LocalTag,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicaError {
    #[error("replica enqueue failed")]
    EnqueueFailed,
}

/// The replica contract: `initsync_idle`/`enqueue`/`filter` map 1:1 onto
/// `replicate.enqueue`/`replicate.filter` from the wire contract; `server_id`
/// /`own_server_id` back the test variant's "does the replica already cover
/// this series" check.
pub trait Replica: Send + Sync {
    /// True when the replica isn't in the middle of its own initial sync —
    /// i.e. it's safe to hand it the job's buffer unfiltered.
    fn initsync_idle(&self) -> bool;

    fn enqueue(&self, pkt: LocalApplyPacket) -> Result<(), ReplicaError>;

    /// Reduce `body` to whatever the replica still needs while it's mid
    /// initsync. Returns `None` if nothing in `body` is relevant.
    fn filter(&self, body: &[u8], flags: JobFlags) -> Option<LocalApplyPacket>;

    fn server_id(&self, name: &SeriesName) -> ServerId;

    fn own_server_id(&self) -> ServerId;
}

/// A `Replica` test double that always reports itself idle and accepts
/// every enqueue, so the test variant's "replica exists and owns this
/// series" branch can be exercised without a durable queue behind it.
pub struct RecordingReplica {
    idle: std::sync::atomic::AtomicBool,
    own_server: ServerId,
}

impl RecordingReplica {
    pub fn new(own_server: ServerId) -> Self {
        RecordingReplica {
            idle: std::sync::atomic::AtomicBool::new(true),
            own_server,
        }
    }
}

impl Replica for RecordingReplica {
    fn initsync_idle(&self) -> bool {
        self.idle.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn enqueue(&self, _pkt: LocalApplyPacket) -> Result<(), ReplicaError> {
        Ok(())
    }

    fn filter(&self, body: &[u8], flags: JobFlags) -> Option<LocalApplyPacket> {
        let tag = if flags.contains(JobFlags::TEST) {
            LocalTag::Test
        } else if flags.contains(JobFlags::TESTED) {
            LocalTag::Tested
        } else {
            LocalTag::Plain
        };
        Some(LocalApplyPacket {
            tag,
            body: body.to_vec(),
        })
    }

    fn server_id(&self, _name: &SeriesName) -> ServerId {
        // The test double has no notion of which server within the pool
        // owns which series; callers that need that distinction configure
        // it with `ServerAssignedReplica` instead.
        self.own_server
    }

    fn own_server_id(&self) -> ServerId {
        self.own_server
    }
}

/// A `Replica` test double that maps specific series names to specific
/// server ids, for exercising the test variant's "replica already covers
/// this series on a different server" skip path.
pub struct ServerAssignedReplica {
    own_server: ServerId,
    assignments: std::collections::HashMap<SeriesName, ServerId>,
    idle: std::sync::atomic::AtomicBool,
}

impl ServerAssignedReplica {
    pub fn new(own_server: ServerId) -> Self {
        ServerAssignedReplica {
            own_server,
            assignments: std::collections::HashMap::new(),
            idle: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn assign(mut self, name: SeriesName, server: ServerId) -> Self {
        self.assignments.insert(name, server);
        self
    }
}

impl Replica for ServerAssignedReplica {
    fn initsync_idle(&self) -> bool {
        self.idle.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn enqueue(&self, _pkt: LocalApplyPacket) -> Result<(), ReplicaError> {
        Ok(())
    }

    fn filter(&self, body: &[u8], _flags: JobFlags) -> Option<LocalApplyPacket> {
        Some(LocalApplyPacket {
            tag: LocalTag::Plain,
            body: body.to_vec(),
        })
    }

    fn server_id(&self, name: &SeriesName) -> ServerId {
        self.assignments.get(name).copied().unwrap_or(self.own_server)
    }

    fn own_server_id(&self) -> ServerId {
        self.own_server
    }
}
