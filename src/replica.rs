use std::fmt::Debug;
use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{Acquire, Release, SeqCst},
};

use parking_lot::Mutex;

use super::*;

/// Handle to a segment's off-box twin. Produced by a `ReplicaManager`
/// when a segment is opened, and driven by the segment manager as the
/// segment moves through its lifecycle.
pub trait ReplicatedSegment: Send + Sync + Debug {
    /// The id of the segment this replica mirrors.
    fn segment_id(&self) -> SegmentId;

    /// Mark the replica closed on the backups. Not itself a
    /// durability barrier; the following `sync` is.
    fn close(&self) -> Result<()>;

    /// Block until the first `appended_len` bytes of the segment have
    /// reached the required number of replicas.
    fn sync(&self, appended_len: u32) -> Result<()>;
}

/// The replication layer the segment manager coordinates with. Head
/// allocation is synchronous: `allocate_head` returns only once the
/// segment's initial bytes (header and digest) are durable on the
/// backups, which is what lets the manager close the previous head
/// afterwards without ever leaving zero open segments off-box.
pub trait ReplicaManager: Send + Sync + Debug {
    /// Called once at segment-manager construction with the total
    /// bytes of segment memory, so the transport can register the
    /// region for zero-copy transmission.
    fn register_memory(&self, total_bytes: u64);

    /// Open a replicated head segment, chained to the previous head's
    /// replica so backups can order replication. Synchronously
    /// replicates the bytes appended so far.
    fn allocate_head(
        &self,
        segment: &Arc<LogSegment>,
        prev: Option<&Arc<dyn ReplicatedSegment>>,
    ) -> Result<Arc<dyn ReplicatedSegment>>;

    /// Open a replicated non-head (survivor) segment.
    fn allocate_non_head(
        &self,
        segment: &Arc<LogSegment>,
    ) -> Result<Arc<dyn ReplicatedSegment>>;
}

/// One observable action taken against the loopback replication
/// layer, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// A head replica was opened, chained to the given predecessor.
    OpenedHead {
        /// Segment id of the new head.
        id: SegmentId,
        /// Segment id of the previous head's replica, if any.
        prev: Option<SegmentId>,
    },
    /// A non-head (survivor) replica was opened.
    Opened {
        /// Segment id of the survivor.
        id: SegmentId,
    },
    /// A replica was closed.
    Closed {
        /// Segment id of the closed replica.
        id: SegmentId,
    },
    /// A replica was synced to the given appended length.
    Synced {
        /// Segment id of the synced replica.
        id: SegmentId,
        /// Appended length the durability claim covers.
        len: u32,
    },
}

/// A replica manager for masters configured with zero backups:
/// replication calls succeed immediately against in-process state.
/// It records every call in order, which is also what the tests use
/// to check replication-ordering guarantees after the fact.
#[derive(Debug, Default)]
pub struct Loopback {
    events: Arc<Mutex<Vec<ReplicaEvent>>>,
    registered_bytes: AtomicU64,
}

impl Loopback {
    /// Create a loopback replication layer.
    pub fn new() -> Loopback {
        Loopback::default()
    }

    /// Every replication call observed so far, in call order.
    pub fn events(&self) -> Vec<ReplicaEvent> {
        self.events.lock().clone()
    }

    /// The total segment-memory figure registered at construction.
    pub fn registered_bytes(&self) -> u64 {
        self.registered_bytes.load(Acquire)
    }
}

impl ReplicaManager for Loopback {
    fn register_memory(&self, total_bytes: u64) {
        debug!("registering {} bytes of segment memory", total_bytes);
        self.registered_bytes.store(total_bytes, Release);
    }

    fn allocate_head(
        &self,
        segment: &Arc<LogSegment>,
        prev: Option<&Arc<dyn ReplicatedSegment>>,
    ) -> Result<Arc<dyn ReplicatedSegment>> {
        let mut events = self.events.lock();
        events.push(ReplicaEvent::OpenedHead {
            id: segment.id,
            prev: prev.map(|p| p.segment_id()),
        });
        // With no backups the initial bytes are durable by definition;
        // record the claim so ordering is still observable.
        events.push(ReplicaEvent::Synced {
            id: segment.id,
            len: segment.appended_len(),
        });
        Ok(Arc::new(LoopbackSegment {
            id: segment.id,
            closed: AtomicBool::new(false),
            events: Arc::clone(&self.events),
        }))
    }

    fn allocate_non_head(
        &self,
        segment: &Arc<LogSegment>,
    ) -> Result<Arc<dyn ReplicatedSegment>> {
        self.events.lock().push(ReplicaEvent::Opened { id: segment.id });
        Ok(Arc::new(LoopbackSegment {
            id: segment.id,
            closed: AtomicBool::new(false),
            events: Arc::clone(&self.events),
        }))
    }
}

#[derive(Debug)]
struct LoopbackSegment {
    id: SegmentId,
    closed: AtomicBool,
    events: Arc<Mutex<Vec<ReplicaEvent>>>,
}

impl ReplicatedSegment for LoopbackSegment {
    fn segment_id(&self) -> SegmentId {
        self.id
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, SeqCst) {
            return Err(Error::ReportableBug(format!(
                "replica for segment {} closed twice",
                self.id
            )));
        }
        self.events.lock().push(ReplicaEvent::Closed { id: self.id });
        Ok(())
    }

    fn sync(&self, appended_len: u32) -> Result<()> {
        self.events.lock().push(ReplicaEvent::Synced {
            id: self.id,
            len: appended_len,
        });
        Ok(())
    }
}
