//! `memlog` is the segment-management core of an in-memory
//! log-structured key-value master. The master's authoritative state
//! lives in a single append-only log sliced into fixed-size segments,
//! each built from pooled seglets; this crate owns the lifecycle of
//! every one of those segments.
//!
//! The [`SegmentManager`] allocates head segments for the log and
//! survivor segments for the cleaner, stamps each with a monotonic
//! identifier and a self-describing header, writes a [`LogDigest`]
//! into every new head enumerating the segments currently in the log,
//! hands each segment to the off-box replication layer behind the
//! [`ReplicaManager`] trait, and reclaims memory only once a cleaned
//! segment has left the digest and every RPC that could reference it
//! has drained (tracked by the [`EpochTracker`]).
//!
//! Recovery replay, tablet placement, and the network transport live
//! elsewhere; they interact with this crate only through the replica
//! and epoch seams and the entry read-back on [`LogSegment`].
#![deny(missing_docs)]
#![deny(future_incompatible)]
#![deny(nonstandard_style)]

mod config;
mod constants;
mod digest;
mod ds;
mod epoch;
mod manager;
mod map;
mod metrics;
mod replica;
mod result;
mod seglet;
mod segment;

use std::sync::Arc;

use log::{debug, info, trace};

use self::ds::{SlotLinks, SlotList};
use self::map::FastMap8;

pub use self::config::{Config, ConfigBuilder};
pub use self::constants::{
    EMERGENCY_HEAD_RESERVE, ENTRY_HEADER_LEN, INVALID_SEGMENT_ID,
};
pub use self::digest::LogDigest;
pub use self::epoch::{EpochGuard, EpochTracker};
pub use self::manager::{SegmentManager, SegmentState};
pub use self::metrics::{Metrics, M};
pub use self::replica::{
    Loopback, ReplicaEvent, ReplicaManager, ReplicatedSegment,
};
pub use self::result::{Error, Result};
pub use self::seglet::SegletAllocator;
pub use self::segment::{Entry, EntryKind, LogSegment, SegmentHeader};

/// A segment identifier: unique for the life of a segment manager and
/// strictly increasing with allocation order.
pub type SegmentId = u64;

/// Index into the manager's fixed-size segment table; the stable
/// local identity of a segment while it exists.
pub type Slot = usize;

/// A monotonic RPC epoch. Segments record the epoch they were cleaned
/// under, and are reclaimed only once every outstanding RPC belongs
/// to a later epoch.
pub type Epoch = u64;

/// Identifier of the log a master owns; stamped into segment headers
/// so replicas can be attributed on backups.
pub type LogId = u64;

pub(crate) fn crc32(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(buf);
    hasher.finalize()
}
