use std::fmt::{self, Debug};
use std::mem;
use std::sync::atomic::{
    AtomicU64,
    Ordering::{Acquire, Release},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::*;

/// The types of entry that may be appended to a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// Canary for zeroed or torn space; never written deliberately.
    Corrupted = 0,
    /// The segment's self-describing header, always the first entry.
    SegHeader = 1,
    /// The set of segment ids in the log when a new head was opened.
    LogDigest = 2,
    /// A live object appended by the log.
    Object = 3,
    /// A tombstone recording an object's deletion.
    Tombstone = 4,
}

impl From<u8> for EntryKind {
    fn from(byte: u8) -> EntryKind {
        use EntryKind::*;
        match byte {
            1 => SegHeader,
            2 => LogDigest,
            3 => Object,
            4 => Tombstone,
            other => {
                debug!("encountered unexpected entry kind byte {}", other);
                Corrupted
            }
        }
    }
}

/// The first entry of every segment: enough for recovery to identify
/// the segment and totally order cleaner output against old heads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Identifier of the log this segment belongs to.
    pub log_id: LogId,
    /// The segment's own identifier.
    pub segment_id: SegmentId,
    /// Full segment size in bytes at the time of writing.
    pub segment_size: u32,
    /// For survivor segments, the id of the head when the cleaning
    /// pass began; `INVALID_SEGMENT_ID` for head segments.
    pub head_id_during_cleaning: SegmentId,
}

impl SegmentHeader {
    /// Serialize for appending as a `SegHeader` entry.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("segment header serialization cannot fail")
    }

    /// Deserialize a `SegHeader` entry payload.
    pub fn decode(buf: &[u8]) -> Result<SegmentHeader> {
        bincode::deserialize(buf).map_err(|e| {
            Error::Corruption(format!("unreadable segment header: {}", e))
        })
    }
}

/// One entry read back out of a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// What the payload is.
    pub kind: EntryKind,
    /// The payload bytes, crc-verified.
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct SegmentInner {
    seglets: Vec<Box<[u8]>>,
    appended: usize,
    appends_disabled: bool,
}

impl SegmentInner {
    fn write(&mut self, seglet_size: usize, at: usize, buf: &[u8]) {
        let mut off = at;
        let mut src = buf;
        while !src.is_empty() {
            let idx = off / seglet_size;
            let within = off % seglet_size;
            let n = (seglet_size - within).min(src.len());
            self.seglets[idx][within..within + n].copy_from_slice(&src[..n]);
            off += n;
            src = &src[n..];
        }
    }

    fn read(&self, seglet_size: usize, at: usize, out: &mut [u8]) {
        let mut off = at;
        let mut dst = &mut out[..];
        while !dst.is_empty() {
            let idx = off / seglet_size;
            let within = off % seglet_size;
            let n = (seglet_size - within).min(dst.len());
            dst[..n].copy_from_slice(&self.seglets[idx][within..within + n]);
            off += n;
            dst = &mut dst[n..];
        }
    }
}

/// A single in-memory log segment: an identifier, a slot in the
/// manager's table, and an appendable buffer built from pooled
/// seglets. The segment manager owns the lifecycle; the log and the
/// cleaner hold `Arc` handles while they work with one.
pub struct LogSegment {
    /// Identifier, unique for the life of the segment manager and
    /// strictly increasing with allocation order.
    pub id: SegmentId,
    /// The slot this segment occupies while it exists.
    pub slot: Slot,
    /// True for heads drawn from the emergency reserve. Emergency
    /// heads are made immutable right after their header and digest
    /// are written, and are reclaimed without cleaning.
    pub is_emergency_head: bool,
    cleaned_epoch: AtomicU64,
    allocator: Arc<SegletAllocator>,
    inner: Mutex<SegmentInner>,
    replicated: Mutex<Option<Arc<dyn ReplicatedSegment>>>,
}

impl Debug for LogSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSegment")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("is_emergency_head", &self.is_emergency_head)
            .field("appended", &(self.appended_len()))
            .finish()
    }
}

impl LogSegment {
    /// Construct a segment, drawing its first seglet from the pool.
    /// Returns `None` if the pool is dry.
    pub(crate) fn new(
        allocator: &Arc<SegletAllocator>,
        id: SegmentId,
        slot: Slot,
        is_emergency_head: bool,
    ) -> Option<LogSegment> {
        let first = allocator.alloc_seglet()?;
        Some(LogSegment {
            id,
            slot,
            is_emergency_head,
            cleaned_epoch: AtomicU64::new(0),
            allocator: Arc::clone(allocator),
            inner: Mutex::new(SegmentInner {
                seglets: vec![first],
                appended: 0,
                appends_disabled: false,
            }),
            replicated: Mutex::new(None),
        })
    }

    /// Append one entry, growing the segment seglet by seglet as
    /// needed. Returns false if appends are disabled, the entry would
    /// not fit in a full segment, or the seglet pool is dry.
    pub fn append(&self, kind: EntryKind, payload: &[u8]) -> bool {
        assert!(payload.len() <= u32::max_value() as usize);
        assert_ne!(kind, EntryKind::Corrupted);

        let seglet_size = self.allocator.seglet_size();
        let mut inner = self.inner.lock();

        if inner.appends_disabled {
            trace!("append to immutable segment {} rejected", self.id);
            return false;
        }

        let needed = ENTRY_HEADER_LEN + payload.len();
        if inner.appended + needed > self.allocator.segment_size() {
            return false;
        }

        while inner.seglets.len() * seglet_size < inner.appended + needed {
            match self.allocator.alloc_seglet() {
                Some(seglet) => inner.seglets.push(seglet),
                None => {
                    debug!(
                        "segment {} could not grow: seglet pool is dry",
                        self.id
                    );
                    return false;
                }
            }
        }

        let mut frame = [0_u8; ENTRY_HEADER_LEN];
        frame[0] = kind as u8;
        frame[1..5].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        frame[5..9].copy_from_slice(&(crc32(payload) ^ 0xFFFF_FFFF).to_le_bytes());

        let at = inner.appended;
        inner.write(seglet_size, at, &frame);
        inner.write(seglet_size, at + ENTRY_HEADER_LEN, payload);
        inner.appended += needed;

        trace!(
            "appended {:?} entry of {} bytes to segment {} at offset {}",
            kind,
            payload.len(),
            self.id,
            at
        );

        true
    }

    /// Permanently reject further appends. Applied to emergency heads
    /// once their header and digest are in place.
    pub fn disable_appends(&self) {
        self.inner.lock().appends_disabled = true;
    }

    /// Number of entry bytes appended so far, framing included.
    pub fn appended_len(&self) -> u32 {
        self.inner.lock().appended as u32
    }

    /// Number of seglets currently backing this segment.
    pub fn seglets_allocated(&self) -> u32 {
        self.inner.lock().seglets.len() as u32
    }

    /// Decode every entry appended so far, validating frame checksums.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        let seglet_size = self.allocator.seglet_size();
        let inner = self.inner.lock();

        let mut out = vec![];
        let mut off = 0;
        while off < inner.appended {
            if inner.appended - off < ENTRY_HEADER_LEN {
                return Err(Error::Corruption(format!(
                    "truncated entry frame at offset {} of segment {}",
                    off, self.id
                )));
            }

            let mut frame = [0_u8; ENTRY_HEADER_LEN];
            inner.read(seglet_size, off, &mut frame);

            let kind = EntryKind::from(frame[0]);
            let len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]])
                as usize;
            let crc = u32::from_le_bytes([frame[5], frame[6], frame[7], frame[8]])
                ^ 0xFFFF_FFFF;

            if kind == EntryKind::Corrupted
                || inner.appended - off - ENTRY_HEADER_LEN < len
            {
                return Err(Error::Corruption(format!(
                    "invalid entry frame at offset {} of segment {}",
                    off, self.id
                )));
            }

            let mut data = vec![0_u8; len];
            inner.read(seglet_size, off + ENTRY_HEADER_LEN, &mut data);

            if crc32(&data) != crc {
                return Err(Error::Corruption(format!(
                    "entry checksum mismatch at offset {} of segment {}",
                    off, self.id
                )));
            }

            out.push(Entry { kind, data });
            off += ENTRY_HEADER_LEN + len;
        }

        Ok(out)
    }

    /// The RPC epoch recorded when this segment was marked freeable.
    pub fn cleaned_epoch(&self) -> Epoch {
        self.cleaned_epoch.load(Acquire)
    }

    pub(crate) fn set_cleaned_epoch(&self, epoch: Epoch) {
        self.cleaned_epoch.store(epoch, Release);
    }

    /// Handle to this segment's replicated twin, once the replica
    /// manager has produced one.
    pub fn replicated_segment(&self) -> Option<Arc<dyn ReplicatedSegment>> {
        self.replicated.lock().clone()
    }

    pub(crate) fn set_replicated_segment(
        &self,
        replicated: Arc<dyn ReplicatedSegment>,
    ) {
        *self.replicated.lock() = Some(replicated);
    }
}

impl Drop for LogSegment {
    fn drop(&mut self) {
        let seglets = mem::replace(&mut self.inner.get_mut().seglets, vec![]);
        trace!(
            "segment {} returning {} seglets to the pool",
            self.id,
            seglets.len()
        );
        self.allocator.release(seglets);
    }
}
