use serde::{Deserialize, Serialize};

use super::*;

/// The set of segment ids considered part of the log at the instant a
/// new head is opened. A digest is appended to every new head right
/// after its header; on recovery the newest digest found *replaces*
/// any older one, it never amends it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogDigest {
    segment_ids: Vec<SegmentId>,
}

impl LogDigest {
    /// An empty digest.
    pub fn new() -> LogDigest {
        LogDigest::default()
    }

    /// Add one segment id. Ids are recorded in insertion order; the
    /// composition rule never produces duplicates.
    pub fn add_segment_id(&mut self, id: SegmentId) {
        debug_assert!(!self.segment_ids.contains(&id));
        self.segment_ids.push(id);
    }

    /// The recorded ids.
    pub fn segment_ids(&self) -> &[SegmentId] {
        &self.segment_ids
    }

    /// Number of ids recorded.
    pub fn len(&self) -> usize {
        self.segment_ids.len()
    }

    /// True if no ids have been recorded.
    pub fn is_empty(&self) -> bool {
        self.segment_ids.is_empty()
    }

    /// Serialize for appending as a `LogDigest` entry.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("digest serialization cannot fail")
    }

    /// Deserialize a `LogDigest` entry payload.
    pub fn decode(buf: &[u8]) -> Result<LogDigest> {
        bincode::deserialize(buf)
            .map_err(|e| Error::Corruption(format!("unreadable log digest: {}", e)))
    }
}
