use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use super::*;

/// The RPC-epoch oracle. The epoch is a process-wide monotonic
/// counter; every RPC-serving thread registers the epoch it entered
/// under, and a segment marked freeable at epoch `e` may only be
/// destroyed once every outstanding RPC belongs to an epoch greater
/// than `e`, at which point no in-flight request can still hold a
/// reference into the segment's memory.
#[derive(Debug, Default)]
pub struct EpochTracker {
    current: CachePadded<AtomicU64>,
    outstanding: Mutex<BTreeMap<Epoch, usize>>,
}

impl EpochTracker {
    /// Create a tracker with the epoch at zero and nothing
    /// outstanding.
    pub fn new() -> EpochTracker {
        EpochTracker::default()
    }

    /// The current epoch.
    pub fn current_epoch(&self) -> Epoch {
        self.current.load(SeqCst)
    }

    /// Advance the epoch, returning the post-increment value.
    pub fn increment_current_epoch(&self) -> Epoch {
        let after = self.current.fetch_add(1, SeqCst) + 1;
        trace!("rpc epoch advanced to {}", after);
        after
    }

    /// The earliest epoch any in-flight RPC could still belong to, or
    /// `u64::MAX` when nothing is outstanding.
    pub fn earliest_outstanding_epoch(&self) -> Epoch {
        self.outstanding
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(u64::max_value())
    }

    /// Register an in-flight RPC under the current epoch. The epoch
    /// stays outstanding until the returned guard is dropped.
    pub fn enter(&self) -> EpochGuard<'_> {
        let epoch = self.current_epoch();
        *self.outstanding.lock().entry(epoch).or_insert(0) += 1;
        EpochGuard { tracker: self, epoch }
    }
}

/// RAII registration of one in-flight RPC. Dropping it retires the
/// registration and may unblock segment reclamation.
#[derive(Debug)]
pub struct EpochGuard<'a> {
    tracker: &'a EpochTracker,
    epoch: Epoch,
}

impl<'a> EpochGuard<'a> {
    /// The epoch this guard pins.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }
}

impl<'a> Drop for EpochGuard<'a> {
    fn drop(&mut self) {
        let mut outstanding = self.tracker.outstanding.lock();
        let count = outstanding
            .get_mut(&self.epoch)
            .expect("epoch guard retired twice");
        *count -= 1;
        if *count == 0 {
            outstanding.remove(&self.epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_outstanding_reports_the_sentinel() {
        let tracker = Arc::new(EpochTracker::new());
        assert_eq!(tracker.current_epoch(), 0);
        assert_eq!(tracker.earliest_outstanding_epoch(), u64::max_value());
    }

    #[test]
    fn increments_are_post_values() {
        let tracker = EpochTracker::new();
        assert_eq!(tracker.increment_current_epoch(), 1);
        assert_eq!(tracker.increment_current_epoch(), 2);
        assert_eq!(tracker.current_epoch(), 2);
    }

    #[test]
    fn guards_pin_their_epoch() {
        let tracker = Arc::new(EpochTracker::new());

        let old = tracker.enter();
        tracker.increment_current_epoch();
        let new = tracker.enter();

        assert_eq!(tracker.earliest_outstanding_epoch(), 0);
        drop(old);
        assert_eq!(tracker.earliest_outstanding_epoch(), 1);
        drop(new);
        assert_eq!(tracker.earliest_outstanding_epoch(), u64::max_value());
    }

    #[test]
    fn overlapping_guards_share_an_epoch() {
        let tracker = Arc::new(EpochTracker::new());
        let a = tracker.enter();
        let b = tracker.enter();
        assert_eq!(a.epoch(), b.epoch());
        drop(a);
        assert_eq!(tracker.earliest_outstanding_epoch(), 0);
        drop(b);
        assert_eq!(tracker.earliest_outstanding_epoch(), u64::max_value());
    }
}
