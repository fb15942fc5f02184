use std::sync::atomic::AtomicUsize;

use crossbeam_utils::CachePadded;
use lazy_static::lazy_static;

lazy_static! {
    /// A metric collector for all segment managers running in this
    /// process.
    pub static ref M: Metrics = Metrics::default();
}

/// Counters describing segment lifecycle churn. Read them with
/// `Ordering::Relaxed`; they are advisory, not synchronizing.
#[derive(Default, Debug)]
pub struct Metrics {
    /// Normal head segments allocated.
    pub head_allocations: CachePadded<AtomicUsize>,
    /// Emergency head segments allocated.
    pub emergency_head_allocations: CachePadded<AtomicUsize>,
    /// Survivor segments handed to the cleaner.
    pub survivor_allocations: CachePadded<AtomicUsize>,
    /// Segments whose memory was returned to the seglet pool.
    pub segments_freed: CachePadded<AtomicUsize>,
    /// Completed cleaning passes.
    pub cleaning_passes: CachePadded<AtomicUsize>,
    /// Seglets consumed by survivor segments across all passes.
    pub cleaning_seglets_used: CachePadded<AtomicUsize>,
    /// Seglets released by cleaned segments across all passes.
    pub cleaning_seglets_freed: CachePadded<AtomicUsize>,
    /// Log digests composed and appended to new heads.
    pub digests_written: CachePadded<AtomicUsize>,
}
