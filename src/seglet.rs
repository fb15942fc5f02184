use std::fmt::{self, Debug};

use parking_lot::Mutex;

use super::*;

/// A pool of fixed-size memory chunks (seglets) that segments are
/// built out of. A segment draws its first seglet at construction and
/// grows seglet by seglet as entries are appended, up to the full
/// segment size; everything goes back into the pool when the segment
/// is dropped.
///
/// Free capacity is reported in whole segments, since reserves and
/// admission decisions are made at segment granularity.
pub struct SegletAllocator {
    seglet_size: usize,
    segment_size: usize,
    seglets_per_segment: usize,
    total_bytes: u64,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl Debug for SegletAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegletAllocator")
            .field("seglet_size", &self.seglet_size)
            .field("segment_size", &self.segment_size)
            .field("free_seglets", &self.free_seglet_count())
            .finish()
    }
}

impl SegletAllocator {
    /// Create a pool holding `initial_segments` full segments' worth
    /// of seglets, sized according to the given configuration.
    pub fn new(config: &Config) -> Result<SegletAllocator> {
        if config.seglet_size == 0 || config.segment_size == 0 {
            return Err(Error::Unsupported(
                "seglet and segment sizes must be non-zero".to_owned(),
            ));
        }
        if config.seglet_size <= ENTRY_HEADER_LEN {
            return Err(Error::Unsupported(format!(
                "seglet size {} cannot hold a single entry frame",
                config.seglet_size
            )));
        }
        if config.segment_size % config.seglet_size != 0 {
            return Err(Error::Unsupported(format!(
                "segment size {} is not a multiple of seglet size {}",
                config.segment_size, config.seglet_size
            )));
        }

        let seglets_per_segment = config.segment_size / config.seglet_size;
        let total_seglets = config
            .initial_segments
            .checked_mul(seglets_per_segment)
            .ok_or_else(|| {
                Error::Unsupported("seglet pool size overflows".to_owned())
            })?;

        let free = (0..total_seglets)
            .map(|_| vec![0_u8; config.seglet_size].into_boxed_slice())
            .collect();

        debug!(
            "seglet pool holds {} seglets of {} bytes ({} segments)",
            total_seglets, config.seglet_size, config.initial_segments
        );

        Ok(SegletAllocator {
            seglet_size: config.seglet_size,
            segment_size: config.segment_size,
            seglets_per_segment,
            total_bytes: (total_seglets * config.seglet_size) as u64,
            free: Mutex::new(free),
        })
    }

    /// The size in bytes of each seglet.
    pub fn seglet_size(&self) -> usize {
        self.seglet_size
    }

    /// The size in bytes of each full segment.
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// How many seglets a full segment is composed of.
    pub fn seglets_per_segment(&self) -> usize {
        self.seglets_per_segment
    }

    /// Total bytes of memory backing the pool, free or not. This is
    /// the figure registered with the replication transport.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Number of seglets currently in the pool.
    pub fn free_seglet_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of whole segments that could be built from the pool
    /// right now.
    pub fn free_segment_count(&self) -> usize {
        self.free_seglet_count() / self.seglets_per_segment
    }

    /// Draw a single zeroed seglet from the pool.
    pub(crate) fn alloc_seglet(&self) -> Option<Box<[u8]>> {
        self.free.lock().pop()
    }

    /// Return seglets to the pool, zeroing them so that reused
    /// segments read back as entry-free.
    pub(crate) fn release(&self, seglets: Vec<Box<[u8]>>) {
        let mut free = self.free.lock();
        for mut seglet in seglets {
            for byte in seglet.iter_mut() {
                *byte = 0;
            }
            free.push(seglet);
        }
    }
}
