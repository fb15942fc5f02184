use std::sync::atomic::Ordering::Relaxed;

use parking_lot::Mutex;

use super::*;

/// The lifecycle state of a live segment. Each state has its own
/// intrusive list; a segment is always on exactly one of them, plus
/// the all-segments list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentState {
    /// The segment currently accepting appends from the log. At most
    /// one segment is ever in this state.
    Head,
    /// A survivor segment the cleaner is relocating live entries
    /// into. Not yet part of the log.
    CleaningInto,
    /// Survivor whose cleaning pass has completed; joins the log at
    /// the next digest write.
    CleanablePendingDigest,
    /// In the log, not yet handed to the cleaner as a candidate.
    NewlyCleanable,
    /// In the log and available for the cleaner to select.
    Cleanable,
    /// Cleaned; leaves the log at the next digest write, and then
    /// waits out references.
    FreeablePendingDigestAndReferences,
    /// Out of the log; waiting for the earliest outstanding RPC epoch
    /// to pass its cleaned epoch.
    FreeablePendingReferences,
}

use self::SegmentState::*;

impl SegmentState {
    pub(crate) const COUNT: usize = 7;

    fn idx(self) -> usize {
        match self {
            Head => 0,
            CleaningInto => 1,
            CleanablePendingDigest => 2,
            NewlyCleanable => 3,
            Cleanable => 4,
            FreeablePendingDigestAndReferences => 5,
            FreeablePendingReferences => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocKind {
    Head,
    EmergencyHead,
    Survivor,
}

#[derive(Debug)]
struct ManagerInner {
    segments: Vec<Option<Arc<LogSegment>>>,
    states: Vec<Option<SegmentState>>,
    free_slots: Vec<Slot>,
    next_segment_id: SegmentId,
    id_to_slot: FastMap8<SegmentId, Slot>,
    all: SlotList,
    all_links: Vec<SlotLinks>,
    by_state: [SlotList; SegmentState::COUNT],
    state_links: Vec<SlotLinks>,
    num_survivor_segments: usize,
    num_survivor_segments_alloced: usize,
    num_emergency_heads_alloced: usize,
    log_iterator_count: usize,
}

/// Owns the lifecycle of every segment on one master: allocates them,
/// stamps them with monotonic ids, tracks their state, hands each one
/// to the replication layer, and cooperates with the cleaner to
/// reclaim space.
///
/// A single mutex guards all lifecycle state, and is deliberately
/// held across the replica manager's synchronous calls during head
/// allocation: head turnover is a control-path event and the
/// invariants it maintains (digest membership above all) are worth
/// the serialization.
#[derive(Debug)]
pub struct SegmentManager {
    log_id: LogId,
    config: Config,
    allocator: Arc<SegletAllocator>,
    replica_manager: Arc<dyn ReplicaManager>,
    epochs: Arc<EpochTracker>,
    max_segments: usize,
    inner: Mutex<ManagerInner>,
}

impl SegmentManager {
    /// Construct a segment manager: builds the seglet pool described
    /// by `config`, registers its memory with the replication layer,
    /// and sizes the slot table to `free segments ×
    /// disk_expansion_factor`.
    pub fn start(
        log_id: LogId,
        config: Config,
        replica_manager: Arc<dyn ReplicaManager>,
        epochs: Arc<EpochTracker>,
    ) -> Result<SegmentManager> {
        if config.disk_expansion_factor < 1.0 {
            return Err(Error::Unsupported(format!(
                "disk expansion factor {} must be at least 1.0",
                config.disk_expansion_factor
            )));
        }

        let allocator = Arc::new(SegletAllocator::new(&config)?);

        let free = allocator.free_segment_count();
        if free < EMERGENCY_HEAD_RESERVE {
            return Err(Error::Unsupported(format!(
                "need at least {} segments of memory, got {}",
                EMERGENCY_HEAD_RESERVE, free
            )));
        }

        let max_segments =
            (free as f64 * config.disk_expansion_factor) as usize;
        assert!(max_segments >= free);

        replica_manager.register_memory(allocator.total_bytes());

        debug!(
            "segment manager for log {} starting with {} free segments, \
             {} slots",
            log_id, free, max_segments
        );

        Ok(SegmentManager {
            log_id,
            config,
            allocator,
            replica_manager,
            epochs,
            max_segments,
            inner: Mutex::new(ManagerInner {
                segments: vec![None; max_segments],
                states: vec![None; max_segments],
                free_slots: (0..max_segments).collect(),
                next_segment_id: 0,
                id_to_slot: FastMap8::default(),
                all: SlotList::default(),
                all_links: vec![SlotLinks::default(); max_segments],
                by_state: [SlotList::default(); SegmentState::COUNT],
                state_links: vec![SlotLinks::default(); max_segments],
                num_survivor_segments: 0,
                num_survivor_segments_alloced: 0,
                num_emergency_heads_alloced: 0,
                log_iterator_count: 0,
            }),
        })
    }

    /// Allocate a new head segment, handling the whole transition
    /// from the previous head: a header and log digest are appended
    /// and synchronously replicated before the previous head's
    /// replica is closed and synced, so backups always hold at least
    /// one open segment short of coordinated failure.
    ///
    /// Returns `Ok(None)` if memory is exhausted and `must_not_fail`
    /// is false; with `must_not_fail` the caller may instead receive
    /// an immutable emergency head. A replication error propagates
    /// and leaves the previous head in place.
    pub fn alloc_head(
        &self,
        must_not_fail: bool,
    ) -> Result<Option<Arc<LogSegment>>> {
        let mut inner = self.inner.lock();

        let prev_head = self
            .head_slot(&inner)
            .map(|slot| Arc::clone(inner.segments[slot].as_ref().unwrap()));

        let new_head = match self.alloc(&mut inner, AllocKind::Head) {
            Some(segment) => segment,
            None => {
                // Even when out of memory we may need an emergency
                // head, to survive replica failure or to let cleaning
                // free resources.
                let cleaning_blocked = !inner.by_state
                    [FreeablePendingDigestAndReferences.idx()]
                .is_empty();
                if must_not_fail || cleaning_blocked {
                    match self.alloc(&mut inner, AllocKind::EmergencyHead) {
                        Some(segment) => segment,
                        None => {
                            return Err(Error::ReportableBug(
                                "emergency head reserve exhausted".to_owned(),
                            ));
                        }
                    }
                } else {
                    return Ok(None);
                }
            }
        };

        self.write_header(&new_head, INVALID_SEGMENT_ID);

        // Snapshot the previous head's appended length before the new
        // head opens; racing appends must not widen the sync below.
        let prev_appended = prev_head.as_ref().map(|h| h.appended_len());
        let digest_prev = match prev_head {
            Some(ref h) if !h.is_emergency_head => Some(h.id),
            _ => None,
        };
        self.write_digest(&mut inner, &new_head, digest_prev);

        // An emergency head is immutable from here on, so it can be
        // reclaimed without cleaning once the next head exists.
        if new_head.is_emergency_head {
            new_head.disable_appends();
        }

        let prev_replicated =
            prev_head.as_ref().and_then(|h| h.replicated_segment());
        let replicated = self
            .replica_manager
            .allocate_head(&new_head, prev_replicated.as_ref())?;
        new_head.set_replicated_segment(replicated);

        // Close the previous head only now that the new head is
        // durable on backups.
        if let Some(prev) = prev_head {
            let replicated = prev
                .replicated_segment()
                .expect("head segment lost its replicated twin");
            replicated.close()?;
            replicated.sync(prev_appended.unwrap())?;

            if prev.is_emergency_head {
                self.free(&mut inner, prev.slot);
            } else {
                self.change_state(&mut inner, prev.slot, NewlyCleanable);
            }
        }

        Ok(Some(new_head))
    }

    /// Allocate a segment for the cleaner to write survivor data
    /// into, drawing from the survivor reserve. The header is stamped
    /// with the id of the head at the start of the cleaning pass,
    /// which totally orders survivors against pre-cleaning heads for
    /// replay. Returns `Ok(None)` if the reserve is exhausted.
    pub fn alloc_survivor(
        &self,
        head_id_during_cleaning: SegmentId,
    ) -> Result<Option<Arc<LogSegment>>> {
        let mut inner = self.inner.lock();

        let segment = match self.alloc(&mut inner, AllocKind::Survivor) {
            Some(segment) => segment,
            None => return Ok(None),
        };

        self.write_header(&segment, head_id_during_cleaning);

        let replicated = self.replica_manager.allocate_non_head(&segment)?;
        segment.set_replicated_segment(replicated);

        Ok(Some(segment))
    }

    /// Notification that a cleaning pass is done. Every survivor
    /// allocated since the previous pass moves toward log membership
    /// (pending the next digest), and every segment in `clean` is
    /// stamped with the closing RPC epoch and moves toward
    /// reclamation (pending the next digest, then references).
    pub fn cleaning_complete(&self, clean: &[Arc<LogSegment>]) {
        let mut inner = self.inner.lock();

        let mut seglets_used = 0;
        let mut seglets_freed = 0;

        // Survivors wait for the next head's digest before they are
        // part of the log.
        while let Some(slot) = inner.by_state[CleaningInto.idx()].front() {
            let seglets =
                inner.segments[slot].as_ref().unwrap().seglets_allocated();
            seglets_used += seglets;
            self.change_state(&mut inner, slot, CleanablePendingDigest);
        }

        // Record the last epoch any outstanding RPC could have been a
        // part of; cleaned segments may not be reclaimed until every
        // such RPC has drained.
        let epoch = self.epochs.increment_current_epoch() - 1;

        for segment in clean {
            debug_assert_eq!(inner.states[segment.slot], Some(Cleanable));
            seglets_freed += segment.seglets_allocated();
            segment.set_cleaned_epoch(epoch);
            self.change_state(
                &mut inner,
                segment.slot,
                FreeablePendingDigestAndReferences,
            );
        }

        info!(
            "cleaning used {} seglets to free {} seglets",
            seglets_used, seglets_freed
        );
        M.cleaning_passes.fetch_add(1, Relaxed);
        M.cleaning_seglets_used.fetch_add(seglets_used as usize, Relaxed);
        M.cleaning_seglets_freed.fetch_add(seglets_freed as usize, Relaxed);

        assert!(seglets_used <= seglets_freed);
    }

    /// Hand the cleaner every segment that became cleanable since the
    /// last call.
    pub fn cleanable_segments(&self, out: &mut Vec<Arc<LogSegment>>) {
        let mut inner = self.inner.lock();
        while let Some(slot) = inner.by_state[NewlyCleanable.idx()].front() {
            out.push(Arc::clone(inner.segments[slot].as_ref().unwrap()));
            self.change_state(&mut inner, slot, Cleanable);
        }
    }

    /// Grow the cleaner's segment reserve to `num_segments` total.
    /// The reserve may only grow (shrinking could underflow the
    /// outstanding count) and must leave the emergency-head reserve
    /// intact. Returns whether the new size was applied.
    pub fn increase_survivor_reserve(&self, num_segments: usize) -> bool {
        let mut inner = self.inner.lock();

        if num_segments < inner.num_survivor_segments {
            return false;
        }

        let free = self.allocator.free_segment_count();
        if num_segments > free.saturating_sub(EMERGENCY_HEAD_RESERVE) {
            return false;
        }

        debug!(
            "survivor reserve grown from {} to {} segments",
            inner.num_survivor_segments, num_segments
        );
        inner.num_survivor_segments = num_segments;
        true
    }

    /// Note that a log iterator now exists. While any iterator is
    /// alive, digest-time transitions are suppressed and no segment
    /// leaves `FreeablePendingReferences`, so iteration never misses
    /// a segment that was logically in the log when it started.
    pub fn log_iterator_created(&self) {
        let mut inner = self.inner.lock();
        inner.log_iterator_count += 1;
        trace!("log iterator count now {}", inner.log_iterator_count);
    }

    /// Note that a log iterator was destroyed.
    pub fn log_iterator_destroyed(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.log_iterator_count > 0);
        inner.log_iterator_count -= 1;
        trace!("log iterator count now {}", inner.log_iterator_count);
    }

    /// Collect every segment currently part of the log with id at
    /// least `min_id`, in no particular order. Only legal while a log
    /// iterator is registered; fails with `NoActiveIterator`
    /// otherwise.
    pub fn active_segments(
        &self,
        min_id: SegmentId,
        out: &mut Vec<Arc<LogSegment>>,
    ) -> Result<()> {
        let inner = self.inner.lock();

        if inner.log_iterator_count == 0 {
            return Err(Error::NoActiveIterator);
        }

        // The iterator gate keeps survivors out of the log and
        // cleaned segments unreclaimed, so what is presently linked
        // into these lists is exactly the log.
        let active = [
            NewlyCleanable,
            Cleanable,
            FreeablePendingDigestAndReferences,
        ];
        for state in &active {
            for slot in inner.by_state[state.idx()].iter(&inner.state_links) {
                let segment = inner.segments[slot].as_ref().unwrap();
                if segment.id >= min_id {
                    out.push(Arc::clone(segment));
                }
            }
        }

        if let Some(slot) = self.head_slot(&inner) {
            let head = inner.segments[slot].as_ref().unwrap();
            if head.id >= min_id {
                out.push(Arc::clone(head));
            }
        }

        Ok(())
    }

    /// The segment occupying `slot`. Fails with `InvalidSlot` if the
    /// slot is out of range or currently empty; callers must not hold
    /// on to slot numbers across a segment's reclamation.
    pub fn segment(&self, slot: Slot) -> Result<Arc<LogSegment>> {
        if slot >= self.max_segments {
            return Err(Error::InvalidSlot(slot));
        }
        let inner = self.inner.lock();
        inner.segments[slot].clone().ok_or(Error::InvalidSlot(slot))
    }

    /// The state of the segment in `slot`, if the slot is occupied.
    pub fn segment_state(&self, slot: Slot) -> Option<SegmentState> {
        if slot >= self.max_segments {
            return None;
        }
        self.inner.lock().states[slot]
    }

    /// Whether a segment with the given id currently exists. Used by
    /// tombstone garbage collection to learn when the segment a
    /// tombstone refers to is gone.
    pub fn contains_id(&self, id: SegmentId) -> bool {
        self.inner.lock().id_to_slot.contains_key(&id)
    }

    /// Total number of segments currently allocated.
    pub fn allocated_segment_count(&self) -> usize {
        self.inner.lock().all.len()
    }

    /// Number of whole segments the seglet pool could still produce.
    pub fn free_segment_count(&self) -> usize {
        let _inner = self.inner.lock();
        self.allocator.free_segment_count()
    }

    /// How many survivor segments the cleaner can still allocate
    /// before its reserve runs out.
    pub fn free_survivor_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.num_survivor_segments - inner.num_survivor_segments_alloced
    }

    /// The maximum number of segments that may ever exist at once.
    pub fn max_segment_count(&self) -> usize {
        self.max_segments
    }

    /// The size of each seglet in bytes.
    pub fn seglet_size(&self) -> usize {
        self.allocator.seglet_size()
    }

    /// The size of each full segment in bytes.
    pub fn segment_size(&self) -> usize {
        self.allocator.segment_size()
    }

    /// The seglet pool segments are built from. The log shares this
    /// with the manager when reading entries back out.
    pub fn allocator(&self) -> &Arc<SegletAllocator> {
        &self.allocator
    }

    /// Identifier of the log this manager serves.
    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    fn head_slot(&self, inner: &ManagerInner) -> Option<Slot> {
        let list = &inner.by_state[Head.idx()];
        debug_assert!(list.len() <= 1);
        list.front()
    }

    /// Append the self-describing header to a freshly allocated
    /// segment. Failure means allocation invariants are broken, which
    /// is unrecoverable.
    fn write_header(
        &self,
        segment: &LogSegment,
        head_id_during_cleaning: SegmentId,
    ) {
        let header = SegmentHeader {
            log_id: self.log_id,
            segment_id: segment.id,
            segment_size: self.allocator.segment_size() as u32,
            head_id_during_cleaning,
        };
        if !segment.append(EntryKind::SegHeader, &header.encode()) {
            panic!(
                "could not append header to freshly allocated segment {}",
                segment.id
            );
        }
    }

    /// Compose and append the log digest to a new head. Digest-time
    /// state transitions only happen when no log iterator is active;
    /// while one is, the freeable-pending set stays visible in the
    /// digest so iteration does not miss it.
    fn write_digest(
        &self,
        inner: &mut ManagerInner,
        new_head: &LogSegment,
        prev_head_id: Option<SegmentId>,
    ) {
        if inner.log_iterator_count == 0 {
            while let Some(slot) =
                inner.by_state[CleanablePendingDigest.idx()].front()
            {
                self.change_state(inner, slot, NewlyCleanable);
            }
        }

        let mut digest = LogDigest::new();
        for state in &[Cleanable, NewlyCleanable] {
            for slot in inner.by_state[state.idx()].iter(&inner.state_links) {
                digest
                    .add_segment_id(inner.segments[slot].as_ref().unwrap().id);
            }
        }

        if let Some(id) = prev_head_id {
            digest.add_segment_id(id);
        }
        digest.add_segment_id(new_head.id);

        if inner.log_iterator_count == 0 {
            while let Some(slot) = inner.by_state
                [FreeablePendingDigestAndReferences.idx()]
            .front()
            {
                self.change_state(inner, slot, FreeablePendingReferences);
            }
        } else {
            let freeable = FreeablePendingDigestAndReferences.idx();
            for slot in inner.by_state[freeable].iter(&inner.state_links) {
                digest
                    .add_segment_id(inner.segments[slot].as_ref().unwrap().id);
            }
        }

        let encoded = digest.encode();
        if !new_head.append(EntryKind::LogDigest, &encoded) {
            panic!(
                "could not append log digest of {} bytes to segment {}",
                encoded.len(),
                new_head.id
            );
        }
        M.digests_written.fetch_add(1, Relaxed);
    }

    /// Decide whether a draw of the given kind is currently
    /// permissible.
    fn may_alloc(&self, inner: &ManagerInner, kind: AllocKind) -> bool {
        assert!(inner.num_emergency_heads_alloced <= EMERGENCY_HEAD_RESERVE);
        assert!(
            inner.num_survivor_segments_alloced <= inner.num_survivor_segments
        );

        let emergency_reserved =
            EMERGENCY_HEAD_RESERVE - inner.num_emergency_heads_alloced;
        let survivor_reserved =
            inner.num_survivor_segments - inner.num_survivor_segments_alloced;
        let total_reserved = emergency_reserved + survivor_reserved;

        let free = self.allocator.free_segment_count();
        assert!(free >= total_reserved);

        match kind {
            AllocKind::EmergencyHead => {
                // The manager frees one emergency head before
                // allocating a second, so a reservation is always
                // available here.
                assert!(emergency_reserved > 0);
                assert!(!inner.free_slots.is_empty());
                assert!(free > 0);
                true
            }
            AllocKind::Survivor => {
                if survivor_reserved == 0 {
                    return false;
                }
                assert!(!inner.free_slots.is_empty());
                assert!(free > 0);
                true
            }
            AllocKind::Head => {
                if free <= total_reserved {
                    return false;
                }
                assert!(!inner.free_slots.is_empty());
                true
            }
        }
    }

    /// Allocate a segment of the given kind, if permitted, placing it
    /// in its birth state. Reclaims unreferenced segments first so
    /// that anything the epoch has released becomes available.
    fn alloc(
        &self,
        inner: &mut ManagerInner,
        kind: AllocKind,
    ) -> Option<Arc<LogSegment>> {
        self.free_unreferenced_segments(inner);

        if !self.may_alloc(inner, kind) {
            return None;
        }

        let id = inner.next_segment_id;
        let slot = inner.free_slots.pop().unwrap();
        debug_assert!(inner.segments[slot].is_none());
        debug_assert!(inner.states[slot].is_none());

        let segment = match LogSegment::new(
            &self.allocator,
            id,
            slot,
            kind == AllocKind::EmergencyHead,
        ) {
            Some(segment) => Arc::new(segment),
            None => {
                // The admission check saw a full segment's worth of
                // seglets, but appends to the open head draw from the
                // same pool outside our lock and may have raced us.
                debug!("seglet pool went dry during segment construction");
                inner.free_slots.push(slot);
                return None;
            }
        };

        inner.next_segment_id += 1;

        let state = match kind {
            AllocKind::Survivor => CleaningInto,
            _ => Head,
        };
        inner.states[slot] = Some(state);
        inner.segments[slot] = Some(Arc::clone(&segment));
        inner.id_to_slot.insert(id, slot);
        self.add_to_lists(inner, slot);

        match kind {
            AllocKind::Head => {
                M.head_allocations.fetch_add(1, Relaxed);
            }
            AllocKind::EmergencyHead => {
                inner.num_emergency_heads_alloced += 1;
                M.emergency_head_allocations.fetch_add(1, Relaxed);
            }
            AllocKind::Survivor => {
                inner.num_survivor_segments_alloced += 1;
                M.survivor_allocations.fetch_add(1, Relaxed);
            }
        }

        debug!(
            "allocated segment {} in slot {} ({:?}, {:?})",
            id, slot, kind, state
        );

        Some(segment)
    }

    /// Return a segment's slot, id, and memory. Only called once the
    /// segment is out of the log and past all reference gates (or was
    /// an emergency head being replaced).
    fn free(&self, inner: &mut ManagerInner, slot: Slot) {
        self.remove_from_lists(inner, slot);

        let segment =
            inner.segments[slot].take().expect("free() on an empty slot");
        let id = segment.id;
        let is_emergency_head = segment.is_emergency_head;

        inner.states[slot] = None;
        inner.free_slots.push(slot);
        inner.id_to_slot.remove(&id);

        // Drop our reference (and, with it, usually the seglets)
        // before touching the reserve counters, so may_alloc's
        // free-count assertion cannot observe the counters early.
        drop(segment);

        if is_emergency_head {
            inner.num_emergency_heads_alloced -= 1;
        } else if inner.num_survivor_segments_alloced > 0 {
            inner.num_survivor_segments_alloced -= 1;
        }

        M.segments_freed.fetch_add(1, Relaxed);
        debug!("freed segment {} from slot {}", id, slot);
    }

    fn add_to_lists(&self, inner: &mut ManagerInner, slot: Slot) {
        let state = inner.states[slot].expect("segment has no state");
        inner.all.push_back(&mut inner.all_links, slot);
        inner.by_state[state.idx()].push_back(&mut inner.state_links, slot);
    }

    fn remove_from_lists(&self, inner: &mut ManagerInner, slot: Slot) {
        let state = inner.states[slot].expect("segment has no state");
        inner.by_state[state.idx()].remove(&mut inner.state_links, slot);
        inner.all.remove(&mut inner.all_links, slot);
    }

    /// Transition a segment between states: O(1) list surgery plus
    /// the state-table update.
    fn change_state(
        &self,
        inner: &mut ManagerInner,
        slot: Slot,
        new_state: SegmentState,
    ) {
        self.remove_from_lists(inner, slot);
        let old_state = inner.states[slot].replace(new_state);
        trace!(
            "segment in slot {} transitioned {:?} -> {:?}",
            slot,
            old_state,
            new_state
        );
        self.add_to_lists(inner, slot);
    }

    /// Free every segment past its reference gate: out of the log,
    /// and marked freeable in an epoch now older than every
    /// outstanding RPC. The `FreeablePendingReferences` list only
    /// fills while no iterator is active, so this scan is always safe
    /// to run.
    fn free_unreferenced_segments(&self, inner: &mut ManagerInner) {
        if inner.by_state[FreeablePendingReferences.idx()].is_empty() {
            return;
        }

        let earliest = self.epochs.earliest_outstanding_epoch();
        let freeable: Vec<Slot> = inner.by_state
            [FreeablePendingReferences.idx()]
        .iter(&inner.state_links)
        .filter(|&slot| {
            inner.segments[slot].as_ref().unwrap().cleaned_epoch() < earliest
        })
        .collect();

        for slot in freeable {
            self.free(inner, slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(
        initial_segments: usize,
        expansion: f64,
    ) -> (SegmentManager, Arc<Loopback>, Arc<EpochTracker>) {
        let config = ConfigBuilder::new()
            .seglet_size(256)
            .segment_size(1024)
            .initial_segments(initial_segments)
            .disk_expansion_factor(expansion)
            .build();
        let replica_manager = Arc::new(Loopback::new());
        let epochs = Arc::new(EpochTracker::new());
        let manager = SegmentManager::start(
            1,
            config,
            replica_manager.clone(),
            epochs.clone(),
        )
        .unwrap();
        (manager, replica_manager, epochs)
    }

    #[test]
    fn construction_validates_config() {
        let config = ConfigBuilder::new()
            .seglet_size(256)
            .segment_size(1024)
            .initial_segments(8)
            .disk_expansion_factor(0.5)
            .build();
        let result = SegmentManager::start(
            1,
            config,
            Arc::new(Loopback::new()),
            Arc::new(EpochTracker::new()),
        );
        assert_eq!(
            result.err(),
            Some(Error::Unsupported(
                "disk expansion factor 0.5 must be at least 1.0".to_owned()
            ))
        );

        let starved = ConfigBuilder::new()
            .seglet_size(256)
            .segment_size(1024)
            .initial_segments(1)
            .build();
        assert!(SegmentManager::start(
            1,
            starved,
            Arc::new(Loopback::new()),
            Arc::new(EpochTracker::new()),
        )
        .is_err());
    }

    #[test]
    fn construction_registers_memory_and_sizes_slots() {
        let (manager, replica_manager, _) = manager_with(4, 2.0);
        assert_eq!(replica_manager.registered_bytes(), 4 * 1024);
        assert_eq!(manager.max_segment_count(), 8);
        assert_eq!(manager.seglet_size(), 256);
        assert_eq!(manager.segment_size(), 1024);
    }

    #[test]
    fn ids_are_monotonic_and_tables_stay_in_sync() {
        let (manager, _, _) = manager_with(8, 1.0);

        let h1 = manager.alloc_head(false).unwrap().unwrap();
        let h2 = manager.alloc_head(false).unwrap().unwrap();
        let h3 = manager.alloc_head(false).unwrap().unwrap();
        assert!(h1.id < h2.id && h2.id < h3.id);

        let inner = manager.inner.lock();
        for slot in 0..manager.max_segments {
            assert_eq!(
                inner.segments[slot].is_some(),
                inner.states[slot].is_some()
            );
        }
        assert_eq!(inner.all.len(), 3);
    }

    #[test]
    fn one_head_at_a_time() {
        let (manager, _, _) = manager_with(8, 1.0);

        let h1 = manager.alloc_head(false).unwrap().unwrap();
        assert_eq!(manager.segment_state(h1.slot), Some(Head));

        let h2 = manager.alloc_head(false).unwrap().unwrap();
        assert_eq!(manager.segment_state(h2.slot), Some(Head));
        assert_eq!(manager.segment_state(h1.slot), Some(NewlyCleanable));
    }

    #[test]
    fn survivors_are_born_cleaning_into() {
        let (manager, _, _) = manager_with(8, 1.0);
        assert!(manager.increase_survivor_reserve(2));

        let survivor = manager.alloc_survivor(0).unwrap().unwrap();
        assert_eq!(manager.segment_state(survivor.slot), Some(CleaningInto));
        assert_eq!(manager.free_survivor_count(), 1);

        // reserve exhaustion
        let _second = manager.alloc_survivor(0).unwrap().unwrap();
        assert!(manager.alloc_survivor(0).unwrap().is_none());
    }

    #[test]
    fn survivor_headers_are_stamped_with_the_cleaning_head() {
        let (manager, _, _) = manager_with(8, 1.0);
        assert!(manager.increase_survivor_reserve(1));

        let survivor = manager.alloc_survivor(7).unwrap().unwrap();
        let entries = survivor.entries().unwrap();
        assert_eq!(entries[0].kind, EntryKind::SegHeader);
        let header = SegmentHeader::decode(&entries[0].data).unwrap();
        assert_eq!(header.head_id_during_cleaning, 7);
        assert_eq!(header.log_id, 1);
        assert_eq!(header.segment_id, survivor.id);
    }

    #[test]
    fn head_reserve_admission() {
        // 3 free segments and a 2-segment emergency reserve leave
        // room for exactly one normal head.
        let (manager, _, _) = manager_with(3, 1.0);

        let h1 = manager.alloc_head(false).unwrap();
        assert!(h1.is_some());
        assert!(manager.alloc_head(false).unwrap().is_none());

        let emergency = manager.alloc_head(true).unwrap().unwrap();
        assert!(emergency.is_emergency_head);
    }

    #[test]
    fn emergency_heads_free_on_replacement() {
        let (manager, _, epochs) = manager_with(3, 1.0);

        let h1 = manager.alloc_head(false).unwrap().unwrap();
        let emergency = manager.alloc_head(true).unwrap().unwrap();
        assert!(emergency.is_emergency_head);
        assert_eq!(manager.segment_state(h1.slot), Some(NewlyCleanable));

        // Clean h1 so the next alloc_head can free its memory and
        // take the normal path again, retiring the emergency head
        // without any cleaning.
        let mut cleanable = vec![];
        manager.cleanable_segments(&mut cleanable);
        assert_eq!(cleanable.len(), 1);
        manager.cleaning_complete(&cleanable);
        drop(cleanable);
        drop(h1);

        // digest write with no iterator moves h1 to
        // FreeablePendingReferences; epoch sentinel lets it free on
        // the next allocation.
        let emergency_slot = emergency.slot;
        let emergency_id = emergency.id;
        drop(emergency);
        assert_eq!(
            epochs.earliest_outstanding_epoch(),
            u64::max_value()
        );

        let h2 = manager.alloc_head(false).unwrap().unwrap();
        assert!(!h2.is_emergency_head);
        assert!(!manager.contains_id(emergency_id));
        assert_eq!(manager.segment_state(emergency_slot), None);
        assert_eq!(
            manager.segment(emergency_slot).err(),
            Some(Error::InvalidSlot(emergency_slot))
        );
    }

    #[test]
    fn freeing_respects_outstanding_epochs() {
        let (manager, _, epochs) = manager_with(8, 1.0);

        let rpc = epochs.enter();

        let h1 = manager.alloc_head(false).unwrap().unwrap();
        let h1_slot = h1.slot;
        let _h2 = manager.alloc_head(false).unwrap().unwrap();

        let mut cleanable = vec![];
        manager.cleanable_segments(&mut cleanable);
        manager.cleaning_complete(&cleanable);
        drop(cleanable);
        drop(h1);

        // digest write retires the pending-digest gate
        let _h3 = manager.alloc_head(false).unwrap().unwrap();
        assert_eq!(
            manager.segment_state(h1_slot),
            Some(FreeablePendingReferences)
        );

        // the outstanding rpc pins the cleaned epoch
        let _h4 = manager.alloc_head(false).unwrap().unwrap();
        assert_eq!(
            manager.segment_state(h1_slot),
            Some(FreeablePendingReferences)
        );

        drop(rpc);
        let _h5 = manager.alloc_head(false).unwrap().unwrap();
        assert_eq!(manager.segment_state(h1_slot), None);
    }

    #[test]
    fn slot_lookup_contract() {
        let (manager, _, _) = manager_with(8, 1.0);

        let head = manager.alloc_head(false).unwrap().unwrap();
        let slot = head.slot;
        assert_eq!(manager.segment(slot).unwrap().id, head.id);

        assert_eq!(
            manager.segment(manager.max_segment_count()).err(),
            Some(Error::InvalidSlot(manager.max_segment_count()))
        );

        let empty_slot =
            (0..manager.max_segment_count()).find(|&s| s != slot).unwrap();
        assert_eq!(
            manager.segment(empty_slot).err(),
            Some(Error::InvalidSlot(empty_slot))
        );
    }

    #[test]
    fn reserve_growth_rules() {
        let (manager, _, _) = manager_with(8, 1.0);

        assert!(!manager.increase_survivor_reserve(7));
        assert!(manager.increase_survivor_reserve(6));
        assert!(!manager.increase_survivor_reserve(3));
        assert_eq!(manager.free_survivor_count(), 6);
    }

    #[test]
    fn head_allocation_honors_survivor_reserve() {
        let (manager, _, _) = manager_with(6, 1.0);
        assert!(manager.increase_survivor_reserve(3));

        // 6 free, 2 emergency + 3 survivor reserved: one head fits.
        assert!(manager.alloc_head(false).unwrap().is_some());
        assert!(manager.alloc_head(false).unwrap().is_none());

        // Drawing a survivor shrinks the un-drawn reserve, which is
        // what admission counts, so the head path opens back up.
        let _survivor = manager.alloc_survivor(0).unwrap().unwrap();
        assert!(manager.alloc_head(false).unwrap().is_some());
    }
}
