//! Minor and major collection
//!
//! Minor collections stop the world within the owning VM: live young objects
//! move to the to-survivor half (or the old generation once aged past the
//! promotion threshold), everything else in the young regions is reclaimed,
//! and the card table and remembered set are rebuilt for the edges that
//! still cross the generation boundary.
//!
//! Major collections mark the mature space incrementally: each step
//! processes a bounded number of gray objects and returns control to the
//! mutator, with the Dijkstra insertion barrier keeping the tri-color
//! invariant while mutation proceeds between steps. The sweep returns white
//! objects to the segregated free list (coalescing) and handles the large
//! object space in the same pass.

use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;
use std::sync::atomic::Ordering;

use crate::handle::Handle;
use crate::heap::GcHeap;
use crate::object::{Color, Generation, Trace};

/// Major collection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No major collection in progress
    Idle,
    /// Incremental marking; write barriers gray new edges
    Marking,
    /// Reclaiming white objects
    Sweeping,
}

/// Collection statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Completed minor collections
    pub minor_collections: u64,
    /// Completed major collections
    pub major_collections: u64,
    /// Completed cycle-collection passes
    pub cycle_collections: u64,
    /// Bytes moved into the old generation by promotion
    pub bytes_promoted: u64,
    /// Objects moved into the old generation by promotion
    pub objects_promoted: u64,
    /// Bytes reclaimed across all collections
    pub bytes_reclaimed: u64,
    /// Pause of the most recent minor collection
    pub last_minor_pause: Duration,
    /// Accumulated marking/sweep time of the most recent major collection
    pub last_major_pause: Duration,
}

impl<T: Trace> GcHeap<T> {
    /// Run a stop-the-world minor collection.
    ///
    /// `extra_roots` are the caller's transient roots (VM operand stack and
    /// frame locals); the heap's registered roots are always included.
    /// Returns the number of young bytes reclaimed.
    pub fn collect_minor(&mut self, extra_roots: &[Handle]) -> usize {
        let pause_start = Instant::now();

        // ---- Phase 1: find the young-reachable set ----
        let mut roots = self.registered_roots();
        roots.extend_from_slice(extra_roots);

        let mut live: FxHashSet<Handle> = FxHashSet::default();
        let mut work: Vec<Handle> = Vec::new();

        for &h in &roots {
            if self.header(h).is_some_and(|hd| hd.is_young()) && live.insert(h) {
                work.push(h);
            }
        }

        // Old-to-young edges: remembered set, dirty cards, mature roots.
        let mut sources: FxHashSet<Handle> = self.remembered.sources().into_iter().collect();
        let ranges: Vec<(u64, u64)> = self.cards.dirty_ranges().collect();
        for (start, end) in ranges {
            for (_, &h) in self.mature_index.range(start..end) {
                sources.insert(h);
            }
        }
        for &h in &roots {
            if self.header(h).is_some_and(|hd| hd.is_mature()) {
                sources.insert(h);
            }
        }

        for &source in &sources {
            for child in self.children_of(source) {
                if self.header(child).is_some_and(|hd| hd.is_young()) && live.insert(child) {
                    work.push(child);
                }
            }
        }

        // Transitive closure through the young graph.
        while let Some(h) = work.pop() {
            for child in self.children_of(h) {
                if self.header(child).is_some_and(|hd| hd.is_young()) && live.insert(child) {
                    work.push(child);
                }
            }
        }

        // ---- Phase 2: move survivors, promote the aged, reclaim the dead ----
        let from = self.from_space;
        let to = 1 - from;
        let mut candidates = std::mem::take(&mut self.nursery);
        candidates.extend(std::mem::take(&mut self.survivors[from]));

        let mut reclaimed = 0usize;
        let mut promoted: Vec<Handle> = Vec::new();

        for h in candidates {
            // Skip objects already destroyed via refcounting.
            let (size, age, is_young) = match self.header(h) {
                Some(hd) => (hd.size as usize, hd.age, hd.is_young()),
                None => continue,
            };
            if !is_young {
                continue;
            }

            if live.contains(&h) {
                let new_age = age.saturating_add(1);
                let survivor_full = self.survivor_used[to] + size > self.config.survivor_size;
                let promote_now = new_age >= self.config.promote_age || survivor_full;
                if promote_now && self.promote(h, new_age) {
                    promoted.push(h);
                } else {
                    // Either still young, or the old gen is at its limit; the
                    // failure ladder (major GC, growth) catches up later.
                    let slot = self.slot_mut(h).expect("live slot");
                    slot.header.age = new_age;
                    slot.header.generation = Generation::Survivor;
                    self.survivors[to].push(h);
                    self.survivor_used[to] += size;
                }
            } else {
                reclaimed += size;
                self.destroy(h);
            }
        }

        // ---- Phase 3: rebuild cross-generation tracking ----
        self.cards.clear();
        self.remembered.clear();
        let mut rescan: Vec<Handle> = sources.into_iter().collect();
        rescan.extend(promoted.iter().copied());
        for source in rescan {
            let Some(hd) = self.header(source) else { continue };
            if !hd.is_mature() {
                continue;
            }
            let offset = hd.offset;
            let points_young = self
                .children_of(source)
                .into_iter()
                .any(|c| self.header(c).is_some_and(|chd| chd.is_young()));
            if points_young {
                self.cards.mark(offset);
                self.remembered.insert(source);
            }
        }

        // ---- Phase 4: swap survivor halves, reset the nursery ----
        self.from_space = to;
        self.survivor_used[from] = 0;
        self.nursery_used = 0;

        let pause = pause_start.elapsed();
        self.record_pause(pause);
        {
            let mut stats = self.stats.lock();
            stats.minor_collections += 1;
            stats.bytes_reclaimed += reclaimed as u64;
            stats.last_minor_pause = pause;
        }
        let mutator = self.last_gc_end.elapsed().saturating_sub(pause);
        let adjust = self.policy.on_collection(pause, mutator);
        self.apply_policy(adjust);
        self.last_gc_end = Instant::now();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "vireo::gc",
            reclaimed_bytes = reclaimed,
            promoted = self.stats.lock().objects_promoted,
            pause_us = pause.as_micros() as u64,
            "minor collection complete"
        );

        reclaimed
    }

    /// Move a live young object into the old generation. Returns false when
    /// the old generation refused to grow.
    fn promote(&mut self, h: Handle, new_age: u8) -> bool {
        let Some(hd) = self.header(h) else {
            return false;
        };
        let size = hd.size as usize;

        let block = crate::heap::MatureSpace::block_size(size as u64);
        let Some(offset) = self
            .space
            .alloc(block, self.config.old_limit as u64)
        else {
            return false;
        };

        let marking = self.phase == GcPhase::Marking;
        let slot = self.slot_mut(h).expect("live slot");
        slot.header.generation = Generation::Old;
        slot.header.offset = offset;
        slot.header.age = new_age;
        slot.header.size_class =
            crate::heap::MatureSpace::class_index(size as u64).unwrap_or(0) as u8;
        // Objects promoted mid-mark are treated as live for this cycle.
        slot.header.color = if marking { Color::Black } else { Color::White };

        self.old.insert(h);
        self.mature_index.insert(offset, h);

        let mut stats = self.stats.lock();
        stats.bytes_promoted += size as u64;
        stats.objects_promoted += 1;
        true
    }

    /// Promote a young object to the old generation immediately (request
    /// arena escape path). Returns false when the object is not young or the
    /// old generation refused to grow.
    pub fn promote_young(&mut self, h: Handle) -> bool {
        let Some(hd) = self.header(h) else {
            return false;
        };
        if !hd.is_young() {
            return false;
        }
        let age = hd.age.max(self.config.promote_age);
        self.promote(h, age)
    }

    /// Destroy an object the caller asserts is unreachable (request-arena
    /// teardown). Cascades releases into its children like any destroy.
    pub fn force_destroy(&mut self, h: Handle) {
        if self.is_live(h) {
            self.destroy(h);
        }
    }

    /// Collect the direct children of an object
    pub(crate) fn children_of(&self, h: Handle) -> Vec<Handle> {
        let mut children = Vec::new();
        if let Some(data) = self.get(h) {
            data.trace(&mut |child| children.push(child));
        }
        children
    }

    // ==================== Major collection ====================

    /// Begin an incremental major collection.
    ///
    /// Resets mature marks to white and seeds the gray worklist from the
    /// registered roots, the caller's roots, and every mature object
    /// referenced from the young generation.
    pub fn start_major(&mut self, extra_roots: &[Handle]) {
        if self.phase != GcPhase::Idle {
            return;
        }
        self.phase = GcPhase::Marking;
        self.gray.clear();
        self.barrier_buf.clear();

        let mature: Vec<Handle> = self.old.iter().chain(self.los.iter()).copied().collect();
        for h in &mature {
            if let Some(slot) = self.slot_mut(*h) {
                slot.header.color = Color::White;
            }
        }

        self.seed_major_roots(extra_roots);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "vireo::gc",
            mature_objects = mature.len(),
            gray_seeds = self.gray.len(),
            "major collection starting"
        );
    }

    fn seed_major_roots(&mut self, extra_roots: &[Handle]) {
        let mut seeds = self.registered_roots();
        seeds.extend_from_slice(extra_roots);

        for h in seeds {
            self.gray_if_white(h);
        }

        // The young generation is a root set for the mature space.
        let young: Vec<Handle> = self
            .nursery
            .iter()
            .chain(self.survivors[0].iter())
            .chain(self.survivors[1].iter())
            .copied()
            .collect();
        for h in young {
            for child in self.children_of(h) {
                self.gray_if_white(child);
            }
        }
    }

    fn gray_if_white(&mut self, h: Handle) {
        if let Some(slot) = self.slot_mut(h) {
            if slot.header.is_mature() && slot.header.color == Color::White {
                slot.header.color = Color::Gray;
                self.gray.push_back(h);
            }
        }
    }

    /// Run one bounded marking step; sweeps and returns to idle once the
    /// worklist drains. Returns the phase after the step.
    pub fn major_step(&mut self, extra_roots: &[Handle]) -> GcPhase {
        if self.phase != GcPhase::Marking {
            return self.phase;
        }
        let step_start = Instant::now();
        let budget = self.config.major_step_budget;

        // New stack roots since the last step.
        for &h in extra_roots {
            self.gray_if_white(h);
        }
        let buffered = std::mem::take(&mut self.barrier_buf);
        self.gray.extend(buffered);

        let mut processed = 0usize;
        while processed < budget {
            let Some(h) = self.gray.pop_front() else { break };
            let Some(slot) = self.slot_mut(h) else { continue };
            if !slot.header.is_mature() {
                continue;
            }
            slot.header.color = Color::Black;
            for child in self.children_of(h) {
                self.gray_if_white(child);
            }
            processed += 1;
        }

        if self.gray.is_empty() && self.barrier_buf.is_empty() {
            // Final re-mark closes the race with mutation between steps,
            // then the sweep runs synchronously for old gen and LOS.
            self.seed_major_roots(extra_roots);
            if self.gray.is_empty() {
                self.phase = GcPhase::Sweeping;
                let reclaimed = self.sweep_mature();
                self.phase = GcPhase::Idle;

                let pause = step_start.elapsed();
                self.record_pause(pause);
                {
                    let mut stats = self.stats.lock();
                    stats.major_collections += 1;
                    stats.bytes_reclaimed += reclaimed as u64;
                    stats.last_major_pause = pause;
                }
                let mutator = self.last_gc_end.elapsed().saturating_sub(pause);
                let adjust = self.policy.on_collection(pause, mutator);
                self.apply_policy(adjust);
                self.last_gc_end = Instant::now();

                #[cfg(feature = "gc_logging")]
                tracing::info!(
                    target: "vireo::gc",
                    reclaimed_bytes = reclaimed,
                    "major collection complete"
                );
                return GcPhase::Idle;
            }
        }

        self.record_pause(step_start.elapsed());
        GcPhase::Marking
    }

    /// Run a complete major collection to completion.
    pub fn collect_major(&mut self, extra_roots: &[Handle]) {
        self.start_major(extra_roots);
        while self.major_step(extra_roots) == GcPhase::Marking {}
    }

    /// Reclaim every white mature object. LOS objects are swept in the same
    /// pass as the old generation.
    fn sweep_mature(&mut self) -> usize {
        let mature: Vec<Handle> = self.old.iter().chain(self.los.iter()).copied().collect();
        let mut reclaimed = 0usize;
        for h in mature {
            let Some(hd) = self.header(h) else { continue };
            if hd.color == Color::White {
                reclaimed += hd.size as usize;
                self.destroy(h);
            }
        }
        reclaimed
    }

    /// Check the tri-color invariant over the mature space: a black object
    /// never references a white object unless the edge is covered by the
    /// remembered set or a dirty card. Used by debug assertions and tests.
    pub fn check_tricolor_invariant(&self) -> bool {
        for &h in self.old.iter().chain(self.los.iter()) {
            let Some(hd) = self.header(h) else { continue };
            if hd.color != Color::Black {
                continue;
            }
            let covered = self.remembered.contains(h) || self.cards.is_dirty(hd.offset);
            for child in self.children_of(h) {
                let Some(chd) = self.header(child) else { continue };
                if chd.is_mature() && chd.color == Color::White && !covered {
                    return false;
                }
            }
        }
        true
    }

    fn record_pause(&self, pause: Duration) {
        let nanos = pause.as_nanos().min(u64::MAX as u128) as u64;
        self.counters
            .total_pause_nanos
            .fetch_add(nanos, Ordering::Relaxed);
        self.counters
            .last_pause_nanos
            .store(nanos, Ordering::Relaxed);
        self.counters.collections.fetch_add(1, Ordering::Relaxed);
    }

    fn apply_policy(&mut self, adjust: Option<f64>) {
        if let Some(factor) = adjust {
            let nursery = (self.config.nursery_trigger * factor).clamp(0.5, 0.95);
            let old = (self.config.old_trigger * factor).clamp(0.5, 0.95);
            self.config.nursery_trigger = nursery;
            self.config.old_trigger = old;
        }
    }
}
