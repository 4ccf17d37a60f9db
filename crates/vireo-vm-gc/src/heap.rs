//! The handle-indexed generational heap

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::barrier::{CardTable, RememberedSet};
use crate::collector::{GcPhase, GcStats};
use crate::error::{AllocError, GcError};
use crate::handle::Handle;
use crate::object::{Color, GcHeader, Generation, Trace};
use crate::policy::AdaptivePolicy;

/// Old-gen size classes in bytes; requests round up to the next class.
pub(crate) const SIZE_CLASSES: [u64; 10] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

/// LOS allocations round up to whole pages.
pub(crate) const LOS_PAGE: u64 = 4096;

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Nursery capacity in bytes
    pub nursery_size: usize,
    /// Capacity of each survivor half in bytes
    pub survivor_size: usize,
    /// Minor collections an object must survive before promotion
    pub promote_age: u8,
    /// Nursery utilization fraction that triggers a minor collection
    pub nursery_trigger: f64,
    /// Old-gen utilization fraction that triggers a major collection
    pub old_trigger: f64,
    /// Hard limit on old + LOS bytes; growth beyond this is denied
    pub old_limit: usize,
    /// Allocations at or above this size go to the large object space
    pub large_object_threshold: usize,
    /// Gray objects processed per incremental marking step
    pub major_step_budget: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            nursery_size: 1024 * 1024,
            survivor_size: 256 * 1024,
            promote_age: 2,
            nursery_trigger: 0.9,
            old_trigger: 0.7,
            old_limit: 64 * 1024 * 1024,
            large_object_threshold: 8192,
            major_step_budget: 256,
        }
    }
}

/// Pause-time counters, shareable with monitoring threads.
#[derive(Debug, Default)]
pub struct GcCounters {
    /// Total pause time across all collections, nanoseconds
    pub total_pause_nanos: CachePadded<AtomicU64>,
    /// Pause time of the most recent collection, nanoseconds
    pub last_pause_nanos: CachePadded<AtomicU64>,
    /// Number of completed collections (minor + major)
    pub collections: CachePadded<AtomicU64>,
}

pub(crate) struct Slot<T> {
    pub(crate) header: GcHeader,
    pub(crate) data: T,
}

/// Segregated free-list allocator over the mature byte space.
///
/// Small blocks round to a size class and prefer the per-class quicklist;
/// freed blocks coalesce with their neighbors in the offset map. Quicklist
/// entries are validated against the map on pop, so coalescing never has to
/// chase down stale quicklist entries eagerly.
pub(crate) struct MatureSpace {
    free: BTreeMap<u64, u64>,
    class_lists: Vec<Vec<(u64, u64)>>,
    bump: u64,
    used: u64,
}

impl MatureSpace {
    fn new() -> Self {
        Self {
            free: BTreeMap::new(),
            class_lists: vec![Vec::new(); SIZE_CLASSES.len()],
            bump: 0,
            used: 0,
        }
    }

    pub(crate) fn class_index(size: u64) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&c| size <= c)
    }

    /// Round a request up to its block size (class size, or whole pages)
    pub(crate) fn block_size(size: u64) -> u64 {
        match Self::class_index(size) {
            Some(idx) => SIZE_CLASSES[idx],
            None => size.div_ceil(LOS_PAGE) * LOS_PAGE,
        }
    }

    /// Allocate a block; `limit` caps total space. Returns the offset.
    pub(crate) fn alloc(&mut self, block: u64, limit: u64) -> Option<u64> {
        // Quicklist fast path for class-sized blocks
        if let Some(class) = SIZE_CLASSES.iter().position(|&c| c == block) {
            while let Some((offset, size)) = self.class_lists[class].pop() {
                // Validate against the coalesced map; merged blocks are stale
                if self.free.get(&offset) == Some(&size) {
                    self.free.remove(&offset);
                    self.used += block;
                    return Some(offset);
                }
            }
        }

        // Best-fit search over the coalesced free map
        let found = self
            .free
            .iter()
            .filter(|&(_, &size)| size >= block)
            .min_by_key(|&(_, &size)| size)
            .map(|(&offset, &size)| (offset, size));
        if let Some((offset, size)) = found {
            self.free.remove(&offset);
            if size > block {
                self.insert_free(offset + block, size - block);
            }
            self.used += block;
            return Some(offset);
        }

        // Grow by bumping the end of the space
        if self.bump + block > limit {
            return None;
        }
        let offset = self.bump;
        self.bump += block;
        self.used += block;
        Some(offset)
    }

    /// Return a block to the free list, coalescing with neighbors.
    fn free_block(&mut self, offset: u64, block: u64) {
        self.used = self.used.saturating_sub(block);

        let mut start = offset;
        let mut size = block;

        // Merge with the preceding block
        if let Some((&prev_off, &prev_size)) = self.free.range(..offset).next_back() {
            if prev_off + prev_size == offset {
                self.free.remove(&prev_off);
                start = prev_off;
                size += prev_size;
            }
        }
        // Merge with the following block
        if let Some(&next_size) = self.free.get(&(offset + block)) {
            self.free.remove(&(offset + block));
            size += next_size;
        }

        self.insert_free(start, size);
    }

    fn insert_free(&mut self, offset: u64, size: u64) {
        self.free.insert(offset, size);
        if let Some(class) = SIZE_CLASSES.iter().position(|&c| c == size) {
            self.class_lists[class].push((offset, size));
        }
    }

    pub(crate) fn used(&self) -> u64 {
        self.used
    }
}

/// The generational heap, generic over the payload type.
pub struct GcHeap<T: Trace> {
    pub(crate) slots: Vec<Option<Slot<T>>>,
    pub(crate) free_slots: Vec<u32>,

    pub(crate) nursery: Vec<Handle>,
    pub(crate) nursery_used: usize,
    pub(crate) survivors: [Vec<Handle>; 2],
    pub(crate) survivor_used: [usize; 2],
    pub(crate) from_space: usize,

    pub(crate) old: FxHashSet<Handle>,
    pub(crate) los: FxHashSet<Handle>,
    pub(crate) mature_index: BTreeMap<u64, Handle>,
    pub(crate) space: MatureSpace,

    pub(crate) cards: CardTable,
    pub(crate) remembered: RememberedSet,

    roots: FxHashMap<Handle, u32>,

    pub(crate) phase: GcPhase,
    pub(crate) gray: VecDeque<Handle>,
    pub(crate) barrier_buf: Vec<Handle>,
    pub(crate) purple: Vec<Handle>,

    pub(crate) config: GcConfig,
    pub(crate) policy: AdaptivePolicy,
    pub(crate) stats: Arc<Mutex<GcStats>>,
    pub(crate) counters: Arc<GcCounters>,
    pub(crate) last_gc_end: Instant,
}

impl<T: Trace> GcHeap<T> {
    /// Create a heap with the default configuration
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    /// Create a heap with an explicit configuration
    pub fn with_config(config: GcConfig) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            nursery: Vec::new(),
            nursery_used: 0,
            survivors: [Vec::new(), Vec::new()],
            survivor_used: [0, 0],
            from_space: 0,
            old: FxHashSet::default(),
            los: FxHashSet::default(),
            mature_index: BTreeMap::new(),
            space: MatureSpace::new(),
            cards: CardTable::new(),
            remembered: RememberedSet::new(),
            roots: FxHashMap::default(),
            phase: GcPhase::Idle,
            gray: VecDeque::new(),
            barrier_buf: Vec::new(),
            purple: Vec::new(),
            config,
            policy: AdaptivePolicy::new(),
            stats: Arc::new(Mutex::new(GcStats::default())),
            counters: Arc::new(GcCounters::default()),
            last_gc_end: Instant::now(),
        }
    }

    /// Current configuration
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Adjust collection-trigger thresholds (clamped to sane fractions)
    pub fn set_thresholds(&mut self, nursery_trigger: f64, old_trigger: f64) {
        self.config.nursery_trigger = nursery_trigger.clamp(0.5, 0.95);
        self.config.old_trigger = old_trigger.clamp(0.5, 0.95);
    }

    /// Shareable pause counters for monitoring threads
    pub fn counters(&self) -> Arc<GcCounters> {
        Arc::clone(&self.counters)
    }

    /// Snapshot of collection statistics
    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    // ==================== Allocation ====================

    fn new_slot(&mut self, header: GcHeader, data: T) -> Handle {
        if let Some(index) = self.free_slots.pop() {
            self.slots[index as usize] = Some(Slot { header, data });
            Handle(index)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Some(Slot { header, data }));
            Handle(index)
        }
    }

    /// Allocate in the youngest fitting region: nursery, or LOS for large
    /// objects. On failure the payload comes back with the error so the
    /// caller can run a collection and retry.
    pub fn alloc_young(&mut self, data: T, size: usize) -> Result<Handle, (T, AllocError)> {
        if size >= self.config.large_object_threshold {
            return self.alloc_los(data, size);
        }
        if self.nursery_used + size > self.config.nursery_size {
            return Err((data, AllocError::NurseryFull));
        }
        let header = GcHeader::new(Generation::Nursery, size as u32);
        let handle = self.new_slot(header, data);
        self.nursery.push(handle);
        self.nursery_used += size;
        #[cfg(feature = "gc_logging")]
        tracing::trace!(target: "vireo::gc", handle = handle.0, size, "nursery alloc");
        Ok(handle)
    }

    /// Allocate directly in the old generation (explicit promotion path).
    pub fn alloc_old(&mut self, data: T, size: usize) -> Result<Handle, (T, AllocError)> {
        if size >= self.config.large_object_threshold {
            return self.alloc_los(data, size);
        }
        let block = MatureSpace::block_size(size as u64);
        let Some(offset) = self.space.alloc(block, self.config.old_limit as u64) else {
            return Err((data, AllocError::OldGenFull));
        };

        let mut header = GcHeader::new(Generation::Old, size as u32);
        header.offset = offset;
        header.size_class = MatureSpace::class_index(size as u64).unwrap_or(0) as u8;
        // Black allocation: objects created during marking are live this cycle
        if self.phase == GcPhase::Marking {
            header.color = Color::Black;
        }
        let handle = self.new_slot(header, data);
        self.old.insert(handle);
        self.mature_index.insert(offset, handle);
        Ok(handle)
    }

    /// Allocate in the large object space (>= 8KB).
    pub fn alloc_los(&mut self, data: T, size: usize) -> Result<Handle, (T, AllocError)> {
        let block = MatureSpace::block_size(size.max(self.config.large_object_threshold) as u64);
        let Some(offset) = self.space.alloc(block, self.config.old_limit as u64) else {
            return Err((data, AllocError::OldGenFull));
        };

        let mut header = GcHeader::new(Generation::Los, size as u32);
        header.offset = offset;
        if self.phase == GcPhase::Marking {
            header.color = Color::Black;
        }
        let handle = self.new_slot(header, data);
        self.los.insert(handle);
        self.mature_index.insert(offset, handle);
        Ok(handle)
    }

    // ==================== Access ====================

    pub(crate) fn slot(&self, h: Handle) -> Option<&Slot<T>> {
        self.slots.get(h.index() as usize)?.as_ref()
    }

    pub(crate) fn slot_mut(&mut self, h: Handle) -> Option<&mut Slot<T>> {
        self.slots.get_mut(h.index() as usize)?.as_mut()
    }

    /// Is the handle live?
    pub fn is_live(&self, h: Handle) -> bool {
        self.slot(h).is_some()
    }

    /// Borrow the payload
    pub fn get(&self, h: Handle) -> Option<&T> {
        self.slot(h).map(|s| &s.data)
    }

    /// Mutably borrow the payload.
    ///
    /// Mutation that installs references must be followed by a
    /// [`GcHeap::write_barrier`] call per installed edge.
    pub fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
        self.slot_mut(h).map(|s| &mut s.data)
    }

    /// Borrow the header
    pub fn header(&self, h: Handle) -> Option<&GcHeader> {
        self.slot(h).map(|s| &s.header)
    }

    /// Current region of an object
    pub fn generation(&self, h: Handle) -> Option<Generation> {
        self.header(h).map(|hd| hd.generation)
    }

    // ==================== Reference counting ====================

    /// Increment the strong count. Fails at u32 saturation.
    pub fn retain(&mut self, h: Handle) -> Result<(), GcError> {
        let slot = self.slot_mut(h).ok_or(GcError::DeadHandle(h.0))?;
        slot.header.refcount = slot
            .header
            .refcount
            .checked_add(1)
            .ok_or(GcError::RefCountOverflow(h.0))?;
        // A retained object is no longer a cycle candidate
        if slot.header.color == Color::Purple {
            slot.header.color = Color::Black;
        }
        Ok(())
    }

    /// Decrement the strong count; destroys the object at zero.
    ///
    /// Returns true when the object was destroyed. A decrement that leaves
    /// the count non-zero flags the object purple: it may be an interior
    /// member of a dead cycle, and the next cycle collection will test it.
    pub fn release(&mut self, h: Handle) -> bool {
        let Some(slot) = self.slot_mut(h) else {
            debug_assert!(false, "release of dead handle {h}");
            return false;
        };
        debug_assert!(slot.header.refcount > 0, "refcount underflow on {h}");
        if slot.header.refcount <= 1 {
            slot.header.refcount = 0;
            self.destroy(h);
            true
        } else {
            slot.header.refcount -= 1;
            if !slot.header.buffered {
                slot.header.buffered = true;
                slot.header.color = Color::Purple;
                self.purple.push(h);
            } else {
                slot.header.color = Color::Purple;
            }
            false
        }
    }

    /// Destroy an object and cascade-release everything it references.
    ///
    /// Iterative: a long chain of sole owners must not overflow the Rust
    /// stack.
    pub(crate) fn destroy(&mut self, start: Handle) {
        let mut work = vec![start];
        while let Some(h) = work.pop() {
            let Some(slot) = self.slots.get_mut(h.index() as usize).and_then(Option::take)
            else {
                continue;
            };
            self.reclaim_region(&slot.header, h);

            let mut children = Vec::new();
            slot.data.trace(&mut |child| children.push(child));
            drop(slot);
            self.free_slots.push(h.index());

            for child in children {
                if let Some(cs) = self.slot_mut(child) {
                    if cs.header.refcount <= 1 {
                        cs.header.refcount = 0;
                        work.push(child);
                    } else {
                        cs.header.refcount -= 1;
                        if !cs.header.buffered {
                            cs.header.buffered = true;
                            cs.header.color = Color::Purple;
                            self.purple.push(child);
                        }
                    }
                }
            }
        }
    }

    /// Return an object's storage to its region.
    pub(crate) fn reclaim_region(&mut self, header: &GcHeader, h: Handle) {
        match header.generation {
            Generation::Nursery | Generation::Survivor => {
                // Bump pointers only rewind at the next minor collection;
                // the region lists drop the stale handle lazily.
            }
            Generation::Old => {
                let block = MatureSpace::block_size(header.size as u64);
                self.space.free_block(header.offset, block);
                self.old.remove(&h);
                self.mature_index.remove(&header.offset);
                self.remembered.remove(h);
            }
            Generation::Los => {
                let block = MatureSpace::block_size(
                    (header.size as usize).max(self.config.large_object_threshold) as u64,
                );
                self.space.free_block(header.offset, block);
                self.los.remove(&h);
                self.mature_index.remove(&header.offset);
                self.remembered.remove(h);
            }
        }
    }

    // ==================== Roots ====================

    /// Register a root (multiset semantics: register twice, remove twice)
    pub fn add_root(&mut self, h: Handle) {
        *self.roots.entry(h).or_insert(0) += 1;
    }

    /// Remove one registration of a root
    pub fn remove_root(&mut self, h: Handle) {
        if let Some(count) = self.roots.get_mut(&h) {
            *count -= 1;
            if *count == 0 {
                self.roots.remove(&h);
            }
        }
    }

    /// Snapshot the registered roots
    pub fn registered_roots(&self) -> Vec<Handle> {
        self.roots.keys().copied().collect()
    }

    // ==================== Write barrier ====================

    /// Record a store of `target` into a field of `source`.
    ///
    /// Card table and remembered-set bookkeeping happens in every phase.
    /// During incremental marking the Dijkstra insertion barrier additionally
    /// grays a white target of a black source so the tri-color invariant
    /// holds. The card covering the source is dirty before this returns.
    pub fn write_barrier(&mut self, source: Handle, target: Handle) {
        let Some((src_gen, src_offset, src_color)) = self
            .header(source)
            .map(|hd| (hd.generation, hd.offset, hd.color))
        else {
            return;
        };
        let Some((tgt_young, tgt_color)) = self
            .header(target)
            .map(|hd| (hd.is_young(), hd.color))
        else {
            return;
        };

        if matches!(src_gen, Generation::Old | Generation::Los) && tgt_young {
            self.cards.mark(src_offset);
            self.remembered.insert(source);
        }

        if self.phase == GcPhase::Marking
            && src_color == Color::Black
            && tgt_color == Color::White
        {
            if let Some(slot) = self.slot_mut(target) {
                slot.header.color = Color::Gray;
            }
            self.barrier_buf.push(target);
        }
    }

    // ==================== Occupancy queries ====================

    /// Is the card covering a mature-space offset dirty?
    pub fn card_is_dirty(&self, offset: u64) -> bool {
        self.cards.is_dirty(offset)
    }

    /// Number of dirty cards
    pub fn dirty_card_count(&self) -> usize {
        self.cards.dirty_count()
    }

    /// Bytes currently bump-allocated in the nursery
    pub fn nursery_used(&self) -> usize {
        self.nursery_used
    }

    /// Free bytes remaining in the nursery
    pub fn nursery_free(&self) -> usize {
        self.config.nursery_size - self.nursery_used
    }

    /// Bytes used in the mature space (old + LOS)
    pub fn mature_used(&self) -> usize {
        self.space.used() as usize
    }

    /// Live object counts per region: (nursery, survivor, old, los)
    pub fn region_counts(&self) -> (usize, usize, usize, usize) {
        let live = |list: &[Handle]| {
            list.iter().filter(|h| self.slot(**h).is_some()).count()
        };
        (
            live(&self.nursery),
            live(&self.survivors[0]) + live(&self.survivors[1]),
            self.old.len(),
            self.los.len(),
        )
    }

    /// Should the mutator run a minor collection at the next safepoint?
    pub fn should_collect_minor(&self) -> bool {
        self.nursery_used as f64
            >= self.config.nursery_trigger * self.config.nursery_size as f64
    }

    /// Should the mutator start a major collection at the next safepoint?
    pub fn should_collect_major(&self) -> bool {
        self.phase == GcPhase::Idle
            && self.space.used() as f64 >= self.config.old_trigger * self.config.old_limit as f64
    }

    /// Current collection phase
    pub fn phase(&self) -> GcPhase {
        self.phase
    }
}

impl<T: Trace> Default for GcHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}
