//! Cycle collection by trial deletion
//!
//! Reference counting alone cannot reclaim cycles. Objects whose count is
//! decremented to a non-zero value are flagged purple and buffered as cycle
//! candidates. A collection pass walks the purple roots, trial-decrements
//! the counts of everything reachable, and any subgraph whose external count
//! reaches zero is a dead cycle: it is recolored white and released in
//! dependency order. Reachable objects get their trial decrements restored.
//!
//! Runs between major-collection phases; the color field is shared with the
//! tri-color marker, which is idle here.

use crate::collector::GcPhase;
use crate::handle::Handle;
use crate::heap::GcHeap;
use crate::object::{Color, Trace};

impl<T: Trace> GcHeap<T> {
    /// Run one cycle-collection pass over the purple candidate buffer.
    ///
    /// Returns the number of objects released.
    pub fn collect_cycles(&mut self) -> usize {
        if self.phase != GcPhase::Idle {
            return 0;
        }

        let buffered = std::mem::take(&mut self.purple);
        let mut roots: Vec<Handle> = Vec::new();

        // Keep only candidates that are still purple and alive; everything
        // else just leaves the buffer.
        for h in buffered {
            match self.slot_mut(h) {
                Some(slot) if slot.header.color == Color::Purple && slot.header.refcount > 0 => {
                    roots.push(h);
                }
                Some(slot) => {
                    slot.header.buffered = false;
                }
                None => {}
            }
        }

        for &h in &roots {
            self.mark_gray(h);
        }
        for &h in &roots {
            self.scan(h);
        }

        let mut released = 0usize;
        for h in roots {
            if let Some(slot) = self.slot_mut(h) {
                slot.header.buffered = false;
            }
            released += self.collect_white(h);
        }

        if released > 0 {
            self.stats.lock().cycle_collections += 1;
            #[cfg(feature = "gc_logging")]
            tracing::debug!(target: "vireo::gc", released, "cycle collection released objects");
        }

        released
    }

    /// Trial-delete: gray the subgraph and remove internal counts.
    fn mark_gray(&mut self, start: Handle) {
        let mut stack = vec![start];
        while let Some(h) = stack.pop() {
            let Some(slot) = self.slot_mut(h) else { continue };
            if slot.header.color == Color::Gray {
                continue;
            }
            slot.header.color = Color::Gray;
            for child in self.children_of(h) {
                if let Some(cs) = self.slot_mut(child) {
                    cs.header.refcount = cs.header.refcount.saturating_sub(1);
                }
                stack.push(child);
            }
        }
    }

    /// Decide liveness: externally referenced subgraphs are restored to
    /// black (with counts re-added), the rest turns white.
    fn scan(&mut self, start: Handle) {
        let mut stack = vec![start];
        while let Some(h) = stack.pop() {
            let Some(slot) = self.slot_mut(h) else { continue };
            if slot.header.color != Color::Gray {
                continue;
            }
            if slot.header.refcount > 0 {
                self.scan_black(h);
            } else {
                slot.header.color = Color::White;
                for child in self.children_of(h) {
                    stack.push(child);
                }
            }
        }
    }

    /// Restore a live subgraph: re-add the trial-removed counts.
    fn scan_black(&mut self, start: Handle) {
        let mut stack = vec![start];
        while let Some(h) = stack.pop() {
            let Some(slot) = self.slot_mut(h) else { continue };
            slot.header.color = Color::Black;
            for child in self.children_of(h) {
                if let Some(cs) = self.slot_mut(child) {
                    cs.header.refcount = cs.header.refcount.saturating_add(1);
                    if cs.header.color != Color::Black {
                        stack.push(child);
                    }
                }
            }
        }
    }

    /// Release a dead (white) subgraph. Counts were already removed by the
    /// trial deletion, so members are freed without cascading releases,
    /// children before holders where the traversal allows.
    fn collect_white(&mut self, start: Handle) -> usize {
        let mut members: Vec<Handle> = Vec::new();
        let mut stack = vec![start];
        while let Some(h) = stack.pop() {
            let Some(slot) = self.slot_mut(h) else { continue };
            if slot.header.color != Color::White || slot.header.buffered {
                continue;
            }
            slot.header.color = Color::Black;
            members.push(h);
            for child in self.children_of(h) {
                stack.push(child);
            }
        }

        for &h in members.iter().rev() {
            if let Some(slot) = self.slots.get_mut(h.index() as usize).and_then(Option::take) {
                self.reclaim_region(&slot.header, h);
                drop(slot);
                self.free_slots.push(h.index());
            }
        }
        members.len()
    }
}
