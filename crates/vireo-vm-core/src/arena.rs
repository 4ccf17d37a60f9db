//! Request arena bookkeeping
//!
//! A request brackets a unit of work: allocations made while the bracket is
//! open belong to the request and die with it, except the ones explicitly
//! marked as escaping. `end_request` promotes every escaped object (and the
//! young objects it reaches) into the general heap and frees the rest; the
//! bookkeeping reset itself is O(1).

use rustc_hash::FxHashSet;
use vireo_vm_gc::Handle;

/// Arena state for the current request
#[derive(Debug, Default)]
pub struct RequestArena {
    active: bool,
    request_id: u64,
    allocated: Vec<Handle>,
    escaped: FxHashSet<Handle>,
    bytes: usize,
}

impl RequestArena {
    /// Create an inactive arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request bracket; returns the fresh request id.
    pub fn begin(&mut self) -> u64 {
        self.active = true;
        self.request_id += 1;
        self.allocated.clear();
        self.escaped.clear();
        self.bytes = 0;
        self.request_id
    }

    /// Is a request bracket open?
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current request id
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Bytes allocated during the current request
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Number of allocations recorded for the current request
    pub fn allocation_count(&self) -> usize {
        self.allocated.len()
    }

    /// Record an allocation made while the bracket is open
    pub fn record(&mut self, handle: Handle, size: usize) {
        if self.active {
            self.allocated.push(handle);
            self.bytes += size;
        }
    }

    /// Mark an object as escaping the request
    pub fn mark_escape(&mut self, handle: Handle) {
        if self.active {
            self.escaped.insert(handle);
        }
    }

    /// Close the bracket, taking the allocation and escape lists. The
    /// remaining reset is a couple of scalar stores.
    pub fn finish(&mut self) -> (Vec<Handle>, FxHashSet<Handle>) {
        self.active = false;
        self.bytes = 0;
        (
            std::mem::take(&mut self.allocated),
            std::mem::take(&mut self.escaped),
        )
    }
}
