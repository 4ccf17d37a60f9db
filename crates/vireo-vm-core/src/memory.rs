//! Memory manager: allocation routing, roots, barriers, requests
//!
//! Owns the GC heap, the interner, the shape and class registries, and the
//! request arena; every allocation and refcount operation of the VM goes
//! through here. Allocation runs the failure ladder: nursery, then a minor
//! collection, then a major collection, then old-gen growth, and only then
//! the fatal out-of-memory error.

use std::sync::Arc;

use vireo_vm_bytecode::{Interner, SymbolId};
use vireo_vm_gc::{AllocError, GcConfig, GcHeap, GcPhase, GcStats, Handle};

use crate::arena::RequestArena;
use crate::class::ClassRegistry;
use crate::concurrent::SharedValue;
use crate::error::{VmError, VmResult};
use crate::heap::HeapData;
use crate::object::{VmArray, VmClosure, VmObject, VmResource, VmStruct};
use crate::string::VmString;
use crate::value::Value;

/// Memory manager for one VM instance
pub struct MemoryManager {
    heap: GcHeap<HeapData>,
    interner: Arc<Interner>,
    /// Shape registry (hidden classes)
    pub shapes: crate::shape::ShapeRegistry,
    /// Class registry
    pub classes: ClassRegistry,
    arena: RequestArena,
}

impl MemoryManager {
    /// Create a manager over a (possibly shared) interner
    pub fn new(interner: Arc<Interner>, config: GcConfig) -> Self {
        Self {
            heap: GcHeap::with_config(config),
            interner,
            shapes: crate::shape::ShapeRegistry::new(),
            classes: ClassRegistry::new(),
            arena: RequestArena::new(),
        }
    }

    /// The interner
    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    /// Shared handle to the interner (for sibling VMs)
    pub fn interner_arc(&self) -> Arc<Interner> {
        Arc::clone(&self.interner)
    }

    /// Intern a name
    pub fn intern(&self, name: &str) -> SymbolId {
        self.interner.intern(name)
    }

    /// The underlying heap
    pub fn heap(&self) -> &GcHeap<HeapData> {
        &self.heap
    }

    /// The underlying heap, mutably
    pub fn heap_mut(&mut self) -> &mut GcHeap<HeapData> {
        &mut self.heap
    }

    // ==================== Allocation ====================

    /// Allocate a payload through the failure ladder. While a request
    /// bracket is open the allocation is recorded against the arena.
    pub fn alloc(&mut self, data: HeapData, roots: &[Handle]) -> VmResult<Handle> {
        let size = data.approximate_size();

        // Fast path.
        let data = match self.heap.alloc_young(data, size) {
            Ok(h) => return Ok(self.post_alloc(h, size)),
            Err((data, _)) => data,
        };

        // Nursery exhausted: minor collection, retry.
        self.heap.collect_minor(roots);
        let data = match self.heap.alloc_young(data, size) {
            Ok(h) => return Ok(self.post_alloc(h, size)),
            Err((data, _)) => data,
        };

        // Still insufficient: full major collection, retry.
        self.heap.collect_major(roots);
        let data = match self.heap.alloc_young(data, size) {
            Ok(h) => return Ok(self.post_alloc(h, size)),
            Err((data, _)) => data,
        };

        // Last resort: grow the old generation directly.
        match self.heap.alloc_old(data, size) {
            Ok(h) => Ok(self.post_alloc(h, size)),
            Err((_, AllocError::OldGenFull)) => Err(VmError::OutOfMemory),
            Err((_, AllocError::NurseryFull)) => Err(VmError::OutOfMemory),
        }
    }

    fn post_alloc(&mut self, h: Handle, size: usize) -> Handle {
        self.arena.record(h, size);
        h
    }

    /// Allocate a string value
    pub fn alloc_string(&mut self, s: &str, roots: &[Handle]) -> VmResult<Value> {
        let h = self.alloc(HeapData::Str(VmString::new(s)), roots)?;
        Ok(Value::Str(h))
    }

    /// Allocate a string value from raw bytes
    pub fn alloc_string_bytes(&mut self, bytes: &[u8], roots: &[Handle]) -> VmResult<Value> {
        let h = self.alloc(HeapData::Str(VmString::from_bytes(bytes)), roots)?;
        Ok(Value::Str(h))
    }

    /// Allocate an array value; element ownership transfers to the array.
    pub fn alloc_array(&mut self, elements: Vec<Value>, roots: &[Handle]) -> VmResult<Value> {
        let h = self.alloc(HeapData::Array(VmArray::new(elements)), roots)?;
        Ok(Value::Array(h))
    }

    /// Allocate an object of a registered class with null slots
    pub fn alloc_object(&mut self, class: u16, roots: &[Handle]) -> VmResult<Value> {
        let (shape, slot_count) = match self.classes.get(class) {
            Some(def) => (def.shape, def.properties.len()),
            None => (self.shapes.root(), 0),
        };
        let h = self.alloc(
            HeapData::Object(VmObject::new(class, shape, slot_count)),
            roots,
        )?;
        Ok(Value::Object(h))
    }

    /// Allocate a fixed-shape record
    pub fn alloc_struct(
        &mut self,
        fields: Vec<SymbolId>,
        values: Vec<Value>,
        on_stack: bool,
        roots: &[Handle],
    ) -> VmResult<Value> {
        let h = self.alloc(
            HeapData::Struct(VmStruct::new(fields, values, on_stack)),
            roots,
        )?;
        Ok(Value::Struct(h))
    }

    /// Allocate a closure
    pub fn alloc_closure(
        &mut self,
        function: u32,
        captures: Vec<Value>,
        roots: &[Handle],
    ) -> VmResult<Value> {
        let h = self.alloc(HeapData::Closure(VmClosure { function, captures }), roots)?;
        Ok(Value::Closure(h))
    }

    /// Allocate an opaque resource
    pub fn alloc_resource(
        &mut self,
        kind: SymbolId,
        payload: u64,
        roots: &[Handle],
    ) -> VmResult<Value> {
        let h = self.alloc(HeapData::Resource(VmResource { kind, payload }), roots)?;
        Ok(Value::Resource(h))
    }

    // ==================== Reference counting ====================

    /// Retain an aggregate value (no-op on primitives)
    pub fn retain_value(&mut self, value: Value) -> VmResult<()> {
        if let Some(h) = value.handle() {
            self.heap
                .retain(h)
                .map_err(|_| VmError::RefCountOverflow)?;
        }
        Ok(())
    }

    /// Release an aggregate value (no-op on primitives)
    pub fn release_value(&mut self, value: Value) {
        if let Some(h) = value.handle() {
            self.heap.release(h);
        }
    }

    // ==================== Roots & barriers ====================

    /// Register a caller root: retains and pins the value.
    pub fn add_root(&mut self, value: Value) -> VmResult<()> {
        if let Some(h) = value.handle() {
            self.heap
                .retain(h)
                .map_err(|_| VmError::RefCountOverflow)?;
            self.heap.add_root(h);
        }
        Ok(())
    }

    /// Remove a caller root: unpins and releases.
    pub fn remove_root(&mut self, value: Value) {
        if let Some(h) = value.handle() {
            self.heap.remove_root(h);
            self.heap.release(h);
        }
    }

    /// Record a store of `target` into `source`'s fields
    pub fn write_barrier(&mut self, source: Handle, target: Value) {
        if let Some(t) = target.handle() {
            self.heap.write_barrier(source, t);
        }
    }

    // ==================== Collection control ====================

    /// Run a full collection: minor, complete major, cycle pass.
    pub fn force_collect(&mut self, roots: &[Handle]) {
        self.heap.collect_minor(roots);
        self.heap.collect_major(roots);
        self.heap.collect_cycles();
    }

    /// Adjust the collection-trigger thresholds
    pub fn set_threshold(&mut self, nursery_trigger: f64, old_trigger: f64) {
        self.heap.set_thresholds(nursery_trigger, old_trigger);
    }

    /// GC poll at a safepoint: bounded incremental major work plus a minor
    /// collection when the nursery crosses its trigger.
    pub fn safepoint(&mut self, roots: &[Handle]) {
        if self.heap.phase() == GcPhase::Marking {
            self.heap.major_step(roots);
        } else if self.heap.should_collect_major() {
            self.heap.start_major(roots);
            self.heap.major_step(roots);
        }
        if self.heap.should_collect_minor() {
            self.heap.collect_minor(roots);
        }
    }

    /// Collection statistics
    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    // ==================== Request brackets ====================

    /// Open a request bracket; allocations until `end_request` belong to it.
    pub fn begin_request(&mut self) -> u64 {
        self.arena.begin()
    }

    /// Current request id
    pub fn request_id(&self) -> u64 {
        self.arena.request_id()
    }

    /// Is a request bracket open?
    pub fn request_active(&self) -> bool {
        self.arena.is_active()
    }

    /// Mark a value as escaping the current request
    pub fn mark_escape(&mut self, value: Value) {
        if let Some(h) = value.handle() {
            self.arena.mark_escape(h);
        }
    }

    /// Close the request bracket: escaped objects (and every young object
    /// they reach) are promoted into the general heap, everything else the
    /// request allocated is freed. Afterwards no live value refers to a
    /// request-lifetime object.
    pub fn end_request(&mut self) {
        let (allocated, escaped) = self.arena.finish();

        // Promote the escaped graphs first so the teardown can't touch them.
        let mut work: Vec<Handle> = escaped.iter().copied().collect();
        while let Some(h) = work.pop() {
            if self.heap.promote_young(h) {
                work.extend(self.heap_children(h));
            }
        }

        for h in allocated {
            let still_young = self
                .heap
                .header(h)
                .is_some_and(|hd| hd.is_young());
            if still_young && !escaped.contains(&h) {
                self.heap.force_destroy(h);
            }
        }
    }

    fn heap_children(&self, h: Handle) -> Vec<Handle> {
        let mut children = Vec::new();
        if let Some(data) = self.heap.get(h) {
            use vireo_vm_gc::Trace;
            data.trace(&mut |child| children.push(child));
        }
        children
    }

    // ==================== Cross-VM migration ====================

    /// Deep-copy a value into the ownerless shared representation
    pub fn export_value(&self, value: Value) -> SharedValue {
        match value {
            Value::Null => SharedValue::Null,
            Value::Bool(b) => SharedValue::Bool(b),
            Value::Int(n) => SharedValue::Int(n),
            Value::Float(f) => SharedValue::Float(f),
            Value::InternedStr(sym) => SharedValue::Str(
                self.interner
                    .resolve(sym)
                    .map(|s| s.as_bytes().to_vec())
                    .unwrap_or_default(),
            ),
            Value::Str(h) => match self.heap.get(h) {
                Some(HeapData::Str(s)) => SharedValue::Str(s.as_bytes().to_vec()),
                _ => SharedValue::Null,
            },
            Value::Array(h) => match self.heap.get(h) {
                Some(HeapData::Array(a)) => SharedValue::List(
                    a.as_slice().iter().map(|v| self.export_value(*v)).collect(),
                ),
                _ => SharedValue::Null,
            },
            // Objects, closures, and resources are VM-confined.
            _ => SharedValue::Null,
        }
    }

    /// Deep-copy a shared value into this VM's heap
    pub fn import_value(&mut self, shared: &SharedValue, roots: &[Handle]) -> VmResult<Value> {
        Ok(match shared {
            SharedValue::Null => Value::Null,
            SharedValue::Bool(b) => Value::Bool(*b),
            SharedValue::Int(n) => Value::Int(*n),
            SharedValue::Float(f) => Value::Float(*f),
            SharedValue::Str(bytes) => self.alloc_string_bytes(bytes, roots)?,
            SharedValue::List(items) => {
                let mut elements = Vec::with_capacity(items.len());
                for item in items {
                    elements.push(self.import_value(item, roots)?);
                }
                self.alloc_array(elements, roots)?
            }
        })
    }
}
