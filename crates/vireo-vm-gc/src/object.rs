//! GC object header and tracing

use crate::handle::Handle;

/// Tri-color mark state, plus purple for cycle candidates
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Not yet visited
    White = 0,
    /// In worklist
    Gray = 1,
    /// Fully scanned
    Black = 2,
    /// Possible cycle root (refcount decremented but non-zero)
    Purple = 3,
}

/// Heap region an object currently lives in
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Bump-allocated young space
    Nursery = 0,
    /// One of the two survivor halves
    Survivor = 1,
    /// Mature space, free-list allocated
    Old = 2,
    /// Large object space (>= 8KB)
    Los = 3,
}

/// Per-object header.
///
/// Invariants: a black object never references a white object unless the
/// edge is covered by the remembered set or a dirty card; refcount zero
/// means the object is unreachable from roots and is destroyed before the
/// next safepoint.
#[derive(Debug, Clone)]
pub struct GcHeader {
    /// Strong reference count
    pub refcount: u32,
    /// Tri-color mark state
    pub color: Color,
    /// Object sits in the purple candidate buffer
    pub buffered: bool,
    /// Minor collections survived
    pub age: u8,
    /// Size-class index in the old-gen allocator (mature objects only)
    pub size_class: u8,
    /// Current region
    pub generation: Generation,
    /// Allocation size in bytes
    pub size: u32,
    /// Byte offset in the mature address space (old/LOS objects only)
    pub offset: u64,
}

impl GcHeader {
    /// Header for a fresh allocation in the given region
    pub fn new(generation: Generation, size: u32) -> Self {
        Self {
            refcount: 1,
            color: Color::White,
            buffered: false,
            age: 0,
            size_class: 0,
            generation,
            size,
            offset: 0,
        }
    }

    /// Is this object in a young region?
    #[inline]
    pub fn is_young(&self) -> bool {
        matches!(self.generation, Generation::Nursery | Generation::Survivor)
    }

    /// Is this object in the mature (old or large-object) space?
    #[inline]
    pub fn is_mature(&self) -> bool {
        matches!(self.generation, Generation::Old | Generation::Los)
    }
}

/// Trait for payloads managed by the GC heap.
///
/// `trace` must visit the handle of every object directly referenced by the
/// payload. The collector relies on it for marking, for minor-GC liveness,
/// and for releasing children when an object is destroyed.
pub trait Trace {
    /// Visit every directly referenced handle
    fn trace(&self, visitor: &mut dyn FnMut(Handle));
}
