//! Heap aggregate payloads: arrays, objects, records, closures, resources

use vireo_vm_bytecode::SymbolId;

use crate::cow::CowBuf;
use crate::shape::ShapeId;
use crate::value::Value;

/// An array with a copy-on-write element table.
///
/// Mutation goes through [`VmArray::prepare_write`]; when the element table
/// was cloned the caller re-retains contained aggregates (the clone holds a
/// second reference to each).
#[derive(Debug, Clone)]
pub struct VmArray {
    elements: CowBuf<Vec<Value>>,
}

impl VmArray {
    /// Create from elements
    pub fn new(elements: Vec<Value>) -> Self {
        Self {
            elements: CowBuf::new(elements),
        }
    }

    /// Element count
    pub fn len(&self) -> usize {
        self.elements.get_read().len()
    }

    /// Is the array empty?
    pub fn is_empty(&self) -> bool {
        self.elements.get_read().is_empty()
    }

    /// Read an element
    pub fn get(&self, index: usize) -> Option<Value> {
        self.elements.get_read().get(index).copied()
    }

    /// Borrow the element table
    pub fn as_slice(&self) -> &[Value] {
        self.elements.get_read()
    }

    /// Strong count of the element buffer
    pub fn buffer_refcount(&self) -> usize {
        self.elements.refcount()
    }

    /// Share the element table
    pub fn share(&self) -> Self {
        Self {
            elements: self.elements.retain(),
        }
    }

    /// Make the element table exclusive for writing. Returns the table and
    /// whether a clone happened.
    pub fn prepare_write(&mut self) -> (&mut Vec<Value>, bool) {
        self.elements.get_write()
    }
}

/// A shaped object
#[derive(Debug, Clone)]
pub struct VmObject {
    /// Registered class id
    pub class: u16,
    /// Current shape
    pub shape: ShapeId,
    /// Property slots, indexed per the shape
    pub slots: Vec<Value>,
}

impl VmObject {
    /// Create an object of a class with all slots null
    pub fn new(class: u16, shape: ShapeId, slot_count: usize) -> Self {
        Self {
            class,
            shape,
            slots: vec![Value::Null; slot_count],
        }
    }

    /// Read a slot
    #[inline]
    pub fn slot(&self, index: u32) -> Option<Value> {
        self.slots.get(index as usize).copied()
    }
}

/// A fixed-shape record: field order is the static layout, so reads and
/// writes index directly without a shape walk.
#[derive(Debug, Clone)]
pub struct VmStruct {
    /// Field names in layout order
    pub fields: Vec<SymbolId>,
    /// Field values, parallel to `fields`
    pub values: Vec<Value>,
    /// Frame-lifetime allocation (freed when its frame pops)
    pub on_stack: bool,
}

impl VmStruct {
    /// Create a record
    pub fn new(fields: Vec<SymbolId>, values: Vec<Value>, on_stack: bool) -> Self {
        debug_assert_eq!(fields.len(), values.len());
        Self {
            fields,
            values,
            on_stack,
        }
    }

    /// Field offset by name
    pub fn offset_of(&self, name: SymbolId) -> Option<usize> {
        self.fields.iter().position(|f| *f == name)
    }
}

/// A closure: function index plus captured values
#[derive(Debug, Clone)]
pub struct VmClosure {
    /// Function index in the program
    pub function: u32,
    /// Captured values, appended after the call arguments
    pub captures: Vec<Value>,
}

/// An opaque resource handle
#[derive(Debug, Clone)]
pub struct VmResource {
    /// Resource kind tag
    pub kind: SymbolId,
    /// Embedder-defined payload
    pub payload: u64,
}
