//! Heap payload type and tracing glue

use vireo_vm_gc::{Handle, Trace};

use crate::object::{VmArray, VmClosure, VmObject, VmResource, VmStruct};
use crate::string::VmString;
use crate::value::Value;

/// Payload of a heap box
#[derive(Debug, Clone)]
pub enum HeapData {
    /// String
    Str(VmString),
    /// Array
    Array(VmArray),
    /// Object
    Object(VmObject),
    /// Fixed-shape record
    Struct(VmStruct),
    /// Closure
    Closure(VmClosure),
    /// Opaque resource
    Resource(VmResource),
}

impl HeapData {
    /// Approximate allocation size for region accounting
    pub fn approximate_size(&self) -> usize {
        match self {
            HeapData::Str(s) => 32 + s.len(),
            HeapData::Array(a) => 32 + 16 * a.len(),
            HeapData::Object(o) => 32 + 16 * o.slots.len(),
            HeapData::Struct(s) => 16 + 16 * s.values.len(),
            HeapData::Closure(c) => 32 + 16 * c.captures.len(),
            HeapData::Resource(_) => 32,
        }
    }

    /// Language-level type name of the payload
    pub fn type_name(&self) -> &'static str {
        match self {
            HeapData::Str(_) => "string",
            HeapData::Array(_) => "array",
            HeapData::Object(_) => "object",
            HeapData::Struct(_) => "struct",
            HeapData::Closure(_) => "callable",
            HeapData::Resource(_) => "resource",
        }
    }
}

impl Trace for HeapData {
    fn trace(&self, visitor: &mut dyn FnMut(Handle)) {
        let mut visit_value = |v: &Value| {
            if let Some(h) = v.handle() {
                visitor(h);
            }
        };
        match self {
            HeapData::Str(_) | HeapData::Resource(_) => {}
            HeapData::Array(a) => a.as_slice().iter().for_each(&mut visit_value),
            HeapData::Object(o) => o.slots.iter().for_each(&mut visit_value),
            HeapData::Struct(s) => s.values.iter().for_each(&mut visit_value),
            HeapData::Closure(c) => c.captures.iter().for_each(&mut visit_value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_visits_aggregates_only() {
        let array = HeapData::Array(VmArray::new(vec![
            Value::Int(1),
            Value::Str(Handle(7)),
            Value::Array(Handle(9)),
        ]));
        let mut seen = Vec::new();
        array.trace(&mut |h| seen.push(h));
        assert_eq!(seen, vec![Handle(7), Handle(9)]);
    }

    #[test]
    fn test_strings_have_no_children() {
        let s = HeapData::Str(VmString::new("hello"));
        let mut seen = Vec::new();
        s.trace(&mut |h| seen.push(h));
        assert!(seen.is_empty());
    }
}
