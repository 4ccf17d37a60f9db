//! Hidden classes (shapes)
//!
//! A shape describes an object's property layout: which names it has and at
//! which slot each lives. Shapes form a transition tree rooted at the empty
//! shape; adding a property transitions to a child shape, so objects built
//! the same way share a shape and inline caches can key on the shape id.

use rustc_hash::FxHashMap;
use vireo_vm_bytecode::SymbolId;

/// Stable id of a shape in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ShapeId(pub u32);

/// One node of the transition tree
#[derive(Debug)]
struct Shape {
    /// Parent shape (None for the root)
    parent: Option<ShapeId>,
    /// Property added over the parent
    key: Option<SymbolId>,
    /// Slot of that property
    slot: Option<u32>,
    /// Child shapes by added property
    transitions: FxHashMap<SymbolId, ShapeId>,
    /// All property slots (inherited + own)
    property_map: FxHashMap<SymbolId, u32>,
    /// Keys in insertion order
    keys_ordered: Vec<SymbolId>,
}

/// Registry owning every shape of a VM instance.
///
/// Shapes are referenced by id, never by owning pointer; objects store a
/// `ShapeId` and the registry resolves slots.
#[derive(Debug)]
pub struct ShapeRegistry {
    shapes: Vec<Shape>,
}

impl ShapeRegistry {
    /// Create a registry holding the root (empty) shape
    pub fn new() -> Self {
        Self {
            shapes: vec![Shape {
                parent: None,
                key: None,
                slot: None,
                transitions: FxHashMap::default(),
                property_map: FxHashMap::default(),
                keys_ordered: Vec::new(),
            }],
        }
    }

    /// The root (empty) shape
    #[inline]
    pub fn root(&self) -> ShapeId {
        ShapeId(0)
    }

    /// Follow (or create) the transition for adding a property
    pub fn transition(&mut self, from: ShapeId, key: SymbolId) -> ShapeId {
        if let Some(&child) = self.shapes[from.0 as usize].transitions.get(&key) {
            return child;
        }

        let parent = &self.shapes[from.0 as usize];
        let next_slot = parent.property_map.len() as u32;
        let mut property_map = parent.property_map.clone();
        property_map.insert(key, next_slot);
        let mut keys_ordered = parent.keys_ordered.clone();
        keys_ordered.push(key);

        let child = ShapeId(self.shapes.len() as u32);
        self.shapes.push(Shape {
            parent: Some(from),
            key: Some(key),
            slot: Some(next_slot),
            transitions: FxHashMap::default(),
            property_map,
            keys_ordered,
        });
        self.shapes[from.0 as usize].transitions.insert(key, child);
        child
    }

    /// Build the shape for an ordered property list
    pub fn shape_for(&mut self, properties: &[SymbolId]) -> ShapeId {
        let mut shape = self.root();
        for &prop in properties {
            shape = self.transition(shape, prop);
        }
        shape
    }

    /// Slot of a property in a shape
    #[inline]
    pub fn offset_of(&self, shape: ShapeId, key: SymbolId) -> Option<u32> {
        self.shapes
            .get(shape.0 as usize)?
            .property_map
            .get(&key)
            .copied()
    }

    /// Property keys of a shape in insertion order
    pub fn keys(&self, shape: ShapeId) -> &[SymbolId] {
        self.shapes
            .get(shape.0 as usize)
            .map(|s| s.keys_ordered.as_slice())
            .unwrap_or(&[])
    }

    /// Number of properties in a shape
    pub fn property_count(&self, shape: ShapeId) -> usize {
        self.shapes
            .get(shape.0 as usize)
            .map(|s| s.property_map.len())
            .unwrap_or(0)
    }

    /// Parent of a shape
    pub fn parent(&self, shape: ShapeId) -> Option<ShapeId> {
        self.shapes.get(shape.0 as usize)?.parent
    }

    /// The property a shape added over its parent
    pub fn added_key(&self, shape: ShapeId) -> Option<(SymbolId, u32)> {
        let s = self.shapes.get(shape.0 as usize)?;
        Some((s.key?, s.slot?))
    }

    /// Total number of shapes
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    /// Always at least the root
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_insertion_order_shares_shape() {
        let mut reg = ShapeRegistry::new();
        let a = SymbolId(1);
        let b = SymbolId(2);

        let s1 = reg.shape_for(&[a, b]);
        let s2 = reg.shape_for(&[a, b]);
        assert_eq!(s1, s2);

        // Different insertion order produces a different shape.
        let s3 = reg.shape_for(&[b, a]);
        assert_ne!(s1, s3);
    }

    #[test]
    fn test_offsets_follow_insertion() {
        let mut reg = ShapeRegistry::new();
        let a = SymbolId(1);
        let b = SymbolId(2);
        let shape = reg.shape_for(&[a, b]);

        assert_eq!(reg.offset_of(shape, a), Some(0));
        assert_eq!(reg.offset_of(shape, b), Some(1));
        assert_eq!(reg.offset_of(shape, SymbolId(9)), None);
        assert_eq!(reg.keys(shape), &[a, b]);
    }

    #[test]
    fn test_transition_reuse() {
        let mut reg = ShapeRegistry::new();
        let a = SymbolId(1);
        let root = reg.root();
        let s1 = reg.transition(root, a);
        let s2 = reg.transition(root, a);
        assert_eq!(s1, s2);
        assert_eq!(reg.len(), 2);
    }
}
