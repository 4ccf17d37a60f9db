//! Interned symbols
//!
//! Identifiers, property names, and string constants are interned once and
//! referenced everywhere by a stable [`SymbolId`]. The table is read-mostly:
//! compilation interns, execution resolves. A single `Interner` may be shared
//! by several VM instances running in separate threads.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stable id of an interned symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SymbolId(pub u32);

impl SymbolId {
    /// Create a new symbol id
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw index
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

#[derive(Default)]
struct InternerInner {
    names: Vec<Arc<str>>,
    index: FxHashMap<Arc<str>, SymbolId>,
}

/// Symbol intern table protected by a reader-writer lock.
///
/// Resolution takes the read lock; interning a new name takes the write
/// lock. Front-ends are expected to normalize identifiers before interning.
#[derive(Default)]
pub struct Interner {
    inner: RwLock<InternerInner>,
}

impl Interner {
    /// Create an empty interner
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning its stable id.
    ///
    /// Interning the same name twice returns the same id.
    pub fn intern(&self, name: &str) -> SymbolId {
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.index.get(name) {
                return id;
            }
        }

        let mut inner = self.inner.write();
        // Re-check under the write lock: another thread may have interned
        // the name between our read and write acquisitions.
        if let Some(&id) = inner.index.get(name) {
            return id;
        }

        let id = SymbolId(inner.names.len() as u32);
        let name: Arc<str> = Arc::from(name);
        inner.names.push(Arc::clone(&name));
        inner.index.insert(name, id);
        id
    }

    /// Resolve a symbol id back to its name
    pub fn resolve(&self, id: SymbolId) -> Option<Arc<str>> {
        self.inner.read().names.get(id.0 as usize).cloned()
    }

    /// Look up an already-interned name without interning it
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.inner.read().index.get(name).copied()
    }

    /// Number of interned symbols
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    /// Check whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().names.is_empty()
    }
}
