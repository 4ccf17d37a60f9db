//! Sanctioned inter-VM communication primitives
//!
//! Aggregate [`crate::value::Value`]s are confined to their owning VM;
//! migrating data between VMs goes through [`SharedValue`], a plain deep
//! copy. The primitives here (shared map, atomic counter, mutex, RW lock)
//! are the only cross-VM channels; everything else is share-nothing.
//!
//! `SharedMap::set` commits the value under the shard lock, with
//! happens-before into every subsequent `get`.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// A plain, ownerless value that can cross VM boundaries
#[derive(Debug, Clone, PartialEq)]
pub enum SharedValue {
    /// null
    Null,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// String bytes
    Str(Vec<u8>),
    /// Ordered list
    List(Vec<SharedValue>),
}

impl Default for SharedValue {
    fn default() -> Self {
        SharedValue::Null
    }
}

/// Concurrent map keyed by strings
#[derive(Debug, Default)]
pub struct SharedMap {
    inner: DashMap<String, SharedValue>,
}

impl SharedMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a value under the shard lock.
    ///
    /// The value is visible to every `get` that begins after this returns.
    pub fn set(&self, key: impl Into<String>, value: SharedValue) {
        self.inner.insert(key.into(), value);
    }

    /// Read a value (clone of the committed state)
    pub fn get(&self, key: &str) -> Option<SharedValue> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    /// Remove a key, returning the previous value
    pub fn remove(&self, key: &str) -> Option<SharedValue> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Is the map empty?
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Atomic counter
#[derive(Debug, Default)]
pub struct SharedCounter {
    value: AtomicI64,
}

impl SharedCounter {
    /// Create a counter starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the current value
    pub fn load(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Store a value
    pub fn store(&self, value: i64) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Add and return the new value
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

/// Mutex-protected shared slot
#[derive(Debug, Default)]
pub struct SharedMutex {
    inner: Mutex<SharedValue>,
}

impl SharedMutex {
    /// Create with a null payload
    pub fn new(value: SharedValue) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Run a closure under the lock
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut SharedValue) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Clone the current payload
    pub fn load(&self) -> SharedValue {
        self.inner.lock().clone()
    }

    /// Replace the payload
    pub fn store(&self, value: SharedValue) {
        *self.inner.lock() = value;
    }
}

/// Reader-writer-locked shared slot
#[derive(Debug, Default)]
pub struct SharedRwLock {
    inner: RwLock<SharedValue>,
}

impl SharedRwLock {
    /// Create with a payload
    pub fn new(value: SharedValue) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Clone the payload under the read lock
    pub fn read(&self) -> SharedValue {
        self.inner.read().clone()
    }

    /// Replace the payload under the write lock
    pub fn write(&self, value: SharedValue) {
        *self.inner.write() = value;
    }
}

/// A cheaply cloneable handle to a shared map
pub type SharedMapHandle = Arc<SharedMap>;
