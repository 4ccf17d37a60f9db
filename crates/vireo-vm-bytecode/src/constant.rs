//! Constant pool for compiled functions

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::symbols::SymbolId;

/// A constant value in the constant pool
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point number
    Float(f64),
    /// Interned string / identifier
    Str(SymbolId),
}

impl Constant {
    /// Check if this is a numeric constant
    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    /// Get as i64 if this is an integer constant
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as symbol if this is a string constant
    #[inline]
    pub fn as_symbol(&self) -> Option<SymbolId> {
        match self {
            Self::Str(s) => Some(*s),
            _ => None,
        }
    }
}

/// Dedup key: f64 constants compare by bit pattern so that the pool can
/// distinguish 0.0 from -0.0 and deduplicate NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(SymbolId),
}

impl From<Constant> for ConstKey {
    fn from(c: Constant) -> Self {
        match c {
            Constant::Null => Self::Null,
            Constant::Bool(b) => Self::Bool(b),
            Constant::Int(n) => Self::Int(n),
            Constant::Float(f) => Self::Float(f.to_bits()),
            Constant::Str(s) => Self::Str(s),
        }
    }
}

/// A deduplicating constant pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    #[serde(skip)]
    index: FxHashMap<ConstKey, u16>,
}

impl ConstantPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant, returning its pool index. Duplicates are coalesced.
    pub fn add(&mut self, constant: Constant) -> u16 {
        let key = ConstKey::from(constant);
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.entries.len() as u16;
        self.entries.push(constant);
        self.index.insert(key, idx);
        idx
    }

    /// Add an integer constant
    pub fn add_int(&mut self, n: i64) -> u16 {
        self.add(Constant::Int(n))
    }

    /// Add a float constant
    pub fn add_float(&mut self, f: f64) -> u16 {
        self.add(Constant::Float(f))
    }

    /// Add an interned string constant
    pub fn add_str(&mut self, sym: SymbolId) -> u16 {
        self.add(Constant::Str(sym))
    }

    /// Get a constant by index
    #[inline]
    pub fn get(&self, index: u16) -> Option<Constant> {
        self.entries.get(index as usize).copied()
    }

    /// Number of constants
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all constants
    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.entries.iter()
    }

    /// Rebuild the dedup index after deserialization
    pub fn rebuild_index(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, &c)| (ConstKey::from(c), i as u16))
            .collect();
    }
}
