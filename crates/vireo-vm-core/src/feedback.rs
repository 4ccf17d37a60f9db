//! Type feedback and polymorphic inline caches

use smallvec::SmallVec;

use crate::shape::ShapeId;
use crate::value::ValueTag;

/// Observations before a monomorphic site is specialized
pub const SPECIALIZE_THRESHOLD: u32 = 100;

/// Distinct tags beyond which a site is megamorphic
pub const MEGAMORPHIC_TAGS: usize = 4;

/// Inline-cache capacity per access site
pub const PIC_CAPACITY: usize = 4;

/// Cache misses before an access site goes megamorphic
pub const PIC_MISS_LIMIT: u32 = 32;

/// Site classification derived from observed tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// No observations yet
    Cold,
    /// One observed tag
    Monomorphic(ValueTag),
    /// Two to four observed tags
    Polymorphic,
    /// More than four tags, or the observation bound tripped
    Megamorphic,
}

/// Per-site record of observed operand tags
#[derive(Debug, Clone, Default)]
pub struct TypeFeedback {
    tags: SmallVec<[ValueTag; 4]>,
    count: u32,
    saturated: bool,
}

impl TypeFeedback {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observed tag
    pub fn observe(&mut self, tag: ValueTag) {
        self.count = self.count.saturating_add(1);
        if self.saturated {
            return;
        }
        if !self.tags.contains(&tag) {
            if self.tags.len() >= MEGAMORPHIC_TAGS {
                self.saturated = true;
            } else {
                self.tags.push(tag);
            }
        }
    }

    /// Total observations
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Classify the site
    pub fn classify(&self) -> Classification {
        if self.saturated {
            return Classification::Megamorphic;
        }
        match self.tags.len() {
            0 => Classification::Cold,
            1 => Classification::Monomorphic(self.tags[0]),
            2..=4 => Classification::Polymorphic,
            _ => Classification::Megamorphic,
        }
    }

    /// Is the site monomorphic on a tag with enough observations to
    /// specialize?
    pub fn ready_to_specialize(&self, tag: ValueTag) -> bool {
        self.count >= SPECIALIZE_THRESHOLD && self.classify() == Classification::Monomorphic(tag)
    }

    /// Reset after deoptimization
    pub fn clear(&mut self) {
        self.tags.clear();
        self.count = 0;
        self.saturated = false;
    }
}

/// One inline-cache entry: shape -> resolved slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicEntry {
    /// Cached shape
    pub shape: ShapeId,
    /// Resolved property slot
    pub slot: u32,
}

/// Polymorphic inline cache for one property-access site.
///
/// Bounded at four entries with least-recently-used eviction; a site whose
/// miss count crosses the limit goes megamorphic and bypasses the cache.
#[derive(Debug, Clone, Default)]
pub struct Pic {
    entries: SmallVec<[PicEntry; PIC_CAPACITY]>,
    misses: u32,
    megamorphic: bool,
}

impl Pic {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a shape; a hit moves the entry to the front (LRU order).
    pub fn lookup(&mut self, shape: ShapeId) -> Option<u32> {
        if self.megamorphic {
            return None;
        }
        let pos = self.entries.iter().position(|e| e.shape == shape)?;
        let entry = self.entries.remove(pos);
        self.entries.insert(0, entry);
        Some(entry.slot)
    }

    /// Record a miss and install the resolved entry, evicting the least
    /// recently used at capacity.
    pub fn install(&mut self, shape: ShapeId, slot: u32) {
        self.misses = self.misses.saturating_add(1);
        if self.megamorphic {
            return;
        }
        if self.misses >= PIC_MISS_LIMIT {
            self.megamorphic = true;
            self.entries.clear();
            return;
        }
        if self.entries.len() >= PIC_CAPACITY {
            self.entries.pop();
        }
        self.entries.insert(0, PicEntry { shape, slot });
    }

    /// Has this site given up on caching?
    pub fn is_megamorphic(&self) -> bool {
        self.megamorphic
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_progression() {
        let mut feedback = TypeFeedback::new();
        assert_eq!(feedback.classify(), Classification::Cold);

        feedback.observe(ValueTag::Int);
        assert_eq!(
            feedback.classify(),
            Classification::Monomorphic(ValueTag::Int)
        );

        feedback.observe(ValueTag::Float);
        assert_eq!(feedback.classify(), Classification::Polymorphic);

        feedback.observe(ValueTag::Str);
        feedback.observe(ValueTag::Array);
        assert_eq!(feedback.classify(), Classification::Polymorphic);

        feedback.observe(ValueTag::Object);
        assert_eq!(feedback.classify(), Classification::Megamorphic);
    }

    #[test]
    fn test_specialization_needs_observations() {
        let mut feedback = TypeFeedback::new();
        for _ in 0..SPECIALIZE_THRESHOLD - 1 {
            feedback.observe(ValueTag::Int);
        }
        assert!(!feedback.ready_to_specialize(ValueTag::Int));
        feedback.observe(ValueTag::Int);
        assert!(feedback.ready_to_specialize(ValueTag::Int));
        assert!(!feedback.ready_to_specialize(ValueTag::Float));
    }

    #[test]
    fn test_clear_resets() {
        let mut feedback = TypeFeedback::new();
        for _ in 0..200 {
            feedback.observe(ValueTag::Int);
        }
        feedback.clear();
        assert_eq!(feedback.classify(), Classification::Cold);
        assert_eq!(feedback.count(), 0);
    }

    #[test]
    fn test_pic_hit_and_lru() {
        let mut pic = Pic::new();
        for i in 0..4 {
            pic.install(ShapeId(i), i);
        }
        assert_eq!(pic.len(), 4);

        // Hit moves shape 1 to the front.
        assert_eq!(pic.lookup(ShapeId(1)), Some(1));
        // Installing a fifth evicts the least recently used.
        pic.install(ShapeId(9), 9);
        assert_eq!(pic.len(), 4);
        assert_eq!(pic.lookup(ShapeId(9)), Some(9));
        assert_eq!(pic.lookup(ShapeId(1)), Some(1));
    }

    #[test]
    fn test_pic_megamorphic_bypass() {
        let mut pic = Pic::new();
        for i in 0..PIC_MISS_LIMIT {
            pic.install(ShapeId(i), i);
        }
        assert!(pic.is_megamorphic());
        assert_eq!(pic.lookup(ShapeId(0)), None);
    }
}
