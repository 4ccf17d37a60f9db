//! Write barrier bookkeeping: card table and remembered set
//!
//! The mutator calls the heap's write barrier on every aggregate store. The
//! barrier records old-to-young edges here (always, in every GC phase) and
//! additionally grays white targets of black sources while incremental
//! marking is active.

use rustc_hash::FxHashSet;

use crate::handle::Handle;

/// Size of a card in bytes
pub const CARD_SIZE: u64 = 512;

/// Card state byte values
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// Card has no recorded cross-generation pointers
    Clean = 0,
    /// Card may contain cross-generation pointers
    Dirty = 1,
}

/// Card table over the mature (old + LOS) address space.
///
/// One byte per 512-byte card. The table grows lazily as the mature space
/// grows; `mark` dirties the card covering an offset before returning.
#[derive(Debug, Default)]
pub struct CardTable {
    cards: Vec<u8>,
}

impl CardTable {
    /// Create an empty card table
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the card covering a mature-space offset as dirty
    pub fn mark(&mut self, offset: u64) {
        let card = (offset / CARD_SIZE) as usize;
        if card >= self.cards.len() {
            self.cards.resize(card + 1, CardState::Clean as u8);
        }
        self.cards[card] = CardState::Dirty as u8;
    }

    /// Check whether the card covering an offset is dirty
    pub fn is_dirty(&self, offset: u64) -> bool {
        let card = (offset / CARD_SIZE) as usize;
        self.cards.get(card).copied() == Some(CardState::Dirty as u8)
    }

    /// Clear all cards (after a minor collection)
    pub fn clear(&mut self) {
        self.cards.fill(CardState::Clean as u8);
    }

    /// Iterate over dirty cards as offset ranges
    pub fn dirty_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.cards
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == CardState::Dirty as u8)
            .map(|(idx, _)| {
                let start = idx as u64 * CARD_SIZE;
                (start, start + CARD_SIZE)
            })
    }

    /// Number of dirty cards
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|state| **state == CardState::Dirty as u8)
            .count()
    }
}

/// Remembered set of mature objects holding young references.
///
/// The precise-source companion of the card table: cards narrow the rescan
/// to 512-byte windows, the remembered set names the exact source objects.
#[derive(Debug, Default)]
pub struct RememberedSet {
    entries: FxHashSet<Handle>,
}

impl RememberedSet {
    /// Create an empty remembered set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mature source object
    pub fn insert(&mut self, source: Handle) {
        self.entries.insert(source);
    }

    /// Remove a source (object died or no longer holds young refs)
    pub fn remove(&mut self, source: Handle) {
        self.entries.remove(&source);
    }

    /// Check membership
    pub fn contains(&self, source: Handle) -> bool {
        self.entries.contains(&source)
    }

    /// Snapshot all sources
    pub fn sources(&self) -> Vec<Handle> {
        self.entries.iter().copied().collect()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of recorded sources
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_marking() {
        let mut table = CardTable::new();
        assert!(!table.is_dirty(0));

        table.mark(100);
        assert!(table.is_dirty(0));
        assert!(table.is_dirty(511));
        assert!(!table.is_dirty(512));

        table.mark(4096);
        assert_eq!(table.dirty_count(), 2);

        table.clear();
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_dirty_ranges() {
        let mut table = CardTable::new();
        table.mark(CARD_SIZE * 3 + 17);

        let ranges: Vec<_> = table.dirty_ranges().collect();
        assert_eq!(ranges, vec![(CARD_SIZE * 3, CARD_SIZE * 4)]);
    }

    #[test]
    fn test_remembered_set() {
        let mut set = RememberedSet::new();
        set.insert(Handle(7));
        set.insert(Handle(7));
        assert_eq!(set.len(), 1);
        assert!(set.contains(Handle(7)));

        set.remove(Handle(7));
        assert!(set.is_empty());
    }
}
