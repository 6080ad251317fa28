//! Reference counting for host-held guest pointers.
//!
//! The guest module runs its own garbage collector; between two host calls
//! it may reclaim any object the host is not explicitly holding. Pinning is
//! the only mechanism preventing host-held pointers (arguments being
//! written, results being read, long-lived internrefs) from being silently
//! invalidated. [`RefTable`] keeps the count bookkeeping; the owning handle
//! issues the actual `__pin`/`__unpin` calls.
//!
//! Each table is owned by, and private to, one contract handle - never a
//! process-wide singleton - so concurrent instances stay isolated.

use rampart_core::GuestPtr;
use std::collections::HashMap;
use std::num::NonZeroU32;

/// Pin count table for one contract instance.
///
/// Invariant: an entry exists if and only if its pointer is currently
/// pinned in the guest, and its count is at least 1.
#[derive(Debug, Default)]
pub struct RefTable {
    entries: HashMap<GuestPtr, NonZeroU32>,
}

impl RefTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Current count for a pointer; 0 means untracked
    #[must_use]
    pub fn count(&self, ptr: GuestPtr) -> u32 {
        self.entries.get(&ptr).map_or(0, |c| c.get())
    }

    /// Whether a pointer is tracked
    #[must_use]
    pub fn tracked(&self, ptr: GuestPtr) -> bool {
        self.entries.contains_key(&ptr)
    }

    /// Increment the count if the pointer is already tracked.
    ///
    /// Returns false for an untracked pointer, in which case the caller
    /// must pin it in the guest and then [`insert_new`](Self::insert_new)
    /// the canonical pointer.
    pub fn increment_if_tracked(&mut self, ptr: GuestPtr) -> bool {
        match self.entries.get_mut(&ptr) {
            Some(count) => {
                *count = count.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// Track a freshly pinned pointer with count 1
    pub fn insert_new(&mut self, ptr: GuestPtr) {
        debug_assert!(!self.entries.contains_key(&ptr));
        self.entries.insert(ptr, NonZeroU32::MIN);
    }

    /// Decrement a count known to be above 1
    pub fn decrement(&mut self, ptr: GuestPtr) {
        if let Some(count) = self.entries.get_mut(&ptr) {
            debug_assert!(count.get() > 1);
            if let Some(next) = NonZeroU32::new(count.get() - 1) {
                *count = next;
            }
        }
    }

    /// Drop a pointer whose count reached 1 and whose unpin succeeded
    pub fn remove(&mut self, ptr: GuestPtr) {
        self.entries.remove(&ptr);
    }

    /// Forget every entry (used at disposal; the guest is torn down with
    /// its pins)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of tracked pointers
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no pointers are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: u32) -> GuestPtr {
        GuestPtr::from_raw(raw)
    }

    #[test]
    fn test_untracked_count_is_zero() {
        let table = RefTable::new();
        assert_eq!(table.count(p(64)), 0);
        assert!(!table.tracked(p(64)));
    }

    #[test]
    fn test_insert_then_increment() {
        let mut table = RefTable::new();
        assert!(!table.increment_if_tracked(p(64)));
        table.insert_new(p(64));
        assert_eq!(table.count(p(64)), 1);
        assert!(table.increment_if_tracked(p(64)));
        assert_eq!(table.count(p(64)), 2);
    }

    #[test]
    fn test_decrement_keeps_entry_above_zero() {
        let mut table = RefTable::new();
        table.insert_new(p(64));
        table.increment_if_tracked(p(64));
        table.decrement(p(64));
        assert_eq!(table.count(p(64)), 1);
        assert!(table.tracked(p(64)));
    }

    #[test]
    fn test_remove_drops_entry() {
        let mut table = RefTable::new();
        table.insert_new(p(64));
        table.remove(p(64));
        assert!(!table.tracked(p(64)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_balanced_sequence_leaves_table_empty() {
        let mut table = RefTable::new();
        let ptrs = [p(16), p(32), p(48)];
        for ptr in ptrs {
            table.insert_new(ptr);
            table.increment_if_tracked(ptr);
            table.increment_if_tracked(ptr);
        }
        for ptr in ptrs {
            table.decrement(ptr);
            table.decrement(ptr);
            assert_eq!(table.count(ptr), 1);
            table.remove(ptr);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut table = RefTable::new();
        table.insert_new(p(16));
        table.insert_new(p(32));
        table.clear();
        assert_eq!(table.len(), 0);
    }
}
