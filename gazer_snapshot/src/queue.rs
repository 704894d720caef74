//! The traversal queue: FIFO of pending memory regions plus the seen set
//! that deduplicates them.
//!
//! The dedup key is `(address, type id)`: the same address may legitimately
//! be recorded under two types (a struct and its first field), but never
//! twice under one.

use rustc_hash::FxHashSet;

use crate::fifo::Fifo;
use crate::framing::QueueEntry;

/// Pre-sized so typical snapshots never rehash during the pause.
const SEEN_CAPACITY: usize = 16 << 10;

/// FIFO of `(address, type, length)` work items with side-table dedup.
pub struct TraversalQueue {
    seen: FxHashSet<(u64, u32)>,
    q: Fifo<QueueEntry>,
}

impl TraversalQueue {
    /// Create an empty queue with the seen set pre-sized.
    pub fn new() -> Self {
        TraversalQueue {
            seen: FxHashSet::with_capacity_and_hasher(SEEN_CAPACITY, Default::default()),
            q: Fifo::new(),
        }
    }

    /// Number of queued entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.q.len()
    }

    /// Whether the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Mark `(addr, type_id)` seen. True exactly when it was not seen
    /// before (and is non-null), i.e. when the caller should record it.
    pub fn should_record(&mut self, addr: u64, type_id: u32) -> bool {
        if addr == 0 {
            return false;
        }
        self.seen.insert((addr, type_id))
    }

    /// Enqueue `(addr, type_id, len)` unless already seen or null.
    ///
    /// Always returns true: "recorded" and "suppressed as duplicate" are
    /// deliberately one outcome, so program code never branches on dedup.
    pub fn push(&mut self, addr: u64, type_id: u32, len: u32) -> bool {
        if self.should_record(addr, type_id) {
            self.q.push_back(QueueEntry {
                type_id,
                len,
                addr,
            });
        }
        true
    }

    /// Remove the oldest entry.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.q.pop_front()
    }
}

impl Default for TraversalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_dedups_on_addr_and_type() {
        let mut q = TraversalQueue::new();
        assert!(q.push(0x100, 1, 0));
        assert!(q.push(0x100, 1, 0), "suppressed push still reports true");
        assert_eq!(q.len(), 1);
        // Same address under a different type is a distinct region.
        assert!(q.push(0x100, 2, 0));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_null_address_never_enqueued() {
        let mut q = TraversalQueue::new();
        assert!(q.push(0, 1, 8));
        assert_eq!(q.len(), 0);
        assert!(!q.should_record(0, 1));
    }

    #[test]
    fn test_pop_is_fifo() {
        let mut q = TraversalQueue::new();
        q.push(0x100, 1, 0);
        q.push(0x200, 1, 16);
        let a = q.pop().unwrap();
        assert_eq!((a.addr, a.type_id, a.len), (0x100, 1, 0));
        let b = q.pop().unwrap();
        assert_eq!((b.addr, b.type_id, b.len), (0x200, 1, 16));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_should_record_marks() {
        let mut q = TraversalQueue::new();
        assert!(q.should_record(0x300, 4));
        assert!(!q.should_record(0x300, 4));
        // A later push of the same key is suppressed too.
        q.push(0x300, 4, 0);
        assert_eq!(q.len(), 0);
    }
}
