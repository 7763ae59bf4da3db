//! Write barrier for incremental marking
//!
//! While marking is in progress the mutator keeps running and may store a
//! reference to a still-white cell into an already-scanned (black) owner.
//! The Dijkstra insertion barrier grays such a target and records it in a
//! buffer that the marker drains at its next step.

use std::cell::RefCell;

use crate::handle::CellId;
use crate::object::{GcHeader, MarkColor};

/// Write barrier buffer for batching barrier operations
///
/// Instead of processing each write barrier immediately, we buffer
/// them and process during the next marking step.
pub struct WriteBarrierBuffer {
    /// Cells grayed by the barrier that still need scanning
    entries: RefCell<Vec<CellId>>,
}

impl WriteBarrierBuffer {
    /// Create a new buffer with default capacity
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new buffer with specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RefCell::new(Vec::with_capacity(capacity)),
        }
    }

    /// Add an entry to the buffer
    pub fn push(&self, cell: CellId) {
        self.entries.borrow_mut().push(cell);
    }

    /// Take all entries from the buffer
    pub fn drain(&self) -> Vec<CellId> {
        std::mem::take(&mut *self.entries.borrow_mut())
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

impl Default for WriteBarrierBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WriteBarrierBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBarrierBuffer")
            .field("pending", &self.len())
            .finish()
    }
}

/// Sink for write barriers on long-lived structures.
///
/// Implemented by [`crate::Heap`]; structures that do not live in the heap
/// themselves (code blocks, call link info) barrier through their owner cell.
pub trait WriteBarrier {
    /// `owner` now references `target`.
    fn write_barrier(&self, owner: CellId, target: CellId);
}

/// Barrier sink for contexts where no collector is running.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBarrier;

impl WriteBarrier for NoBarrier {
    fn write_barrier(&self, _owner: CellId, _target: CellId) {}
}

/// Insertion barrier (Dijkstra-style)
///
/// Called when storing a reference to `to` into a structure owned by
/// `from`. If the owner is black and the target white, the target is grayed
/// and `true` is returned so the caller can queue it for scanning.
#[inline]
pub fn insertion_barrier(from: &GcHeader, to: &GcHeader) -> bool {
    from.mark() == MarkColor::Black && to.shade()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_barrier_buffer() {
        let buffer = WriteBarrierBuffer::with_capacity(3);
        assert!(buffer.is_empty());

        buffer.push(CellId::new(1, 0));
        buffer.push(CellId::new(2, 0));
        assert_eq!(buffer.len(), 2);

        let entries = buffer.drain();
        assert_eq!(entries, vec![CellId::new(1, 0), CellId::new(2, 0)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_insertion_barrier() {
        let from = GcHeader::new(0);
        let to = GcHeader::new(0);

        // White owner: nothing to do, the marker will scan it later.
        assert!(!insertion_barrier(&from, &to));
        assert_eq!(to.mark(), MarkColor::White);

        from.set_mark(MarkColor::Black);
        assert!(insertion_barrier(&from, &to));
        assert_eq!(to.mark(), MarkColor::Gray);

        // Already gray: no second enqueue.
        assert!(!insertion_barrier(&from, &to));
    }
}
