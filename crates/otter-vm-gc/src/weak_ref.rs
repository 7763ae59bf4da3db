//! Weak cells: references that do not keep their target alive.
//!
//! A `WeakCell` is never reported by [`crate::Trace::trace`]. During the
//! weak-reference pass of a collection the owner calls
//! [`WeakCell::visit_weak`] with the marker's [`Liveness`] view, and the
//! cell clears itself if the target was not marked.

use crate::handle::CellId;

/// Answers whether a cell is (still) alive.
///
/// Outside a collection this is "the handle resolves to a cell". During the
/// weak pass of a collection it is "the cell was marked".
pub trait Liveness {
    /// Whether `cell` is alive from the point of view of this view.
    fn is_live(&self, cell: CellId) -> bool;
}

/// A weak reference to a heap cell.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct WeakCell {
    target: Option<CellId>,
}

impl WeakCell {
    /// Create a weak reference to `target`.
    pub const fn new(target: CellId) -> Self {
        Self {
            target: Some(target),
        }
    }

    /// An empty weak reference.
    pub const fn empty() -> Self {
        Self { target: None }
    }

    /// The target, if it is still alive according to `liveness`.
    pub fn get(&self, liveness: &dyn Liveness) -> Option<CellId> {
        self.target.filter(|cell| liveness.is_live(*cell))
    }

    /// The stored target without a liveness check.
    ///
    /// Only use the result for identity comparison, never to access the cell.
    pub fn peek(&self) -> Option<CellId> {
        self.target
    }

    /// Whether a target is stored.
    pub fn is_set(&self) -> bool {
        self.target.is_some()
    }

    /// Replace the target.
    pub fn set(&mut self, target: CellId) {
        self.target = Some(target);
    }

    /// Clear the weak reference.
    pub fn clear(&mut self) {
        self.target = None;
    }

    /// Clear the reference if its target is dead. Returns true if cleared.
    pub fn visit_weak(&mut self, liveness: &dyn Liveness) -> bool {
        match self.target {
            Some(cell) if !liveness.is_live(cell) => {
                self.target = None;
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for WeakCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target {
            Some(cell) => write!(f, "WeakCell({cell:?})"),
            None => f.write_str("WeakCell(empty)"),
        }
    }
}
