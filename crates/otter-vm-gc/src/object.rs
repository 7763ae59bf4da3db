//! GC cell header and tracing

use std::cell::Cell;

use crate::handle::CellId;

/// Per-cell GC header.
///
/// Marking runs on the mutator thread at safepoints, so the mark is a
/// plain `Cell` updated through shared references.
pub struct GcHeader {
    /// Mark bits for tri-color marking
    mark: Cell<u8>,
    /// Object type tag
    tag: u8,
}

/// Mark color for tri-color marking
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Not yet visited
    White = 0,
    /// In worklist
    Gray = 1,
    /// Fully scanned
    Black = 2,
}

impl GcHeader {
    /// Create new header
    pub const fn new(tag: u8) -> Self {
        Self {
            mark: Cell::new(MarkColor::White as u8),
            tag,
        }
    }

    /// Get mark color
    pub fn mark(&self) -> MarkColor {
        match self.mark.get() {
            0 => MarkColor::White,
            1 => MarkColor::Gray,
            _ => MarkColor::Black,
        }
    }

    /// Set mark color
    pub fn set_mark(&self, color: MarkColor) {
        self.mark.set(color as u8);
    }

    /// Gray a white cell. Returns true if the color changed.
    pub fn shade(&self) -> bool {
        if self.mark.get() != MarkColor::White as u8 {
            return false;
        }
        self.mark.set(MarkColor::Gray as u8);
        true
    }

    /// Get object tag
    pub fn tag(&self) -> u8 {
        self.tag
    }
}

impl std::fmt::Debug for GcHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcHeader")
            .field("mark", &self.mark())
            .field("tag", &self.tag)
            .finish()
    }
}

/// Trait for cells stored in a [`crate::Heap`].
///
/// `trace` reports every *strong* reference held by the cell. Weak
/// references (see [`crate::WeakCell`]) must not be reported.
pub trait Trace {
    /// Type tag recorded in the cell header.
    fn tag(&self) -> u8 {
        0
    }

    /// Report every strong child reference.
    fn trace(&self, tracer: &mut dyn FnMut(CellId));
}
