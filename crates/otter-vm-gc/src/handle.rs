//! Generational cell handles.

use std::fmt;

/// Stable identity of a heap cell.
///
/// A handle is an index into the heap's slot table plus the generation the
/// slot had when the cell was allocated. Sweeping a slot bumps its
/// generation, so a stale handle can never resolve to a newer cell that
/// reuses the same slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId {
    index: u32,
    generation: u32,
}

impl CellId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index inside the owning heap.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot at allocation time.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a single word, e.g. for identity comparison in dispatch code.
    #[inline]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`CellId::to_bits`].
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self::new(bits as u32, (bits >> 32) as u32)
    }
}

impl fmt::Debug for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellId({}v{})", self.index, self.generation)
    }
}
