//! GC heap: a generational slot table with incremental mark/sweep.
//!
//! ## Collection cycle
//!
//! 1. `start_marking(roots)`: reset marks, gray the roots, enter
//!    `GcPhase::Marking`. From here on write barriers are active and new
//!    cells are allocated black.
//! 2. `mark_step(budget)`: called by the mutator at safepoints; scans at
//!    most `budget` gray cells, draining the write barrier buffer first.
//! 3. `finish_collection(roots, weak_pass)`: remark the (possibly changed)
//!    roots, drain marking, run the weak-reference pass against the mark
//!    bits, then sweep every white cell and bump its slot generation.
//!
//! `collect` runs all three back to back.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::barrier::{WriteBarrier, WriteBarrierBuffer, insertion_barrier};
use crate::handle::CellId;
use crate::object::{GcHeader, MarkColor, Trace};
use crate::weak_ref::Liveness;

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Number of allocations since the last collection that makes
    /// [`Heap::should_collect`] return true (default: 4096)
    pub allocation_threshold: usize,
    /// Gray cells scanned per incremental marking step (default: 64)
    pub mark_budget: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            allocation_threshold: 4096,
            mark_budget: 64,
        }
    }
}

/// GC phase for incremental collection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No GC in progress
    Idle = 0,
    /// Incremental marking in progress; write barriers active
    Marking = 1,
}

/// GC statistics
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Number of completed collections
    pub collections: u64,
    /// Cells marked in the last collection
    pub last_marked: usize,
    /// Cells reclaimed in the last collection
    pub last_reclaimed: usize,
    /// Targets grayed by the write barrier, all cycles
    pub barrier_grays: u64,
    /// Time from start of marking to end of sweep, all cycles
    pub total_cycle_time: Duration,
    /// Time from start of marking to end of sweep, last cycle
    pub last_cycle_time: Duration,
}

/// Outcome of a completed collection.
#[derive(Debug, Default, Clone)]
pub struct CollectionReport {
    /// Cells marked live
    pub marked: usize,
    /// Handles of the cells that were swept
    pub reclaimed: Vec<CellId>,
}

struct Slot<T> {
    generation: u32,
    header: GcHeader,
    value: Option<T>,
}

/// Heap of cells of type `T`, addressed by [`CellId`].
pub struct Heap<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    live_count: usize,
    allocated_since_gc: usize,
    config: GcConfig,
    phase: GcPhase,
    worklist: VecDeque<CellId>,
    barrier_buffer: WriteBarrierBuffer,
    barrier_grays: std::cell::Cell<u64>,
    marked_this_cycle: usize,
    mark_start: Option<Instant>,
    stats: GcStats,
}

impl<T: Trace> Heap<T> {
    /// Create new heap with default config
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    /// Create new heap with custom config
    pub fn with_config(config: GcConfig) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live_count: 0,
            allocated_since_gc: 0,
            config,
            phase: GcPhase::Idle,
            worklist: VecDeque::new(),
            barrier_buffer: WriteBarrierBuffer::new(),
            barrier_grays: std::cell::Cell::new(0),
            marked_this_cycle: 0,
            mark_start: None,
            stats: GcStats::default(),
        }
    }

    /// Get config
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Allocate a cell.
    ///
    /// Cells allocated while marking is in progress are allocated black so
    /// the sweep of the current cycle cannot reclaim them.
    pub fn allocate(&mut self, value: T) -> CellId {
        let header = GcHeader::new(value.tag());
        if self.phase == GcPhase::Marking {
            header.set_mark(MarkColor::Black);
        }

        let id = if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.header = header;
            slot.value = Some(value);
            CellId::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                header,
                value: Some(value),
            });
            CellId::new(index, 0)
        };

        self.live_count += 1;
        self.allocated_since_gc += 1;
        id
    }

    fn slot(&self, cell: CellId) -> Option<&Slot<T>> {
        self.slots
            .get(cell.index() as usize)
            .filter(|slot| slot.generation == cell.generation() && slot.value.is_some())
    }

    /// Resolve a handle.
    pub fn get(&self, cell: CellId) -> Option<&T> {
        self.slot(cell).and_then(|slot| slot.value.as_ref())
    }

    /// Resolve a handle mutably.
    pub fn get_mut(&mut self, cell: CellId) -> Option<&mut T> {
        self.slots
            .get_mut(cell.index() as usize)
            .filter(|slot| slot.generation == cell.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    /// Whether the handle resolves to a live cell.
    pub fn contains(&self, cell: CellId) -> bool {
        self.slot(cell).is_some()
    }

    /// Header of a live cell.
    pub fn header(&self, cell: CellId) -> Option<&GcHeader> {
        self.slot(cell).map(|slot| &slot.header)
    }

    /// Number of live cells.
    pub fn len(&self) -> usize {
        self.live_count
    }

    /// Whether the heap holds no cells.
    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    /// Iterate over live cells.
    pub fn iter(&self) -> impl Iterator<Item = (CellId, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (CellId::new(index as u32, slot.generation), value))
        })
    }

    /// Check if a collection should be triggered.
    pub fn should_collect(&self) -> bool {
        self.phase == GcPhase::Idle && self.allocated_since_gc >= self.config.allocation_threshold
    }

    /// Get the current GC phase.
    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Returns true if incremental marking is in progress.
    #[inline]
    pub fn is_marking(&self) -> bool {
        self.phase == GcPhase::Marking
    }

    /// Get statistics
    pub fn stats(&self) -> GcStats {
        let mut stats = self.stats.clone();
        stats.barrier_grays = self.barrier_grays.get();
        stats
    }

    /// Write barrier: `owner` now holds a reference to `target`.
    ///
    /// Must be called whenever a reference (strong or weak) is stored into a
    /// long-lived structure owned by `owner`. Only does work while marking.
    pub fn write_barrier(&self, owner: CellId, target: CellId) {
        if self.phase != GcPhase::Marking {
            return;
        }
        let (Some(from), Some(to)) = (self.header(owner), self.header(target)) else {
            return;
        };
        if insertion_barrier(from, to) {
            self.barrier_buffer.push(target);
            self.barrier_grays.set(self.barrier_grays.get().saturating_add(1));
        }
    }

    /// Start an incremental GC cycle.
    ///
    /// Does nothing if marking is already in progress.
    pub fn start_marking(&mut self, roots: &[CellId]) {
        if self.phase == GcPhase::Marking {
            return;
        }

        for slot in &self.slots {
            if slot.value.is_some() {
                slot.header.set_mark(MarkColor::White);
            }
        }
        self.worklist.clear();
        self.barrier_buffer.drain();
        self.marked_this_cycle = 0;

        self.shade_roots(roots);

        self.mark_start = Some(Instant::now());
        self.phase = GcPhase::Marking;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            roots = roots.len(),
            cells = self.live_count,
            "marking started"
        );
    }

    fn shade_roots(&mut self, roots: &[CellId]) {
        for &root in roots {
            if let Some(slot) = self.slot(root) {
                if slot.header.shade() {
                    self.worklist.push_back(root);
                }
            }
        }
    }

    /// Process up to `budget` gray cells.
    ///
    /// Returns `true` when marking is complete (worklist and barrier buffer
    /// both empty) or when no marking is in progress.
    pub fn mark_step(&mut self, budget: usize) -> bool {
        if self.phase != GcPhase::Marking {
            return true;
        }

        let Self {
            slots,
            worklist,
            barrier_buffer,
            marked_this_cycle,
            ..
        } = self;

        // Barrier entries are already gray.
        worklist.extend(barrier_buffer.drain());

        let mut processed = 0;
        while processed < budget {
            let Some(cell) = worklist.pop_front() else {
                break;
            };
            let Some(slot) = slots
                .get(cell.index() as usize)
                .filter(|slot| slot.generation == cell.generation())
            else {
                continue;
            };
            let Some(value) = slot.value.as_ref() else {
                continue;
            };
            if slot.header.mark() == MarkColor::Black {
                continue;
            }

            value.trace(&mut |child| {
                let child_slot = slots
                    .get(child.index() as usize)
                    .filter(|s| s.generation == child.generation() && s.value.is_some());
                if let Some(child_slot) = child_slot {
                    if child_slot.header.shade() {
                        worklist.push_back(child);
                    }
                }
            });

            slot.header.set_mark(MarkColor::Black);
            *marked_this_cycle += 1;
            processed += 1;
        }

        worklist.is_empty() && barrier_buffer.is_empty()
    }

    /// Finish the current cycle: remark `roots`, drain marking, run
    /// `weak_pass` against the mark bits, then sweep.
    ///
    /// Starts a cycle first if none is in progress.
    pub fn finish_collection(
        &mut self,
        roots: &[CellId],
        weak_pass: impl FnOnce(&dyn Liveness),
    ) -> CollectionReport {
        if self.phase != GcPhase::Marking {
            self.start_marking(roots);
        } else {
            self.shade_roots(roots);
        }

        while !self.mark_step(usize::MAX) {}

        weak_pass(&MarkedView { heap: self });

        let reclaimed = self.sweep();
        let marked = self.marked_this_cycle;

        let elapsed = self
            .mark_start
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        self.stats.collections += 1;
        self.stats.last_marked = marked;
        self.stats.last_reclaimed = reclaimed.len();
        self.stats.total_cycle_time += elapsed;
        self.stats.last_cycle_time = elapsed;
        self.allocated_since_gc = 0;
        self.phase = GcPhase::Idle;

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "otter::gc",
            collection = self.stats.collections,
            marked,
            reclaimed = reclaimed.len(),
            live = self.live_count,
            cycle_us = elapsed.as_micros() as u64,
            "GC cycle complete"
        );

        CollectionReport { marked, reclaimed }
    }

    /// Perform a full collection in one go.
    pub fn collect(
        &mut self,
        roots: &[CellId],
        weak_pass: impl FnOnce(&dyn Liveness),
    ) -> CollectionReport {
        self.finish_collection(roots, weak_pass)
    }

    fn sweep(&mut self) -> Vec<CellId> {
        let mut reclaimed = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.is_none() {
                continue;
            }
            if slot.header.mark() == MarkColor::White {
                let dead = CellId::new(index as u32, slot.generation);
                slot.value = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
                reclaimed.push(dead);
            } else {
                slot.header.set_mark(MarkColor::White);
            }
        }
        self.live_count -= reclaimed.len();
        reclaimed
    }
}

impl<T: Trace> Default for Heap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Trace> WriteBarrier for Heap<T> {
    fn write_barrier(&self, owner: CellId, target: CellId) {
        Heap::write_barrier(self, owner, target);
    }
}

impl<T: Trace> Liveness for Heap<T> {
    fn is_live(&self, cell: CellId) -> bool {
        self.contains(cell)
    }
}

impl<T> std::fmt::Debug for Heap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("live", &self.live_count)
            .field("slots", &self.slots.len())
            .field("phase", &self.phase)
            .finish()
    }
}

/// Liveness by mark bit, handed to the weak-reference pass.
struct MarkedView<'a, T> {
    heap: &'a Heap<T>,
}

impl<T: Trace> Liveness for MarkedView<'_, T> {
    fn is_live(&self, cell: CellId) -> bool {
        self.heap
            .header(cell)
            .is_some_and(|header| header.mark() != MarkColor::White)
    }
}
