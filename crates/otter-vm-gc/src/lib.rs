//! # Otter VM Garbage Collector
//!
//! Handle-based, incremental, non-moving mark/sweep collector.
//!
//! ## Design
//!
//! - **Handles**: cells are addressed by [`CellId`] (slot index plus
//!   generation); a stale handle never resolves to a newer cell.
//! - **Incremental marking**: tri-color marking in bounded steps taken at
//!   mutator safepoints, with a Dijkstra insertion write barrier.
//! - **Weak cells**: [`WeakCell`] targets are not traced; owners clear them
//!   during the weak-reference pass that runs after marking and before the
//!   sweep.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod barrier;
pub mod handle;
pub mod heap;
pub mod object;
pub mod weak_ref;

pub use barrier::{NoBarrier, WriteBarrier, WriteBarrierBuffer, insertion_barrier};
pub use handle::CellId;
pub use heap::{CollectionReport, GcConfig, GcPhase, GcStats, Heap};
pub use object::{GcHeader, MarkColor, Trace};
pub use weak_ref::{Liveness, WeakCell};
