//! Patchable call sites.
//!
//! A call instruction compiles to a fast path (identity check, then a near
//! call) and an out-of-line slow path. Instead of rewriting instruction
//! bytes, every site owns a dispatch slot: the link protocol repatches the
//! slot, and the call instruction reads it once per call.

use std::rc::Rc;

use otter_vm_gc::CellId;

use crate::code_block::CodePtr;
use crate::polymorphic_stub::PolymorphicCallStubRoutine;

/// Bytes the fast path of one call instruction occupies.
pub const CALL_FAST_PATH_SIZE: u32 = 24;

/// Bytes the out-of-line slow path of one call occupies.
pub const CALL_SLOW_PATH_SIZE: u32 = 40;

/// Offset of a label inside a code block's generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeLocation(pub u32);

/// Labels recorded for one call during code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLocations {
    /// Start of the inline fast path
    pub fast_path_start: CodeLocation,
    /// Start of the out-of-line slow path
    pub slow_path_start: CodeLocation,
    /// Continuation after the call returns
    pub done: CodeLocation,
}

impl CallLocations {
    /// Labels for the `index`-th call of a block whose inline code ends
    /// at `slow_path_base`, where out-of-line code is appended.
    pub fn for_site(index: usize, slow_path_base: u32) -> Self {
        let index = index as u32;
        let fast_path_start = index * CALL_FAST_PATH_SIZE;
        Self {
            fast_path_start: CodeLocation(fast_path_start),
            slow_path_start: CodeLocation(slow_path_base + index * CALL_SLOW_PATH_SIZE),
            done: CodeLocation(fast_path_start + CALL_FAST_PATH_SIZE),
        }
    }
}

/// Near-call template used by the fast path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NearCallMode {
    /// Call and return to `done`
    Regular,
    /// Shuffle the frame, then jump
    Tail,
}

/// Contents of a site's dispatch slot.
#[derive(Debug, Clone)]
pub enum CallTarget {
    /// Unlinked: every call goes to the slow path
    SlowPath,
    /// Identity check against `expected`, then a near call to `target`
    Guarded {
        /// Cached callee identity
        expected: CellId,
        /// Cached entry point
        target: CodePtr,
    },
    /// Jump into a polymorphic stub routine
    Stub(Rc<PolymorphicCallStubRoutine>),
    /// Generic virtual dispatch on every call
    Virtual,
    /// Unconditional near call, no identity check
    Direct(CodePtr),
}

impl CallTarget {
    /// Whether the slot points at the slow path
    pub fn is_slow_path(&self) -> bool {
        matches!(self, Self::SlowPath)
    }
}

/// A call site in generated code.
#[derive(Debug, Clone)]
pub struct PatchableCallSite {
    locations: CallLocations,
    mode: NearCallMode,
    target: CallTarget,
    patch_count: u32,
}

impl PatchableCallSite {
    /// Site as emitted by code generation: pointing at the slow path.
    pub fn new(locations: CallLocations, mode: NearCallMode) -> Self {
        Self {
            locations,
            mode,
            target: CallTarget::SlowPath,
            patch_count: 0,
        }
    }

    /// Recorded labels
    pub fn locations(&self) -> CallLocations {
        self.locations
    }

    /// Near-call template
    pub fn mode(&self) -> NearCallMode {
        self.mode
    }

    /// Current slot contents
    pub fn target(&self) -> &CallTarget {
        &self.target
    }

    /// Copy of the slot, taken by the call instruction before the callee
    /// runs. Repatching the slot afterwards cannot affect the copy.
    pub fn dispatch(&self) -> CallTarget {
        self.target.clone()
    }

    /// How many times the slot has been rewritten
    pub fn patch_count(&self) -> u32 {
        self.patch_count
    }

    /// Rewrite the slot in one store.
    pub fn repatch(&mut self, target: CallTarget) {
        tracing::trace!(
            target: "otter::calllink",
            at = self.locations.fast_path_start.0,
            from = ?self.target,
            to = ?target,
            "repatch call site"
        );
        self.target = target;
        self.patch_count = self.patch_count.saturating_add(1);
    }

    /// Point the slot back at the slow path. No-op if already there.
    pub fn reset_to_slow_path(&mut self) {
        if !self.target.is_slow_path() {
            self.repatch(CallTarget::SlowPath);
        }
    }
}
