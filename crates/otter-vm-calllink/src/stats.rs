//! Call linking counters.

use serde::Serialize;

/// Snapshot of call linking counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallLinkStats {
    /// Calls that went through the slow path.
    pub slow_path_calls: u64,
    /// Init -> Monomorphic links.
    pub monomorphic_links: u64,
    /// Monomorphic -> Polymorphic links.
    pub polymorphic_links: u64,
    /// Polymorphic stubs regenerated with an extra case.
    pub stub_regenerations: u64,
    /// Sites sent to virtual dispatch.
    pub virtual_transitions: u64,
    /// Calls dispatched generically through a virtual site.
    pub virtual_calls: u64,
    /// Calls that took a guarded, stub or direct fast path.
    pub fast_path_hits: u64,
    /// Sites unlinked by the weak-reference pass.
    pub gc_unlinks: u64,
    /// Stub cases pruned by the weak-reference pass.
    pub gc_case_prunes: u64,
    /// Sites retargeted in place after code replacement.
    pub upgrades: u64,
    /// Sites unlinked because their target code was jettisoned.
    pub jettison_unlinks: u64,
    /// Type errors raised at call sites.
    pub type_errors: u64,
}

impl CallLinkStats {
    pub(crate) fn bump(counter: &mut u64) {
        *counter = counter.saturating_add(1);
    }

    /// Render as JSON, for `OTTER_JIT_STATS`-style dumps.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
