//! Polymorphic call stubs.
//!
//! A stub routine is the dispatch code for a site that has seen more than
//! one callee: compare the callee against each case in discovery order,
//! jump to the first match, otherwise fall through to the slow path.
//! Routines are immutable once built. Growing, pruning or retargeting a
//! stub builds a new routine which the link protocol swaps into the site.

use std::cell::Cell;

use otter_vm_gc::{CellId, Liveness};

use crate::code_block::{CodeBlockId, CodePtr};

/// What a stub case matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallVariant {
    /// One specific function object
    Function {
        /// The function
        callee: CellId,
        /// Its executable
        executable: CellId,
    },
    /// Any function created from this executable (closure call)
    Closure {
        /// The shared executable
        executable: CellId,
    },
}

impl CallVariant {
    /// Executable the variant runs
    pub fn executable(&self) -> CellId {
        match *self {
            Self::Function { executable, .. } | Self::Closure { executable } => executable,
        }
    }

    /// Whether this is a closure-call variant
    pub fn is_closure_call(&self) -> bool {
        matches!(self, Self::Closure { .. })
    }

    /// Widen to a closure-call variant.
    pub fn despecified(self) -> Self {
        Self::Closure {
            executable: self.executable(),
        }
    }

    /// Identity check. Only compares saved ids, never dereferences.
    #[inline]
    pub fn matches(&self, callee: CellId, executable: CellId) -> bool {
        match *self {
            Self::Function { callee: expected, .. } => expected == callee,
            Self::Closure { executable: expected } => expected == executable,
        }
    }

    /// Every cell the variant refers to (weakly).
    pub fn for_each_cell(&self, visitor: &mut dyn FnMut(CellId)) {
        match *self {
            Self::Function { callee, executable } => {
                visitor(callee);
                visitor(executable);
            }
            Self::Closure { executable } => visitor(executable),
        }
    }

    fn is_live(&self, liveness: &dyn Liveness) -> bool {
        let mut live = true;
        self.for_each_cell(&mut |cell| live &= liveness.is_live(cell));
        live
    }
}

/// One (variant -> target) entry of a stub.
#[derive(Debug, Clone)]
pub struct PolymorphicCallCase {
    variant: CallVariant,
    target: CodePtr,
    hits: Cell<u64>,
}

impl PolymorphicCallCase {
    /// Create a case
    pub fn new(variant: CallVariant, target: CodePtr) -> Self {
        Self {
            variant,
            target,
            hits: Cell::new(0),
        }
    }

    /// Matched variant
    pub fn variant(&self) -> CallVariant {
        self.variant
    }

    /// Jump target
    pub fn target(&self) -> CodePtr {
        self.target
    }

    /// Dispatches that matched this case
    pub fn hits(&self) -> u64 {
        self.hits.get()
    }
}

/// Unique id of a generated stub routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StubRoutineId(u64);

/// Hands out stub routine ids.
#[derive(Debug, Default)]
pub struct StubIdAllocator {
    next: u64,
}

impl StubIdAllocator {
    /// Next unused id
    pub fn next_id(&mut self) -> StubRoutineId {
        self.next += 1;
        StubRoutineId(self.next)
    }
}

/// Result of growing a stub by one case.
#[derive(Debug)]
pub enum StubGrowth {
    /// A routine holding every case
    Built {
        /// The new routine
        routine: PolymorphicCallStubRoutine,
        /// Cases were widened to closure calls
        despecified: bool,
    },
    /// More distinct cases than the capacity allows
    Overflow,
}

/// Generated dispatch code for a polymorphic site.
#[derive(Debug)]
pub struct PolymorphicCallStubRoutine {
    id: StubRoutineId,
    cases: Vec<PolymorphicCallCase>,
}

impl PolymorphicCallStubRoutine {
    pub(crate) fn new(id: StubRoutineId, cases: Vec<PolymorphicCallCase>) -> Self {
        Self { id, cases }
    }

    /// Build a routine from `existing` cases plus one newly observed case.
    ///
    /// Cases keep discovery order. If two cases run the same executable all
    /// cases are widened to closure calls and merged. Exceeding `capacity`
    /// distinct cases yields [`StubGrowth::Overflow`]; the caller must not
    /// build a larger stub.
    pub fn grow(
        id: StubRoutineId,
        existing: &[PolymorphicCallCase],
        variant: CallVariant,
        target: CodePtr,
        capacity: usize,
    ) -> StubGrowth {
        let mut cases: Vec<PolymorphicCallCase> = existing.to_vec();
        cases.push(PolymorphicCallCase::new(variant, target));

        let shares_executable = cases.iter().enumerate().any(|(i, a)| {
            cases[i + 1..]
                .iter()
                .any(|b| a.variant.executable() == b.variant.executable())
        });
        let despecify = shares_executable || cases.iter().any(|c| c.variant.is_closure_call());
        let despecified = despecify && cases.iter().any(|c| !c.variant.is_closure_call());

        let mut merged: Vec<PolymorphicCallCase> = Vec::with_capacity(cases.len());
        for mut case in cases {
            if despecify {
                case.variant = case.variant.despecified();
            }
            if let Some(seen) = merged.iter().find(|c| c.variant == case.variant) {
                seen.hits.set(seen.hits.get().saturating_add(case.hits.get()));
            } else {
                merged.push(case);
            }
        }

        if merged.len() > capacity {
            return StubGrowth::Overflow;
        }
        StubGrowth::Built {
            routine: Self::new(id, merged),
            despecified,
        }
    }

    /// Routine id
    pub fn id(&self) -> StubRoutineId {
        self.id
    }

    /// Cases in dispatch order
    pub fn cases(&self) -> &[PolymorphicCallCase] {
        &self.cases
    }

    /// Number of cases
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Whether no case is left
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Run the dispatch: the target of the first matching case, or `None`
    /// for the slow-path fallthrough.
    pub fn dispatch(&self, callee: CellId, executable: CellId) -> Option<CodePtr> {
        let case = self
            .cases
            .iter()
            .find(|case| case.variant.matches(callee, executable))?;
        case.hits.set(case.hits.get().saturating_add(1));
        Some(case.target)
    }

    /// Whether some case jumps into `code_block`
    pub fn targets(&self, code_block: CodeBlockId) -> bool {
        self.cases
            .iter()
            .any(|case| case.target.code_block() == code_block)
    }

    /// Every cell referenced by any case.
    pub fn for_each_dependent_cell(&self, visitor: &mut dyn FnMut(CellId)) {
        for case in &self.cases {
            case.variant.for_each_cell(visitor);
        }
    }

    /// Same routine with cases into `old` retargeted to `new`.
    pub(crate) fn retargeted(&self, old: CodeBlockId, new: CodePtr) -> Self {
        let cases = self
            .cases
            .iter()
            .map(|case| {
                let mut case = case.clone();
                if case.target.code_block() == old {
                    case.target = new;
                }
                case
            })
            .collect();
        Self::new(self.id, cases)
    }

    /// Same routine without cases into `code_block`.
    pub(crate) fn without_target(&self, code_block: CodeBlockId) -> Self {
        self.filtered(|case| case.target.code_block() != code_block)
    }

    /// Same routine without cases whose cells died. `None` if every case
    /// is still alive.
    pub(crate) fn pruned(&self, liveness: &dyn Liveness) -> Option<Self> {
        if self.cases.iter().all(|case| case.variant.is_live(liveness)) {
            return None;
        }
        Some(self.filtered(|case| case.variant.is_live(liveness)))
    }

    fn filtered(&self, keep: impl Fn(&PolymorphicCallCase) -> bool) -> Self {
        Self::new(
            self.id,
            self.cases.iter().filter(|case| keep(case)).cloned().collect(),
        )
    }
}
