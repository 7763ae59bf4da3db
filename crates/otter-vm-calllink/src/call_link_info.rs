//! Per-call-site link state.
//!
//! ## State machine
//!
//! ```text
//!            link                grow stub             overflow / disallow
//!   Init ───────────► Monomorphic ─────────► Polymorphic ───────────► Virtual
//!    │ ▲  non-cacheable                            │  ▲                  ▲
//!    │ └──────────── unlink (GC / jettison) ◄──────┘  └── grow ──┘       │
//!    └──────────────────────────────────────────────────────────────────┘
//!   Init ──► LinkedDirect        (direct call types only)
//! ```
//!
//! Every state owns exactly the data it needs (see [`LinkState`]), so a
//! Monomorphic site always has one callee and one target, a Polymorphic
//! site always has a stub, and Init/Virtual sites have neither.

use std::fmt;
use std::rc::Rc;

use otter_vm_gc::{CellId, Liveness, WeakCell, WriteBarrier};

use crate::call_site::{CallLocations, CallTarget, NearCallMode, PatchableCallSite};
use crate::code_block::{CodeBlockId, CodePtr};
use crate::error::LinkError;
use crate::polymorphic_stub::PolymorphicCallStubRoutine;
use crate::value::SpecializationKind;

/// Kind of call instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    /// `f(a, b)`
    Call,
    /// `f(...args)`
    CallVarargs,
    /// `new F(a, b)`
    Construct,
    /// `new F(...args)`
    ConstructVarargs,
    /// `return f(a, b)` in tail position
    TailCall,
    /// `return f(...args)` in tail position
    TailCallVarargs,
    /// Call with a target known at compile time
    DirectCall,
    /// Construct with a target known at compile time
    DirectConstruct,
    /// Tail call with a target known at compile time
    DirectTailCall,
}

/// How a call transfers control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Ordinary call
    Regular,
    /// Tail call: the caller frame is replaced
    Tail,
    /// Construct call
    Construct,
}

impl CallType {
    /// Call mode of this call type
    pub fn call_mode(self) -> CallMode {
        match self {
            Self::TailCall | Self::TailCallVarargs | Self::DirectTailCall => CallMode::Tail,
            Self::Construct | Self::ConstructVarargs | Self::DirectConstruct => CallMode::Construct,
            Self::Call | Self::CallVarargs | Self::DirectCall => CallMode::Regular,
        }
    }

    /// Target fixed at compile time; no identity check
    pub fn is_direct(self) -> bool {
        matches!(
            self,
            Self::DirectCall | Self::DirectConstruct | Self::DirectTailCall
        )
    }

    /// Argument count only known at run time
    pub fn is_varargs(self) -> bool {
        matches!(
            self,
            Self::CallVarargs | Self::ConstructVarargs | Self::TailCallVarargs
        )
    }

    /// Executable entry the callee must provide
    pub fn specialization(self) -> SpecializationKind {
        match self.call_mode() {
            CallMode::Construct => SpecializationKind::Construct,
            CallMode::Regular | CallMode::Tail => SpecializationKind::Call,
        }
    }

    /// Near-call template of the fast path
    pub fn near_call_mode(self) -> NearCallMode {
        match self.call_mode() {
            CallMode::Tail => NearCallMode::Tail,
            CallMode::Regular | CallMode::Construct => NearCallMode::Regular,
        }
    }
}

/// What code generation knows about one call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSiteDescriptor {
    /// Kind of call
    pub call_type: CallType,
    /// Bytecode offset of the call instruction
    pub bytecode_index: u32,
}

impl CallSiteDescriptor {
    /// Create a descriptor
    pub fn new(call_type: CallType, bytecode_index: u32) -> Self {
        Self {
            call_type,
            bytecode_index,
        }
    }
}

/// Observable link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkMode {
    /// Unlinked; calls take the slow path
    Init,
    /// One cached callee
    Monomorphic,
    /// A stub with several cases
    Polymorphic,
    /// Generic dispatch, permanently
    Virtual,
    /// Compile-time-known target
    LinkedDirect,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Monomorphic => "monomorphic",
            Self::Polymorphic => "polymorphic",
            Self::Virtual => "virtual",
            Self::LinkedDirect => "linked-direct",
        };
        f.write_str(name)
    }
}

/// Per-mode storage.
#[derive(Debug, Clone)]
pub enum LinkState {
    /// Init
    Unlinked,
    /// Monomorphic
    Monomorphic {
        /// Cached callee, held weakly
        callee: WeakCell,
        /// Entry point of the callee's code
        target: CodePtr,
    },
    /// Polymorphic
    Polymorphic {
        /// Current stub routine
        stub: Rc<PolymorphicCallStubRoutine>,
    },
    /// Virtual
    Virtual,
    /// LinkedDirect
    Direct {
        /// Executable the target was compiled from, held weakly
        executable: WeakCell,
        /// Entry point
        target: CodePtr,
    },
}

impl LinkState {
    fn mode(&self) -> LinkMode {
        match self {
            Self::Unlinked => LinkMode::Init,
            Self::Monomorphic { .. } => LinkMode::Monomorphic,
            Self::Polymorphic { .. } => LinkMode::Polymorphic,
            Self::Virtual => LinkMode::Virtual,
            Self::Direct { .. } => LinkMode::LinkedDirect,
        }
    }
}

/// Effect of [`CallLinkInfo::unlink_or_upgrade`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelinkOutcome {
    /// The site does not target the replaced code
    Unaffected,
    /// Retargeted in place; link mode unchanged
    Upgraded,
    /// Sent back to Init
    Unlinked,
    /// Stub lost this many cases and kept the rest
    CasesDropped(usize),
}

/// Effect of [`CallLinkInfo::visit_weak`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakVisitOutcome {
    /// Every cached cell is alive
    Unchanged,
    /// The cached callee died; site back to Init
    Unlinked,
    /// This many stub cases died; the rest stay linked
    Pruned(usize),
}

/// Runtime record of one call instruction.
#[derive(Debug, Clone)]
pub struct CallLinkInfo {
    code_origin: u32,
    call_type: CallType,
    state: LinkState,
    site: PatchableCallSite,
    last_seen_callee: WeakCell,
    seen_once: bool,
    has_seen_closure: bool,
    cleared_by_gc: bool,
    cleared_by_virtual: bool,
    allow_stubs: bool,
    slow_path_count: u32,
    max_argument_count_including_this_for_varargs: u32,
    varargs_ceiling: u32,
    max_argument_count_including_this: u32,
}

impl CallLinkInfo {
    /// Fresh, unlinked site for `descriptor` with its generated-code labels.
    pub fn new(descriptor: CallSiteDescriptor, locations: CallLocations, varargs_ceiling: u32) -> Self {
        Self {
            code_origin: descriptor.bytecode_index,
            call_type: descriptor.call_type,
            state: LinkState::Unlinked,
            site: PatchableCallSite::new(locations, descriptor.call_type.near_call_mode()),
            last_seen_callee: WeakCell::empty(),
            seen_once: false,
            has_seen_closure: false,
            cleared_by_gc: false,
            cleared_by_virtual: false,
            allow_stubs: true,
            slow_path_count: 0,
            max_argument_count_including_this_for_varargs: 0,
            varargs_ceiling,
            max_argument_count_including_this: 0,
        }
    }

    /// Bytecode index of the call instruction
    pub fn code_origin(&self) -> u32 {
        self.code_origin
    }

    /// Kind of call
    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Call mode derived from the call type
    pub fn call_mode(&self) -> CallMode {
        self.call_type.call_mode()
    }

    /// Whether the call type is direct
    pub fn is_direct(&self) -> bool {
        self.call_type.is_direct()
    }

    /// Whether the call type is varargs
    pub fn is_varargs(&self) -> bool {
        self.call_type.is_varargs()
    }

    /// Whether the call is a tail call
    pub fn is_tail_call(&self) -> bool {
        self.call_mode() == CallMode::Tail
    }

    /// Current link mode
    pub fn mode(&self) -> LinkMode {
        self.state.mode()
    }

    /// Current per-mode storage
    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// The patchable site
    pub fn site(&self) -> &PatchableCallSite {
        &self.site
    }

    /// Whether the slow path has run at least once
    pub fn seen_once(&self) -> bool {
        self.seen_once
    }

    /// Whether the site has linked a closure call
    pub fn has_seen_closure(&self) -> bool {
        self.has_seen_closure
    }

    /// Whether the last unlink was done by the weak-reference pass
    pub fn cleared_by_gc(&self) -> bool {
        self.cleared_by_gc
    }

    /// Whether the site went virtual
    pub fn cleared_by_virtual(&self) -> bool {
        self.cleared_by_virtual
    }

    /// Whether polymorphic stubs may be built for the site
    pub fn allow_stubs(&self) -> bool {
        self.allow_stubs
    }

    /// Number of slow-path executions
    pub fn slow_path_count(&self) -> u32 {
        self.slow_path_count
    }

    /// Largest varargs argument count seen, including `this`, capped at
    /// the configured ceiling
    pub fn max_argument_count_including_this_for_varargs(&self) -> u32 {
        self.max_argument_count_including_this_for_varargs
    }

    /// Arity of the direct callee, including `this`
    pub fn max_argument_count_including_this(&self) -> u32 {
        self.max_argument_count_including_this
    }

    /// Last callee the slow path saw, if still alive
    pub fn last_seen_callee(&self, liveness: &dyn Liveness) -> Option<CellId> {
        self.last_seen_callee.get(liveness)
    }

    /// Cached monomorphic callee, if alive
    pub fn monomorphic_callee(&self, liveness: &dyn Liveness) -> Option<CellId> {
        match &self.state {
            LinkState::Monomorphic { callee, .. } => callee.get(liveness),
            _ => None,
        }
    }

    /// Cached target of a monomorphic or direct site
    pub fn cached_target(&self) -> Option<CodePtr> {
        match &self.state {
            LinkState::Monomorphic { target, .. } | LinkState::Direct { target, .. } => {
                Some(*target)
            }
            _ => None,
        }
    }

    /// Current stub of a polymorphic site
    pub fn stub(&self) -> Option<&Rc<PolymorphicCallStubRoutine>> {
        match &self.state {
            LinkState::Polymorphic { stub } => Some(stub),
            _ => None,
        }
    }

    /// Whether the site currently dispatches into `code_block`
    pub fn targets(&self, code_block: CodeBlockId) -> bool {
        match &self.state {
            LinkState::Monomorphic { target, .. } | LinkState::Direct { target, .. } => {
                target.code_block() == code_block
            }
            LinkState::Polymorphic { stub } => stub.targets(code_block),
            LinkState::Unlinked | LinkState::Virtual => false,
        }
    }

    /// Record a slow-path execution for `callee`.
    pub fn record_slow_path(&mut self, callee: CellId) {
        self.slow_path_count = self.slow_path_count.saturating_add(1);
        self.seen_once = true;
        self.last_seen_callee.set(callee);
    }

    /// Raise the varargs argument-count profile to `count`, saturating at
    /// the ceiling. Never decreases.
    pub fn update_max_argument_count_including_this_for_varargs(&mut self, count: u32) {
        let capped = count.min(self.varargs_ceiling);
        if capped > self.max_argument_count_including_this_for_varargs {
            self.max_argument_count_including_this_for_varargs = capped;
        }
    }

    /// Record the direct callee's arity including `this`.
    pub fn set_max_argument_count_including_this(&mut self, count: u32) {
        self.max_argument_count_including_this = count;
    }

    fn reject(&self, operation: &'static str) -> LinkError {
        LinkError {
            operation,
            mode: self.mode(),
        }
    }

    fn transition(&mut self, state: LinkState, target: CallTarget) {
        tracing::debug!(
            target: "otter::calllink",
            origin = self.code_origin,
            from = %self.mode(),
            to = %state.mode(),
            "call link transition"
        );
        self.state = state;
        self.site.repatch(target);
    }

    /// Init -> Monomorphic: cache `callee` and `target`, patch the site to a
    /// guarded call, and barrier the new reference through `owner`.
    pub fn set_monomorphic_callee(
        &mut self,
        barrier: &dyn WriteBarrier,
        owner: CellId,
        callee: CellId,
        target: CodePtr,
    ) -> Result<(), LinkError> {
        if self.mode() != LinkMode::Init || self.is_direct() {
            return Err(self.reject("set monomorphic callee"));
        }
        self.transition(
            LinkState::Monomorphic {
                callee: WeakCell::new(callee),
                target,
            },
            CallTarget::Guarded {
                expected: callee,
                target,
            },
        );
        barrier.write_barrier(owner, callee);
        self.cleared_by_gc = false;
        Ok(())
    }

    /// Monomorphic/Polymorphic -> Polymorphic: jump into `stub`.
    pub fn set_stub(
        &mut self,
        barrier: &dyn WriteBarrier,
        owner: CellId,
        stub: Rc<PolymorphicCallStubRoutine>,
    ) -> Result<(), LinkError> {
        if !matches!(self.mode(), LinkMode::Monomorphic | LinkMode::Polymorphic) {
            return Err(self.reject("set stub"));
        }
        if !self.allow_stubs {
            return Err(self.reject("set stub with stubs disallowed"));
        }
        stub.for_each_dependent_cell(&mut |cell| barrier.write_barrier(owner, cell));
        if stub.cases().iter().any(|case| case.variant().is_closure_call()) {
            self.has_seen_closure = true;
        }
        self.transition(
            LinkState::Polymorphic { stub: stub.clone() },
            CallTarget::Stub(stub),
        );
        Ok(())
    }

    /// Any state -> Virtual. Drops every cached callee, target and stub.
    /// Idempotent.
    pub fn set_virtual_call(&mut self) {
        if self.mode() == LinkMode::Virtual {
            return;
        }
        self.transition(LinkState::Virtual, CallTarget::Virtual);
        self.cleared_by_virtual = true;
    }

    /// Init -> LinkedDirect for direct call types.
    pub fn set_direct_call(
        &mut self,
        barrier: &dyn WriteBarrier,
        owner: CellId,
        executable: CellId,
        target: CodePtr,
    ) -> Result<(), LinkError> {
        if !self.is_direct() || self.mode() != LinkMode::Init {
            return Err(self.reject("set direct call"));
        }
        self.transition(
            LinkState::Direct {
                executable: WeakCell::new(executable),
                target,
            },
            CallTarget::Direct(target),
        );
        barrier.write_barrier(owner, executable);
        self.cleared_by_gc = false;
        Ok(())
    }

    /// Forbid polymorphic stubs; a polymorphic site goes virtual.
    pub fn disallow_stubs(&mut self) {
        self.allow_stubs = false;
        if self.mode() == LinkMode::Polymorphic {
            self.set_virtual_call();
        }
    }

    fn unlink(&mut self) {
        if matches!(self.state, LinkState::Unlinked) {
            self.site.reset_to_slow_path();
            return;
        }
        self.transition(LinkState::Unlinked, CallTarget::SlowPath);
    }

    /// React to the code in `old` being replaced by `new` (or, when `new`
    /// is `None`, being destroyed).
    ///
    /// With a replacement the cached target is rewritten in place and the
    /// link mode is unchanged. Without one the site is unlinked; a stub
    /// only drops the cases into `old`.
    pub fn unlink_or_upgrade(&mut self, old: CodeBlockId, new: Option<CodePtr>) -> RelinkOutcome {
        if !self.targets(old) {
            return RelinkOutcome::Unaffected;
        }

        match (&mut self.state, new) {
            (
                LinkState::Monomorphic { callee, target },
                Some(new),
            ) => {
                *target = new;
                if let Some(expected) = callee.peek() {
                    self.site.repatch(CallTarget::Guarded {
                        expected,
                        target: new,
                    });
                }
                RelinkOutcome::Upgraded
            }
            (LinkState::Direct { target, .. }, Some(new)) => {
                *target = new;
                self.site.repatch(CallTarget::Direct(new));
                RelinkOutcome::Upgraded
            }
            (LinkState::Polymorphic { stub }, Some(new)) => {
                let upgraded = Rc::new(stub.retargeted(old, new));
                *stub = upgraded.clone();
                self.site.repatch(CallTarget::Stub(upgraded));
                RelinkOutcome::Upgraded
            }
            (LinkState::Polymorphic { stub }, None) => {
                let remaining = stub.without_target(old);
                let dropped = stub.len() - remaining.len();
                if remaining.is_empty() {
                    self.unlink();
                    RelinkOutcome::Unlinked
                } else {
                    let remaining = Rc::new(remaining);
                    *stub = remaining.clone();
                    self.site.repatch(CallTarget::Stub(remaining));
                    RelinkOutcome::CasesDropped(dropped)
                }
            }
            (LinkState::Monomorphic { .. } | LinkState::Direct { .. }, None) => {
                self.unlink();
                RelinkOutcome::Unlinked
            }
            (LinkState::Unlinked | LinkState::Virtual, _) => RelinkOutcome::Unaffected,
        }
    }

    /// Restore the slow-path entry. Init and Virtual sites are untouched.
    pub fn revert_call(&mut self) {
        match self.mode() {
            LinkMode::Init | LinkMode::Virtual => {}
            LinkMode::Monomorphic | LinkMode::Polymorphic | LinkMode::LinkedDirect => self.unlink(),
        }
    }

    /// Every heap cell the site refers to.
    pub fn for_each_dependent_cell(&self, visitor: &mut dyn FnMut(CellId)) {
        match &self.state {
            LinkState::Monomorphic { callee, .. } => {
                if let Some(cell) = callee.peek() {
                    visitor(cell);
                }
            }
            LinkState::Polymorphic { stub } => stub.for_each_dependent_cell(visitor),
            LinkState::Direct { executable, .. } => {
                if let Some(cell) = executable.peek() {
                    visitor(cell);
                }
            }
            LinkState::Unlinked | LinkState::Virtual => {}
        }
        if let Some(cell) = self.last_seen_callee.peek() {
            visitor(cell);
        }
    }

    /// Weak-reference pass: drop everything whose cell did not survive.
    pub fn visit_weak(&mut self, liveness: &dyn Liveness) -> WeakVisitOutcome {
        if self.last_seen_callee.visit_weak(liveness) {
            tracing::trace!(target: "otter::calllink", origin = self.code_origin, "last seen callee cleared");
        }

        let outcome = match &mut self.state {
            LinkState::Monomorphic { callee, .. } => {
                if callee.visit_weak(liveness) {
                    WeakVisitOutcome::Unlinked
                } else {
                    WeakVisitOutcome::Unchanged
                }
            }
            LinkState::Direct { executable, .. } => {
                if executable.visit_weak(liveness) {
                    WeakVisitOutcome::Unlinked
                } else {
                    WeakVisitOutcome::Unchanged
                }
            }
            LinkState::Polymorphic { stub } => match stub.pruned(liveness) {
                None => WeakVisitOutcome::Unchanged,
                Some(pruned) if pruned.is_empty() => WeakVisitOutcome::Unlinked,
                Some(pruned) => {
                    let dropped = stub.len() - pruned.len();
                    let pruned = Rc::new(pruned);
                    *stub = pruned.clone();
                    self.site.repatch(CallTarget::Stub(pruned));
                    WeakVisitOutcome::Pruned(dropped)
                }
            },
            LinkState::Unlinked | LinkState::Virtual => WeakVisitOutcome::Unchanged,
        };

        if outcome == WeakVisitOutcome::Unlinked {
            self.unlink();
            self.cleared_by_gc = true;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polymorphic_stub::{CallVariant, PolymorphicCallCase, StubIdAllocator};
    use crate::test_support::{code_ptr, fake_cell};
    use otter_vm_gc::NoBarrier;

    fn info(call_type: CallType) -> CallLinkInfo {
        CallLinkInfo::new(
            CallSiteDescriptor::new(call_type, 12),
            CallLocations::for_site(0, 256),
            255,
        )
    }

    fn stub_of(callees: &[u32]) -> Rc<PolymorphicCallStubRoutine> {
        let cases = callees
            .iter()
            .map(|&n| {
                PolymorphicCallCase::new(
                    CallVariant::Function {
                        callee: fake_cell(n),
                        executable: fake_cell(100 + n),
                    },
                    code_ptr(n as u64),
                )
            })
            .collect();
        Rc::new(PolymorphicCallStubRoutine::new(
            StubIdAllocator::default().next_id(),
            cases,
        ))
    }

    struct DeadSet(Vec<CellId>);

    impl Liveness for DeadSet {
        fn is_live(&self, cell: CellId) -> bool {
            !self.0.contains(&cell)
        }
    }

    #[test]
    fn call_type_properties() {
        assert_eq!(CallType::TailCallVarargs.call_mode(), CallMode::Tail);
        assert!(CallType::TailCallVarargs.is_varargs());
        assert_eq!(CallType::DirectConstruct.call_mode(), CallMode::Construct);
        assert!(CallType::DirectConstruct.is_direct());
        assert_eq!(
            CallType::ConstructVarargs.specialization(),
            SpecializationKind::Construct
        );
        assert_eq!(CallType::DirectTailCall.near_call_mode(), NearCallMode::Tail);
        assert!(!CallType::Call.is_direct());
    }

    #[test]
    fn monomorphic_link_patches_guard() {
        let mut info = info(CallType::Call);
        assert_eq!(info.mode(), LinkMode::Init);

        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();
        assert_eq!(info.mode(), LinkMode::Monomorphic);
        assert_eq!(info.cached_target(), Some(code_ptr(1)));
        assert!(matches!(
            info.site().target(),
            CallTarget::Guarded { expected, .. } if *expected == fake_cell(1)
        ));
    }

    #[test]
    fn monomorphic_requires_init() {
        let mut info = info(CallType::Call);
        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();
        let err = info
            .set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(2), code_ptr(2))
            .unwrap_err();
        assert_eq!(err.mode, LinkMode::Monomorphic);

        let mut direct = self::info(CallType::DirectCall);
        assert!(direct
            .set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .is_err());
    }

    #[test]
    fn stub_requires_linked_site() {
        let mut info = info(CallType::Call);
        assert!(info.set_stub(&NoBarrier, fake_cell(50), stub_of(&[1, 2])).is_err());

        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();
        info.set_stub(&NoBarrier, fake_cell(50), stub_of(&[1, 2])).unwrap();
        assert_eq!(info.mode(), LinkMode::Polymorphic);
        assert_eq!(info.stub().map(|s| s.len()), Some(2));
        assert_eq!(info.cached_target(), None);
    }

    #[test]
    fn virtual_is_idempotent_and_clears_cache() {
        let mut info = info(CallType::Call);
        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();
        info.set_virtual_call();
        let patches = info.site().patch_count();
        info.set_virtual_call();

        assert_eq!(info.mode(), LinkMode::Virtual);
        assert_eq!(info.site().patch_count(), patches);
        assert!(info.cleared_by_virtual());
        assert_eq!(info.cached_target(), None);
        assert!(info.stub().is_none());
    }

    #[test]
    fn disallowing_stubs_sends_polymorphic_site_virtual() {
        let mut info = info(CallType::Call);
        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();
        info.set_stub(&NoBarrier, fake_cell(50), stub_of(&[1, 2])).unwrap();
        info.disallow_stubs();
        assert_eq!(info.mode(), LinkMode::Virtual);
        assert!(!info.allow_stubs());
    }

    #[test]
    fn revert_call_is_idempotent() {
        let mut info = info(CallType::Call);
        info.revert_call();
        assert_eq!(info.mode(), LinkMode::Init);
        assert_eq!(info.site().patch_count(), 0);

        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();
        info.revert_call();
        info.revert_call();
        assert_eq!(info.mode(), LinkMode::Init);
        assert!(info.site().target().is_slow_path());
        assert_eq!(info.site().patch_count(), 2);

        info.set_virtual_call();
        info.revert_call();
        assert_eq!(info.mode(), LinkMode::Virtual);
    }

    #[test]
    fn upgrade_keeps_mode() {
        let mut info = info(CallType::Call);
        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();

        let old = code_ptr(1).code_block();
        assert_eq!(
            info.unlink_or_upgrade(code_ptr(7).code_block(), Some(code_ptr(8))),
            RelinkOutcome::Unaffected
        );
        assert_eq!(
            info.unlink_or_upgrade(old, Some(code_ptr(9))),
            RelinkOutcome::Upgraded
        );
        assert_eq!(info.mode(), LinkMode::Monomorphic);
        assert_eq!(info.cached_target(), Some(code_ptr(9)));

        // No longer refers to the old block.
        assert_eq!(info.unlink_or_upgrade(old, None), RelinkOutcome::Unaffected);
    }

    #[test]
    fn unlink_without_replacement() {
        let mut info = info(CallType::Call);
        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();
        info.set_stub(&NoBarrier, fake_cell(50), stub_of(&[1, 2])).unwrap();

        assert_eq!(
            info.unlink_or_upgrade(code_ptr(1).code_block(), None),
            RelinkOutcome::CasesDropped(1)
        );
        assert_eq!(info.mode(), LinkMode::Polymorphic);
        assert_eq!(
            info.unlink_or_upgrade(code_ptr(2).code_block(), None),
            RelinkOutcome::Unlinked
        );
        assert_eq!(info.mode(), LinkMode::Init);
    }

    #[test]
    fn direct_link_and_upgrade() {
        let mut info = info(CallType::DirectCall);
        info.set_direct_call(&NoBarrier, fake_cell(50), fake_cell(101), code_ptr(1))
            .unwrap();
        assert_eq!(info.mode(), LinkMode::LinkedDirect);
        assert!(matches!(info.site().target(), CallTarget::Direct(_)));

        assert_eq!(
            info.unlink_or_upgrade(code_ptr(1).code_block(), Some(code_ptr(2))),
            RelinkOutcome::Upgraded
        );
        assert_eq!(info.mode(), LinkMode::LinkedDirect);
        assert!(info.set_direct_call(&NoBarrier, fake_cell(50), fake_cell(101), code_ptr(3)).is_err());
    }

    #[test]
    fn weak_pass_unlinks_dead_monomorphic_callee() {
        let mut info = info(CallType::Call);
        info.record_slow_path(fake_cell(1));
        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();

        let dead = DeadSet(vec![fake_cell(1)]);
        assert_eq!(info.visit_weak(&dead), WeakVisitOutcome::Unlinked);
        assert_eq!(info.mode(), LinkMode::Init);
        assert!(info.cleared_by_gc());
        assert_eq!(info.last_seen_callee(&dead), None);

        let mut cells = Vec::new();
        info.for_each_dependent_cell(&mut |cell| cells.push(cell));
        assert!(cells.is_empty());
    }

    #[test]
    fn weak_pass_prunes_stub_cases() {
        let mut info = info(CallType::Call);
        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();
        info.set_stub(&NoBarrier, fake_cell(50), stub_of(&[1, 2, 3])).unwrap();

        assert_eq!(
            info.visit_weak(&DeadSet(vec![fake_cell(2)])),
            WeakVisitOutcome::Pruned(1)
        );
        assert_eq!(info.mode(), LinkMode::Polymorphic);
        assert_eq!(info.stub().map(|s| s.len()), Some(2));

        assert_eq!(
            info.visit_weak(&DeadSet(vec![fake_cell(1), fake_cell(3)])),
            WeakVisitOutcome::Unlinked
        );
        assert_eq!(info.mode(), LinkMode::Init);
    }

    #[test]
    fn dependent_cells_cover_every_reference() {
        let mut info = info(CallType::Call);
        info.record_slow_path(fake_cell(9));
        info.set_monomorphic_callee(&NoBarrier, fake_cell(50), fake_cell(1), code_ptr(1))
            .unwrap();
        info.set_stub(&NoBarrier, fake_cell(50), stub_of(&[1, 2])).unwrap();

        let mut cells = Vec::new();
        info.for_each_dependent_cell(&mut |cell| cells.push(cell));
        for expected in [fake_cell(1), fake_cell(101), fake_cell(2), fake_cell(102), fake_cell(9)] {
            assert!(cells.contains(&expected), "missing {expected:?}");
        }
    }

    #[test]
    fn varargs_profile_is_monotonic_and_capped() {
        let mut info = CallLinkInfo::new(
            CallSiteDescriptor::new(CallType::CallVarargs, 0),
            CallLocations::for_site(0, 64),
            10,
        );
        info.update_max_argument_count_including_this_for_varargs(4);
        info.update_max_argument_count_including_this_for_varargs(2);
        assert_eq!(info.max_argument_count_including_this_for_varargs(), 4);
        info.update_max_argument_count_including_this_for_varargs(1000);
        assert_eq!(info.max_argument_count_including_this_for_varargs(), 10);
        info.update_max_argument_count_including_this_for_varargs(5);
        assert_eq!(info.max_argument_count_including_this_for_varargs(), 10);
    }

    #[test]
    fn slow_path_bookkeeping() {
        let mut info = info(CallType::Call);
        assert!(!info.seen_once());
        info.record_slow_path(fake_cell(3));
        info.record_slow_path(fake_cell(4));
        assert!(info.seen_once());
        assert_eq!(info.slow_path_count(), 2);
        assert_eq!(info.last_seen_callee(&DeadSet(vec![])), Some(fake_cell(4)));
    }
}
