//! The VM: executes calls through linked call sites.
//!
//! Native entry points call back into [`Vm::execute_call`] (or
//! [`Vm::execute_tail_call`]) for every call instruction in their body.
//! Each call reads the site's dispatch slot once, then either takes the
//! fast path (guarded, stub or direct target), dispatches virtually, or
//! falls to the slow path which resolves the callee and links the site.
//!
//! Every call instruction is a safepoint: if a collection is in progress
//! one bounded marking step runs there; otherwise one starts once the
//! allocation threshold is crossed.

use otter_vm_gc::{CellId, CollectionReport, GcStats, Heap, Liveness};
use rustc_hash::FxHashMap;

use crate::call_link_info::{CallLinkInfo, CallType, LinkMode, RelinkOutcome, WeakVisitOutcome};
use crate::call_site::CallTarget;
use crate::code_block::{
    CallSiteRef, CodeBlock, CodeBlockId, CodeBlockSet, CodePtr, CompileRequest, JitType, NativeEntry,
};
use crate::config::CallLinkConfig;
use crate::error::{ConfigError, InternalError, VmError, VmResult};
use crate::frame::CallFrame;
use crate::polymorphic_stub::StubIdAllocator;
use crate::repatch::{self, LinkContext, LinkResult, ResolvedCallee};
use crate::stats::CallLinkStats;
use crate::value::{
    Executable, FunctionCell, HeapCell, ObjectCell, RealmId, SpecializationKind, Value,
};

/// Code block id of frames entered without compiled code (host calls and
/// call handlers). Such frames cannot execute call instructions.
pub const HOST_CODE_BLOCK: CodeBlockId = CodeBlockId::new(0);

/// One call instruction being executed.
#[derive(Clone, Copy)]
struct CallRequest<'a> {
    caller: CodeBlockId,
    index: usize,
    call_type: CallType,
    callee: CellId,
    this: Value,
    args: &'a [Value],
}

enum Resolution {
    Function {
        resolved: ResolvedCallee,
        realm: RealmId,
    },
    Handler(NativeEntry),
}

/// Call-linking VM.
pub struct Vm {
    heap: Heap<HeapCell>,
    code_blocks: CodeBlockSet,
    config: CallLinkConfig,
    stats: CallLinkStats,
    stub_ids: StubIdAllocator,
    roots: Vec<CellId>,
    stack_roots: Vec<CellId>,
    /// Live frames per code block
    running: FxHashMap<CodeBlockId, u32>,
}

impl Vm {
    /// Create a VM with a validated config
    pub fn new(config: CallLinkConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            heap: Heap::with_config(config.gc_config()),
            code_blocks: CodeBlockSet::new(),
            config,
            stats: CallLinkStats::default(),
            stub_ids: StubIdAllocator::default(),
            roots: Vec::new(),
            stack_roots: Vec::new(),
            running: FxHashMap::default(),
        })
    }

    /// Create a VM configured from `OTTER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(CallLinkConfig::from_env()?)
    }

    /// Active configuration
    pub fn config(&self) -> &CallLinkConfig {
        &self.config
    }

    /// The heap
    pub fn heap(&self) -> &Heap<HeapCell> {
        &self.heap
    }

    /// All code blocks
    pub fn code_blocks(&self) -> &CodeBlockSet {
        &self.code_blocks
    }

    /// Snapshot of call linking counters
    pub fn stats(&self) -> CallLinkStats {
        self.stats
    }

    /// Snapshot of collector counters
    pub fn gc_stats(&self) -> GcStats {
        self.heap.stats()
    }

    // ---------------------------------------------------------------------
    // Allocation and roots
    // ---------------------------------------------------------------------

    /// Allocate an executable
    pub fn allocate_executable(&mut self, executable: Executable) -> CellId {
        self.heap.allocate(HeapCell::Executable(executable))
    }

    /// Create a function in the default realm
    pub fn create_function(&mut self, executable: CellId) -> VmResult<CellId> {
        self.create_closure(executable, RealmId::default(), Vec::new())
    }

    /// Create a function with captured values in `realm`
    pub fn create_closure(
        &mut self,
        executable: CellId,
        realm: RealmId,
        captures: Vec<Value>,
    ) -> VmResult<CellId> {
        self.executable(executable)?;
        Ok(self.heap.allocate(HeapCell::Function(FunctionCell {
            executable,
            realm,
            captures,
        })))
    }

    /// Create a plain, non-callable object
    pub fn create_object(&mut self) -> CellId {
        self.heap.allocate(HeapCell::Object(ObjectCell::default()))
    }

    /// Create an object that can only be called through `handler`
    pub fn create_callable_object(&mut self, handler: NativeEntry) -> CellId {
        self.heap.allocate(HeapCell::Object(ObjectCell {
            call_handler: Some(handler),
        }))
    }

    /// Keep `cell` alive until [`Vm::remove_root`]
    pub fn add_root(&mut self, cell: CellId) {
        self.roots.push(cell);
    }

    /// Drop one registration of `cell` as a root
    pub fn remove_root(&mut self, cell: CellId) {
        if let Some(pos) = self.roots.iter().rposition(|root| *root == cell) {
            self.roots.swap_remove(pos);
        }
    }

    /// Captured values of a function
    pub fn captures(&self, function: CellId) -> Option<&[Value]> {
        match self.heap.get(function) {
            Some(HeapCell::Function(function)) => Some(&function.captures),
            _ => None,
        }
    }

    /// Executable of a function
    pub fn executable_of(&self, function: CellId) -> Option<CellId> {
        match self.heap.get(function) {
            Some(HeapCell::Function(function)) => Some(function.executable),
            _ => None,
        }
    }

    fn executable(&self, executable: CellId) -> Result<&Executable, InternalError> {
        match self.heap.get(executable) {
            Some(HeapCell::Executable(executable)) => Ok(executable),
            _ => Err(InternalError::DeadCell(executable)),
        }
    }

    // ---------------------------------------------------------------------
    // Code blocks
    // ---------------------------------------------------------------------

    /// Current code block of `executable` for `kind`, if compiled
    pub fn code_block_for(&self, executable: CellId, kind: SpecializationKind) -> Option<CodeBlockId> {
        self.executable(executable)
            .ok()
            .and_then(|executable| executable.code_block(kind))
    }

    /// Call link info `index` of `code_block`
    pub fn call_link_info(
        &self,
        code_block: CodeBlockId,
        index: usize,
    ) -> Result<&CallLinkInfo, InternalError> {
        self.code_blocks.get(code_block)?.call_link_info(index)
    }

    /// Compile (or reuse) the baseline code of `function`'s executable.
    pub fn compile(&mut self, function: CellId, kind: SpecializationKind) -> VmResult<CodeBlockId> {
        let (executable, realm) = match self.heap.get(function) {
            Some(HeapCell::Function(function)) => (function.executable, function.realm),
            _ => return Err(InternalError::DeadCell(function).into()),
        };
        Ok(self.ensure_code_block(executable, realm, kind)?)
    }

    fn ensure_code_block(
        &mut self,
        owner: CellId,
        realm: RealmId,
        kind: SpecializationKind,
    ) -> Result<CodeBlockId, InternalError> {
        let executable = match self.heap.get(owner) {
            Some(HeapCell::Executable(executable)) => executable,
            _ => return Err(InternalError::DeadCell(owner)),
        };
        if let Some(id) = executable.code_block(kind) {
            if self.code_blocks.contains(id) {
                return Ok(id);
            }
        }

        let id = self.code_blocks.compile(
            CompileRequest {
                owner,
                executable,
                realm,
                specialization: kind,
                jit_type: JitType::Baseline,
                entry: executable.entry(),
            },
            &self.config,
        );
        if let Some(HeapCell::Executable(executable)) = self.heap.get_mut(owner) {
            executable.set_code_block(kind, Some(id));
        }
        tracing::debug!(
            target: "otter::calllink",
            code_block = id.as_u64(),
            %kind,
            "compiled baseline code"
        );
        Ok(id)
    }

    /// Install `entry` as the new code of `old`'s executable and retarget
    /// every site linked to `old` in place. `old` stays valid while frames
    /// are running it; the first collection after that jettisons it.
    pub fn replace_code(
        &mut self,
        old: CodeBlockId,
        entry: NativeEntry,
        jit_type: JitType,
    ) -> VmResult<CodeBlockId> {
        let (owner, realm, kind) = {
            let block = self.code_blocks.get(old)?;
            (block.owner(), block.realm(), block.specialization())
        };
        let executable = match self.heap.get(owner) {
            Some(HeapCell::Executable(executable)) => executable,
            _ => return Err(InternalError::DeadCell(owner).into()),
        };
        let new_id = self.code_blocks.compile(
            CompileRequest {
                owner,
                executable,
                realm,
                specialization: kind,
                jit_type,
                entry,
            },
            &self.config,
        );
        if let Some(HeapCell::Executable(executable)) = self.heap.get_mut(owner) {
            executable.set_code_block(kind, Some(new_id));
        }

        let new_ptr = self.code_blocks.get(new_id)?.code_ptr();
        let incoming = self.code_blocks.get_mut(old)?.take_incoming();
        let mut upgraded = 0usize;
        for site in incoming {
            let Ok(info) = self
                .code_blocks
                .get_mut(site.caller)
                .and_then(|block| block.call_link_info_mut(site.index))
            else {
                continue;
            };
            if info.unlink_or_upgrade(old, Some(new_ptr)) == RelinkOutcome::Upgraded {
                upgraded += 1;
                CallLinkStats::bump(&mut self.stats.upgrades);
                self.code_blocks.get_mut(new_id)?.add_incoming(site);
            }
        }

        tracing::debug!(
            target: "otter::calllink",
            old = old.as_u64(),
            new = new_id.as_u64(),
            ?jit_type,
            upgraded,
            "code replaced"
        );
        Ok(new_id)
    }

    /// Invalidate `id`: unlink every site that calls into it, revert its
    /// own outgoing calls, then destroy it.
    pub fn jettison_code(&mut self, id: CodeBlockId) -> VmResult<()> {
        let incoming = self.code_blocks.get_mut(id)?.take_incoming();
        for site in incoming {
            let Ok(info) = self
                .code_blocks
                .get_mut(site.caller)
                .and_then(|block| block.call_link_info_mut(site.index))
            else {
                continue;
            };
            if info.unlink_or_upgrade(id, None) != RelinkOutcome::Unaffected {
                CallLinkStats::bump(&mut self.stats.jettison_unlinks);
            }
        }

        let block = self.code_blocks.get_mut(id)?;
        for info in block.call_link_infos_mut() {
            info.revert_call();
        }
        let (owner, kind) = (block.owner(), block.specialization());

        if let Some(HeapCell::Executable(executable)) = self.heap.get_mut(owner) {
            if executable.code_block(kind) == Some(id) {
                executable.set_code_block(kind, None);
            }
        }
        self.code_blocks.remove(id);

        tracing::debug!(target: "otter::calllink", code_block = id.as_u64(), "code jettisoned");
        Ok(())
    }

    /// Forbid polymorphic stubs at call site `index` of `code_block`. A
    /// polymorphic site goes virtual now; a monomorphic one on its next miss.
    pub fn disallow_stubs(
        &mut self,
        code_block: CodeBlockId,
        index: usize,
    ) -> Result<(), InternalError> {
        let info = self.code_blocks.get_mut(code_block)?.call_link_info_mut(index)?;
        let was_virtual = info.mode() == LinkMode::Virtual;
        info.disallow_stubs();
        if !was_virtual && info.mode() == LinkMode::Virtual {
            CallLinkStats::bump(&mut self.stats.virtual_transitions);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------------

    /// Call `callee` from the host, without a call site.
    pub fn call(&mut self, callee: Value, this: Value, args: &[Value]) -> VmResult<Value> {
        self.host_call(callee, this, args, SpecializationKind::Call)
    }

    /// Construct `callee` from the host, without a call site.
    pub fn construct(&mut self, callee: Value, args: &[Value]) -> VmResult<Value> {
        self.host_call(callee, Value::Undefined, args, SpecializationKind::Construct)
    }

    fn host_call(
        &mut self,
        callee: Value,
        this: Value,
        args: &[Value],
        kind: SpecializationKind,
    ) -> VmResult<Value> {
        let Some(cell) = callee.as_cell() else {
            return Err(self.not_callable(callee, kind));
        };
        let mark = self.push_roots(cell, this, args);
        let result = self.call_generic(cell, this, args, kind, || {});
        self.stack_roots.truncate(mark);
        result
    }

    /// Execute call instruction `site` of the frame's code block.
    pub fn execute_call(
        &mut self,
        frame: &CallFrame,
        site: usize,
        callee: Value,
        this: Value,
        args: &[Value],
    ) -> VmResult<Value> {
        let caller = frame.code_block();
        if self.code_blocks.get(caller)?.call_link_info(site)?.is_tail_call() {
            return Err(InternalError::CallModeMismatch {
                code_block: caller,
                index: site,
                expected: "non-tail",
            }
            .into());
        }
        self.perform_call(caller, site, callee, this, args, || {})
    }

    /// Execute tail-call instruction `site`. `prepare` shuffles the frame
    /// and runs exactly once, right before control transfers to the callee.
    pub fn execute_tail_call(
        &mut self,
        frame: &CallFrame,
        site: usize,
        callee: Value,
        this: Value,
        args: &[Value],
        prepare: impl FnOnce(),
    ) -> VmResult<Value> {
        let caller = frame.code_block();
        if !self.code_blocks.get(caller)?.call_link_info(site)?.is_tail_call() {
            return Err(InternalError::CallModeMismatch {
                code_block: caller,
                index: site,
                expected: "tail",
            }
            .into());
        }
        self.perform_call(caller, site, callee, this, args, prepare)
    }

    fn perform_call(
        &mut self,
        caller: CodeBlockId,
        index: usize,
        callee: Value,
        this: Value,
        args: &[Value],
        prepare: impl FnOnce(),
    ) -> VmResult<Value> {
        let call_type = {
            let info = self.code_blocks.get_mut(caller)?.call_link_info_mut(index)?;
            if info.is_varargs() {
                let count = u32::try_from(args.len() + 1).unwrap_or(u32::MAX);
                info.update_max_argument_count_including_this_for_varargs(count);
            }
            info.call_type()
        };
        let kind = call_type.specialization();

        // Non-cells never reach the link info.
        let Some(callee_cell) = callee.as_cell() else {
            return Err(self.not_callable(callee, kind));
        };

        let call = CallRequest {
            caller,
            index,
            call_type,
            callee: callee_cell,
            this,
            args,
        };
        let mark = self.push_roots(callee_cell, this, args);
        // The slot is read after the safepoint: a collection finishing there
        // may unlink this very site.
        let result = self.safepoint().and_then(|()| {
            let dispatch = self.call_link_info(caller, index)?.site().dispatch();
            self.dispatch_call(call, dispatch, prepare)
        });
        self.stack_roots.truncate(mark);
        result
    }

    fn dispatch_call(
        &mut self,
        call: CallRequest<'_>,
        dispatch: CallTarget,
        prepare: impl FnOnce(),
    ) -> VmResult<Value> {
        let CallRequest {
            callee, this, args, ..
        } = call;
        let kind = call.call_type.specialization();
        let fast_target = match &dispatch {
            CallTarget::Guarded { expected, target } if *expected == callee => Some(*target),
            CallTarget::Direct(target) => Some(*target),
            CallTarget::Stub(stub) => self
                .executable_of(callee)
                .and_then(|executable| stub.dispatch(callee, executable)),
            CallTarget::Virtual => {
                CallLinkStats::bump(&mut self.stats.virtual_calls);
                return self.call_generic(callee, this, args, kind, prepare);
            }
            CallTarget::SlowPath | CallTarget::Guarded { .. } => None,
        };

        match fast_target {
            Some(target) => {
                CallLinkStats::bump(&mut self.stats.fast_path_hits);
                prepare();
                self.invoke(target, callee, this, args, kind)
            }
            None => self.link_and_call(call, prepare),
        }
    }

    fn link_and_call(&mut self, call: CallRequest<'_>, prepare: impl FnOnce()) -> VmResult<Value> {
        let CallRequest {
            caller,
            index,
            call_type,
            callee,
            this,
            args,
        } = call;
        CallLinkStats::bump(&mut self.stats.slow_path_calls);
        self.code_blocks
            .get_mut(caller)?
            .call_link_info_mut(index)?
            .record_slow_path(callee);

        let kind = call_type.specialization();
        let (resolved, realm) = match self.resolve_callee(callee, kind)? {
            Resolution::Handler(handler) => {
                let info = self.code_blocks.get_mut(caller)?.call_link_info_mut(index)?;
                repatch::link_virtual_call(info, &mut self.stats, "callable object");
                prepare();
                return self.invoke_handler(handler, callee, this, args, kind);
            }
            Resolution::Function { resolved, realm } => (resolved, realm),
        };

        let link_result = {
            let Self {
                heap,
                code_blocks,
                config,
                stats,
                stub_ids,
                ..
            } = self;
            let block = code_blocks.get_mut(caller)?;
            let owner = block.owner();
            let non_cacheable = if !block.can_cache_calls() {
                Some("call caching disabled")
            } else if block.realm() != realm {
                Some("cross-realm callee")
            } else {
                None
            };
            let info = block.call_link_info_mut(index)?;

            match non_cacheable {
                Some(reason) => {
                    repatch::link_virtual_call(info, stats, reason);
                    LinkResult::Virtualized
                }
                None => {
                    let mut ctx = LinkContext {
                        heap,
                        owner,
                        config,
                        stats,
                        stub_ids,
                    };
                    repatch::link_call(info, &mut ctx, &resolved).map_err(InternalError::from)?
                }
            }
        };

        if let LinkResult::Linked(targets) = link_result {
            let site = CallSiteRef { caller, index };
            for target in targets {
                if let Ok(block) = self.code_blocks.get_mut(target) {
                    block.add_incoming(site);
                }
            }
        }

        prepare();
        self.invoke(resolved.target, callee, this, args, kind)
    }

    fn call_generic(
        &mut self,
        callee: CellId,
        this: Value,
        args: &[Value],
        kind: SpecializationKind,
        prepare: impl FnOnce(),
    ) -> VmResult<Value> {
        match self.resolve_callee(callee, kind)? {
            Resolution::Handler(handler) => {
                prepare();
                self.invoke_handler(handler, callee, this, args, kind)
            }
            Resolution::Function { resolved, .. } => {
                prepare();
                self.invoke(resolved.target, callee, this, args, kind)
            }
        }
    }

    fn resolve_callee(&mut self, callee: CellId, kind: SpecializationKind) -> VmResult<Resolution> {
        let (executable, realm) = match self.heap.get(callee) {
            None => return Err(InternalError::DeadCell(callee).into()),
            Some(HeapCell::Function(function)) => (function.executable, function.realm),
            Some(HeapCell::Object(ObjectCell {
                call_handler: Some(handler),
            })) => return Ok(Resolution::Handler(*handler)),
            Some(HeapCell::Object(_) | HeapCell::Executable(_)) => {
                return Err(self.not_callable(Value::Cell(callee), kind));
            }
        };

        let (constructible, parameter_count) = {
            let executable = self.executable(executable)?;
            (executable.is_constructible(), executable.parameter_count())
        };
        if kind == SpecializationKind::Construct && !constructible {
            return Err(self.not_callable(Value::Cell(callee), kind));
        }

        let code_block = self.ensure_code_block(executable, realm, kind)?;
        let target = self.code_blocks.get(code_block)?.code_ptr();
        Ok(Resolution::Function {
            resolved: ResolvedCallee {
                callee,
                executable,
                target,
                parameter_count,
            },
            realm,
        })
    }

    fn invoke(
        &mut self,
        target: CodePtr,
        callee: CellId,
        this: Value,
        args: &[Value],
        kind: SpecializationKind,
    ) -> VmResult<Value> {
        if !self.code_blocks.contains(target.code_block()) {
            return Err(InternalError::DanglingCodePointer(target.code_block()).into());
        }
        self.enter(target.code_block(), target.entry(), callee, this, args, kind)
    }

    fn invoke_handler(
        &mut self,
        handler: NativeEntry,
        callee: CellId,
        this: Value,
        args: &[Value],
        kind: SpecializationKind,
    ) -> VmResult<Value> {
        self.enter(HOST_CODE_BLOCK, handler, callee, this, args, kind)
    }

    fn enter(
        &mut self,
        code_block: CodeBlockId,
        entry: NativeEntry,
        callee: CellId,
        this: Value,
        args: &[Value],
        kind: SpecializationKind,
    ) -> VmResult<Value> {
        let this = match kind {
            SpecializationKind::Construct => Value::Cell(self.create_object()),
            SpecializationKind::Call => this,
        };
        let frame = CallFrame::new(code_block, callee, this, args.to_vec(), kind);

        let mark = self.stack_roots.len();
        frame.for_each_root(&mut |cell| self.stack_roots.push(cell));
        if code_block != HOST_CODE_BLOCK {
            *self.running.entry(code_block).or_default() += 1;
        }
        let result = entry(self, &frame);
        if let Some(frames) = self.running.get_mut(&code_block) {
            *frames -= 1;
            if *frames == 0 {
                self.running.remove(&code_block);
            }
        }
        self.stack_roots.truncate(mark);

        match (kind, result) {
            (SpecializationKind::Construct, Ok(Value::Cell(object))) => Ok(Value::Cell(object)),
            (SpecializationKind::Construct, Ok(_)) => Ok(this),
            (_, result) => result,
        }
    }

    fn push_roots(&mut self, callee: CellId, this: Value, args: &[Value]) -> usize {
        let mark = self.stack_roots.len();
        self.stack_roots.push(callee);
        for value in std::iter::once(&this).chain(args) {
            if let Value::Cell(cell) = value {
                self.stack_roots.push(*cell);
            }
        }
        mark
    }

    fn not_callable(&mut self, value: Value, kind: SpecializationKind) -> VmError {
        CallLinkStats::bump(&mut self.stats.type_errors);
        let what = match kind {
            SpecializationKind::Call => "a function",
            SpecializationKind::Construct => "a constructor",
        };
        VmError::type_error(format!("{} is not {what}", self.describe(value)))
    }

    fn describe(&self, value: Value) -> String {
        match value {
            Value::Undefined => "undefined".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Cell(cell) => match self.heap.get(cell) {
                Some(HeapCell::Function(function)) => self
                    .executable(function.executable)
                    .map(|executable| executable.name().to_string())
                    .unwrap_or_else(|_| "function".to_string()),
                Some(other) => other.kind_name().to_string(),
                None => "<dead cell>".to_string(),
            },
        }
    }

    // ---------------------------------------------------------------------
    // GC liaison
    // ---------------------------------------------------------------------

    fn root_set(&self) -> Vec<CellId> {
        self.roots
            .iter()
            .chain(&self.stack_roots)
            .copied()
            .collect()
    }

    /// Safepoint: advance incremental marking by one bounded step, finishing
    /// the cycle once marking is done, or start a cycle once enough has
    /// been allocated.
    pub fn safepoint(&mut self) -> VmResult<()> {
        if self.heap.is_marking() {
            if self.heap.mark_step(self.config.mark_budget) {
                self.finish_collection()?;
            }
        } else if self.heap.should_collect() {
            let roots = self.root_set();
            self.heap.start_marking(&roots);
        }
        Ok(())
    }

    /// Run (or finish) a full collection now.
    pub fn collect_garbage(&mut self) -> VmResult<CollectionReport> {
        self.finish_collection()
    }

    fn finish_collection(&mut self) -> VmResult<CollectionReport> {
        let roots = self.root_set();
        let before = self.stats;
        let report = {
            let Self {
                heap,
                code_blocks,
                stats,
                ..
            } = self;
            heap.finish_collection(&roots, |liveness| {
                visit_weak_references(code_blocks, stats, liveness)
            })
        };

        let dead_code: Vec<CodeBlockId> = self
            .code_blocks
            .iter()
            .filter(|block| self.is_reclaimable(block))
            .map(|block| block.id())
            .collect();
        for id in &dead_code {
            self.jettison_code(*id)?;
        }
        let stale_incoming = self.code_blocks.prune_stale_incoming();

        tracing::info!(
            target: "otter::gc",
            reclaimed = report.reclaimed.len(),
            unlinked = self.stats.gc_unlinks - before.gc_unlinks,
            pruned = self.stats.gc_case_prunes - before.gc_case_prunes,
            jettisoned = dead_code.len(),
            stale_incoming,
            "call links swept"
        );

        #[cfg(debug_assertions)]
        self.verify_call_links()?;

        Ok(report)
    }

    /// Whether `block` can be destroyed: its executable died, or it was
    /// superseded and no frame is running it.
    fn is_reclaimable(&self, block: &CodeBlock) -> bool {
        match self.heap.get(block.owner()) {
            Some(HeapCell::Executable(executable)) => {
                executable.code_block(block.specialization()) != Some(block.id())
                    && !self.running.contains_key(&block.id())
            }
            _ => true,
        }
    }

    /// Check that every cell a call link refers to is alive and every code
    /// pointer a site can dispatch to resolves to a live code block.
    pub fn verify_call_links(&self) -> Result<(), InternalError> {
        for block in self.code_blocks.iter() {
            for info in block.call_link_infos() {
                let mut dead = None;
                info.for_each_dependent_cell(&mut |cell| {
                    if !self.heap.contains(cell) {
                        dead.get_or_insert(cell);
                    }
                });
                if let Some(cell) = dead {
                    return Err(InternalError::DeadCell(cell));
                }

                let check = |target: CodePtr| {
                    if self.code_blocks.contains(target.code_block()) {
                        Ok(())
                    } else {
                        Err(InternalError::DanglingCodePointer(target.code_block()))
                    }
                };
                match info.site().target() {
                    CallTarget::Guarded { target, .. } | CallTarget::Direct(target) => check(*target)?,
                    CallTarget::Stub(stub) => {
                        for case in stub.cases() {
                            check(case.target())?;
                        }
                    }
                    CallTarget::SlowPath | CallTarget::Virtual => {}
                }
            }
        }
        Ok(())
    }
}

fn visit_weak_references(
    code_blocks: &mut CodeBlockSet,
    stats: &mut CallLinkStats,
    liveness: &dyn Liveness,
) {
    for block in code_blocks.iter_mut() {
        for info in block.call_link_infos_mut() {
            match info.visit_weak(liveness) {
                WeakVisitOutcome::Unchanged => {}
                WeakVisitOutcome::Unlinked => {
                    tracing::trace!(
                        target: "otter::calllink",
                        origin = info.code_origin(),
                        "dead callee unlinked"
                    );
                    CallLinkStats::bump(&mut stats.gc_unlinks);
                }
                WeakVisitOutcome::Pruned(cases) => {
                    stats.gc_case_prunes = stats.gc_case_prunes.saturating_add(cases as u64);
                }
            }
        }
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("heap", &self.heap)
            .field("code_blocks", &self.code_blocks.len())
            .field("roots", &self.roots.len())
            .field("running", &self.running.len())
            .finish()
    }
}
