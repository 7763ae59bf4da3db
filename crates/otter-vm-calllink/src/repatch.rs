//! Link protocol: what the slow path does to a call site once it has
//! resolved the callee.

use std::rc::Rc;

use otter_vm_gc::{CellId, Heap};

use crate::call_link_info::{CallLinkInfo, LinkMode};
use crate::code_block::{CodeBlockId, CodePtr};
use crate::config::CallLinkConfig;
use crate::error::LinkError;
use crate::polymorphic_stub::{
    CallVariant, PolymorphicCallCase, PolymorphicCallStubRoutine, StubGrowth, StubIdAllocator,
};
use crate::stats::CallLinkStats;
use crate::value::HeapCell;

/// A callee resolved by the slow path.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedCallee {
    /// Function object
    pub callee: CellId,
    /// Its executable
    pub executable: CellId,
    /// Entry of the executable's code for the call's specialization
    pub target: CodePtr,
    /// Declared parameter count
    pub parameter_count: u32,
}

/// What linking did to the site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkResult {
    /// The site now dispatches into these code blocks
    Linked(Vec<CodeBlockId>),
    /// The site went virtual
    Virtualized,
    /// Nothing to do in the current mode
    Unchanged,
}

/// Everything the link protocol touches besides the site itself.
pub struct LinkContext<'a> {
    /// Heap: callee lookups and write barriers
    pub heap: &'a Heap<HeapCell>,
    /// Cell owning the call site's code block
    pub owner: CellId,
    /// Tunables
    pub config: &'a CallLinkConfig,
    /// Counters
    pub stats: &'a mut CallLinkStats,
    /// Stub routine ids
    pub stub_ids: &'a mut StubIdAllocator,
}

impl LinkContext<'_> {
    fn executable_of(&self, callee: CellId) -> Option<CellId> {
        match self.heap.get(callee) {
            Some(HeapCell::Function(function)) => Some(function.executable),
            _ => None,
        }
    }
}

/// Slow-path linking for a cacheable callee.
pub fn link_call(
    info: &mut CallLinkInfo,
    ctx: &mut LinkContext<'_>,
    resolved: &ResolvedCallee,
) -> Result<LinkResult, LinkError> {
    if info.is_direct() {
        return link_direct_call(info, ctx, resolved);
    }

    match info.mode() {
        LinkMode::Init => {
            info.set_monomorphic_callee(ctx.heap, ctx.owner, resolved.callee, resolved.target)?;
            CallLinkStats::bump(&mut ctx.stats.monomorphic_links);
            Ok(LinkResult::Linked(vec![resolved.target.code_block()]))
        }
        LinkMode::Monomorphic | LinkMode::Polymorphic => link_polymorphic_call(info, ctx, resolved),
        LinkMode::Virtual | LinkMode::LinkedDirect => Ok(LinkResult::Unchanged),
    }
}

fn link_direct_call(
    info: &mut CallLinkInfo,
    ctx: &mut LinkContext<'_>,
    resolved: &ResolvedCallee,
) -> Result<LinkResult, LinkError> {
    if info.mode() != LinkMode::Init {
        return Ok(LinkResult::Unchanged);
    }
    info.set_direct_call(ctx.heap, ctx.owner, resolved.executable, resolved.target)?;
    info.set_max_argument_count_including_this(resolved.parameter_count.saturating_add(1));
    Ok(LinkResult::Linked(vec![resolved.target.code_block()]))
}

/// Add `resolved` to the site's stub, building the stub on the first miss
/// of a monomorphic site. Overflow sends the site virtual.
pub fn link_polymorphic_call(
    info: &mut CallLinkInfo,
    ctx: &mut LinkContext<'_>,
    resolved: &ResolvedCallee,
) -> Result<LinkResult, LinkError> {
    if !info.allow_stubs() {
        link_virtual_call(info, ctx.stats, "stubs disallowed");
        return Ok(LinkResult::Virtualized);
    }

    let from_monomorphic = info.mode() == LinkMode::Monomorphic;
    let existing: Vec<PolymorphicCallCase> = if from_monomorphic {
        let cached = info
            .monomorphic_callee(ctx.heap)
            .zip(info.cached_target())
            .and_then(|(callee, target)| {
                ctx.executable_of(callee)
                    .map(|executable| (CallVariant::Function { callee, executable }, target))
            });
        cached
            .map(|(variant, target)| vec![PolymorphicCallCase::new(variant, target)])
            .unwrap_or_default()
    } else {
        info.stub()
            .map(|stub| stub.cases().to_vec())
            .unwrap_or_default()
    };

    let variant = CallVariant::Function {
        callee: resolved.callee,
        executable: resolved.executable,
    };
    let growth = PolymorphicCallStubRoutine::grow(
        ctx.stub_ids.next_id(),
        &existing,
        variant,
        resolved.target,
        ctx.config.polymorphic_capacity as usize,
    );

    match growth {
        StubGrowth::Overflow => {
            link_virtual_call(info, ctx.stats, "polymorphic capacity exceeded");
            Ok(LinkResult::Virtualized)
        }
        StubGrowth::Built {
            routine,
            despecified,
        } => {
            if from_monomorphic {
                CallLinkStats::bump(&mut ctx.stats.polymorphic_links);
            } else {
                CallLinkStats::bump(&mut ctx.stats.stub_regenerations);
            }
            let targets = routine
                .cases()
                .iter()
                .map(|case| case.target().code_block())
                .collect();
            tracing::debug!(
                target: "otter::calllink",
                origin = info.code_origin(),
                cases = routine.len(),
                stub = ?routine.id(),
                despecified,
                "polymorphic stub generated"
            );
            info.set_stub(ctx.heap, ctx.owner, Rc::new(routine))?;
            Ok(LinkResult::Linked(targets))
        }
    }
}

/// Send the site to virtual dispatch for good.
pub fn link_virtual_call(info: &mut CallLinkInfo, stats: &mut CallLinkStats, reason: &'static str) {
    if info.mode() == LinkMode::Virtual {
        return;
    }
    tracing::debug!(
        target: "otter::calllink",
        origin = info.code_origin(),
        reason,
        "call site going virtual"
    );
    info.set_virtual_call();
    CallLinkStats::bump(&mut stats.virtual_transitions);
}
