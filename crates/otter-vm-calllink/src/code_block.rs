//! Compiled code blocks and the code pointers call sites cache.

use std::fmt;

use rustc_hash::FxHashMap;

use otter_vm_gc::CellId;

use crate::call_link_info::CallLinkInfo;
use crate::call_site::{CALL_FAST_PATH_SIZE, CallLocations};
use crate::config::CallLinkConfig;
use crate::error::{InternalError, VmResult};
use crate::frame::CallFrame;
use crate::runtime::Vm;
use crate::value::{Executable, RealmId, SpecializationKind, Value};

/// Native entry point of a code block.
pub type NativeEntry = fn(&mut Vm, &CallFrame) -> VmResult<Value>;

/// Identity of a code block. Ids are never reused, so a stale id can only
/// fail to resolve, never resolve to different code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeBlockId(u64);

impl CodeBlockId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw id
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Tier a code block was compiled at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JitType {
    /// Baseline JIT
    Baseline,
    /// Optimizing JIT
    Optimized,
}

/// A call target: a code block plus its entry point.
///
/// The entry is only valid while the code block exists; dispatch resolves
/// the block before jumping.
#[derive(Clone, Copy)]
pub struct CodePtr {
    code_block: CodeBlockId,
    entry: NativeEntry,
}

impl CodePtr {
    pub(crate) fn new(code_block: CodeBlockId, entry: NativeEntry) -> Self {
        Self { code_block, entry }
    }

    /// Code block this pointer enters
    pub fn code_block(&self) -> CodeBlockId {
        self.code_block
    }

    pub(crate) fn entry(&self) -> NativeEntry {
        self.entry
    }
}

impl PartialEq for CodePtr {
    fn eq(&self, other: &Self) -> bool {
        self.code_block == other.code_block
    }
}

impl Eq for CodePtr {}

impl fmt::Debug for CodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodePtr({})", self.code_block.0)
    }
}

/// A call site inside a code block, as recorded on incoming lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSiteRef {
    /// Code block containing the call instruction
    pub caller: CodeBlockId,
    /// Index of the call link info inside the caller
    pub index: usize,
}

/// Compiled code for one executable, specialization and tier.
pub struct CodeBlock {
    id: CodeBlockId,
    owner: CellId,
    realm: RealmId,
    specialization: SpecializationKind,
    jit_type: JitType,
    entry: NativeEntry,
    num_parameters: u32,
    can_cache_calls: bool,
    call_link_infos: Vec<CallLinkInfo>,
    incoming: Vec<CallSiteRef>,
}

impl CodeBlock {
    /// Id of this block
    pub fn id(&self) -> CodeBlockId {
        self.id
    }

    /// Executable cell this code was compiled from
    pub fn owner(&self) -> CellId {
        self.owner
    }

    /// Realm of the code
    pub fn realm(&self) -> RealmId {
        self.realm
    }

    /// Call or construct
    pub fn specialization(&self) -> SpecializationKind {
        self.specialization
    }

    /// Tier
    pub fn jit_type(&self) -> JitType {
        self.jit_type
    }

    /// Declared parameter count, excluding `this`
    pub fn num_parameters(&self) -> u32 {
        self.num_parameters
    }

    /// Whether outgoing calls may be cached
    pub fn can_cache_calls(&self) -> bool {
        self.can_cache_calls
    }

    /// Entry point for calls into this block
    pub fn code_ptr(&self) -> CodePtr {
        CodePtr::new(self.id, self.entry)
    }

    /// Outgoing call sites
    pub fn call_link_infos(&self) -> &[CallLinkInfo] {
        &self.call_link_infos
    }

    /// Outgoing call site by index
    pub fn call_link_info(&self, index: usize) -> Result<&CallLinkInfo, InternalError> {
        self.call_link_infos
            .get(index)
            .ok_or(InternalError::UnknownCallSite {
                code_block: self.id,
                index,
            })
    }

    pub(crate) fn call_link_info_mut(
        &mut self,
        index: usize,
    ) -> Result<&mut CallLinkInfo, InternalError> {
        let code_block = self.id;
        self.call_link_infos
            .get_mut(index)
            .ok_or(InternalError::UnknownCallSite { code_block, index })
    }

    pub(crate) fn call_link_infos_mut(&mut self) -> &mut [CallLinkInfo] {
        &mut self.call_link_infos
    }

    /// Sites linked to this block. Entries of sites that were unlinked or
    /// went virtual linger until the next collection; consumers check the
    /// site still targets this block.
    pub fn incoming(&self) -> &[CallSiteRef] {
        &self.incoming
    }

    pub(crate) fn add_incoming(&mut self, site: CallSiteRef) {
        if !self.incoming.contains(&site) {
            self.incoming.push(site);
        }
    }

    pub(crate) fn take_incoming(&mut self) -> Vec<CallSiteRef> {
        std::mem::take(&mut self.incoming)
    }
}

impl fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlock")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("specialization", &self.specialization)
            .field("jit_type", &self.jit_type)
            .field("call_sites", &self.call_link_infos.len())
            .field("incoming", &self.incoming.len())
            .finish()
    }
}

/// Everything needed to compile one code block.
pub(crate) struct CompileRequest<'a> {
    pub owner: CellId,
    pub executable: &'a Executable,
    pub realm: RealmId,
    pub specialization: SpecializationKind,
    pub jit_type: JitType,
    pub entry: NativeEntry,
}

/// All live code blocks, keyed by id.
#[derive(Debug, Default)]
pub struct CodeBlockSet {
    blocks: FxHashMap<CodeBlockId, CodeBlock>,
    next_id: u64,
}

impl CodeBlockSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `request.executable` into a new code block with fresh,
    /// unlinked call sites.
    pub(crate) fn compile(
        &mut self,
        request: CompileRequest<'_>,
        config: &CallLinkConfig,
    ) -> CodeBlockId {
        self.next_id += 1;
        let id = CodeBlockId(self.next_id);
        let executable = request.executable;

        // Inline fast paths first, slow paths appended out of line.
        let slow_path_base = executable.call_sites().len() as u32 * CALL_FAST_PATH_SIZE;
        let call_link_infos = executable
            .call_sites()
            .iter()
            .enumerate()
            .map(|(index, descriptor)| {
                CallLinkInfo::new(
                    *descriptor,
                    CallLocations::for_site(index, slow_path_base),
                    config.max_varargs_argument_count,
                )
            })
            .collect();

        self.blocks.insert(
            id,
            CodeBlock {
                id,
                owner: request.owner,
                realm: request.realm,
                specialization: request.specialization,
                jit_type: request.jit_type,
                entry: request.entry,
                num_parameters: executable.parameter_count(),
                can_cache_calls: executable.can_cache_calls() && config.enable_call_caching,
                call_link_infos,
                incoming: Vec::new(),
            },
        );
        id
    }

    /// Look up a block
    pub fn get(&self, id: CodeBlockId) -> Result<&CodeBlock, InternalError> {
        self.blocks.get(&id).ok_or(InternalError::UnknownCodeBlock(id))
    }

    /// Look up a block mutably
    pub(crate) fn get_mut(&mut self, id: CodeBlockId) -> Result<&mut CodeBlock, InternalError> {
        self.blocks
            .get_mut(&id)
            .ok_or(InternalError::UnknownCodeBlock(id))
    }

    /// Whether the block exists
    pub fn contains(&self, id: CodeBlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub(crate) fn remove(&mut self, id: CodeBlockId) -> Option<CodeBlock> {
        self.blocks.remove(&id)
    }

    /// Number of live blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether there are no blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterate over blocks in id order
    pub fn iter(&self) -> impl Iterator<Item = &CodeBlock> {
        let mut blocks: Vec<_> = self.blocks.values().collect();
        blocks.sort_by_key(|block| block.id);
        blocks.into_iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut CodeBlock> {
        self.blocks.values_mut()
    }

    /// Drop incoming entries whose site no longer dispatches into the block.
    /// Returns how many were dropped.
    pub(crate) fn prune_stale_incoming(&mut self) -> usize {
        let mut stale = Vec::new();
        for block in self.blocks.values() {
            for site in &block.incoming {
                let linked = self
                    .blocks
                    .get(&site.caller)
                    .and_then(|caller| caller.call_link_infos.get(site.index))
                    .is_some_and(|info| info.targets(block.id));
                if !linked {
                    stale.push((block.id, *site));
                }
            }
        }
        for (id, site) in &stale {
            if let Some(block) = self.blocks.get_mut(id) {
                block.incoming.retain(|entry| entry != site);
            }
        }
        stale.len()
    }
}
