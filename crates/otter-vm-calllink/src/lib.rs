//! # Otter VM Call Linking
//!
//! Inline caching for call instructions of the baseline JIT.
//!
//! Every call instruction owns a [`CallLinkInfo`] with a patchable dispatch
//! slot. The first execution falls to the slow path, which resolves the
//! callee and links the site monomorphically (one identity check, then a
//! direct call). Further distinct callees build a polymorphic stub; past
//! the stub capacity the site goes virtual for good.
//!
//! Cached callees are weak: the collector's weak-reference pass unlinks
//! sites (or prunes stub cases) whose callee died, and code blocks track
//! their incoming calls so replacing or jettisoning code never leaves a
//! site pointing at freed code.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod call_link_info;
pub mod call_site;
pub mod code_block;
pub mod config;
pub mod error;
pub mod frame;
pub mod polymorphic_stub;
pub mod repatch;
pub mod runtime;
pub mod stats;
pub mod value;

#[cfg(test)]
mod test_support;

pub use call_link_info::{
    CallLinkInfo, CallMode, CallSiteDescriptor, CallType, LinkMode, LinkState, RelinkOutcome,
    WeakVisitOutcome,
};
pub use call_site::{CallLocations, CallTarget, CodeLocation, NearCallMode, PatchableCallSite};
pub use code_block::{CallSiteRef, CodeBlock, CodeBlockId, CodePtr, JitType, NativeEntry};
pub use config::CallLinkConfig;
pub use error::{ConfigError, InternalError, LinkError, VmError, VmResult};
pub use frame::CallFrame;
pub use polymorphic_stub::{CallVariant, PolymorphicCallCase, PolymorphicCallStubRoutine, StubRoutineId};
pub use runtime::Vm;
pub use stats::CallLinkStats;
pub use value::{Executable, ExecutableBuilder, RealmId, SpecializationKind, Value};

pub use otter_vm_gc::CellId;
