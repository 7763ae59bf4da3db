//! Call linking errors

use thiserror::Error;

use crate::call_link_info::LinkMode;
use crate::code_block::CodeBlockId;
use otter_vm_gc::CellId;

/// Errors surfaced by executing calls through the VM.
#[derive(Debug, Error)]
pub enum VmError {
    /// User-visible type error raised at a call site
    #[error("TypeError: {message}")]
    TypeError {
        /// Error message
        message: String,
    },

    /// Internal consistency violation
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl VmError {
    /// Create a type error
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::TypeError {
            message: message.into(),
        }
    }

    /// Whether this is a user-visible type error
    pub fn is_type_error(&self) -> bool {
        matches!(self, Self::TypeError { .. })
    }
}

/// Internal consistency errors. These indicate a bug in the VM, never in
/// the program being run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    /// A call target refers to a code block that no longer exists
    #[error("dangling code pointer into {0:?}")]
    DanglingCodePointer(CodeBlockId),

    /// Lookup of a code block that does not exist
    #[error("unknown code block {0:?}")]
    UnknownCodeBlock(CodeBlockId),

    /// Lookup of a call site index that the code block does not have
    #[error("unknown call site {index} in {code_block:?}")]
    UnknownCallSite {
        /// Owning code block
        code_block: CodeBlockId,
        /// Site index
        index: usize,
    },

    /// A handle that should be alive resolved to nothing
    #[error("dead cell {0:?}")]
    DeadCell(CellId),

    /// A call was executed through a site of the wrong call mode
    #[error("call site {index} in {code_block:?} is not a {expected} site")]
    CallModeMismatch {
        /// Owning code block
        code_block: CodeBlockId,
        /// Site index
        index: usize,
        /// What the caller expected
        expected: &'static str,
    },

    /// A link-info state transition was rejected
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Illegal call link info state transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {operation} while call link is {mode}")]
pub struct LinkError {
    /// Rejected operation
    pub operation: &'static str,
    /// Link mode at the time of the request
    pub mode: LinkMode,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A tunable is outside its accepted range
    #[error("{name} must be in {min}..={max}, got {value}")]
    OutOfRange {
        /// Field name
        name: &'static str,
        /// Rejected value
        value: u64,
        /// Lower bound
        min: u64,
        /// Upper bound
        max: u64,
    },

    /// An environment variable could not be parsed
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },

    /// Malformed JSON configuration
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for VM operations
pub type VmResult<T> = std::result::Result<T, VmError>;
