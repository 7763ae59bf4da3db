//! Values and heap cells seen by call sites.

use std::fmt;

use otter_vm_gc::{CellId, Trace};

use crate::call_link_info::CallSiteDescriptor;
use crate::code_block::{CodeBlockId, NativeEntry};

/// A VM value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Value {
    /// `undefined`
    #[default]
    Undefined,
    /// Small integer
    Int(i64),
    /// Reference to a heap cell
    Cell(CellId),
}

impl Value {
    /// The referenced cell, if this is a cell value.
    pub fn as_cell(self) -> Option<CellId> {
        match self {
            Self::Cell(cell) => Some(cell),
            _ => None,
        }
    }

    /// The integer payload, if this is an integer.
    pub fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(n),
            _ => None,
        }
    }
}

impl From<CellId> for Value {
    fn from(cell: CellId) -> Self {
        Self::Cell(cell)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

/// Realm (global environment) a function or code block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RealmId(pub u32);

/// Which entry of an executable a call needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecializationKind {
    /// Ordinary call
    Call,
    /// `new` / construct call
    Construct,
}

impl SpecializationKind {
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Call => 0,
            Self::Construct => 1,
        }
    }
}

impl fmt::Display for SpecializationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => f.write_str("call"),
            Self::Construct => f.write_str("construct"),
        }
    }
}

/// A function object: the callee identity cached by call sites.
#[derive(Debug, Clone)]
pub struct FunctionCell {
    /// Shared body of this function
    pub executable: CellId,
    /// Realm the function was created in
    pub realm: RealmId,
    /// Captured values
    pub captures: Vec<Value>,
}

/// Shared body of every function created from the same source.
///
/// Compiled code is attached per specialization; the cell itself never
/// references its code blocks strongly.
#[derive(Debug, Clone)]
pub struct Executable {
    name: String,
    parameter_count: u32,
    constructible: bool,
    can_cache_calls: bool,
    entry: NativeEntry,
    call_sites: Vec<CallSiteDescriptor>,
    code: [Option<CodeBlockId>; 2],
}

impl Executable {
    /// Start building an executable
    pub fn builder(name: impl Into<String>, entry: NativeEntry) -> ExecutableBuilder {
        ExecutableBuilder::new(name, entry)
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter count (excluding `this`)
    pub fn parameter_count(&self) -> u32 {
        self.parameter_count
    }

    /// Whether the executable may be invoked with a construct call
    pub fn is_constructible(&self) -> bool {
        self.constructible
    }

    /// Whether code compiled from this executable may cache callees
    pub fn can_cache_calls(&self) -> bool {
        self.can_cache_calls
    }

    /// Baseline entry point
    pub fn entry(&self) -> NativeEntry {
        self.entry
    }

    /// Call instructions in the body
    pub fn call_sites(&self) -> &[CallSiteDescriptor] {
        &self.call_sites
    }

    /// Current code block for a specialization
    pub fn code_block(&self, kind: SpecializationKind) -> Option<CodeBlockId> {
        self.code[kind.index()]
    }

    pub(crate) fn set_code_block(&mut self, kind: SpecializationKind, code: Option<CodeBlockId>) {
        self.code[kind.index()] = code;
    }
}

/// Builder for [`Executable`]
#[derive(Debug, Clone)]
pub struct ExecutableBuilder {
    name: String,
    parameter_count: u32,
    constructible: bool,
    can_cache_calls: bool,
    entry: NativeEntry,
    call_sites: Vec<CallSiteDescriptor>,
}

impl ExecutableBuilder {
    /// Create a new builder
    pub fn new(name: impl Into<String>, entry: NativeEntry) -> Self {
        Self {
            name: name.into(),
            parameter_count: 0,
            constructible: true,
            can_cache_calls: true,
            entry,
            call_sites: Vec::new(),
        }
    }

    /// Set parameter count
    pub fn parameter_count(mut self, count: u32) -> Self {
        self.parameter_count = count;
        self
    }

    /// Mark as non-constructible (arrow functions, methods)
    pub fn not_constructible(mut self) -> Self {
        self.constructible = false;
        self
    }

    /// Disable call caching for code compiled from this executable
    pub fn without_call_caching(mut self) -> Self {
        self.can_cache_calls = false;
        self
    }

    /// Add a call instruction; sites are numbered in insertion order
    pub fn call_site(mut self, descriptor: CallSiteDescriptor) -> Self {
        self.call_sites.push(descriptor);
        self
    }

    /// Build the executable
    pub fn build(self) -> Executable {
        Executable {
            name: self.name,
            parameter_count: self.parameter_count,
            constructible: self.constructible,
            can_cache_calls: self.can_cache_calls,
            entry: self.entry,
            call_sites: self.call_sites,
            code: [None, None],
        }
    }
}

/// A plain object. Objects are not functions; one with a call handler can
/// still be called, but only generically.
#[derive(Debug, Clone, Default)]
pub struct ObjectCell {
    /// Call trap, if the object is callable
    pub call_handler: Option<NativeEntry>,
}

/// Every kind of cell the VM heap holds.
#[derive(Debug, Clone)]
pub enum HeapCell {
    /// Function object
    Function(FunctionCell),
    /// Shared function body
    Executable(Executable),
    /// Plain object
    Object(ObjectCell),
}

impl HeapCell {
    /// Short description used in error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Function(_) => "function",
            Self::Executable(_) => "executable",
            Self::Object(_) => "object",
        }
    }
}

impl Trace for HeapCell {
    fn tag(&self) -> u8 {
        match self {
            Self::Function(_) => 1,
            Self::Executable(_) => 2,
            Self::Object(_) => 3,
        }
    }

    fn trace(&self, tracer: &mut dyn FnMut(CellId)) {
        if let Self::Function(function) = self {
            tracer(function.executable);
            for capture in &function.captures {
                if let Value::Cell(cell) = capture {
                    tracer(*cell);
                }
            }
        }
    }
}
