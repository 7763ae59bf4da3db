//! Call frames handed to native entry points.

use otter_vm_gc::CellId;

use crate::code_block::CodeBlockId;
use crate::value::{SpecializationKind, Value};

/// Frame of an executing function.
#[derive(Debug, Clone)]
pub struct CallFrame {
    code_block: CodeBlockId,
    callee: CellId,
    this: Value,
    arguments: Vec<Value>,
    kind: SpecializationKind,
}

impl CallFrame {
    pub(crate) fn new(
        code_block: CodeBlockId,
        callee: CellId,
        this: Value,
        arguments: Vec<Value>,
        kind: SpecializationKind,
    ) -> Self {
        Self {
            code_block,
            callee,
            this,
            arguments,
            kind,
        }
    }

    /// Code block being executed
    pub fn code_block(&self) -> CodeBlockId {
        self.code_block
    }

    /// Function being executed
    pub fn callee(&self) -> CellId {
        self.callee
    }

    /// `this` value; the freshly allocated object for construct calls
    pub fn this(&self) -> Value {
        self.this
    }

    /// All passed arguments
    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// Argument `index`, `undefined` when not passed
    pub fn argument(&self, index: usize) -> Value {
        self.arguments.get(index).copied().unwrap_or_default()
    }

    /// Number of passed arguments including `this`
    pub fn argument_count_including_this(&self) -> usize {
        self.arguments.len() + 1
    }

    /// Whether this frame was entered by a construct call
    pub fn is_construct(&self) -> bool {
        self.kind == SpecializationKind::Construct
    }

    /// Every value the frame keeps alive
    pub(crate) fn for_each_root(&self, visitor: &mut dyn FnMut(CellId)) {
        visitor(self.callee);
        for value in std::iter::once(&self.this).chain(&self.arguments) {
            if let Value::Cell(cell) = value {
                visitor(*cell);
            }
        }
    }
}
