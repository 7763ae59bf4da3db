use otter_vm_gc::CellId;

use crate::code_block::{CodeBlockId, CodePtr};
use crate::error::VmResult;
use crate::frame::CallFrame;
use crate::runtime::Vm;
use crate::value::Value;

pub(crate) fn fake_cell(n: u32) -> CellId {
    CellId::from_bits(n as u64)
}

pub(crate) fn noop_entry(_vm: &mut Vm, _frame: &CallFrame) -> VmResult<Value> {
    Ok(Value::Undefined)
}

pub(crate) fn code_ptr(n: u64) -> CodePtr {
    CodePtr::new(CodeBlockId::new(n), noop_entry)
}
