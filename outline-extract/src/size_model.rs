//! The size model (§4.9): per-instruction byte-size estimates plus the
//! constants `caller_savings`/`callee_size` are computed from. A real size
//! model would query the target's codegen subsystem; `DefaultSizeModel`
//! supplies a conservative fallback for when that's unavailable.

use memo_ir::Opcode;

pub trait SizeModel {
    fn instruction_size(&self, opcode: Opcode) -> u32;
    fn call_instruction_size(&self) -> u32;
    fn function_size_without_callees(&self) -> u32;
    fn function_size_with_callees(&self) -> u32;

    /// Cost of moving one value across the new call boundary (a spill/fill
    /// pair in the common case).
    fn marshalled_value_size(&self) -> u32 {
        4
    }
}

/// 4 bytes/instruction, 16-byte prologue: a deliberately conservative
/// placeholder cost model.
pub struct DefaultSizeModel;

impl SizeModel for DefaultSizeModel {
    fn instruction_size(&self, opcode: Opcode) -> u32 {
        match opcode {
            Opcode::Call | Opcode::Invoke => 8,
            Opcode::Switch => 12,
            _ => 4,
        }
    }

    fn call_instruction_size(&self) -> u32 {
        8
    }

    fn function_size_without_callees(&self) -> u32 {
        16
    }

    fn function_size_with_callees(&self) -> u32 {
        24
    }
}
