//! Register allocator contract.
//!
//! The block compiler drives the allocator through three calls: `start`
//! once per block, `set_ir_index` before each instruction, and `flush_all`
//! wherever guest state must be fully in memory (before calls into Rust,
//! before exits). Operand placement itself is architecture specific and
//! lives on the implementing type.

use super::ir::IrBlock;

pub trait RegAllocator {
    /// Code sink the allocator emits loads and stores into.
    type Emitter;
    type Error;

    /// Reset all mappings for a new block.
    fn start(&mut self, block: &IrBlock);

    /// Position of the instruction about to be compiled.
    fn set_ir_index(&mut self, index: usize);

    /// Write back and unmap cached guest registers of the selected classes.
    fn flush_all(&mut self, emit: &mut Self::Emitter, gpr: bool, fpr: bool) -> Result<(), Self::Error>;
}
