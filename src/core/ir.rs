// This module defines the intermediate representation consumed by the backend. The front end
// hands over blocks of fixed-width IrInst values: an IrOp opcode, three register slots and a
// 32-bit constant, packed into 8 bytes so that a whole instruction can be passed by value to
// the generic fallback handler. Every opcode carries static metadata (printable name, operand
// signature, capability flags); the EXIT flag marks instructions that may leave the block.
// IrBlock ties an instruction sequence to the guest PC it was decoded from and, once compiled,
// to the offset of its host code in the code cache.

//! IR instructions and blocks.

use std::fmt;

/// Capability flags attached to an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IrFlags(u32);

impl IrFlags {
    pub const NONE: IrFlags = IrFlags(0);
    /// The instruction may transfer control out of the block.
    pub const EXIT: IrFlags = IrFlags(1 << 0);
    /// The instruction touches guest floating point state.
    pub const FPU: IrFlags = IrFlags(1 << 1);

    pub const fn contains(self, other: IrFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: IrFlags) -> IrFlags {
        IrFlags(self.0 | other.0)
    }
}

/// Static description of an opcode.
///
/// `types` lists the operands in print order: `G` guest GPR, `F` guest FPR,
/// `C` the 32-bit constant, `I` an 8-bit immediate kept in `src2`, `_` a
/// register slot the opcode leaves unused. Register letters consume the
/// slots `dest`, `src1`, `src2` in that order.
#[derive(Debug, Clone, Copy)]
pub struct IrMeta {
    pub name: &'static str,
    pub types: &'static str,
    pub flags: IrFlags,
}

macro_rules! ir_ops {
    ($($op:ident => ($types:literal, $flags:expr)),* $(,)?) => {
        /// IR opcodes.
        ///
        /// Discriminants are dense and start at zero; they are part of the
        /// encoded instruction handed to the generic handler.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum IrOp {
            $($op),*
        }

        impl IrOp {
            /// Every opcode, indexed by discriminant.
            pub const ALL: &'static [IrOp] = &[$(IrOp::$op),*];

            /// Metadata for this opcode.
            pub const fn meta(self) -> IrMeta {
                match self {
                    $(IrOp::$op => IrMeta {
                        name: stringify!($op),
                        types: $types,
                        flags: $flags,
                    }),*
                }
            }
        }
    };
}

ir_ops! {
    Nop => ("", IrFlags::NONE),
    SetConst => ("GC", IrFlags::NONE),
    Mov => ("GG", IrFlags::NONE),
    Add => ("GGG", IrFlags::NONE),
    Sub => ("GGG", IrFlags::NONE),
    And => ("GGG", IrFlags::NONE),
    Or => ("GGG", IrFlags::NONE),
    Xor => ("GGG", IrFlags::NONE),
    AddConst => ("GGC", IrFlags::NONE),
    SubConst => ("GGC", IrFlags::NONE),
    AndConst => ("GGC", IrFlags::NONE),
    OrConst => ("GGC", IrFlags::NONE),
    XorConst => ("GGC", IrFlags::NONE),
    ShlImm => ("GGI", IrFlags::NONE),
    ShrImm => ("GGI", IrFlags::NONE),
    SarImm => ("GGI", IrFlags::NONE),
    Load32 => ("GGC", IrFlags::NONE),
    Store32 => ("GGC", IrFlags::NONE),
    FAdd => ("FFF", IrFlags::FPU),
    FMul => ("FFF", IrFlags::FPU),
    SetPc => ("_G", IrFlags::NONE),
    SetPcConst => ("C", IrFlags::NONE),
    Downcount => ("C", IrFlags::NONE),
    RestoreRoundingMode => ("", IrFlags::FPU),
    ApplyRoundingMode => ("", IrFlags::FPU),
    UpdateRoundingMode => ("", IrFlags::FPU),
    Interpret => ("C", IrFlags::NONE),
    CallReplacement => ("C", IrFlags::EXIT),
    Syscall => ("C", IrFlags::EXIT),
    Break => ("C", IrFlags::EXIT),
    ExitToConst => ("C", IrFlags::EXIT),
    ExitToReg => ("_G", IrFlags::EXIT),
    ExitToPc => ("", IrFlags::EXIT),
    ExitToConstIfEq => ("C_GG", IrFlags::EXIT),
    ExitToConstIfNeq => ("C_GG", IrFlags::EXIT),
    ExitToConstIfGtZ => ("C_G", IrFlags::EXIT),
    ExitToConstIfGeZ => ("C_G", IrFlags::EXIT),
    ExitToConstIfLtZ => ("C_G", IrFlags::EXIT),
    ExitToConstIfLeZ => ("C_G", IrFlags::EXIT),
}

impl IrOp {
    pub fn from_u8(value: u8) -> Option<IrOp> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn from_name(name: &str) -> Option<IrOp> {
        Self::ALL.iter().copied().find(|op| op.meta().name == name)
    }

    pub fn flags(self) -> IrFlags {
        self.meta().flags
    }

    pub fn is_exit(self) -> bool {
        self.flags().contains(IrFlags::EXIT)
    }
}

/// A single IR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct IrInst {
    pub op: IrOp,
    pub dest: u8,
    pub src1: u8,
    pub src2: u8,
    pub constant: u32,
}

impl IrInst {
    pub const fn new(op: IrOp, dest: u8, src1: u8, src2: u8, constant: u32) -> Self {
        Self {
            op,
            dest,
            src1,
            src2,
            constant,
        }
    }

    /// Instruction with only a constant operand (exits, downcount, ...).
    pub const fn with_constant(op: IrOp, constant: u32) -> Self {
        Self::new(op, 0, 0, 0, constant)
    }

    /// Pack into the 64-bit form passed to the generic handler.
    pub fn encode(&self) -> u64 {
        (self.op as u64)
            | (self.dest as u64) << 8
            | (self.src1 as u64) << 16
            | (self.src2 as u64) << 24
            | (self.constant as u64) << 32
    }

    /// Reverse of [`IrInst::encode`]. `None` for an unknown opcode byte.
    pub fn decode(value: u64) -> Option<IrInst> {
        let op = IrOp::from_u8(value as u8)?;
        Some(IrInst {
            op,
            dest: (value >> 8) as u8,
            src1: (value >> 16) as u8,
            src2: (value >> 24) as u8,
            constant: (value >> 32) as u32,
        })
    }

    pub fn meta(&self) -> IrMeta {
        self.op.meta()
    }
}

impl fmt::Display for IrInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta();
        write!(f, "{}", meta.name)?;

        let slots = [self.dest, self.src1, self.src2];
        let mut slot = 0;
        let mut first = true;
        for ty in meta.types.chars() {
            let text = match ty {
                'C' => format!("{:#x}", self.constant),
                '_' => {
                    slot += 1;
                    continue;
                }
                'I' => {
                    let value = slots.get(slot).copied().unwrap_or(0);
                    slot += 1;
                    format!("{value}")
                }
                'F' => {
                    let reg = slots.get(slot).copied().unwrap_or(0);
                    slot += 1;
                    format!("f{reg}")
                }
                _ => {
                    let reg = slots.get(slot).copied().unwrap_or(0);
                    slot += 1;
                    format!("r{reg}")
                }
            };
            f.write_str(if first { " " } else { ", " })?;
            f.write_str(&text)?;
            first = false;
        }
        Ok(())
    }
}

/// A block of IR, as produced by the front end.
///
/// The instruction list is fixed at construction. The backend only records
/// where the block's code landed in the cache.
#[derive(Debug, Clone)]
pub struct IrBlock {
    instructions: Vec<IrInst>,
    original_start: u32,
    target_offset: Option<u32>,
    valid: bool,
}

impl IrBlock {
    pub fn new(original_start: u32, instructions: Vec<IrInst>) -> Self {
        Self {
            instructions,
            original_start,
            target_offset: None,
            valid: true,
        }
    }

    pub fn instructions(&self) -> &[IrInst] {
        &self.instructions
    }

    pub fn num_instructions(&self) -> usize {
        self.instructions.len()
    }

    /// Guest PC this block was decoded from.
    pub fn original_start(&self) -> u32 {
        self.original_start
    }

    /// Offset of the block's unchecked entry in the code cache.
    pub fn target_offset(&self) -> Option<u32> {
        self.target_offset
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn set_target_offset(&mut self, offset: u32) {
        self.target_offset = Some(offset);
    }

    pub(crate) fn clear_target_offset(&mut self) {
        self.target_offset = None;
    }

    pub(crate) fn mark_invalid(&mut self) {
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_are_dense() {
        for (index, op) in IrOp::ALL.iter().enumerate() {
            assert_eq!(*op as usize, index, "{op:?} out of place");
            assert_eq!(IrOp::from_u8(index as u8), Some(*op));
        }
        assert_eq!(IrOp::from_u8(IrOp::ALL.len() as u8), None);
    }

    #[test]
    fn encoded_instruction_keeps_every_field() {
        let inst = IrInst::new(IrOp::ExitToConstIfNeq, 1, 2, 3, 0x8804_1234);
        let value = inst.encode();
        assert_eq!(value & 0xFF, IrOp::ExitToConstIfNeq as u64);
        assert_eq!(value >> 32, 0x8804_1234);
        assert_eq!(IrInst::decode(value), Some(inst));
        assert_eq!(IrInst::decode(0xFF), None);
    }

    #[test]
    fn instruction_is_eight_bytes() {
        assert_eq!(std::mem::size_of::<IrInst>(), 8);
    }

    #[test]
    fn display_follows_operand_signature() {
        let add = IrInst::new(IrOp::Add, 3, 1, 2, 0);
        assert_eq!(add.to_string(), "Add r3, r1, r2");

        let exit = IrInst::new(IrOp::ExitToConstIfEq, 0, 4, 5, 0x100);
        assert_eq!(exit.to_string(), "ExitToConstIfEq 0x100, r4, r5");

        let shift = IrInst::new(IrOp::ShlImm, 1, 1, 4, 0);
        assert_eq!(shift.to_string(), "ShlImm r1, r1, 4");

        assert_eq!(IrInst::with_constant(IrOp::ExitToPc, 0).to_string(), "ExitToPc");
    }

    #[test]
    fn exit_flags() {
        assert!(IrOp::ExitToConst.is_exit());
        assert!(IrOp::Syscall.is_exit());
        assert!(!IrOp::Interpret.is_exit());
        assert!(!IrOp::Add.is_exit());
        assert!(IrFlags::EXIT.union(IrFlags::FPU).contains(IrFlags::FPU));
    }
}
