// This module wraps the iced-x86 CodeAssembler into the instruction vocabulary the backend
// needs. X64Encoder converts AsmReg register references into iced registers and emits 32-bit
// guest arithmetic, context-relative loads and stores, MXCSR access, calls and jumps to
// absolute host addresses, and label based control flow. Branch forms are pinned: short
// branches are disabled and the block encoder runs with DONT_FIX_BRANCHES, so every jump is
// emitted in its rel32 form and an instruction sequence always has the same length no matter
// where it is placed. The backend depends on that to reserve fixed-size patchable exits and
// to measure an exit once and pad it. Assembly produces the code bytes plus the resolved
// address of every label asked for, and resets the encoder for the next chunk.

//! x86-64 instruction encoding using iced-x86.

use super::regs::AsmReg;
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError};

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    InvalidRegister,
    /// Assembly error from iced-x86.
    AssemblyError(String),
    /// A label was requested that the assembled code never placed.
    UnplacedLabel,
    /// Every allocatable register is locked by the current instruction.
    NoFreeRegister,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidRegister => write!(f, "Invalid register for operation"),
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::UnplacedLabel => write!(f, "Label was never placed"),
            EncodingError::NoFreeRegister => write!(f, "No register available for allocation"),
        }
    }
}

impl std::error::Error for EncodingError {}

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// Condition codes for conditional jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    /// SF set.
    Sign,
    /// SF clear.
    NotSign,
}

impl JumpCondition {
    pub fn invert(self) -> JumpCondition {
        match self {
            JumpCondition::Equal => JumpCondition::NotEqual,
            JumpCondition::NotEqual => JumpCondition::Equal,
            JumpCondition::Less => JumpCondition::GreaterEqual,
            JumpCondition::Greater => JumpCondition::LessEqual,
            JumpCondition::LessEqual => JumpCondition::Greater,
            JumpCondition::GreaterEqual => JumpCondition::Less,
            JumpCondition::Sign => JumpCondition::NotSign,
            JumpCondition::NotSign => JumpCondition::Sign,
        }
    }
}

/// Two-operand integer ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

/// Output of [`X64Encoder::assemble`].
#[derive(Debug, Clone, Default)]
pub struct Assembled {
    pub bytes: Vec<u8>,
    /// Addresses of the requested labels, in request order.
    pub label_ips: Vec<u64>,
}

// Emits one conditional jump; `$target` may be a CodeLabel or an absolute u64.
macro_rules! emit_jcc {
    ($asm:expr, $cond:expr, $target:expr) => {
        match $cond {
            JumpCondition::Equal => $asm.je($target),
            JumpCondition::NotEqual => $asm.jne($target),
            JumpCondition::Less => $asm.jl($target),
            JumpCondition::Greater => $asm.jg($target),
            JumpCondition::LessEqual => $asm.jle($target),
            JumpCondition::GreaterEqual => $asm.jge($target),
            JumpCondition::Sign => $asm.js($target),
            JumpCondition::NotSign => $asm.jns($target),
        }
    };
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    assembler: CodeAssembler,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        let mut assembler = CodeAssembler::new(64).map_err(asm_err)?;
        assembler.set_prefer_short_branch(false);
        Ok(Self { assembler })
    }

    /// Convert AsmReg to iced-x86 64-bit GP register.
    fn to_gp64_register(&self, reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister);
        }

        const GP64_REGS: [AsmRegister64; 16] = [
            rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
            r8, r9, r10, r11, r12, r13, r14, r15,
        ];

        GP64_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Convert AsmReg to iced-x86 32-bit GP register.
    fn to_gp32_register(&self, reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister);
        }

        const GP32_REGS: [AsmRegister32; 16] = [
            eax, ecx, edx, ebx, esp, ebp, esi, edi,
            r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
        ];

        GP32_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Convert AsmReg to iced-x86 8-bit GP register (low byte).
    fn to_gp8_register(&self, reg: AsmReg) -> Result<AsmRegister8, EncodingError> {
        if reg.bank != 0 {
            return Err(EncodingError::InvalidRegister);
        }

        const GP8_REGS: [AsmRegister8; 16] = [
            al, cl, dl, bl, spl, bpl, sil, dil,
            r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
        ];

        GP8_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    fn dword_at(&self, base: AsmReg, offset: i32) -> Result<AsmMemoryOperand, EncodingError> {
        let base_reg = self.to_gp64_register(base)?;
        Ok(dword_ptr(base_reg + offset))
    }

    // ==== MOVES ====

    pub fn mov32_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp32_register(dst)?;
        let src_reg = self.to_gp32_register(src)?;
        self.assembler.mov(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn mov32_reg_imm(&mut self, dst: AsmReg, imm: u32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp32_register(dst)?;
        self.assembler.mov(dst_reg, imm).map_err(asm_err)
    }

    /// `mov dst32, dword [base + offset]`
    pub fn mov32_reg_mem(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp32_register(dst)?;
        let mem = self.dword_at(base, offset)?;
        self.assembler.mov(dst_reg, mem).map_err(asm_err)
    }

    /// `mov dword [base + offset], src32`
    pub fn mov32_mem_reg(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let src_reg = self.to_gp32_register(src)?;
        let mem = self.dword_at(base, offset)?;
        self.assembler.mov(mem, src_reg).map_err(asm_err)
    }

    pub fn mov32_mem_imm(&mut self, base: AsmReg, offset: i32, imm: u32) -> Result<(), EncodingError> {
        let mem = self.dword_at(base, offset)?;
        self.assembler.mov(mem, imm as i32).map_err(asm_err)
    }

    pub fn mov64_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;
        self.assembler.mov(dst_reg, src_reg).map_err(asm_err)
    }

    pub fn mov64_reg_imm(&mut self, dst: AsmReg, imm: u64) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        self.assembler.mov(dst_reg, imm).map_err(asm_err)
    }

    // ==== 32-BIT ARITHMETIC ====

    pub fn alu32_reg_reg(&mut self, op: AluOp, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let d = self.to_gp32_register(dst)?;
        let s = self.to_gp32_register(src)?;
        match op {
            AluOp::Add => self.assembler.add(d, s),
            AluOp::Sub => self.assembler.sub(d, s),
            AluOp::And => self.assembler.and(d, s),
            AluOp::Or => self.assembler.or(d, s),
            AluOp::Xor => self.assembler.xor(d, s),
        }
        .map_err(asm_err)
    }

    pub fn alu32_reg_imm(&mut self, op: AluOp, dst: AsmReg, imm: u32) -> Result<(), EncodingError> {
        let d = self.to_gp32_register(dst)?;
        let imm = imm as i32;
        match op {
            AluOp::Add => self.assembler.add(d, imm),
            AluOp::Sub => self.assembler.sub(d, imm),
            AluOp::And => self.assembler.and(d, imm),
            AluOp::Or => self.assembler.or(d, imm),
            AluOp::Xor => self.assembler.xor(d, imm),
        }
        .map_err(asm_err)
    }

    /// ALU op with a dword memory destination.
    pub fn alu32_mem_imm(&mut self, op: AluOp, base: AsmReg, offset: i32, imm: u32) -> Result<(), EncodingError> {
        let mem = self.dword_at(base, offset)?;
        let imm = imm as i32;
        match op {
            AluOp::Add => self.assembler.add(mem, imm),
            AluOp::Sub => self.assembler.sub(mem, imm),
            AluOp::And => self.assembler.and(mem, imm),
            AluOp::Or => self.assembler.or(mem, imm),
            AluOp::Xor => self.assembler.xor(mem, imm),
        }
        .map_err(asm_err)
    }

    pub fn or32_mem_reg(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let src_reg = self.to_gp32_register(src)?;
        let mem = self.dword_at(base, offset)?;
        self.assembler.or(mem, src_reg).map_err(asm_err)
    }

    pub fn shift32_reg_imm(&mut self, op: ShiftOp, dst: AsmReg, amount: u8) -> Result<(), EncodingError> {
        let d = self.to_gp32_register(dst)?;
        let amount = (amount & 31) as i32;
        match op {
            ShiftOp::Shl => self.assembler.shl(d, amount),
            ShiftOp::Shr => self.assembler.shr(d, amount),
            ShiftOp::Sar => self.assembler.sar(d, amount),
        }
        .map_err(asm_err)
    }

    // ==== COMPARISONS ====

    pub fn cmp32_reg_reg(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        let l = self.to_gp32_register(left)?;
        let r = self.to_gp32_register(right)?;
        self.assembler.cmp(l, r).map_err(asm_err)
    }

    pub fn cmp32_reg_imm(&mut self, reg: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let r = self.to_gp32_register(reg)?;
        self.assembler.cmp(r, imm).map_err(asm_err)
    }

    pub fn cmp32_mem_imm(&mut self, base: AsmReg, offset: i32, imm: i32) -> Result<(), EncodingError> {
        let mem = self.dword_at(base, offset)?;
        self.assembler.cmp(mem, imm).map_err(asm_err)
    }

    pub fn test32_reg_reg(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        let l = self.to_gp32_register(left)?;
        let r = self.to_gp32_register(right)?;
        self.assembler.test(l, r).map_err(asm_err)
    }

    pub fn test32_mem_imm(&mut self, base: AsmReg, offset: i32, imm: u32) -> Result<(), EncodingError> {
        let mem = self.dword_at(base, offset)?;
        self.assembler.test(mem, imm as i32).map_err(asm_err)
    }

    pub fn test8_reg_imm(&mut self, reg: AsmReg, imm: u8) -> Result<(), EncodingError> {
        let r = self.to_gp8_register(reg)?;
        self.assembler.test(r, imm as i32).map_err(asm_err)
    }

    pub fn test64_reg_reg(&mut self, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        let l = self.to_gp64_register(left)?;
        let r = self.to_gp64_register(right)?;
        self.assembler.test(l, r).map_err(asm_err)
    }

    // ==== MXCSR ====

    pub fn stmxcsr(&mut self, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let mem = self.dword_at(base, offset)?;
        self.assembler.stmxcsr(mem).map_err(asm_err)
    }

    pub fn ldmxcsr(&mut self, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let mem = self.dword_at(base, offset)?;
        self.assembler.ldmxcsr(mem).map_err(asm_err)
    }

    // ==== STACK ====

    pub fn push_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = self.to_gp64_register(reg)?;
        self.assembler.push(r).map_err(asm_err)
    }

    pub fn pop_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = self.to_gp64_register(reg)?;
        self.assembler.pop(r).map_err(asm_err)
    }

    pub fn add64_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let d = self.to_gp64_register(dst)?;
        self.assembler.add(d, imm).map_err(asm_err)
    }

    pub fn sub64_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let d = self.to_gp64_register(dst)?;
        self.assembler.sub(d, imm).map_err(asm_err)
    }

    // ==== CONTROL FLOW ====

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret().map_err(asm_err)
    }

    pub fn call_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = self.to_gp64_register(reg)?;
        self.assembler.call(r).map_err(asm_err)
    }

    /// `call rel32` to an absolute host address.
    pub fn call_addr(&mut self, target: u64) -> Result<(), EncodingError> {
        self.assembler.call(target).map_err(asm_err)
    }

    pub fn call_label(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.call(label).map_err(asm_err)
    }

    pub fn jmp_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let r = self.to_gp64_register(reg)?;
        self.assembler.jmp(r).map_err(asm_err)
    }

    /// `jmp rel32` to an absolute host address.
    pub fn jmp_addr(&mut self, target: u64) -> Result<(), EncodingError> {
        self.assembler.jmp(target).map_err(asm_err)
    }

    pub fn jmp_label(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.jmp(label).map_err(asm_err)
    }

    pub fn jcc_addr(&mut self, condition: JumpCondition, target: u64) -> Result<(), EncodingError> {
        emit_jcc!(self.assembler, condition, target).map_err(asm_err)
    }

    pub fn jcc_label(&mut self, condition: JumpCondition, label: CodeLabel) -> Result<(), EncodingError> {
        emit_jcc!(self.assembler, condition, label).map_err(asm_err)
    }

    // ==== LABELS AND PADDING ====

    pub fn create_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    /// Bind `label` to the current position.
    ///
    /// The label is anchored on a zero-length instruction so it can sit at
    /// the very end of a chunk.
    pub fn place_label(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        self.assembler.set_label(label).map_err(asm_err)?;
        self.assembler.zero_bytes().map_err(asm_err)
    }

    /// `count` bytes of int3.
    pub fn pad_int3(&mut self, count: usize) -> Result<(), EncodingError> {
        if count == 0 {
            return Ok(());
        }
        self.assembler.db(&vec![0xCC; count]).map_err(asm_err)
    }

    pub fn is_empty(&self) -> bool {
        self.assembler.instructions().is_empty()
    }

    /// Encode everything emitted so far as if placed at `ip`, and reset.
    pub fn assemble(&mut self, ip: u64, labels: &[CodeLabel]) -> Result<Assembled, EncodingError> {
        if self.is_empty() {
            if labels.is_empty() {
                return Ok(Assembled::default());
            }
            return Err(EncodingError::UnplacedLabel);
        }

        let result = self.assembler.assemble_options(
            ip,
            BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS | BlockEncoderOptions::DONT_FIX_BRANCHES,
        );
        self.assembler.reset();
        let result = result.map_err(asm_err)?;

        let mut label_ips = Vec::with_capacity(labels.len());
        for label in labels {
            label_ips.push(result.label_ip(label).map_err(|_| EncodingError::UnplacedLabel)?);
        }
        Ok(Assembled {
            bytes: result.inner.code_buffer,
            label_ips,
        })
    }

    /// Drop everything emitted since the last assembly.
    pub fn reset(&mut self) {
        self.assembler.reset();
    }
}
