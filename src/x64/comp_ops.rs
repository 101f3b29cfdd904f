//! Instruction selection: one IR instruction into the current chunk.
//!
//! Integer ALU ops, PC and downcount updates, rounding mode switches and all
//! exits are compiled natively. Everything else goes through the generic
//! bridge, which spills guest state and calls the Rust handler.

use super::backend::X64JitBackend;
use super::encoder::{AluOp, JumpCondition, ShiftOp};
use super::reg_cache::MapMode;
use super::regs::*;
use crate::core::block_cache::IrBlockCache;
use crate::core::context::GuestContext;
use crate::core::error::JitResult;
use crate::core::ir::{IrInst, IrOp};
use crate::core::reg_alloc::RegAllocator;

fn alu_op(op: IrOp) -> Option<AluOp> {
    match op {
        IrOp::Add | IrOp::AddConst => Some(AluOp::Add),
        IrOp::Sub | IrOp::SubConst => Some(AluOp::Sub),
        IrOp::And | IrOp::AndConst => Some(AluOp::And),
        IrOp::Or | IrOp::OrConst => Some(AluOp::Or),
        IrOp::Xor | IrOp::XorConst => Some(AluOp::Xor),
        _ => None,
    }
}

impl X64JitBackend {
    pub(super) fn compile_ir_inst(&mut self, blocks: &IrBlockCache, inst: &IrInst) -> JitResult<()> {
        match inst.op {
            IrOp::Nop => Ok(()),
            IrOp::SetConst => {
                let dest = self.regs.map_gpr(&mut self.enc, inst.dest, MapMode::Write)?;
                self.enc.mov32_reg_imm(dest, inst.constant)?;
                Ok(())
            }
            IrOp::Mov => {
                if inst.dest != inst.src1 {
                    let src = self.regs.map_gpr(&mut self.enc, inst.src1, MapMode::Read)?;
                    let dest = self.regs.map_gpr(&mut self.enc, inst.dest, MapMode::Write)?;
                    self.enc.mov32_reg_reg(dest, src)?;
                }
                Ok(())
            }
            IrOp::Add | IrOp::Sub | IrOp::And | IrOp::Or | IrOp::Xor => self.comp_binary(inst),
            IrOp::AddConst | IrOp::SubConst | IrOp::AndConst | IrOp::OrConst | IrOp::XorConst => {
                self.comp_binary_const(inst)
            }
            IrOp::ShlImm | IrOp::ShrImm | IrOp::SarImm => self.comp_shift_imm(inst),
            IrOp::SetPc => {
                let src = self.regs.map_gpr(&mut self.enc, inst.src1, MapMode::Read)?;
                self.enc.mov32_mem_reg(CTXREG, GuestContext::PC_OFFSET, src)?;
                Ok(())
            }
            IrOp::SetPcConst => {
                self.enc.mov32_mem_imm(CTXREG, GuestContext::PC_OFFSET, inst.constant)?;
                Ok(())
            }
            IrOp::Downcount => {
                if self.options.use_static_alloc {
                    self.enc.alu32_reg_imm(AluOp::Sub, DOWNCOUNTREG, inst.constant)?;
                } else {
                    self.enc
                        .alu32_mem_imm(AluOp::Sub, CTXREG, GuestContext::DOWNCOUNT_OFFSET, inst.constant)?;
                }
                Ok(())
            }
            IrOp::RestoreRoundingMode => {
                self.enc.call_addr(self.fixed.restore_rounding_mode)?;
                Ok(())
            }
            IrOp::ApplyRoundingMode => {
                self.enc.call_addr(self.fixed.apply_rounding_mode)?;
                Ok(())
            }
            IrOp::Interpret => self.comp_interpret(inst),
            IrOp::ExitToConst => {
                self.regs.flush_all(&mut self.enc, true, true)?;
                self.write_exit(blocks, inst.constant)
            }
            IrOp::ExitToReg => {
                let src = self.regs.map_gpr(&mut self.enc, inst.src1, MapMode::Read)?;
                self.enc.mov32_reg_reg(SCRATCH1, src)?;
                self.regs.flush_all(&mut self.enc, true, true)?;
                self.enc.jmp_addr(self.fixed.dispatcher_pc_in_scratch1)?;
                Ok(())
            }
            IrOp::ExitToPc => {
                // The PC is already in the context; the core state may have changed.
                self.regs.flush_all(&mut self.enc, true, true)?;
                self.enc.jmp_addr(self.fixed.dispatcher_check_core_state)?;
                Ok(())
            }
            IrOp::ExitToConstIfEq
            | IrOp::ExitToConstIfNeq
            | IrOp::ExitToConstIfGtZ
            | IrOp::ExitToConstIfGeZ
            | IrOp::ExitToConstIfLtZ
            | IrOp::ExitToConstIfLeZ => self.comp_exit_if(blocks, inst),
            _ => self.comp_generic(inst),
        }
    }

    fn comp_binary(&mut self, inst: &IrInst) -> JitResult<()> {
        let Some(op) = alu_op(inst.op) else {
            return self.comp_generic(inst);
        };
        let src1 = self.regs.map_gpr(&mut self.enc, inst.src1, MapMode::Read)?;
        let src2 = self.regs.map_gpr(&mut self.enc, inst.src2, MapMode::Read)?;

        if inst.dest == inst.src1 {
            let dest = self.regs.map_gpr(&mut self.enc, inst.dest, MapMode::ReadWrite)?;
            self.enc.alu32_reg_reg(op, dest, src2)?;
        } else if inst.dest != inst.src2 {
            let dest = self.regs.map_gpr(&mut self.enc, inst.dest, MapMode::Write)?;
            self.enc.mov32_reg_reg(dest, src1)?;
            self.enc.alu32_reg_reg(op, dest, src2)?;
        } else {
            // dest aliases src2 only; build the result in scratch.
            self.enc.mov32_reg_reg(SCRATCH1, src1)?;
            self.enc.alu32_reg_reg(op, SCRATCH1, src2)?;
            let dest = self.regs.map_gpr(&mut self.enc, inst.dest, MapMode::Write)?;
            self.enc.mov32_reg_reg(dest, SCRATCH1)?;
        }
        Ok(())
    }

    fn comp_binary_const(&mut self, inst: &IrInst) -> JitResult<()> {
        let Some(op) = alu_op(inst.op) else {
            return self.comp_generic(inst);
        };
        let dest = self.map_dest_from_src1(inst)?;
        self.enc.alu32_reg_imm(op, dest, inst.constant)?;
        Ok(())
    }

    fn comp_shift_imm(&mut self, inst: &IrInst) -> JitResult<()> {
        let op = match inst.op {
            IrOp::ShlImm => ShiftOp::Shl,
            IrOp::ShrImm => ShiftOp::Shr,
            _ => ShiftOp::Sar,
        };
        let dest = self.map_dest_from_src1(inst)?;
        self.enc.shift32_reg_imm(op, dest, inst.src2)?;
        Ok(())
    }

    /// Map `dest` holding a copy of `src1`, ready to be modified in place.
    fn map_dest_from_src1(&mut self, inst: &IrInst) -> JitResult<AsmReg> {
        if inst.dest == inst.src1 {
            return Ok(self.regs.map_gpr(&mut self.enc, inst.dest, MapMode::ReadWrite)?);
        }
        let src = self.regs.map_gpr(&mut self.enc, inst.src1, MapMode::Read)?;
        let dest = self.regs.map_gpr(&mut self.enc, inst.dest, MapMode::Write)?;
        self.enc.mov32_reg_reg(dest, src)?;
        Ok(dest)
    }

    fn comp_exit_if(&mut self, blocks: &IrBlockCache, inst: &IrInst) -> JitResult<()> {
        let lhs = self.regs.map_gpr(&mut self.enc, inst.src1, MapMode::Read)?;
        let rhs = match inst.op {
            IrOp::ExitToConstIfEq | IrOp::ExitToConstIfNeq => {
                Some(self.regs.map_gpr(&mut self.enc, inst.src2, MapMode::Read)?)
            }
            _ => None,
        };
        // Stores only; the mapped registers keep their values for the compare.
        self.regs.flush_all(&mut self.enc, true, true)?;

        match rhs {
            Some(rhs) => self.enc.cmp32_reg_reg(lhs, rhs)?,
            None => self.enc.cmp32_reg_imm(lhs, 0)?,
        }
        let taken = match inst.op {
            IrOp::ExitToConstIfEq => JumpCondition::Equal,
            IrOp::ExitToConstIfNeq => JumpCondition::NotEqual,
            IrOp::ExitToConstIfGtZ => JumpCondition::Greater,
            IrOp::ExitToConstIfGeZ => JumpCondition::GreaterEqual,
            IrOp::ExitToConstIfLtZ => JumpCondition::Less,
            _ => JumpCondition::LessEqual,
        };

        let mut skip = self.enc.create_label();
        self.enc.jcc_label(taken.invert(), skip)?;
        self.write_exit(blocks, inst.constant)?;
        self.enc.place_label(&mut skip)?;
        Ok(())
    }

    fn save_static_registers(&mut self) -> JitResult<()> {
        if let Some(save) = self.fixed.save_static_registers {
            self.enc.call_addr(save)?;
        }
        Ok(())
    }

    fn load_static_registers(&mut self) -> JitResult<()> {
        if let Some(load) = self.fixed.load_static_registers {
            self.enc.call_addr(load)?;
        }
        Ok(())
    }

    /// Run `inst` through the generic Rust handler.
    pub(super) fn comp_generic(&mut self, inst: &IrInst) -> JitResult<()> {
        self.regs.flush_all(&mut self.enc, true, true)?;
        self.save_static_registers()?;
        self.enc.mov64_reg_reg(ARG1, CTXREG)?;
        self.enc.mov64_reg_imm(ARG2, inst.encode())?;
        self.enc.mov64_reg_imm(SCRATCH1, self.hooks.generic as usize as u64)?;
        self.enc.call_reg(SCRATCH1)?;
        self.load_static_registers()?;

        // A non-zero result is the PC to continue at.
        if inst.op.is_exit() {
            self.enc.test32_reg_reg(SCRATCH1, SCRATCH1)?;
            self.enc.jcc_addr(JumpCondition::NotEqual, self.fixed.dispatcher_pc_in_scratch1)?;
        }
        Ok(())
    }

    fn comp_interpret(&mut self, inst: &IrInst) -> JitResult<()> {
        let opcode = inst.constant;
        let handler = (self.hooks.interpret_lookup)(opcode);

        self.regs.flush_all(&mut self.enc, true, true)?;
        self.save_static_registers()?;
        if self.options.diagnostic_checks {
            if let Some(notify) = self.hooks.notify_interpret {
                self.enc.mov64_reg_reg(ARG1, CTXREG)?;
                self.enc.mov32_reg_imm(ARG2, opcode)?;
                self.enc.mov64_reg_imm(SCRATCH1, notify as usize as u64)?;
                self.enc.call_reg(SCRATCH1)?;
            }
        }
        self.enc.mov64_reg_reg(ARG1, CTXREG)?;
        self.enc.mov32_reg_imm(ARG2, opcode)?;
        self.enc.mov64_reg_imm(SCRATCH1, handler as usize as u64)?;
        self.enc.call_reg(SCRATCH1)?;
        self.load_static_registers()?;
        Ok(())
    }
}
