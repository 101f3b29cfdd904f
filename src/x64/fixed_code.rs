// This module generates the hand-written routines every compiled block depends on: the
// dispatcher loop that turns a guest PC into a host entry point, the enter/quit pair that
// bridges from Rust into generated code and back, the rounding mode helpers that switch MXCSR
// between host and guest settings, and the optional stubs that spill and reload statically
// allocated registers. Everything is assembled in one pass with labels, appended at the start
// of the code cache, and followed by padding to the next page so that block compilation never
// has to re-protect these pages.

//! Dispatcher and runtime helper stubs.

use super::encoder::{AluOp, JumpCondition, ShiftOp, X64Encoder};
use super::regs::*;
use crate::core::code_block::CodeBlock;
use crate::core::context::{GuestContext, CORE_RUNTIME_ERROR};
use crate::core::error::JitResult;
use crate::core::hooks::JitHooks;
use crate::core::options::JitOptions;

/// MXCSR rounding control (bits 13-14) and flush-to-zero (bit 15).
const MXCSR_ROUNDING_MASK: u32 = 7 << 13;
const MXCSR_FLUSH_TO_ZERO: u32 = 1 << 15;
/// Rounding mode bits and the flush-to-zero bit of FCR31.
const FCR31_ROUNDING_BITS: u32 = 0x0100_0003;
const FCR31_FLUSH_TO_ZERO: u32 = 1 << 24;

/// Host addresses of the generated routines.
#[derive(Debug, Clone, Default)]
pub struct FixedCode {
    pub save_static_registers: Option<u64>,
    pub load_static_registers: Option<u64>,
    pub restore_rounding_mode: u64,
    pub apply_rounding_mode: u64,
    /// `extern "C" fn(*mut GuestContext)`, runs until the core stops.
    pub enter_dispatcher: u64,
    pub outer_loop_pc_in_scratch1: u64,
    pub outer_loop: u64,
    pub dispatcher_check_core_state: u64,
    pub dispatcher_pc_in_scratch1: u64,
    pub dispatcher: u64,
    pub dispatcher_no_check: u64,
    pub quit: u64,
    pub crash_handler: u64,
    start: u64,
    end: u64,
    /// Code cache offset where compiled blocks begin.
    pub jit_start_offset: u32,
}

/// `cmp`/`test` that leaves the sign of the downcount in SF.
pub fn emit_downcount_test(enc: &mut X64Encoder, static_alloc: bool) -> JitResult<()> {
    if static_alloc {
        enc.test32_reg_reg(DOWNCOUNTREG, DOWNCOUNTREG)?;
    } else {
        enc.cmp32_mem_imm(CTXREG, GuestContext::DOWNCOUNT_OFFSET, 0)?;
    }
    Ok(())
}

impl FixedCode {
    /// Emit all routines at the cache cursor and page-align it afterwards.
    pub fn generate(code: &mut CodeBlock, options: &JitOptions, hooks: &JitHooks) -> JitResult<Self> {
        let _write = code.begin_append()?;
        let static_alloc = options.use_static_alloc;
        let start = code.current_address();
        let mut enc = X64Encoder::new()?;

        let mut save_static = enc.create_label();
        let mut load_static = enc.create_label();
        let mut restore_rm = enc.create_label();
        let mut apply_rm = enc.create_label();
        let mut enter = enc.create_label();
        let mut outer_loop_pc = enc.create_label();
        let mut outer_loop = enc.create_label();
        let mut check_core_state = enc.create_label();
        let mut dispatcher_pc = enc.create_label();
        let mut dispatcher = enc.create_label();
        let mut no_check = enc.create_label();
        let mut bail = enc.create_label();
        let mut quit = enc.create_label();
        let mut crash = enc.create_label();

        if static_alloc {
            enc.place_label(&mut save_static)?;
            enc.mov32_mem_reg(CTXREG, GuestContext::DOWNCOUNT_OFFSET, DOWNCOUNTREG)?;
            enc.ret()?;

            enc.place_label(&mut load_static)?;
            enc.mov32_reg_mem(DOWNCOUNTREG, CTXREG, GuestContext::DOWNCOUNT_OFFSET)?;
            enc.ret()?;
        }

        // Back to host defaults: round to nearest, no flush-to-zero.
        enc.place_label(&mut restore_rm)?;
        enc.stmxcsr(CTXREG, GuestContext::TEMP_OFFSET)?;
        enc.alu32_mem_imm(AluOp::And, CTXREG, GuestContext::TEMP_OFFSET, !MXCSR_ROUNDING_MASK)?;
        enc.ldmxcsr(CTXREG, GuestContext::TEMP_OFFSET)?;
        enc.ret()?;

        enc.place_label(&mut apply_rm)?;
        {
            let mut skip = enc.create_label();
            let mut keep_mode = enc.create_label();
            let mut no_ftz = enc.create_label();

            enc.mov32_reg_mem(SCRATCH1, CTXREG, GuestContext::FCR31_OFFSET)?;
            enc.alu32_reg_imm(AluOp::And, SCRATCH1, FCR31_ROUNDING_BITS)?;
            // Nearest without flush-to-zero is what restore left behind.
            enc.jcc_label(JumpCondition::Equal, skip)?;
            enc.stmxcsr(CTXREG, GuestContext::TEMP_OFFSET)?;

            // Guest modes 1 and 3 are swapped relative to MXCSR.
            enc.test8_reg_imm(SCRATCH1, 1)?;
            enc.jcc_label(JumpCondition::Equal, keep_mode)?;
            enc.alu32_reg_imm(AluOp::Xor, SCRATCH1, 2)?;
            enc.place_label(&mut keep_mode)?;

            enc.shift32_reg_imm(ShiftOp::Shl, SCRATCH1, 13)?;
            enc.alu32_mem_imm(AluOp::And, CTXREG, GuestContext::TEMP_OFFSET, !MXCSR_ROUNDING_MASK)?;
            enc.or32_mem_reg(CTXREG, GuestContext::TEMP_OFFSET, SCRATCH1)?;

            enc.test32_mem_imm(CTXREG, GuestContext::FCR31_OFFSET, FCR31_FLUSH_TO_ZERO)?;
            enc.jcc_label(JumpCondition::Equal, no_ftz)?;
            enc.alu32_mem_imm(AluOp::Or, CTXREG, GuestContext::TEMP_OFFSET, MXCSR_FLUSH_TO_ZERO)?;
            enc.place_label(&mut no_ftz)?;

            enc.ldmxcsr(CTXREG, GuestContext::TEMP_OFFSET)?;
            enc.place_label(&mut skip)?;
            enc.ret()?;
        }

        let emit_save = move |enc: &mut X64Encoder| -> JitResult<()> {
            if static_alloc {
                enc.call_label(save_static)?;
            }
            Ok(())
        };
        let emit_load = move |enc: &mut X64Encoder| -> JitResult<()> {
            if static_alloc {
                enc.call_label(load_static)?;
            }
            Ok(())
        };

        // extern "C" fn(ctx: *mut GuestContext)
        enc.place_label(&mut enter)?;
        for reg in CALLEE_SAVED {
            enc.push_reg(reg)?;
        }
        // Six pushes plus the return address; realign to 16.
        enc.sub64_reg_imm(RSP, 8)?;
        enc.mov64_reg_reg(CTXREG, ARG1)?;
        emit_load(&mut enc)?;
        enc.mov32_reg_mem(SCRATCH1, CTXREG, GuestContext::PC_OFFSET)?;

        enc.place_label(&mut outer_loop_pc)?;
        enc.mov32_mem_reg(CTXREG, GuestContext::PC_OFFSET, SCRATCH1)?;

        enc.place_label(&mut outer_loop)?;
        // Advance may change the downcount, so static registers go through memory.
        emit_save(&mut enc)?;
        enc.call_label(restore_rm)?;
        enc.mov64_reg_reg(ARG1, CTXREG)?;
        enc.mov64_reg_imm(SCRATCH1, hooks.advance as usize as u64)?;
        enc.call_reg(SCRATCH1)?;
        enc.call_label(apply_rm)?;
        emit_load(&mut enc)?;

        enc.place_label(&mut check_core_state)?;
        enc.cmp32_mem_imm(CTXREG, GuestContext::CORE_STATE_OFFSET, 0)?;
        enc.jcc_label(JumpCondition::NotEqual, quit)?;
        emit_downcount_test(&mut enc, static_alloc)?;
        enc.jcc_label(JumpCondition::Sign, outer_loop)?;
        enc.jmp_label(no_check)?;

        enc.place_label(&mut dispatcher_pc)?;
        enc.mov32_mem_reg(CTXREG, GuestContext::PC_OFFSET, SCRATCH1)?;

        enc.place_label(&mut dispatcher)?;
        emit_downcount_test(&mut enc, static_alloc)?;
        enc.jcc_label(JumpCondition::Sign, bail)?;

        enc.place_label(&mut no_check)?;
        enc.call_label(restore_rm)?;
        emit_save(&mut enc)?;
        enc.mov64_reg_reg(ARG1, CTXREG)?;
        enc.mov64_reg_imm(SCRATCH1, hooks.resolve as usize as u64)?;
        enc.call_reg(SCRATCH1)?;
        emit_load(&mut enc)?;
        enc.mov64_reg_reg(SCRATCH2, SCRATCH1)?;
        enc.call_label(apply_rm)?;
        enc.test64_reg_reg(SCRATCH2, SCRATCH2)?;
        enc.jcc_label(JumpCondition::Equal, quit)?;
        enc.jmp_reg(SCRATCH2)?;

        enc.place_label(&mut bail)?;
        enc.cmp32_mem_imm(CTXREG, GuestContext::CORE_STATE_OFFSET, 0)?;
        enc.jcc_label(JumpCondition::Equal, outer_loop)?;

        enc.place_label(&mut quit)?;
        emit_save(&mut enc)?;
        enc.call_label(restore_rm)?;
        enc.add64_reg_imm(RSP, 8)?;
        for reg in CALLEE_SAVED.iter().rev() {
            enc.pop_reg(*reg)?;
        }
        enc.ret()?;

        enc.place_label(&mut crash)?;
        enc.mov32_mem_imm(CTXREG, GuestContext::CORE_STATE_OFFSET, CORE_RUNTIME_ERROR)?;
        enc.jmp_label(quit)?;

        let mut wanted = vec![
            restore_rm,
            apply_rm,
            enter,
            outer_loop_pc,
            outer_loop,
            check_core_state,
            dispatcher_pc,
            dispatcher,
            no_check,
            quit,
            crash,
        ];
        if static_alloc {
            wanted.push(save_static);
            wanted.push(load_static);
        }
        let assembled = enc.assemble(start, &wanted)?;
        code.append(&assembled.bytes)?;
        let end = code.current_address();
        code.align_to_page()?;

        let ips = &assembled.label_ips;
        let fixed = FixedCode {
            save_static_registers: static_alloc.then(|| ips[11]),
            load_static_registers: static_alloc.then(|| ips[12]),
            restore_rounding_mode: ips[0],
            apply_rounding_mode: ips[1],
            enter_dispatcher: ips[2],
            outer_loop_pc_in_scratch1: ips[3],
            outer_loop: ips[4],
            dispatcher_check_core_state: ips[5],
            dispatcher_pc_in_scratch1: ips[6],
            dispatcher: ips[7],
            dispatcher_no_check: ips[8],
            quit: ips[9],
            crash_handler: ips[10],
            start,
            end,
            jit_start_offset: code.current_offset(),
        };
        log::debug!(
            "Generated {} bytes of fixed code, blocks start at offset {:#x}",
            end - start,
            fixed.jit_start_offset
        );
        Ok(fixed)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    /// Name of the routine containing `address`.
    pub fn describe(&self, address: u64) -> Option<&'static str> {
        if !self.contains(address) {
            return None;
        }
        let mut named = vec![
            (self.restore_rounding_mode, "restoreRoundingMode"),
            (self.apply_rounding_mode, "applyRoundingMode"),
            (self.enter_dispatcher, "enterDispatcher"),
            (self.outer_loop_pc_in_scratch1, "outerLoopPCInSCRATCH1"),
            (self.outer_loop, "outerLoop"),
            (self.dispatcher_check_core_state, "dispatcherCheckCoreState"),
            (self.dispatcher_pc_in_scratch1, "dispatcherPCInSCRATCH1"),
            (self.dispatcher, "dispatcher"),
            (self.dispatcher_no_check, "dispatcherNoCheck"),
            (self.quit, "quitLoop"),
            (self.crash_handler, "crashHandler"),
        ];
        if let Some(save) = self.save_static_registers {
            named.push((save, "saveStaticRegisters"));
        }
        if let Some(load) = self.load_static_registers {
            named.push((load, "loadStaticRegisters"));
        }
        named
            .into_iter()
            .filter(|&(start, _)| start <= address)
            .max_by_key(|&(start, _)| start)
            .map(|(_, name)| name)
    }
}
