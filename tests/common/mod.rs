//! Shared helpers for the integration tests.

#![allow(dead_code)]

use hashbrown::HashMap;
use iced_x86::{Instruction, Mnemonic};
use irjit::core::{GuestContext, IrBlock, IrInst, IrOp, JitHooks, JitOptions, LinkStyle};
use irjit::x64::disasm;
use irjit::NativeJit;
use std::cell::RefCell;

pub const BOTH_STYLES: [LinkStyle; 2] = [LinkStyle::ForwardCheck, LinkStyle::BackJump];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn options(style: LinkStyle) -> JitOptions {
    JitOptions {
        link_style: style,
        code_space_size: 256 * 1024,
        diagnostic_checks: false,
        ..JitOptions::default()
    }
}

pub fn new_jit(options: JitOptions) -> NativeJit {
    NativeJit::new(options, runtime_hooks()).unwrap()
}

/// Block that burns one unit of budget and leaves for `target`.
pub fn exit_block(pc: u32, target: u32) -> IrBlock {
    IrBlock::new(
        pc,
        vec![
            IrInst::with_constant(IrOp::Downcount, 1),
            IrInst::with_constant(IrOp::ExitToConst, target),
        ],
    )
}

/// Decode `len` bytes of the code cache starting at `offset`.
pub fn decode_at(jit: &NativeJit, offset: u32, len: usize) -> Vec<Instruction> {
    let code = jit.backend().code();
    disasm::decode(code.bytes(offset, len), code.address_of(offset))
}

/// Decode from `offset` up to the cursor.
pub fn decode_to_cursor(jit: &NativeJit, offset: u32) -> Vec<Instruction> {
    let end = jit.backend().code().current_offset();
    decode_at(jit, offset, (end - offset) as usize)
}

/// Target of the first branch with `mnemonic`.
pub fn first_branch(instrs: &[Instruction], mnemonic: Mnemonic) -> Option<u64> {
    instrs
        .iter()
        .find(|i| i.mnemonic() == mnemonic)
        .map(|i| i.near_branch_target())
}

/// Whether the code at `offset` is `mov eax, pc; jmp <target>`.
pub fn is_dispatcher_exit(jit: &NativeJit, offset: u32, pc: u32, target: u64) -> bool {
    let instrs = decode_at(jit, offset, 10);
    instrs.len() == 2
        && instrs[0].mnemonic() == Mnemonic::Mov
        && instrs[0].op0_register() == iced_x86::Register::EAX
        && instrs[0].immediate32() == pc
        && instrs[1].mnemonic() == Mnemonic::Jmp
        && instrs[1].near_branch_target() == target
}

thread_local! {
    static ENTRIES: RefCell<HashMap<u32, u64>> = RefCell::new(HashMap::new());
    static GENERIC_CALLS: RefCell<Vec<IrInst>> = const { RefCell::new(Vec::new()) };
    static MXCSR_SEEN: RefCell<Vec<u32>> = const { RefCell::new(Vec::new()) };
}

/// Make every compiled block reachable from the dispatcher on this thread.
pub fn publish_entries(jit: &NativeJit) {
    ENTRIES.with(|entries| {
        let mut entries = entries.borrow_mut();
        entries.clear();
        for (num, block) in jit.blocks().iter() {
            if let Some(entry) = jit.entry_address(num) {
                entries.insert(block.original_start(), entry);
            }
        }
    });
}

pub fn generic_calls() -> Vec<IrInst> {
    GENERIC_CALLS.with(|calls| calls.borrow().clone())
}

/// MXCSR as seen by each `UpdateRoundingMode` handler call on this thread.
pub fn take_mxcsr_seen() -> Vec<u32> {
    MXCSR_SEEN.with(|seen| std::mem::take(&mut *seen.borrow_mut()))
}

#[cfg(target_arch = "x86_64")]
#[allow(deprecated)]
fn read_mxcsr() -> u32 {
    // SAFETY: SSE is part of the x86-64 baseline.
    unsafe { std::arch::x86_64::_mm_getcsr() }
}

#[cfg(not(target_arch = "x86_64"))]
fn read_mxcsr() -> u32 {
    0
}

extern "C" fn resolve_from_table(ctx: *mut GuestContext) -> *const u8 {
    // SAFETY: the dispatcher passes the context it was entered with.
    let pc = unsafe { (*ctx).pc };
    ENTRIES
        .with(|entries| entries.borrow().get(&pc).copied())
        .map_or(std::ptr::null(), |entry| entry as usize as *const u8)
}

/// `Syscall` writes its constant to r5 and continues; `Break` exits to its
/// constant. `UpdateRoundingMode` records the live MXCSR.
extern "C" fn generic_handler(ctx: *mut GuestContext, encoded: u64) -> u32 {
    let Some(inst) = IrInst::decode(encoded) else {
        return 0;
    };
    GENERIC_CALLS.with(|calls| calls.borrow_mut().push(inst));
    // SAFETY: as above.
    let ctx = unsafe { &mut *ctx };
    match inst.op {
        IrOp::Syscall => {
            ctx.gpr[5] = inst.constant;
            0
        }
        IrOp::Break => inst.constant,
        IrOp::UpdateRoundingMode => {
            let mxcsr = read_mxcsr();
            MXCSR_SEEN.with(|seen| seen.borrow_mut().push(mxcsr));
            0
        }
        _ => 0,
    }
}

pub fn runtime_hooks() -> JitHooks {
    JitHooks {
        generic: generic_handler,
        resolve: resolve_from_table,
        ..JitHooks::default()
    }
}
