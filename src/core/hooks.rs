// This module defines the table of Rust entry points that generated code calls into. The
// addresses are baked into the fixed code and into every compiled block, so the table is
// handed over once when the backend is constructed and never changes afterwards. The generic
// handler executes one encoded IR instruction, interpret handlers execute one raw guest
// opcode, advance runs timing work when the execution budget runs out, and resolve maps the
// context's PC to a host entry point. Handlers return 0 for "no exit"; any other value is the
// guest PC to continue at.

//! Handler table shared with generated code.

use super::context::{GuestContext, CORE_STEPPING};

/// Executes one encoded [`IrInst`](super::ir::IrInst).
pub type GenericFn = extern "C" fn(ctx: *mut GuestContext, inst: u64) -> u32;
/// Executes one guest opcode.
pub type InterpretFn = extern "C" fn(ctx: *mut GuestContext, opcode: u32) -> u32;
pub type NotifyInterpretFn = extern "C" fn(ctx: *mut GuestContext, opcode: u32);
pub type AdvanceFn = extern "C" fn(ctx: *mut GuestContext);
/// Host entry for `ctx.pc`, or null to leave the dispatcher.
pub type ResolveFn = extern "C" fn(ctx: *mut GuestContext) -> *const u8;
pub type NoBlockExitsFn = extern "C" fn();

#[derive(Debug, Clone, Copy)]
pub struct JitHooks {
    pub generic: GenericFn,
    /// Picks the interpreter function for a guest opcode at compile time.
    pub interpret_lookup: fn(opcode: u32) -> InterpretFn,
    /// Called before interpreted opcodes when diagnostics are on.
    pub notify_interpret: Option<NotifyInterpretFn>,
    pub advance: AdvanceFn,
    pub resolve: ResolveFn,
    pub no_block_exits: NoBlockExitsFn,
}

impl Default for JitHooks {
    fn default() -> Self {
        Self {
            generic: unhandled_generic,
            interpret_lookup: no_interpreter,
            notify_interpret: None,
            advance: stop_when_out_of_budget,
            resolve: resolve_nothing,
            no_block_exits: report_missing_exit,
        }
    }
}

extern "C" fn unhandled_generic(_ctx: *mut GuestContext, inst: u64) -> u32 {
    log::warn!("No generic handler installed, skipping instruction {inst:#018x}");
    0
}

extern "C" fn unhandled_interpret(_ctx: *mut GuestContext, opcode: u32) -> u32 {
    log::warn!("No interpreter installed, skipping opcode {opcode:#010x}");
    0
}

fn no_interpreter(_opcode: u32) -> InterpretFn {
    unhandled_interpret
}

extern "C" fn stop_when_out_of_budget(ctx: *mut GuestContext) {
    // SAFETY: generated code always passes the context it was entered with.
    let ctx = unsafe { &mut *ctx };
    if ctx.downcount < 0 {
        ctx.core_state = CORE_STEPPING;
    }
}

extern "C" fn resolve_nothing(_ctx: *mut GuestContext) -> *const u8 {
    std::ptr::null()
}

/// Reached only when a block ran off its end without an exit.
pub extern "C" fn report_missing_exit() {
    log::error!("Never exited block, invalid IR?");
}
