//! Guest CPU state shared between generated code and Rust handlers.
//!
//! Generated code addresses every field relative to a context register,
//! so the layout is `#[repr(C)]` and the offsets below are the only way
//! the backend refers to guest state.

use std::mem::offset_of;

pub const NUM_GPRS: usize = 32;
pub const NUM_FPRS: usize = 32;

/// `core_state` value while the guest is running.
pub const CORE_RUNNING: u32 = 0;
/// `core_state` value once the dispatcher should return to its caller.
pub const CORE_STEPPING: u32 = 1;
/// Set by the crash handler.
pub const CORE_RUNTIME_ERROR: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
#[repr(C)]
pub struct GuestContext {
    pub gpr: [u32; NUM_GPRS],
    pub fpr: [f32; NUM_FPRS],
    pub pc: u32,
    /// Remaining execution budget. Blocks run while it is non-negative.
    pub downcount: i32,
    /// Guest FP control register; rounding mode in bits 0-1, flush-to-zero in bit 24.
    pub fcr31: u32,
    /// Scratch slot for MXCSR round trips.
    pub temp: u32,
    pub core_state: u32,
}

impl Default for GuestContext {
    fn default() -> Self {
        Self {
            gpr: [0; NUM_GPRS],
            fpr: [0.0; NUM_FPRS],
            pc: 0,
            downcount: 0,
            fcr31: 0,
            temp: 0,
            core_state: CORE_RUNNING,
        }
    }
}

impl GuestContext {
    pub fn new(pc: u32, downcount: i32) -> Self {
        Self {
            pc,
            downcount,
            ..Self::default()
        }
    }

    pub const fn gpr_offset(reg: u8) -> i32 {
        (offset_of!(GuestContext, gpr) + (reg as usize % NUM_GPRS) * 4) as i32
    }

    pub const fn fpr_offset(reg: u8) -> i32 {
        (offset_of!(GuestContext, fpr) + (reg as usize % NUM_FPRS) * 4) as i32
    }

    pub const PC_OFFSET: i32 = offset_of!(GuestContext, pc) as i32;
    pub const DOWNCOUNT_OFFSET: i32 = offset_of!(GuestContext, downcount) as i32;
    pub const FCR31_OFFSET: i32 = offset_of!(GuestContext, fcr31) as i32;
    pub const TEMP_OFFSET: i32 = offset_of!(GuestContext, temp) as i32;
    pub const CORE_STATE_OFFSET: i32 = offset_of!(GuestContext, core_state) as i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_match_layout() {
        assert_eq!(GuestContext::gpr_offset(0), 0);
        assert_eq!(GuestContext::gpr_offset(31), 124);
        assert_eq!(GuestContext::fpr_offset(0), 128);
        assert_eq!(GuestContext::PC_OFFSET, 256);
        assert_eq!(GuestContext::DOWNCOUNT_OFFSET, 260);
        assert_eq!(GuestContext::FCR31_OFFSET, 264);
        assert_eq!(GuestContext::TEMP_OFFSET, 268);
        assert_eq!(GuestContext::CORE_STATE_OFFSET, 272);
    }
}
