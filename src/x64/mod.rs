//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction encoding using iced-x86
//! - Guest register caching on host registers
//! - Dispatcher and runtime helper stubs
//! - The block compiler, exit linking and invalidation

pub mod backend;
mod comp_ops;
pub mod disasm;
pub mod encoder;
pub mod fixed_code;
pub mod reg_cache;
pub mod regs;

pub use backend::{X64JitBackend, CODE_SPACE_SAFETY_MARGIN, MIN_BLOCK_EXIT_LEN, MIN_BLOCK_NORMAL_LEN};
pub use encoder::{EncodingError, JumpCondition, X64Encoder};
pub use fixed_code::FixedCode;
pub use reg_cache::{MapMode, X64RegCache};
pub use regs::AsmReg;
