//! irjit - native x86-64 backend for an IR-based binary translator.
//!
//! A front end hands over guest code as blocks of fixed-width IR
//! instructions. irjit compiles each block into one executable code cache,
//! links blocks to each other with direct jumps once both ends exist, and
//! rewrites a block's entry when the guest code behind it changes. Anything
//! without a native lowering runs through Rust handlers.
//!
//! # Primary Usage
//!
//! ```no_run
//! use irjit::core::{GuestContext, IrBlock, IrInst, IrOp, JitHooks, JitOptions};
//! use irjit::NativeJit;
//!
//! let mut jit = NativeJit::new(JitOptions::default(), JitHooks::default())?;
//! let block = IrBlock::new(
//!     0x1000,
//!     vec![
//!         IrInst::new(IrOp::AddConst, 1, 1, 0, 4),
//!         IrInst::with_constant(IrOp::Downcount, 2),
//!         IrInst::with_constant(IrOp::ExitToConst, 0x1000),
//!     ],
//! );
//! let block_num = jit.add_and_compile(block)?;
//! println!("entry at {:#x?}", jit.entry_address(block_num));
//! # Ok::<(), irjit::core::JitError>(())
//! ```
//!
//! # Architecture
//!
//! - [`core`] - IR, block table, code cache, link table, options, errors
//! - [`x64`] - x86-64 encoder, dispatcher stubs, block compiler
//! - [`text_ir`] - textual IR used by tests and `irjit-dump`
//! - [`jit`] - the driver tying blocks and backend together

pub mod core;
pub mod jit;
pub mod text_ir;
pub mod x64;

pub use crate::core::{GuestContext, IrBlock, IrInst, IrOp, JitError, JitHooks, JitOptions, JitResult, LinkStyle};
pub use jit::NativeJit;
pub use x64::X64JitBackend;
