// This module collects the target-independent parts of irjit: the IR data model handed over by
// the front end and the block table that indexes it by guest PC, the link table recording
// native block placement and patchable exit sites, the guest context layout shared with
// generated code, the executable memory region with scoped write windows and the bump
// allocated code cache on top of it, backend options, the register allocator contract, the
// table of Rust handlers that generated code calls, and the error types. Nothing in here emits
// machine code; the x64 module builds on these pieces.

//! Core backend infrastructure.
//!
//! # Key Components
//!
//! ## IR (`ir`, `block_cache`)
//! - Fixed-width instructions with static per-opcode metadata
//! - Blocks keyed by guest start PC, numbered for the lifetime of the table
//!
//! ## Code cache (`memory`, `code_block`)
//! - One `mmap`ed region, read+execute except inside write scopes
//! - Forward-only cursor, reclaimed only by a full clear
//!
//! ## Linking (`link`)
//! - Checked and unchecked entry offsets per compiled block
//! - Exit sites indexed by owner and by target PC

pub mod block_cache;
pub mod code_block;
pub mod context;
pub mod error;
pub mod hooks;
pub mod ir;
pub mod link;
pub mod memory;
pub mod options;
pub mod reg_alloc;

pub use block_cache::IrBlockCache;
pub use code_block::CodeBlock;
pub use context::GuestContext;
pub use error::{JitError, JitResult};
pub use hooks::JitHooks;
pub use ir::{IrBlock, IrFlags, IrInst, IrMeta, IrOp};
pub use link::{BlockExit, LinkTable, NativeBlock};
pub use memory::{ExecutableRegion, ProtectScope};
pub use options::{JitOptions, LinkStyle};
pub use reg_alloc::RegAllocator;
