//! Textual IR for tests and the dump tool.
//!
//! A file is a sequence of blocks. Each block names its guest start PC and
//! lists one instruction per line, in the same form [`IrInst`] prints:
//!
//! ```text
//! ; loop body
//! block 0x1000 {
//!     SetConst r1, 0x10
//!     Add r3, r1, r2
//!     Downcount 0x4
//!     ExitToConstIfNeq 0x1000, r3, r4
//!     ExitToConst 0x1010
//! }
//! ```
//!
//! Register operands are written `rN` (GPR) or `fN` (FPR); the constant and
//! shift amounts are decimal or `0x` hex. `;` starts a comment.

mod parser;

pub use parser::{parse_blocks, ParseError};

use crate::core::ir::{IrBlock, IrInst};
use std::fmt::Write;

/// Render blocks in the format [`parse_blocks`] reads.
pub fn print_blocks(blocks: &[IrBlock]) -> String {
    let mut out = String::new();
    for block in blocks {
        let _ = writeln!(out, "block {:#x} {{", block.original_start());
        for inst in block.instructions() {
            let _ = writeln!(out, "    {inst}");
        }
        out.push_str("}\n");
    }
    out
}

/// Parse a single instruction line.
pub fn parse_inst(line: &str) -> Result<IrInst, ParseError> {
    let text = format!("block 0x0 {{\n{line}\n}}\n");
    let mut blocks = parse_blocks(&text)?;
    match blocks.pop().map(|b| b.instructions().to_vec()) {
        Some(insts) if insts.len() == 1 => Ok(insts[0]),
        _ => Err(ParseError {
            line: 1,
            message: "expected exactly one instruction".to_string(),
        }),
    }
}
