//! Compile text IR blocks and dump the generated host code.
//!
//! ```text
//! irjit-dump blocks.ir --log-blocks 8
//! RUST_LOG=irjit=trace irjit-dump blocks.ir --back-jump
//! ```

use clap::Parser;
use irjit::core::{JitHooks, JitOptions, LinkStyle};
use irjit::text_ir;
use irjit::NativeJit;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "irjit-dump", about = "Compile text IR blocks to x86-64 and dump the result")]
struct Args {
    /// Text IR file; `-` reads stdin.
    file: PathBuf,

    /// Put the downcount guard after each block instead of in front of it.
    #[arg(long)]
    back_jump: bool,

    /// Always exit through the dispatcher.
    #[arg(long)]
    no_blocklink: bool,

    /// Keep the downcount in a host register.
    #[arg(long)]
    static_alloc: bool,

    /// Emit the missing-exit guard after every block.
    #[arg(long)]
    diagnostics: bool,

    /// Number of blocks to disassemble. Wins over `IRJIT_LOG_BLOCKS`; all
    /// blocks when neither is set.
    #[arg(long)]
    log_blocks: Option<u32>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let text = if args.file.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        fs::read_to_string(&args.file)?
    };
    let blocks = text_ir::parse_blocks(&text)?;

    let mut options = JitOptions::from_env()?;
    if args.back_jump {
        options.link_style = LinkStyle::BackJump;
    }
    if args.no_blocklink {
        options.enable_blocklink = false;
    }
    if args.static_alloc {
        options.use_static_alloc = true;
    }
    if args.diagnostics {
        options.diagnostic_checks = true;
    }
    let env_set = std::env::var_os("IRJIT_LOG_BLOCKS").is_some();
    options.log_blocks = log_block_count(args.log_blocks, env_set.then_some(options.log_blocks), blocks.len());

    let mut jit = NativeJit::new(options, JitHooks::default())?;
    for block in blocks {
        let pc = block.original_start();
        let block_num = jit.add_and_compile(block)?;
        if let Some(entry) = jit.entry_address(block_num) {
            log::debug!("Block {block_num} (pc {pc:08x}) entry {entry:#x}");
        }
    }

    let code = jit.backend().code();
    let used = code.current_offset() - jit.backend().fixed_code().jit_start_offset;
    log::info!(
        "{} blocks, {} bytes of block code, {} exit sites",
        jit.blocks().len(),
        used,
        jit.backend().links().exit_count()
    );
    Ok(())
}

fn log_block_count(flag: Option<u32>, from_env: Option<u32>, block_count: usize) -> u32 {
    flag.or(from_env)
        .unwrap_or_else(|| u32::try_from(block_count).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_then_env_then_every_block() {
        assert_eq!(log_block_count(Some(2), Some(5), 9), 2);
        assert_eq!(log_block_count(None, Some(5), 9), 5);
        assert_eq!(log_block_count(None, Some(0), 9), 0);
        assert_eq!(log_block_count(None, None, 9), 9);
    }
}
