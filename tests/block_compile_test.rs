//! Block compilation: minimum block and exit sizes, failed compiles and
//! code space exhaustion, in both linking styles.

mod common;

use common::*;
use iced_x86::Mnemonic;
use irjit::core::memory::page_size;
use irjit::core::{IrBlock, IrBlockCache, IrInst, IrOp, JitError, JitHooks, JitOptions};
use irjit::x64::{X64JitBackend, MIN_BLOCK_EXIT_LEN, MIN_BLOCK_NORMAL_LEN};

fn sample_blocks() -> Vec<IrBlock> {
    vec![
        // Shortest possible bodies.
        IrBlock::new(0x100, vec![IrInst::new(IrOp::ExitToPc, 0, 0, 0, 0)]),
        IrBlock::new(0x110, vec![IrInst::with_constant(IrOp::ExitToConst, 0x100)]),
        IrBlock::new(0x120, vec![IrInst::new(IrOp::ExitToReg, 0, 4, 0, 0)]),
        IrBlock::new(
            0x130,
            vec![
                IrInst::new(IrOp::SetConst, 1, 0, 0, 0x1234),
                IrInst::new(IrOp::Add, 2, 1, 3, 0),
                IrInst::new(IrOp::Sub, 3, 1, 3, 0),
                IrInst::new(IrOp::XorConst, 4, 2, 0, 0xFF),
                IrInst::new(IrOp::SarImm, 5, 4, 3, 0),
                IrInst::new(IrOp::SetPc, 0, 5, 0, 0),
                IrInst::with_constant(IrOp::Downcount, 6),
                IrInst::new(IrOp::ExitToConstIfEq, 0, 1, 2, 0x110),
                IrInst::new(IrOp::ExitToConstIfLtZ, 0, 3, 0, 0x120),
                IrInst::with_constant(IrOp::ExitToConst, 0x130),
            ],
        ),
        IrBlock::new(
            0x140,
            vec![
                IrInst::new(IrOp::Load32, 1, 2, 0, 0x10),
                IrInst::with_constant(IrOp::Syscall, 0),
                IrInst::with_constant(IrOp::ExitToConst, 0x100),
            ],
        ),
    ]
}

#[test]
fn test_blocks_reserve_minimum_length() {
    init_logging();

    for style in BOTH_STYLES {
        for blocklink in [true, false] {
            let mut jit = new_jit(JitOptions {
                enable_blocklink: blocklink,
                ..options(style)
            });
            for block in sample_blocks() {
                let num = jit.add_and_compile(block).unwrap();
                let target = jit.blocks().block(num).unwrap().target_offset().unwrap();
                let cursor = jit.backend().code().current_offset();
                assert!(
                    (cursor - target) as usize >= MIN_BLOCK_NORMAL_LEN,
                    "{style:?} link={blocklink}: block {num} has {} bytes",
                    cursor - target
                );
            }
        }
    }
}

#[test]
fn test_exit_sites_reserve_minimum_length() {
    init_logging();

    for style in BOTH_STYLES {
        let mut jit = new_jit(options(style));
        let mut total = 0;
        for block in sample_blocks() {
            let num = jit.add_and_compile(block).unwrap();
            for exit in jit.backend().links().exits_of(num) {
                assert!(exit.len as usize >= MIN_BLOCK_EXIT_LEN);
                // The jump is at the front, padding behind it.
                let instrs = decode_at(&jit, exit.offset, exit.len as usize);
                let first = instrs[0].mnemonic();
                assert!(first == Mnemonic::Mov || first == Mnemonic::Jmp, "{style:?}: {first:?}");
                assert_eq!(instrs.last().unwrap().mnemonic(), Mnemonic::Int3);
                total += 1;
            }
        }
        // 0x110, 0x130 (three exits) and 0x140; ExitToPc and ExitToReg leave no record.
        assert_eq!(total, 5, "{style:?}");
        assert_eq!(jit.backend().links().exit_count(), 5);
    }
}

#[test]
fn test_no_exit_records_without_blocklink() {
    for style in BOTH_STYLES {
        let mut jit = new_jit(JitOptions {
            enable_blocklink: false,
            ..options(style)
        });
        for block in sample_blocks() {
            jit.add_and_compile(block).unwrap();
        }
        assert_eq!(jit.backend().links().exit_count(), 0);
    }
}

#[test]
fn test_failed_compile_leaves_no_metadata() {
    init_logging();

    for style in BOTH_STYLES {
        let options = JitOptions {
            code_space_size: 2 * page_size(),
            ..options(style)
        };
        let mut backend = X64JitBackend::new(options, JitHooks::default()).unwrap();
        let mut blocks = IrBlockCache::new();

        // Far more generic calls than one page can hold, after an exit
        // that gets recorded before space runs out.
        let mut insts = vec![IrInst::new(IrOp::ExitToConstIfNeq, 0, 1, 2, 0x500)];
        insts.extend((0..400).map(|i| IrInst::new(IrOp::Load32, 1, 2, 0, i)));
        insts.push(IrInst::with_constant(IrOp::ExitToConst, 0x500));
        let num = blocks.add_block(IrBlock::new(0x400, insts));

        let before = backend.code().current_offset();
        let err = backend.compile_block(&mut blocks, num, false).unwrap_err();
        assert!(err.is_out_of_space(), "{style:?}: {err}");

        // Bytes were written, but nothing points at them.
        assert!(backend.code().current_offset() > before);
        assert_eq!(blocks.block(num).unwrap().target_offset(), None);
        assert_eq!(backend.native_entry(num), None);
        assert_eq!(backend.checked_entry(num), None);
        assert!(backend.links().exits_of(num).is_empty());
        assert_eq!(backend.links().exit_count(), 0);
        assert_eq!(backend.compiling_block(), None);
    }
}

#[test]
fn test_exhausted_cache_fails_before_writing() {
    for style in BOTH_STYLES {
        // One page: the fixed code takes all of it.
        let options = JitOptions {
            code_space_size: 1,
            ..options(style)
        };
        let mut backend = X64JitBackend::new(options.clone(), JitHooks::default()).unwrap();
        let mut blocks = IrBlockCache::new();
        let num = blocks.add_block(exit_block(0x100, 0x100));

        let before = backend.code().current_offset();
        let err = backend.compile_block(&mut blocks, num, false).unwrap_err();
        assert!(matches!(err, JitError::CodeSpaceExhausted { .. }), "{err}");
        assert_eq!(backend.code().current_offset(), before);
        assert_eq!(backend.checked_entry(num), None);
        assert_eq!(backend.compiling_block(), None);

        // Clearing cannot help here either; the retry fails the same way.
        let mut jit = new_jit(options);
        let num = jit.add_block(exit_block(0x100, 0x100)).unwrap();
        assert!(jit.compile(num).unwrap_err().is_out_of_space());
    }
}

#[test]
fn test_unknown_block() {
    let mut backend = X64JitBackend::new(options(BOTH_STYLES[0]), JitHooks::default()).unwrap();
    let mut blocks = IrBlockCache::new();
    assert!(matches!(
        backend.compile_block(&mut blocks, 3, false),
        Err(JitError::UnknownBlock(3))
    ));
    assert!(backend.invalidate_block(&blocks, 3).is_err());
}

#[test]
fn test_downcount_guard_placement() {
    for style in BOTH_STYLES {
        let mut jit = new_jit(options(style));
        let num = jit.add_and_compile(exit_block(0x200, 0x300)).unwrap();
        let native = *jit.backend().links().native_block(num).unwrap();
        let entry = jit.entry_address(num).unwrap();

        match style {
            irjit::LinkStyle::ForwardCheck => assert!(native.checked_offset < native.target_offset),
            irjit::LinkStyle::BackJump => assert!(native.checked_offset > native.target_offset),
        }

        // Either way the guard's success branch lands on the unchecked entry.
        let guard = decode_to_cursor(&jit, native.checked_offset);
        assert_eq!(first_branch(&guard, Mnemonic::Jns), Some(entry), "{style:?}");
        assert_eq!(
            first_branch(&guard, Mnemonic::Jmp),
            Some(jit.backend().fixed_code().outer_loop_pc_in_scratch1)
        );
    }
}
