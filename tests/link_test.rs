//! Exit linking: patching recorded exits, and the link, invalidate,
//! relink sequence.

mod common;

use common::*;
use iced_x86::{Decoder, DecoderOptions, Mnemonic};
use irjit::core::{IrBlock, IrBlockCache, IrInst, IrOp, JitHooks};
use irjit::x64::X64JitBackend;

const PC_A: u32 = 0x8000_1000;
const PC_X: u32 = 0x8000_2000;

#[test]
fn test_exit_is_patched_when_target_compiles() {
    init_logging();

    for style in BOTH_STYLES {
        let mut jit = new_jit(options(style));
        let dispatcher_pc = jit.backend().fixed_code().dispatcher_pc_in_scratch1;

        let a = jit.add_and_compile(exit_block(PC_A, PC_X)).unwrap();
        let exits = jit.backend().links().exits_to(PC_X);
        assert_eq!(exits.len(), 1);
        let site = exits[0];
        assert_eq!(site.owner, a);
        assert_eq!(site.dest, PC_X);
        assert!(is_dispatcher_exit(&jit, site.offset, PC_X, dispatcher_pc), "{style:?}");

        let b = jit.add_and_compile(exit_block(PC_X, PC_A)).unwrap();
        let checked = jit.backend().checked_entry(b).unwrap();
        let patched = decode_at(&jit, site.offset, site.len as usize);
        assert_eq!(patched[0].mnemonic(), Mnemonic::Jmp);
        assert_eq!(patched[0].near_branch_target(), checked, "{style:?}");
        assert!(patched[1..].iter().all(|i| i.mnemonic() == Mnemonic::Int3));

        // The target stays valid, so the record stays.
        assert_eq!(jit.backend().links().exits_to(PC_X), vec![site]);
    }
}

#[test]
fn test_exit_to_compiled_block_links_immediately() {
    for style in BOTH_STYLES {
        let mut jit = new_jit(options(style));
        let b = jit.add_and_compile(exit_block(PC_X, PC_X)).unwrap();
        let a = jit.add_and_compile(exit_block(PC_A, PC_X)).unwrap();

        let checked = jit.backend().checked_entry(b).unwrap();
        let site = jit.backend().links().exits_of(a)[0];
        let instrs = decode_at(&jit, site.offset, site.len as usize);
        assert_eq!(instrs[0].mnemonic(), Mnemonic::Jmp);
        assert_eq!(instrs[0].near_branch_target(), checked);

        // A self-loop is linked as soon as the block exists.
        let own = jit.backend().links().exits_of(b)[0];
        let instrs = decode_at(&jit, own.offset, own.len as usize);
        let dispatcher_pc = jit.backend().fixed_code().dispatcher_pc_in_scratch1;
        assert!(!is_dispatcher_exit(&jit, own.offset, PC_X, dispatcher_pc));
        assert_eq!(instrs[0].near_branch_target(), checked);
    }
}

#[test]
fn test_overwrite_exit_without_checked_entry_is_a_no_op() {
    let mut backend = X64JitBackend::new(options(BOTH_STYLES[0]), JitHooks::default()).unwrap();
    let mut blocks = IrBlockCache::new();
    let a = blocks.add_block(exit_block(PC_A, PC_X));
    backend.compile_block(&mut blocks, a, false).unwrap();
    let site = backend.links().exits_of(a)[0];
    let before = backend.code().bytes(site.offset, site.len as usize).to_vec();

    // Registered but never compiled, so nothing to jump to.
    let b = blocks.add_block(exit_block(PC_X, PC_A));
    assert_eq!(backend.checked_entry(b), None);
    backend.overwrite_exit(site.offset, site.len, b).unwrap();
    assert_eq!(backend.code().bytes(site.offset, site.len as usize), &before[..]);

    // Same for a block number nobody registered.
    backend.overwrite_exit(site.offset, site.len, b + 100).unwrap();
    assert_eq!(backend.code().bytes(site.offset, site.len as usize), &before[..]);

    // Once B is compiled the same call patches the site.
    backend.compile_block(&mut blocks, b, false).unwrap();
    let checked = backend.checked_entry(b).unwrap();
    backend.overwrite_exit(site.offset, site.len, b).unwrap();
    let mut decoder = Decoder::with_ip(
        64,
        backend.code().bytes(site.offset, site.len as usize),
        backend.code().address_of(site.offset),
        DecoderOptions::NONE,
    );
    assert_eq!(decoder.decode().near_branch_target(), checked);
}

#[test]
fn test_recompile_keeps_one_record_per_exit() {
    for style in BOTH_STYLES {
        let mut jit = new_jit(options(style));
        let b = jit.add_and_compile(exit_block(PC_X, 0x8000_9990)).unwrap();
        let a = jit.add_and_compile(exit_block(PC_A, PC_X)).unwrap();
        assert_eq!(jit.backend().links().exit_count(), 2);

        jit.compile(b).unwrap();
        jit.compile(b).unwrap();
        assert_eq!(jit.backend().links().exits_of(b).len(), 1, "{style:?}");
        assert_eq!(jit.backend().links().exits_of(a).len(), 1);
        assert_eq!(jit.backend().links().exit_count(), 2);

        // A follows the newest copy of B.
        let site = jit.backend().links().exits_of(a)[0];
        let instrs = decode_at(&jit, site.offset, site.len as usize);
        assert_eq!(instrs[0].near_branch_target(), jit.backend().checked_entry(b).unwrap());
    }
}

#[test]
fn test_link_invalidate_relink() {
    init_logging();

    for style in BOTH_STYLES {
        let mut jit = new_jit(options(style));
        let fixed = jit.backend().fixed_code().clone();

        // A's only exit waits for X.
        let a = jit.add_and_compile(exit_block(PC_A, PC_X)).unwrap();
        let site = jit.backend().links().exits_of(a)[0];
        assert_eq!(jit.backend().links().exits_to(PC_X).len(), 1);

        // B at X gets A's exit patched to its checked entry.
        let b = jit.add_and_compile(exit_block(PC_X, PC_A)).unwrap();
        let b_checked = jit.backend().checked_entry(b).unwrap();
        let b_entry = jit.entry_address(b).unwrap();
        let b_target = jit.blocks().block(b).unwrap().target_offset().unwrap();
        let patched = decode_at(&jit, site.offset, site.len as usize);
        assert_eq!(patched[0].near_branch_target(), b_checked);

        // Invalidate B: records referencing X go, B's entry goes back to the dispatcher.
        jit.invalidate(b).unwrap();
        assert!(jit.backend().links().exits_to(PC_X).is_empty());
        assert!(jit.backend().links().exits_of(a).is_empty());
        assert!(jit.backend().links().exits_of(b).is_empty());
        assert!(is_dispatcher_exit(&jit, b_target, PC_X, fixed.dispatcher_pc_in_scratch1), "{style:?}");

        // A still jumps to B's old checked entry, whose guard continues into
        // the rewritten entry.
        let patched = decode_at(&jit, site.offset, site.len as usize);
        assert_eq!(patched[0].near_branch_target(), b_checked);
        let offset = jit.backend().code().offset_of(b_checked).unwrap();
        let guard = decode_to_cursor(&jit, offset);
        assert_eq!(first_branch(&guard, Mnemonic::Jns), Some(b_entry), "{style:?}");

        // A fresh block for X is linked from newly compiled predecessors.
        let b2 = jit.add_and_compile(exit_block(PC_X, PC_A)).unwrap();
        assert_ne!(b, b2);
        let b2_checked = jit.backend().checked_entry(b2).unwrap();
        let c = jit
            .add_and_compile(IrBlock::new(
                0x8000_3000,
                vec![IrInst::with_constant(IrOp::ExitToConst, PC_X)],
            ))
            .unwrap();
        let c_site = jit.backend().links().exits_of(c)[0];
        let instrs = decode_at(&jit, c_site.offset, c_site.len as usize);
        assert_eq!(instrs[0].near_branch_target(), b2_checked);
        assert_eq!(jit.backend().links().exits_to(PC_X).len(), 1);
    }
}

#[test]
fn test_clear_all_blocks_drops_links() {
    let mut jit = new_jit(options(BOTH_STYLES[1]));
    jit.add_and_compile(exit_block(PC_A, PC_X)).unwrap();
    jit.add_and_compile(exit_block(PC_X, PC_A)).unwrap();
    assert_eq!(jit.backend().links().exit_count(), 2);

    jit.clear_cache();
    assert_eq!(jit.backend().links().exit_count(), 0);
    assert_eq!(jit.backend().links().native_blocks().count(), 0);
    assert_eq!(jit.lookup_pc(PC_A), None);
}
