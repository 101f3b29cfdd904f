//! Block invalidation.

mod common;

use common::*;
use irjit::core::IrBlockCache;
use irjit::core::JitHooks;
use irjit::x64::{X64JitBackend, MIN_BLOCK_NORMAL_LEN};

#[test]
fn test_invalidate_redirects_entry_to_dispatcher() {
    init_logging();

    for style in BOTH_STYLES {
        let mut jit = new_jit(options(style));
        let dispatcher_pc = jit.backend().fixed_code().dispatcher_pc_in_scratch1;

        let a = jit.add_and_compile(exit_block(0x100, 0x200)).unwrap();
        let b = jit.add_and_compile(exit_block(0x200, 0x100)).unwrap();
        let target = jit.blocks().block(a).unwrap().target_offset().unwrap();
        assert_eq!(jit.backend().links().exits_to(0x100).len(), 1);

        jit.invalidate(a).unwrap();

        // Nothing targets A's PC any more, and A's own exit is gone too.
        assert!(jit.backend().links().exits_to(0x100).is_empty());
        assert!(jit.backend().links().exits_of(a).is_empty());
        assert!(jit.backend().links().exits_to(0x200).is_empty());
        assert_eq!(jit.backend().links().exits_of(b).len(), 0);
        assert!(jit.backend().links().native_block(a).is_none());
        assert!(jit.backend().links().native_block(b).is_some());

        assert!(is_dispatcher_exit(&jit, target, 0x100, dispatcher_pc), "{style:?}");
        let trampoline = jit.backend().code().bytes(target, MIN_BLOCK_NORMAL_LEN);
        assert!(trampoline[10..].iter().all(|&b| b == 0xCC));

        assert_eq!(jit.lookup_pc(0x100), None);
        assert!(jit.lookup_pc(0x200).is_some());
    }
}

#[test]
fn test_invalidate_twice_changes_nothing() {
    for style in BOTH_STYLES {
        let mut jit = new_jit(options(style));
        let a = jit.add_and_compile(exit_block(0x100, 0x200)).unwrap();
        jit.add_and_compile(exit_block(0x200, 0x100)).unwrap();
        let target = jit.blocks().block(a).unwrap().target_offset().unwrap();

        jit.invalidate(a).unwrap();
        let bytes = jit.backend().code().bytes(target, MIN_BLOCK_NORMAL_LEN).to_vec();
        let cursor = jit.backend().code().current_offset();
        let exits = jit.backend().links().exit_count();
        let blocks = jit.blocks().len();

        jit.invalidate(a).unwrap();
        assert_eq!(jit.backend().code().bytes(target, MIN_BLOCK_NORMAL_LEN), &bytes[..]);
        assert_eq!(jit.backend().code().current_offset(), cursor);
        assert_eq!(jit.backend().links().exit_count(), exits);
        assert_eq!(jit.blocks().len(), blocks);
        assert!(!jit.blocks().block(a).unwrap().is_valid());
    }
}

#[test]
fn test_invalidate_uncompiled_or_pc_zero_block() {
    let mut backend = X64JitBackend::new(options(BOTH_STYLES[0]), JitHooks::default()).unwrap();
    let mut blocks = IrBlockCache::new();

    // Never compiled: only bookkeeping.
    let pending = blocks.add_block(exit_block(0x300, 0x300));
    let cursor = backend.code().current_offset();
    backend.invalidate_block(&blocks, pending).unwrap();
    assert_eq!(backend.code().current_offset(), cursor);

    // PC 0 is never rewritten, but its records still go.
    let zero = blocks.add_block(exit_block(0, 0x300));
    backend.compile_block(&mut blocks, zero, false).unwrap();
    let target = blocks.block(zero).unwrap().target_offset().unwrap();
    let before = backend.code().bytes(target, MIN_BLOCK_NORMAL_LEN).to_vec();
    assert_eq!(backend.links().exits_of(zero).len(), 1);

    backend.invalidate_block(&blocks, zero).unwrap();
    assert_eq!(backend.code().bytes(target, MIN_BLOCK_NORMAL_LEN), &before[..]);
    assert!(backend.links().exits_of(zero).is_empty());
    assert_eq!(backend.native_entry(zero), None);
}
