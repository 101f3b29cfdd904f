//! Block table: guest PC to block number, block number to IR block.
//!
//! Block numbers are never reused while the table lives. Invalidating a
//! block drops its PC mapping so a later block for the same PC gets a fresh
//! number, while the old entry stays around (marked invalid) so its native
//! code can still be described and re-invalidated.

use super::ir::IrBlock;
use hashbrown::HashMap;

#[derive(Debug, Default)]
pub struct IrBlockCache {
    blocks: Vec<IrBlock>,
    by_start: HashMap<u32, usize>,
}

impl IrBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block and return its number.
    ///
    /// A block already registered for the same start PC is replaced in the
    /// PC map; the caller is expected to have invalidated it.
    pub fn add_block(&mut self, block: IrBlock) -> usize {
        let block_num = self.blocks.len();
        self.by_start.insert(block.original_start(), block_num);
        self.blocks.push(block);
        block_num
    }

    pub fn block(&self, block_num: usize) -> Option<&IrBlock> {
        self.blocks.get(block_num)
    }

    pub fn block_mut(&mut self, block_num: usize) -> Option<&mut IrBlock> {
        self.blocks.get_mut(block_num)
    }

    /// Number of the valid block starting at `pc`, if any.
    pub fn block_num_from_start_address(&self, pc: u32) -> Option<usize> {
        self.by_start.get(&pc).copied()
    }

    /// Drop the block from PC lookups. Returns false for an unknown number.
    pub fn invalidate(&mut self, block_num: usize) -> bool {
        let Some(block) = self.blocks.get_mut(block_num) else {
            return false;
        };
        block.mark_invalid();
        let pc = block.original_start();
        if self.by_start.get(&pc) == Some(&block_num) {
            self.by_start.remove(&pc);
        }
        true
    }

    /// Forget where every block's code lives, after a full code cache clear.
    pub fn reset_native(&mut self) {
        for block in &mut self.blocks {
            block.clear_target_offset();
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &IrBlock)> + '_ {
        self.blocks.iter().enumerate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ir::{IrInst, IrOp};

    fn exit_block(pc: u32, target: u32) -> IrBlock {
        IrBlock::new(pc, vec![IrInst::with_constant(IrOp::ExitToConst, target)])
    }

    #[test]
    fn lookup_by_start_address() {
        let mut cache = IrBlockCache::new();
        let a = cache.add_block(exit_block(0x100, 0x200));
        let b = cache.add_block(exit_block(0x200, 0x100));

        assert_eq!(cache.block_num_from_start_address(0x100), Some(a));
        assert_eq!(cache.block_num_from_start_address(0x200), Some(b));
        assert_eq!(cache.block_num_from_start_address(0x300), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidate_keeps_entry_but_drops_lookup() {
        let mut cache = IrBlockCache::new();
        let a = cache.add_block(exit_block(0x100, 0x200));
        assert!(cache.invalidate(a));

        assert_eq!(cache.block_num_from_start_address(0x100), None);
        let block = cache.block(a).unwrap();
        assert!(!block.is_valid());
        assert_eq!(block.original_start(), 0x100);

        let again = cache.add_block(exit_block(0x100, 0x200));
        assert_ne!(again, a);
        assert_eq!(cache.block_num_from_start_address(0x100), Some(again));

        // A stale number must not remove the newer mapping.
        assert!(cache.invalidate(a));
        assert_eq!(cache.block_num_from_start_address(0x100), Some(again));
        assert!(!cache.invalidate(99));
    }

    #[test]
    fn reset_native_clears_offsets() {
        let mut cache = IrBlockCache::new();
        let a = cache.add_block(exit_block(0x100, 0x200));
        cache.block_mut(a).unwrap().set_target_offset(0x1000);
        cache.reset_native();
        assert_eq!(cache.block(a).unwrap().target_offset(), None);
    }
}
