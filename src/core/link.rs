// This module keeps the bookkeeping that lets compiled blocks jump straight into each other.
// For every compiled block it stores the native metadata (unchecked entry offset and the
// checked entry offset other blocks may link to), and for every exit a block emitted while
// linking was enabled it stores a BlockExit record: owning block, target guest PC, offset and
// reserved length of the patch site. Records are indexed both by owner and by target PC so
// that linking a freshly compiled block and invalidating an old one are both proportional to
// the number of affected sites. The table performs no code writes itself; the backend reads
// it to decide what to patch.

//! Exit-site records and native block metadata.

use hashbrown::HashMap;

/// Where a compiled block's code lives in the code cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBlock {
    /// Unchecked entry, used by the dispatcher.
    pub target_offset: u32,
    /// Checked entry (downcount guard), the only linkable address.
    pub checked_offset: u32,
}

/// A patchable exit emitted by a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExit {
    pub owner: usize,
    pub dest: u32,
    pub offset: u32,
    pub len: u32,
}

#[derive(Debug, Default)]
pub struct LinkTable {
    native: HashMap<usize, NativeBlock>,
    exits_by_owner: HashMap<usize, Vec<BlockExit>>,
    owners_by_dest: HashMap<u32, Vec<usize>>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn native_block(&self, block_num: usize) -> Option<&NativeBlock> {
        self.native.get(&block_num)
    }

    pub fn set_native_block(&mut self, block_num: usize, native: NativeBlock) {
        self.native.insert(block_num, native);
    }

    /// Checked entry offset for a block, if it finished compiling.
    pub fn checked_offset(&self, block_num: usize) -> Option<u32> {
        self.native.get(&block_num).map(|n| n.checked_offset)
    }

    pub fn add_exit(&mut self, exit: BlockExit) {
        let owners = self.owners_by_dest.entry(exit.dest).or_default();
        if !owners.contains(&exit.owner) {
            owners.push(exit.owner);
        }
        self.exits_by_owner.entry(exit.owner).or_default().push(exit);
    }

    /// Every recorded exit site whose target is `pc`.
    pub fn exits_to(&self, pc: u32) -> Vec<BlockExit> {
        let Some(owners) = self.owners_by_dest.get(&pc) else {
            return Vec::new();
        };
        owners
            .iter()
            .filter_map(|owner| self.exits_by_owner.get(owner))
            .flat_map(|exits| exits.iter().filter(|e| e.dest == pc).copied())
            .collect()
    }

    pub fn exits_of(&self, owner: usize) -> &[BlockExit] {
        self.exits_by_owner
            .get(&owner)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Remove every exit record that targets `pc`.
    pub fn erase_links_to(&mut self, pc: u32) {
        let Some(owners) = self.owners_by_dest.remove(&pc) else {
            return;
        };
        for owner in owners {
            if let Some(exits) = self.exits_by_owner.get_mut(&owner) {
                exits.retain(|e| e.dest != pc);
                if exits.is_empty() {
                    self.exits_by_owner.remove(&owner);
                }
            }
        }
    }

    /// Remove a block's own exits and its native metadata.
    pub fn erase_block(&mut self, block_num: usize) {
        self.native.remove(&block_num);
        let Some(exits) = self.exits_by_owner.remove(&block_num) else {
            return;
        };
        for exit in exits {
            if let Some(owners) = self.owners_by_dest.get_mut(&exit.dest) {
                owners.retain(|&o| o != block_num);
                if owners.is_empty() {
                    self.owners_by_dest.remove(&exit.dest);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.native.clear();
        self.exits_by_owner.clear();
        self.owners_by_dest.clear();
    }

    pub fn exit_count(&self) -> usize {
        self.exits_by_owner.values().map(Vec::len).sum()
    }

    pub fn native_blocks(&self) -> impl Iterator<Item = (usize, &NativeBlock)> + '_ {
        self.native.iter().map(|(&num, native)| (num, native))
    }
}
