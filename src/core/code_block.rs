//! Code cache allocator.
//!
//! A bump allocator over one [`ExecutableRegion`]. The cursor only moves
//! forward; space is reclaimed by [`CodeBlock::clear`], which rewinds it to a
//! fixed start offset without touching the bytes. There is no per-block
//! free: compiled blocks link into each other, so reclaiming one would mean
//! finding and relocating every jump into it.

use super::error::{JitError, JitResult};
use super::memory::{ExecutableRegion, ProtectScope};

pub struct CodeBlock {
    region: ExecutableRegion,
    cursor: usize,
}

impl CodeBlock {
    pub fn new(size: usize, wx_exclusive: bool) -> JitResult<Self> {
        Ok(Self {
            region: ExecutableRegion::new(size, wx_exclusive)?,
            cursor: 0,
        })
    }

    pub fn base_address(&self) -> u64 {
        self.region.base() as u64
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }

    pub fn current_offset(&self) -> u32 {
        self.cursor as u32
    }

    pub fn current_address(&self) -> u64 {
        self.address_of(self.current_offset())
    }

    pub fn address_of(&self, offset: u32) -> u64 {
        self.base_address() + offset as u64
    }

    /// Offset of a host address inside the cache.
    pub fn offset_of(&self, address: u64) -> Option<u32> {
        let base = self.base_address();
        if address >= base && address < base + self.size() as u64 {
            Some((address - base) as u32)
        } else {
            None
        }
    }

    pub fn remaining_space(&self) -> usize {
        self.size() - self.cursor
    }

    fn ensure_space(&self, len: usize) -> JitResult<()> {
        if len > self.remaining_space() {
            return Err(JitError::CodeSpaceExhausted {
                remaining: self.remaining_space(),
                required: len,
            });
        }
        Ok(())
    }

    /// Advance the cursor by `len` bytes without writing anything.
    pub fn reserve(&mut self, len: usize) -> JitResult<()> {
        self.ensure_space(len)?;
        self.cursor += len;
        Ok(())
    }

    /// Append `bytes` at the cursor and return their offset.
    ///
    /// The cursor's pages must be inside an open write scope.
    pub fn append(&mut self, bytes: &[u8]) -> JitResult<u32> {
        self.ensure_space(bytes.len())?;
        let offset = self.cursor;
        self.region.write(offset, bytes);
        self.cursor += bytes.len();
        Ok(offset as u32)
    }

    /// Overwrite already allocated bytes in place.
    pub(crate) fn write_at(&mut self, offset: u32, bytes: &[u8]) {
        self.region.write(offset as usize, bytes);
    }

    /// Move the cursor up to the next page boundary.
    pub fn align_to_page(&mut self) -> JitResult<()> {
        let page = self.region.page_size();
        let aligned = self.cursor.div_ceil(page) * page;
        self.reserve(aligned - self.cursor)
    }

    /// Rewind the cursor to `from_offset`. Old bytes stay but are unreachable.
    pub fn clear(&mut self, from_offset: u32) {
        self.cursor = (from_offset as usize).min(self.size());
    }

    /// Open a write window over `[offset, offset + len)`.
    pub fn begin_write(&self, offset: u32, len: usize) -> JitResult<ProtectScope> {
        self.region.protect_for_write(offset as usize, len)
    }

    /// Open a write window from the cursor to the end of the cache.
    pub fn begin_append(&self) -> JitResult<ProtectScope> {
        self.region
            .protect_for_write(self.cursor, self.remaining_space())
    }

    pub fn bytes(&self, offset: u32, len: usize) -> &[u8] {
        self.region.bytes(offset as usize, len)
    }

    pub fn is_wx_exclusive(&self) -> bool {
        self.region.is_wx_exclusive()
    }
}
