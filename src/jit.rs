// This module ties the block table and the x86-64 backend together into the object a
// translator front end talks to. NativeJit owns both, so the rules that span them live here:
// registering a block for a PC that already has one invalidates the old block first, a compile
// that runs out of code space clears the whole cache and tries exactly once more, a freshly
// compiled block immediately has every exit waiting for its PC patched to jump to it, and
// invalidation both rewrites the native entry and drops the block from PC lookups. Running
// guest code goes through the fixed enter-dispatcher routine.

//! Front-end facing JIT driver.

use crate::core::block_cache::IrBlockCache;
use crate::core::context::GuestContext;
use crate::core::error::{JitError, JitResult};
use crate::core::hooks::JitHooks;
use crate::core::ir::IrBlock;
use crate::core::options::JitOptions;
use crate::x64::backend::X64JitBackend;

type EnterFn = extern "C" fn(ctx: *mut GuestContext);

pub struct NativeJit {
    blocks: IrBlockCache,
    backend: X64JitBackend,
}

impl NativeJit {
    pub fn new(options: JitOptions, hooks: JitHooks) -> JitResult<Self> {
        log::debug!("Creating JIT with {options:?}");
        Ok(Self {
            blocks: IrBlockCache::new(),
            backend: X64JitBackend::new(options, hooks)?,
        })
    }

    /// Options from `IRJIT_*` environment variables.
    pub fn from_env(hooks: JitHooks) -> JitResult<Self> {
        Self::new(JitOptions::from_env()?, hooks)
    }

    pub fn blocks(&self) -> &IrBlockCache {
        &self.blocks
    }

    pub fn backend(&self) -> &X64JitBackend {
        &self.backend
    }

    pub fn set_log_blocks(&mut self, count: u32) {
        self.backend.set_log_blocks(count);
    }

    /// Register `block`, invalidating any block already starting at its PC.
    pub fn add_block(&mut self, block: IrBlock) -> JitResult<usize> {
        if let Some(old) = self.blocks.block_num_from_start_address(block.original_start()) {
            self.invalidate(old)?;
        }
        Ok(self.blocks.add_block(block))
    }

    /// Compile a registered block and link every exit waiting for it.
    pub fn compile(&mut self, block_num: usize) -> JitResult<()> {
        self.compile_inner(block_num, false)
    }

    /// Like [`compile`](Self::compile) but never dumps the block.
    pub fn preload(&mut self, block_num: usize) -> JitResult<()> {
        self.compile_inner(block_num, true)
    }

    pub fn add_and_compile(&mut self, block: IrBlock) -> JitResult<usize> {
        let block_num = self.add_block(block)?;
        self.compile(block_num)?;
        Ok(block_num)
    }

    fn compile_inner(&mut self, block_num: usize, preload: bool) -> JitResult<()> {
        match self.blocks.block(block_num) {
            Some(block) if block.is_valid() => {}
            _ => return Err(JitError::UnknownBlock(block_num)),
        }

        match self.backend.compile_block(&mut self.blocks, block_num, preload) {
            Ok(()) => {}
            Err(err) if err.is_out_of_space() => {
                log::warn!("Out of code space compiling block {block_num}, clearing the cache");
                self.backend.clear_all_blocks(&mut self.blocks);
                self.backend.compile_block(&mut self.blocks, block_num, preload)?;
            }
            Err(err) => return Err(err),
        }
        self.backend.link_block(&self.blocks, block_num)
    }

    /// Send `block_num`'s entry back to the dispatcher and forget the block.
    pub fn invalidate(&mut self, block_num: usize) -> JitResult<()> {
        self.backend.invalidate_block(&self.blocks, block_num)?;
        self.blocks.invalidate(block_num);
        Ok(())
    }

    /// Invalidate the block starting at `pc`. Returns whether there was one.
    pub fn invalidate_pc(&mut self, pc: u32) -> JitResult<bool> {
        match self.blocks.block_num_from_start_address(pc) {
            Some(block_num) => {
                self.invalidate(block_num)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop all compiled code. IR blocks stay registered.
    pub fn clear_cache(&mut self) {
        self.backend.clear_all_blocks(&mut self.blocks);
    }

    /// Host entry of a compiled, still valid block.
    pub fn entry_address(&self, block_num: usize) -> Option<u64> {
        let block = self.blocks.block(block_num)?;
        if !block.is_valid() {
            return None;
        }
        self.backend.native_entry(block_num)
    }

    /// Host entry for guest `pc`, if a block for it is compiled.
    pub fn lookup_pc(&self, pc: u32) -> Option<u64> {
        self.entry_address(self.blocks.block_num_from_start_address(pc)?)
    }

    pub fn describe_code_ptr(&self, address: u64) -> Option<String> {
        self.backend.describe_code_ptr(&self.blocks, address)
    }

    /// Run guest code from `ctx.pc` until the core state leaves running.
    ///
    /// # Safety
    ///
    /// The host must be x86-64 with the System V calling convention, and
    /// every hook must only touch `ctx` through the pointer it is handed.
    /// Entry points returned by the resolve hook must be addresses of this
    /// JIT's compiled blocks or null.
    pub unsafe fn run(&self, ctx: &mut GuestContext) {
        let entry = self.backend.fixed_code().enter_dispatcher as usize as *const u8;
        // SAFETY: enter_dispatcher follows the C ABI and takes the context pointer.
        let enter: EnterFn = unsafe { std::mem::transmute::<*const u8, EnterFn>(entry) };
        enter(ctx as *mut GuestContext);
    }
}
