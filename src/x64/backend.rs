// This module implements the x86-64 JIT backend. X64JitBackend owns the code cache, the fixed
// dispatcher code, the register cache and the link table, and provides the block-level
// operations: compiling an IR block into the cache, emitting block exits, patching recorded
// exits into direct jumps once their target is compiled, invalidating a compiled block by
// rewriting its entry, and clearing the whole cache. Code is emitted one IR instruction at a
// time: each instruction's host code is assembled at the current cache address and appended,
// after which the remaining space is checked. Exit sites are found through labels placed in
// the chunk and are staged until the block completes, so a block that fails to compile leaves
// no trace in the link table or in the block's metadata. Per-opcode instruction selection
// lives in comp_ops.

//! x86-64 block compiler, exit linking and invalidation.

use super::disasm;
use super::encoder::{EncodingError, JumpCondition, X64Encoder};
use super::fixed_code::{emit_downcount_test, FixedCode};
use super::reg_cache::X64RegCache;
use super::regs::*;
use crate::core::block_cache::IrBlockCache;
use crate::core::code_block::CodeBlock;
use crate::core::error::{JitError, JitResult};
use crate::core::hooks::JitHooks;
use crate::core::ir::IrInst;
use crate::core::link::{BlockExit, LinkTable, NativeBlock};
use crate::core::options::JitOptions;
use crate::core::reg_alloc::RegAllocator;
use iced_x86::code_asm::CodeLabel;

/// Smallest block body; an invalidation trampoline must fit.
pub const MIN_BLOCK_NORMAL_LEN: usize = 16;
/// Smallest exit site; a direct jump must fit.
pub const MIN_BLOCK_EXIT_LEN: usize = 16;
/// Free space required before and during a block compile.
pub const CODE_SPACE_SAFETY_MARGIN: usize = 0x800;

const INT3: u8 = 0xCC;

/// Exit emitted into the chunk being built; its offset is known after assembly.
#[derive(Debug, Clone, Copy)]
struct ChunkExit {
    label: CodeLabel,
    dest: u32,
    len: u32,
}

#[derive(Debug, Clone, Copy)]
struct PendingExit {
    dest: u32,
    offset: u32,
    len: u32,
}

/// Host byte range produced for one IR instruction, kept for block dumps.
struct DumpEntry {
    inst: IrInst,
    start: u32,
    end: u32,
}

pub struct X64JitBackend {
    pub(super) options: JitOptions,
    pub(super) hooks: JitHooks,
    pub(super) code: CodeBlock,
    pub(super) fixed: FixedCode,
    pub(super) regs: X64RegCache,
    pub(super) enc: X64Encoder,
    links: LinkTable,
    compiling_block: Option<usize>,
    chunk_exits: Vec<ChunkExit>,
    pending_exits: Vec<PendingExit>,
    log_blocks: u32,
}

impl X64JitBackend {
    pub fn new(options: JitOptions, hooks: JitHooks) -> JitResult<Self> {
        options.validate()?;
        let mut code = CodeBlock::new(options.code_space_size, options.wx_exclusive)?;
        let fixed = FixedCode::generate(&mut code, &options, &hooks)?;
        Ok(Self {
            regs: X64RegCache::new(options.use_static_alloc),
            enc: X64Encoder::new()?,
            log_blocks: options.log_blocks,
            options,
            hooks,
            code,
            fixed,
            links: LinkTable::new(),
            compiling_block: None,
            chunk_exits: Vec::new(),
            pending_exits: Vec::new(),
        })
    }

    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    pub fn fixed_code(&self) -> &FixedCode {
        &self.fixed
    }

    pub fn code(&self) -> &CodeBlock {
        &self.code
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn compiling_block(&self) -> Option<usize> {
        self.compiling_block
    }

    pub fn set_log_blocks(&mut self, count: u32) {
        self.log_blocks = count;
    }

    /// Blocks still to be dumped.
    pub fn log_blocks(&self) -> u32 {
        self.log_blocks
    }

    /// Unchecked entry of a compiled block.
    pub fn native_entry(&self, block_num: usize) -> Option<u64> {
        self.links
            .native_block(block_num)
            .map(|native| self.code.address_of(native.target_offset))
    }

    /// Checked entry of a compiled block.
    pub fn checked_entry(&self, block_num: usize) -> Option<u64> {
        self.links
            .checked_offset(block_num)
            .map(|offset| self.code.address_of(offset))
    }

    /// Compile `block_num` into the code cache.
    ///
    /// On failure nothing about the block is recorded. Bytes already appended
    /// stay in the cache, unreachable until the next full clear.
    pub fn compile_block(&mut self, blocks: &mut IrBlockCache, block_num: usize, preload: bool) -> JitResult<()> {
        if blocks.block(block_num).is_none() {
            return Err(JitError::UnknownBlock(block_num));
        }
        let remaining = self.code.remaining_space();
        if remaining < CODE_SPACE_SAFETY_MARGIN {
            log::warn!("Code space nearly exhausted ({remaining} bytes left), refusing to compile block {block_num}");
            return Err(JitError::CodeSpaceExhausted {
                remaining,
                required: CODE_SPACE_SAFETY_MARGIN,
            });
        }

        self.compiling_block = Some(block_num);
        let result = self.compile_body(blocks, block_num, preload);
        self.compiling_block = None;
        self.chunk_exits.clear();

        let native = match result {
            Ok(native) => native,
            Err(err) => {
                self.pending_exits.clear();
                self.enc.reset();
                return Err(err);
            }
        };

        let start_pc = match blocks.block_mut(block_num) {
            Some(block) => {
                block.set_target_offset(native.target_offset);
                block.original_start()
            }
            None => return Err(JitError::UnknownBlock(block_num)),
        };
        // A recompiled block drops the records of its previous copy.
        self.links.erase_block(block_num);
        self.links.set_native_block(block_num, native);
        for pending in self.pending_exits.drain(..) {
            self.links.add_exit(BlockExit {
                owner: block_num,
                dest: pending.dest,
                offset: pending.offset,
                len: pending.len,
            });
        }
        log::debug!(
            "Compiled block {} (pc {:08x}) at {:#x}, checked entry {:#x}, {} bytes",
            block_num,
            start_pc,
            native.target_offset,
            native.checked_offset,
            self.code.current_offset() - native.target_offset.min(native.checked_offset)
        );
        Ok(())
    }

    fn compile_body(&mut self, blocks: &IrBlockCache, block_num: usize, preload: bool) -> JitResult<NativeBlock> {
        let _write = self.code.begin_append()?;
        let block = blocks.block(block_num).ok_or(JitError::UnknownBlock(block_num))?;
        let start_pc = block.original_start();
        let static_alloc = self.options.use_static_alloc;

        let mut checked_offset = None;
        if self.options.uses_forward_check() {
            checked_offset = Some(self.code.current_offset());
            let mut normal_entry = self.enc.create_label();
            emit_downcount_test(&mut self.enc, static_alloc)?;
            self.enc.jcc_label(JumpCondition::NotSign, normal_entry)?;
            self.enc.mov32_reg_imm(SCRATCH1, start_pc)?;
            self.enc.jmp_addr(self.fixed.outer_loop_pc_in_scratch1)?;
            self.enc.place_label(&mut normal_entry)?;
            self.flush_chunk()?;
        }

        let target_offset = self.code.current_offset();
        let block_start = self.code.current_address();
        self.regs.start(block);

        let dumping = self.log_blocks > 0 && !preload;
        let mut dump = Vec::new();
        for (index, inst) in block.instructions().iter().enumerate() {
            self.regs.set_ir_index(index);
            let start = self.code.current_offset();

            self.compile_ir_inst(blocks, inst)?;
            let (gpr_off, fpr_off) = (self.options.disable_regalloc_gpr, self.options.disable_regalloc_fpr);
            if gpr_off || fpr_off {
                self.regs.flush_all(&mut self.enc, gpr_off, fpr_off)?;
            }
            self.flush_chunk()?;

            if dumping {
                dump.push(DumpEntry {
                    inst: *inst,
                    start,
                    end: self.code.current_offset(),
                });
            }
            let remaining = self.code.remaining_space();
            if remaining < CODE_SPACE_SAFETY_MARGIN {
                return Err(JitError::CodeSpaceExhausted {
                    remaining,
                    required: CODE_SPACE_SAFETY_MARGIN,
                });
            }
        }

        if self.options.diagnostic_checks {
            // Only reachable if no instruction left the block.
            self.enc.mov64_reg_imm(SCRATCH1, self.hooks.no_block_exits as usize as u64)?;
            self.enc.call_reg(SCRATCH1)?;
            self.enc.jmp_addr(self.fixed.crash_handler)?;
            self.flush_chunk()?;
        }

        let len = (self.code.current_offset() - target_offset) as usize;
        if len < MIN_BLOCK_NORMAL_LEN {
            self.code.append(&[INT3; MIN_BLOCK_NORMAL_LEN][..MIN_BLOCK_NORMAL_LEN - len])?;
        }

        // Recorded even without linking; it also marks where the body ends.
        let checked_offset = match checked_offset {
            Some(offset) => offset,
            None => {
                let offset = self.code.current_offset();
                if self.options.uses_back_jump() {
                    emit_downcount_test(&mut self.enc, static_alloc)?;
                    self.enc.jcc_addr(JumpCondition::NotSign, block_start)?;
                    self.enc.mov32_reg_imm(SCRATCH1, start_pc)?;
                    self.enc.jmp_addr(self.fixed.outer_loop_pc_in_scratch1)?;
                    self.flush_chunk()?;
                }
                offset
            }
        };

        if dumping {
            self.log_blocks -= 1;
            self.dump_block(start_pc, target_offset, &dump);
        }

        Ok(NativeBlock {
            target_offset,
            checked_offset,
        })
    }

    /// Assemble the pending chunk at the cursor and append it.
    pub(super) fn flush_chunk(&mut self) -> JitResult<()> {
        if self.enc.is_empty() {
            return Ok(());
        }
        let ip = self.code.current_address();
        let labels: Vec<CodeLabel> = self.chunk_exits.iter().map(|e| e.label).collect();
        let assembled = self.enc.assemble(ip, &labels)?;
        self.code.append(&assembled.bytes)?;

        for (exit, exit_ip) in self.chunk_exits.drain(..).zip(assembled.label_ips) {
            let offset = self
                .code
                .offset_of(exit_ip)
                .ok_or(EncodingError::UnplacedLabel)?;
            log::trace!("Exit to {:08x} at {:#x} ({} bytes)", exit.dest, offset, exit.len);
            self.pending_exits.push(PendingExit {
                dest: exit.dest,
                offset,
                len: exit.len,
            });
        }
        Ok(())
    }

    /// Leave the block for guest PC `pc`.
    ///
    /// Jumps straight to the target's checked entry when it is already
    /// compiled; otherwise goes through the dispatcher. With linking on, the
    /// site is padded and recorded so it can be patched later.
    pub(super) fn write_exit(&mut self, blocks: &IrBlockCache, pc: u32) -> JitResult<()> {
        let linking = self.options.enable_blocklink;
        let linked_target = if linking {
            blocks
                .block_num_from_start_address(pc)
                .and_then(|num| self.checked_entry(num))
        } else {
            None
        };

        let mut start = self.enc.create_label();
        self.enc.place_label(&mut start)?;
        emit_exit_jump(&mut self.enc, &self.fixed, pc, linked_target)?;

        if linking {
            let mut sizing = X64Encoder::new()?;
            emit_exit_jump(&mut sizing, &self.fixed, pc, linked_target)?;
            let len = sizing.assemble(self.code.current_address(), &[])?.bytes.len();
            if len < MIN_BLOCK_EXIT_LEN {
                self.enc.pad_int3(MIN_BLOCK_EXIT_LEN - len)?;
            }
            self.chunk_exits.push(ChunkExit {
                label: start,
                dest: pc,
                len: len.max(MIN_BLOCK_EXIT_LEN) as u32,
            });
        }
        Ok(())
    }

    /// Rewrite the exit site at `offset` into a jump to `block_num`'s checked entry.
    ///
    /// Does nothing if that block has no checked entry.
    pub fn overwrite_exit(&mut self, offset: u32, len: u32, block_num: usize) -> JitResult<()> {
        debug_assert!(len as usize >= MIN_BLOCK_EXIT_LEN);
        let Some(target) = self.checked_entry(block_num) else {
            return Ok(());
        };

        let site = self.code.address_of(offset);
        self.enc.jmp_addr(target)?;
        let bytes = self.enc.assemble(site, &[])?.bytes;
        let patch = padded(bytes, len as usize)?;

        let _write = self.code.begin_write(offset, patch.len())?;
        self.code.write_at(offset, &patch);
        log::trace!("Linked exit at {offset:#x} to block {block_num} ({target:#x})");
        Ok(())
    }

    /// Patch every recorded exit that targets `block_num`'s start PC.
    pub fn link_block(&mut self, blocks: &IrBlockCache, block_num: usize) -> JitResult<()> {
        let block = blocks.block(block_num).ok_or(JitError::UnknownBlock(block_num))?;
        for exit in self.links.exits_to(block.original_start()) {
            self.overwrite_exit(exit.offset, exit.len, block_num)?;
        }
        Ok(())
    }

    /// Redirect `block_num`'s entry to the dispatcher and drop its links.
    ///
    /// Jumps already patched to the old checked entry keep working: the guard
    /// there falls through into the rewritten entry.
    pub fn invalidate_block(&mut self, blocks: &IrBlockCache, block_num: usize) -> JitResult<()> {
        let block = blocks.block(block_num).ok_or(JitError::UnknownBlock(block_num))?;
        let pc = block.original_start();

        if pc != 0 {
            if let Some(offset) = block.target_offset() {
                let entry = self.code.address_of(offset);
                self.enc.mov32_reg_imm(SCRATCH1, pc)?;
                self.enc.jmp_addr(self.fixed.dispatcher_pc_in_scratch1)?;
                let bytes = self.enc.assemble(entry, &[])?.bytes;
                let patch = padded(bytes, MIN_BLOCK_NORMAL_LEN)?;

                let _write = self.code.begin_write(offset, patch.len())?;
                self.code.write_at(offset, &patch);
                log::trace!("Invalidated block {block_num} (pc {pc:08x}) at {offset:#x}");
            }
        }

        self.links.erase_links_to(pc);
        self.links.erase_block(block_num);
        Ok(())
    }

    /// Forget every compiled block and rewind the cache to just after the fixed code.
    pub fn clear_all_blocks(&mut self, blocks: &mut IrBlockCache) {
        log::warn!(
            "Clearing code cache ({} bytes used, {} exit sites)",
            self.code.current_offset() - self.fixed.jit_start_offset,
            self.links.exit_count()
        );
        self.code.clear(self.fixed.jit_start_offset);
        self.links.clear();
        blocks.reset_native();
    }

    /// Human-readable description of a host code address.
    pub fn describe_code_ptr(&self, blocks: &IrBlockCache, address: u64) -> Option<String> {
        if let Some(name) = self.fixed.describe(address) {
            return Some(name.to_string());
        }
        let offset = self.code.offset_of(address)?;
        if offset < self.fixed.jit_start_offset || offset >= self.code.current_offset() {
            return None;
        }
        let (block_num, start) = self
            .links
            .native_blocks()
            .map(|(num, native)| (num, native.target_offset.min(native.checked_offset)))
            .filter(|&(_, start)| start <= offset)
            .max_by_key(|&(_, start)| start)?;
        let pc = blocks.block(block_num).map(|b| b.original_start())?;
        Some(format!("block {block_num} (pc {pc:08x}) +{:#x}", offset - start))
    }

    fn dump_block(&self, start_pc: u32, target_offset: u32, entries: &[DumpEntry]) {
        let len = self.code.current_offset() - target_offset;
        log::info!("=============== x86 ({start_pc:08x}, {len} bytes) ===============");
        for entry in entries {
            log::info!("IR: {}", entry.inst);
            let bytes = self.code.bytes(entry.start, (entry.end - entry.start) as usize);
            for line in disasm::disassemble(bytes, self.code.address_of(entry.start)) {
                log::info!("  {line}");
            }
        }
    }
}

/// Direct jump to a linked target, or PC-in-scratch jump to the dispatcher.
fn emit_exit_jump(enc: &mut X64Encoder, fixed: &FixedCode, pc: u32, linked_target: Option<u64>) -> JitResult<()> {
    match linked_target {
        Some(target) => enc.jmp_addr(target)?,
        None => {
            enc.mov32_reg_imm(SCRATCH1, pc)?;
            enc.jmp_addr(fixed.dispatcher_pc_in_scratch1)?;
        }
    }
    Ok(())
}

/// Pad `bytes` with int3 up to `len`.
fn padded(mut bytes: Vec<u8>, len: usize) -> JitResult<Vec<u8>> {
    if bytes.len() > len {
        return Err(JitError::PatchOverflow {
            len: bytes.len(),
            reserved: len,
        });
    }
    bytes.resize(len, INT3);
    Ok(bytes)
}
