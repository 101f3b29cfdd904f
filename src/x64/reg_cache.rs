//! Guest GPR cache for x86-64.
//!
//! Guest registers live in [`GuestContext`] and are loaded into host
//! registers on first use inside a block. A mapped register stays in its
//! host register until it is evicted or flushed; dirty ones are written back
//! at that point. Registers used by the instruction being compiled are
//! spill-locked so mapping a second operand can never evict the first.
//!
//! Eviction prefers the candidate whose next use in the block is farthest
//! away, with a clock hand breaking ties so that equally cold registers are
//! recycled round-robin.

use super::encoder::{EncodingError, X64Encoder};
use super::regs::*;
use crate::core::context::{GuestContext, NUM_GPRS};
use crate::core::ir::{IrBlock, IrInst};
use crate::core::reg_alloc::RegAllocator;

/// How an instruction is going to use a mapped register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Read,
    /// Fully overwritten; the old value is not loaded.
    Write,
    ReadWrite,
}

impl MapMode {
    fn reads(self) -> bool {
        matches!(self, MapMode::Read | MapMode::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, MapMode::Write | MapMode::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HostSlot {
    guest: Option<u8>,
    dirty: bool,
}

/// Guest registers read or written by `inst`.
pub fn gpr_operands(inst: &IrInst) -> impl Iterator<Item = u8> {
    let slots = [inst.dest, inst.src1, inst.src2];
    let mut regs = [None; 3];
    let mut slot = 0;
    for ty in inst.meta().types.chars() {
        match ty {
            'C' => {}
            'G' => {
                regs[slot] = slots.get(slot).copied();
                slot += 1;
            }
            _ => slot += 1,
        }
        if slot >= 3 {
            break;
        }
    }
    regs.into_iter().flatten()
}

pub struct X64RegCache {
    allocatable: Vec<AsmReg>,
    host: [HostSlot; 16],
    guest_to_host: [Option<AsmReg>; NUM_GPRS],
    spill_locked: RegBitSet,
    clock: usize,
    instructions: Vec<IrInst>,
    ir_index: usize,
}

impl X64RegCache {
    pub fn new(use_static_alloc: bool) -> Self {
        let mut allocatable = vec![RBX, RCX, RSI, RDI, R8, R9, R10, R11, R12, R13];
        if !use_static_alloc {
            allocatable.push(DOWNCOUNTREG);
        }
        Self {
            allocatable,
            host: [HostSlot::default(); 16],
            guest_to_host: [None; NUM_GPRS],
            spill_locked: RegBitSet::new(),
            clock: 0,
            instructions: Vec::new(),
            ir_index: 0,
        }
    }

    pub fn allocatable(&self) -> &[AsmReg] {
        &self.allocatable
    }

    /// Host register currently holding `guest`, if any.
    pub fn mapped(&self, guest: u8) -> Option<AsmReg> {
        self.guest_to_host[guest as usize % NUM_GPRS]
    }

    pub fn is_dirty(&self, guest: u8) -> bool {
        self.mapped(guest)
            .is_some_and(|reg| self.host[reg.id as usize].dirty)
    }

    pub fn mapped_count(&self) -> usize {
        self.guest_to_host.iter().filter(|r| r.is_some()).count()
    }

    /// Map `guest` into a host register for the current instruction.
    pub fn map_gpr(
        &mut self,
        emit: &mut X64Encoder,
        guest: u8,
        mode: MapMode,
    ) -> Result<AsmReg, EncodingError> {
        let guest = guest % NUM_GPRS as u8;
        if let Some(reg) = self.guest_to_host[guest as usize] {
            self.spill_locked.set(reg);
            if mode.writes() {
                self.host[reg.id as usize].dirty = true;
            }
            return Ok(reg);
        }

        let reg = self.allocate(emit)?;
        if mode.reads() {
            emit.mov32_reg_mem(reg, CTXREG, GuestContext::gpr_offset(guest))?;
        }
        self.host[reg.id as usize] = HostSlot {
            guest: Some(guest),
            dirty: mode.writes(),
        };
        self.guest_to_host[guest as usize] = Some(reg);
        self.spill_locked.set(reg);
        Ok(reg)
    }

    /// Write back and unmap one guest register.
    pub fn flush_gpr(&mut self, emit: &mut X64Encoder, guest: u8) -> Result<(), EncodingError> {
        match self.mapped(guest) {
            Some(reg) => self.release(emit, reg),
            None => Ok(()),
        }
    }

    fn allocate(&mut self, emit: &mut X64Encoder) -> Result<AsmReg, EncodingError> {
        if let Some(&free) = self
            .allocatable
            .iter()
            .find(|r| self.host[r.id as usize].guest.is_none())
        {
            return Ok(free);
        }
        let victim = self.pick_victim().ok_or(EncodingError::NoFreeRegister)?;
        self.release(emit, victim)?;
        Ok(victim)
    }

    fn pick_victim(&mut self) -> Option<AsmReg> {
        let count = self.allocatable.len();
        let mut best: Option<(usize, AsmReg)> = None;
        for step in 0..count {
            let reg = self.allocatable[(self.clock + step) % count];
            if self.spill_locked.contains(reg) {
                continue;
            }
            let Some(guest) = self.host[reg.id as usize].guest else {
                continue;
            };
            let distance = self.next_use(guest);
            if best.map_or(true, |(d, _)| distance > d) {
                best = Some((distance, reg));
            }
        }
        self.clock = (self.clock + 1) % count.max(1);
        best.map(|(_, reg)| reg)
    }

    /// Instructions until `guest` is used again; `usize::MAX` if never.
    fn next_use(&self, guest: u8) -> usize {
        self.instructions
            .iter()
            .skip(self.ir_index + 1)
            .position(|inst| gpr_operands(inst).any(|r| r == guest))
            .unwrap_or(usize::MAX)
    }

    fn release(&mut self, emit: &mut X64Encoder, reg: AsmReg) -> Result<(), EncodingError> {
        let slot = self.host[reg.id as usize];
        if let Some(guest) = slot.guest {
            if slot.dirty {
                emit.mov32_mem_reg(CTXREG, GuestContext::gpr_offset(guest), reg)?;
            }
            self.guest_to_host[guest as usize] = None;
        }
        self.host[reg.id as usize] = HostSlot::default();
        Ok(())
    }
}

impl RegAllocator for X64RegCache {
    type Emitter = X64Encoder;
    type Error = EncodingError;

    fn start(&mut self, block: &IrBlock) {
        self.host = [HostSlot::default(); 16];
        self.guest_to_host = [None; NUM_GPRS];
        self.spill_locked.clear_all();
        self.clock = 0;
        self.instructions = block.instructions().to_vec();
        self.ir_index = 0;
    }

    fn set_ir_index(&mut self, index: usize) {
        self.ir_index = index;
        self.spill_locked.clear_all();
    }

    fn flush_all(&mut self, emit: &mut X64Encoder, gpr: bool, _fpr: bool) -> Result<(), EncodingError> {
        // FPRs are never cached; FPU instructions work on the context directly.
        if gpr {
            let mapped: Vec<AsmReg> = self
                .allocatable
                .iter()
                .copied()
                .filter(|r| self.host[r.id as usize].guest.is_some())
                .collect();
            for reg in mapped {
                self.release(emit, reg)?;
            }
        }
        Ok(())
    }
}
