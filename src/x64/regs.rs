//! Host register naming and fixed register roles.
//!
//! Registers are identified by bank and hardware number, in the encoding
//! order rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8..r15.

/// Maximum number of register banks supported (GP, XMM).
pub const MAX_REGISTER_BANKS: usize = 2;

pub type RegBank = u8;
pub type RegId = u8;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: RegId) -> Self {
        Self { bank: 0, id }
    }
}

pub const RAX: AsmReg = AsmReg::gp(0);
pub const RCX: AsmReg = AsmReg::gp(1);
pub const RDX: AsmReg = AsmReg::gp(2);
pub const RBX: AsmReg = AsmReg::gp(3);
pub const RSP: AsmReg = AsmReg::gp(4);
pub const RBP: AsmReg = AsmReg::gp(5);
pub const RSI: AsmReg = AsmReg::gp(6);
pub const RDI: AsmReg = AsmReg::gp(7);
pub const R8: AsmReg = AsmReg::gp(8);
pub const R9: AsmReg = AsmReg::gp(9);
pub const R10: AsmReg = AsmReg::gp(10);
pub const R11: AsmReg = AsmReg::gp(11);
pub const R12: AsmReg = AsmReg::gp(12);
pub const R13: AsmReg = AsmReg::gp(13);
pub const R14: AsmReg = AsmReg::gp(14);
pub const R15: AsmReg = AsmReg::gp(15);

/// Points at the [`GuestContext`](crate::core::context::GuestContext) while guest code runs.
pub const CTXREG: AsmReg = R14;
/// Holds the guest PC handed to the dispatcher; also the call return register.
pub const SCRATCH1: AsmReg = RAX;
pub const SCRATCH2: AsmReg = RDX;
/// Guest downcount when static allocation is enabled.
pub const DOWNCOUNTREG: AsmReg = R15;

/// First two integer argument registers of the System V ABI.
pub const ARG1: AsmReg = RDI;
pub const ARG2: AsmReg = RSI;

/// Callee-saved registers pushed by the dispatcher entry, in push order.
pub const CALLEE_SAVED: [AsmReg; 6] = [RBX, RBP, R12, R13, R14, R15];

/// Bit set for tracking register sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegBitSet {
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    pub const fn new() -> Self {
        Self {
            banks: [0; MAX_REGISTER_BANKS],
        }
    }

    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        if reg.bank as usize >= MAX_REGISTER_BANKS || reg.id >= 64 {
            return false;
        }
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    pub fn clear_all(&mut self) {
        self.banks = [0; MAX_REGISTER_BANKS];
    }

    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        if bank as usize >= MAX_REGISTER_BANKS {
            return 0;
        }
        self.banks[bank as usize].count_ones()
    }

    /// Registers of `bank` in ascending id order.
    pub fn iter_bank(&self, bank: RegBank) -> impl Iterator<Item = AsmReg> + '_ {
        let bits = self.banks.get(bank as usize).copied().unwrap_or(0);
        (0..64u8)
            .filter(move |id| bits & (1u64 << id) != 0)
            .map(move |id| AsmReg::new(bank, id))
    }
}
