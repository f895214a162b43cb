//! Architectural register set.
//!
//! Sixteen general-purpose registers, three separately renamable condition
//! flags (so flag producers and consumers are tracked through the same rename
//! machinery as data), the instruction pointer, and a hardwired zero register.

use std::fmt;

/// Number of rename table slots (16 GPRs + zf/cf/of + rip + zero).
pub const ARCH_REG_COUNT: usize = 21;

/// Architectural register identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ArchReg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    /// Zero flag, renamed like a data register.
    Zf = 16,
    /// Carry flag.
    Cf = 17,
    /// Overflow flag.
    Of = 18,
    /// Instruction pointer (committed at EOM).
    Rip = 19,
    /// Hardwired zero; never renamed.
    #[default]
    Zero = 20,
}

impl ArchReg {
    /// All registers in rename table order.
    pub const ALL: [Self; ARCH_REG_COUNT] = [
        Self::Rax,
        Self::Rcx,
        Self::Rdx,
        Self::Rbx,
        Self::Rsp,
        Self::Rbp,
        Self::Rsi,
        Self::Rdi,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::R13,
        Self::R14,
        Self::R15,
        Self::Zf,
        Self::Cf,
        Self::Of,
        Self::Rip,
        Self::Zero,
    ];

    /// Rename table index of this register.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the register for a rename table index.
    pub fn from_index(idx: usize) -> Self {
        Self::ALL[idx]
    }

    /// True for the condition flag registers.
    #[inline]
    pub const fn is_flag(self) -> bool {
        matches!(self, Self::Zf | Self::Cf | Self::Of)
    }

    /// ABI-style register name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Rax => "rax",
            Self::Rcx => "rcx",
            Self::Rdx => "rdx",
            Self::Rbx => "rbx",
            Self::Rsp => "rsp",
            Self::Rbp => "rbp",
            Self::Rsi => "rsi",
            Self::Rdi => "rdi",
            Self::R8 => "r8",
            Self::R9 => "r9",
            Self::R10 => "r10",
            Self::R11 => "r11",
            Self::R12 => "r12",
            Self::R13 => "r13",
            Self::R14 => "r14",
            Self::R15 => "r15",
            Self::Zf => "zf",
            Self::Cf => "cf",
            Self::Of => "of",
            Self::Rip => "rip",
            Self::Zero => "zero",
        }
    }
}

impl fmt::Display for ArchReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flag bit: zero flag set.
pub const FLAG_ZF: u8 = 1 << 0;
/// Flag bit: carry flag set.
pub const FLAG_CF: u8 = 1 << 1;
/// Flag bit: overflow flag set.
pub const FLAG_OF: u8 = 1 << 2;

/// Extracts the named flag bit (0 or 1) from a flags bitmap.
#[inline]
pub fn flag_value(flags: u8, reg: ArchReg) -> u64 {
    let bit = match reg {
        ArchReg::Zf => FLAG_ZF,
        ArchReg::Cf => FLAG_CF,
        ArchReg::Of => FLAG_OF,
        _ => return 0,
    };
    u64::from(flags & bit != 0)
}
