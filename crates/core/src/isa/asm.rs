//! Tiny uop assembler for demos and tests.
//!
//! Builds programs as vectors of single-uop instructions (each uop is both
//! SOM and EOM) with sequential rips. Branch targets are absolute rips.

use crate::isa::regs::ArchReg;
use crate::isa::uop::{Opcode, SETFLAG_CF, SETFLAG_OF, SETFLAG_ZF, Uop};

/// Instruction length used by the assembler.
pub const INSN_BYTES: u8 = 4;

/// The exit assist id: sets the context to not-running.
pub const ASSIST_EXIT: u16 = 0;

/// Builds uop programs with sequential rips.
#[derive(Debug)]
pub struct Assembler {
    base_rip: u64,
    uops: Vec<Uop>,
}

impl Assembler {
    /// Starts a program at the given rip.
    pub const fn new(base_rip: u64) -> Self {
        Self {
            base_rip,
            uops: Vec::new(),
        }
    }

    /// rip of the next emitted instruction.
    pub fn here(&self) -> u64 {
        self.base_rip + (self.uops.len() as u64) * INSN_BYTES as u64
    }

    /// Finishes the program.
    pub fn finish(self) -> Vec<Uop> {
        self.uops
    }

    fn push(&mut self, mut uop: Uop) -> &mut Self {
        uop.rip = self.here();
        uop.bytes = INSN_BYTES;
        uop.som = true;
        uop.eom = true;
        self.uops.push(uop);
        self
    }

    /// `rd = imm`
    pub fn movi(&mut self, rd: ArchReg, imm: i64) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::Mov,
            rd,
            imm,
            rb_imm: true,
            ..Uop::default()
        })
    }

    /// `rd = ra + rb`, setting flags.
    pub fn add(&mut self, rd: ArchReg, ra: ArchReg, rb: ArchReg) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::Add,
            rd,
            ra,
            rb,
            setflags: SETFLAG_ZF | SETFLAG_CF | SETFLAG_OF,
            ..Uop::default()
        })
    }

    /// `rd = ra + imm`, setting flags.
    pub fn addi(&mut self, rd: ArchReg, ra: ArchReg, imm: i64) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::Add,
            rd,
            ra,
            imm,
            rb_imm: true,
            setflags: SETFLAG_ZF | SETFLAG_CF | SETFLAG_OF,
            ..Uop::default()
        })
    }

    /// `rd = ra - rb`, setting flags.
    pub fn sub(&mut self, rd: ArchReg, ra: ArchReg, rb: ArchReg) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::Sub,
            rd,
            ra,
            rb,
            setflags: SETFLAG_ZF | SETFLAG_CF | SETFLAG_OF,
            ..Uop::default()
        })
    }

    /// `rd = ra * rb` (long-latency multiply).
    pub fn mul(&mut self, rd: ArchReg, ra: ArchReg, rb: ArchReg) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::Mul,
            rd,
            ra,
            rb,
            ..Uop::default()
        })
    }

    /// 8-byte load: `rd = [ra + disp]`.
    pub fn ld(&mut self, rd: ArchReg, ra: ArchReg, disp: i64) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::Ld,
            rd,
            ra,
            imm: disp,
            size_shift: 3,
            ..Uop::default()
        })
    }

    /// Load with an explicit size in bytes (1, 2, 4, or 8).
    pub fn ld_sized(&mut self, rd: ArchReg, ra: ArchReg, disp: i64, bytes: u8) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::Ld,
            rd,
            ra,
            imm: disp,
            size_shift: bytes.trailing_zeros() as u8,
            ..Uop::default()
        })
    }

    /// 8-byte store: `[ra + disp] = rc`.
    pub fn st(&mut self, ra: ArchReg, disp: i64, rc: ArchReg) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::St,
            ra,
            rc,
            imm: disp,
            size_shift: 3,
            ..Uop::default()
        })
    }

    /// Store with an explicit size in bytes.
    pub fn st_sized(&mut self, ra: ArchReg, disp: i64, rc: ArchReg, bytes: u8) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::St,
            ra,
            rc,
            imm: disp,
            size_shift: bytes.trailing_zeros() as u8,
            ..Uop::default()
        })
    }

    /// Locked 8-byte load.
    pub fn ld_acq(&mut self, rd: ArchReg, ra: ArchReg, disp: i64) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::LdAcq,
            rd,
            ra,
            imm: disp,
            size_shift: 3,
            ..Uop::default()
        })
    }

    /// Releasing 8-byte store.
    pub fn st_rel(&mut self, ra: ArchReg, disp: i64, rc: ArchReg) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::StRel,
            ra,
            rc,
            imm: disp,
            size_shift: 3,
            ..Uop::default()
        })
    }

    /// Unconditional branch to `target`.
    pub fn bru(&mut self, target: u64) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::Bru,
            imm: target as i64,
            ..Uop::default()
        })
    }

    /// Branch to `target` when `flag` is set.
    pub fn br_set(&mut self, flag: ArchReg, target: u64) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::BrCc,
            ra: flag,
            imm: target as i64,
            ..Uop::default()
        })
    }

    /// Branch to `target` when `flag` is clear.
    pub fn br_clear(&mut self, flag: ArchReg, target: u64) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::BrCc,
            ra: flag,
            imm: target as i64,
            cond_invert: true,
            ..Uop::default()
        })
    }

    /// Memory fence (serializing).
    pub fn fence(&mut self) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::Fence,
            ..Uop::default()
        })
    }

    /// Assist call.
    pub fn assist(&mut self, assist_id: u16) -> &mut Self {
        self.push(Uop {
            opcode: Opcode::Assist,
            assist_id,
            ..Uop::default()
        })
    }

    /// Exit assist: stops the vcpu.
    pub fn exit(&mut self) -> &mut Self {
        self.assist(ASSIST_EXIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_rips() {
        let mut asm = Assembler::new(0x1000);
        asm.movi(ArchReg::Rax, 1).addi(ArchReg::Rax, ArchReg::Rax, 1);
        let uops = asm.finish();
        assert_eq!(uops[0].rip, 0x1000);
        assert_eq!(uops[1].rip, 0x1004);
        assert!(uops.iter().all(|u| u.som && u.eom));
    }

    #[test]
    fn test_here_tracks_position() {
        let mut asm = Assembler::new(0x2000);
        assert_eq!(asm.here(), 0x2000);
        asm.movi(ArchReg::Rbx, 7);
        assert_eq!(asm.here(), 0x2004);
    }
}
