//! Pipeline stages.
//!
//! One module per stage, each a free function over the owning
//! [`ThreadContext`](crate::core::thread::ThreadContext) and the core's
//! shared structures, in dataflow order: fetch, rename, frontend/dispatch,
//! issue, the load/store unit, complete/transfer/writeback, commit, and the
//! annulment/redispatch recovery paths.

/// Misspeculation annulment and dependent redispatch.
pub mod annul;
/// In-order commit.
pub mod commit;
/// Instruction fetch from the decoder's basic blocks.
pub mod fetch;
/// Frontend delay pipeline and cluster dispatch.
pub mod frontend;
/// Issue: operand readiness, FU selection, functional execution.
pub mod issue;
/// Load/store unit: addresses, forwarding, aliasing, interlocks.
pub mod memory;
/// Rename: ROB/physreg/LSQ allocation and rename table update.
pub mod rename;
/// Complete, forward/transfer, and writeback.
pub mod writeback;

use crate::core::physreg::{PHYS_REG_NULL, PhysicalRegisterFile};
use crate::core::rob::Operand;
use crate::ifc::Context;
use crate::isa::regs::{ArchReg, FLAG_CF, FLAG_OF, FLAG_ZF};

/// Reads an operand's value and flags. The null physreg reads the committed
/// architectural state through the operand's register tag.
pub(crate) fn read_operand(
    physregs: &PhysicalRegisterFile,
    ctx: &dyn Context,
    op: &Operand,
) -> (u64, u8) {
    if op.physreg == PHYS_REG_NULL {
        let data = ctx.arch_reg(op.archreg);
        let flags = match op.archreg {
            ArchReg::Zf if data != 0 => FLAG_ZF,
            ArchReg::Cf if data != 0 => FLAG_CF,
            ArchReg::Of if data != 0 => FLAG_OF,
            _ => 0,
        };
        (data, flags)
    } else {
        let reg = physregs.get(op.physreg);
        (reg.data, reg.flags)
    }
}
