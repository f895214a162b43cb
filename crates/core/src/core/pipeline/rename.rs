//! Rename stage.
//!
//! Pulls uops from the fetch queue while every needed resource is free:
//! 1. Allocate the ROB entry (`free -> frontend`).
//! 2. Allocate the destination physreg (`free -> waiting`).
//! 3. Capture source operands from the speculative rename table *before*
//!    the destination update, so a uop reading its own destination sees
//!    the previous producer.
//! 4. Save the old destination (and flag) mappings for commit-time free and
//!    annulment rewind, then point the speculative table at the new physreg.
//! 5. Allocate and link the LSQ slot for memory uops.
//!
//! Any exhausted resource (ROB, physregs, LSQ, issue queue) emits its FULL
//! event and stalls rename for the rest of the cycle with no state mutated.
//! The issue queue gate checks that some cluster capable of executing the
//! uop can still accept this thread; the slot itself is claimed at dispatch
//! when the cluster is chosen.

use crate::config::{FRONTEND_STAGES, FRONTEND_WIDTH, MAX_CLUSTERS};
use crate::core::CoreShared;
use crate::core::physreg::PHYS_REG_NULL;
use crate::core::rob::{OPERAND_RA, OPERAND_RB, OPERAND_RC, Operand};
use crate::core::thread::ThreadContext;
use crate::event::{Event, EventKind, EventPayload, NO_INDEX};
use crate::isa::ArchReg;
use crate::isa::uop::{SETFLAG_CF, SETFLAG_OF, SETFLAG_ZF};

/// Runs one rename cycle for a thread.
pub fn rename(thread: &mut ThreadContext, shared: &mut CoreShared) {
    let cycle = shared.cycle;
    let tid = thread.threadid;

    for _ in 0..FRONTEND_WIDTH {
        let Some(front) = thread.fetchq.front() else {
            shared
                .eventlog
                .add(Event::at(EventKind::RenameFetchqEmpty, cycle, tid));
            break;
        };
        let uop = front.uop;

        if thread.rob.is_full() {
            shared
                .eventlog
                .add(Event::at(EventKind::RenameRobFull, cycle, tid));
            thread.stats.rob_full_stalls += 1;
            break;
        }
        if shared.physregs.free_count() == 0 {
            shared
                .eventlog
                .add(Event::at(EventKind::RenamePhysregsFull, cycle, tid));
            thread.stats.physregs_full_stalls += 1;
            break;
        }
        if uop.opcode.is_mem() && thread.lsq.is_full() {
            shared
                .eventlog
                .add(Event::at(EventKind::RenameLsqFull, cycle, tid));
            thread.stats.lsq_full_stalls += 1;
            break;
        }
        let capable = shared.luts.executable_on_cluster(uop.opcode);
        let iq_has_room = (0..MAX_CLUSTERS)
            .any(|c| capable & (1 << c) != 0 && shared.issueqs[c].can_insert(tid));
        if !iq_has_room {
            shared
                .eventlog
                .add(Event::at(EventKind::RenameIqFull, cycle, tid));
            thread.stats.iq_full_stalls += 1;
            break;
        }

        let Some(entry) = thread.fetchq.pop_front() else {
            break;
        };
        let Some(rob_idx) = thread.rob.alloc() else {
            break;
        };
        let Some(physreg) = shared.physregs.alloc(tid as u8) else {
            break;
        };
        shared.physregs.get_mut(physreg).rob = Some(rob_idx);

        // Source operands, captured before the destination update.
        let mut operands = [Operand::default(); 4];
        operands[OPERAND_RA] = Operand {
            physreg: thread.specrrt.get(uop.ra),
            archreg: uop.ra,
        };
        operands[OPERAND_RB] = if uop.rb_imm {
            Operand::default() // immediate: reads the null register
        } else {
            Operand {
                physreg: thread.specrrt.get(uop.rb),
                archreg: uop.rb,
            }
        };
        operands[OPERAND_RC] = Operand {
            physreg: thread.specrrt.get(uop.rc),
            archreg: uop.rc,
        };
        // RS starts on the null register; the load/store unit installs an
        // inherited store dependency there when needed.
        for op in &operands {
            shared.physregs.addref(op.physreg);
        }

        // Destination rename.
        let has_dest = uop.rd != ArchReg::Zero;
        let mut old_physreg = PHYS_REG_NULL;
        if has_dest {
            old_physreg = thread.specrrt.set(uop.rd, physreg);
            shared.physregs.addref(physreg);
            shared.unref_physreg(old_physreg, cycle, tid);
        }

        // Flags rename to the same destination physreg.
        let mut old_flag_physregs = [None; 3];
        let flag_regs = [
            (SETFLAG_ZF, ArchReg::Zf),
            (SETFLAG_CF, ArchReg::Cf),
            (SETFLAG_OF, ArchReg::Of),
        ];
        for (i, (bit, reg)) in flag_regs.into_iter().enumerate() {
            if uop.setflags & bit != 0 {
                let old = thread.specrrt.set(reg, physreg);
                old_flag_physregs[i] = Some(old);
                shared.physregs.addref(physreg);
                shared.unref_physreg(old, cycle, tid);
            }
        }

        // LSQ slot for memory uops.
        let lsq = if uop.opcode.is_mem() {
            thread.lsq.alloc(rob_idx, !uop.opcode.is_load())
        } else {
            None
        };

        let e = thread.rob.get_mut(rob_idx);
        e.uop = uop;
        e.uuid = entry.uuid;
        e.operands = operands;
        e.physreg = physreg;
        e.old_physreg = old_physreg;
        e.has_dest = has_dest;
        e.old_flag_physregs = old_flag_physregs;
        e.lsq = lsq;
        e.predrip = entry.predrip;
        e.pred_taken = entry.pred_taken;
        e.cycles_left = FRONTEND_STAGES;

        shared.eventlog.add(Event {
            uuid: entry.uuid,
            rip: uop.rip,
            rob: rob_idx,
            physreg,
            lsq: lsq.unwrap_or(NO_INDEX),
            payload: EventPayload::Rename {
                operands: [
                    operands[0].physreg,
                    operands[1].physreg,
                    operands[2].physreg,
                    operands[3].physreg,
                ],
                old_physreg,
                old_flags: old_flag_physregs.map(|o| o.unwrap_or(PHYS_REG_NULL)),
            },
            ..Event::at(EventKind::RenameOk, cycle, tid)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::fetch;
    use crate::core::rob::OPERAND_RA;
    use crate::ifc::{BtbPredictor, SimContext};
    use crate::isa::asm::Assembler;

    fn setup(build: impl FnOnce(&mut Assembler)) -> (ThreadContext, CoreShared) {
        let mut asm = Assembler::new(0x1000);
        build(&mut asm);
        let shared = CoreShared::for_tests(&asm.finish());
        let thread = ThreadContext::new(
            0,
            Box::new(SimContext::new(0, 65536, 0x1000)),
            Box::new(BtbPredictor::new()),
        );
        (thread, shared)
    }

    #[test]
    fn test_rename_allocates_and_maps() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.movi(ArchReg::Rax, 5);
        });
        fetch::fetch(&mut thread, &mut shared);
        rename(&mut thread, &mut shared);

        assert_eq!(thread.rob.len(), 1);
        let e = thread.rob.get(0).clone();
        assert!(e.has_dest);
        assert_ne!(e.physreg, PHYS_REG_NULL);
        assert_eq!(thread.specrrt.get(ArchReg::Rax), e.physreg);
        assert_eq!(e.old_physreg, PHYS_REG_NULL);
        // Commit table untouched until commit
        assert_eq!(thread.commitrrt.get(ArchReg::Rax), PHYS_REG_NULL);
    }

    #[test]
    fn test_rename_captures_sources_before_dest() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.movi(ArchReg::Rax, 1).addi(ArchReg::Rax, ArchReg::Rax, 1);
        });
        fetch::fetch(&mut thread, &mut shared);
        rename(&mut thread, &mut shared);

        let first = thread.rob.get(0).physreg;
        let second = thread.rob.get(1).clone();
        // The add's RA operand must see the mov's physreg, not its own dest
        assert_eq!(second.operands[OPERAND_RA].physreg, first);
        assert_ne!(second.physreg, first);
        assert_eq!(thread.specrrt.get(ArchReg::Rax), second.physreg);
        assert_eq!(second.old_physreg, first);
    }

    #[test]
    fn test_rename_flags_alias_dest_physreg() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.addi(ArchReg::Rbx, ArchReg::Rbx, 1);
        });
        fetch::fetch(&mut thread, &mut shared);
        rename(&mut thread, &mut shared);

        let e = thread.rob.get(0).clone();
        assert_eq!(thread.specrrt.get(ArchReg::Zf), e.physreg);
        assert_eq!(thread.specrrt.get(ArchReg::Cf), e.physreg);
        assert_eq!(thread.specrrt.get(ArchReg::Of), e.physreg);
        // Dest + 3 flags worth of references
        assert_eq!(shared.physregs.get(e.physreg).refcount, 4);
    }

    #[test]
    fn test_rename_allocates_lsq_for_memory_uops() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.ld(ArchReg::Rax, ArchReg::Rbx, 0)
                .st(ArchReg::Rbx, 8, ArchReg::Rax);
        });
        fetch::fetch(&mut thread, &mut shared);
        rename(&mut thread, &mut shared);

        assert_eq!(thread.lsq.len(), 2);
        let ld = thread.rob.get(0).lsq.unwrap();
        let st = thread.rob.get(1).lsq.unwrap();
        assert!(!thread.lsq.get(ld).store);
        assert!(thread.lsq.get(st).store);
    }

    #[test]
    fn test_rename_stalls_when_issue_queues_full() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.movi(ArchReg::Rax, 1);
        });
        fetch::fetch(&mut thread, &mut shared);
        // Thread 0 exhausts its share of every cluster's issue queue after
        // the fetch (fetch has its own quota gate)
        for iq in &mut shared.issueqs {
            while iq.insert(0) {}
        }
        rename(&mut thread, &mut shared);

        // Nothing was allocated on the failing step
        assert!(thread.rob.is_empty());
        assert_eq!(thread.fetchq.len(), 1);
        assert!(thread.stats.iq_full_stalls > 0);
    }

    #[test]
    fn test_rename_stalls_when_rob_full() {
        let (mut thread, mut shared) = setup(|asm| {
            for _ in 0..80 {
                asm.movi(ArchReg::Rax, 1);
            }
        });
        for _ in 0..40 {
            fetch::fetch(&mut thread, &mut shared);
            rename(&mut thread, &mut shared);
        }
        assert_eq!(thread.rob.len(), crate::config::ROB_SIZE);
        assert!(thread.stats.rob_full_stalls > 0);
    }
}
