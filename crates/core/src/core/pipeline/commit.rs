//! Commit stage.
//!
//! Retires uops from the ROB head in program order, at most `COMMIT_WIDTH`
//! per cycle and only in whole x86-instruction groups (SOM..EOM): no uop
//! commits until its whole group is ready. Per committing uop: the
//! committed rename table takes the destination (the old mapping becomes
//! pending-free), flags commit to their table slots, stores perform the
//! architectural write honoring the interlock set, branches train the
//! predictor, and the entry's resources return to their pools. A uop that
//! raised an exception stops the group right there, after the uops before
//! it have applied their effects. Assists, SMC, interrupts, and stop
//! requests surface as commit result codes handled by the cycle driver.

use crate::config::COMMIT_WIDTH;
use crate::core::CoreShared;
use crate::core::physreg::{PHYS_REG_NULL, PhysRegId, PhysregState};
use crate::core::pipeline::memory::commit_store_write;
use crate::core::rob::RobState;
use crate::core::thread::{CommitResult, ThreadContext};
use crate::event::{Event, EventKind, EventPayload, NO_INDEX};
use crate::isa::ArchReg;
use crate::isa::regs::flag_value;
use crate::isa::uop::{Opcode, SETFLAG_CF, SETFLAG_OF, SETFLAG_ZF};

/// Runs one commit cycle for a thread.
pub fn commit(thread: &mut ThreadContext, shared: &mut CoreShared) -> CommitResult {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let mut committed = 0usize;
    let mut result = CommitResult::None;

    while committed < COMMIT_WIDTH {
        if thread.rob.is_empty() {
            break;
        }
        let head = thread.rob.head();
        if thread.rob.get(head).state != RobState::ReadyToCommit {
            break;
        }

        // Gather the whole instruction group; commit begins only once
        // every member is ready (whole SOM..EOM groups).
        let mut group = Vec::new();
        let mut complete_group = false;
        for idx in thread.rob.iter_program_order() {
            if thread.rob.get(idx).state != RobState::ReadyToCommit {
                break;
            }
            group.push(idx);
            if thread.rob.get(idx).uop.eom {
                complete_group = true;
                break;
            }
        }
        if !complete_group {
            break;
        }

        // Assists are handled as barriers without committing the uop.
        {
            let e = thread.rob.get(group[0]);
            if e.uop.opcode == Opcode::Assist {
                shared.eventlog.add(Event {
                    uuid: e.uuid,
                    rip: e.uop.rip,
                    rob: group[0],
                    ..Event::at(EventKind::CommitAssist, cycle, tid)
                });
                return CommitResult::Barrier {
                    assist_id: e.uop.assist_id,
                    next_rip: e.uop.next_rip(),
                };
            }
        }

        // Self-modifying code: the backing page went dirty since decode.
        let head_rip = thread.rob.get(group[0]).uop.rip;
        let mfn = head_rip >> 12;
        if shared.decoder.is_dirty(mfn) {
            let e = thread.rob.get(group[0]);
            shared.eventlog.add(Event {
                uuid: e.uuid,
                rip: head_rip,
                rob: group[0],
                ..Event::at(EventKind::CommitSmcDetected, cycle, tid)
            });
            return CommitResult::Smc { mfn };
        }

        // Stores may not commit into a line interlocked by another vcpu.
        let mut locked = false;
        for &idx in &group {
            let e = thread.rob.get(idx);
            if e.uop.opcode.is_store()
                && let Some(lsq_idx) = e.lsq
            {
                let line = thread.lsq.get(lsq_idx).physaddr >> 3;
                if let Some(holder) = shared.interlocks.holder(line)
                    && holder.vcpuid != thread.vcpuid
                {
                    shared.eventlog.add(Event {
                        uuid: e.uuid,
                        rip: e.uop.rip,
                        rob: idx,
                        lsq: lsq_idx,
                        ..Event::at(EventKind::CommitMemLocked, cycle, tid)
                    });
                    locked = true;
                }
            }
        }
        if locked {
            break;
        }

        // Commit uop by uop. An exception stops the group at the faulting
        // uop; earlier members have already applied their effects.
        let mut group_flushed = false;
        for &idx in &group {
            if let Some((exception, virtaddr)) = thread.rob.get(idx).exception {
                let e = thread.rob.get(idx);
                shared.eventlog.add(Event {
                    uuid: e.uuid,
                    rip: e.uop.rip,
                    rob: idx,
                    ..Event::at(EventKind::CommitExceptionDetected, cycle, tid)
                });
                return CommitResult::Exception {
                    exception,
                    virtaddr,
                };
            }
            group_flushed |= commit_one(thread, shared, idx);
            committed += 1;
        }
        result = CommitResult::Ok;

        if thread.handle_interrupt_at_next_eom {
            return CommitResult::Interrupt;
        }
        if thread.stop_at_next_eom {
            return CommitResult::Stop;
        }
        if group_flushed {
            return CommitResult::OkFlush;
        }
    }

    result
}

/// Retires old committed-table mappings: pending-free, then drop the
/// table's reference (which reclaims once the last reference goes).
fn retire_old_mapping(shared: &mut CoreShared, old: PhysRegId, cycle: u64, tid: usize) {
    if old == PHYS_REG_NULL {
        return;
    }
    if shared.physregs.get(old).state != PhysregState::PendingFree {
        shared.physregs.change_state(old, PhysregState::PendingFree);
    }
    shared.unref_physreg(old, cycle, tid);
}

/// Commits one uop. Returns true when the uop serializes (pipeline flush).
fn commit_one(thread: &mut ThreadContext, shared: &mut CoreShared, idx: u16) -> bool {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let e = thread.rob.get(idx).clone();
    let uop = e.uop;
    let mut old_physreg_for_event = PHYS_REG_NULL;

    // Destination: the committed table takes the new physreg.
    if e.has_dest {
        let old = thread.commitrrt.set(uop.rd, e.physreg);
        shared.physregs.addref(e.physreg);
        {
            let reg = shared.physregs.get_mut(e.physreg);
            reg.archreg = uop.rd;
        }
        shared.physregs.change_state(e.physreg, PhysregState::Arch);
        retire_old_mapping(shared, old, cycle, tid);
        old_physreg_for_event = old;
        thread.ctx.set_arch_reg(uop.rd, e.result);
    }

    // Flags commit to their own table slots (same physreg as the dest).
    let flag_regs = [
        (SETFLAG_ZF, ArchReg::Zf),
        (SETFLAG_CF, ArchReg::Cf),
        (SETFLAG_OF, ArchReg::Of),
    ];
    for (bit, reg) in flag_regs {
        if uop.setflags & bit != 0 {
            let old = thread.commitrrt.set(reg, e.physreg);
            shared.physregs.addref(e.physreg);
            if shared.physregs.get(e.physreg).state != PhysregState::Arch {
                shared.physregs.change_state(e.physreg, PhysregState::Arch);
            }
            retire_old_mapping(shared, old, cycle, tid);
            thread.ctx.set_arch_reg(reg, flag_value(e.result_flags, reg));
        }
    }

    // Operand references die with the entry.
    for op in &e.operands {
        shared.unref_physreg(op.physreg, cycle, tid);
    }

    // Stores perform the architectural write; releases drop the interlock.
    if uop.opcode.is_store()
        && let Some(lsq_idx) = e.lsq
    {
        let entry = *thread.lsq.get(lsq_idx);
        if entry.datavalid {
            let physbyte = (entry.physaddr << 3) | (entry.virtaddr & 7);
            commit_store_write(
                thread.ctx.as_mut(),
                physbyte,
                entry.data,
                uop.size_bytes(),
            );
            shared.decoder.notify_write(physbyte);
        }
        if uop.opcode == Opcode::StRel {
            let line = entry.physaddr >> 3;
            if shared.interlocks.release(line, thread.vcpuid) {
                shared.eventlog.add(Event {
                    uuid: e.uuid,
                    rip: uop.rip,
                    rob: idx,
                    lsq: lsq_idx,
                    ..Event::at(EventKind::ReleaseMemLock, cycle, tid)
                });
            }
        }
        thread.stats.stores_committed += 1;
    }
    if uop.opcode.is_load() {
        thread.stats.loads_committed += 1;
    }

    // Branches train the predictor with the resolved outcome.
    if uop.opcode.is_branch() {
        thread.branchpred.update(uop.rip, e.taken, e.result);
        thread.stats.branches_committed += 1;
        if e.mispredicted {
            thread.stats.branch_mispredicts += 1;
        }
    }

    // Uops with no architectural destination release their physreg through
    // the pending-free path; in-flight RS waiters may still reference it.
    if !e.has_dest && uop.setflags == 0 {
        let _ = shared.physregs.mark_pending_free(e.physreg);
        if shared.physregs.get(e.physreg).state == PhysregState::Free {
            shared.stats.physregs_reclaimed += 1;
        }
    }
    shared.physregs.get_mut(e.physreg).rob = None;

    // The instruction pointer commits at EOM.
    let target_rip = if uop.opcode.is_branch() {
        e.result
    } else {
        uop.next_rip()
    };
    if uop.eom {
        thread.ctx.set_arch_reg(ArchReg::Rip, target_rip);
        thread.stats.insns_committed += 1;
    }
    thread.stats.uops_committed += 1;
    thread.last_commit_at_cycle = cycle;

    if e.lsq.is_some() {
        thread.lsq.free_head();
    }
    thread.rob.free_head();

    shared.eventlog.add(Event {
        uuid: e.uuid,
        rip: uop.rip,
        rob: idx,
        physreg: e.physreg,
        lsq: e.lsq.unwrap_or(NO_INDEX),
        payload: EventPayload::Commit {
            data: e.result,
            flags: e.result_flags,
            target_rip,
            total_insns: thread.stats.insns_committed,
            taken: e.taken,
            pred_taken: e.pred_taken,
            old_physreg: old_physreg_for_event,
        },
        ..Event::at(EventKind::CommitOk, cycle, tid)
    });

    // Fences serialize: flush and refetch after the group commits.
    if uop.opcode == Opcode::Fence {
        shared.eventlog.add(Event {
            uuid: e.uuid,
            rip: uop.rip,
            rob: idx,
            ..Event::at(EventKind::CommitFlush, cycle, tid)
        });
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FRONTEND_STAGES, MAX_CLUSTERS};
    use crate::core::pipeline::{fetch, frontend, issue, rename, writeback};
    use crate::ifc::{BtbPredictor, SimContext};
    use crate::isa::asm::Assembler;
    use crate::isa::uop::Uop;

    fn pump_to_commit(
        thread: &mut ThreadContext,
        shared: &mut CoreShared,
        cycles: usize,
    ) -> Vec<CommitResult> {
        let mut results = Vec::new();
        for _ in 0..cycles {
            shared.cycle += 1;
            results.push(commit(thread, shared));
            for c in 0..MAX_CLUSTERS {
                writeback::writeback_cluster(thread, shared, c);
                writeback::transfer_cluster(thread, shared, c);
            }
            for c in 0..MAX_CLUSTERS {
                issue::issue_cluster(std::slice::from_mut(thread), shared, c, 0);
            }
            for c in 0..MAX_CLUSTERS {
                writeback::complete_cluster(thread, shared, c);
            }
            let rc = frontend::dispatch(thread, shared);
            if rc >= 0 {
                frontend::frontend(thread, shared);
                rename::rename(thread, shared);
            }
            fetch::fetch(thread, shared);
        }
        results
    }

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
    fn test_commit_updates_commitrrt_and_context() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.movi(ArchReg::Rax, 42);
        });
        let results = pump_to_commit(&mut thread, &mut shared, 16);

        assert!(results.contains(&CommitResult::Ok));
        assert_eq!(thread.ctx.arch_reg(ArchReg::Rax), 42);
        assert_eq!(thread.stats.insns_committed, 1);
        let mapped = thread.commitrrt.get(ArchReg::Rax);
        assert_ne!(mapped, PHYS_REG_NULL);
        assert_eq!(shared.physregs.get(mapped).state, PhysregState::Arch);
        assert_eq!(thread.ctx.arch_reg(ArchReg::Rip), 0x1004);
    }

    #[test]
    fn test_commit_reclaims_overwritten_mapping() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.movi(ArchReg::Rax, 1).movi(ArchReg::Rax, 2);
        });
        let _ = pump_to_commit(&mut thread, &mut shared, 20);

        assert_eq!(thread.ctx.arch_reg(ArchReg::Rax), 2);
        assert_eq!(thread.stats.insns_committed, 2);
        // Exactly one committed mapping survives for rax
        let mapped = thread.commitrrt.get(ArchReg::Rax);
        assert_eq!(shared.physregs.get(mapped).state, PhysregState::Arch);
    }

    #[test]
    fn test_commit_only_whole_instruction_groups() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.movi(ArchReg::Rax, 1);
        });
        // Force a two-uop instruction: som on the first, eom on the second.
        // Build manually through the decoder program.
        let _ = &mut shared;
        // Rename one uop and mark it non-EOM so the group is incomplete.
        fetch::fetch(&mut thread, &mut shared);
        rename::rename(&mut thread, &mut shared);
        thread.rob.get_mut(0).uop.eom = false;
        for _ in 0..FRONTEND_STAGES {
            frontend::frontend(&mut thread, &mut shared);
        }
        let _ = frontend::dispatch(&mut thread, &mut shared);
        for c in 0..MAX_CLUSTERS {
            issue::issue_cluster(std::slice::from_mut(&mut thread), &mut shared, c, 0);
        }
        for c in 0..MAX_CLUSTERS {
            writeback::complete_cluster(&mut thread, &mut shared, c);
        }
        for _ in 0..3 {
            for c in 0..MAX_CLUSTERS {
                writeback::transfer_cluster(&mut thread, &mut shared, c);
                writeback::writeback_cluster(&mut thread, &mut shared, c);
            }
        }
        assert_eq!(thread.rob.get(0).state, RobState::ReadyToCommit);
        // EOM never arrives: nothing commits
        assert_eq!(commit(&mut thread, &mut shared), CommitResult::None);
        assert_eq!(thread.stats.uops_committed, 0);
    }

    #[test]
    fn test_store_commits_to_memory() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.movi(ArchReg::Rax, 0x100)
                .movi(ArchReg::Rbx, 0x5a5a)
                .st(ArchReg::Rax, 0, ArchReg::Rbx);
        });
        let _ = pump_to_commit(&mut thread, &mut shared, 24);
        assert_eq!(thread.stats.stores_committed, 1);
        assert_eq!(thread.ctx.read_phys(0x100 >> 3), 0x5a5a);
    }

    #[test]
    fn test_exception_mid_group_commits_earlier_uops() {
        // One two-uop instruction: the SOM uop writes rbx, the EOM load
        // faults. The group halts at the faulting uop, with the first
        // uop's effect already architectural.
        let program = [
            Uop {
                opcode: Opcode::Mov,
                rd: ArchReg::Rbx,
                imm: 0x11,
                rb_imm: true,
                som: true,
                eom: false,
                bytes: 2,
                rip: 0x1000,
                ..Uop::default()
            },
            Uop {
                opcode: Opcode::Ld,
                rd: ArchReg::Rcx,
                ra: ArchReg::Rax,
                imm: 0x7fff_0000, // beyond memory: page fault at issue
                size_shift: 3,
                som: false,
                eom: true,
                bytes: 2,
                rip: 0x1002,
                ..Uop::default()
            },
        ];
        let mut shared = CoreShared::for_tests(&program);
        let mut thread = ThreadContext::new(
            0,
            Box::new(SimContext::new(0, 65536, 0x1000)),
            Box::new(BtbPredictor::new()),
        );

        let results = pump_to_commit(&mut thread, &mut shared, 24);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, CommitResult::Exception { .. }))
        );
        // The uop before the fault committed; the group never reached EOM
        assert_eq!(thread.ctx.arch_reg(ArchReg::Rbx), 0x11);
        assert_eq!(thread.stats.uops_committed, 1);
        assert_eq!(thread.stats.insns_committed, 0);
        // The faulting uop's destination never became architectural
        assert_eq!(thread.ctx.arch_reg(ArchReg::Rcx), 0);
    }

    #[test]
    fn test_fence_returns_ok_flush() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.fence();
        });
        let results = pump_to_commit(&mut thread, &mut shared, 16);
        assert!(results.contains(&CommitResult::OkFlush));
    }

    #[test]
    fn test_assist_surfaces_barrier() {
        let (mut thread, mut shared) = setup(|asm| {
            asm.exit();
        });
        let results = pump_to_commit(&mut thread, &mut shared, 16);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, CommitResult::Barrier { assist_id: 0, .. }))
        );
        // The assist uop itself never commits
        assert_eq!(thread.stats.uops_committed, 0);
    }
}
