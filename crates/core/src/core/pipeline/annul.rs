//! Misspeculation annulment and dependent redispatch.
//!
//! Annulment removes misspeculated uops: walking back from the youngest
//! ROB entry, each annulled entry rewinds the speculative rename table from
//! its saved old mappings, drops its operand references, releases its LSQ
//! slot, LFRQ slot, interlock, and issue queue slot, frees its destination
//! physreg, and returns to the free list. The fetch queue is drained and
//! the return address stack repaired.
//!
//! Redispatch keeps a replayed uop and its dependents consistent without
//! killing them: resources are retained (ROB entry, physreg, LSQ slot) but
//! issue state is reset and the entries return to ready-to-dispatch.
//! Direct dependents are found through the destination physregs of the
//! marked set; the transitive closure falls out of a single program-order
//! walk.

use crate::core::CoreShared;
use crate::core::physreg::PHYS_REG_NULL;
use crate::core::rob::{Operand, RobState};
use crate::core::thread::ThreadContext;
use crate::event::{Event, EventKind, EventPayload};
use crate::isa::ArchReg;
use crate::isa::uop::{SETFLAG_CF, SETFLAG_OF, SETFLAG_ZF};

/// Annuls every entry younger than `after_idx` (exclusive), walking from
/// the tail. Also drains the fetch queue and repairs the RAS.
pub fn annul_after(thread: &mut ThreadContext, shared: &mut CoreShared, after_idx: u16) {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let (uuid, rip) = {
        let e = thread.rob.get(after_idx);
        (e.uuid, e.uop.rip)
    };

    let victims: Vec<u16> = thread
        .rob
        .iter_reverse()
        .take_while(|&idx| idx != after_idx)
        .collect();

    if victims.is_empty() {
        shared.eventlog.add(Event {
            uuid,
            rip,
            rob: after_idx,
            ..Event::at(EventKind::AnnulNoFutureUops, cycle, tid)
        });
    } else {
        shared.eventlog.add(Event {
            uuid,
            rip,
            rob: after_idx,
            payload: EventPayload::Annul {
                startidx: *victims.last().unwrap_or(&after_idx),
                endidx: victims[0],
            },
            ..Event::at(EventKind::AnnulMisspeculation, cycle, tid)
        });
        for idx in victims {
            annul_one(thread, shared, idx);
            thread.rob.retract(idx);
        }
    }

    drain_fetchq(thread, shared);
}

/// Annuls from the start of the x86 instruction containing `rob_idx`
/// through the tail, and redirects fetch to re-execute that instruction.
pub fn annul_from_instruction(thread: &mut ThreadContext, shared: &mut CoreShared, rob_idx: u16) {
    let cycle = shared.cycle;
    let tid = thread.threadid;

    // Find the SOM uop of the instruction.
    let mut start = rob_idx;
    for idx in thread.rob.iter_reverse().skip_while(|&i| i != rob_idx) {
        start = idx;
        if thread.rob.get(idx).uop.som {
            break;
        }
    }
    let refetch_rip = thread.rob.get(start).uop.rip;
    let (uuid, rip) = {
        let e = thread.rob.get(rob_idx);
        (e.uuid, e.uop.rip)
    };

    // Victims: everything from the tail back to `start`, inclusive.
    let mut annulled = Vec::new();
    for idx in thread.rob.iter_reverse() {
        annulled.push(idx);
        if idx == start {
            break;
        }
    }

    shared.eventlog.add(Event {
        uuid,
        rip,
        rob: rob_idx,
        payload: EventPayload::Annul {
            startidx: start,
            endidx: annulled.first().copied().unwrap_or(start),
        },
        ..Event::at(EventKind::AnnulMisspeculation, cycle, tid)
    });

    for idx in annulled {
        annul_one(thread, shared, idx);
        thread.rob.retract(idx);
    }

    drain_fetchq(thread, shared);
    thread.redirect_fetch(refetch_rip);
}

/// Drains fetched-but-not-renamed uops and repairs the RAS.
fn drain_fetchq(thread: &mut ThreadContext, shared: &mut CoreShared) {
    if let Some(front) = thread.fetchq.front() {
        shared.eventlog.add(Event {
            uuid: front.uuid,
            rip: front.uop.rip,
            ..Event::at(EventKind::AnnulFetchq, shared.cycle, thread.threadid)
        });
    }
    thread.fetchq.clear();
    thread.branchpred.annul_ras();
}

/// Annuls one entry: rename rewind, reference drops, resource release.
/// The caller retracts the ROB slot afterwards.
fn annul_one(thread: &mut ThreadContext, shared: &mut CoreShared, idx: u16) {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let e = thread.rob.get(idx).clone();

    // Rewind the speculative rename table. Younger entries were annulled
    // first, so each slot currently maps to this entry's physreg.
    if e.has_dest {
        let replaced = thread.specrrt.set(e.uop.rd, e.old_physreg);
        debug_assert_eq!(replaced, e.physreg);
        shared.physregs.addref(e.old_physreg);
        shared.unref_physreg(e.physreg, cycle, tid);
    }
    let flag_regs = [
        (SETFLAG_ZF, ArchReg::Zf),
        (SETFLAG_CF, ArchReg::Cf),
        (SETFLAG_OF, ArchReg::Of),
    ];
    for (i, (bit, reg)) in flag_regs.into_iter().enumerate() {
        if e.uop.setflags & bit != 0
            && let Some(old) = e.old_flag_physregs[i]
        {
            let replaced = thread.specrrt.set(reg, old);
            debug_assert_eq!(replaced, e.physreg);
            shared.physregs.addref(old);
            shared.unref_physreg(e.physreg, cycle, tid);
        }
    }

    // Drop operand references.
    for op in &e.operands {
        shared.unref_physreg(op.physreg, cycle, tid);
    }

    // Release occupied resources.
    if e.state.in_issue_queue()
        && let Some(cluster) = e.cluster
    {
        shared.issueqs[cluster as usize].remove(tid);
    }
    if let Some(slot) = e.lfrq_slot {
        shared.caches.cancel_fill(slot);
    }
    if e.lock_acquired
        && let Some(lsq_idx) = e.lsq
    {
        let line = thread.lsq.get(lsq_idx).physaddr >> 3;
        let _ = shared.interlocks.release(line, thread.vcpuid);
    }
    if let Some(lsq_idx) = e.lsq {
        thread.lsq.retract(lsq_idx);
    }

    // Free the destination physreg; every reference is gone by now.
    shared.physregs.get_mut(e.physreg).rob = None;
    shared.physregs.free(e.physreg);

    shared.eventlog.add(Event {
        uuid: e.uuid,
        rip: e.uop.rip,
        rob: idx,
        physreg: e.physreg,
        lsq: e.lsq.unwrap_or(crate::event::NO_INDEX),
        ..Event::at(EventKind::AnnulEachRob, cycle, tid)
    });
    thread.stats.uops_annulled += 1;
}

/// Resets one entry's issue state and returns it to ready-to-dispatch.
/// Resources (ROB entry, physreg, LSQ slot) are kept.
fn redispatch_one(
    thread: &mut ThreadContext,
    shared: &mut CoreShared,
    idx: u16,
    dependent_operands: u8,
) {
    let cycle = shared.cycle;
    let tid = thread.threadid;

    let (uuid, rip, state, cluster, lfrq_slot, lock_acquired, lsq, rs_phys) = {
        let e = thread.rob.get(idx);
        (
            e.uuid,
            e.uop.rip,
            e.state,
            e.cluster,
            e.lfrq_slot,
            e.lock_acquired,
            e.lsq,
            e.operands[crate::core::rob::OPERAND_RS].physreg,
        )
    };

    if state.in_issue_queue()
        && let Some(cluster) = cluster
    {
        shared.issueqs[cluster as usize].remove(tid);
    }
    if let Some(slot) = lfrq_slot {
        shared.caches.cancel_fill(slot);
    }
    if lock_acquired
        && let Some(lsq_idx) = lsq
    {
        let line = thread.lsq.get(lsq_idx).physaddr >> 3;
        let _ = shared.interlocks.release(line, thread.vcpuid);
    }
    // Drop any inherited store dependency; the rescan will rebuild it.
    if rs_phys != PHYS_REG_NULL {
        shared.unref_physreg(rs_phys, cycle, tid);
        thread.rob.get_mut(idx).operands[crate::core::rob::OPERAND_RS] = Operand::default();
        shared.physregs.addref(PHYS_REG_NULL);
    }
    if let Some(lsq_idx) = lsq {
        let entry = thread.lsq.get_mut(lsq_idx);
        entry.addrvalid = false;
        entry.datavalid = false;
        entry.sfr_data = 0;
        entry.sfr_mask = 0;
    }

    {
        let e = thread.rob.get_mut(idx);
        e.cycles_left = 0;
        e.forward_cycle = 0;
        e.issued = false;
        e.load_store_second_phase = false;
        e.lock_acquired = false;
        e.lfrq_slot = None;
        e.mispredicted = false;
        e.cluster = None;
        e.dep_mark = false;
    }
    thread.rob.set_state(idx, RobState::ReadyToDispatch);

    shared.eventlog.add(Event {
        uuid,
        rip,
        rob: idx,
        payload: EventPayload::Redispatch {
            count: 0,
            dependent_operands,
        },
        ..Event::at(EventKind::RedispatchEachRob, cycle, tid)
    });
    thread.stats.uops_redispatched += 1;
}

/// States eligible for redispatch: in the issue window, executing, or
/// waiting on a miss. Completed results are kept.
fn redispatchable(state: RobState) -> bool {
    state.in_issue_queue() || matches!(state, RobState::Issued(_) | RobState::CacheMiss)
}

/// Returns a replaying uop and every transitively dependent younger uop to
/// ready-to-dispatch.
pub fn redispatch_dependents(thread: &mut ThreadContext, shared: &mut CoreShared, root_idx: u16) {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let (uuid, rip) = {
        let e = thread.rob.get(root_idx);
        (e.uuid, e.uop.rip)
    };
    shared.eventlog.add(Event {
        uuid,
        rip,
        rob: root_idx,
        ..Event::at(EventKind::RedispatchDependents, cycle, tid)
    });

    // Single program-order walk: an entry is dependent when any operand is
    // produced by an already-marked entry.
    let mut marked_physregs = vec![thread.rob.get(root_idx).physreg];
    let mut work: Vec<(u16, u8)> = vec![(root_idx, 0)];
    let order: Vec<u16> = thread
        .rob
        .iter_program_order()
        .skip_while(|&i| i != root_idx)
        .skip(1)
        .collect();
    for idx in order {
        let e = thread.rob.get(idx);
        let mut dependent_operands = 0u8;
        for (slot, op) in e.operands.iter().enumerate() {
            if op.physreg != PHYS_REG_NULL && marked_physregs.contains(&op.physreg) {
                dependent_operands |= 1 << slot;
            }
        }
        if dependent_operands != 0 {
            marked_physregs.push(e.physreg);
            work.push((idx, dependent_operands));
        }
    }

    let mut count = 0u16;
    for (idx, deps) in work {
        if redispatchable(thread.rob.get(idx).state) {
            redispatch_one(thread, shared, idx, deps);
            count += 1;
        }
    }

    shared.eventlog.add(Event {
        uuid,
        rip,
        rob: root_idx,
        payload: EventPayload::Redispatch {
            count: count.saturating_sub(1),
            dependent_operands: 0,
        },
        ..Event::at(EventKind::RedispatchDone, cycle, tid)
    });
}

/// Deadlock recovery: returns every redispatchable in-flight uop to
/// ready-to-dispatch.
pub fn redispatch_all(thread: &mut ThreadContext, shared: &mut CoreShared) {
    for idx in thread.rob.iter_program_order().collect::<Vec<_>>() {
        if redispatchable(thread.rob.get(idx).state) {
            redispatch_one(thread, shared, idx, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FRONTEND_STAGES;
    use crate::core::pipeline::{fetch, frontend, rename};
    use crate::core::physreg::PhysregState;
    use crate::ifc::{BtbPredictor, SimContext};
    use crate::isa::asm::Assembler;

    fn renamed(build: impl FnOnce(&mut Assembler)) -> (ThreadContext, CoreShared) {
        let mut asm = Assembler::new(0x1000);
        build(&mut asm);
        let shared = CoreShared::for_tests(&asm.finish());
        let thread = ThreadContext::new(
            0,
            Box::new(SimContext::new(0, 65536, 0x1000)),
            Box::new(BtbPredictor::new()),
        );
        let mut pair = (thread, shared);
        fetch::fetch(&mut pair.0, &mut pair.1);
        rename::rename(&mut pair.0, &mut pair.1);
        pair
    }

    #[test]
    fn test_annul_after_rewinds_rename_table() {
        let (mut thread, mut shared) = renamed(|asm| {
            asm.movi(ArchReg::Rax, 1)
                .movi(ArchReg::Rax, 2)
                .movi(ArchReg::Rax, 3);
        });
        let first = thread.rob.get(0).physreg;
        let second = thread.rob.get(1).physreg;
        let third = thread.rob.get(2).physreg;

        annul_after(&mut thread, &mut shared, 0);

        assert_eq!(thread.rob.len(), 1);
        assert_eq!(thread.specrrt.get(ArchReg::Rax), first);
        assert_eq!(shared.physregs.get(second).state, PhysregState::Free);
        assert_eq!(shared.physregs.get(third).state, PhysregState::Free);
        assert_eq!(thread.stats.uops_annulled, 2);
    }

    #[test]
    fn test_annul_completeness() {
        let (mut thread, mut shared) = renamed(|asm| {
            for i in 0..6 {
                asm.movi(ArchReg::Rax, i);
            }
        });
        annul_after(&mut thread, &mut shared, 1);
        // No entry younger than rob 1 remains on any non-free list
        assert_eq!(thread.rob.len(), 2);
        thread.rob.check();
        for idx in thread.rob.iter_program_order() {
            assert!(idx <= 1);
        }
    }

    #[test]
    fn test_annul_from_instruction_refetches_it() {
        let (mut thread, mut shared) = renamed(|asm| {
            asm.movi(ArchReg::Rax, 1)
                .ld(ArchReg::Rbx, ArchReg::Rax, 0)
                .movi(ArchReg::Rcx, 3);
        });
        annul_from_instruction(&mut thread, &mut shared, 1);
        assert_eq!(thread.rob.len(), 1);
        assert_eq!(thread.fetchrip, 0x1004);
        assert!(thread.lsq.is_empty());
    }

    #[test]
    fn test_annul_nothing_younger() {
        let (mut thread, mut shared) = renamed(|asm| {
            asm.movi(ArchReg::Rax, 1);
        });
        annul_after(&mut thread, &mut shared, 0);
        assert_eq!(thread.rob.len(), 1);
    }

    #[test]
    fn test_redispatch_dependents_marks_transitive_closure() {
        let (mut thread, mut shared) = renamed(|asm| {
            asm.movi(ArchReg::Rax, 1) // 0: root
                .addi(ArchReg::Rbx, ArchReg::Rax, 1) // 1: direct dep
                .addi(ArchReg::Rcx, ArchReg::Rbx, 1) // 2: transitive dep
                .movi(ArchReg::Rdx, 9); // 3: independent
        });
        // Put everything into a redispatchable state
        for _ in 0..FRONTEND_STAGES {
            frontend::frontend(&mut thread, &mut shared);
        }
        let _ = frontend::dispatch(&mut thread, &mut shared);

        redispatch_dependents(&mut thread, &mut shared, 0);

        assert_eq!(thread.rob.get(0).state, RobState::ReadyToDispatch);
        assert_eq!(thread.rob.get(1).state, RobState::ReadyToDispatch);
        assert_eq!(thread.rob.get(2).state, RobState::ReadyToDispatch);
        // The independent uop keeps its place in the issue window
        assert!(thread.rob.get(3).state.in_issue_queue());
        assert_eq!(thread.stats.uops_redispatched, 3);
    }

    #[test]
    fn test_redispatch_all_returns_window_to_dispatch() {
        let (mut thread, mut shared) = renamed(|asm| {
            asm.movi(ArchReg::Rax, 1).movi(ArchReg::Rbx, 2);
        });
        for _ in 0..FRONTEND_STAGES {
            frontend::frontend(&mut thread, &mut shared);
        }
        let _ = frontend::dispatch(&mut thread, &mut shared);
        redispatch_all(&mut thread, &mut shared);

        for idx in [0u16, 1] {
            assert_eq!(thread.rob.get(idx).state, RobState::ReadyToDispatch);
        }
        // Issue queue slots returned
        assert_eq!(
            shared.issueqs.iter().map(|q| q.total()).sum::<usize>(),
            0
        );
    }
}
