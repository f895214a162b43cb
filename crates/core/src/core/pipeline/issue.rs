//! Issue stage.
//!
//! Per cluster, walks the ready lists (stores, then loads, then ALU and
//! branch uops) across threads in round-robin order, issuing up to the
//! cluster's width. A candidate issues when every gated source operand is
//! readable from this cluster and a capable functional unit is free; the
//! lowest-index available FU is claimed and its bit cleared from the
//! per-cycle availability mask. Non-memory uops execute functionally at
//! issue; branches compare the computed target against the prediction and
//! flag annulment for writeback.

use crate::config::{MAX_LOADS_PER_CYCLE, MAX_THREADS_PER_CORE};
use crate::core::CoreShared;
use crate::core::clusters::{CLUSTERS, fuinfo};
use crate::core::pipeline::memory::{self, MemIssueResult};
use crate::core::pipeline::read_operand;
use crate::core::physreg::PHYS_REG_NULL;
use crate::core::rob::{OPERAND_RA, OPERAND_RB, OPERAND_RC, OPERAND_RS, RobState};
use crate::core::thread::ThreadContext;
use crate::event::{Event, EventKind, EventPayload};
use crate::isa::uop::execute;

/// Operand readiness with the load/store phase gating:
/// stores need RA/RB to compute the address, then RC (data) and RS in the
/// second phase; loads need RA/RB/RC, then RS in the second phase; all
/// other uops need every operand.
fn ready_to_issue(thread: &ThreadContext, shared: &CoreShared, idx: u16, cluster: usize) -> bool {
    let e = thread.rob.get(idx);
    let ready = |slot: usize| {
        let phys = e.operands[slot].physreg;
        phys == PHYS_REG_NULL || shared.physregs.get(phys).ready_in_cluster(cluster)
    };

    let (ra, rb, rc, rs) = (
        ready(OPERAND_RA),
        ready(OPERAND_RB),
        ready(OPERAND_RC),
        ready(OPERAND_RS),
    );
    if e.uop.opcode.is_store() {
        if e.load_store_second_phase {
            ra && rb && rc && rs
        } else {
            ra && rb
        }
    } else if e.uop.opcode.is_load() {
        if e.load_store_second_phase {
            ra && rb && rc && rs
        } else {
            ra && rb && rc
        }
    } else {
        ra && rb && rc && rs
    }
}

/// Issues as many ready uops as the cluster's FUs allow this cycle.
pub fn issue_cluster(
    threads: &mut [ThreadContext],
    shared: &mut CoreShared,
    cluster: usize,
    start_tid: usize,
) {
    let width = CLUSTERS[cluster].issue_width;
    let mut issued = 0usize;

    let list_kinds = [
        RobState::ReadyToStore(cluster as u8),
        RobState::ReadyToLoad(cluster as u8),
        RobState::ReadyToIssue(cluster as u8),
    ];

    for list_state in list_kinds {
        for offset in 0..MAX_THREADS_PER_CORE.min(threads.len()) {
            let tid = (start_tid + offset) % threads.len();
            if !threads[tid].ctx.running() {
                continue;
            }
            for idx in threads[tid].rob.list_indices(list_state) {
                if issued >= width {
                    return;
                }
                // Recovery inside an earlier candidate may have annulled or
                // redispatched this one; skip stale snapshot entries.
                if !threads[tid].rob.get(idx).entry_valid
                    || threads[tid].rob.get(idx).state != list_state
                {
                    continue;
                }
                if issue_one(&mut threads[tid], shared, idx, cluster) {
                    issued += 1;
                }
            }
        }
    }
}

/// Attempts to issue one candidate. Returns true when an FU was consumed.
fn issue_one(
    thread: &mut ThreadContext,
    shared: &mut CoreShared,
    idx: u16,
    cluster: usize,
) -> bool {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let (uop, uuid) = {
        let e = thread.rob.get(idx);
        (e.uop, e.uuid)
    };

    if !ready_to_issue(thread, shared, idx, cluster) {
        return false;
    }
    // Load port and per-cycle load count gating.
    if uop.opcode.is_load() && thread.loads_in_this_cycle >= MAX_LOADS_PER_CYCLE {
        return false;
    }

    let usable = fuinfo(uop.opcode).fu & shared.fu_avail & CLUSTERS[cluster].fu_mask;
    if usable == 0 {
        shared.eventlog.add(Event {
            uuid,
            rip: uop.rip,
            rob: idx,
            cluster: cluster as i8,
            ..Event::at(EventKind::IssueNoFu, cycle, tid)
        });
        thread.stats.no_fu_stalls += 1;
        return false;
    }
    let fu = usable.trailing_zeros() as u8;
    shared.fu_avail &= !(1 << fu);

    if uop.opcode.is_load() {
        let _ = memory::issue_load(thread, shared, idx, cluster, fu);
        return true;
    }
    if uop.opcode.is_store() || uop.opcode.is_mem() {
        let _ = memory::issue_store(thread, shared, idx, cluster, fu);
        return true;
    }

    // Functional execution for ALU, branch, and assist uops.
    let (ra, ra_flags) = read_operand(
        &shared.physregs,
        thread.ctx.as_ref(),
        &thread.rob.get(idx).operands[OPERAND_RA],
    );
    let rb = if uop.rb_imm {
        uop.imm as u64
    } else {
        read_operand(
            &shared.physregs,
            thread.ctx.as_ref(),
            &thread.rob.get(idx).operands[OPERAND_RB],
        )
        .0
    };
    let result = execute(&uop, ra, rb, ra_flags);

    let latency = fuinfo(uop.opcode).latency;
    let mispredicted;
    {
        let e = thread.rob.get_mut(idx);
        e.result = result.data;
        e.result_flags = result.flags;
        e.taken = result.taken;
        e.issued = true;
        e.fu = fu;
        e.cycles_left = latency;
        mispredicted = uop.opcode.is_branch()
            && e.predrip.is_some_and(|predrip| predrip != result.data);
        e.mispredicted = mispredicted;
    }
    thread.rob.set_state(idx, RobState::Issued(cluster as u8));
    shared.issueqs[cluster].remove(tid);

    shared.eventlog.add(Event {
        uuid,
        rip: uop.rip,
        rob: idx,
        physreg: thread.rob.get(idx).physreg,
        cluster: cluster as i8,
        fu,
        payload: EventPayload::Issue {
            result: result.data,
            flags: result.flags,
            cycles_left: latency,
            mispredicted,
            predrip: thread.rob.get(idx).predrip.unwrap_or(0),
        },
        ..Event::at(EventKind::IssueOk, cycle, tid)
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FRONTEND_STAGES;
    use crate::core::pipeline::{fetch, frontend, rename};
    use crate::ifc::{BtbPredictor, SimContext};
    use crate::isa::ArchReg;
    use crate::isa::asm::Assembler;

    fn dispatched(build: impl FnOnce(&mut Assembler)) -> (ThreadContext, CoreShared) {
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
        for _ in 0..FRONTEND_STAGES {
            frontend::frontend(&mut pair.0, &mut pair.1);
        }
        let _ = frontend::dispatch(&mut pair.0, &mut pair.1);
        pair
    }

    fn issue_all(threads: &mut [ThreadContext], shared: &mut CoreShared) {
        for cluster in 0..crate::config::MAX_CLUSTERS {
            issue_cluster(threads, shared, cluster, 0);
        }
    }

    #[test]
    fn test_independent_uops_issue_and_execute() {
        let (thread, mut shared) = dispatched(|asm| {
            asm.movi(ArchReg::Rax, 7).movi(ArchReg::Rbx, 9);
        });
        let mut threads = [thread];
        issue_all(&mut threads, &mut shared);

        for idx in [0u16, 1u16] {
            let e = threads[0].rob.get(idx);
            assert!(e.issued, "rob {idx} did not issue");
            assert!(matches!(e.state, RobState::Issued(_)));
        }
        assert_eq!(threads[0].rob.get(0).result, 7);
        assert_eq!(threads[0].rob.get(1).result, 9);
    }

    #[test]
    fn test_dependent_uop_waits_for_producer() {
        let (thread, mut shared) = dispatched(|asm| {
            asm.movi(ArchReg::Rax, 7).addi(ArchReg::Rbx, ArchReg::Rax, 1);
        });
        let mut threads = [thread];
        issue_all(&mut threads, &mut shared);

        assert!(threads[0].rob.get(0).issued);
        // The consumer's operand is still Waiting: no issue this cycle
        assert!(!threads[0].rob.get(1).issued);
    }

    #[test]
    fn test_branch_misprediction_detected_at_issue() {
        let (thread, mut shared) = dispatched(|asm| {
            // Predicted not-taken out of reset; ZF is set architecturally
            asm.br_set(ArchReg::Zf, 0x3000);
        });
        let mut threads = [thread];
        threads[0].ctx.set_arch_reg(ArchReg::Zf, 1);
        issue_all(&mut threads, &mut shared);

        let e = threads[0].rob.get(0);
        assert!(e.issued);
        assert!(e.taken);
        assert_eq!(e.result, 0x3000);
        assert!(e.mispredicted);
    }

    #[test]
    fn test_mul_only_issues_on_mul_fu() {
        let (thread, mut shared) = dispatched(|asm| {
            asm.mul(ArchReg::Rax, ArchReg::Rbx, ArchReg::Rcx)
                .mul(ArchReg::Rdx, ArchReg::Rbx, ArchReg::Rcx);
        });
        let mut threads = [thread];
        issue_all(&mut threads, &mut shared);

        // Only one multiplier exists: the second mul sees no free FU
        let issued: usize = (0..2)
            .filter(|&i| threads[0].rob.get(i).issued)
            .count();
        assert_eq!(issued, 1);
        assert!(threads[0].stats.no_fu_stalls > 0);
    }
}
