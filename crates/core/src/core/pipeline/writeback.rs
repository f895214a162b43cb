//! Complete, forward/transfer, and writeback.
//!
//! When an issued uop's execution countdown expires it completes: its
//! destination physreg takes the result and enters the bypass state. On
//! each following transfer cycle the value is broadcast to the clusters
//! reached at that forwarding latency (via the precomputed LUT); once the
//! last forwarding cycle passes, the value is committed to the register
//! file and the entry waits for a writeback port. Writeback moves entries
//! to ready-to-commit; a mispredicted branch schedules annulment of all
//! younger uops here and redirects fetch.

use crate::config::{MAX_FORWARDING_LATENCY, WRITEBACK_WIDTH};
use crate::core::CoreShared;
use crate::core::physreg::PhysregState;
use crate::core::pipeline::annul;
use crate::core::pipeline::memory::load_value;
use crate::core::rob::RobState;
use crate::core::thread::ThreadContext;
use crate::event::{Event, EventKind, EventPayload};

/// Moves an entry into the completed state and its result onto the bypass
/// network. Shared by the execution countdown and the miss-fill wakeup.
pub fn complete_entry(thread: &mut ThreadContext, shared: &mut CoreShared, idx: u16) {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let cluster = thread.rob.get(idx).cluster.unwrap_or(0);

    let (uuid, rip, physreg, result, flags, fu) = {
        let e = thread.rob.get_mut(idx);
        e.forward_cycle = 0;
        (e.uuid, e.uop.rip, e.physreg, e.result, e.result_flags, e.fu)
    };
    {
        let reg = shared.physregs.get_mut(physreg);
        reg.data = result;
        reg.flags = flags;
        reg.visible_mask = 0;
    }
    shared.physregs.change_state(physreg, PhysregState::Bypass);
    thread.rob.set_state(idx, RobState::Completed(cluster));

    shared.eventlog.add(Event {
        uuid,
        rip,
        rob: idx,
        physreg,
        cluster: cluster as i8,
        fu,
        ..Event::at(EventKind::Complete, cycle, tid)
    });
}

/// Advances execution countdowns for one cluster; expired entries complete.
pub fn complete_cluster(thread: &mut ThreadContext, shared: &mut CoreShared, cluster: usize) {
    for idx in thread.rob.list_indices(RobState::Issued(cluster as u8)) {
        let done = {
            let e = thread.rob.get_mut(idx);
            e.cycles_left = e.cycles_left.saturating_sub(1);
            e.cycles_left == 0
        };
        if done {
            complete_entry(thread, shared, idx);
        }
    }
}

/// Wakes loads whose D-cache miss fills completed this cycle.
pub fn wakeup_cache_misses(thread: &mut ThreadContext, shared: &mut CoreShared, fills: &[u8]) {
    let cycle = shared.cycle;
    let tid = thread.threadid;

    for idx in thread.rob.list_indices(RobState::CacheMiss) {
        let slot = thread.rob.get(idx).lfrq_slot;
        let Some(slot) = slot else { continue };
        if !fills.contains(&slot) {
            continue;
        }

        let (uuid, rip, lsq_idx, size) = {
            let e = thread.rob.get(idx);
            (e.uuid, e.uop.rip, e.lsq, e.uop.size_bytes())
        };
        let value = lsq_idx.map_or(0, |l| {
            let entry = thread.lsq.get(l);
            let physbyte = (entry.physaddr << 3) | (entry.virtaddr & 7);
            load_value(
                thread.ctx.as_ref(),
                physbyte,
                size,
                entry.sfr_data,
                entry.sfr_mask,
            )
        });
        if let Some(l) = lsq_idx {
            let entry = thread.lsq.get_mut(l);
            entry.data = value;
            entry.datavalid = true;
        }
        {
            let e = thread.rob.get_mut(idx);
            e.result = value;
            e.lfrq_slot = None;
        }
        shared.eventlog.add(Event {
            uuid,
            rip,
            rob: idx,
            lsq: lsq_idx.unwrap_or(crate::event::NO_INDEX),
            ..Event::at(EventKind::LoadWakeup, cycle, tid)
        });
        complete_entry(thread, shared, idx);
    }
}

/// Broadcasts a completed result to its waiting consumers (trace/statistics
/// bookkeeping; wakeup itself is the physreg's bypass visibility).
fn forward_broadcast(thread: &mut ThreadContext, shared: &mut CoreShared, idx: u16) {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let (uuid, rip, physreg) = {
        let e = thread.rob.get(idx);
        (e.uuid, e.uop.rip, e.physreg)
    };

    let mut consumers = 0u16;
    for target in thread.rob.iter_program_order().collect::<Vec<_>>() {
        if target == idx {
            continue;
        }
        let t = thread.rob.get(target);
        if t.state.is_ready() {
            continue;
        }
        for (slot, op) in t.operands.iter().enumerate() {
            if op.physreg == physreg {
                consumers += 1;
                shared.eventlog.add(Event {
                    uuid,
                    rip,
                    rob: idx,
                    physreg,
                    payload: EventPayload::Forward {
                        target_rob: target,
                        operand: slot as u8,
                        forward_cycle: 0,
                    },
                    ..Event::at(EventKind::Forward, cycle, tid)
                });
            }
        }
    }
    thread.rob.get_mut(idx).consumer_count = consumers;
}

/// Runs the transfer (forwarding) pass for one cluster.
pub fn transfer_cluster(thread: &mut ThreadContext, shared: &mut CoreShared, cluster: usize) {
    for idx in thread.rob.list_indices(RobState::Completed(cluster as u8)) {
        let forward_cycle = thread.rob.get(idx).forward_cycle;
        if forward_cycle == 0 {
            forward_broadcast(thread, shared, idx);
        }

        let physreg = thread.rob.get(idx).physreg;
        let mask = shared.luts.forward_at_cycle(cluster, forward_cycle);
        shared.physregs.get_mut(physreg).visible_mask |= mask;
        thread.rob.get_mut(idx).forward_cycle = forward_cycle + 1;

        if forward_cycle >= MAX_FORWARDING_LATENCY {
            // Final forwarding cycle: the value reaches the register file.
            shared
                .physregs
                .change_state(physreg, PhysregState::Written);
            thread
                .rob
                .set_state(idx, RobState::ReadyToWriteback(cluster as u8));
        }
    }
}

/// Runs the writeback pass for one cluster; mispredicted branches trigger
/// annulment and fetch redirect here.
pub fn writeback_cluster(thread: &mut ThreadContext, shared: &mut CoreShared, cluster: usize) {
    let cycle = shared.cycle;
    let tid = thread.threadid;

    for idx in thread
        .rob
        .list_indices(RobState::ReadyToWriteback(cluster as u8))
        .into_iter()
        .take(WRITEBACK_WIDTH)
    {
        let (uuid, rip, physreg, result, flags, consumers, mispredicted) = {
            let e = thread.rob.get(idx);
            (
                e.uuid,
                e.uop.rip,
                e.physreg,
                e.result,
                e.result_flags,
                e.consumer_count,
                e.mispredicted,
            )
        };

        if mispredicted {
            annul::annul_after(thread, shared, idx);
            thread.redirect_fetch(result);
            thread.stall_frontend = false;
        }

        shared.eventlog.add(Event {
            uuid,
            rip,
            rob: idx,
            physreg,
            cluster: cluster as i8,
            payload: EventPayload::Writeback {
                data: result,
                flags,
                consumer_count: consumers,
            },
            ..Event::at(EventKind::Writeback, cycle, tid)
        });
        thread.rob.set_state(idx, RobState::ReadyToCommit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FRONTEND_STAGES, MAX_CLUSTERS};
    use crate::core::pipeline::{fetch, frontend, issue, rename};
    use crate::ifc::{BtbPredictor, SimContext};
    use crate::isa::ArchReg;
    use crate::isa::asm::Assembler;

    fn issued(build: impl FnOnce(&mut Assembler)) -> (ThreadContext, CoreShared) {
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
        for cluster in 0..MAX_CLUSTERS {
            issue::issue_cluster(std::slice::from_mut(&mut pair.0), &mut pair.1, cluster, 0);
        }
        pair
    }

    #[test]
    fn test_complete_puts_result_on_bypass() {
        let (mut thread, mut shared) = issued(|asm| {
            asm.movi(ArchReg::Rax, 42);
        });
        let cluster = thread.rob.get(0).cluster.unwrap() as usize;
        complete_cluster(&mut thread, &mut shared, cluster);

        let e = thread.rob.get(0);
        assert_eq!(e.state, RobState::Completed(cluster as u8));
        let reg = shared.physregs.get(e.physreg);
        assert_eq!(reg.state, PhysregState::Bypass);
        assert_eq!(reg.data, 42);
        // Not yet visible anywhere until the transfer pass
        assert_eq!(reg.visible_mask, 0);
    }

    #[test]
    fn test_transfer_progresses_visibility_then_writes() {
        let (mut thread, mut shared) = issued(|asm| {
            asm.movi(ArchReg::Rax, 42);
        });
        let cluster = thread.rob.get(0).cluster.unwrap() as usize;
        complete_cluster(&mut thread, &mut shared, cluster);
        let physreg = thread.rob.get(0).physreg;

        // First transfer cycle: visible at latency-0 clusters
        transfer_cluster(&mut thread, &mut shared, cluster);
        let vis0 = shared.physregs.get(physreg).visible_mask;
        assert_eq!(vis0, shared.luts.forward_at_cycle(cluster, 0));
        assert_eq!(shared.physregs.get(physreg).state, PhysregState::Bypass);

        // Second transfer cycle: remaining clusters, then the register file
        transfer_cluster(&mut thread, &mut shared, cluster);
        assert_eq!(shared.physregs.get(physreg).state, PhysregState::Written);
        assert_eq!(
            thread.rob.get(0).state,
            RobState::ReadyToWriteback(cluster as u8)
        );
    }

    #[test]
    fn test_writeback_moves_to_ready_to_commit() {
        let (mut thread, mut shared) = issued(|asm| {
            asm.movi(ArchReg::Rax, 42);
        });
        let cluster = thread.rob.get(0).cluster.unwrap() as usize;
        complete_cluster(&mut thread, &mut shared, cluster);
        transfer_cluster(&mut thread, &mut shared, cluster);
        transfer_cluster(&mut thread, &mut shared, cluster);
        writeback_cluster(&mut thread, &mut shared, cluster);
        assert_eq!(thread.rob.get(0).state, RobState::ReadyToCommit);
    }

    #[test]
    fn test_forward_counts_consumers() {
        let (mut thread, mut shared) = issued(|asm| {
            asm.movi(ArchReg::Rax, 7).addi(ArchReg::Rbx, ArchReg::Rax, 1);
        });
        let cluster = thread.rob.get(0).cluster.unwrap() as usize;
        complete_cluster(&mut thread, &mut shared, cluster);
        transfer_cluster(&mut thread, &mut shared, cluster);
        assert_eq!(thread.rob.get(0).consumer_count, 1);
    }
}
