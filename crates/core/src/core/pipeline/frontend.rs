//! Frontend delay pipeline and cluster dispatch.
//!
//! The frontend is a fixed-depth ready countdown between rename and
//! dispatch. Dispatch intersects the clusters capable of executing a uop
//! with the clusters that have issue queue room for the thread, picks one
//! (most available capacity, lowest index on ties), claims the issue queue
//! slot, and routes the entry to the cluster's ready-to-issue/load/store
//! list. A head-of-line uop that stays unroutable long enough triggers the
//! redispatch-all deadlock recovery.

use crate::config::{DISPATCH_DEADLOCK_THRESHOLD, DISPATCH_WIDTH, MAX_CLUSTERS};
use crate::core::CoreShared;
use crate::core::pipeline::annul;
use crate::core::rob::RobState;
use crate::core::thread::ThreadContext;
use crate::event::{Event, EventKind, EventPayload};

/// Advances the frontend countdown; expired entries become dispatchable.
pub fn frontend(thread: &mut ThreadContext, shared: &mut CoreShared) {
    let cycle = shared.cycle;
    let tid = thread.threadid;

    for idx in thread.rob.list_indices(RobState::Frontend) {
        let e = thread.rob.get_mut(idx);
        e.cycles_left = e.cycles_left.saturating_sub(1);
        let cycles_left = e.cycles_left;
        let (uuid, rip) = (e.uuid, e.uop.rip);

        shared.eventlog.add(Event {
            uuid,
            rip,
            rob: idx,
            payload: EventPayload::Frontend { cycles_left },
            ..Event::at(EventKind::Frontend, cycle, tid)
        });

        if cycles_left == 0 {
            thread.rob.set_state(idx, RobState::ReadyToDispatch);
        }
    }
}

/// Dispatches ready uops to clusters. Returns the number dispatched, or -1
/// when deadlock recovery fired (rename/frontend must skip this cycle).
pub fn dispatch(thread: &mut ThreadContext, shared: &mut CoreShared) -> i32 {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let mut dispatched = 0i32;

    for idx in thread
        .rob
        .list_indices(RobState::ReadyToDispatch)
        .into_iter()
        .take(DISPATCH_WIDTH)
    {
        let (uuid, rip, opcode) = {
            let e = thread.rob.get(idx);
            (e.uuid, e.uop.rip, e.uop.opcode)
        };

        let capable = shared.luts.executable_on_cluster(opcode);
        let mut with_room = 0u32;
        let mut iq_avail = [0u16; MAX_CLUSTERS];
        for (c, iq) in shared.issueqs.iter().enumerate() {
            iq_avail[c] = iq.available_for(tid) as u16;
            if iq.can_insert(tid) {
                with_room |= 1 << c;
            }
        }
        let allowed = capable & with_room;

        if allowed == 0 {
            shared.eventlog.add(Event {
                uuid,
                rip,
                rob: idx,
                payload: EventPayload::Dispatch {
                    allowed_clusters: capable,
                    iq_avail,
                },
                ..Event::at(EventKind::DispatchNoCluster, cycle, tid)
            });
            thread.stats.no_cluster_stalls += 1;
            thread.dispatch_deadlock_countdown += 1;
            if thread.dispatch_deadlock_countdown >= DISPATCH_DEADLOCK_THRESHOLD {
                shared.eventlog.add(Event {
                    uuid,
                    rip,
                    rob: idx,
                    ..Event::at(EventKind::DispatchDeadlock, cycle, tid)
                });
                thread.dispatch_deadlock_countdown = 0;
                shared.stats.dispatch_deadlock_recoveries += 1;
                annul::redispatch_all(thread, shared);
                return -1;
            }
            break;
        }
        thread.dispatch_deadlock_countdown = 0;

        // Most available capacity wins; lowest index breaks ties.
        let mut cluster = 0;
        let mut best_avail = -1i32;
        for c in 0..MAX_CLUSTERS {
            if allowed & (1 << c) != 0 && i32::from(iq_avail[c]) > best_avail {
                best_avail = i32::from(iq_avail[c]);
                cluster = c;
            }
        }

        if !shared.issueqs[cluster].insert(tid) {
            break; // lost the slot within this cycle
        }

        let e = thread.rob.get_mut(idx);
        e.cluster = Some(cluster as u8);
        let state = if opcode.is_load() {
            RobState::ReadyToLoad(cluster as u8)
        } else if opcode.is_store() || opcode.is_mem() {
            RobState::ReadyToStore(cluster as u8)
        } else {
            RobState::ReadyToIssue(cluster as u8)
        };
        thread.rob.set_state(idx, state);

        shared.eventlog.add(Event {
            uuid,
            rip,
            rob: idx,
            cluster: cluster as i8,
            payload: EventPayload::Dispatch {
                allowed_clusters: allowed,
                iq_avail,
            },
            ..Event::at(EventKind::DispatchOk, cycle, tid)
        });
        dispatched += 1;
    }

    dispatched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FRONTEND_STAGES;
    use crate::core::pipeline::{fetch, rename};
    use crate::ifc::{BtbPredictor, SimContext};
    use crate::isa::ArchReg;
    use crate::isa::asm::Assembler;

    fn renamed_thread(build: impl FnOnce(&mut Assembler)) -> (ThreadContext, CoreShared) {
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
    fn test_frontend_counts_down_to_dispatchable() {
        let (mut thread, mut shared) = renamed_thread(|asm| {
            asm.movi(ArchReg::Rax, 1);
        });
        for _ in 0..FRONTEND_STAGES {
            assert_eq!(thread.rob.lists.ready_to_dispatch.count(), 0);
            frontend(&mut thread, &mut shared);
        }
        assert_eq!(thread.rob.lists.ready_to_dispatch.count(), 1);
    }

    #[test]
    fn test_dispatch_routes_by_opcode_class() {
        let (mut thread, mut shared) = renamed_thread(|asm| {
            asm.movi(ArchReg::Rax, 1).ld(ArchReg::Rbx, ArchReg::Rax, 0).st(
                ArchReg::Rax,
                8,
                ArchReg::Rbx,
            );
        });
        for _ in 0..FRONTEND_STAGES {
            frontend(&mut thread, &mut shared);
        }
        let n = dispatch(&mut thread, &mut shared);
        assert_eq!(n, 3);

        // ALU uop lands in an int cluster, memory uops in the mem cluster
        assert!(matches!(
            thread.rob.get(0).state,
            RobState::ReadyToIssue(c) if c < 2
        ));
        assert_eq!(thread.rob.get(1).state, RobState::ReadyToLoad(2));
        assert_eq!(thread.rob.get(2).state, RobState::ReadyToStore(2));
        // Issue queue slots claimed
        assert_eq!(
            shared.issueqs.iter().map(|q| q.occupancy(0)).sum::<usize>(),
            3
        );
    }

    #[test]
    fn test_dispatch_balances_int_clusters() {
        let (mut thread, mut shared) = renamed_thread(|asm| {
            asm.movi(ArchReg::Rax, 1).movi(ArchReg::Rbx, 2);
        });
        for _ in 0..FRONTEND_STAGES {
            frontend(&mut thread, &mut shared);
        }
        let _ = dispatch(&mut thread, &mut shared);
        let c0 = thread.rob.get(0).cluster.unwrap();
        let c1 = thread.rob.get(1).cluster.unwrap();
        // First uop takes int0 (tie, lowest index); second sees int1 more available
        assert_eq!(c0, 0);
        assert_eq!(c1, 1);
    }
}
