//! Load/store unit: address generation, forwarding, aliasing, interlocks.
//!
//! Stores at issue resolve their address, check younger loads for ordering
//! violations, and write only into their store-forwarding record; the
//! architectural write happens at commit. Loads scan older stores for the
//! youngest matching forwarding record, wait through the RS operand on
//! matches whose data is still unresolved, and otherwise probe the
//! D-cache. Locked lines replay the toucher and drag its dependents back
//! to dispatch.

use crate::config::L1_DCACHE_BANKS;
use crate::core::CoreShared;
use crate::core::lsq::{ForwardOutcome, bytemask_for};
use crate::core::pipeline::annul;
use crate::core::rob::{OPERAND_RA, OPERAND_RC, OPERAND_RS, Operand, RobState};
use crate::core::thread::ThreadContext;
use crate::event::{Event, EventKind, EventPayload, NO_INDEX};
use crate::core::interlock::AcquireResult;
use crate::ifc::{CacheOutcome, Context};
use crate::isa::uop::{Opcode, effective_address};

use super::read_operand;

/// Outcome of one load/store issue attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemIssueResult {
    /// Executing; the entry moved to the issued list.
    Issued,
    /// Replaying; the entry stays in its ready list (and its IQ slot).
    Replay,
    /// Returned to dispatch along with its dependents.
    Redispatched,
    /// Waiting on a D-cache miss fill.
    Miss,
    /// The uop annulled itself (alignment fixup).
    Annulled,
}

/// Reads `size` bytes at physical byte address `physbyte`, overlaying any
/// inherited store-forwarded bytes of the low 8-byte unit.
pub(crate) fn load_value(
    ctx: &dyn Context,
    physbyte: u64,
    size: u64,
    sfr_data: u64,
    sfr_mask: u8,
) -> u64 {
    let offset = physbyte & 7;
    let mut value = 0u64;
    for i in 0..size {
        let unit_byte = offset + i;
        let byte = if unit_byte < 8 && sfr_mask & (1 << unit_byte) != 0 {
            (sfr_data >> (unit_byte * 8)) as u8
        } else {
            let addr = physbyte + i;
            (ctx.read_phys(addr >> 3) >> ((addr & 7) * 8)) as u8
        };
        value |= u64::from(byte) << (i * 8);
    }
    value
}

/// Performs the architectural write of a committed store, byte-accurate
/// across unit boundaries.
pub(crate) fn commit_store_write(ctx: &mut dyn Context, physbyte: u64, data: u64, size: u64) {
    for i in 0..size {
        let addr = physbyte + i;
        let byte = (data >> (i * 8)) & 0xff;
        ctx.write_phys(addr >> 3, byte << ((addr & 7) * 8), 1 << (addr & 7));
    }
}

/// Address resolution shared by loads and stores. Returns the physical byte
/// address, or diverts the uop (fixup/exception) and reports how.
fn resolve_address(
    thread: &mut ThreadContext,
    shared: &mut CoreShared,
    idx: u16,
    cluster: usize,
    fu: u8,
    store: bool,
) -> Result<(u64, u64), MemIssueResult> {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let (uop, uuid) = {
        let e = thread.rob.get(idx);
        (e.uop, e.uuid)
    };
    let (ra, _) = read_operand(
        &shared.physregs,
        thread.ctx.as_ref(),
        &thread.rob.get(idx).operands[OPERAND_RA],
    );
    let virtaddr = effective_address(&uop, ra);
    let size = uop.size_bytes();

    // An unpredicted boundary crossing annuls the instruction and refetches
    // it with the unaligned bit set.
    if (virtaddr & 7) + size > 8 && !uop.unaligned {
        shared.unaligned_predictor.set(uop.rip);
        shared.eventlog.add(Event {
            uuid,
            rip: uop.rip,
            rob: idx,
            ..Event::at(EventKind::AlignmentFixup, cycle, tid)
        });
        annul::annul_from_instruction(thread, shared, idx);
        return Err(MemIssueResult::Annulled);
    }

    match thread.ctx.translate(virtaddr, store) {
        Ok(physbyte) => Ok((virtaddr, physbyte)),
        Err(exception) => {
            let lsq_idx = thread.rob.get(idx).lsq;
            if let Some(l) = lsq_idx {
                let entry = thread.lsq.get_mut(l);
                entry.invalid = true;
                entry.virtaddr = virtaddr;
            }
            let e = thread.rob.get_mut(idx);
            e.exception = Some((exception, virtaddr));
            e.cycles_left = 1;
            e.issued = true;
            e.fu = fu;
            thread.rob.set_state(idx, RobState::Issued(cluster as u8));
            shared.issueqs[cluster].remove(tid);
            shared.eventlog.add(Event {
                uuid,
                rip: uop.rip,
                rob: idx,
                lsq: lsq_idx.unwrap_or(NO_INDEX),
                cluster: cluster as i8,
                payload: EventPayload::LoadStore {
                    virtaddr,
                    physaddr: 0,
                    data: 0,
                    bytemask: 0,
                    second_phase: false,
                    inherit_lsq: NO_INDEX,
                    locking_vcpu: 0,
                    locking_uuid: 0,
                },
                ..Event::at(
                    if store {
                        EventKind::StoreException
                    } else {
                        EventKind::LoadException
                    },
                    cycle,
                    tid,
                )
            });
            Err(MemIssueResult::Issued)
        }
    }
}

fn ls_payload(thread: &ThreadContext, idx: u16, inherit_lsq: u16) -> EventPayload {
    let e = thread.rob.get(idx);
    let (virtaddr, physaddr, data, bytemask) = e.lsq.map_or((0, 0, 0, 0), |l| {
        let entry = thread.lsq.get(l);
        (entry.virtaddr, entry.physaddr, entry.data, entry.bytemask)
    });
    EventPayload::LoadStore {
        virtaddr,
        physaddr,
        data,
        bytemask,
        second_phase: e.load_store_second_phase,
        inherit_lsq,
        locking_vcpu: 0,
        locking_uuid: 0,
    }
}

fn finish_issue(
    thread: &mut ThreadContext,
    shared: &mut CoreShared,
    idx: u16,
    cluster: usize,
    fu: u8,
    extra_latency: u32,
) {
    let latency = crate::core::clusters::fuinfo(thread.rob.get(idx).uop.opcode).latency;
    let e = thread.rob.get_mut(idx);
    e.cycles_left = latency + extra_latency;
    e.issued = true;
    e.fu = fu;
    e.load_store_second_phase = false;
    thread.rob.set_state(idx, RobState::Issued(cluster as u8));
    shared.issueqs[cluster].remove(thread.threadid);
}

/// Issues a store (or fence): resolve the address, detect aliased younger
/// loads, and fill the store-forwarding record once the data arrives.
pub fn issue_store(
    thread: &mut ThreadContext,
    shared: &mut CoreShared,
    idx: u16,
    cluster: usize,
    fu: u8,
) -> MemIssueResult {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let (uop, uuid, lsq_idx) = {
        let e = thread.rob.get(idx);
        (e.uop, e.uuid, e.lsq)
    };
    let Some(lsq_idx) = lsq_idx else {
        return MemIssueResult::Replay;
    };

    // Fences carry no address or data; they resolve immediately and
    // serialize at commit.
    if uop.opcode == Opcode::Fence {
        let entry = thread.lsq.get_mut(lsq_idx);
        entry.addrvalid = true;
        entry.datavalid = true;
        entry.bytemask = 0;
        finish_issue(thread, shared, idx, cluster, fu, 0);
        shared.eventlog.add(Event {
            uuid,
            rip: uop.rip,
            rob: idx,
            lsq: lsq_idx,
            cluster: cluster as i8,
            fu,
            ..Event::at(EventKind::StoreIssued, cycle, tid)
        });
        return MemIssueResult::Issued;
    }

    let (virtaddr, physbyte) = match resolve_address(thread, shared, idx, cluster, fu, true) {
        Ok(a) => a,
        Err(diverted) => return diverted,
    };
    let size = uop.size_bytes();
    let physaddr = physbyte >> 3;
    let offset = physbyte & 7;
    let bytemask = bytemask_for(offset, size.min(8 - offset));
    let crosses = (offset + size > 8) as u32;

    {
        let entry = thread.lsq.get_mut(lsq_idx);
        entry.virtaddr = virtaddr;
        entry.physaddr = physaddr;
        entry.bytemask = bytemask;
        entry.addrvalid = true;
    }

    // A younger load that already executed against this unit read stale
    // data: annul it (and everything after it) and refetch.
    if let Some(aliased) = thread.lsq.find_aliased_load(lsq_idx, physaddr, bytemask) {
        let aliased_rob = thread.lsq.get(aliased).rob;
        shared.eventlog.add(Event {
            uuid,
            rip: uop.rip,
            rob: idx,
            lsq: lsq_idx,
            cluster: cluster as i8,
            fu,
            payload: ls_payload(thread, idx, aliased),
            ..Event::at(EventKind::StoreAliasedLoad, cycle, tid)
        });
        thread.stats.aliased_load_annuls += 1;
        annul::annul_from_instruction(thread, shared, aliased_rob);
    }

    // Store data may lag the address; wait in the second phase until the
    // RC operand resolves.
    let rc_ready = {
        let op = thread.rob.get(idx).operands[OPERAND_RC];
        op.physreg == crate::core::physreg::PHYS_REG_NULL
            || shared.physregs.get(op.physreg).ready_in_cluster(cluster)
    };
    if !rc_ready {
        thread.rob.get_mut(idx).load_store_second_phase = true;
        shared.eventlog.add(Event {
            uuid,
            rip: uop.rip,
            rob: idx,
            lsq: lsq_idx,
            cluster: cluster as i8,
            fu,
            payload: ls_payload(thread, idx, NO_INDEX),
            ..Event::at(EventKind::StoreWait, cycle, tid)
        });
        return MemIssueResult::Replay;
    }

    let (rc, _) = read_operand(
        &shared.physregs,
        thread.ctx.as_ref(),
        &thread.rob.get(idx).operands[OPERAND_RC],
    );
    {
        let entry = thread.lsq.get_mut(lsq_idx);
        entry.data = rc;
        entry.datavalid = true;
    }

    finish_issue(thread, shared, idx, cluster, fu, crosses);
    shared.eventlog.add(Event {
        uuid,
        rip: uop.rip,
        rob: idx,
        lsq: lsq_idx,
        cluster: cluster as i8,
        fu,
        payload: ls_payload(thread, idx, NO_INDEX),
        ..Event::at(EventKind::StoreIssued, cycle, tid)
    });
    MemIssueResult::Issued
}

/// Issues a load: resolve the address, scan older stores, then forward,
/// stall, or probe the D-cache.
pub fn issue_load(
    thread: &mut ThreadContext,
    shared: &mut CoreShared,
    idx: u16,
    cluster: usize,
    fu: u8,
) -> MemIssueResult {
    let cycle = shared.cycle;
    let tid = thread.threadid;
    let (uop, uuid, lsq_idx) = {
        let e = thread.rob.get(idx);
        (e.uop, e.uuid, e.lsq)
    };
    let Some(lsq_idx) = lsq_idx else {
        return MemIssueResult::Replay;
    };

    let (virtaddr, physbyte) = match resolve_address(thread, shared, idx, cluster, fu, false) {
        Ok(a) => a,
        Err(diverted) => return diverted,
    };
    let size = uop.size_bytes();
    let physaddr = physbyte >> 3;
    let offset = physbyte & 7;
    let bytemask = bytemask_for(offset, size.min(8 - offset));
    let crosses = (offset + size > 8) as u32;

    // One load per L1 bank per cycle.
    let bank = (physaddr as usize) & (L1_DCACHE_BANKS - 1);
    if shared.banks_used & (1 << bank) != 0 {
        shared.eventlog.add(Event {
            uuid,
            rip: uop.rip,
            rob: idx,
            lsq: lsq_idx,
            cluster: cluster as i8,
            fu,
            ..Event::at(EventKind::LoadBankConflict, cycle, tid)
        });
        thread.stats.bank_conflicts += 1;
        thread.stats.load_replays += 1;
        return MemIssueResult::Replay;
    }
    shared.banks_used |= 1 << bank;
    thread.loads_in_this_cycle += 1;

    // Line interlocks: replaying against a line held by another vcpu drags
    // the load's dependents back to dispatch with it.
    let line = physaddr >> 3;
    if let Some(holder) = shared.interlocks.holder(line).copied()
        && holder.vcpuid != thread.vcpuid
    {
        shared.eventlog.add(Event {
            uuid,
            rip: uop.rip,
            rob: idx,
            lsq: lsq_idx,
            cluster: cluster as i8,
            fu,
            payload: EventPayload::LoadStore {
                virtaddr,
                physaddr,
                data: 0,
                bytemask,
                second_phase: false,
                inherit_lsq: NO_INDEX,
                locking_vcpu: holder.vcpuid as u16,
                locking_uuid: holder.uuid,
            },
            ..Event::at(EventKind::LoadLockReplay, cycle, tid)
        });
        thread.stats.load_replays += 1;
        annul::redispatch_dependents(thread, shared, idx);
        return MemIssueResult::Redispatched;
    }
    if uop.opcode == Opcode::LdAcq {
        match shared.interlocks.try_acquire(line, thread.vcpuid, uuid) {
            AcquireResult::Acquired => {
                thread.rob.get_mut(idx).lock_acquired = true;
                shared.eventlog.add(Event {
                    uuid,
                    rip: uop.rip,
                    rob: idx,
                    lsq: lsq_idx,
                    cluster: cluster as i8,
                    fu,
                    ..Event::at(EventKind::LoadLockAcquired, cycle, tid)
                });
            }
            AcquireResult::HeldByOther { vcpuid, uuid: holder_uuid } => {
                shared.eventlog.add(Event {
                    uuid,
                    rip: uop.rip,
                    rob: idx,
                    lsq: lsq_idx,
                    payload: EventPayload::LoadStore {
                        virtaddr,
                        physaddr,
                        data: 0,
                        bytemask,
                        second_phase: false,
                        inherit_lsq: NO_INDEX,
                        locking_vcpu: vcpuid as u16,
                        locking_uuid: holder_uuid,
                    },
                    ..Event::at(EventKind::LoadLockReplay, cycle, tid)
                });
                thread.stats.load_replays += 1;
                annul::redispatch_dependents(thread, shared, idx);
                return MemIssueResult::Redispatched;
            }
            AcquireResult::Full => {
                shared.eventlog.add(Event {
                    uuid,
                    rip: uop.rip,
                    rob: idx,
                    lsq: lsq_idx,
                    ..Event::at(EventKind::LoadLockOverflow, cycle, tid)
                });
                thread.stats.load_replays += 1;
                annul::redispatch_dependents(thread, shared, idx);
                return MemIssueResult::Redispatched;
            }
        }
    }

    {
        let entry = thread.lsq.get_mut(lsq_idx);
        entry.virtaddr = virtaddr;
        entry.physaddr = physaddr;
        entry.bytemask = bytemask;
        entry.addrvalid = true;
    }

    let mut scan = thread.lsq.scan_for_load(lsq_idx, physaddr, bytemask);
    // A crossing load reads its high-unit bytes from memory directly, so an
    // older in-flight store to the high unit must drain first.
    if crosses != 0 && !matches!(scan, ForwardOutcome::Wait { .. }) {
        let high_mask = bytemask_for(0, offset + size - 8);
        match thread.lsq.scan_for_load(lsq_idx, physaddr + 1, high_mask) {
            ForwardOutcome::Miss => {}
            ForwardOutcome::Wait { source } | ForwardOutcome::Forward { source, .. } => {
                scan = ForwardOutcome::Wait { source };
            }
        }
    }
    let (sfr_data, sfr_mask, inherit_lsq) = match scan {
        ForwardOutcome::Wait { source } => {
            // Wake when the blocking store's result physreg resolves: wire
            // it through the RS operand and gate on it in the second phase.
            let src_phys = thread.rob.get(thread.lsq.get(source).rob).physreg;
            let old_rs = thread.rob.get(idx).operands[OPERAND_RS].physreg;
            shared.physregs.addref(src_phys);
            shared.unref_physreg(old_rs, cycle, tid);
            thread.rob.get_mut(idx).operands[OPERAND_RS] = Operand {
                physreg: src_phys,
                archreg: crate::isa::ArchReg::Zero,
            };
            {
                let entry = thread.lsq.get_mut(lsq_idx);
                entry.addrvalid = false; // not yet ordered; rescan on reissue
            }
            let e = thread.rob.get_mut(idx);
            e.load_store_second_phase = true;
            shared.eventlog.add(Event {
                uuid,
                rip: uop.rip,
                rob: idx,
                lsq: lsq_idx,
                cluster: cluster as i8,
                fu,
                payload: ls_payload(thread, idx, source),
                ..Event::at(EventKind::LoadWait, cycle, tid)
            });
            thread.stats.load_replays += 1;
            return MemIssueResult::Replay;
        }
        ForwardOutcome::Forward { data, mask, source } => (data, mask, source),
        ForwardOutcome::Miss => (0, 0, NO_INDEX),
    };

    // Fully forwarded loads never touch the D-cache.
    let value = if sfr_mask == bytemask && sfr_mask != 0 {
        thread.stats.loads_forwarded += 1;
        load_value(thread.ctx.as_ref(), physbyte, size, sfr_data, sfr_mask)
    } else {
        match shared.caches.probe_dcache(physaddr) {
            CacheOutcome::Hit => {
                if sfr_mask != 0 {
                    thread.stats.loads_forwarded += 1;
                }
                load_value(thread.ctx.as_ref(), physbyte, size, sfr_data, sfr_mask)
            }
            CacheOutcome::Miss(slot) => {
                let entry = thread.lsq.get_mut(lsq_idx);
                entry.sfr_data = sfr_data;
                entry.sfr_mask = sfr_mask;
                let e = thread.rob.get_mut(idx);
                e.lfrq_slot = Some(slot);
                e.issued = true;
                e.fu = fu;
                thread.rob.set_state(idx, RobState::CacheMiss);
                shared.issueqs[cluster].remove(tid);
                shared.eventlog.add(Event {
                    uuid,
                    rip: uop.rip,
                    rob: idx,
                    lsq: lsq_idx,
                    cluster: cluster as i8,
                    fu,
                    payload: ls_payload(thread, idx, inherit_lsq),
                    ..Event::at(EventKind::LoadMiss, cycle, tid)
                });
                return MemIssueResult::Miss;
            }
            CacheOutcome::Full => {
                shared.eventlog.add(Event {
                    uuid,
                    rip: uop.rip,
                    rob: idx,
                    lsq: lsq_idx,
                    cluster: cluster as i8,
                    fu,
                    ..Event::at(EventKind::LoadLfrqFull, cycle, tid)
                });
                thread.stats.load_replays += 1;
                return MemIssueResult::Replay;
            }
        }
    };

    {
        let entry = thread.lsq.get_mut(lsq_idx);
        entry.data = value;
        entry.datavalid = true;
        entry.sfr_data = sfr_data;
        entry.sfr_mask = sfr_mask;
    }
    {
        let e = thread.rob.get_mut(idx);
        e.result = value;
        e.result_flags = 0;
    }
    finish_issue(thread, shared, idx, cluster, fu, crosses);
    shared.eventlog.add(Event {
        uuid,
        rip: uop.rip,
        rob: idx,
        lsq: lsq_idx,
        cluster: cluster as i8,
        fu,
        payload: ls_payload(thread, idx, inherit_lsq),
        ..Event::at(EventKind::LoadHit, cycle, tid)
    });
    MemIssueResult::Issued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifc::SimContext;

    #[test]
    fn test_load_value_from_memory() {
        let mut ctx = SimContext::new(0, 4096, 0);
        ctx.write_phys(0x10, 0x1122334455667788, 0xff);
        let physbyte = 0x10 << 3;
        assert_eq!(load_value(&ctx, physbyte, 8, 0, 0), 0x1122334455667788);
        assert_eq!(load_value(&ctx, physbyte + 2, 2, 0, 0), 0x3344);
    }

    #[test]
    fn test_load_value_overlays_sfr() {
        let ctx = SimContext::new(0, 4096, 0);
        // Memory is zero; overlay bytes 0..4 from the store record
        let v = load_value(&ctx, 0x80, 8, 0xAABBCCDD, 0x0f);
        assert_eq!(v, 0xAABBCCDD);
        // Partial overlay: only byte 1
        let v = load_value(&ctx, 0x80, 4, 0xAABBCCDD, 0x02);
        assert_eq!(v, 0xCC00);
    }

    #[test]
    fn test_commit_store_write_crosses_units() {
        let mut ctx = SimContext::new(0, 4096, 0);
        // Write 8 bytes starting at byte 4 of unit 2: spans units 2 and 3
        commit_store_write(&mut ctx, (2 << 3) + 4, 0x8877665544332211, 8);
        assert_eq!(ctx.read_phys(2) >> 32, 0x44332211);
        assert_eq!(ctx.read_phys(3) & 0xffff_ffff, 0x88776655);
    }
}
