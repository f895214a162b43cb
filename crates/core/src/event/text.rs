//! Human-readable event serializer.
//!
//! Emits one line per record with per-cycle banner lines, matching the
//! classic pipeline-trace layout: uuid, thread, stage tag, then the
//! stage-specific detail from the payload.

use std::fmt::Write as _;
use std::io::{self, Write};

use crate::event::{Event, EventKind, EventPayload, NO_INDEX};

fn idx(v: u16) -> String {
    if v == NO_INDEX {
        "-".to_string()
    } else {
        v.to_string()
    }
}

/// Formats one event line (without the cycle banner).
pub fn format_event(event: &Event) -> String {
    let mut s = String::new();
    let _ = write!(s, "{:>12} t{} ", event.uuid, event.thread);

    let tag = match event.kind {
        EventKind::FetchStalled => "fetch  frontend stalled".to_string(),
        EventKind::FetchIcacheWait => format!("fetch  rip {:#x}: wait for icache fill", event.rip),
        EventKind::FetchFetchqFull => format!("fetch  rip {:#x}: fetchq full", event.rip),
        EventKind::FetchIqQuotaFull => {
            format!("fetch  rip {:#x}: issue queue quota full", event.rip)
        }
        EventKind::FetchBogusRip => {
            format!("fetch  rip {:#x}: bogus RIP or decode failed", event.rip)
        }
        EventKind::FetchIcacheMiss => format!("fetch  rip {:#x}: icache miss", event.rip),
        EventKind::FetchOk => {
            let mut t = format!("fetch  rip {:#x}: rob {}", event.rip, idx(event.rob));
            if let EventPayload::Fetch {
                predrip, unaligned, ..
            } = event.payload
            {
                let _ = write!(t, " -> pred {predrip:#x}");
                if unaligned {
                    t.push_str(" unaligned");
                }
            }
            t
        }
        EventKind::RenameFetchqEmpty => "rename fetchq empty".to_string(),
        EventKind::RenameRobFull => "rename ROB full".to_string(),
        EventKind::RenamePhysregsFull => "rename physical register file full".to_string(),
        EventKind::RenameLsqFull => "rename load/store queue full".to_string(),
        EventKind::RenameIqFull => "rename issue queue full".to_string(),
        EventKind::RenameOk => {
            let mut t = format!("rename rob {} r{}", idx(event.rob), idx(event.physreg));
            if event.lsq != NO_INDEX {
                let _ = write!(t, " lsq {}", event.lsq);
            }
            if let EventPayload::Rename {
                operands,
                old_physreg,
                ..
            } = event.payload
            {
                let _ = write!(
                    t,
                    " = r{} r{} r{} r{} (old r{old_physreg})",
                    operands[0], operands[1], operands[2], operands[3]
                );
            }
            t
        }
        EventKind::Frontend => {
            let cycles = match event.payload {
                EventPayload::Frontend { cycles_left } => cycles_left,
                _ => 0,
            };
            format!("front  rob {} ({} cycles left)", idx(event.rob), cycles)
        }
        EventKind::ClusterNoCluster | EventKind::DispatchNoCluster => {
            let allowed = match event.payload {
                EventPayload::Dispatch {
                    allowed_clusters, ..
                } => allowed_clusters,
                _ => 0,
            };
            format!(
                "noclus rob {} allowed clusters {allowed:#05b} -> none",
                idx(event.rob)
            )
        }
        EventKind::ClusterOk | EventKind::DispatchOk => format!(
            "disptc rob {} -> cluster {}",
            idx(event.rob),
            event.cluster
        ),
        EventKind::DispatchDeadlock => {
            format!("dedlck rob {} dispatch deadlock: redispatch all", idx(event.rob))
        }
        EventKind::IssueNoFu => format!(
            "issue  rob {} no FUs available in cluster {}",
            idx(event.rob),
            event.cluster
        ),
        EventKind::IssueOk => {
            let mut t = format!(
                "issue  rob {} on fu{} cluster {} r{}",
                idx(event.rob),
                event.fu,
                event.cluster,
                idx(event.physreg)
            );
            if let EventPayload::Issue {
                result,
                mispredicted,
                predrip,
                ..
            } = event.payload
            {
                let _ = write!(t, " = {result:#x}");
                if mispredicted {
                    let _ = write!(t, "; mispredicted (expected {predrip:#x})");
                }
            }
            t
        }
        EventKind::IssueReplay => format!("replay rob {} operand became unready", idx(event.rob)),
        EventKind::StoreWait => loadstore_line("store", "wait on source", event),
        EventKind::StoreAliasedLoad => loadstore_line("store", "aliased younger load", event),
        EventKind::StoreIssued => loadstore_line("store", "stored to SFR", event),
        EventKind::StoreLockReplay => loadstore_line("store", "replay: line locked", event),
        EventKind::StoreException => loadstore_line("store", "exception", event),
        EventKind::LoadWait => loadstore_line("load", "wait on sfr", event),
        EventKind::LoadHit => loadstore_line("load", "hit", event),
        EventKind::LoadMiss => loadstore_line("ldmiss", "missed L1", event),
        EventKind::LoadBankConflict => loadstore_line("ldbank", "L1 bank conflict", event),
        EventKind::LoadLfrqFull => loadstore_line("load", "LFRQ full; replaying", event),
        EventKind::LoadLockReplay => loadstore_line("load", "replay: line locked", event),
        EventKind::LoadLockOverflow => loadstore_line("load", "no free interlock buffer", event),
        EventKind::LoadLockAcquired => loadstore_line("lk-acq", "lock acquired", event),
        EventKind::LoadWakeup => format!("ldwake rob {} wakeup via lfrq", idx(event.rob)),
        EventKind::LoadException => loadstore_line("load", "exception", event),
        EventKind::AlignmentFixup => format!(
            "algnfx rip {:#x}: set unaligned bit and refetch",
            event.rip
        ),
        EventKind::AnnulNoFutureUops => {
            format!("misspc rob {} no future uops to annul", idx(event.rob))
        }
        EventKind::AnnulMisspeculation => {
            let (start, end) = match event.payload {
                EventPayload::Annul { startidx, endidx } => (startidx, endidx),
                _ => (0, 0),
            };
            format!(
                "misspc rob {} annul from rob {start} to rob {end}",
                idx(event.rob)
            )
        }
        EventKind::AnnulEachRob => format!(
            "annul  rob {} rip {:#x}: free r{} lsq {}",
            idx(event.rob),
            event.rip,
            idx(event.physreg),
            idx(event.lsq)
        ),
        EventKind::AnnulFetchq => format!("anlfq  rip {:#x}: drain fetchq", event.rip),
        EventKind::RedispatchDependents => {
            format!("redisp rob {} find all dependents", idx(event.rob))
        }
        EventKind::RedispatchEachRob => {
            let deps = match event.payload {
                EventPayload::Redispatch {
                    dependent_operands, ..
                } => dependent_operands,
                _ => 0,
            };
            format!(
                "redisp rob {} dep operands {deps:#06b} -> ready-to-dispatch",
                idx(event.rob)
            )
        }
        EventKind::RedispatchDone => {
            let count = match event.payload {
                EventPayload::Redispatch { count, .. } => count,
                _ => 0,
            };
            format!("redisp rob {} redispatched {count} dependent uops", idx(event.rob))
        }
        EventKind::Complete => format!(
            "complt rob {} on fu{}: r{}",
            idx(event.rob),
            event.fu,
            idx(event.physreg)
        ),
        EventKind::Forward => {
            let (target, operand, fwd) = match event.payload {
                EventPayload::Forward {
                    target_rob,
                    operand,
                    forward_cycle,
                } => (target_rob, operand, forward_cycle),
                _ => (0, 0, 0),
            };
            format!(
                "forwd{fwd} rob {} r{} => rob {target} operand {operand}",
                idx(event.rob),
                idx(event.physreg)
            )
        }
        EventKind::Writeback => {
            let (data, consumers) = match event.payload {
                EventPayload::Writeback {
                    data,
                    consumer_count,
                    ..
                } => (data, consumer_count),
                _ => (0, 0),
            };
            format!(
                "write  rob {} r{} = {data:#x} ({consumers} consumers)",
                idx(event.rob),
                idx(event.physreg)
            )
        }
        EventKind::CommitOk => {
            let mut t = format!("commit rob {} r{}", idx(event.rob), idx(event.physreg));
            if let EventPayload::Commit {
                data,
                target_rip,
                total_insns,
                taken,
                pred_taken,
                old_physreg,
                ..
            } = event.payload
            {
                let _ = write!(t, " = {data:#x} [rip {target_rip:#x}]");
                if old_physreg != 0 {
                    let _ = write!(t, " [pending free r{old_physreg}]");
                }
                if taken != pred_taken {
                    t.push_str(" [brupdate MP]");
                }
                let _ = write!(t, " [EOM #{total_insns}]");
            }
            t
        }
        EventKind::CommitExceptionDetected => {
            format!("detect rob {} exception at commit", idx(event.rob))
        }
        EventKind::CommitSmcDetected => format!(
            "smcdet rob {} self-modifying code at rip {:#x}; invalidate and retry",
            idx(event.rob),
            event.rip
        ),
        EventKind::CommitMemLocked => {
            loadstore_line("waitlk", "wait for lock release", event)
        }
        EventKind::CommitAssist => format!("assist rob {} calling assist", idx(event.rob)),
        EventKind::CommitFlush => format!("cmflsh rob {} serializing flush", idx(event.rob)),
        EventKind::ReclaimPhysreg => format!(
            "free   r{} no longer referenced; moving to free state",
            idx(event.physreg)
        ),
        EventKind::ReleaseMemLock => loadstore_line("unlkcm", "lock release committed", event),
        EventKind::MetaCoreid => format!("meta   coreid {}", event.core),
        EventKind::Invalid => "?????? invalid event".to_string(),
    };

    s.push_str(&tag);
    s
}

fn loadstore_line(stage: &str, detail: &str, event: &Event) -> String {
    let mut s = format!(
        "{stage:<6} rob {} lsq {} r{}",
        idx(event.rob),
        idx(event.lsq),
        idx(event.physreg)
    );
    if let EventPayload::LoadStore {
        virtaddr,
        physaddr,
        data,
        bytemask,
        second_phase,
        ..
    } = event.payload
    {
        let phase = if second_phase { "2" } else { "" };
        let _ = write!(
            s,
            "{phase} @ {virtaddr:#x} (phys {:#x}) data {data:#x} mask {bytemask:#04x}",
            physaddr << 3
        );
    }
    let _ = write!(s, ": {detail}");
    s
}

/// Writes the whole log with per-cycle banners.
pub fn write_log<'a>(
    w: &mut dyn Write,
    coreid: u16,
    events: impl Iterator<Item = &'a Event>,
) -> io::Result<()> {
    let mut current_cycle = u64::MAX;
    for event in events {
        if event.kind == EventKind::Invalid {
            continue;
        }
        if event.cycle != current_cycle {
            current_cycle = event.cycle;
            writeln!(w, "[core {coreid}] Cycle {current_cycle}:")?;
        }
        writeln!(w, "{}", format_event(event))?;
    }
    Ok(())
}
