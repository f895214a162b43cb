//! Binary event serializer.
//!
//! Wire format per record:
//! `u16 size; u16 type; u64 cycle; u16 thread; u16 core; u64 rip; <payload>`
//! where `size` counts the bytes that follow it. Payload length is selected
//! by event type through a static table of inclusive type ranges; ranges of
//! event types share the same payload layout. A metadata record declaring
//! the core id is emitted first per log.
//!
//! The table is scanned linearly: at ~15 ranges that beats a binary chop.

use std::io::{self, Write};

use crate::event::{Event, EventKind, EventPayload};

/// Bytes of the fixed header after the size field.
pub const FIXED_HEADER_BYTES: u16 = 2 + 8 + 2 + 2 + 8;

/// One row of the size table: an inclusive event type range and the payload
/// byte count every type in the range serializes with.
#[derive(Clone, Copy, Debug)]
pub struct TypeSizeRange {
    /// First event type of the range.
    pub start: u16,
    /// Last event type of the range (inclusive).
    pub end: u16,
    /// Payload bytes for the range.
    pub size: u16,
}

const fn range(start: EventKind, end: EventKind, size: u16) -> TypeSizeRange {
    TypeSizeRange {
        start: start as u16,
        end: end as u16,
        size,
    }
}

/// The size table: single source of truth for wire compatibility.
/// Keep in ascending type order and dense over the emitted event kinds.
pub const SIZE_TABLE: &[TypeSizeRange] = &[
    range(EventKind::FetchStalled, EventKind::FetchOk, 11),
    range(EventKind::RenameFetchqEmpty, EventKind::RenameOk, 16),
    range(EventKind::Frontend, EventKind::Frontend, 4),
    range(EventKind::ClusterNoCluster, EventKind::DispatchDeadlock, 10),
    range(EventKind::IssueNoFu, EventKind::IssueReplay, 22),
    range(EventKind::StoreWait, EventKind::LoadException, 38),
    range(EventKind::AlignmentFixup, EventKind::AlignmentFixup, 0),
    range(EventKind::AnnulNoFutureUops, EventKind::AnnulFetchq, 4),
    range(EventKind::RedispatchDependents, EventKind::RedispatchDone, 3),
    range(EventKind::Complete, EventKind::Complete, 0),
    range(EventKind::Forward, EventKind::Forward, 4),
    range(EventKind::Writeback, EventKind::Writeback, 11),
    range(EventKind::CommitOk, EventKind::CommitFlush, 29),
    range(EventKind::ReclaimPhysreg, EventKind::ReleaseMemLock, 0),
    range(EventKind::MetaCoreid, EventKind::MetaCoreid, 0),
];

/// Payload byte count for an event type. Linear over the range table.
pub fn payload_size(kind: EventKind) -> Option<u16> {
    let t = kind as u16;
    SIZE_TABLE
        .iter()
        .find(|r| r.start <= t && t <= r.end)
        .map(|r| r.size)
}

fn encode_payload(payload: &EventPayload, out: &mut Vec<u8>) {
    match *payload {
        EventPayload::None => {}
        EventPayload::Fetch {
            predrip,
            bb_uop_count,
            unaligned,
        } => {
            out.extend_from_slice(&predrip.to_le_bytes());
            out.extend_from_slice(&bb_uop_count.to_le_bytes());
            out.push(u8::from(unaligned));
        }
        EventPayload::Rename {
            operands,
            old_physreg,
            old_flags,
        } => {
            for op in operands {
                out.extend_from_slice(&op.to_le_bytes());
            }
            out.extend_from_slice(&old_physreg.to_le_bytes());
            for old in old_flags {
                out.extend_from_slice(&old.to_le_bytes());
            }
        }
        EventPayload::Frontend { cycles_left } => {
            out.extend_from_slice(&cycles_left.to_le_bytes());
        }
        EventPayload::Dispatch {
            allowed_clusters,
            iq_avail,
        } => {
            out.extend_from_slice(&allowed_clusters.to_le_bytes());
            for avail in iq_avail {
                out.extend_from_slice(&avail.to_le_bytes());
            }
        }
        EventPayload::Issue {
            result,
            flags,
            cycles_left,
            mispredicted,
            predrip,
        } => {
            out.extend_from_slice(&result.to_le_bytes());
            out.push(flags);
            out.extend_from_slice(&cycles_left.to_le_bytes());
            out.push(u8::from(mispredicted));
            out.extend_from_slice(&predrip.to_le_bytes());
        }
        EventPayload::LoadStore {
            virtaddr,
            physaddr,
            data,
            bytemask,
            second_phase,
            inherit_lsq,
            locking_vcpu,
            locking_uuid,
        } => {
            out.extend_from_slice(&virtaddr.to_le_bytes());
            out.extend_from_slice(&physaddr.to_le_bytes());
            out.extend_from_slice(&data.to_le_bytes());
            out.push(bytemask);
            out.push(u8::from(second_phase));
            out.extend_from_slice(&inherit_lsq.to_le_bytes());
            out.extend_from_slice(&locking_vcpu.to_le_bytes());
            out.extend_from_slice(&locking_uuid.to_le_bytes());
        }
        EventPayload::Annul { startidx, endidx } => {
            out.extend_from_slice(&startidx.to_le_bytes());
            out.extend_from_slice(&endidx.to_le_bytes());
        }
        EventPayload::Redispatch {
            count,
            dependent_operands,
        } => {
            out.extend_from_slice(&count.to_le_bytes());
            out.push(dependent_operands);
        }
        EventPayload::Forward {
            target_rob,
            operand,
            forward_cycle,
        } => {
            out.extend_from_slice(&target_rob.to_le_bytes());
            out.push(operand);
            out.push(forward_cycle);
        }
        EventPayload::Writeback {
            data,
            flags,
            consumer_count,
        } => {
            out.extend_from_slice(&data.to_le_bytes());
            out.push(flags);
            out.extend_from_slice(&consumer_count.to_le_bytes());
        }
        EventPayload::Commit {
            data,
            flags,
            target_rip,
            total_insns,
            taken,
            pred_taken,
            old_physreg,
        } => {
            out.extend_from_slice(&data.to_le_bytes());
            out.push(flags);
            out.extend_from_slice(&target_rip.to_le_bytes());
            out.extend_from_slice(&total_insns.to_le_bytes());
            out.push(u8::from(taken));
            out.push(u8::from(pred_taken));
            out.extend_from_slice(&old_physreg.to_le_bytes());
        }
    }
}

/// Serializes one record. Events with no size-table entry are skipped.
pub fn write_event(w: &mut dyn Write, event: &Event) -> io::Result<()> {
    let Some(size) = payload_size(event.kind) else {
        return Ok(());
    };

    let mut payload = Vec::with_capacity(size as usize);
    encode_payload(&event.payload, &mut payload);
    debug_assert!(
        payload.len() <= size as usize,
        "payload of {:?} exceeds its size-table range",
        event.kind
    );
    payload.resize(size as usize, 0);

    w.write_all(&(FIXED_HEADER_BYTES + size).to_le_bytes())?;
    w.write_all(&(event.kind as u16).to_le_bytes())?;
    w.write_all(&event.cycle.to_le_bytes())?;
    w.write_all(&event.thread.to_le_bytes())?;
    w.write_all(&event.core.to_le_bytes())?;
    w.write_all(&event.rip.to_le_bytes())?;
    w.write_all(&payload)
}

/// Serializes a whole log: the core id metadata record, then every event.
pub fn write_log<'a>(
    w: &mut dyn Write,
    coreid: u16,
    events: impl Iterator<Item = &'a Event>,
) -> io::Result<()> {
    let meta = Event {
        core: coreid,
        ..Event::at(EventKind::MetaCoreid, 0, 0)
    };
    write_event(w, &meta)?;
    for event in events {
        if event.kind != EventKind::Invalid {
            write_event(w, event)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_table_is_sorted_and_disjoint() {
        let mut prev_end = None;
        for row in SIZE_TABLE {
            assert!(row.start <= row.end);
            if let Some(end) = prev_end {
                assert!(row.start > end, "overlapping ranges at {}", row.start);
            }
            prev_end = Some(row.end);
        }
    }

    #[test]
    fn test_all_emitted_kinds_have_sizes() {
        for kind in [
            EventKind::FetchOk,
            EventKind::RenameIqFull,
            EventKind::RenameOk,
            EventKind::Frontend,
            EventKind::DispatchOk,
            EventKind::IssueOk,
            EventKind::LoadHit,
            EventKind::StoreIssued,
            EventKind::AnnulEachRob,
            EventKind::RedispatchEachRob,
            EventKind::Complete,
            EventKind::Forward,
            EventKind::Writeback,
            EventKind::CommitOk,
            EventKind::ReclaimPhysreg,
            EventKind::ReleaseMemLock,
        ] {
            assert!(payload_size(kind).is_some(), "{kind:?} missing from table");
        }
        assert!(payload_size(EventKind::Invalid).is_none());
    }

    #[test]
    fn test_record_length_matches_size_prefix() {
        let event = Event {
            rip: 0x1000,
            payload: EventPayload::Commit {
                data: 42,
                flags: 1,
                target_rip: 0x1004,
                total_insns: 7,
                taken: false,
                pred_taken: false,
                old_physreg: 3,
            },
            ..Event::at(EventKind::CommitOk, 99, 1)
        };
        let mut out = Vec::new();
        write_event(&mut out, &event).unwrap();

        let size = u16::from_le_bytes([out[0], out[1]]);
        assert_eq!(out.len(), 2 + size as usize);
        let kind = u16::from_le_bytes([out[2], out[3]]);
        assert_eq!(kind, EventKind::CommitOk as u16);
    }

    #[test]
    fn test_payload_shorter_than_range_is_padded() {
        // FetchStalled has no payload but sits in the fetch range (11 bytes)
        let event = Event::at(EventKind::FetchStalled, 1, 0);
        let mut out = Vec::new();
        write_event(&mut out, &event).unwrap();
        let size = u16::from_le_bytes([out[0], out[1]]);
        assert_eq!(size, FIXED_HEADER_BYTES + 11);
        assert_eq!(out.len(), 2 + size as usize);
    }

    #[test]
    fn test_log_leads_with_metadata_record() {
        let events = [Event::at(EventKind::CommitOk, 5, 0)];
        let mut out = Vec::new();
        write_log(&mut out, 3, events.iter()).unwrap();

        let kind = u16::from_le_bytes([out[2], out[3]]);
        assert_eq!(kind, EventKind::MetaCoreid as u16);
        // core field sits after size(2) + type(2) + cycle(8) + thread(2)
        let core = u16::from_le_bytes([out[14], out[15]]);
        assert_eq!(core, 3);
    }
}
