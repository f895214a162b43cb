//! Fetch stage.
//!
//! Pulls decoded uops from the current basic block into the fetch queue,
//! stamping each with a fetch-order uuid. On EOM uops the branch predictor
//! supplies the next fetch rip. Preconditions checked per uop: frontend not
//! stalled, no pending I-cache fill, fetch queue room, and issue queue quota
//! for this thread.

use crate::config::{FETCH_WIDTH, MAX_CLUSTERS};
use crate::core::CoreShared;
use crate::core::thread::{FetchEntry, ThreadContext};
use crate::event::{Event, EventKind, EventPayload};

/// Runs one fetch cycle for a thread.
pub fn fetch(thread: &mut ThreadContext, shared: &mut CoreShared) {
    let cycle = shared.cycle;
    let tid = thread.threadid;

    if thread.stall_frontend {
        shared.eventlog.add(Event {
            rip: thread.fetchrip,
            ..Event::at(EventKind::FetchStalled, cycle, tid)
        });
        return;
    }

    if thread.waiting_for_icache_fill {
        let physaddr = thread.waiting_for_icache_fill_physaddr;
        if shared.caches.icache_fill_ready(physaddr) {
            thread.waiting_for_icache_fill = false;
        } else {
            shared.eventlog.add(Event {
                rip: thread.fetchrip,
                ..Event::at(EventKind::FetchIcacheWait, cycle, tid)
            });
            return;
        }
    }

    for _ in 0..FETCH_WIDTH {
        if !thread.fetchq_has_room() {
            shared.eventlog.add(Event {
                rip: thread.fetchrip,
                ..Event::at(EventKind::FetchFetchqFull, cycle, tid)
            });
            break;
        }

        // A thread whose issue queue share is exhausted everywhere gains
        // nothing from fetching further ahead.
        if (0..MAX_CLUSTERS).all(|c| !shared.issueqs[c].can_insert(tid)) {
            shared.eventlog.add(Event {
                rip: thread.fetchrip,
                ..Event::at(EventKind::FetchIqQuotaFull, cycle, tid)
            });
            break;
        }

        // Refill the basic block cursor when exhausted.
        let exhausted = thread
            .current_bb
            .as_ref()
            .is_none_or(|bb| thread.bb_index >= bb.uops.len());
        if exhausted {
            if !shared.caches.probe_icache(thread.fetchrip) {
                thread.waiting_for_icache_fill = true;
                thread.waiting_for_icache_fill_physaddr = thread.fetchrip;
                shared.eventlog.add(Event {
                    rip: thread.fetchrip,
                    ..Event::at(EventKind::FetchIcacheMiss, cycle, tid)
                });
                break;
            }
            match shared.decoder.fetch_basic_block(thread.fetchrip) {
                Ok(bb) => {
                    thread.current_bb = Some(bb);
                    thread.bb_index = 0;
                }
                Err(_) => {
                    shared.eventlog.add(Event {
                        rip: thread.fetchrip,
                        ..Event::at(EventKind::FetchBogusRip, cycle, tid)
                    });
                    thread.stall_frontend = true;
                    break;
                }
            }
        }

        let Some((mut uop, bb_uop_count)) = thread
            .current_bb
            .as_ref()
            .map(|bb| (bb.uops[thread.bb_index], bb.uops.len() as u16))
        else {
            break;
        };
        thread.bb_index += 1;

        if uop.opcode.is_load() || uop.opcode.is_store() {
            uop.unaligned = shared.unaligned_predictor.get(uop.rip);
        }

        let uuid = thread.fetch_uuid;
        thread.fetch_uuid += 1;

        let mut predrip = None;
        let mut pred_taken = false;
        if uop.eom {
            let pred = thread.branchpred.predict(&uop);
            pred_taken = uop.opcode.is_branch() && pred != uop.next_rip();
            predrip = Some(pred);
            thread.fetchrip = pred;
            // Branches terminate the decoder's blocks; drop the cursor so
            // the next iteration fetches from the predicted target.
            if uop.opcode.is_branch() {
                thread.current_bb = None;
                thread.bb_index = 0;
            }
        }

        shared.eventlog.add(Event {
            uuid,
            rip: uop.rip,
            payload: EventPayload::Fetch {
                predrip: predrip.unwrap_or(0),
                bb_uop_count,
                unaligned: uop.unaligned,
            },
            ..Event::at(EventKind::FetchOk, cycle, tid)
        });

        thread.fetchq.push_back(FetchEntry {
            uop,
            uuid,
            predrip,
            pred_taken,
        });
    }
}
