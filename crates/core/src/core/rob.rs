//! Reorder buffer: in-flight uops in program order.
//!
//! The ROB is a bounded circular queue; entries never move after allocation.
//! Classification is done by moving entries between intrusive state lists,
//! one per pipeline phase (per cluster where the phase is clustered):
//!
//! ```text
//! free -> frontend -> ready-to-dispatch -> dispatched[c]
//!      -> ready-to-(issue|load|store)[c] -> issued[c]
//!      -> completed[c] -> ready-to-writeback[c]
//!      -> ready-to-commit -> free     (normal)
//! any-nonfree -> free                 (annul)
//! any-nonfree -> ready-to-dispatch    (redispatch)
//! ```

use crate::config::{MAX_CLUSTERS, ROB_SIZE};
use crate::core::physreg::{PHYS_REG_NULL, PhysRegId};
use crate::core::state_list::{ListNode, StateList};
use crate::ifc::Exception;
use crate::isa::regs::ArchReg;
use crate::isa::uop::Uop;

/// Operand slots per ROB entry.
pub const MAX_OPERANDS: usize = 4;

/// Operand slot index: RA (base / first source).
pub const OPERAND_RA: usize = 0;
/// Operand slot index: RB (second source).
pub const OPERAND_RB: usize = 1;
/// Operand slot index: RC (store data / third source).
pub const OPERAND_RC: usize = 2;
/// Operand slot index: RS (inherited store-forwarding dependency).
pub const OPERAND_RS: usize = 3;

/// One renamed operand: the physreg it resolved to and the architectural
/// register it renames (used to read committed state through the null reg).
#[derive(Clone, Copy, Debug, Default)]
pub struct Operand {
    /// Physical register supplying the value.
    pub physreg: PhysRegId,
    /// Architectural register this operand renames.
    pub archreg: ArchReg,
}

/// Pipeline phase of a ROB entry; one state list exists per variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RobState {
    /// Unallocated.
    #[default]
    Free,
    /// In the frontend delay pipeline after rename.
    Frontend,
    /// Waiting for cluster selection.
    ReadyToDispatch,
    /// Dispatched to a cluster, operands not yet requested.
    Dispatched(u8),
    /// In a cluster's issue window.
    ReadyToIssue(u8),
    /// Load waiting to issue in a cluster.
    ReadyToLoad(u8),
    /// Store waiting to issue in a cluster.
    ReadyToStore(u8),
    /// Executing on a functional unit.
    Issued(u8),
    /// Result produced, on the bypass network.
    Completed(u8),
    /// Forwarding done, waiting for the writeback port.
    ReadyToWriteback(u8),
    /// Load waiting on a D-cache miss fill.
    CacheMiss,
    /// Eligible for in-order commit.
    ReadyToCommit,
}

impl RobState {
    /// True while the entry occupies an issue queue slot.
    #[inline]
    pub const fn in_issue_queue(self) -> bool {
        matches!(
            self,
            Self::Dispatched(_)
                | Self::ReadyToIssue(_)
                | Self::ReadyToLoad(_)
                | Self::ReadyToStore(_)
        )
    }

    /// True once the entry's result is available.
    #[inline]
    pub const fn is_ready(self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::ReadyToWriteback(_) | Self::ReadyToCommit
        )
    }

    /// Cluster this state is bound to, when clustered.
    #[inline]
    pub const fn cluster(self) -> Option<u8> {
        match self {
            Self::Dispatched(c)
            | Self::ReadyToIssue(c)
            | Self::ReadyToLoad(c)
            | Self::ReadyToStore(c)
            | Self::Issued(c)
            | Self::Completed(c)
            | Self::ReadyToWriteback(c) => Some(c),
            _ => None,
        }
    }
}

/// One in-flight uop.
#[derive(Clone, Debug, Default)]
pub struct ReorderBufferEntry {
    /// Index of this entry in the ROB array.
    pub idx: u16,
    /// The uop payload.
    pub uop: Uop,
    /// Fetch-order unique id.
    pub uuid: u64,
    /// Allocated flag; holds iff the entry is on a non-free list.
    pub entry_valid: bool,
    /// Current pipeline phase (mirrors list membership).
    pub state: RobState,
    /// Renamed source operands (RA, RB, RC, RS).
    pub operands: [Operand; MAX_OPERANDS],
    /// Destination physical register.
    pub physreg: PhysRegId,
    /// Previous speculative mapping of the destination (for commit/annul).
    pub old_physreg: PhysRegId,
    /// Whether the uop writes an architectural destination.
    pub has_dest: bool,
    /// Previous speculative mappings of renamed flags (zf, cf, of).
    pub old_flag_physregs: [Option<PhysRegId>; 3],
    /// Linked load/store queue slot.
    pub lsq: Option<u16>,
    /// Selected cluster.
    pub cluster: Option<u8>,
    /// Execution cycles remaining once issued.
    pub cycles_left: u32,
    /// Forwarding cycle progressed so far while completed.
    pub forward_cycle: u8,
    /// Occupied load-fill request queue slot, if missed.
    pub lfrq_slot: Option<u8>,
    /// Functional unit index the uop issued on.
    pub fu: u8,
    /// Uop has issued at least once.
    pub issued: bool,
    /// Memory uop is in its second issue phase (address known, waiting).
    pub load_store_second_phase: bool,
    /// Holds a line interlock (ld.acq).
    pub lock_acquired: bool,
    /// Predicted next rip (EOM uops).
    pub predrip: Option<u64>,
    /// Predicted direction for conditional branches.
    pub pred_taken: bool,
    /// Resolved branch direction.
    pub taken: bool,
    /// Branch target mismatch detected at issue; annul at writeback.
    pub mispredicted: bool,
    /// Result value (branch target for control uops).
    pub result: u64,
    /// Result condition flags.
    pub result_flags: u8,
    /// Architectural exception captured at issue, with faulting address.
    pub exception: Option<(Exception, u64)>,
    /// Consumers observed at forward time.
    pub consumer_count: u16,
    /// Scratch mark used by the redispatch dependency walk.
    pub dep_mark: bool,
}

impl ReorderBufferEntry {
    /// Clears per-flight fields for (re)allocation.
    pub fn reset(&mut self) {
        let idx = self.idx;
        *self = Self {
            idx,
            ..Self::default()
        };
    }
}

/// The per-phase state lists of one thread's ROB.
#[derive(Debug)]
pub struct RobLists {
    /// Unallocated entries.
    pub free: StateList,
    /// Frontend delay pipeline.
    pub frontend: StateList,
    /// Awaiting cluster selection.
    pub ready_to_dispatch: StateList,
    /// Dispatched, per cluster.
    pub dispatched: [StateList; MAX_CLUSTERS],
    /// Issueable ALU/branch uops, per cluster.
    pub ready_to_issue: [StateList; MAX_CLUSTERS],
    /// Issueable loads, per cluster.
    pub ready_to_load: [StateList; MAX_CLUSTERS],
    /// Issueable stores, per cluster.
    pub ready_to_store: [StateList; MAX_CLUSTERS],
    /// Executing, per cluster.
    pub issued: [StateList; MAX_CLUSTERS],
    /// Completed, forwarding, per cluster.
    pub completed: [StateList; MAX_CLUSTERS],
    /// Waiting for a writeback port, per cluster.
    pub ready_to_writeback: [StateList; MAX_CLUSTERS],
    /// Loads waiting on miss fills.
    pub cache_miss: StateList,
    /// Eligible for commit.
    pub ready_to_commit: StateList,
}

/// Builds a clustered list triple with a shared name.
fn clustered(name: &'static str) -> [StateList; MAX_CLUSTERS] {
    [
        StateList::new(name),
        StateList::new(name),
        StateList::new(name),
    ]
}

impl Default for RobLists {
    fn default() -> Self {
        Self {
            free: StateList::new("free"),
            frontend: StateList::new("frontend"),
            ready_to_dispatch: StateList::new("ready-to-dispatch"),
            dispatched: clustered("dispatched"),
            ready_to_issue: clustered("ready-to-issue"),
            ready_to_load: clustered("ready-to-load"),
            ready_to_store: clustered("ready-to-store"),
            issued: clustered("issued"),
            completed: clustered("completed"),
            ready_to_writeback: clustered("ready-to-write"),
            cache_miss: StateList::new("cache-miss"),
            ready_to_commit: StateList::new("ready-to-commit"),
        }
    }
}

impl RobLists {
    /// The list backing a ROB state.
    pub fn list_mut(&mut self, state: RobState) -> &mut StateList {
        match state {
            RobState::Free => &mut self.free,
            RobState::Frontend => &mut self.frontend,
            RobState::ReadyToDispatch => &mut self.ready_to_dispatch,
            RobState::Dispatched(c) => &mut self.dispatched[c as usize],
            RobState::ReadyToIssue(c) => &mut self.ready_to_issue[c as usize],
            RobState::ReadyToLoad(c) => &mut self.ready_to_load[c as usize],
            RobState::ReadyToStore(c) => &mut self.ready_to_store[c as usize],
            RobState::Issued(c) => &mut self.issued[c as usize],
            RobState::Completed(c) => &mut self.completed[c as usize],
            RobState::ReadyToWriteback(c) => &mut self.ready_to_writeback[c as usize],
            RobState::CacheMiss => &mut self.cache_miss,
            RobState::ReadyToCommit => &mut self.ready_to_commit,
        }
    }

    /// Uop count feeding the ICOUNT fetch priority (frontend-resident work).
    pub fn frontend_occupancy(&self) -> usize {
        let mut n = self.frontend.count() + self.ready_to_dispatch.count();
        for c in 0..MAX_CLUSTERS {
            n += self.dispatched[c].count()
                + self.ready_to_issue[c].count()
                + self.ready_to_load[c].count()
                + self.ready_to_store[c].count();
        }
        n
    }
}

/// Reorder buffer: circular allocation queue plus the state lists.
#[derive(Debug)]
pub struct Rob {
    entries: Vec<ReorderBufferEntry>,
    nodes: Vec<ListNode>,
    /// Per-phase classification lists.
    pub lists: RobLists,
    head: u16,
    tail: u16,
    count: usize,
}

impl Default for Rob {
    fn default() -> Self {
        Self::new()
    }
}

impl Rob {
    /// Creates an empty ROB of `ROB_SIZE` entries, all free.
    pub fn new() -> Self {
        let mut rob = Self {
            entries: (0..ROB_SIZE as u16)
                .map(|idx| ReorderBufferEntry {
                    idx,
                    ..ReorderBufferEntry::default()
                })
                .collect(),
            nodes: vec![ListNode::default(); ROB_SIZE],
            lists: RobLists::default(),
            head: 0,
            tail: 0,
            count: 0,
        };
        for i in 0..ROB_SIZE as u16 {
            rob.lists.free.push_back(&mut rob.nodes, i);
        }
        rob
    }

    /// Number of in-flight entries.
    #[inline]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Returns true if no entries are in flight.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns true if the ROB is full.
    #[inline]
    pub const fn is_full(&self) -> bool {
        self.count == ROB_SIZE
    }

    /// Oldest in-flight entry index.
    #[inline]
    pub const fn head(&self) -> u16 {
        self.head
    }

    /// Shared access to an entry.
    #[inline]
    pub fn get(&self, idx: u16) -> &ReorderBufferEntry {
        &self.entries[idx as usize]
    }

    /// Mutable access to an entry.
    #[inline]
    pub fn get_mut(&mut self, idx: u16) -> &mut ReorderBufferEntry {
        &mut self.entries[idx as usize]
    }

    /// Allocates the next entry in program order: `free -> frontend`.
    pub fn alloc(&mut self) -> Option<u16> {
        if self.is_full() {
            return None;
        }
        let idx = self.tail;
        debug_assert_eq!(self.entries[idx as usize].state, RobState::Free);
        self.entries[idx as usize].reset();
        self.set_state(idx, RobState::Frontend);
        self.tail = (self.tail + 1) % ROB_SIZE as u16;
        self.count += 1;
        Some(idx)
    }

    /// Moves an entry between state lists; maintains `entry_valid`.
    pub fn set_state(&mut self, idx: u16, new_state: RobState) {
        let old = self.entries[idx as usize].state;
        if old == new_state {
            return;
        }
        self.lists.list_mut(old).remove(&mut self.nodes, idx);
        self.lists.list_mut(new_state).push_back(&mut self.nodes, idx);
        let entry = &mut self.entries[idx as usize];
        entry.state = new_state;
        entry.entry_valid = new_state != RobState::Free;
    }

    /// Retires the head entry; caller has already released its resources.
    pub fn free_head(&mut self) {
        debug_assert!(self.count > 0);
        let idx = self.head;
        self.set_state(idx, RobState::Free);
        self.head = (self.head + 1) % ROB_SIZE as u16;
        self.count -= 1;
    }

    /// Removes the youngest entry on the annulment path. `idx` must be the
    /// entry immediately before the current tail.
    pub fn retract(&mut self, idx: u16) {
        let prev_tail = (self.tail + ROB_SIZE as u16 - 1) % ROB_SIZE as u16;
        debug_assert_eq!(idx, prev_tail);
        self.set_state(idx, RobState::Free);
        self.tail = prev_tail;
        self.count -= 1;
    }

    /// In-flight entry indices in program order (oldest first).
    pub fn iter_program_order(&self) -> impl Iterator<Item = u16> + '_ {
        let head = self.head;
        (0..self.count).map(move |i| (head + i as u16) % ROB_SIZE as u16)
    }

    /// In-flight entry indices youngest-first.
    pub fn iter_reverse(&self) -> impl Iterator<Item = u16> + '_ {
        let head = self.head;
        let count = self.count;
        (0..count)
            .rev()
            .map(move |i| (head + i as u16) % ROB_SIZE as u16)
    }

    /// Snapshot of a state list in insertion order.
    pub fn list_indices(&self, state: RobState) -> Vec<u16> {
        self.lists_for_read(state).indices(&self.nodes)
    }

    fn lists_for_read(&self, state: RobState) -> &StateList {
        match state {
            RobState::Free => &self.lists.free,
            RobState::Frontend => &self.lists.frontend,
            RobState::ReadyToDispatch => &self.lists.ready_to_dispatch,
            RobState::Dispatched(c) => &self.lists.dispatched[c as usize],
            RobState::ReadyToIssue(c) => &self.lists.ready_to_issue[c as usize],
            RobState::ReadyToLoad(c) => &self.lists.ready_to_load[c as usize],
            RobState::ReadyToStore(c) => &self.lists.ready_to_store[c as usize],
            RobState::Issued(c) => &self.lists.issued[c as usize],
            RobState::Completed(c) => &self.lists.completed[c as usize],
            RobState::ReadyToWriteback(c) => &self.lists.ready_to_writeback[c as usize],
            RobState::CacheMiss => &self.lists.cache_miss,
            RobState::ReadyToCommit => &self.lists.ready_to_commit,
        }
    }

    /// Resets the ROB to empty (pipeline flush).
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.reset();
        }
        self.nodes.fill_with(ListNode::default);
        self.lists = RobLists::default();
        for i in 0..ROB_SIZE as u16 {
            self.lists.free.push_back(&mut self.nodes, i);
        }
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    /// Validates `entry_valid <=> not on the free list` and list integrity.
    pub fn check(&self) {
        for entry in &self.entries {
            assert_eq!(
                entry.entry_valid,
                entry.state != RobState::Free,
                "rob {}: entry_valid {} but state {:?}",
                entry.idx,
                entry.entry_valid,
                entry.state
            );
        }
        self.lists.free.check_valid(&self.nodes);
        self.lists.ready_to_commit.check_valid(&self.nodes);
        let on_lists: usize = ROB_SIZE - self.lists.free.count();
        assert_eq!(on_lists, self.count, "rob count/list mismatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_in_program_order() {
        let mut rob = Rob::new();
        let a = rob.alloc().unwrap();
        let b = rob.alloc().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(rob.len(), 2);
        assert_eq!(rob.iter_program_order().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(rob.get(a).state, RobState::Frontend);
        assert!(rob.get(a).entry_valid);
    }

    #[test]
    fn test_full_rob_rejects() {
        let mut rob = Rob::new();
        for _ in 0..ROB_SIZE {
            assert!(rob.alloc().is_some());
        }
        assert!(rob.is_full());
        assert!(rob.alloc().is_none());
    }

    #[test]
    fn test_state_transitions_move_lists() {
        let mut rob = Rob::new();
        let idx = rob.alloc().unwrap();
        assert_eq!(rob.lists.frontend.count(), 1);

        rob.set_state(idx, RobState::ReadyToDispatch);
        assert_eq!(rob.lists.frontend.count(), 0);
        assert_eq!(rob.lists.ready_to_dispatch.count(), 1);

        rob.set_state(idx, RobState::Issued(1));
        assert_eq!(rob.lists.issued[1].count(), 1);
        rob.check();
    }

    #[test]
    fn test_free_head_and_wraparound() {
        let mut rob = Rob::new();
        for _ in 0..(ROB_SIZE * 3) {
            let idx = rob.alloc().unwrap();
            rob.set_state(idx, RobState::ReadyToCommit);
            rob.free_head();
        }
        assert!(rob.is_empty());
        rob.check();
    }

    #[test]
    fn test_retract_youngest() {
        let mut rob = Rob::new();
        let _a = rob.alloc().unwrap();
        let b = rob.alloc().unwrap();
        rob.retract(b);
        assert_eq!(rob.len(), 1);
        assert!(!rob.get(b).entry_valid);
        // The slot is reusable in order
        assert_eq!(rob.alloc().unwrap(), b);
    }

    #[test]
    fn test_frontend_occupancy_counts() {
        let mut rob = Rob::new();
        let a = rob.alloc().unwrap();
        let b = rob.alloc().unwrap();
        let c = rob.alloc().unwrap();
        rob.set_state(a, RobState::ReadyToDispatch);
        rob.set_state(b, RobState::ReadyToIssue(0));
        rob.set_state(c, RobState::Issued(0)); // not frontend-resident
        assert_eq!(rob.lists.frontend_occupancy(), 2);
    }
}
