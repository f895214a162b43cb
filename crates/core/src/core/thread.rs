//! Per-hardware-thread state.
//!
//! A [`ThreadContext`] owns everything private to one SMT thread: the fetch
//! queue and basic-block cursor, both rename tables, the ROB, the LSQ, the
//! branch predictor, the architectural context handle, and the per-thread
//! exception/interrupt latches. Shared structures (physical registers, issue
//! queues, caches, event log) live on the core.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::FETCH_QUEUE_SIZE;
use crate::core::lsq::LoadStoreQueue;
use crate::core::physreg::RegisterRenameTable;
use crate::core::rob::Rob;
use crate::ifc::{BranchPredictorIfc, Context, Exception};
use crate::isa::uop::{BasicBlock, Uop};
use crate::stats::ThreadStats;

/// One uop staged between fetch and rename.
#[derive(Clone, Copy, Debug)]
pub struct FetchEntry {
    /// The fetched uop (with the unaligned bit already applied).
    pub uop: Uop,
    /// Fetch-order unique id.
    pub uuid: u64,
    /// Predicted next rip (EOM uops only).
    pub predrip: Option<u64>,
    /// Predicted branch direction.
    pub pred_taken: bool,
}

/// Commit outcome of one thread for one cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitResult {
    /// At least one uop committed.
    Ok,
    /// Nothing was ready to commit.
    None,
    /// Committed a serializing uop; flush the pipeline and refetch.
    OkFlush,
    /// Self-modifying code detected on this code page.
    Smc {
        /// Dirtied machine frame number.
        mfn: u64,
    },
    /// The head uop raised an architectural exception.
    Exception {
        /// The exception.
        exception: Exception,
        /// Faulting virtual address.
        virtaddr: u64,
    },
    /// An assist uop reached commit; dispatch microcode.
    Barrier {
        /// Assist identifier.
        assist_id: u16,
        /// rip of the instruction after the assist (resume point).
        next_rip: u64,
    },
    /// An interrupt is due at this instruction boundary.
    Interrupt,
    /// A stop request completed at this instruction boundary.
    Stop,
}

/// Per-thread front-end state, queues, rename tables, and latches.
pub struct ThreadContext {
    /// Thread index within the core.
    pub threadid: usize,
    /// Owning virtual CPU.
    pub vcpuid: usize,
    /// Architectural context (committed state + guest memory).
    pub ctx: Box<dyn Context>,
    /// Branch predictor for this thread.
    pub branchpred: Box<dyn BranchPredictorIfc>,
    /// Reorder buffer.
    pub rob: Rob,
    /// Load/store queue.
    pub lsq: LoadStoreQueue,
    /// Speculative rename table (updated at rename).
    pub specrrt: RegisterRenameTable,
    /// Committed rename table (updated at commit).
    pub commitrrt: RegisterRenameTable,
    /// Fetched uops awaiting rename.
    pub fetchq: VecDeque<FetchEntry>,
    /// Next rip to fetch.
    pub fetchrip: u64,
    /// Basic block currently being fetched from.
    pub current_bb: Option<Rc<BasicBlock>>,
    /// Next uop index within `current_bb`.
    pub bb_index: usize,
    /// Fetch-order uuid counter.
    pub fetch_uuid: u64,
    /// Fetch stalled on an I-cache fill.
    pub waiting_for_icache_fill: bool,
    /// Physical address of the pending I-cache fill.
    pub waiting_for_icache_fill_physaddr: u64,
    /// Frontend hard-stalled (stop, undecodable rip).
    pub stall_frontend: bool,
    /// Loads issued so far this cycle.
    pub loads_in_this_cycle: usize,
    /// Cycles spent with an undispatchable uop at the dispatch head.
    pub dispatch_deadlock_countdown: u32,
    /// Interrupt latched for delivery at the next EOM commit.
    pub handle_interrupt_at_next_eom: bool,
    /// Previous interrupt-pending level (edge detector).
    pub prev_interrupts_pending: bool,
    /// Stop requested; honored at the next EOM commit.
    pub stop_at_next_eom: bool,
    /// Cycle of the most recent commit (deadlock watchdog).
    pub last_commit_at_cycle: u64,
    /// Code page awaiting basic-block cache invalidation after SMC.
    pub smc_invalidate_pending: Option<u64>,
    /// Assist latched by a barrier commit, dispatched by the machine.
    pub pending_assist: Option<u16>,
    /// Performance counters.
    pub stats: ThreadStats,
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("threadid", &self.threadid)
            .field("vcpuid", &self.vcpuid)
            .field("fetchrip", &self.fetchrip)
            .field("rob_len", &self.rob.len())
            .field("lsq_len", &self.lsq.len())
            .finish()
    }
}

impl ThreadContext {
    /// Creates a thread wired to its context and predictor. Fetch starts at
    /// the context's committed rip.
    pub fn new(
        threadid: usize,
        ctx: Box<dyn Context>,
        branchpred: Box<dyn BranchPredictorIfc>,
    ) -> Self {
        let vcpuid = ctx.vcpuid();
        let fetchrip = ctx.arch_reg(crate::isa::ArchReg::Rip);
        Self {
            threadid,
            vcpuid,
            ctx,
            branchpred,
            rob: Rob::new(),
            lsq: LoadStoreQueue::new(),
            specrrt: RegisterRenameTable::new(),
            commitrrt: RegisterRenameTable::new(),
            fetchq: VecDeque::with_capacity(FETCH_QUEUE_SIZE),
            fetchrip,
            current_bb: None,
            bb_index: 0,
            fetch_uuid: 0,
            waiting_for_icache_fill: false,
            waiting_for_icache_fill_physaddr: 0,
            stall_frontend: false,
            loads_in_this_cycle: 0,
            dispatch_deadlock_countdown: 0,
            handle_interrupt_at_next_eom: false,
            prev_interrupts_pending: false,
            stop_at_next_eom: false,
            last_commit_at_cycle: 0,
            smc_invalidate_pending: None,
            pending_assist: None,
            stats: ThreadStats::default(),
        }
    }

    /// ICOUNT fetch priority: uops resident in the front-end stages. Lower
    /// is served first; threads with little in-flight frontend work move
    /// uops quickly and make the most progress per fetch slot.
    pub fn get_priority(&self) -> usize {
        self.fetchq.len() + self.rob.lists.frontend_occupancy()
    }

    /// Redirects fetch to `rip`, dropping the current basic block cursor.
    pub fn redirect_fetch(&mut self, rip: u64) {
        self.fetchrip = rip;
        self.current_bb = None;
        self.bb_index = 0;
        self.waiting_for_icache_fill = false;
    }

    /// True when the fetch queue has room this cycle.
    #[inline]
    pub fn fetchq_has_room(&self) -> bool {
        self.fetchq.len() < FETCH_QUEUE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rob::RobState;
    use crate::ifc::{BtbPredictor, SimContext};

    fn thread() -> ThreadContext {
        ThreadContext::new(
            0,
            Box::new(SimContext::new(0, 4096, 0x1000)),
            Box::new(BtbPredictor::new()),
        )
    }

    #[test]
    fn test_new_thread_starts_at_context_rip() {
        let t = thread();
        assert_eq!(t.fetchrip, 0x1000);
        assert!(t.rob.is_empty());
        assert!(t.fetchq.is_empty());
    }

    #[test]
    fn test_icount_priority_counts_frontend_work() {
        let mut t = thread();
        assert_eq!(t.get_priority(), 0);

        let a = t.rob.alloc().unwrap(); // frontend list
        let b = t.rob.alloc().unwrap();
        t.rob.set_state(b, RobState::ReadyToDispatch);
        let c = t.rob.alloc().unwrap();
        t.rob.set_state(c, RobState::Issued(0)); // past the frontend
        assert_eq!(t.get_priority(), 2);
        let _ = a;
    }

    #[test]
    fn test_redirect_fetch_clears_cursor() {
        let mut t = thread();
        t.bb_index = 3;
        t.waiting_for_icache_fill = true;
        t.redirect_fetch(0x2000);
        assert_eq!(t.fetchrip, 0x2000);
        assert_eq!(t.bb_index, 0);
        assert!(t.current_bb.is_none());
        assert!(!t.waiting_for_icache_fill);
    }
}
