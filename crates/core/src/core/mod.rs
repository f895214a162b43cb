//! The out-of-order core.
//!
//! [`OutOfOrderCore`] aggregates up to `MAX_THREADS_PER_CORE` thread
//! contexts with the structures they share: the physical register file,
//! per-cluster issue queues, the functional unit availability mask, the
//! cache interface, the interlock buffer, and the event log. One call to
//! [`OutOfOrderCore::runcycle`] advances the whole core one cycle, running
//! the pipeline stages in the fixed order that respects producer/consumer
//! dataflow within a cycle.

/// Functional unit and cluster tables.
pub mod clusters;
/// Memory interlock buffer.
pub mod interlock;
/// Issue queue reservation accounting.
pub mod issue_queue;
/// Load/store queue.
pub mod lsq;
/// Physical registers and rename tables.
pub mod physreg;
/// Pipeline stages.
pub mod pipeline;
/// Unaligned access predictor.
pub mod predictors;
/// Reorder buffer.
pub mod rob;
/// Intrusive classification lists.
pub mod state_list;
/// Per-thread state.
pub mod thread;

use tracing::warn;

use crate::config::{Config, MAX_CLUSTERS, PHYS_REG_FILE_SIZE, WATCHDOG_CYCLES};
use crate::core::clusters::{CoreLuts, FU_ALL};
use crate::core::interlock::MemoryInterlockBuffer;
use crate::core::issue_queue::IssueQueue;
use crate::core::physreg::{PHYS_REG_NULL, PhysRegId, PhysicalRegisterFile, PhysregState};
use crate::core::predictors::UnalignedPredictor;
use crate::core::thread::{CommitResult, ThreadContext};
use crate::event::{Event, EventKind, EventLog};
use crate::ifc::{CacheModel, Decoder};
use crate::stats::CoreStats;

/// Structures shared by all threads of a core.
pub struct CoreShared {
    /// Core identifier.
    pub coreid: usize,
    /// Current simulation cycle.
    pub cycle: u64,
    /// Functional units still free this cycle.
    pub fu_avail: u32,
    /// L1 banks already accessed by a load this cycle.
    pub banks_used: u32,
    /// The physical register file.
    pub physregs: PhysicalRegisterFile,
    /// Per-cluster issue queues.
    pub issueqs: [IssueQueue; MAX_CLUSTERS],
    /// Opcode/cluster and forwarding lookup tables.
    pub luts: CoreLuts,
    /// Per-cycle event ring buffer.
    pub eventlog: EventLog,
    /// Cache and TLB timing model.
    pub caches: Box<dyn CacheModel>,
    /// Basic block decoder.
    pub decoder: Box<dyn Decoder>,
    /// Line interlocks for locked memory operations.
    pub interlocks: MemoryInterlockBuffer,
    /// Split access predictor.
    pub unaligned_predictor: UnalignedPredictor,
    /// Core-level counters.
    pub stats: CoreStats,
}

impl std::fmt::Debug for CoreShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreShared")
            .field("coreid", &self.coreid)
            .field("cycle", &self.cycle)
            .finish()
    }
}

impl CoreShared {
    /// Drops one reference to a physreg, emitting the reclaim event when
    /// this frees it.
    pub fn unref_physreg(&mut self, id: PhysRegId, cycle: u64, tid: usize) {
        if self.physregs.unref(id) {
            self.stats.physregs_reclaimed += 1;
            self.eventlog.add(Event {
                physreg: id,
                ..Event::at(EventKind::ReclaimPhysreg, cycle, tid)
            });
        }
    }

    /// Test fixture: behavioral collaborators serving `program`.
    #[cfg(test)]
    pub(crate) fn for_tests(program: &[crate::isa::Uop]) -> Self {
        let mut decoder = crate::ifc::ProgramDecoder::new();
        decoder.add_program(program);
        Self {
            coreid: 0,
            cycle: 0,
            fu_avail: FU_ALL,
            banks_used: 0,
            physregs: PhysicalRegisterFile::new("int", 0, PHYS_REG_FILE_SIZE),
            issueqs: std::array::from_fn(|_| IssueQueue::new()),
            luts: CoreLuts::new(),
            eventlog: EventLog::new(64, 0),
            caches: Box::new(crate::ifc::FixedLatencyCaches::new(8)),
            decoder: Box::new(decoder),
            interlocks: MemoryInterlockBuffer::new(),
            unaligned_predictor: UnalignedPredictor::new(),
            stats: CoreStats::default(),
        }
    }
}

/// One out-of-order core with its hardware threads.
#[derive(Debug)]
pub struct OutOfOrderCore {
    /// Hardware threads.
    pub threads: Vec<ThreadContext>,
    /// Structures shared across threads.
    pub shared: CoreShared,
    round_robin_tid: usize,
}

impl OutOfOrderCore {
    /// Builds a core around its external collaborators.
    pub fn new(
        coreid: usize,
        config: &Config,
        decoder: Box<dyn Decoder>,
        caches: Box<dyn CacheModel>,
    ) -> Self {
        let mut eventlog = EventLog::new(config.event_log_ring_buffer_size, coreid as u16);
        if config.event_log_enabled && config.start_log_at_iteration == 0 {
            eventlog.enable(config.flush_event_log_every_cycle);
        }
        Self {
            threads: Vec::new(),
            shared: CoreShared {
                coreid,
                cycle: 0,
                fu_avail: FU_ALL,
                banks_used: 0,
                physregs: PhysicalRegisterFile::new("int", 0, PHYS_REG_FILE_SIZE),
                issueqs: std::array::from_fn(|_| IssueQueue::new()),
                luts: CoreLuts::new(),
                eventlog,
                caches,
                decoder,
                interlocks: MemoryInterlockBuffer::new(),
                unaligned_predictor: UnalignedPredictor::new(),
                stats: CoreStats::default(),
            },
            round_robin_tid: 0,
        }
    }

    /// Attaches a hardware thread. Threads are fixed after machine init.
    pub fn add_thread(&mut self, thread: ThreadContext) {
        self.threads.push(thread);
    }

    /// Executes one cycle of the entire core state machine. Returns true
    /// when the simulation should exit.
    pub fn runcycle(&mut self, config: &Config, stopped: &mut [bool]) -> bool {
        let mut exiting = false;
        let nthreads = self.threads.len();
        let cycle = self.shared.cycle;

        if config.event_log_enabled
            && !self.shared.eventlog.enabled()
            && cycle >= config.start_log_at_iteration
        {
            self.shared
                .eventlog
                .enable(config.flush_event_log_every_cycle);
        }

        // Edge-detect pending interrupts; deliver at the next EOM commit.
        for thread in &mut self.threads {
            let pending = thread.ctx.check_events();
            let edge = !thread.prev_interrupts_pending && pending;
            thread.handle_interrupt_at_next_eom |= edge;
            thread.prev_interrupts_pending = pending;
        }

        // Per-cycle resource masks.
        self.shared.fu_avail = FU_ALL;
        self.shared.banks_used = 0;
        for thread in &mut self.threads {
            thread.loads_in_this_cycle = 0;
        }

        // Clock the cache subsystem, then wake any miss-fill loads.
        self.shared.caches.clock();
        let fills = self.shared.caches.take_completed_fills();
        if !fills.is_empty() {
            for tid in 0..nthreads {
                pipeline::writeback::wakeup_cache_misses(
                    &mut self.threads[tid],
                    &mut self.shared,
                    &fills,
                );
            }
        }

        // Backend pass, round-robin over running threads.
        let mut commitrc = vec![CommitResult::None; nthreads];
        for permute in 0..nthreads {
            let tid = (self.round_robin_tid + permute) % nthreads;
            if !self.threads[tid].ctx.running() {
                continue;
            }
            commitrc[tid] = pipeline::commit::commit(&mut self.threads[tid], &mut self.shared);
            for cluster in 0..MAX_CLUSTERS {
                pipeline::writeback::writeback_cluster(
                    &mut self.threads[tid],
                    &mut self.shared,
                    cluster,
                );
            }
            for cluster in 0..MAX_CLUSTERS {
                pipeline::writeback::transfer_cluster(
                    &mut self.threads[tid],
                    &mut self.shared,
                    cluster,
                );
            }
        }

        // Issue queue clock sits between transfer and issue so a zero-cycle
        // forwarding latency behaves as a direct bypass.
        for iq in &mut self.shared.issueqs {
            iq.clock();
        }

        // Issue whatever is ready.
        for cluster in 0..MAX_CLUSTERS {
            pipeline::issue::issue_cluster(
                &mut self.threads,
                &mut self.shared,
                cluster,
                self.round_robin_tid,
            );
        }

        // Frontend pass, round-robin. Rename only runs when dispatch made
        // progress without triggering deadlock recovery.
        for permute in 0..nthreads {
            let tid = (self.round_robin_tid + permute) % nthreads;
            if !self.threads[tid].ctx.running() {
                continue;
            }
            for cluster in 0..MAX_CLUSTERS {
                pipeline::writeback::complete_cluster(
                    &mut self.threads[tid],
                    &mut self.shared,
                    cluster,
                );
            }
            let dispatchrc =
                pipeline::frontend::dispatch(&mut self.threads[tid], &mut self.shared);
            if dispatchrc >= 0 {
                pipeline::frontend::frontend(&mut self.threads[tid], &mut self.shared);
                pipeline::rename::rename(&mut self.threads[tid], &mut self.shared);
            }
        }

        // Fetch in ICOUNT priority order: fewest frontend-resident uops
        // first; non-running threads last.
        let mut order: Vec<usize> = (0..nthreads).collect();
        if nthreads > 1 {
            order.sort_by_key(|&tid| {
                if self.threads[tid].ctx.running() {
                    self.threads[tid].get_priority()
                } else {
                    usize::MAX
                }
            });
        }
        for tid in order {
            if !self.threads[tid].ctx.running() {
                continue;
            }
            pipeline::fetch::fetch(&mut self.threads[tid], &mut self.shared);
        }

        self.round_robin_tid = (self.round_robin_tid + 1) % nthreads.max(1);

        if self.shared.eventlog.enabled() && self.shared.eventlog.flush_every_cycle() {
            let _ = self.shared.eventlog.flush_to_sink();
        }

        // Dispatch exceptional commit outcomes.
        for tid in 0..nthreads {
            if !self.threads[tid].ctx.running() {
                continue;
            }
            match commitrc[tid] {
                CommitResult::Ok | CommitResult::None => {}
                CommitResult::OkFlush => {
                    self.flush_pipeline(tid);
                }
                CommitResult::Smc { mfn } => {
                    // Never a global flush: the other thread may be mid
                    // instruction and a global flush would corrupt it.
                    self.threads[tid].stats.smc_flushes += 1;
                    self.threads[tid].smc_invalidate_pending = Some(mfn);
                    self.flush_pipeline(tid);
                    if let Some(mfn) = self.threads[tid].smc_invalidate_pending.take() {
                        self.shared.decoder.invalidate(mfn);
                    }
                }
                CommitResult::Exception {
                    exception,
                    virtaddr,
                } => {
                    self.threads[tid].stats.exceptions += 1;
                    self.flush_pipeline(tid);
                    let thread = &mut self.threads[tid];
                    thread.ctx.propagate_exception(exception, virtaddr);
                    let rip = thread.ctx.arch_reg(crate::isa::ArchReg::Rip);
                    thread.redirect_fetch(rip);
                    if !thread.ctx.running() {
                        stopped[thread.vcpuid] = true;
                    }
                }
                CommitResult::Barrier {
                    assist_id,
                    next_rip,
                } => {
                    // The machine layer dispatches the assist handler; the
                    // core releases pipeline resources and latches the id.
                    self.threads[tid].stats.assists += 1;
                    self.threads[tid]
                        .ctx
                        .set_arch_reg(crate::isa::ArchReg::Rip, next_rip);
                    self.flush_pipeline(tid);
                    self.threads[tid].pending_assist = Some(assist_id);
                }
                CommitResult::Interrupt => {
                    self.threads[tid].stats.interrupts += 1;
                    self.threads[tid].handle_interrupt_at_next_eom = false;
                    self.flush_pipeline(tid);
                    let thread = &mut self.threads[tid];
                    thread.ctx.event_upcall();
                    let rip = thread.ctx.arch_reg(crate::isa::ArchReg::Rip);
                    thread.redirect_fetch(rip);
                }
                CommitResult::Stop => {
                    self.flush_pipeline(tid);
                    self.threads[tid].stall_frontend = true;
                    self.threads[tid].stop_at_next_eom = false;
                    stopped[self.threads[tid].vcpuid] = true;
                }
            }
        }

        // Deadlock watchdog.
        for thread in &self.threads {
            if !thread.ctx.running() {
                continue;
            }
            if cycle.saturating_sub(thread.last_commit_at_cycle) > WATCHDOG_CYCLES {
                warn!(
                    vcpu = thread.vcpuid,
                    cycle,
                    last_commit = thread.last_commit_at_cycle,
                    "no commits for {} cycles; pipeline may be deadlocked",
                    cycle - thread.last_commit_at_cycle
                );
                exiting = true;
            }
        }

        self.shared.cycle += 1;
        self.shared.stats.cycles += 1;
        exiting
    }

    /// Flushes one thread's pipeline: every in-flight uop is discarded and
    /// both rename tables return to the null register, reading committed
    /// state from the architectural context.
    pub fn flush_pipeline(&mut self, tid: usize) {
        // Release externally held resources first.
        let vcpuid = self.threads[tid].vcpuid;
        for idx in self.threads[tid].rob.iter_program_order().collect::<Vec<_>>() {
            let slot = self.threads[tid].rob.get(idx).lfrq_slot;
            if let Some(slot) = slot {
                self.shared.caches.cancel_fill(slot);
            }
        }
        self.shared.interlocks.release_all(vcpuid);
        for iq in &mut self.shared.issueqs {
            iq.clear_thread(tid);
        }

        // Force-free every physreg this thread holds.
        for id in 1..self.shared.physregs.size() as PhysRegId {
            let reg = self.shared.physregs.get(id);
            if reg.threadid == tid as u8 && reg.state != PhysregState::Free {
                self.shared.physregs.get_mut(id).refcount = 0;
                self.shared.physregs.free(id);
            }
        }

        let cycle = self.shared.cycle;
        let thread = &mut self.threads[tid];
        thread.rob.reset();
        thread.lsq.reset();
        thread.fetchq.clear();
        thread.specrrt = physreg::RegisterRenameTable::new();
        thread.commitrrt = physreg::RegisterRenameTable::new();
        thread.dispatch_deadlock_countdown = 0;
        thread.last_commit_at_cycle = cycle;
        thread.stats.pipeline_flushes += 1;
        let rip = thread.ctx.arch_reg(crate::isa::ArchReg::Rip);
        thread.redirect_fetch(rip);
        thread.stall_frontend = false;

        self.recompute_null_refcount();
    }

    /// Flushes every thread of this core.
    pub fn flush_pipeline_all(&mut self) {
        for tid in 0..self.threads.len() {
            self.flush_pipeline(tid);
        }
    }

    /// Recounts the null register's references after a bulk flush: its pin
    /// plus every rename table slot and ROB operand slot pointing at it.
    fn recompute_null_refcount(&mut self) {
        let mut refs = 1u32;
        for thread in &self.threads {
            for (_, phys) in thread.specrrt.iter() {
                refs += u32::from(phys == PHYS_REG_NULL);
            }
            for (_, phys) in thread.commitrrt.iter() {
                refs += u32::from(phys == PHYS_REG_NULL);
            }
            for idx in thread.rob.iter_program_order() {
                for op in &thread.rob.get(idx).operands {
                    refs += u32::from(op.physreg == PHYS_REG_NULL);
                }
            }
        }
        self.shared.physregs.get_mut(PHYS_REG_NULL).refcount = refs;
    }

    /// Validates physical register reference counts against every table
    /// and operand slot that can hold a reference. Debug aid; panics on
    /// mismatch.
    pub fn check_refcounts(&self) {
        let size = self.shared.physregs.size();
        let mut expected = vec![0u32; size];
        expected[PHYS_REG_NULL as usize] = 1; // the pin

        for thread in &self.threads {
            for (_, phys) in thread.specrrt.iter() {
                expected[phys as usize] += 1;
            }
            for (_, phys) in thread.commitrrt.iter() {
                expected[phys as usize] += 1;
            }
            for idx in thread.rob.iter_program_order() {
                for op in &thread.rob.get(idx).operands {
                    expected[op.physreg as usize] += 1;
                }
            }
        }

        for id in 0..size {
            let actual = self.shared.physregs.get(id as PhysRegId).refcount;
            assert_eq!(
                actual, expected[id],
                "physreg r{id} refcount is {actual} but should be {}",
                expected[id]
            );
        }
    }

    /// Validates ROB entry/list consistency and issue queue accounting.
    pub fn check_rob(&self) {
        for thread in &self.threads {
            thread.rob.check();
        }
        for iq in &self.shared.issueqs {
            iq.check();
        }
    }

    /// Dumps per-thread and shared state.
    pub fn dump_state(&self, w: &mut dyn std::io::Write) -> std::io::Result<()> {
        writeln!(w, "Core {} state at cycle {}:", self.shared.coreid, self.shared.cycle)?;
        for thread in &self.threads {
            writeln!(
                w,
                "  thread {} (vcpu {}): rob {} lsq {} fetchq {} fetchrip {:#x}",
                thread.threadid,
                thread.vcpuid,
                thread.rob.len(),
                thread.lsq.len(),
                thread.fetchq.len(),
                thread.fetchrip
            )?;
            writeln!(w, "  SpecRRT:")?;
            for (reg, phys) in thread.specrrt.iter() {
                if phys != PHYS_REG_NULL {
                    writeln!(w, "    {reg} -> r{phys}")?;
                }
            }
            writeln!(w, "  CommitRRT:")?;
            for (reg, phys) in thread.commitrrt.iter() {
                if phys != PHYS_REG_NULL {
                    writeln!(w, "    {reg} -> r{phys}")?;
                }
            }
        }
        writeln!(
            w,
            "  physregs: {} free, {} arch, {} pendingfree; {} allocations, {} frees",
            self.shared.physregs.free_count(),
            self.shared.physregs.state_count(PhysregState::Arch),
            self.shared.physregs.state_count(PhysregState::PendingFree),
            self.shared.physregs.allocations,
            self.shared.physregs.frees,
        )?;
        writeln!(
            w,
            "  unaligned predictor: {} bits set",
            self.shared.unaligned_predictor.popcount()
        )?;
        writeln!(w, "  interlocks: {} lines held", self.shared.interlocks.len())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifc::{BtbPredictor, FixedLatencyCaches, ProgramDecoder, SimContext};
    use crate::isa::ArchReg;
    use crate::isa::asm::Assembler;

    fn core_with(program: &[crate::isa::Uop]) -> OutOfOrderCore {
        let mut decoder = ProgramDecoder::new();
        decoder.add_program(program);
        let config = Config::default();
        let mut core = OutOfOrderCore::new(
            0,
            &config,
            Box::new(decoder),
            Box::new(FixedLatencyCaches::new(8)),
        );
        core.add_thread(ThreadContext::new(
            0,
            Box::new(SimContext::new(0, 65536, 0x1000)),
            Box::new(BtbPredictor::new()),
        ));
        core
    }

    #[test]
    fn test_runcycle_commits_a_simple_program() {
        let mut asm = Assembler::new(0x1000);
        asm.movi(ArchReg::Rax, 5).addi(ArchReg::Rax, ArchReg::Rax, 3);
        let mut core = core_with(&asm.finish());
        let config = Config::default();
        let mut stopped = [false; 1];

        for _ in 0..40 {
            let _ = core.runcycle(&config, &mut stopped);
        }
        assert_eq!(core.threads[0].stats.insns_committed, 2);
        assert_eq!(core.threads[0].ctx.arch_reg(ArchReg::Rax), 8);
        core.check_refcounts();
        core.check_rob();
    }

    #[test]
    fn test_flush_pipeline_is_idempotent() {
        let mut asm = Assembler::new(0x1000);
        asm.movi(ArchReg::Rax, 5).movi(ArchReg::Rbx, 6);
        let mut core = core_with(&asm.finish());
        let config = Config::default();
        let mut stopped = [false; 1];
        for _ in 0..6 {
            let _ = core.runcycle(&config, &mut stopped);
        }

        core.flush_pipeline(0);
        let free_after_first = core.shared.physregs.free_count();
        assert!(core.threads[0].rob.is_empty());
        core.check_refcounts();

        core.flush_pipeline(0);
        assert_eq!(core.shared.physregs.free_count(), free_after_first);
        assert!(core.threads[0].rob.is_empty());
        core.check_refcounts();
    }

    #[test]
    fn test_watchdog_detects_deadlock() {
        // A program whose first fetch fails leaves the thread unable to
        // ever commit; the watchdog must eventually request exit.
        let mut core = core_with(&[]);
        let config = Config::default();
        let mut stopped = [false; 1];
        let mut exited = false;
        for _ in 0..(WATCHDOG_CYCLES + 8) {
            if core.runcycle(&config, &mut stopped) {
                exited = true;
                break;
            }
        }
        assert!(exited);
    }
}
