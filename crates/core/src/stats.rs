//! Simulation statistics collection and reporting.
//!
//! This module tracks performance counters for the simulator. It provides:
//! 1. **Per-thread counters:** committed uops/instructions, speculation
//!    outcomes, and resource stall tallies, updated by the pipeline stages.
//! 2. **Rollup:** [`SimStats`] aggregates threads and cores at end of run
//!    and derives IPC/uIPC.
//! 3. **Reporting:** a sectioned text report.

use std::time::Instant;

/// Per-hardware-thread performance counters.
#[derive(Clone, Debug, Default)]
pub struct ThreadStats {
    /// Uops committed.
    pub uops_committed: u64,
    /// x86 instructions committed (EOM uops).
    pub insns_committed: u64,
    /// Branches committed.
    pub branches_committed: u64,
    /// Branches committed that had mispredicted.
    pub branch_mispredicts: u64,
    /// Loads committed.
    pub loads_committed: u64,
    /// Stores committed.
    pub stores_committed: u64,
    /// Loads satisfied (fully or partially) by store forwarding.
    pub loads_forwarded: u64,
    /// Load issue replays (wait on store, locks, banks, LFRQ).
    pub load_replays: u64,
    /// L1 bank conflict replays.
    pub bank_conflicts: u64,
    /// Annulments triggered by aliased loads.
    pub aliased_load_annuls: u64,
    /// Uops annulled by misspeculation recovery.
    pub uops_annulled: u64,
    /// Uops returned to dispatch by replay recovery.
    pub uops_redispatched: u64,
    /// Rename stalls: ROB full.
    pub rob_full_stalls: u64,
    /// Rename stalls: physical register file full.
    pub physregs_full_stalls: u64,
    /// Rename stalls: load/store queue full.
    pub lsq_full_stalls: u64,
    /// Rename stalls: no capable cluster's issue queue could accept the thread.
    pub iq_full_stalls: u64,
    /// Dispatch failures: no cluster had room or capability.
    pub no_cluster_stalls: u64,
    /// Issue failures: no functional unit available.
    pub no_fu_stalls: u64,
    /// Interrupts delivered.
    pub interrupts: u64,
    /// Architectural exceptions surfaced at commit.
    pub exceptions: u64,
    /// Self-modifying-code pipeline flushes.
    pub smc_flushes: u64,
    /// Total pipeline flushes.
    pub pipeline_flushes: u64,
    /// Assists (barriers) dispatched.
    pub assists: u64,
}

/// Per-core counters.
#[derive(Clone, Debug, Default)]
pub struct CoreStats {
    /// Cycles simulated by this core.
    pub cycles: u64,
    /// Dispatch deadlock recoveries (redispatch-all).
    pub dispatch_deadlock_recoveries: u64,
    /// Physical registers reclaimed.
    pub physregs_reclaimed: u64,
    /// D-cache probes observed by the cache model.
    pub dcache_probes: u64,
}

/// Aggregated end-of-run statistics.
#[derive(Clone, Debug)]
pub struct SimStats {
    start_time: Instant,
    /// Total simulated cycles.
    pub cycles: u64,
    /// Per-thread counters, indexed by vcpu.
    pub threads: Vec<ThreadStats>,
    /// Per-core counters.
    pub cores: Vec<CoreStats>,
}

impl Default for SimStats {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            cycles: 0,
            threads: Vec::new(),
            cores: Vec::new(),
        }
    }
}

/// Section names for selective stats output.
///
/// Valid identifiers: `"summary"`, `"commit"`, `"speculation"`, `"stalls"`.
/// Pass an empty slice to `print_sections` to print all sections.
pub const STATS_SECTIONS: &[&str] = &["summary", "commit", "speculation", "stalls"];

impl SimStats {
    /// Total instructions committed across all threads.
    pub fn total_insns(&self) -> u64 {
        self.threads.iter().map(|t| t.insns_committed).sum()
    }

    /// Total uops committed across all threads.
    pub fn total_uops(&self) -> u64 {
        self.threads.iter().map(|t| t.uops_committed).sum()
    }

    /// Instructions per cycle across the machine.
    pub fn ipc(&self) -> f64 {
        self.total_insns() as f64 / self.cycles.max(1) as f64
    }

    /// Uops per cycle across the machine.
    pub fn uipc(&self) -> f64 {
        self.total_uops() as f64 / self.cycles.max(1) as f64
    }

    /// Prints only the requested statistics sections to `w`.
    pub fn write_sections(&self, w: &mut dyn std::io::Write, sections: &[String]) -> std::io::Result<()> {
        let want = |s: &str| sections.is_empty() || sections.iter().any(|x| x == s);
        let seconds = self.start_time.elapsed().as_secs_f64();
        let cyc = self.cycles.max(1);

        if want("summary") {
            let khz = (self.cycles as f64 / seconds) / 1000.0;
            writeln!(w, "\n==========================================================")?;
            writeln!(w, "OUT-OF-ORDER CORE SIMULATION STATISTICS")?;
            writeln!(w, "==========================================================")?;
            writeln!(w, "host_seconds             {seconds:.4} s")?;
            writeln!(w, "sim_cycles               {}", self.cycles)?;
            writeln!(w, "sim_freq                 {khz:.2} kHz")?;
            writeln!(w, "sim_insns                {}", self.total_insns())?;
            writeln!(w, "sim_uops                 {}", self.total_uops())?;
            writeln!(w, "sim_ipc                  {:.4}", self.ipc())?;
            writeln!(w, "sim_uipc                 {:.4}", self.uipc())?;
            writeln!(w, "----------------------------------------------------------")?;
        }
        if want("commit") {
            writeln!(w, "COMMIT BREAKDOWN")?;
            for (vcpu, t) in self.threads.iter().enumerate() {
                writeln!(
                    w,
                    "  vcpu{vcpu}: insns {:<10} uops {:<10} ipc {:.4}",
                    t.insns_committed,
                    t.uops_committed,
                    t.insns_committed as f64 / cyc as f64
                )?;
                writeln!(
                    w,
                    "         loads {:<10} stores {:<9} branches {}",
                    t.loads_committed, t.stores_committed, t.branches_committed
                )?;
            }
            writeln!(w, "----------------------------------------------------------")?;
        }
        if want("speculation") {
            writeln!(w, "SPECULATION")?;
            for (vcpu, t) in self.threads.iter().enumerate() {
                let br = t.branches_committed.max(1);
                writeln!(
                    w,
                    "  vcpu{vcpu}: mispredicts {:<6} ({:.2}%) annulled {:<7} redispatched {}",
                    t.branch_mispredicts,
                    (t.branch_mispredicts as f64 / br as f64) * 100.0,
                    t.uops_annulled,
                    t.uops_redispatched
                )?;
                writeln!(
                    w,
                    "         fwd {:<6} replays {:<6} aliased {:<6} flushes {}",
                    t.loads_forwarded, t.load_replays, t.aliased_load_annuls, t.pipeline_flushes
                )?;
            }
            writeln!(w, "----------------------------------------------------------")?;
        }
        if want("stalls") {
            writeln!(w, "STALLS")?;
            for (vcpu, t) in self.threads.iter().enumerate() {
                writeln!(
                    w,
                    "  vcpu{vcpu}: rob_full {:<6} physregs_full {:<6} lsq_full {:<6} iq_full {}",
                    t.rob_full_stalls, t.physregs_full_stalls, t.lsq_full_stalls, t.iq_full_stalls
                )?;
                writeln!(
                    w,
                    "         no_cluster {:<5} no_fu {:<6} bank_conflicts {}",
                    t.no_cluster_stalls, t.no_fu_stalls, t.bank_conflicts
                )?;
            }
            for (coreid, c) in self.cores.iter().enumerate() {
                writeln!(
                    w,
                    "  core{coreid}: deadlock_recoveries {:<4} physregs_reclaimed {:<8} dcache_probes {}",
                    c.dispatch_deadlock_recoveries, c.physregs_reclaimed, c.dcache_probes
                )?;
            }
        }
        writeln!(w, "==========================================================")?;
        Ok(())
    }

    /// Prints all statistics sections to stdout.
    pub fn print(&self) {
        let mut stdout = std::io::stdout();
        let _ = self.write_sections(&mut stdout, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_guards_zero_cycles() {
        let stats = SimStats::default();
        assert_eq!(stats.ipc(), 0.0);
    }

    #[test]
    fn test_totals_sum_threads() {
        let mut stats = SimStats::default();
        stats.threads.push(ThreadStats {
            insns_committed: 10,
            uops_committed: 14,
            ..ThreadStats::default()
        });
        stats.threads.push(ThreadStats {
            insns_committed: 5,
            uops_committed: 7,
            ..ThreadStats::default()
        });
        stats.cycles = 10;
        assert_eq!(stats.total_insns(), 15);
        assert_eq!(stats.total_uops(), 21);
        assert!((stats.ipc() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_sections_filter() {
        let mut stats = SimStats::default();
        stats.threads.push(ThreadStats::default());
        stats.cycles = 1;

        let mut out = Vec::new();
        stats
            .write_sections(&mut out, &["summary".to_string()])
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("sim_cycles"));
        assert!(!text.contains("SPECULATION"));
    }
}
