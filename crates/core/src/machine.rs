//! Machine layer: topology, outer run loop, and the model registry.
//!
//! An [`OutOfOrderMachine`] aggregates cores and hosts the simulation loop:
//! it clocks every core each cycle, dispatches assist microcode latched by
//! barrier commits, applies the stop logic (per-vcpu stop mask, stop at the
//! next instruction boundary, immediate abort), and rolls statistics up at
//! the end of the run. Machine models are constructed through an explicit
//! [`MachineRegistry`] factory map rather than implicit static
//! registration.

use std::collections::HashMap;
use std::io;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, MAX_THREADS_PER_CORE, MAX_VCPUS};
use crate::core::OutOfOrderCore;
use crate::core::thread::ThreadContext;
use crate::event::text;
use crate::ifc::{
    AssistRegistry, BranchPredictorIfc, BtbPredictor, CacheModel, Context, Decoder,
    FixedLatencyCaches, ProgramDecoder,
};
use crate::isa::ArchReg;
use crate::stats::SimStats;

/// Machine construction errors.
#[derive(Debug, Error)]
pub enum MachineError {
    /// The registry has no model under this name.
    #[error("unknown machine model {0:?}")]
    UnknownModel(String),
    /// More vcpus than the topology supports.
    #[error("{requested} vcpus requested but the limit is {limit}")]
    TooManyVcpus {
        /// Requested vcpu count.
        requested: usize,
        /// Supported maximum.
        limit: usize,
    },
}

/// Why the run loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Every vcpu reached a stopping point.
    AllStopped,
    /// A core requested exit (deadlock watchdog).
    Aborted,
}

/// Per-vcpu collaborator bundle consumed by machine init.
pub struct VcpuParts {
    /// Architectural context.
    pub ctx: Box<dyn Context>,
    /// Branch predictor.
    pub branchpred: Box<dyn BranchPredictorIfc>,
}

impl std::fmt::Debug for VcpuParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcpuParts")
            .field("vcpuid", &self.ctx.vcpuid())
            .finish()
    }
}

/// Factory for a core's decoder and cache model.
pub type CorePartsFn<'a> = dyn FnMut(usize) -> (Box<dyn Decoder>, Box<dyn CacheModel>) + 'a;

/// The machine: cores, stop state, and assist microcode.
#[derive(Debug)]
pub struct OutOfOrderMachine {
    /// Cores in the machine.
    pub cores: Vec<OutOfOrderCore>,
    /// Immutable run configuration.
    pub config: Config,
    /// Per-vcpu stopped mask.
    pub stopped: Vec<bool>,
    /// Assist microcode handlers.
    pub assists: AssistRegistry,
    /// Global cycle counter.
    pub cycle: u64,
}

impl OutOfOrderMachine {
    /// Constructs cores and threads from the vcpu set. Under SMT all vcpus
    /// share one core as hardware threads; otherwise each vcpu gets its
    /// own core.
    pub fn init(
        config: Config,
        vcpus: Vec<VcpuParts>,
        core_parts: &mut CorePartsFn<'_>,
    ) -> Result<Self, MachineError> {
        let limit = if config.smt {
            MAX_THREADS_PER_CORE
        } else {
            MAX_VCPUS
        };
        if vcpus.is_empty() || vcpus.len() > limit {
            return Err(MachineError::TooManyVcpus {
                requested: vcpus.len(),
                limit,
            });
        }

        let nvcpus = vcpus.len();
        let mut cores = Vec::new();
        if config.smt {
            let (decoder, caches) = core_parts(0);
            let mut core = OutOfOrderCore::new(0, &config, decoder, caches);
            for (threadid, parts) in vcpus.into_iter().enumerate() {
                core.add_thread(ThreadContext::new(threadid, parts.ctx, parts.branchpred));
            }
            cores.push(core);
        } else {
            for (coreid, parts) in vcpus.into_iter().enumerate() {
                let (decoder, caches) = core_parts(coreid);
                let mut core = OutOfOrderCore::new(coreid, &config, decoder, caches);
                core.add_thread(ThreadContext::new(0, parts.ctx, parts.branchpred));
                cores.push(core);
            }
        }

        Ok(Self {
            cores,
            config,
            stopped: vec![false; nvcpus],
            assists: AssistRegistry::new(),
            cycle: 0,
        })
    }

    /// Runs the machine until every vcpu stops or a fatal condition hits.
    pub fn run(&mut self) -> ExitReason {
        info!(
            vcpus = self.stopped.len(),
            smt = self.config.smt,
            "starting out-of-order machine toplevel loop"
        );
        let mut exiting = false;
        let mut stopping = false;

        loop {
            for core in &mut self.cores {
                exiting |= core.runcycle(&self.config, &mut self.stopped);
            }
            self.cycle += 1;

            // Dispatch assists latched by barrier commits this cycle.
            for core in &mut self.cores {
                for thread in &mut core.threads {
                    if let Some(assist_id) = thread.pending_assist.take() {
                        if self.assists.dispatch(assist_id, thread.ctx.as_mut()) {
                            let rip = thread.ctx.arch_reg(ArchReg::Rip);
                            thread.redirect_fetch(rip);
                        } else {
                            warn!(vcpu = thread.vcpuid, assist_id, "unknown assist id");
                        }
                        if !thread.ctx.running() {
                            self.stopped[thread.vcpuid] = true;
                        }
                    }
                    // A vcpu halted by its own context counts as stopped.
                    if !thread.ctx.running() {
                        self.stopped[thread.vcpuid] = true;
                    }
                }
            }

            if let Some(limit) = self.config.stop_after_cycles
                && self.cycle >= limit
                && !stopping
            {
                if self.config.abort_at_end {
                    info!("abort at end: exiting without draining pipelines");
                    break;
                }
                info!(cycle = self.cycle, "stop requested; draining to EOM");
                for core in &mut self.cores {
                    for thread in &mut core.threads {
                        thread.stop_at_next_eom = true;
                    }
                }
                stopping = true;
            }

            if self.stopped.iter().all(|&s| s) {
                break;
            }
            if exiting {
                break;
            }
        }

        info!(cycle = self.cycle, "exiting out-of-order machine");
        if self.config.dump_state_now {
            let mut stderr = io::stderr();
            let _ = self.dump_state(&mut stderr);
        }
        if exiting {
            ExitReason::Aborted
        } else {
            ExitReason::AllStopped
        }
    }

    /// Flushes every pipeline in every core.
    pub fn flush_all_pipelines(&mut self) {
        for core in &mut self.cores {
            core.flush_pipeline_all();
        }
    }

    /// Drops all TLB state for a vcpu.
    pub fn flush_tlb(&mut self, vcpuid: usize) {
        let (coreid, tid) = self.locate(vcpuid);
        self.cores[coreid].shared.caches.flush_tlb(tid);
    }

    /// Drops the TLB entry covering `virtaddr` for a vcpu.
    pub fn flush_tlb_virt(&mut self, vcpuid: usize, virtaddr: u64) {
        let (coreid, tid) = self.locate(vcpuid);
        self.cores[coreid].shared.caches.flush_tlb_virt(tid, virtaddr);
    }

    /// Maps a vcpu to its (core, thread) slot.
    fn locate(&self, vcpuid: usize) -> (usize, usize) {
        if self.config.smt { (0, vcpuid) } else { (vcpuid, 0) }
    }

    /// Writes full machine state, including buffered events, to `w`.
    pub fn dump_state(&self, w: &mut dyn io::Write) -> io::Result<()> {
        for core in &self.cores {
            if core.shared.eventlog.enabled() {
                text::write_log(
                    w,
                    core.shared.coreid as u16,
                    core.shared.eventlog.iter(),
                )?;
            }
            core.dump_state(w)?;
        }
        Ok(())
    }

    /// Rolls per-thread and per-core counters into a [`SimStats`].
    pub fn update_stats(&self) -> SimStats {
        let mut stats = SimStats::default();
        stats.cycles = self.cycle;
        let nvcpus = self.stopped.len();
        stats.threads = vec![crate::stats::ThreadStats::default(); nvcpus];
        for core in &self.cores {
            for thread in &core.threads {
                stats.threads[thread.vcpuid] = thread.stats.clone();
            }
            let mut core_stats = core.shared.stats.clone();
            core_stats.dcache_probes = core.shared.caches.dcache_probes();
            stats.cores.push(core_stats);
        }
        stats
    }
}

/// Builds a machine from a config alone.
pub type MachineBuilder = Box<dyn Fn(&Config) -> Result<OutOfOrderMachine, MachineError>>;

/// Explicit factory map from model name to machine builder.
///
/// Replaces implicit static constructor registration: embedders create a
/// registry, register their models at init time, and build by name.
pub struct MachineRegistry {
    builders: HashMap<String, MachineBuilder>,
}

impl std::fmt::Debug for MachineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineRegistry")
            .field("models", &self.names())
            .finish()
    }
}

impl Default for MachineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registers (or replaces) a model builder.
    pub fn register(&mut self, name: &str, builder: MachineBuilder) {
        let _ = self.builders.insert(name.to_string(), builder);
    }

    /// Builds the named model.
    pub fn build(&self, name: &str, config: &Config) -> Result<OutOfOrderMachine, MachineError> {
        match self.builders.get(name) {
            Some(builder) => builder(config),
            None => Err(MachineError::UnknownModel(name.to_string())),
        }
    }

    /// Registered model names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// The default SMT out-of-order model name.
pub const DEFAULT_MODEL: &str = "smtooo";

/// Entry rip used by the behavioral default model.
pub const DEFAULT_ENTRY_RIP: u64 = 0x1000;

const DEFAULT_MEM_BYTES: usize = 1 << 20;

/// Registry with the default behavioral model under [`DEFAULT_MODEL`]:
/// `config.vcpus` simulated contexts with flat memory, BTB predictors, an
/// empty program decoder, and always-hit caches.
pub fn default_registry() -> MachineRegistry {
    let mut registry = MachineRegistry::new();
    registry.register(
        DEFAULT_MODEL,
        Box::new(|config: &Config| {
            let vcpus = (0..config.vcpus)
                .map(|vcpuid| VcpuParts {
                    ctx: Box::new(crate::ifc::SimContext::new(
                        vcpuid,
                        DEFAULT_MEM_BYTES,
                        DEFAULT_ENTRY_RIP,
                    )),
                    branchpred: Box::new(BtbPredictor::new()),
                })
                .collect();
            OutOfOrderMachine::init(config.clone(), vcpus, &mut |_| {
                (
                    Box::new(ProgramDecoder::new()),
                    Box::new(FixedLatencyCaches::new(8)),
                )
            })
        }),
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifc::SimContext;
    use crate::isa::asm::Assembler;

    fn machine_for(program: &[crate::isa::Uop], vcpus: usize, smt: bool) -> OutOfOrderMachine {
        let config = Config {
            vcpus,
            smt,
            ..Config::default()
        };
        let parts = (0..vcpus)
            .map(|vcpuid| VcpuParts {
                ctx: Box::new(SimContext::new(vcpuid, 1 << 20, 0x1000)),
                branchpred: Box::new(BtbPredictor::new()),
            })
            .collect();
        let program = program.to_vec();
        OutOfOrderMachine::init(config, parts, &mut |_| {
            let mut decoder = ProgramDecoder::new();
            decoder.add_program(&program);
            (Box::new(decoder), Box::new(FixedLatencyCaches::new(8)))
        })
        .unwrap()
    }

    #[test]
    fn test_machine_runs_to_exit_assist() {
        let mut asm = Assembler::new(0x1000);
        asm.movi(ArchReg::Rax, 11)
            .addi(ArchReg::Rax, ArchReg::Rax, 31)
            .exit();
        let mut machine = machine_for(&asm.finish(), 1, false);
        let reason = machine.run();
        assert_eq!(reason, ExitReason::AllStopped);
        assert_eq!(
            machine.cores[0].threads[0].ctx.arch_reg(ArchReg::Rax),
            42
        );
        let stats = machine.update_stats();
        assert_eq!(stats.total_insns(), 2);
    }

    #[test]
    fn test_smt_layout_shares_one_core() {
        let mut asm = Assembler::new(0x1000);
        asm.exit();
        let machine = machine_for(&asm.finish(), 2, true);
        assert_eq!(machine.cores.len(), 1);
        assert_eq!(machine.cores[0].threads.len(), 2);
    }

    #[test]
    fn test_multicore_layout() {
        let mut asm = Assembler::new(0x1000);
        asm.exit();
        let machine = machine_for(&asm.finish(), 2, false);
        assert_eq!(machine.cores.len(), 2);
    }

    #[test]
    fn test_too_many_smt_threads_rejected() {
        let config = Config {
            vcpus: 3,
            smt: true,
            ..Config::default()
        };
        let parts = (0..3)
            .map(|vcpuid| VcpuParts {
                ctx: Box::new(SimContext::new(vcpuid, 4096, 0x1000)),
                branchpred: Box::new(BtbPredictor::new()),
            })
            .collect::<Vec<_>>();
        let result = OutOfOrderMachine::init(config, parts, &mut |_| {
            (
                Box::new(ProgramDecoder::new()),
                Box::new(FixedLatencyCaches::new(8)),
            )
        });
        assert!(matches!(result, Err(MachineError::TooManyVcpus { .. })));
    }

    #[test]
    fn test_stop_after_cycles_drains() {
        let mut asm = Assembler::new(0x1000);
        // Infinite loop; only the stop request ends it
        asm.bru(0x1000);
        let config = Config {
            stop_after_cycles: Some(200),
            ..Config::default()
        };
        let parts = vec![VcpuParts {
            ctx: Box::new(SimContext::new(0, 1 << 20, 0x1000)),
            branchpred: Box::new(BtbPredictor::new()),
        }];
        let program = asm.finish();
        let mut machine = OutOfOrderMachine::init(config, parts, &mut |_| {
            let mut decoder = ProgramDecoder::new();
            decoder.add_program(&program);
            (Box::new(decoder), Box::new(FixedLatencyCaches::new(8)))
        })
        .unwrap();
        let reason = machine.run();
        assert_eq!(reason, ExitReason::AllStopped);
        assert!(machine.cycle >= 200);
    }

    #[test]
    fn test_registry_builds_default_model() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec![DEFAULT_MODEL]);
        let machine = registry.build(DEFAULT_MODEL, &Config::default());
        assert!(machine.is_ok());
        assert!(matches!(
            registry.build("nonexistent", &Config::default()),
            Err(MachineError::UnknownModel(_))
        ));
    }
}
