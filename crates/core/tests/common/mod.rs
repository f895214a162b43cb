//! Shared test infrastructure.
//!
//! `TestBench` wires a machine to behavioral collaborators around a uop
//! program: build the program with the assembler, run the machine (to the
//! exit assist or a cycle bound), then inspect committed state and
//! statistics.

use smtsim_core::config::Config;
use smtsim_core::ifc::{BtbPredictor, FixedLatencyCaches, ProgramDecoder, SimContext};
use smtsim_core::isa::uop::Uop;
use smtsim_core::isa::ArchReg;
use smtsim_core::machine::{ExitReason, OutOfOrderMachine, VcpuParts};
use smtsim_core::stats::SimStats;

/// A machine under test plus its build parameters.
pub struct TestBench {
    pub machine: OutOfOrderMachine,
}

impl TestBench {
    /// Single-vcpu bench with default behavioral collaborators.
    pub fn new(program: &[Uop]) -> Self {
        Self::build(program, Config::default(), FixedLatencyCaches::new(8))
    }

    /// Single-vcpu bench with event recording enabled.
    pub fn with_events(program: &[Uop]) -> Self {
        let config = Config {
            event_log_enabled: true,
            event_log_ring_buffer_size: 1 << 16,
            ..Config::default()
        };
        Self::build(program, config, FixedLatencyCaches::new(8))
    }

    /// Single-vcpu bench with a custom cache model.
    pub fn with_caches(program: &[Uop], caches: FixedLatencyCaches) -> Self {
        Self::build(program, Config::default(), caches)
    }

    /// Two SMT threads running the same program, stopped after `cycles`.
    pub fn smt_pair(program: &[Uop], cycles: u64) -> Self {
        let config = Config {
            vcpus: 2,
            smt: true,
            stop_after_cycles: Some(cycles),
            abort_at_end: true,
            ..Config::default()
        };
        Self::build(program, config, FixedLatencyCaches::new(8))
    }

    fn build(program: &[Uop], config: Config, caches: FixedLatencyCaches) -> Self {
        let program = program.to_vec();
        let mut caches = Some(caches);
        let vcpus = (0..config.vcpus)
            .map(|vcpuid| VcpuParts {
                ctx: Box::new(SimContext::new(vcpuid, 1 << 20, 0x1000)),
                branchpred: Box::new(BtbPredictor::new()),
            })
            .collect();
        let machine = OutOfOrderMachine::init(config, vcpus, &mut |_| {
            let mut decoder = ProgramDecoder::new();
            decoder.add_program(&program);
            let caches = caches
                .take()
                .unwrap_or_else(|| FixedLatencyCaches::new(8));
            (Box::new(decoder), Box::new(caches))
        })
        .expect("machine init");
        Self { machine }
    }

    /// Runs to completion and asserts a clean stop.
    pub fn run(&mut self) -> ExitReason {
        let reason = self.machine.run();
        assert_ne!(reason, ExitReason::Aborted, "simulation aborted");
        reason
    }

    /// Committed architectural register of a vcpu.
    pub fn reg(&self, vcpuid: usize, reg: ArchReg) -> u64 {
        let (core, tid) = if self.machine.config.smt {
            (0, vcpuid)
        } else {
            (vcpuid, 0)
        };
        self.machine.cores[core].threads[tid].ctx.arch_reg(reg)
    }

    /// End-of-run statistics.
    pub fn stats(&self) -> SimStats {
        self.machine.update_stats()
    }

    /// Buffered event records of core 0.
    pub fn events(&self) -> Vec<smtsim_core::event::Event> {
        self.machine.cores[0]
            .shared
            .eventlog
            .iter()
            .copied()
            .collect()
    }
}
