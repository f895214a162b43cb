//! Command-line driver for the smtsim out-of-order core simulator.
//!
//! Builds a machine from a JSON configuration (or defaults), loads the
//! built-in demo workload on every vcpu, runs to completion, and prints
//! the statistics report.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use smtsim_core::config::Config;
use smtsim_core::ifc::{BtbPredictor, FixedLatencyCaches, ProgramDecoder, SimContext};
use smtsim_core::isa::ArchReg;
use smtsim_core::isa::asm::Assembler;
use smtsim_core::isa::uop::Uop;
use smtsim_core::machine::{ExitReason, OutOfOrderMachine, VcpuParts};

/// Cycle-accurate out-of-order SMT core simulator.
#[derive(Debug, Parser)]
#[command(name = "smtsim", version, about)]
struct Args {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after this many cycles (overrides the config).
    #[arg(long)]
    cycles: Option<u64>,

    /// Number of vcpus (overrides the config).
    #[arg(long)]
    vcpus: Option<usize>,

    /// Run all vcpus as SMT threads of one core.
    #[arg(long)]
    smt: bool,

    /// Iterations of the demo workload loop.
    #[arg(long, default_value_t = 1000)]
    iterations: u64,

    /// Statistics sections to print (default: all).
    #[arg(long)]
    stats: Vec<String>,

    /// Dump machine state (and buffered events) to stderr at exit.
    #[arg(long)]
    dump_state: bool,
}

/// Demo workload: a counted accumulation loop with a store/load pair per
/// iteration, ending in the exit assist.
fn demo_program(iterations: u64) -> Vec<Uop> {
    let mut asm = Assembler::new(0x1000);
    asm.movi(ArchReg::Rax, 0) // sum
        .movi(ArchReg::Rcx, iterations as i64) // counter
        .movi(ArchReg::Rsi, 0x8000); // buffer
    let loop_top = asm.here();
    asm.add(ArchReg::Rax, ArchReg::Rax, ArchReg::Rcx)
        .st(ArchReg::Rsi, 0, ArchReg::Rax)
        .ld(ArchReg::Rbx, ArchReg::Rsi, 0)
        .addi(ArchReg::Rcx, ArchReg::Rcx, -1)
        .br_clear(ArchReg::Zf, loop_top)
        .exit();
    asm.finish()
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str(&text)
                .map_err(|e| format!("cannot parse {}: {e}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(cycles) = args.cycles {
        config.stop_after_cycles = Some(cycles);
    }
    if let Some(vcpus) = args.vcpus {
        config.vcpus = vcpus;
    }
    config.smt |= args.smt;
    if args.dump_state {
        config.dump_state_now = true;
    }
    Ok(config)
}

fn run(args: &Args) -> Result<ExitReason, String> {
    let config = load_config(args)?;
    let program = demo_program(args.iterations);

    let vcpus = (0..config.vcpus)
        .map(|vcpuid| VcpuParts {
            ctx: Box::new(SimContext::new(vcpuid, 1 << 20, 0x1000)),
            branchpred: Box::new(BtbPredictor::new()),
        })
        .collect();
    let mut machine = OutOfOrderMachine::init(config, vcpus, &mut |_| {
        let mut decoder = ProgramDecoder::new();
        decoder.add_program(&program);
        (Box::new(decoder), Box::new(FixedLatencyCaches::new(8)))
    })
    .map_err(|e| e.to_string())?;

    let reason = machine.run();

    let stats = machine.update_stats();
    let mut stdout = std::io::stdout();
    stats
        .write_sections(&mut stdout, &args.stats)
        .map_err(|e| e.to_string())?;
    Ok(reason)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(ExitReason::AllStopped) => ExitCode::SUCCESS,
        Ok(ExitReason::Aborted) => {
            error!("simulation aborted");
            ExitCode::FAILURE
        }
        Err(message) => {
            error!("{message}");
            ExitCode::FAILURE
        }
    }
}
