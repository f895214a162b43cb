//! Out-of-order SMT core simulator library.
//!
//! This crate implements a cycle-accurate, out-of-order, superscalar core model
//! with simultaneous multithreading, in the style of an x86-64 microarchitecture:
//! 1. **Core:** register-renamed, clustered-issue pipeline
//!    (fetch/rename/frontend/dispatch/issue/complete/transfer/writeback/commit).
//! 2. **Structures:** reorder buffer, load/store queue with store-to-load
//!    forwarding, issue queues with per-thread reservation, physical register
//!    files with refcounted lifetimes.
//! 3. **Recovery:** misspeculation annulment, dependent-uop redispatch, and
//!    per-thread pipeline flushes.
//! 4. **Machine:** multi-core/SMT topology, outer run loop, stop logic, and a
//!    named machine-model registry.
//! 5. **Observability:** per-cycle event log with text and binary serializers,
//!    plus end-of-run statistics.
//!
//! The instruction decoder, memory subsystem, and architectural context are
//! external collaborators, supplied through the traits in [`ifc`]; behavioral
//! implementations are provided for standalone runs and tests.

/// Simulator configuration (defaults, pipeline geometry, event log options).
pub mod config;
/// Core model: pipeline stages, ROB, LSQ, rename machinery, cycle driver.
pub mod core;
/// Per-cycle event log: record types, ring buffer, serializers.
pub mod event;
/// External collaborator traits and behavioral models.
pub mod ifc;
/// Micro-op definitions: opcodes, operands, functional execution.
pub mod isa;
/// Machine layer: cores + threads topology, run loop, model registry.
pub mod machine;
/// Simulation statistics collection and reporting.
pub mod stats;

/// Root configuration type; use `Config::default()` or deserialize from JSON.
pub use crate::config::Config;
/// The out-of-order core: owns shared structures and the per-cycle driver.
pub use crate::core::OutOfOrderCore;
/// Top-level machine; construct with `OutOfOrderMachine::init`.
pub use crate::machine::OutOfOrderMachine;
/// Aggregated simulation statistics.
pub use crate::stats::SimStats;
