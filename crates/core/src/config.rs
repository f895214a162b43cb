//! Configuration system for the out-of-order core simulator.
//!
//! This module defines the configuration structures and the fixed pipeline
//! geometry. It provides:
//! 1. **Geometry:** compile-time structure sizes and widths (not runtime
//!    reconfigurable; changing them is a model change, not a config change).
//! 2. **Structures:** the immutable [`Config`] record passed to machine init,
//!    with event log, logging, and stop-condition options.
//!
//! Configuration is supplied as JSON (CLI `--config`) or via `Config::default()`.

use serde::Deserialize;

/// Number of reorder buffer entries per thread.
pub const ROB_SIZE: usize = 64;

/// Number of load/store queue entries per thread (loads and stores share it).
pub const LSQ_SIZE: usize = 32;

/// Fetch queue depth per thread.
pub const FETCH_QUEUE_SIZE: usize = 16;

/// Maximum uops fetched per thread per cycle.
pub const FETCH_WIDTH: usize = 4;

/// Maximum uops renamed per thread per cycle.
pub const FRONTEND_WIDTH: usize = 4;

/// Maximum uops dispatched per thread per cycle.
pub const DISPATCH_WIDTH: usize = 4;

/// Maximum uops written back per thread per cycle.
pub const WRITEBACK_WIDTH: usize = 4;

/// Maximum uops committed per thread per cycle (whole instructions only).
pub const COMMIT_WIDTH: usize = 4;

/// Depth of the frontend delay pipeline between rename and dispatch.
pub const FRONTEND_STAGES: u32 = 4;

/// Number of issue clusters (`int0`, `int1`, `mem`).
pub const MAX_CLUSTERS: usize = 3;

/// Issue queue entries per cluster.
pub const ISSUE_QUEUE_SIZE: usize = 16;

/// Maximum intercluster forwarding latency in cycles.
pub const MAX_FORWARDING_LATENCY: u8 = 1;

/// Physical register file size (single integer+flags file).
pub const PHYS_REG_FILE_SIZE: usize = 128;

/// Hardware threads per core under SMT.
pub const MAX_THREADS_PER_CORE: usize = 2;

/// Maximum simulated virtual CPUs across all cores.
pub const MAX_VCPUS: usize = 8;

/// Cycles a uop may sit undispatchable before redispatch-all recovery fires.
pub const DISPATCH_DEADLOCK_THRESHOLD: u32 = 64;

/// Slots in the unaligned load/store predictor (indexed by a hash of rip).
pub const UNALIGNED_PREDICTOR_SIZE: usize = 256;

/// Load fill request queue slots (outstanding D-cache misses).
pub const LFRQ_SIZE: usize = 8;

/// Process-wide memory interlock buffer entries (ld.acq/st.rel lines).
pub const MAX_INTERLOCKS: usize = 4;

/// L1 D-cache banks; at most one load may access a bank per cycle.
pub const L1_DCACHE_BANKS: usize = 8;

/// Maximum loads issued per thread per cycle.
pub const MAX_LOADS_PER_CYCLE: usize = 2;

/// Cycles without a commit before the deadlock watchdog aborts the run.
pub const WATCHDOG_CYCLES: u64 = 1024 * MAX_VCPUS as u64;

/// Reserved issue queue entries per thread: `isqrt(ISSUE_QUEUE_SIZE / MAX_THREADS_PER_CORE)`.
///
/// Guarantees each thread a minimum share of every issue queue so one stalled
/// thread cannot starve the other out of the shared pool.
pub fn reserved_iq_entries() -> usize {
    let per_thread = ISSUE_QUEUE_SIZE / MAX_THREADS_PER_CORE;
    let mut r = 1;
    while (r + 1) * (r + 1) <= per_thread {
        r += 1;
    }
    r
}

/// Default configuration constants.
mod defaults {
    /// Default event log ring buffer capacity in records.
    pub const EVENT_LOG_RING_BUFFER_SIZE: usize = 32768;

    /// Default log verbosity level.
    pub const LOGLEVEL: u8 = 0;
}

/// Root configuration structure for a simulation run.
///
/// # Examples
///
/// Deserializing from JSON:
///
/// ```
/// use smtsim_core::config::Config;
///
/// let json = r#"{
///     "vcpus": 2,
///     "smt": true,
///     "event_log_enabled": true,
///     "event_log_ring_buffer_size": 4096,
///     "flush_event_log_every_cycle": false,
///     "stop_after_cycles": 100000
/// }"#;
///
/// let config: Config = serde_json::from_str(json).unwrap();
/// assert!(config.smt);
/// assert_eq!(config.event_log_ring_buffer_size, 4096);
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Number of virtual CPUs to simulate.
    #[serde(default = "Config::default_vcpus")]
    pub vcpus: usize,

    /// SMT mode: all vcpus share one core as hardware threads.
    /// When false, each vcpu gets its own core.
    #[serde(default)]
    pub smt: bool,

    /// Whether to record per-cycle events into the ring buffer.
    #[serde(default)]
    pub event_log_enabled: bool,

    /// Event log ring buffer capacity in records.
    #[serde(default = "Config::default_ring_buffer_size")]
    pub event_log_ring_buffer_size: usize,

    /// Flush the event log to its sink every cycle instead of on overflow.
    #[serde(default)]
    pub flush_event_log_every_cycle: bool,

    /// Cycle at which logging becomes active (0 = from the start).
    #[serde(default)]
    pub start_log_at_iteration: u64,

    /// Log verbosity level for simulator diagnostics.
    #[serde(default = "Config::default_loglevel")]
    pub loglevel: u8,

    /// On a stop request, exit immediately instead of draining to the next
    /// instruction boundary and flushing pipelines.
    #[serde(default)]
    pub abort_at_end: bool,

    /// Dump full machine state at the end of the run.
    #[serde(default)]
    pub dump_state_now: bool,

    /// Request a stop once this many cycles have elapsed.
    #[serde(default)]
    pub stop_after_cycles: Option<u64>,
}

impl Config {
    /// Returns the default vcpu count.
    fn default_vcpus() -> usize {
        1
    }

    /// Returns the default event log ring buffer capacity.
    fn default_ring_buffer_size() -> usize {
        defaults::EVENT_LOG_RING_BUFFER_SIZE
    }

    /// Returns the default log verbosity level.
    fn default_loglevel() -> u8 {
        defaults::LOGLEVEL
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vcpus: 1,
            smt: false,
            event_log_enabled: false,
            event_log_ring_buffer_size: defaults::EVENT_LOG_RING_BUFFER_SIZE,
            flush_event_log_every_cycle: false,
            start_log_at_iteration: 0,
            loglevel: defaults::LOGLEVEL,
            abort_at_end: false,
            dump_state_now: false,
            stop_after_cycles: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.vcpus, 1);
        assert!(!config.smt);
        assert!(!config.event_log_enabled);
        assert_eq!(
            config.event_log_ring_buffer_size,
            defaults::EVENT_LOG_RING_BUFFER_SIZE
        );
        assert_eq!(config.stop_after_cycles, None);
    }

    #[test]
    fn test_json_partial_override() {
        let json = r#"{ "vcpus": 4, "event_log_enabled": true }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.vcpus, 4);
        assert!(config.event_log_enabled);
        // Unspecified fields fall back to defaults
        assert!(!config.flush_event_log_every_cycle);
        assert_eq!(config.loglevel, 0);
    }

    #[test]
    fn test_reserved_iq_entries() {
        // isqrt(16 / 2) = isqrt(8) = 2
        assert_eq!(reserved_iq_entries(), 2);
        // Reservation must leave a shared pool
        assert!(reserved_iq_entries() * MAX_THREADS_PER_CORE < ISSUE_QUEUE_SIZE);
    }
}
