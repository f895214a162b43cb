//! Functional unit and issue cluster tables.
//!
//! A cluster is a group of functional units reachable with zero-cycle bypass
//! among themselves; crossing clusters costs forwarding latency. This module
//! holds the static FU/cluster geometry and the lookup tables derived from it
//! at core construction:
//! 1. `uop_executable_on_cluster[opcode]`: clusters whose FU mask intersects
//!    the opcode's allowed FUs.
//! 2. `forward_at_cycle[src][lat]`: destination cluster mask reached on
//!    forwarding cycle `lat` after completion in `src`.

use crate::config::{MAX_CLUSTERS, MAX_FORWARDING_LATENCY};
use crate::isa::uop::Opcode;

/// Number of functional units.
pub const FU_COUNT: usize = 6;

/// FU bit: first integer ALU.
pub const FU_ALU0: u32 = 1 << 0;
/// FU bit: second integer ALU.
pub const FU_ALU1: u32 = 1 << 1;
/// FU bit: integer multiplier.
pub const FU_MUL0: u32 = 1 << 2;
/// FU bit: load port.
pub const FU_LD0: u32 = 1 << 3;
/// FU bit: store port.
pub const FU_ST0: u32 = 1 << 4;
/// FU bit: second load port.
pub const FU_LD1: u32 = 1 << 5;

/// All-units mask, the per-cycle reset value of `fu_avail`.
pub const FU_ALL: u32 = (1 << FU_COUNT) - 1;

/// Names indexed by FU bit position.
pub const FU_NAMES: [&str; FU_COUNT] = ["alu0", "alu1", "mul0", "ld0", "st0", "ld1"];

/// Per-opcode functional unit requirements and result latency.
#[derive(Clone, Copy, Debug)]
pub struct FuInfo {
    /// FUs capable of executing the opcode.
    pub fu: u32,
    /// Result latency in cycles.
    pub latency: u32,
}

/// Returns the FU requirements for an opcode.
pub const fn fuinfo(opcode: Opcode) -> FuInfo {
    match opcode {
        Opcode::Nop
        | Opcode::Mov
        | Opcode::Add
        | Opcode::Sub
        | Opcode::And
        | Opcode::Or
        | Opcode::Xor
        | Opcode::Shl
        | Opcode::Shr => FuInfo {
            fu: FU_ALU0 | FU_ALU1,
            latency: 1,
        },
        Opcode::Mul => FuInfo {
            fu: FU_MUL0,
            latency: 3,
        },
        Opcode::Ld | Opcode::LdAcq => FuInfo {
            fu: FU_LD0 | FU_LD1,
            latency: 2,
        },
        Opcode::St | Opcode::StRel | Opcode::Fence => FuInfo {
            fu: FU_ST0,
            latency: 1,
        },
        Opcode::Bru | Opcode::BrCc | Opcode::Jmp | Opcode::Assist => FuInfo {
            fu: FU_ALU0 | FU_ALU1,
            latency: 1,
        },
    }
}

/// Static description of one issue cluster.
#[derive(Clone, Copy, Debug)]
pub struct ClusterInfo {
    /// Cluster name for traces.
    pub name: &'static str,
    /// FUs belonging to the cluster.
    pub fu_mask: u32,
    /// Maximum issues per cycle.
    pub issue_width: usize,
}

/// The issue clusters: two integer clusters sharing a bypass network and a
/// memory cluster one forwarding cycle away.
pub const CLUSTERS: [ClusterInfo; MAX_CLUSTERS] = [
    ClusterInfo {
        name: "int0",
        fu_mask: FU_ALU0 | FU_MUL0,
        issue_width: 2,
    },
    ClusterInfo {
        name: "int1",
        fu_mask: FU_ALU1,
        issue_width: 1,
    },
    ClusterInfo {
        name: "mem",
        fu_mask: FU_LD0 | FU_ST0 | FU_LD1,
        issue_width: 2,
    },
];

/// Forwarding latency between clusters in cycles.
pub const INTERCLUSTER_LATENCY: [[u8; MAX_CLUSTERS]; MAX_CLUSTERS] = [
    [0, 0, 1], // int0 -> int0/int1/mem
    [0, 0, 1], // int1
    [1, 1, 0], // mem
];

/// Lookup tables derived from the static geometry.
#[derive(Debug)]
pub struct CoreLuts {
    executable_on_cluster: [u32; Opcode::Assist as usize + 1],
    forward_at_cycle: [[u32; MAX_FORWARDING_LATENCY as usize + 1]; MAX_CLUSTERS],
}

impl Default for CoreLuts {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreLuts {
    /// Builds the opcode/cluster and forwarding tables.
    pub fn new() -> Self {
        let mut executable_on_cluster = [0u32; Opcode::Assist as usize + 1];
        let opcodes = [
            Opcode::Nop,
            Opcode::Mov,
            Opcode::Add,
            Opcode::Sub,
            Opcode::And,
            Opcode::Or,
            Opcode::Xor,
            Opcode::Shl,
            Opcode::Shr,
            Opcode::Mul,
            Opcode::Ld,
            Opcode::LdAcq,
            Opcode::St,
            Opcode::StRel,
            Opcode::Fence,
            Opcode::Bru,
            Opcode::BrCc,
            Opcode::Jmp,
            Opcode::Assist,
        ];
        for op in opcodes {
            let allowed_fu = fuinfo(op).fu;
            let mut mask = 0;
            for (cl, info) in CLUSTERS.iter().enumerate() {
                if info.fu_mask & allowed_fu != 0 {
                    mask |= 1 << cl;
                }
            }
            executable_on_cluster[op as usize] = mask;
        }

        let mut forward_at_cycle = [[0u32; MAX_FORWARDING_LATENCY as usize + 1]; MAX_CLUSTERS];
        for (src, row) in forward_at_cycle.iter_mut().enumerate() {
            for (lat, mask) in row.iter_mut().enumerate() {
                for dest in 0..MAX_CLUSTERS {
                    if INTERCLUSTER_LATENCY[src][dest] as usize == lat {
                        *mask |= 1 << dest;
                    }
                }
            }
        }

        Self {
            executable_on_cluster,
            forward_at_cycle,
        }
    }

    /// Clusters capable of executing `opcode`.
    #[inline]
    pub const fn executable_on_cluster(&self, opcode: Opcode) -> u32 {
        self.executable_on_cluster[opcode as usize]
    }

    /// Destination cluster mask reached on forwarding cycle `lat` from `src`.
    #[inline]
    pub const fn forward_at_cycle(&self, src: usize, lat: u8) -> u32 {
        self.forward_at_cycle[src][lat as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_opcode_has_a_cluster() {
        let luts = CoreLuts::new();
        for op in [
            Opcode::Nop,
            Opcode::Add,
            Opcode::Mul,
            Opcode::Ld,
            Opcode::St,
            Opcode::Bru,
            Opcode::Assist,
        ] {
            assert_ne!(luts.executable_on_cluster(op), 0, "{op:?} unroutable");
        }
    }

    #[test]
    fn test_mem_ops_route_to_mem_cluster_only() {
        let luts = CoreLuts::new();
        assert_eq!(luts.executable_on_cluster(Opcode::Ld), 0b100);
        assert_eq!(luts.executable_on_cluster(Opcode::St), 0b100);
    }

    #[test]
    fn test_alu_routes_to_both_int_clusters() {
        let luts = CoreLuts::new();
        assert_eq!(luts.executable_on_cluster(Opcode::Add), 0b011);
    }

    #[test]
    fn test_forward_masks_partition_clusters() {
        let luts = CoreLuts::new();
        for src in 0..MAX_CLUSTERS {
            let mut seen = 0;
            for lat in 0..=MAX_FORWARDING_LATENCY {
                let mask = luts.forward_at_cycle(src, lat);
                assert_eq!(seen & mask, 0, "cluster forwarded twice");
                seen |= mask;
            }
            assert_eq!(seen, (1 << MAX_CLUSTERS) - 1, "cluster never forwarded");
        }
    }

    #[test]
    fn test_int_clusters_share_bypass() {
        let luts = CoreLuts::new();
        // int0 results reach both int clusters at latency 0, mem at 1
        assert_eq!(luts.forward_at_cycle(0, 0), 0b011);
        assert_eq!(luts.forward_at_cycle(0, 1), 0b100);
    }
}
