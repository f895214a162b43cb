//! External collaborator interfaces and behavioral models.
//!
//! The core is specified against four collaborators, each a trait here:
//! 1. **[`Decoder`]:** serves decoded basic blocks and tracks self-modified
//!    code pages.
//! 2. **[`CacheModel`]:** D-cache/I-cache timing (hit/miss/fill), the load
//!    fill request queue, and TLB flush hooks.
//! 3. **[`Context`]:** committed architectural state, guest physical memory,
//!    and event/exception delivery.
//! 4. **[`BranchPredictorIfc`]:** direction/target prediction and RAS repair.
//!
//! Behavioral implementations ([`ProgramDecoder`], [`FixedLatencyCaches`],
//! [`SimContext`], [`BtbPredictor`]) make the machine runnable standalone
//! and are what the test suite drives.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use thiserror::Error;

use crate::config::LFRQ_SIZE;
use crate::isa::regs::{ARCH_REG_COUNT, ArchReg};
use crate::isa::uop::{BasicBlock, Opcode, Uop};

/// Architectural exception captured at issue or commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    /// Page fault on a load.
    PageFaultOnRead,
    /// Page fault on a store.
    PageFaultOnWrite,
    /// Undecodable or unimplemented instruction.
    InvalidOpcode,
    /// Misaligned access that could not be handled by the split path.
    UnalignedAccess,
}

impl Exception {
    /// Exception name for traces.
    pub const fn name(self) -> &'static str {
        match self {
            Self::PageFaultOnRead => "PageFaultOnRead",
            Self::PageFaultOnWrite => "PageFaultOnWrite",
            Self::InvalidOpcode => "InvalidOpcode",
            Self::UnalignedAccess => "UnalignedAccess",
        }
    }
}

/// Basic block fetch failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    /// No decodable instruction at this rip.
    #[error("no decodable instruction at rip {0:#x}")]
    BogusRip(u64),
    /// The block exists but was invalidated and is awaiting release.
    #[error("basic block at rip {0:#x} is invalidated")]
    Invalidated(u64),
}

/// Supplies decoded basic blocks to fetch.
pub trait Decoder {
    /// Fetches (or builds) the basic block starting at `rip`.
    fn fetch_basic_block(&mut self, rip: u64) -> Result<Rc<BasicBlock>, FetchError>;

    /// True when the code page `mfn` has been written since decode.
    fn is_dirty(&self, mfn: u64) -> bool;

    /// Drops cached blocks on `mfn` and clears its dirty bit.
    fn invalidate(&mut self, mfn: u64);

    /// Informs the decoder of a committed store to guest memory.
    fn notify_write(&mut self, _physaddr_bytes: u64) {}
}

/// Maximum uops per synthesized basic block.
const MAX_BB_UOPS: usize = 16;

/// Behavioral decoder serving uop programs registered by rip.
///
/// Basic blocks are synthesized on demand from the uop store, ending at
/// control transfers, assists, or the block size cap, and cached by start
/// rip. Invalidation makes a page's blocks unlookable immediately; the
/// backing memory is released when the last in-flight reference drops.
#[derive(Default)]
pub struct ProgramDecoder {
    uops: HashMap<u64, Uop>,
    blocks: HashMap<u64, Rc<BasicBlock>>,
    dirty: HashSet<u64>,
    invalidated: HashSet<u64>,
}

impl std::fmt::Debug for ProgramDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramDecoder")
            .field("uops", &self.uops.len())
            .field("cached_blocks", &self.blocks.len())
            .finish()
    }
}

impl ProgramDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a uop program; each uop is keyed by its rip.
    pub fn add_program(&mut self, uops: &[Uop]) {
        for uop in uops {
            let _ = self.uops.insert(uop.rip, *uop);
        }
    }

    /// Replaces one instruction (self-modifying code in tests).
    pub fn patch(&mut self, uop: Uop) {
        let _ = self.uops.insert(uop.rip, uop);
        self.dirty.insert(BasicBlock::mfn_of(uop.rip));
    }

    /// Marks a code page dirty directly.
    pub fn set_dirty(&mut self, mfn: u64) {
        if self.uops.keys().any(|&rip| BasicBlock::mfn_of(rip) == mfn) {
            self.dirty.insert(mfn);
        }
    }
}

impl Decoder for ProgramDecoder {
    fn fetch_basic_block(&mut self, rip: u64) -> Result<Rc<BasicBlock>, FetchError> {
        let mfn = BasicBlock::mfn_of(rip);
        if self.invalidated.contains(&mfn) {
            // The page stays unlookable until the last in-flight reference
            // to one of its blocks drops.
            if self.blocks.values().any(|bb| bb.mfn == mfn) {
                return Err(FetchError::Invalidated(rip));
            }
            let _ = self.invalidated.remove(&mfn);
        }
        if let Some(bb) = self.blocks.get(&rip) {
            return Ok(Rc::clone(bb));
        }
        if !self.uops.contains_key(&rip) {
            return Err(FetchError::BogusRip(rip));
        }

        let mut uops = Vec::new();
        let mut cur = rip;
        loop {
            let Some(uop) = self.uops.get(&cur) else {
                break;
            };
            uops.push(*uop);
            cur = uop.next_rip();
            let terminal = uop.opcode.is_branch() || uop.opcode == Opcode::Assist;
            if (terminal && uop.eom) || uops.len() >= MAX_BB_UOPS {
                break;
            }
        }

        let bb = Rc::new(BasicBlock {
            rip,
            mfn: BasicBlock::mfn_of(rip),
            uops,
            fallthrough_rip: cur,
        });
        let _ = self.blocks.insert(rip, Rc::clone(&bb));
        Ok(bb)
    }

    fn is_dirty(&self, mfn: u64) -> bool {
        self.dirty.contains(&mfn)
    }

    fn invalidate(&mut self, mfn: u64) {
        // Blocks still referenced by another thread's fetch cursor cannot be
        // freed yet; keep them cached but unlookable until the reference
        // count drops. Unreferenced blocks free immediately.
        self.blocks
            .retain(|_, bb| bb.mfn != mfn || Rc::strong_count(bb) > 1);
        let _ = self.dirty.remove(&mfn);
        if self.blocks.values().any(|bb| bb.mfn == mfn) {
            self.invalidated.insert(mfn);
        } else {
            let _ = self.invalidated.remove(&mfn);
        }
    }

    fn notify_write(&mut self, physaddr_bytes: u64) {
        self.set_dirty(physaddr_bytes >> 12);
    }
}

/// Result of a D-cache probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Line present; data is available at the load FU latency.
    Hit,
    /// Line missed; a fill was started on this LFRQ slot.
    Miss(u8),
    /// Miss, but the LFRQ is full; the load must replay.
    Full,
}

/// Cache and TLB timing model.
pub trait CacheModel {
    /// Advances the cache subsystem one cycle.
    fn clock(&mut self);

    /// Probes the D-cache for the 8-byte unit at `physaddr` (shifted).
    fn probe_dcache(&mut self, physaddr: u64) -> CacheOutcome;

    /// Drains LFRQ slots whose fills completed this cycle.
    fn take_completed_fills(&mut self) -> Vec<u8>;

    /// Releases an LFRQ slot whose load was annulled or redispatched.
    fn cancel_fill(&mut self, slot: u8);

    /// Probes the I-cache for a code fetch. False starts a fill.
    fn probe_icache(&mut self, physaddr: u64) -> bool;

    /// True when a previously missed I-cache line has arrived.
    fn icache_fill_ready(&mut self, physaddr: u64) -> bool;

    /// Drops all TLB entries for a thread.
    fn flush_tlb(&mut self, tid: usize);

    /// Drops the TLB entry covering `virtaddr` for a thread.
    fn flush_tlb_virt(&mut self, tid: usize, virtaddr: u64);

    /// Total D-cache probes issued (stats).
    fn dcache_probes(&self) -> u64;
}

/// Deterministic cache model: hits by default, with an explicit set of
/// addresses that miss once and fill after a fixed latency.
#[derive(Debug)]
pub struct FixedLatencyCaches {
    miss_once: HashSet<u64>,
    miss_latency: u32,
    lfrq: [Option<u32>; LFRQ_SIZE],
    completed: Vec<u8>,
    icache_fill: Option<(u64, u32)>,
    probes: u64,
}

impl Default for FixedLatencyCaches {
    fn default() -> Self {
        Self::new(8)
    }
}

impl FixedLatencyCaches {
    /// Creates an always-hit model with the given miss fill latency.
    pub fn new(miss_latency: u32) -> Self {
        Self {
            miss_once: HashSet::new(),
            miss_latency,
            lfrq: [None; LFRQ_SIZE],
            completed: Vec::new(),
            icache_fill: None,
            probes: 0,
        }
    }

    /// Makes the next probe of the 8-byte unit at `physaddr` (shifted) miss.
    pub fn miss_next(&mut self, physaddr: u64) {
        self.miss_once.insert(physaddr);
    }

    /// Pre-fills every LFRQ slot (tests the replay-on-full path).
    pub fn exhaust_lfrq(&mut self) {
        self.lfrq = [Some(u32::MAX); LFRQ_SIZE];
    }
}

impl CacheModel for FixedLatencyCaches {
    fn clock(&mut self) {
        for (slot, fill) in self.lfrq.iter_mut().enumerate() {
            if let Some(cycles) = fill {
                if *cycles == u32::MAX {
                    continue; // pinned by exhaust_lfrq
                }
                if *cycles == 0 {
                    self.completed.push(slot as u8);
                    *fill = None;
                } else {
                    *cycles -= 1;
                }
            }
        }
        if let Some((_, cycles)) = &mut self.icache_fill
            && *cycles > 0
        {
            *cycles -= 1;
        }
    }

    fn probe_dcache(&mut self, physaddr: u64) -> CacheOutcome {
        self.probes += 1;
        if !self.miss_once.remove(&physaddr) {
            return CacheOutcome::Hit;
        }
        match self.lfrq.iter().position(Option::is_none) {
            Some(slot) => {
                self.lfrq[slot] = Some(self.miss_latency);
                CacheOutcome::Miss(slot as u8)
            }
            None => CacheOutcome::Full,
        }
    }

    fn take_completed_fills(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.completed)
    }

    fn cancel_fill(&mut self, slot: u8) {
        self.lfrq[slot as usize] = None;
    }

    fn probe_icache(&mut self, _physaddr: u64) -> bool {
        true
    }

    fn icache_fill_ready(&mut self, _physaddr: u64) -> bool {
        true
    }

    fn flush_tlb(&mut self, _tid: usize) {}

    fn flush_tlb_virt(&mut self, _tid: usize, _virtaddr: u64) {}

    fn dcache_probes(&self) -> u64 {
        self.probes
    }
}

/// Committed architectural state and guest physical memory of one vcpu.
pub trait Context {
    /// Virtual CPU identifier.
    fn vcpuid(&self) -> usize;

    /// True while the vcpu is running.
    fn running(&self) -> bool;

    /// Starts or stops the vcpu.
    fn set_running(&mut self, running: bool);

    /// Reads a committed architectural register.
    fn arch_reg(&self, reg: ArchReg) -> u64;

    /// Writes a committed architectural register.
    fn set_arch_reg(&mut self, reg: ArchReg, value: u64);

    /// Translates a virtual address; returns the physical byte address.
    fn translate(&self, virtaddr: u64, store: bool) -> Result<u64, Exception>;

    /// Reads the 8-byte unit at `physaddr` (shifted right by 3).
    fn read_phys(&self, physaddr: u64) -> u64;

    /// Merges `data` bytes selected by `bytemask` into the 8-byte unit.
    fn write_phys(&mut self, physaddr: u64, data: u64, bytemask: u8);

    /// True when an interrupt is pending for this vcpu.
    fn check_events(&self) -> bool;

    /// Delivers the pending interrupt (redirects rip).
    fn event_upcall(&mut self);

    /// Propagates an architectural exception into guest-visible state.
    fn propagate_exception(&mut self, exception: Exception, virtaddr: u64);
}

/// Behavioral context: flat identity-mapped memory and a register array.
#[derive(Debug)]
pub struct SimContext {
    vcpuid: usize,
    regs: [u64; ARCH_REG_COUNT],
    mem: Vec<u8>,
    running: bool,
    /// Latched interrupt-pending flag; cleared by `event_upcall`.
    pub interrupt_pending: bool,
    /// rip to redirect to on interrupt delivery.
    pub interrupt_vector: Option<u64>,
    /// rip to redirect to on exception; the vcpu halts when unset.
    pub exception_vector: Option<u64>,
    /// Last exception delivered, with its faulting address.
    pub last_exception: Option<(Exception, u64)>,
    /// Interrupts delivered (stats).
    pub interrupts_taken: u64,
}

impl SimContext {
    /// Creates a running context with `mem_bytes` of zeroed memory.
    pub fn new(vcpuid: usize, mem_bytes: usize, entry_rip: u64) -> Self {
        let mut regs = [0u64; ARCH_REG_COUNT];
        regs[ArchReg::Rip.index()] = entry_rip;
        Self {
            vcpuid,
            regs,
            mem: vec![0; mem_bytes],
            running: true,
            interrupt_pending: false,
            interrupt_vector: None,
            exception_vector: None,
            last_exception: None,
            interrupts_taken: 0,
        }
    }

    /// Raises an interrupt to be taken at the next instruction boundary.
    pub fn raise_interrupt(&mut self) {
        self.interrupt_pending = true;
    }
}

impl Context for SimContext {
    fn vcpuid(&self) -> usize {
        self.vcpuid
    }

    fn running(&self) -> bool {
        self.running
    }

    fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    fn arch_reg(&self, reg: ArchReg) -> u64 {
        if reg == ArchReg::Zero {
            return 0;
        }
        self.regs[reg.index()]
    }

    fn set_arch_reg(&mut self, reg: ArchReg, value: u64) {
        if reg == ArchReg::Zero {
            return;
        }
        self.regs[reg.index()] = value;
    }

    fn translate(&self, virtaddr: u64, store: bool) -> Result<u64, Exception> {
        if virtaddr as usize + 8 > self.mem.len() {
            return Err(if store {
                Exception::PageFaultOnWrite
            } else {
                Exception::PageFaultOnRead
            });
        }
        Ok(virtaddr)
    }

    fn read_phys(&self, physaddr: u64) -> u64 {
        let base = (physaddr << 3) as usize;
        let mut bytes = [0u8; 8];
        let end = (base + 8).min(self.mem.len());
        if base < end {
            bytes[..end - base].copy_from_slice(&self.mem[base..end]);
        }
        u64::from_le_bytes(bytes)
    }

    fn write_phys(&mut self, physaddr: u64, data: u64, bytemask: u8) {
        let base = (physaddr << 3) as usize;
        let bytes = data.to_le_bytes();
        for (i, byte) in bytes.iter().enumerate() {
            if bytemask & (1 << i) != 0 && base + i < self.mem.len() {
                self.mem[base + i] = *byte;
            }
        }
    }

    fn check_events(&self) -> bool {
        self.interrupt_pending
    }

    fn event_upcall(&mut self) {
        self.interrupt_pending = false;
        self.interrupts_taken += 1;
        if let Some(vector) = self.interrupt_vector {
            self.regs[ArchReg::Rip.index()] = vector;
        }
    }

    fn propagate_exception(&mut self, exception: Exception, virtaddr: u64) {
        self.last_exception = Some((exception, virtaddr));
        match self.exception_vector {
            Some(vector) => self.regs[ArchReg::Rip.index()] = vector,
            None => self.running = false,
        }
    }
}

/// Branch direction/target prediction consumed by fetch.
pub trait BranchPredictorIfc {
    /// Predicted next rip for an EOM uop.
    fn predict(&mut self, uop: &Uop) -> u64;

    /// Trains the predictor with the resolved outcome.
    fn update(&mut self, rip: u64, taken: bool, target: u64);

    /// Repairs the return address stack after annulment.
    fn annul_ras(&mut self);

    /// Clears all prediction state.
    fn reset(&mut self);
}

const BTB_BITS: usize = 10;

/// Bimodal predictor with a branch target buffer.
///
/// Two-bit saturating direction counters indexed by rip, plus a direct-mapped
/// BTB for indirect targets.
#[derive(Debug)]
pub struct BtbPredictor {
    counters: Vec<u8>,
    btb: Vec<Option<(u64, u64)>>,
}

impl Default for BtbPredictor {
    fn default() -> Self {
        Self::new()
    }
}

impl BtbPredictor {
    /// Creates a predictor with weakly-not-taken counters.
    pub fn new() -> Self {
        Self {
            counters: vec![1; 1 << BTB_BITS],
            btb: vec![None; 1 << BTB_BITS],
        }
    }

    #[inline]
    const fn slot(rip: u64) -> usize {
        ((rip >> 2) as usize) & ((1 << BTB_BITS) - 1)
    }
}

impl BranchPredictorIfc for BtbPredictor {
    fn predict(&mut self, uop: &Uop) -> u64 {
        match uop.opcode {
            Opcode::Bru => uop.imm as u64,
            Opcode::BrCc => {
                if self.counters[Self::slot(uop.rip)] >= 2 {
                    uop.imm as u64
                } else {
                    uop.next_rip()
                }
            }
            Opcode::Jmp => match self.btb[Self::slot(uop.rip)] {
                Some((tag, target)) if tag == uop.rip => target,
                _ => uop.next_rip(),
            },
            _ => uop.next_rip(),
        }
    }

    fn update(&mut self, rip: u64, taken: bool, target: u64) {
        let slot = Self::slot(rip);
        let counter = &mut self.counters[slot];
        if taken {
            *counter = (*counter + 1).min(3);
            self.btb[slot] = Some((rip, target));
        } else {
            *counter = counter.saturating_sub(1);
        }
    }

    fn annul_ras(&mut self) {}

    fn reset(&mut self) {
        self.counters.fill(1);
        self.btb.fill(None);
    }
}

/// Assist handler: mutates the architectural context at a barrier commit.
pub type AssistFn = fn(&mut dyn Context);

/// Named assist microcode handlers, dispatched by assist id.
pub struct AssistRegistry {
    handlers: HashMap<u16, (&'static str, AssistFn)>,
}

impl std::fmt::Debug for AssistRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssistRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// The exit assist: halts the vcpu.
fn assist_exit(ctx: &mut dyn Context) {
    ctx.set_running(false);
}

impl Default for AssistRegistry {
    fn default() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register(crate::isa::asm::ASSIST_EXIT, "exit", assist_exit);
        registry
    }
}

impl AssistRegistry {
    /// Creates a registry with the built-in handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a handler.
    pub fn register(&mut self, id: u16, name: &'static str, handler: AssistFn) {
        let _ = self.handlers.insert(id, (name, handler));
    }

    /// Dispatches an assist; returns false for unknown ids.
    pub fn dispatch(&self, id: u16, ctx: &mut dyn Context) -> bool {
        match self.handlers.get(&id) {
            Some((_, handler)) => {
                handler(ctx);
                true
            }
            None => false,
        }
    }

    /// Name of a registered assist.
    pub fn name(&self, id: u16) -> &'static str {
        self.handlers.get(&id).map_or("unknown", |(name, _)| name)
    }
}
