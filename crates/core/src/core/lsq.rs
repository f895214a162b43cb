//! Load/store queue with store-to-load forwarding.
//!
//! A per-thread bounded FIFO in program order. Loads establish ordering
//! against older stores by LSQ position:
//! 1. **Allocation:** at rename, linking the slot to its ROB entry.
//! 2. **Resolution:** at issue, filling address (and data for stores).
//! 3. **Forwarding:** a load scans backwards for the youngest older store
//!    with a matching address and overlapping bytemask.
//! 4. **Aliasing:** a resolving store scans forward for loads that issued
//!    too early against it.
//!
//! Addresses are stored shifted right by 3: forwarding and aliasing match at
//! 8-byte granularity, the store-forwarding record width.

use crate::config::LSQ_SIZE;

/// One in-flight memory operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadStoreQueueEntry {
    /// Slot index.
    pub idx: u16,
    /// Store (or fence) rather than load.
    pub store: bool,
    /// Owning ROB entry.
    pub rob: u16,
    /// Physical address shifted right by 3 (8-byte unit).
    pub physaddr: u64,
    /// Virtual address of the access.
    pub virtaddr: u64,
    /// Bytes of the 8-byte unit touched.
    pub bytemask: u8,
    /// Data (store value, or load result once satisfied).
    pub data: u64,
    /// Forwarded store bytes inherited by a partially covered load.
    pub sfr_data: u64,
    /// Bytemask of the inherited forwarded bytes.
    pub sfr_mask: u8,
    /// Address has been resolved.
    pub addrvalid: bool,
    /// Data has been resolved.
    pub datavalid: bool,
    /// Access faulted; the ROB entry carries the exception.
    pub invalid: bool,
    /// Slot is occupied.
    pub valid: bool,
}

/// Outcome of a load's backward scan over older stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// No older store matches: read the D-cache.
    Miss,
    /// Forward the masked bytes from `source`; any bytes outside `mask`
    /// fall through to the D-cache and are merged.
    Forward {
        /// Store data to merge from.
        data: u64,
        /// Bytes supplied by the store.
        mask: u8,
        /// LSQ slot of the forwarding store.
        source: u16,
    },
    /// An older store's address or data is unresolved: stall and wake when
    /// `source` resolves.
    Wait {
        /// LSQ slot of the blocking store.
        source: u16,
    },
}

/// Bounded program-order queue of in-flight memory uops.
#[derive(Debug)]
pub struct LoadStoreQueue {
    entries: Vec<LoadStoreQueueEntry>,
    head: u16,
    tail: u16,
    count: usize,
}

impl Default for LoadStoreQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadStoreQueue {
    /// Creates an empty queue of `LSQ_SIZE` slots.
    pub fn new() -> Self {
        Self {
            entries: (0..LSQ_SIZE as u16)
                .map(|idx| LoadStoreQueueEntry {
                    idx,
                    ..LoadStoreQueueEntry::default()
                })
                .collect(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    /// Number of occupied slots.
    #[inline]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Returns true if no memory uops are in flight.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns true if the queue is full.
    #[inline]
    pub const fn is_full(&self) -> bool {
        self.count == LSQ_SIZE
    }

    /// Shared access to a slot.
    #[inline]
    pub fn get(&self, idx: u16) -> &LoadStoreQueueEntry {
        &self.entries[idx as usize]
    }

    /// Mutable access to a slot.
    #[inline]
    pub fn get_mut(&mut self, idx: u16) -> &mut LoadStoreQueueEntry {
        &mut self.entries[idx as usize]
    }

    /// Allocates the next slot in program order.
    pub fn alloc(&mut self, rob: u16, store: bool) -> Option<u16> {
        if self.is_full() {
            return None;
        }
        let idx = self.tail;
        self.entries[idx as usize] = LoadStoreQueueEntry {
            idx,
            store,
            rob,
            valid: true,
            ..LoadStoreQueueEntry::default()
        };
        self.tail = (self.tail + 1) % LSQ_SIZE as u16;
        self.count += 1;
        Some(idx)
    }

    /// Frees the oldest slot at commit.
    pub fn free_head(&mut self) {
        debug_assert!(self.count > 0);
        self.entries[self.head as usize].valid = false;
        self.head = (self.head + 1) % LSQ_SIZE as u16;
        self.count -= 1;
    }

    /// Removes the youngest slot on the annulment path.
    pub fn retract(&mut self, idx: u16) {
        let prev_tail = (self.tail + LSQ_SIZE as u16 - 1) % LSQ_SIZE as u16;
        debug_assert_eq!(idx, prev_tail);
        self.entries[idx as usize].valid = false;
        self.tail = prev_tail;
        self.count -= 1;
    }

    /// Clears the queue (pipeline flush).
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.valid = false;
        }
        self.head = 0;
        self.tail = 0;
        self.count = 0;
    }

    /// Program-order position of a slot (0 = oldest).
    #[inline]
    const fn position(&self, idx: u16) -> usize {
        ((idx + LSQ_SIZE as u16 - self.head) % LSQ_SIZE as u16) as usize
    }

    /// Occupied slot indices older than `idx`, youngest first.
    fn older_rev(&self, idx: u16) -> impl Iterator<Item = u16> + '_ {
        let pos = self.position(idx);
        let head = self.head;
        (0..pos)
            .rev()
            .map(move |p| (head + p as u16) % LSQ_SIZE as u16)
    }

    /// Occupied slot indices younger than `idx`, oldest first.
    fn younger(&self, idx: u16) -> impl Iterator<Item = u16> + '_ {
        let pos = self.position(idx);
        let head = self.head;
        let count = self.count;
        (pos + 1..count).map(move |p| (head + p as u16) % LSQ_SIZE as u16)
    }

    /// Scans older stores for a load at `physaddr` (shifted) touching
    /// `bytemask`. Returns the youngest relevant store's disposition.
    ///
    /// Stores whose address is still unresolved are speculated past; the
    /// store's own address resolution catches any ordering violation
    /// through [`Self::find_aliased_load`] and annuls the load.
    pub fn scan_for_load(&self, load_idx: u16, physaddr: u64, bytemask: u8) -> ForwardOutcome {
        for idx in self.older_rev(load_idx) {
            let st = &self.entries[idx as usize];
            if !st.valid || !st.store || !st.addrvalid {
                continue;
            }
            if st.physaddr == physaddr && st.bytemask & bytemask != 0 {
                if !st.datavalid {
                    return ForwardOutcome::Wait { source: idx };
                }
                return ForwardOutcome::Forward {
                    data: st.data,
                    mask: st.bytemask & bytemask,
                    source: idx,
                };
            }
        }
        ForwardOutcome::Miss
    }

    /// After a store resolves its address, finds the oldest younger load
    /// that already executed against the same unit: a memory-ordering
    /// violation requiring annulment.
    pub fn find_aliased_load(&self, store_idx: u16, physaddr: u64, bytemask: u8) -> Option<u16> {
        self.younger(store_idx).find(|&idx| {
            let ld = &self.entries[idx as usize];
            ld.valid
                && !ld.store
                && ld.addrvalid
                && ld.physaddr == physaddr
                && ld.bytemask & bytemask != 0
        })
    }

    /// Occupied slots in program order.
    pub fn iter_program_order(&self) -> impl Iterator<Item = u16> + '_ {
        let head = self.head;
        (0..self.count).map(move |p| (head + p as u16) % LSQ_SIZE as u16)
    }
}

/// Merges forwarded store bytes over background (cache) data.
pub fn merge_forwarded(background: u64, store_data: u64, mask: u8) -> u64 {
    let mut out = background;
    for byte in 0..8 {
        if mask & (1 << byte) != 0 {
            let shift = byte * 8;
            out = (out & !(0xff << shift)) | (store_data & (0xff << shift));
        }
    }
    out
}

/// Bytemask for an access of `bytes` starting at byte offset `offset`
/// within the 8-byte unit.
#[inline]
pub const fn bytemask_for(offset: u64, bytes: u64) -> u8 {
    (((1u16 << bytes) - 1) << offset) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved_store(lsq: &mut LoadStoreQueue, rob: u16, physaddr: u64, data: u64, mask: u8) -> u16 {
        let idx = lsq.alloc(rob, true).unwrap();
        let st = lsq.get_mut(idx);
        st.physaddr = physaddr;
        st.data = data;
        st.bytemask = mask;
        st.addrvalid = true;
        st.datavalid = true;
        idx
    }

    #[test]
    fn test_forward_full_hit() {
        let mut lsq = LoadStoreQueue::new();
        resolved_store(&mut lsq, 0, 0x200, 0xDEADBEEF, 0xff);
        let ld = lsq.alloc(1, false).unwrap();

        match lsq.scan_for_load(ld, 0x200, 0xff) {
            ForwardOutcome::Forward { data, mask, .. } => {
                assert_eq!(data, 0xDEADBEEF);
                assert_eq!(mask, 0xff);
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn test_forward_misses_on_different_address() {
        let mut lsq = LoadStoreQueue::new();
        resolved_store(&mut lsq, 0, 0x200, 1, 0xff);
        let ld = lsq.alloc(1, false).unwrap();
        assert_eq!(lsq.scan_for_load(ld, 0x201, 0xff), ForwardOutcome::Miss);
    }

    #[test]
    fn test_speculates_past_unresolved_store_address() {
        let mut lsq = LoadStoreQueue::new();
        let _st = lsq.alloc(0, true).unwrap(); // address unknown: not started
        let ld = lsq.alloc(1, false).unwrap();
        // The load proceeds; the store's later resolution catches aliasing
        assert_eq!(lsq.scan_for_load(ld, 0x200, 0xff), ForwardOutcome::Miss);
    }

    #[test]
    fn test_wait_on_data_invalid_overlap() {
        let mut lsq = LoadStoreQueue::new();
        let st = lsq.alloc(0, true).unwrap();
        {
            let e = lsq.get_mut(st);
            e.physaddr = 0x200;
            e.bytemask = 0x0f;
            e.addrvalid = true;
        }
        let ld = lsq.alloc(1, false).unwrap();
        assert_eq!(
            lsq.scan_for_load(ld, 0x200, 0xff),
            ForwardOutcome::Wait { source: st }
        );
    }

    #[test]
    fn test_youngest_matching_store_wins() {
        let mut lsq = LoadStoreQueue::new();
        resolved_store(&mut lsq, 0, 0x200, 0x11, 0xff);
        let newer = resolved_store(&mut lsq, 1, 0x200, 0x22, 0xff);
        let ld = lsq.alloc(2, false).unwrap();

        match lsq.scan_for_load(ld, 0x200, 0xff) {
            ForwardOutcome::Forward { data, source, .. } => {
                assert_eq!(data, 0x22);
                assert_eq!(source, newer);
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn test_loads_never_observe_younger_stores() {
        let mut lsq = LoadStoreQueue::new();
        let ld = lsq.alloc(0, false).unwrap();
        resolved_store(&mut lsq, 1, 0x200, 0x33, 0xff);
        assert_eq!(lsq.scan_for_load(ld, 0x200, 0xff), ForwardOutcome::Miss);
    }

    #[test]
    fn test_aliased_load_detection() {
        let mut lsq = LoadStoreQueue::new();
        let st = lsq.alloc(0, true).unwrap();
        let ld = lsq.alloc(1, false).unwrap();
        {
            let e = lsq.get_mut(ld);
            e.physaddr = 0x80;
            e.bytemask = 0xff;
            e.addrvalid = true;
            e.datavalid = true;
        }
        assert_eq!(lsq.find_aliased_load(st, 0x80, 0xff), Some(ld));
        assert_eq!(lsq.find_aliased_load(st, 0x81, 0xff), None);
    }

    #[test]
    fn test_merge_forwarded_partial() {
        let merged = merge_forwarded(0x8877665544332211, 0xAABB, 0x03);
        assert_eq!(merged, 0x887766554433AABB);
    }

    #[test]
    fn test_bytemask_for() {
        assert_eq!(bytemask_for(0, 8), 0xff);
        assert_eq!(bytemask_for(0, 1), 0x01);
        assert_eq!(bytemask_for(4, 4), 0xf0);
        assert_eq!(bytemask_for(2, 2), 0x0c);
    }

    #[test]
    fn test_retract_and_wraparound() {
        let mut lsq = LoadStoreQueue::new();
        for _ in 0..(LSQ_SIZE * 2) {
            let a = lsq.alloc(0, false).unwrap();
            let b = lsq.alloc(1, true).unwrap();
            lsq.retract(b);
            lsq.free_head();
            let _ = a;
        }
        assert!(lsq.is_empty());
    }
}
