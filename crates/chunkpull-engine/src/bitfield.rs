//! Compact per-slot flags for the sender's view of the chunk store.
//!
//! The sender never touches the store itself; it keeps one bitfield of slots
//! the receiver reported as filled and one of slots it has asked for at least
//! once (to count re-requests).

/// Growable bitfield sized to the chunk count of one transfer.
#[derive(Clone, Debug)]
pub struct SlotBitfield {
    bits: Vec<u64>,
    slot_count: usize,
    set_count: usize,
}

impl SlotBitfield {
    /// Create a bitfield with `slot_count` unset slots.
    pub fn new(slot_count: usize) -> Self {
        Self {
            bits: vec![0u64; slot_count.div_ceil(64)],
            slot_count,
            set_count: 0,
        }
    }

    /// Mark a slot. Returns true if it was newly set (not duplicate).
    #[inline]
    pub fn set(&mut self, slot: usize) -> bool {
        if slot >= self.slot_count {
            return false;
        }
        let mask = 1u64 << (slot % 64);
        let word = &mut self.bits[slot / 64];
        if *word & mask != 0 {
            return false; // already set
        }
        *word |= mask;
        self.set_count += 1;
        true
    }

    #[inline]
    pub fn get(&self, slot: usize) -> bool {
        if slot >= self.slot_count {
            return false;
        }
        self.bits[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    /// Returns true if every slot is set.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.set_count >= self.slot_count
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.set_count
    }
}
