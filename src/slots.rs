//! Command queue slot allocation.
//!
//! Slots are tracked in 32-bit groups, matching the CQ status registers that
//! report them. Slot 0 belongs to control commands and is never handed to
//! anything else; at most one control command holds it at a time. Data
//! commands get slots `1..=capacity`.
//!
//! Only the scheduler thread touches an allocator, so there is no locking.

use crate::command::MAX_SLOTS;
use crate::error::{Result, SchedError};

/// Slot reserved for control commands.
pub const CTRL_SLOT: usize = 0;

const GROUPS: usize = MAX_SLOTS / 32;

/// Who is asking for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Control,
    Data,
}

/// Fixed-size slot bitmap.
#[derive(Debug, Clone)]
pub struct QueueAllocator {
    groups: [u32; GROUPS],
    /// Total slots including the control slot.
    num_slots: usize,
    ctrl_busy: bool,
}

impl QueueAllocator {
    /// Allocator with `capacity` data slots plus the control slot.
    pub fn new(capacity: usize) -> Self {
        let num_slots = (capacity + 1).min(MAX_SLOTS);
        let mut groups = [0u32; GROUPS];
        groups[0] = 1 << CTRL_SLOT;
        Self {
            groups,
            num_slots,
            ctrl_busy: false,
        }
    }

    /// Allocator sized for a command queue of `num_slots` total slots.
    pub fn with_total_slots(num_slots: usize) -> Self {
        Self::new(num_slots.saturating_sub(1))
    }

    /// Data slots available when empty.
    pub fn capacity(&self) -> usize {
        self.num_slots - 1
    }

    /// Total slots including the control slot.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Reserve a slot.
    pub fn acquire(&mut self, kind: SlotKind) -> Result<usize> {
        if kind == SlotKind::Control {
            if self.ctrl_busy {
                log::warn!("ctrl slot is busy");
                return Err(SchedError::ResourceExhausted("control slot"));
            }
            self.ctrl_busy = true;
            return Ok(CTRL_SLOT);
        }

        for (group, bits) in self.groups.iter_mut().enumerate() {
            if *bits == u32::MAX {
                continue;
            }
            let slot = (group << 5) + bits.trailing_ones() as usize;
            if slot >= self.num_slots {
                break;
            }
            *bits |= 1 << (slot & 31);
            log::debug!("acquired slot {}", slot);
            return Ok(slot);
        }
        Err(SchedError::ResourceExhausted("command queue slot"))
    }

    /// Return a slot. Releasing a free slot is a no-op.
    pub fn release(&mut self, slot: usize) {
        if slot == CTRL_SLOT {
            self.ctrl_busy = false;
            return;
        }
        if slot < self.num_slots {
            self.groups[slot >> 5] &= !(1 << (slot & 31));
            log::debug!("released slot {}", slot);
        }
    }

    /// Whether `slot` is currently held.
    pub fn is_held(&self, slot: usize) -> bool {
        if slot == CTRL_SLOT {
            return self.ctrl_busy;
        }
        slot < self.num_slots && self.groups[slot >> 5] & (1 << (slot & 31)) != 0
    }

    /// Data slots currently held.
    pub fn in_use(&self) -> usize {
        let total: u32 = self.groups.iter().map(|g| g.count_ones()).sum();
        total as usize - 1
    }
}
