//! Dispatch strategies: how a command is started and how its completion is
//! observed.
//!
//! The strategy is chosen once, when the scheduler is configured, and stored
//! as data:
//!
//! | mode            | start                                | completion                         |
//! |-----------------|--------------------------------------|------------------------------------|
//! | `Penguin`       | host writes CU registers             | host polls the CU control register |
//! | `EmbeddedFull`  | host writes the packet to a CQ slot  | CSR status bit per slot            |
//! | `EmbeddedPoll`  | host writes CU registers + poll slot | CSR status bit per CU (offset 1)   |
//!
//! CSR status words are read-to-clear and cover 32 slots (or CUs) each, so a
//! single query may retire several commands besides the one asked about.

use crate::command::{CmdId, CmdType, Command};
use crate::cu::ComputeUnit;
use crate::device::{RegisterPort, CQ_INT_OFFSET, CSR_STATUS_WORDS};
use crate::error::{Result, SchedError};
use crate::slots::{QueueAllocator, SlotKind};

/// Which strategy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Penguin,
    EmbeddedFull,
    EmbeddedPoll,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Penguin => "penguin",
            Self::EmbeddedFull => "ert",
            Self::EmbeddedPoll => "ert-poll",
        })
    }
}

/// Geometry of the embedded command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    /// Base of slot 0.
    pub cq_base: u64,
    /// Base of the CSR block.
    pub csr_base: u64,
    /// Bytes per slot.
    pub slot_size: u32,
    /// Slots including the control slot.
    pub num_slots: usize,
    /// Ring the CQ interrupt register after writing a slot.
    pub cq_int: bool,
    /// Firmware expects CU packets verbatim (no host-selected CU index).
    pub legacy: bool,
}

/// Command queue shared with the embedded processor.
#[derive(Debug)]
pub struct ErtQueue {
    layout: QueueLayout,
    slots: QueueAllocator,
    /// Which command owns each slot.
    command_queue: Vec<Option<CmdId>>,
    slot_usage: Vec<u32>,
}

impl ErtQueue {
    pub fn new(layout: QueueLayout) -> Self {
        Self {
            layout,
            slots: QueueAllocator::with_total_slots(layout.num_slots),
            command_queue: vec![None; layout.num_slots],
            slot_usage: vec![0; layout.num_slots],
        }
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    /// Device address of `slot`.
    pub fn slot_addr(&self, slot: usize) -> u64 {
        self.layout.cq_base + slot as u64 * self.layout.slot_size as u64
    }

    /// Command occupying `slot`.
    pub fn owner(&self, slot: usize) -> Option<CmdId> {
        self.command_queue.get(slot).copied().flatten()
    }

    /// Data slots currently held.
    pub fn slots_in_use(&self) -> usize {
        self.slots.in_use()
    }

    /// Times `slot` was used.
    pub fn slot_usage(&self, slot: usize) -> u32 {
        self.slot_usage.get(slot).copied().unwrap_or(0)
    }

    /// Drain stale completion bits.
    pub fn clear_csr(&self, port: &dyn RegisterPort) -> Result<()> {
        for word in 0..CSR_STATUS_WORDS {
            self.read_status(port, word)?;
        }
        Ok(())
    }

    /// Read (and clear) CSR status word `word`.
    pub fn read_status(&self, port: &dyn RegisterPort, word: usize) -> Result<u32> {
        port.read32(self.layout.csr_base + ((word as u64) << 2))
    }

    /// Whole contents of `slot`.
    pub fn read_slot(&self, port: &dyn RegisterPort, slot: usize) -> Result<Vec<u32>> {
        port.read_words(self.slot_addr(slot), (self.layout.slot_size >> 2) as usize)
    }

    /// Write `cmd` into a free slot. `Ok(false)` when no slot is free.
    pub fn start(&mut self, port: &dyn RegisterPort, id: CmdId, cmd: &mut Command) -> Result<bool> {
        let packet = cmd.packet();
        let bytes = packet.words().len() * 4;
        if bytes > self.layout.slot_size as usize {
            return Err(SchedError::InvalidConfiguration(format!(
                "packet of {} bytes does not fit a {} byte slot",
                bytes, self.layout.slot_size
            )));
        }

        let kind = if cmd.cmd_type() == CmdType::Ctrl {
            SlotKind::Control
        } else {
            SlotKind::Data
        };
        let slot = match self.slots.acquire(kind) {
            Ok(slot) => slot,
            Err(err) if err.is_retryable() => return Ok(false),
            Err(err) => return Err(err),
        };

        if let Err(err) = self.write_slot(port, slot, cmd) {
            self.slots.release(slot);
            return Err(err);
        }

        self.slot_usage[slot] += 1;
        self.command_queue[slot] = Some(id);
        cmd.slot_idx = Some(slot);
        log::debug!("cmd({}) written to slot {}", cmd.uid, slot);
        Ok(true)
    }

    fn write_slot(&self, port: &dyn RegisterPort, slot: usize, cmd: &Command) -> Result<()> {
        let addr = self.slot_addr(slot);
        let packet = cmd.packet();
        let payload = packet.payload();

        match cmd.cu_idx {
            Some(cu_idx) if !self.layout.legacy && cmd.cmd_type() == CmdType::Cu => {
                // First cu mask is replaced by the CU the host picked.
                port.write32(addr + 4, cu_idx as u32)?;
                port.write_words(addr + 8, payload.get(1..).unwrap_or_default())?;
            }
            _ => port.write_words(addr + 4, payload)?,
        }

        // Header last: the firmware must never see a new header before the
        // payload behind it.
        port.write32(addr, packet.header().0)?;

        if self.layout.cq_int {
            let doorbell = self.layout.csr_base + CQ_INT_OFFSET + (((slot >> 5) as u64) << 2);
            port.write32(doorbell, 1 << (slot & 31))?;
        }
        Ok(())
    }

    /// Free the slot held by `cmd`, if any.
    pub fn release(&mut self, cmd: &mut Command) {
        if let Some(slot) = cmd.slot_idx.take() {
            self.slots.release(slot);
            if let Some(entry) = self.command_queue.get_mut(slot) {
                *entry = None;
            }
        }
    }

    /// Commands owning the slots flagged in status word `word`.
    fn completed_slots(&self, port: &dyn RegisterPort, word: usize) -> Result<Vec<CmdId>> {
        let mask = self.read_status(port, word)?;
        let mut done = Vec::new();
        for bit in set_bits(mask) {
            let slot = (word << 5) + bit;
            match self.owner(slot) {
                Some(id) => done.push(id),
                None => log::warn!("completion for idle slot {}", slot),
            }
        }
        Ok(done)
    }
}

fn set_bits(mut mask: u32) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let bit = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        Some(bit)
    })
}

/// Active dispatch strategy.
#[derive(Debug)]
pub enum DispatchStrategy {
    /// Host starts and polls CUs directly.
    Penguin,
    /// The embedded processor starts and polls CUs.
    EmbeddedFull(ErtQueue),
    /// The host starts CUs; the embedded processor polls them.
    EmbeddedPoll(ErtQueue),
}

impl DispatchStrategy {
    pub fn mode(&self) -> DispatchMode {
        match self {
            Self::Penguin => DispatchMode::Penguin,
            Self::EmbeddedFull(_) => DispatchMode::EmbeddedFull,
            Self::EmbeddedPoll(_) => DispatchMode::EmbeddedPoll,
        }
    }

    pub fn queue(&self) -> Option<&ErtQueue> {
        match self {
            Self::Penguin => None,
            Self::EmbeddedFull(queue) | Self::EmbeddedPoll(queue) => Some(queue),
        }
    }

    pub fn queue_mut(&mut self) -> Option<&mut ErtQueue> {
        match self {
            Self::Penguin => None,
            Self::EmbeddedFull(queue) | Self::EmbeddedPoll(queue) => Some(queue),
        }
    }

    /// Start a CU command on the CU chosen at submission.
    ///
    /// `Ok(false)` means try again later (CU busy or no free slot).
    pub fn start_cu(
        &mut self,
        port: &dyn RegisterPort,
        cus: &mut [ComputeUnit],
        id: CmdId,
        cmd: &mut Command,
    ) -> Result<bool> {
        match self {
            Self::EmbeddedFull(queue) => queue.start(port, id, cmd),
            Self::Penguin | Self::EmbeddedPoll(_) => {
                let cu = cmd
                    .cu_idx
                    .and_then(|idx| cus.get_mut(idx))
                    .ok_or_else(|| SchedError::DeviceProtocol(format!("cmd({}) has no valid cu", cmd.uid)))?;
                if !cu.ready(port)? {
                    return Ok(false);
                }
                cu.start(port, id, cmd.packet())?;
                Ok(true)
            }
        }
    }

    /// Hand a control or soft-kernel command to the embedded processor.
    pub fn start_embedded(&mut self, port: &dyn RegisterPort, id: CmdId, cmd: &mut Command) -> Result<bool> {
        match self {
            Self::EmbeddedFull(queue) => queue.start(port, id, cmd),
            _ => Err(SchedError::InvalidConfiguration(format!(
                "{:?} needs the embedded scheduler, mode is {}",
                cmd.opcode(),
                self.mode()
            ))),
        }
    }

    /// Check a running command. Returns every command observed complete,
    /// which may include commands other than `cmd`.
    pub fn query(
        &mut self,
        port: &dyn RegisterPort,
        cus: &mut [ComputeUnit],
        id: CmdId,
        cmd: &Command,
    ) -> Result<Vec<CmdId>> {
        match self {
            Self::Penguin => {
                let Some(cu) = cmd.cu_idx.and_then(|idx| cus.get_mut(idx)) else {
                    return Ok(Vec::new());
                };
                if cu.first_done(port)? == Some(id) {
                    cu.pop_done();
                    return Ok(vec![id]);
                }
                Ok(Vec::new())
            }
            Self::EmbeddedFull(queue) => {
                let slot = cmd
                    .slot_idx
                    .ok_or_else(|| SchedError::DeviceProtocol(format!("running cmd({}) has no slot", cmd.uid)))?;
                queue.completed_slots(port, slot >> 5)
            }
            Self::EmbeddedPoll(queue) => {
                let Some(cu_idx) = cmd.cu_idx else {
                    return Ok(Vec::new());
                };
                let word = (cu_idx + 1) >> 5;
                let mask = queue.read_status(port, word)?;
                let mut done = Vec::new();
                for bit in set_bits(mask) {
                    // Bit N reports CU N-1; bit 0 belongs to the control slot.
                    let Some(idx) = ((word << 5) + bit).checked_sub(1) else {
                        continue;
                    };
                    let Some(cu) = cus.get_mut(idx) else {
                        log::error!("status bit for unknown cu {}", idx);
                        continue;
                    };
                    while let Some(first) = cu.first_done(port)? {
                        cu.pop_done();
                        done.push(first);
                    }
                }
                Ok(done)
            }
        }
    }
}
