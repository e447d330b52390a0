//! In-memory simulated device.
//!
//! Stands in for real hardware behind a [`RegisterPort`]. Memory is sparse
//! (BTreeMap keyed by word address) so the 40-bit device-RAM window costs
//! nothing until written.
//!
//! On top of plain memory the simulator models:
//! - CU control registers at registered base addresses. `AP_DONE` is
//!   clear-on-read for handshake CUs and cleared by `AP_CONTINUE` for
//!   chained CUs.
//! - The four read-to-clear CQ status words at the CSR base.
//! - An optional embedded processor ([`SimErtMode`]) that turns CQ doorbells
//!   or CU completions into status bits.
//!
//! # Usage
//!
//! ```
//! use ert_sched::device::{DeviceCaps, RegisterPort, SimDevice};
//!
//! let dev = SimDevice::new(DeviceCaps::penguin());
//! let cu = dev.add_cu(0x1800);
//!
//! dev.write32(0x1800, 0x1).unwrap();           // AP_START
//! assert!(dev.complete_cu(cu));                // kernel finishes
//! assert_eq!(dev.read32(0x1800).unwrap() & 0x6, 0x6); // DONE | IDLE
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use byteorder::{ByteOrder, LittleEndian};

use super::{AddressSpace, DeviceCaps, RegisterPort, CQ_INT_OFFSET, CSR_STATUS_WORDS};
use crate::cu::{AP_CONTINUE, AP_CTRL_CHAIN, AP_DONE, AP_IDLE, AP_START};
use crate::error::{Result, SchedError};

/// How the simulated embedded processor reports completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimErtMode {
    /// No embedded processor behaviour; status bits only via `raise_status`.
    Off,
    /// A CQ doorbell for slot N completes the slot (with auto-complete).
    SlotDoorbell,
    /// CU N completing raises status bit N+1.
    CuPoll,
}

/// One recorded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    /// Target space.
    pub space: AddressSpace,
    /// Word address.
    pub addr: u64,
    /// Value written.
    pub value: u32,
}

#[derive(Debug)]
struct SimCu {
    base: u64,
    dataflow: bool,
    ctrl: u32,
    /// Completions not yet acknowledged by the host.
    backlog: u32,
    starts: u32,
}

#[derive(Debug)]
struct SimState {
    caps: DeviceCaps,
    memory: BTreeMap<(AddressSpace, u64), u32>,
    cus: Vec<SimCu>,
    auto_complete: bool,
    ert_mode: SimErtMode,
    csr_status: [u32; CSR_STATUS_WORDS],
    writes: Vec<WriteRecord>,
}

impl SimState {
    fn csr_base(&self) -> u64 {
        self.caps.csr_base()
    }

    fn cu_at(&self, space: AddressSpace, addr: u64) -> Option<usize> {
        if space != AddressSpace::KernelControl {
            return None;
        }
        self.cus.iter().position(|cu| cu.base == addr)
    }

    fn status_word(&self, space: AddressSpace, addr: u64) -> Option<usize> {
        let base = self.csr_base();
        if space != AddressSpace::KernelControl || addr < base {
            return None;
        }
        let idx = ((addr - base) / 4) as usize;
        (addr - base < (CSR_STATUS_WORDS as u64) * 4).then_some(idx)
    }

    fn doorbell_word(&self, space: AddressSpace, addr: u64) -> Option<usize> {
        let base = self.csr_base() + CQ_INT_OFFSET;
        if space != AddressSpace::KernelControl || addr < base {
            return None;
        }
        let idx = ((addr - base) / 4) as usize;
        (addr - base < (CSR_STATUS_WORDS as u64) * 4).then_some(idx)
    }

    fn finish_cu(&mut self, idx: usize) {
        let cu = &mut self.cus[idx];
        cu.backlog += 1;
        cu.ctrl = (cu.ctrl & !AP_START) | AP_DONE | AP_IDLE;
        if self.ert_mode == SimErtMode::CuPoll {
            let bit = idx + 1;
            self.csr_status[bit >> 5] |= 1 << (bit & 31);
        }
    }

    fn read_word(&mut self, space: AddressSpace, addr: u64) -> u32 {
        if let Some(idx) = self.cu_at(space, addr) {
            let cu = &mut self.cus[idx];
            let value = cu.ctrl;
            if !cu.dataflow && value & AP_DONE != 0 {
                cu.backlog = cu.backlog.saturating_sub(1);
                if cu.backlog == 0 {
                    cu.ctrl &= !AP_DONE;
                }
            }
            return value;
        }
        if let Some(word) = self.status_word(space, addr) {
            return std::mem::take(&mut self.csr_status[word]);
        }
        self.memory.get(&(space, addr)).copied().unwrap_or(0)
    }

    fn write_word(&mut self, space: AddressSpace, addr: u64, value: u32) {
        self.writes.push(WriteRecord { space, addr, value });

        if let Some(idx) = self.cu_at(space, addr) {
            if value & AP_START != 0 {
                let cu = &mut self.cus[idx];
                cu.starts += 1;
                cu.ctrl = (cu.ctrl | AP_START) & !AP_IDLE;
                if self.auto_complete {
                    self.finish_cu(idx);
                }
            }
            if value & AP_CONTINUE != 0 {
                let cu = &mut self.cus[idx];
                cu.backlog = cu.backlog.saturating_sub(1);
                if cu.backlog == 0 {
                    cu.ctrl &= !AP_DONE;
                }
            }
            return;
        }

        if let Some(word) = self.doorbell_word(space, addr) {
            if self.ert_mode == SimErtMode::SlotDoorbell && self.auto_complete {
                self.csr_status[word] |= value;
            }
        }
        self.memory.insert((space, addr), value);
    }
}

/// Simulated device shared by clones.
#[derive(Debug, Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// Create a device with the given capabilities and no CUs.
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                caps,
                memory: BTreeMap::new(),
                cus: Vec::new(),
                auto_complete: false,
                ert_mode: SimErtMode::Off,
                csr_status: [0; CSR_STATUS_WORDS],
                writes: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a CU model at an encoded address (low byte carries the
    /// handshake code). Returns the CU's index.
    pub fn add_cu(&self, encoded_addr: u64) -> usize {
        let mut state = self.lock();
        state.cus.push(SimCu {
            base: encoded_addr & !0xff,
            dataflow: (encoded_addr & 0x7) as u32 == AP_CTRL_CHAIN,
            ctrl: AP_IDLE,
            backlog: 0,
            starts: 0,
        });
        state.cus.len() - 1
    }

    /// Complete every CU start immediately (and every doorbell in
    /// [`SimErtMode::SlotDoorbell`]).
    pub fn set_auto_complete(&self, enabled: bool) {
        self.lock().auto_complete = enabled;
    }

    /// Select the embedded processor behaviour.
    pub fn set_ert_mode(&self, mode: SimErtMode) {
        self.lock().ert_mode = mode;
    }

    /// Finish the oldest start on CU `idx`. Returns false if the CU is not
    /// running anything.
    pub fn complete_cu(&self, idx: usize) -> bool {
        let mut state = self.lock();
        match state.cus.get(idx) {
            Some(cu) if cu.ctrl & AP_START != 0 => {
                state.finish_cu(idx);
                true
            }
            _ => false,
        }
    }

    /// Set bits in CQ status word `word`, as the embedded processor would.
    pub fn raise_status(&self, word: usize, mask: u32) {
        let mut state = self.lock();
        if let Some(status) = state.csr_status.get_mut(word) {
            *status |= mask;
        }
    }

    /// Current CU control register value without read side effects.
    pub fn cu_ctrl(&self, idx: usize) -> Option<u32> {
        self.lock().cus.get(idx).map(|cu| cu.ctrl)
    }

    /// Number of times CU `idx` was started.
    pub fn cu_starts(&self, idx: usize) -> u32 {
        self.lock().cus.get(idx).map_or(0, |cu| cu.starts)
    }

    /// Read plain memory without side effects.
    pub fn peek(&self, space: AddressSpace, addr: u64) -> u32 {
        self.lock().memory.get(&(space, addr)).copied().unwrap_or(0)
    }

    /// Write plain memory without side effects or logging.
    pub fn poke(&self, space: AddressSpace, addr: u64, value: u32) {
        self.lock().memory.insert((space, addr), value);
    }

    /// All writes seen so far, in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    /// Forget the write log.
    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

fn check_access(addr: u64, len: usize) -> Result<()> {
    if addr % 4 != 0 || len % 4 != 0 {
        return Err(SchedError::Port {
            addr,
            reason: format!("access of {} bytes not aligned to 4", len),
        });
    }
    Ok(())
}

impl RegisterPort for SimDevice {
    fn read(&self, space: AddressSpace, addr: u64, buf: &mut [u8]) -> Result<()> {
        check_access(addr, buf.len())?;
        let mut state = self.lock();
        for (i, chunk) in buf.chunks_exact_mut(4).enumerate() {
            let value = state.read_word(space, addr + (i as u64) * 4);
            LittleEndian::write_u32(chunk, value);
        }
        Ok(())
    }

    fn write(&self, space: AddressSpace, addr: u64, buf: &[u8]) -> Result<()> {
        check_access(addr, buf.len())?;
        let mut state = self.lock();
        for (i, chunk) in buf.chunks_exact(4).enumerate() {
            state.write_word(space, addr + (i as u64) * 4, LittleEndian::read_u32(chunk));
        }
        Ok(())
    }

    fn capabilities(&self) -> DeviceCaps {
        self.lock().caps.clone()
    }
}
