//! Register-level model of one compute unit.
//!
//! The host drives a CU through its control register at the CU base:
//!
//! | bit | name        | direction                           |
//! |-----|-------------|-------------------------------------|
//! | 0   | AP_START    | host sets, CU clears when accepted  |
//! | 1   | AP_DONE     | CU sets on completion               |
//! | 2   | AP_IDLE     | CU sets when not processing         |
//! | 3   | AP_READY    | CU ready for new inputs             |
//! | 4   | AP_CONTINUE | host acknowledges DONE (chained)    |
//!
//! The low three bits of the encoded CU address select the handshake
//! protocol. Chained (dataflow) CUs accept a new start as soon as START drops
//! and need every DONE acknowledged with CONTINUE. Handshake CUs run one
//! command at a time.
//!
//! Commands started on a CU wait in its running FIFO; [`ComputeUnit::poll`]
//! counts completions and [`ComputeUnit::first_done`] /
//! [`ComputeUnit::pop_done`] hand them back in start order. A command
//! retired early ([`ComputeUnit::forget`]) leaves an empty entry so the
//! hardware run it started is still counted until its DONE arrives.

use std::collections::VecDeque;

use crate::command::{CmdId, ErtPacket, Opcode};
use crate::command::packet::{REGMAP_CTRL_WORDS, REGMAP_INDIRECT_WORDS};
use crate::device::RegisterPort;
use crate::error::Result;

pub const AP_START: u32 = 0x1;
pub const AP_DONE: u32 = 0x2;
pub const AP_IDLE: u32 = 0x4;
pub const AP_READY: u32 = 0x8;
pub const AP_CONTINUE: u32 = 0x10;

/// Handshake codes carried in the low bits of a CU address.
pub const AP_CTRL_HS: u32 = 0;
pub const AP_CTRL_CHAIN: u32 = 1;
pub const AP_CTRL_NONE: u32 = 2;
pub const AP_CTRL_ME: u32 = 3;

/// One compute unit.
#[derive(Debug)]
pub struct ComputeUnit {
    /// Index in the execution core.
    pub index: usize,
    /// Register base (encoded address with the low byte cleared).
    addr: u64,
    /// Handshake code.
    control: u32,
    /// Embedded processor poll slot, in embedded-poll mode.
    polladdr: Option<u64>,
    /// Bits that signal completion for this handshake.
    ap_check: u32,
    /// Last control register value seen.
    ctrlreg: u32,
    run_cnt: u32,
    done_cnt: u32,
    /// `None` marks a run whose command was retired before DONE.
    running: VecDeque<Option<CmdId>>,
}

impl ComputeUnit {
    /// Create a CU from its encoded address.
    pub fn new(index: usize, encoded_addr: u64, polladdr: Option<u64>) -> Self {
        let control = (encoded_addr & 0x7) as u32;
        Self {
            index,
            addr: encoded_addr & !0xff,
            control,
            polladdr,
            ap_check: if control == AP_CTRL_CHAIN { AP_DONE } else { AP_DONE | AP_IDLE },
            ctrlreg: 0,
            run_cnt: 0,
            done_cnt: 0,
            running: VecDeque::new(),
        }
    }

    pub fn base_addr(&self) -> u64 {
        self.addr
    }

    pub fn polladdr(&self) -> Option<u64> {
        self.polladdr
    }

    pub fn control(&self) -> u32 {
        self.control
    }

    pub fn is_dataflow(&self) -> bool {
        self.control == AP_CTRL_CHAIN
    }

    /// Commands started and not yet observed done.
    pub fn run_count(&self) -> u32 {
        self.run_cnt
    }

    /// Commands observed done and not yet popped.
    pub fn done_count(&self) -> u32 {
        self.done_cnt
    }

    /// Whether another command can be started.
    pub fn ready(&mut self, port: &dyn RegisterPort) -> Result<bool> {
        if self.ctrlreg & AP_START != 0 || (!self.is_dataflow() && self.run_cnt > 0) {
            self.poll(port)?;
        }
        Ok(if self.is_dataflow() {
            self.ctrlreg & AP_START == 0
        } else {
            self.run_cnt == 0
        })
    }

    /// Write the command's register map, assert START and queue the command.
    pub fn start(&mut self, port: &dyn RegisterPort, id: CmdId, packet: &ErtPacket) -> Result<()> {
        let regmap = packet.regmap();
        if packet.opcode() == Opcode::ExecWrite {
            for pair in regmap.get(REGMAP_INDIRECT_WORDS..).unwrap_or_default().chunks_exact(2) {
                port.write32(self.addr + pair[0] as u64, pair[1])?;
            }
        } else if regmap.len() > REGMAP_CTRL_WORDS {
            let offset = (REGMAP_CTRL_WORDS as u64) << 2;
            port.write_words(self.addr + offset, &regmap[REGMAP_CTRL_WORDS..])?;
        }

        // Track START locally; the next ready() may come before a poll.
        self.ctrlreg |= AP_START;
        port.write32(self.addr, AP_START)?;
        if let Some(polladdr) = self.polladdr {
            port.write32(polladdr, AP_START)?;
        }

        self.running.push_back(Some(id));
        self.run_cnt += 1;
        log::debug!(
            "cu({}) started {:?} run({}) done({})",
            self.index,
            id,
            self.run_cnt,
            self.done_cnt
        );
        Ok(())
    }

    /// Re-read the control register and account for one completion.
    pub fn poll(&mut self, port: &dyn RegisterPort) -> Result<()> {
        self.ctrlreg = port.read32(self.addr)?;
        if self.run_cnt > 0 && self.ctrlreg & self.ap_check != 0 {
            self.done_cnt += 1;
            self.run_cnt -= 1;
            self.acknowledge(port)?;
        }
        Ok(())
    }

    /// Acknowledge DONE on chained CUs, and on the poll slot while work
    /// remains so the embedded processor reports the next DONE.
    fn acknowledge(&mut self, port: &dyn RegisterPort) -> Result<()> {
        if !self.is_dataflow() {
            return Ok(());
        }
        port.write32(self.addr, AP_CONTINUE)?;
        if let Some(polladdr) = self.polladdr {
            if self.run_cnt > 0 {
                port.write32(polladdr, AP_CONTINUE)?;
            }
        }
        Ok(())
    }

    /// Oldest completed command, polling once if nothing is known done.
    /// Completed runs of forgotten commands are discarded on the way.
    pub fn first_done(&mut self, port: &dyn RegisterPort) -> Result<Option<CmdId>> {
        loop {
            if self.done_cnt == 0 && self.run_cnt > 0 {
                self.poll(port)?;
            }
            if self.done_cnt == 0 {
                return Ok(None);
            }
            match self.running.front() {
                Some(Some(id)) => return Ok(Some(*id)),
                Some(None) => {
                    self.running.pop_front();
                    self.done_cnt -= 1;
                    log::debug!("cu({}) discarded run of a retired command", self.index);
                }
                None => return Ok(None),
            }
        }
    }

    /// Remove the oldest completed command.
    pub fn pop_done(&mut self) -> Option<CmdId> {
        while self.done_cnt > 0 {
            self.done_cnt -= 1;
            match self.running.pop_front() {
                Some(Some(id)) => return Some(id),
                Some(None) => continue,
                None => return None,
            }
        }
        None
    }

    /// Stop tracking `id` without claiming its run. The CU stays busy until
    /// the hardware reports that run done. Returns false if `id` is not here.
    pub fn forget(&mut self, id: CmdId) -> bool {
        match self.running.iter_mut().find(|entry| **entry == Some(id)) {
            Some(entry) => {
                *entry = None;
                true
            }
            None => false,
        }
    }

    /// Drop every command still tracked. Returns them oldest first.
    pub fn drain(&mut self) -> Vec<CmdId> {
        self.run_cnt = 0;
        self.done_cnt = 0;
        self.ctrlreg = 0;
        self.running.drain(..).flatten().collect()
    }
}
