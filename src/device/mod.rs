//! Register access contract between the scheduler and a device.
//!
//! The scheduler never talks to hardware directly. Everything goes through
//! a [`RegisterPort`], which moves bytes to and from two address spaces:
//!
//! ```text
//!   0x0000_0000_0000 ┌──────────────────────────────┐
//!                    │ kernel control               │  CU registers,
//!                    │   CU base + 0x00  ctrl reg   │  ERT CSR block,
//!                    │   CU base + 0x10  regmap...  │  legacy CQ
//!                    │   CSR  + 0x00..0x0C status   │
//!   0x0080_0000_0000 ├──────────────────────────────┤
//!                    │ device RAM                   │  P2P command queue
//!                    │   CQ slot 0 | slot 1 | ...   │  (firmware >= 30)
//!                    └──────────────────────────────┘
//! ```
//!
//! Word helpers ([`RegisterPort::read32`], [`RegisterPort::write_words`], ...)
//! pick the space from the address with [`AddressSpace::for_addr`] and do
//! the little-endian conversion.
//!
//! # Example
//!
//! ```
//! use ert_sched::device::{DeviceCaps, RegisterPort, SimDevice};
//!
//! let dev = SimDevice::new(DeviceCaps::penguin());
//! dev.write32(0x1000, 0xCAFE).unwrap();
//! assert_eq!(dev.read32(0x1000).unwrap(), 0xCAFE);
//! ```

pub mod sim;

pub use sim::{SimDevice, SimErtMode};

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;

/// First address of the peer-to-peer command queue window in device RAM.
pub const P2P_CMDQ_ADDR: u64 = 0x80_0000_0000;

/// Maximum number of extra DMA compute units a device reports.
pub const MAX_CDMA: usize = 4;

/// Firmware generation at which the command queue moved to device RAM.
pub const ERT_P2P_VERSION: u32 = 30;

/// Offset of the CQ interrupt (doorbell) registers inside the CSR block.
pub const CQ_INT_OFFSET: u64 = 0x58;

/// Number of 32-bit read-to-clear CQ status words at the CSR base.
pub const CSR_STATUS_WORDS: usize = 4;

/// Device address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressSpace {
    /// CU control registers and the ERT CSR block.
    KernelControl,
    /// Device memory (peer-to-peer command queue).
    DeviceRam,
}

impl AddressSpace {
    /// Address space that owns `addr`.
    #[inline]
    pub fn for_addr(addr: u64) -> Self {
        if addr >= P2P_CMDQ_ADDR {
            Self::DeviceRam
        } else {
            Self::KernelControl
        }
    }
}

/// Capability flags reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    /// An embedded command processor (ERT) is present.
    pub ert: bool,
    /// Embedded firmware generation.
    pub ert_version: u32,
    /// Legacy firmware: CU packets are copied verbatim instead of with a
    /// host-selected CU index.
    pub legacy_ert: bool,
    /// Base addresses of extra DMA compute units (zero = absent).
    pub cdma_addrs: [u64; MAX_CDMA],
}

impl DeviceCaps {
    /// Device without an embedded processor.
    pub fn penguin() -> Self {
        Self::default()
    }

    /// Device with an embedded processor at the given firmware generation.
    pub fn embedded(ert_version: u32) -> Self {
        Self {
            ert: true,
            ert_version,
            ..Self::default()
        }
    }

    /// Add extra DMA compute units.
    pub fn with_cdma(mut self, addrs: &[u64]) -> Self {
        for (slot, addr) in self.cdma_addrs.iter_mut().zip(addrs) {
            *slot = *addr;
        }
        self
    }

    /// Number of DMA compute units present.
    pub fn num_cdma(&self) -> usize {
        self.cdma_addrs.iter().filter(|a| **a != 0).count()
    }

    /// Base of the embedded command queue.
    pub fn cq_base(&self) -> u64 {
        if self.ert_version >= ERT_P2P_VERSION {
            P2P_CMDQ_ADDR
        } else {
            0x19_0000
        }
    }

    /// Base of the embedded processor CSR block.
    pub fn csr_base(&self) -> u64 {
        if self.ert_version >= ERT_P2P_VERSION {
            0x1_0000
        } else {
            0x18_0000
        }
    }
}

/// Read/write access to device address spaces.
///
/// Each access is assumed individually atomic. Implementations use interior
/// mutability so one port can be shared between the scheduler thread and the
/// XGQ workers.
pub trait RegisterPort: Send + Sync {
    /// Read `buf.len()` bytes from `space` at `addr`.
    fn read(&self, space: AddressSpace, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` to `space` at `addr`.
    fn write(&self, space: AddressSpace, addr: u64, buf: &[u8]) -> Result<()>;

    /// Query device capabilities.
    fn capabilities(&self) -> DeviceCaps;

    /// Read one 32-bit word.
    fn read32(&self, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(AddressSpace::for_addr(addr), addr, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    /// Write one 32-bit word.
    fn write32(&self, addr: u64, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        log::trace!("write32 0x{:x} <- 0x{:08x}", addr, value);
        self.write(AddressSpace::for_addr(addr), addr, &buf)
    }

    /// Read `count` consecutive words.
    fn read_words(&self, addr: u64, count: usize) -> Result<Vec<u32>> {
        let mut bytes = vec![0u8; count * 4];
        self.read(AddressSpace::for_addr(addr), addr, &mut bytes)?;
        let mut words = vec![0u32; count];
        LittleEndian::read_u32_into(&bytes, &mut words);
        Ok(words)
    }

    /// Write consecutive words in one access.
    fn write_words(&self, addr: u64, words: &[u32]) -> Result<()> {
        if words.is_empty() {
            return Ok(());
        }
        let mut bytes = vec![0u8; words.len() * 4];
        LittleEndian::write_u32_into(words, &mut bytes);
        self.write(AddressSpace::for_addr(addr), addr, &bytes)
    }
}

/// Port shared between the scheduler and its callers.
pub type SharedPort = Arc<dyn RegisterPort>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_routing() {
        assert_eq!(AddressSpace::for_addr(0x18_0000), AddressSpace::KernelControl);
        assert_eq!(AddressSpace::for_addr(P2P_CMDQ_ADDR), AddressSpace::DeviceRam);
        assert_eq!(AddressSpace::for_addr(P2P_CMDQ_ADDR + 0x40), AddressSpace::DeviceRam);
    }

    #[test]
    fn test_address_map_follows_firmware() {
        let legacy = DeviceCaps::embedded(29);
        assert_eq!(legacy.cq_base(), 0x19_0000);
        assert_eq!(legacy.csr_base(), 0x18_0000);

        let p2p = DeviceCaps::embedded(30);
        assert_eq!(p2p.cq_base(), P2P_CMDQ_ADDR);
        assert_eq!(p2p.csr_base(), 0x1_0000);
    }

    #[test]
    fn test_cdma_count_ignores_zero() {
        let caps = DeviceCaps::embedded(30).with_cdma(&[0x4000, 0, 0x5000]);
        assert_eq!(caps.num_cdma(), 2);
        assert_eq!(caps.cdma_addrs, [0x4000, 0, 0x5000, 0]);
    }
}
