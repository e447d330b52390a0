//! XGQ producer/consumer ring.
//!
//! One XGQ is a submission ring (SQ) and a completion ring (CQ) sharing one
//! region of device memory between a client (the host) and a server (the
//! embedded processor):
//!
//! ```text
//! ring_addr ┌────────────────────────────┐
//!           │ header (8 words)           │ magic, version, slot count,
//!           │                            │ SQ/CQ offsets, consumed counters
//!           ├────────────────────────────┤ + sq_offset
//!           │ SQ slot 0 .. N-1           │ sq_slot_size bytes each
//!           ├────────────────────────────┤ + cq_offset
//!           │ CQ slot 0 .. N-1           │ 16 bytes each
//!           └────────────────────────────┘
//! ```
//!
//! Consumed counters live in the header because nobody needs an interrupt
//! when a slot frees up. Produced counters live in doorbell registers
//! supplied by the caller, so writing one notifies the peer.
//!
//! Counters are free-running `u32`s; a ring is full when
//! `produced - consumed >= slots` and the slot for a counter value is
//! `counter & (slots - 1)`.
//!
//! # Usage
//!
//! ```
//! use ert_sched::device::{DeviceCaps, SimDevice};
//! use ert_sched::xgq::{CqEntry, Doorbells, Role, SqEntry, Xgq, XgqOpcode};
//!
//! let dev = SimDevice::new(DeviceCaps::embedded(30));
//! let bells = Doorbells { sq_produced: 0x2_0000, cq_produced: 0x2_0004 };
//! let (mut client, _len) = Xgq::alloc(&dev, Role::Client, 0x3_0000, 0x1000, 64, bells).unwrap();
//! let mut server = Xgq::attach(&dev, Role::Server, 0x3_0000, bells).unwrap();
//!
//! client.submit(&dev, &SqEntry::new(XgqOpcode::Barrier, 1, vec![]).unwrap()).unwrap();
//! let cmd = server.next_submission(&dev).unwrap().unwrap();
//! server.post_completion(&dev, &CqEntry::completed(cmd.header.cid, 0)).unwrap();
//! assert!(client.next_completion(&dev).unwrap().unwrap().is_ok());
//! ```

use crate::device::RegisterPort;
use crate::error::{Result, SchedError};

use super::entry::{
    CqEntry, SqEntry, SqHeader, CQ_ENTRY_WORDS, SQ_HEADER_WORDS, XGQ_ENTRY_NEW_FLAG_MASK,
};

/// Header magic written by the allocating side once the header is complete.
pub const XGQ_ALLOC_MAGIC: u32 = 0x5847_513F;

/// Header magic written by the attaching side.
pub const XGQ_ATTACH_MAGIC: u32 = 0x5847_5121;

pub const XGQ_MAJOR: u32 = 1;
pub const XGQ_MINOR: u32 = 0;

/// Smallest slot count a ring may have.
pub const XGQ_MIN_NUM_SLOTS: u32 = 4;

/// Size of the ring header.
pub const XGQ_HEADER_BYTES: u64 = 32;

/// Size of a completion slot.
pub const XGQ_CQ_SLOT_BYTES: u32 = (CQ_ENTRY_WORDS * 4) as u32;

const HDR_VERSION: u64 = 4;
const HDR_SQ_CONSUMED: u64 = 24;
const HDR_CQ_CONSUMED: u64 = 28;

/// Bytes needed for `nslots` slots of `slot_size` plus their completions.
pub fn ring_len(nslots: u32, slot_size: u32) -> u64 {
    XGQ_HEADER_BYTES + nslots as u64 * (slot_size as u64 + XGQ_CQ_SLOT_BYTES as u64)
}

/// Which end of the queue this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Produces submissions, consumes completions.
    Client,
    /// Consumes submissions, produces completions.
    Server,
}

/// Produced-counter registers for both rings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Doorbells {
    pub sq_produced: u64,
    pub cq_produced: u64,
}

/// Local view of one ring.
#[derive(Debug, Clone)]
struct RingHalf {
    slot_num: u32,
    slot_size: u32,
    produced: u32,
    consumed: u32,
    produced_addr: u64,
    consumed_addr: u64,
    slot_addr: u64,
}

impl RingHalf {
    fn new(produced_addr: u64, consumed_addr: u64, slot_addr: u64, slot_num: u32, slot_size: u32) -> Self {
        Self {
            slot_num,
            slot_size,
            produced: 0,
            consumed: 0,
            produced_addr,
            consumed_addr,
            slot_addr,
        }
    }

    fn is_full(&self) -> bool {
        self.produced.wrapping_sub(self.consumed) >= self.slot_num
    }

    fn is_empty(&self) -> bool {
        self.produced == self.consumed
    }

    fn slot_ptr(&self, counter: u32) -> u64 {
        self.slot_addr + self.slot_size as u64 * (counter & (self.slot_num - 1)) as u64
    }
}

/// One side of an XGQ.
#[derive(Debug, Clone)]
pub struct Xgq {
    role: Role,
    sq: RingHalf,
    cq: RingHalf,
}

impl Xgq {
    /// Lay out a new ring at `ring_addr` using as many slots as fit in
    /// `ring_len` bytes. Returns the queue and the bytes actually used.
    ///
    /// The header magic is written last so an attaching peer never sees a
    /// partial header.
    pub fn alloc(
        port: &dyn RegisterPort,
        role: Role,
        ring_addr: u64,
        ring_bytes: u64,
        slot_size: u32,
        doorbells: Doorbells,
    ) -> Result<(Self, u64)> {
        if slot_size == 0 || slot_size % 4 != 0 {
            return Err(SchedError::InvalidConfiguration(format!(
                "xgq slot size {} is not a multiple of 4",
                slot_size
            )));
        }
        let mut nslots = XGQ_MIN_NUM_SLOTS;
        if ring_len(nslots, slot_size) > ring_bytes {
            return Err(SchedError::InvalidConfiguration(format!(
                "xgq ring of {} bytes cannot hold {} slots of {} bytes",
                ring_bytes, nslots, slot_size
            )));
        }
        while ring_len(nslots << 1, slot_size) <= ring_bytes {
            nslots <<= 1;
        }

        let sq_offset = XGQ_HEADER_BYTES;
        let cq_offset = sq_offset + nslots as u64 * slot_size as u64;
        let xgq = Self {
            role,
            sq: RingHalf::new(
                doorbells.sq_produced,
                ring_addr + HDR_SQ_CONSUMED,
                ring_addr + sq_offset,
                nslots,
                slot_size,
            ),
            cq: RingHalf::new(
                doorbells.cq_produced,
                ring_addr + HDR_CQ_CONSUMED,
                ring_addr + cq_offset,
                nslots,
                XGQ_CQ_SLOT_BYTES,
            ),
        };

        let header = [
            XGQ_MINOR | (XGQ_MAJOR << 8),
            nslots,
            sq_offset as u32,
            slot_size,
            cq_offset as u32,
            0,
            0,
        ];
        port.write_words(ring_addr + HDR_VERSION, &header)?;
        port.write32(ring_addr, XGQ_ALLOC_MAGIC)?;

        let used = ring_len(nslots, slot_size);
        log::info!(
            "xgq allocated at 0x{:x}: {} slots of {} bytes ({} bytes)",
            ring_addr,
            nslots,
            slot_size,
            used
        );
        Ok((xgq, used))
    }

    /// Join a ring the peer allocated at `ring_addr`.
    pub fn attach(port: &dyn RegisterPort, role: Role, ring_addr: u64, doorbells: Doorbells) -> Result<Self> {
        let magic = port.read32(ring_addr)?;
        if magic != XGQ_ALLOC_MAGIC {
            return Err(SchedError::DeviceProtocol(format!(
                "xgq at 0x{:x} not ready (magic 0x{:08x})",
                ring_addr, magic
            )));
        }
        let header = port.read_words(ring_addr + HDR_VERSION, 4)?;
        let major = (header[0] >> 8) & 0xff;
        if major != XGQ_MAJOR {
            return Err(SchedError::DeviceProtocol(format!("unsupported xgq version {}", major)));
        }
        let nslots = header[1];
        if nslots < XGQ_MIN_NUM_SLOTS || !nslots.is_power_of_two() {
            return Err(SchedError::DeviceProtocol(format!("bad xgq slot count {}", nslots)));
        }
        let (sq_offset, sq_slot_size, cq_offset) = (header[2] as u64, header[3], header[4] as u64);

        let xgq = Self {
            role,
            sq: RingHalf::new(
                doorbells.sq_produced,
                ring_addr + HDR_SQ_CONSUMED,
                ring_addr + sq_offset,
                nslots,
                sq_slot_size,
            ),
            cq: RingHalf::new(
                doorbells.cq_produced,
                ring_addr + HDR_CQ_CONSUMED,
                ring_addr + cq_offset,
                nslots,
                XGQ_CQ_SLOT_BYTES,
            ),
        };
        port.write32(ring_addr, XGQ_ATTACH_MAGIC)?;
        log::info!("xgq attached at 0x{:x}: {} slots", ring_addr, nslots);
        Ok(xgq)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Slots per ring.
    pub fn slot_num(&self) -> u32 {
        self.sq.slot_num
    }

    /// Bytes per submission slot.
    pub fn sq_slot_size(&self) -> u32 {
        self.sq.slot_size
    }

    fn produce_ring(&mut self) -> &mut RingHalf {
        match self.role {
            Role::Client => &mut self.sq,
            Role::Server => &mut self.cq,
        }
    }

    fn consume_ring(&mut self) -> &mut RingHalf {
        match self.role {
            Role::Client => &mut self.cq,
            Role::Server => &mut self.sq,
        }
    }

    /// Claim the next slot on the ring this side produces into.
    pub fn produce(&mut self, port: &dyn RegisterPort) -> Result<u64> {
        let ring = self.produce_ring();
        if ring.is_full() {
            ring.consumed = port.read32(ring.consumed_addr)?;
            if ring.is_full() {
                return Err(SchedError::ResourceExhausted("xgq ring entry"));
            }
        }
        ring.produced = ring.produced.wrapping_add(1);
        Ok(ring.slot_ptr(ring.produced))
    }

    /// Claim the next filled slot on the ring this side consumes from.
    ///
    /// Returns `None` if the peer has not produced anything, or has bumped
    /// its counter but not yet set the entry's new flag.
    pub fn consume(&mut self, port: &dyn RegisterPort) -> Result<Option<u64>> {
        let ring = self.consume_ring();
        if ring.is_empty() {
            ring.produced = port.read32(ring.produced_addr)?;
            if ring.is_empty() {
                return Ok(None);
            }
        }
        let next = ring.consumed.wrapping_add(1);
        let slot = ring.slot_ptr(next);
        if port.read32(slot)? & XGQ_ENTRY_NEW_FLAG_MASK == 0 {
            return Ok(None);
        }
        ring.consumed = next;
        Ok(Some(slot))
    }

    /// Publish the produced counter to the peer.
    pub fn notify_peer_produced(&mut self, port: &dyn RegisterPort) -> Result<()> {
        let ring = self.produce_ring();
        port.write32(ring.produced_addr, ring.produced)
    }

    /// Publish the consumed counter to the peer.
    pub fn notify_peer_consumed(&mut self, port: &dyn RegisterPort) -> Result<()> {
        let ring = self.consume_ring();
        port.write32(ring.consumed_addr, ring.consumed)
    }

    /// Client: write `entry` into the next SQ slot and ring the doorbell.
    pub fn submit(&mut self, port: &dyn RegisterPort, entry: &SqEntry) -> Result<()> {
        self.expect_role(Role::Client)?;
        if entry.byte_len() > self.sq.slot_size as usize {
            return Err(SchedError::InvalidConfiguration(format!(
                "xgq entry of {} bytes exceeds slot size {}",
                entry.byte_len(),
                self.sq.slot_size
            )));
        }
        let slot = self.produce(port)?;
        let words = entry.to_words();
        port.write_words(slot + 4, &words[1..])?;
        // Header last: the server keys off the new flag.
        port.write32(slot, words[0])?;
        self.notify_peer_produced(port)?;
        log::trace!("xgq submit cid {} at 0x{:x}", entry.header.cid, slot);
        Ok(())
    }

    /// Client: take the next completion, if any.
    pub fn next_completion(&mut self, port: &dyn RegisterPort) -> Result<Option<CqEntry>> {
        self.expect_role(Role::Client)?;
        let Some(slot) = self.consume(port)? else {
            return Ok(None);
        };
        let words = port.read_words(slot, CQ_ENTRY_WORDS)?;
        port.write32(slot, 0)?;
        self.notify_peer_consumed(port)?;
        Ok(Some(CqEntry::decode([words[0], words[1], words[2], words[3]])))
    }

    /// Server: take the next submission, if any.
    pub fn next_submission(&mut self, port: &dyn RegisterPort) -> Result<Option<SqEntry>> {
        self.expect_role(Role::Server)?;
        let Some(slot) = self.consume(port)? else {
            return Ok(None);
        };
        let head = port.read_words(slot, SQ_HEADER_WORDS)?;
        let header = SqHeader::decode([head[0], head[1]]);
        let bytes = (SQ_HEADER_WORDS + header.count as usize) * 4;
        if bytes > self.sq.slot_size as usize {
            port.write32(slot, 0)?;
            self.notify_peer_consumed(port)?;
            return Err(SchedError::DeviceProtocol(format!(
                "submission cid {} claims {} bytes in a {} byte slot",
                header.cid, bytes, self.sq.slot_size
            )));
        }
        let payload = port.read_words(slot + (SQ_HEADER_WORDS as u64) * 4, header.count as usize)?;
        port.write32(slot, 0)?;
        self.notify_peer_consumed(port)?;
        Ok(Some(SqEntry { header, payload }))
    }

    /// Server: post a completion and notify the client.
    pub fn post_completion(&mut self, port: &dyn RegisterPort, entry: &CqEntry) -> Result<()> {
        self.expect_role(Role::Server)?;
        let slot = self.produce(port)?;
        let words = entry.encode();
        port.write_words(slot + 4, &words[1..])?;
        port.write32(slot, words[0] | XGQ_ENTRY_NEW_FLAG_MASK)?;
        self.notify_peer_produced(port)
    }

    fn expect_role(&self, role: Role) -> Result<()> {
        if self.role != role {
            return Err(SchedError::InvalidConfiguration(format!(
                "{:?} operation on a {:?} queue",
                role, self.role
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AddressSpace, DeviceCaps, SimDevice};
    use crate::xgq::entry::XgqOpcode;

    const RING: u64 = 0x3_0000;
    const BELLS: Doorbells = Doorbells {
        sq_produced: 0x2_0000,
        cq_produced: 0x2_0004,
    };

    fn pair(dev: &SimDevice, bytes: u64, slot_size: u32) -> (Xgq, Xgq) {
        let (client, _) = Xgq::alloc(dev, Role::Client, RING, bytes, slot_size, BELLS).unwrap();
        let server = Xgq::attach(dev, Role::Server, RING, BELLS).unwrap();
        (client, server)
    }

    #[test]
    fn test_alloc_doubles_slots_while_they_fit() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let (xgq, used) = Xgq::alloc(&dev, Role::Client, RING, 4096, 512, BELLS).unwrap();
        assert_eq!(xgq.slot_num(), 4);
        assert_eq!(used, 32 + 4 * (512 + 16));

        let (xgq, _) = Xgq::alloc(&dev, Role::Client, RING, ring_len(16, 64), 64, BELLS).unwrap();
        assert_eq!(xgq.slot_num(), 16);
    }

    #[test]
    fn test_alloc_rejects_bad_geometry() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        assert!(Xgq::alloc(&dev, Role::Client, RING, 4096, 510, BELLS).is_err());
        assert!(Xgq::alloc(&dev, Role::Client, RING, 100, 64, BELLS).is_err());
    }

    #[test]
    fn test_magic_written_after_header() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        Xgq::alloc(&dev, Role::Client, RING, 4096, 64, BELLS).unwrap();
        let last = *dev.writes().last().unwrap();
        assert_eq!((last.addr, last.value), (RING, XGQ_ALLOC_MAGIC));

        Xgq::attach(&dev, Role::Server, RING, BELLS).unwrap();
        assert_eq!(dev.peek(AddressSpace::KernelControl, RING), XGQ_ATTACH_MAGIC);
    }

    #[test]
    fn test_attach_validates_header() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        assert!(matches!(
            Xgq::attach(&dev, Role::Server, RING, BELLS),
            Err(SchedError::DeviceProtocol(_))
        ));

        Xgq::alloc(&dev, Role::Client, RING, 4096, 64, BELLS).unwrap();
        dev.poke(AddressSpace::KernelControl, RING + 8, 6);
        assert!(Xgq::attach(&dev, Role::Server, RING, BELLS).is_err());

        dev.poke(AddressSpace::KernelControl, RING + 8, 4);
        dev.poke(AddressSpace::KernelControl, RING + 4, 2 << 8);
        assert!(Xgq::attach(&dev, Role::Server, RING, BELLS).is_err());
    }

    #[test]
    fn test_submit_writes_header_last_and_rings_doorbell() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let (mut client, _) = pair(&dev, 4096, 64);
        dev.clear_writes();

        let entry = SqEntry::new(XgqOpcode::StartCuIdx, 5, vec![1, 2, 3]).unwrap();
        client.submit(&dev, &entry).unwrap();

        let writes = dev.writes();
        let n = writes.len();
        let slot = RING + XGQ_HEADER_BYTES + 64;
        assert_eq!(writes[n - 2].addr, slot, "header word before doorbell");
        assert_eq!(writes[n - 2].value & XGQ_ENTRY_NEW_FLAG_MASK, XGQ_ENTRY_NEW_FLAG_MASK);
        assert_eq!((writes[n - 1].addr, writes[n - 1].value), (BELLS.sq_produced, 1));
        assert!(writes[..n - 2].iter().all(|w| w.addr != slot));
    }

    #[test]
    fn test_round_trip_through_both_sides() {
        let dev = SimDevice::new(DeviceCaps::embedded(30));
        let (mut client, mut server) = pair(&dev, 4096, 64);

        assert!(server.next_submission(&dev).unwrap().is_none());
        let entry = SqEntry::new(XgqOpcode::LoadXclbin, 9, vec![0x1000, 0, 64, 0]).unwrap();
        client.submit(&dev, &entry).unwrap();

        let got = server.next_submission(&dev).unwrap().unwrap();
        assert_eq!(got.header.cid, 9);
        assert_eq!(got.payload, entry.payload);
        assert!(server.next_submission(&dev).unwrap().is_none(), "entry consumed once");

        server.post_completion(&dev, &CqEntry::error(9, -5)).unwrap();
        let done = client.next_completion(&dev).unwrap().unwrap();
        assert_eq!((done.cid, done.rcode), (9, -5));
        assert!(client.next_completion(&dev).unwrap().is_none());
    }

    #[test]
    fn test_consumer_zeroes_word0() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let (mut client, mut server) = pair(&dev, ring_len(4, 64), 64);
        server.post_completion(&dev, &CqEntry::completed(1, 0)).unwrap();
        client.next_completion(&dev).unwrap().unwrap();
        let cq_slot1 = RING + XGQ_HEADER_BYTES + 4 * 64 + 16;
        assert_eq!(dev.peek(AddressSpace::KernelControl, cq_slot1), 0);
        assert_eq!(dev.peek(AddressSpace::KernelControl, RING + HDR_CQ_CONSUMED), 1);
    }

    #[test]
    fn test_full_ring_until_peer_consumes() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let (mut client, mut server) = pair(&dev, ring_len(4, 64), 64);
        let entry = SqEntry::new(XgqOpcode::Barrier, 0, vec![]).unwrap();
        for _ in 0..4 {
            client.submit(&dev, &entry).unwrap();
        }
        assert!(matches!(
            client.submit(&dev, &entry),
            Err(SchedError::ResourceExhausted(_))
        ));
        server.next_submission(&dev).unwrap().unwrap();
        client.submit(&dev, &entry).unwrap();
    }

    #[test]
    fn test_role_checked() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let (mut client, mut server) = pair(&dev, 4096, 64);
        assert!(client.next_submission(&dev).is_err());
        assert!(server.submit(&dev, &SqEntry::new(XgqOpcode::Barrier, 0, vec![]).unwrap()).is_err());
        let big = SqEntry::new(XgqOpcode::Barrier, 0, vec![0; 20]).unwrap();
        assert!(client.submit(&dev, &big).is_err());
    }
}
