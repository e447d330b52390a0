//! ERT command packet codec.
//!
//! Callers hand the scheduler a command buffer: a header word followed by
//! `count` payload words.
//!
//! ```text
//!  31    28 27    23 22          12 11  10 9     4 3     0
//! ┌────────┬────────┬──────────────┬──────┬───────┬───────┐
//! │  type  │ opcode │    count     │ xmsk │custom │ state │
//! └────────┴────────┴──────────────┴──────┴───────┴───────┘
//!  payload (start CU):  cu_mask | extra cu masks (xmsk) | register map
//!  payload (configure): slot_size | num_cus | cu_shift | cu_base | features | cu addrs
//! ```
//!
//! The register map keeps the CU's reserved control words at its start: four
//! words for in-order maps (argument N lands at byte offset `N << 2`), six
//! for indirect maps, which then carry `{offset, value}` pairs.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use smallvec::SmallVec;

use crate::error::{Result, SchedError};

/// Maximum number of compute units.
pub const MAX_CUS: usize = 128;

/// Maximum number of command queue slots.
pub const MAX_SLOTS: usize = 128;

/// Maximum number of 32-bit CU masks (one mandatory plus three extra).
pub const MAX_CU_MASKS: usize = 4;

/// Largest payload a packet header can describe.
pub const MAX_PAYLOAD_WORDS: usize = 0x7ff;

/// Version word placed by newer firmware in a CU_STAT reply.
pub const CUSTAT_VERSION: u32 = 0x51a1_0000;

/// Reserved control words at the start of an in-order register map.
pub const REGMAP_CTRL_WORDS: usize = 4;

/// Reserved words at the start of an indirect (offset/value) register map.
pub const REGMAP_INDIRECT_WORDS: usize = 6;

/// Lifecycle state of a command.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdState {
    New = 1,
    Queued = 2,
    Running = 3,
    Completed = 4,
    Error = 5,
    Abort = 6,
    Submitted = 7,
    Timeout = 8,
    NoResponse = 9,
}

impl CmdState {
    /// Decode a raw state value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::New,
            2 => Self::Queued,
            3 => Self::Running,
            4 => Self::Completed,
            5 => Self::Error,
            6 => Self::Abort,
            7 => Self::Submitted,
            8 => Self::Timeout,
            9 => Self::NoResponse,
            _ => return None,
        })
    }

    /// Once terminal, a command never changes state again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Abort | Self::Timeout | Self::NoResponse
        )
    }

    /// Position in the lifecycle. Terminal states share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Queued => 1,
            Self::Submitted => 2,
            Self::Running => 3,
            _ => 4,
        }
    }
}

/// Command opcode.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    StartCu = 0,
    Configure = 2,
    Exit = 3,
    Abort = 4,
    /// Start a CU with an indirect (offset/value) register map.
    ExecWrite = 5,
    CuStat = 6,
    StartCopyBo = 7,
    SkConfig = 8,
    SkStart = 9,
    SkUnconfig = 10,
    InitCu = 11,
}

impl Opcode {
    /// Decode a raw opcode value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::StartCu,
            2 => Self::Configure,
            3 => Self::Exit,
            4 => Self::Abort,
            5 => Self::ExecWrite,
            6 => Self::CuStat,
            7 => Self::StartCopyBo,
            8 => Self::SkConfig,
            9 => Self::SkStart,
            10 => Self::SkUnconfig,
            11 => Self::InitCu,
            _ => return None,
        })
    }

    /// Opcodes whose payload starts with CU masks.
    pub fn has_cu_masks(self) -> bool {
        matches!(self, Self::StartCu | Self::ExecWrite | Self::InitCu | Self::SkStart)
    }
}

/// Command type: selects the pending queue a command waits in.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdType {
    Default = 0,
    /// Completed by the scheduler itself.
    KdsLocal = 1,
    /// Control command, uses the reserved slot.
    Ctrl = 2,
    /// Bound to a compute unit.
    Cu = 3,
    /// Soft compute unit.
    Scu = 4,
}

impl CmdType {
    /// Decode a raw type value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Default,
            1 => Self::KdsLocal,
            2 => Self::Ctrl,
            3 => Self::Cu,
            4 => Self::Scu,
            _ => return None,
        })
    }
}

/// Packet header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader(pub u32);

impl PacketHeader {
    /// Header for a new packet.
    pub fn new(opcode: Opcode, ty: CmdType, count: u32) -> Self {
        Self(
            (CmdState::New as u32)
                | ((count & 0x7ff) << 12)
                | ((opcode as u32 & 0x1f) << 23)
                | ((ty as u32 & 0xf) << 28),
        )
    }

    pub fn state_raw(self) -> u32 {
        self.0 & 0xf
    }

    pub fn custom(self) -> u32 {
        (self.0 >> 4) & 0xff
    }

    pub fn count(self) -> u32 {
        (self.0 >> 12) & 0x7ff
    }

    pub fn opcode_raw(self) -> u32 {
        (self.0 >> 23) & 0x1f
    }

    pub fn type_raw(self) -> u32 {
        (self.0 >> 28) & 0xf
    }

    /// Extra CU masks following the mandatory one (start packets only).
    pub fn extra_cu_masks(self) -> u32 {
        (self.0 >> 10) & 0x3
    }

    pub fn with_state(self, state: CmdState) -> Self {
        Self((self.0 & !0xf) | state as u32)
    }

    pub fn with_extra_cu_masks(self, extra: u32) -> Self {
        Self((self.0 & !(0x3 << 10)) | ((extra & 0x3) << 10))
    }

    pub fn with_type(self, ty: CmdType) -> Self {
        Self((self.0 & 0x0fff_ffff) | ((ty as u32) << 28))
    }
}

/// A validated command buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErtPacket {
    words: Vec<u32>,
    opcode: Opcode,
    ty: CmdType,
}

fn malformed(msg: impl Into<String>) -> SchedError {
    SchedError::InvalidConfiguration(msg.into())
}

/// The header count field is 11 bits wide.
fn check_count(count: usize) -> Result<()> {
    if count > MAX_PAYLOAD_WORDS {
        return Err(malformed(format!("{} payload words, at most {}", count, MAX_PAYLOAD_WORDS)));
    }
    Ok(())
}

impl ErtPacket {
    /// Validate a command buffer. Words past `count` are dropped.
    pub fn parse(words: &[u32]) -> Result<Self> {
        let header = PacketHeader(*words.first().ok_or_else(|| malformed("empty command buffer"))?);
        let count = header.count() as usize;
        if words.len() < count + 1 {
            return Err(malformed(format!(
                "header declares {} payload words, buffer has {}",
                count,
                words.len() - 1
            )));
        }
        let opcode = Opcode::from_raw(header.opcode_raw())
            .ok_or_else(|| malformed(format!("unknown opcode {}", header.opcode_raw())))?;
        let ty = CmdType::from_raw(header.type_raw())
            .ok_or_else(|| malformed(format!("unknown command type {}", header.type_raw())))?;

        if opcode.has_cu_masks() {
            let masks = 1 + header.extra_cu_masks() as usize;
            if count < masks {
                return Err(malformed(format!("{} cu masks declared in {} words", masks, count)));
            }
        }

        Ok(Self {
            words: words[..=count].to_vec(),
            opcode,
            ty,
        })
    }

    /// Parse a little-endian byte buffer.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(malformed(format!("{} bytes is not a whole number of words", bytes.len())));
        }
        let mut cursor = Cursor::new(bytes);
        let mut words = Vec::with_capacity(bytes.len() / 4);
        while let Ok(word) = cursor.read_u32::<LittleEndian>() {
            words.push(word);
        }
        Self::parse(&words)
    }

    /// Start a CU with in-order arguments.
    pub fn start_cu(cu_masks: &[u32], args: &[u32]) -> Result<Self> {
        let mut regmap = vec![0u32; REGMAP_CTRL_WORDS];
        regmap.extend_from_slice(args);
        Self::with_masks(Opcode::StartCu, cu_masks, &regmap)
    }

    /// Start a CU with `{offset, value}` register writes.
    pub fn exec_write(cu_masks: &[u32], writes: &[(u32, u32)]) -> Result<Self> {
        let mut regmap = vec![0u32; REGMAP_INDIRECT_WORDS];
        for (offset, value) in writes {
            regmap.push(*offset);
            regmap.push(*value);
        }
        Self::with_masks(Opcode::ExecWrite, cu_masks, &regmap)
    }

    fn with_masks(opcode: Opcode, cu_masks: &[u32], regmap: &[u32]) -> Result<Self> {
        let masks: &[u32] = if cu_masks.is_empty() { &[0] } else { cu_masks };
        if masks.len() > MAX_CU_MASKS {
            return Err(malformed(format!("{} cu masks, at most {}", masks.len(), MAX_CU_MASKS)));
        }
        let count = masks.len() + regmap.len();
        check_count(count)?;
        let header = PacketHeader::new(opcode, CmdType::Cu, count as u32)
            .with_extra_cu_masks(masks.len() as u32 - 1);
        let mut words = Vec::with_capacity(count + 1);
        words.push(header.0);
        words.extend_from_slice(masks);
        words.extend_from_slice(regmap);
        Self::parse(&words)
    }

    /// A payload-less packet of the given opcode and type.
    pub fn simple(opcode: Opcode, ty: CmdType) -> Self {
        Self {
            words: vec![PacketHeader::new(opcode, ty, 0).0],
            opcode,
            ty,
        }
    }

    /// Packet from opcode, type and raw payload, validated like [`ErtPacket::parse`].
    pub fn with_payload(opcode: Opcode, ty: CmdType, payload: &[u32]) -> Result<Self> {
        check_count(payload.len())?;
        let mut words = Vec::with_capacity(payload.len() + 1);
        words.push(PacketHeader::new(opcode, ty, payload.len() as u32).0);
        words.extend_from_slice(payload);
        Self::parse(&words)
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader(self.words[0])
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn cmd_type(&self) -> CmdType {
        self.ty
    }

    /// Payload word count.
    pub fn count(&self) -> usize {
        self.words.len() - 1
    }

    /// Payload words (after the header).
    pub fn payload(&self) -> &[u32] {
        &self.words[1..]
    }

    /// Header and payload.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// State as recorded in the header.
    pub fn state(&self) -> Option<CmdState> {
        CmdState::from_raw(self.header().state_raw())
    }

    /// Reflect a state change in the header.
    pub fn set_state(&mut self, state: CmdState) {
        self.words[0] = self.header().with_state(state).0;
    }

    /// Re-type the packet (configure is forced onto the control path).
    pub fn set_type(&mut self, ty: CmdType) {
        self.words[0] = self.header().with_type(ty).0;
        self.ty = ty;
    }

    fn num_cu_masks(&self) -> usize {
        if self.opcode.has_cu_masks() {
            1 + self.header().extra_cu_masks() as usize
        } else {
            0
        }
    }

    /// CU eligibility masks, mask 0 covering CUs 0..32.
    pub fn cu_masks(&self) -> SmallVec<[u32; MAX_CU_MASKS]> {
        let payload = self.payload();
        payload[..self.num_cu_masks().min(payload.len())].iter().copied().collect()
    }

    /// Register map following the CU masks.
    pub fn regmap(&self) -> &[u32] {
        self.payload().get(self.num_cu_masks()..).unwrap_or_default()
    }
}

/// Feature flags of a configure command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigureFlags {
    /// Use the embedded processor.
    pub ert: bool,
    pub polling: bool,
    pub cu_dma: bool,
    pub cu_isr: bool,
    /// Ring the CQ interrupt register after writing a slot.
    pub cq_int: bool,
    pub cdma: bool,
    /// CUs are chained/dataflow.
    pub dataflow: bool,
}

impl ConfigureFlags {
    pub fn from_word(word: u32) -> Self {
        let bit = |n: u32| word & (1 << n) != 0;
        Self {
            ert: bit(0),
            polling: bit(1),
            cu_dma: bit(2),
            cu_isr: bit(3),
            cq_int: bit(4),
            cdma: bit(5),
            dataflow: bit(6),
        }
    }

    pub fn to_word(self) -> u32 {
        [
            self.ert,
            self.polling,
            self.cu_dma,
            self.cu_isr,
            self.cq_int,
            self.cdma,
            self.dataflow,
        ]
        .iter()
        .enumerate()
        .fold(0, |acc, (bit, on)| acc | ((*on as u32) << bit))
    }
}

/// Decoded configure command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureCmd {
    /// Command queue slot size in bytes.
    pub slot_size: u32,
    pub num_cus: u32,
    pub cu_shift: u32,
    pub cu_base_addr: u32,
    pub flags: ConfigureFlags,
    /// Encoded CU addresses (handshake code in the low bits).
    pub cu_addrs: Vec<u32>,
}

/// Words before the CU address list.
const CONFIGURE_FIXED_WORDS: usize = 5;

impl ConfigureCmd {
    /// Configuration for the given CU addresses.
    pub fn new(slot_size: u32, cu_addrs: &[u32]) -> Self {
        Self {
            slot_size,
            num_cus: cu_addrs.len() as u32,
            cu_shift: 16,
            cu_base_addr: 0,
            flags: ConfigureFlags::default(),
            cu_addrs: cu_addrs.to_vec(),
        }
    }

    /// Decode the payload of a configure packet.
    pub fn parse(packet: &ErtPacket) -> Result<Self> {
        if packet.opcode() != Opcode::Configure {
            return Err(malformed(format!("{:?} is not a configure packet", packet.opcode())));
        }
        let payload = packet.payload();
        if payload.len() < CONFIGURE_FIXED_WORDS {
            return Err(malformed(format!("configure payload of {} words", payload.len())));
        }
        let num_cus = payload[1];
        let cu_addrs = &payload[CONFIGURE_FIXED_WORDS..];
        if (num_cus as usize) > cu_addrs.len() {
            return Err(malformed(format!(
                "configure declares {} cus but lists {}",
                num_cus,
                cu_addrs.len()
            )));
        }
        Ok(Self {
            slot_size: payload[0],
            num_cus,
            cu_shift: payload[2],
            cu_base_addr: payload[3],
            flags: ConfigureFlags::from_word(payload[4]),
            cu_addrs: cu_addrs[..num_cus as usize].to_vec(),
        })
    }

    /// Encode as a control packet.
    pub fn to_packet(&self) -> Result<ErtPacket> {
        let mut payload = vec![
            self.slot_size,
            self.num_cus,
            self.cu_shift,
            self.cu_base_addr,
            self.flags.to_word(),
        ];
        payload.extend_from_slice(&self.cu_addrs);
        ErtPacket::with_payload(Opcode::Configure, CmdType::Ctrl, &payload)
    }
}

/// CU statistics returned by a CU_STAT command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CuStat {
    /// Firmware git version (newer firmware only).
    pub firmware: Option<u32>,
    /// Executions per CU.
    pub cu_usage: Vec<u32>,
    /// Per-CU status (1 running, 0 idle).
    pub cu_status: Vec<u32>,
    /// Per-slot status.
    pub slot_status: Vec<u32>,
}

impl CuStat {
    /// Decode the statistics the embedded processor left in a slot.
    ///
    /// `slot` is the whole slot including the header word.
    pub fn decode(slot: &[u32], num_cus: usize) -> Result<Self> {
        if slot.get(1) != Some(&CUSTAT_VERSION) {
            // Older firmware: usage only, straight after the header.
            let end = (1 + num_cus).min(slot.len());
            return Ok(Self {
                cu_usage: slot.get(1..end).unwrap_or_default().to_vec(),
                ..Self::default()
            });
        }

        let word = |i: usize| slot.get(i).copied().unwrap_or(0);
        let git = word(2);
        let num_slots = word(3) as usize;
        let fw_cus = word(4) as usize;
        if fw_cus > MAX_CUS || num_slots > MAX_CUS {
            return Err(SchedError::DeviceProtocol(format!(
                "cu stat reports {} cus and {} slots",
                fw_cus, num_slots
            )));
        }

        let mut idx = 5;
        let mut take = |n: usize| {
            let end = (idx + n).min(slot.len());
            let words = slot[idx.min(end)..end].to_vec();
            idx = end;
            words
        };
        let cu_usage = take(fw_cus);
        let cu_status = take(fw_cus);
        let slot_status = take(num_slots);

        Ok(Self {
            firmware: Some(git),
            cu_usage,
            cu_status,
            slot_status,
        })
    }
}
