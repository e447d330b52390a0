//! XGQ queue entry formats.
//!
//! Submission entry (SQ), two header words then payload:
//!
//! ```text
//! word0: [31] new | [30:16] payload word count | [15:0] opcode
//! word1: [31:16] reserved                      | [15:0] command id
//! word2..: payload
//! ```
//!
//! Completion entry (CQ), always four words:
//!
//! ```text
//! word0: [31] new | [30] specific | [29:16] state | [15:0] command id
//! word1: result
//! word2: reserved
//! word3: return code (POSIX errno style, 0 = success)
//! ```
//!
//! Word 0 carries the new flag in both formats. Producers write it after the
//! rest of the entry; consumers zero it after reading.

use crate::error::{Result, SchedError};

/// Set in word 0 of an entry that has not been consumed.
pub const XGQ_ENTRY_NEW_FLAG_MASK: u32 = 0x8000_0000;

/// Words in a submission header.
pub const SQ_HEADER_WORDS: usize = 2;

/// Words in a completion entry.
pub const CQ_ENTRY_WORDS: usize = 4;

/// Largest payload count the 15-bit field holds.
pub const MAX_PAYLOAD_WORDS: usize = 0x7fff;

/// XGQ command opcode.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XgqOpcode {
    LoadXclbin = 0x0,
    Configure = 0x1,
    ConfigurePsKernel = 0x2,
    StartCuIdx = 0x100,
    StartCuIdxIndirect = 0x101,
    Barrier = 0x200,
    ExitErt = 0x201,
}

impl XgqOpcode {
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x0 => Self::LoadXclbin,
            0x1 => Self::Configure,
            0x2 => Self::ConfigurePsKernel,
            0x100 => Self::StartCuIdx,
            0x101 => Self::StartCuIdxIndirect,
            0x200 => Self::Barrier,
            0x201 => Self::ExitErt,
            _ => return None,
        })
    }
}

/// Generic completion state.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XgqCmdState {
    Completed = 0,
    Error = 1,
}

/// Where an address in a load command points.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XgqAddrType {
    Device = 0,
    SlaveBridge = 1,
}

/// Submission header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqHeader {
    pub opcode: u16,
    /// Payload length in words.
    pub count: u16,
    pub new: bool,
    pub cid: u16,
}

impl SqHeader {
    pub fn encode(&self) -> [u32; SQ_HEADER_WORDS] {
        let mut word0 = self.opcode as u32 | ((self.count as u32 & 0x7fff) << 16);
        if self.new {
            word0 |= XGQ_ENTRY_NEW_FLAG_MASK;
        }
        [word0, self.cid as u32]
    }

    pub fn decode(words: [u32; SQ_HEADER_WORDS]) -> Self {
        Self {
            opcode: (words[0] & 0xffff) as u16,
            count: ((words[0] >> 16) & 0x7fff) as u16,
            new: words[0] & XGQ_ENTRY_NEW_FLAG_MASK != 0,
            cid: (words[1] & 0xffff) as u16,
        }
    }
}

/// A full submission entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqEntry {
    pub header: SqHeader,
    pub payload: Vec<u32>,
}

impl SqEntry {
    /// New entry for `opcode` carrying `payload`.
    pub fn new(opcode: XgqOpcode, cid: u16, payload: Vec<u32>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_WORDS {
            return Err(SchedError::InvalidConfiguration(format!(
                "xgq payload of {} words exceeds {}",
                payload.len(),
                MAX_PAYLOAD_WORDS
            )));
        }
        Ok(Self {
            header: SqHeader {
                opcode: opcode as u16,
                count: payload.len() as u16,
                new: true,
                cid,
            },
            payload,
        })
    }

    pub fn opcode(&self) -> Option<XgqOpcode> {
        XgqOpcode::from_raw(self.header.opcode)
    }

    /// Size in bytes when written to a slot.
    pub fn byte_len(&self) -> usize {
        (SQ_HEADER_WORDS + self.payload.len()) * 4
    }

    /// Header followed by payload.
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = self.header.encode().to_vec();
        words.extend_from_slice(&self.payload);
        words
    }

    /// Rebuild from slot words; `words` may extend past the entry.
    pub fn from_words(words: &[u32]) -> Result<Self> {
        if words.len() < SQ_HEADER_WORDS {
            return Err(SchedError::DeviceProtocol("truncated submission header".into()));
        }
        let header = SqHeader::decode([words[0], words[1]]);
        let end = SQ_HEADER_WORDS + header.count as usize;
        let payload = words
            .get(SQ_HEADER_WORDS..end)
            .ok_or_else(|| {
                SchedError::DeviceProtocol(format!(
                    "submission declares {} payload words, slot holds {}",
                    header.count,
                    words.len() - SQ_HEADER_WORDS
                ))
            })?
            .to_vec();
        Ok(Self { header, payload })
    }
}

/// Completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    pub cid: u16,
    /// 14-bit command state.
    pub cstate: u16,
    /// `result` carries command-specific data.
    pub specific: bool,
    pub new: bool,
    pub result: u32,
    /// POSIX-style return code.
    pub rcode: i32,
}

impl CqEntry {
    /// Successful completion of `cid`.
    pub fn completed(cid: u16, result: u32) -> Self {
        Self {
            cid,
            cstate: XgqCmdState::Completed as u16,
            specific: false,
            new: true,
            result,
            rcode: 0,
        }
    }

    /// Failed completion of `cid` with `rcode`.
    pub fn error(cid: u16, rcode: i32) -> Self {
        Self {
            cid,
            cstate: XgqCmdState::Error as u16,
            specific: false,
            new: true,
            result: 0,
            rcode,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.cstate == XgqCmdState::Completed as u16 && self.rcode == 0
    }

    pub fn encode(&self) -> [u32; CQ_ENTRY_WORDS] {
        let mut word0 = self.cid as u32 | ((self.cstate as u32 & 0x3fff) << 16);
        if self.specific {
            word0 |= 1 << 30;
        }
        if self.new {
            word0 |= XGQ_ENTRY_NEW_FLAG_MASK;
        }
        [word0, self.result, 0, self.rcode as u32]
    }

    pub fn decode(words: [u32; CQ_ENTRY_WORDS]) -> Self {
        Self {
            cid: (words[0] & 0xffff) as u16,
            cstate: ((words[0] >> 16) & 0x3fff) as u16,
            specific: words[0] & (1 << 30) != 0,
            new: words[0] & XGQ_ENTRY_NEW_FLAG_MASK != 0,
            result: words[1],
            rcode: words[3] as i32,
        }
    }
}

/// Payload of a load-image command: 64-bit address, byte size, address type.
pub fn load_xclbin_payload(address: u64, size: u32, addr_type: XgqAddrType) -> Vec<u32> {
    vec![
        address as u32,
        (address >> 32) as u32,
        size,
        addr_type as u32 & 0xf,
    ]
}

/// Payload of a start-by-index command.
pub fn start_cuidx_payload(cu_idx: u32, args: &[u32]) -> Vec<u32> {
    let mut payload = Vec::with_capacity(args.len() + 1);
    payload.push(cu_idx);
    payload.extend_from_slice(args);
    payload
}
