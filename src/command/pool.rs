//! Commands and the arena that owns them.
//!
//! Every structure that refers to a command (CU running FIFOs, slot table,
//! pending queues) stores a [`CmdId`], never a reference. Freed ids go on a
//! free list and are handed out again.

use smallvec::SmallVec;

use super::packet::{CmdState, CmdType, ErtPacket, Opcode, MAX_CUS, MAX_CU_MASKS};

/// Index of a command inside a [`CommandPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdId(u32);

impl CmdId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// State transitions a command went through, oldest first.
pub type StateHistory = SmallVec<[CmdState; 6]>;

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone)]
pub struct Command {
    /// Caller-visible id, unique for the lifetime of a scheduler.
    pub uid: u64,
    packet: ErtPacket,
    state: CmdState,
    history: StateHistory,
    cu_bitmap: [u32; MAX_CU_MASKS],
    /// CU chosen at submission.
    pub cu_idx: Option<usize>,
    /// Command queue slot while the command sits in the ring.
    pub slot_idx: Option<usize>,
    /// Set when the command must finish as `Abort` instead of `Completed`.
    pub aborted: bool,
}

impl Command {
    /// Wrap a validated packet. The command starts in `New`.
    pub fn new(uid: u64, packet: ErtPacket) -> Self {
        let mut cu_bitmap = [0u32; MAX_CU_MASKS];
        for (dst, mask) in cu_bitmap.iter_mut().zip(packet.cu_masks()) {
            *dst = mask;
        }
        let mut cmd = Self {
            uid,
            packet,
            state: CmdState::New,
            history: SmallVec::new(),
            cu_bitmap,
            cu_idx: None,
            slot_idx: None,
            aborted: false,
        };
        cmd.history.push(CmdState::New);
        cmd.packet.set_state(CmdState::New);
        cmd
    }

    pub fn packet(&self) -> &ErtPacket {
        &self.packet
    }

    pub fn packet_mut(&mut self) -> &mut ErtPacket {
        &mut self.packet
    }

    pub fn opcode(&self) -> Opcode {
        self.packet.opcode()
    }

    pub fn cmd_type(&self) -> CmdType {
        self.packet.cmd_type()
    }

    pub fn state(&self) -> CmdState {
        self.state
    }

    pub fn history(&self) -> &StateHistory {
        &self.history
    }

    /// Move to `state`, recording it and mirroring it into the packet header.
    ///
    /// Terminal states are sticky: a second terminal transition is ignored.
    pub fn set_state(&mut self, state: CmdState) {
        if self.state.is_terminal() || self.state == state {
            return;
        }
        log::trace!("cmd({}) {:?} -> {:?}", self.uid, self.state, state);
        self.state = state;
        self.history.push(state);
        self.packet.set_state(state);
    }

    /// Whether the command may execute on CU `idx`.
    pub fn has_cu(&self, idx: usize) -> bool {
        idx < MAX_CUS && self.cu_bitmap[idx >> 5] & (1 << (idx & 31)) != 0
    }

    /// Eligible CUs in ascending order.
    pub fn eligible_cus(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CUS).filter(move |idx| self.has_cu(*idx))
    }

    /// Lock the command to one CU.
    pub fn set_cu(&mut self, idx: usize) {
        self.cu_idx = Some(idx);
        self.cu_bitmap = [0; MAX_CU_MASKS];
        self.cu_bitmap[idx >> 5] = 1 << (idx & 31);
    }
}

/// Arena of live commands.
#[derive(Debug, Default)]
pub struct CommandPool {
    entries: Vec<Option<Command>>,
    free: Vec<CmdId>,
    live: usize,
}

impl CommandPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a command, reusing a freed id when available.
    pub fn insert(&mut self, cmd: Command) -> CmdId {
        self.live += 1;
        if let Some(id) = self.free.pop() {
            self.entries[id.index()] = Some(cmd);
            return id;
        }
        self.entries.push(Some(cmd));
        CmdId((self.entries.len() - 1) as u32)
    }

    pub fn get(&self, id: CmdId) -> Option<&Command> {
        self.entries.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: CmdId) -> Option<&mut Command> {
        self.entries.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Take a command out of the arena and free its id.
    pub fn remove(&mut self, id: CmdId) -> Option<Command> {
        let cmd = self.entries.get_mut(id.index())?.take()?;
        self.free.push(id);
        self.live -= 1;
        Some(cmd)
    }

    /// Number of live commands.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Ids of all live commands.
    pub fn ids(&self) -> Vec<CmdId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| CmdId(i as u32))
            .collect()
    }
}
