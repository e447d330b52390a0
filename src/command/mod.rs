//! Commands: the packet wire format and the arena that owns live commands.

pub mod packet;
pub mod pool;

pub use packet::{
    CmdState, CmdType, ConfigureCmd, ConfigureFlags, CuStat, ErtPacket, Opcode, PacketHeader,
    MAX_CUS, MAX_SLOTS,
};
pub use pool::{CmdId, Command, CommandPool, StateHistory};
