//! ert-sched library
//!
//! Command execution engine for XRT-style accelerator devices: admits
//! command packets, assigns compute units and queue slots, and dispatches
//! either from the host ("penguin" mode) or through an embedded command
//! processor.

pub mod error;
pub mod config;
pub mod device;
pub mod command;
pub mod cu;
pub mod slots;
pub mod xgq;
pub mod dispatch;
pub mod exec;
pub mod scheduler;
pub mod registry;

pub use command::{CmdState, CmdType, ConfigureCmd, ErtPacket, Opcode};
pub use config::SchedConfig;
pub use device::{DeviceCaps, RegisterPort, SharedPort, SimDevice};
pub use dispatch::DispatchMode;
pub use error::{Result, SchedError};
pub use exec::Completion;
pub use registry::DeviceRegistry;
pub use scheduler::{CmdHandle, Scheduler};
