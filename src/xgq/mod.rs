//! XGQ: the queue protocol between the host and the embedded processor.
//!
//! - [`entry`]: bit-exact submission/completion entries
//! - [`ring`]: one side of a producer/consumer ring pair
//! - [`service`]: worker threads for synchronous commands such as image load

pub mod entry;
pub mod ring;
pub mod service;

pub use entry::{CqEntry, SqEntry, SqHeader, XgqAddrType, XgqCmdState, XgqOpcode};
pub use ring::{Doorbells, Role, Xgq};
pub use service::{XgqCmd, XgqService};
