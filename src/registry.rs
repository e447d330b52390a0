//! Devices known to a process, each with its own scheduler.
//!
//! The registry is an ordinary value: whoever opens devices owns it and
//! passes it where it is needed. Closing a device (or dropping the
//! registry) stops that device's scheduler thread.

use std::collections::BTreeMap;

use crate::config::SchedConfig;
use crate::device::SharedPort;
use crate::error::{Result, SchedError};
use crate::scheduler::Scheduler;

/// Index-addressed set of open devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<u32, Scheduler>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a scheduler for device `index` on `port`.
    pub fn open(&mut self, index: u32, port: SharedPort, config: &SchedConfig) -> Result<&Scheduler> {
        if self.devices.contains_key(&index) {
            return Err(SchedError::InvalidConfiguration(format!("device {} is already open", index)));
        }
        let caps = port.capabilities();
        let scheduler = Scheduler::start(port, config)?;
        log::info!(
            "opened device {} ert({}) version({}) cdma({})",
            index,
            caps.ert,
            caps.ert_version,
            caps.num_cdma()
        );
        Ok(self.devices.entry(index).or_insert(scheduler))
    }

    pub fn get(&self, index: u32) -> Option<&Scheduler> {
        self.devices.get(&index)
    }

    /// Stop and forget device `index`. Returns false if it was not open.
    pub fn close(&mut self, index: u32) -> bool {
        match self.devices.remove(&index) {
            Some(mut scheduler) => {
                scheduler.shutdown();
                log::info!("closed device {}", index);
                true
            }
            None => false,
        }
    }

    /// Open device indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.devices.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
