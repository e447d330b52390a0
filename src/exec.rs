//! Execution core: the command state machine.
//!
//! ```text
//!   admit          queued_to_submitted      start             query
//! New ──► Queued ──► per-type FIFO ──► Submitted ──► Running ──► Completed
//!                        │                 │            │        Error
//!                        └── Error ◄───────┴────────────┘        Abort
//! ```
//!
//! A command sits in exactly one FIFO at a time: the admission list, then
//! one of the control, CU (one per compute unit), local, or soft-kernel
//! queues. Only the head of a FIFO is ever started, so commands bound to the
//! same CU start in admission order. A head that cannot start (CU busy, no
//! free slot) stays where it is and is retried on the next tick.
//!
//! Each [`ExecCore::service`] call runs one tick:
//!
//! 1. query every running command and retire the finished ones
//! 2. route admitted commands to their FIFOs (configure is applied here)
//! 3. start FIFO heads through the active [`DispatchStrategy`]
//!
//! Retired commands leave the pool and are reported through
//! [`ExecCore::take_completions`].

use std::collections::VecDeque;
use std::ops::Range;

use crate::command::{
    CmdId, CmdState, CmdType, Command, CommandPool, ConfigureCmd, CuStat, Opcode, StateHistory,
    MAX_CUS, MAX_SLOTS,
};
use crate::config::SchedConfig;
use crate::cu::ComputeUnit;
use crate::device::{SharedPort, ERT_P2P_VERSION};
use crate::dispatch::{DispatchMode, DispatchStrategy, ErtQueue, QueueLayout};
use crate::error::{Result, SchedError};
use crate::slots::CTRL_SLOT;

/// A retired command as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub uid: u64,
    /// Terminal state.
    pub state: CmdState,
    pub opcode: Opcode,
    /// CU the command ran on, if any.
    pub cu_idx: Option<usize>,
    /// Every state the command passed through.
    pub history: StateHistory,
    /// Statistics carried by a completed CU_STAT command.
    pub custat: Option<CuStat>,
}

/// Outcome of one start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Launch {
    Started,
    /// Not startable right now; stays at the FIFO head.
    Busy,
    /// Retired with an error.
    Failed,
}

/// Owns compute units, pending queues and the dispatch strategy.
pub struct ExecCore {
    port: SharedPort,
    cq_size: u32,
    force_penguin: bool,

    configured: bool,
    /// A configure command has been applied but has not completed yet.
    configure_active: bool,
    strategy: DispatchStrategy,

    cus: Vec<ComputeUnit>,
    cu_load: Vec<u32>,
    cu_usage: Vec<u32>,
    num_cdma: usize,
    /// Rotating start index for CU FIFO scans.
    first_cu: Option<usize>,

    pool: CommandPool,
    queued: VecDeque<CmdId>,
    ctrl_queue: VecDeque<CmdId>,
    cu_queues: Vec<VecDeque<CmdId>>,
    kds_queue: VecDeque<CmdId>,
    scu_queue: VecDeque<CmdId>,
    running: Vec<CmdId>,

    completions: Vec<Completion>,
    intr_request: bool,
}

impl ExecCore {
    /// Unconfigured core on `port`. Until a configure command completes it
    /// accepts nothing else.
    pub fn new(port: SharedPort, config: &SchedConfig) -> Self {
        Self {
            port,
            cq_size: config.cq_size(),
            force_penguin: config.force_penguin(),
            configured: false,
            configure_active: false,
            strategy: DispatchStrategy::Penguin,
            cus: Vec::new(),
            cu_load: Vec::new(),
            cu_usage: Vec::new(),
            num_cdma: 0,
            first_cu: None,
            pool: CommandPool::new(),
            queued: VecDeque::new(),
            ctrl_queue: VecDeque::new(),
            cu_queues: Vec::new(),
            kds_queue: VecDeque::new(),
            scu_queue: VecDeque::new(),
            running: Vec::new(),
            completions: Vec::new(),
            intr_request: false,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn mode(&self) -> DispatchMode {
        self.strategy.mode()
    }

    pub fn strategy(&self) -> &DispatchStrategy {
        &self.strategy
    }

    /// Compute units, including DMA CUs.
    pub fn num_cus(&self) -> usize {
        self.cus.len()
    }

    pub fn num_cdma(&self) -> usize {
        self.num_cdma
    }

    pub fn cu(&self, idx: usize) -> Option<&ComputeUnit> {
        self.cus.get(idx)
    }

    /// Commands assigned to CU `idx` and not yet retired.
    pub fn cu_load(&self, idx: usize) -> u32 {
        self.cu_load.get(idx).copied().unwrap_or(0)
    }

    /// Commands completed on CU `idx`.
    pub fn cu_usage(&self, idx: usize) -> u32 {
        self.cu_usage.get(idx).copied().unwrap_or(0)
    }

    /// State of a live command.
    pub fn state(&self, id: CmdId) -> Option<CmdState> {
        self.pool.get(id).map(Command::state)
    }

    pub fn command(&self, id: CmdId) -> Option<&Command> {
        self.pool.get(id)
    }

    /// Commands admitted and not yet started.
    pub fn num_pending(&self) -> usize {
        self.queued.len()
            + self.ctrl_queue.len()
            + self.kds_queue.len()
            + self.scu_queue.len()
            + self.cu_queues.iter().map(VecDeque::len).sum::<usize>()
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Running commands need their completion polled.
    pub fn needs_poll(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.pool.is_empty()
    }

    /// Set when the last tick started work in embedded-poll mode, where the
    /// host can get ahead of the firmware's polling.
    pub fn take_intr_request(&mut self) -> bool {
        std::mem::take(&mut self.intr_request)
    }

    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    /// Accept a new command. It moves to `Queued` and waits for the next tick.
    pub fn admit(&mut self, mut cmd: Command) -> CmdId {
        if cmd.opcode() == Opcode::Configure {
            // Configure always runs on the control path.
            cmd.packet_mut().set_type(CmdType::Ctrl);
        }
        cmd.set_state(CmdState::Queued);
        log::debug!("cmd({}) queued {:?}/{:?}", cmd.uid, cmd.opcode(), cmd.cmd_type());
        let id = self.pool.insert(cmd);
        self.queued.push_back(id);
        id
    }

    /// One scheduler tick.
    pub fn service(&mut self) {
        self.running_to_complete();
        self.queued_to_submitted();
        self.submitted_to_running();
    }

    /// Check one command for completion. Only running commands are
    /// queried; for anything else this does nothing.
    pub fn query(&mut self, id: CmdId) {
        let port = &*self.port;
        let Some(cmd) = self.pool.get(id) else {
            return;
        };
        if cmd.state() != CmdState::Running {
            return;
        }
        let uid = cmd.uid;

        match self.strategy.query(port, &mut self.cus, id, cmd) {
            Ok(done) => {
                for done_id in done {
                    if self.state(done_id) == Some(CmdState::Running) {
                        self.retire(done_id, CmdState::Completed);
                    }
                }
            }
            Err(err) => {
                log::error!("cmd({}) query failed: {}", uid, err);
                self.retire(id, CmdState::Error);
            }
        }
    }

    /// Finish every live command as `Abort`. Used on shutdown.
    pub fn abort_all(&mut self) {
        self.queued.clear();
        self.ctrl_queue.clear();
        self.kds_queue.clear();
        self.scu_queue.clear();
        self.cu_queues.iter_mut().for_each(VecDeque::clear);
        self.running.clear();
        for cu in &mut self.cus {
            cu.drain();
        }

        for id in self.pool.ids() {
            if let Some(cmd) = self.pool.get_mut(id) {
                cmd.aborted = true;
            }
            self.retire(id, CmdState::Abort);
        }
    }

    fn running_to_complete(&mut self) {
        let running = std::mem::take(&mut self.running);
        for id in &running {
            // A single query may retire several commands.
            self.query(*id);
        }
        self.running = running
            .into_iter()
            .filter(|id| self.pool.get(*id).is_some())
            .collect();
    }

    fn queued_to_submitted(&mut self) {
        while let Some(id) = self.queued.pop_front() {
            if let Err(err) = self.submit(id) {
                log::error!("cmd({:?}) rejected: {}", id, err);
                self.retire(id, CmdState::Error);
            }
        }
    }

    /// Route an admitted command to its FIFO.
    fn submit(&mut self, id: CmdId) -> Result<()> {
        let (opcode, ty) = match self.pool.get(id) {
            Some(cmd) => (cmd.opcode(), cmd.cmd_type()),
            None => return Ok(()),
        };

        if opcode == Opcode::Configure {
            if self.configure_active {
                return Err(SchedError::InvalidConfiguration("configure already in progress".into()));
            }
            let cfg = match self.pool.get(id) {
                Some(cmd) => ConfigureCmd::parse(cmd.packet())?,
                None => return Ok(()),
            };
            self.configure(&cfg)?;
            self.ctrl_queue.push_back(id);
            return Ok(());
        }

        if !self.configured && !self.configure_active {
            return Err(SchedError::NotConfigured);
        }

        match ty {
            CmdType::Cu => self.submit_cu(id),
            CmdType::Ctrl => {
                self.ctrl_queue.push_back(id);
                Ok(())
            }
            CmdType::KdsLocal => {
                self.kds_queue.push_back(id);
                Ok(())
            }
            CmdType::Scu => {
                self.scu_queue.push_back(id);
                Ok(())
            }
            CmdType::Default => Err(SchedError::InvalidConfiguration(format!(
                "{:?} has no command type",
                opcode
            ))),
        }
    }

    /// Append to the FIFO of the least loaded eligible CU; ties go to the
    /// lowest index.
    fn submit_cu(&mut self, id: CmdId) -> Result<()> {
        let num_cus = self.cus.len();
        let cu_load = &self.cu_load;
        let Some(cmd) = self.pool.get_mut(id) else {
            return Ok(());
        };

        let mut best: Option<(usize, u32)> = None;
        for idx in cmd.eligible_cus().take_while(|idx| *idx < num_cus) {
            let load = cu_load[idx];
            if best.map_or(true, |(_, min)| load < min) {
                best = Some((idx, load));
                if load == 0 {
                    break;
                }
            }
        }

        let (cu_idx, load) = best.ok_or_else(|| {
            SchedError::InvalidConfiguration(format!("cmd({}) matches none of {} cus", cmd.uid, num_cus))
        })?;
        cmd.set_cu(cu_idx);
        log::debug!("cmd({}) -> cu({}) load({})", cmd.uid, cu_idx, load + 1);
        self.cu_load[cu_idx] += 1;
        self.cu_queues[cu_idx].push_back(id);
        Ok(())
    }

    /// Apply a configure command: build the CUs and pick the dispatch
    /// strategy. The core counts as configured once the command completes.
    fn configure(&mut self, cfg: &ConfigureCmd) -> Result<()> {
        if self.configured {
            return Err(SchedError::InvalidConfiguration("scheduler is already configured".into()));
        }
        if cfg.slot_size == 0 || cfg.slot_size % 4 != 0 {
            return Err(SchedError::InvalidConfiguration(format!(
                "unsupported slot size {}",
                cfg.slot_size
            )));
        }

        let caps = self.port.capabilities();
        let ert = caps.ert && !self.force_penguin;
        let mut full = ert && cfg.flags.ert && !cfg.flags.dataflow;
        let mut poll = ert && cfg.flags.ert && cfg.flags.dataflow;
        if (full || poll) && caps.ert_version > ERT_P2P_VERSION {
            log::warn!("unknown ert version {}, falling back to penguin", caps.ert_version);
            full = false;
            poll = false;
        }

        let mut slot_size = cfg.slot_size;
        let mut num_slots = (self.cq_size / slot_size) as usize;
        if poll {
            slot_size = self.cq_size / MAX_CUS as u32;
            num_slots = MAX_CUS;
        }
        if full && cfg.flags.cu_dma && num_slots > 32 {
            log::info!("limiting command queue to 32 slots for cu dma");
            num_slots = 32;
            slot_size = self.cq_size / 32;
        }
        let num_slots = num_slots.min(MAX_SLOTS);
        if full && num_slots <= CTRL_SLOT + 1 {
            return Err(SchedError::InvalidConfiguration(format!(
                "command queue of {} bytes holds no data slot of {} bytes",
                self.cq_size, slot_size
            )));
        }

        let cdma: Vec<u64> = caps.cdma_addrs.iter().copied().filter(|a| *a != 0).collect();
        let total = cfg.cu_addrs.len() + cdma.len();
        // Poll mode gives every CU a slot after the control slot.
        let max_cus = if poll { MAX_CUS - 1 } else { MAX_CUS };
        if total > max_cus {
            return Err(SchedError::InvalidConfiguration(format!(
                "{} cus exceed the limit of {}",
                total, max_cus
            )));
        }

        let cq_base = caps.cq_base();
        let addrs = cfg.cu_addrs.iter().map(|a| *a as u64).chain(cdma.iter().copied());
        let cus: Vec<ComputeUnit> = addrs
            .enumerate()
            .map(|(idx, addr)| {
                let polladdr = poll.then(|| cq_base + (idx as u64 + 1) * slot_size as u64);
                ComputeUnit::new(idx, addr, polladdr)
            })
            .collect();

        let layout = QueueLayout {
            cq_base,
            csr_base: caps.csr_base(),
            slot_size,
            num_slots,
            cq_int: cfg.flags.cq_int,
            legacy: caps.legacy_ert,
        };
        let strategy = if full {
            DispatchStrategy::EmbeddedFull(ErtQueue::new(layout))
        } else if poll {
            DispatchStrategy::EmbeddedPoll(ErtQueue::new(layout))
        } else {
            DispatchStrategy::Penguin
        };
        if let Some(queue) = strategy.queue() {
            queue.clear_csr(&*self.port)?;
        }

        self.num_cdma = cdma.len();
        self.cu_load = vec![0; cus.len()];
        self.cu_usage = vec![0; cus.len()];
        self.cu_queues = (0..cus.len()).map(|_| VecDeque::new()).collect();
        self.cus = cus;
        self.first_cu = None;
        self.strategy = strategy;
        self.configure_active = true;

        log::info!(
            "scheduler configured mode({}) slots({}) slot_size({}) cus({}) cdma({}) dataflow({})",
            self.strategy.mode(),
            if full { num_slots } else { 0 },
            slot_size,
            self.cus.len(),
            self.num_cdma,
            cfg.flags.dataflow
        );
        Ok(())
    }

    fn submitted_to_running(&mut self) {
        let mut started = self.start_ctrl();
        started += self.start_cus();
        started += self.start_kds();
        started += self.start_scu();

        if started > 0 && self.mode() == DispatchMode::EmbeddedPoll {
            self.intr_request = true;
        }
    }

    /// Start the head control command. Only CU_STAT in embedded-full mode
    /// goes to the device; everything else finishes on the host.
    fn start_ctrl(&mut self) -> usize {
        let Some(&id) = self.ctrl_queue.front() else {
            return 0;
        };
        let opcode = match self.pool.get(id) {
            Some(cmd) => cmd.opcode(),
            None => {
                self.ctrl_queue.pop_front();
                return 0;
            }
        };

        if opcode == Opcode::CuStat && self.mode() == DispatchMode::EmbeddedFull {
            return self.launch_head(Fifo::Ctrl, id);
        }

        self.ctrl_queue.pop_front();
        if let Some(cmd) = self.pool.get_mut(id) {
            cmd.set_state(CmdState::Submitted);
        }
        self.retire(id, CmdState::Completed);
        1
    }

    fn start_kds(&mut self) -> usize {
        let Some(id) = self.kds_queue.pop_front() else {
            return 0;
        };
        if let Some(cmd) = self.pool.get_mut(id) {
            cmd.set_state(CmdState::Submitted);
        }
        self.retire(id, CmdState::Completed);
        1
    }

    fn start_scu(&mut self) -> usize {
        match self.scu_queue.front() {
            Some(&id) => self.launch_head(Fifo::Scu, id),
            None => 0,
        }
    }

    /// Scan CU FIFOs starting one past the previous tick's start index
    /// (wrapping), repeating while anything starts.
    fn start_cus(&mut self) -> usize {
        let num_cus = self.cus.len();
        let start = match self.first_cu {
            Some(prev) if num_cus > 0 => (prev + 1) % num_cus,
            _ => 0,
        };
        self.first_cu = Some(start);

        let mut total = 0;
        loop {
            let prev = total;
            total += self.start_cu_range(start..num_cus);
            total += self.start_cu_range(0..start.min(num_cus));
            if total == prev {
                return total;
            }
        }
    }

    fn start_cu_range(&mut self, range: Range<usize>) -> usize {
        let mut started = 0;
        for idx in range {
            if let Some(&id) = self.cu_queues[idx].front() {
                started += self.launch_head(Fifo::Cu(idx), id);
            }
        }
        started
    }

    /// Try to start the head `id` of `fifo`; pops it unless busy.
    fn launch_head(&mut self, fifo: Fifo, id: CmdId) -> usize {
        let launch = self.launch(id);
        if launch != Launch::Busy {
            let queue = match fifo {
                Fifo::Ctrl => &mut self.ctrl_queue,
                Fifo::Scu => &mut self.scu_queue,
                Fifo::Cu(idx) => &mut self.cu_queues[idx],
            };
            queue.pop_front();
        }
        usize::from(launch == Launch::Started)
    }

    fn launch(&mut self, id: CmdId) -> Launch {
        let port = &*self.port;
        let Some(cmd) = self.pool.get_mut(id) else {
            return Launch::Failed;
        };

        let result = match cmd.cmd_type() {
            CmdType::Cu => self.strategy.start_cu(port, &mut self.cus, id, cmd),
            _ => self.strategy.start_embedded(port, id, cmd),
        };

        match result {
            Ok(true) => {
                cmd.set_state(CmdState::Submitted);
                cmd.set_state(CmdState::Running);
                self.running.push(id);
                Launch::Started
            }
            Ok(false) => Launch::Busy,
            Err(err) => {
                log::error!("cmd({}) failed to start: {}", cmd.uid, err);
                self.retire(id, CmdState::Error);
                Launch::Failed
            }
        }
    }

    /// Move a command to its terminal state, free its CU load and slot,
    /// report it and drop it from the pool.
    fn retire(&mut self, id: CmdId, state: CmdState) {
        let Some(cmd) = self.pool.get(id) else {
            return;
        };
        let custat = if cmd.cmd_type() == CmdType::Ctrl && state == CmdState::Completed {
            self.finish_ctrl(id)
        } else {
            None
        };

        let Some(mut cmd) = self.pool.remove(id) else {
            return;
        };
        let state = match state {
            CmdState::Completed | CmdState::Error if cmd.aborted => CmdState::Abort,
            other => other,
        };
        if let Some(cu) = cmd.cu_idx {
            // A command retired before its CU reported DONE must not be
            // matched by that DONE once its id is handed out again.
            if let Some(unit) = self.cus.get_mut(cu) {
                if unit.forget(id) {
                    log::debug!("cmd({}) dropped from cu({}) while still running", cmd.uid, cu);
                }
            }
            if let Some(load) = self.cu_load.get_mut(cu) {
                *load = load.saturating_sub(1);
            }
            if state == CmdState::Completed {
                if let Some(usage) = self.cu_usage.get_mut(cu) {
                    *usage += 1;
                }
            }
        }
        cmd.set_state(state);
        if let Some(queue) = self.strategy.queue_mut() {
            queue.release(&mut cmd);
        }

        if state == CmdState::Completed {
            log::debug!("cmd({}) completed", cmd.uid);
        } else {
            log::error!("cmd({}) finished in {:?}", cmd.uid, state);
        }
        self.completions.push(Completion {
            uid: cmd.uid,
            state,
            opcode: cmd.opcode(),
            cu_idx: cmd.cu_idx,
            history: cmd.history().clone(),
            custat,
        });
    }

    /// Side effects of a completed control command.
    fn finish_ctrl(&mut self, id: CmdId) -> Option<CuStat> {
        let cmd = self.pool.get(id)?;
        match cmd.opcode() {
            Opcode::Configure => {
                self.configured = true;
                self.configure_active = false;
                None
            }
            Opcode::CuStat => match self.strategy.queue() {
                Some(queue) if self.strategy.mode() == DispatchMode::EmbeddedFull => {
                    let slot = cmd.slot_idx.unwrap_or(CTRL_SLOT);
                    queue
                        .read_slot(&*self.port, slot)
                        .and_then(|words| CuStat::decode(&words, self.cus.len()))
                        .map_err(|err| log::error!("cu stat reply unreadable: {}", err))
                        .ok()
                }
                _ => Some(self.host_custat()),
            },
            _ => None,
        }
    }

    /// CU statistics from host bookkeeping.
    fn host_custat(&self) -> CuStat {
        CuStat {
            firmware: None,
            cu_usage: self.cu_usage.clone(),
            cu_status: self.cus.iter().map(|cu| u32::from(cu.run_count() > 0)).collect(),
            slot_status: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Fifo {
    Ctrl,
    Scu,
    Cu(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::packet::CUSTAT_VERSION;
    use crate::command::{ConfigureFlags, ErtPacket};
    use crate::device::{AddressSpace, DeviceCaps, RegisterPort, SimDevice, SimErtMode};
    use std::sync::{Arc, Mutex};

    const CU_A: u32 = 0x1_0000;
    const CU_B: u32 = 0x2_0000;

    struct Harness {
        dev: SimDevice,
        exec: ExecCore,
        next_uid: u64,
    }

    impl Harness {
        fn new(caps: DeviceCaps, config: SchedConfig) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let dev = SimDevice::new(caps);
            let exec = ExecCore::new(Arc::new(dev.clone()), &config);
            Self { dev, exec, next_uid: 1 }
        }

        fn penguin() -> Self {
            Self::new(DeviceCaps::penguin(), SchedConfig::default())
        }

        fn submit(&mut self, packet: ErtPacket) -> CmdId {
            let uid = self.next_uid;
            self.next_uid += 1;
            self.exec.admit(Command::new(uid, packet))
        }

        /// Configure and run the tick that completes it.
        fn configure(&mut self, cfg: &ConfigureCmd) -> Completion {
            self.submit(cfg.to_packet().unwrap());
            self.exec.service();
            let mut done = self.exec.take_completions();
            assert_eq!(done.len(), 1);
            done.remove(0)
        }

        fn configure_cus(&mut self, addrs: &[u32]) {
            for addr in addrs {
                self.dev.add_cu(*addr as u64);
            }
            let done = self.configure(&ConfigureCmd::new(0x1000, addrs));
            assert_eq!(done.state, CmdState::Completed);
        }

        fn completed_uids(&mut self) -> Vec<u64> {
            self.exec.take_completions().iter().map(|c| c.uid).collect()
        }
    }

    fn ert_config(dataflow: bool) -> ConfigureCmd {
        let mut cfg = ConfigureCmd::new(0x100, &[CU_A, CU_B]);
        cfg.flags = ConfigureFlags {
            ert: true,
            dataflow,
            ..ConfigureFlags::default()
        };
        cfg
    }

    fn small_cq() -> SchedConfig {
        SchedConfig {
            cq_size: Some(0x500),
            ..SchedConfig::default()
        }
    }

    #[test]
    fn test_configure_two_cus() {
        let mut h = Harness::new(
            DeviceCaps::penguin(),
            SchedConfig {
                cq_size: Some(8 * 0x200),
                ..SchedConfig::default()
            },
        );
        assert!(!h.exec.is_configured());

        let done = h.configure(&ConfigureCmd::new(0x200, &[CU_A, CU_B]));
        assert_eq!(done.state, CmdState::Completed);
        assert_eq!(
            done.history.as_slice(),
            &[CmdState::New, CmdState::Queued, CmdState::Submitted, CmdState::Completed]
        );
        assert!(h.exec.is_configured());
        assert_eq!(h.exec.num_cus(), 2);
        assert_eq!(h.exec.cu(0).unwrap().index, 0);
        assert_eq!(h.exec.cu(0).unwrap().base_addr(), CU_A as u64);
        assert_eq!(h.exec.cu(1).unwrap().base_addr(), CU_B as u64);
        assert_eq!(h.exec.mode(), DispatchMode::Penguin);
        assert!(h.exec.is_idle());
    }

    #[test]
    fn test_commands_before_configure_rejected() {
        let mut h = Harness::penguin();
        h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        h.exec.service();
        let done = h.exec.take_completions();
        assert_eq!(done[0].state, CmdState::Error);
        assert!(h.exec.is_idle());
    }

    #[test]
    fn test_configure_and_work_in_same_batch() {
        let mut h = Harness::penguin();
        h.dev.add_cu(CU_A as u64);
        h.dev.set_auto_complete(true);
        h.submit(ConfigureCmd::new(0x1000, &[CU_A]).to_packet().unwrap());
        h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());

        h.exec.service();
        h.exec.service();
        let done = h.exec.take_completions();
        assert!(done.iter().all(|c| c.state == CmdState::Completed));
        assert_eq!(done.len(), 2);
    }

    #[test]
    fn test_second_configure_errors_without_disturbing_others() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A]);
        h.dev.set_auto_complete(true);

        let bad = h.submit(ConfigureCmd::new(0x1000, &[CU_B]).to_packet().unwrap());
        h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        h.exec.service();
        assert_eq!(h.exec.state(bad), None, "errored command leaves the pool");
        h.exec.service();

        let done = h.exec.take_completions();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].opcode, Opcode::Configure);
        assert_eq!(done[0].state, CmdState::Error);
        assert_eq!(done[0].history.as_slice(), &[CmdState::New, CmdState::Queued, CmdState::Error]);
        assert_eq!(done[1].state, CmdState::Completed);
        assert_eq!(h.exec.num_cus(), 1, "first configuration kept");
    }

    #[test]
    fn test_malformed_configure_is_not_retried() {
        let mut h = Harness::penguin();
        h.submit(ErtPacket::with_payload(Opcode::Configure, CmdType::Ctrl, &[0x1000, 2, 16, 0, 0]).unwrap());
        h.exec.service();
        h.exec.service();
        let done = h.exec.take_completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].state, CmdState::Error);
        assert!(!h.exec.is_configured());

        h.configure_cus(&[CU_A]);
        assert!(h.exec.is_configured());
    }

    #[test]
    fn test_full_lifecycle_history() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A]);
        let id = h.submit(ErtPacket::start_cu(&[1], &[7]).unwrap());
        assert_eq!(h.exec.state(id), Some(CmdState::Queued));

        h.exec.service();
        assert_eq!(h.exec.state(id), Some(CmdState::Running));
        assert_eq!(h.dev.peek(AddressSpace::KernelControl, CU_A as u64 + 0x10), 7);

        h.dev.complete_cu(0);
        h.exec.service();
        let done = h.exec.take_completions();
        assert_eq!(
            done[0].history.as_slice(),
            &[
                CmdState::New,
                CmdState::Queued,
                CmdState::Submitted,
                CmdState::Running,
                CmdState::Completed
            ]
        );
        assert_eq!(done[0].cu_idx, Some(0));
        assert_eq!(h.exec.cu_usage(0), 1);
        assert_eq!(h.exec.cu_load(0), 0);
    }

    #[test]
    fn test_busy_cu_keeps_fifo_order() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A, CU_B]);

        let first = h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        h.exec.service();
        assert_eq!(h.exec.state(first), Some(CmdState::Running));

        let waiting: Vec<CmdId> = (0..3).map(|_| h.submit(ErtPacket::start_cu(&[1], &[]).unwrap())).collect();
        for _ in 0..3 {
            h.exec.service();
        }
        assert!(waiting.iter().all(|id| h.exec.state(*id) == Some(CmdState::Queued)));
        assert_eq!(h.exec.cu_load(0), 4);

        let mut order = Vec::new();
        for expect_running in [1, 2, 3] {
            h.dev.complete_cu(0);
            h.exec.service();
            order.extend(h.completed_uids());
            let running: Vec<_> = waiting
                .iter()
                .filter(|id| h.exec.state(**id) == Some(CmdState::Running))
                .collect();
            assert_eq!(running, vec![&waiting[expect_running - 1]], "one at a time");
        }
        h.dev.complete_cu(0);
        h.exec.service();
        order.extend(h.completed_uids());
        assert_eq!(order, vec![2, 3, 4, 5]);
        assert_eq!(h.dev.cu_starts(1), 0);
    }

    #[test]
    fn test_equal_load_picks_lowest_cu() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A, CU_B, 0x3_0000]);

        let a = h.submit(ErtPacket::start_cu(&[0b110], &[]).unwrap());
        h.exec.service();
        assert_eq!(h.exec.command(a).unwrap().cu_idx, Some(1));

        // cu 1 now carries one command, cu 2 none
        let b = h.submit(ErtPacket::start_cu(&[0b110], &[]).unwrap());
        h.exec.service();
        assert_eq!(h.exec.command(b).unwrap().cu_idx, Some(2));

        let c = h.submit(ErtPacket::start_cu(&[0b111], &[]).unwrap());
        h.exec.service();
        assert_eq!(h.exec.command(c).unwrap().cu_idx, Some(0));
    }

    #[test]
    fn test_no_eligible_cu_is_an_error() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A]);
        h.submit(ErtPacket::start_cu(&[0b10], &[]).unwrap());
        h.exec.service();
        assert_eq!(h.exec.take_completions()[0].state, CmdState::Error);
    }

    #[test]
    fn test_query_ignores_non_running() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A]);
        let id = h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        h.exec.query(id);
        assert_eq!(h.exec.state(id), Some(CmdState::Queued));
        assert!(h.exec.take_completions().is_empty());

        h.exec.service();
        h.dev.complete_cu(0);
        h.exec.query(id);
        assert_eq!(h.exec.take_completions().len(), 1);
        h.exec.query(id);
        h.exec.service();
        assert!(h.exec.take_completions().is_empty(), "no second notification");
    }

    #[test]
    fn test_local_and_stat_commands_complete_on_host() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A, CU_B]);
        h.dev.set_auto_complete(true);
        h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        h.exec.service();
        h.exec.service();
        h.exec.take_completions();

        h.submit(ErtPacket::simple(Opcode::StartCopyBo, CmdType::KdsLocal));
        h.submit(ErtPacket::simple(Opcode::CuStat, CmdType::Ctrl));
        h.exec.service();
        let done = h.exec.take_completions();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| c.state == CmdState::Completed));
        let stat = done.iter().find_map(|c| c.custat.clone()).unwrap();
        assert_eq!(stat.cu_usage, vec![1, 0]);
        assert_eq!(stat.cu_status, vec![0, 0]);
    }

    #[test]
    fn test_default_type_rejected() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A]);
        h.submit(ErtPacket::simple(Opcode::Exit, CmdType::Default));
        h.exec.service();
        assert_eq!(h.exec.take_completions()[0].state, CmdState::Error);
    }

    #[test]
    fn test_soft_kernel_needs_embedded_mode() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A]);
        h.submit(ErtPacket::simple(Opcode::SkConfig, CmdType::Scu));
        h.exec.service();
        assert_eq!(h.exec.take_completions()[0].state, CmdState::Error);
    }

    #[test]
    fn test_slot_pool_backpressure() {
        let mut h = Harness::new(DeviceCaps::embedded(30), small_cq());
        let done = h.configure(&ert_config(false));
        assert_eq!(done.state, CmdState::Completed);
        assert_eq!(h.exec.mode(), DispatchMode::EmbeddedFull);
        assert_eq!(h.exec.strategy().queue().unwrap().layout().num_slots, 5);

        let ids: Vec<CmdId> = (0..5).map(|_| h.submit(ErtPacket::start_cu(&[1], &[]).unwrap())).collect();
        h.exec.service();

        let slots: Vec<Option<usize>> = ids
            .iter()
            .map(|id| h.exec.command(*id).unwrap().slot_idx)
            .collect();
        assert_eq!(slots, vec![Some(1), Some(2), Some(3), Some(4), None]);
        assert_eq!(h.exec.state(ids[4]), Some(CmdState::Queued));
        h.exec.service();
        assert_eq!(h.exec.state(ids[4]), Some(CmdState::Queued));

        h.dev.raise_status(0, 1 << 3);
        h.exec.service();
        assert_eq!(h.completed_uids(), vec![4]);
        assert_eq!(h.exec.state(ids[4]), Some(CmdState::Running));
        assert_eq!(h.exec.command(ids[4]).unwrap().slot_idx, Some(3));
    }

    #[test]
    fn test_full_mode_retires_batch_from_one_status_read() {
        let mut h = Harness::new(DeviceCaps::embedded(30), small_cq());
        h.configure(&ert_config(false));
        h.dev.set_ert_mode(SimErtMode::SlotDoorbell);
        h.dev.set_auto_complete(true);

        // without the doorbell nothing completes
        h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        h.exec.service();
        h.exec.service();
        assert!(h.exec.take_completions().is_empty());

        h.dev.raise_status(0, 1 << 1);
        h.exec.service();
        assert_eq!(h.exec.take_completions().len(), 1);

        let ids: Vec<CmdId> = (0..3).map(|_| h.submit(ErtPacket::start_cu(&[0b11], &[]).unwrap())).collect();
        h.exec.service();
        h.dev.raise_status(0, 0b1110);
        h.exec.query(ids[0]);
        assert_eq!(h.exec.take_completions().len(), 3);
        assert!(h.exec.is_idle());
    }

    #[test]
    fn test_full_mode_cu_stat_through_ctrl_slot() {
        let mut h = Harness::new(DeviceCaps::embedded(30), small_cq());
        let mut cfg = ert_config(false);
        cfg.flags.cq_int = true;
        h.configure(&cfg);
        h.dev.set_ert_mode(SimErtMode::SlotDoorbell);
        h.dev.set_auto_complete(true);

        let slot0 = DeviceCaps::embedded(30).cq_base();
        h.submit(ErtPacket::simple(Opcode::CuStat, CmdType::Ctrl));
        h.exec.service();
        // firmware reply overwrites the slot before the status bit is read
        for (i, word) in [CUSTAT_VERSION, 0x77, 5, 2, 3, 4, 1, 0].iter().enumerate() {
            h.dev.poke(AddressSpace::DeviceRam, slot0 + 4 + 4 * i as u64, *word);
        }
        h.exec.service();

        let done = h.exec.take_completions();
        assert_eq!(done[0].state, CmdState::Completed);
        let stat = done[0].custat.clone().unwrap();
        assert_eq!(stat.firmware, Some(0x77));
        assert_eq!(stat.cu_usage, vec![3, 4]);
        assert_eq!(stat.cu_status, vec![1, 0]);
        assert_eq!(h.exec.strategy().queue().unwrap().owner(0), None);
    }

    #[test]
    fn test_poll_mode_configuration() {
        let mut h = Harness::new(DeviceCaps::embedded(30), SchedConfig::default());
        h.dev.set_ert_mode(SimErtMode::CuPoll);
        h.dev.add_cu(CU_A as u64 | 1);
        h.dev.add_cu(CU_B as u64 | 1);
        let mut cfg = ert_config(true);
        cfg.cu_addrs = vec![CU_A | 1, CU_B | 1];
        h.configure(&cfg);
        assert_eq!(h.exec.mode(), DispatchMode::EmbeddedPoll);

        let slot_size = 0x10000 / MAX_CUS as u64;
        let cq_base = DeviceCaps::embedded(30).cq_base();
        assert_eq!(h.exec.cu(1).unwrap().polladdr(), Some(cq_base + 2 * slot_size));

        let id = h.submit(ErtPacket::start_cu(&[0b10], &[]).unwrap());
        h.exec.service();
        assert!(h.exec.take_intr_request());
        assert!(!h.exec.take_intr_request());
        assert_eq!(h.dev.peek(AddressSpace::DeviceRam, cq_base + 2 * slot_size), crate::cu::AP_START);

        h.dev.complete_cu(1);
        h.exec.service();
        assert_eq!(h.exec.state(id), None);
        assert_eq!(h.exec.take_completions()[0].state, CmdState::Completed);
    }

    #[test]
    fn test_unknown_firmware_falls_back_to_penguin() {
        let mut h = Harness::new(DeviceCaps::embedded(31), SchedConfig::default());
        h.configure(&ert_config(false));
        assert_eq!(h.exec.mode(), DispatchMode::Penguin);
    }

    #[test]
    fn test_force_penguin_ignores_embedded_processor() {
        let mut h = Harness::new(
            DeviceCaps::embedded(30),
            SchedConfig {
                force_penguin: Some(true),
                ..SchedConfig::default()
            },
        );
        h.configure(&ert_config(false));
        assert_eq!(h.exec.mode(), DispatchMode::Penguin);
    }

    #[test]
    fn test_dma_cus_appended() {
        let mut h = Harness::new(DeviceCaps::penguin().with_cdma(&[0, 0x9_0000]), SchedConfig::default());
        h.configure(&ConfigureCmd::new(0x1000, &[CU_A]));
        assert_eq!(h.exec.num_cus(), 2);
        assert_eq!(h.exec.num_cdma(), 1);
        assert_eq!(h.exec.cu(1).unwrap().base_addr(), 0x9_0000);
    }

    #[test]
    fn test_configure_clears_stale_status() {
        let mut h = Harness::new(DeviceCaps::embedded(30), small_cq());
        h.dev.raise_status(0, 0xffff_fffe);
        h.configure(&ert_config(false));
        assert_eq!(h.dev.read32(DeviceCaps::embedded(30).csr_base()).unwrap(), 0);
    }

    #[test]
    fn test_abort_all_reports_every_command() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A]);
        h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        h.exec.service();
        h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        h.exec.service();

        h.exec.abort_all();
        let done = h.exec.take_completions();
        assert_eq!(done.len(), 3);
        assert!(done.iter().all(|c| c.state == CmdState::Abort));
        assert!(h.exec.is_idle());
        assert_eq!(h.exec.num_pending(), 0);
        assert_eq!(h.exec.cu_load(0), 0);
    }

    #[test]
    fn test_rotation_changes_scan_start() {
        let mut h = Harness::penguin();
        h.configure_cus(&[CU_A, CU_B]);
        let starts: Vec<Option<usize>> = (0..4)
            .map(|_| {
                h.exec.service();
                h.exec.first_cu
            })
            .collect();
        // configure tick already used index 0
        assert_eq!(starts, vec![Some(1), Some(0), Some(1), Some(0)]);
    }

    #[test]
    fn test_contended_slot_alternates_between_cus() {
        // one control slot plus a single data slot
        let config = SchedConfig {
            cq_size: Some(0x200),
            ..SchedConfig::default()
        };
        let mut h = Harness::new(DeviceCaps::embedded(30), config);
        h.configure(&ert_config(false));
        for _ in 0..3 {
            h.submit(ErtPacket::start_cu(&[0b01], &[]).unwrap());
            h.submit(ErtPacket::start_cu(&[0b10], &[]).unwrap());
        }

        let mut order = Vec::new();
        for _ in 0..6 {
            h.exec.service();
            assert_eq!(h.exec.num_running(), 1);
            h.dev.raise_status(0, 1 << 1);
            order.extend(h.exec.take_completions().iter().filter_map(|c| c.cu_idx));
        }
        h.exec.service();
        order.extend(h.exec.take_completions().iter().filter_map(|c| c.cu_idx));
        assert_eq!(order, vec![1, 0, 1, 0, 1, 0]);
    }

    /// Port that fails one read of a chosen address.
    struct FlakyPort {
        dev: SimDevice,
        fail_read: Mutex<Option<u64>>,
    }

    impl RegisterPort for FlakyPort {
        fn read(&self, space: AddressSpace, addr: u64, buf: &mut [u8]) -> Result<()> {
            let mut fail = self.fail_read.lock().unwrap();
            if *fail == Some(addr) {
                *fail = None;
                return Err(SchedError::Port {
                    addr,
                    reason: "read failed".into(),
                });
            }
            drop(fail);
            self.dev.read(space, addr, buf)
        }

        fn write(&self, space: AddressSpace, addr: u64, buf: &[u8]) -> Result<()> {
            self.dev.write(space, addr, buf)
        }

        fn capabilities(&self) -> DeviceCaps {
            self.dev.capabilities()
        }
    }

    #[test]
    fn test_failed_query_does_not_complete_reused_id() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dev = SimDevice::new(DeviceCaps::penguin());
        let port = Arc::new(FlakyPort {
            dev: dev.clone(),
            fail_read: Mutex::new(None),
        });
        let mut h = Harness {
            dev,
            exec: ExecCore::new(port.clone(), &SchedConfig::default()),
            next_uid: 1,
        };
        h.configure_cus(&[CU_A]);

        let first = h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        h.exec.service();
        assert_eq!(h.exec.state(first), Some(CmdState::Running));

        *port.fail_read.lock().unwrap() = Some(CU_A as u64);
        h.exec.service();
        let done = h.exec.take_completions();
        assert_eq!((done[0].uid, done[0].state), (2, CmdState::Error));

        // The freed id comes straight back; the CU is still busy with the old run.
        let second = h.submit(ErtPacket::start_cu(&[1], &[]).unwrap());
        assert_eq!(second, first);
        h.exec.service();
        assert_eq!(h.exec.state(second), Some(CmdState::Queued));

        // The old run finishing only frees the CU.
        h.dev.complete_cu(0);
        for _ in 0..5 {
            h.exec.service();
        }
        assert!(h.exec.take_completions().is_empty());
        assert_eq!(h.exec.state(second), Some(CmdState::Running));
        assert_eq!(h.dev.cu_starts(0), 2);

        h.dev.complete_cu(0);
        h.exec.service();
        let done = h.exec.take_completions();
        assert_eq!((done[0].uid, done[0].state), (3, CmdState::Completed));
    }
}
