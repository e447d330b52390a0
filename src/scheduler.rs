//! The scheduler thread and its caller-facing handle API.
//!
//! Callers on any thread hand commands over through a mutex-protected
//! inbox; one dedicated thread owns the [`ExecCore`] and everything in it.
//!
//! ```text
//!  submit() ──► inbox ──(Condvar)──► scheduler thread ──► ExecCore::service()
//!                                            │
//!  wait()   ◄── results ◄──(Condvar)─────────┘ completions
//! ```
//!
//! The thread sleeps until new commands arrive or an interrupt is raised,
//! but never longer than the configured poll interval. While commands are
//! running it does not sleep at all.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use ert_sched::command::{CmdState, ConfigureCmd, ErtPacket};
//! use ert_sched::config::SchedConfig;
//! use ert_sched::device::{DeviceCaps, SimDevice};
//! use ert_sched::scheduler::Scheduler;
//!
//! let dev = SimDevice::new(DeviceCaps::penguin());
//! dev.add_cu(0x1_0000);
//! dev.set_auto_complete(true);
//!
//! let sched = Scheduler::start(Arc::new(dev), &SchedConfig::default()).unwrap();
//! let cfg = sched.submit(ConfigureCmd::new(0x1000, &[0x1_0000]).to_packet().unwrap().words()).unwrap();
//! let run = sched.submit(ErtPacket::start_cu(&[1], &[42]).unwrap().words()).unwrap();
//!
//! let done = sched.wait(&[cfg, run], 2, 2, 1000).unwrap();
//! assert!(done.iter().all(|c| c.state == CmdState::Completed));
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::command::{Command, ErtPacket, Opcode};
use crate::config::SchedConfig;
use crate::device::SharedPort;
use crate::error::{Result, SchedError};
use crate::exec::{Completion, ExecCore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for a submitted command, resolved by [`Scheduler::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdHandle(u64);

impl CmdHandle {
    pub fn uid(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
struct Inbox {
    pending: Vec<Command>,
    intr: bool,
    stop: bool,
}

#[derive(Debug, Default)]
struct Results {
    /// Submitted and not yet collected by `wait`.
    outstanding: HashSet<u64>,
    done: HashMap<u64, Completion>,
}

#[derive(Debug)]
struct Shared {
    inbox: Mutex<Inbox>,
    wake: Condvar,
    results: Mutex<Results>,
    done_cv: Condvar,
    configured: AtomicBool,
    /// A configure command has been submitted.
    configure_seen: AtomicBool,
    next_uid: AtomicU64,
}

/// Owns the scheduler thread of one device.
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Create the execution core for `port` and start its thread.
    pub fn start(port: SharedPort, config: &SchedConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            inbox: Mutex::new(Inbox::default()),
            wake: Condvar::new(),
            results: Mutex::new(Results::default()),
            done_cv: Condvar::new(),
            configured: AtomicBool::new(false),
            configure_seen: AtomicBool::new(false),
            next_uid: AtomicU64::new(1),
        });

        let exec = ExecCore::new(port, config);
        let poll_interval = config.poll_interval();
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("ert-sched".into())
                .spawn(move || scheduler_loop(&shared, exec, poll_interval))?
        };

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Hand a command buffer to the scheduler. Returns without waiting.
    ///
    /// Until a configure command has been submitted nothing else is accepted.
    pub fn submit(&self, buf: &[u32]) -> Result<CmdHandle> {
        self.submit_packet(ErtPacket::parse(buf)?)
    }

    /// Like [`Scheduler::submit`] for a little-endian byte buffer.
    pub fn submit_bytes(&self, bytes: &[u8]) -> Result<CmdHandle> {
        self.submit_packet(ErtPacket::from_le_bytes(bytes)?)
    }

    fn submit_packet(&self, packet: ErtPacket) -> Result<CmdHandle> {
        if packet.opcode() == Opcode::Configure {
            self.shared.configure_seen.store(true, Ordering::Release);
        } else if !self.shared.configure_seen.load(Ordering::Acquire) {
            return Err(SchedError::NotConfigured);
        }

        let uid = self.shared.next_uid.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.results).outstanding.insert(uid);

        let mut inbox = lock(&self.shared.inbox);
        if inbox.stop {
            lock(&self.shared.results).outstanding.remove(&uid);
            return Err(SchedError::Shutdown);
        }
        inbox.pending.push(Command::new(uid, packet));
        self.shared.wake.notify_one();
        Ok(CmdHandle(uid))
    }

    /// Wait until at least `min_count` of `handles` have finished or
    /// `timeout_ms` passes, then collect up to `max_count` of them.
    ///
    /// On timeout whatever has finished is returned, possibly nothing.
    /// Collected handles are forgotten; waiting on them again is an error.
    pub fn wait(
        &self,
        handles: &[CmdHandle],
        min_count: usize,
        max_count: usize,
        timeout_ms: u64,
    ) -> Result<Vec<Completion>> {
        if max_count == 0 || min_count > max_count || min_count > handles.len() {
            return Err(SchedError::InvalidConfiguration(format!(
                "cannot wait for {}..={} of {} handles",
                min_count,
                max_count,
                handles.len()
            )));
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut results = lock(&self.shared.results);
        if let Some(unknown) = handles.iter().find(|h| !results.outstanding.contains(&h.0)) {
            return Err(SchedError::UnknownHandle(unknown.0));
        }

        loop {
            let finished = handles.iter().filter(|h| results.done.contains_key(&h.0)).count();
            let now = Instant::now();
            if finished >= min_count || now >= deadline {
                break;
            }
            results = self
                .shared
                .done_cv
                .wait_timeout(results, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let mut collected = Vec::new();
        for handle in handles {
            if collected.len() == max_count {
                break;
            }
            if let Some(completion) = results.done.remove(&handle.0) {
                results.outstanding.remove(&handle.0);
                collected.push(completion);
            }
        }
        Ok(collected)
    }

    /// Wake the scheduler for an immediate tick.
    pub fn interrupt(&self) {
        lock(&self.shared.inbox).intr = true;
        self.shared.wake.notify_one();
    }

    /// Whether a configure command has completed.
    pub fn is_configured(&self) -> bool {
        self.shared.configured.load(Ordering::Acquire)
    }

    /// Stop the thread. Commands still in flight finish as `Abort`.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        lock(&self.shared.inbox).stop = true;
        self.shared.wake.notify_one();
        if thread.join().is_err() {
            log::error!("scheduler thread panicked");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scheduler_loop(shared: &Shared, mut exec: ExecCore, poll_interval: Duration) {
    log::info!("scheduler thread started, poll interval {:?}", poll_interval);
    let mut again = false;

    loop {
        let (cmds, stop) = {
            let mut inbox = lock(&shared.inbox);
            if !again && !exec.needs_poll() {
                inbox = shared
                    .wake
                    .wait_timeout_while(inbox, poll_interval, |i| {
                        i.pending.is_empty() && !i.intr && !i.stop
                    })
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            inbox.intr = false;
            (std::mem::take(&mut inbox.pending), inbox.stop)
        };
        if stop {
            // Commands still in the inbox are aborted with the rest.
            for cmd in cmds {
                exec.admit(cmd);
            }
            break;
        }

        for cmd in cmds {
            exec.admit(cmd);
        }
        exec.service();
        again = exec.take_intr_request();
        shared.configured.store(exec.is_configured(), Ordering::Release);
        publish(shared, &mut exec);

        if exec.needs_poll() && !again {
            thread::yield_now();
        }
    }

    exec.abort_all();
    publish(shared, &mut exec);
    log::info!("scheduler thread stopped");
}

fn publish(shared: &Shared, exec: &mut ExecCore) {
    let completions = exec.take_completions();
    if completions.is_empty() {
        return;
    }
    let mut results = lock(&shared.results);
    for completion in completions {
        results.done.insert(completion.uid, completion);
    }
    shared.done_cv.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CmdState, CmdType, ConfigureCmd};
    use crate::device::{DeviceCaps, SimDevice};

    const CU_A: u32 = 0x1_0000;

    fn started(dev: &SimDevice) -> Scheduler {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = SchedConfig {
            poll_interval_ms: Some(5),
            ..SchedConfig::default()
        };
        Scheduler::start(Arc::new(dev.clone()), &config).unwrap()
    }

    fn configured(dev: &SimDevice, addrs: &[u32]) -> Scheduler {
        for addr in addrs {
            dev.add_cu(*addr as u64);
        }
        let sched = started(dev);
        let cfg = sched.submit(ConfigureCmd::new(0x1000, addrs).to_packet().unwrap().words()).unwrap();
        let done = sched.wait(&[cfg], 1, 1, 2000).unwrap();
        assert_eq!(done[0].state, CmdState::Completed);
        sched
    }

    #[test]
    fn test_submit_before_configure_rejected() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let sched = started(&dev);
        let err = sched.submit(ErtPacket::start_cu(&[1], &[]).unwrap().words()).unwrap_err();
        assert!(matches!(err, SchedError::NotConfigured));
        assert!(!sched.is_configured());
    }

    #[test]
    fn test_malformed_buffer_rejected() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let sched = started(&dev);
        assert!(matches!(sched.submit(&[]), Err(SchedError::InvalidConfiguration(_))));
        assert!(sched.submit_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_configure_then_run() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        dev.set_auto_complete(true);
        let sched = configured(&dev, &[CU_A]);
        assert!(sched.is_configured());

        let handles: Vec<CmdHandle> = (0..4)
            .map(|i| sched.submit(ErtPacket::start_cu(&[1], &[i]).unwrap().words()).unwrap())
            .collect();
        let done = sched.wait(&handles, 4, 4, 2000).unwrap();
        assert_eq!(done.len(), 4);
        assert!(done.iter().all(|c| c.state == CmdState::Completed));
        assert_eq!(dev.cu_starts(0), 4);
    }

    #[test]
    fn test_wait_times_out_with_partial_results() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let sched = configured(&dev, &[CU_A]);

        let a = sched.submit(ErtPacket::start_cu(&[1], &[]).unwrap().words()).unwrap();
        let b = sched.submit(ErtPacket::start_cu(&[1], &[]).unwrap().words()).unwrap();
        assert!(sched.wait(&[a, b], 1, 2, 30).unwrap().is_empty());

        // only the first can run until the CU is released
        while !dev.complete_cu(0) {
            thread::yield_now();
        }
        let done = sched.wait(&[a, b], 1, 2, 2000).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].uid, a.uid());

        while !dev.complete_cu(0) {
            thread::yield_now();
        }
        assert_eq!(sched.wait(&[b], 1, 1, 2000).unwrap()[0].uid, b.uid());
    }

    #[test]
    fn test_wait_respects_max_count() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let sched = configured(&dev, &[CU_A]);
        let handles: Vec<CmdHandle> = (0..3)
            .map(|_| sched.submit(ErtPacket::simple(Opcode::StartCopyBo, CmdType::KdsLocal).words()).unwrap())
            .collect();
        while lock(&sched.shared.results).done.len() < 3 {
            thread::yield_now();
        }

        let first = sched.wait(&handles, 2, 2, 0).unwrap();
        let uids: Vec<u64> = first.iter().map(|c| c.uid).collect();
        assert_eq!(uids, vec![handles[0].uid(), handles[1].uid()]);
        let rest = sched.wait(&handles[2..], 1, 1, 0).unwrap();
        assert_eq!(rest[0].uid, handles[2].uid());
    }

    #[test]
    fn test_wait_argument_checks() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let sched = configured(&dev, &[CU_A]);
        let h = sched.submit(ErtPacket::simple(Opcode::StartCopyBo, CmdType::KdsLocal).words()).unwrap();

        assert!(matches!(sched.wait(&[h], 2, 2, 0), Err(SchedError::InvalidConfiguration(_))));
        assert!(matches!(sched.wait(&[h], 0, 0, 0), Err(SchedError::InvalidConfiguration(_))));
        assert!(matches!(
            sched.wait(&[CmdHandle(999)], 1, 1, 0),
            Err(SchedError::UnknownHandle(999))
        ));

        sched.wait(&[h], 1, 1, 2000).unwrap();
        assert!(matches!(sched.wait(&[h], 1, 1, 0), Err(SchedError::UnknownHandle(_))));
    }

    #[test]
    fn test_concurrent_submitters() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        dev.set_auto_complete(true);
        let sched = Arc::new(configured(&dev, &[CU_A, 0x2_0000]));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let sched = Arc::clone(&sched);
                thread::spawn(move || {
                    let handles: Vec<CmdHandle> = (0..8)
                        .map(|_| sched.submit(ErtPacket::start_cu(&[0b11], &[]).unwrap().words()).unwrap())
                        .collect();
                    sched.wait(&handles, 8, 8, 5000).unwrap()
                })
            })
            .collect();

        let mut uids = HashSet::new();
        for worker in workers {
            let done = worker.join().unwrap();
            assert_eq!(done.len(), 8);
            assert!(done.iter().all(|c| c.state == CmdState::Completed));
            uids.extend(done.iter().map(|c| c.uid));
        }
        assert_eq!(uids.len(), 32);
        assert_eq!(dev.cu_starts(0) + dev.cu_starts(1), 32);
    }

    #[test]
    fn test_shutdown_aborts_in_flight() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let mut sched = configured(&dev, &[CU_A]);
        let a = sched.submit(ErtPacket::start_cu(&[1], &[]).unwrap().words()).unwrap();
        let b = sched.submit(ErtPacket::start_cu(&[1], &[]).unwrap().words()).unwrap();

        sched.shutdown();
        let done = sched.wait(&[a, b], 2, 2, 0).unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|c| c.state == CmdState::Abort));
        assert!(matches!(
            sched.submit(ErtPacket::start_cu(&[1], &[]).unwrap().words()),
            Err(SchedError::Shutdown)
        ));
    }

    #[test]
    fn test_interrupt_wakes_idle_thread() {
        let dev = SimDevice::new(DeviceCaps::penguin());
        let sched = started(&dev);
        sched.interrupt();
        sched.interrupt();
        let cfg = sched.submit(ConfigureCmd::new(0x1000, &[CU_A]).to_packet().unwrap().words()).unwrap();
        assert_eq!(sched.wait(&[cfg], 1, 1, 2000).unwrap()[0].state, CmdState::Completed);
    }
}
