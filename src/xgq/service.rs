//! Worker-driven XGQ client.
//!
//! Two threads serve one client ring:
//!
//! ```text
//!  caller ──submit()──► pending ──submit worker──► SQ ──► embedded processor
//!     ▲                  (Mutex+Condvar)                        │
//!     │                                                         ▼
//!  wait() ◄── per-command Condvar ◄── completion worker ◄────── CQ
//!                 (looked up by cid in `submitted`)
//! ```
//!
//! Callers block only on their own command. A completion whose cid is not
//! outstanding is logged and dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::SchedConfig;
use crate::device::SharedPort;
use crate::error::{Result, SchedError};

use super::entry::{load_xclbin_payload, CqEntry, SqEntry, XgqAddrType, XgqOpcode};
use super::ring::{Doorbells, Role, Xgq};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How an XGQ command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done(CqEntry),
    Cancelled,
    /// The waiter gave up; the command must not be tracked again.
    TimedOut,
}

/// A command in flight on the service.
#[derive(Debug)]
pub struct XgqCmd {
    entry: SqEntry,
    outcome: Mutex<Option<Outcome>>,
    cv: Condvar,
}

impl XgqCmd {
    fn new(entry: SqEntry) -> Self {
        Self {
            entry,
            outcome: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub fn cid(&self) -> u16 {
        self.entry.header.cid
    }

    fn finish(&self, outcome: Outcome) {
        let mut slot = lock(&self.outcome);
        if slot.is_none() {
            *slot = Some(outcome);
            self.cv.notify_all();
        }
    }
}

struct Shared {
    port: SharedPort,
    ring: Mutex<Xgq>,
    pending: Mutex<VecDeque<Arc<XgqCmd>>>,
    pending_cv: Condvar,
    submitted: Mutex<HashMap<u16, Arc<XgqCmd>>>,
    /// Set by `interrupt`, cleared by the completion worker.
    irq: Mutex<bool>,
    irq_cv: Condvar,
    next_cid: Mutex<u16>,
    stop: AtomicBool,
    poll_interval: Duration,
}

impl Shared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn alloc_cid(&self) -> u16 {
        let submitted = lock(&self.submitted);
        let mut next = lock(&self.next_cid);
        loop {
            let cid = *next;
            *next = next.wrapping_add(1);
            if !submitted.contains_key(&cid) {
                return cid;
            }
        }
    }

    fn submit_worker(&self) {
        log::debug!("xgq submit worker started");
        while let Some(cmd) = self.next_pending() {
            let cid = cmd.cid();
            if !self.track(&cmd) {
                log::debug!("xgq cid {} abandoned before submission", cid);
                continue;
            }
            let res = lock(&self.ring).submit(self.port.as_ref(), &cmd.entry);
            match res {
                Ok(()) => log::debug!("xgq submitted cid {}", cid),
                Err(err) if err.is_retryable() => {
                    lock(&self.submitted).remove(&cid);
                    lock(&self.pending).push_front(cmd);
                    self.sleep_for_irq();
                }
                Err(err) => {
                    log::error!("xgq submit of cid {} failed: {}", cid, err);
                    lock(&self.submitted).remove(&cid);
                    cmd.finish(Outcome::Done(CqEntry::error(cid, -EIO)));
                }
            }
        }
        log::debug!("xgq submit worker stopped");
    }

    /// Record `cmd` as submitted unless it already has an outcome. Checked
    /// under the `submitted` lock, which `wait` also holds when it gives up.
    fn track(&self, cmd: &Arc<XgqCmd>) -> bool {
        let mut submitted = lock(&self.submitted);
        if lock(&cmd.outcome).is_some() {
            return false;
        }
        submitted.insert(cmd.cid(), Arc::clone(cmd));
        true
    }

    fn next_pending(&self) -> Option<Arc<XgqCmd>> {
        let mut pending = lock(&self.pending);
        loop {
            if self.stopped() {
                return None;
            }
            if let Some(cmd) = pending.pop_front() {
                return Some(cmd);
            }
            pending = self
                .pending_cv
                .wait_timeout(pending, self.poll_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn complete_worker(&self) {
        log::debug!("xgq completion worker started");
        while !self.stopped() {
            let next = lock(&self.ring).next_completion(self.port.as_ref());
            match next {
                Ok(Some(cq)) => self.cmd_complete(cq),
                Ok(None) => self.sleep_for_irq(),
                Err(err) => {
                    log::error!("xgq completion read failed: {}", err);
                    self.sleep_for_irq();
                }
            }
        }
        log::debug!("xgq completion worker stopped");
    }

    fn cmd_complete(&self, cq: CqEntry) {
        match lock(&self.submitted).remove(&cq.cid) {
            Some(cmd) => {
                log::debug!("xgq cmd {} completed (rcode {})", cq.cid, cq.rcode);
                cmd.finish(Outcome::Done(cq));
            }
            None => log::warn!("unknown xgq cid {} received", cq.cid),
        }
    }

    fn sleep_for_irq(&self) {
        let irq = lock(&self.irq);
        let (mut irq, _) = self
            .irq_cv
            .wait_timeout_while(irq, self.poll_interval, |raised| !*raised && !self.stopped())
            .unwrap_or_else(PoisonError::into_inner);
        *irq = false;
    }
}

const EIO: i32 = 5;

/// XGQ client with its submit and completion workers.
pub struct XgqService {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    timeout: Duration,
}

impl XgqService {
    /// Allocate a client ring at `ring_addr` and start the workers.
    pub fn alloc(
        port: SharedPort,
        ring_addr: u64,
        ring_bytes: u64,
        doorbells: Doorbells,
        config: &SchedConfig,
    ) -> Result<Self> {
        let (xgq, _) = Xgq::alloc(
            port.as_ref(),
            Role::Client,
            ring_addr,
            ring_bytes,
            config.xgq_slot_size(),
            doorbells,
        )?;
        Self::start(port, xgq, config.poll_interval(), config.xgq_timeout())
    }

    /// Start the workers on an existing client ring.
    pub fn start(port: SharedPort, xgq: Xgq, poll_interval: Duration, timeout: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            port,
            ring: Mutex::new(xgq),
            pending: Mutex::new(VecDeque::new()),
            pending_cv: Condvar::new(),
            submitted: Mutex::new(HashMap::new()),
            irq: Mutex::new(false),
            irq_cv: Condvar::new(),
            next_cid: Mutex::new(0),
            stop: AtomicBool::new(false),
            poll_interval,
        });

        let mut service = Self {
            shared: Arc::clone(&shared),
            workers: Vec::with_capacity(2),
            timeout,
        };
        let submit = Arc::clone(&shared);
        service.workers.push(
            thread::Builder::new()
                .name("xgq-submit".into())
                .spawn(move || submit.submit_worker())?,
        );
        let complete = Arc::clone(&shared);
        service.workers.push(
            thread::Builder::new()
                .name("xgq-complete".into())
                .spawn(move || complete.complete_worker())?,
        );
        Ok(service)
    }

    /// Queue a command for the submit worker.
    pub fn submit(&self, opcode: XgqOpcode, payload: Vec<u32>) -> Result<Arc<XgqCmd>> {
        if self.shared.stopped() {
            return Err(SchedError::Shutdown);
        }
        let cid = self.shared.alloc_cid();
        let cmd = Arc::new(XgqCmd::new(SqEntry::new(opcode, cid, payload)?));
        lock(&self.shared.pending).push_back(Arc::clone(&cmd));
        self.shared.pending_cv.notify_one();
        Ok(cmd)
    }

    /// Block until `cmd` completes or `timeout` passes.
    ///
    /// A timed-out command is forgotten; a late completion for it is
    /// reported as an unknown cid.
    pub fn wait(&self, cmd: &XgqCmd, timeout: Duration) -> Result<CqEntry> {
        let deadline = Instant::now() + timeout;
        let mut outcome = lock(&cmd.outcome);
        loop {
            match *outcome {
                Some(Outcome::Done(cq)) => return Ok(cq),
                Some(Outcome::Cancelled) => return Err(SchedError::Shutdown),
                Some(Outcome::TimedOut) => return Err(SchedError::Timeout(cmd.cid() as u64)),
                None => {}
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            outcome = cmd
                .cv
                .wait_timeout(outcome, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(outcome);

        let cid = cmd.cid();
        {
            let mut submitted = lock(&self.shared.submitted);
            let mut outcome = lock(&cmd.outcome);
            match *outcome {
                Some(Outcome::Done(cq)) => return Ok(cq),
                Some(Outcome::Cancelled) => return Err(SchedError::Shutdown),
                _ => *outcome = Some(Outcome::TimedOut),
            }
            submitted.remove(&cid);
        }
        lock(&self.shared.pending).retain(|c| c.cid() != cid);
        log::error!("xgq cmd {} timed out after {:?}", cid, timeout);
        Err(SchedError::Timeout(cid as u64))
    }

    /// Submit and block for the configured timeout.
    pub fn submit_and_wait(&self, opcode: XgqOpcode, payload: Vec<u32>) -> Result<CqEntry> {
        let cmd = self.submit(opcode, payload)?;
        self.wait(&cmd, self.timeout)
    }

    /// Ask the embedded processor to load the image at `address`.
    pub fn load_xclbin(&self, address: u64, size: u32) -> Result<()> {
        log::info!("loading image of {} bytes from 0x{:x}", size, address);
        let cq = self.submit_and_wait(
            XgqOpcode::LoadXclbin,
            load_xclbin_payload(address, size, XgqAddrType::Device),
        )?;
        if !cq.is_ok() {
            return Err(SchedError::DeviceProtocol(format!(
                "image load failed: state {} rcode {}",
                cq.cstate, cq.rcode
            )));
        }
        Ok(())
    }

    /// Tell the embedded processor to stop serving the queue.
    pub fn exit_ert(&self) -> Result<()> {
        let cq = self.submit_and_wait(XgqOpcode::ExitErt, Vec::new())?;
        if !cq.is_ok() {
            log::warn!("exit request returned rcode {}", cq.rcode);
        }
        Ok(())
    }

    /// Wake the completion worker (completion interrupt).
    pub fn interrupt(&self) {
        *lock(&self.shared.irq) = true;
        self.shared.irq_cv.notify_all();
    }

    /// Stop the workers. Outstanding commands fail with `Shutdown`.
    pub fn shutdown(&mut self) {
        if self.shared.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.pending_cv.notify_all();
        self.interrupt();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("xgq worker panicked");
            }
        }
        let pending: Vec<_> = lock(&self.shared.pending).drain(..).collect();
        let submitted: Vec<_> = lock(&self.shared.submitted).drain().map(|(_, c)| c).collect();
        for cmd in pending.into_iter().chain(submitted) {
            cmd.finish(Outcome::Cancelled);
        }
        log::info!("xgq service stopped");
    }
}

impl Drop for XgqService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
