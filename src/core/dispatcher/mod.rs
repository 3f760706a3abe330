// src/core/dispatcher/mod.rs

//! The single dispatcher task of §4.5: owns the authoritative view of the
//! worker table and the job queue, runs the selection algorithm, ages and
//! drains the queue, and scans for elasticity/session-cleanup on a
//! control tick. Acceptor and admin tooling talk to it only through the
//! bounded channel in [`DispatcherHandle`] or the SCM admin mailbox —
//! never by mutating shared state directly (§4.5: "Acceptor and
//! telemetry threads send messages... rather than mutating shared
//! state").

pub mod affinity;
pub mod pool;
pub mod selection;

use crate::config::BrokerConfig;
use crate::core::admin::AdminAction;
use crate::core::errors::BrokerError;
use crate::core::protocol::fd_sideband::{self, FdSideband};
use crate::core::scm::{BrokerRunState, JobRecord, ScmHandle};
use affinity::SessionAffinityTable;
use pool::WorkerHandle;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Everything the acceptor knows about a client fd before a worker has
/// seen it, matching the job queue entry of §3.
#[derive(Debug, Clone, Copy)]
pub struct JobMeta {
    pub session_id_hint: u64,
    pub driver_info: [u8; fd_sideband::DRIVER_INFO_LEN],
    pub request_id: i32,
}

/// One unit of work handed from the acceptor to the dispatcher.
pub struct PendingJob {
    pub fd: OwnedFd,
    pub meta: JobMeta,
}

enum DispatcherMessage {
    Dispatch(PendingJob, oneshot::Sender<Result<(), BrokerError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheaply cloneable handle the acceptor and server orchestration use to
/// talk to the dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatcherMessage>,
}

impl DispatcherHandle {
    /// Hands a new connection to the dispatcher, returning once it has
    /// been claimed by a worker, queued, or rejected with *BUSY*.
    pub async fn dispatch(&self, job: PendingJob) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DispatcherMessage::Dispatch(job, reply_tx))
            .await
            .map_err(|_| BrokerError::internal("dispatcher task is gone"))?;
        reply_rx
            .await
            .map_err(|_| BrokerError::internal("dispatcher dropped the reply channel"))?
    }

    /// Asks the dispatcher task to terminate every worker it owns and
    /// stop its run loop (§4.8 *->OFF: "signal workers... wait
    /// `shutdown_timeout`"), waiting for it to confirm. A no-op if the
    /// dispatcher task has already exited.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(DispatcherMessage::Shutdown(reply_tx)).await.is_err() {
            return;
        }
        let _ = reply_rx.await;
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The dispatcher task's state, owned exclusively by the task running
/// [`Dispatcher::run`]. Not `Clone`; callers interact through
/// [`DispatcherHandle`].
pub struct Dispatcher {
    broker_name: String,
    config: BrokerConfig,
    scm: Arc<ScmHandle>,
    workers: Vec<Option<WorkerHandle>>,
    affinity: SessionAffinityTable,
    next_session_id: AtomicU64,
    last_admin_seq: u64,
    rx: mpsc::Receiver<DispatcherMessage>,
}

impl Dispatcher {
    /// Builds a dispatcher bound to an already-created SCM region, with no
    /// workers spawned yet. Call [`Dispatcher::ensure_min_workers`] before
    /// [`Dispatcher::run`] to reach the cold-start invariant of §8
    /// scenario 1.
    pub fn new(broker_name: String, config: BrokerConfig, scm: Arc<ScmHandle>) -> (Self, DispatcherHandle) {
        let (tx, rx) = mpsc::channel(256);
        let max_workers = config.max_workers;
        let dispatcher = Dispatcher {
            broker_name,
            config,
            scm,
            workers: (0..max_workers).map(|_| None).collect(),
            affinity: SessionAffinityTable::new(),
            next_session_id: AtomicU64::new(1),
            last_admin_seq: 0,
            rx,
        };
        (dispatcher, DispatcherHandle { tx })
    }

    fn active_slots(&self) -> usize {
        self.workers.iter().filter(|w| w.is_some()).count()
    }

    /// Spawns workers until `min_workers` are running, the cold-start
    /// requirement of §8 scenario 1 and the post-elasticity-kill floor of
    /// §4.5.
    pub fn ensure_min_workers(&mut self) -> Result<(), BrokerError> {
        while self.active_slots() < self.config.min_workers {
            self.spawn_into_first_free_slot()?;
        }
        Ok(())
    }

    fn spawn_into_first_free_slot(&mut self) -> Result<usize, BrokerError> {
        let index = self
            .workers
            .iter()
            .position(|w| w.is_none())
            .ok_or_else(|| BrokerError::internal("no free worker slot to spawn into"))?;
        let handle = pool::spawn_worker(&self.broker_name, &self.config, index)?;
        let slot = self.scm.worker_slot(index)?;
        slot.mark_spawned(handle.pid.as_raw() as i64);
        slot.mark_idle(now_secs());
        info!(worker = index, pid = handle.pid.as_raw(), "spawned worker");
        self.workers[index] = Some(handle);
        Ok(index)
    }

    /// The main loop: services dispatch requests and periodic control
    /// ticks until the receiver closes (broker shutdown).
    pub async fn run(mut self) {
        let mut aging = tokio::time::interval(self.config.priority_gap());
        let mut drain = tokio::time::interval(Duration::from_millis(50));
        let mut elasticity = tokio::time::interval(Duration::from_secs(1));
        let mut admin_tick = tokio::time::interval(Duration::from_millis(200));

        loop {
            tokio::select! {
                maybe_msg = self.rx.recv() => {
                    match maybe_msg {
                        Some(DispatcherMessage::Dispatch(job, reply)) => {
                            let result = self.handle_dispatch(job).await;
                            let _ = reply.send(result);
                        }
                        Some(DispatcherMessage::Shutdown(reply)) => {
                            let _ = self.apply_admin_action(AdminAction::BrokerOff);
                            let _ = reply.send(());
                            info!(broker = %self.broker_name, "dispatcher shut down on request");
                            break;
                        }
                        None => {
                            info!(broker = %self.broker_name, "dispatcher channel closed, exiting run loop");
                            break;
                        }
                    }
                }
                _ = aging.tick() => {
                    if let Err(e) = unsafe { self.scm.job_queue().age_all() } {
                        warn!(error = %e, "job queue aging failed");
                    }
                }
                _ = drain.tick() => {
                    if let Err(e) = self.drain_queue() {
                        warn!(error = %e, "queue drain failed");
                    }
                }
                _ = elasticity.tick() => {
                    self.run_elasticity_scan();
                    let expired = self.affinity.expire_idle(self.config.session_timeout);
                    if !expired.is_empty() {
                        info!(count = expired.len(), "expired idle session affinities");
                    }
                }
                _ = admin_tick.tick() => {
                    if let Err(e) = self.poll_admin_channel() {
                        warn!(error = %e, "admin channel poll failed");
                    }
                }
            }
        }
    }

    async fn handle_dispatch(&mut self, job: PendingJob) -> Result<(), BrokerError> {
        if self.scm.header().broker_state() != BrokerRunState::On {
            return Err(BrokerError::Busy("broker is not ON".into()));
        }

        // Selection step 1: sticky dispatch to a previously bound worker.
        if job.meta.session_id_hint != 0 {
            if let Some(worker_index) = self.affinity.lookup(job.meta.session_id_hint) {
                if self.workers[worker_index].is_some() {
                    let deadline =
                        tokio::time::Instant::now() + self.config.sticky_timeout;
                    loop {
                        if selection::is_sticky_candidate(&self.scm, worker_index)? {
                            let slot = self.scm.worker_slot(worker_index)?;
                            if slot.try_claim(job.meta.session_id_hint, now_secs()) {
                                self.affinity.touch(job.meta.session_id_hint);
                                return self.handoff(worker_index, job);
                            }
                        }
                        if tokio::time::Instant::now() >= deadline {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    // Affinity target never freed up in time: the bound
                    // session is effectively lost.
                    self.affinity.remove(job.meta.session_id_hint);
                    return Err(BrokerError::SessionLost(format!(
                        "worker {worker_index} did not free up within sticky_timeout"
                    )));
                }
                self.affinity.remove(job.meta.session_id_hint);
            }
        }

        self.dispatch_fresh(job)
    }

    fn dispatch_fresh(&mut self, job: PendingJob) -> Result<(), BrokerError> {
        let candidate = selection::find_candidate(
            &self.scm,
            self.active_slots(),
            self.config.max_workers,
            self.config.auto_add,
        )?;
        match candidate {
            selection::Candidate::Idle(index) => {
                let session_id = self.mint_session_id();
                let slot = self.scm.worker_slot(index)?;
                if !slot.try_claim(session_id, now_secs()) {
                    // Lost a race with elasticity/crash recovery; fall back
                    // to queuing rather than failing the client outright.
                    return self.enqueue(job);
                }
                self.affinity.bind(session_id, index);
                self.handoff(index, job)
            }
            selection::Candidate::CanSpawn => {
                let index = self.spawn_into_first_free_slot()?;
                let session_id = self.mint_session_id();
                let slot = self.scm.worker_slot(index)?;
                if !slot.try_claim(session_id, now_secs()) {
                    return self.enqueue(job);
                }
                self.affinity.bind(session_id, index);
                self.handoff(index, job)
            }
            selection::Candidate::None => self.enqueue(job),
        }
    }

    fn enqueue(&self, job: PendingJob) -> Result<(), BrokerError> {
        use std::os::fd::IntoRawFd;
        let raw_fd = job.fd.into_raw_fd();
        let record = JobRecord {
            client_fd: raw_fd,
            arrival_time_ms: now_secs() * 1000,
            session_id_hint: job.meta.session_id_hint,
            driver_info: job.meta.driver_info,
            priority: 0,
        };
        // SAFETY: the job queue region is live for the dispatcher's whole
        // lifetime; the dispatcher is the queue's sole writer (§5).
        let result = unsafe { self.scm.job_queue().push(record) };
        if result.is_err() {
            // QUEUE_FULL: the record never entered the queue, so nothing
            // else owns `raw_fd`. Reclaim and drop it to close the socket
            // rather than leaking the descriptor.
            use std::os::fd::FromRawFd;
            drop(unsafe { OwnedFd::from_raw_fd(raw_fd) });
        }
        result
    }

    /// Sends a fd + sideband to the worker at `index` over its fd-passing
    /// channel. The worker's own slot already carries the claimed
    /// `session_id` by the time it wakes up from `recv_fd` (§9's
    /// resolution of how a freshly minted session id reaches the worker
    /// without widening the sideband struct's fixed shape).
    fn handoff(&self, index: usize, job: PendingJob) -> Result<(), BrokerError> {
        let handle = self.workers[index]
            .as_ref()
            .ok_or_else(|| BrokerError::internal(format!("worker {index} has no channel")))?;
        let sideband = FdSideband {
            request_id: job.meta.request_id,
            driver_info: job.meta.driver_info,
        };
        fd_sideband::send_fd(handle.channel.as_fd(), job.fd.as_fd(), sideband)
    }

    fn mint_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Pops queued jobs onto any worker that has become IDLE since the
    /// last drain, preserving the FIFO-within-priority-bucket guarantee
    /// of §4.6 (the queue itself enforces ordering; this just repeatedly
    /// asks for the current head).
    fn drain_queue(&mut self) -> Result<(), BrokerError> {
        loop {
            let candidate = selection::find_candidate(
                &self.scm,
                self.active_slots(),
                self.config.max_workers,
                false, // queue drain never auto-spawns; that is dispatch_fresh's job
            )?;
            let selection::Candidate::Idle(index) = candidate else {
                return Ok(());
            };
            // SAFETY: dispatcher is the queue's sole writer.
            let popped = unsafe { self.scm.job_queue().pop_highest_priority()? };
            let Some(record) = popped else {
                return Ok(());
            };
            use std::os::fd::FromRawFd;
            let fd = unsafe { OwnedFd::from_raw_fd(record.client_fd) };
            let session_id = if record.session_id_hint != 0 {
                record.session_id_hint
            } else {
                self.mint_session_id()
            };
            let slot = self.scm.worker_slot(index)?;
            if !slot.try_claim(session_id, now_secs()) {
                // Lost the race; put it back for the next drain pass and stop.
                use std::os::fd::IntoRawFd;
                unsafe {
                    self.scm.job_queue().push(JobRecord {
                        client_fd: fd.into_raw_fd(),
                        ..record
                    })?;
                }
                return Ok(());
            }
            self.affinity.bind(session_id, index);
            self.handoff(
                index,
                PendingJob {
                    fd,
                    meta: JobMeta {
                        session_id_hint: session_id,
                        driver_info: record.driver_info,
                        request_id: 0,
                    },
                },
            )?;
        }
    }

    /// Elasticity scan of §4.5: kills idle workers past `time_to_kill`
    /// while `current_workers > min_workers`, and reaps/respawns crashed
    /// ones back up to `min_workers`.
    fn run_elasticity_scan(&mut self) {
        let now = now_secs();
        let min = self.config.min_workers;
        let time_to_kill = self.config.time_to_kill.as_secs();

        for index in 0..self.workers.len() {
            let Some(handle) = &self.workers[index] else {
                continue;
            };
            if pool::has_exited(handle.pid) {
                warn!(worker = index, "worker process exited, reaping");
                if let Ok(slot) = self.scm.worker_slot(index) {
                    slot.reset_after_owner_death();
                }
                self.affinity.remove_worker(index);
                self.workers[index] = None;
                continue;
            }
            if self.active_slots() > min {
                if let Ok(slot) = self.scm.worker_slot(index) {
                    if slot.is_idle_past(now, time_to_kill) {
                        info!(worker = index, "idle past time_to_kill, terminating");
                        let _ = pool::terminate_worker(handle.pid);
                        slot.mark_terminated();
                        self.affinity.remove_worker(index);
                        self.workers[index] = None;
                    }
                }
            }
        }

        if let Err(e) = self.ensure_min_workers() {
            warn!(error = %e, "failed to respawn workers back to min_workers");
        }
    }

    /// Polls the global admin mailbox slot once per control tick (§4.8)
    /// and applies any newly observed command.
    fn poll_admin_channel(&mut self) -> Result<(), BrokerError> {
        let mailbox = self.scm.admin_mailbox();
        // SAFETY: the mailbox region is live for the dispatcher's lifetime.
        let maybe_cmd = unsafe { mailbox.global().poll_new_command(self.last_admin_seq)? };
        let Some(cmd) = maybe_cmd else {
            return Ok(());
        };
        self.last_admin_seq = cmd.seq;
        let outcome = AdminAction::parse(cmd.opcode, &cmd.arg)
            .and_then(|action| self.apply_admin_action(action));

        let (ok, message) = match outcome {
            Ok(msg) => (true, msg),
            Err(e) => (false, e.to_string()),
        };
        unsafe { mailbox.global().respond(cmd.seq, ok, &message)? };
        Ok(())
    }

    fn apply_admin_action(&mut self, action: AdminAction) -> Result<String, BrokerError> {
        match action {
            AdminAction::BrokerOn => {
                self.scm.header().set_broker_state(BrokerRunState::On);
                self.ensure_min_workers()?;
                Ok("broker is ON".into())
            }
            AdminAction::BrokerOff => {
                self.scm.header().set_broker_state(BrokerRunState::Off);
                for (index, handle) in self.workers.iter().enumerate() {
                    if let Some(handle) = handle {
                        let _ = pool::terminate_worker(handle.pid);
                        if let Ok(slot) = self.scm.worker_slot(index) {
                            slot.mark_terminated();
                        }
                    }
                }
                self.workers.iter_mut().for_each(|w| *w = None);
                Ok("broker is OFF".into())
            }
            AdminAction::Suspend => {
                self.scm.header().set_broker_state(BrokerRunState::Suspended);
                Ok("broker SUSPENDED".into())
            }
            AdminAction::Resume => {
                self.scm.header().set_broker_state(BrokerRunState::On);
                Ok("broker resumed to ON".into())
            }
            AdminAction::Add(n) => {
                for _ in 0..n {
                    if self.active_slots() >= self.config.max_workers {
                        break;
                    }
                    self.spawn_into_first_free_slot()?;
                }
                Ok(format!("requested {n} additional workers"))
            }
            AdminAction::Drop(n) => {
                let mut dropped = 0;
                for index in 0..self.workers.len() {
                    if dropped >= n {
                        break;
                    }
                    if self.active_slots() <= self.config.min_workers {
                        break;
                    }
                    if let Some(handle) = self.workers[index].take() {
                        let _ = pool::terminate_worker(handle.pid);
                        if let Ok(slot) = self.scm.worker_slot(index) {
                            slot.mark_terminated();
                        }
                        self.affinity.remove_worker(index);
                        dropped += 1;
                    }
                }
                Ok(format!("dropped {dropped} workers"))
            }
            AdminAction::Restart(index) => {
                if let Some(handle) = self.workers.get(index).and_then(|w| w.as_ref()) {
                    let _ = pool::terminate_worker(handle.pid);
                }
                if let Ok(slot) = self.scm.worker_slot(index) {
                    slot.mark_terminated();
                }
                self.affinity.remove_worker(index);
                self.workers[index] = None;
                self.spawn_into_first_free_slot()?;
                Ok(format!("restarted worker {index}"))
            }
            AdminAction::ConfChange { key, value } => self.apply_conf_change(&key, &value),
            AdminAction::ResetLog => Ok("log reset acknowledged".into()),
        }
    }

    fn apply_conf_change(&mut self, key: &str, value: &str) -> Result<String, BrokerError> {
        let header = self.scm.header();
        match key {
            "time_to_kill" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| BrokerError::arg("time_to_kill must be an integer"))?;
                header.time_to_kill_secs.store(secs, Ordering::Release);
            }
            "session_timeout" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| BrokerError::arg("session_timeout must be an integer"))?;
                header.session_timeout_secs.store(secs, Ordering::Release);
            }
            "priority_gap" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| BrokerError::arg("priority_gap must be an integer"))?;
                header.priority_gap_secs.store(secs, Ordering::Release);
            }
            "sql_log_max_size" => {
                let v: u64 = value
                    .parse()
                    .map_err(|_| BrokerError::arg("sql_log_max_size must be an integer"))?;
                header.sql_log_max_size.store(v, Ordering::Release);
            }
            "log_level" => {
                crate::logging::set_filter(value)
                    .map_err(|e| BrokerError::arg(format!("invalid log_level directive: {e}")))?;
            }
            other => {
                return Err(BrokerError::arg(format!("unknown conf_change key '{other}'")));
            }
        }
        Ok(format!("{key} set to {value}"))
    }
}
