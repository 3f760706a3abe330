// src/core/scm/worker_slot.rs

//! One worker (CAS) entry per §3: `pid`, `state`, `session_id`,
//! `last_access_time`, counters, and a bounded SQL fingerprint. Exactly
//! one dispatcher may observe-and-claim a worker at a time; claiming is a
//! CAS from `Idle` to `Busy` guarded by the slot's [`RobustMutex`].

use super::mutex::{LockOutcome, RobustMutex, RobustMutexGuard};
use crate::core::errors::BrokerError;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

pub const LOG_MSG_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WorkerState {
    Idle = 0,
    Busy = 1,
    CloseWait = 2,
    Terminated = 3,
}

impl WorkerState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => WorkerState::Busy,
            2 => WorkerState::CloseWait,
            3 => WorkerState::Terminated,
            _ => WorkerState::Idle,
        }
    }
}

/// One fixed-size slot in the SCM worker table. Mutable fields are
/// guarded by `lock`; `pid` and `index` are set once at spawn and read
/// without locking.
#[repr(C)]
pub struct WorkerSlot {
    lock: RobustMutex,
    index: AtomicU32,
    pid: AtomicI64,
    state: AtomicU32,
    session_id: AtomicU64,
    last_access_time_secs: AtomicU64,
    num_requests: AtomicU64,
    num_errors: AtomicU64,
    num_queries: AtomicU64,
    cas_client_type: AtomicU32,
    protocol_version: AtomicU32,
    log_msg_len: AtomicU32,
    log_msg: [std::cell::UnsafeCell<u8>; LOG_MSG_LEN],
}

// SAFETY: all mutable access to `log_msg` happens while `lock` is held by
// the accessor; `WorkerSlot` lives inside the shared mmap region for the
// lifetime of every process that touches it.
unsafe impl Sync for WorkerSlot {}
unsafe impl Send for WorkerSlot {}

impl WorkerSlot {
    /// # Safety
    /// `this` must point at writable memory sized for `WorkerSlot` that
    /// has not yet been initialized.
    pub unsafe fn init_in_place(this: *mut Self, index: u32) -> Result<(), BrokerError> {
        unsafe {
            let lock_ptr = std::ptr::addr_of_mut!((*this).lock);
            RobustMutex::init_in_place(lock_ptr)?;
            std::ptr::addr_of_mut!((*this).index).write(AtomicU32::new(index));
            std::ptr::addr_of_mut!((*this).pid).write(AtomicI64::new(0));
            std::ptr::addr_of_mut!((*this).state).write(AtomicU32::new(WorkerState::Terminated as u32));
            std::ptr::addr_of_mut!((*this).session_id).write(AtomicU64::new(0));
            std::ptr::addr_of_mut!((*this).last_access_time_secs).write(AtomicU64::new(0));
            std::ptr::addr_of_mut!((*this).num_requests).write(AtomicU64::new(0));
            std::ptr::addr_of_mut!((*this).num_errors).write(AtomicU64::new(0));
            std::ptr::addr_of_mut!((*this).num_queries).write(AtomicU64::new(0));
            std::ptr::addr_of_mut!((*this).cas_client_type).write(AtomicU32::new(0));
            std::ptr::addr_of_mut!((*this).protocol_version).write(AtomicU32::new(0));
            std::ptr::addr_of_mut!((*this).log_msg_len).write(AtomicU32::new(0));
            for i in 0..LOG_MSG_LEN {
                let cell_ptr = std::ptr::addr_of_mut!((*this).log_msg[i]);
                (*cell_ptr).get().write(0);
            }
            Ok(())
        }
    }

    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Relaxed)
    }

    pub fn pid(&self) -> i64 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }

    pub fn last_access_time_secs(&self) -> u64 {
        self.last_access_time_secs.load(Ordering::Acquire)
    }

    pub fn num_requests(&self) -> u64 {
        self.num_requests.load(Ordering::Relaxed)
    }

    pub fn num_errors(&self) -> u64 {
        self.num_errors.load(Ordering::Relaxed)
    }

    pub fn num_queries(&self) -> u64 {
        self.num_queries.load(Ordering::Relaxed)
    }

    /// Acquires the slot's lock. Callers must hold the guard for the
    /// duration of any multi-field read/update to avoid observing a torn
    /// state.
    ///
    /// # Safety
    /// The slot must be backed by live, mapped memory.
    pub unsafe fn lock(&self) -> Result<RobustMutexGuard<'_>, BrokerError> {
        unsafe { RobustMutexGuard::acquire(&self.lock) }
    }

    /// Resets a slot to `Terminated` with zeroed session/counters but a
    /// preserved request/error/query history, the recovery action taken
    /// when the dispatcher discovers a worker died holding the slot's
    /// mutex (§5: "the dispatcher re-initializes that slot... mutex
    /// reset").
    pub fn reset_after_owner_death(&self) {
        self.state.store(WorkerState::Terminated as u32, Ordering::Release);
        self.session_id.store(0, Ordering::Release);
        self.pid.store(0, Ordering::Release);
    }

    pub fn mark_spawned(&self, pid: i64) {
        self.pid.store(pid, Ordering::Release);
        self.state.store(WorkerState::Idle as u32, Ordering::Release);
        self.session_id.store(0, Ordering::Release);
    }

    pub fn mark_idle(&self, now_secs: u64) {
        self.state.store(WorkerState::Idle as u32, Ordering::Release);
        self.session_id.store(0, Ordering::Release);
        self.last_access_time_secs.store(now_secs, Ordering::Release);
    }

    pub fn mark_close_wait(&self, now_secs: u64) {
        self.state.store(WorkerState::CloseWait as u32, Ordering::Release);
        self.last_access_time_secs.store(now_secs, Ordering::Release);
    }

    pub fn mark_terminated(&self) {
        self.state.store(WorkerState::Terminated as u32, Ordering::Release);
    }

    /// Attempts the CAS claim `Idle -> Busy` described in §3's invariant.
    /// Returns `true` if this caller won the claim.
    pub fn try_claim(&self, session_id: u64, now_secs: u64) -> bool {
        let won = self
            .state
            .compare_exchange(
                WorkerState::Idle as u32,
                WorkerState::Busy as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.session_id.store(session_id, Ordering::Release);
            self.last_access_time_secs.store(now_secs, Ordering::Release);
        }
        won
    }

    pub fn record_request(&self) {
        self.num_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.num_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self) {
        self.num_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_client_info(&self, cas_client_type: u32, protocol_version: u32) {
        self.cas_client_type.store(cas_client_type, Ordering::Relaxed);
        self.protocol_version.store(protocol_version, Ordering::Relaxed);
    }

    /// Writes a truncated SQL fingerprint into the bounded `log_msg`
    /// field. Only the worker that owns this slot ever calls this, so no
    /// additional locking is needed here; concurrent readers (dispatcher,
    /// telemetry) may observe a torn-but-valid snapshot via `log_msg()`.
    pub fn set_log_msg(&self, text: &str) {
        let bytes = text.as_bytes();
        let n = bytes.len().min(LOG_MSG_LEN);
        for i in 0..n {
            // SAFETY: caller holds the slot lock; we are the sole writer.
            unsafe {
                *self.log_msg[i].get() = bytes[i];
            }
        }
        self.log_msg_len.store(n as u32, Ordering::Release);
    }

    pub fn log_msg(&self) -> String {
        let n = self.log_msg_len.load(Ordering::Acquire) as usize;
        let mut buf = Vec::with_capacity(n);
        for i in 0..n {
            // SAFETY: read-only snapshot; torn reads show stale-but-valid bytes.
            unsafe {
                buf.push(*self.log_msg[i].get());
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// True if idle and has not been touched for at least `time_to_kill`.
    pub fn is_idle_past(&self, now_secs: u64, time_to_kill_secs: u64) -> bool {
        self.state() == WorkerState::Idle
            && now_secs.saturating_sub(self.last_access_time_secs()) >= time_to_kill_secs
    }
}
