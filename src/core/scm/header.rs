// src/core/scm/header.rs

//! The fixed SCM header (§4.1 item 1): magic, version, a snapshot of the
//! broker configuration taken at creation time, and the creating PID.
//! Configuration fields that are changeable via the Admin Channel
//! (`conf_change`) live here as plain atomics rather than in the
//! immutable `BrokerConfig` the master keeps in-process, since workers
//! must observe changes without re-attaching.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

pub const SCM_MAGIC: u32 = 0x4352_4B31; // b"CRK1" as a little-endian u32
pub const SCM_VERSION: u32 = 1;

#[repr(C)]
pub struct ScmHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub creator_pid: AtomicI64,
    pub max_workers: AtomicU32,
    pub queue_max: AtomicU32,

    // Snapshot of mutable `BrokerConfig` fields a worker or the dispatcher
    // must observe live, updated only via `conf_change` admin commands.
    pub time_to_kill_secs: AtomicU64,
    pub session_timeout_secs: AtomicU64,
    pub priority_gap_secs: AtomicU64,
    pub sql_log_max_size: AtomicU64,

    // Broker-level state machine of §4.8: OFF=0, ON=1, SUSPENDED=2.
    pub broker_state: AtomicU32,

    // Telemetry roll-ups refreshed by the telemetry task (§4.9); read by
    // the status tool without additional synchronization beyond these
    // being atomics.
    pub active_workers: AtomicU32,
    pub busy_workers: AtomicU32,
    pub queued_jobs: AtomicU32,
    pub requests_per_sec_milli: AtomicU64, // EWMA * 1000, fixed-point
}

impl ScmHeader {
    /// # Safety
    /// `this` must point at writable memory sized for `ScmHeader` and
    /// must not already hold a live header (callers only call this on
    /// first creation of the SCM region).
    pub unsafe fn init_in_place(
        this: *mut Self,
        creator_pid: i64,
        max_workers: u32,
        queue_max: u32,
        time_to_kill_secs: u64,
        session_timeout_secs: u64,
        priority_gap_secs: u64,
        sql_log_max_size: u64,
    ) {
        unsafe {
            this.write(ScmHeader {
                magic: AtomicU32::new(SCM_MAGIC),
                version: AtomicU32::new(SCM_VERSION),
                creator_pid: AtomicI64::new(creator_pid),
                max_workers: AtomicU32::new(max_workers),
                queue_max: AtomicU32::new(queue_max),
                time_to_kill_secs: AtomicU64::new(time_to_kill_secs),
                session_timeout_secs: AtomicU64::new(session_timeout_secs),
                priority_gap_secs: AtomicU64::new(priority_gap_secs),
                sql_log_max_size: AtomicU64::new(sql_log_max_size),
                broker_state: AtomicU32::new(BrokerRunState::Off as u32),
                active_workers: AtomicU32::new(0),
                busy_workers: AtomicU32::new(0),
                queued_jobs: AtomicU32::new(0),
                requests_per_sec_milli: AtomicU64::new(0),
            });
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Acquire) == SCM_MAGIC
            && self.version.load(Ordering::Acquire) == SCM_VERSION
    }

    pub fn broker_state(&self) -> BrokerRunState {
        BrokerRunState::from_u32(self.broker_state.load(Ordering::Acquire))
    }

    pub fn set_broker_state(&self, state: BrokerRunState) {
        self.broker_state.store(state as u32, Ordering::Release);
    }
}

/// The broker-level state machine of §4.8: `OFF -> ON -> SUSPENDED -> ON -> OFF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BrokerRunState {
    Off = 0,
    On = 1,
    Suspended = 2,
}

impl BrokerRunState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => BrokerRunState::On,
            2 => BrokerRunState::Suspended,
            _ => BrokerRunState::Off,
        }
    }
}
