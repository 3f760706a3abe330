// src/core/scm/mod.rs

//! Shared Control Memory (§4.1): a fixed-layout region mapped by the
//! master and every worker, created once before any worker is spawned
//! and never resized afterward. Backed by a file under `/dev/shm` (or
//! wherever `BROKER_SHM_KEY` resolves to) mapped with `memmap2`, rather
//! than a raw `shmget` segment — this keeps attach/detach ordinary file
//! opens while still giving every process an identical virtual-memory
//! view, and keeps the unsafe surface to one well-reviewed module.
//!
//! Per the design notes' "never store raw pointers into SCM across
//! process boundaries" guidance, nothing here leaks a pointer: every
//! accessor re-derives its address from the mapping each time it is
//! called, bounds-checked against the layout computed at creation.

pub mod header;
pub mod job_queue;
pub mod mailbox;
pub mod mutex;
pub mod worker_slot;

pub use header::{BrokerRunState, ScmHeader};
pub use job_queue::{JobQueue, JobRecord};
pub use mailbox::{AdminCommand, AdminMailbox, AdminOpcode, AdminResponse, MailboxSlot};
pub use worker_slot::{WorkerSlot, WorkerState};

use crate::config::BrokerConfig;
use crate::core::errors::BrokerError;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScmRole {
    Master,
    Worker,
}

/// Byte offsets and sizes of every region in the mapped file, computed
/// once from `max_workers`/`queue_max` and never recomputed afterward
/// (§4.1: "the layout is computed from configuration... and never
/// resized after creation").
#[derive(Debug, Clone, Copy)]
pub struct ScmLayout {
    pub max_workers: usize,
    pub queue_max: usize,
    pub header_off: usize,
    pub worker_table_off: usize,
    pub job_queue_off: usize,
    pub mailbox_off: usize,
    pub total_len: usize,
}

impl ScmLayout {
    pub fn compute(max_workers: usize, queue_max: usize) -> Self {
        let header_off = 0;
        let header_len = std::mem::size_of::<ScmHeader>();
        let worker_table_off = header_off + header_len;
        let worker_table_len = max_workers * std::mem::size_of::<WorkerSlot>();
        let job_queue_off = worker_table_off + worker_table_len;
        let job_queue_len = JobQueue::storage_len(queue_max);
        let mailbox_off = job_queue_off + job_queue_len;
        let mailbox_len = AdminMailbox::storage_len(max_workers);
        let total_len = mailbox_off + mailbox_len;
        ScmLayout {
            max_workers,
            queue_max,
            header_off,
            worker_table_off,
            job_queue_off,
            mailbox_off,
            total_len,
        }
    }

    fn worker_slot_off(&self, index: usize) -> usize {
        self.worker_table_off + index * std::mem::size_of::<WorkerSlot>()
    }
}

/// A typed handle onto the mapped SCM region. The handle itself is not
/// `Clone`; callers share it behind an `Arc`.
pub struct ScmHandle {
    mmap: MmapMut,
    layout: ScmLayout,
    role: ScmRole,
}

// SAFETY: every mutable field inside the mapping is either a plain atomic
// or guarded by a `RobustMutex`; concurrent access across threads within
// one process is exactly as safe as the cross-process case this type
// already has to support.
unsafe impl Sync for ScmHandle {}
unsafe impl Send for ScmHandle {}

impl ScmHandle {
    /// Creates a brand-new SCM region for `broker_name`, sized from
    /// `config`. Fails with `SCM_EXISTS` if a region is already present,
    /// matching §4.1's `attach(role)` contract for the master.
    pub fn create(broker_name: &str, config: &BrokerConfig) -> Result<Self, BrokerError> {
        let path = scm_path(broker_name);
        let layout = ScmLayout::compute(config.max_workers, config.queue_max);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    BrokerError::ScmExists(format!(
                        "SCM region already exists at '{}'",
                        path.display()
                    ))
                } else {
                    BrokerError::Io(std::sync::Arc::new(e))
                }
            })?;
        file.set_len(layout.total_len as u64)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let creator_pid = std::process::id() as i64;
        unsafe {
            let header_ptr = mmap.as_mut_ptr().add(layout.header_off) as *mut ScmHeader;
            ScmHeader::init_in_place(
                header_ptr,
                creator_pid,
                layout.max_workers as u32,
                layout.queue_max as u32,
                config.time_to_kill.as_secs(),
                config.session_timeout.as_secs(),
                config.priority_gap_secs,
                config.sql_log_max_size,
            );

            for i in 0..layout.max_workers {
                let slot_ptr = mmap.as_mut_ptr().add(layout.worker_slot_off(i)) as *mut WorkerSlot;
                WorkerSlot::init_in_place(slot_ptr, i as u32)?;
            }

            let queue_ptr = mmap.as_mut_ptr().add(layout.job_queue_off) as *mut JobQueue;
            JobQueue::init_in_place(queue_ptr, layout.queue_max as u32)?;

            let mailbox_ptr = mmap.as_mut_ptr().add(layout.mailbox_off) as *mut AdminMailbox;
            AdminMailbox::init_in_place(mailbox_ptr, layout.max_workers as u32)?;
        }

        Ok(ScmHandle {
            mmap,
            layout,
            role: ScmRole::Master,
        })
    }

    /// Attaches to an already-created SCM region. Fails with
    /// `SCM_UNAVAILABLE` if the region does not exist or fails the
    /// magic/version check.
    pub fn attach(broker_name: &str) -> Result<Self, BrokerError> {
        let path = scm_path(broker_name);
        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
            BrokerError::ScmUnavailable(format!(
                "no SCM region at '{}': {e}",
                path.display()
            ))
        })?;
        let len = file.metadata()?.len() as usize;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        if len < std::mem::size_of::<ScmHeader>() {
            return Err(BrokerError::ScmUnavailable(
                "SCM file is smaller than the header".into(),
            ));
        }
        let header = unsafe { &*(mmap.as_ptr() as *const ScmHeader) };
        if !header.is_valid() {
            return Err(BrokerError::ScmUnavailable(
                "SCM region failed the magic/version check".into(),
            ));
        }
        let max_workers = header.max_workers.load(std::sync::atomic::Ordering::Acquire) as usize;
        let queue_max = header.queue_max.load(std::sync::atomic::Ordering::Acquire) as usize;
        let layout = ScmLayout::compute(max_workers, queue_max);
        if len < layout.total_len {
            return Err(BrokerError::ScmUnavailable(
                "SCM file is smaller than its declared layout".into(),
            ));
        }

        Ok(ScmHandle {
            mmap,
            layout,
            role: ScmRole::Worker,
        })
    }

    pub fn role(&self) -> ScmRole {
        self.role
    }

    pub fn layout(&self) -> &ScmLayout {
        &self.layout
    }

    pub fn header(&self) -> &ScmHeader {
        unsafe { &*(self.mmap.as_ptr().add(self.layout.header_off) as *const ScmHeader) }
    }

    pub fn worker_slot(&self, index: usize) -> Result<&WorkerSlot, BrokerError> {
        if index >= self.layout.max_workers {
            return Err(BrokerError::internal(format!(
                "worker slot index {index} out of range (max_workers={})",
                self.layout.max_workers
            )));
        }
        let off = self.layout.worker_slot_off(index);
        Ok(unsafe { &*(self.mmap.as_ptr().add(off) as *const WorkerSlot) })
    }

    pub fn job_queue(&self) -> &JobQueue {
        unsafe { &*(self.mmap.as_ptr().add(self.layout.job_queue_off) as *const JobQueue) }
    }

    pub fn admin_mailbox(&self) -> &AdminMailbox {
        unsafe { &*(self.mmap.as_ptr().add(self.layout.mailbox_off) as *const AdminMailbox) }
    }

    /// Cheap, lock-free "is the job queue currently at capacity" check
    /// used by the acceptor's backpressure path (§4.4: "if the job queue
    /// is full, respond with BUSY and close") to avoid handing a client
    /// fd all the way to the dispatcher only to have it bounce back.
    /// Approximate under concurrent pushes/pops; the dispatcher remains
    /// the source of truth and may still reject with `QueueFull` itself.
    ///
    /// SAFETY: the job queue region is live for as long as this
    /// `ScmHandle` is; reading `len`/`capacity` never touches the
    /// variable-length slot storage this type's other `unsafe fn`s guard.
    pub fn queue_is_full(&self) -> bool {
        let q = self.job_queue();
        unsafe { JobQueue::is_full_at(q.len(), q.capacity_value()) }
    }

    /// Removes the backing file. Called by the master on a clean `OFF`
    /// shutdown; a crashed master simply leaves it for the next startup
    /// to detect via `create`'s `SCM_EXISTS`.
    pub fn unlink(broker_name: &str) -> std::io::Result<()> {
        std::fs::remove_file(scm_path(broker_name))
    }
}

/// Resolves the filesystem path backing a broker's SCM region, from
/// `BROKER_SHM_KEY` (or a name derived from the broker) under `/dev/shm`
/// when available, falling back to a temp directory otherwise.
pub fn scm_path(broker_name: &str) -> PathBuf {
    let key = crate::config::resolve_shm_key(broker_name);
    let dir: &Path = if Path::new("/dev/shm").is_dir() {
        Path::new("/dev/shm")
    } else {
        Path::new(std::env::temp_dir().to_str().map(|_| "").unwrap_or("/tmp"))
    };
    let dir = if dir.as_os_str().is_empty() {
        std::env::temp_dir()
    } else {
        dir.to_path_buf()
    };
    dir.join(format!("{key}.scm"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(name: &str) -> BrokerConfig {
        toml::from_str::<crate::config::BrokerDocument>(&format!(
            "[[broker]]\nname = \"{name}\"\nport = 30000\nmin_workers = 2\nmax_workers = 4\nqueue_max = 3\n"
        ))
        .unwrap()
        .brokers
        .remove(0)
    }

    #[test]
    fn create_then_attach_round_trips_layout() {
        let name = format!("scm_test_{}", std::process::id());
        let cfg = test_config(&name);
        let _ = ScmHandle::unlink(&name);
        let created = ScmHandle::create(&name, &cfg).unwrap();
        assert_eq!(created.role(), ScmRole::Master);
        assert!(created.header().is_valid());

        let attached = ScmHandle::attach(&name).unwrap();
        assert_eq!(attached.role(), ScmRole::Worker);
        assert_eq!(attached.layout().max_workers, cfg.max_workers);
        assert_eq!(attached.layout().queue_max, cfg.queue_max);

        ScmHandle::unlink(&name).unwrap();
    }

    #[test]
    fn create_twice_fails_with_scm_exists() {
        let name = format!("scm_test_dup_{}", std::process::id());
        let cfg = test_config(&name);
        let _ = ScmHandle::unlink(&name);
        let _first = ScmHandle::create(&name, &cfg).unwrap();
        let err = ScmHandle::create(&name, &cfg).unwrap_err();
        assert!(matches!(err, BrokerError::ScmExists(_)));
        ScmHandle::unlink(&name).unwrap();
    }

    #[test]
    fn worker_slot_claim_is_exclusive() {
        let name = format!("scm_test_claim_{}", std::process::id());
        let cfg = test_config(&name);
        let _ = ScmHandle::unlink(&name);
        let scm = ScmHandle::create(&name, &cfg).unwrap();
        let slot = scm.worker_slot(0).unwrap();
        slot.mark_spawned(1234);
        assert!(slot.try_claim(42, 1000));
        assert!(!slot.try_claim(43, 1001));
        assert_eq!(slot.session_id(), 42);
        ScmHandle::unlink(&name).unwrap();
    }

    #[test]
    fn job_queue_respects_capacity_and_fifo_within_priority() {
        let name = format!("scm_test_queue_{}", std::process::id());
        let cfg = test_config(&name);
        let _ = ScmHandle::unlink(&name);
        let scm = ScmHandle::create(&name, &cfg).unwrap();
        let q = scm.job_queue();

        let mk = |fd: i32, ms: u64| JobRecord {
            client_fd: fd,
            arrival_time_ms: ms,
            session_id_hint: 0,
            driver_info: [0u8; job_queue::DRIVER_INFO_LEN],
            priority: 0,
        };
        unsafe {
            q.push(mk(1, 100)).unwrap();
            q.push(mk(2, 200)).unwrap();
            q.push(mk(3, 300)).unwrap();
            assert!(matches!(q.push(mk(4, 400)), Err(BrokerError::QueueFull)));

            let first = q.pop_highest_priority().unwrap().unwrap();
            assert_eq!(first.client_fd, 1);
            let second = q.pop_highest_priority().unwrap().unwrap();
            assert_eq!(second.client_fd, 2);
        }
        ScmHandle::unlink(&name).unwrap();
        let _ = Duration::ZERO;
    }

    proptest::proptest! {
        #[test]
        fn same_priority_jobs_always_pop_in_arrival_order(
            arrivals in proptest::collection::hash_set(0u64..10_000, 1..=3)
                .prop_map(|s| s.into_iter().collect::<Vec<_>>())
        ) {
            let name = format!("scm_test_queue_prop_{}_{}", std::process::id(), arrivals.len());
            let cfg = test_config(&name);
            let _ = ScmHandle::unlink(&name);
            let scm = ScmHandle::create(&name, &cfg).unwrap();
            let q = scm.job_queue();

            let mut expected = arrivals.clone();
            expected.sort_unstable();

            unsafe {
                for (fd, &ms) in arrivals.iter().enumerate() {
                    q.push(JobRecord {
                        client_fd: fd as i32,
                        arrival_time_ms: ms,
                        session_id_hint: 0,
                        driver_info: [0u8; job_queue::DRIVER_INFO_LEN],
                        priority: 0,
                    })
                    .unwrap();
                }

                let mut popped = Vec::new();
                while let Some(job) = q.pop_highest_priority().unwrap() {
                    popped.push(job.arrival_time_ms);
                }
                proptest::prop_assert_eq!(popped, expected);
            }
            ScmHandle::unlink(&name).unwrap();
        }
    }
}
