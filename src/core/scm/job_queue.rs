// src/core/scm/job_queue.rs

//! The bounded, array-backed job queue of §3/§4.6: fixed-size slot
//! storage plus head/tail cursors, guarded by a single mutex (+ condvar
//! in the in-process dispatcher wrapper of `core::dispatcher`). This type
//! only implements the SCM-resident storage and ordering rules; the
//! dispatcher is the sole writer, per §5's exclusive-access policy.

use super::mutex::{LockOutcome, RobustMutex};
use crate::core::errors::BrokerError;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::warn;

pub const DRIVER_INFO_LEN: usize = 10;

/// One pending client connection awaiting a worker, per §3.
#[derive(Debug, Clone, Copy)]
pub struct JobRecord {
    pub client_fd: i32,
    pub arrival_time_ms: u64,
    pub session_id_hint: u64,
    pub driver_info: [u8; DRIVER_INFO_LEN],
    pub priority: u32,
}

#[repr(C)]
struct RawSlot {
    occupied: AtomicU32,
    client_fd: AtomicU32, // i32 stored as u32 bit pattern
    arrival_time_ms: AtomicU64,
    session_id_hint: AtomicU64,
    priority: AtomicU32,
    driver_info: [std::cell::UnsafeCell<u8>; DRIVER_INFO_LEN],
}

unsafe impl Sync for RawSlot {}
unsafe impl Send for RawSlot {}

/// Fixed-capacity circular buffer of [`JobRecord`]s. `capacity` is set
/// once at SCM creation from `queue_max` and never resized.
#[repr(C)]
pub struct JobQueue {
    lock: RobustMutex,
    capacity: AtomicU32,
    head: AtomicU32,
    len: AtomicU32,
    // variable-length tail: `capacity` RawSlot entries follow this
    // struct in memory; accessed via `slot_ptr`, never through a Rust
    // slice (the true length is a runtime value).
}

impl JobQueue {
    pub const HEADER_SIZE: usize = std::mem::size_of::<JobQueue>();
    pub const SLOT_SIZE: usize = std::mem::size_of::<RawSlot>();

    pub fn storage_len(capacity: usize) -> usize {
        Self::HEADER_SIZE + capacity * Self::SLOT_SIZE
    }

    /// # Safety
    /// `this` must point at writable memory of at least
    /// `storage_len(capacity)` bytes.
    pub unsafe fn init_in_place(this: *mut Self, capacity: u32) -> Result<(), BrokerError> {
        unsafe {
            let lock_ptr = std::ptr::addr_of_mut!((*this).lock);
            RobustMutex::init_in_place(lock_ptr)?;
            std::ptr::addr_of_mut!((*this).capacity).write(AtomicU32::new(capacity));
            std::ptr::addr_of_mut!((*this).head).write(AtomicU32::new(0));
            std::ptr::addr_of_mut!((*this).len).write(AtomicU32::new(0));

            let base = (this as *mut u8).add(Self::HEADER_SIZE) as *mut RawSlot;
            for i in 0..capacity as usize {
                let slot = base.add(i);
                std::ptr::addr_of_mut!((*slot).occupied).write(AtomicU32::new(0));
                std::ptr::addr_of_mut!((*slot).client_fd).write(AtomicU32::new(0));
                std::ptr::addr_of_mut!((*slot).arrival_time_ms).write(AtomicU64::new(0));
                std::ptr::addr_of_mut!((*slot).session_id_hint).write(AtomicU64::new(0));
                std::ptr::addr_of_mut!((*slot).priority).write(AtomicU32::new(0));
                for b in 0..DRIVER_INFO_LEN {
                    (*std::ptr::addr_of_mut!((*slot).driver_info[b])).get().write(0);
                }
            }
            Ok(())
        }
    }

    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed) as usize
    }

    unsafe fn slot_ptr(&self, physical_index: usize) -> *const RawSlot {
        unsafe {
            let base = (self as *const Self as *const u8).add(Self::HEADER_SIZE) as *const RawSlot;
            base.add(physical_index)
        }
    }

    /// §5: "if a worker dies holding the...mutex, the dispatcher
    /// re-initializes that slot... before spawning a replacement." The
    /// queue has no per-job owner to re-initialize individually, so a
    /// `Recovered` outcome drops every queued job and resets to empty —
    /// the prior holder died mid-mutation and `head`/`len`/the occupied
    /// flags can no longer be trusted to agree with each other.
    fn recover_if_needed(&self, outcome: LockOutcome) {
        if outcome == LockOutcome::Recovered {
            warn!("job queue mutex recovered from a dead holder; discarding queued jobs");
            let cap = self.capacity();
            for physical in 0..cap {
                // SAFETY: `physical` is within `cap`, and the caller of
                // `recover_if_needed` already holds the lock.
                let slot = unsafe { &*self.slot_ptr(physical) };
                slot.occupied.store(0, Ordering::Relaxed);
            }
            self.head.store(0, Ordering::Release);
            self.len.store(0, Ordering::Release);
        }
    }

    /// Pushes a job at the logical tail. Caller must hold the dispatcher's
    /// exclusive access discipline (§4.5/§5: only the dispatcher mutates
    /// the queue).
    ///
    /// # Safety
    /// Backing memory must be live and sized per `storage_len`.
    pub unsafe fn push(&self, job: JobRecord) -> Result<(), BrokerError> {
        unsafe {
            let outcome = self.lock.lock()?;
            self.recover_if_needed(outcome);
            let cap = self.capacity();
            let len = self.len.load(Ordering::Acquire) as usize;
            if len >= cap {
                self.lock.unlock()?;
                return Err(BrokerError::QueueFull);
            }
            let head = self.head.load(Ordering::Acquire) as usize;
            let physical = (head + len) % cap;
            let slot = &*self.slot_ptr(physical);
            slot.client_fd.store(job.client_fd as u32, Ordering::Relaxed);
            slot.arrival_time_ms.store(job.arrival_time_ms, Ordering::Relaxed);
            slot.session_id_hint.store(job.session_id_hint, Ordering::Relaxed);
            slot.priority.store(job.priority, Ordering::Relaxed);
            for i in 0..DRIVER_INFO_LEN {
                *slot.driver_info[i].get() = job.driver_info[i];
            }
            slot.occupied.store(1, Ordering::Release);
            self.len.store((len + 1) as u32, Ordering::Release);
            self.lock.unlock()?;
            Ok(())
        }
    }

    /// Pops the highest-priority job, ties broken by FIFO (§4.5/§4.6):
    /// scans the occupied range once for the maximum priority, then
    /// removes the earliest-arrived job at that priority, preserving
    /// push order for everything left in the bucket.
    ///
    /// # Safety
    /// Backing memory must be live and sized per `storage_len`.
    pub unsafe fn pop_highest_priority(&self) -> Result<Option<JobRecord>, BrokerError> {
        unsafe {
            let outcome = self.lock.lock()?;
            self.recover_if_needed(outcome);
            let cap = self.capacity();
            let len = self.len.load(Ordering::Acquire) as usize;
            if len == 0 {
                self.lock.unlock()?;
                return Ok(None);
            }
            let head = self.head.load(Ordering::Acquire) as usize;

            // Find the logical offset of the best candidate: highest
            // priority, then lowest arrival_time_ms (earliest), then
            // lowest logical offset as a final FIFO tiebreak.
            let mut best_offset = 0usize;
            let mut best_priority = 0u32;
            let mut best_arrival = u64::MAX;
            for offset in 0..len {
                let physical = (head + offset) % cap;
                let slot = &*self.slot_ptr(physical);
                let priority = slot.priority.load(Ordering::Relaxed);
                let arrival = slot.arrival_time_ms.load(Ordering::Relaxed);
                let better = priority > best_priority
                    || (priority == best_priority && arrival < best_arrival);
                if offset == 0 || better {
                    best_offset = offset;
                    best_priority = priority;
                    best_arrival = arrival;
                }
            }

            let physical = (head + best_offset) % cap;
            let slot = &*self.slot_ptr(physical);
            let job = JobRecord {
                client_fd: slot.client_fd.load(Ordering::Relaxed) as i32,
                arrival_time_ms: slot.arrival_time_ms.load(Ordering::Relaxed),
                session_id_hint: slot.session_id_hint.load(Ordering::Relaxed),
                driver_info: {
                    let mut d = [0u8; DRIVER_INFO_LEN];
                    for i in 0..DRIVER_INFO_LEN {
                        d[i] = *slot.driver_info[i].get();
                    }
                    d
                },
                priority: best_priority,
            };
            slot.occupied.store(0, Ordering::Release);

            // Compact: shift everything after `best_offset` one slot
            // toward head, preserving relative (FIFO) order, then shrink.
            for offset in best_offset..len.saturating_sub(1) {
                let dst_physical = (head + offset) % cap;
                let src_physical = (head + offset + 1) % cap;
                let dst = &*self.slot_ptr(dst_physical);
                let src = &*self.slot_ptr(src_physical);
                dst.client_fd.store(src.client_fd.load(Ordering::Relaxed), Ordering::Relaxed);
                dst.arrival_time_ms
                    .store(src.arrival_time_ms.load(Ordering::Relaxed), Ordering::Relaxed);
                dst.session_id_hint
                    .store(src.session_id_hint.load(Ordering::Relaxed), Ordering::Relaxed);
                dst.priority.store(src.priority.load(Ordering::Relaxed), Ordering::Relaxed);
                for i in 0..DRIVER_INFO_LEN {
                    *dst.driver_info[i].get() = *src.driver_info[i].get();
                }
            }
            self.len.store((len - 1) as u32, Ordering::Release);

            self.lock.unlock()?;
            Ok(Some(job))
        }
    }

    /// Increments the priority of every queued job by one, the aging
    /// mechanism of §4.5: "every `priority_gap` seconds, increment each
    /// queued job's priority." Aging never reorders within a bucket
    /// since all priorities shift uniformly.
    ///
    /// # Safety
    /// Backing memory must be live and sized per `storage_len`.
    pub unsafe fn age_all(&self) -> Result<(), BrokerError> {
        unsafe {
            let outcome = self.lock.lock()?;
            self.recover_if_needed(outcome);
            let cap = self.capacity();
            let head = self.head.load(Ordering::Acquire) as usize;
            let len = self.len.load(Ordering::Acquire) as usize;
            for offset in 0..len {
                let physical = (head + offset) % cap;
                let slot = &*self.slot_ptr(physical);
                slot.priority.fetch_add(1, Ordering::Relaxed);
            }
            self.lock.unlock()?;
            Ok(())
        }
    }

    /// # Safety
    /// Backing memory must be live and sized per `storage_len`.
    pub unsafe fn len(&self) -> u32 {
        self.len.load(Ordering::Acquire)
    }

    /// The fixed capacity this queue was created with (`queue_max`).
    ///
    /// # Safety
    /// Backing memory must be live and sized per `storage_len`.
    pub unsafe fn capacity_value(&self) -> u32 {
        self.capacity()
            .try_into()
            .expect("capacity was constructed from a u32")
    }

    pub fn is_full_at(len: u32, capacity: u32) -> bool {
        len >= capacity
    }
}
