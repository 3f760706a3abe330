// src/core/scm/mutex.rs

//! A process-shared, robust mutex: the synchronization primitive behind
//! every SCM worker slot, the job queue, and the admin mailbox (§4.1, §5).
//! Backed by `pthread_mutex_t` with `PTHREAD_PROCESS_SHARED` and
//! `PTHREAD_MUTEX_ROBUST` so that a worker dying while holding a slot's
//! mutex is observable (`EOWNERDEAD`) rather than deadlocking the
//! dispatcher forever.

use crate::core::errors::BrokerError;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

/// Raw, `repr(C)` wrapper around `pthread_mutex_t`. Must live inside the
/// mapped SCM region so its address is identical in every attached
/// process; never move or copy a value of this type once initialized.
#[repr(C)]
pub struct RobustMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: the whole point of this type is cross-thread/cross-process
// shared access guarded by the pthread mutex itself.
unsafe impl Sync for RobustMutex {}
unsafe impl Send for RobustMutex {}

/// Outcome of acquiring a [`RobustMutex`]. `Recovered` means the previous
/// holder died while the lock was held; the caller is responsible for
/// re-validating the slot's contents before trusting them, per the
/// robustness policy of §5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Clean,
    Recovered,
}

impl RobustMutex {
    /// Initializes the mutex in place. Must be called exactly once, by
    /// whichever process creates the SCM region.
    ///
    /// # Safety
    /// `self` must be the address the mutex will be accessed at for its
    /// entire lifetime (i.e. inside the mmap'd region), and must not be
    /// moved afterward.
    pub unsafe fn init_in_place(this: *mut Self) -> Result<(), BrokerError> {
        unsafe {
            let mutex_ptr = (*this).inner.get();
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let mut attr = attr.assume_init();
            check(libc::pthread_mutexattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            check(libc::pthread_mutexattr_setrobust(
                &mut attr,
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            let rc = libc::pthread_mutex_init(mutex_ptr, &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            check(rc)?;
            Ok(())
        }
    }

    /// Locks the mutex, recovering automatically from a dead prior owner.
    ///
    /// # Safety
    /// `self` must have been initialized with [`init_in_place`] and must
    /// still be backed by live, mapped memory.
    pub unsafe fn lock(&self) -> Result<LockOutcome, BrokerError> {
        unsafe {
            let rc = libc::pthread_mutex_lock(self.inner.get());
            if rc == 0 {
                return Ok(LockOutcome::Clean);
            }
            if rc == libc::EOWNERDEAD {
                // The previous holder died with the lock held. Mark the
                // mutex consistent so future lock/unlock calls behave
                // normally; the caller must restore slot invariants.
                check(libc::pthread_mutex_consistent(self.inner.get()))?;
                return Ok(LockOutcome::Recovered);
            }
            Err(BrokerError::internal(format!(
                "pthread_mutex_lock failed: errno {rc}"
            )))
        }
    }

    /// # Safety
    /// Must only be called by the current holder of the lock.
    pub unsafe fn unlock(&self) -> Result<(), BrokerError> {
        unsafe { check(libc::pthread_mutex_unlock(self.inner.get())) }
    }
}

fn check(rc: i32) -> Result<(), BrokerError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(BrokerError::internal(format!("pthread call failed: errno {rc}")))
    }
}

/// RAII guard returned by locking helpers elsewhere in `scm`; dropping it
/// unlocks. Kept separate from `RobustMutex` itself since slots wrap the
/// mutex alongside plain data accessed only while held.
pub struct RobustMutexGuard<'a> {
    mutex: &'a RobustMutex,
    pub outcome: LockOutcome,
}

impl<'a> RobustMutexGuard<'a> {
    /// # Safety
    /// Same preconditions as [`RobustMutex::lock`].
    pub unsafe fn acquire(mutex: &'a RobustMutex) -> Result<Self, BrokerError> {
        let outcome = unsafe { mutex.lock()? };
        Ok(RobustMutexGuard { mutex, outcome })
    }
}

impl Drop for RobustMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: we are the holder; `unlock` is always valid to call here.
        let _ = unsafe { self.mutex.unlock() };
    }
}
