// src/core/scm/mailbox.rs

//! The admin command mailbox of §4.1 item 4 / §4.8: one `{opcode, arg,
//! seq}` slot per worker plus one global mailbox, written by `brokerctl`
//! and observed by the dispatcher once per control tick. Responses are
//! written back with the same sequence number so the admin tool can
//! correlate request and reply.

use super::mutex::{LockOutcome, RobustMutex};
use crate::core::errors::BrokerError;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use tracing::warn;

pub const ARG_LEN: usize = 128;

/// The command vocabulary of §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AdminOpcode {
    None = 0,
    BrokerOn = 1,
    BrokerOff = 2,
    Suspend = 3,
    Resume = 4,
    Add = 5,
    Drop = 6,
    Restart = 7,
    ConfChange = 8,
    ResetLog = 9,
}

impl AdminOpcode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => AdminOpcode::None,
            1 => AdminOpcode::BrokerOn,
            2 => AdminOpcode::BrokerOff,
            3 => AdminOpcode::Suspend,
            4 => AdminOpcode::Resume,
            5 => AdminOpcode::Add,
            6 => AdminOpcode::Drop,
            7 => AdminOpcode::Restart,
            8 => AdminOpcode::ConfChange,
            9 => AdminOpcode::ResetLog,
            _ => return None,
        })
    }
}

/// A fully decoded command read out of a [`MailboxSlot`].
#[derive(Debug, Clone)]
pub struct AdminCommand {
    pub seq: u64,
    pub opcode: AdminOpcode,
    pub arg: String,
}

/// A fully decoded response a [`MailboxSlot`] carries back.
#[derive(Debug, Clone)]
pub struct AdminResponse {
    pub seq: u64,
    pub ok: bool,
    pub message: String,
}

/// One mailbox slot: holds at most one outstanding command/response pair,
/// identified by `seq`. `brokerctl` polls until it observes its own `seq`
/// echoed back in the response half.
#[repr(C)]
pub struct MailboxSlot {
    lock: RobustMutex,
    cmd_seq: AtomicU64,
    cmd_opcode: AtomicU32,
    cmd_arg_len: AtomicU32,
    cmd_arg: [std::cell::UnsafeCell<u8>; ARG_LEN],
    resp_seq: AtomicU64,
    resp_ok: AtomicU32,
    resp_code: AtomicI32,
    resp_msg_len: AtomicU32,
    resp_msg: [std::cell::UnsafeCell<u8>; ARG_LEN],
}

unsafe impl Sync for MailboxSlot {}
unsafe impl Send for MailboxSlot {}

impl MailboxSlot {
    pub const SIZE: usize = std::mem::size_of::<MailboxSlot>();

    /// §5: a `Recovered` outcome means whoever held the lock (`brokerctl`
    /// submitting a command, or the dispatcher writing a response) died
    /// mid-write. The command/response pair the slot is currently
    /// carrying can no longer be trusted to be a matched, fully-written
    /// whole, so it is discarded back to "nothing pending" rather than
    /// risking a caller reading a torn opcode/arg or message.
    fn recover_if_needed(&self, outcome: LockOutcome) {
        if outcome == LockOutcome::Recovered {
            warn!("admin mailbox slot mutex recovered from a dead holder; discarding pending command/response");
            self.cmd_seq.store(0, Ordering::Relaxed);
            self.cmd_opcode.store(AdminOpcode::None as u32, Ordering::Relaxed);
            self.cmd_arg_len.store(0, Ordering::Relaxed);
            self.resp_seq.store(0, Ordering::Relaxed);
            self.resp_ok.store(0, Ordering::Relaxed);
            self.resp_msg_len.store(0, Ordering::Relaxed);
        }
    }

    /// # Safety
    /// `this` must point at writable, unsinitialized memory sized for
    /// `MailboxSlot`.
    pub unsafe fn init_in_place(this: *mut Self) -> Result<(), BrokerError> {
        unsafe {
            let lock_ptr = std::ptr::addr_of_mut!((*this).lock);
            RobustMutex::init_in_place(lock_ptr)?;
            std::ptr::addr_of_mut!((*this).cmd_seq).write(AtomicU64::new(0));
            std::ptr::addr_of_mut!((*this).cmd_opcode).write(AtomicU32::new(AdminOpcode::None as u32));
            std::ptr::addr_of_mut!((*this).cmd_arg_len).write(AtomicU32::new(0));
            std::ptr::addr_of_mut!((*this).resp_seq).write(AtomicU64::new(0));
            std::ptr::addr_of_mut!((*this).resp_ok).write(AtomicU32::new(0));
            std::ptr::addr_of_mut!((*this).resp_code).write(AtomicI32::new(0));
            std::ptr::addr_of_mut!((*this).resp_msg_len).write(AtomicU32::new(0));
            for i in 0..ARG_LEN {
                (*std::ptr::addr_of_mut!((*this).cmd_arg[i])).get().write(0);
                (*std::ptr::addr_of_mut!((*this).resp_msg[i])).get().write(0);
            }
            Ok(())
        }
    }

    /// Writes a new command into the slot. Called by `brokerctl` with a
    /// freshly allocated, monotonically increasing `seq`.
    ///
    /// # Safety
    /// Backing memory must be live.
    pub unsafe fn submit(&self, seq: u64, opcode: AdminOpcode, arg: &str) -> Result<(), BrokerError> {
        unsafe {
            let outcome = self.lock.lock()?;
            self.recover_if_needed(outcome);
            let bytes = arg.as_bytes();
            let n = bytes.len().min(ARG_LEN);
            for i in 0..n {
                *self.cmd_arg[i].get() = bytes[i];
            }
            self.cmd_arg_len.store(n as u32, Ordering::Relaxed);
            self.cmd_opcode.store(opcode as u32, Ordering::Relaxed);
            self.cmd_seq.store(seq, Ordering::Release);
            self.lock.unlock()?;
            Ok(())
        }
    }

    /// Reads the current command if its `seq` is newer than
    /// `last_observed_seq`, per §5's "admin commands are applied in
    /// sequence-number order".
    ///
    /// # Safety
    /// Backing memory must be live.
    pub unsafe fn poll_new_command(&self, last_observed_seq: u64) -> Result<Option<AdminCommand>, BrokerError> {
        unsafe {
            let outcome = self.lock.lock()?;
            self.recover_if_needed(outcome);
            let seq = self.cmd_seq.load(Ordering::Acquire);
            if seq == 0 || seq <= last_observed_seq {
                self.lock.unlock()?;
                return Ok(None);
            }
            let opcode = AdminOpcode::from_u32(self.cmd_opcode.load(Ordering::Relaxed))
                .unwrap_or(AdminOpcode::None);
            let len = self.cmd_arg_len.load(Ordering::Relaxed) as usize;
            let mut buf = Vec::with_capacity(len);
            for i in 0..len {
                buf.push(*self.cmd_arg[i].get());
            }
            self.lock.unlock()?;
            Ok(Some(AdminCommand {
                seq,
                opcode,
                arg: String::from_utf8_lossy(&buf).into_owned(),
            }))
        }
    }

    /// Writes the dispatcher's response for `seq`, per §4.8: "Responses
    /// are written back into the mailbox with the same sequence number."
    ///
    /// # Safety
    /// Backing memory must be live.
    pub unsafe fn respond(&self, seq: u64, ok: bool, message: &str) -> Result<(), BrokerError> {
        unsafe {
            let outcome = self.lock.lock()?;
            self.recover_if_needed(outcome);
            let bytes = message.as_bytes();
            let n = bytes.len().min(ARG_LEN);
            for i in 0..n {
                *self.resp_msg[i].get() = bytes[i];
            }
            self.resp_msg_len.store(n as u32, Ordering::Relaxed);
            self.resp_ok.store(ok as u32, Ordering::Relaxed);
            self.resp_seq.store(seq, Ordering::Release);
            self.lock.unlock()?;
            Ok(())
        }
    }

    /// Polls for a response matching `seq`. Used by `brokerctl` after
    /// `submit`.
    ///
    /// # Safety
    /// Backing memory must be live.
    pub unsafe fn poll_response(&self, seq: u64) -> Result<Option<AdminResponse>, BrokerError> {
        unsafe {
            let outcome = self.lock.lock()?;
            self.recover_if_needed(outcome);
            let resp_seq = self.resp_seq.load(Ordering::Acquire);
            if resp_seq != seq {
                self.lock.unlock()?;
                return Ok(None);
            }
            let ok = self.resp_ok.load(Ordering::Relaxed) != 0;
            let len = self.resp_msg_len.load(Ordering::Relaxed) as usize;
            let mut buf = Vec::with_capacity(len);
            for i in 0..len {
                buf.push(*self.resp_msg[i].get());
            }
            self.lock.unlock()?;
            Ok(Some(AdminResponse {
                seq,
                ok,
                message: String::from_utf8_lossy(&buf).into_owned(),
            }))
        }
    }
}

/// The full admin mailbox area: one slot per worker plus one global slot
/// (index `max_workers`), per §4.1 item 4.
///
/// `align(8)` pads `HEADER_SIZE` up to a multiple of 8 so the
/// `MailboxSlot` array immediately after it lands on an 8-byte boundary
/// (every `MailboxSlot` starts with a `RobustMutex`/`pthread_mutex_t` and
/// holds `AtomicU64`s, both of which require 8-byte alignment); without
/// this, a 4-byte header leaves every slot misaligned.
#[repr(C, align(8))]
pub struct AdminMailbox {
    slot_count: AtomicU32,
}

impl AdminMailbox {
    pub const HEADER_SIZE: usize = std::mem::size_of::<AdminMailbox>();

    pub fn storage_len(max_workers: usize) -> usize {
        Self::HEADER_SIZE + (max_workers + 1) * MailboxSlot::SIZE
    }

    /// # Safety
    /// `this` must point at writable memory of at least
    /// `storage_len(max_workers)` bytes.
    pub unsafe fn init_in_place(this: *mut Self, max_workers: u32) -> Result<(), BrokerError> {
        unsafe {
            std::ptr::addr_of_mut!((*this).slot_count).write(AtomicU32::new(max_workers + 1));
            let base = (this as *mut u8).add(Self::HEADER_SIZE) as *mut MailboxSlot;
            for i in 0..=max_workers as usize {
                MailboxSlot::init_in_place(base.add(i))?;
            }
            Ok(())
        }
    }

    fn slot_count(&self) -> usize {
        self.slot_count.load(Ordering::Relaxed) as usize
    }

    /// The global mailbox slot (not tied to any one worker), used for
    /// broker-level commands like `broker_on`/`broker_off`/`add`/`drop`.
    pub fn global(&self) -> &MailboxSlot {
        // SAFETY: index `slot_count - 1` is always in range by construction.
        unsafe { &*self.slot_ptr(self.slot_count() - 1) }
    }

    pub fn worker(&self, index: usize) -> Result<&MailboxSlot, BrokerError> {
        if index + 1 >= self.slot_count() {
            return Err(BrokerError::internal(format!(
                "admin mailbox worker index {index} out of range"
            )));
        }
        // SAFETY: bounds-checked above.
        Ok(unsafe { &*self.slot_ptr(index) })
    }

    unsafe fn slot_ptr(&self, index: usize) -> *const MailboxSlot {
        unsafe {
            let base = (self as *const Self as *const u8).add(Self::HEADER_SIZE) as *const MailboxSlot;
            base.add(index)
        }
    }
}
