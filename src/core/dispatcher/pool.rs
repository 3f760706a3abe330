// src/core/dispatcher/pool.rs

//! Worker process lifecycle: spawning a new CAS worker (§4.2, "spawned by
//! the dispatcher") by re-executing the current binary in `--cas-worker`
//! mode, and reaping/signaling already-spawned ones (§4.5's elasticity and
//! crash-recovery responsibilities).
//!
//! Each worker is handed its master-side fd-passing channel as a fixed,
//! pre-opened file descriptor (`WORKER_CHANNEL_FD`) rather than over an
//! inherited stdio stream, so the worker's own stdio stays free for logs.

use crate::config::BrokerConfig;
use crate::core::errors::BrokerError;
use nix::sys::signal::{self, Signal};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

/// The fd number a freshly spawned worker finds its fd-passing channel
/// on. Chosen past the usual stdio range to avoid collisions.
pub const WORKER_CHANNEL_FD: RawFd = 63;

/// A live worker process as seen from the master side.
pub struct WorkerHandle {
    pub index: usize,
    pub pid: Pid,
    pub channel: tokio::net::UnixStream,
}

/// Spawns worker `index` for `broker_name`, wiring up a fresh
/// fd-passing socketpair and re-executing the current binary with
/// `--cas-worker --broker <name> --slot <index>`.
pub fn spawn_worker(
    broker_name: &str,
    config: &BrokerConfig,
    index: usize,
) -> Result<WorkerHandle, BrokerError> {
    let (master_fd, worker_fd) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(|e| BrokerError::internal(format!("socketpair failed: {e}")))?;

    let exe = std::env::current_exe()
        .map_err(|e| BrokerError::internal(format!("current_exe failed: {e}")))?;

    let worker_raw_fd: RawFd = worker_fd.into_raw_fd();
    let mut command = Command::new(exe);
    command
        .arg("--cas-worker")
        .arg("--broker")
        .arg(broker_name)
        .arg("--slot")
        .arg(index.to_string())
        .arg("--worker-type")
        .arg(format!("{:?}", config.worker_type));

    // SAFETY: the closure only calls async-signal-safe libc functions
    // (dup2/close) and runs in the forked child before exec, per
    // `CommandExt::pre_exec`'s contract.
    unsafe {
        command.pre_exec(move || {
            if worker_raw_fd != WORKER_CHANNEL_FD {
                let rc = libc::dup2(worker_raw_fd, WORKER_CHANNEL_FD);
                if rc < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                libc::close(worker_raw_fd);
            }
            Ok(())
        });
    }

    let child: Child = command
        .spawn()
        .map_err(|e| BrokerError::internal(format!("failed to spawn worker {index}: {e}")))?;
    let pid = Pid::from_raw(child.id() as i32);

    // The parent's copy of worker_fd crossed into the child via dup2 in
    // pre_exec; close our reference to it now that the child owns its end.
    unsafe {
        libc::close(worker_raw_fd);
    }

    let channel = unsafe { channel_from_raw_fd(master_fd.into_raw_fd()) }
        .map_err(|e| BrokerError::internal(format!("failed to wrap master channel fd: {e}")))?;

    Ok(WorkerHandle {
        index,
        pid,
        channel,
    })
}

/// Sends `SIGTERM` to a worker, the graceful-stop signal used by
/// elasticity idle-kill and broker-level shutdown (§4.5, §4.8).
pub fn terminate_worker(pid: Pid) -> Result<(), BrokerError> {
    signal::kill(pid, Signal::SIGTERM)
        .map_err(|e| BrokerError::internal(format!("kill(SIGTERM, {pid}) failed: {e}")))
}

/// Sends `SIGKILL`, used when a worker fails to exit within
/// `shutdown_timeout` of a `SIGTERM`.
pub fn kill_worker(pid: Pid) -> Result<(), BrokerError> {
    signal::kill(pid, Signal::SIGKILL)
        .map_err(|e| BrokerError::internal(format!("kill(SIGKILL, {pid}) failed: {e}")))
}

/// Non-blocking check for whether `pid` has exited, used by the
/// elasticity scan to distinguish a crashed worker from a live one whose
/// SCM slot has simply gone stale.
pub fn has_exited(pid: Pid) -> bool {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(_) => true,
        // ECHILD: not our child (already reaped) or never existed; treat
        // as exited so the slot gets recycled rather than stuck forever.
        Err(_) => true,
    }
}

/// Wraps a raw, already-connected fd-passing channel fd into an owned
/// [`tokio::net::UnixStream`], used by the worker process after it reads
/// `WORKER_CHANNEL_FD` out of its own fd table.
///
/// # Safety
/// `fd` must be an open, connected `AF_UNIX SOCK_STREAM` descriptor this
/// process owns exclusively.
pub unsafe fn channel_from_raw_fd(fd: RawFd) -> std::io::Result<tokio::net::UnixStream> {
    let owned: OwnedFd = unsafe { OwnedFd::from_raw_fd(fd) };
    let std_stream = std::os::unix::net::UnixStream::from(owned);
    std_stream.set_nonblocking(true)?;
    tokio::net::UnixStream::from_std(std_stream)
}

pub fn raw_fd_of(stream: &tokio::net::UnixStream) -> RawFd {
    stream.as_raw_fd()
}
