// src/core/protocol/fd_sideband.rs

//! The FD-passing transport: the master hands an accepted client socket to
//! a worker over a UNIX-domain stream socket, carrying a small sideband
//! struct alongside the `SCM_RIGHTS` ancillary data. Grounded in the
//! original broker's `broker_send_fd.c`/`broker_recv_fd.c`, which pass
//! exactly one fd per `sendmsg`/`recvmsg` call with the sideband struct as
//! the regular (non-ancillary) payload.

use crate::core::errors::BrokerError;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::Interest;

pub const DRIVER_INFO_LEN: usize = 10;
const SIDEBAND_LEN: usize = 4 + DRIVER_INFO_LEN;

/// Fixed sideband struct sent alongside a passed fd: `{ request_id: i32,
/// driver_info: [u8; 10] }`, per the external interfaces section.
#[derive(Debug, Clone, Copy)]
pub struct FdSideband {
    pub request_id: i32,
    pub driver_info: [u8; DRIVER_INFO_LEN],
}

impl FdSideband {
    fn to_bytes(self) -> [u8; SIDEBAND_LEN] {
        let mut buf = [0u8; SIDEBAND_LEN];
        buf[0..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..].copy_from_slice(&self.driver_info);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, BrokerError> {
        if buf.len() < SIDEBAND_LEN {
            return Err(BrokerError::TransportFail(format!(
                "short sideband read: got {} of {SIDEBAND_LEN} bytes",
                buf.len()
            )));
        }
        let request_id = i32::from_be_bytes(buf[0..4].try_into().unwrap());
        let mut driver_info = [0u8; DRIVER_INFO_LEN];
        driver_info.copy_from_slice(&buf[4..SIDEBAND_LEN]);
        Ok(FdSideband {
            request_id,
            driver_info,
        })
    }
}

/// Sends `fd` plus `sideband` over `channel`. The caller must not close
/// `fd` until this returns `Ok`; on return the receiver owns the
/// descriptor (the original is left open here since ownership transfer is
/// advisory at the OS level — callers drop their local fd after success).
pub fn send_fd(
    channel: BorrowedFd<'_>,
    fd: BorrowedFd<'_>,
    sideband: FdSideband,
) -> Result<(), BrokerError> {
    let bytes = sideband.to_bytes();
    let iov = [IoSlice::new(&bytes)];
    let raw_fds = [fd.as_raw_fd_value()];
    let cmsg = [ControlMessage::ScmRights(&raw_fds)];

    let sent = sendmsg::<()>(channel.as_raw_fd_value(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| BrokerError::TransportFail(format!("sendmsg failed: {e}")))?;

    if sent < SIDEBAND_LEN {
        return Err(BrokerError::TransportFail(
            "sendmsg wrote fewer bytes than the sideband struct".into(),
        ));
    }
    Ok(())
}

/// Receives one fd plus its sideband struct from `channel`, making exactly
/// one `recvmsg` call. Returns `io::ErrorKind::WouldBlock` unchanged (the
/// channel is kept non-blocking end to end) so callers can drive the
/// retry themselves: [`recv_fd`] treats it as fatal, [`recv_fd_async`]
/// awaits readiness and retries.
fn recv_fd_once(channel: BorrowedFd<'_>) -> std::io::Result<(OwnedFd, FdSideband)> {
    let mut bytes = [0u8; SIDEBAND_LEN];
    let mut iov = [IoSliceMut::new(&mut bytes)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<()>(
        channel.as_raw_fd_value(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )
    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

    if msg.bytes < SIDEBAND_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("short sideband read: got {} of {SIDEBAND_LEN} bytes", msg.bytes),
        ));
    }

    let mut received_fd: Option<RawFd> = None;
    for cmsg in msg.cmsgs().map_err(|e| {
        std::io::Error::other(format!("malformed ancillary data: {e}"))
    })? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            received_fd = fds.first().copied();
        }
    }

    let raw_fd = received_fd.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "no SCM_RIGHTS ancillary data in sideband message",
        )
    })?;

    let sideband = FdSideband::from_bytes(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    // SAFETY: `raw_fd` was just handed to us by the kernel via SCM_RIGHTS;
    // we are its sole owner from this point on.
    let owned = unsafe { OwnedFd::from_raw_fd(raw_fd) };
    Ok((owned, sideband))
}

/// Receives one fd plus its sideband struct from a blocking (or already
/// known-ready) `channel`. A short read or absent ancillary data is fatal
/// to the worker per the transport's failure semantics.
pub fn recv_fd(channel: BorrowedFd<'_>) -> Result<(OwnedFd, FdSideband), BrokerError> {
    recv_fd_once(channel).map_err(|e| BrokerError::TransportFail(format!("recvmsg failed: {e}")))
}

/// Receives one fd plus its sideband struct from a non-blocking
/// `tokio::net::UnixStream`, awaiting readability before each attempt.
/// `channel` is set non-blocking by [`crate::core::dispatcher::pool::
/// channel_from_raw_fd`] before being adopted into the tokio reactor, so a
/// bare synchronous `recvmsg` call (as `recv_fd` makes) would return
/// `EAGAIN` immediately whenever no fd is pending yet rather than waiting
/// for one — this is the awaited counterpart workers must use instead.
pub async fn recv_fd_async(
    channel: &tokio::net::UnixStream,
) -> Result<(OwnedFd, FdSideband), BrokerError> {
    loop {
        channel.readable().await.map_err(|e| {
            BrokerError::TransportFail(format!("waiting for channel readability: {e}"))
        })?;
        match channel.try_io(Interest::READABLE, || recv_fd_once(channel.as_fd())) {
            Ok(result) => return Ok(result),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(BrokerError::TransportFail(format!("recvmsg failed: {e}"))),
        }
    }
}

trait AsRawFdValue {
    fn as_raw_fd_value(&self) -> RawFd;
}

impl AsRawFdValue for BorrowedFd<'_> {
    fn as_raw_fd_value(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
    use std::os::fd::AsFd as _;

    #[test]
    fn round_trips_fd_and_sideband() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();

        let (dummy_r, dummy_w) = nix::unistd::pipe().unwrap();
        drop(dummy_w);

        let sideband = FdSideband {
            request_id: 42,
            driver_info: [7u8; DRIVER_INFO_LEN],
        };
        send_fd(a.as_fd(), dummy_r.as_fd(), sideband).unwrap();
        drop(dummy_r);

        let (received, got_sideband) = recv_fd(b.as_fd()).unwrap();
        assert_eq!(got_sideband.request_id, 42);
        assert_eq!(got_sideband.driver_info, [7u8; DRIVER_INFO_LEN]);
        drop(received);
    }

    /// Exercises the non-blocking path workers actually use: the channel
    /// is set non-blocking up front (as `channel_from_raw_fd` does), so a
    /// naive `recv_fd` would see `EAGAIN` and fail immediately. This waits
    /// past an initial empty poll for the fd to arrive on another task.
    #[tokio::test]
    async fn recv_fd_async_waits_for_a_fd_sent_later() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .unwrap();

        let receiver = tokio::net::UnixStream::from_std(std::os::unix::net::UnixStream::from(b)).unwrap();

        let sender = tokio::task::spawn_blocking(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            let (dummy_r, dummy_w) = nix::unistd::pipe().unwrap();
            drop(dummy_w);
            let sideband = FdSideband {
                request_id: 7,
                driver_info: [9u8; DRIVER_INFO_LEN],
            };
            send_fd(a.as_fd(), dummy_r.as_fd(), sideband).unwrap();
            drop(dummy_r);
        });

        let (received, got_sideband) = recv_fd_async(&receiver).await.unwrap();
        assert_eq!(got_sideband.request_id, 7);
        assert_eq!(got_sideband.driver_info, [9u8; DRIVER_INFO_LEN]);
        drop(received);
        sender.await.unwrap();
    }
}
