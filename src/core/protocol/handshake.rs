// src/core/protocol/handshake.rs

//! The fixed-layout client handshake read once per accepted TCP connection,
//! before the fd is ever handed to a worker. See the external interfaces
//! section for the exact byte layout; this module only parses/encodes it,
//! it does not perform ACL or version policy — that is the acceptor's job.

use crate::core::errors::BrokerError;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

pub const MAGIC: &[u8; 5] = b"CUBRK";
pub const DRIVER_INFO_LEN: usize = 10;
const FIXED_HEADER_LEN: usize = 5 + 1 + 1 + 1 + 4 + DRIVER_INFO_LEN; // 22

/// The highest protocol major/minor version this broker understands;
/// the acceptor rejects any handshake declaring a higher major version
/// (§6: "reject if > server's").
pub const SUPPORTED_MAJOR_VERSION: u8 = 1;
pub const SUPPORTED_MINOR_VERSION: u8 = 0;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    Connect = 0,
    Ping = 1,
}

impl FunctionCode {
    fn from_u8(v: u8) -> Result<Self, BrokerError> {
        match v {
            0 => Ok(FunctionCode::Connect),
            1 => Ok(FunctionCode::Ping),
            other => Err(BrokerError::arg(format!("unknown function_code {other}"))),
        }
    }
}

bitflags! {
    /// Handshake flags, bit 0 requests `keep_connection` tracking for the
    /// session about to be created. Bit 1 marks this handshake as a
    /// sticky reconnect: the client already holds a `session_id` from an
    /// earlier connection and wants to resume on the same worker (§8
    /// scenario 4). This rewrite resolves spec.md §6's "assigned worker
    /// port (for direct reconnect)" by routing reconnects back through
    /// the broker's own accept loop rather than a dedicated per-worker
    /// listening port (see DESIGN.md); the client signals a reconnect
    /// with this flag and packs the 8-byte session id into the first 8
    /// bytes of `driver_info`, which spec.md already describes as
    /// "opaque, echoed to worker".
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandshakeFlags: u32 {
        const WANTS_KEEP_CONNECTION = 0b0000_0001;
        const RECONNECT = 0b0000_0010;
    }
}

/// A fully parsed client handshake.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub major_version: u8,
    pub minor_version: u8,
    pub function_code: FunctionCode,
    pub flags: HandshakeFlags,
    pub driver_info: [u8; DRIVER_INFO_LEN],
    pub user: String,
    pub password: String,
    pub db: String,
}

impl ClientHandshake {
    pub fn wants_keep_connection(&self) -> bool {
        self.flags.contains(HandshakeFlags::WANTS_KEEP_CONNECTION)
    }

    /// The session id this connection should be sticky-routed back to,
    /// or 0 for a fresh session. Non-zero only when `RECONNECT` is set,
    /// per this rewrite's resolution of sticky reconnects (see
    /// [`HandshakeFlags::RECONNECT`]).
    pub fn session_id_hint(&self) -> u64 {
        if !self.flags.contains(HandshakeFlags::RECONNECT) {
            return 0;
        }
        u64::from_be_bytes(self.driver_info[0..8].try_into().unwrap())
    }

    /// Parses a handshake out of `src`, leaving `src` untouched on
    /// `Ok(None)` (need more bytes) and advancing past the handshake on
    /// `Ok(Some(_))`.
    pub fn parse(src: &mut BytesMut) -> Result<Option<Self>, BrokerError> {
        if src.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }
        if &src[0..5] != MAGIC {
            return Err(BrokerError::arg("bad magic in client handshake"));
        }
        let major_version = src[5];
        let minor_version = src[6];
        let function_code = FunctionCode::from_u8(src[7])?;
        let flags_raw = u32::from_be_bytes(src[8..12].try_into().unwrap());
        let flags = HandshakeFlags::from_bits_truncate(flags_raw);
        let mut driver_info = [0u8; DRIVER_INFO_LEN];
        driver_info.copy_from_slice(&src[12..22]);

        // length-prefixed user/password/db strings follow the fixed header.
        let mut cursor = &src[FIXED_HEADER_LEN..];
        let user = match read_lp_string(&mut cursor)? {
            Some(s) => s,
            None => return Ok(None),
        };
        let password = match read_lp_string(&mut cursor)? {
            Some(s) => s,
            None => return Ok(None),
        };
        let db = match read_lp_string(&mut cursor)? {
            Some(s) => s,
            None => return Ok(None),
        };

        let consumed = src.len() - cursor.len();
        src.advance(consumed);

        Ok(Some(ClientHandshake {
            major_version,
            minor_version,
            function_code,
            flags,
            driver_info,
            user,
            password,
            db,
        }))
    }
}

fn read_lp_string(cursor: &mut &[u8]) -> Result<Option<String>, BrokerError> {
    if cursor.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes(cursor[0..4].try_into().unwrap()) as usize;
    if cursor.len() < 4 + len {
        return Ok(None);
    }
    let bytes = &cursor[4..4 + len];
    let s = String::from_utf8(bytes.to_vec())
        .map_err(|_| BrokerError::arg("handshake string is not valid UTF-8"))?;
    *cursor = &cursor[4 + len..];
    Ok(Some(s))
}

/// The broker's reply to a handshake: a 4-byte status, and on success an
/// 8-byte session id plus a 4-byte assigned worker port for direct
/// reconnect in keep-connection mode.
#[derive(Debug, Clone)]
pub enum HandshakeReply {
    Ok { session_id: u64, worker_port: u32 },
    Err(i32),
}

impl HandshakeReply {
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            HandshakeReply::Ok {
                session_id,
                worker_port,
            } => {
                dst.put_i32(0);
                dst.put_u64(*session_id);
                dst.put_u32(*worker_port);
            }
            HandshakeReply::Err(code) => {
                dst.put_i32(*code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_handshake(flags: u32, user: &str, password: &str, db: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_u8(FunctionCode::Connect as u8);
        buf.put_u32(flags);
        buf.put_slice(&[0u8; DRIVER_INFO_LEN]);
        for s in [user, password, db] {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        buf
    }

    #[test]
    fn parses_well_formed_handshake() {
        let mut buf = encode_handshake(1, "alice", "secret", "prod");
        let hs = ClientHandshake::parse(&mut buf).unwrap().unwrap();
        assert_eq!(hs.user, "alice");
        assert_eq!(hs.password, "secret");
        assert_eq!(hs.db, "prod");
        assert!(hs.wants_keep_connection());
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = BytesMut::from(&b"NOPE!"[..]);
        buf.resize(FIXED_HEADER_LEN, 0);
        assert!(ClientHandshake::parse(&mut buf).is_err());
    }

    #[test]
    fn waits_for_more_bytes_on_truncated_strings() {
        let mut full = encode_handshake(0, "bob", "pw", "db1");
        let mut truncated = full.split_to(full.len() - 2);
        assert!(ClientHandshake::parse(&mut truncated).unwrap().is_none());
    }

    #[test]
    fn reconnect_flag_recovers_session_id_from_driver_info() {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_u8(FunctionCode::Connect as u8);
        buf.put_u32(HandshakeFlags::RECONNECT.bits());
        buf.put_u64(424242);
        buf.put_u16(0); // pad driver_info to DRIVER_INFO_LEN (10 bytes)
        for s in ["alice", "secret", "prod"] {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        let hs = ClientHandshake::parse(&mut buf).unwrap().unwrap();
        assert_eq!(hs.session_id_hint(), 424242);
    }

    #[test]
    fn no_reconnect_flag_means_fresh_session() {
        let mut buf = encode_handshake(0, "bob", "pw", "db1");
        let hs = ClientHandshake::parse(&mut buf).unwrap().unwrap();
        assert_eq!(hs.session_id_hint(), 0);
    }
}
