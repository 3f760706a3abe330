// src/core/protocol/rpc_frame.rs

//! The per-worker RPC framing used once a client fd has been handed to a
//! CAS worker: `{ u32 length_be, u8 opcode, payload[length-1] }`. `length`
//! counts the opcode byte plus the payload, matching the original broker's
//! big-endian `net_write_int`/`net_read_int` wire convention.

use crate::core::errors::BrokerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Guards against a hostile or corrupt peer declaring an enormous frame
/// length; no legitimate CAS RPC payload approaches this.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// CAS function codes carried in the opcode byte. Payload encoding is
/// opcode-specific and is handled above this codec.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Prepare = 1,
    Execute = 2,
    Fetch = 3,
    Cursor = 4,
    EndTran = 5,
    GetDbVersion = 6,
    SchemaInfo = 7,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Result<Self, BrokerError> {
        match v {
            1 => Ok(Opcode::Prepare),
            2 => Ok(Opcode::Execute),
            3 => Ok(Opcode::Fetch),
            4 => Ok(Opcode::Cursor),
            5 => Ok(Opcode::EndTran),
            6 => Ok(Opcode::GetDbVersion),
            7 => Ok(Opcode::SchemaInfo),
            other => Err(BrokerError::arg(format!("unknown RPC opcode {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcFrame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
pub struct RpcFrameCodec;

impl Decoder for RpcFrameCodec {
    type Item = RpcFrame;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes(src[0..4].try_into().unwrap());
        if length == 0 {
            return Err(BrokerError::arg("zero-length RPC frame"));
        }
        if length > MAX_FRAME_LEN {
            return Err(BrokerError::arg(format!(
                "RPC frame length {length} exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }
        let total = 4 + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(4);
        let opcode = Opcode::from_u8(src.get_u8())?;
        let payload = src.split_to(length as usize - 1).freeze();

        Ok(Some(RpcFrame { opcode, payload }))
    }
}

impl Encoder<RpcFrame> for RpcFrameCodec {
    type Error = BrokerError;

    fn encode(&mut self, item: RpcFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_LEN as usize {
            return Err(BrokerError::arg("RPC frame too large to encode"));
        }
        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.opcode as u8);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Encodes a negative-code error response: `{ u32 length_be=5, u8 opcode=0xff,
/// i32 code, message }`. Used whenever a worker aborts an RPC; the client
/// never sees a partial response mid-RPC.
pub fn encode_error(code: i32, message: &str, dst: &mut BytesMut) {
    let payload_len = 4 + message.len();
    dst.reserve(4 + 1 + payload_len);
    dst.put_u32((1 + payload_len) as u32);
    dst.put_u8(0xff);
    dst.put_i32(code);
    dst.put_slice(message.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let mut codec = RpcFrameCodec;
        let frame = RpcFrame {
            opcode: Opcode::Execute,
            payload: Bytes::from_static(b"select 1"),
        };
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.opcode, frame.opcode);
        assert_eq!(decoded.payload, frame.payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_full_frame() {
        let mut codec = RpcFrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(Opcode::Prepare as u8);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_length() {
        let mut codec = RpcFrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(codec.decode(&mut buf).is_err());
    }
}
