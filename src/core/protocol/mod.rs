// src/core/protocol/mod.rs

pub mod fd_sideband;
pub mod handshake;
pub mod rpc_frame;

pub use fd_sideband::FdSideband;
pub use handshake::{ClientHandshake, HandshakeFlags, HandshakeReply};
pub use rpc_frame::{RpcFrame, RpcFrameCodec};
