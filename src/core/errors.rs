// src/core/errors.rs

//! The error taxonomy of the broker. Every variant maps to a stable negative
//! wire code (`BrokerError::wire_code`), since every error the client sees is
//! a negative 4-byte code plus a UTF-8 message, never a partial response.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing every failure kind the broker core can
/// produce: malformed requests, ACL/version rejection, pool exhaustion,
/// transport and backend failures, and internal invariant violations.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("ARG: {0}")]
    Arg(String),

    #[error("ACL_DENIED: {0}")]
    AclDenied(String),

    #[error("VERSION: unsupported protocol version {major}.{minor}")]
    Version { major: u8, minor: u8 },

    #[error("BUSY: {0}")]
    Busy(String),

    #[error("TRANSPORT_FAIL: {0}")]
    TransportFail(String),

    #[error("BACKEND_FAIL: {0}")]
    BackendFail(String),

    #[error("SESSION_LOST: {0}")]
    SessionLost(String),

    #[error("TIMEOUT: {0}")]
    Timeout(String),

    #[error("INTERNAL: {0}")]
    Internal(String),

    #[error("ROUTE_NO_KEY: shard key '{0}' is not declared")]
    RouteNoKey(String),

    #[error("ROUTE_NO_RANGE: no range covers the computed hash {0}")]
    RouteNoRange(u64),

    #[error("SCM_UNAVAILABLE: {0}")]
    ScmUnavailable(String),

    #[error("SCM_EXISTS: {0}")]
    ScmExists(String),

    #[error("QUEUE_FULL")]
    QueueFull,

    #[error("QUEUE_EMPTY")]
    QueueEmpty,

    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// The stable negative wire code for this error kind, per the error
    /// handling design: every error returned to a client is a negative
    /// 4-byte code plus a message body.
    pub fn wire_code(&self) -> i32 {
        match self {
            BrokerError::Arg(_) => -1,
            BrokerError::AclDenied(_) => -2,
            BrokerError::Version { .. } => -3,
            BrokerError::Busy(_) => -4,
            BrokerError::TransportFail(_) => -5,
            BrokerError::BackendFail(_) => -6,
            BrokerError::SessionLost(_) => -7,
            BrokerError::Timeout(_) => -8,
            BrokerError::RouteNoKey(_) => -9,
            BrokerError::RouteNoRange(_) => -10,
            BrokerError::ScmUnavailable(_) => -11,
            BrokerError::ScmExists(_) => -12,
            BrokerError::QueueFull => -13,
            BrokerError::QueueEmpty => -14,
            BrokerError::Config(_) => -15,
            BrokerError::Io(_) | BrokerError::Internal(_) => -99,
        }
    }

    pub fn arg(msg: impl Into<String>) -> Self {
        BrokerError::Arg(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        BrokerError::Internal(msg.into())
    }
}

// Manual `Clone` because `std::io::Error` is not `Clone`; wrapped in an Arc
// so `BrokerError` can be stored in the SCM admin mailbox response slots and
// logged without being consumed.
impl Clone for BrokerError {
    fn clone(&self) -> Self {
        match self {
            BrokerError::Io(e) => BrokerError::Io(Arc::clone(e)),
            BrokerError::Arg(s) => BrokerError::Arg(s.clone()),
            BrokerError::AclDenied(s) => BrokerError::AclDenied(s.clone()),
            BrokerError::Version { major, minor } => BrokerError::Version {
                major: *major,
                minor: *minor,
            },
            BrokerError::Busy(s) => BrokerError::Busy(s.clone()),
            BrokerError::TransportFail(s) => BrokerError::TransportFail(s.clone()),
            BrokerError::BackendFail(s) => BrokerError::BackendFail(s.clone()),
            BrokerError::SessionLost(s) => BrokerError::SessionLost(s.clone()),
            BrokerError::Timeout(s) => BrokerError::Timeout(s.clone()),
            BrokerError::Internal(s) => BrokerError::Internal(s.clone()),
            BrokerError::RouteNoKey(s) => BrokerError::RouteNoKey(s.clone()),
            BrokerError::RouteNoRange(h) => BrokerError::RouteNoRange(*h),
            BrokerError::ScmUnavailable(s) => BrokerError::ScmUnavailable(s.clone()),
            BrokerError::ScmExists(s) => BrokerError::ScmExists(s.clone()),
            BrokerError::QueueFull => BrokerError::QueueFull,
            BrokerError::QueueEmpty => BrokerError::QueueEmpty,
            BrokerError::Config(s) => BrokerError::Config(s.clone()),
        }
    }
}

impl PartialEq for BrokerError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BrokerError::Io(a), BrokerError::Io(b)) => a.to_string() == b.to_string(),
            (BrokerError::Arg(a), BrokerError::Arg(b)) => a == b,
            (BrokerError::AclDenied(a), BrokerError::AclDenied(b)) => a == b,
            (
                BrokerError::Version { major: ma, minor: mi },
                BrokerError::Version { major: mb, minor: mj },
            ) => ma == mb && mi == mj,
            (BrokerError::Busy(a), BrokerError::Busy(b)) => a == b,
            (BrokerError::TransportFail(a), BrokerError::TransportFail(b)) => a == b,
            (BrokerError::BackendFail(a), BrokerError::BackendFail(b)) => a == b,
            (BrokerError::SessionLost(a), BrokerError::SessionLost(b)) => a == b,
            (BrokerError::Timeout(a), BrokerError::Timeout(b)) => a == b,
            (BrokerError::Internal(a), BrokerError::Internal(b)) => a == b,
            (BrokerError::RouteNoKey(a), BrokerError::RouteNoKey(b)) => a == b,
            (BrokerError::RouteNoRange(a), BrokerError::RouteNoRange(b)) => a == b,
            (BrokerError::ScmUnavailable(a), BrokerError::ScmUnavailable(b)) => a == b,
            (BrokerError::ScmExists(a), BrokerError::ScmExists(b)) => a == b,
            (BrokerError::QueueFull, BrokerError::QueueFull) => true,
            (BrokerError::QueueEmpty, BrokerError::QueueEmpty) => true,
            (BrokerError::Config(a), BrokerError::Config(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(Arc::new(e))
    }
}

impl From<nix::Error> for BrokerError {
    fn from(e: nix::Error) -> Self {
        BrokerError::TransportFail(e.to_string())
    }
}

impl From<toml::de::Error> for BrokerError {
    fn from(e: toml::de::Error) -> Self {
        BrokerError::Config(e.to_string())
    }
}

impl From<std::num::ParseIntError> for BrokerError {
    fn from(e: std::num::ParseIntError) -> Self {
        BrokerError::Config(e.to_string())
    }
}
