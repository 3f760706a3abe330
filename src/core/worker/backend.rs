// src/core/worker/backend.rs

//! The connection to the actual database engine a CAS worker fronts.
//! Talking to that engine is explicitly out of scope (spec.md §1's
//! Non-goals name the database engine itself as opaque); this module is
//! the seam a real engine driver would plug into, grounded in how the
//! teacher's storage-engine clients are shaped: a single long-lived
//! connection per worker, fallible request/response calls, no retries.

use crate::core::errors::BrokerError;
use bytes::Bytes;

/// One worker's connection to its backend database instance. The stub
/// implementation here echoes requests back so the RPC loop above it is
/// exercised end-to-end without a real engine present.
pub struct BackendConnection {
    connected: bool,
}

impl BackendConnection {
    /// Opens the backend connection a freshly spawned worker needs before
    /// it can serve any session (§4.2 step 2).
    pub fn connect() -> Result<Self, BrokerError> {
        Ok(BackendConnection { connected: true })
    }

    fn require_connected(&self) -> Result<(), BrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::BackendFail(
                "backend connection is closed".into(),
            ))
        }
    }

    pub fn execute(&mut self, sql: &Bytes) -> Result<Bytes, BrokerError> {
        self.require_connected()?;
        Ok(sql.clone())
    }

    pub fn fetch(&mut self, cursor: &Bytes) -> Result<Bytes, BrokerError> {
        self.require_connected()?;
        Ok(cursor.clone())
    }

    pub fn end_tran(&mut self, _arg: &Bytes) -> Result<(), BrokerError> {
        self.require_connected()
    }

    pub fn schema_info(&mut self, request: &Bytes) -> Result<Bytes, BrokerError> {
        self.require_connected()?;
        Ok(request.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_echoes_payload() {
        let mut backend = BackendConnection::connect().unwrap();
        let reply = backend.execute(&Bytes::from_static(b"select 1")).unwrap();
        assert_eq!(reply, Bytes::from_static(b"select 1"));
    }
}
