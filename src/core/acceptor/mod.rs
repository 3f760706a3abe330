// src/core/acceptor/mod.rs

//! The Connection Acceptor of §4.4: binds the broker's listening TCP
//! socket, runs a single accept loop, and for every accepted fd reads
//! the client handshake, enforces ACL and protocol-version checks, and
//! (in shard mode) routes to the right sub-broker before handing the
//! connection to a [`crate::core::dispatcher::DispatcherHandle`].
//!
//! Per §4.5's "Acceptor and telemetry threads send messages... rather
//! than mutating shared state", this module never touches the worker
//! table or job queue directly — every outcome flows through
//! `DispatcherHandle::dispatch`.

use crate::config::BrokerConfig;
use crate::core::acl::AclEnforcer;
use crate::core::dispatcher::{DispatcherHandle, JobMeta, PendingJob};
use crate::core::errors::BrokerError;
use crate::core::protocol::handshake::{
    ClientHandshake, HandshakeReply, SUPPORTED_MAJOR_VERSION,
};
use crate::core::scm::ScmHandle;
use crate::core::shard::{ShardRouter, ShardValue};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};

/// One routable backend the acceptor can hand a validated connection to:
/// either the broker's single dispatcher, or (in shard mode) one
/// dispatcher per shard id, fanned out by [`ShardRouter`].
#[derive(Clone)]
pub enum DispatchTarget {
    Single(DispatcherHandle, Arc<ScmHandle>),
    Sharded {
        router: Arc<ShardRouter>,
        targets: Arc<HashMap<u32, (DispatcherHandle, Arc<ScmHandle>)>>,
    },
}

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Owns the listening socket for one broker (or sub-broker) section.
#[derive(Clone)]
pub struct Acceptor {
    broker_name: String,
    config: Arc<BrokerConfig>,
    acl: Arc<AclEnforcer>,
    target: DispatchTarget,
}

impl Acceptor {
    pub fn new(
        broker_name: String,
        config: Arc<BrokerConfig>,
        acl: Arc<AclEnforcer>,
        target: DispatchTarget,
    ) -> Self {
        Acceptor {
            broker_name,
            config,
            acl,
            target,
        }
    }

    /// Binds `listen(backlog = queue_max)` and runs the accept loop until
    /// `shutdown` is signalled true (§4.8: "ON->SUSPENDED: close the
    /// listening socket... *->OFF: close the listening socket").
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        let backlog = self.config.queue_max.max(1) as u32;
        let listener = bind_with_backlog(self.config.port, backlog).await?;
        info!(
            broker = %self.broker_name,
            port = self.config.port,
            backlog,
            "accept loop listening"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(broker = %self.broker_name, "accept loop stopping");
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(broker = %self.broker_name, error = %e, "accept() failed");
                            continue;
                        }
                    };
                    let acceptor = self.clone();
                    let span = info_span!("accept", broker = %acceptor.broker_name, peer = %addr);
                    tokio::spawn(acceptor.handle_connection(stream, addr).instrument(span));
                }
            }
        }
    }

    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = self.try_handle_connection(stream, addr).await {
            warn!(error = %e, "connection rejected");
        }
    }

    async fn try_handle_connection(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BrokerError> {
        stream.set_nodelay(true).ok();

        let mut buf = BytesMut::with_capacity(256);
        let handshake = match tokio::time::timeout(
            self.config.connect_timeout,
            read_handshake(&mut stream, &mut buf),
        )
        .await
        {
            Ok(Ok(hs)) => hs,
            Ok(Err(e)) => {
                reject(&mut stream, e.wire_code()).await;
                return Err(e);
            }
            Err(_) => {
                return Err(BrokerError::Timeout(format!(
                    "handshake from {addr} exceeded connect_timeout"
                )));
            }
        };

        if handshake.major_version > SUPPORTED_MAJOR_VERSION {
            let err = BrokerError::Version {
                major: handshake.major_version,
                minor: handshake.minor_version,
            };
            reject(&mut stream, err.wire_code()).await;
            return Err(err);
        }

        if !self.acl.check(&handshake.user, addr.ip()) {
            let err = BrokerError::AclDenied(format!(
                "user '{}' not permitted from {}",
                handshake.user,
                addr.ip()
            ));
            reject(&mut stream, err.wire_code()).await;
            return Err(err);
        }

        let (dispatcher, scm) = match &self.target {
            DispatchTarget::Single(handle, scm) => (handle.clone(), scm.clone()),
            DispatchTarget::Sharded { router, targets } => {
                let prefix = match read_shard_prefix(&mut stream, &mut buf).await {
                    Ok(p) => p,
                    Err(e) => {
                        reject(&mut stream, e.wire_code()).await;
                        return Err(e);
                    }
                };
                let value = prefix.as_shard_value();
                let shard_id = match router.route(&prefix.key_name, &value) {
                    Ok(id) => id,
                    Err(e) => {
                        reject(&mut stream, e.wire_code()).await;
                        return Err(e);
                    }
                };
                match targets.get(&shard_id) {
                    Some((handle, scm)) => (handle.clone(), scm.clone()),
                    None => {
                        let err = BrokerError::internal(format!(
                            "no sub-broker configured for shard {shard_id}"
                        ));
                        reject(&mut stream, err.wire_code()).await;
                        return Err(err);
                    }
                }
            }
        };

        // Cheap, approximate backpressure check before we commit the fd
        // to the dispatcher (§4.4: "if the job queue is full, respond
        // with BUSY and close"). The dispatcher is still the source of
        // truth and may independently reject with BUSY on a race.
        if scm.queue_is_full() && !has_idle_worker(&scm) {
            let err = BrokerError::Busy("job queue is full".into());
            reject(&mut stream, err.wire_code()).await;
            return Err(err);
        }

        let session_id_hint = handshake.session_id_hint();
        let driver_info = handshake.driver_info;
        let request_id = next_request_id();

        // Any bytes the client sent past the handshake/shard-prefix (it
        // shouldn't have sent any yet) would be lost by converting to a
        // raw fd; §4.4 has the worker read the next bytes itself, so
        // requiring this buffer be empty here is the contract, not a
        // convenience.
        debug_assert!(buf.is_empty());

        let std_stream = stream.into_std().map_err(BrokerError::from)?;
        std_stream.set_nonblocking(false).map_err(BrokerError::from)?;
        let fd: OwnedFd = std_stream.into();
        let job = PendingJob {
            fd,
            meta: JobMeta {
                session_id_hint,
                driver_info,
                request_id,
            },
        };

        dispatcher.dispatch(job).await
    }
}

fn has_idle_worker(scm: &ScmHandle) -> bool {
    use crate::core::scm::WorkerState;
    (0..scm.layout().max_workers).any(|i| {
        scm.worker_slot(i)
            .map(|s| s.state() == WorkerState::Idle)
            .unwrap_or(false)
    })
}

/// Reads from `stream` into `buf` until [`ClientHandshake::parse`]
/// succeeds, growing `buf` as needed. Leaves any bytes past the
/// handshake (e.g. a shard-key prefix) in `buf` for the next reader.
async fn read_handshake(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<ClientHandshake, BrokerError> {
    loop {
        if let Some(hs) = ClientHandshake::parse(buf)? {
            return Ok(hs);
        }
        let n = stream.read_buf(buf).await.map_err(BrokerError::from)?;
        if n == 0 {
            return Err(BrokerError::arg("client closed before completing handshake"));
        }
    }
}

/// The small prefix a sharded broker's clients send right after the
/// standard handshake (§4.4 step 3): "an additional small prefix
/// carrying the shard-key name and value" — a length-prefixed key name,
/// followed by a tagged value (integer or string), following the same
/// big-endian length-prefix convention as the rest of the wire protocol.
struct ShardPrefix {
    key_name: String,
    int_value: Option<i64>,
    str_value: Option<String>,
}

impl ShardPrefix {
    fn as_shard_value(&self) -> ShardValue<'_> {
        match (&self.int_value, &self.str_value) {
            (Some(v), _) => ShardValue::Int(*v),
            (None, Some(s)) => ShardValue::Str(s.as_str()),
            (None, None) => ShardValue::Int(0),
        }
    }
}

const TAG_INT: u8 = 0;
const TAG_STR: u8 = 1;

async fn read_shard_prefix(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<ShardPrefix, BrokerError> {
    let key_name = read_lp_string_from_stream(stream, buf).await?;

    loop {
        if !buf.is_empty() {
            let tag = buf[0];
            let needed = match tag {
                TAG_INT => 1 + 8,
                TAG_STR => {
                    if buf.len() < 1 + 4 {
                        0
                    } else {
                        let len = u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
                        1 + 4 + len
                    }
                }
                other => {
                    return Err(BrokerError::arg(format!(
                        "unknown shard-key value tag {other}"
                    )));
                }
            };
            if needed != 0 && buf.len() >= needed {
                let mut cursor = buf.split_to(needed);
                cursor.advance(1);
                return Ok(match tag {
                    TAG_INT => ShardPrefix {
                        key_name,
                        int_value: Some(cursor.get_i64()),
                        str_value: None,
                    },
                    _ => {
                        cursor.advance(4);
                        let s = String::from_utf8(cursor.to_vec()).map_err(|_| {
                            BrokerError::arg("shard-key value is not valid UTF-8")
                        })?;
                        ShardPrefix {
                            key_name,
                            int_value: None,
                            str_value: Some(s),
                        }
                    }
                });
            }
        }
        let n = stream.read_buf(buf).await.map_err(BrokerError::from)?;
        if n == 0 {
            return Err(BrokerError::arg(
                "client closed before completing shard-key prefix",
            ));
        }
    }
}

/// Reads a single big-endian length-prefixed UTF-8 string off `stream`,
/// used for the shard-key name ahead of the tagged value in the shard
/// prefix (§4.4 step 3: "a small prefix carrying the shard-key name and
/// value").
async fn read_lp_string_from_stream(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<String, BrokerError> {
    loop {
        if buf.len() >= 4 {
            let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
            if buf.len() >= 4 + len {
                let mut cursor = buf.split_to(4 + len);
                cursor.advance(4);
                return String::from_utf8(cursor.to_vec())
                    .map_err(|_| BrokerError::arg("shard-key name is not valid UTF-8"));
            }
        }
        let n = stream.read_buf(buf).await.map_err(BrokerError::from)?;
        if n == 0 {
            return Err(BrokerError::arg(
                "client closed before completing shard-key name",
            ));
        }
    }
}

/// Writes the fixed rejection/handshake-error reply and closes `stream`.
/// Never partial: exactly the 4-byte status code, matching §7's "no
/// partial responses are ever emitted mid-RPC" even for a pre-handoff
/// rejection.
async fn reject(stream: &mut TcpStream, code: i32) {
    let mut buf = BytesMut::new();
    HandshakeReply::Err(code).encode(&mut buf);
    let _ = stream.write_all(&buf).await;
    let _ = stream.shutdown().await;
}

async fn bind_with_backlog(port: u16, backlog: u32) -> Result<TcpListener, BrokerError> {
    let socket = tokio::net::TcpSocket::new_v4().map_err(BrokerError::from)?;
    socket.set_reuseaddr(true).map_err(BrokerError::from)?;
    socket
        .bind(([0, 0, 0, 0], port).into())
        .map_err(BrokerError::from)?;
    socket.listen(backlog).map_err(BrokerError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::handshake::MAGIC;
    use bytes::BufMut;

    #[tokio::test]
    async fn shard_prefix_reads_key_name_then_tagged_int_value() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut wire = BytesMut::new();
        wire.put_u32(2);
        wire.put_slice(b"id");
        wire.put_u8(TAG_INT);
        wire.put_i64(200);
        let mut client = client;
        client.write_all(&wire).await.unwrap();

        let mut buf = BytesMut::new();
        let prefix = read_shard_prefix(&mut server, &mut buf).await.unwrap();
        assert_eq!(prefix.key_name, "id");
        assert_eq!(prefix.int_value, Some(200));
        assert!(prefix.str_value.is_none());
    }

    #[tokio::test]
    async fn shard_prefix_reads_key_name_then_tagged_string_value() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut wire = BytesMut::new();
        wire.put_u32(6);
        wire.put_slice(b"tenant");
        wire.put_u8(TAG_STR);
        wire.put_u32(5);
        wire.put_slice(b"acme1");
        let mut client = client;
        client.write_all(&wire).await.unwrap();

        let mut buf = BytesMut::new();
        let prefix = read_shard_prefix(&mut server, &mut buf).await.unwrap();
        assert_eq!(prefix.key_name, "tenant");
        assert_eq!(prefix.str_value.as_deref(), Some("acme1"));
        assert!(prefix.int_value.is_none());
    }

    #[test]
    fn handshake_reader_consumes_only_the_handshake() {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u32(0);
        buf.put_slice(&[0u8; 10]);
        for s in ["u", "p", "d"] {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        buf.put_u8(TAG_INT);
        buf.put_i64(5);

        let hs = ClientHandshake::parse(&mut buf).unwrap().unwrap();
        assert_eq!(hs.user, "u");
        // leftover bytes are exactly the shard prefix
        assert_eq!(buf.len(), 1 + 8);
    }
}
