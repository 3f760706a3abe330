// src/core/worker/mod.rs

//! The CAS worker process main loop of §4.2: attaches to an
//! already-created SCM region, opens a connection to the (opaque, out of
//! scope per spec.md §1) backend database, and loops waiting for fds
//! handed over by the dispatcher.

mod backend;

use crate::config::BrokerConfig;
use crate::core::dispatcher::pool::{self, WORKER_CHANNEL_FD};
use crate::core::errors::BrokerError;
use crate::core::protocol::fd_sideband;
use crate::core::protocol::handshake::HandshakeReply;
use crate::core::protocol::rpc_frame::{self, Opcode, RpcFrame, RpcFrameCodec};
use crate::core::scm::ScmHandle;
use backend::BackendConnection;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{error, info, info_span, warn, Instrument};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Entry point for a process started with `--cas-worker --broker <name>
/// --slot <index>`. Runs until the channel to the dispatcher closes
/// (master shutting down) or a fatal backend error occurs.
pub async fn run_worker(
    broker_name: &str,
    slot_index: usize,
    config: &BrokerConfig,
) -> Result<(), BrokerError> {
    let span = info_span!("cas_worker", broker = broker_name, slot = slot_index, pid = std::process::id());
    async move {
        let scm = ScmHandle::attach(broker_name)?;
        let channel = unsafe { pool::channel_from_raw_fd(WORKER_CHANNEL_FD) }
            .map_err(|e| BrokerError::internal(format!("failed to adopt worker channel fd: {e}")))?;

        let mut backend = BackendConnection::connect()?;
        info!("worker ready");

        loop {
            let (client_fd, sideband) = match fd_sideband::recv_fd_async(&channel).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "fd-passing channel broken, exiting");
                    return Err(e);
                }
            };

            let slot = scm.worker_slot(slot_index)?;
            slot.set_client_info(0, 1);

            let std_stream = std::net::TcpStream::from(client_fd);
            std_stream.set_nonblocking(true).map_err(BrokerError::from)?;
            let stream = match TcpStream::from_std(std_stream) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to adopt client stream, returning to idle");
                    slot.mark_idle(now_secs());
                    continue;
                }
            };

            let session_id = slot.session_id();
            if let Err(e) = serve_session(
                &scm,
                slot_index,
                session_id,
                sideband.driver_info,
                stream,
                &mut backend,
                config,
            )
            .await
            {
                match &e {
                    BrokerError::BackendFail(_) => {
                        error!(error = %e, "backend connection failed, worker exiting");
                        slot.mark_terminated();
                        return Err(e);
                    }
                    other => {
                        warn!(error = %other, "session ended with an error");
                    }
                }
            }
            slot.mark_idle(now_secs());
        }
    }
    .instrument(span)
    .await
}

/// Runs the handshake reply plus the RPC loop for one client session,
/// per §4.2 steps 3–5.
async fn serve_session(
    scm: &ScmHandle,
    slot_index: usize,
    session_id: u64,
    _driver_info: [u8; fd_sideband::DRIVER_INFO_LEN],
    stream: TcpStream,
    backend: &mut BackendConnection,
    config: &BrokerConfig,
) -> Result<(), BrokerError> {
    let mut framed = Framed::new(stream, RpcFrameCodec);

    // The reply's worker_port is always 0: this rewrite routes sticky
    // reconnects back through the broker's own accept loop using the
    // session_id hint rather than a dedicated per-worker listening port
    // (see DESIGN.md).
    {
        let mut buf = BytesMut::new();
        HandshakeReply::Ok {
            session_id,
            worker_port: 0,
        }
        .encode(&mut buf);
        framed
            .get_mut()
            .write_all(&buf)
            .await
            .map_err(BrokerError::from)?;
    }

    let session_timeout = config.session_timeout;
    loop {
        let next = tokio::time::timeout(session_timeout, framed.next()).await;
        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                send_error(&mut framed, &e).await;
                return Err(e);
            }
            Ok(None) => {
                // Clean EOF: client closed the session.
                return Ok(());
            }
            Err(_) => {
                return Err(BrokerError::Timeout(format!(
                    "session {session_id} idle past session_timeout"
                )));
            }
        };

        let slot = scm.worker_slot(slot_index)?;
        slot.record_request();

        match handle_rpc(frame, backend, slot) {
            Ok(response) => {
                if framed.send(response).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                slot.record_error();
                send_error(&mut framed, &e).await;
                if matches!(e, BrokerError::BackendFail(_)) {
                    return Err(e);
                }
            }
        }
    }
}

fn handle_rpc(
    frame: RpcFrame,
    backend: &mut BackendConnection,
    slot: &crate::core::scm::WorkerSlot,
) -> Result<RpcFrame, BrokerError> {
    match frame.opcode {
        Opcode::Prepare | Opcode::Execute => {
            let sql_fingerprint = String::from_utf8_lossy(&frame.payload);
            slot.set_log_msg(&sql_fingerprint);
            slot.record_query();
            let result = backend.execute(&frame.payload)?;
            Ok(RpcFrame {
                opcode: frame.opcode,
                payload: result,
            })
        }
        Opcode::Fetch | Opcode::Cursor => {
            let result = backend.fetch(&frame.payload)?;
            Ok(RpcFrame {
                opcode: frame.opcode,
                payload: result,
            })
        }
        Opcode::EndTran => {
            backend.end_tran(&frame.payload)?;
            Ok(RpcFrame {
                opcode: frame.opcode,
                payload: bytes::Bytes::new(),
            })
        }
        Opcode::GetDbVersion => Ok(RpcFrame {
            opcode: frame.opcode,
            payload: bytes::Bytes::from_static(b"1.0"),
        }),
        Opcode::SchemaInfo => {
            let result = backend.schema_info(&frame.payload)?;
            Ok(RpcFrame {
                opcode: frame.opcode,
                payload: result,
            })
        }
    }
}

async fn send_error(framed: &mut Framed<TcpStream, RpcFrameCodec>, err: &BrokerError) {
    let mut buf = BytesMut::new();
    rpc_frame::encode_error(err.wire_code(), &err.to_string(), &mut buf);
    let _ = framed.get_mut().write_all(&buf).await;
}

/// Checks whether a worker's backend socket has gone stale past
/// `time_to_kill`-independent health criteria; currently unused by the
/// stub backend but kept as the seam telemetry/health checks would hook
/// into for a real backend.
pub fn backend_idle_for(_last_used_secs: u64, _now_secs: u64) -> bool {
    false
}

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);
