// src/server/connection_loop.rs

//! Waits for a shutdown signal, then runs the broker-level *->OFF
//! transition of §4.8: stop accepting, ask every dispatcher to drain and
//! terminate its workers, wait out `shutdown_timeout`, and remove every
//! SCM region this process created.

use super::context::ServerContext;
use crate::core::scm::ScmHandle;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}

/// Rebuilds the ACL table and (in shard mode) the shard-key table on
/// every SIGHUP, per §3: ACL is "loaded on startup and on admin reload"
/// and the shard-key table is "rebuilt on SIGHUP". Runs for the whole
/// life of the master; never exits on its own.
#[cfg(unix)]
async fn run_sighup_reload_loop(ctx_acl: std::sync::Arc<crate::core::acl::AclEnforcer>, shard_router: Option<std::sync::Arc<crate::core::shard::ShardRouter>>) {
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGHUP handler; config reload via signal disabled");
            return;
        }
    };
    loop {
        if sighup.recv().await.is_none() {
            return;
        }
        info!("received SIGHUP, reloading ACL and shard-key tables");
        if let Err(e) = ctx_acl.reload() {
            warn!(error = %e, "ACL reload failed, keeping the previous table");
        }
        if let Some(router) = &shard_router {
            if let Err(e) = router.reload() {
                warn!(error = %e, "shard-key table reload failed, keeping the previous table");
            }
        }
    }
}

pub async fn run(mut ctx: ServerContext) {
    #[cfg(unix)]
    let sighup_task = tokio::spawn(run_sighup_reload_loop(ctx.acl.clone(), ctx.shard_router.clone()));

    tokio::select! {
        biased;
        _ = await_shutdown_signal() => {
            info!("shutdown signal received, draining broker");
        }
        Some(res) = ctx.background_tasks.join_next() => {
            if let Err(e) = res {
                warn!(error = %e, "a background task panicked before shutdown was requested");
            }
        }
    }

    #[cfg(unix)]
    sighup_task.abort();

    let _ = ctx.shutdown_tx.send(true);

    for broker in &ctx.brokers {
        broker.scm.header().set_broker_state(crate::core::scm::BrokerRunState::Off);
        tokio::time::timeout(ctx.shutdown_timeout, broker.dispatcher.shutdown())
            .await
            .unwrap_or_else(|_| warn!(broker = %broker.name, "dispatcher did not shut down within shutdown_timeout"));
    }

    while let Some(res) = tokio::time::timeout(ctx.shutdown_timeout, ctx.background_tasks.join_next())
        .await
        .ok()
        .flatten()
    {
        if let Err(e) = res {
            warn!(error = %e, "background task exited with an error during shutdown");
        }
    }
    ctx.background_tasks.abort_all();

    for broker in &ctx.brokers {
        if let Err(e) = ScmHandle::unlink(&broker.name) {
            warn!(broker = %broker.name, error = %e, "failed to remove SCM region on shutdown");
        }
    }

    info!("broker shutdown complete");
}
