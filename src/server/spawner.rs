// src/server/spawner.rs

//! Spawns the accept loop and one telemetry task per owned broker into
//! the context's `JoinSet`.

use super::context::ServerContext;
use crate::core::telemetry::Telemetry;
use anyhow::Result;

pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let acceptor = ctx.acceptor.clone();
    let shutdown_rx = ctx.shutdown_rx.clone();
    ctx.background_tasks.spawn(async move {
        if let Err(e) = acceptor.run(shutdown_rx).await {
            tracing::error!(error = %e, "accept loop exited with an error");
        }
    });

    for broker in &ctx.brokers {
        let telemetry = Telemetry::new(broker.scm.clone());
        let shutdown_rx = ctx.shutdown_rx.clone();
        ctx.background_tasks.spawn(async move {
            telemetry.run(shutdown_rx).await;
        });
    }

    Ok(())
}
