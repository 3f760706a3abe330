// src/server/mod.rs

//! Orchestrates one broker master process: builds the SCM region(s),
//! ACL enforcer, shard router and dispatcher task(s), starts the accept
//! loop and telemetry tasks, and runs until a shutdown signal arrives.

mod connection_loop;
mod context;
mod initialization;
mod spawner;

use crate::config::BrokerDocument;
use anyhow::Result;

pub async fn run(doc: BrokerDocument, broker_name: String) -> Result<()> {
    let mut ctx = initialization::setup(&doc, &broker_name).await?;
    spawner::spawn_all(&mut ctx).await?;
    connection_loop::run(ctx).await;
    Ok(())
}
