// src/server/initialization.rs

//! Builds the SCM region(s), ACL enforcer, shard router (if configured)
//! and dispatcher task(s) for one broker section before the accept loop
//! or telemetry tasks are ever started.

use super::context::{OwnedBroker, ServerContext};
use crate::config::{BrokerConfig, BrokerDocument};
use crate::core::acceptor::{Acceptor, DispatchTarget};
use crate::core::acl::AclEnforcer;
use crate::core::dispatcher::Dispatcher;
use crate::core::scm::ScmHandle;
use crate::core::shard::ShardRouter;
use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

pub async fn setup(doc: &BrokerDocument, broker_name: &str) -> Result<ServerContext> {
    let primary = doc
        .broker(broker_name)
        .with_context(|| format!("looking up broker section '{broker_name}'"))?
        .clone();
    log_startup_info(&primary);

    let acl = build_acl(&primary)?;
    let mut background_tasks = JoinSet::new();
    let mut owned = Vec::new();

    let (target, shard_router) = if primary.shard_mode {
        build_sharded_target(doc, &primary, &mut owned, &mut background_tasks).await?
    } else {
        let broker = spawn_one_broker(&primary, &mut background_tasks)?;
        let target = DispatchTarget::Single(broker.dispatcher.clone(), broker.scm.clone());
        owned.push(broker);
        (target, None)
    };

    let acceptor = Acceptor::new(primary.name.clone(), Arc::new(primary.clone()), acl.clone(), target);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    Ok(ServerContext {
        acceptor,
        brokers: owned,
        shutdown_tx,
        shutdown_rx,
        background_tasks,
        shutdown_timeout: primary.shutdown_timeout,
        acl,
        shard_router,
    })
}

fn build_acl(config: &BrokerConfig) -> Result<Arc<AclEnforcer>> {
    if !config.acl_enabled {
        return Ok(Arc::new(AclEnforcer::disabled()));
    }
    let path = config
        .acl_file
        .clone()
        .ok_or_else(|| anyhow!("broker '{}': acl_enabled but no acl_file", config.name))?;
    Ok(Arc::new(AclEnforcer::load(path)?))
}

async fn build_sharded_target(
    doc: &BrokerDocument,
    primary: &BrokerConfig,
    owned: &mut Vec<OwnedBroker>,
    background_tasks: &mut JoinSet<()>,
) -> Result<(DispatchTarget, Option<Arc<ShardRouter>>)> {
    let shard_key_file = primary
        .shard_key_file
        .clone()
        .ok_or_else(|| anyhow!("broker '{}': shard_mode but no shard_key_file", primary.name))?;
    let router = Arc::new(ShardRouter::load(shard_key_file, primary.shard_modulo)?);

    let mut targets = HashMap::new();
    for sub in doc.brokers.iter().filter(|b| b.shard_id.is_some()) {
        let shard_id = sub.shard_id.expect("filtered on is_some");
        let broker = spawn_one_broker(sub, background_tasks)?;
        targets.insert(shard_id, (broker.dispatcher.clone(), broker.scm.clone()));
        owned.push(broker);
    }
    if targets.is_empty() {
        return Err(anyhow!(
            "broker '{}': shard_mode is enabled but no [[broker]] section declares a shard_id",
            primary.name
        ));
    }

    Ok((
        DispatchTarget::Sharded {
            router: router.clone(),
            targets: Arc::new(targets),
        },
        Some(router),
    ))
}

fn spawn_one_broker(config: &BrokerConfig, background_tasks: &mut JoinSet<()>) -> Result<OwnedBroker> {
    let scm = Arc::new(
        ScmHandle::create(&config.name, config)
            .with_context(|| format!("creating SCM region for broker '{}'", config.name))?,
    );
    scm.header().set_broker_state(crate::core::scm::BrokerRunState::On);

    let (mut dispatcher, handle) = Dispatcher::new(config.name.clone(), config.clone(), scm.clone());
    dispatcher
        .ensure_min_workers()
        .with_context(|| format!("spawning initial worker pool for broker '{}'", config.name))?;

    background_tasks.spawn(async move {
        dispatcher.run().await;
    });

    info!(broker = %config.name, min_workers = config.min_workers, "broker pool started");
    Ok(OwnedBroker {
        name: config.name.clone(),
        scm,
        dispatcher: handle,
    })
}

fn log_startup_info(config: &BrokerConfig) {
    info!(
        broker = %config.name,
        port = config.port,
        min_workers = config.min_workers,
        max_workers = config.max_workers,
        queue_max = config.queue_max,
        shard_mode = config.shard_mode,
        "starting broker"
    );
}

