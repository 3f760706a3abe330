// src/main.rs

//! Entry point for the `brokerd` binary. Started bare (or with
//! `--config`/`--broker`) it runs as the broker master described in
//! `src/server/mod.rs`. The master re-executes this same binary with
//! `--cas-worker --broker <name> --slot <index>` to spawn each CAS
//! worker (`src/core/dispatcher/pool.rs`); that mode is not meant to be
//! invoked by hand.

use anyhow::{Context, Result, anyhow};
use brokerd::config::{BrokerDocument, resolve_conf_path};
use brokerd::core::worker;
use brokerd::server;
use clap::Parser;
use std::path::PathBuf;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "brokerd")]
#[command(about = "Broker / CAS dispatch and worker-pool front end")]
struct Args {
    /// Path to the broker configuration file. Falls back to
    /// `BROKER_CONF`, then `$BROKER_HOME/conf/cubrid_broker.conf`.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Name of the `[[broker]]` section to run. Required unless the
    /// config file declares exactly one broker.
    #[arg(long, value_name = "NAME")]
    broker: Option<String>,

    /// Internal: re-exec flag used by the dispatcher to start a CAS
    /// worker process. Not a user-facing mode.
    #[arg(long, hide = true)]
    cas_worker: bool,

    /// Internal: worker slot index, set alongside `--cas-worker`.
    #[arg(long, hide = true)]
    slot: Option<usize>,

    /// Internal: informational only, carried for process-listing
    /// readability (`ps` shows the worker's declared type).
    #[arg(long, hide = true)]
    worker_type: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    brokerd::logging::init();

    let conf_path = resolve_conf_path(args.config.clone())
        .context("resolving broker configuration path")?;
    // Propagate the resolved path to re-exec'd CAS worker children so
    // they can find the same config file without re-deriving it from
    // BROKER_HOME themselves.
    unsafe {
        std::env::set_var("BROKER_CONF", &conf_path);
    }

    let doc = BrokerDocument::from_file(&conf_path)
        .with_context(|| format!("loading broker configuration from '{}'", conf_path.display()))?;

    if args.cas_worker {
        return run_cas_worker(args, &doc).await;
    }

    let broker_name = resolve_broker_name(args.broker, &doc)?;
    if let Err(e) = server::run(doc, broker_name).await {
        error!(error = %e, "broker master exited with an error");
        return Err(e);
    }
    Ok(())
}

fn resolve_broker_name(requested: Option<String>, doc: &BrokerDocument) -> Result<String> {
    if let Some(name) = requested {
        doc.broker(&name)?;
        return Ok(name);
    }
    match doc.brokers.as_slice() {
        [single] => Ok(single.name.clone()),
        [] => Err(anyhow!("configuration declares no brokers")),
        many => Err(anyhow!(
            "configuration declares {} brokers ({}); pass --broker to choose one",
            many.len(),
            many.iter().map(|b| b.name.as_str()).collect::<Vec<_>>().join(", ")
        )),
    }
}

async fn run_cas_worker(args: Args, doc: &BrokerDocument) -> Result<()> {
    let broker_name = args
        .broker
        .ok_or_else(|| anyhow!("--cas-worker requires --broker"))?;
    let slot = args
        .slot
        .ok_or_else(|| anyhow!("--cas-worker requires --slot"))?;
    let config = doc
        .broker(&broker_name)
        .with_context(|| format!("looking up broker section '{broker_name}' for CAS worker"))?
        .clone();

    if let Err(e) = worker::run_worker(&broker_name, slot, &config).await {
        error!(broker = %broker_name, slot, error = %e, "CAS worker exited with an error");
        return Err(anyhow!(e));
    }
    Ok(())
}
