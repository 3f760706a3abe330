// src/bin/brokerctl.rs

//! The admin CLI of §4.8 / §6: writes a `{opcode, arg, seq}` record into
//! a running broker's SCM admin mailbox and polls for the response the
//! dispatcher writes back under the same sequence number. Exits 0 on
//! success, nonzero with a one-line message on stderr otherwise.
//!
//! This tool never talks to a broker except through the mailbox; it has
//! no special privilege over SCM beyond what [`ScmHandle::attach`]
//! grants any other process.

use anyhow::{Context, Result, anyhow};
use brokerd::config::{BrokerDocument, resolve_conf_path};
use brokerd::core::admin::AdminAction;
use brokerd::core::scm::{BrokerRunState, ScmHandle, WorkerState};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[command(name = "brokerctl")]
#[command(about = "Admin tool for a running brokerd master")]
struct Args {
    /// Path to the broker configuration file, used to validate the
    /// broker name and (for `status`) the worker table size. Falls back
    /// to `BROKER_CONF` / `BROKER_HOME` like `brokerd` itself.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Name of the `[[broker]]` section to address.
    #[arg(long, value_name = "NAME")]
    broker: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transition OFF -> ON: open the listening socket and accept
    /// connections again.
    BrokerOn,
    /// Transition * -> OFF: stop accepting, drain, and terminate workers.
    BrokerOff,
    /// Transition ON -> SUSPENDED: stop accepting new connections but
    /// let in-flight RPCs finish.
    Suspend,
    /// Transition SUSPENDED -> ON: reopen the listening socket.
    Resume,
    /// Grow the worker pool by `count`, up to `max_workers`.
    Add { count: usize },
    /// Shrink the worker pool by `count`, down to `min_workers`.
    Drop { count: usize },
    /// Restart (terminate and respawn) one worker by its slot index.
    Restart { worker: usize },
    /// Change one mutable configuration key at runtime.
    ConfChange { key: String, value: String },
    /// Ask the broker to reset its SQL log.
    ResetLog,
    /// Print a point-in-time snapshot of broker and per-worker state,
    /// read directly from SCM without going through the mailbox.
    Status,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

fn next_seq() -> u64 {
    // A CLI invocation is short-lived and has no persistent sequence
    // counter of its own; nanoseconds since the epoch is monotonic
    // enough in practice to satisfy §4.8's "monotonically increasing
    // sequence number" across the handful of commands an operator issues
    // by hand, and the dispatcher only compares it against the last
    // sequence number it observed, not against other callers' numbering.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn main() {
    if let Err(e) = run() {
        eprintln!("brokerctl: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let conf_path =
        resolve_conf_path(args.config.clone()).context("resolving broker configuration path")?;
    let doc = BrokerDocument::from_file(&conf_path)
        .with_context(|| format!("loading broker configuration from '{}'", conf_path.display()))?;
    doc.broker(&args.broker)
        .with_context(|| format!("broker '{}' not declared in '{}'", args.broker, conf_path.display()))?;

    let scm = ScmHandle::attach(&args.broker)
        .with_context(|| format!("attaching to SCM for broker '{}' (is brokerd running?)", args.broker))?;

    if matches!(args.command, Command::Status) {
        return print_status(&scm, &args.broker);
    }

    let action = to_admin_action(args.command);
    submit_and_wait(&scm, action)
}

fn to_admin_action(cmd: Command) -> AdminAction {
    match cmd {
        Command::BrokerOn => AdminAction::BrokerOn,
        Command::BrokerOff => AdminAction::BrokerOff,
        Command::Suspend => AdminAction::Suspend,
        Command::Resume => AdminAction::Resume,
        Command::Add { count } => AdminAction::Add(count),
        Command::Drop { count } => AdminAction::Drop(count),
        Command::Restart { worker } => AdminAction::Restart(worker),
        Command::ConfChange { key, value } => AdminAction::ConfChange { key, value },
        Command::ResetLog => AdminAction::ResetLog,
        Command::Status => unreachable!("status is handled before to_admin_action"),
    }
}

fn submit_and_wait(scm: &ScmHandle, action: AdminAction) -> Result<()> {
    let seq = next_seq();
    let mailbox = scm.admin_mailbox();
    let slot = mailbox.global();

    // SAFETY: the SCM region stays mapped for the lifetime of `scm`.
    unsafe {
        slot.submit(seq, action.opcode(), &action.arg_string())
            .map_err(|e| anyhow!("failed to submit admin command: {e}"))?;
    }

    let deadline = Instant::now() + POLL_TIMEOUT;
    loop {
        let response = unsafe {
            slot.poll_response(seq)
                .map_err(|e| anyhow!("failed to poll admin response: {e}"))?
        };
        if let Some(resp) = response {
            if resp.ok {
                println!("{}", if resp.message.is_empty() { "OK" } else { &resp.message });
                return Ok(());
            }
            return Err(anyhow!("{}", resp.message));
        }
        if Instant::now() >= deadline {
            return Err(anyhow!(
                "timed out waiting for the dispatcher to acknowledge the command (is it stuck or the broker down?)"
            ));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn print_status(scm: &ScmHandle, broker_name: &str) -> Result<()> {
    let header = scm.header();
    println!("broker:        {broker_name}");
    println!("state:         {:?}", header.broker_state());
    println!(
        "active/busy:   {}/{}",
        header.active_workers.load(std::sync::atomic::Ordering::Relaxed),
        header.busy_workers.load(std::sync::atomic::Ordering::Relaxed)
    );
    println!(
        "queued jobs:   {}",
        header.queued_jobs.load(std::sync::atomic::Ordering::Relaxed)
    );
    println!(
        "requests/sec:  {:.3}",
        header.requests_per_sec_milli.load(std::sync::atomic::Ordering::Relaxed) as f64 / 1000.0
    );
    println!();
    println!(
        "{:>4}  {:>8}  {:<11}  {:>10}  {:>8}  {:>8}  {:>8}  log_msg",
        "slot", "pid", "state", "session_id", "reqs", "errs", "queries"
    );
    for i in 0..scm.layout().max_workers {
        let slot = scm.worker_slot(i)?;
        if slot.state() == WorkerState::Terminated && slot.pid() == 0 {
            continue;
        }
        println!(
            "{:>4}  {:>8}  {:<11?}  {:>10}  {:>8}  {:>8}  {:>8}  {}",
            slot.index(),
            slot.pid(),
            slot.state(),
            slot.session_id(),
            slot.num_requests(),
            slot.num_errors(),
            slot.num_queries(),
            slot.log_msg(),
        );
    }
    if header.broker_state() == BrokerRunState::Off {
        println!("\n(broker is OFF; the figures above are the last values flushed to SCM)");
    }
    Ok(())
}
