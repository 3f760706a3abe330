// src/server/context.rs

use crate::core::acceptor::Acceptor;
use crate::core::acl::AclEnforcer;
use crate::core::dispatcher::DispatcherHandle;
use crate::core::scm::ScmHandle;
use crate::core::shard::ShardRouter;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// One SCM region this process created and is responsible for tearing
/// down on shutdown: either the single broker it runs, or (in shard
/// mode) one of its sub-brokers.
pub struct OwnedBroker {
    pub name: String,
    pub scm: Arc<ScmHandle>,
    pub dispatcher: DispatcherHandle,
}

/// Everything the master process's background tasks need, assembled by
/// `initialization::setup` and consumed by `connection_loop::run`.
pub struct ServerContext {
    pub acceptor: Acceptor,
    pub brokers: Vec<OwnedBroker>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub background_tasks: JoinSet<()>,
    pub shutdown_timeout: std::time::Duration,
    /// ACL table, kept here (in addition to inside `acceptor`) so a
    /// SIGHUP can trigger `reload()` without reaching into the acceptor.
    pub acl: Arc<AclEnforcer>,
    /// Set only for a sharded front-end broker; `None` otherwise. SIGHUP
    /// rebuilds the shard-key table per §3's "rebuilt on SIGHUP".
    pub shard_router: Option<Arc<ShardRouter>>,
}
