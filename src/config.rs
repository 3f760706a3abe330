// src/config.rs

//! Loads and validates broker configuration: a two-stage `RawBrokerConfig`
//! (deserialized with per-field defaults) promoted into a validated
//! `BrokerConfig` via [`BrokerConfig::from_file`].

use anyhow::{Context, Result, anyhow};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

bitflags! {
    /// SQL log mode bitset: `{off, on, append, bind-values}`, matching the
    /// original broker's `SQL_LOG_MODE_*` flags.
    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(transparent)]
    pub struct SqlLogMode: u8 {
        const ON = 0x01;
        const APPEND = 0x02;
        const BIND_VALUES = 0x04;
    }
}

impl Default for SqlLogMode {
    fn default() -> Self {
        SqlLogMode::empty()
    }
}

/// Connection-keeping policy for a client session.
///
/// `Auto` resolves per the handshake flag the client sends: if bit 0
/// (`wants_keep_connection`) is set, the session is treated as `On`
/// (affinity tracked, worker port echoed back); otherwise as `Off`. This is
/// the rewrite's documented resolution of the keep_connection=auto open
/// question.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeepConnection {
    Off,
    On,
    #[default]
    Auto,
}

impl KeepConnection {
    pub fn wants_affinity(self, client_requested: bool) -> bool {
        match self {
            KeepConnection::Off => false,
            KeepConnection::On => true,
            KeepConnection::Auto => client_requested,
        }
    }
}

/// Worker type. Immutable for the lifetime of a broker; never changed
/// mid-run via the Admin Channel.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerType {
    #[default]
    Cas,
    Upload,
    AutoMigrator,
}

/// One `[[broker]]` section of the configuration file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerConfig {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub worker_type: WorkerType,

    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_true")]
    pub auto_add: bool,

    #[serde(with = "humantime_serde", default = "default_session_timeout")]
    pub session_timeout: Duration,
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,
    #[serde(default = "default_priority_gap")]
    pub priority_gap_secs: u64,
    #[serde(with = "humantime_serde", default = "default_time_to_kill")]
    pub time_to_kill: Duration,

    #[serde(default)]
    pub sql_log_mode: SqlLogMode,
    #[serde(default = "default_sql_log_max_size")]
    pub sql_log_max_size: u64,

    #[serde(default)]
    pub keep_connection: KeepConnection,
    #[serde(default)]
    pub statement_pooling: bool,

    #[serde(default)]
    pub acl_enabled: bool,
    pub acl_file: Option<PathBuf>,

    #[serde(default)]
    pub shard_mode: bool,
    pub shard_key_file: Option<PathBuf>,
    #[serde(default = "default_shard_modulo")]
    pub shard_modulo: u32,
    /// Set on a `[[broker]]` section that is one of a sharded broker's
    /// sub-brokers: identifies which `shard_id` from the shard-key table
    /// this section's own worker pool serves. Unset on a non-sharded
    /// broker and on the sharded front-end section itself (the one with
    /// `shard_mode = true`).
    pub shard_id: Option<u32>,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_sticky_timeout")]
    pub sticky_timeout: Duration,
}

fn default_min_workers() -> usize {
    5
}
fn default_max_workers() -> usize {
    40
}
fn default_true() -> bool {
    true
}
fn default_session_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_queue_max() -> usize {
    20
}
fn default_priority_gap() -> u64 {
    10
}
fn default_time_to_kill() -> Duration {
    Duration::from_secs(120)
}
fn default_sql_log_max_size() -> u64 {
    100_000
}
fn default_shard_modulo() -> u32 {
    256
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_sticky_timeout() -> Duration {
    Duration::from_millis(500)
}

pub const MAX_SQL_LOG_MAX_SIZE: u64 = 2_000_000;

impl BrokerConfig {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("broker name cannot be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("broker '{}': port cannot be 0", self.name));
        }
        if self.min_workers > self.max_workers {
            return Err(anyhow!(
                "broker '{}': min_workers ({}) > max_workers ({})",
                self.name,
                self.min_workers,
                self.max_workers
            ));
        }
        if self.min_workers == 0 && !self.auto_add {
            return Err(anyhow!(
                "broker '{}': min_workers cannot be 0 when auto_add is disabled",
                self.name
            ));
        }
        if self.priority_gap_secs == 0 {
            return Err(anyhow!(
                "broker '{}': priority_gap_secs must be >= 1",
                self.name
            ));
        }
        if self.sql_log_max_size > MAX_SQL_LOG_MAX_SIZE {
            return Err(anyhow!(
                "broker '{}': sql_log_max_size ({}) exceeds the maximum of {}",
                self.name,
                self.sql_log_max_size,
                MAX_SQL_LOG_MAX_SIZE
            ));
        }
        if self.acl_enabled && self.acl_file.is_none() {
            return Err(anyhow!(
                "broker '{}': acl_enabled requires acl_file",
                self.name
            ));
        }
        if self.shard_mode && self.shard_key_file.is_none() {
            return Err(anyhow!(
                "broker '{}': shard_mode requires shard_key_file",
                self.name
            ));
        }
        if self.shard_mode && self.shard_modulo == 0 {
            return Err(anyhow!(
                "broker '{}': shard_modulo cannot be 0",
                self.name
            ));
        }
        if self.shard_mode && self.shard_id.is_some() {
            return Err(anyhow!(
                "broker '{}': a sharded front-end section cannot itself carry shard_id",
                self.name
            ));
        }
        Ok(())
    }

    pub fn priority_gap(&self) -> Duration {
        Duration::from_secs(self.priority_gap_secs)
    }
}

/// Top-level configuration document: one or more `[[broker]]` sections,
/// matching CUBRID's single `cubrid_broker.conf` holding many broker
/// stanzas.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerDocument {
    #[serde(rename = "broker")]
    pub brokers: Vec<BrokerConfig>,
}

impl BrokerDocument {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{}'", path.display()))?;
        let doc: BrokerDocument = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{}'", path.display()))?;
        if doc.brokers.is_empty() {
            return Err(anyhow!("config file '{}' declares no brokers", path.display()));
        }
        for broker in &doc.brokers {
            broker.validate()?;
        }
        Ok(doc)
    }

    pub fn broker(&self, name: &str) -> Result<&BrokerConfig> {
        self.brokers
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| anyhow!("no broker named '{name}' in config file"))
    }
}

/// Resolves the configuration file path from a CLI flag or the
/// `BROKER_CONF` / `BROKER_HOME` environment variables, per the external
/// interfaces section.
pub fn resolve_conf_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(p) = flag {
        return Ok(p);
    }
    if let Ok(p) = std::env::var("BROKER_CONF") {
        return Ok(PathBuf::from(p));
    }
    if let Ok(home) = std::env::var("BROKER_HOME") {
        return Ok(PathBuf::from(home).join("conf").join("cubrid_broker.conf"));
    }
    Err(anyhow!(
        "no config path given and neither BROKER_CONF nor BROKER_HOME is set"
    ))
}

/// Resolves the SCM shared-memory key for a broker from `BROKER_SHM_KEY`, or
/// derives a stable one from the broker name if unset.
pub fn resolve_shm_key(broker_name: &str) -> String {
    std::env::var("BROKER_SHM_KEY").unwrap_or_else(|_| format!("brokerd.{broker_name}.scm"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml(extra: &str) -> String {
        format!(
            "[[broker]]\nname = \"query_broker\"\nport = 33000\n{extra}\n"
        )
    }

    #[test]
    fn defaults_apply() {
        let doc: BrokerDocument = toml::from_str(&minimal_toml("")).unwrap();
        let b = &doc.brokers[0];
        assert_eq!(b.min_workers, 5);
        assert_eq!(b.max_workers, 40);
        assert_eq!(b.queue_max, 20);
        assert_eq!(b.priority_gap_secs, 10);
        assert_eq!(b.time_to_kill, Duration::from_secs(120));
        assert_eq!(b.keep_connection, KeepConnection::Auto);
        b.validate().unwrap();
    }

    #[test]
    fn rejects_min_above_max() {
        let doc: BrokerDocument =
            toml::from_str(&minimal_toml("min_workers = 10\nmax_workers = 2\n")).unwrap();
        assert!(doc.brokers[0].validate().is_err());
    }

    #[test]
    fn rejects_shard_mode_without_file() {
        let doc: BrokerDocument = toml::from_str(&minimal_toml("shard_mode = true\n")).unwrap();
        assert!(doc.brokers[0].validate().is_err());
    }

    #[test]
    fn rejects_shard_front_end_with_shard_id() {
        let doc: BrokerDocument = toml::from_str(&minimal_toml(
            "shard_mode = true\nshard_key_file = \"keys.txt\"\nshard_id = 0\n",
        ))
        .unwrap();
        assert!(doc.brokers[0].validate().is_err());
    }

    #[test]
    fn keep_connection_auto_follows_client_flag() {
        assert!(KeepConnection::Auto.wants_affinity(true));
        assert!(!KeepConnection::Auto.wants_affinity(false));
        assert!(KeepConnection::On.wants_affinity(false));
        assert!(!KeepConnection::Off.wants_affinity(true));
    }
}
