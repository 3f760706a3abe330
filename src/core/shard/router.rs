// src/core/shard/router.rs

//! A reloadable handle around a [`ShardKeyTable`]: read-only after load,
//! with a SIGHUP-triggered rebuild that swaps the table pointer atomically
//! so in-flight routing calls never observe a half-built table.

use super::loader;
use super::table::{ShardHasher, ShardKeyTable, ShardValue};
use crate::core::errors::BrokerError;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
pub struct ShardRouter {
    path: PathBuf,
    modulo: u32,
    table: RwLock<Arc<ShardKeyTable>>,
    hasher: Option<Arc<dyn ShardHasher>>,
}

impl ShardRouter {
    pub fn load(path: PathBuf, modulo: u32) -> Result<Self, BrokerError> {
        let table = loader::load_file(&path)?;
        Ok(ShardRouter {
            path,
            modulo,
            table: RwLock::new(Arc::new(table)),
            hasher: None,
        })
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn ShardHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Rebuilds the table from disk and swaps it in. Called on SIGHUP.
    pub fn reload(&self) -> Result<(), BrokerError> {
        let fresh = loader::load_file(&self.path)?;
        *self.table.write() = Arc::new(fresh);
        Ok(())
    }

    pub fn route(&self, key_name: &str, value: &ShardValue<'_>) -> Result<u32, BrokerError> {
        let table = self.table.read().clone();
        table.route(key_name, value, self.modulo, self.hasher.as_deref())
    }
}
