// src/core/acl/enforcer.rs

//! The ACL enforcer consulted by the Connection Acceptor (§4.4 step 2):
//! "if the client's source address is not allowed for the advertised
//! user, reject with code ACL_DENIED." Read-only after load; a reload
//! swaps the whole table atomically so in-flight checks never observe a
//! half-built ACL.

use super::rules::{AclDocument, ParsedAclEntry};
use crate::core::errors::BrokerError;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct AclEnforcer {
    enabled: AtomicBool,
    path: Option<PathBuf>,
    entries: parking_lot::RwLock<Arc<Vec<ParsedAclEntry>>>,
}

impl AclEnforcer {
    /// Builds a disabled enforcer that allows everything, used when
    /// `acl_enabled = false` in the broker config.
    pub fn disabled() -> Self {
        AclEnforcer {
            enabled: AtomicBool::new(false),
            path: None,
            entries: parking_lot::RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn load(path: PathBuf) -> Result<Self, BrokerError> {
        let entries = Self::load_entries(&path)?;
        Ok(AclEnforcer {
            enabled: AtomicBool::new(true),
            path: Some(path),
            entries: parking_lot::RwLock::new(Arc::new(entries)),
        })
    }

    fn load_entries(path: &std::path::Path) -> Result<Vec<ParsedAclEntry>, BrokerError> {
        let doc: AclDocument = AclDocument::from_file(path)?;
        doc.users.iter().map(ParsedAclEntry::try_from).collect()
    }

    /// Rebuilds the table from disk, called on admin reload / SIGHUP.
    pub fn reload(&self) -> Result<(), BrokerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fresh = Self::load_entries(path)?;
        *self.entries.write() = Arc::new(fresh);
        Ok(())
    }

    /// Checks whether `user` is permitted to connect from `addr`. With
    /// ACL disabled, every user/address pair is allowed.
    pub fn check(&self, user: &str, addr: IpAddr) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return true;
        }
        let entries = self.entries.read().clone();
        entries
            .iter()
            .find(|e| e.user == user)
            .map(|e| e.blocks.iter().any(|b| b.contains(&addr)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_acl(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn disabled_enforcer_allows_everyone() {
        let enforcer = AclEnforcer::disabled();
        assert!(enforcer.check("anyone", "1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn enabled_enforcer_checks_cidr_membership() {
        let f = write_acl(
            "[[user]]\nuser = \"alice\"\nallowed_cidr = [\"10.0.0.0/24\"]\n",
        );
        let enforcer = AclEnforcer::load(f.path().to_path_buf()).unwrap();
        assert!(enforcer.check("alice", "10.0.0.5".parse().unwrap()));
        assert!(!enforcer.check("alice", "10.0.1.5".parse().unwrap()));
        assert!(!enforcer.check("bob", "10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn reload_picks_up_new_rules() {
        let f = write_acl("[[user]]\nuser = \"alice\"\nallowed_cidr = [\"10.0.0.0/24\"]\n");
        let enforcer = AclEnforcer::load(f.path().to_path_buf()).unwrap();
        assert!(!enforcer.check("bob", "10.0.0.5".parse().unwrap()));

        let mut f2 = std::fs::File::create(f.path()).unwrap();
        f2.write_all(b"[[user]]\nuser = \"bob\"\nallowed_cidr = [\"10.0.0.0/24\"]\n")
            .unwrap();
        drop(f2);
        enforcer.reload().unwrap();
        assert!(enforcer.check("bob", "10.0.0.5".parse().unwrap()));
    }
}
