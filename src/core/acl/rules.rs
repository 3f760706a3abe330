// src/core/acl/rules.rs

//! The ACL data model of §3: a list of `{user, allowed_cidr[]}` entries,
//! loaded on startup and rebuilt wholesale on an admin reload.

use crate::core::errors::BrokerError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// One `[user]` entry of the ACL file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclUserRule {
    pub user: String,
    pub allowed_cidr: Vec<String>,
}

/// A parsed CIDR block, able to test membership without re-parsing on
/// every request.
#[derive(Debug, Clone, Copy)]
pub struct CidrBlock {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrBlock {
    pub fn parse(text: &str) -> Result<Self, BrokerError> {
        let (addr_part, prefix_part) = match text.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (text, None),
        };
        let network: IpAddr = addr_part
            .parse()
            .map_err(|_| BrokerError::Config(format!("invalid ACL CIDR address '{text}'")))?;
        let max_bits = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| BrokerError::Config(format!("invalid ACL CIDR prefix in '{text}'")))?,
            None => max_bits,
        };
        if prefix_len > max_bits {
            return Err(BrokerError::Config(format!(
                "ACL CIDR prefix {prefix_len} exceeds {max_bits} bits in '{text}'"
            )));
        }
        Ok(CidrBlock { network, prefix_len })
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = prefix_mask_u32(self.prefix_len);
                (u32::from(net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = prefix_mask_u128(self.prefix_len);
                (u128::from(net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn prefix_mask_u128(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

/// An ACL entry after its CIDR strings have been parsed once at load
/// time, avoiding re-parsing on every connection.
#[derive(Debug, Clone)]
pub struct ParsedAclEntry {
    pub user: String,
    pub blocks: Vec<CidrBlock>,
}

impl TryFrom<&AclUserRule> for ParsedAclEntry {
    type Error = BrokerError;

    fn try_from(rule: &AclUserRule) -> Result<Self, Self::Error> {
        let blocks = rule
            .allowed_cidr
            .iter()
            .map(|s| CidrBlock::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ParsedAclEntry {
            user: rule.user.clone(),
            blocks,
        })
    }
}

/// The on-disk ACL document: a flat list of `[[user]]` sections, one per
/// CUBRID broker ACL user stanza.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AclDocument {
    #[serde(rename = "user", default)]
    pub users: Vec<AclUserRule>,
}

impl AclDocument {
    pub fn from_file(path: &std::path::Path) -> Result<Self, BrokerError> {
        let text = std::fs::read_to_string(path).map_err(BrokerError::from)?;
        let doc: AclDocument = toml::from_str(&text)?;
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_matches_addresses_inside_the_block() {
        let block = CidrBlock::parse("10.0.0.0/24").unwrap();
        assert!(block.contains(&"10.0.0.5".parse().unwrap()));
        assert!(!block.contains(&"10.0.1.5".parse().unwrap()));
    }

    #[test]
    fn bare_address_is_a_slash_32() {
        let block = CidrBlock::parse("192.168.1.1").unwrap();
        assert!(block.contains(&"192.168.1.1".parse().unwrap()));
        assert!(!block.contains(&"192.168.1.2".parse().unwrap()));
    }

    #[test]
    fn rejects_out_of_range_prefix() {
        assert!(CidrBlock::parse("10.0.0.0/33").is_err());
    }

    #[test]
    fn ipv6_cidr_matches() {
        let block = CidrBlock::parse("fe80::/10").unwrap();
        assert!(block.contains(&"fe80::1".parse().unwrap()));
        assert!(!block.contains(&"fc00::1".parse().unwrap()));
    }
}
