// src/core/acl/mod.rs

pub mod enforcer;
pub mod rules;

pub use enforcer::AclEnforcer;
pub use rules::{AclDocument, AclUserRule, CidrBlock, ParsedAclEntry};
