// src/core/admin/mod.rs

//! The Admin Channel command vocabulary of §4.8: parses the raw
//! `{opcode, arg}` pair read out of an [`crate::core::scm::MailboxSlot`]
//! into a typed [`AdminAction`]. Applying the action and writing the
//! response back into the mailbox is the dispatcher's job (§4.8: "the
//! dispatcher observes new sequence numbers once per control tick and
//! acts"); this module only owns the parsing contract so `brokerctl` and
//! the dispatcher agree on argument shapes.

use crate::core::errors::BrokerError;
use crate::core::scm::AdminOpcode;

/// One fully parsed admin command, ready for the dispatcher to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminAction {
    BrokerOn,
    BrokerOff,
    Suspend,
    Resume,
    Add(usize),
    Drop(usize),
    Restart(usize),
    ConfChange { key: String, value: String },
    ResetLog,
}

impl AdminAction {
    /// Parses `arg` according to `opcode`'s expected shape. `arg` is the
    /// raw UTF-8 string `brokerctl` wrote into the mailbox slot.
    pub fn parse(opcode: AdminOpcode, arg: &str) -> Result<Self, BrokerError> {
        match opcode {
            AdminOpcode::None => Err(BrokerError::arg("empty admin opcode")),
            AdminOpcode::BrokerOn => Ok(AdminAction::BrokerOn),
            AdminOpcode::BrokerOff => Ok(AdminAction::BrokerOff),
            AdminOpcode::Suspend => Ok(AdminAction::Suspend),
            AdminOpcode::Resume => Ok(AdminAction::Resume),
            AdminOpcode::ResetLog => Ok(AdminAction::ResetLog),
            AdminOpcode::Add => parse_count(arg).map(AdminAction::Add),
            AdminOpcode::Drop => parse_count(arg).map(AdminAction::Drop),
            AdminOpcode::Restart => parse_count(arg).map(AdminAction::Restart),
            AdminOpcode::ConfChange => {
                let (key, value) = arg
                    .split_once('=')
                    .ok_or_else(|| BrokerError::arg("conf_change arg must be 'key=value'"))?;
                if key.trim().is_empty() {
                    return Err(BrokerError::arg("conf_change key cannot be empty"));
                }
                Ok(AdminAction::ConfChange {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                })
            }
        }
    }

    /// The mailbox opcode this action would be submitted under, used by
    /// `brokerctl` when building a command.
    pub fn opcode(&self) -> AdminOpcode {
        match self {
            AdminAction::BrokerOn => AdminOpcode::BrokerOn,
            AdminAction::BrokerOff => AdminOpcode::BrokerOff,
            AdminAction::Suspend => AdminOpcode::Suspend,
            AdminAction::Resume => AdminOpcode::Resume,
            AdminAction::Add(_) => AdminOpcode::Add,
            AdminAction::Drop(_) => AdminOpcode::Drop,
            AdminAction::Restart(_) => AdminOpcode::Restart,
            AdminAction::ConfChange { .. } => AdminOpcode::ConfChange,
            AdminAction::ResetLog => AdminOpcode::ResetLog,
        }
    }

    /// The mailbox argument string this action would be submitted with.
    pub fn arg_string(&self) -> String {
        match self {
            AdminAction::Add(n) | AdminAction::Drop(n) | AdminAction::Restart(n) => n.to_string(),
            AdminAction::ConfChange { key, value } => format!("{key}={value}"),
            _ => String::new(),
        }
    }
}

fn parse_count(arg: &str) -> Result<usize, BrokerError> {
    arg.trim()
        .parse::<usize>()
        .map_err(|_| BrokerError::arg(format!("expected an integer count, got '{arg}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_broker_on_off() {
        assert_eq!(AdminAction::parse(AdminOpcode::BrokerOn, "").unwrap(), AdminAction::BrokerOn);
        assert_eq!(AdminAction::parse(AdminOpcode::BrokerOff, "").unwrap(), AdminAction::BrokerOff);
    }

    #[test]
    fn parses_add_and_drop_counts() {
        assert_eq!(AdminAction::parse(AdminOpcode::Add, "3").unwrap(), AdminAction::Add(3));
        assert_eq!(AdminAction::parse(AdminOpcode::Drop, "1").unwrap(), AdminAction::Drop(1));
        assert!(AdminAction::parse(AdminOpcode::Add, "nope").is_err());
    }

    #[test]
    fn parses_conf_change_key_value() {
        let action = AdminAction::parse(AdminOpcode::ConfChange, "time_to_kill=60").unwrap();
        assert_eq!(
            action,
            AdminAction::ConfChange {
                key: "time_to_kill".into(),
                value: "60".into(),
            }
        );
    }

    #[test]
    fn round_trips_opcode_and_arg_string() {
        let action = AdminAction::Restart(2);
        assert_eq!(action.opcode(), AdminOpcode::Restart);
        assert_eq!(action.arg_string(), "2");
    }
}
