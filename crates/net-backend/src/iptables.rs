//! FORWARD chain rules
//!
//! Filter rules live in the xtables tables, which rtnetlink does not reach,
//! so they are managed through the `iptables` binary. Presence is decided by
//! the exit status of `iptables -C`, never by its output.

use crate::error::BackendError;
use ipnet::Ipv4Net;
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::{debug, info};

/// Where a new rule goes in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Position {
    /// Appended, evaluated after existing rules
    Append,
    /// Inserted, evaluated before existing rules
    Insert,
}

/// One rule of the FORWARD chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ForwardRule {
    source: Option<Ipv4Net>,
    destination: Option<Ipv4Net>,
    target: &'static str,
}

impl ForwardRule {
    pub(crate) fn accept_from(cidr: Ipv4Net) -> Self {
        Self { source: Some(cidr), destination: None, target: "ACCEPT" }
    }

    pub(crate) fn accept_to(cidr: Ipv4Net) -> Self {
        Self { source: None, destination: Some(cidr), target: "ACCEPT" }
    }

    pub(crate) fn drop_between(from: Ipv4Net, to: Ipv4Net) -> Self {
        Self { source: Some(from), destination: Some(to), target: "DROP" }
    }

    fn args(&self, action: &str) -> Vec<String> {
        let mut args = vec!["-w".to_string(), action.to_string(), "FORWARD".to_string()];
        if let Some(source) = self.source {
            args.extend(["-s".to_string(), source.to_string()]);
        }
        if let Some(destination) = self.destination {
            args.extend(["-d".to_string(), destination.to_string()]);
        }
        args.extend(["-j".to_string(), self.target.to_string()]);
        args
    }
}

/// Runs `iptables` for the FORWARD chain.
#[derive(Debug, Clone)]
pub(crate) struct Iptables {
    program: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self { program: "iptables".to_string() }
    }
}

impl Iptables {
    async fn status(&self, args: &[String]) -> Result<(ExitStatus, String), BackendError> {
        debug!("Running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program).args(args).output().await?;
        Ok((output.status, String::from_utf8_lossy(&output.stderr).trim().to_string()))
    }

    fn failure(&self, args: &[String], status: ExitStatus, stderr: String) -> BackendError {
        BackendError::Command {
            command: format!("{} {}", self.program, args.join(" ")),
            status: status.to_string(),
            stderr,
        }
    }

    /// Adds `rule` unless the chain already holds it.
    pub(crate) async fn ensure(&self, rule: &ForwardRule, position: Position) -> Result<(), BackendError> {
        let check = rule.args("-C");
        let (status, stderr) = self.status(&check).await?;
        if status.success() {
            return Ok(());
        }
        // Exit status 1 means the rule is absent; anything else is a real failure.
        if status.code() != Some(1) {
            return Err(self.failure(&check, status, stderr));
        }

        let add = rule.args(match position {
            Position::Append => "-A",
            Position::Insert => "-I",
        });
        let (status, stderr) = self.status(&add).await?;
        if !status.success() {
            return Err(self.failure(&add, status, stderr));
        }
        info!("Added FORWARD rule: {}", add[2..].join(" "));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_accept_rules() {
        assert_eq!(
            ForwardRule::accept_from(net("10.1.0.0/24")).args("-A"),
            vec!["-w", "-A", "FORWARD", "-s", "10.1.0.0/24", "-j", "ACCEPT"]
        );
        assert_eq!(
            ForwardRule::accept_to(net("10.1.0.0/24")).args("-C"),
            vec!["-w", "-C", "FORWARD", "-d", "10.1.0.0/24", "-j", "ACCEPT"]
        );
    }

    #[test]
    fn test_drop_rule() {
        assert_eq!(
            ForwardRule::drop_between(net("10.1.0.0/24"), net("10.1.1.0/24")).args("-I"),
            vec!["-w", "-I", "FORWARD", "-s", "10.1.0.0/24", "-d", "10.1.1.0/24", "-j", "DROP"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_io_error() {
        let iptables = Iptables { program: "/nonexistent/iptables".to_string() };
        let err = iptables
            .ensure(&ForwardRule::accept_from(net("10.1.0.0/24")), Position::Append)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Io(_)));
    }
}
