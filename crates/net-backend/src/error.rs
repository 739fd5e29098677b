//! Network backend errors

use nix::errno::Errno;
use thiserror::Error;

/// Errors returned by a [`crate::NetworkBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The kernel rejected a netlink request
    #[error("{op} failed: {source}")]
    Netlink {
        op: String,
        #[source]
        source: rtnetlink::Error,
    },

    /// A network namespace could not be entered
    #[error("Network namespace {netns}: {reason}")]
    Namespace { netns: String, reason: String },

    /// An external tool exited with a failure status
    #[error("{command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    /// A netlink socket, thread or kernel file could not be set up
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A MAC address string could not be parsed
    #[error("Invalid MAC address {0}")]
    InvalidMac(String),

    /// A device that must exist does not
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
}

impl BackendError {
    pub(crate) fn netlink(op: impl Into<String>, source: rtnetlink::Error) -> Self {
        Self::Netlink { op: op.into(), source }
    }

    /// Kernel errno carried by a netlink failure.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Netlink { source, .. } => netlink_errno(source),
            _ => None,
        }
    }
}

/// Errno of a netlink error reply. The kernel reports it negated.
pub(crate) fn netlink_errno(error: &rtnetlink::Error) -> Option<Errno> {
    match error {
        rtnetlink::Error::NetlinkError(message) => Some(Errno::from_raw(-message.raw_code())),
        _ => None,
    }
}

/// Netlink error reply carrying `errno`.
#[cfg(test)]
pub(crate) fn kernel_error(errno: Errno) -> rtnetlink::Error {
    let mut message = rtnetlink::packet_core::ErrorMessage::default();
    message.code = std::num::NonZeroI32::new(-(errno as i32));
    rtnetlink::Error::NetlinkError(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_of_kernel_reply() {
        let err = BackendError::netlink("link add br-acme", kernel_error(Errno::EEXIST));
        assert_eq!(err.errno(), Some(Errno::EEXIST));
        assert!(err.to_string().starts_with("link add br-acme failed"));
    }

    #[test]
    fn test_errno_of_other_failures() {
        assert_eq!(BackendError::DeviceNotFound("br-acme".to_string()).errno(), None);
        assert_eq!(
            BackendError::netlink("link get", rtnetlink::Error::NamespaceError("gone".to_string())).errno(),
            None
        );
    }
}
