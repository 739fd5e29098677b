//! Replies written to stdout through `cni_plugin::reply`.

use crate::commands::Attachment;
use crate::error::CniError;
use cni_plugin::reply::{ErrorReply, SuccessReply, VersionReply};
use semver::Version;
use serde_json::json;

/// CNI versions this plugin can speak.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.4.0", "1.0.0"];

/// Result of a successful ADD.
///
/// Interface 0 is the host end of the veth, interface 1 the pod end that
/// carries the address.
pub fn success_reply(cni_version: &Version, attachment: &Attachment) -> Result<SuccessReply, CniError> {
    let gateway = attachment.gateway.to_string();
    let result = json!({
        "cniVersion": cni_version.to_string(),
        "interfaces": [
            { "name": attachment.host_if_name },
            {
                "name": attachment.if_name,
                "mac": attachment.container_mac,
                "sandbox": attachment.netns,
            },
        ],
        "ips": [{
            "address": attachment.address.to_string(),
            "gateway": gateway,
            "interface": 1,
        }],
        "routes": [{ "dst": "0.0.0.0/0", "gw": gateway }],
    });
    serde_json::from_value(result).map_err(|e| CniError::Reply(e.to_string()))
}

/// Error reply for `error`.
#[must_use]
pub fn error_reply(cni_version: Version, error: &CniError) -> ErrorReply<'static> {
    ErrorReply {
        cni_version,
        code: error.code(),
        msg: error.msg(),
        details: error.to_string(),
    }
}

/// Reply to VERSION.
#[must_use]
pub fn version_reply(cni_version: Version) -> VersionReply {
    VersionReply {
        cni_version,
        supported_versions: SUPPORTED_VERSIONS
            .iter()
            .filter_map(|v| Version::parse(v).ok())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(container_mac: Option<&str>) -> Attachment {
        Attachment {
            host_if_name: "veth0a010002".to_string(),
            if_name: "eth0".to_string(),
            netns: "/var/run/netns/cni-1".to_string(),
            container_mac: container_mac.map(str::to_string),
            address: "10.1.0.2/24".parse().unwrap(),
            gateway: "10.1.0.1".parse().unwrap(),
        }
    }

    #[test]
    fn test_success_reply_shape() {
        let reply = success_reply(&Version::new(1, 0, 0), &attachment(Some("0a:58:0a:01:00:02"))).unwrap();
        let json = serde_json::to_value(&reply).unwrap();

        assert_eq!(json["cniVersion"], "1.0.0");
        assert_eq!(json["ips"][0]["address"], "10.1.0.2/24");
        assert_eq!(json["ips"][0]["gateway"], "10.1.0.1");
        assert_eq!(json["ips"][0]["interface"], 1);
        assert_eq!(json["routes"][0]["dst"], "0.0.0.0/0");
        assert_eq!(json["interfaces"][0]["name"], "veth0a010002");
        assert_eq!(json["interfaces"][1]["sandbox"], "/var/run/netns/cni-1");
    }

    #[test]
    fn test_success_reply_without_mac() {
        let reply = success_reply(&Version::new(0, 4, 0), &attachment(None)).unwrap();
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["cniVersion"], "0.4.0");
        assert_eq!(json["interfaces"][1]["name"], "eth0");
    }

    #[test]
    fn test_error_reply_carries_code_and_details() {
        let err = CniError::TenantNotResolved("default/web-0".to_string());
        let reply = error_reply(Version::new(1, 0, 0), &err);
        assert_eq!(reply.code, 11);
        assert_eq!(reply.msg, "try again later");
        assert_eq!(reply.details, "No tenant known for pod default/web-0");
    }

    #[test]
    fn test_version_reply_lists_supported_versions() {
        let reply = version_reply(Version::new(1, 0, 0));
        assert_eq!(reply.supported_versions, vec![Version::new(0, 4, 0), Version::new(1, 0, 0)]);
    }
}
