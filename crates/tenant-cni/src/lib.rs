//! Tenant CNI plugin
//!
//! Invoked by the kubelet once per pod network event. ADD resolves the pod's
//! tenant through the pod index, allocates an address from the tenant subnet
//! and attaches the pod to the tenant bridge. DEL undoes that and is safe to
//! repeat. CHECK verifies the pod interface still carries its address.
//!
//! Every invocation is a fresh process; all shared state lives in the
//! file-locked stores of [`tenant_ipam`]. The CNI protocol itself (command
//! decoding, version checks, reply documents) is handled by `cni_plugin`.

pub mod commands;
pub mod error;
pub mod invocation;
pub mod reply;
pub mod settings;

pub use commands::{Attachment, Plugin, ResolvePolicy};
pub use error::CniError;
pub use invocation::Invocation;
pub use reply::SUPPORTED_VERSIONS;
pub use settings::PluginSettings;
