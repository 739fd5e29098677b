//! Network Backend
//!
//! The only contact the tenant controller and the CNI plugin have with the
//! kernel networking stack. Callers decide when and with which parameters a
//! device, neighbor, route or firewall rule is needed; the backend makes it so.
//!
//! # Example
//!
//! ```no_run
//! use net_backend::{NetlinkBackend, NetworkBackend};
//!
//! # async fn example() -> Result<(), net_backend::BackendError> {
//! let backend = NetlinkBackend::connect()?;
//! let bridge = backend
//!     .ensure_bridge("br-acme", 1450, "10.1.0.1/24".parse().unwrap())
//!     .await?;
//! println!("bridge {} has index {}", bridge.name, bridge.index);
//! # Ok(())
//! # }
//! ```
//!
//! Every `ensure_*`, `add_*` and rule operation is idempotent, and every
//! delete of something already gone succeeds, so partially applied state is
//! repaired by simply running the same sequence again.

pub mod error;
mod iptables;
pub mod netlink;
mod netns;
#[path = "trait.rs"]
pub mod backend_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use backend_trait::{DeviceHandle, NeighborKind, NetworkBackend, VethInfo};
pub use netlink::{host_veth_name, NetlinkBackend};
pub use error::BackendError;
#[cfg(feature = "test-util")]
pub use mock::{BackendCall, MockNetworkBackend};
