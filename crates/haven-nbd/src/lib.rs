//! # Haven NBD
//!
//! Runtime state of the replication data path: the NBD port pool and the
//! `qemu-nbd` processes serving QCOW2 exports on those ports.
//!
//! Neither component persists anything. Both are process-wide singletons
//! with explicit construction, passed as collaborators to the components
//! that need them; on startup the port table is rebuilt from live process
//! state by job recovery.

pub mod error;
pub mod ports;
pub mod process;

pub use error::{NbdError, NbdResult};
pub use ports::{PortAllocation, PortAllocator, PortPoolStats};
pub use process::{discover_running, DiscoveredExport, NbdProcessManager, NbdProcessStatus};
