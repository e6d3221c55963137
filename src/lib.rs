//! mp_ipc - shared-memory coordination for heterogeneous multi-core IPC
//!
//! Several independently booted processors share physical memory regions
//! and talk to a privileged broker over a command channel. This crate gives
//! them a common vocabulary on top of that:
//!
//! - [`multiproc`]: processor identities and names
//! - [`sharedregion`]: region directory and portable pointers
//! - [`gate`]: mutual exclusion, local or across processors
//! - [`list`]: a doubly linked list living in shared memory
//! - [`command`]: the broker command table and dispatcher
//!
//! Everything hangs off an explicit [`Context`]; there is no global state
//! apart from the optional [`console`] logger.

#![no_std]
// Shared-memory code leans on explicit casts between addresses and integers
#![allow(clippy::unnecessary_cast)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod command;
pub mod config;
pub mod console;
pub mod context;
pub mod error;
pub mod gate;
pub mod list;
pub mod lock;
pub mod multiproc;
pub mod platform;
pub mod sharedregion;

pub use config::{GateConfig, IpcConfig};
pub use context::Context;
pub use error::{IpcError, IpcResult};
pub use gate::{Gate, GateKey, GateParams, ProtectionLevel};
pub use list::{ListElem, ListMp};
pub use multiproc::{MultiProcConfig, ProcessorId};
pub use platform::{Platform, Timeout};
pub use sharedregion::{PortablePtr, RegionId};

#[cfg(any(test, feature = "std"))]
pub use platform::HostPlatform;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
