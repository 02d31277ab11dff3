//! Bindings to the kernel IPVS table: a generic-netlink implementation for
//! Linux and an in-memory table with identical semantics for off-target
//! development and deterministic tests.

mod memory;
pub mod wire;

#[cfg(target_os = "linux")]
mod netlink;

pub use memory::MemoryLbTable;

#[cfg(target_os = "linux")]
pub use netlink::NetlinkLbTable;
