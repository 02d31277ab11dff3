//! Source-rewrite rule bindings: an iptables-backed implementation for Linux
//! and an in-memory one with the same delta semantics for tests.

mod memory;

#[cfg(target_os = "linux")]
mod iptables;

pub use memory::MemorySnatRules;

#[cfg(target_os = "linux")]
pub use iptables::IptablesSnatRules;

/// Chain owned by this control plane, jumped to from `POSTROUTING`.
pub const SNAT_CHAIN: &str = "KEEL-SNAT";
