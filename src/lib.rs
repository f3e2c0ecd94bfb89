//! Workspace umbrella crate.
//!
//! Exposes feature flags that map to the individual workspace crates. Hosts
//! depend on `mpc-offline-workspace` and enable `desktop-shims` for the full
//! service with desktop bridges, or `engine` for the bare cache engine they
//! wire themselves.

#[cfg(feature = "desktop-shims")]
pub use core_service as service;

#[cfg(feature = "engine")]
pub use core_offline as engine;
