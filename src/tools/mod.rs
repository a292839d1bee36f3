//! Typed argument structs for every external tool the installer runs.
//!
//! - [`disk`]: partitioning, filesystem creation, mounting, swap
//! - [`nixos`]: configuration generation, system build, bootloader, hooks

pub mod disk;
pub mod nixos;
