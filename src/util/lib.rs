//! Utility crate for the ployz network control plane daemon: error
//! taxonomy, on-disk configuration, small-file persistence and
//! cluster-wide identifiers shared by every other `ployz_*` crate.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod error;
pub mod id;
pub mod model;
pub mod persister;
pub mod time;
pub mod version;
