// vim: tw=80
//! Small-write engine for parity RAID groups, with a write-log journal that
//! closes the write hole while the group is degraded.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// Mock objects are substituted for real ones in test builds.
#![allow(clippy::module_inception)]

// rstest_reuse must be imported at the crate root for macro reasons
#[cfg(test)]
#[allow(clippy::single_component_path_imports)]
use rstest_reuse;

pub mod block;
pub mod config;
pub mod drive_op;
pub mod eboard;
pub mod engine;
pub mod geometry;
pub mod gf256;
pub mod mem_drive;
pub mod memory;
pub mod monitor;
pub mod parity;
pub mod planner;
pub mod scheduler;
pub mod stripe_op;
pub mod transport;
pub mod types;
pub mod util;
pub mod verify;
pub mod write_log;

pub use crate::types::*;
pub use crate::util::*;
