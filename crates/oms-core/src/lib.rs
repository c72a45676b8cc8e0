//! Filesystem-coordinated scheduling core.
//!
//! No database, no RPC between peer instances: every coordination fact is
//! carried by the *name* of a file under a shared job-control root that all
//! instances can read and write (spec §2 "System Overview"). This crate is
//! the pure/async engine; the root `omsd` binary owns configuration, HTTP,
//! and process wiring.

pub mod catalog;
pub mod compute;
pub mod diskuse;
pub mod error;
pub mod heartbeat;
pub mod job;
pub mod launch;
pub mod paths;
pub mod planner;
pub mod stamp;
pub mod supervisor;

pub use catalog::{DiskUseSnapshot, ResourceTotals, RunCatalog, RunState, RunStateView};
pub use compute::{ComputeConfig, ComputeItem, ComputeRegistry, ServerState};
pub use error::{SchedError, SchedResult};
pub use job::{ResourceDemand, RunJob};
pub use stamp::Stamp;
