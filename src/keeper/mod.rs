pub mod eligibility;
pub mod orchestrator;
pub mod registry;
pub mod report;

pub use orchestrator::{Keeper, KeeperSettings};
pub use report::{CycleReport, KeeperStatus, PreparedClaim, RecordStatus};
