//! Discover, enrich and persist devices in one run.

mod orchestrator;
mod result;

pub use orchestrator::SyncError;
pub use orchestrator::SyncOrchestrator;
pub use orchestrator::SyncPhase;
pub use orchestrator::SyncSettings;
pub use result::FailureKind;
pub use result::SyncFailure;
pub use result::SyncResult;
