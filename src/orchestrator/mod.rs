//! Session orchestration.
//!
//! Covers checkpoint storage and recovery, budget-driven session
//! delegation, and the end-to-end task pipeline.

pub mod checkpoint_store;
pub mod relay;
pub mod session;

pub use checkpoint_store::CheckpointStore;
pub use relay::{Relay, RelayStatus, SubmitOutcome};
pub use session::{SessionOrchestrator, SessionReport, UsageOutcome};
