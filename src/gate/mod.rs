//! Admission gate.
//!
//! Scores incoming [`TaskRequest`](crate::models::task::TaskRequest)s for
//! clarity, relevance and capability readiness before they reach the
//! scheduler.

pub mod evaluator;
pub mod text;

pub use evaluator::ContextGate;
