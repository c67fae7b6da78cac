#![forbid(unsafe_code)]

//! Context-bounded multi-agent task orchestration.
//!
//! Requests pass an admission [`gate`], are checkpointed and executed by a
//! bounded [`scheduler`] worker pool, and charge a per-session context
//! budget that the [`orchestrator`] hands off to a child session before it
//! runs out.

pub mod config;
pub mod errors;
pub mod gate;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod scheduler;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
