//! Bounded worker pool.
//!
//! Covers the dispatch loop and agent pool, pluggable executors, and the
//! process health probe consulted before every cycle.

pub mod executor;
pub mod health;
pub mod pool;

pub use executor::{CommandExecutor, ExecutorRegistry, FnExecutor, TaskExecutor};
pub use health::{HealthProbe, HealthSample, StaticProbe, SysinfoProbe};
pub use pool::{Scheduler, SchedulerEvent};
