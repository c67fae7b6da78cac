//! Persistence layer modules.

pub mod bridge_repo;
pub mod checkpoint_repo;
pub mod compression;
pub mod db;
pub mod objective_repo;
pub mod recovery_repo;
pub mod retention;
pub mod schema;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
