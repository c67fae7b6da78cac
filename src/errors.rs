//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Admission rejections are not errors: the gate reports them through
/// [`ValidationResult`](crate::models::validation::ValidationResult).
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Snapshot serialization, compression, or integrity failure.
    Codec(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A declared task dependency can never complete.
    Dependency(String),
    /// A dispatched task failed while executing.
    Execution(String),
    /// Session delegation could not be carried out.
    Delegation(String),
    /// Caller is not allowed to perform the requested action.
    Unauthorized(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Dependency(msg) => write!(f, "dependency: {msg}"),
            Self::Execution(msg) => write!(f, "execution: {msg}"),
            Self::Delegation(msg) => write!(f, "delegation: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(format!("json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
