//! Domain model module declarations.

pub mod agent;
pub mod bridge;
pub mod checkpoint;
pub mod objective;
pub mod recovery;
pub mod session;
pub mod task;
pub mod validation;

/// Parse an RFC 3339 timestamp column into UTC.
pub(crate) fn parse_timestamp(
    field: &str,
    raw: &str,
) -> crate::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&chrono::Utc))
        .map_err(|e| crate::AppError::Db(format!("invalid {field}: {e}")))
}

/// Format a timestamp the way every table stores it.
///
/// Fixed-width microsecond precision keeps string comparison in SQL
/// consistent with chronological order.
pub(crate) fn format_timestamp(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
