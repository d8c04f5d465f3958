use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};
use thiserror::Error;

use tenantry_core::audit::AuditError;
use tenantry_core::directory::StoreError;

pub mod audit_log;
pub mod tenant;

pub use audit_log::SqlAuditLogRepository;
pub use tenant::SqlTenantDirectory;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(sqlx::Error::Database(error))
                if error.is_unique_violation() =>
            {
                StoreError::Conflict(error.message().to_owned())
            }
            RepositoryError::Database(error) => StoreError::Unavailable(error.to_string()),
            RepositoryError::Decode(message) => StoreError::Decode(message),
        }
    }
}

impl From<RepositoryError> for AuditError {
    fn from(value: RepositoryError) -> Self {
        AuditError::Storage(value.to_string())
    }
}

pub(crate) fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(e.to_string()))
}

/// Fixed-width UTC text so lexical order matches time order.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("timestamp `{raw}`: {e}")))
}

pub(crate) fn parse_optional_timestamp(
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn non_negative<T: TryFrom<i64>>(value: i64, name: &str) -> Result<T, RepositoryError> {
    T::try_from(value).map_err(|_| RepositoryError::Decode(format!("{name} out of range: {value}")))
}

pub(crate) fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{format_timestamp, parse_timestamp, RepositoryError};
    use tenantry_core::directory::StoreError;

    #[test]
    fn timestamps_are_fixed_width_and_round_trip() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("valid");
        let late = early + chrono::Duration::microseconds(1_500_001);

        let early_text = format_timestamp(early);
        let late_text = format_timestamp(late);

        assert_eq!(early_text, "2026-01-02T03:04:05.000000Z");
        assert_eq!(early_text.len(), late_text.len());
        assert!(early_text < late_text);
        assert_eq!(parse_timestamp(&late_text).expect("parse"), late);
    }

    #[test]
    fn decode_errors_surface_as_store_decode_errors() {
        let error = parse_timestamp("yesterday").expect_err("not rfc3339");
        assert!(matches!(error, RepositoryError::Decode(_)));
        assert!(matches!(StoreError::from(error), StoreError::Decode(_)));
    }
}
