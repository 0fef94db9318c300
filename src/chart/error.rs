//! Typed failures crossing the reconciliation core boundary.
//!
//! Derivation never fails; only fetch and subscription problems surface here.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DatabaseError;
use crate::models::ChartTable;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(DatabaseError),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Malformed row in {table}: {reason}")]
    MalformedRow { table: ChartTable, reason: String },

    #[error("Subscription to {table} failed: {reason}")]
    Subscribe { table: ChartTable, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Chart service stopped")]
    ServiceStopped,

    #[error("No override set for tooth {0}")]
    NoOverride(String),
}

impl From<DatabaseError> for SyncError {
    /// Writes refused by the database itself surface as `PermissionDenied`.
    fn from(err: DatabaseError) -> Self {
        match &err {
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(
                    failure.code,
                    ErrorCode::ReadOnly
                        | ErrorCode::PermissionDenied
                        | ErrorCode::AuthorizationForStatementDenied
                ) =>
            {
                SyncError::PermissionDenied(err.to_string())
            }
            _ => SyncError::Storage(err),
        }
    }
}

impl SyncError {
    /// Failures that the next coalesced trigger may recover from.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Storage(_) | SyncError::Unavailable(_) | SyncError::Subscribe { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_row_message_names_table() {
        let err = SyncError::MalformedRow {
            table: ChartTable::ToothDiagnoses,
            reason: "missing id".into(),
        };
        assert_eq!(err.to_string(), "Malformed row in tooth_diagnoses: missing id");
    }

    #[test]
    fn transient_classification() {
        assert!(SyncError::Unavailable("offline".into()).is_transient());
        assert!(!SyncError::PermissionDenied("rls".into()).is_transient());
        assert!(!SyncError::ServiceStopped.is_transient());
    }

    #[test]
    fn read_only_database_maps_to_permission_denied() {
        let conn = crate::db::open_memory_database().unwrap();
        conn.pragma_update(None, "query_only", true).unwrap();
        let err = conn
            .execute("DELETE FROM tooth_diagnoses", [])
            .map_err(DatabaseError::from)
            .unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::PermissionDenied(_)));
    }

    #[test]
    fn other_database_errors_stay_storage() {
        let err = DatabaseError::InvalidColumn {
            column: "patient_id",
            reason: "bad uuid".into(),
        };
        assert!(matches!(SyncError::from(err), SyncError::Storage(_)));
    }
}
