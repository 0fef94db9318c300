//! Local chart database: connection setup, schema migrations and the
//! table-scoped repositories behind `backend::SqliteChartStorage`.

pub mod repository;
pub mod sqlite;

pub use repository::*;
pub use sqlite::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    /// A stored value that does not parse (uuid, timestamp).
    #[error("Invalid value in column {column}: {reason}")]
    InvalidColumn { column: &'static str, reason: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },
}
