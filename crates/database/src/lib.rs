//! SQLite storage behind the SQL tools.
//!
//! One serialized connection per process. Reads go through a read-only
//! guard; writes are reserved for schema setup and seeding.

pub mod params;
pub mod seed;
pub mod sqlite;

pub use seed::{SeedOptions, SeedReport, seed};
pub use sqlite::{Database, ExecuteResult, QueryResult};

/// Database-level errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Invalid database URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to open database: {0}")]
    Connect(String),

    #[error("sql_query only allows read-only SELECT/CTE statements")]
    ReadOnlyViolation,

    #[error("Invalid query parameters: {0}")]
    InvalidParams(String),

    #[error("Query failed: {0}")]
    Query(String),
}
