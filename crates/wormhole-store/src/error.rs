use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Record not found")]
    NotFound,

    #[error("Database has tables but no schema version; it may be corrupt")]
    Corrupt,

    #[error("Database schema is version {found}, this server expects {expected}")]
    Version { found: i64, expected: i64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
