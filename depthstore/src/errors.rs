use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("staging file error: {0}")]
    Staging(#[from] csv::Error),

    #[error("staging row malformed: {0}")]
    StagingRow(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database parent directory could not be created: {0}")]
    DatabaseDir(PathBuf),

    #[error("every load strategy failed; last error: {0}")]
    AllStrategiesFailed(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
