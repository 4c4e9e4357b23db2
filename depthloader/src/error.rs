use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("store error: {0}")]
    Store(#[from] depthstore::errors::StoreError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("matrix shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("required column '{column}' missing in {file}")]
    MissingColumn { file: PathBuf, column: &'static str },

    #[error("input not found: {0}")]
    MissingInput(PathBuf),

    #[error("malformed input: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, LoaderError>;
