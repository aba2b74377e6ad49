use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DataLayerError>;

#[derive(Debug, Error)]
pub enum DataLayerError {
    /// Another process (or another service in this one) holds the store
    #[error("index store {0:?} is locked by another process")]
    StoreLocked(PathBuf),
    #[error("could not open index store {path:?}: {source}")]
    Open { path: PathBuf, source: sqlx::Error },
    #[error("index store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

impl DataLayerError {
    ///
    /// Classifies an error raised while opening the store at `path`,
    /// separating SQLITE_BUSY / SQLITE_LOCKED from every other failure
    ///
    pub fn from_open(path: PathBuf, err: sqlx::Error) -> Self {
        if is_lock_error(&err) {
            DataLayerError::StoreLocked(path)
        } else {
            DataLayerError::Open { path, source: err }
        }
    }
}

fn is_lock_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            // Extended result codes carry the primary code in the low byte
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}
