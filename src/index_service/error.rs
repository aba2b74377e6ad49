use thiserror::Error;

use crate::{data_layer_error::DataLayerError, metadata_svc, timestamp_svc::{self, Timestamp}};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    DataLayerError(#[from] DataLayerError),
    #[error(transparent)]
    TimestampError(#[from] timestamp_svc::error::Error),
    #[error(transparent)]
    MetadataError(#[from] metadata_svc::error::Error),
    #[error("increment {0} is not part of the current increment chain")]
    UnknownIncrement(Timestamp),
}

impl Error {
    ///
    /// True if the store is held by another process; the caller may retry
    /// with a different store location
    ///
    pub fn is_store_locked(&self) -> bool {
        matches!(self, Error::DataLayerError(DataLayerError::StoreLocked(_)))
    }

    ///
    /// True if the backup directory needs the backup tool's own repair step
    /// before it can be synced
    ///
    pub fn is_corrupted_backup(&self) -> bool {
        matches!(self, Error::TimestampError(timestamp_svc::error::Error::CorruptedBackup(_)))
    }
}
