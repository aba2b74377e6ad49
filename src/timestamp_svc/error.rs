use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The backup tool reported an interrupted previous session. The
    /// backup directory has to be repaired before it can be indexed.
    #[error("backup directory is corrupted: {0}")]
    CorruptedBackup(String),
    #[error("could not read backup artifacts: {0}")]
    Io(#[from] tokio::io::Error),
}
