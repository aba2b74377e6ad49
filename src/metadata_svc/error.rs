use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no metadata artifact for snapshot {0}")]
    MissingArtifact(String),
    #[error("could not read metadata artifact {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}
