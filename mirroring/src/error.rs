use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error that can be returned by the mirroring components.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O errors.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Index store errors.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// The identifier is already pending in the scheduler.
    #[error("scheduler identifier already present")]
    DuplicateId,

    /// The root is already registered in the index.
    #[error("root already registered: {0}")]
    DuplicateRoot(String),

    /// A path that must be a directory is not one.
    #[error("not a directory: {0}")]
    NotADirectory(String),
}
