use std::path::{Path, PathBuf};

use thiserror::Error;

/// Structural failures. None of these are caught inside the crate: they abort
/// the catalog or pipeline run that produced them.
#[derive(Error, Debug)]
pub enum Error {
    /// bad catalog parameters or a task directory with the wrong layout
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// the worker pool could not be built
    #[error("failed to construct worker pool: {0}")]
    PoolConstruction(String),

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {msg}", path.display())]
    Parse { path: PathBuf, msg: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn parse(path: impl AsRef<Path>, msg: impl Into<String>) -> Self {
        Self::Parse {
            path: path.as_ref().to_path_buf(),
            msg: msg.into(),
        }
    }
}

/// attach `path` to the io errors of a `Result`
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
