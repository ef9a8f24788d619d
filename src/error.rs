use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("corrupt archive: {reason}")]
    CorruptArchive { reason: String },

    #[error("hardlink '{path}' points at '{target}', which has not been extracted")]
    DanglingHardlink { path: String, target: String },

    #[error("entry '{path}' resolves outside the destination directory")]
    PathEscapesDestination { path: String },

    #[error("symlink '{path}' points outside the destination directory: '{target}'")]
    SymlinkEscape { path: String, target: String },

    #[error("failed to extract '{path}': {source}")]
    Io { path: String, source: io::Error },

    #[error("failed to read archive: {0}")]
    Read(#[source] io::Error),

    #[error("failed to open archive '{}': {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },
}

impl Error {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: &str, source: io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
