use std::io;
use std::path::PathBuf;
use thiserror::Error;

mod piece_info;
mod piece_ledger;
mod storage;

pub use piece_info::PieceInfo;
pub use piece_ledger::{Bitfield, PieceLedger, PieceState};
pub use storage::{FileEntry, FileMap, RandomAccessReadWrite};

/// Common error type of the data layer. File-related variants carry the
/// offending path.
#[derive(Debug, Error)]
pub enum Error {
    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },
    #[error("access denied: {}", path.display())]
    FileAccessDenied { path: PathBuf },
    #[error("error reading {}: {source}", path.display())]
    FileRead { path: PathBuf, source: io::Error },
    #[error("error writing {}: {source}", path.display())]
    FileWrite { path: PathBuf, source: io::Error },
    #[error("cannot create directory {}: {source}", path.display())]
    DirectoryCreate { path: PathBuf, source: io::Error },
    #[error("cannot resize file {}: {source}", path.display())]
    Resize { path: PathBuf, source: io::Error },
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(usize),
    #[error("invalid block index {1} in piece {0}")]
    InvalidBlockIndex(usize, usize),
    #[error("byte range out of bounds")]
    OutOfBounds,
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::FileNotFound { .. } => io::Error::new(io::ErrorKind::NotFound, e),
            Error::FileAccessDenied { .. } => {
                io::Error::new(io::ErrorKind::PermissionDenied, e)
            }
            Error::FileRead { .. }
            | Error::FileWrite { .. }
            | Error::DirectoryCreate { .. }
            | Error::Resize { .. } => io::Error::other(e),
            Error::InvalidPieceIndex(_) | Error::InvalidBlockIndex(..) | Error::OutOfBounds => {
                io::Error::new(io::ErrorKind::InvalidInput, e)
            }
        }
    }
}
