use std::io;

use thiserror::Error;

use crate::types::PageId;

/// Error taxonomy of the storage core.
///
/// Every mutating operation is wrapped so that on any error the owning file
/// recovers its attached pages before the error crosses the subfile
/// boundary. `BadDataPage` is special: the vector file's attach path and the
/// verify paths catch it to probe for page existence, everywhere else it is
/// rethrown.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The requested page is beyond the file's last page, or its checksum
    /// does not match the stored content.
    #[error("bad data page: {0}")]
    BadDataPage(PageId),

    /// An insert found a predecessor entry with an equal key.
    #[error("uniqueness violation on key {0}")]
    UniquenessViolation(u32),

    #[error("bad argument: {0}")]
    BadArgument(String),

    /// An area primitive was asked of a page kind that has no areas.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The transaction was cancelled; no side effects remain beyond the
    /// rollback of attached pages.
    #[error("operation cancelled")]
    Cancelled,

    /// Rollback itself failed. The file has been marked unavailable through
    /// the injected availability sink.
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    /// A verify pass found an on-disk inconsistency.
    #[error("corrupted: {0}")]
    Corrupted(String),
}

impl StorageError {
    pub fn bad_argument(msg: impl Into<String>) -> Self {
        StorageError::BadArgument(msg.into())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
