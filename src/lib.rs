//! Storage core of a relational engine.
//!
//! Four layers, leaves first: a version-managed block store (`version`), a
//! typed physical page layer above it (`physical`), and the storage engines
//! sharing them: an ordered B-tree file (`btree`), a ROWID -> record vector
//! file (`vector`) and a direct-area blob file with a sidecar B-tree index
//! (`direct`). Everything above — planner, executor, catalogs — delegates
//! durability and ordering to this crate.

mod error;
mod fileid;
mod fix_mode;
mod subfile;
mod transaction;
mod types;
mod util;
mod verify;

pub mod btree;
pub mod direct;
pub mod physical;
pub mod vector;
pub mod version;

pub mod test_utils;

pub use error::{StorageError, StorageResult};
pub use fileid::{FileId, OpenMode, CURRENT_FORMAT_VERSION, DEFAULT_PAGE_SIZE};
pub use fix_mode::FixMode;
pub use subfile::{AvailabilitySink, SubFile};
pub use transaction::{Transaction, TransactionId};
pub use types::{
    AreaId, PageId, RowId, ILLEGAL_PAGE_ID, UNDEFINED_AREA_ID,
    UNDEFINED_PAGE_ID,
};
pub use verify::{Progress, VerifyTreatment};
