use core::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use crate::error::{StorageError, StorageResult};

pub type TransactionId = u32;

static TRANSACTION_ID: AtomicU32 = AtomicU32::new(1);

/// Transaction handle under which all storage operations run.
///
/// The handle itself is cheap to clone; cancellation raised through any
/// clone is observed by long-running scans, which roll back their attached
/// pages and propagate [`StorageError::Cancelled`].
#[derive(Clone)]
pub struct Transaction {
    // increase monotonically by 1
    id: TransactionId,

    cancelled: Arc<AtomicBool>,
}

impl Transaction {
    pub fn new() -> Self {
        let id = TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get_id(&self) -> TransactionId {
        self.id
    }

    /// Signal cancellation. The next cancellation check inside a storage
    /// call unwinds with `Cancelled`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn check_cancelled(&self) -> StorageResult<()> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

impl std::hash::Hash for Transaction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
