use std::{path::Path, path::PathBuf, sync::Arc};

use log::{debug, error};

use crate::{
    error::{StorageError, StorageResult},
    fileid::{FileId, OpenMode},
    fix_mode::FixMode,
    transaction::Transaction,
    version::{Timestamp, VersionFile},
};

/// External sink notified when a file becomes unavailable because rollback
/// itself failed. Injected at construction; the storage core never reaches
/// into a global.
pub type AvailabilitySink = Arc<dyn Fn(&Path) + Send + Sync>;

/// One on-disk file: a directory of versioned pages plus the open-state
/// bookkeeping shared by every storage engine.
///
/// All lifecycle operations forward to the version store after asserting
/// local invariants; the engines layer their page caches on top.
pub struct SubFile {
    fileid: FileId,
    version: VersionFile,
    fix_mode: FixMode,
    opened: bool,
    availability: Option<AvailabilitySink>,
}

impl SubFile {
    pub fn new(fileid: FileId) -> StorageResult<Self> {
        fileid.validate()?;
        let version =
            VersionFile::new(fileid.get_path(), fileid.get_page_size());
        Ok(Self {
            fileid,
            version,
            fix_mode: FixMode::READ_ONLY,
            opened: false,
            availability: None,
        })
    }

    pub fn set_availability_sink(&mut self, sink: AvailabilitySink) {
        self.availability = Some(sink);
    }

    /// Report the file unavailable. Called when a rollback fails and the
    /// on-disk state can no longer be trusted.
    pub fn mark_unavailable(&self) {
        error!("file marked unavailable: {:?}", self.fileid.get_path());
        if let Some(sink) = &self.availability {
            sink(self.fileid.get_path());
        }
    }

    pub fn get_fileid(&self) -> &FileId {
        &self.fileid
    }

    pub fn get_version_file(&self) -> &VersionFile {
        &self.version
    }

    pub fn get_page_size(&self) -> usize {
        self.fileid.get_page_size()
    }

    pub fn get_fix_mode(&self) -> FixMode {
        self.fix_mode
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn create(&self, tx: &Transaction) -> StorageResult<()> {
        self.version.create(tx)
    }

    pub fn destroy(&self, tx: &Transaction) -> StorageResult<()> {
        self.version.destroy(tx)
    }

    pub fn mount(&self, tx: &Transaction) -> StorageResult<()> {
        self.version.mount(tx)
    }

    pub fn unmount(&self, tx: &Transaction) -> StorageResult<()> {
        self.version.unmount(tx)
    }

    pub fn is_mounted(&self, _tx: &Transaction) -> bool {
        self.version.is_mounted()
    }

    pub fn is_accessible(&self, _force: bool) -> bool {
        self.version.is_accessible()
    }

    pub fn get_size(&self) -> u64 {
        self.version.get_size()
    }

    pub fn flush(&self, tx: &Transaction) -> StorageResult<()> {
        self.version.flush(tx)
    }

    pub fn sync(
        &self,
        tx: &Transaction,
        incomplete: &mut bool,
        modified: &mut bool,
    ) -> StorageResult<()> {
        self.version.sync(tx, incomplete, modified)
    }

    pub fn start_backup(
        &self,
        tx: &Transaction,
        restorable: bool,
    ) -> StorageResult<()> {
        self.version.start_backup(tx, restorable)
    }

    pub fn end_backup(&self, tx: &Transaction) -> StorageResult<()> {
        self.version.end_backup(tx)
    }

    pub fn recover(
        &self,
        tx: &Transaction,
        point: Timestamp,
    ) -> StorageResult<()> {
        self.version.recover(tx, point)
    }

    pub fn restore(
        &self,
        tx: &Transaction,
        point: Timestamp,
    ) -> StorageResult<()> {
        self.version.restore(tx, point)
    }

    /// Rename the file's directory. The version store is left at the old
    /// path when the rename fails.
    pub fn move_to(
        &mut self,
        tx: &Transaction,
        new_path: impl Into<PathBuf>,
    ) -> StorageResult<()> {
        let new_path = new_path.into();
        self.version.move_to(tx, &new_path)?;
        self.fileid.set_path(new_path);
        Ok(())
    }

    /// Record a path change performed by a parent-directory rename.
    pub fn relocate(&mut self, new_path: impl Into<PathBuf>) {
        let new_path = new_path.into();
        self.version.relocate(new_path.clone());
        self.fileid.set_path(new_path);
    }

    /// Bind the file to a transaction's access mode. Every page attach
    /// until `close` uses the fix mode derived here.
    pub fn open(&mut self, tx: &Transaction, mode: OpenMode) -> StorageResult<()> {
        if mode == OpenMode::Update && self.fileid.is_read_only() {
            return Err(StorageError::bad_argument(
                "update open on a read-only file",
            ));
        }
        if !self.version.is_mounted() {
            if !self.fileid.is_mounted() {
                return Err(StorageError::bad_argument(
                    "file is configured unmounted; mount it first",
                ));
            }
            self.version.mount(tx)?;
        }
        self.fix_mode = match mode {
            OpenMode::Read => FixMode::READ_ONLY,
            OpenMode::Update => FixMode::WRITE | FixMode::DISCARDABLE,
        };
        self.opened = true;
        debug!(
            "subfile opened, path: {:?}, mode: {:?}",
            self.fileid.get_path(),
            mode
        );
        Ok(())
    }

    pub fn close(&mut self) {
        self.opened = false;
        self.fix_mode = FixMode::READ_ONLY;
    }
}
