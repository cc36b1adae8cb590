//! Version-managed block store.
//!
//! The upper layers see this module through a narrow contract: pages are
//! borrowed with [`VersionFile::fix`] under a transaction, returned with
//! `unfix` (written back iff dirty) or `recover_page` (modifications
//! dropped), and every page carries a CRC32 trailer that is verified on
//! every read fix. A fix of a page beyond the last page, or of a page whose
//! checksum does not match, raises `BadDataPage`.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::debug;

use crate::{
    error::{StorageError, StorageResult},
    fix_mode::FixMode,
    transaction::Transaction,
    types::PageId,
};

/// Timestamp handed to recover/restore, as issued by the transaction layer.
pub type Timestamp = u64;

const MASTER_FILE: &str = "master.dat";
const BACKUP_FILE: &str = "master.bak";

/// Trailing bytes of every on-disk page: little-endian CRC32 of the content.
const CRC_SIZE: usize = 4;

/// Usable bytes of a version page for a given page size.
pub fn content_size(page_size: usize) -> usize {
    page_size - CRC_SIZE
}

/// A fixed page: the caller-owned buffered copy of one version page.
///
/// Mutations go through `buffer_mut` and must be announced with `dirty()`;
/// the unfix mode is derived from that mark. Dropping the page without an
/// explicit unfix is equivalent to recovering it.
pub struct VersionPage {
    id: PageId,
    buf: Vec<u8>,
    dirty: bool,
    writable: bool,
}

impl VersionPage {
    pub fn get_page_id(&self) -> PageId {
        self.id
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.writable);
        &mut self.buf
    }

    pub fn dirty(&mut self) {
        debug_assert!(self.writable);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

struct State {
    file: Option<File>,
    page_count: u32,
    modified_since_sync: bool,
}

/// File-backed version store for one subfile.
///
/// On disk this is a directory holding a master file of fixed-size pages;
/// moving the subfile is a directory rename. Snapshot backup/recover work
/// on a copy of the master file inside the same directory.
pub struct VersionFile {
    path: PathBuf,
    page_size: usize,
    state: Mutex<State>,
}

impl VersionFile {
    pub fn new(path: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            path: path.into(),
            page_size,
            state: Mutex::new(State {
                file: None,
                page_count: 0,
                modified_since_sync: false,
            }),
        }
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size
    }

    pub fn get_content_size(&self) -> usize {
        content_size(self.page_size)
    }

    fn master_path(&self) -> PathBuf {
        self.path.join(MASTER_FILE)
    }

    pub fn create(&self, _tx: &Transaction) -> StorageResult<()> {
        fs::create_dir_all(&self.path)?;
        File::create(self.master_path())?;
        self.do_mount()?;
        debug!("version file created, path: {:?}", self.path);
        Ok(())
    }

    pub fn destroy(&self, _tx: &Transaction) -> StorageResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.file = None;
        }
        if self.path.exists() {
            fs::remove_dir_all(&self.path)?;
        }
        Ok(())
    }

    pub fn mount(&self, _tx: &Transaction) -> StorageResult<()> {
        self.do_mount()
    }

    fn do_mount(&self) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.master_path())?;
        let len = file.metadata()?.len() as usize;
        state.page_count = (len / self.page_size) as u32;
        state.file = Some(file);
        Ok(())
    }

    pub fn unmount(&self, _tx: &Transaction) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.file = None;
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.state.lock().unwrap().file.is_some()
    }

    pub fn is_accessible(&self) -> bool {
        self.master_path().exists()
    }

    pub fn get_size(&self) -> u64 {
        fs::metadata(self.master_path()).map(|m| m.len()).unwrap_or(0)
    }

    pub fn get_page_count(&self) -> u32 {
        self.state.lock().unwrap().page_count
    }

    /// Borrow a buffered copy of one page.
    ///
    /// `ALLOCATE` extends the file up to the requested page (zero filled)
    /// and returns a zeroed buffer without reading the backing store.
    pub fn fix(
        &self,
        _tx: &Transaction,
        page_id: PageId,
        mode: FixMode,
    ) -> StorageResult<VersionPage> {
        let content = self.get_content_size();
        let mut state = self.state.lock().unwrap();

        if mode.is_allocate() {
            if page_id >= state.page_count {
                self.extend_to(&mut state, page_id)?;
            }
            return Ok(VersionPage {
                id: page_id,
                buf: vec![0u8; content],
                dirty: false,
                writable: true,
            });
        }

        if page_id >= state.page_count {
            return Err(StorageError::BadDataPage(page_id));
        }

        let file = state
            .file
            .as_mut()
            .ok_or_else(|| StorageError::bad_argument("file is not mounted"))?;

        let mut raw = vec![0u8; self.page_size];
        file.seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
        file.read_exact(&mut raw)?;

        let stored = u32::from_le_bytes(raw[content..].try_into().unwrap());
        if stored != crc32fast::hash(&raw[..content]) {
            return Err(StorageError::BadDataPage(page_id));
        }

        raw.truncate(content);
        Ok(VersionPage {
            id: page_id,
            buf: raw,
            dirty: false,
            writable: mode.is_writable(),
        })
    }

    /// Return a fixed page. The content is written back iff the page was
    /// marked dirty; `dirty` forces the decision for callers that track the
    /// mark themselves.
    pub fn unfix(&self, page: VersionPage, dirty: bool) -> StorageResult<()> {
        if !(dirty || page.dirty) {
            return Ok(());
        }
        debug_assert!(page.writable);

        let mut state = self.state.lock().unwrap();
        self.write_page(&mut state, page.id, &page.buf)?;
        state.modified_since_sync = true;
        Ok(())
    }

    /// Drop a fixed page's modifications, restoring the pre-fix content
    /// (which still lives in the backing store untouched).
    pub fn recover_page(&self, page: VersionPage) {
        drop(page);
    }

    /// Cut the file down to `keep` pages.
    pub fn truncate(&self, _tx: &Transaction, keep: u32) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| StorageError::bad_argument("file is not mounted"))?;
        file.set_len(keep as u64 * self.page_size as u64)?;
        state.page_count = keep;
        state.modified_since_sync = true;
        Ok(())
    }

    pub fn flush(&self, _tx: &Transaction) -> StorageResult<()> {
        let state = self.state.lock().unwrap();
        if let Some(file) = state.file.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn sync(
        &self,
        tx: &Transaction,
        incomplete: &mut bool,
        modified: &mut bool,
    ) -> StorageResult<()> {
        self.flush(tx)?;
        let mut state = self.state.lock().unwrap();
        *incomplete = false;
        *modified = state.modified_since_sync;
        state.modified_since_sync = false;
        Ok(())
    }

    pub fn start_backup(
        &self,
        tx: &Transaction,
        _restorable: bool,
    ) -> StorageResult<()> {
        self.flush(tx)?;
        fs::copy(self.master_path(), self.path.join(BACKUP_FILE))?;
        Ok(())
    }

    pub fn end_backup(&self, _tx: &Transaction) -> StorageResult<()> {
        let backup = self.path.join(BACKUP_FILE);
        if backup.exists() {
            fs::remove_file(backup)?;
        }
        Ok(())
    }

    /// Roll the master file back to the snapshot taken at backup start.
    pub fn recover(
        &self,
        _tx: &Transaction,
        _point: Timestamp,
    ) -> StorageResult<()> {
        self.restore_snapshot()
    }

    pub fn restore(
        &self,
        _tx: &Transaction,
        _point: Timestamp,
    ) -> StorageResult<()> {
        self.restore_snapshot()
    }

    fn restore_snapshot(&self) -> StorageResult<()> {
        let backup = self.path.join(BACKUP_FILE);
        if !backup.exists() {
            return Err(StorageError::RecoveryFailed(format!(
                "no snapshot to recover from in {:?}",
                self.path
            )));
        }
        let mut state = self.state.lock().unwrap();
        let was_mounted = state.file.is_some();
        state.file = None;
        fs::copy(&backup, self.master_path())?;
        if was_mounted {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(self.master_path())?;
            let len = file.metadata()?.len() as usize;
            state.page_count = (len / self.page_size) as u32;
            state.file = Some(file);
        }
        Ok(())
    }

    /// Rename the backing directory. On failure the store is left at the
    /// old path, remounted if it was mounted before.
    pub fn move_to(
        &mut self,
        _tx: &Transaction,
        new_path: impl Into<PathBuf>,
    ) -> StorageResult<()> {
        let new_path = new_path.into();
        let was_mounted;
        {
            let mut state = self.state.lock().unwrap();
            was_mounted = state.file.is_some();
            state.file = None;
        }

        if let Err(e) = fs::rename(&self.path, &new_path) {
            if was_mounted {
                self.do_mount()?;
            }
            return Err(e.into());
        }
        self.path = new_path;
        if was_mounted {
            self.do_mount()?;
        }
        Ok(())
    }

    /// Record a path change performed by a parent directory rename; no
    /// filesystem operation happens here.
    pub fn relocate(&mut self, new_path: impl Into<PathBuf>) {
        self.path = new_path.into();
    }

    fn extend_to(&self, state: &mut State, page_id: PageId) -> StorageResult<()> {
        let zero = vec![0u8; self.get_content_size()];
        for id in state.page_count..=page_id {
            self.write_page(state, id, &zero)?;
        }
        state.page_count = page_id + 1;
        state.modified_since_sync = true;
        Ok(())
    }

    fn write_page(
        &self,
        state: &mut State,
        page_id: PageId,
        content: &[u8],
    ) -> StorageResult<()> {
        debug_assert_eq!(content.len(), self.get_content_size());
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| StorageError::bad_argument("file is not mounted"))?;
        file.seek(SeekFrom::Start(page_id as u64 * self.page_size as u64))?;
        file.write_all(content)?;
        file.write_all(&crc32fast::hash(content).to_le_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> (VersionFile, Transaction) {
        let tx = Transaction::new();
        let vf = VersionFile::new(dir.join("v"), 4096);
        vf.create(&tx).unwrap();
        (vf, tx)
    }

    #[test]
    fn test_fix_beyond_end_is_bad_data_page() {
        let dir = tempfile::tempdir().unwrap();
        let (vf, tx) = open_store(dir.path());

        match vf.fix(&tx, 0, FixMode::READ_ONLY) {
            Err(StorageError::BadDataPage(0)) => {}
            other => panic!("expected BadDataPage, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_allocate_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (vf, tx) = open_store(dir.path());

        let mut page = vf.fix(&tx, 0, FixMode::ALLOCATE).unwrap();
        page.buffer_mut()[0] = 0xab;
        page.dirty();
        vf.unfix(page, true).unwrap();

        let page = vf.fix(&tx, 0, FixMode::READ_ONLY).unwrap();
        assert_eq!(page.buffer()[0], 0xab);
        assert_eq!(vf.get_page_count(), 1);
    }

    #[test]
    fn test_recover_page_drops_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (vf, tx) = open_store(dir.path());

        let mut page = vf.fix(&tx, 0, FixMode::ALLOCATE).unwrap();
        page.dirty();
        vf.unfix(page, true).unwrap();

        let mut page = vf
            .fix(&tx, 0, FixMode::WRITE | FixMode::DISCARDABLE)
            .unwrap();
        page.buffer_mut()[10] = 0xff;
        page.dirty();
        vf.recover_page(page);

        let page = vf.fix(&tx, 0, FixMode::READ_ONLY).unwrap();
        assert_eq!(page.buffer()[10], 0);
    }

    #[test]
    fn test_corrupt_page_is_bad_data_page() {
        let dir = tempfile::tempdir().unwrap();
        let (vf, tx) = open_store(dir.path());

        let mut page = vf.fix(&tx, 0, FixMode::ALLOCATE).unwrap();
        page.dirty();
        vf.unfix(page, true).unwrap();

        // flip a content byte behind the store's back
        let master = vf.get_path().join("master.dat");
        let mut raw = fs::read(&master).unwrap();
        raw[100] ^= 0x01;
        fs::write(&master, raw).unwrap();

        match vf.fix(&tx, 0, FixMode::READ_ONLY) {
            Err(StorageError::BadDataPage(0)) => {}
            other => panic!("expected BadDataPage, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let (vf, tx) = open_store(dir.path());

        let mut page = vf.fix(&tx, 0, FixMode::ALLOCATE).unwrap();
        page.buffer_mut()[0] = 1;
        page.dirty();
        vf.unfix(page, true).unwrap();

        vf.start_backup(&tx, true).unwrap();

        let mut page = vf.fix(&tx, 0, FixMode::WRITE).unwrap();
        page.buffer_mut()[0] = 2;
        page.dirty();
        vf.unfix(page, true).unwrap();

        vf.restore(&tx, 0).unwrap();
        let page = vf.fix(&tx, 0, FixMode::READ_ONLY).unwrap();
        assert_eq!(page.buffer()[0], 1);
        vf.end_backup(&tx).unwrap();
    }
}
