use std::ops::{Deref, DerefMut};

use log::debug;

use crate::{
    btree::BtreeFile,
    error::{StorageError, StorageResult},
    fileid::{FileId, OpenMode},
    physical::{area_page, PhysicalFile, PhysicalKind},
    transaction::Transaction,
    types::{AreaId, PageId, RowId, UNDEFINED_PAGE_ID},
    verify::{Progress, VerifyTreatment},
    version::Timestamp,
};

/// Sub-directory of the sidecar B-tree under the file's directory.
const BTREE_SUB_PATH: &str = "btree";

/// Variable-length blobs addressed by `(PageID, AreaID)`, with a sidecar
/// B-tree mapping ROWID to its area.
///
/// The `(pageID, areaID)` pair handed back by `insert` is a durable
/// pointer: callers may keep it across transactions. The B-tree is
/// consulted read-only even inside write transactions; only area writes
/// promote the fix mode.
pub struct DirectAreaFile {
    phys: PhysicalFile,
    btree: BtreeFile,
}

impl Deref for DirectAreaFile {
    type Target = PhysicalFile;

    fn deref(&self) -> &Self::Target {
        &self.phys
    }
}

impl DerefMut for DirectAreaFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.phys
    }
}

impl DirectAreaFile {
    pub fn new(fileid: FileId) -> StorageResult<Self> {
        let btree = BtreeFile::new(fileid.sub_file(BTREE_SUB_PATH))?;
        Ok(Self {
            phys: PhysicalFile::new(fileid, PhysicalKind::DirectArea)?,
            btree,
        })
    }

    /// Largest blob one page can hold.
    pub fn get_max_storable_size(&self) -> usize {
        area_page::max_area_size(self.phys.get_content_size())
    }

    pub fn create(&self, tx: &Transaction) -> StorageResult<()> {
        self.phys.create(tx)?;
        if let Err(e) = self.btree.create(tx) {
            let _ = self.phys.destroy(tx);
            return Err(e);
        }
        Ok(())
    }

    pub fn destroy(&self, tx: &Transaction) -> StorageResult<()> {
        self.btree.destroy(tx)?;
        self.phys.destroy(tx)
    }

    pub fn mount(&self, tx: &Transaction) -> StorageResult<()> {
        self.phys.mount(tx)?;
        self.btree.mount(tx)
    }

    pub fn unmount(&self, tx: &Transaction) -> StorageResult<()> {
        self.btree.unmount(tx)?;
        self.phys.unmount(tx)
    }

    pub fn flush(&self, tx: &Transaction) -> StorageResult<()> {
        self.phys.flush(tx)?;
        self.btree.flush(tx)
    }

    pub fn start_backup(
        &self,
        tx: &Transaction,
        restorable: bool,
    ) -> StorageResult<()> {
        self.phys.start_backup(tx, restorable)?;
        self.btree.start_backup(tx, restorable)
    }

    pub fn end_backup(&self, tx: &Transaction) -> StorageResult<()> {
        self.btree.end_backup(tx)?;
        self.phys.end_backup(tx)
    }

    pub fn recover(&self, tx: &Transaction, point: Timestamp) -> StorageResult<()> {
        self.phys.recover(tx, point)?;
        self.btree.recover(tx, point)
    }

    pub fn restore(&self, tx: &Transaction, point: Timestamp) -> StorageResult<()> {
        self.phys.restore(tx, point)?;
        self.btree.restore(tx, point)
    }

    pub fn sync(
        &self,
        tx: &Transaction,
        incomplete: &mut bool,
        modified: &mut bool,
    ) -> StorageResult<()> {
        self.phys.sync(tx, incomplete, modified)?;
        let mut sub_incomplete = false;
        let mut sub_modified = false;
        self.btree.sync(tx, &mut sub_incomplete, &mut sub_modified)?;
        *incomplete = *incomplete || sub_incomplete;
        *modified = *modified || sub_modified;
        Ok(())
    }

    /// Rename the file's directory; the sidecar moves with it.
    pub fn move_to(
        &mut self,
        tx: &Transaction,
        new_path: impl Into<std::path::PathBuf>,
    ) -> StorageResult<()> {
        let new_path = new_path.into();
        self.phys.move_to(tx, &new_path)?;
        self.btree.relocate(new_path.join(BTREE_SUB_PATH));
        Ok(())
    }

    pub fn open(&mut self, tx: &Transaction, mode: OpenMode) -> StorageResult<()> {
        self.phys.open(tx, mode)?;
        self.btree.open(tx, mode)
    }

    pub fn close(&mut self, tx: &Transaction) -> StorageResult<()> {
        self.btree.close(tx)?;
        self.phys.close();
        Ok(())
    }

    pub fn get_count(&self, tx: &Transaction) -> StorageResult<u32> {
        self.btree.get_count(tx)
    }

    /// Store a blob and index it under the row. Returns the durable
    /// `(pageID, areaID)` pointer.
    pub fn insert(
        &self,
        tx: &Transaction,
        row_id: RowId,
        data: &[u8],
    ) -> StorageResult<(PageId, AreaId)> {
        tx.check_cancelled()?;
        if data.is_empty() || data.len() > self.get_max_storable_size() {
            return Err(StorageError::bad_argument(format!(
                "blob of {} bytes cannot be stored",
                data.len()
            )));
        }

        let result = self.do_insert(tx, row_id, data);
        if result.is_err() {
            self.btree.recover_all_pages();
        }
        result
    }

    fn do_insert(
        &self,
        tx: &Transaction,
        row_id: RowId,
        data: &[u8],
    ) -> StorageResult<(PageId, AreaId)> {
        // stage 1: find a page with room, the hinted one first
        let hint = self.phys.get_hint(tx)?;
        let (mut page, area_id) = match self.try_page(tx, hint, data.len())? {
            Some(hit) => hit,
            None => {
                let mut page = self.phys.allocate_page2(
                    tx,
                    self.phys.get_fix_mode(),
                )?;
                page.initialize_areas()?;
                let area_id = page
                    .allocate_area(data.len())?
                    .expect("a fresh page holds any storable blob");
                (page, area_id)
            }
        };
        let page_id = page.get_id();
        debug!("blob for row {} at ({}, {})", row_id, page_id, area_id);

        // stage 2: write the blob and remember the page while it has room
        page.write_area(area_id, 0, data)?;
        let has_room = page.get_free_area_size()? > 0;
        self.phys.detach_page(page, true)?;
        self.phys
            .set_hint(tx, if has_room { page_id } else { UNDEFINED_PAGE_ID })?;

        // stage 3: index the row
        if let Err(e) = self.btree.insert(tx, row_id, (page_id, area_id)) {
            // take the orphaned area back before reporting
            let mut page = self.phys.attach_page(
                tx,
                page_id,
                self.phys.get_fix_mode(),
            )?;
            page.free_area(area_id)?;
            self.phys.detach_page(page, true)?;
            return Err(e);
        }
        Ok((page_id, area_id))
    }

    fn try_page(
        &self,
        tx: &Transaction,
        page_id: PageId,
        size: usize,
    ) -> StorageResult<Option<(crate::physical::PhysicalPage, AreaId)>> {
        if page_id == UNDEFINED_PAGE_ID {
            return Ok(None);
        }
        let mut page = match self.phys.attach_page(
            tx,
            page_id,
            self.phys.get_fix_mode(),
        ) {
            Ok(page) => page,
            // a stale hint is not an error
            Err(StorageError::BadDataPage(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        match page.allocate_area(size)? {
            Some(area_id) => Ok(Some((page, area_id))),
            None => {
                self.phys.detach_page(page, false)?;
                Ok(None)
            }
        }
    }

    /// Look a row's blob up through the sidecar index.
    pub fn get(
        &self,
        tx: &Transaction,
        row_id: RowId,
    ) -> StorageResult<Option<Vec<u8>>> {
        tx.check_cancelled()?;
        let (page_id, area_id) = match self.btree.get(tx, row_id)? {
            Some(pointer) => pointer,
            None => return Ok(None),
        };
        let data = self.read_area(tx, page_id, area_id)?;
        Ok(Some(data))
    }

    /// Read a blob by its durable pointer, bypassing the index.
    pub fn read_area(
        &self,
        tx: &Transaction,
        page_id: PageId,
        area_id: AreaId,
    ) -> StorageResult<Vec<u8>> {
        let page = self.phys.attach_page(tx, page_id, crate::FixMode::READ_ONLY)?;
        let data = page.read_area(area_id)?.to_vec();
        self.phys.detach_page(page, false)?;
        Ok(data)
    }

    /// Drop a row's blob and its index entry; an emptied page goes back
    /// to the store.
    pub fn expunge(&self, tx: &Transaction, row_id: RowId) -> StorageResult<()> {
        tx.check_cancelled()?;
        let result = self.do_expunge(tx, row_id);
        if result.is_err() {
            self.btree.recover_all_pages();
        }
        result
    }

    fn do_expunge(&self, tx: &Transaction, row_id: RowId) -> StorageResult<()> {
        let (page_id, area_id) =
            self.btree.get(tx, row_id)?.ok_or_else(|| {
                StorageError::bad_argument(format!("row {} not found", row_id))
            })?;

        let mut page = self.phys.attach_page(
            tx,
            page_id,
            self.phys.get_fix_mode(),
        )?;
        page.free_area(area_id)?;

        if page.get_top_area_id()?.is_none() {
            // nothing lives here any more
            self.phys.free_page2(tx, page)?;
            if self.phys.get_hint(tx)? == page_id {
                self.phys.set_hint(tx, UNDEFINED_PAGE_ID)?;
            }
        } else {
            self.phys.detach_page(page, true)?;
            self.phys.set_hint(tx, page_id)?;
        }

        self.btree.expunge(tx, row_id)
    }

    /// Verify the sidecar index and check that every indexed area is
    /// readable.
    pub fn verify(
        &self,
        tx: &Transaction,
        treatment: VerifyTreatment,
        progress: &mut Progress,
    ) -> StorageResult<()> {
        self.btree.verify(tx, VerifyTreatment::Continue, progress)?;

        let mut page_id = self.btree.get_next_leaf_page_id(tx, 0)?;
        while page_id != UNDEFINED_PAGE_ID {
            tx.check_cancelled()?;
            for (row_id, (data_page, area_id)) in
                self.btree.get_page_data(tx, page_id)?
            {
                if let Err(e) = self.read_area(tx, data_page, area_id) {
                    progress.report(format!(
                        "row {} points at unreadable area ({}, {}): {}",
                        row_id, data_page, area_id, e
                    ));
                }
            }
            page_id = self.btree.get_next_leaf_page_id(tx, page_id)?;
        }

        self.btree.flush_all_pages(tx)?;
        progress.finish(treatment)
    }
}
