//! Physical page layer.
//!
//! Sits between the storage engines and the version store: classifies pages
//! by role, maps logical page ids to version page ids, and keeps the
//! durable free-page chain for page-managed files. Page-manage and
//! direct-area files reserve version page 0 for the physical header and
//! place logical page `p` in version page `p + 1`; non-managed files embed
//! a small file header at the start of page 0 instead.

pub mod area_page;
mod content;
mod page;

pub use content::{Content, ContentMut};
pub use page::{PhysicalKind, PhysicalPage};

use std::ops::{Deref, DerefMut};

use log::debug;

use crate::{
    error::{StorageError, StorageResult},
    fileid::FileId,
    fix_mode::FixMode,
    subfile::SubFile,
    transaction::Transaction,
    types::{PageId, UNDEFINED_PAGE_ID},
    util::{read_u32, write_u32},
};

/// File header embedded at the start of page 0 of a non-managed file.
pub const FILE_HEADER_SIZE: usize = 16;

const MAGIC: u32 = 0x5354_5244;

const HDR_MAGIC: usize = 0;
const HDR_VERSION: usize = 4;
const HDR_PAGE_COUNT: usize = 8;
const HDR_FREE_HEAD: usize = 12;
const HDR_HINT: usize = 16;

#[derive(Clone, Copy, Debug)]
struct PhysHeader {
    format_version: u32,
    page_count: u32,
    free_head: PageId,
    hint: PageId,
}

/// A physical file: typed pages over one version store.
pub struct PhysicalFile {
    sub: SubFile,
    kind: PhysicalKind,
}

impl Deref for PhysicalFile {
    type Target = SubFile;

    fn deref(&self) -> &Self::Target {
        &self.sub
    }
}

impl DerefMut for PhysicalFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.sub
    }
}

impl PhysicalFile {
    pub fn new(fileid: FileId, kind: PhysicalKind) -> StorageResult<Self> {
        Ok(Self {
            sub: SubFile::new(fileid)?,
            kind,
        })
    }

    pub fn get_kind(&self) -> PhysicalKind {
        self.kind
    }

    /// Usable bytes of one page before the kind-specific regions are
    /// subtracted.
    pub fn get_content_size(&self) -> usize {
        self.sub.get_version_file().get_content_size()
    }

    fn version_page_id(&self, logical: PageId) -> PageId {
        match self.kind {
            PhysicalKind::NonManage => logical,
            _ => logical + 1,
        }
    }

    /// Create the backing store and write the physical header. On failure
    /// the store is torn down again so the pre-operation state is kept.
    pub fn create(&self, tx: &Transaction) -> StorageResult<()> {
        self.sub.create(tx)?;
        match self.initialize(tx) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.sub.destroy(tx);
                Err(e)
            }
        }
    }

    fn initialize(&self, tx: &Transaction) -> StorageResult<()> {
        let version = self.sub.get_version_file();
        let mut page = version.fix(tx, 0, FixMode::ALLOCATE)?;
        let buf = page.buffer_mut();
        write_u32(buf, HDR_MAGIC, MAGIC);
        write_u32(buf, HDR_VERSION, self.sub.get_fileid().get_version());
        if self.kind != PhysicalKind::NonManage {
            write_u32(buf, HDR_PAGE_COUNT, 0);
            write_u32(buf, HDR_FREE_HEAD, UNDEFINED_PAGE_ID);
            write_u32(buf, HDR_HINT, UNDEFINED_PAGE_ID);
        }
        page.dirty();
        version.unfix(page, true)
    }

    /// Truncate to a freshly-created state.
    pub fn clear(&self, tx: &Transaction) -> StorageResult<()> {
        self.sub.get_version_file().truncate(tx, 0)?;
        self.initialize(tx)
    }

    /// Check the stored magic and format version.
    pub fn verify_header(&self, tx: &Transaction) -> StorageResult<()> {
        let version = self.sub.get_version_file();
        let page = version.fix(tx, 0, FixMode::READ_ONLY)?;
        let buf = page.buffer();
        if read_u32(buf, HDR_MAGIC) != MAGIC {
            return Err(StorageError::Corrupted(format!(
                "bad magic in {:?}",
                self.sub.get_fileid().get_path()
            )));
        }
        let format = read_u32(buf, HDR_VERSION);
        if format == 0 || format > crate::fileid::CURRENT_FORMAT_VERSION {
            return Err(StorageError::Corrupted(format!(
                "unsupported on-disk format version {}",
                format
            )));
        }
        Ok(())
    }

    fn read_header(&self, tx: &Transaction) -> StorageResult<PhysHeader> {
        debug_assert_ne!(self.kind, PhysicalKind::NonManage);
        let version = self.sub.get_version_file();
        let page = version.fix(tx, 0, FixMode::READ_ONLY)?;
        let buf = page.buffer();
        Ok(PhysHeader {
            format_version: read_u32(buf, HDR_VERSION),
            page_count: read_u32(buf, HDR_PAGE_COUNT),
            free_head: read_u32(buf, HDR_FREE_HEAD),
            hint: read_u32(buf, HDR_HINT),
        })
    }

    fn write_header(&self, tx: &Transaction, hdr: &PhysHeader) -> StorageResult<()> {
        let version = self.sub.get_version_file();
        let mut page = version.fix(tx, 0, FixMode::WRITE)?;
        let buf = page.buffer_mut();
        write_u32(buf, HDR_VERSION, hdr.format_version);
        write_u32(buf, HDR_PAGE_COUNT, hdr.page_count);
        write_u32(buf, HDR_FREE_HEAD, hdr.free_head);
        write_u32(buf, HDR_HINT, hdr.hint);
        page.dirty();
        version.unfix(page, true)
    }

    /// Number of logical pages ever allocated, freed ones included.
    pub fn get_page_count(&self, tx: &Transaction) -> StorageResult<u32> {
        match self.kind {
            PhysicalKind::NonManage => {
                Ok(self.sub.get_version_file().get_page_count())
            }
            _ => Ok(self.read_header(tx)?.page_count),
        }
    }

    /// Fix an existing logical page.
    pub fn attach_page(
        &self,
        tx: &Transaction,
        page_id: PageId,
        mode: FixMode,
    ) -> StorageResult<PhysicalPage> {
        let vid = self.version_page_id(page_id);
        let page = match self.sub.get_version_file().fix(tx, vid, mode) {
            Ok(page) => page,
            Err(StorageError::BadDataPage(_)) => {
                return Err(StorageError::BadDataPage(page_id))
            }
            Err(e) => return Err(e),
        };
        Ok(PhysicalPage::new(page_id, self.kind, page))
    }

    pub fn detach_page(
        &self,
        page: PhysicalPage,
        dirty: bool,
    ) -> StorageResult<()> {
        self.sub
            .get_version_file()
            .unfix(page.into_version_page(), dirty)
    }

    pub fn recover_page(&self, page: PhysicalPage) {
        self.sub
            .get_version_file()
            .recover_page(page.into_version_page());
    }

    /// Upgrade a read-only fix to a writable one by re-fixing through the
    /// version store. No-op when the page is already writable.
    pub fn update_mode(
        &self,
        tx: &Transaction,
        page: &mut PhysicalPage,
    ) -> StorageResult<()> {
        if !page.is_read_only() {
            return Ok(());
        }
        let vid = self.version_page_id(page.get_id());
        let fresh = self.sub.get_version_file().fix(
            tx,
            vid,
            FixMode::WRITE | FixMode::DISCARDABLE,
        )?;
        page.replace_version_page(fresh);
        Ok(())
    }

    /// Hand out a zeroed page: the free chain is popped first, the file
    /// extended otherwise.
    pub fn allocate_page2(
        &self,
        tx: &Transaction,
        mode: FixMode,
    ) -> StorageResult<PhysicalPage> {
        let version = self.sub.get_version_file();

        if self.kind == PhysicalKind::NonManage {
            let id = version.get_page_count();
            let mut page = version.fix(tx, id, mode | FixMode::ALLOCATE)?;
            page.dirty();
            return Ok(PhysicalPage::new(id, self.kind, page));
        }

        let mut hdr = self.read_header(tx)?;
        let page = if hdr.free_head != UNDEFINED_PAGE_ID {
            let id = hdr.free_head;
            let mut page = version.fix(
                tx,
                self.version_page_id(id),
                FixMode::WRITE | FixMode::DISCARDABLE,
            )?;
            hdr.free_head = read_u32(page.buffer(), 0);
            page.buffer_mut().fill(0);
            page.dirty();
            debug!("reused free page {}", id);
            PhysicalPage::new(id, self.kind, page)
        } else {
            let id = hdr.page_count;
            hdr.page_count += 1;
            let mut page = version.fix(
                tx,
                self.version_page_id(id),
                mode | FixMode::ALLOCATE,
            )?;
            page.dirty();
            PhysicalPage::new(id, self.kind, page)
        };
        self.write_header(tx, &hdr)?;
        Ok(page)
    }

    /// Return a page to the free chain. The page stays allocated in the
    /// version store; its content now carries the chain link.
    pub fn free_page2(
        &self,
        tx: &Transaction,
        mut page: PhysicalPage,
    ) -> StorageResult<()> {
        if self.kind == PhysicalKind::NonManage {
            return Err(StorageError::NotSupported(
                "free on a non-managed file",
            ));
        }
        self.update_mode(tx, &mut page)?;

        let mut hdr = self.read_header(tx)?;
        let id = page.get_id();
        let mut vp = page.into_version_page();
        write_u32(vp.buffer_mut(), 0, hdr.free_head);
        vp.dirty();
        self.sub.get_version_file().unfix(vp, true)?;

        hdr.free_head = id;
        self.write_header(tx, &hdr)
    }

    /// Insert-page hint for direct-area files: the last page known to have
    /// free room.
    pub fn get_hint(&self, tx: &Transaction) -> StorageResult<PageId> {
        Ok(self.read_header(tx)?.hint)
    }

    pub fn set_hint(&self, tx: &Transaction, hint: PageId) -> StorageResult<()> {
        let mut hdr = self.read_header(tx)?;
        if hdr.hint != hint {
            hdr.hint = hint;
            self.write_header(tx, &hdr)?;
        }
        Ok(())
    }
}
