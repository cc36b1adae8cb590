use crate::{
    error::{StorageError, StorageResult},
    physical::{
        area_page,
        content::{Content, ContentMut},
        FILE_HEADER_SIZE,
    },
    types::{AreaId, PageId},
    version::VersionPage,
};

/// Role of a physical page, fixed per file.
///
/// The original design dispatched area primitives through virtual methods
/// that mostly raised `NotSupported`; here the kind is a tag and every
/// operation matches on it, so an unsupported combination is a typed error
/// instead of a surprise.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PhysicalKind {
    /// Pages managed by logical id with a durable free list (B-tree).
    PageManage,
    /// No page management; a file header lives at the start of page 0.
    NonManage,
    /// Pages carrying variable-length areas addressed by `AreaID`.
    DirectArea,
}

/// One attached physical page: the typed wrapper around a fixed version
/// page. The fix mode decides whether mutation is allowed; `dirty()` must
/// be called before the page is detached for the change to survive.
pub struct PhysicalPage {
    id: PageId,
    kind: PhysicalKind,
    page: VersionPage,
}

impl PhysicalPage {
    pub(crate) fn new(id: PageId, kind: PhysicalKind, page: VersionPage) -> Self {
        Self { id, kind, page }
    }

    pub fn get_id(&self) -> PageId {
        self.id
    }

    pub fn get_kind(&self) -> PhysicalKind {
        self.kind
    }

    pub fn is_read_only(&self) -> bool {
        !self.page.is_writable()
    }

    pub fn is_dirty(&self) -> bool {
        self.page.is_dirty()
    }

    pub fn dirty(&mut self) {
        self.page.dirty();
    }

    /// Raw page bytes, including regions `Content` hides.
    pub fn buffer(&self) -> &[u8] {
        self.page.buffer()
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.page.buffer_mut()
    }

    fn content_range(&self) -> (usize, usize) {
        let len = self.page.buffer().len();
        match self.kind {
            PhysicalKind::PageManage => (0, len),
            PhysicalKind::NonManage => {
                if self.id == 0 {
                    (FILE_HEADER_SIZE, len)
                } else {
                    (0, len)
                }
            }
            PhysicalKind::DirectArea => (
                area_page::AREA_PAGE_HEADER_SIZE,
                area_page::dir_start(self.page.buffer()),
            ),
        }
    }

    /// Header-stripped view of the usable payload.
    pub fn content(&self) -> Content<'_> {
        let (start, end) = self.content_range();
        Content::new(&self.page.buffer()[start..end])
    }

    pub fn content_mut(&mut self) -> ContentMut<'_> {
        let (start, end) = self.content_range();
        ContentMut::new(&mut self.page.buffer_mut()[start..end])
    }

    pub fn get_page_data_size(&self) -> usize {
        let (start, end) = self.content_range();
        end - start
    }

    /// Overwrite the whole page with a fill byte.
    pub fn clear(&mut self, fill: u8) {
        self.page.buffer_mut().fill(fill);
        self.page.dirty();
    }

    pub(crate) fn into_version_page(self) -> VersionPage {
        self.page
    }

    /// Swap in a re-fixed version page after a fix-mode upgrade. The typed
    /// view must be re-derived by the caller.
    pub(crate) fn replace_version_page(&mut self, page: VersionPage) {
        debug_assert_eq!(page.get_page_id(), self.page.get_page_id());
        self.page = page;
    }

    fn require_areas(&self) -> StorageResult<()> {
        if self.kind != PhysicalKind::DirectArea {
            return Err(StorageError::NotSupported(
                "area operation on a page without areas",
            ));
        }
        Ok(())
    }

    // Area primitives. Only direct-area pages support them.

    pub fn initialize_areas(&mut self) -> StorageResult<()> {
        self.require_areas()?;
        area_page::initialize(self.page.buffer_mut());
        self.page.dirty();
        Ok(())
    }

    /// Returns `None` when the page has no room, even after compaction.
    pub fn allocate_area(&mut self, size: usize) -> StorageResult<Option<AreaId>> {
        self.require_areas()?;
        let id = area_page::allocate(self.page.buffer_mut(), size);
        if id.is_some() {
            self.page.dirty();
        }
        Ok(id)
    }

    pub fn free_area(&mut self, id: AreaId) -> StorageResult<()> {
        self.require_areas()?;
        area_page::free(self.page.buffer_mut(), id)?;
        self.page.dirty();
        Ok(())
    }

    pub fn reuse_area(&mut self, id: AreaId) -> StorageResult<AreaId> {
        self.require_areas()?;
        let id = area_page::reuse(self.page.buffer_mut(), id)?;
        self.page.dirty();
        Ok(id)
    }

    pub fn read_area(&self, id: AreaId) -> StorageResult<&[u8]> {
        self.require_areas()?;
        area_page::read(self.page.buffer(), id)
    }

    pub fn write_area(
        &mut self,
        id: AreaId,
        offset: usize,
        data: &[u8],
    ) -> StorageResult<()> {
        self.require_areas()?;
        area_page::write(self.page.buffer_mut(), id, offset, data)?;
        self.page.dirty();
        Ok(())
    }

    pub fn change_area_size(
        &mut self,
        id: AreaId,
        new_size: usize,
    ) -> StorageResult<bool> {
        self.require_areas()?;
        let done = area_page::change_size(self.page.buffer_mut(), id, new_size)?;
        if done {
            self.page.dirty();
        }
        Ok(done)
    }

    pub fn compaction(&mut self) -> StorageResult<()> {
        self.require_areas()?;
        area_page::compaction(self.page.buffer_mut());
        self.page.dirty();
        Ok(())
    }

    pub fn get_top_area_id(&self) -> StorageResult<Option<AreaId>> {
        self.require_areas()?;
        Ok(area_page::get_top_area_id(self.page.buffer()))
    }

    pub fn get_next_area_id(&self, id: AreaId) -> StorageResult<Option<AreaId>> {
        self.require_areas()?;
        Ok(area_page::get_next_area_id(self.page.buffer(), id))
    }

    pub fn get_area_size(&self, id: AreaId) -> StorageResult<usize> {
        self.require_areas()?;
        area_page::get_area_size(self.page.buffer(), id)
    }

    pub fn get_free_area_size(&self) -> StorageResult<usize> {
        self.require_areas()?;
        Ok(area_page::get_free_size(self.page.buffer()))
    }
}
