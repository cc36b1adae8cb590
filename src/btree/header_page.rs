use crate::{
    physical::PhysicalPage,
    types::{PageId, UNDEFINED_PAGE_ID},
    util::{read_u32, write_u32},
};

const OFF_COUNT: usize = 0;
const OFF_ROOT: usize = 4;
const OFF_LEFT: usize = 8;
const OFF_RIGHT: usize = 12;

/// The B-tree's header page, always logical page 0.
///
/// `left` and `right` are the two ends of the leaf chain; when the tree has
/// a single leaf all three page ids name the same page.
pub struct HeaderPage {
    page: PhysicalPage,
}

impl HeaderPage {
    pub fn new(page: PhysicalPage) -> Self {
        Self { page }
    }

    pub fn initialize(&mut self) {
        let buf = self.page.buffer_mut();
        write_u32(buf, OFF_COUNT, 0);
        write_u32(buf, OFF_ROOT, UNDEFINED_PAGE_ID);
        write_u32(buf, OFF_LEFT, UNDEFINED_PAGE_ID);
        write_u32(buf, OFF_RIGHT, UNDEFINED_PAGE_ID);
        self.page.dirty();
    }

    pub fn get_count(&self) -> u32 {
        read_u32(self.page.buffer(), OFF_COUNT)
    }

    pub fn add_count(&mut self) {
        let count = self.get_count() + 1;
        write_u32(self.page.buffer_mut(), OFF_COUNT, count);
        self.page.dirty();
    }

    pub fn del_count(&mut self) {
        let count = self.get_count() - 1;
        write_u32(self.page.buffer_mut(), OFF_COUNT, count);
        self.page.dirty();
    }

    pub fn get_root_page_id(&self) -> PageId {
        read_u32(self.page.buffer(), OFF_ROOT)
    }

    pub fn set_root_page_id(&mut self, page_id: PageId) {
        write_u32(self.page.buffer_mut(), OFF_ROOT, page_id);
        self.page.dirty();
    }

    pub fn get_left_page_id(&self) -> PageId {
        read_u32(self.page.buffer(), OFF_LEFT)
    }

    pub fn set_left_page_id(&mut self, page_id: PageId) {
        write_u32(self.page.buffer_mut(), OFF_LEFT, page_id);
        self.page.dirty();
    }

    pub fn get_right_page_id(&self) -> PageId {
        read_u32(self.page.buffer(), OFF_RIGHT)
    }

    pub fn set_right_page_id(&mut self, page_id: PageId) {
        write_u32(self.page.buffer_mut(), OFF_RIGHT, page_id);
        self.page.dirty();
    }

    pub fn is_dirty(&self) -> bool {
        self.page.is_dirty()
    }

    pub fn physical_page_mut(&mut self) -> &mut PhysicalPage {
        &mut self.page
    }

    pub fn into_physical_page(self) -> PhysicalPage {
        self.page
    }
}
