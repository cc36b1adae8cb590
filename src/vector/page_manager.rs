//! Page management of the vector file.
//!
//! Page layout by id, with `k = get_pages_per_table()`:
//!
//! ```text
//!   0   1   2  ... k-1  k  k+1 k+2 ...
//! -----------------------------------
//! | H | D | D |...| D | T | D | D |...
//! -----------------------------------
//! ```
//!
//! `H` is the header page `{count, maxPageID, bitmap}`, every `T` at a
//! multiple of `k` is a management table page with the same shape (its
//! header fields unused), `D` are data pages. Bit `i` of a management
//! page's bitmap covers the page at `manageID + i`; bit 0 would cover the
//! management page itself and stays reserved. Allocation is strictly
//! monotonic: inserting into a page materializes every page before it.

use log::debug;

use crate::{
    error::{StorageError, StorageResult},
    fix_mode::FixMode,
    transaction::Transaction,
    types::{PageId, ILLEGAL_PAGE_ID},
    version::{VersionFile, VersionPage},
};

/// Header page prefix: `{count, maxPageID}`. The bitmap starts right
/// after, on table pages too (their header region is unused).
pub const MANAGE_HEADER_SIZE: usize = 8;

const OFF_COUNT: usize = 0;
const OFF_MAX_PAGE_ID: usize = 4;

/// What a page attach is for; inserts allocate missing pages on the way.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operation {
    Read,
    Insert,
    Expunge,
    Update,
}

/// Smallest set bit strictly after `pos`, scanned a byte at a time.
fn bitmap_next(bitmap: &[u8], pos: u32) -> Option<u32> {
    let bits = bitmap.len() as u32 * 8;
    let start = pos + 1;
    if start >= bits {
        return None;
    }
    let mut byte = (start / 8) as usize;
    let mut bit = start % 8;
    while byte < bitmap.len() {
        let b = bitmap[byte];
        if b != 0 {
            for bp in bit..8 {
                if b & (1 << bp) != 0 {
                    return Some(byte as u32 * 8 + bp);
                }
            }
        }
        byte += 1;
        bit = 0;
    }
    None
}

/// Largest set bit strictly before `pos` (clamped to the bitmap size).
fn bitmap_prev(bitmap: &[u8], pos: u32) -> Option<u32> {
    let bits = bitmap.len() as u32 * 8;
    let end = std::cmp::min(pos, bits);
    if end == 0 {
        return None;
    }
    let last = end - 1;
    let mut byte = (last / 8) as usize;
    let mut bit = last % 8;
    loop {
        let b = bitmap[byte];
        if b != 0 {
            let mut bp = bit as i32;
            while bp >= 0 {
                if b & (1 << bp) != 0 {
                    return Some(byte as u32 * 8 + bp as u32);
                }
                bp -= 1;
            }
        }
        if byte == 0 {
            return None;
        }
        byte -= 1;
        bit = 7;
    }
}

/// Keeper of the header and management table pages.
///
/// Only management pages are cached here; data pages are attached on
/// behalf of the file but their content is the file's business.
pub struct PageManager {
    fix_mode: FixMode,
    page_data_size: usize,
    header_page: Option<VersionPage>,
    table_page: Option<VersionPage>,
}

impl PageManager {
    pub fn new() -> Self {
        Self {
            fix_mode: FixMode::READ_ONLY,
            page_data_size: 0,
            header_page: None,
            table_page: None,
        }
    }

    pub fn open(&mut self, fix_mode: FixMode, page_data_size: usize) {
        self.fix_mode = fix_mode;
        self.page_data_size = page_data_size;
    }

    pub fn close(&mut self, version: &VersionFile) -> StorageResult<()> {
        self.detach_manage_pages(version)
    }

    /// Write the empty header page; called at create and clear only.
    pub fn initialize(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
    ) -> StorageResult<()> {
        // an Allocate fix comes back zero-filled, which is exactly the
        // initial header: count 0, max page id 0, empty bitmap
        let mut page = version.fix(tx, 0, FixMode::ALLOCATE)?;
        page.dirty();
        self.header_page = Some(page);
        Ok(())
    }

    /// Pages covered by one management page, the management page itself
    /// included.
    pub fn get_pages_per_table(&self) -> u32 {
        ((self.page_data_size - MANAGE_HEADER_SIZE) * 8) as u32
    }

    fn ensure_header(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
    ) -> StorageResult<&mut VersionPage> {
        if self.header_page.is_none() {
            self.header_page = Some(version.fix(tx, 0, self.fix_mode)?);
        }
        Ok(self.header_page.as_mut().unwrap())
    }

    pub fn get_count(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
    ) -> StorageResult<u32> {
        let header = self.ensure_header(version, tx)?;
        Ok(crate::util::read_u32(header.buffer(), OFF_COUNT))
    }

    pub fn increment_count(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
    ) -> StorageResult<()> {
        let header = self.ensure_header(version, tx)?;
        let count = crate::util::read_u32(header.buffer(), OFF_COUNT) + 1;
        crate::util::write_u32(header.buffer_mut(), OFF_COUNT, count);
        header.dirty();
        Ok(())
    }

    pub fn decrement_count(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
    ) -> StorageResult<()> {
        let header = self.ensure_header(version, tx)?;
        let count = crate::util::read_u32(header.buffer(), OFF_COUNT) - 1;
        crate::util::write_u32(header.buffer_mut(), OFF_COUNT, count);
        header.dirty();
        Ok(())
    }

    pub fn get_max_page_id(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
    ) -> StorageResult<PageId> {
        let header = self.ensure_header(version, tx)?;
        Ok(crate::util::read_u32(header.buffer(), OFF_MAX_PAGE_ID))
    }

    fn set_max_page_id(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
        max: PageId,
    ) -> StorageResult<()> {
        let header = self.ensure_header(version, tx)?;
        crate::util::write_u32(header.buffer_mut(), OFF_MAX_PAGE_ID, max);
        header.dirty();
        Ok(())
    }

    /// Fix one page. For `Insert` every missing page up to the target is
    /// allocated first (data pages reset by the caller's `reset`). A page
    /// beyond the allocated range yields `Ok(None)`; `BadDataPage` from a
    /// page inside the range is corruption and is rethrown.
    pub fn attach(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
        page_id: PageId,
        operation: Operation,
        reset: &dyn Fn(&mut VersionPage),
    ) -> StorageResult<Option<VersionPage>> {
        if operation == Operation::Insert {
            loop {
                let max = self.get_max_page_id(version, tx)?;
                if max >= page_id {
                    break;
                }
                let page = self.allocate_page(version, tx, reset)?;
                if page.get_page_id() == page_id {
                    return Ok(Some(page));
                }
                version.unfix(page, false)?;
            }
        }

        match version.fix(tx, page_id, self.fix_mode) {
            Ok(page) => Ok(Some(page)),
            Err(StorageError::BadDataPage(_)) => {
                // a fix can fail because the page is past the end of the
                // file or because its checksum is broken; only the former
                // may be swallowed
                let max = self
                    .get_max_page_id(version, tx)
                    .unwrap_or(PageId::MAX);
                if max >= page_id {
                    return Err(StorageError::BadDataPage(page_id));
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Allocate the page after the current maximum, interleaving a
    /// management table page whenever the next id lands on a multiple of
    /// `k`.
    fn allocate_page(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
        reset: &dyn Fn(&mut VersionPage),
    ) -> StorageResult<VersionPage> {
        let k = self.get_pages_per_table();
        let mut next = self.get_max_page_id(version, tx)? + 1;

        if next % k == 0 {
            // a management table page; the zero fill of an Allocate fix
            // is its initial state
            let table = version.fix(tx, next, FixMode::ALLOCATE)?;
            if let Some(old) = self.table_page.take() {
                version.unfix(old, false)?;
            }
            self.table_page = Some(table);
            self.set_max_page_id(version, tx, next)?;
            debug!("allocated management page {}", next);
            next += 1;
        }

        let mut page = version.fix(tx, next, FixMode::ALLOCATE)?;
        reset(&mut page);
        self.set_max_page_id(version, tx, next)?;
        Ok(page)
    }

    /// The management page covering `page_id`; the header page when the
    /// id falls in the first run.
    fn manage_page(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
        page_id: PageId,
    ) -> StorageResult<&mut VersionPage> {
        let k = self.get_pages_per_table();
        let manage_id = page_id / k * k;

        if manage_id == 0 {
            return self.ensure_header(version, tx);
        }

        let cached = self
            .table_page
            .as_ref()
            .map(|p| p.get_page_id() == manage_id)
            .unwrap_or(false);
        if !cached {
            if let Some(old) = self.table_page.take() {
                version.unfix(old, false)?;
            }
            self.table_page =
                Some(version.fix(tx, manage_id, self.fix_mode)?);
        }
        Ok(self.table_page.as_mut().unwrap())
    }

    pub fn on(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
        page_id: PageId,
    ) -> StorageResult<()> {
        let k = self.get_pages_per_table();
        let manage_id = page_id / k * k;
        let page = self.manage_page(version, tx, page_id)?;
        let pos = (page_id - manage_id) as usize;
        page.buffer_mut()[MANAGE_HEADER_SIZE + pos / 8] |= 1 << (pos % 8);
        page.dirty();
        Ok(())
    }

    pub fn off(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
        page_id: PageId,
    ) -> StorageResult<()> {
        let k = self.get_pages_per_table();
        let manage_id = page_id / k * k;
        let page = self.manage_page(version, tx, page_id)?;
        let pos = (page_id - manage_id) as usize;
        page.buffer_mut()[MANAGE_HEADER_SIZE + pos / 8] &= !(1 << (pos % 8));
        page.dirty();
        Ok(())
    }

    pub fn get_bit(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
        page_id: PageId,
    ) -> StorageResult<bool> {
        let k = self.get_pages_per_table();
        let manage_id = page_id / k * k;
        let page = self.manage_page(version, tx, page_id)?;
        let pos = (page_id - manage_id) as usize;
        let byte = page.buffer()[MANAGE_HEADER_SIZE + pos / 8];
        Ok(byte & (1 << (pos % 8)) != 0)
    }

    /// Next page after `current` with live entries, across management
    /// pages. `ILLEGAL_PAGE_ID` signals exhaustion, never `Undefined`.
    pub fn next(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
        current: PageId,
    ) -> StorageResult<PageId> {
        let k = self.get_pages_per_table();
        let max = self.get_max_page_id(version, tx)?;
        let mut current = current;

        while current <= max {
            let manage_id = current / k * k;
            let page = self.manage_page(version, tx, manage_id)?;
            let bitmap = &page.buffer()[MANAGE_HEADER_SIZE..];
            match bitmap_next(bitmap, current - manage_id) {
                Some(pos) => return Ok(manage_id + pos),
                None => current = manage_id + k,
            }
        }
        Ok(ILLEGAL_PAGE_ID)
    }

    /// Previous page before `current` with live entries;
    /// `ILLEGAL_PAGE_ID` when there is none.
    pub fn prev(
        &mut self,
        version: &VersionFile,
        tx: &Transaction,
        current: PageId,
    ) -> StorageResult<PageId> {
        let k = self.get_pages_per_table();
        let max = self.get_max_page_id(version, tx)?;
        let mut current = std::cmp::min(current, max);

        loop {
            let manage_id = current / k * k;
            let page = self.manage_page(version, tx, manage_id)?;
            let bitmap = &page.buffer()[MANAGE_HEADER_SIZE..];
            let pos = if current == manage_id {
                // a management page itself: scan its whole bitmap
                bitmap.len() as u32 * 8
            } else {
                current - manage_id
            };
            match bitmap_prev(bitmap, pos) {
                Some(pos) => return Ok(manage_id + pos),
                None => {
                    if manage_id == 0 {
                        return Ok(ILLEGAL_PAGE_ID);
                    }
                    current = manage_id - k;
                }
            }
        }
    }

    /// Unfix the cached management pages, writing them iff dirty.
    pub fn detach_manage_pages(
        &mut self,
        version: &VersionFile,
    ) -> StorageResult<()> {
        if let Some(page) = self.header_page.take() {
            version.unfix(page, false)?;
        }
        if let Some(page) = self.table_page.take() {
            version.unfix(page, false)?;
        }
        Ok(())
    }

    /// Drop the cached management pages without writing anything back.
    pub fn discard(&mut self) {
        self.header_page = None;
        self.table_page = None;
    }
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_next() {
        let mut bitmap = vec![0u8; 8];
        bitmap[0] = 0b0000_0110; // bits 1, 2
        bitmap[5] = 0b1000_0000; // bit 47

        assert_eq!(bitmap_next(&bitmap, 0), Some(1));
        assert_eq!(bitmap_next(&bitmap, 1), Some(2));
        assert_eq!(bitmap_next(&bitmap, 2), Some(47));
        assert_eq!(bitmap_next(&bitmap, 47), None);
        assert_eq!(bitmap_next(&bitmap, 1000), None);
    }

    #[test]
    fn test_bitmap_prev() {
        let mut bitmap = vec![0u8; 8];
        bitmap[0] = 0b0000_0110;
        bitmap[5] = 0b1000_0000;

        assert_eq!(bitmap_prev(&bitmap, 64), Some(47));
        assert_eq!(bitmap_prev(&bitmap, 47), Some(2));
        assert_eq!(bitmap_prev(&bitmap, 2), Some(1));
        assert_eq!(bitmap_prev(&bitmap, 1), None);
        assert_eq!(bitmap_prev(&bitmap, 0), None);
        // positions past the end clamp to the bitmap size
        assert_eq!(bitmap_prev(&bitmap, 100_000), Some(47));
    }
}
