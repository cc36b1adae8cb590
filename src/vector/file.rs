use std::ops::{Deref, DerefMut};

use bit_vec::BitVec;
use log::debug;

use crate::{
    error::{StorageError, StorageResult},
    fileid::{FileId, OpenMode},
    subfile::SubFile,
    transaction::Transaction,
    types::{PageId, RowId, ILLEGAL_PAGE_ID},
    util::{read_u32, write_u32},
    vector::{
        data::{DataArray, DataSchema, FieldType, Value},
        page_manager::{Operation, PageManager},
    },
    verify::{Progress, VerifyTreatment},
    version::VersionPage,
};

/// Data page prefix: the live-record count.
const DATA_PAGE_HEADER_SIZE: usize = 4;

/// A freshly allocated data page: no records, every slot null.
fn reset_data_page(page: &mut VersionPage) {
    let buf = page.buffer_mut();
    buf.fill(0xff);
    write_u32(buf, 0, 0);
    page.dirty();
}

/// Dense ROWID -> fixed-width record store.
///
/// Rows map to `(page, slot)` arithmetically; the page manager keeps the
/// presence bitmap that lets `next`/`prev` skip empty pages. There is no
/// compaction: once the file has grown it only shrinks through `clear`.
pub struct VectorFile {
    sub: SubFile,
    schema: DataSchema,
    manager: PageManager,
    current: Option<VersionPage>,
}

impl Deref for VectorFile {
    type Target = SubFile;

    fn deref(&self) -> &Self::Target {
        &self.sub
    }
}

impl DerefMut for VectorFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.sub
    }
}

impl VectorFile {
    pub fn new(fileid: FileId, fields: Vec<FieldType>) -> StorageResult<Self> {
        let schema = DataSchema::new(fields)?;
        let sub = SubFile::new(fileid)?;
        let content = sub.get_version_file().get_content_size();
        if schema.get_record_size() > content - DATA_PAGE_HEADER_SIZE {
            return Err(StorageError::bad_argument(
                "record does not fit in one page",
            ));
        }
        let mut manager = PageManager::new();
        manager.open(sub.get_fix_mode(), content);
        Ok(Self {
            sub,
            schema,
            manager,
            current: None,
        })
    }

    pub fn get_schema(&self) -> &DataSchema {
        &self.schema
    }

    pub fn create(&mut self, tx: &Transaction) -> StorageResult<()> {
        self.sub.create(tx)?;
        let result = {
            let Self {
                ref sub,
                ref mut manager,
                ..
            } = *self;
            manager.initialize(sub.get_version_file(), tx)
        };
        match result.and_then(|_| self.flush_all_pages(tx)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.recover_all_pages();
                let _ = self.sub.destroy(tx);
                Err(e)
            }
        }
    }

    pub fn open(&mut self, tx: &Transaction, mode: OpenMode) -> StorageResult<()> {
        self.sub.open(tx, mode)?;
        let content = self.sub.get_version_file().get_content_size();
        self.manager.open(self.sub.get_fix_mode(), content);
        Ok(())
    }

    pub fn close(&mut self, tx: &Transaction) -> StorageResult<()> {
        self.flush_all_pages(tx)?;
        self.sub.close();
        Ok(())
    }

    /// Truncate through the version store and write a fresh header.
    pub fn clear(&mut self, tx: &Transaction) -> StorageResult<()> {
        self.recover_all_pages();
        self.sub.get_version_file().truncate(tx, 0)?;
        let result = {
            let Self {
                ref sub,
                ref mut manager,
                ..
            } = *self;
            manager.initialize(sub.get_version_file(), tx)
        };
        match result.and_then(|_| self.flush_all_pages(tx)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.recover_all_pages();
                Err(e)
            }
        }
    }

    pub fn get_count(&mut self, tx: &Transaction) -> StorageResult<u32> {
        if !self.sub.is_mounted(tx) {
            return Ok(0);
        }
        let Self {
            ref sub,
            ref mut manager,
            ..
        } = *self;
        manager.get_count(sub.get_version_file(), tx)
    }

    pub fn is_empty(&mut self, tx: &Transaction) -> StorageResult<bool> {
        Ok(self.get_count(tx)? == 0)
    }

    pub fn get_max_page_id(&mut self, tx: &Transaction) -> StorageResult<PageId> {
        let Self {
            ref sub,
            ref mut manager,
            ..
        } = *self;
        manager.get_max_page_id(sub.get_version_file(), tx)
    }

    pub fn insert(
        &mut self,
        tx: &Transaction,
        row_id: RowId,
        values: &[Value],
    ) -> StorageResult<()> {
        tx.check_cancelled()?;
        let result = self.do_insert(tx, row_id, values);
        self.finish_mutation(tx, result)
    }

    pub fn expunge(&mut self, tx: &Transaction, row_id: RowId) -> StorageResult<()> {
        tx.check_cancelled()?;
        let result = self.do_expunge(tx, row_id);
        self.finish_mutation(tx, result)
    }

    /// Overwrite the fields named by `field_indexes` (all of them when the
    /// list is empty) of an existing row.
    pub fn update(
        &mut self,
        tx: &Transaction,
        row_id: RowId,
        values: &[Value],
        field_indexes: &[usize],
    ) -> StorageResult<()> {
        tx.check_cancelled()?;
        let result = self.do_update(tx, row_id, values, field_indexes);
        self.finish_mutation(tx, result)
    }

    /// Read a row's record, projected to `field_indexes` (all fields when
    /// empty). `None` when the row holds no record.
    pub fn fetch(
        &mut self,
        tx: &Transaction,
        row_id: RowId,
        field_indexes: &[usize],
    ) -> StorageResult<Option<DataArray>> {
        tx.check_cancelled()?;
        self.check_projection(field_indexes)?;
        let (page_id, slot) = self.calc_page_id(row_id);
        let page = match self.take_data_page(tx, page_id, Operation::Read)? {
            Some(page) => page,
            None => return Ok(None),
        };

        let result = {
            let record = self.slot_bytes(&page, slot);
            if self.schema.is_null_record(record) {
                None
            } else {
                Some(self.read_record(record, field_indexes))
            }
        };
        self.put_data_page(page);
        Ok(result)
    }

    /// Probe for a live record without decoding it.
    pub fn is_valid(&mut self, tx: &Transaction, row_id: RowId) -> StorageResult<bool> {
        let (page_id, slot) = self.calc_page_id(row_id);
        let page = match self.take_data_page(tx, page_id, Operation::Read)? {
            Some(page) => page,
            None => return Ok(false),
        };
        let valid = !self.schema.is_null_record(self.slot_bytes(&page, slot));
        self.put_data_page(page);
        Ok(valid)
    }

    /// Smallest live row strictly greater than `row_id`.
    pub fn next(
        &mut self,
        tx: &Transaction,
        row_id: RowId,
        field_indexes: &[usize],
    ) -> StorageResult<Option<(RowId, DataArray)>> {
        tx.check_cancelled()?;
        self.check_projection(field_indexes)?;
        let entries = self.entries_per_page();
        let start = match row_id.checked_add(1) {
            Some(start) => start,
            None => return Ok(None),
        };
        let (mut page_id, mut slot) = self.calc_page_id(start);
        let max = self.get_max_page_id(tx)?;

        loop {
            if page_id > max {
                return Ok(None);
            }
            if self.manage_bit(tx, page_id)? {
                if let Some(page) =
                    self.take_data_page(tx, page_id, Operation::Read)?
                {
                    let found = (slot..entries as usize).find(|s| {
                        !self.schema.is_null_record(self.slot_bytes(&page, *s))
                    });
                    if let Some(s) = found {
                        let row = self.calc_row_id(page_id, s);
                        let data =
                            self.read_record(self.slot_bytes(&page, s), field_indexes);
                        self.put_data_page(page);
                        return Ok(Some((row, data)));
                    }
                    self.put_data_page(page);
                }
            }
            match self.manage_next(tx, page_id)? {
                Some(next) => {
                    page_id = next;
                    slot = 0;
                }
                None => return Ok(None),
            }
        }
    }

    /// Largest live row strictly smaller than `row_id`.
    pub fn prev(
        &mut self,
        tx: &Transaction,
        row_id: RowId,
        field_indexes: &[usize],
    ) -> StorageResult<Option<(RowId, DataArray)>> {
        tx.check_cancelled()?;
        self.check_projection(field_indexes)?;
        if row_id == 0 {
            return Ok(None);
        }
        let entries = self.entries_per_page() as usize;
        let (mut page_id, mut slot) = self.calc_page_id(row_id - 1);
        let max = self.get_max_page_id(tx)?;

        if page_id > max {
            match self.manage_prev(tx, page_id)? {
                Some(prev) => {
                    page_id = prev;
                    slot = entries - 1;
                }
                None => return Ok(None),
            }
        }

        loop {
            if self.manage_bit(tx, page_id)? {
                if let Some(page) =
                    self.take_data_page(tx, page_id, Operation::Read)?
                {
                    let found = (0..=slot).rev().find(|s| {
                        !self.schema.is_null_record(self.slot_bytes(&page, *s))
                    });
                    if let Some(s) = found {
                        let row = self.calc_row_id(page_id, s);
                        let data =
                            self.read_record(self.slot_bytes(&page, s), field_indexes);
                        self.put_data_page(page);
                        return Ok(Some((row, data)));
                    }
                    self.put_data_page(page);
                }
            }
            match self.manage_prev(tx, page_id)? {
                Some(prev) => {
                    page_id = prev;
                    slot = entries - 1;
                }
                None => return Ok(None),
            }
        }
    }

    /// Set one bit per live row.
    pub fn get_all(&mut self, tx: &Transaction, bits: &mut BitVec) -> StorageResult<()> {
        bits.clear();
        let entries = self.entries_per_page() as usize;
        let mut page_id = self.manage_next(tx, 0)?;

        while let Some(pid) = page_id {
            tx.check_cancelled()?;
            if let Some(page) = self.take_data_page(tx, pid, Operation::Read)? {
                for s in 0..entries {
                    if !self.schema.is_null_record(self.slot_bytes(&page, s)) {
                        let row = self.calc_row_id(pid, s) as usize;
                        if row >= bits.len() {
                            bits.grow(row + 1 - bits.len(), false);
                        }
                        bits.set(row, true);
                    }
                }
                self.put_data_page(page);
            }
            page_id = self.manage_next(tx, pid)?;
        }
        Ok(())
    }

    /// Check every data page's count against its slots and the bitmap,
    /// and the header count against the total.
    pub fn verify(
        &mut self,
        tx: &Transaction,
        treatment: VerifyTreatment,
        progress: &mut Progress,
    ) -> StorageResult<()> {
        let k = self.pages_per_table();
        let entries = self.entries_per_page() as usize;
        let max = self.get_max_page_id(tx)?;
        let mut total: u64 = 0;

        for page_id in 1..=max {
            tx.check_cancelled()?;
            if page_id % k == 0 {
                // management table page
                continue;
            }
            let page = match self.take_data_page(tx, page_id, Operation::Read) {
                Ok(Some(page)) => page,
                Ok(None) => {
                    progress.report(format!(
                        "data page {} below max page id {} is missing",
                        page_id, max
                    ));
                    continue;
                }
                Err(StorageError::BadDataPage(id)) => {
                    progress.report(format!("data page {} is unreadable", id));
                    continue;
                }
                Err(e) => return Err(e),
            };
            progress.add_page();

            let stored = read_u32(page.buffer(), 0);
            let live = (0..entries)
                .filter(|s| {
                    !self.schema.is_null_record(self.slot_bytes(&page, *s))
                })
                .count() as u32;
            if stored != live {
                progress.report(format!(
                    "page {} counts {} records but holds {}",
                    page_id, stored, live
                ));
            }
            self.put_data_page(page);

            let bit = self.manage_bit(tx, page_id)?;
            if bit != (live > 0) {
                progress.report(format!(
                    "bitmap bit for page {} is {} but the page holds {} records",
                    page_id, bit, live
                ));
            }
            total += live as u64;
        }

        let count = self.get_count(tx)?;
        if total != count as u64 {
            progress.report(format!(
                "header counts {} entries but the pages hold {}",
                count, total
            ));
        }

        self.flush_all_pages(tx)?;
        progress.finish(treatment)
    }

    pub fn flush_all_pages(&mut self, _tx: &Transaction) -> StorageResult<()> {
        if let Some(page) = self.current.take() {
            self.sub.get_version_file().unfix(page, false)?;
        }
        let Self {
            ref sub,
            ref mut manager,
            ..
        } = *self;
        manager.detach_manage_pages(sub.get_version_file())
    }

    pub fn recover_all_pages(&mut self) {
        self.current = None;
        self.manager.discard();
    }

    // ---- internals ---------------------------------------------------

    fn finish_mutation<T>(
        &mut self,
        tx: &Transaction,
        result: StorageResult<T>,
    ) -> StorageResult<T> {
        match result {
            Ok(v) => match self.flush_all_pages(tx) {
                Ok(()) => Ok(v),
                Err(e) => {
                    self.recover_all_pages();
                    self.sub.mark_unavailable();
                    Err(StorageError::RecoveryFailed(e.to_string()))
                }
            },
            Err(e) => {
                self.recover_all_pages();
                Err(e)
            }
        }
    }

    fn do_insert(
        &mut self,
        tx: &Transaction,
        row_id: RowId,
        values: &[Value],
    ) -> StorageResult<()> {
        self.schema.validate_record(values)?;
        let (page_id, slot) = self.calc_page_id(row_id);
        debug!("insert row {} into page {} slot {}", row_id, page_id, slot);

        let mut page = self
            .take_data_page(tx, page_id, Operation::Insert)?
            .ok_or(StorageError::BadDataPage(page_id))?;

        if !self.schema.is_null_record(self.slot_bytes(&page, slot)) {
            self.put_data_page(page);
            return Err(StorageError::bad_argument(format!(
                "row {} already holds a record",
                row_id
            )));
        }

        let range = self.slot_range(slot);
        let buf = page.buffer_mut();
        for (i, v) in values.iter().enumerate() {
            self.schema.write_field(&mut buf[range.0..range.1], i, v)?;
        }
        let count = read_u32(buf, 0) + 1;
        write_u32(buf, 0, count);
        page.dirty();
        self.put_data_page(page);

        if count == 1 {
            let Self {
                ref sub,
                ref mut manager,
                ..
            } = *self;
            manager.on(sub.get_version_file(), tx, page_id)?;
        }
        let Self {
            ref sub,
            ref mut manager,
            ..
        } = *self;
        manager.increment_count(sub.get_version_file(), tx)
    }

    fn do_expunge(&mut self, tx: &Transaction, row_id: RowId) -> StorageResult<()> {
        let (page_id, slot) = self.calc_page_id(row_id);
        let mut page = self
            .take_data_page(tx, page_id, Operation::Expunge)?
            .ok_or_else(|| {
                StorageError::bad_argument(format!("row {} not found", row_id))
            })?;

        if self.schema.is_null_record(self.slot_bytes(&page, slot)) {
            self.put_data_page(page);
            return Err(StorageError::bad_argument(format!(
                "row {} not found",
                row_id
            )));
        }

        let range = self.slot_range(slot);
        let buf = page.buffer_mut();
        buf[range.0..range.1].fill(0xff);
        let count = read_u32(buf, 0) - 1;
        write_u32(buf, 0, count);
        page.dirty();
        self.put_data_page(page);

        if count == 0 {
            let Self {
                ref sub,
                ref mut manager,
                ..
            } = *self;
            manager.off(sub.get_version_file(), tx, page_id)?;
        }
        let Self {
            ref sub,
            ref mut manager,
            ..
        } = *self;
        manager.decrement_count(sub.get_version_file(), tx)
    }

    fn do_update(
        &mut self,
        tx: &Transaction,
        row_id: RowId,
        values: &[Value],
        field_indexes: &[usize],
    ) -> StorageResult<()> {
        self.check_projection(field_indexes)?;
        let expected = if field_indexes.is_empty() {
            self.schema.get_field_count()
        } else {
            field_indexes.len()
        };
        if values.len() != expected {
            return Err(StorageError::bad_argument(format!(
                "{} values for {} updated fields",
                values.len(),
                expected
            )));
        }

        let (page_id, slot) = self.calc_page_id(row_id);
        let mut page = self
            .take_data_page(tx, page_id, Operation::Update)?
            .ok_or_else(|| {
                StorageError::bad_argument(format!("row {} not found", row_id))
            })?;

        if self.schema.is_null_record(self.slot_bytes(&page, slot)) {
            self.put_data_page(page);
            return Err(StorageError::bad_argument(format!(
                "row {} not found",
                row_id
            )));
        }

        let range = self.slot_range(slot);
        let buf = page.buffer_mut();
        let record = &mut buf[range.0..range.1];
        if field_indexes.is_empty() {
            for (i, v) in values.iter().enumerate() {
                self.schema.write_field(record, i, v)?;
            }
        } else {
            for (i, v) in field_indexes.iter().zip(values) {
                self.schema.write_field(record, *i, v)?;
            }
        }
        page.dirty();
        self.put_data_page(page);
        Ok(())
    }

    // row <-> (page, slot) arithmetic; see the page layout in
    // page_manager.rs

    fn entries_per_page(&self) -> u32 {
        let content = self.sub.get_version_file().get_content_size();
        ((content - DATA_PAGE_HEADER_SIZE) / self.schema.get_record_size())
            as u32
    }

    fn pages_per_table(&self) -> u32 {
        self.manager.get_pages_per_table()
    }

    fn calc_page_id(&self, row_id: RowId) -> (PageId, usize) {
        let entries = self.entries_per_page();
        let k = self.pages_per_table();
        let data_index = row_id / entries;
        let group = data_index / (k - 1);
        let rest = data_index % (k - 1);
        (group * k + rest + 1, (row_id % entries) as usize)
    }

    fn calc_row_id(&self, page_id: PageId, slot: usize) -> RowId {
        let entries = self.entries_per_page();
        let k = self.pages_per_table();
        let group = page_id / k;
        let rest = page_id % k - 1;
        (group * (k - 1) + rest) * entries + slot as u32
    }

    fn slot_range(&self, slot: usize) -> (usize, usize) {
        let start = DATA_PAGE_HEADER_SIZE + slot * self.schema.get_record_size();
        (start, start + self.schema.get_record_size())
    }

    fn slot_bytes<'a>(&self, page: &'a VersionPage, slot: usize) -> &'a [u8] {
        let (start, end) = self.slot_range(slot);
        &page.buffer()[start..end]
    }

    fn read_record(&self, record: &[u8], field_indexes: &[usize]) -> DataArray {
        if field_indexes.is_empty() {
            (0..self.schema.get_field_count())
                .map(|i| self.schema.read_field(record, i))
                .collect()
        } else {
            field_indexes
                .iter()
                .map(|i| self.schema.read_field(record, *i))
                .collect()
        }
    }

    fn check_projection(&self, field_indexes: &[usize]) -> StorageResult<()> {
        for i in field_indexes {
            if *i >= self.schema.get_field_count() {
                return Err(StorageError::bad_argument(format!(
                    "field index {} out of range",
                    i
                )));
            }
        }
        Ok(())
    }

    // current-page cache: one data page stays fixed between calls

    fn take_data_page(
        &mut self,
        tx: &Transaction,
        page_id: PageId,
        operation: Operation,
    ) -> StorageResult<Option<VersionPage>> {
        if let Some(page) = self.current.take() {
            if page.get_page_id() == page_id {
                return Ok(Some(page));
            }
            self.sub.get_version_file().unfix(page, false)?;
        }
        let Self {
            ref sub,
            ref mut manager,
            ..
        } = *self;
        manager.attach(
            sub.get_version_file(),
            tx,
            page_id,
            operation,
            &reset_data_page,
        )
    }

    fn put_data_page(&mut self, page: VersionPage) {
        self.current = Some(page);
    }

    fn manage_bit(&mut self, tx: &Transaction, page_id: PageId) -> StorageResult<bool> {
        let Self {
            ref sub,
            ref mut manager,
            ..
        } = *self;
        manager.get_bit(sub.get_version_file(), tx, page_id)
    }

    fn manage_next(
        &mut self,
        tx: &Transaction,
        page_id: PageId,
    ) -> StorageResult<Option<PageId>> {
        let Self {
            ref sub,
            ref mut manager,
            ..
        } = *self;
        let next = manager.next(sub.get_version_file(), tx, page_id)?;
        Ok((next != ILLEGAL_PAGE_ID).then_some(next))
    }

    fn manage_prev(
        &mut self,
        tx: &Transaction,
        page_id: PageId,
    ) -> StorageResult<Option<PageId>> {
        let Self {
            ref sub,
            ref mut manager,
            ..
        } = *self;
        let prev = manager.prev(sub.get_version_file(), tx, page_id)?;
        Ok((prev != ILLEGAL_PAGE_ID).then_some(prev))
    }
}
