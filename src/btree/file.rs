use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, RwLock},
};

use bit_vec::BitVec;
use log::debug;

use crate::{
    btree::{
        header_page::HeaderPage,
        page::{BtreePage, Entry, ENTRY_SIZE, PAGE_HEADER_SIZE},
    },
    error::{StorageError, StorageResult},
    fileid::FileId,
    fix_mode::FixMode,
    physical::{PhysicalFile, PhysicalKind},
    transaction::Transaction,
    types::{AreaId, PageId, Pod, UNDEFINED_PAGE_ID},
    util::HandyRwLock,
    verify::{Progress, VerifyTreatment},
};

fn unwrap_pod<T>(pod: Pod<T>) -> Option<T> {
    debug_assert_eq!(
        Arc::strong_count(&pod),
        1,
        "page still referenced at detach"
    );
    Arc::try_unwrap(pod).ok().map(|cell| cell.into_inner().unwrap())
}

/// Ordered `key -> (pageID, areaID)` store.
///
/// Logical page 0 is the header page; tree pages hang off it in a
/// doubly-linked list per level, with the leaf level forming the iteration
/// order. Attached pages are cached in a per-file map until the operation
/// flushes or recovers them; freed pages wait on a free list and only reach
/// the version store at flush time.
pub struct BtreeFile {
    phys: PhysicalFile,
    page_map: Mutex<HashMap<PageId, Pod<BtreePage>>>,
    free_list: Mutex<Vec<Pod<BtreePage>>>,
    header: Mutex<Option<Pod<HeaderPage>>>,
}

impl Deref for BtreeFile {
    type Target = PhysicalFile;

    fn deref(&self) -> &Self::Target {
        &self.phys
    }
}

impl DerefMut for BtreeFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.phys
    }
}

impl BtreeFile {
    pub fn new(fileid: FileId) -> StorageResult<Self> {
        Ok(Self {
            phys: PhysicalFile::new(fileid, PhysicalKind::PageManage)?,
            page_map: Mutex::new(HashMap::new()),
            free_list: Mutex::new(Vec::new()),
            header: Mutex::new(None),
        })
    }

    /// Create the file and its header page. A failure on the way tears the
    /// file down again.
    pub fn create(&self, tx: &Transaction) -> StorageResult<()> {
        self.phys.create(tx)?;

        let result = (|| {
            let page = self
                .phys
                .allocate_page2(tx, FixMode::WRITE | FixMode::DISCARDABLE)?;
            let mut header = HeaderPage::new(page);
            header.initialize();
            *self.header.lock().unwrap() =
                Some(Arc::new(RwLock::new(header)));
            self.flush_all_pages(tx)
        })();

        if let Err(e) = result {
            self.recover_all_pages();
            let _ = self.phys.destroy(tx);
            return Err(e);
        }
        Ok(())
    }

    pub fn close(&mut self, tx: &Transaction) -> StorageResult<()> {
        self.flush_all_pages(tx)?;
        self.phys.close();
        Ok(())
    }

    /// Discard everything and re-initialize to an empty tree.
    pub fn clear(&self, tx: &Transaction) -> StorageResult<()> {
        self.recover_all_pages();
        self.phys.clear(tx)?;

        let result = (|| {
            let page = self
                .phys
                .allocate_page2(tx, FixMode::WRITE | FixMode::DISCARDABLE)?;
            let mut header = HeaderPage::new(page);
            header.initialize();
            *self.header.lock().unwrap() =
                Some(Arc::new(RwLock::new(header)));
            self.flush_all_pages(tx)
        })();

        if let Err(e) = result {
            self.recover_all_pages();
            return Err(e);
        }
        Ok(())
    }

    pub fn get_count(&self, tx: &Transaction) -> StorageResult<u32> {
        if !self.phys.is_mounted(tx) {
            return Ok(0);
        }
        let header = self.get_header(tx)?;
        let count = header.rl().get_count();
        Ok(count)
    }

    /// Max entries one tree page holds for this file's page size.
    pub fn get_count_per_page(&self) -> usize {
        (self.phys.get_content_size() - PAGE_HEADER_SIZE) / ENTRY_SIZE
    }

    pub fn insert(
        &self,
        tx: &Transaction,
        key: u32,
        value: (PageId, AreaId),
    ) -> StorageResult<()> {
        tx.check_cancelled()?;
        let result = self.do_insert(tx, key, value);
        self.finish_mutation(tx, result)
    }

    pub fn expunge(&self, tx: &Transaction, key: u32) -> StorageResult<()> {
        tx.check_cancelled()?;
        let result = self.do_expunge(tx, key);
        self.finish_mutation(tx, result)
    }

    pub fn get(
        &self,
        tx: &Transaction,
        key: u32,
    ) -> StorageResult<Option<(PageId, AreaId)>> {
        tx.check_cancelled()?;
        let entry = Entry::new(key, 0, 0);
        let found = match self.get_leaf_page(tx, &entry)? {
            Some((leaf, _)) => {
                let page = leaf.rl();
                page.find(&entry).map(|i| {
                    let e = page.get_entry(i);
                    (e.page_id, e.area_id)
                })
            }
            None => None,
        };
        Ok(found)
    }

    /// Set one bit per stored key, walking the leaf chain.
    pub fn get_all(&self, tx: &Transaction, bits: &mut BitVec) -> StorageResult<()> {
        bits.clear();
        let header = self.get_header(tx)?;
        let mut page_id = header.rl().get_left_page_id();

        while page_id != UNDEFINED_PAGE_ID {
            tx.check_cancelled()?;
            let pod = self.attach_page(tx, page_id, FixMode::READ_ONLY)?;
            let page = pod.rl();
            for i in 0..page.get_count() {
                let key = page.get_entry(i).key as usize;
                if key >= bits.len() {
                    bits.grow(key + 1 - bits.len(), false);
                }
                bits.set(key, true);
            }
            page_id = page.get_next_page_id();
        }
        Ok(())
    }

    /// Iteration seed: 0 starts at the left end, `Undefined` stays
    /// exhausted, anything else steps to the given leaf's successor.
    pub fn get_next_leaf_page_id(
        &self,
        tx: &Transaction,
        current: PageId,
    ) -> StorageResult<PageId> {
        // PageID 0 and Undefined carry special meaning here; data never
        // lives on page 0.
        if current == 0 {
            let header = self.get_header(tx)?;
            let left = header.rl().get_left_page_id();
            return Ok(left);
        }
        if current == UNDEFINED_PAGE_ID {
            return Ok(current);
        }
        let pod = self.attach_page(tx, current, FixMode::READ_ONLY)?;
        let next = pod.rl().get_next_page_id();
        Ok(next)
    }

    /// Snapshot all entries of one leaf page.
    pub fn get_page_data(
        &self,
        tx: &Transaction,
        page_id: PageId,
    ) -> StorageResult<Vec<(u32, (PageId, AreaId))>> {
        let pod = self.attach_page(tx, page_id, FixMode::READ_ONLY)?;
        let page = pod.rl();
        let mut data = Vec::with_capacity(page.get_count());
        for i in 0..page.get_count() {
            let e = page.get_entry(i);
            data.push((e.key, (e.page_id, e.area_id)));
        }
        Ok(data)
    }

    /// Walk the leaf chain and check the structural invariants: ascending
    /// keys, intact sibling links, the fill floor on non-root pages, and
    /// the header's count and chain ends.
    pub fn verify(
        &self,
        tx: &Transaction,
        treatment: VerifyTreatment,
        progress: &mut Progress,
    ) -> StorageResult<()> {
        tx.check_cancelled()?;
        let (count, root, left, right) = {
            let header = self.get_header(tx)?;
            let h = header.rl();
            (
                h.get_count(),
                h.get_root_page_id(),
                h.get_left_page_id(),
                h.get_right_page_id(),
            )
        };

        if root == UNDEFINED_PAGE_ID {
            if count != 0 {
                progress.report(format!(
                    "empty tree but header count is {}",
                    count
                ));
            }
            if left != UNDEFINED_PAGE_ID || right != UNDEFINED_PAGE_ID {
                progress.report("empty tree with dangling chain ends");
            }
            self.flush_all_pages(tx)?;
            return progress.finish(treatment);
        }

        let mut total: u64 = 0;
        let mut last_key: Option<u32> = None;
        let mut prev_id = UNDEFINED_PAGE_ID;
        let mut last_leaf = UNDEFINED_PAGE_ID;
        let mut page_id = left;

        while page_id != UNDEFINED_PAGE_ID {
            tx.check_cancelled()?;
            let pod = match self.attach_page(tx, page_id, FixMode::READ_ONLY)
            {
                Ok(pod) => pod,
                Err(StorageError::BadDataPage(id)) => {
                    progress.report(format!(
                        "leaf chain points at unreadable page {}",
                        id
                    ));
                    break;
                }
                Err(e) => return Err(e),
            };
            let page = pod.rl();
            progress.add_page();

            if !page.is_leaf() {
                progress.report(format!(
                    "page {} on the leaf chain is not a leaf",
                    page_id
                ));
            }
            if page.get_prev_page_id() != prev_id {
                progress.report(format!(
                    "page {} prev link {} does not match {}",
                    page_id,
                    page.get_prev_page_id(),
                    prev_id
                ));
            }
            if !page.is_root()
                && page.get_count() < page.get_max_count() / 2
            {
                progress.report(format!(
                    "page {} holds {} entries, below the fill floor",
                    page_id,
                    page.get_count()
                ));
            }
            for i in 0..page.get_count() {
                let key = page.get_entry(i).key;
                if let Some(prev) = last_key {
                    if key <= prev {
                        progress.report(format!(
                            "key {} on page {} not above predecessor {}",
                            key, page_id, prev
                        ));
                    }
                }
                last_key = Some(key);
            }
            total += page.get_count() as u64;
            prev_id = page_id;
            last_leaf = page_id;
            page_id = page.get_next_page_id();
        }

        if last_leaf != right {
            progress.report(format!(
                "right chain end is {} but the walk stopped at {}",
                right, last_leaf
            ));
        }
        if total != count as u64 {
            progress.report(format!(
                "header count {} but {} entries on the leaf chain",
                count, total
            ));
        }

        self.flush_all_pages(tx)?;
        progress.finish(treatment)
    }

    // ---- operation wrap-up -------------------------------------------

    fn finish_mutation<T>(
        &self,
        tx: &Transaction,
        result: StorageResult<T>,
    ) -> StorageResult<T> {
        match result {
            Ok(v) => match self.flush_all_pages(tx) {
                Ok(()) => Ok(v),
                Err(e) => {
                    // a half-flushed operation cannot be rolled back
                    self.recover_all_pages();
                    self.phys.mark_unavailable();
                    Err(StorageError::RecoveryFailed(e.to_string()))
                }
            },
            Err(e) => {
                self.recover_all_pages();
                Err(e)
            }
        }
    }

    /// Unfix every attached page, dirty iff marked so; pages on the free
    /// list go back to the store for reuse.
    pub fn flush_all_pages(&self, tx: &Transaction) -> StorageResult<()> {
        if let Some(pod) = self.header.lock().unwrap().take() {
            if let Some(header) = unwrap_pod(pod) {
                let dirty = header.is_dirty();
                self.phys.detach_page(header.into_physical_page(), dirty)?;
            }
        }

        let freed: Vec<_> =
            self.free_list.lock().unwrap().drain(..).collect();
        for pod in freed {
            if let Some(page) = unwrap_pod(pod) {
                self.phys.free_page2(tx, page.into_physical_page())?;
            }
        }

        let pages: Vec<_> = {
            let mut map = self.page_map.lock().unwrap();
            map.drain().map(|(_, pod)| pod).collect()
        };
        for pod in pages {
            if let Some(page) = unwrap_pod(pod) {
                let dirty = page.is_dirty();
                self.phys.detach_page(page.into_physical_page(), dirty)?;
            }
        }
        Ok(())
    }

    /// Drop every attached page's modifications, free-list pages included.
    pub fn recover_all_pages(&self) {
        if let Some(pod) = self.header.lock().unwrap().take() {
            if let Some(header) = unwrap_pod(pod) {
                self.phys.recover_page(header.into_physical_page());
            }
        }
        let freed: Vec<_> =
            self.free_list.lock().unwrap().drain(..).collect();
        for pod in freed {
            if let Some(page) = unwrap_pod(pod) {
                self.phys.recover_page(page.into_physical_page());
            }
        }
        let pages: Vec<_> = {
            let mut map = self.page_map.lock().unwrap();
            map.drain().map(|(_, pod)| pod).collect()
        };
        for pod in pages {
            if let Some(page) = unwrap_pod(pod) {
                self.phys.recover_page(page.into_physical_page());
            }
        }
    }

    // ---- page cache --------------------------------------------------

    fn get_header(&self, tx: &Transaction) -> StorageResult<Pod<HeaderPage>> {
        let mut slot = self.header.lock().unwrap();
        if slot.is_none() {
            let page =
                self.phys.attach_page(tx, 0, self.phys.get_fix_mode())?;
            *slot = Some(Arc::new(RwLock::new(HeaderPage::new(page))));
        }
        Ok(slot.as_ref().unwrap().clone())
    }

    fn attach_page(
        &self,
        tx: &Transaction,
        page_id: PageId,
        mode: FixMode,
    ) -> StorageResult<Pod<BtreePage>> {
        let mut map = self.page_map.lock().unwrap();
        if let Some(pod) = map.get(&page_id) {
            if mode.is_writable() && pod.rl().is_read_only() {
                let mut page = pod.wl();
                self.phys.update_mode(tx, page.physical_page_mut())?;
            }
            return Ok(pod.clone());
        }

        let page = self.phys.attach_page(tx, page_id, mode)?;
        let pod = Arc::new(RwLock::new(BtreePage::new(page)));
        map.insert(page_id, pod.clone());
        Ok(pod)
    }

    fn allocate_page(
        &self,
        tx: &Transaction,
        prev: PageId,
        next: PageId,
    ) -> StorageResult<Pod<BtreePage>> {
        let page = self.phys.allocate_page2(tx, self.phys.get_fix_mode())?;
        let mut tree_page = BtreePage::new(page);
        tree_page.initialize(prev, next);
        let page_id = tree_page.get_id();
        debug!("allocated tree page {}", page_id);

        let pod = Arc::new(RwLock::new(tree_page));
        self.page_map.lock().unwrap().insert(page_id, pod.clone());
        Ok(pod)
    }

    /// Unhook a page and park it on the free list; the store is not told
    /// until flush.
    fn free_page(&self, pod: &Pod<BtreePage>) {
        let page_id = pod.rl().get_id();
        debug!("freed tree page {}", page_id);
        self.page_map.lock().unwrap().remove(&page_id);
        pod.wl().set_freed();
        self.free_list.lock().unwrap().push(pod.clone());
    }

    fn ensure_writable(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
    ) -> StorageResult<()> {
        let mut page = pod.wl();
        if page.is_read_only() {
            self.phys.update_mode(tx, page.physical_page_mut())?;
        }
        Ok(())
    }

    // ---- descent -----------------------------------------------------

    /// Walk down to the leaf whose range covers the entry, collecting the
    /// ancestor page ids. Internal pages are attached read-only even for
    /// writes; most insertions never touch them.
    fn get_leaf_page(
        &self,
        tx: &Transaction,
        entry: &Entry,
    ) -> StorageResult<Option<(Pod<BtreePage>, Vec<PageId>)>> {
        let header = self.get_header(tx)?;
        let root_id = header.rl().get_root_page_id();
        if root_id == UNDEFINED_PAGE_ID {
            return Ok(None);
        }

        let mut stack = Vec::new();
        let mut pod = self.attach_page(tx, root_id, FixMode::READ_ONLY)?;
        loop {
            let child = {
                let page = pod.rl();
                if page.is_leaf() {
                    break;
                }
                // upper_bound, then one step back to the covering child
                let mut i = page.upper_bound(entry);
                if i > 0 {
                    i -= 1;
                }
                stack.push(page.get_id());
                page.get_entry(i).page_id
            };
            pod = self.attach_page(tx, child, FixMode::READ_ONLY)?;
        }
        Ok(Some((pod, stack)))
    }

    /// Re-derive the ancestor path of a page by descending from the root
    /// until its id shows up as a child.
    fn find_page_stack(
        &self,
        tx: &Transaction,
        entry: &Entry,
        child_id: PageId,
    ) -> StorageResult<Vec<PageId>> {
        let header = self.get_header(tx)?;
        let mut page_id = header.rl().get_root_page_id();
        let mut stack = Vec::new();

        loop {
            if page_id == UNDEFINED_PAGE_ID {
                return Err(StorageError::bad_argument(format!(
                    "page {} has no parent",
                    child_id
                )));
            }
            let pod = self.attach_page(tx, page_id, FixMode::READ_ONLY)?;
            let page = pod.rl();
            if page.is_leaf() {
                return Err(StorageError::bad_argument(
                    "hit a leaf while searching for a parent",
                ));
            }
            let mut i = page.upper_bound(entry);
            if i > 0 {
                i -= 1;
            }
            stack.push(page_id);
            page_id = page.get_entry(i).page_id;
            if page_id == child_id {
                break;
            }
        }
        Ok(stack)
    }

    fn stack_for(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
    ) -> StorageResult<Vec<PageId>> {
        let (first, page_id) = {
            let page = pod.rl();
            if page.is_root() {
                return Ok(Vec::new());
            }
            (page.get_entry(0), page.get_id())
        };
        self.find_page_stack(tx, &first, page_id)
    }

    // ---- mutation ----------------------------------------------------

    fn do_insert(
        &self,
        tx: &Transaction,
        key: u32,
        value: (PageId, AreaId),
    ) -> StorageResult<()> {
        let entry = Entry::new(key, value.0, value.1);
        match self.get_leaf_page(tx, &entry)? {
            Some((leaf, stack)) => {
                self.insert_entry(tx, &leaf, &stack, &entry)?;
            }
            None => {
                // first entry ever: the new leaf is root and both chain
                // ends at once
                let leaf = self.allocate_page(
                    tx,
                    UNDEFINED_PAGE_ID,
                    UNDEFINED_PAGE_ID,
                )?;
                leaf.wl().set_leaf();
                let leaf_id = leaf.rl().get_id();
                {
                    let header = self.get_header(tx)?;
                    let mut h = header.wl();
                    h.set_root_page_id(leaf_id);
                    h.set_left_page_id(leaf_id);
                    h.set_right_page_id(leaf_id);
                }
                self.insert_entry(tx, &leaf, &[], &entry)?;
            }
        }
        self.get_header(tx)?.wl().add_count();
        Ok(())
    }

    fn do_expunge(&self, tx: &Transaction, key: u32) -> StorageResult<()> {
        let entry = Entry::new(key, 0, 0);
        let (leaf, stack) = self.get_leaf_page(tx, &entry)?.ok_or_else(|| {
            StorageError::bad_argument(format!("key {} not found", key))
        })?;
        self.expunge_entry(tx, &leaf, &stack, &entry, true)?;
        self.get_header(tx)?.wl().del_count();
        Ok(())
    }

    /// Insert one entry into the page, expanding it first when full.
    fn insert_entry(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
        stack: &[PageId],
        entry: &Entry,
    ) -> StorageResult<()> {
        let (target, target_stack);
        if pod.rl().get_free_count() < 1 {
            let t = self.expand(tx, pod, stack, entry)?;
            let s = self.stack_for(tx, &t)?;
            target = t;
            target_stack = s;
        } else {
            target = pod.clone();
            target_stack = stack.to_vec();
        }

        let index = {
            let page = target.rl();
            let index = page.upper_bound(entry);
            if index > 0 && page.get_entry(index - 1).key == entry.key {
                return Err(StorageError::UniquenessViolation(entry.key));
            }
            index
        };
        self.page_insert(tx, &target, &target_stack, index, &[*entry])
    }

    /// Remove one entry, then rebalance: the root collapses when emptied
    /// or left with a single child, any other page below half occupancy
    /// merges with or borrows from a neighbour.
    fn expunge_entry(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
        stack: &[PageId],
        entry: &Entry,
        reduce: bool,
    ) -> StorageResult<()> {
        let index = pod.rl().find(entry).ok_or_else(|| {
            StorageError::bad_argument(format!("key {} not found", entry.key))
        })?;
        self.page_expunge(tx, pod, stack, index, index + 1)?;

        let (is_root, count, is_leaf, free, max) = {
            let page = pod.rl();
            (
                page.is_root(),
                page.get_count(),
                page.is_leaf(),
                page.get_free_count(),
                page.get_max_count(),
            )
        };

        if is_root {
            if count == 0 {
                // the tree is empty; both chain ends go with the root
                let header = self.get_header(tx)?;
                {
                    let mut h = header.wl();
                    h.set_root_page_id(UNDEFINED_PAGE_ID);
                    h.set_left_page_id(UNDEFINED_PAGE_ID);
                    h.set_right_page_id(UNDEFINED_PAGE_ID);
                }
                self.free_page(pod);
            } else if count == 1 && !is_leaf && reduce {
                // one-entry internal root: its single child takes over
                let child = pod.rl().get_entry(0).page_id;
                self.get_header(tx)?.wl().set_root_page_id(child);
                self.free_page(pod);
            }
        } else if reduce && free > max / 2 {
            self.reduce(tx, pod, stack)?;
        }
        Ok(())
    }

    /// Slot entries into the page at `index`. An insert at position 0 of a
    /// non-root page re-keys the parent: the old first-key separator comes
    /// out before the shift, the new one goes in after.
    fn page_insert(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
        stack: &[PageId],
        index: usize,
        entries: &[Entry],
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_writable(tx, pod)?;

        let (page_id, count) = {
            let page = pod.rl();
            (page.get_id(), page.get_count())
        };
        let node_update = index == 0 && !stack.is_empty();

        if node_update && count != 0 {
            let old_first = pod.rl().get_entry(0).key;
            let parent = self.attach_page(
                tx,
                *stack.last().unwrap(),
                self.phys.get_fix_mode(),
            )?;
            self.expunge_entry(
                tx,
                &parent,
                &stack[..stack.len() - 1],
                &Entry::new(old_first, page_id, 0),
                false,
            )?;
        }

        pod.wl().insert_at(index, entries);

        if node_update {
            let first = pod.rl().get_entry(0).key;
            let parent = self.attach_page(
                tx,
                *stack.last().unwrap(),
                self.phys.get_fix_mode(),
            )?;
            self.insert_entry(
                tx,
                &parent,
                &stack[..stack.len() - 1],
                &Entry::new(first, page_id, 0),
            )?;
        }
        Ok(())
    }

    /// Remove `[start, end)` from the page with the same parent-side
    /// bookkeeping as `page_insert`; removing the whole page also removes
    /// its separator for good.
    fn page_expunge(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
        stack: &[PageId],
        start: usize,
        end: usize,
    ) -> StorageResult<()> {
        if start == end {
            return Ok(());
        }
        self.ensure_writable(tx, pod)?;

        let (page_id, count, first_key) = {
            let page = pod.rl();
            (page.get_id(), page.get_count(), page.get_entry(0).key)
        };
        let node_update = start == 0 && !stack.is_empty();

        if node_update {
            let parent = self.attach_page(
                tx,
                *stack.last().unwrap(),
                self.phys.get_fix_mode(),
            )?;
            self.expunge_entry(
                tx,
                &parent,
                &stack[..stack.len() - 1],
                &Entry::new(first_key, page_id, 0),
                end == count,
            )?;
        }

        pod.wl().expunge_at(start, end);

        if node_update && pod.rl().get_count() != 0 {
            let first = pod.rl().get_entry(0).key;
            let parent = self.attach_page(
                tx,
                *stack.last().unwrap(),
                self.phys.get_fix_mode(),
            )?;
            self.insert_entry(
                tx,
                &parent,
                &stack[..stack.len() - 1],
                &Entry::new(first, page_id, 0),
            )?;
        }
        Ok(())
    }

    /// Make room for an insert into a full page: split when the chosen
    /// neighbour is nearly full itself, redistribute otherwise. Returns
    /// the page whose key range now covers the entry.
    fn expand(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
        stack: &[PageId],
        entry: &Entry,
    ) -> StorageResult<Pod<BtreePage>> {
        let fix = self.phys.get_fix_mode();
        let (prev_id, next_id) = {
            let page = pod.rl();
            (page.get_prev_page_id(), page.get_next_page_id())
        };

        let (prev_pod, next_pod, next_stack, neighbour_free);
        if prev_id != UNDEFINED_PAGE_ID {
            let prev = self.attach_page(tx, prev_id, fix)?;
            neighbour_free = prev.rl().get_free_count();
            prev_pod = prev;
            next_pod = pod.clone();
            next_stack = stack.to_vec();
        } else if next_id != UNDEFINED_PAGE_ID {
            // leftmost page: the right sibling shares this page's parent
            let next = self.attach_page(tx, next_id, fix)?;
            neighbour_free = next.rl().get_free_count();
            prev_pod = pod.clone();
            next_pod = next;
            next_stack = stack.to_vec();
        } else {
            // the full page is the root: grow the tree by one level
            let root = self.allocate_page(
                tx,
                UNDEFINED_PAGE_ID,
                UNDEFINED_PAGE_ID,
            )?;
            let root_id = root.rl().get_id();
            self.get_header(tx)?.wl().set_root_page_id(root_id);

            let (first_key, page_id) = {
                let page = pod.rl();
                (page.get_entry(0).key, page.get_id())
            };
            self.insert_entry(
                tx,
                &root,
                &[],
                &Entry::new(first_key, page_id, 0),
            )?;

            let next =
                self.allocate_page(tx, page_id, UNDEFINED_PAGE_ID)?;
            let sibling_id = next.rl().get_id();
            self.ensure_writable(tx, pod)?;
            pod.wl().set_next_page_id(sibling_id);
            if pod.rl().is_leaf() {
                next.wl().set_leaf();
                self.get_header(tx)?.wl().set_right_page_id(sibling_id);
            }
            neighbour_free = next.rl().get_free_count();
            prev_pod = pod.clone();
            next_pod = next;
            next_stack = vec![root_id];
        }

        let max_count = pod.rl().get_max_count();
        if neighbour_free < max_count / 10 {
            self.split(tx, &next_pod, &next_stack, &prev_pod, entry)
        } else {
            let target = self
                .redistribute(tx, &next_pod, &next_stack, &prev_pod, Some(entry))?;
            Ok(target.expect("redistribute with an entry picks a target"))
        }
    }

    /// Shrink an under-filled page: merge into the neighbour when it has
    /// room for everything, even out otherwise.
    fn reduce(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
        stack: &[PageId],
    ) -> StorageResult<()> {
        let fix = self.phys.get_fix_mode();
        let (prev_id, next_id, max_count) = {
            let page = pod.rl();
            (
                page.get_prev_page_id(),
                page.get_next_page_id(),
                page.get_max_count(),
            )
        };

        let (prev_pod, next_pod, next_stack, neighbour_free);
        if prev_id != UNDEFINED_PAGE_ID {
            let prev = self.attach_page(tx, prev_id, fix)?;
            neighbour_free = prev.rl().get_free_count();
            prev_pod = prev;
            next_pod = pod.clone();
            next_stack = stack.to_vec();
        } else if next_id != UNDEFINED_PAGE_ID {
            let next = self.attach_page(tx, next_id, fix)?;
            neighbour_free = next.rl().get_free_count();
            prev_pod = pod.clone();
            next_pod = next;
            next_stack = stack.to_vec();
        } else {
            return Ok(());
        }

        if neighbour_free > max_count / 2 {
            self.concatenate(tx, &next_pod, &next_stack, &prev_pod)
        } else {
            self.redistribute(tx, &next_pod, &next_stack, &prev_pod, None)
                .map(|_| ())
        }
    }

    /// Split by carving a new page between `prev` and this one: the new
    /// page takes the previous page's tail beyond 2/3 occupancy plus this
    /// page's leading third, leaving all three about 2/3 full.
    fn split(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
        stack: &[PageId],
        prev_pod: &Pod<BtreePage>,
        entry: &Entry,
    ) -> StorageResult<Pod<BtreePage>> {
        let (page_id, is_leaf, max_count) = {
            let page = pod.rl();
            (page.get_id(), page.is_leaf(), page.get_max_count())
        };
        let prev_id = prev_pod.rl().get_id();

        let new_pod = self.allocate_page(tx, prev_id, page_id)?;
        let new_id = new_pod.rl().get_id();
        if is_leaf {
            new_pod.wl().set_leaf();
        }
        self.ensure_writable(tx, prev_pod)?;
        prev_pod.wl().set_next_page_id(new_id);
        self.ensure_writable(tx, pod)?;
        pod.wl().set_prev_page_id(new_id);

        // stage 1: the previous page keeps 2/3, its tail moves over
        let prev_count = prev_pod.rl().get_count();
        let keep = std::cmp::min(prev_count, max_count * 2 / 3);
        let moved = prev_pod.rl().get_entries(keep, prev_count);
        self.page_insert(tx, &new_pod, stack, 0, &moved)?;
        self.page_expunge(tx, prev_pod, &[], keep, prev_count)?;

        // stage 2: this page hands over its leading third
        let count = pod.rl().get_count();
        let take = std::cmp::min(count, max_count / 3);
        let moved = pod.rl().get_entries(0, take);
        let at = new_pod.rl().get_count();
        self.page_insert(tx, &new_pod, stack, at, &moved)?;
        if take > 0 {
            // registering the new page may have split the parent; find it
            // again before the separator moves
            let fresh = self.stack_for(tx, pod)?;
            self.page_expunge(tx, pod, &fresh, 0, take)?;
        }

        // stage 3: pick the page that now covers the entry
        let result = if entry.key < new_pod.rl().get_entry(0).key {
            prev_pod.clone()
        } else if entry.key < pod.rl().get_entry(0).key {
            new_pod
        } else {
            pod.clone()
        };
        Ok(result)
    }

    /// Merge this page into its left neighbour and free it.
    fn concatenate(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
        stack: &[PageId],
        prev_pod: &Pod<BtreePage>,
    ) -> StorageResult<()> {
        let fix = self.phys.get_fix_mode();
        let (next_id, is_leaf, count) = {
            let page = pod.rl();
            (page.get_next_page_id(), page.is_leaf(), page.get_count())
        };
        let prev_id = prev_pod.rl().get_id();

        if next_id != UNDEFINED_PAGE_ID {
            let next = self.attach_page(tx, next_id, fix)?;
            self.ensure_writable(tx, &next)?;
            next.wl().set_prev_page_id(prev_id);
        } else if is_leaf {
            self.get_header(tx)?.wl().set_right_page_id(prev_id);
        }
        self.ensure_writable(tx, prev_pod)?;
        prev_pod.wl().set_next_page_id(next_id);

        let moved = pod.rl().get_entries(0, count);
        let at = prev_pod.rl().get_count();
        self.page_insert(tx, prev_pod, &[], at, &moved)?;
        self.page_expunge(tx, pod, stack, 0, count)?;

        self.free_page(pod);
        Ok(())
    }

    /// Even out two siblings to half the combined count each. With an
    /// entry given, returns the page that should receive it.
    fn redistribute(
        &self,
        tx: &Transaction,
        pod: &Pod<BtreePage>,
        stack: &[PageId],
        prev_pod: &Pod<BtreePage>,
        entry: Option<&Entry>,
    ) -> StorageResult<Option<Pod<BtreePage>>> {
        let count = pod.rl().get_count();
        let prev_count = prev_pod.rl().get_count();
        let half = (prev_count + count) / 2;

        if prev_count < count {
            // this page gives its head to the previous one
            let move_count = count - half;
            let moved = pod.rl().get_entries(0, move_count);
            self.page_insert(tx, prev_pod, &[], prev_count, &moved)?;
            self.page_expunge(tx, pod, stack, 0, move_count)?;
        } else {
            // the previous page gives its tail to this one
            let moved = prev_pod.rl().get_entries(half, prev_count);
            self.page_insert(tx, pod, stack, 0, &moved)?;
            self.page_expunge(tx, prev_pod, &[], half, prev_count)?;
        }

        let result = entry.map(|e| {
            if e.key < pod.rl().get_entry(0).key {
                prev_pod.clone()
            } else {
                pod.clone()
            }
        });
        Ok(result)
    }
}
