use std::path::{Path, PathBuf};

use crate::error::{StorageError, StorageResult};

/// Current on-disk format version. Writers must stamp it; readers reject
/// anything newer.
pub const CURRENT_FORMAT_VERSION: u32 = 1;

pub const DEFAULT_PAGE_SIZE: usize = 4096;

const MIN_PAGE_SIZE: usize = 4096;
const MAX_PAGE_SIZE: usize = 32768;

/// How a subfile is opened. The open mode decides the fix mode used for
/// every page attach until `close`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenMode {
    Read,
    Update,
}

/// Per-file configuration.
///
/// The page size must match between writers and readers of the same file;
/// it is validated once here so the page layers can assume it.
#[derive(Clone, Debug)]
pub struct FileId {
    path: PathBuf,
    page_size: usize,
    temporary: bool,
    read_only: bool,
    mounted: bool,
    version: u32,
    vacuum_threshold: Option<u32>,
}

impl FileId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            temporary: false,
            read_only: false,
            mounted: true,
            version: CURRENT_FORMAT_VERSION,
            vacuum_threshold: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_mounted(mut self, mounted: bool) -> Self {
        self.mounted = mounted;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_vacuum_threshold(mut self, threshold: u32) -> Self {
        self.vacuum_threshold = Some(threshold);
        self
    }

    /// Reject malformed option combinations before any file is touched.
    pub fn validate(&self) -> StorageResult<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(StorageError::bad_argument(format!(
                "page size must be a power of two in [{}, {}], got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }
        if self.version == 0 || self.version > CURRENT_FORMAT_VERSION {
            return Err(StorageError::bad_argument(format!(
                "unsupported format version {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn get_version(&self) -> u32 {
        self.version
    }

    /// Per-term deletion count above which a rebuild is suggested to
    /// full-text callers. The storage core only validates and stores it.
    pub fn get_vacuum_threshold(&self) -> Option<u32> {
        self.vacuum_threshold
    }

    /// Derive the FileId of a sidecar file living in a sub-directory of
    /// this file's directory.
    pub fn sub_file(&self, part: &str) -> FileId {
        let mut sub = self.clone();
        sub.path = self.path.join(part);
        sub
    }
}
