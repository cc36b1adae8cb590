use std::sync::{Arc, RwLock};

/// Identifier of a logical page inside one subfile, starting from 0.
pub type PageId = u32;

/// Identifier of one area slot inside a direct-area page. Only meaningful
/// paired with a `PageId`.
pub type AreaId = u32;

/// 32-bit identifier of a logical row. Density in insertion order is not
/// assumed.
pub type RowId = u32;

/// "No page" marker. PageID 0 is a valid page (the header page of a
/// subfile), so the sentinel lives at the top of the value range.
pub const UNDEFINED_PAGE_ID: PageId = 0xffff_ffff;

/// "Not found" marker returned by page-level scans. Distinct from
/// [`UNDEFINED_PAGE_ID`] so callers that treat 0 as a valid data page can
/// tell the two apart.
pub const ILLEGAL_PAGE_ID: PageId = 0xffff_fffe;

/// "No area" marker, used for free slots in the area directory.
pub const UNDEFINED_AREA_ID: AreaId = 0xffff_ffff;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;
