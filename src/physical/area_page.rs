//! In-page bookkeeping of a direct-area page.
//!
//! Layout of the page content:
//!
//! ```text
//!  0          4             8
//!  -----------------------------------------------------------------
//!  | count    | free_offset | area 0 | area 1 | ...   gap   | dir  |
//!  -----------------------------------------------------------------
//! ```
//!
//! Areas grow upward from offset 8; the directory grows downward from the
//! page end, one `{offset, size}` pair per area. A freed slot keeps its
//! directory entry with `offset == UNDEFINED` so area identifiers stay
//! stable. Compaction re-packs live areas and reclaims the holes.

use crate::{
    error::{StorageError, StorageResult},
    types::{AreaId, UNDEFINED_AREA_ID},
    util::{read_u32, write_u32},
};

pub const AREA_PAGE_HEADER_SIZE: usize = 8;

const DIR_ENTRY_SIZE: usize = 8;

pub fn initialize(buf: &mut [u8]) {
    write_u32(buf, 0, 0);
    write_u32(buf, 4, AREA_PAGE_HEADER_SIZE as u32);
}

pub fn get_area_count(buf: &[u8]) -> usize {
    read_u32(buf, 0) as usize
}

fn get_free_offset(buf: &[u8]) -> usize {
    read_u32(buf, 4) as usize
}

fn dir_entry_pos(buf: &[u8], id: AreaId) -> usize {
    buf.len() - DIR_ENTRY_SIZE * (id as usize + 1)
}

fn get_entry(buf: &[u8], id: AreaId) -> (u32, usize) {
    let pos = dir_entry_pos(buf, id);
    (read_u32(buf, pos), read_u32(buf, pos + 4) as usize)
}

fn set_entry(buf: &mut [u8], id: AreaId, offset: u32, size: usize) {
    let pos = dir_entry_pos(buf, id);
    write_u32(buf, pos, offset);
    write_u32(buf, pos + 4, size as u32);
}

fn is_live(buf: &[u8], id: AreaId) -> bool {
    get_entry(buf, id).0 != UNDEFINED_AREA_ID
}

fn check_live(buf: &[u8], id: AreaId) -> StorageResult<(usize, usize)> {
    if (id as usize) >= get_area_count(buf) || !is_live(buf, id) {
        return Err(StorageError::bad_argument(format!(
            "no such area: {}",
            id
        )));
    }
    let (offset, size) = get_entry(buf, id);
    Ok((offset as usize, size))
}

/// Start of the directory region; also the exclusive end of the payload
/// region exposed through `Content`.
pub fn dir_start(buf: &[u8]) -> usize {
    buf.len() - DIR_ENTRY_SIZE * get_area_count(buf)
}

fn live_bytes(buf: &[u8]) -> usize {
    let mut total = 0;
    for id in 0..get_area_count(buf) as AreaId {
        let (offset, size) = get_entry(buf, id);
        if offset != UNDEFINED_AREA_ID {
            total += size;
        }
    }
    total
}

/// Free bytes recoverable by compaction, assuming no new directory slot is
/// needed.
pub fn get_free_size(buf: &[u8]) -> usize {
    dir_start(buf) - AREA_PAGE_HEADER_SIZE - live_bytes(buf)
}

/// Largest area a fresh page of this content size can hold.
pub fn max_area_size(content_len: usize) -> usize {
    content_len - AREA_PAGE_HEADER_SIZE - DIR_ENTRY_SIZE
}

/// Carve out a new area of `size` bytes. Returns `None` when the page
/// cannot hold it even after compaction.
pub fn allocate(buf: &mut [u8], size: usize) -> Option<AreaId> {
    let count = get_area_count(buf) as AreaId;
    let reuse = (0..count).find(|id| !is_live(buf, *id));

    let dir_growth = if reuse.is_some() { 0 } else { DIR_ENTRY_SIZE };
    let contiguous = dir_start(buf) - dir_growth - get_free_offset(buf);
    if size > contiguous {
        // the hole might be fragmentation, not exhaustion
        if size + dir_growth > get_free_size(buf) {
            return None;
        }
        compaction(buf);
    }

    let id = match reuse {
        Some(id) => id,
        None => {
            write_u32(buf, 0, count + 1);
            count
        }
    };
    let offset = get_free_offset(buf);
    write_u32(buf, 4, (offset + size) as u32);
    set_entry(buf, id, offset as u32, size);
    Some(id)
}

pub fn free(buf: &mut [u8], id: AreaId) -> StorageResult<()> {
    check_live(buf, id)?;
    set_entry(buf, id, UNDEFINED_AREA_ID, 0);
    Ok(())
}

/// Re-activate a freed directory slot as an empty area, keeping its id.
pub fn reuse(buf: &mut [u8], id: AreaId) -> StorageResult<AreaId> {
    if (id as usize) >= get_area_count(buf) || is_live(buf, id) {
        return Err(StorageError::bad_argument(format!(
            "area {} is not free",
            id
        )));
    }
    let offset = get_free_offset(buf);
    set_entry(buf, id, offset as u32, 0);
    Ok(id)
}

pub fn read(buf: &[u8], id: AreaId) -> StorageResult<&[u8]> {
    let (offset, size) = check_live(buf, id)?;
    Ok(&buf[offset..offset + size])
}

pub fn write(
    buf: &mut [u8],
    id: AreaId,
    offset: usize,
    data: &[u8],
) -> StorageResult<()> {
    let (start, size) = check_live(buf, id)?;
    if offset + data.len() > size {
        return Err(StorageError::bad_argument(format!(
            "write of {} bytes at {} exceeds area size {}",
            data.len(),
            offset,
            size
        )));
    }
    buf[start + offset..start + offset + data.len()].copy_from_slice(data);
    Ok(())
}

pub fn get_area_size(buf: &[u8], id: AreaId) -> StorageResult<usize> {
    Ok(check_live(buf, id)?.1)
}

pub fn get_area_offset(buf: &[u8], id: AreaId) -> StorageResult<usize> {
    Ok(check_live(buf, id)?.0)
}

/// Grow or shrink an area in place, preserving its prefix. Returns false
/// when the page cannot satisfy the new size.
pub fn change_size(
    buf: &mut [u8],
    id: AreaId,
    new_size: usize,
) -> StorageResult<bool> {
    let (offset, size) = check_live(buf, id)?;
    if new_size <= size {
        set_entry(buf, id, offset as u32, new_size);
        return Ok(true);
    }

    if get_free_size(buf) < new_size - size {
        return Ok(false);
    }

    // relocate: save, free, compact, reallocate
    let saved = buf[offset..offset + size].to_vec();
    set_entry(buf, id, UNDEFINED_AREA_ID, 0);
    compaction(buf);
    let new_offset = get_free_offset(buf);
    write_u32(buf, 4, (new_offset + new_size) as u32);
    set_entry(buf, id, new_offset as u32, new_size);
    buf[new_offset..new_offset + size].copy_from_slice(&saved);
    Ok(true)
}

/// Re-pack live areas to the front of the payload region, in area-id order.
pub fn compaction(buf: &mut [u8]) {
    let count = get_area_count(buf) as AreaId;
    let mut cursor = AREA_PAGE_HEADER_SIZE;
    for id in 0..count {
        let (offset, size) = get_entry(buf, id);
        if offset == UNDEFINED_AREA_ID {
            continue;
        }
        let offset = offset as usize;
        if offset != cursor {
            buf.copy_within(offset..offset + size, cursor);
            set_entry(buf, id, cursor as u32, size);
        }
        cursor += size;
    }
    write_u32(buf, 4, cursor as u32);
}

pub fn get_top_area_id(buf: &[u8]) -> Option<AreaId> {
    (0..get_area_count(buf) as AreaId).find(|id| is_live(buf, *id))
}

pub fn get_next_area_id(buf: &[u8], id: AreaId) -> Option<AreaId> {
    (id + 1..get_area_count(buf) as AreaId).find(|id| is_live(buf, *id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        initialize(&mut buf);
        buf
    }

    #[test]
    fn test_allocate_and_read_back() {
        let mut buf = page();
        let a = allocate(&mut buf, 16).unwrap();
        let b = allocate(&mut buf, 32).unwrap();
        assert_ne!(a, b);

        write(&mut buf, a, 0, &[1u8; 16]).unwrap();
        write(&mut buf, b, 4, &[2u8; 8]).unwrap();
        assert_eq!(read(&buf, a).unwrap(), &[1u8; 16]);
        assert_eq!(&read(&buf, b).unwrap()[4..12], &[2u8; 8]);
    }

    #[test]
    fn test_free_then_reuse_slot() {
        let mut buf = page();
        let a = allocate(&mut buf, 16).unwrap();
        let _b = allocate(&mut buf, 16).unwrap();
        free(&mut buf, a).unwrap();
        assert!(read(&buf, a).is_err());

        // freed slot is recycled before the directory grows
        let c = allocate(&mut buf, 8).unwrap();
        assert_eq!(c, a);
        assert_eq!(get_area_count(&buf), 2);
    }

    #[test]
    fn test_compaction_reclaims_holes() {
        let mut buf = page();
        let ids: Vec<AreaId> =
            (0..4).map(|_| allocate(&mut buf, 200).unwrap()).collect();
        for id in &ids[..3] {
            write(&mut buf, *id, 0, &[*id as u8 + 1; 200]).unwrap();
        }
        // free the middle two, leaving a 400-byte hole
        free(&mut buf, ids[1]).unwrap();
        free(&mut buf, ids[2]).unwrap();

        // too big for the contiguous gap, fits after compaction
        let big = allocate(&mut buf, 380).unwrap();
        assert_eq!(get_area_size(&buf, big).unwrap(), 380);
        assert_eq!(read(&buf, ids[0]).unwrap(), &[1u8; 200]);
    }

    #[test]
    fn test_allocate_over_capacity_fails() {
        let mut buf = page();
        assert!(allocate(&mut buf, max_area_size(1024)).is_some());
        assert!(allocate(&mut buf, 1).is_none());
    }

    #[test]
    fn test_change_size() {
        let mut buf = page();
        let a = allocate(&mut buf, 16).unwrap();
        write(&mut buf, a, 0, &[7u8; 16]).unwrap();
        let _b = allocate(&mut buf, 16).unwrap();

        assert!(change_size(&mut buf, a, 64).unwrap());
        assert_eq!(get_area_size(&buf, a).unwrap(), 64);
        // prefix preserved across the relocation
        assert_eq!(&read(&buf, a).unwrap()[..16], &[7u8; 16]);

        assert!(change_size(&mut buf, a, 8).unwrap());
        assert_eq!(get_area_size(&buf, a).unwrap(), 8);
    }

    #[test]
    fn test_top_and_next_area() {
        let mut buf = page();
        assert_eq!(get_top_area_id(&buf), None);
        let a = allocate(&mut buf, 8).unwrap();
        let b = allocate(&mut buf, 8).unwrap();
        free(&mut buf, a).unwrap();
        assert_eq!(get_top_area_id(&buf), Some(b));
        assert_eq!(get_next_area_id(&buf, b), None);
    }
}
