use std::ops::{Deref, DerefMut};

/// Borrowed view of a page's usable payload region.
///
/// The view hides whatever the physical layer keeps inside the page: the
/// file header on page 0 of a non-managed file, the page header and area
/// directory on a direct-area page. `size()` reflects the bytes left after
/// subtracting those regions. Ownership of the buffer stays with the page;
/// the view cannot outlive it.
pub struct Content<'a> {
    data: &'a [u8],
}

impl<'a> Content<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Deref for Content<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

/// Mutable counterpart of [`Content`]. Only handed out for pages fixed in a
/// writable mode; the caller still marks the page dirty explicitly.
pub struct ContentMut<'a> {
    data: &'a mut [u8],
}

impl<'a> ContentMut<'a> {
    pub(crate) fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Deref for ContentMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl DerefMut for ContentMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data
    }
}
