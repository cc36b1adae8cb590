use std::ops::BitOr;

/// Or-able fix mode bits, preserved faithfully across the version-store
/// boundary.
///
/// `ALLOCATE` returns a zero-initialized buffer without reading the backing
/// store. `DISCARDABLE` allows the store to drop the page's modifications
/// when the owning operation fails.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FixMode(u32);

impl FixMode {
    pub const READ_ONLY: FixMode = FixMode(0x01);
    pub const WRITE: FixMode = FixMode(0x02);
    pub const ALLOCATE: FixMode = FixMode(0x04);
    pub const DISCARDABLE: FixMode = FixMode(0x08);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: FixMode) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_read_only(self) -> bool {
        self.contains(FixMode::READ_ONLY) && !self.is_writable()
    }

    /// Allocation implies write intent.
    pub fn is_writable(self) -> bool {
        self.0 & (FixMode::WRITE.0 | FixMode::ALLOCATE.0) != 0
    }

    pub fn is_allocate(self) -> bool {
        self.contains(FixMode::ALLOCATE)
    }
}

impl BitOr for FixMode {
    type Output = FixMode;

    fn bitor(self, rhs: FixMode) -> FixMode {
        FixMode(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits() {
        let m = FixMode::WRITE | FixMode::DISCARDABLE;
        assert!(m.is_writable());
        assert!(m.contains(FixMode::DISCARDABLE));
        assert!(!m.is_read_only());
        assert!(FixMode::ALLOCATE.is_writable());
        assert!(FixMode::READ_ONLY.is_read_only());
    }
}
