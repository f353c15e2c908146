//! Per-page codec marker bits.

use std::fmt;

use spillway_common::{Result, SpillwayError};

/// One-byte set of flags describing the transformations applied to a page.
///
/// Decoding is driven by these bits alone, so a page can be decoded without
/// knowing how the writer was configured.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PageCodecMarkers(u8);

impl PageCodecMarkers {
    pub const NONE: PageCodecMarkers = PageCodecMarkers(0);
    pub const COMPRESSED: PageCodecMarkers = PageCodecMarkers(0b0000_0001);
    pub const ENCRYPTED: PageCodecMarkers = PageCodecMarkers(0b0000_0010);
    pub const CHECKSUMMED: PageCodecMarkers = PageCodecMarkers(0b0000_0100);

    const KNOWN: u8 = Self::COMPRESSED.0 | Self::ENCRYPTED.0 | Self::CHECKSUMMED.0;

    /// Parse a marker byte read from disk. Reserved bits are rejected.
    pub fn from_byte(byte: u8) -> Result<Self> {
        if byte & !Self::KNOWN != 0 {
            return Err(SpillwayError::Corruption(format!(
                "page markers 0x{byte:02x} have reserved bits set"
            )));
        }
        Ok(PageCodecMarkers(byte))
    }

    pub fn byte(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: PageCodecMarkers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_compressed(self) -> bool {
        self.contains(Self::COMPRESSED)
    }

    pub fn is_encrypted(self) -> bool {
        self.contains(Self::ENCRYPTED)
    }

    pub fn is_checksummed(self) -> bool {
        self.contains(Self::CHECKSUMMED)
    }

    #[must_use]
    pub fn with(self, other: PageCodecMarkers) -> Self {
        PageCodecMarkers(self.0 | other.0)
    }
}

impl std::ops::BitOr for PageCodecMarkers {
    type Output = PageCodecMarkers;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

impl fmt::Debug for PageCodecMarkers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_compressed() {
            names.push("COMPRESSED");
        }
        if self.is_encrypted() {
            names.push("ENCRYPTED");
        }
        if self.is_checksummed() {
            names.push("CHECKSUMMED");
        }
        write!(f, "PageCodecMarkers({})", names.join(" | "))
    }
}
