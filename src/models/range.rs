use crate::{Error, Result};

/// A half-open byte range `[start, end)` within an object body.
///
/// Backends that speak inclusive HTTP ranges convert through
/// [`ByteRange::to_http_header`]; everything inside the crate stays half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset, inclusive.
    pub start: u64,
    /// End offset, exclusive.
    pub end: u64,
}

impl ByteRange {
    /// Constructs `[start, end)`, rejecting empty or inverted ranges.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start >= end {
            return Err(Error::invalid(format!(
                "byte range [{}, {}) is empty or inverted",
                start, end
            )));
        }
        Ok(ByteRange { start, end })
    }

    /// Constructs a range from an offset and a size.
    pub fn from_offset_size(offset: u64, size: u64) -> Result<Self> {
        ByteRange::new(offset, offset.saturating_add(size))
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always false for a constructed range; kept for clippy symmetry.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// The inclusive `Range` request header value for this range.
    pub fn to_http_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }

    /// Clamps this range to an object of `len` bytes and returns the
    /// corresponding slice indices, or `None` when the range lies entirely
    /// past the end.
    pub(crate) fn slice_indices(&self, len: u64) -> Option<(usize, usize)> {
        if self.start >= len {
            return None;
        }
        let end = self.end.min(len);
        Some((self.start as usize, end as usize))
    }
}
