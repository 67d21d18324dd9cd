//! Per-block header packed into 4 bytes.

use super::class::{MAX_SHIFT_DEG, MIN_SHIFT_DEG};

/// Size of an encoded header in the buffer. The payload region starts
/// immediately after it.
pub(crate) const HEADER_SIZE: usize = 4;

/// Largest byte offset either 14-bit diff field can carry. No live block
/// may start past this offset.
pub(crate) const MAX_DIFF: usize = (1 << 14) - 1;

/// Block header packed into a `u32`, serialized little-endian.
///
/// Bit layout:
/// ```text
///   [31..28] shift_deg (4 bits)  — log2 of the block's total footprint
///   [27..14] next_diff (14 bits) — byte offset to the successor block, 0 = tail
///   [13..0]  head_diff (14 bits) — byte offset from the sentinel to this block
/// ```
///
/// `head_diff` is redundant with the block's position: it is never used for
/// traversal, only to validate that a handle really points at a block start.
/// The sentinel itself carries `head_diff == 0`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockHeader(u32);

impl BlockHeader {
    pub fn new(head_diff: usize, next_diff: usize, shift_deg: u8) -> Self {
        debug_assert!(head_diff <= MAX_DIFF);
        debug_assert!(next_diff <= MAX_DIFF);
        debug_assert!(shift_deg <= MAX_SHIFT_DEG);
        Self((u32::from(shift_deg) << 28) | ((next_diff as u32) << 14) | head_diff as u32)
    }

    #[inline]
    pub fn head_diff(self) -> usize {
        (self.0 & 0x3FFF) as usize
    }

    #[inline]
    pub fn next_diff(self) -> usize {
        ((self.0 >> 14) & 0x3FFF) as usize
    }

    #[inline]
    pub fn shift_deg(self) -> u8 {
        (self.0 >> 28) as u8
    }

    /// Total bytes this block occupies, header included.
    #[inline]
    pub fn footprint(self) -> usize {
        1 << self.shift_deg()
    }

    /// True if the degree field holds a value the classifier can produce.
    /// Decoded bytes that were never written as a header fail this.
    #[inline]
    pub fn degree_in_range(self) -> bool {
        (MIN_SHIFT_DEG..=MAX_SHIFT_DEG).contains(&self.shift_deg())
    }

    #[inline]
    pub fn with_head_diff(self, head_diff: usize) -> Self {
        debug_assert!(head_diff <= MAX_DIFF);
        Self((self.0 & !0x3FFF) | head_diff as u32)
    }

    #[inline]
    pub fn with_next_diff(self, next_diff: usize) -> Self {
        debug_assert!(next_diff <= MAX_DIFF);
        Self((self.0 & !(0x3FFF << 14)) | ((next_diff as u32) << 14))
    }

    /// Decode from the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn read(bytes: &[u8]) -> Self {
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&bytes[..HEADER_SIZE]);
        Self(u32::from_le_bytes(raw))
    }

    /// Encode into the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn write(self, bytes: &mut [u8]) {
        bytes[..HEADER_SIZE].copy_from_slice(&self.0.to_le_bytes());
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_fields_round_trip() {
        let h = BlockHeader::new(48, 320, 5);
        assert_eq!(h.head_diff(), 48);
        assert_eq!(h.next_diff(), 320);
        assert_eq!(h.shift_deg(), 5);
        assert_eq!(h.footprint(), 32);
    }

    #[test]
    fn test_fields_at_extremes() {
        let h = BlockHeader::new(MAX_DIFF, MAX_DIFF, MAX_SHIFT_DEG);
        assert_eq!(h.head_diff(), MAX_DIFF);
        assert_eq!(h.next_diff(), MAX_DIFF);
        assert_eq!(h.shift_deg(), MAX_SHIFT_DEG);

        let h = BlockHeader::new(0, 0, MIN_SHIFT_DEG);
        assert_eq!(h.head_diff(), 0);
        assert_eq!(h.next_diff(), 0);
        assert_eq!(h.footprint(), 8);
    }

    #[test]
    fn test_with_updates_one_field() {
        let h = BlockHeader::new(16, 32, 4);
        let h = h.with_next_diff(0);
        assert_eq!(h.head_diff(), 16);
        assert_eq!(h.next_diff(), 0);
        assert_eq!(h.shift_deg(), 4);

        let h = h.with_head_diff(4095);
        assert_eq!(h.head_diff(), 4095);
        assert_eq!(h.next_diff(), 0);
        assert_eq!(h.shift_deg(), 4);
    }

    #[test]
    fn test_serialized_form() {
        let mut bytes = [0u8; 8];
        let h = BlockHeader::new(16, 48, 6);
        h.write(&mut bytes);
        assert_eq!(BlockHeader::read(&bytes), h);
        // Only the first four bytes are touched.
        assert_eq!(&bytes[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_degree_range_check() {
        assert!(BlockHeader::new(0, 0, 3).degree_in_range());
        assert!(BlockHeader::new(0, 0, 14).degree_in_range());
        assert!(!BlockHeader::read(&[0, 0, 0, 0]).degree_in_range());
        assert!(!BlockHeader::read(&[0xFF, 0xFF, 0xFF, 0xFF]).degree_in_range());
    }
}
