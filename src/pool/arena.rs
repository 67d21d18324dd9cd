//! The pool core: a fixed-region allocator carving one caller-supplied
//! buffer into power-of-two blocks threaded through relative byte offsets.
//!
//! The buffer is formatted once and never grows, shrinks or defragments.
//! Live blocks form a singly linked, address-ordered chain starting at a
//! sentinel that describes the control structure itself; every alloc/erase
//! re-walks that chain. Offsets into the buffer stand in for pointers, so
//! every access stays bounds-checked.

use std::fmt;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use super::class::{self, MAX_FOOTPRINT};
use super::header::{BlockHeader, HEADER_SIZE, MAX_DIFF};
use super::stats;

/// Serialized control structure: sentinel header + usage counter (u64 LE).
/// It sits at the start of the buffer and pays for its own footprint.
pub(crate) const CTRL_SIZE: usize = HEADER_SIZE + 8;

const USAGE_RANGE: std::ops::Range<usize> = HEADER_SIZE..CTRL_SIZE;

/// Handle to a live allocation: the byte offset of its payload from the
/// arena base. Obtained from [`Pool::alloc`], returned to [`Pool::erase`].
///
/// A handle is plain data; it does not borrow the pool. Erasing the block
/// (or reformatting the buffer) leaves any copies dangling — later use of
/// a dangling handle is rejected or reads stale bytes, never unsafe.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PoolPtr(u32);

impl PoolPtr {
    /// Raw offset form, for threading handles through pool-resident records.
    #[must_use]
    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// Rebuild a handle from [`PoolPtr::to_raw`] output.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) fn offset(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_offset(offset: usize) -> Self {
        debug_assert!(offset <= MAX_DIFF + HEADER_SIZE);
        Self(offset as u32)
    }
}

/// Callback returning a consumer-owned value to the pool, stored by the
/// pooled containers the way a destructor would be.
pub type ReleaseFn<B> = fn(&mut Pool<B>, PoolPtr);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolError {
    /// The buffer handed to `format` cannot hold the control structure.
    BufferTooSmall { len: usize, need: usize },
    /// Requested payload size is zero or its footprint exceeds the largest
    /// class. Hard failure; freeing memory will not make it succeed.
    SizeOutOfRange { size: usize },
    /// No gap before the boundary (or past the offset-field ceiling) fits
    /// the requested footprint. May succeed later if blocks are erased.
    Exhausted { footprint: usize },
    /// Erase on a pool that holds no allocations.
    EmptyPool,
    /// The handle does not name a live allocation of this pool. Covers
    /// double-frees and handles from other pools alike.
    ForeignPointer,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::BufferTooSmall { len, need } => {
                write!(f, "buffer of {len} bytes cannot hold the {need}-byte control structure")
            }
            PoolError::SizeOutOfRange { size } => {
                write!(f, "allocation size {size} outside the representable classes")
            }
            PoolError::Exhausted { footprint } => {
                write!(f, "no gap fits a footprint of {footprint} bytes")
            }
            PoolError::EmptyPool => write!(f, "pool holds no allocations"),
            PoolError::ForeignPointer => write!(f, "handle does not name a live allocation"),
        }
    }
}

impl std::error::Error for PoolError {}

/// A formatted arena over any byte buffer.
///
/// The pool stores all of its state — sentinel, usage counter, block
/// headers — inside the buffer itself; the `Pool` value is only a typed
/// view. Mutating operations take `&mut self`, so exclusive access is
/// enforced at compile time; callers that share one arena across threads
/// wrap it in [`SharedPool`](crate::SharedPool) instead.
pub struct Pool<B: AsRef<[u8]>> {
    buf: B,
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Pool<B> {
    /// Format `buf` as an empty arena.
    ///
    /// Writes the control structure into the first [`CTRL_SIZE`] bytes and
    /// charges its footprint to the usage counter. The rest of the buffer
    /// is left untouched.
    ///
    /// # Errors
    ///
    /// [`PoolError::BufferTooSmall`] if the buffer cannot hold the control
    /// structure.
    pub fn format(mut buf: B) -> Result<Self, PoolError> {
        let len = buf.as_ref().len();
        if len < CTRL_SIZE {
            return Err(PoolError::BufferTooSmall { len, need: CTRL_SIZE });
        }

        let deg = class::shift_degree(CTRL_SIZE)
            .expect("control structure fits the smallest classes");
        let bytes = buf.as_mut();
        BlockHeader::new(0, 0, deg).write(bytes);
        let baseline = 1usize << deg;
        bytes[USAGE_RANGE].copy_from_slice(&(baseline as u64).to_le_bytes());

        stats::LIVE_POOLS.add(1);
        stats::TOTAL_CAPACITY.add(len);
        stats::TOTAL_IN_USE.add(baseline);

        Ok(Self { buf })
    }

    /// Allocate `size` payload bytes and return the payload handle.
    ///
    /// First fit: walks the address-ordered chain from the sentinel and
    /// splices the new block into the first gap (between two blocks, or
    /// between the tail and the boundary) that holds its footprint.
    ///
    /// # Errors
    ///
    /// [`PoolError::SizeOutOfRange`] for a zero size or one whose footprint
    /// exceeds the largest class; [`PoolError::Exhausted`] when no gap fits.
    pub fn alloc(&mut self, size: usize) -> Result<PoolPtr, PoolError> {
        if size == 0 {
            return Err(PoolError::SizeOutOfRange { size });
        }
        let Some(deg) = class::shift_degree(HEADER_SIZE + size) else {
            return Err(PoolError::SizeOutOfRange { size });
        };
        let footprint = 1usize << deg;

        let total = self.total();
        let mut curr = 0usize;
        loop {
            let head = self.header_at(curr);
            let start = curr + head.footprint();
            let end = start + footprint;

            if head.next_diff() == 0 {
                // Tail: everything up to the boundary is free, but the new
                // block must still start within the offset fields' reach.
                if end > total || start > MAX_DIFF {
                    return Err(PoolError::Exhausted { footprint });
                }
                self.splice(curr, start, 0, deg);
                return Ok(PoolPtr::from_offset(start + HEADER_SIZE));
            }

            let next = curr + head.next_diff();
            if end <= next {
                self.splice(curr, start, next, deg);
                return Ok(PoolPtr::from_offset(start + HEADER_SIZE));
            }
            curr = next;
        }
    }

    /// Erase the allocation behind `ptr`, splicing its block out of the
    /// chain. The payload bytes are not scrubbed, and neighboring gaps are
    /// not coalesced — freed space is reused opportunistically by later
    /// first-fit walks.
    ///
    /// # Errors
    ///
    /// [`PoolError::EmptyPool`] if nothing is allocated;
    /// [`PoolError::ForeignPointer`] if `ptr` does not name a live
    /// allocation of this pool (double-frees land here, since an erased
    /// block is no longer in the chain).
    pub fn erase(&mut self, ptr: PoolPtr) -> Result<(), PoolError> {
        let sentinel = self.header_at(0);
        if sentinel.next_diff() == 0 {
            return Err(PoolError::EmptyPool);
        }

        let target = ptr.offset();
        let first = sentinel.next_diff();
        if target < first + HEADER_SIZE || target >= self.total() {
            return Err(PoolError::ForeignPointer);
        }

        let mut prev = 0usize;
        let mut curr = first;
        loop {
            if curr + HEADER_SIZE == target {
                break;
            }
            let diff = self.header_at(curr).next_diff();
            if diff == 0 {
                return Err(PoolError::ForeignPointer);
            }
            prev = curr;
            curr += diff;
        }

        let head = self.header_at(curr);
        let prev_head = self.header_at(prev);
        if head.next_diff() == 0 {
            self.put_header(prev, prev_head.with_next_diff(0));
        } else {
            let next = curr + head.next_diff();
            let next_head = self.header_at(next).with_head_diff(next);
            self.put_header(next, next_head);
            self.put_header(prev, prev_head.with_next_diff(next - prev));
        }

        let footprint = head.footprint();
        self.set_usage(self.usage() - footprint);
        stats::TOTAL_IN_USE.sub(footprint);
        stats::LIVE_BLOCKS.sub(1);
        self.debug_validate_chain();
        Ok(())
    }

    /// Mutable view of the usable payload region behind `ptr`, or `None`
    /// if the handle fails validation. See [`Pool::payload`].
    pub fn payload_mut(&mut self, ptr: PoolPtr) -> Option<&mut [u8]> {
        let (start, end) = self.payload_range(ptr)?;
        Some(&mut self.bytes_mut()[start..end])
    }

    /// Write a new block's header and link it after the block at `prev`.
    /// `next == 0` means the new block becomes the tail.
    fn splice(&mut self, prev: usize, start: usize, next: usize, deg: u8) {
        let next_diff = if next == 0 { 0 } else { next - start };
        self.put_header(start, BlockHeader::new(start, next_diff, deg));
        let prev_head = self.header_at(prev).with_next_diff(start - prev);
        self.put_header(prev, prev_head);

        let footprint = 1usize << deg;
        self.set_usage(self.usage() + footprint);
        stats::TOTAL_IN_USE.add(footprint);
        stats::LIVE_BLOCKS.add(1);
        self.debug_validate_chain();
    }

    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    fn put_header(&mut self, offset: usize, head: BlockHeader) {
        head.write(&mut self.bytes_mut()[offset..]);
    }

    fn set_usage(&mut self, usage: usize) {
        self.bytes_mut()[USAGE_RANGE].copy_from_slice(&(usage as u64).to_le_bytes());
    }
}

impl<B: AsRef<[u8]>> Pool<B> {
    /// Footprint of the block behind `ptr`, or 0 if `ptr` does not name a
    /// live allocation. Same lookup as [`Pool::erase`], without mutation.
    #[must_use]
    pub fn space(&self, ptr: PoolPtr) -> usize {
        let sentinel = self.header_at(0);
        if sentinel.next_diff() == 0 {
            return 0;
        }

        let target = ptr.offset();
        let first = sentinel.next_diff();
        if target < first + HEADER_SIZE || target >= self.total() {
            return 0;
        }

        let mut curr = first;
        loop {
            let head = self.header_at(curr);
            if curr + HEADER_SIZE == target {
                return head.footprint();
            }
            if head.next_diff() == 0 {
                return 0;
            }
            curr += head.next_diff();
        }
    }

    /// Fixed size of the backing buffer in bytes.
    #[must_use]
    pub fn total(&self) -> usize {
        self.bytes().len()
    }

    /// Bytes currently committed to the control structure and live blocks,
    /// headers included. O(1).
    #[must_use]
    pub fn usage(&self) -> usize {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes()[USAGE_RANGE]);
        u64::from_le_bytes(raw) as usize
    }

    /// View of the usable payload region behind `ptr` (footprint minus the
    /// header), or `None` if the handle fails validation.
    ///
    /// Validation is O(1) through the header's self-describing offset
    /// field, not a chain walk: a handle whose block was erased but whose
    /// header bytes have not been overwritten still reads back. Handles
    /// obtained from [`Pool::alloc`] and not yet erased are always valid;
    /// use [`Pool::space`] when ownership itself is in question.
    #[must_use]
    pub fn payload(&self, ptr: PoolPtr) -> Option<&[u8]> {
        let (start, end) = self.payload_range(ptr)?;
        Some(&self.bytes()[start..end])
    }

    fn payload_range(&self, ptr: PoolPtr) -> Option<(usize, usize)> {
        let target = ptr.offset();
        let head_at = target.checked_sub(HEADER_SIZE)?;
        if head_at == 0 || target > self.total().saturating_sub(1) {
            return None;
        }
        let head = self.header_at(head_at);
        if head.head_diff() != head_at || !head.degree_in_range() {
            return None;
        }
        let end = head_at + head.footprint();
        if end > self.total() {
            return None;
        }
        Some((target, end))
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn header_at(&self, offset: usize) -> BlockHeader {
        BlockHeader::read(&self.bytes()[offset..])
    }

    /// Walk the whole chain asserting the structural invariants: degrees in
    /// range, strictly ascending addresses, no overlap, boundary respected,
    /// self-describing offsets accurate. Debug builds only.
    #[cfg(debug_assertions)]
    fn debug_validate_chain(&self) {
        let total = self.total();
        let mut occupied = FixedBitSet::with_capacity(total);

        let sentinel = self.header_at(0);
        // The control block may nominally out-span a tiny buffer; clamp.
        for bit in 0..sentinel.footprint().min(total) {
            occupied.insert(bit);
        }

        let mut curr = 0usize;
        loop {
            let head = self.header_at(curr);
            let diff = head.next_diff();
            if diff == 0 {
                break;
            }
            let next = curr + diff;
            let next_head = self.header_at(next);
            assert!(next_head.degree_in_range(), "degree out of range at {next}");
            assert_eq!(next_head.head_diff(), next, "stale self-description at {next}");
            let end = next + next_head.footprint();
            assert!(end <= total, "block at {next} crosses the boundary");
            for bit in next..end {
                assert!(!occupied.contains(bit), "blocks overlap at byte {bit}");
                occupied.insert(bit);
            }
            curr = next;
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn debug_validate_chain(&self) {}
}

impl<B: AsRef<[u8]>> fmt::Debug for Pool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("total", &self.total())
            .field("usage", &self.usage())
            .finish_non_exhaustive()
    }
}

impl<B: AsRef<[u8]>> Drop for Pool<B> {
    fn drop(&mut self) {
        let total = self.total();
        let mut blocks = 0usize;
        let mut curr = 0usize;
        while curr + HEADER_SIZE <= total {
            let diff = self.header_at(curr).next_diff();
            if diff == 0 {
                break;
            }
            blocks += 1;
            curr += diff;
        }
        stats::LIVE_BLOCKS.sub(blocks);
        stats::LIVE_POOLS.sub(1);
        stats::TOTAL_CAPACITY.sub(total);
        stats::TOTAL_IN_USE.sub(self.usage());
    }
}
