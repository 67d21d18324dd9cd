//! Byte-string duplication into a pool.
//!
//! A word is two allocations: an 8-byte record `[string: u32][len: u32]`
//! and the copied bytes themselves. The handle type is the record's
//! [`PoolPtr`], so words thread through the pooled containers like any
//! other element, with [`Word::release`] as their release callback.

use crate::pool::arena::{Pool, PoolError, PoolPtr};

/// Record layout: string handle at 0, byte length at 4, little-endian.
const RECORD_SIZE: usize = 8;

/// Stands in for the string handle of an empty word, which owns no byte
/// allocation. Offset 0 is the pool's control structure, never a payload.
const NO_STRING: u32 = 0;

/// Handle to a pool-resident copy of a byte string.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Word(PoolPtr);

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

impl Word {
    /// Copy all of `source` into the pool.
    ///
    /// # Errors
    ///
    /// Propagates pool failures. If the byte allocation fails after the
    /// record was carved, the record is returned to the pool first.
    pub fn dup<B>(pool: &mut Pool<B>, source: &[u8]) -> Result<Self, PoolError>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        Self::dup_prefix(pool, source, source.len())
    }

    /// Copy at most the first `len` bytes of `source` into the pool.
    ///
    /// # Errors
    ///
    /// Same as [`Word::dup`].
    pub fn dup_prefix<B>(pool: &mut Pool<B>, source: &[u8], len: usize) -> Result<Self, PoolError>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        let len = len.min(source.len());
        let record = pool.alloc(RECORD_SIZE)?;

        let string = if len == 0 {
            NO_STRING
        } else {
            match pool.alloc(len) {
                Ok(ptr) => ptr.to_raw(),
                Err(e) => {
                    // Roll the record back so a failed dup leaves no trace.
                    pool.erase(record).expect("fresh record owned by pool");
                    return Err(e);
                }
            }
        };

        if string != NO_STRING {
            let payload = pool
                .payload_mut(PoolPtr::from_raw(string))
                .expect("fresh string owned by pool");
            payload[..len].copy_from_slice(&source[..len]);
        }

        let bytes = pool.payload_mut(record).expect("fresh record owned by pool");
        bytes[0..4].copy_from_slice(&string.to_le_bytes());
        bytes[4..8].copy_from_slice(&(len as u32).to_le_bytes());

        Ok(Self(record))
    }

    /// Copy the bytes of `source` before the first occurrence of `end`.
    /// `Ok(None)` when `end` never occurs; nothing is allocated then.
    ///
    /// # Errors
    ///
    /// Same as [`Word::dup`].
    pub fn dup_until_char<B>(
        pool: &mut Pool<B>,
        source: &[u8],
        end: u8,
    ) -> Result<Option<Self>, PoolError>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        match source.iter().position(|&b| b == end) {
            Some(at) => Self::dup_prefix(pool, source, at).map(Some),
            None => Ok(None),
        }
    }

    /// Copy the bytes of `source` before the first occurrence of the
    /// substring `end`. `Ok(None)` when `end` never occurs.
    ///
    /// # Errors
    ///
    /// Same as [`Word::dup`].
    pub fn dup_until_str<B>(
        pool: &mut Pool<B>,
        source: &[u8],
        end: &[u8],
    ) -> Result<Option<Self>, PoolError>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        if end.is_empty() || end.len() > source.len() {
            return Ok(None);
        }
        match source.windows(end.len()).position(|window| window == end) {
            Some(at) => Self::dup_prefix(pool, source, at).map(Some),
            None => Ok(None),
        }
    }

    /// Return both allocations to the pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::ForeignPointer`] if the handle does not belong to
    /// `pool` (or was already freed); the word is untouched then.
    pub fn free<B>(self, pool: &mut Pool<B>) -> Result<(), PoolError>
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        let bytes = pool.payload(self.0).ok_or(PoolError::ForeignPointer)?;
        let string = get_u32(bytes, 0);
        if string != NO_STRING {
            pool.erase(PoolPtr::from_raw(string))?;
        }
        pool.erase(self.0)
    }

    /// Release-callback form of [`Word::free`] for the pooled containers.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not a live word of `pool`.
    pub fn release<B>(pool: &mut Pool<B>, ptr: PoolPtr)
    where
        B: AsRef<[u8]> + AsMut<[u8]>,
    {
        Self(ptr).free(pool).expect("word owned by its pool");
    }

    /// The copied bytes, or `None` if the handle does not resolve.
    #[must_use]
    pub fn bytes<'p, B: AsRef<[u8]>>(&self, pool: &'p Pool<B>) -> Option<&'p [u8]> {
        let record = pool.payload(self.0)?;
        let string = get_u32(record, 0);
        let len = get_u32(record, 4) as usize;
        if string == NO_STRING {
            return Some(&[]);
        }
        let payload = pool.payload(PoolPtr::from_raw(string))?;
        payload.get(..len)
    }

    /// The copied bytes as UTF-8, or `None` if the handle does not
    /// resolve or the bytes are not valid UTF-8.
    #[must_use]
    pub fn as_str<'p, B: AsRef<[u8]>>(&self, pool: &'p Pool<B>) -> Option<&'p str> {
        std::str::from_utf8(self.bytes(pool)?).ok()
    }

    /// Stored byte length; 0 if the handle does not resolve.
    #[must_use]
    pub fn len<B: AsRef<[u8]>>(&self, pool: &Pool<B>) -> usize {
        pool.payload(self.0).map_or(0, |record| get_u32(record, 4) as usize)
    }

    /// The record handle, for storing a word in a container.
    #[must_use]
    pub fn handle(self) -> PoolPtr {
        self.0
    }

    /// Rebuild the word from a container-stored handle.
    #[must_use]
    pub fn from_handle(ptr: PoolPtr) -> Self {
        Self(ptr)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn pool_of(len: usize) -> Pool<Vec<u8>> {
        Pool::format(vec![0u8; len]).unwrap()
    }

    #[test]
    fn test_dup_round_trip() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(1024);
        let word = Word::dup(&mut pool, b"hello world").unwrap();
        assert_eq!(word.bytes(&pool).unwrap(), b"hello world");
        assert_eq!(word.as_str(&pool), Some("hello world"));
        assert_eq!(word.len(&pool), 11);
    }

    #[test]
    fn test_dup_charges_two_allocations() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(1024);
        let baseline = pool.usage();
        let word = Word::dup(&mut pool, b"abcdefgh").unwrap();
        // 16 for the record, 16 for the 8 copied bytes.
        assert_eq!(pool.usage(), baseline + 32);
        word.free(&mut pool).unwrap();
        assert_eq!(pool.usage(), baseline);
    }

    #[test]
    fn test_dup_empty() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(1024);
        let word = Word::dup(&mut pool, b"").unwrap();
        assert_eq!(word.bytes(&pool).unwrap(), b"");
        assert_eq!(word.len(&pool), 0);
        word.free(&mut pool).unwrap();
    }

    #[test]
    fn test_dup_prefix_truncates() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(1024);
        let word = Word::dup_prefix(&mut pool, b"hello world", 5).unwrap();
        assert_eq!(word.bytes(&pool).unwrap(), b"hello");
        // A longer prefix than the source clamps.
        let whole = Word::dup_prefix(&mut pool, b"abc", 99).unwrap();
        assert_eq!(whole.bytes(&pool).unwrap(), b"abc");
    }

    #[test]
    fn test_dup_until_char() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(1024);
        let word = Word::dup_until_char(&mut pool, b"key=value", b'=')
            .unwrap()
            .unwrap();
        assert_eq!(word.bytes(&pool).unwrap(), b"key");
        assert_eq!(Word::dup_until_char(&mut pool, b"key", b'=').unwrap(), None);
    }

    #[test]
    fn test_dup_until_str() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(1024);
        let word = Word::dup_until_str(&mut pool, b"one, two, three", b", ")
            .unwrap()
            .unwrap();
        assert_eq!(word.bytes(&pool).unwrap(), b"one");
        assert_eq!(Word::dup_until_str(&mut pool, b"one", b"; ").unwrap(), None);
        assert_eq!(Word::dup_until_str(&mut pool, b"one", b"").unwrap(), None);
    }

    #[test]
    fn test_failed_dup_rolls_back_record() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Room for the control structure, the record and nothing else.
        let mut pool = pool_of(32);
        let baseline = pool.usage();
        let err = Word::dup(&mut pool, b"too big for this pool").unwrap_err();
        assert_eq!(err, PoolError::Exhausted { footprint: 32 });
        assert_eq!(pool.usage(), baseline);
    }

    #[test]
    fn test_double_free_rejected() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(1024);
        let word = Word::dup(&mut pool, b"abc").unwrap();
        word.free(&mut pool).unwrap();
        assert_eq!(word.free(&mut pool), Err(PoolError::ForeignPointer));
    }

    #[test]
    fn test_non_utf8_bytes() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(1024);
        let word = Word::dup(&mut pool, &[0xFF, 0xFE, 0x00]).unwrap();
        assert_eq!(word.bytes(&pool).unwrap(), &[0xFF, 0xFE, 0x00]);
        assert_eq!(word.as_str(&pool), None);
    }
}
