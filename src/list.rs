//! Doubly-linked list with pool-resident nodes.
//!
//! Each node is one 8-byte pool allocation holding the element and a
//! single link word: the XOR of the two neighbor offsets, so a node pays
//! for one link instead of two. Traversal therefore always needs the
//! offset it came from, which the list keeps in a cached cursor
//! (`prev`/`curr`/`next` plus the index it last resolved); `access` walks
//! forward or backward from the cursor, the head or the tail, whichever
//! is cheapest.
//!
//! Elements are opaque [`PoolPtr`] values. A release callback supplied at
//! construction returns removed elements to the pool.

use crate::pool::arena::{Pool, PoolError, PoolPtr, ReleaseFn};

/// Node record: `[value: u32][xor: u32]`, little-endian.
const NODE_SIZE: usize = 8;

/// Offset 0 belongs to the pool's own control structure, so it can stand
/// in for "no neighbor" in the XOR link words.
const NONE: u32 = 0;

/// An XOR-threaded list of [`PoolPtr`] elements.
///
/// The list itself is a plain value; only its nodes live in the pool.
/// Every operation takes the pool the nodes were allocated from.
///
/// # Panics
///
/// Operations panic if handed a different pool than the one this list's
/// nodes live in.
pub struct List<B: AsRef<[u8]>> {
    head: u32,
    tail: u32,
    len: usize,

    prev: u32,
    curr: u32,
    next: u32,
    record: usize,

    release: ReleaseFn<B>,
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> List<B> {
    /// Create an empty list whose removed elements are returned to the
    /// pool through `release`.
    #[must_use]
    pub fn new(release: ReleaseFn<B>) -> Self {
        Self {
            head: NONE,
            tail: NONE,
            len: 0,
            prev: NONE,
            curr: NONE,
            next: NONE,
            record: 0,
            release,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `value` so that it ends up at `index`. An index at or past
    /// the end appends.
    ///
    /// # Errors
    ///
    /// Propagates the pool failure if the node cannot be allocated; the
    /// list is unchanged in that case.
    pub fn insert(&mut self, pool: &mut Pool<B>, index: usize, value: PoolPtr) -> Result<(), PoolError> {
        let node = pool.alloc(NODE_SIZE)?.to_raw();
        let value = value.to_raw();

        if self.len == 0 {
            self.node_write(pool, node, value, NONE);
            self.head = node;
            self.tail = node;
            self.prev = NONE;
            self.curr = node;
            self.next = NONE;
            self.record = 0;
        } else if index == 0 {
            // In front of the head.
            self.node_write(pool, node, value, self.head);
            let head_xor = self.node_xor(pool, self.head);
            self.set_xor(pool, self.head, head_xor ^ node);
            self.prev = NONE;
            self.next = self.head;
            self.curr = node;
            self.head = node;
            self.record = 0;
        } else if index >= self.len {
            // Append to the tail.
            self.node_write(pool, node, value, self.tail);
            let tail_xor = self.node_xor(pool, self.tail);
            self.set_xor(pool, self.tail, tail_xor ^ node);
            self.prev = self.tail;
            self.next = NONE;
            self.curr = node;
            self.tail = node;
            self.record = self.len;
        } else {
            self.seek(pool, index);
            self.node_write(pool, node, value, self.prev ^ self.curr);
            let prev_xor = self.node_xor(pool, self.prev);
            self.set_xor(pool, self.prev, prev_xor ^ self.curr ^ node);
            let curr_xor = self.node_xor(pool, self.curr);
            self.set_xor(pool, self.curr, curr_xor ^ self.prev ^ node);
            self.next = self.curr;
            self.curr = node;
            self.record = index;
        }

        self.len += 1;
        Ok(())
    }

    /// Element at `index`, or `None` when out of range. Moves the cursor.
    pub fn access(&mut self, pool: &Pool<B>, index: usize) -> Option<PoolPtr> {
        if self.seek(pool, index) {
            Some(PoolPtr::from_raw(self.node_value(pool, self.curr)))
        } else {
            None
        }
    }

    /// Replace the element at `index`, releasing the old one. An
    /// out-of-range index degrades to [`List::insert`].
    ///
    /// # Errors
    ///
    /// Only the insert fallback can fail.
    pub fn change(&mut self, pool: &mut Pool<B>, index: usize, value: PoolPtr) -> Result<(), PoolError> {
        if self.seek(pool, index) {
            let old = self.node_value(pool, self.curr);
            (self.release)(pool, PoolPtr::from_raw(old));
            self.set_value(pool, self.curr, value.to_raw());
            Ok(())
        } else {
            self.insert(pool, index, value)
        }
    }

    /// Remove the element at `index`, releasing it and erasing its node.
    /// Returns false (and does nothing) when out of range.
    pub fn remove(&mut self, pool: &mut Pool<B>, index: usize) -> bool {
        if !self.seek(pool, index) {
            return false;
        }
        let target = self.curr;
        let value = self.node_value(pool, target);

        if self.len == 1 {
            self.head = NONE;
            self.tail = NONE;
            self.prev = NONE;
            self.curr = NONE;
            self.next = NONE;
            self.record = 0;
        } else if index == 0 {
            let xor = self.node_xor(pool, self.next) ^ target;
            self.set_xor(pool, self.next, xor);
            self.head = self.next;
            self.curr = self.next;
            // The new head has no predecessor; its link word is the successor.
            self.next = xor;
            self.record = 0;
        } else if index == self.len - 1 {
            let xor = self.node_xor(pool, self.prev) ^ target;
            self.set_xor(pool, self.prev, xor);
            self.tail = self.prev;
            self.curr = self.prev;
            self.prev = xor;
            self.next = NONE;
            self.record = index - 1;
        } else {
            let prev_xor = self.node_xor(pool, self.prev);
            self.set_xor(pool, self.prev, prev_xor ^ target ^ self.next);
            let next_xor = self.node_xor(pool, self.next) ^ target ^ self.prev;
            self.set_xor(pool, self.next, next_xor);
            self.curr = self.next;
            self.next = next_xor ^ self.prev;
            // record unchanged: the same index now names the successor.
        }

        (self.release)(pool, PoolPtr::from_raw(value));
        pool.erase(PoolPtr::from_raw(target))
            .expect("list node owned by its pool");
        self.len -= 1;
        true
    }

    /// Reverse the list. O(1): XOR links carry no direction, so swapping
    /// head and tail is enough. Resets the cursor to the new head.
    pub fn revert(&mut self, pool: &Pool<B>) {
        if self.len > 1 {
            std::mem::swap(&mut self.head, &mut self.tail);
            self.curr = self.head;
            self.prev = NONE;
            self.next = self.node_xor(pool, self.head);
            self.record = 0;
        }
    }

    /// Remove every element, front to back.
    pub fn clear(&mut self, pool: &mut Pool<B>) {
        while self.len > 0 {
            self.remove(pool, 0);
        }
    }

    /// Park the cursor on `index`, walking from wherever is closest.
    /// False when out of range.
    fn seek(&mut self, pool: &Pool<B>, index: usize) -> bool {
        if index >= self.len {
            return false;
        }

        if index == 0 {
            self.curr = self.head;
            self.prev = NONE;
            self.next = self.node_xor(pool, self.curr);
            self.record = 0;
        } else if index == self.len - 1 {
            self.curr = self.tail;
            self.next = NONE;
            self.prev = self.node_xor(pool, self.curr);
            self.record = index;
        } else {
            while self.record < index {
                let stale = self.curr;
                self.prev = self.curr;
                self.curr = self.next;
                self.next = self.node_xor(pool, self.curr) ^ stale;
                self.record += 1;
            }
            while self.record > index {
                let stale = self.curr;
                self.next = self.curr;
                self.curr = self.prev;
                self.prev = self.node_xor(pool, self.curr) ^ stale;
                self.record -= 1;
            }
        }

        true
    }

    fn node_bytes<'p>(&self, pool: &'p Pool<B>, node: u32) -> &'p [u8] {
        pool.payload(PoolPtr::from_raw(node))
            .expect("list node missing from its pool")
    }

    fn node_value(&self, pool: &Pool<B>, node: u32) -> u32 {
        get_u32(self.node_bytes(pool, node), 0)
    }

    fn node_xor(&self, pool: &Pool<B>, node: u32) -> u32 {
        get_u32(self.node_bytes(pool, node), 4)
    }

    fn node_write(&self, pool: &mut Pool<B>, node: u32, value: u32, xor: u32) {
        let bytes = pool
            .payload_mut(PoolPtr::from_raw(node))
            .expect("list node missing from its pool");
        put_u32(bytes, 0, value);
        put_u32(bytes, 4, xor);
    }

    fn set_value(&self, pool: &mut Pool<B>, node: u32, value: u32) {
        let bytes = pool
            .payload_mut(PoolPtr::from_raw(node))
            .expect("list node missing from its pool");
        put_u32(bytes, 0, value);
    }

    fn set_xor(&self, pool: &mut Pool<B>, node: u32, xor: u32) {
        let bytes = pool
            .payload_mut(PoolPtr::from_raw(node))
            .expect("list node missing from its pool");
        put_u32(bytes, 4, xor);
    }
}
