//! Height-balanced binary search tree with pool-resident nodes.
//!
//! Each node is one 20-byte pool allocation: the element plus parent,
//! left, right and height words. The comparator and the release callback
//! are fixed at construction, so elements stay opaque [`PoolPtr`] values
//! the way the rest of the crate treats them.
//!
//! Removal promotes in-order neighbor values down the tree until a leaf
//! falls out, then unlinks the leaf; rebalancing walks the parent chain
//! back to the root, rotating wherever sibling heights drift more than
//! one apart.

use std::cmp::Ordering;
use std::marker::PhantomData;

use crate::pool::arena::{Pool, PoolError, PoolPtr, ReleaseFn};

/// Node record: `[value][parent][left][right][height]`, u32 little-endian.
const NODE_SIZE: usize = 20;

const VALUE: usize = 0;
const PARENT: usize = 1;
const LEFT: usize = 2;
const RIGHT: usize = 3;
const HEIGHT: usize = 4;

/// Offset 0 is the pool's control structure, standing in for "no node".
const NONE: u32 = 0;

/// Ordering callback over two stored elements.
pub type CompareFn<B> = fn(&Pool<B>, PoolPtr, PoolPtr) -> Ordering;

/// A search tree of [`PoolPtr`] elements ordered by a stored comparator.
///
/// The tree itself is a plain value; only its nodes live in the pool.
/// Every operation takes the pool the nodes were allocated from.
///
/// # Panics
///
/// Operations panic if handed a different pool than the one this tree's
/// nodes live in.
pub struct Tree<B: AsRef<[u8]>> {
    root: u32,
    size: usize,
    cmp: CompareFn<B>,
    release: ReleaseFn<B>,
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn field<B: AsRef<[u8]>>(pool: &Pool<B>, node: u32, slot: usize) -> u32 {
    let bytes = pool
        .payload(PoolPtr::from_raw(node))
        .expect("tree node missing from its pool");
    get_u32(bytes, slot * 4)
}

fn set_field<B: AsRef<[u8]> + AsMut<[u8]>>(pool: &mut Pool<B>, node: u32, slot: usize, value: u32) {
    let bytes = pool
        .payload_mut(PoolPtr::from_raw(node))
        .expect("tree node missing from its pool");
    bytes[slot * 4..slot * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

fn height<B: AsRef<[u8]>>(pool: &Pool<B>, node: u32) -> usize {
    if node == NONE {
        0
    } else {
        field(pool, node, HEIGHT) as usize
    }
}

fn fix_height<B: AsRef<[u8]> + AsMut<[u8]>>(pool: &mut Pool<B>, node: u32) {
    let h = 1 + height(pool, field(pool, node, LEFT)).max(height(pool, field(pool, node, RIGHT)));
    set_field(pool, node, HEIGHT, h as u32);
}

fn leftmost<B: AsRef<[u8]>>(pool: &Pool<B>, mut node: u32) -> u32 {
    while field(pool, node, LEFT) != NONE {
        node = field(pool, node, LEFT);
    }
    node
}

fn rightmost<B: AsRef<[u8]>>(pool: &Pool<B>, mut node: u32) -> u32 {
    while field(pool, node, RIGHT) != NONE {
        node = field(pool, node, RIGHT);
    }
    node
}

fn link_left<B: AsRef<[u8]> + AsMut<[u8]>>(pool: &mut Pool<B>, center: u32, child: u32) {
    set_field(pool, center, LEFT, child);
    if child != NONE {
        set_field(pool, child, PARENT, center);
    }
}

fn link_right<B: AsRef<[u8]> + AsMut<[u8]>>(pool: &mut Pool<B>, center: u32, child: u32) {
    set_field(pool, center, RIGHT, child);
    if child != NONE {
        set_field(pool, child, PARENT, center);
    }
}

/// Put `center` where `origin` used to hang under `parent`.
fn link_parent<B: AsRef<[u8]> + AsMut<[u8]>>(pool: &mut Pool<B>, center: u32, parent: u32, origin: u32) {
    set_field(pool, center, PARENT, parent);
    if parent != NONE {
        if field(pool, parent, LEFT) == origin {
            set_field(pool, parent, LEFT, center);
        } else if field(pool, parent, RIGHT) == origin {
            set_field(pool, parent, RIGHT, center);
        }
    }
}

fn rotate_right<B: AsRef<[u8]> + AsMut<[u8]>>(pool: &mut Pool<B>, node: u32) -> u32 {
    let parent = field(pool, node, PARENT);
    let center = field(pool, node, LEFT);
    link_left(pool, node, field(pool, center, RIGHT));
    link_right(pool, center, node);
    link_parent(pool, center, parent, node);
    fix_height(pool, node);
    fix_height(pool, center);
    center
}

fn rotate_left<B: AsRef<[u8]> + AsMut<[u8]>>(pool: &mut Pool<B>, node: u32) -> u32 {
    let parent = field(pool, node, PARENT);
    let center = field(pool, node, RIGHT);
    link_right(pool, node, field(pool, center, LEFT));
    link_left(pool, center, node);
    link_parent(pool, center, parent, node);
    fix_height(pool, node);
    fix_height(pool, center);
    center
}

/// Restore the height invariant at `node`; returns the subtree's root
/// afterwards. Zig-zag shapes take the inner rotation first.
fn rebalance<B: AsRef<[u8]> + AsMut<[u8]>>(pool: &mut Pool<B>, node: u32) -> u32 {
    let lh = height(pool, field(pool, node, LEFT));
    let rh = height(pool, field(pool, node, RIGHT));
    if lh > rh + 1 {
        let left = field(pool, node, LEFT);
        if height(pool, field(pool, left, RIGHT)) > height(pool, field(pool, left, LEFT)) {
            rotate_left(pool, left);
        }
        rotate_right(pool, node)
    } else if rh > lh + 1 {
        let right = field(pool, node, RIGHT);
        if height(pool, field(pool, right, LEFT)) > height(pool, field(pool, right, RIGHT)) {
            rotate_right(pool, right);
        }
        rotate_left(pool, node)
    } else {
        fix_height(pool, node);
        node
    }
}

/// Rebalance every node from `from` up to the root; returns the new root.
fn rebalance_up<B: AsRef<[u8]> + AsMut<[u8]>>(pool: &mut Pool<B>, from: u32) -> u32 {
    let mut node = from;
    loop {
        let parent = field(pool, node, PARENT);
        let top = rebalance(pool, node);
        if parent == NONE {
            return top;
        }
        node = parent;
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Tree<B> {
    /// Create an empty tree ordering elements with `cmp` and returning
    /// removed elements to the pool through `release`.
    #[must_use]
    pub fn new(cmp: CompareFn<B>, release: ReleaseFn<B>) -> Self {
        Self {
            root: NONE,
            size: 0,
            cmp,
            release,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Height of the tree: 0 when empty, 1 for a lone root.
    #[must_use]
    pub fn height(&self, pool: &Pool<B>) -> usize {
        height(pool, self.root)
    }

    /// Insert `value`. If an equal element is already stored, that
    /// element is released and `value` takes its node.
    ///
    /// # Errors
    ///
    /// Propagates the pool failure if a node cannot be allocated; the
    /// tree is unchanged in that case.
    pub fn insert(&mut self, pool: &mut Pool<B>, value: PoolPtr) -> Result<(), PoolError> {
        let (found, last) = self.locate(pool, value);
        if found != NONE {
            let old = field(pool, found, VALUE);
            (self.release)(pool, PoolPtr::from_raw(old));
            set_field(pool, found, VALUE, value.to_raw());
            return Ok(());
        }

        let node = pool.alloc(NODE_SIZE)?.to_raw();
        set_field(pool, node, VALUE, value.to_raw());
        set_field(pool, node, PARENT, last);
        set_field(pool, node, LEFT, NONE);
        set_field(pool, node, RIGHT, NONE);
        set_field(pool, node, HEIGHT, 1);

        if last != NONE {
            let anchor = PoolPtr::from_raw(field(pool, last, VALUE));
            if (self.cmp)(pool, value, anchor) == Ordering::Less {
                set_field(pool, last, LEFT, node);
            } else {
                set_field(pool, last, RIGHT, node);
            }
        }

        self.root = if self.size == 0 {
            node
        } else {
            rebalance_up(pool, last)
        };
        self.size += 1;
        Ok(())
    }

    /// Replace the element equal to `value`, or insert it if absent.
    ///
    /// # Errors
    ///
    /// Same as [`Tree::insert`], which implements both halves.
    pub fn change(&mut self, pool: &mut Pool<B>, value: PoolPtr) -> Result<(), PoolError> {
        self.insert(pool, value)
    }

    /// Remove the element equal to `value`, releasing it and erasing its
    /// node. Returns false (and does nothing) if no element matches.
    pub fn remove(&mut self, pool: &mut Pool<B>, value: PoolPtr) -> bool {
        let (mut node, _) = self.locate(pool, value);
        if node == NONE {
            return false;
        }
        (self.release)(pool, PoolPtr::from_raw(field(pool, node, VALUE)));

        // Promote in-order neighbor values down until the hole is a leaf.
        loop {
            let left = field(pool, node, LEFT);
            let right = field(pool, node, RIGHT);
            if left == NONE && right == NONE {
                break;
            }
            let heir = if right != NONE {
                leftmost(pool, right)
            } else {
                rightmost(pool, left)
            };
            let promoted = field(pool, heir, VALUE);
            set_field(pool, node, VALUE, promoted);
            node = heir;
        }

        let parent = field(pool, node, PARENT);
        if parent != NONE {
            if field(pool, parent, LEFT) == node {
                set_field(pool, parent, LEFT, NONE);
            } else {
                set_field(pool, parent, RIGHT, NONE);
            }
        }
        self.root = if self.size == 1 {
            NONE
        } else {
            rebalance_up(pool, parent)
        };

        pool.erase(PoolPtr::from_raw(node))
            .expect("tree node owned by its pool");
        self.size -= 1;
        true
    }

    /// The stored element equal to `value`, or `None`.
    #[must_use]
    pub fn access(&self, pool: &Pool<B>, value: PoolPtr) -> Option<PoolPtr> {
        let (found, _) = self.locate(pool, value);
        if found == NONE {
            None
        } else {
            Some(PoolPtr::from_raw(field(pool, found, VALUE)))
        }
    }

    /// Remove every element.
    pub fn clear(&mut self, pool: &mut Pool<B>) {
        while self.root != NONE {
            let value = PoolPtr::from_raw(field(pool, self.root, VALUE));
            self.remove(pool, value);
        }
    }

    /// Traverse the tree node-then-left-then-right. The borrow on the
    /// pool keeps the tree structurally frozen while the iterator lives.
    #[must_use]
    pub fn iter<'a>(&'a self, pool: &'a Pool<B>) -> TreeIter<'a, B> {
        TreeIter {
            pool,
            next: self.root,
            _tree: PhantomData,
        }
    }

    /// Walk down from the root; returns the matching node (or 0) and the
    /// last node visited (the attachment point for an insert).
    fn locate(&self, pool: &Pool<B>, value: PoolPtr) -> (u32, u32) {
        let mut curr = self.root;
        let mut last = NONE;
        while curr != NONE {
            last = curr;
            let anchor = PoolPtr::from_raw(field(pool, curr, VALUE));
            match (self.cmp)(pool, value, anchor) {
                Ordering::Less => curr = field(pool, curr, LEFT),
                Ordering::Greater => curr = field(pool, curr, RIGHT),
                Ordering::Equal => return (curr, last),
            }
        }
        (NONE, last)
    }
}

/// Prefix-order traversal over a [`Tree`].
pub struct TreeIter<'a, B: AsRef<[u8]>> {
    pool: &'a Pool<B>,
    next: u32,
    _tree: PhantomData<&'a Tree<B>>,
}

impl<B: AsRef<[u8]>> Iterator for TreeIter<'_, B> {
    type Item = PoolPtr;

    fn next(&mut self) -> Option<PoolPtr> {
        if self.next == NONE {
            return None;
        }
        let curr = self.next;
        let item = PoolPtr::from_raw(field(self.pool, curr, VALUE));

        let left = field(self.pool, curr, LEFT);
        let right = field(self.pool, curr, RIGHT);
        self.next = if left != NONE {
            left
        } else if right != NONE {
            right
        } else {
            // Climb to the first ancestor entered from the left that still
            // has an unvisited right subtree.
            let mut node = curr;
            loop {
                let parent = field(self.pool, node, PARENT);
                if parent == NONE {
                    break NONE;
                }
                if field(self.pool, parent, RIGHT) == node {
                    node = parent;
                    continue;
                }
                let sibling = field(self.pool, parent, RIGHT);
                if sibling != NONE {
                    break sibling;
                }
                node = parent;
            }
        };
        Some(item)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn token(i: u32) -> PoolPtr {
        PoolPtr::from_raw(i)
    }

    fn by_raw(_: &Pool<Vec<u8>>, a: PoolPtr, b: PoolPtr) -> Ordering {
        a.to_raw().cmp(&b.to_raw())
    }

    fn keep(_: &mut Pool<Vec<u8>>, _: PoolPtr) {}

    fn erase_value(pool: &mut Pool<Vec<u8>>, ptr: PoolPtr) {
        pool.erase(ptr).unwrap();
    }

    fn pool_of(len: usize) -> Pool<Vec<u8>> {
        Pool::format(vec![0u8; len]).unwrap()
    }

    /// Recursively assert search order, height bookkeeping, parent links
    /// and the balance invariant. Returns the subtree height.
    fn audit(pool: &Pool<Vec<u8>>, node: u32, low: Option<u32>, high: Option<u32>) -> usize {
        if node == NONE {
            return 0;
        }
        let value = field(pool, node, VALUE);
        if let Some(low) = low {
            assert!(value > low, "order violated: {value} under {low}");
        }
        if let Some(high) = high {
            assert!(value < high, "order violated: {value} under {high}");
        }
        let left = field(pool, node, LEFT);
        let right = field(pool, node, RIGHT);
        if left != NONE {
            assert_eq!(field(pool, left, PARENT), node);
        }
        if right != NONE {
            assert_eq!(field(pool, right, PARENT), node);
        }
        let lh = audit(pool, left, low, Some(value));
        let rh = audit(pool, right, Some(value), high);
        assert!(lh.abs_diff(rh) <= 1, "imbalance at {value}: {lh} vs {rh}");
        let h = 1 + lh.max(rh);
        assert_eq!(field(pool, node, HEIGHT) as usize, h);
        h
    }

    fn audit_tree(tree: &Tree<Vec<u8>>, pool: &Pool<Vec<u8>>) {
        if tree.root != NONE {
            assert_eq!(field(pool, tree.root, PARENT), NONE);
        }
        audit(pool, tree.root, None, None);
        assert_eq!(tree.iter(pool).count(), tree.size());
    }

    #[test]
    fn test_insert_and_access() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(4096);
        let mut tree = Tree::new(by_raw, keep);

        for i in [50u32, 20, 80, 10, 30, 70, 90] {
            tree.insert(&mut pool, token(i)).unwrap();
        }
        assert_eq!(tree.size(), 7);
        for i in [50u32, 20, 80, 10, 30, 70, 90] {
            assert_eq!(tree.access(&pool, token(i)), Some(token(i)));
        }
        assert_eq!(tree.access(&pool, token(55)), None);
        audit_tree(&tree, &pool);
    }

    #[test]
    fn test_sequential_inserts_stay_balanced() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(8192);
        let mut tree = Tree::new(by_raw, keep);
        // Ascending order is the worst case for an unbalanced tree.
        for i in 1..=100u32 {
            tree.insert(&mut pool, token(i)).unwrap();
            audit_tree(&tree, &pool);
        }
        assert_eq!(tree.size(), 100);
        assert!(tree.height(&pool) <= 10, "height {}", tree.height(&pool));
    }

    #[test]
    fn test_zig_zag_shapes_rebalance() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(4096);
        // Left-right: needs the inner rotation first.
        let mut tree = Tree::new(by_raw, keep);
        for i in [30u32, 10, 20] {
            tree.insert(&mut pool, token(i)).unwrap();
        }
        audit_tree(&tree, &pool);
        assert_eq!(field(&pool, tree.root, VALUE), 20);
        tree.clear(&mut pool);

        // Right-left.
        for i in [10u32, 30, 20] {
            tree.insert(&mut pool, token(i)).unwrap();
        }
        audit_tree(&tree, &pool);
        assert_eq!(field(&pool, tree.root, VALUE), 20);
    }

    #[test]
    fn test_insert_existing_replaces_and_releases() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(4096);
        // Order by the low byte so two distinct handles can be "equal".
        fn by_low_byte(_: &Pool<Vec<u8>>, a: PoolPtr, b: PoolPtr) -> Ordering {
            (a.to_raw() & 0xFF).cmp(&(b.to_raw() & 0xFF))
        }
        let mut tree = Tree::new(by_low_byte, erase_value);

        let first = pool.alloc(10).unwrap();
        let shadow = PoolPtr::from_raw(first.to_raw() | 0x100);
        tree.insert(&mut pool, first).unwrap();
        let before = tree.size();
        // Equal under the comparator: the stored handle is released.
        tree.change(&mut pool, shadow).unwrap();
        assert_eq!(tree.size(), before);
        assert_eq!(pool.space(first), 0);
        assert_eq!(tree.access(&pool, first), Some(shadow));
    }

    #[test]
    fn test_remove_leaf_inner_and_root() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(4096);
        let mut tree = Tree::new(by_raw, keep);
        for i in [50u32, 20, 80, 10, 30, 70, 90, 25] {
            tree.insert(&mut pool, token(i)).unwrap();
        }

        assert!(tree.remove(&mut pool, token(10))); // leaf
        audit_tree(&tree, &pool);
        assert!(tree.remove(&mut pool, token(20))); // inner, two children
        audit_tree(&tree, &pool);
        let root_value = field(&pool, tree.root, VALUE);
        assert!(tree.remove(&mut pool, token(root_value)));
        audit_tree(&tree, &pool);
        assert_eq!(tree.size(), 5);
        assert!(!tree.remove(&mut pool, token(10)));
        for i in [25u32, 30, 70, 80, 90].into_iter().filter(|&i| i != root_value) {
            assert_eq!(tree.access(&pool, token(i)), Some(token(i)));
        }
    }

    #[test]
    fn test_remove_churn_stays_balanced() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(8192);
        let mut tree = Tree::new(by_raw, keep);
        for i in 1..=60u32 {
            tree.insert(&mut pool, token(i)).unwrap();
        }
        for i in (1..=60u32).step_by(3) {
            assert!(tree.remove(&mut pool, token(i)));
            audit_tree(&tree, &pool);
        }
        assert_eq!(tree.size(), 40);
        for i in 1..=60u32 {
            let expect = (i % 3 != 1).then_some(token(i));
            assert_eq!(tree.access(&pool, token(i)), expect);
        }
    }

    #[test]
    fn test_iterator_visits_every_element_once() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(4096);
        let mut tree = Tree::new(by_raw, keep);
        let values = [50u32, 20, 80, 10, 30, 70, 90, 5, 25];
        for &i in &values {
            tree.insert(&mut pool, token(i)).unwrap();
        }
        let mut seen: Vec<u32> = tree.iter(&pool).map(PoolPtr::to_raw).collect();
        // Prefix order starts at the root.
        assert_eq!(seen[0], field(&pool, tree.root, VALUE));
        seen.sort_unstable();
        let mut expected = values.to_vec();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_iterator_on_empty_tree() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = pool_of(256);
        let tree: Tree<Vec<u8>> = Tree::new(by_raw, keep);
        assert_eq!(tree.iter(&pool).next(), None);
    }

    #[test]
    fn test_clear_releases_everything() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = pool_of(4096);
        let baseline = pool.usage();
        let mut tree = Tree::new(by_raw, erase_value);
        for _ in 0..10 {
            let value = pool.alloc(10).unwrap();
            tree.insert(&mut pool, value).unwrap();
        }
        assert!(pool.usage() > baseline);
        tree.clear(&mut pool);
        assert!(tree.is_empty());
        assert_eq!(pool.usage(), baseline);
    }

    #[test]
    fn test_insert_fails_when_pool_exhausted() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Control structure plus two 32-byte nodes.
        let mut pool = pool_of(80);
        let mut tree = Tree::new(by_raw, keep);
        tree.insert(&mut pool, token(1)).unwrap();
        tree.insert(&mut pool, token(2)).unwrap();
        let err = tree.insert(&mut pool, token(3)).unwrap_err();
        assert_eq!(err, PoolError::Exhausted { footprint: 32 });
        assert_eq!(tree.size(), 2);
        audit_tree(&tree, &pool);
    }
}
