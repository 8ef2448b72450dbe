//! Lock-free ordered set with one writer and many readers.
//!
//! The skip list is the index under the memtable: a probabilistic
//! multi-level linked list whose forward links are atomic pointers.
//! Readers traverse with `Acquire` loads and never take a lock; the
//! single writer publishes new nodes with `Release` stores, bottom
//! level first, so a node reachable at level 0 is always fully linked.
//!
//! ## Design Invariants
//!
//! - Keys are inserted at most once; nothing comparing equal to an
//!   existing key may be inserted again.
//! - Nodes are never removed. Every node lives until the list drops,
//!   which is what lets iterators hand out references tied to the
//!   list's lifetime.
//! - Node height is in `[1, MAX_HEIGHT]`; the advertised height only
//!   grows, and is published *after* the links of the node that raised
//!   it.
//!
//! ## Concurrency
//!
//! Exactly one thread may call [`SkipList::insert`] at a time (callers
//! serialize writers externally; the memtable's single-writer contract
//! does this for free). Any number of threads may search or iterate
//! concurrently with that writer. An iterator created at time T
//! observes at least every key inserted before T, possibly some
//! inserted after, and never a half-linked node.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::comparator::Comparator;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Tallest tower a node can have.
pub const MAX_HEIGHT: usize = 12;

/// Reciprocal of the probability that a node grows one more level.
const BRANCHING: u32 = 4;

// ------------------------------------------------------------------------------------------------
// Node
// ------------------------------------------------------------------------------------------------

/// A single tower. `key` is `None` only for the head sentinel, which is
/// never exposed to readers.
struct Node<K> {
    key: Option<K>,
    next: Vec<AtomicPtr<Node<K>>>,
}

impl<K> Node<K> {
    fn alloc(height: usize, key: Option<K>) -> *mut Node<K> {
        let mut next = Vec::with_capacity(height);
        next.resize_with(height, || AtomicPtr::new(ptr::null_mut()));
        Box::into_raw(Box::new(Node { key, next }))
    }

    fn next(&self, level: usize) -> *mut Node<K> {
        self.next[level].load(Ordering::Acquire)
    }

    fn set_next(&self, level: usize, node: *mut Node<K>) {
        self.next[level].store(node, Ordering::Release);
    }

    /// Plain store for links of a node that is not yet reachable.
    fn init_next(&self, level: usize, node: *mut Node<K>) {
        self.next[level].store(node, Ordering::Relaxed);
    }

    fn key(&self) -> &K {
        self.key.as_ref().expect("head sentinel carries no key")
    }
}

// ------------------------------------------------------------------------------------------------
// SkipList
// ------------------------------------------------------------------------------------------------

/// Lock-free probabilistic ordered set.
///
/// `K` is the owned key type; `C` supplies the order. See the
/// [module documentation](self) for the concurrency contract.
pub struct SkipList<K, C> {
    head: *mut Node<K>,
    current_height: AtomicUsize,
    len: AtomicUsize,

    /// Level generator. Writer-only: `insert` is externally serialized,
    /// so this lock is never contended and readers never touch it.
    rng: Mutex<SmallRng>,

    cmp: C,
}

unsafe impl<K: Send, C: Send> Send for SkipList<K, C> {}
unsafe impl<K: Send + Sync, C: Sync> Sync for SkipList<K, C> {}

impl<K, C: Comparator<K>> SkipList<K, C> {
    /// Creates an empty list ordered by `cmp`.
    pub fn new(cmp: C) -> SkipList<K, C> {
        SkipList {
            head: Node::alloc(MAX_HEIGHT, None),
            current_height: AtomicUsize::new(1),
            len: AtomicUsize::new(0),
            rng: Mutex::new(SmallRng::from_entropy()),
            cmp,
        }
    }

    /// Inserts `key` into the list.
    ///
    /// Requires external serialization of writers, and that nothing
    /// comparing equal to `key` is currently in the list.
    pub fn insert(&self, key: K) {
        let mut prevs: [*mut Node<K>; MAX_HEIGHT] = [ptr::null_mut(); MAX_HEIGHT];
        self.find_greater_or_equal(&key, Some(&mut prevs));

        let height = self.random_height();
        let node = Node::alloc(height, Some(key));

        let current_height = self.current_height.load(Ordering::Acquire);
        if height > current_height {
            for prev in prevs.iter_mut().take(height).skip(current_height) {
                *prev = self.head;
            }
        }

        unsafe {
            // The node is unreachable until the stores below, so its own
            // links need no ordering.
            for (level, prev) in prevs.iter().enumerate().take(height) {
                (*node).init_next(level, (**prev).next(level));
            }
            // Publish bottom-up: a reader that finds the node at level 0
            // must see every higher link it has.
            for (level, prev) in prevs.iter().enumerate().take(height) {
                (**prev).set_next(level, node);
            }
        }

        // The height bump is published last; a racing reader that still
        // sees the old height just starts its search one level lower.
        if height > current_height {
            self.current_height.store(height, Ordering::Release);
        }

        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether an entry comparing equal to `key` is in the list.
    pub fn contains(&self, key: &K) -> bool {
        let node = self.find_greater_or_equal(key, None);
        if node.is_null() {
            return false;
        }
        unsafe { self.cmp.compare((*node).key(), key) == CmpOrdering::Equal }
    }

    /// Number of inserted entries.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the comparator the list orders by.
    pub fn comparator(&self) -> &C {
        &self.cmp
    }

    /// First node `>= key` at level 0 (null if none). When `prevs` is
    /// given, fills `prevs[level]` with the rightmost node strictly
    /// less than `key` at every searched level.
    fn find_greater_or_equal(
        &self,
        key: &K,
        mut prevs: Option<&mut [*mut Node<K>; MAX_HEIGHT]>,
    ) -> *mut Node<K> {
        let mut node = self.head;
        let mut level = self.current_height.load(Ordering::Acquire) - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if self.key_is_after_node(key, next) {
                node = next;
            } else {
                if let Some(prevs) = prevs.as_mut() {
                    prevs[level] = node;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Rightmost node `< key` (head if none).
    fn find_less_than(&self, key: &K) -> *mut Node<K> {
        let mut node = self.head;
        let mut level = self.current_height.load(Ordering::Acquire) - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            let before_key = !next.is_null()
                && unsafe { self.cmp.compare((*next).key(), key) == CmpOrdering::Less };
            if before_key {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }

    /// Last node in the list (head if empty).
    fn find_last(&self) -> *mut Node<K> {
        let mut node = self.head;
        let mut level = self.current_height.load(Ordering::Acquire) - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if !next.is_null() {
                node = next;
            } else if level == 0 {
                return node;
            } else {
                level -= 1;
            }
        }
    }

    /// A null `node` acts as the right boundary: every key is before it.
    fn key_is_after_node(&self, key: &K, node: *mut Node<K>) -> bool {
        if node.is_null() {
            return false;
        }
        unsafe { self.cmp.compare(key, (*node).key()) == CmpOrdering::Greater }
    }

    fn random_height(&self) -> usize {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING) == 0 {
            height += 1;
        }
        height
    }
}

impl<K, C> Drop for SkipList<K, C> {
    fn drop(&mut self) {
        // Level 0 links every node exactly once.
        let mut node = self.head;
        while !node.is_null() {
            let next = unsafe { (&(*node).next)[0].load(Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Cursor over a skip list.
///
/// Freshly constructed iterators are invalid; position them with
/// [`seek`](SkipListIter::seek), [`seek_to_first`](SkipListIter::seek_to_first),
/// or [`seek_to_last`](SkipListIter::seek_to_last). Keys observed are a
/// superset of those present at construction time (see the
/// [module documentation](self)).
pub struct SkipListIter<'a, K, C> {
    list: &'a SkipList<K, C>,
    node: *mut Node<K>,
}

impl<'a, K, C: Comparator<K>> SkipListIter<'a, K, C> {
    pub fn new(list: &'a SkipList<K, C>) -> SkipListIter<'a, K, C> {
        SkipListIter {
            list,
            node: ptr::null_mut(),
        }
    }

    /// Whether the iterator is positioned at an entry.
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Key at the current position.
    ///
    /// The reference lives as long as the list: nodes are immortal.
    ///
    /// # Panics
    /// Panics if the iterator is not valid.
    pub fn key(&self) -> &'a K {
        assert!(self.valid(), "key() on an invalid iterator");
        unsafe { (*self.node).key() }
    }

    /// Advances to the next entry.
    ///
    /// # Panics
    /// Panics if the iterator is not valid.
    pub fn next(&mut self) {
        assert!(self.valid(), "next() on an invalid iterator");
        self.node = unsafe { (*self.node).next(0) };
    }

    /// Retreats to the previous entry; becomes invalid at the front.
    ///
    /// There are no back links, so this searches for the last node
    /// before the current key.
    ///
    /// # Panics
    /// Panics if the iterator is not valid.
    pub fn prev(&mut self) {
        assert!(self.valid(), "prev() on an invalid iterator");
        let node = self.list.find_less_than(self.key());
        self.node = if node == self.list.head {
            ptr::null_mut()
        } else {
            node
        };
    }

    /// Positions at the first entry with key `>= target`.
    pub fn seek(&mut self, target: &K) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    /// Positions at the first entry. Valid iff the list is non-empty.
    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    /// Positions at the last entry. Valid iff the list is non-empty.
    pub fn seek_to_last(&mut self) {
        let node = self.list.find_last();
        self.node = if node == self.list.head {
            ptr::null_mut()
        } else {
            node
        };
    }
}
