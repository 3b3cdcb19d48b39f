//! Concurrent skiplist backing the memtable.
//!
//! Thread safety follows the single-writer model: `insert` requires
//! external serialization, while any number of readers may traverse
//! concurrently with the writer and with each other, without locks.
//!
//! Invariants:
//!
//! 1. Nodes are allocated from the arena and never freed until the list
//!    (and its arena) are dropped, so a reader's pointer stays valid for
//!    as long as it holds a handle on the enclosing memtable.
//! 2. A node's key is immutable once the node is linked. Links are
//!    published with release stores and traversed with acquire loads, so
//!    observing a link implies observing the fully built node behind it.
//! 3. Keys are unique; deletion is modeled as tombstone entries at a
//!    higher layer, never as node removal.
//!
//! Keys are raw pointers to entries the caller encoded into the same
//! arena; the comparator knows how to read an entry's extent from its
//! encoding.

use std::cell::UnsafeCell;
use std::cmp::Ordering;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::util::arena::Arena;

const MAX_HEIGHT: usize = 12;
const BRANCHING: u32 = 4;

/// Compares the arena-resident entries two raw keys point at.
pub trait KeyComparator: Send + Sync {
    /// Three-way comparison of two encoded entries.
    ///
    /// # Safety
    ///
    /// Both pointers must have been produced by the list's writer and
    /// reference fully encoded entries in the list's arena.
    unsafe fn compare_raw(&self, a: *const u8, b: *const u8) -> Ordering;
}

#[repr(C)]
struct Node {
    key: *const u8,
    // Tail-allocated: `height` links live here, only next[0] is declared.
    // Node memory is sized by new_node for the actual height.
    next: [AtomicPtr<Node>; 1],
}

impl Node {
    /// # Safety: `n` must be below the node's allocated height.
    unsafe fn next(&self, n: usize) -> *mut Node {
        (*self.next.as_ptr().add(n)).load(AtomicOrdering::Acquire)
    }

    /// # Safety: `n` must be below the node's allocated height.
    unsafe fn set_next(&self, n: usize, node: *mut Node) {
        (*self.next.as_ptr().add(n)).store(node, AtomicOrdering::Release);
    }

    /// Relaxed variants for use where a later release store publishes
    /// the result.
    unsafe fn next_relaxed(&self, n: usize) -> *mut Node {
        (*self.next.as_ptr().add(n)).load(AtomicOrdering::Relaxed)
    }

    unsafe fn set_next_relaxed(&self, n: usize, node: *mut Node) {
        (*self.next.as_ptr().add(n)).store(node, AtomicOrdering::Relaxed);
    }
}

/// A sorted map over arena-encoded entries.
pub struct SkipList<C: KeyComparator> {
    comparator: C,
    arena: Arc<Arena>,
    head: *mut Node,
    /// Height of the whole list. Read racily by readers; stale values
    /// are fine (a reader seeing the new height finds either null at the
    /// new levels or a published node).
    max_height: AtomicUsize,
    /// Used only by the single writer.
    rng: UnsafeCell<StdRng>,
}

unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    /// Creates an empty list allocating from `arena`.
    pub fn new(comparator: C, arena: Arc<Arena>) -> Self {
        let head = Self::new_node_in(&arena, ptr::null(), MAX_HEIGHT);
        for level in 0..MAX_HEIGHT {
            unsafe { (*head).set_next_relaxed(level, ptr::null_mut()) };
        }
        Self {
            comparator,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            rng: UnsafeCell::new(StdRng::seed_from_u64(0xdeadbeef)),
        }
    }

    /// Inserts `key`. Requires external serialization with other
    /// inserts, and that no equal key is present.
    pub fn insert(&self, key: *const u8) {
        let mut prev = [ptr::null_mut::<Node>(); MAX_HEIGHT];
        let node = unsafe { self.find_greater_or_equal(key, Some(&mut prev)) };

        // Duplicate insertion is a caller bug; sequence numbers make
        // every memtable key distinct.
        debug_assert!(
            node.is_null() || unsafe { self.comparator.compare_raw((*node).key, key) } != Ordering::Equal
        );

        let height = self.random_height();
        let max_height = self.max_height.load(AtomicOrdering::Relaxed);
        if height > max_height {
            for p in prev.iter_mut().take(height).skip(max_height) {
                *p = self.head;
            }
            // Racy update is fine: a reader observing the new height
            // before the links below exist falls through null links.
            self.max_height.store(height, AtomicOrdering::Relaxed);
        }

        let node = Self::new_node_in(&self.arena, key, height);
        for (level, p) in prev.iter().take(height).enumerate() {
            unsafe {
                // Relaxed init of the new node's forward link is fine:
                // the release store into prev publishes it.
                (*node).set_next_relaxed(level, (**p).next_relaxed(level));
                (**p).set_next(level, node);
            }
        }
    }

    /// Returns true iff an entry equal to `key` is in the list.
    pub fn contains(&self, key: *const u8) -> bool {
        let node = unsafe { self.find_greater_or_equal(key, None) };
        !node.is_null()
            && unsafe { self.comparator.compare_raw((*node).key, key) } == Ordering::Equal
    }

    /// An iterator positioned nowhere; callers seek first.
    pub fn iter(&self) -> SkipListIterator<'_, C> {
        SkipListIterator { list: self, node: ptr::null_mut() }
    }

    fn new_node_in(arena: &Arena, key: *const u8, height: usize) -> *mut Node {
        let size = mem::size_of::<Node>() + mem::size_of::<AtomicPtr<Node>>() * (height - 1);
        let mem = arena.allocate_aligned(size) as *mut Node;
        unsafe {
            ptr::addr_of_mut!((*mem).key).write(key);
        }
        mem
    }

    fn random_height(&self) -> usize {
        let rng = unsafe { &mut *self.rng.get() };
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_ratio(1, BRANCHING) {
            height += 1;
        }
        height
    }

    fn current_height(&self) -> usize {
        self.max_height.load(AtomicOrdering::Relaxed)
    }

    /// True if `key` sorts after the entry in `node`. Null is +infinity.
    unsafe fn key_is_after_node(&self, key: *const u8, node: *mut Node) -> bool {
        !node.is_null() && self.comparator.compare_raw((*node).key, key) == Ordering::Less
    }

    /// First node at or after `key` (null if none). When `prev` is
    /// given, records the predecessor at every level for splicing.
    unsafe fn find_greater_or_equal(
        &self,
        key: *const u8,
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut node = self.head;
        let mut level = self.current_height() - 1;
        loop {
            let next = (*node).next(level);
            if self.key_is_after_node(key, next) {
                node = next;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = node;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Latest node strictly before `key` (head if none).
    unsafe fn find_less_than(&self, key: *const u8) -> *mut Node {
        let mut node = self.head;
        let mut level = self.current_height() - 1;
        loop {
            let next = (*node).next(level);
            if next.is_null() || self.comparator.compare_raw((*next).key, key) != Ordering::Less {
                if level == 0 {
                    return node;
                }
                level -= 1;
            } else {
                node = next;
            }
        }
    }

    /// Last node in the list (head if empty).
    unsafe fn find_last(&self) -> *mut Node {
        let mut node = self.head;
        let mut level = self.current_height() - 1;
        loop {
            let next = (*node).next(level);
            if next.is_null() {
                if level == 0 {
                    return node;
                }
                level -= 1;
            } else {
                node = next;
            }
        }
    }
}

/// Iterator over a skiplist. Backward motion re-searches for the
/// predecessor; nodes carry no back-links.
pub struct SkipListIterator<'a, C: KeyComparator> {
    list: &'a SkipList<C>,
    node: *mut Node,
}

impl<'a, C: KeyComparator> SkipListIterator<'a, C> {
    /// True if positioned at an entry.
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// The current entry's key pointer. Requires `valid()`.
    pub fn key(&self) -> *const u8 {
        debug_assert!(self.valid());
        unsafe { (*self.node).key }
    }

    /// Advances to the next entry. Requires `valid()`.
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    /// Retreats to the previous entry. Requires `valid()`.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let node = unsafe { self.list.find_less_than((*self.node).key) };
        self.node = if node == self.list.head { ptr::null_mut() } else { node };
    }

    /// Positions at the first entry with key >= `target`.
    pub fn seek(&mut self, target: *const u8) {
        self.node = unsafe { self.list.find_greater_or_equal(target, None) };
    }

    /// Positions at the first entry.
    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    /// Positions at the last entry.
    pub fn seek_to_last(&mut self) {
        let node = unsafe { self.list.find_last() };
        self.node = if node == self.list.head { ptr::null_mut() } else { node };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    /// Test comparator over arena entries encoded as
    /// `fixed64(key)` — fixed width, so extent is known.
    struct U64Comparator;

    impl KeyComparator for U64Comparator {
        unsafe fn compare_raw(&self, a: *const u8, b: *const u8) -> Ordering {
            let ka = u64::from_le_bytes(std::slice::from_raw_parts(a, 8).try_into().unwrap());
            let kb = u64::from_le_bytes(std::slice::from_raw_parts(b, 8).try_into().unwrap());
            ka.cmp(&kb)
        }
    }

    fn encode_key(arena: &Arena, key: u64) -> *const u8 {
        let ptr = arena.allocate(8);
        unsafe {
            ptr::copy_nonoverlapping(key.to_le_bytes().as_ptr(), ptr, 8);
        }
        ptr
    }

    fn decode_key(ptr: *const u8) -> u64 {
        u64::from_le_bytes(unsafe { std::slice::from_raw_parts(ptr, 8) }.try_into().unwrap())
    }

    fn new_list() -> (Arc<Arena>, SkipList<U64Comparator>) {
        let arena = Arc::new(Arena::new());
        let list = SkipList::new(U64Comparator, Arc::clone(&arena));
        (arena, list)
    }

    #[test]
    fn test_empty_list() {
        let (_arena, list) = new_list();
        let (arena2, _) = new_list();
        assert!(!list.contains(encode_key(&arena2, 10)));

        let mut iter = list.iter();
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
    }

    #[test]
    fn test_insert_and_lookup() {
        let (arena, list) = new_list();
        let mut keys = BTreeSet::new();
        // Pseudo-random distinct keys.
        let mut state = 1u64;
        for _ in 0..2000 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let key = state % 5000;
            if keys.insert(key) {
                list.insert(encode_key(&arena, key));
            }
        }

        for i in 0..5000 {
            let probe = encode_key(&arena, i);
            assert_eq!(list.contains(probe), keys.contains(&i), "key {}", i);
        }

        // Forward iteration visits every key once, in order.
        let mut iter = list.iter();
        iter.seek_to_first();
        let mut visited = Vec::new();
        while iter.valid() {
            visited.push(decode_key(iter.key()));
            iter.next();
        }
        let expected: Vec<u64> = keys.iter().copied().collect();
        assert_eq!(visited, expected);

        // Backward iteration reverses it.
        let mut iter = list.iter();
        iter.seek_to_last();
        let mut reversed = Vec::new();
        while iter.valid() {
            reversed.push(decode_key(iter.key()));
            iter.prev();
        }
        reversed.reverse();
        assert_eq!(reversed, expected);
    }

    #[test]
    fn test_seek() {
        let (arena, list) = new_list();
        for key in [10u64, 20, 30, 40] {
            list.insert(encode_key(&arena, key));
        }

        let mut iter = list.iter();
        iter.seek(encode_key(&arena, 25));
        assert!(iter.valid());
        assert_eq!(decode_key(iter.key()), 30);

        iter.seek(encode_key(&arena, 30));
        assert!(iter.valid());
        assert_eq!(decode_key(iter.key()), 30);

        iter.seek(encode_key(&arena, 41));
        assert!(!iter.valid());

        iter.seek(encode_key(&arena, 0));
        assert!(iter.valid());
        assert_eq!(decode_key(iter.key()), 10);
    }

    #[test]
    fn test_concurrent_readers_during_insert() {
        let (arena, list) = new_list();
        let list = Arc::new(list);
        let arena = Arc::clone(&arena);
        let stop = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let list = Arc::clone(&list);
            let stop = Arc::clone(&stop);
            readers.push(thread::spawn(move || {
                while !stop.load(AtomicOrdering::Acquire) {
                    let mut iter = iter_of(&list);
                    iter.seek_to_first();
                    let mut last = None;
                    while iter.valid() {
                        let key = decode_key(iter.key());
                        if let Some(prev) = last {
                            assert!(key > prev, "out of order: {} after {}", key, prev);
                        }
                        last = Some(key);
                        iter.next();
                    }
                }
            }));
        }

        // Single writer inserting even keys in shuffled order.
        let mut order: Vec<u64> = (0..1000).map(|i| i * 2).collect();
        let mut state = 7u64;
        for i in (1..order.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            order.swap(i, (state as usize) % (i + 1));
        }
        for key in order {
            list.insert(encode_key(&arena, key));
        }

        stop.store(true, AtomicOrdering::Release);
        for reader in readers {
            reader.join().unwrap();
        }

        let probe = encode_key(&arena, 500);
        assert!(list.contains(probe));
    }

    fn iter_of(list: &SkipList<U64Comparator>) -> SkipListIterator<'_, U64Comparator> {
        list.iter()
    }
}
