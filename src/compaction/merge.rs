//! N-way merge over table iterators in internal-key order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::memtable::InternalKeyComparator;
use crate::sstable::TableIterator;

struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    /// Which child produced this entry; breaks ties so that equal
    /// internal keys (impossible in practice) drain deterministically.
    index: usize,
}

/// Merges many sorted table iterators into one sorted stream.
///
/// For equal user keys the internal-key order already puts the newest
/// entry first, so the compaction drop logic can rely on encounter
/// order alone.
pub struct MergeIterator {
    comparator: InternalKeyComparator,
    children: Vec<TableIterator>,
    heap: BinaryHeap<OrderedEntry>,
    current: Option<HeapEntry>,
}

/// BinaryHeap is a max-heap; reverse the comparison for min-first.
struct OrderedEntry {
    entry: HeapEntry,
    comparator: InternalKeyComparator,
}

impl PartialEq for OrderedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedEntry {}

impl PartialOrd for OrderedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator
            .compare(&other.entry.key, &self.entry.key)
            .then_with(|| other.entry.index.cmp(&self.entry.index))
    }
}

impl MergeIterator {
    /// Creates a merge over `children`, each positioned at its first
    /// entry.
    pub fn new(comparator: InternalKeyComparator, mut children: Vec<TableIterator>) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        for (index, child) in children.iter_mut().enumerate() {
            child.seek_to_first()?;
            if child.valid() {
                heap.push(OrderedEntry {
                    entry: HeapEntry {
                        key: child.key().to_vec(),
                        value: child.value().to_vec(),
                        index,
                    },
                    comparator: comparator.clone(),
                });
            }
        }
        Ok(Self { comparator, children, heap, current: None })
    }

    /// Advances to the next entry; returns false at the end.
    pub fn next(&mut self) -> Result<bool> {
        let entry = match self.heap.pop() {
            Some(ordered) => ordered.entry,
            None => {
                self.current = None;
                return Ok(false);
            }
        };

        // Refill from the child that produced the popped entry.
        let child = &mut self.children[entry.index];
        child.next()?;
        if child.valid() {
            self.heap.push(OrderedEntry {
                entry: HeapEntry {
                    key: child.key().to_vec(),
                    value: child.value().to_vec(),
                    index: entry.index,
                },
                comparator: self.comparator.clone(),
            });
        }

        self.current = Some(entry);
        Ok(true)
    }

    /// True if positioned at an entry.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Current encoded internal key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        &self.current.as_ref().unwrap().key
    }

    /// Current value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        &self.current.as_ref().unwrap().value
    }
}
