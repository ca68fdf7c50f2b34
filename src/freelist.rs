//! The segregated free-list index.
//!
//! Free blocks are grouped into size classes by powers of two. Each class is
//! a circular doubly linked list threaded through the free blocks
//! themselves: the first payload word of a free block is its successor, the
//! second its predecessor, both stored as heap offsets. Every list is headed
//! by an 8-byte sentinel node that lives inside the prologue block, so an
//! empty list is simply a sentinel that points at itself.

use static_assertions::const_assert;

use crate::block::{DSIZE, MIN_BLOCK_SIZE, WSIZE};
use crate::heap::{Heap, HeapGrower};

/// Number of size classes.
pub const CLASS_COUNT: usize = 18;

/// Upper size bound of class 0. Class `i` holds blocks up to
/// `MIN_CLASS_SIZE << i` bytes; the last class holds everything bigger.
pub const MIN_CLASS_SIZE: usize = MIN_BLOCK_SIZE;

/// Offset of the first sentinel node.
pub const SENTINEL_BASE: usize = DSIZE;

/// Each sentinel is a successor word and a predecessor word.
pub const SENTINEL_SIZE: usize = 2 * WSIZE;

const_assert!(SENTINEL_SIZE == DSIZE);
const_assert!(MIN_CLASS_SIZE << (CLASS_COUNT - 2) == 1 << 20);

/// The size class a block of `size` bytes belongs to.
pub fn class_of(size: usize) -> usize {
    if size <= MIN_CLASS_SIZE {
        return 0;
    }
    // Number of bits needed to hold `size - 1` is ceil(log2(size)).
    let ceil_log2 = (usize::BITS - (size - 1).leading_zeros()) as usize;
    let class = ceil_log2 - MIN_CLASS_SIZE.trailing_zeros() as usize;
    class.min(CLASS_COUNT - 1)
}

/// Offset of the sentinel node heading `class`.
pub fn sentinel(class: usize) -> usize {
    debug_assert!(class < CLASS_COUNT);
    SENTINEL_BASE + class * SENTINEL_SIZE
}

impl<G: HeapGrower> Heap<G> {
    /// The successor link of a list node.
    pub fn succ(&self, node: usize) -> usize {
        self.get(node) as usize
    }

    /// The predecessor link of a list node.
    pub fn pred(&self, node: usize) -> usize {
        self.get(node + WSIZE) as usize
    }

    fn set_succ(&mut self, node: usize, succ: usize) {
        self.put(node, succ as u32)
    }

    fn set_pred(&mut self, node: usize, pred: usize) {
        self.put(node + WSIZE, pred as u32)
    }

    /// Point every sentinel at itself, making every class empty.
    pub fn init_free_lists(&mut self) {
        for class in 0..CLASS_COUNT {
            let s = sentinel(class);
            self.set_succ(s, s);
            self.set_pred(s, s);
        }
    }

    /// Push the free block at `bp`, of `size` bytes, onto the front of its
    /// class list.
    pub fn insert_free(&mut self, bp: usize, size: usize) {
        let s = sentinel(class_of(size));
        let first = self.succ(s);

        self.set_succ(bp, first);
        self.set_pred(bp, s);
        self.set_succ(s, bp);
        self.set_pred(first, bp);
    }

    /// Unlink the free block at `bp` from whatever list it is in.
    pub fn remove_free(&mut self, bp: usize) {
        let succ = self.succ(bp);
        let pred = self.pred(bp);
        self.set_pred(succ, pred);
        self.set_succ(pred, succ);
    }

    /// Find a free block of at least `size` bytes.
    ///
    /// Starting with the class `size` falls in, each class list is scanned
    /// front to back, and the first block that is big enough is returned. If
    /// the class has none, the next larger class is tried, and so on.
    pub fn find_fit(&self, size: usize) -> Option<usize> {
        (class_of(size)..CLASS_COUNT)
            .flat_map(|class| self.free_list(class))
            .find(|&bp| {
                let tag = self.header_tag(bp);
                !tag.allocated() && tag.size() >= size
            })
    }

    /// Iterate over the nodes of one class list.
    pub fn free_list(&self, class: usize) -> FreeListIter<'_, G> {
        let s = sentinel(class);
        FreeListIter {
            heap: self,
            sentinel: s,
            next: self.succ(s),
        }
    }
}

/// Iterator over the blocks in a class list, front to back.
///
/// Iteration stops early if it reaches a node outside the heap, after
/// yielding that node.
pub struct FreeListIter<'heap, G> {
    heap: &'heap Heap<G>,
    sentinel: usize,
    next: usize,
}

impl<'heap, G: HeapGrower> Iterator for FreeListIter<'heap, G> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next;
        if node == self.sentinel {
            return None;
        }

        self.next = if self.heap.contains(node + WSIZE) {
            self.heap.succ(node)
        } else {
            self.sentinel
        };

        Some(node)
    }
}
