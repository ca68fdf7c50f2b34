//! Heap consistency checking.
//!
//! [`RawAlloc::check_heap`] walks the whole block chain and every free list,
//! and reports anything that breaks the allocator's invariants. It is meant
//! for tests and debugging; nothing on the allocation path calls it.

use alloc::vec::Vec;
use core::fmt;

use crate::allocators::{RawAlloc, FIRST_BLOCK, PROLOGUE, PROLOGUE_SIZE};
use crate::block::{footer, header, next, Tag, DSIZE, MIN_BLOCK_SIZE, WSIZE};
use crate::freelist::{class_of, sentinel, CLASS_COUNT};
use crate::heap::HeapGrower;

/// One problem found in the heap. Offsets are payload offsets unless noted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// The alignment padding word at offset 0 is not zero.
    Padding { found: u32 },
    /// The prologue header or footer is wrong.
    Prologue { header: Tag, footer: Tag },
    /// A block runs past the end of the heap.
    OutOfBounds { block: usize, size: usize, heap_end: usize },
    /// A block's payload offset is not aligned.
    Misaligned { block: usize },
    /// A block is smaller than the minimum block size.
    Undersized { block: usize, size: usize },
    /// A free block's header and footer disagree.
    TagMismatch { block: usize, header: Tag, footer: Tag },
    /// A block's previous-allocated bit doesn't match its predecessor.
    PrevAllocated { block: usize, recorded: bool, actual: bool },
    /// Two free blocks are adjacent: coalescing was missed.
    AdjacentFree { block: usize, previous: usize },
    /// The epilogue is missing, misplaced, or not marked allocated.
    Epilogue { block: usize, tag: Tag, heap_end: usize },
    /// A list node lies outside the heap.
    NodeOutOfBounds { class: usize, node: usize },
    /// A list node is an allocated block.
    NodeAllocated { class: usize, node: usize },
    /// A list node is in the wrong size class.
    WrongClass { class: usize, node: usize, size: usize, expected: usize },
    /// The successor of `node` does not point back at it.
    BrokenLink { class: usize, node: usize, succ: usize, back: usize },
    /// A list has more nodes than could possibly fit in the heap.
    Cycle { class: usize },
    /// The heap walk and the free lists disagree on how many blocks are free.
    FreeCount { in_heap: usize, in_lists: usize },
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Issue::Padding { found } => write!(f, "alignment padding is {:#x}, expected 0", found),
            Issue::Prologue { header, footer } => {
                write!(f, "bad prologue: header {:?}, footer {:?}", header, footer)
            }
            Issue::OutOfBounds {
                block,
                size,
                heap_end,
            } => write!(
                f,
                "block {} of size {} runs past the heap end {}",
                block, size, heap_end
            ),
            Issue::Misaligned { block } => write!(f, "block {} is not {}-aligned", block, DSIZE),
            Issue::Undersized { block, size } => write!(
                f,
                "block {} has size {}, below the minimum {}",
                block, size, MIN_BLOCK_SIZE
            ),
            Issue::TagMismatch {
                block,
                header,
                footer,
            } => write!(
                f,
                "block {}: header {:?} does not match footer {:?}",
                block, header, footer
            ),
            Issue::PrevAllocated {
                block,
                recorded,
                actual,
            } => write!(
                f,
                "block {}: prev_allocated is {}, but the previous block is {}",
                block,
                recorded,
                if actual { "allocated" } else { "free" }
            ),
            Issue::AdjacentFree { block, previous } => write!(
                f,
                "free block {} directly follows free block {}",
                block, previous
            ),
            Issue::Epilogue {
                block,
                tag,
                heap_end,
            } => write!(
                f,
                "bad epilogue at {}: {:?}, heap ends at {}",
                block, tag, heap_end
            ),
            Issue::NodeOutOfBounds { class, node } => {
                write!(f, "class {} list node {} is outside the heap", class, node)
            }
            Issue::NodeAllocated { class, node } => {
                write!(f, "class {} list node {} is allocated", class, node)
            }
            Issue::WrongClass {
                class,
                node,
                size,
                expected,
            } => write!(
                f,
                "block {} of size {} is in class {}, expected class {}",
                node, size, class, expected
            ),
            Issue::BrokenLink {
                class,
                node,
                succ,
                back,
            } => write!(
                f,
                "class {}: successor {} of node {} links back to {}",
                class, succ, node, back
            ),
            Issue::Cycle { class } => write!(f, "class {} list does not return to its sentinel", class),
            Issue::FreeCount { in_heap, in_lists } => write!(
                f,
                "{} free blocks in the heap, but {} in the free lists",
                in_heap, in_lists
            ),
        }
    }
}

/// Validity contains every invalid state found in a heap.
#[derive(Default, Debug)]
pub struct Validity {
    pub issues: Vec<Issue>,
    /// Free blocks found walking the heap.
    pub free_in_heap: usize,
    /// Free blocks found walking the free lists.
    pub free_in_lists: usize,
}

impl Validity {
    /// Returns a boolean - a simple check that nothing was found
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    fn report(&mut self, issue: Issue) {
        log::warn!("Heap check: {}", issue);
        self.issues.push(issue);
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            return write!(f, "heap is consistent");
        }
        write!(f, "{} heap issue(s):", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "\n  {}", issue)?;
        }
        Ok(())
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub heap_size: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Check the heap for consistency.
    ///
    /// With `verbose`, every block is logged at debug level as it is visited.
    /// If the allocator was configured as strict, any problem found panics.
    pub fn check_heap(&self, verbose: bool) -> Validity {
        let mut validity = Validity::default();
        self.check_layout(&mut validity);
        self.check_blocks(verbose, &mut validity);
        self.check_lists(&mut validity);

        if validity.free_in_heap != validity.free_in_lists {
            validity.report(Issue::FreeCount {
                in_heap: validity.free_in_heap,
                in_lists: validity.free_in_lists,
            });
        }

        if self.config.strict {
            if let Some(issue) = validity.issues.first() {
                panic!("Heap check failed: {}", issue);
            }
        }
        validity
    }

    fn check_layout(&self, validity: &mut Validity) {
        let padding = self.heap.get(0);
        if padding != 0 {
            validity.report(Issue::Padding { found: padding });
        }

        let prologue_header = self.heap.tag(header(PROLOGUE));
        let prologue_footer = self.heap.tag(footer(PROLOGUE, PROLOGUE_SIZE));
        if !prologue_header.allocated()
            || prologue_header.size() != PROLOGUE_SIZE
            || prologue_header != prologue_footer
        {
            validity.report(Issue::Prologue {
                header: prologue_header,
                footer: prologue_footer,
            });
        }
    }

    fn check_blocks(&self, verbose: bool, validity: &mut Validity) {
        let heap_end = self.heap.size();
        let mut prev_allocated = true;
        let mut prev_bp = PROLOGUE;
        let mut bp = FIRST_BLOCK;

        loop {
            if header(bp) + WSIZE > heap_end {
                validity.report(Issue::OutOfBounds {
                    block: bp,
                    size: 0,
                    heap_end,
                });
                return;
            }

            let tag = self.heap.header_tag(bp);
            let size = tag.size();
            if size == 0 {
                if !tag.allocated() || bp != heap_end {
                    validity.report(Issue::Epilogue {
                        block: bp,
                        tag,
                        heap_end,
                    });
                }
                if tag.prev_allocated() != prev_allocated {
                    validity.report(Issue::PrevAllocated {
                        block: bp,
                        recorded: tag.prev_allocated(),
                        actual: prev_allocated,
                    });
                }
                return;
            }

            if verbose {
                log::debug!("Block {}: {:?}", bp, tag);
            }

            if bp % DSIZE != 0 {
                validity.report(Issue::Misaligned { block: bp });
            }
            if next(bp, size) > heap_end {
                validity.report(Issue::OutOfBounds {
                    block: bp,
                    size,
                    heap_end,
                });
                return;
            }
            if size < MIN_BLOCK_SIZE {
                validity.report(Issue::Undersized { block: bp, size });
            }
            if tag.prev_allocated() != prev_allocated {
                validity.report(Issue::PrevAllocated {
                    block: bp,
                    recorded: tag.prev_allocated(),
                    actual: prev_allocated,
                });
            }

            if !tag.allocated() {
                validity.free_in_heap += 1;

                let footer_tag = self.heap.tag(footer(bp, size));
                if footer_tag.size() != size || footer_tag.allocated() {
                    validity.report(Issue::TagMismatch {
                        block: bp,
                        header: tag,
                        footer: footer_tag,
                    });
                }
                if !prev_allocated {
                    validity.report(Issue::AdjacentFree {
                        block: bp,
                        previous: prev_bp,
                    });
                }
            }

            prev_allocated = tag.allocated();
            prev_bp = bp;
            bp = next(bp, size);
        }
    }

    fn check_lists(&self, validity: &mut Validity) {
        let heap_end = self.heap.size();
        // No list can hold more nodes than there is room for blocks.
        let max_nodes = heap_end / MIN_BLOCK_SIZE;
        let in_bounds = |node: usize| node >= FIRST_BLOCK && node + MIN_BLOCK_SIZE <= heap_end;

        for class in 0..CLASS_COUNT {
            let s = sentinel(class);
            let mut count = 0;
            let mut node = self.heap.succ(s);

            while node != s {
                if !in_bounds(node) {
                    validity.report(Issue::NodeOutOfBounds { class, node });
                    break;
                }
                if count == max_nodes {
                    validity.report(Issue::Cycle { class });
                    break;
                }
                count += 1;

                let tag = self.heap.header_tag(node);
                if tag.allocated() {
                    validity.report(Issue::NodeAllocated { class, node });
                }
                let expected = class_of(tag.size());
                if expected != class {
                    validity.report(Issue::WrongClass {
                        class,
                        node,
                        size: tag.size(),
                        expected,
                    });
                }

                let succ = self.heap.succ(node);
                if succ == s || in_bounds(succ) {
                    let back = self.heap.pred(succ);
                    if back != node {
                        validity.report(Issue::BrokenLink {
                            class,
                            node,
                            succ,
                            back,
                        });
                    }
                }
                node = succ;
            }

            validity.free_in_lists += count;
        }
    }

    /// Count blocks and bytes, by allocation state.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            heap_size: self.heap.size(),
            ..Stats::default()
        };
        for (_, block) in self.blocks() {
            if block.is_free() {
                stats.free_blocks += 1;
                stats.free_bytes += block.size();
            } else {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += block.size();
            }
        }
        stats
    }
}
