//! Boundary tags and block geometry.
//!
//! Every block starts with a one-word header holding its size and two flag
//! bits. Free blocks also carry a footer (a copy of the size and allocated
//! bit) in their last word, plus successor and predecessor links in their
//! first two payload words. Allocated blocks have no footer; instead, the
//! *next* block's header records whether its predecessor is allocated, so
//! walking backwards never needs to read a footer that isn't there.
//!
//! Blocks are named by their payload offset (`bp`), the offset just past
//! their header:
//!
//! ```text
//!   free block:
//!   | header | succ | pred | ...unused... | footer |
//!            ^ bp
//!   allocated block:
//!   | header | payload .............................|
//!            ^ bp
//! ```

use core::fmt;

use static_assertions::const_assert;

use crate::heap::{Heap, HeapGrower};

/// Size of a word: headers, footers and links are all one word.
pub const WSIZE: usize = 4;
/// Alignment unit. Block sizes and payload offsets are multiples of this.
pub const DSIZE: usize = 8;
/// The smallest block that can hold a header, both links, and a footer.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;
/// The largest size a tag can record.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX & SIZE_MASK) as usize;

const_assert!(MIN_BLOCK_SIZE >= 4 * WSIZE);
const_assert!(MIN_BLOCK_SIZE % DSIZE == 0);

const ALLOC_BIT: u32 = 0x1;
const PREV_ALLOC_BIT: u32 = 0x2;
const SIZE_MASK: u32 = !0x7;

/// One boundary tag: a block size with the allocated and
/// previous-allocated flags packed into its low bits.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tag(u32);

impl Tag {
    /// Pack a size and flags into a tag.
    ///
    /// `size` must be a multiple of `DSIZE` no larger than `MAX_BLOCK_SIZE`.
    pub fn pack(size: usize, prev_allocated: bool, allocated: bool) -> Tag {
        debug_assert!(size % DSIZE == 0, "unaligned block size {}", size);
        debug_assert!(size <= MAX_BLOCK_SIZE, "block size {} too large", size);
        let mut word = size as u32;
        if prev_allocated {
            word |= PREV_ALLOC_BIT;
        }
        if allocated {
            word |= ALLOC_BIT;
        }
        Tag(word)
    }

    pub fn from_word(word: u32) -> Tag {
        Tag(word)
    }

    pub fn word(self) -> u32 {
        self.0
    }

    pub fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    pub fn allocated(self) -> bool {
        self.0 & ALLOC_BIT != 0
    }

    pub fn prev_allocated(self) -> bool {
        self.0 & PREV_ALLOC_BIT != 0
    }

    #[must_use]
    pub fn with_prev_allocated(self, prev_allocated: bool) -> Tag {
        if prev_allocated {
            Tag(self.0 | PREV_ALLOC_BIT)
        } else {
            Tag(self.0 & !PREV_ALLOC_BIT)
        }
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tag(size={}, prev_alloc={}, alloc={})",
            self.size(),
            self.prev_allocated(),
            self.allocated()
        )
    }
}

/// Offset of the header of the block at `bp`.
pub const fn header(bp: usize) -> usize {
    bp - WSIZE
}

/// Offset of the footer of the block at `bp`. Only free blocks (and the
/// prologue) have one.
pub const fn footer(bp: usize, size: usize) -> usize {
    bp + size - DSIZE
}

/// The block after the one at `bp`, which is `size` bytes long.
pub const fn next(bp: usize, size: usize) -> usize {
    bp + size
}

/// The block before the one at `bp`, given the size recorded in the
/// previous block's footer.
pub const fn prev(bp: usize, prev_size: usize) -> usize {
    bp - prev_size
}

/// A block's metadata, decoded from its tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Free {
        size: usize,
        prev_allocated: bool,
        succ: usize,
        pred: usize,
    },
    Allocated {
        size: usize,
        prev_allocated: bool,
    },
}

impl Block {
    pub fn size(&self) -> usize {
        match *self {
            Block::Free { size, .. } | Block::Allocated { size, .. } => size,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Block::Free { .. })
    }

    pub fn prev_allocated(&self) -> bool {
        match *self {
            Block::Free { prev_allocated, .. } | Block::Allocated { prev_allocated, .. } => {
                prev_allocated
            }
        }
    }
}

impl<G: HeapGrower> Heap<G> {
    pub fn tag(&self, offset: usize) -> Tag {
        Tag::from_word(self.get(offset))
    }

    pub fn set_tag(&mut self, offset: usize, tag: Tag) {
        self.put(offset, tag.word())
    }

    /// The header tag of the block at `bp`.
    pub fn header_tag(&self, bp: usize) -> Tag {
        self.tag(header(bp))
    }

    /// The block following `bp` in memory.
    pub fn next_block(&self, bp: usize) -> usize {
        next(bp, self.header_tag(bp).size())
    }

    /// The block preceding `bp` in memory.
    ///
    /// Only meaningful when that block is free: an allocated block has no
    /// footer to read the size from.
    pub fn prev_block(&self, bp: usize) -> usize {
        debug_assert!(!self.header_tag(bp).prev_allocated());
        prev(bp, self.tag(bp - DSIZE).size())
    }

    /// Set or clear the previous-allocated bit in the header of `bp`.
    pub fn set_prev_allocated(&mut self, bp: usize, prev_allocated: bool) {
        let tag = self.header_tag(bp).with_prev_allocated(prev_allocated);
        self.set_tag(header(bp), tag);
    }

    /// Decode the block at `bp`.
    pub fn block(&self, bp: usize) -> Block {
        let tag = self.header_tag(bp);
        if tag.allocated() {
            Block::Allocated {
                size: tag.size(),
                prev_allocated: tag.prev_allocated(),
            }
        } else {
            Block::Free {
                size: tag.size(),
                prev_allocated: tag.prev_allocated(),
                succ: self.get(bp) as usize,
                pred: self.get(bp + WSIZE) as usize,
            }
        }
    }

    /// Iterate over the blocks from `first` up to (not including) the
    /// zero-size epilogue.
    pub fn blocks(&self, first: usize) -> Blocks<'_, G> {
        Blocks {
            heap: self,
            next: Some(first),
        }
    }
}

/// Iterator over blocks in address order, yielding `(bp, Block)`.
pub struct Blocks<'heap, G> {
    heap: &'heap Heap<G>,
    next: Option<usize>,
}

impl<'heap, G: HeapGrower> Iterator for Blocks<'heap, G> {
    type Item = (usize, Block);

    fn next(&mut self) -> Option<Self::Item> {
        let bp = self.next.take()?;
        let block = self.heap.block(bp);
        if block.size() == 0 {
            // Epilogue
            return None;
        }
        self.next = Some(next(bp, block.size()));
        Some((bp, block))
    }
}
