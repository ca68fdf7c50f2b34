//! Allocator types.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded heap manager: it owns one [`Heap`],
//! carves it into blocks, and tracks freed blocks in segregated free lists.
//! It is not thread-safe; every call must be serialized by the caller.
//!
//! ### [`LockedAlloc`](struct.LockedAlloc.html)
//!
//! A `LockedAlloc` wraps a lazily initialized `RawAlloc` with a spin lock,
//! giving one controlled access point for an allocator shared between
//! threads, or kept in a `static`.
//!
//! ## Heap layout
//!
//! ```text
//!   | pad | prologue hdr | 18 list sentinels | prologue ftr | blocks ... | epilogue hdr |
//!   0     4              8                   152            160
//! ```
//!
//! The prologue and epilogue are always marked allocated, so neither end of
//! the block chain ever needs a special case when coalescing. The epilogue
//! has size 0, which marks the end of the chain.

use core::fmt;

use spin::Mutex;
use static_assertions::const_assert;

use crate::block::{footer, header, next, Block, Tag, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, WSIZE};
use crate::freelist::{CLASS_COUNT, SENTINEL_BASE, SENTINEL_SIZE};
use crate::heap::{Heap, HeapGrower};

/// Payload offset of the prologue block; its payload is the sentinel table.
pub(crate) const PROLOGUE: usize = SENTINEL_BASE;
/// Size of the prologue block: the sentinel table plus header and footer.
pub(crate) const PROLOGUE_SIZE: usize = CLASS_COUNT * SENTINEL_SIZE + DSIZE;
/// Payload offset of the first regular block.
pub(crate) const FIRST_BLOCK: usize = PROLOGUE + PROLOGUE_SIZE;
/// Bytes taken by the fixed layout: padding, prologue, and epilogue header.
pub const OVERHEAD: usize = FIRST_BLOCK;

/// Offsets and links are stored in 32-bit words, so the heap may not grow
/// past this.
pub const MAX_HEAP_SIZE: usize = MAX_BLOCK_SIZE;

/// The largest chunk size a [`Config`] may ask for: everything the heap can
/// hold past the fixed layout.
pub const MAX_CHUNK_SIZE: usize = MAX_HEAP_SIZE - OVERHEAD;

/// Default amount to grow the heap by when no free block fits.
pub const CHUNK_SIZE: usize = 1 << 9;

const_assert!(FIRST_BLOCK % DSIZE == 0);
const_assert!(SENTINEL_BASE + CLASS_COUNT * SENTINEL_SIZE == footer(PROLOGUE, PROLOGUE_SIZE));
const_assert!(CHUNK_SIZE % DSIZE == 0);
const_assert!(MAX_CHUNK_SIZE % DSIZE == 0);

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// A handle to an allocated block: the offset of its payload in the heap.
///
/// Payload offsets are always aligned to 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    fn new(bp: usize) -> Handle {
        debug_assert!(bp <= u32::MAX as usize);
        Handle(bp as u32)
    }

    pub fn offset(self) -> usize {
        self.0 as usize
    }
}

/// Tunables for a [`RawAlloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Minimum number of bytes to grow the heap by at a time. Rounded up to
    /// the alignment unit.
    pub chunk_size: usize,
    /// If set, `check_heap` panics on the first problem it finds instead of
    /// only reporting it.
    pub strict: bool,
}

impl Config {
    pub const DEFAULT: Config = Config {
        chunk_size: CHUNK_SIZE,
        strict: false,
    };
}

impl Default for Config {
    fn default() -> Self {
        Config::DEFAULT
    }
}

/// Initialization failed.
#[derive(Debug)]
pub enum InitError<E> {
    /// The heap could not be grown to hold the initial layout.
    Grow(E),
    /// The heap already had memory in it.
    NotEmpty { size: usize },
    /// The configured chunk size could never fit in the heap.
    ChunkSize { chunk_size: usize },
}

impl<E: fmt::Display> fmt::Display for InitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Grow(e) => write!(f, "could not set up the heap: {}", e),
            InitError::NotEmpty { size } => {
                write!(f, "heap must start empty, but holds {} bytes", size)
            }
            InitError::ChunkSize { chunk_size } => write!(
                f,
                "chunk size {} exceeds the {} bytes a heap can grow by",
                chunk_size,
                MAX_CHUNK_SIZE
            ),
        }
    }
}

/// A raw allocator, capable of growing the heap, handing out blocks, and
/// tracking and reusing freed blocks.
///
/// Freed blocks are coalesced with free neighbours immediately, so no two
/// free blocks are ever adjacent. Memory is never returned to the grower.
///
/// Misuse (freeing a handle twice, or one this allocator did not return) is
/// not detected on the call itself and corrupts the heap;
/// [`check_heap`](#method.check_heap) will report the damage.
pub struct RawAlloc<G> {
    pub(crate) heap: Heap<G>,
    pub(crate) config: Config,
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Create a new `RawAlloc` with the default config, laying out the heap
    /// in `grower` and growing it by one chunk.
    pub fn init(grower: G) -> Result<Self, InitError<G::Err>> {
        Self::with_config(grower, Config::DEFAULT)
    }

    /// Create a new `RawAlloc` with the given config.
    ///
    /// Fails with [`InitError::ChunkSize`] if `config.chunk_size` is larger
    /// than [`MAX_CHUNK_SIZE`].
    pub fn with_config(grower: G, config: Config) -> Result<Self, InitError<G::Err>> {
        if config.chunk_size > MAX_CHUNK_SIZE {
            return Err(InitError::ChunkSize {
                chunk_size: config.chunk_size,
            });
        }
        let config = Config {
            chunk_size: round_up(config.chunk_size.max(MIN_BLOCK_SIZE), DSIZE),
            ..config
        };

        let mut heap = Heap::new(grower);
        if heap.size() != 0 {
            return Err(InitError::NotEmpty { size: heap.size() });
        }
        heap.sbrk(OVERHEAD).map_err(InitError::Grow)?;

        // Alignment padding
        heap.put(0, 0);
        let prologue = Tag::pack(PROLOGUE_SIZE, true, true);
        heap.set_tag(header(PROLOGUE), prologue);
        heap.set_tag(footer(PROLOGUE, PROLOGUE_SIZE), prologue);
        heap.init_free_lists();
        heap.set_tag(header(FIRST_BLOCK), Tag::pack(0, true, true));

        let mut alloc = RawAlloc { heap, config };
        alloc
            .extend_heap(config.chunk_size)
            .map_err(InitError::Grow)?;
        log::debug!("Initialized heap: {} bytes", alloc.heap.size());
        Ok(alloc)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn heap(&self) -> &Heap<G> {
        &self.heap
    }

    /// Current size of the heap in bytes.
    pub fn heap_size(&self) -> usize {
        self.heap.size()
    }

    /// Iterate over every block between the prologue and epilogue, in
    /// address order.
    pub fn blocks(&self) -> crate::block::Blocks<'_, G> {
        self.heap.blocks(FIRST_BLOCK)
    }

    /// The block size needed to satisfy a request for `size` bytes: room for
    /// a header, rounded to the alignment unit, and no smaller than the
    /// minimum block. `None` if that cannot be represented.
    pub fn block_size(size: usize) -> Option<usize> {
        let needed = size.checked_add(WSIZE + DSIZE - 1)? / DSIZE * DSIZE;
        let needed = needed.max(MIN_BLOCK_SIZE);
        if needed > MAX_BLOCK_SIZE {
            return None;
        }
        Some(needed)
    }

    /// Grow the heap by `size` bytes (rounded up to the alignment unit) and
    /// return the resulting free block, already coalesced and inserted into
    /// the free lists.
    fn extend_heap(&mut self, size: usize) -> Result<usize, G::Err> {
        let size = round_up(size, DSIZE);
        // The new block starts where the old break was; its header replaces
        // the old epilogue.
        let bp = self.heap.sbrk(size)?;
        let prev_allocated = self.heap.header_tag(bp).prev_allocated();
        log::debug!("Extending heap by {} bytes at {}", size, bp);

        self.heap
            .set_tag(header(bp), Tag::pack(size, prev_allocated, false));
        self.heap
            .set_tag(footer(bp, size), Tag::pack(size, false, false));
        self.heap
            .set_tag(header(next(bp, size)), Tag::pack(0, false, true));

        Ok(self.coalesce(bp))
    }

    /// Merge the newly freed block at `bp` with any free neighbours, insert
    /// the result into the free lists, and return it.
    ///
    /// The header and footer of `bp` must already mark it free.
    fn coalesce(&mut self, bp: usize) -> usize {
        let tag = self.heap.header_tag(bp);
        let prev_allocated = tag.prev_allocated();
        let next_bp = next(bp, tag.size());
        let next_tag = self.heap.header_tag(next_bp);
        let mut size = tag.size();

        let bp = match (prev_allocated, next_tag.allocated()) {
            (true, true) => {
                log::trace!("Coalesce {}: no free neighbours", bp);
                bp
            }
            (false, true) => {
                let prev_bp = self.heap.prev_block(bp);
                let prev_tag = self.heap.header_tag(prev_bp);
                log::trace!("Coalesce {}: merging into previous block {}", bp, prev_bp);
                self.heap.remove_free(prev_bp);
                size += prev_tag.size();
                self.heap.set_tag(
                    header(prev_bp),
                    Tag::pack(size, prev_tag.prev_allocated(), false),
                );
                prev_bp
            }
            (true, false) => {
                log::trace!("Coalesce {}: absorbing next block {}", bp, next_bp);
                self.heap.remove_free(next_bp);
                size += next_tag.size();
                self.heap
                    .set_tag(header(bp), Tag::pack(size, prev_allocated, false));
                bp
            }
            (false, false) => {
                let prev_bp = self.heap.prev_block(bp);
                let prev_tag = self.heap.header_tag(prev_bp);
                log::trace!(
                    "Coalesce {}: merging with previous {} and next {}",
                    bp,
                    prev_bp,
                    next_bp
                );
                self.heap.remove_free(prev_bp);
                self.heap.remove_free(next_bp);
                size += prev_tag.size() + next_tag.size();
                self.heap.set_tag(
                    header(prev_bp),
                    Tag::pack(size, prev_tag.prev_allocated(), false),
                );
                prev_bp
            }
        };

        self.heap
            .set_tag(footer(bp, size), Tag::pack(size, false, false));
        // Whatever follows the merged block now follows a free block.
        self.heap.set_prev_allocated(next(bp, size), false);
        self.heap.insert_free(bp, size);
        bp
    }

    /// Allocate `asize` bytes from the front of the free block at `bp`,
    /// splitting off the remainder if it can stand as a block of its own.
    fn place(&mut self, bp: usize, asize: usize) {
        let tag = self.heap.header_tag(bp);
        let csize = tag.size();
        debug_assert!(!tag.allocated() && csize >= asize);

        self.heap.remove_free(bp);

        if csize - asize >= MIN_BLOCK_SIZE {
            log::trace!("Placing {} bytes at {}, splitting off {}", asize, bp, csize - asize);
            self.heap
                .set_tag(header(bp), Tag::pack(asize, tag.prev_allocated(), true));

            let rest = next(bp, asize);
            let rest_size = csize - asize;
            self.heap
                .set_tag(header(rest), Tag::pack(rest_size, true, false));
            self.heap
                .set_tag(footer(rest, rest_size), Tag::pack(rest_size, false, false));
            self.heap.insert_free(rest, rest_size);
        } else {
            log::trace!("Placing {} bytes at {}, using all {}", asize, bp, csize);
            self.heap
                .set_tag(header(bp), Tag::pack(csize, tag.prev_allocated(), true));
            self.heap.set_prev_allocated(next(bp, csize), true);
        }
    }

    ////////////////////////////////////////////////////////////
    // Public allocation interface

    /// Allocate a block with room for at least `size` bytes.
    ///
    /// Returns `None` if `size` is 0, or if the heap cannot grow enough to
    /// satisfy the request. A failed allocation leaves the heap unchanged.
    pub fn alloc(&mut self, size: usize) -> Option<Handle> {
        if size == 0 {
            return None;
        }
        let asize = match Self::block_size(size) {
            Some(asize) => asize,
            None => {
                log::warn!("Allocation of {} bytes is too large", size);
                return None;
            }
        };

        if let Some(bp) = self.heap.find_fit(asize) {
            self.place(bp, asize);
            return Some(Handle::new(bp));
        }

        let extend = asize.max(self.config.chunk_size);
        if self
            .heap
            .size()
            .checked_add(extend)
            .map_or(true, |end| end > MAX_HEAP_SIZE)
        {
            log::warn!("Heap would outgrow {} bytes", MAX_HEAP_SIZE);
            return None;
        }
        let bp = match self.extend_heap(extend) {
            Ok(bp) => bp,
            Err(_) => {
                log::warn!(
                    "Could not grow a heap of {} bytes to allocate {} bytes",
                    self.heap.size(),
                    asize
                );
                return None;
            }
        };
        self.place(bp, asize);
        Some(Handle::new(bp))
    }

    /// Free a block. Freeing `None` does nothing.
    ///
    /// The handle must have come from this allocator and not been freed
    /// since.
    pub fn free(&mut self, handle: impl Into<Option<Handle>>) {
        let bp = match handle.into() {
            None => return,
            Some(h) => h.offset(),
        };

        let tag = self.heap.header_tag(bp);
        let size = tag.size();
        log::trace!("Freeing {} bytes at {}", size, bp);

        self.heap
            .set_tag(header(bp), Tag::pack(size, tag.prev_allocated(), false));
        self.heap
            .set_tag(footer(bp, size), Tag::pack(size, false, false));
        self.coalesce(bp);
    }

    /// Resize a block, moving its contents to a new block.
    ///
    /// * A size of 0 frees the block and returns `None`.
    /// * A `None` handle is the same as [`alloc`](#method.alloc).
    /// * Otherwise a new block is allocated, the first `min(old, new)` bytes
    ///   of payload are copied over, and the old block is freed. If the new
    ///   allocation fails, `None` is returned and the old block is left as it
    ///   was.
    pub fn realloc(&mut self, handle: impl Into<Option<Handle>>, size: usize) -> Option<Handle> {
        let old = handle.into();
        if size == 0 {
            self.free(old);
            return None;
        }
        let old = match old {
            None => return self.alloc(size),
            Some(h) => h,
        };

        let new = self.alloc(size)?;
        let len = self.payload_size(old).min(size);
        let src = old.offset();
        self.heap
            .bytes_mut()
            .copy_within(src..src + len, new.offset());
        self.free(old);
        Some(new)
    }

    /// Allocate room for `count` elements of `elem_size` bytes each, with the
    /// whole payload zeroed.
    ///
    /// Returns `None` if `count * elem_size` overflows.
    pub fn calloc(&mut self, count: usize, elem_size: usize) -> Option<Handle> {
        let bytes = match count.checked_mul(elem_size) {
            Some(bytes) => bytes,
            None => {
                log::warn!("calloc({}, {}) overflows", count, elem_size);
                return None;
            }
        };

        let handle = self.alloc(bytes)?;
        self.payload_mut(handle).fill(0);
        Some(handle)
    }

    /// Number of usable payload bytes in an allocated block. At least as many
    /// as were requested.
    pub fn payload_size(&self, handle: Handle) -> usize {
        self.heap.header_tag(handle.offset()).size() - WSIZE
    }

    pub fn payload(&self, handle: Handle) -> &[u8] {
        let bp = handle.offset();
        let len = self.payload_size(handle);
        &self.heap.bytes()[bp..bp + len]
    }

    pub fn payload_mut(&mut self, handle: Handle) -> &mut [u8] {
        let bp = handle.offset();
        let len = self.payload_size(handle);
        &mut self.heap.bytes_mut()[bp..bp + len]
    }
}

impl<G: HeapGrower> fmt::Display for RawAlloc<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawAlloc(")?;
        let mut start = true;
        for (bp, block) in self.blocks() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            match block {
                Block::Free { size, .. } => write!(f, "Free({}, {})", bp, size)?,
                Block::Allocated { size, .. } => write!(f, "Allocated({}, {})", bp, size)?,
            }
        }

        write!(f, ")")
    }
}

/// A shared allocator: a spin lock around a `RawAlloc` that is initialized on
/// first use.
///
/// `RawAlloc` itself assumes its caller serializes every call; this type is
/// that serialization, for callers that need one allocator reachable from
/// several places (such as a `static`).
pub struct LockedAlloc<G> {
    config: Config,
    raw: Mutex<Option<RawAlloc<G>>>,
}

impl<G> LockedAlloc<G> {
    pub const fn new() -> Self {
        Self::with_config(Config::DEFAULT)
    }

    pub const fn with_config(config: Config) -> Self {
        LockedAlloc {
            config,
            raw: Mutex::new(None),
        }
    }
}

impl<G: HeapGrower + Default> Default for LockedAlloc<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: HeapGrower + Default> LockedAlloc<G> {
    /// Run `f` with exclusive access to the underlying `RawAlloc`,
    /// initializing it first if this is the first use.
    ///
    /// If initialization fails, it will be attempted again on the next call.
    pub fn with<R, F>(&self, f: F) -> Result<R, InitError<G::Err>>
    where
        F: FnOnce(&mut RawAlloc<G>) -> R,
    {
        let mut guard = self.raw.lock();
        let raw = match guard.as_mut() {
            Some(raw) => raw,
            None => guard.insert(RawAlloc::with_config(G::default(), self.config)?),
        };
        Ok(f(raw))
    }

    /// Allocate through the shared allocator. Initialization failure is
    /// reported as an allocation failure.
    pub fn alloc(&self, size: usize) -> Option<Handle> {
        self.with(|raw| raw.alloc(size)).ok().flatten()
    }

    pub fn free(&self, handle: impl Into<Option<Handle>>) {
        let handle = handle.into();
        if handle.is_none() {
            return;
        }
        if let Err(e) = self.with(|raw| raw.free(handle)) {
            log::warn!("Could not free {:?}: {:?}", handle, e);
        }
    }

    pub fn check_heap(&self, verbose: bool) -> Result<crate::check::Validity, InitError<G::Err>> {
        self.with(|raw| raw.check_heap(verbose))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::vec::Vec;

    use crate::freelist::class_of;
    use crate::heap::{ToyHeap, VecHeap};
    use test_log::test;

    fn assert_valid<G: HeapGrower>(allocator: &RawAlloc<G>) {
        let validity = allocator.check_heap(true);
        assert!(validity.is_valid(), "{}\n{}", validity, allocator);
    }

    fn free_blocks<G: HeapGrower>(allocator: &RawAlloc<G>) -> Vec<(usize, usize)> {
        allocator
            .blocks()
            .filter(|(_, b)| b.is_free())
            .map(|(bp, b)| (bp, b.size()))
            .collect()
    }

    #[test]
    fn test_init() {
        let allocator = RawAlloc::init(ToyHeap::default()).unwrap();
        assert_eq!(allocator.heap_size(), OVERHEAD + CHUNK_SIZE);
        assert_valid(&allocator);

        // One free block spanning the whole first chunk
        let blocks: Vec<_> = allocator.blocks().collect();
        assert_eq!(
            blocks,
            [(
                FIRST_BLOCK,
                Block::Free {
                    size: CHUNK_SIZE,
                    prev_allocated: true,
                    succ: crate::freelist::sentinel(class_of(CHUNK_SIZE)),
                    pred: crate::freelist::sentinel(class_of(CHUNK_SIZE)),
                }
            )]
        );
    }

    #[test]
    fn test_init_failure() {
        match RawAlloc::init(VecHeap::new(OVERHEAD + CHUNK_SIZE - 8)) {
            Err(InitError::Grow(e)) => assert_eq!(e.requested, CHUNK_SIZE),
            Err(e) => panic!("unexpected error {:?}", e),
            Ok(_) => panic!("heap should not fit"),
        }

        let mut used = VecHeap::default();
        used.grow_heap(8).unwrap();
        assert!(matches!(
            RawAlloc::init(used),
            Err(InitError::NotEmpty { size: 8 })
        ));
    }

    #[test]
    fn test_block_size() {
        assert_eq!(RawAlloc::<ToyHeap>::block_size(1), Some(16));
        assert_eq!(RawAlloc::<ToyHeap>::block_size(12), Some(16));
        assert_eq!(RawAlloc::<ToyHeap>::block_size(13), Some(24));
        assert_eq!(RawAlloc::<ToyHeap>::block_size(16), Some(24));
        assert_eq!(RawAlloc::<ToyHeap>::block_size(32), Some(40));
        assert_eq!(RawAlloc::<ToyHeap>::block_size(usize::MAX), None);
        assert_eq!(RawAlloc::<ToyHeap>::block_size(MAX_BLOCK_SIZE), None);
    }

    #[test]
    fn test_zero_and_null() {
        let mut allocator = RawAlloc::init(ToyHeap::default()).unwrap();
        assert_eq!(allocator.alloc(0), None);
        allocator.free(None);
        assert_eq!(allocator.heap_size(), OVERHEAD + CHUNK_SIZE);
        assert_valid(&allocator);
    }

    #[test]
    fn test_basic() {
        let mut allocator = RawAlloc::init(ToyHeap::default()).unwrap();

        let a = allocator.alloc(16).unwrap();
        assert_valid(&allocator);
        let b = allocator.alloc(32).unwrap();
        assert_valid(&allocator);
        let c = allocator.alloc(16).unwrap();
        assert_valid(&allocator);
        log::info!("post-alloc: {}", allocator);

        // Blocks are carved from the front of the chunk, back to back
        assert_eq!(a.offset(), FIRST_BLOCK);
        assert_eq!(b.offset(), a.offset() + 24);
        assert_eq!(c.offset(), b.offset() + 40);
        assert_eq!(allocator.payload_size(a), 20);
        assert_eq!(allocator.payload_size(b), 36);
        for h in [a, b, c].iter() {
            assert_eq!(h.offset() % DSIZE, 0);
        }

        allocator.free(b);
        assert_valid(&allocator);
        log::info!("post-free: {}", allocator);

        // B's block is the first fit for 24 bytes; the heap doesn't grow
        let size = allocator.heap_size();
        let d = allocator.alloc(24).unwrap();
        assert_valid(&allocator);
        assert_eq!(d, b);
        assert_eq!(allocator.heap_size(), size);
    }

    #[test]
    fn test_split() {
        let mut allocator = RawAlloc::init(ToyHeap::default()).unwrap();
        let before = free_blocks(&allocator);
        assert_eq!(before, [(FIRST_BLOCK, CHUNK_SIZE)]);

        let h = allocator.alloc(100).unwrap();
        assert_valid(&allocator);
        let asize = RawAlloc::<ToyHeap>::block_size(100).unwrap();

        let blocks: Vec<_> = allocator.blocks().map(|(bp, b)| (bp, b.size())).collect();
        assert_eq!(
            blocks,
            [(FIRST_BLOCK, asize), (FIRST_BLOCK + asize, CHUNK_SIZE - asize)]
        );
        assert_eq!(h.offset(), FIRST_BLOCK);
    }

    #[test]
    fn test_no_split_of_small_remainder() {
        let mut allocator = RawAlloc::init(ToyHeap::default()).unwrap();
        // Leave an 8 byte remainder: too small to be a block
        let h = allocator.alloc(CHUNK_SIZE - 8 - WSIZE).unwrap();
        assert_valid(&allocator);
        assert_eq!(allocator.payload_size(h), CHUNK_SIZE - WSIZE);
        assert!(free_blocks(&allocator).is_empty());
        assert_eq!(allocator.heap_size(), OVERHEAD + CHUNK_SIZE);
    }

    #[test]
    fn test_coalesce_both_sides() {
        let mut allocator = RawAlloc::init(ToyHeap::default()).unwrap();
        let a = allocator.alloc(40).unwrap();
        let b = allocator.alloc(60).unwrap();
        let c = allocator.alloc(80).unwrap();
        // Keep the rest of the chunk from merging with C
        let guard = allocator.alloc(8).unwrap();
        let (sa, sb, sc) = (
            allocator.payload_size(a) + WSIZE,
            allocator.payload_size(b) + WSIZE,
            allocator.payload_size(c) + WSIZE,
        );

        allocator.free(a);
        assert_valid(&allocator);
        allocator.free(c);
        assert_valid(&allocator);
        assert_eq!(free_blocks(&allocator).len(), 3);

        allocator.free(b);
        assert_valid(&allocator);
        let free = free_blocks(&allocator);
        assert_eq!(free.len(), 2);
        assert_eq!(free[0], (a.offset(), sa + sb + sc));

        // The merged block is reused whole, without growing the heap
        let size = allocator.heap_size();
        let big = allocator.alloc(sa + sb + sc - WSIZE).unwrap();
        assert_valid(&allocator);
        assert_eq!(big, a);
        assert_eq!(allocator.heap_size(), size);
        allocator.free(guard);
        assert_valid(&allocator);
    }

    #[test]
    fn test_coalesce_each_side() {
        let mut allocator = RawAlloc::init(ToyHeap::default()).unwrap();
        let a = allocator.alloc(24).unwrap();
        let b = allocator.alloc(24).unwrap();
        let c = allocator.alloc(24).unwrap();
        let d = allocator.alloc(24).unwrap();
        let _guard = allocator.alloc(24).unwrap();

        // Next only
        allocator.free(b);
        allocator.free(a);
        assert_valid(&allocator);
        assert_eq!(free_blocks(&allocator)[0], (a.offset(), 64));

        // Previous only
        allocator.free(c);
        assert_valid(&allocator);
        assert_eq!(free_blocks(&allocator)[0], (a.offset(), 96));
        assert_eq!(allocator.payload_size(d), 28);
    }

    #[test]
    fn test_extend_coalesces_with_trailing_free_block() {
        let mut allocator = RawAlloc::init(ToyHeap::default()).unwrap();
        let a = allocator.alloc(100).unwrap();
        let trailing = free_blocks(&allocator);
        assert_eq!(trailing.len(), 1);

        // Doesn't fit in what's left; the heap grows and the new space merges
        // with the trailing free block
        let big = allocator.alloc(CHUNK_SIZE * 2).unwrap();
        assert_valid(&allocator);
        assert_eq!(big.offset(), trailing[0].0);
        assert_eq!(allocator.payload(a).len(), allocator.payload_size(a));
    }

    #[test]
    fn test_payload_integrity() {
        let mut allocator = RawAlloc::init(ToyHeap::default()).unwrap();
        let handles: Vec<Handle> = (1..=10).map(|i| allocator.alloc(i * 13).unwrap()).collect();
        for (i, &h) in handles.iter().enumerate() {
            allocator.payload_mut(h).fill(i as u8 + 1);
        }

        let keep = handles[4];
        for (i, &h) in handles.iter().enumerate() {
            if i != 4 {
                allocator.free(h);
                assert_valid(&allocator);
            }
        }
        let _ = allocator.alloc(300).unwrap();
        assert!(allocator.payload(keep).iter().all(|&b| b == 5));
        assert_valid(&allocator);
    }

    #[test]
    fn test_realloc() {
        let mut allocator = RawAlloc::init(ToyHeap::default()).unwrap();

        // realloc(None, n) allocates
        let h = allocator.realloc(None, 40).unwrap();
        let old_len = allocator.payload_size(h);
        assert!(old_len >= 40);
        for (i, b) in allocator.payload_mut(h).iter_mut().enumerate() {
            *b = i as u8;
        }

        // Growing keeps every byte
        let grown = allocator.realloc(h, 200).unwrap();
        assert_valid(&allocator);
        assert_ne!(grown, h);
        let expected: Vec<u8> = (0..old_len as u8).collect();
        assert_eq!(&allocator.payload(grown)[..expected.len()], &expected[..]);

        // Shrinking keeps the prefix
        let shrunk = allocator.realloc(grown, 10).unwrap();
        assert_valid(&allocator);
        let expected: Vec<u8> = (0..10).collect();
        assert_eq!(&allocator.payload(shrunk)[..10], &expected[..]);

        // realloc(h, 0) frees, and the space is reused like a free
        assert_eq!(allocator.realloc(shrunk, 0), None);
        assert_valid(&allocator);
        let again = allocator.alloc(10).unwrap();
        assert_eq!(again, shrunk);
    }

    #[test]
    fn test_realloc_failure_keeps_block() {
        let mut allocator = RawAlloc::init(VecHeap::new(4096)).unwrap();
        let h = allocator.alloc(64).unwrap();
        allocator.payload_mut(h).fill(0xab);

        assert_eq!(allocator.realloc(h, 8192), None);
        assert_valid(&allocator);
        assert!(allocator.payload(h).iter().all(|&b| b == 0xab));
    }

    #[test]
    fn test_calloc() {
        let mut allocator = RawAlloc::init(ToyHeap::default()).unwrap();
        let dirty = allocator.alloc(64).unwrap();
        allocator.payload_mut(dirty).fill(0xff);
        allocator.free(dirty);

        let h = allocator.calloc(8, 8).unwrap();
        assert_eq!(h, dirty);
        assert!(allocator.payload(h).iter().all(|&b| b == 0));
        assert_valid(&allocator);

        assert_eq!(allocator.calloc(usize::MAX, 2), None);
        assert_eq!(allocator.calloc(0, 8), None);
        assert_valid(&allocator);
    }

    #[test]
    fn test_exhaustion() {
        let mut allocator = RawAlloc::init(VecHeap::new(4096)).unwrap();
        let size = allocator.heap_size();

        assert_eq!(allocator.alloc(8192), None);
        assert_eq!(allocator.heap_size(), size);
        assert_valid(&allocator);

        // Smaller requests still succeed, until the heap is full
        let mut handles = Vec::new();
        while let Some(h) = allocator.alloc(100) {
            handles.push(h);
        }
        assert!(handles.len() > 20);
        assert_valid(&allocator);
        for h in handles {
            allocator.free(h);
        }
        assert_valid(&allocator);
        assert_eq!(free_blocks(&allocator).len(), 1);
    }

    #[test]
    fn test_chunk_size_config() {
        let config = Config {
            chunk_size: 1001,
            ..Config::default()
        };
        let mut allocator = RawAlloc::with_config(VecHeap::default(), config).unwrap();
        assert_eq!(allocator.config().chunk_size, 1008);
        assert_eq!(allocator.heap_size(), OVERHEAD + 1008);

        allocator.alloc(1000).unwrap();
        allocator.alloc(8).unwrap();
        assert_eq!(allocator.heap_size(), OVERHEAD + 2 * 1008);
        assert_valid(&allocator);
    }

    #[test]
    fn test_chunk_size_limit() {
        for chunk_size in [usize::MAX, MAX_CHUNK_SIZE + DSIZE] {
            let config = Config {
                chunk_size,
                ..Config::default()
            };
            match RawAlloc::with_config(VecHeap::default(), config) {
                Err(InitError::ChunkSize { chunk_size: c }) => assert_eq!(c, chunk_size),
                Err(e) => panic!("unexpected error {:?}", e),
                Ok(_) => panic!("chunk size {} should be rejected", chunk_size),
            }
        }

        // The largest chunk is accepted, but this store cannot supply it
        let config = Config {
            chunk_size: MAX_CHUNK_SIZE,
            ..Config::default()
        };
        match RawAlloc::with_config(VecHeap::new(4096), config) {
            Err(InitError::Grow(e)) => assert_eq!(e.requested, MAX_CHUNK_SIZE),
            Err(e) => panic!("unexpected error {:?}", e),
            Ok(_) => panic!("heap should not fit"),
        }
    }

    #[test]
    fn test_locked_init_failure() {
        let allocator: LockedAlloc<VecHeap> = LockedAlloc::with_config(Config {
            chunk_size: usize::MAX,
            strict: false,
        });

        assert_eq!(allocator.alloc(16), None);
        assert!(matches!(
            allocator.check_heap(false),
            Err(InitError::ChunkSize { .. })
        ));
        // Nothing to free into; this is logged, not a panic
        allocator.free(Handle::new(FIRST_BLOCK));
        allocator.free(None);
        assert!(allocator.with(|raw| raw.heap_size()).is_err());
    }

    #[test]
    fn test_locked() {
        static ALLOCATOR: LockedAlloc<ToyHeap> = LockedAlloc::new();

        let a = ALLOCATOR.alloc(32).unwrap();
        let b = ALLOCATOR.alloc(32).unwrap();
        ALLOCATOR
            .with(|raw| raw.payload_mut(a).fill(7))
            .unwrap();
        ALLOCATOR.free(b);
        ALLOCATOR.free(None);

        assert!(ALLOCATOR.check_heap(false).unwrap().is_valid());
        let seven = ALLOCATOR
            .with(|raw| raw.payload(a).iter().all(|&x| x == 7))
            .unwrap();
        assert!(seven);
    }
}
