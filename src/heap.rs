//! The heap manager: a single contiguous byte arena that only grows at the
//! high end.
//!
//! All positions in the heap are byte offsets from the start of the arena.
//! The arena start is offset 0 for the whole life of the heap, so a backing
//! store is free to move its bytes around (a `Vec` reallocating, say) without
//! invalidating anything the allocator has recorded.

use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

/// The backing store for a [`Heap`].
///
/// Implementations hand out memory strictly in order: every call to
/// `grow_heap` appends exactly `size` bytes directly after the previous
/// ones, and nothing is ever given back.
pub trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the heap by exactly `size` bytes, and return the range of offsets
    /// that were added.
    ///
    /// On error, the store must be left exactly as it was.
    fn grow_heap(&mut self, size: usize) -> Result<Range<usize>, Self::Err>;

    /// All bytes handed out so far, starting at offset 0.
    fn memory(&self) -> &[u8];

    /// All bytes handed out so far, mutably.
    fn memory_mut(&mut self) -> &mut [u8];
}

/// The store could not grow by the requested amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heap exhausted: requested {} bytes, {} available",
            self.requested, self.available
        )
    }
}

/// A heap in a fixed inline array. Mainly useful for testing, and for
/// `static` allocators that should not touch any other memory source.
pub struct ToyHeap {
    pub size: usize,
    pub heap: [u8; 64 * 1024],
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            size: 0,
            heap: [0; 64 * 1024],
        }
    }
}

impl HeapGrower for ToyHeap {
    type Err = OutOfMemory;

    fn grow_heap(&mut self, size: usize) -> Result<Range<usize>, Self::Err> {
        let available = self.heap.len() - self.size;
        if size > available {
            return Err(OutOfMemory {
                requested: size,
                available,
            });
        }

        let start = self.size;
        self.size += size;
        Ok(start..self.size)
    }

    fn memory(&self) -> &[u8] {
        &self.heap[..self.size]
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.heap[..self.size]
    }
}

/// Default upper bound for a [`VecHeap`]: 20 MiB.
pub const DEFAULT_MAX_HEAP: usize = 20 * (1 << 20);

/// A heap backed by a `Vec<u8>`, growing up to `max_size` bytes.
pub struct VecHeap {
    memory: Vec<u8>,
    max_size: usize,
}

impl VecHeap {
    pub fn new(max_size: usize) -> Self {
        VecHeap {
            memory: Vec::new(),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for VecHeap {
    fn default() -> Self {
        VecHeap::new(DEFAULT_MAX_HEAP)
    }
}

impl HeapGrower for VecHeap {
    type Err = OutOfMemory;

    fn grow_heap(&mut self, size: usize) -> Result<Range<usize>, Self::Err> {
        let start = self.memory.len();
        let available = self.max_size.saturating_sub(start);
        if size > available {
            return Err(OutOfMemory {
                requested: size,
                available,
            });
        }

        self.memory.resize(start + size, 0);
        Ok(start..self.memory.len())
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}

#[cfg(feature = "use_libc")]
pub use self::mmap::{LibcHeapGrower, MmapError};

#[cfg(feature = "use_libc")]
mod mmap {
    use core::fmt;
    use core::ops::Range;
    use core::ptr::{null_mut, NonNull};

    use errno::Errno;

    use super::{HeapGrower, OutOfMemory, DEFAULT_MAX_HEAP};

    // Round up value to the nearest multiple of increment
    fn round_up(value: usize, increment: usize) -> usize {
        if value == 0 {
            return 0;
        }
        increment * ((value - 1) / increment + 1)
    }

    #[derive(Debug)]
    pub enum MmapError {
        /// mmap itself failed.
        Errno(Errno),
        /// The reserved region is used up.
        Exhausted(OutOfMemory),
    }

    impl fmt::Display for MmapError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                MmapError::Errno(e) => write!(f, "mmap failed: {}", e),
                MmapError::Exhausted(e) => fmt::Display::fmt(e, f),
            }
        }
    }

    /// A heap living in one private anonymous mapping.
    ///
    /// The whole region is reserved on the first growth and the break is
    /// then bumped inside it, so the heap never moves.
    pub struct LibcHeapGrower {
        base: Option<NonNull<u8>>,
        reserved: usize,
        brk: usize,
    }

    // The mapping is owned exclusively by this value.
    unsafe impl Send for LibcHeapGrower {}

    impl LibcHeapGrower {
        pub fn new(max_size: usize) -> Self {
            LibcHeapGrower {
                base: None,
                reserved: max_size,
                brk: 0,
            }
        }

        fn reserve(&mut self) -> Result<NonNull<u8>, MmapError> {
            if let Some(base) = self.base {
                return Ok(base);
            }

            let pagesize = sysconf::page::pagesize();
            let to_reserve = round_up(self.reserved, pagesize);

            let ptr = unsafe {
                libc::mmap(
                    // Address we want the memory at. We don't care, so null it is.
                    null_mut(),
                    to_reserve,
                    libc::PROT_WRITE | libc::PROT_READ,
                    // Private anonymous memory; pages are only backed once touched.
                    libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(MmapError::Errno(errno::errno()));
            }

            let base = NonNull::new(ptr as *mut u8).ok_or(MmapError::Errno(Errno(libc::ENOMEM)))?;
            log::debug!("Reserved {} bytes for the heap at {:?}", to_reserve, base);
            self.base = Some(base);
            self.reserved = to_reserve;
            Ok(base)
        }
    }

    impl Default for LibcHeapGrower {
        fn default() -> Self {
            LibcHeapGrower::new(DEFAULT_MAX_HEAP)
        }
    }

    impl Drop for LibcHeapGrower {
        fn drop(&mut self) {
            if let Some(base) = self.base.take() {
                unsafe {
                    libc::munmap(base.as_ptr() as *mut libc::c_void, self.reserved);
                }
            }
        }
    }

    impl HeapGrower for LibcHeapGrower {
        type Err = MmapError;

        fn grow_heap(&mut self, size: usize) -> Result<Range<usize>, MmapError> {
            self.reserve()?;
            let available = self.reserved - self.brk;
            if size > available {
                return Err(MmapError::Exhausted(OutOfMemory {
                    requested: size,
                    available,
                }));
            }

            let start = self.brk;
            self.brk += size;
            Ok(start..self.brk)
        }

        fn memory(&self) -> &[u8] {
            match self.base {
                // The first `brk` bytes of the mapping are readable and owned
                // by us.
                Some(base) => unsafe { core::slice::from_raw_parts(base.as_ptr(), self.brk) },
                None => &[],
            }
        }

        fn memory_mut(&mut self) -> &mut [u8] {
            match self.base {
                Some(base) => unsafe {
                    core::slice::from_raw_parts_mut(base.as_ptr(), self.brk)
                },
                None => &mut [],
            }
        }
    }
}

/// The heap region the allocator works in.
///
/// This is a thin layer over a [`HeapGrower`] that adds word-sized accessors.
/// Word accesses are bounds-checked; touching a word outside the heap means
/// some metadata is corrupt, and panics.
pub struct Heap<G> {
    grower: G,
}

impl<G: HeapGrower> Heap<G> {
    pub fn new(grower: G) -> Self {
        Heap { grower }
    }

    /// Extend the heap by `incr` bytes, returning the old break (the offset
    /// of the first new byte).
    pub fn sbrk(&mut self, incr: usize) -> Result<usize, G::Err> {
        let old_brk = self.size();
        let range = self.grower.grow_heap(incr)?;
        debug_assert_eq!(range, old_brk..old_brk + incr);
        Ok(range.start)
    }

    /// Current size of the heap in bytes.
    pub fn size(&self) -> usize {
        self.grower.memory().len()
    }

    pub fn bounds(&self) -> Range<usize> {
        0..self.size()
    }

    /// Whether `offset` lies inside the heap.
    pub fn contains(&self, offset: usize) -> bool {
        offset < self.size()
    }

    pub fn bytes(&self) -> &[u8] {
        self.grower.memory()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.grower.memory_mut()
    }

    /// Read the 32-bit word at `offset`.
    pub fn get(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes()[offset..offset + 4]);
        u32::from_le_bytes(word)
    }

    /// Write the 32-bit word at `offset`.
    pub fn put(&mut self, offset: usize, value: u32) {
        self.bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn grower(&self) -> &G {
        &self.grower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_toy_heap_exhaustion() {
        let mut toy = ToyHeap::default();
        let capacity = toy.heap.len();

        assert_eq!(toy.grow_heap(64), Ok(0..64));
        assert_eq!(toy.grow_heap(64), Ok(64..128));

        let err = toy.grow_heap(capacity).unwrap_err();
        assert_eq!(err.requested, capacity);
        assert_eq!(err.available, capacity - 128);
        // A failed growth leaves the store alone
        assert_eq!(toy.memory().len(), 128);

        assert_eq!(toy.grow_heap(capacity - 128), Ok(128..capacity));
        assert!(toy.grow_heap(1).is_err());
    }

    #[test]
    fn test_vec_heap_limit() {
        let mut vh = VecHeap::new(100);
        assert_eq!(vh.grow_heap(40), Ok(0..40));
        assert_eq!(
            vh.grow_heap(61),
            Err(OutOfMemory {
                requested: 61,
                available: 60
            })
        );
        assert_eq!(vh.grow_heap(60), Ok(40..100));
        assert_eq!(vh.memory().len(), 100);
        assert!(vh.memory().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_words() {
        let mut heap = Heap::new(VecHeap::default());
        assert_eq!(heap.sbrk(16), Ok(0));
        assert_eq!(heap.sbrk(8), Ok(16));
        assert_eq!(heap.size(), 24);
        assert_eq!(heap.bounds(), 0..24);
        assert!(heap.contains(23));
        assert!(!heap.contains(24));

        heap.put(4, 0xdead_beef);
        heap.put(20, 7);
        assert_eq!(heap.get(4), 0xdead_beef);
        assert_eq!(heap.get(20), 7);
        assert_eq!(heap.get(0), 0);
        assert_eq!(&heap.bytes()[4..8], &0xdead_beefu32.to_le_bytes());
    }

    #[test]
    #[should_panic]
    fn test_word_out_of_bounds() {
        let mut heap = Heap::new(VecHeap::default());
        heap.sbrk(8).unwrap();
        heap.get(6);
    }

    #[cfg(feature = "use_libc")]
    #[test]
    fn test_libc_grower() {
        let mut grower = LibcHeapGrower::new(1 << 16);
        assert_eq!(grower.memory().len(), 0);
        assert_eq!(grower.grow_heap(4096).unwrap(), 0..4096);
        grower.memory_mut()[4095] = 3;
        assert_eq!(grower.grow_heap(8).unwrap(), 4096..4104);
        assert_eq!(grower.memory()[4095], 3);
        assert!(grower.grow_heap(1 << 20).is_err());
    }
}
