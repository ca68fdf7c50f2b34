#![cfg_attr(not(test), no_std)]

//! A segregated free-list memory allocator.
//!
//! The allocator manages one growable heap, a contiguous run of bytes that
//! only ever grows at its high end. The heap is carved into blocks, each
//! with a boundary tag recording its size and whether it (and the block
//! before it) is allocated. Freed blocks are coalesced with their free
//! neighbours right away and filed into one of 18 size classes; allocation
//! searches the class for the requested size and then larger classes, and
//! only grows the heap when nothing fits.
//!
//! Everything lives inside the heap itself: the free lists are threaded
//! through the unused payload of free blocks, and their heads sit in a
//! sentinel table at the bottom of the heap. Positions are byte offsets into
//! the heap rather than pointers, so all access is bounds-checked.
//!
//! ## Quick Start
//!
//! ```rust
//! use seglist_alloc::{RawAlloc, VecHeap};
//!
//! let mut allocator = RawAlloc::init(VecHeap::default()).unwrap();
//!
//! let handle = allocator.alloc(100).unwrap();
//! allocator.payload_mut(handle)[..5].copy_from_slice(b"hello");
//!
//! let handle = allocator.realloc(handle, 1000).unwrap();
//! assert_eq!(&allocator.payload(handle)[..5], b"hello");
//!
//! allocator.free(handle);
//! assert!(allocator.check_heap(false).is_valid());
//! ```
//!
//! ## Threads
//!
//! [`RawAlloc`] is single-threaded: callers must serialize every call into
//! it. [`LockedAlloc`] does that with a spin lock, and can live in a
//! `static`.

extern crate alloc;

pub mod allocators;
pub mod block;
pub mod check;
pub mod freelist;
pub mod heap;

pub use allocators::{Config, Handle, InitError, LockedAlloc, RawAlloc};
pub use check::{Issue, Stats, Validity};
#[cfg(feature = "use_libc")]
pub use heap::{LibcHeapGrower, MmapError};
pub use heap::{Heap, HeapGrower, OutOfMemory, ToyHeap, VecHeap};
