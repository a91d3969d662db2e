//! # fitalloc - A Best-Fit Memory Allocator Library
//!
//! This crate provides a general-purpose **best-fit allocator** with
//! boundary-tag coalescing, built on the two classic memory services of a
//! Unix process: the program break (`sbrk`) for small requests and
//! anonymous page mappings (`mmap`) for large ones.
//!
//! ## Overview
//!
//! Every allocation is a block in one global, address-ordered, doubly
//! linked list:
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                      BREAK REGION (sbrk)                             │
//!   │                                                                      │
//!   │   ┌──────────┬──────────┬──────────┬────────────────────────────┐    │
//!   │   │ B1: used │ B2: free │ B3: used │        B4: free            │    │
//!   │   └──────────┴──────────┴──────────┴────────────────────────────┘    │
//!   │                                                               ▲      │
//!   │                                                       Program Break  │
//!   └──────────────────────────────────────────────────────────────────────┘
//!
//!   ┌───────────────────────────┐      ┌───────────────────────────┐
//!   │  M1: mmap (≥ 4096 bytes)  │      │  M2: mmap (≥ 4096 bytes)  │
//!   └───────────────────────────┘      └───────────────────────────┘
//!
//!   list: head ──► B1 ◄──► B2 ◄──► B3 ◄──► B4 ◄──► M1 ◄──► M2 ◄── tail
//! ```
//!
//! Placement is best-fit: the free block with the smallest sufficient
//! payload wins, and oversized winners are split. Freeing a break block
//! merges it with any address-adjacent free neighbor; freeing an mmap
//! block returns the whole mapping to the operating system immediately.
//!
//! ## Crate Structure
//!
//! ```text
//!   fitalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Block metadata layout (header, footer, magic words)
//!   └── heap       - Placement/release engines, integrity checker, API
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! unsafe {
//!   // Allocate, use, resize, release.
//!   let ptr = fitalloc::alloc(100);
//!   assert!(!ptr.is_null());
//!   ptr.write(42);
//!
//!   let ptr = fitalloc::realloc(ptr, 200);
//!   assert_eq!(ptr.read(), 42);
//!
//!   fitalloc::free(ptr);
//! }
//!
//! // Counters over the whole heap.
//! let stats = fitalloc::stats();
//! println!("{} blocks, {} bytes in use", stats.blocks, stats.used);
//! ```
//!
//! ## Features
//!
//! - **Best-fit placement**: smallest sufficient free block, exact fits
//!   short-circuit the scan
//! - **Boundary-tag coalescing**: adjacent free break blocks merge on free
//! - **Dual-path policy**: large requests get their own anonymous mapping
//!   and are unmapped the moment they are freed
//! - **Corruption detection**: magic-word canaries plus a full-list
//!   integrity check around every mutating operation
//! - **Thread safety**: one process-wide mutex serializes all operations
//!
//! ## Limitations
//!
//! - **Unix-only**: requires `libc`, `sbrk` and `mmap` (POSIX systems)
//! - **Break memory is never returned**: freed break blocks are kept and
//!   reused; only mmap blocks go back to the operating system
//! - **Fixed alignment**: all pointers are 16-byte aligned, nothing
//!   stricter
//! - **One heap per process**: the block list and its mutex are
//!   process-wide singletons
//!
//! ## Safety
//!
//! This crate hands out raw pointers and trusts the caller to respect
//! their lifetimes, so the allocation operations are `unsafe`. Misuse the
//! allocator can detect cheaply (freeing null, freeing twice, freeing a
//! pointer it never produced) is tolerated as a no-op. Corruption of the
//! block metadata itself is not: it is reported on stderr and aborts the
//! process, because no further allocator call could be trusted.

pub mod align;
mod block;
mod heap;

pub use heap::{HeapStats, alloc, free, print_stats, realloc, stats, zalloc};
