//! # Best-Fit Heap
//!
//! The allocator engine: a global, address-ordered, doubly-linked list of
//! blocks spanning the break region and any direct page mappings, with
//! best-fit placement, block splitting and immediate neighbor coalescing.
//!
//! ## How It Works
//!
//! Small requests are satisfied from the break region. The break is grown
//! in whole pages, so the first allocation of a page leaves room that later
//! requests can be split out of:
//!
//! ```text
//!                    HEAP MEMORY (grows upward →)
//!
//!   ┌───┬─────┬───┬───┬─────┬───┬───┬──────────────────┬───┐
//!   │hdr│ pay │ftr│hdr│ pay │ftr│hdr│   free payload   │ftr│
//!   └───┴─────┴───┴───┴─────┴───┴───┴──────────────────┴───┘
//!   ▲               ▲               ▲                       ▲
//!   │               │               │                       │
//!   used block      used block      free block     program break
//! ```
//!
//! Large requests (aligned payload >= [`MMAP_THRESHOLD`]) bypass the break
//! entirely and get a private anonymous mapping of their own:
//!
//! ```text
//!   head ──► [break blk] ◄──► [break blk] ◄──► [mmap blk] ◄── tail
//!                                                  │
//!                              unmapped (and unlinked) on free
//! ```
//!
//! Mmap blocks live in the same list but are never split, never coalesced
//! and are returned to the operating system the moment they are freed.
//! Break blocks are never returned; a freed break block is merged with any
//! address-adjacent free neighbor and waits to be reused.
//!
//! ## Placement
//!
//! ```text
//!   Looking for size = 100 (aligned to 112)
//!
//!   ┌────────────┐    ┌────────────┐    ┌────────────┐    ┌────────────┐
//!   │ size: 64   │───►│ size: 512  │───►│ size: 128  │───►│ size: 3000 │
//!   │ free: yes  │    │ free: yes  │    │ free: yes  │    │ free: no   │
//!   └────────────┘    └────────────┘    └────────────┘    └────────────┘
//!        ↓                  ↓                 ↓
//!      skip             candidate         ✓ BEST (smallest fit)
//!   (too small)         (512 >= 112)      (128 < 512)
//! ```
//!
//! The chosen block is split when the remainder could stand alone as a
//! block of its own (>= [`MIN_BLOCK_SIZE`]).
//!
//! ## Corruption policy
//!
//! Every block header carries a magic word. The integrity checker walks
//! the whole list on entry and exit of every mutating operation; a bad
//! magic, a broken back-link, a cycle or a block outside the break region
//! means the heap state cannot be trusted, so the process prints a
//! diagnostic and aborts. Misuse that the magic word can detect (double
//! free, free of a foreign pointer) is tolerated silently instead.
//!
//! ## Locking
//!
//! All public operations serialize on one process-wide mutex held for the
//! whole call. The engine never calls back into the public surface while
//! the lock is held.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::{process, ptr};

use libc::{
  _SC_PAGESIZE, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, c_void, intptr_t,
  mmap, munmap, sbrk, sysconf,
};

use crate::align::ALIGNMENT;
use crate::block::{
  ALLOC_MAGIC, Block, FOOTER_SIZE, FREED_MAGIC, HEADER_SIZE, MIN_BLOCK_SIZE, MMAP_THRESHOLD,
};
use crate::{align, align_to};

/// A list walk longer than this many nodes is treated as a cycle.
const MAX_LIST_WALK: usize = 1000;

/// The process-wide heap. All public operations lock it for their whole
/// duration.
static HEAP: Mutex<Heap> = Mutex::new(Heap::new());

/// Locks the global heap, recovering from poisoning; the state is only
/// mutated while the lock is held and is re-validated on every mutating
/// entry.
fn heap() -> MutexGuard<'static, Heap> {
  HEAP.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Corruption is unrecoverable: report on stderr and abort the process.
fn corruption(
  message: &str,
  block: *mut Block,
) -> ! {
  eprintln!("fitalloc: {} at {:p}", message, block);
  process::abort();
}

/// Counters reported by [`stats`]. `total` sums header + payload + footer
/// over every listed block; `used` sums the payload of in-use blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub total: usize,
  pub used: usize,
  pub blocks: usize,
  pub mmap_blocks: usize,
}

/// The allocator state: head and tail of the global block list.
///
/// Both pointers are null until the first allocation. Blocks are appended
/// at the tail, which for break-derived blocks is also address order.
pub struct Heap {
  head: *mut Block,
  tail: *mut Block,
}

// The raw list pointers are only ever dereferenced by the mutex holder.
unsafe impl Send for Heap {}

impl Heap {
  const fn new() -> Self {
    Self {
      head: ptr::null_mut(),
      tail: ptr::null_mut(),
    }
  }

  /// Walks the whole list and enforces the structural invariants: bounded
  /// length, break blocks inside the break region, magic sentinels, the
  /// `free` flag agreeing with the magic, intact back-links and no cycles.
  ///
  /// Runs on entry and exit of every mutating operation. Any violation is
  /// fatal; the allocator cannot recover from a corrupted heap.
  unsafe fn validate(&self) {
    unsafe {
      let brk = sbrk(0) as usize;
      // Lower bound for break blocks: the first break-derived block is the
      // lowest address the allocator ever received from sbrk.
      let mut base: usize = 0;
      let mut count = 0usize;

      let mut current = self.head;
      while !current.is_null() {
        count += 1;
        if count > MAX_LIST_WALK {
          corruption("possible infinite loop in block list", current);
        }

        if !(*current).is_mmap {
          if base == 0 {
            base = current as usize;
          }
          if (current as usize) < base || current as usize > brk {
            corruption("block outside heap boundaries", current);
          }
        }

        if !Block::has_valid_magic(current) {
          corruption("invalid magic in block", current);
        }
        if (*current).free != ((*current).magic == FREED_MAGIC) {
          corruption("free flag disagrees with magic in block", current);
        }

        let next = (*current).next;
        if !next.is_null() {
          if !(*next).is_mmap && ((base != 0 && (next as usize) < base) || next as usize > brk) {
            corruption("invalid next pointer in block", current);
          }
          if (*next).prev != current {
            corruption("invalid next->prev link in block", current);
          }
          if (*next).next == current {
            corruption("circular reference detected", current);
          }
        }

        current = next;
      }
    }
  }

  /// Best-fit scan over the whole list: among free blocks large enough for
  /// `size`, pick the smallest; an exact fit stops the scan early.
  ///
  /// Returns null when no candidate exists. A block with a foreign magic
  /// word aborts: the list can no longer be walked safely.
  unsafe fn find_best_fit(
    &self,
    size: usize,
  ) -> *mut Block {
    unsafe {
      let mut best: *mut Block = ptr::null_mut();

      let mut current = self.head;
      while !current.is_null() {
        if !Block::has_valid_magic(current) {
          corruption("corrupted block detected", current);
        }
        if (*current).free
          && (*current).size >= size
          && (best.is_null() || (*current).size < (*best).size)
        {
          best = current;
          // Perfect fit, stop searching
          if (*best).size == size {
            break;
          }
        }
        current = (*current).next;
      }

      best
    }
  }

  /// Acquires a fresh block from the operating system and appends it to
  /// the list tail.
  ///
  /// - `size >= MMAP_THRESHOLD`: a private anonymous mapping of exactly
  ///   `header + size + footer` bytes; the payload is exactly `size`.
  /// - otherwise: the break is extended by `header + size + footer`
  ///   rounded up to the page size, and the whole new region becomes one
  ///   block. The oversized payload lets later requests split it without
  ///   another system call.
  ///
  /// Returns null if the underlying service refuses; nothing is mutated
  /// in that case.
  unsafe fn request_space(
    &mut self,
    size: usize,
  ) -> *mut Block {
    unsafe {
      let block: *mut Block;

      if size >= MMAP_THRESHOLD {
        let total = HEADER_SIZE + size + FOOTER_SIZE;
        let request = mmap(
          ptr::null_mut(),
          total,
          PROT_READ | PROT_WRITE,
          MAP_PRIVATE | MAP_ANONYMOUS,
          -1,
          0,
        );
        if request == MAP_FAILED {
          return ptr::null_mut();
        }

        block = request as *mut Block;
        ptr::write_bytes(block as *mut u8, 0, HEADER_SIZE);
        (*block).magic = ALLOC_MAGIC;
        (*block).size = size;
        (*block).free = false;
        (*block).is_mmap = true;
      } else {
        let page_size = sysconf(_SC_PAGESIZE) as usize;
        let full_block = HEADER_SIZE + size + FOOTER_SIZE;
        let request_size = align_to!(full_block, page_size);

        let request = sbrk(request_size as intptr_t);
        if request == usize::MAX as *mut c_void {
          // sbrk returns (void*)-1 on failure
          return ptr::null_mut();
        }

        block = request as *mut Block;
        ptr::write_bytes(block as *mut u8, 0, HEADER_SIZE);
        (*block).magic = ALLOC_MAGIC;
        (*block).size = request_size - HEADER_SIZE - FOOTER_SIZE;
        (*block).free = false;
        (*block).is_mmap = false;
      }

      (*block).next = ptr::null_mut();
      (*block).prev = self.tail;
      Block::write_footer(block);

      if self.head.is_null() {
        self.head = block;
      }
      if !self.tail.is_null() {
        (*self.tail).next = block;
      } else {
        (*block).prev = ptr::null_mut();
      }
      self.tail = block;

      block
    }
  }

  /// Splits `block` so its payload shrinks to `size`, constructing a new
  /// free block from the remainder:
  ///
  /// ```text
  ///   before:  [ hdr │         S bytes payload          │ ftr ]
  ///   after:   [ hdr │ size │ ftr ][ hdr │ remainder │ ftr ]
  ///                                       (free)
  /// ```
  ///
  /// No-op when the block is mmap-backed or the remainder could not stand
  /// alone as a block of its own.
  unsafe fn split(
    &mut self,
    block: *mut Block,
    size: usize,
  ) {
    unsafe {
      let remaining = (*block).size - size;
      if (*block).is_mmap || remaining < MIN_BLOCK_SIZE {
        return;
      }

      let new_block = (block as *mut u8).add(HEADER_SIZE + size) as *mut Block;
      (*new_block).magic = FREED_MAGIC;
      (*new_block).size = remaining - HEADER_SIZE - FOOTER_SIZE;
      (*new_block).free = true;
      (*new_block).is_mmap = false;
      (*new_block).next = (*block).next;
      (*new_block).prev = block;

      (*block).size = size;
      (*block).next = new_block;

      Block::write_footer(new_block);
      Block::write_footer(block);

      if !(*new_block).next.is_null() {
        (*(*new_block).next).prev = new_block;
      } else {
        self.tail = new_block;
      }
    }
  }

  /// Merges a freed break block with its address-adjacent free neighbors.
  ///
  /// A neighbor qualifies only when it is listed directly next to `block`,
  /// is free, is break-derived, and the blocks touch in memory
  /// (`prev + header + prev.size + footer == block`). The predecessor
  /// merge runs first, then the successor merge on whatever block
  /// resulted. Returns the surviving block.
  unsafe fn coalesce(
    &mut self,
    mut block: *mut Block,
  ) -> *mut Block {
    unsafe {
      if block.is_null() || !(*block).free || (*block).magic != FREED_MAGIC {
        return block;
      }

      let prev = (*block).prev;
      if !prev.is_null()
        && (*prev).free
        && !(*prev).is_mmap
        && (prev as *mut u8).add(HEADER_SIZE + (*prev).size + FOOTER_SIZE) == block as *mut u8
      {
        (*prev).size += HEADER_SIZE + (*block).size + FOOTER_SIZE;
        Block::write_footer(prev);

        (*prev).next = (*block).next;
        if !(*block).next.is_null() {
          (*(*block).next).prev = prev;
        } else {
          self.tail = prev;
        }
        block = prev;
      }

      let next = (*block).next;
      if !next.is_null()
        && (*next).free
        && !(*next).is_mmap
        && (block as *mut u8).add(HEADER_SIZE + (*block).size + FOOTER_SIZE) == next as *mut u8
      {
        (*block).size += HEADER_SIZE + (*next).size + FOOTER_SIZE;
        Block::write_footer(block);

        (*block).next = (*next).next;
        if !(*block).next.is_null() {
          (*(*block).next).prev = block;
        } else {
          self.tail = block;
        }
      }

      block
    }
  }

  /// The placement engine behind [`alloc`](crate::alloc): reuse the best
  /// fitting free block (splitting off any excess) or request fresh space.
  unsafe fn alloc(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      self.validate();

      // The aligned payload plus metadata must fit the address-size type.
      if size == 0 || size > usize::MAX - HEADER_SIZE - FOOTER_SIZE - (ALIGNMENT - 1) {
        return ptr::null_mut();
      }
      let actual_size = align!(size);

      let mut block = self.find_best_fit(actual_size);
      if block.is_null() {
        block = self.request_space(actual_size);
        if block.is_null() {
          return ptr::null_mut();
        }
      } else {
        if (*block).size >= actual_size + MIN_BLOCK_SIZE {
          self.split(block, actual_size);
        }
        (*block).magic = ALLOC_MAGIC;
        (*block).free = false;
      }

      self.validate();
      Block::payload(block)
    }
  }

  /// Overflow-checked counted allocation with a zeroed payload.
  unsafe fn zalloc(
    &mut self,
    nmemb: usize,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      if nmemb == 0 || size == 0 {
        return ptr::null_mut();
      }
      let total = match nmemb.checked_mul(size) {
        Some(total) => total,
        None => return ptr::null_mut(),
      };
      if total > usize::MAX - HEADER_SIZE - FOOTER_SIZE - (ALIGNMENT - 1) {
        return ptr::null_mut();
      }

      let ptr = self.alloc(total);
      if !ptr.is_null() {
        ptr::write_bytes(ptr, 0, total);
      }
      ptr
    }
  }

  /// The release engine behind [`free`](crate::free).
  ///
  /// Break blocks are stamped freed and coalesced with address-adjacent
  /// free neighbors. Mmap blocks are unlinked and the whole mapping is
  /// returned to the operating system. Null, foreign and already-freed
  /// pointers are silent no-ops.
  unsafe fn free(
    &mut self,
    ptr: *mut u8,
  ) {
    unsafe {
      self.validate();
      if ptr.is_null() {
        return;
      }

      let block = Block::from_payload(ptr);
      if !Block::has_valid_magic(block) {
        // Not ours, or the header was trampled. Misuse is tolerated.
        return;
      }
      if (*block).free || (*block).magic == FREED_MAGIC {
        // Double free
        return;
      }

      if (*block).is_mmap {
        (*block).magic = FREED_MAGIC;

        if !(*block).prev.is_null() {
          (*(*block).prev).next = (*block).next;
        } else {
          self.head = (*block).next;
        }
        if !(*block).next.is_null() {
          (*(*block).next).prev = (*block).prev;
        } else {
          self.tail = (*block).prev;
        }

        munmap(block as *mut c_void, (*block).size + HEADER_SIZE + FOOTER_SIZE);

        self.validate();
        return;
      }

      (*block).magic = FREED_MAGIC;
      (*block).free = true;
      self.coalesce(block);

      self.validate();
    }
  }

  /// The resize engine behind [`realloc`](crate::realloc).
  ///
  /// Shrinks in place, splitting off a free tail when the remainder can
  /// stand alone. Grows in place when an address-adjacent free successor
  /// covers the difference, re-splitting any excess. Falls back to
  /// allocate-copy-free; on failure the old block is left untouched.
  unsafe fn realloc(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> *mut u8 {
    unsafe {
      if ptr.is_null() {
        return self.alloc(size);
      }
      if size == 0 {
        self.free(ptr);
        return ptr::null_mut();
      }

      self.validate();

      let block = Block::from_payload(ptr);
      if (*block).magic != ALLOC_MAGIC {
        // Freed or foreign pointer: nothing sane to resize.
        return ptr::null_mut();
      }
      if size > usize::MAX - HEADER_SIZE - FOOTER_SIZE - (ALIGNMENT - 1) {
        return ptr::null_mut();
      }

      let actual_size = align!(size);
      let old_size = (*block).size;

      if (*block).is_mmap {
        // Mappings are never split or absorbed: shrinking keeps the
        // oversize payload, growing moves to a fresh block.
        if actual_size <= old_size {
          return ptr;
        }
        let fresh = self.alloc(size);
        if fresh.is_null() {
          return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(ptr, fresh, old_size.min(size));
        self.free(ptr);
        return fresh;
      }

      if actual_size <= old_size {
        if old_size - actual_size >= MIN_BLOCK_SIZE {
          self.split(block, actual_size);
          let remainder = (*block).next;
          self.coalesce(remainder);
        }
        self.validate();
        return ptr;
      }

      // Grow: absorb a free address-adjacent successor when the combined
      // span covers the request.
      let next = (*block).next;
      if !next.is_null()
        && (*next).free
        && !(*next).is_mmap
        && (block as *mut u8).add(HEADER_SIZE + old_size + FOOTER_SIZE) == next as *mut u8
        && old_size + HEADER_SIZE + (*next).size + FOOTER_SIZE >= actual_size
      {
        (*block).size = old_size + HEADER_SIZE + (*next).size + FOOTER_SIZE;
        (*block).next = (*next).next;
        if !(*block).next.is_null() {
          (*(*block).next).prev = block;
        } else {
          self.tail = block;
        }
        Block::write_footer(block);

        if (*block).size >= actual_size + MIN_BLOCK_SIZE {
          self.split(block, actual_size);
        }

        self.validate();
        return ptr;
      }

      let fresh = self.alloc(size);
      if fresh.is_null() {
        return ptr::null_mut();
      }
      ptr::copy_nonoverlapping(ptr, fresh, old_size.min(size));
      self.free(ptr);
      fresh
    }
  }

  /// Walks the list and accumulates the [`HeapStats`] counters.
  unsafe fn stats(&self) -> HeapStats {
    unsafe {
      let mut stats = HeapStats::default();

      let mut current = self.head;
      while !current.is_null() {
        stats.total += (*current).size + HEADER_SIZE + FOOTER_SIZE;
        stats.blocks += 1;
        if (*current).is_mmap {
          stats.mmap_blocks += 1;
        }
        if !(*current).free {
          stats.used += (*current).size;
        }
        current = (*current).next;
      }

      stats
    }
  }
}

/// Allocates `size` bytes and returns an [`ALIGNMENT`]-aligned pointer to
/// them, or null when `size` is zero, the size plus block metadata would
/// overflow, or the operating system refuses more memory.
///
/// Requests whose aligned size reaches [`MMAP_THRESHOLD`] are served from
/// a dedicated anonymous mapping; smaller ones from the break region.
///
/// # Safety
///
/// The returned memory is valid until passed to [`free`] or [`realloc`].
/// The caller must not access more than `size` bytes.
pub unsafe fn alloc(size: usize) -> *mut u8 {
  unsafe { heap().alloc(size) }
}

/// Allocates an array of `nmemb` elements of `size` bytes each, zeroed.
///
/// Returns null when either argument is zero, when `nmemb * size`
/// overflows, or when the total plus block metadata would overflow.
///
/// # Safety
///
/// Same contract as [`alloc`].
pub unsafe fn zalloc(
  nmemb: usize,
  size: usize,
) -> *mut u8 {
  unsafe { heap().zalloc(nmemb, size) }
}

/// Resizes the allocation at `ptr` to `size` bytes, preserving the first
/// `min(old, size)` bytes of content.
///
/// A null `ptr` behaves as [`alloc`]; a zero `size` behaves as [`free`]
/// and returns null. The result may equal `ptr` (in-place shrink or grow)
/// or be a fresh pointer. On failure null is returned and `ptr` remains
/// valid.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by this allocator
/// that has not been freed.
pub unsafe fn realloc(
  ptr: *mut u8,
  size: usize,
) -> *mut u8 {
  unsafe { heap().realloc(ptr, size) }
}

/// Releases the allocation at `ptr`.
///
/// Null pointers, pointers this allocator never handed out, and double
/// frees are silent no-ops. Break-derived blocks are kept for reuse and
/// merged with free neighbors; mmap-derived blocks are unmapped
/// immediately and must not be touched afterwards.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by this allocator.
/// After the call the memory must no longer be accessed.
pub unsafe fn free(ptr: *mut u8) {
  unsafe { heap().free(ptr) }
}

/// Snapshot of the allocator counters.
pub fn stats() -> HeapStats {
  unsafe { heap().stats() }
}

/// Prints the counters in the classic human-readable form:
///
/// ```text
/// Memory Stats:
/// Total: 12288 bytes
/// Used: 8096 bytes
/// Blocks: 3 (1 mmap)
/// ```
pub fn print_stats() {
  let stats = stats();
  println!("Memory Stats:");
  println!("Total: {} bytes", stats.total);
  println!("Used: {} bytes", stats.used);
  println!("Blocks: {} ({} mmap)", stats.blocks, stats.mmap_blocks);
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  /// The break is process-global, so heap tests must not interleave.
  static TEST_LOCK: Mutex<()> = Mutex::new(());

  fn serialize() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Helper: check that a pointer is aligned to `align` bytes.
  fn is_aligned(
    ptr: *mut u8,
    align: usize,
  ) -> bool {
    (ptr as usize) % align == 0
  }

  #[test]
  fn basic_allocation_and_write_read() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      let first = heap.alloc(100);
      assert!(!first.is_null());

      for i in 0..100 {
        first.add(i).write(i as u8);
      }

      let second = heap.alloc(256);
      assert!(!second.is_null());
      ptr::write_bytes(second, 0xAB, 256);

      // The first allocation must not be disturbed by the second.
      for i in 0..100 {
        assert_eq!(first.add(i).read(), i as u8);
      }
      for i in 0..256 {
        assert_eq!(second.add(i).read(), 0xAB);
      }
    }
  }

  #[test]
  fn returned_pointers_are_aligned() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      for size in [1, 7, 16, 100, 1000, 4095, 4096, 10000] {
        let ptr = heap.alloc(size);
        assert!(!ptr.is_null());
        assert!(
          is_aligned(ptr, ALIGNMENT),
          "allocation of {} bytes must be {}-byte aligned, got {:p}",
          size,
          ALIGNMENT,
          ptr
        );
        heap.free(ptr);
      }
    }
  }

  #[test]
  fn zero_size_and_overflow_requests_return_null() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      assert!(heap.alloc(0).is_null());
      // Falls through the overflow guard but the mapping service refuses.
      assert!(heap.alloc(usize::MAX / 2).is_null());
      assert!(heap.alloc(usize::MAX).is_null());

      assert!(heap.zalloc(0, 8).is_null());
      assert!(heap.zalloc(8, 0).is_null());
      assert!(heap.zalloc(usize::MAX, 4).is_null());

      // None of the failures may have mutated the list.
      assert_eq!(heap.stats(), HeapStats::default());

      let ptr = heap.alloc(100);
      assert!(!ptr.is_null());
      let before = heap.stats();
      assert!(heap.realloc(ptr, usize::MAX).is_null());
      assert_eq!(heap.stats(), before);

      // The old block must still be writable after the failed realloc.
      ptr::write_bytes(ptr, 0x5A, 100);
      assert_eq!(ptr.read(), 0x5A);
    }
  }

  #[test]
  fn break_request_rounds_to_whole_pages() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      let ptr = heap.alloc(100);
      assert!(!ptr.is_null());

      let page_size = sysconf(_SC_PAGESIZE) as usize;
      let stats = heap.stats();
      assert_eq!(stats.blocks, 1);
      assert_eq!(stats.total, page_size);
      assert_eq!(stats.used, page_size - HEADER_SIZE - FOOTER_SIZE);
    }
  }

  #[test]
  fn freed_block_is_reused() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      let first = heap.alloc(100);
      assert!(!first.is_null());
      heap.free(first);

      // Best fit finds the freed page block and splits it.
      let second = heap.alloc(100);
      assert_eq!(second, first);
    }
  }

  #[test]
  fn best_fit_prefers_smallest_candidate() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      // Carve one page into used/free sub-blocks of known sizes.
      let base = heap.alloc(3000);
      assert!(!base.is_null());
      heap.free(base);

      let big = heap.alloc(3000); // 3008 used, remainder free
      let small = heap.alloc(500); // 512 used from the remainder
      assert_eq!(big, base);
      assert!(!small.is_null());

      // Candidates now: the freed 3008-byte block and the page tail.
      heap.free(big);

      // The page tail after `small` is the smaller candidate.
      let tail = heap.alloc(400);
      assert_eq!(tail, small.add(512 + FOOTER_SIZE + HEADER_SIZE));

      // An exact-fit request takes the same block back.
      let tail_size = (*Block::from_payload(tail)).size;
      heap.free(tail);
      let again = heap.alloc(tail_size);
      assert_eq!(again, tail);
    }
  }

  #[test]
  fn adjacent_free_blocks_coalesce() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      // One page, split into three used blocks plus the page tail.
      let base = heap.alloc(3000);
      assert!(!base.is_null());
      heap.free(base);

      let p1 = heap.alloc(900);
      let p2 = heap.alloc(900);
      let p3 = heap.alloc(900);
      assert_eq!(p1, base);
      assert!(!p2.is_null() && !p3.is_null());
      assert_eq!(heap.stats().blocks, 4);

      // Middle first: no free neighbor, nothing merges.
      heap.free(p2);
      assert_eq!(heap.stats().blocks, 4);

      // p1 merges forward into p2's hole.
      heap.free(p1);
      assert_eq!(heap.stats().blocks, 3);

      // p3 merges backward into the p1+p2 hole and forward into the page
      // tail: one free block spanning the whole page remains.
      heap.free(p3);
      let stats = heap.stats();
      assert_eq!(stats.blocks, 1);
      assert_eq!(stats.used, 0);
      assert_eq!(stats.total, sysconf(_SC_PAGESIZE) as usize);
    }
  }

  #[test]
  fn large_requests_take_the_mapping_path() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      let ptr = heap.alloc(4097);
      assert!(!ptr.is_null());

      let stats = heap.stats();
      assert_eq!(stats.blocks, 1);
      assert_eq!(stats.mmap_blocks, 1);
      // The mapping path never over-allocates.
      assert_eq!(stats.used, align!(4097));

      ptr::write_bytes(ptr, 0xC3, 4097);
      assert_eq!(ptr.add(4096).read(), 0xC3);

      // Freeing unmaps and unlinks; the list is empty again.
      heap.free(ptr);
      assert_eq!(heap.stats(), HeapStats::default());
    }
  }

  #[test]
  fn stats_counts_both_paths() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      let p1 = heap.alloc(100);
      let p2 = heap.alloc(200);
      let p3 = heap.alloc(4097);
      assert!(!p1.is_null() && !p2.is_null() && !p3.is_null());

      let stats = heap.stats();
      assert_eq!(stats.blocks, 3);
      assert_eq!(stats.mmap_blocks, 1);
      assert!(stats.used >= 4397);
      assert!(stats.total > stats.used);
    }
  }

  #[test]
  fn zalloc_returns_zeroed_memory() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      // Dirty a block first so reuse would hand back stale bytes.
      let dirty = heap.alloc(64);
      ptr::write_bytes(dirty, 0xFF, 64);
      heap.free(dirty);

      let small = heap.zalloc(4, 16);
      assert_eq!(small, dirty);
      for i in 0..64 {
        assert_eq!(small.add(i).read(), 0, "byte {} not zeroed", i);
      }

      // 1024 * 4 bytes crosses the threshold onto the mapping path.
      let large = heap.zalloc(1024, 4);
      assert!(!large.is_null());
      for i in 0..4096 {
        assert_eq!(large.add(i).read(), 0);
      }

      heap.free(small);
      heap.free(large);
    }
  }

  #[test]
  fn realloc_preserves_content_across_moves() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      let ptr = heap.alloc(100);
      assert!(!ptr.is_null());
      ptr::write_bytes(ptr, 0xAB, 100);

      // Shrink in place: the tail is split off as a free block.
      let shrunk = heap.realloc(ptr, 50);
      assert_eq!(shrunk, ptr);
      for i in 0..50 {
        assert_eq!(shrunk.add(i).read(), 0xAB);
      }

      // Grow in place: the split-off tail is absorbed back.
      let grown = heap.realloc(shrunk, 2000);
      assert_eq!(grown, shrunk);
      for i in 0..50 {
        assert_eq!(grown.add(i).read(), 0xAB);
      }

      // Grow past the page: moves to a fresh mapping, content intact.
      let moved = heap.realloc(grown, 8000);
      assert!(!moved.is_null());
      assert_ne!(moved, grown);
      assert!((*Block::from_payload(moved)).is_mmap);
      for i in 0..50 {
        assert_eq!(moved.add(i).read(), 0xAB);
      }

      heap.free(moved);
    }
  }

  #[test]
  fn realloc_null_and_zero_size_aliases() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      // realloc(null, n) is alloc(n).
      let ptr = heap.realloc(ptr::null_mut(), 128);
      assert!(!ptr.is_null());
      let used_before = heap.stats().used;

      // realloc(p, 0) is free(p).
      assert!(heap.realloc(ptr, 0).is_null());
      assert!(heap.stats().used < used_before);

      // A stale pointer is rejected without touching the heap.
      assert!(heap.realloc(ptr, 64).is_null());
    }
  }

  #[test]
  fn misuse_is_tolerated() {
    let _guard = serialize();
    let mut heap = Heap::new();

    unsafe {
      heap.free(ptr::null_mut());

      let ptr = heap.alloc(100);
      assert!(!ptr.is_null());

      // An interior pointer has no magic word behind it.
      heap.free(ptr.add(16));
      ptr::write_bytes(ptr, 0x77, 100);

      heap.free(ptr);
      // Double free
      heap.free(ptr);

      // The allocator keeps working afterwards.
      let again = heap.alloc(100);
      assert_eq!(again, ptr);
    }
  }

  #[test]
  fn global_api_is_thread_safe() {
    let _guard = serialize();

    let handles: Vec<_> = (0..4)
      .map(|thread_id: usize| {
        thread::spawn(move || unsafe {
          for round in 0..50 {
            let size = 32 + (thread_id * 64 + round * 16) % 5000;
            let ptr = alloc(size);
            assert!(!ptr.is_null());

            ptr::write_bytes(ptr, thread_id as u8, size);
            for i in [0, size / 2, size - 1] {
              assert_eq!(ptr.add(i).read(), thread_id as u8);
            }

            if round % 3 == 0 {
              let bigger = realloc(ptr, size * 2);
              assert!(!bigger.is_null());
              assert_eq!(bigger.read(), thread_id as u8);
              free(bigger);
            } else {
              free(ptr);
            }
          }
        })
      })
      .collect();

    for handle in handles {
      handle.join().expect("allocator thread panicked");
    }
  }
}
