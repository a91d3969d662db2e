//! Block metadata layout.
//!
//! Every allocation is tracked by a [`Block`] header placed directly before
//! the user payload and a [`Footer`] placed directly after it:
//!
//! ```text
//!   ┌──────────────────┬─────────────────────────┬────────────┐
//!   │   Block Header   │      User Payload       │   Footer   │
//!   │ size, magic,     │                         │ size (copy │
//!   │ free, is_mmap,   │   [  size bytes  ]      │ of header) │
//!   │ next, prev       │                         │            │
//!   └──────────────────┴─────────────────────────┴────────────┘
//!                      ▲
//!                      └── Pointer returned to the user
//! ```
//!
//! The `magic` field doubles as a state tag and a corruption canary: it is
//! [`ALLOC_MAGIC`] while the block is in use and [`FREED_MAGIC`] after it
//! has been freed. Any other value means the header has been overwritten.

use std::mem;

use crate::align::ALIGNMENT;

/// Magic word stamped into the header of every live allocation.
pub const ALLOC_MAGIC: usize = 0xBADC0DEDEAD1234;

/// Magic word stamped into the header of every freed block.
pub const FREED_MAGIC: usize = 0xDEADBEEFDEADBEEF;

/// Aligned payload sizes at or above this go to the page-mapping path
/// instead of the break path.
pub const MMAP_THRESHOLD: usize = 4096;

/// Size of the [`Block`] header, in bytes.
pub const HEADER_SIZE: usize = mem::size_of::<Block>();

/// Size of the [`Footer`], in bytes.
pub const FOOTER_SIZE: usize = mem::size_of::<Footer>();

/// Smallest block that can stand alone in the list. A split that would
/// leave a remainder below this must not happen.
pub const MIN_BLOCK_SIZE: usize = crate::align!(HEADER_SIZE + FOOTER_SIZE + ALIGNMENT);

/// Per-allocation header. Lives in raw heap memory directly before the
/// payload, which is why the layout is `repr(C)`.
#[repr(C)]
pub struct Block {
  /// Payload size in bytes. Excludes header and footer.
  pub size: usize,
  /// [`ALLOC_MAGIC`] or [`FREED_MAGIC`]; anything else is corruption.
  pub magic: usize,
  /// Must agree with `magic`.
  pub free: bool,
  /// True iff the block came from `mmap` rather than the break region.
  pub is_mmap: bool,
  /// Next block in the global address-ordered list.
  pub next: *mut Block,
  /// Previous block in the global address-ordered list.
  pub prev: *mut Block,
}

/// Trailing copy of the payload size, written immediately after the
/// payload. Kept to preserve the boundary-tag layout; coalescing itself
/// walks the `prev` link.
#[repr(C)]
pub struct Footer {
  pub size: usize,
}

impl Block {
  /// Pointer to the payload that follows this header.
  ///
  /// # Safety
  ///
  /// `block` must point to a live block header.
  pub unsafe fn payload(block: *mut Block) -> *mut u8 {
    unsafe { (block as *mut u8).add(HEADER_SIZE) }
  }

  /// Recovers the header from a payload pointer handed out by the
  /// allocator.
  ///
  /// # Safety
  ///
  /// `ptr` must be a pointer previously returned by the allocator; the
  /// header is read from the bytes directly before it.
  pub unsafe fn from_payload(ptr: *mut u8) -> *mut Block {
    unsafe { ptr.sub(HEADER_SIZE) as *mut Block }
  }

  /// The footer sits immediately after `size` payload bytes.
  ///
  /// # Safety
  ///
  /// `block` must point to a live block header with a valid `size`.
  pub unsafe fn footer(block: *mut Block) -> *mut Footer {
    unsafe { (block as *mut u8).add(HEADER_SIZE + (*block).size) as *mut Footer }
  }

  /// Rewrites the footer copy of the payload size. Called after every
  /// operation that changes `size`.
  ///
  /// # Safety
  ///
  /// `block` must point to a live block header whose `size` bytes of
  /// payload plus footer are mapped.
  pub unsafe fn write_footer(block: *mut Block) {
    unsafe {
      (*Block::footer(block)).size = (*block).size;
    }
  }

  /// Whether the header carries one of the two magic sentinels.
  ///
  /// # Safety
  ///
  /// `block` must point to readable memory of at least header size.
  pub unsafe fn has_valid_magic(block: *mut Block) -> bool {
    unsafe { (*block).magic == ALLOC_MAGIC || (*block).magic == FREED_MAGIC }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn min_block_size_is_aligned_and_holds_metadata() {
    assert_eq!(MIN_BLOCK_SIZE % ALIGNMENT, 0);
    assert!(MIN_BLOCK_SIZE >= HEADER_SIZE + FOOTER_SIZE + ALIGNMENT);
  }

  #[test]
  fn payload_and_from_payload_are_inverses() {
    // usize storage so the cast pointer is suitably aligned for Block
    let mut storage = [0usize; 32];
    let block = storage.as_mut_ptr() as *mut Block;

    unsafe {
      let payload = Block::payload(block);
      assert_eq!(payload as usize - block as usize, HEADER_SIZE);
      assert_eq!(Block::from_payload(payload), block);
    }
  }

  #[test]
  fn footer_follows_payload() {
    let mut storage = [0usize; 32];
    let block = storage.as_mut_ptr() as *mut Block;

    unsafe {
      (*block).size = 64;
      Block::write_footer(block);

      let footer = Block::footer(block);
      assert_eq!(footer as usize - block as usize, HEADER_SIZE + 64);
      assert_eq!((*footer).size, 64);
    }
  }
}
