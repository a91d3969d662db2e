use std::io::Read;

use fitalloc::{alloc, free, print_stats, realloc, zalloc};
use libc::sbrk;

/// Waits until the user presses ENTER.
/// Useful when you want to inspect memory state with tools like `pmap`,
/// `htop`, `gdb`, or just visually track how allocations change the
/// program break.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the current program break using `sbrk(0)`.
/// The program break is the upper boundary of the heap managed via
/// brk/sbrk; mmap-backed allocations do not move it.
unsafe fn print_program_break(label: &str) {
  println!(
    "[{}] PID = {}, program break (sbrk(0)) = {:?}",
    label,
    std::process::id(),
    unsafe { sbrk(0) },
  );
}

fn main() {
  unsafe {
    // Initial heap state
    print_program_break("start");
    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 1) Allocate 100 bytes. The break grows by a whole page; the rest of
    //    the page stays inside the block for later splitting.
    // --------------------------------------------------------------------
    let first = alloc(100);
    println!("\n[1] alloc(100) = {:?}", first);
    print_program_break("after small alloc");
    print_stats();

    first.write(0xDE);
    println!("[1] Value written to first byte = 0x{:X}", first.read());

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 2) Allocate 4097 bytes. This crosses the mmap threshold: the break
    //    does not move, the block gets a mapping of its own.
    // --------------------------------------------------------------------
    let large = alloc(4097);
    println!("\n[2] alloc(4097) = {:?} (mmap path)", large);
    print_program_break("after large alloc");
    print_stats();

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 3) Zeroed array allocation.
    // --------------------------------------------------------------------
    let zeroed = zalloc(16, 8);
    println!("\n[3] zalloc(16, 8) = {:?}", zeroed);
    println!(
      "[3] First byte = {} (zalloc guarantees zeroed payloads)",
      zeroed.read()
    );
    print_stats();

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 4) Free the first block, then allocate a smaller one. Best fit
    //    reuses the freed block instead of growing the heap.
    // --------------------------------------------------------------------
    free(first);
    println!("\n[4] Freed first block at {:?}", first);

    let reused = alloc(50);
    println!("[4] alloc(50) = {:?}", reused);
    println!(
      "[4] reused == first? {}",
      if reused == first {
        "Yes, it reused the freed block"
      } else {
        "No, it allocated somewhere else"
      }
    );
    print_stats();

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 5) Grow the reused block in place: the free tail of its page is
    //    absorbed instead of copying to a new block.
    // --------------------------------------------------------------------
    let grown = realloc(reused, 600);
    println!("\n[5] realloc({:?}, 600) = {:?}", reused, grown);
    println!(
      "[5] grown == reused? {}",
      if grown == reused { "Yes, grown in place" } else { "No, moved" }
    );

    block_until_enter_pressed();

    // --------------------------------------------------------------------
    // 6) Release everything. The mmap block is unmapped immediately; the
    //    break blocks coalesce and wait for reuse.
    // --------------------------------------------------------------------
    free(grown);
    free(large);
    free(zeroed);
    println!("\n[6] Freed all blocks");
    print_stats();
    print_program_break("end");

    println!("\n[7] End of demo. The break region is reclaimed at process exit.");
  }
}
