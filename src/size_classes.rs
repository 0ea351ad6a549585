//! Power-of-two size classes for small objects.
//!
//! Class `i` covers sizes up to `2^(i + 4)`: 16 B for class 0 through 16 KiB
//! for the last class. Anything above [`MAX_OBJECT_SIZE`] bypasses the
//! miniheaps and goes to the big heap.

/// OS page size. Spans are carved out of the arena in whole pages.
pub const PAGE_SIZE: usize = 4096;

/// Smallest allocatable object; equals the platform's max scalar alignment.
pub const MIN_OBJECT_SIZE: usize = 16;

const MIN_OBJECT_SHIFT: usize = MIN_OBJECT_SIZE.trailing_zeros() as usize;

/// Largest object served from a miniheap.
pub const MAX_OBJECT_SIZE: usize = 16 * 1024;

/// Number of size classes: 16, 32, ..., 16384.
pub const NUM_BINS: usize = MAX_OBJECT_SIZE.trailing_zeros() as usize - MIN_OBJECT_SHIFT + 1;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MIN_OBJECT_SIZE.is_power_of_two());
const _: () = assert!(MAX_OBJECT_SIZE.is_power_of_two());
const _: () = assert!(NUM_BINS == 11);
const _: () = assert!(byte_size_for_class(0) == MIN_OBJECT_SIZE);
const _: () = assert!(byte_size_for_class(NUM_BINS - 1) == MAX_OBJECT_SIZE);

/// Max object size for a class (inverse of [`class_of`]).
#[inline(always)]
pub const fn byte_size_for_class(class: usize) -> usize {
  1 << (class + MIN_OBJECT_SHIFT)
}

/// Size class serving `size` bytes. Sizes below the minimum round up to
/// class 0; callers must keep `size <= MAX_OBJECT_SIZE`.
#[inline(always)]
pub const fn class_of(size: usize) -> usize {
  let size = if size < MIN_OBJECT_SIZE { MIN_OBJECT_SIZE } else { size };
  size.next_power_of_two().trailing_zeros() as usize - MIN_OBJECT_SHIFT
}

/// Pages needed to hold `bytes`.
#[inline(always)]
pub const fn page_count(bytes: usize) -> usize {
  bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roundtrips() {
    for n in [16usize, 32, 64, 4096, 16384] {
      assert_eq!(byte_size_for_class(class_of(n)), n);
    }
  }

  #[test]
  fn min_object_size_is_alignment() {
    assert_eq!(MIN_OBJECT_SIZE, align_of::<libc::max_align_t>());
    assert_eq!(class_of(0), 0);
    assert_eq!(class_of(1), 0);
    assert_eq!(class_of(16), 0);
    assert_eq!(class_of(17), 1);
  }

  #[test]
  fn rounds_up_to_next_power_of_two() {
    assert_eq!(byte_size_for_class(class_of(33)), 64);
    assert_eq!(byte_size_for_class(class_of(4097)), 8192);
    assert_eq!(class_of(MAX_OBJECT_SIZE), NUM_BINS - 1);
  }

  #[test]
  fn page_counts() {
    assert_eq!(page_count(1), 1);
    assert_eq!(page_count(PAGE_SIZE), 1);
    assert_eq!(page_count(PAGE_SIZE + 1), 2);
    // 8 objects of the largest class span 32 pages.
    assert_eq!(page_count(MAX_OBJECT_SIZE * 8), 32);
  }
}
