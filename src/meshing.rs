//! Mesh candidate search.
//!
//! Two miniheaps of the same size class can be fused when their occupancy
//! bitmaps are disjoint: every live object of one fits into a free slot of
//! the other at the same index. The search is probabilistic (shuffle the
//! candidates, test adjacent pairs, take the first hits), which is enough
//! to approximate the provable compaction bound without hunting for a
//! global optimum.

use std::ptr::NonNull;

use crate::bitmap::AtomicBitmap;
use crate::miniheap::{MAX_MESHES, MiniHeap};
use crate::rng::Rng;

/// Word-wide disjointness: no slot is occupied in both maps.
pub fn bitmaps_disjoint(a: &AtomicBitmap, b: &AtomicBitmap) -> bool {
  debug_assert_eq!(a.word_len(), b.word_len());
  (0..a.word_len()).all(|item| a.word(item) & b.word(item) == 0)
}

fn meshable(a: &MiniHeap, b: &MiniHeap) -> bool {
  a.is_done()
    && b.is_done()
    && a.mesh_count() + b.mesh_count() <= MAX_MESHES
    && bitmaps_disjoint(a.bitmap(), b.bitmap())
}

/// Shuffled pair search over one size class. Candidates arrive in list
/// order with the class's current slab at the tail; if that slab is not
/// yet done it is excluded up front. The walk visits adjacent positions of
/// the shuffled copy and emits each disjoint done pair as `(dst, src)`,
/// claiming both so one descriptor can never be emitted twice in a pass.
///
/// # Safety
/// Every pointer must reference a live descriptor, and the caller must hold
/// the global heap's exclusive lock so occupancy bitmaps cannot change
/// under the disjointness test.
pub unsafe fn random_sort(
  rng: &mut Rng,
  heaps: &[NonNull<MiniHeap>],
  mut on_found: impl FnMut(NonNull<MiniHeap>, NonNull<MiniHeap>),
) {
  let mut candidates: Vec<NonNull<MiniHeap>> = heaps.to_vec();
  if let Some(last) = candidates.last()
    && !unsafe { last.as_ref() }.is_done()
  {
    candidates.pop();
  }
  if candidates.len() < 2 {
    return;
  }

  rng.shuffle(&mut candidates);

  let mut claimed = vec![false; candidates.len()];
  for i in 0..candidates.len() - 1 {
    if claimed[i] || claimed[i + 1] {
      continue;
    }
    let (h1, h2) = (candidates[i], candidates[i + 1]);
    if unsafe { meshable(h1.as_ref(), h2.as_ref()) } {
      claimed[i] = true;
      claimed[i + 1] = true;
      on_found(h1, h2);
    }
  }
}

/// Deterministic pairing of `(2i, 2i+1)`. Strictly weaker than
/// [`random_sort`]; kept for tests that need reproducible pairs.
///
/// # Safety
/// Same contract as [`random_sort`].
pub unsafe fn simple(
  heaps: &[NonNull<MiniHeap>],
  mut on_found: impl FnMut(NonNull<MiniHeap>, NonNull<MiniHeap>),
) {
  for pair in heaps.chunks_exact(2) {
    let (h1, h2) = (pair[0], pair[1]);
    if unsafe { meshable(h1.as_ref(), h2.as_ref()) } {
      on_found(h1, h2);
    }
  }
}
