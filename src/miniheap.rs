//! MiniHeap: a fixed-capacity slab over one or more spans.
//!
//! One miniheap serves exactly one size class. Occupancy lives in an atomic
//! bitmap, bit `i` set meaning slot `i` is allocated, so the free path can
//! clear bits without any lock. After meshing, a miniheap references
//! several virtual spans that all alias one physical span; slot `i` sits at
//! the same offset in every one of them, and the single bitmap keeps
//! addressing logical slots.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bitmap::AtomicBitmap;
use crate::rng::Rng;

/// Most virtual spans one descriptor can reference (1 primary + 7 meshed).
pub const MAX_MESHES: usize = 8;

/// Per-object user-bit planes exposed through the side-channel API.
pub const USER_BIT_KINDS: usize = 4;

pub struct MiniHeap {
  object_size: usize,
  object_count: usize,
  span_size: usize,
  /// Span start addresses; `[0]` is the primary span, the rest arrive via
  /// meshing. Only the first `span_count` entries are meaningful.
  spans: [usize; MAX_MESHES],
  span_count: usize,
  bitmap: AtomicBitmap,
  /// Side metadata for the user-bit API, one plane per bit kind.
  user_bits: [AtomicBitmap; USER_BIT_KINDS],
  /// Set once the slab has handed out its full capacity; only done
  /// miniheaps are mesh candidates.
  done: AtomicBool,
  /// Seed for freelist shuffling in the consuming cache.
  seed: u64,
  pub(crate) prev: Option<NonNull<MiniHeap>>,
  pub(crate) next: Option<NonNull<MiniHeap>>,
}

// Descriptors are shared across threads behind the global heap's RW lock;
// the occupancy bitmap is the only concurrently-mutated field and it is
// atomic. The intrusive links are touched only under the exclusive lock.
unsafe impl Send for MiniHeap {}
unsafe impl Sync for MiniHeap {}

impl MiniHeap {
  pub fn new(
    span_start: usize,
    span_size: usize,
    object_size: usize,
    object_count: usize,
    rng: &mut Rng,
  ) -> Self {
    debug_assert!(object_count * object_size <= span_size);
    let mut spans = [0usize; MAX_MESHES];
    spans[0] = span_start;
    Self {
      object_size,
      object_count,
      span_size,
      spans,
      span_count: 1,
      bitmap: AtomicBitmap::new(object_count),
      user_bits: [
        AtomicBitmap::new(object_count),
        AtomicBitmap::new(object_count),
        AtomicBitmap::new(object_count),
        AtomicBitmap::new(object_count),
      ],
      done: AtomicBool::new(false),
      seed: rng.next_u64(),
      prev: None,
      next: None,
    }
  }

  /// Claims slot `slot` and returns its address in the primary span, or
  /// None if the slot is already taken. The meshing path uses this to place
  /// copied objects at predetermined slots.
  pub fn malloc_at(&self, slot: usize) -> Option<NonNull<u8>> {
    debug_assert!(slot < self.object_count);
    if !self.bitmap.try_set(slot) {
      return None;
    }
    NonNull::new((self.spans[0] + slot * self.object_size) as *mut u8)
  }

  /// Claims the lowest free slot. None once the slab is exhausted. The
  /// caller serialises this against other allocators into the same
  /// miniheap (the global heap's lock does). Flips *done* the first time
  /// occupancy reaches capacity.
  pub fn alloc_slot(&self) -> Option<NonNull<u8>> {
    if self.bitmap.in_use_count() >= self.object_count {
      self.set_done();
      return None;
    }
    let slot = self.bitmap.set_first_empty(0);
    if self.bitmap.in_use_count() == self.object_count {
      self.set_done();
    }
    NonNull::new((self.spans[0] + slot * self.object_size) as *mut u8)
  }

  /// Clears the slot owning `ptr`. A pointer outside every owned span is a
  /// caller bug. Double frees are not detected; clearing a clear bit is a
  /// no-op transition.
  pub fn free(&self, ptr: *mut u8) {
    let Some(offset) = self.span_offset(ptr) else {
      debug_assert!(false, "free of pointer not owned by this miniheap");
      return;
    };
    let slot = offset / self.object_size;
    self.bitmap.unset(slot);
  }

  /// Byte offset of `ptr` within whichever owned span contains it.
  fn span_offset(&self, ptr: *const u8) -> Option<usize> {
    let addr = ptr as usize;
    self
      .spans[..self.span_count]
      .iter()
      .find(|start| addr >= **start && addr < **start + self.span_size)
      .map(|start| addr - start)
  }

  pub fn contains(&self, ptr: *const u8) -> bool {
    self.span_offset(ptr).is_some()
  }

  /// Logical slot of `ptr`, for the user-bit side channel. Mid-object
  /// pointers resolve to their slot.
  pub fn slot_of(&self, ptr: *const u8) -> Option<usize> {
    self.span_offset(ptr).map(|offset| offset / self.object_size)
  }

  #[inline]
  pub fn in_use_count(&self) -> usize {
    self.bitmap.in_use_count()
  }

  #[inline]
  pub fn object_size(&self) -> usize {
    self.object_size
  }

  #[inline]
  pub fn object_count(&self) -> usize {
    self.object_count
  }

  #[inline]
  pub fn span_start(&self) -> usize {
    self.spans[0]
  }

  #[inline]
  pub fn span_size(&self) -> usize {
    self.span_size
  }

  #[inline]
  pub fn spans(&self) -> &[usize] {
    &self.spans[..self.span_count]
  }

  #[inline]
  pub fn mesh_count(&self) -> usize {
    self.span_count
  }

  #[inline]
  pub fn bitmap(&self) -> &AtomicBitmap {
    &self.bitmap
  }

  #[inline]
  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::Acquire)
  }

  /// Marks the slab done: it has handed out its initial capacity and is
  /// now a mesh candidate. Called by the retiring cache, or internally
  /// when the direct path fills the slab.
  #[inline]
  pub fn set_done(&self) {
    self.done.store(true, Ordering::Release);
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.bitmap.in_use_count() == 0
  }

  /// Appends a meshed span. Meshing path only, under the exclusive lock.
  pub fn meshed_span(&mut self, span_start: usize) {
    assert!(self.span_count < MAX_MESHES, "mesh span capacity exceeded");
    self.spans[self.span_count] = span_start;
    self.span_count += 1;
  }

  /// Seed for the consuming cache's freelist shuffle.
  #[inline]
  pub fn shuffle_seed(&self) -> u64 {
    self.seed
  }

  /// Free slots in a Fisher-Yates permutation: the randomized freelist a
  /// thread cache walks.
  pub fn shuffled_free_slots(&self, rng: &mut Rng) -> Vec<usize> {
    let mut slots: Vec<usize> = (0..self.object_count)
      .filter(|slot| !self.bitmap.is_set(*slot))
      .collect();
    rng.shuffle(&mut slots);
    slots
  }

  /// Reads user bit `kind` for `slot`.
  pub fn bit_get(&self, kind: usize, slot: usize) -> bool {
    self.user_bits[kind].is_set(slot)
  }

  /// Sets user bit `kind` for `slot`; returns the previous value.
  pub fn bit_set(&self, kind: usize, slot: usize) -> bool {
    !self.user_bits[kind].try_set(slot)
  }

  /// Clears user bit `kind` for `slot`; returns the previous value.
  pub fn bit_clear(&self, kind: usize, slot: usize) -> bool {
    !self.user_bits[kind].unset(slot)
  }
}

/// Intrusive doubly-linked list of miniheap descriptors: O(1) push and
/// unlink, iteration in insertion order (newest at the tail, which is where
/// the class's current slab sits). Node ordering carries no meaning beyond
/// that.
pub struct MiniHeapList {
  head: Option<NonNull<MiniHeap>>,
  tail: Option<NonNull<MiniHeap>>,
  len: usize,
}

impl MiniHeapList {
  pub const fn new() -> Self {
    Self {
      head: None,
      tail: None,
      len: 0,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Appends `mh`. The descriptor must not be on any list.
  ///
  /// # Safety
  /// `mh` must be a valid descriptor that outlives its list membership.
  pub unsafe fn push_back(&mut self, mut mh: NonNull<MiniHeap>) {
    unsafe {
      debug_assert!(mh.as_ref().prev.is_none() && mh.as_ref().next.is_none());
      mh.as_mut().prev = self.tail;
      mh.as_mut().next = None;
      match self.tail {
        Some(mut tail) => tail.as_mut().next = Some(mh),
        None => self.head = Some(mh),
      }
      self.tail = Some(mh);
      self.len += 1;
    }
  }

  /// Unlinks `mh` in O(1).
  ///
  /// # Safety
  /// `mh` must currently be linked on this list.
  pub unsafe fn unlink(&mut self, mut mh: NonNull<MiniHeap>) {
    unsafe {
      let prev = mh.as_ref().prev;
      let next = mh.as_ref().next;
      match prev {
        Some(mut p) => p.as_mut().next = next,
        None => self.head = next,
      }
      match next {
        Some(mut n) => n.as_mut().prev = prev,
        None => self.tail = prev,
      }
      mh.as_mut().prev = None;
      mh.as_mut().next = None;
      self.len -= 1;
    }
  }

  /// Descriptors in insertion order.
  pub fn iter(&self) -> MiniHeapIter {
    MiniHeapIter {
      current: self.head,
      remaining: self.len,
    }
  }
}

pub struct MiniHeapIter {
  current: Option<NonNull<MiniHeap>>,
  remaining: usize,
}

impl Iterator for MiniHeapIter {
  type Item = NonNull<MiniHeap>;

  fn next(&mut self) -> Option<NonNull<MiniHeap>> {
    let node = self.current?;
    self.current = unsafe { node.as_ref().next };
    self.remaining -= 1;
    Some(node)
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    (self.remaining, Some(self.remaining))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_heap(span_start: usize, objects: usize, object_size: usize) -> MiniHeap {
    let mut rng = Rng::with_seed(99);
    MiniHeap::new(span_start, objects * object_size, object_size, objects, &mut rng)
  }

  #[test]
  fn malloc_at_claims_exact_slot() {
    let mh = test_heap(0x10000, 8, 16);
    let ptr = mh.malloc_at(3).unwrap();
    assert_eq!(ptr.as_ptr() as usize, 0x10000 + 3 * 16);
    assert!(mh.malloc_at(3).is_none());
    assert_eq!(mh.in_use_count(), 1);
  }

  #[test]
  fn alloc_slot_fills_and_marks_done() {
    let mh = test_heap(0x20000, 4, 16);
    for slot in 0..4 {
      let ptr = mh.alloc_slot().unwrap();
      assert_eq!(ptr.as_ptr() as usize, 0x20000 + slot * 16);
    }
    assert!(mh.is_done());
    assert!(mh.alloc_slot().is_none());
  }

  #[test]
  fn free_clears_the_owning_slot() {
    let mh = test_heap(0x30000, 8, 32);
    let ptr = mh.malloc_at(5).unwrap();
    assert!(!mh.is_empty());
    mh.free(ptr.as_ptr());
    assert!(mh.is_empty());
    // Mid-object pointers resolve to the same slot.
    let ptr = mh.malloc_at(2).unwrap();
    mh.free(unsafe { ptr.as_ptr().add(16) });
    assert!(mh.is_empty());
  }

  #[test]
  fn contains_covers_meshed_spans() {
    let mut mh = test_heap(0x40000, 8, 16);
    assert!(mh.contains(0x40000 as *const u8));
    assert!(!mh.contains(0x50000 as *const u8));

    mh.meshed_span(0x50000);
    assert!(mh.contains(0x50000 as *const u8));
    assert_eq!(mh.mesh_count(), 2);
    assert_eq!(mh.spans(), &[0x40000, 0x50000]);

    // A slot freed through the meshed alias clears the same bit.
    mh.malloc_at(1).unwrap();
    mh.free((0x50000 + 16) as *mut u8);
    assert!(mh.is_empty());
  }

  #[test]
  fn shuffled_free_slots_is_a_permutation_of_clear_bits() {
    let mh = test_heap(0x60000, 16, 16);
    mh.malloc_at(0).unwrap();
    mh.malloc_at(7).unwrap();
    let mut rng = Rng::with_seed(5);
    let mut slots = mh.shuffled_free_slots(&mut rng);
    slots.sort_unstable();
    let expected: Vec<usize> = (0..16).filter(|s| *s != 0 && *s != 7).collect();
    assert_eq!(slots, expected);
  }

  #[test]
  fn user_bits_report_previous_value() {
    let mh = test_heap(0x70000, 8, 16);
    assert!(!mh.bit_set(1, 3));
    assert!(mh.bit_set(1, 3));
    assert!(mh.bit_get(1, 3));
    assert!(!mh.bit_get(0, 3));
    assert!(mh.bit_clear(1, 3));
    assert!(!mh.bit_clear(1, 3));
  }

  #[test]
  fn list_push_unlink_iterate() {
    let mut a = test_heap(0x1000, 4, 16);
    let mut b = test_heap(0x2000, 4, 16);
    let mut c = test_heap(0x3000, 4, 16);
    let (pa, pb, pc) = (
      NonNull::from(&mut a),
      NonNull::from(&mut b),
      NonNull::from(&mut c),
    );

    let mut list = MiniHeapList::new();
    unsafe {
      list.push_back(pa);
      list.push_back(pb);
      list.push_back(pc);
    }
    assert_eq!(list.len(), 3);
    let starts: Vec<usize> = list
      .iter()
      .map(|mh| unsafe { mh.as_ref() }.span_start())
      .collect();
    assert_eq!(starts, vec![0x1000, 0x2000, 0x3000]);

    unsafe { list.unlink(pb) };
    assert_eq!(list.len(), 2);
    let starts: Vec<usize> = list
      .iter()
      .map(|mh| unsafe { mh.as_ref() }.span_start())
      .collect();
    assert_eq!(starts, vec![0x1000, 0x3000]);

    unsafe {
      list.unlink(pa);
      list.unlink(pc);
    }
    assert!(list.is_empty());
  }
}
