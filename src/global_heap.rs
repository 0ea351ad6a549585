//! The global heap: arena + per-class miniheap lists + pointer lookup.
//!
//! Small allocations are served from per-class miniheaps; everything above
//! the largest size class goes to the big heap behind its own mutex. All
//! miniheap bookkeeping (the per-class lists, the span-to-descriptor
//! index, the PRNG, the mesh cadence counter) sits behind one reader/writer
//! lock: pointer resolution takes it shared, miniheap lifecycle and
//! meshing take it exclusive. Freed objects themselves only touch the
//! owning miniheap's atomic bitmap.

use std::collections::BTreeMap;
use std::ptr::{self, NonNull, null_mut};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::arena::Arena;
use crate::big_heap::BigHeap;
use crate::fatal;
use crate::meshing;
use crate::miniheap::{MAX_MESHES, MiniHeap, MiniHeapList, USER_BIT_KINDS};
use crate::rng::Rng;
use crate::size_classes::{
  MAX_OBJECT_SIZE, NUM_BINS, PAGE_SIZE, byte_size_for_class, class_of, page_count,
};

/// Sentinel pointer: freeing it runs a diagnostic mesh burst instead of a
/// deallocation. The address sits below the lowest address the OS will ever
/// hand out, so it can't collide with a real allocation.
pub const MESH_MARKER: *mut u8 = PAGE_SIZE as *mut u8;

/// Full mesh passes run when the marker is freed.
const MARKER_BURST_PASSES: usize = 16;

/// Stop-the-world collaborator. The contract: when `stop_the_world`
/// returns, no mutator thread is running allocator or user code that could
/// touch heap memory; `start_the_world` resumes them. The heap never
/// allocates or takes user locks between the two calls.
pub trait WorldStopper: Send + Sync {
  fn stop_the_world(&self);
  fn start_the_world(&self);
}

/// Default collaborator for single-threaded use and tests: nothing to stop.
pub struct NopWorld;

impl WorldStopper for NopWorld {
  fn stop_the_world(&self) {}
  fn start_the_world(&self) {}
}

/// Runtime configuration. The class geometry stays compile-time; the knobs
/// that tune behavior rather than layout live here.
pub struct HeapOptions {
  /// Meshing runs on average once per this many qualifying frees.
  pub mesh_period: usize,
  /// Floor on objects per fresh span, so large classes still amortize the
  /// cost of taking the heap lock.
  pub min_objects_per_span: usize,
  pub world: Box<dyn WorldStopper>,
}

impl Default for HeapOptions {
  fn default() -> Self {
    Self {
      mesh_period: 1000,
      min_objects_per_span: 8,
      world: Box::new(NopWorld),
    }
  }
}

/// Errors from the mallctl namespace.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum CtlError {
  #[error("unknown mallctl name: {0}")]
  UnknownName(String),
  #[error("mallctl entry is read-only")]
  ReadOnly,
  #[error("mallctl value out of range")]
  InvalidValue,
}

#[derive(Default)]
struct HeapStats {
  mesh_count: AtomicUsize,
  mh_alloc_count: AtomicUsize,
  mh_free_count: AtomicUsize,
  mh_high_water_mark: AtomicUsize,
  mh_class_hwm: [AtomicUsize; NUM_BINS],
}

struct SmallHeapState {
  littleheaps: [MiniHeapList; NUM_BINS],
  littleheap_counts: [usize; NUM_BINS],
  /// Slab each class is currently allocating from.
  current: [Option<NonNull<MiniHeap>>; NUM_BINS],
  /// Span start address to owning descriptor. Greatest-lower-bound lookups
  /// resolve arbitrary interior pointers; after a mesh several keys map to
  /// one descriptor.
  by_span: BTreeMap<usize, NonNull<MiniHeap>>,
  rng: Rng,
}

// Raw descriptor pointers are only dereferenced under this lock (shared
// for reads, exclusive for lifecycle), so the state is safe to share.
unsafe impl Send for SmallHeapState {}
unsafe impl Sync for SmallHeapState {}

pub struct GlobalHeap {
  arena: Arena,
  small: RwLock<SmallHeapState>,
  big: Mutex<BigHeap>,
  stats: HeapStats,
  /// Writable through mallctl, hence outside the lock.
  mesh_period: AtomicUsize,
  /// Frees until the next mesh pass; redrawn uniformly from
  /// `[1, mesh_period]` each time it hits zero.
  next_mesh_check: AtomicUsize,
  min_objects_per_span: usize,
  world: Box<dyn WorldStopper>,
}

impl GlobalHeap {
  pub fn new(options: HeapOptions) -> Self {
    let mesh_period = options.mesh_period.max(1);
    let mut rng = Rng::from_entropy();
    let first_check = rng.one_to(mesh_period as u64) as usize;

    Self {
      arena: Arena::new(),
      small: RwLock::new(SmallHeapState {
        littleheaps: [const { MiniHeapList::new() }; NUM_BINS],
        littleheap_counts: [0; NUM_BINS],
        current: [None; NUM_BINS],
        by_span: BTreeMap::new(),
        rng,
      }),
      big: Mutex::new(BigHeap::new()),
      stats: HeapStats::default(),
      mesh_period: AtomicUsize::new(mesh_period),
      next_mesh_check: AtomicUsize::new(first_check),
      min_objects_per_span: options.min_objects_per_span.max(1),
      world: options.world,
    }
  }

  #[inline]
  pub fn arena(&self) -> &Arena {
    &self.arena
  }

  /// Base of the arena reservation, for caches doing their own
  /// pointer-to-page arithmetic.
  #[inline]
  pub fn arena_begin(&self) -> *mut u8 {
    self.arena.arena_begin()
  }

  #[inline]
  pub fn max_object_size(&self) -> usize {
    MAX_OBJECT_SIZE
  }

  /// Builds a fresh miniheap for `object_size` and makes it visible to
  /// pointer lookup. This is the refill interface a thread-local cache
  /// calls; the direct small path below uses it too. None when the span
  /// can't be committed.
  pub fn alloc_miniheap(&self, object_size: usize) -> Option<NonNull<MiniHeap>> {
    debug_assert!(object_size <= MAX_OBJECT_SIZE);
    let mut state = self.small.write();
    self.alloc_miniheap_locked(&mut state, class_of(object_size))
  }

  fn alloc_miniheap_locked(
    &self,
    state: &mut SmallHeapState,
    size_class: usize,
  ) -> Option<NonNull<MiniHeap>> {
    let size_max = byte_size_for_class(size_class);

    // Objects bigger than a page get multiple pages per span so one lock
    // acquisition hands out several objects.
    let n_objects = (PAGE_SIZE / size_max).max(self.min_objects_per_span);
    let n_pages = page_count(size_max * n_objects);

    let span_page = self.arena.alloc_span(n_pages)?;
    let span_start = self.arena.span_address(span_page) as usize;

    let mh = Box::new(MiniHeap::new(
      span_start,
      n_pages * PAGE_SIZE,
      size_max,
      n_objects,
      &mut state.rng,
    ));
    let mh = unsafe { NonNull::new_unchecked(Box::into_raw(mh)) };

    unsafe { state.littleheaps[size_class].push_back(mh) };
    state.littleheap_counts[size_class] += 1;
    state.by_span.insert(span_start, mh);

    self.stats.mh_alloc_count.fetch_add(1, Ordering::Relaxed);
    self
      .stats
      .mh_high_water_mark
      .fetch_max(state.by_span.len(), Ordering::Relaxed);
    self.stats.mh_class_hwm[size_class]
      .fetch_max(state.littleheap_counts[size_class], Ordering::Relaxed);

    log::trace!(
      "miniheap: class {size_class} ({size_max}B x {n_objects}) on {n_pages}p span @ {span_start:#x}"
    );
    Some(mh)
  }

  /// Resolves an arbitrary pointer to its owning miniheap: greatest lower
  /// bound over span starts, then an ownership check.
  pub fn miniheap_for(&self, ptr: *const u8) -> Option<NonNull<MiniHeap>> {
    let state = self.small.read();
    Self::miniheap_for_locked(&state, ptr)
  }

  fn miniheap_for_locked(state: &SmallHeapState, ptr: *const u8) -> Option<NonNull<MiniHeap>> {
    let addr = ptr as usize;
    let (_, mh) = state.by_span.range(..=addr).next_back()?;
    unsafe { mh.as_ref() }.contains(ptr).then_some(*mh)
  }

  /// Allocates `size` bytes: miniheaps for small sizes, big heap above the
  /// largest class. Null on OOM. `malloc(0)` returns a minimum-class
  /// object.
  pub fn malloc(&self, size: usize) -> *mut u8 {
    if size > MAX_OBJECT_SIZE {
      return self.big.lock().malloc(size);
    }
    self.small_alloc(class_of(size))
  }

  /// Aligned allocation. `alignment` must be a power of two no larger than
  /// a page. Small sizes come from the smallest class that is both large
  /// enough and a multiple of the alignment; with power-of-two classes on
  /// page-aligned spans that is the class of `max(size, alignment)`. Big
  /// allocations are page-aligned already.
  pub fn memalign(&self, alignment: usize, size: usize) -> *mut u8 {
    if !alignment.is_power_of_two() || alignment > PAGE_SIZE {
      return null_mut();
    }
    if size > MAX_OBJECT_SIZE {
      return self.big.lock().malloc(size);
    }
    self.small_alloc(class_of(size.max(alignment)))
  }

  fn small_alloc(&self, size_class: usize) -> *mut u8 {
    let mut state = self.small.write();
    loop {
      if let Some(mh) = state.current[size_class] {
        if let Some(ptr) = unsafe { mh.as_ref() }.alloc_slot() {
          return ptr.as_ptr();
        }
        // Slab exhausted; it has marked itself done and retires from the
        // current slot. It stays on the class list as a mesh candidate.
        state.current[size_class] = None;
      }

      match self.alloc_miniheap_locked(&mut state, size_class) {
        Some(mh) => state.current[size_class] = Some(mh),
        None => return null_mut(),
      }
    }
  }

  /// Frees `ptr`. The mesh marker triggers a diagnostic burst; small
  /// pointers clear their occupancy bit (retiring the miniheap once it is
  /// done and empty); anything else is offered to the big heap, which
  /// silently ignores pointers it never handed out.
  pub fn free(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    if ptr::eq(ptr, MESH_MARKER) {
      self.mesh_burst();
      return;
    }

    let resolved = {
      let state = self.small.read();
      match Self::miniheap_for_locked(&state, ptr) {
        Some(mh) => {
          let heap = unsafe { mh.as_ref() };
          heap.free(ptr);
          Some((mh, heap.span_start(), heap.is_done() && heap.is_empty()))
        }
        None => None,
      }
    };

    let Some((mh, span_start, retire)) = resolved else {
      self.big.lock().free(ptr);
      return;
    };

    if retire {
      let mut state = self.small.write();
      // Somebody else may have retired (or even replaced) the descriptor
      // between the locks; only free what the index still vouches for.
      if state.by_span.get(&span_start) == Some(&mh) {
        let heap = unsafe { mh.as_ref() };
        if heap.is_done() && heap.is_empty() {
          self.free_miniheap_locked(&mut state, mh);
        }
      }
    } else if self.should_mesh() {
      self.mesh_all_size_classes();
    }
  }

  /// Retires a miniheap: spans back to the arena, index entries erased,
  /// descriptor unlinked and destroyed. Caches must be drained first; a
  /// reader holding the shared lock can never see this happen.
  pub fn free_miniheap(&self, mh: NonNull<MiniHeap>) {
    let mut state = self.small.write();
    self.free_miniheap_locked(&mut state, mh);
  }

  fn free_miniheap_locked(&self, state: &mut SmallHeapState, mh: NonNull<MiniHeap>) {
    let heap = unsafe { mh.as_ref() };
    let size_class = class_of(heap.object_size());
    let span_pages = heap.span_size() / PAGE_SIZE;

    for &span in heap.spans() {
      state.by_span.remove(&span);
      self
        .arena
        .free_span(self.arena.page_index_of(span as *const u8), span_pages);
    }

    self.untrack_locked(state, mh, size_class);
    self.stats.mh_free_count.fetch_add(1, Ordering::Relaxed);
    log::trace!("miniheap: retired class {size_class} @ {:#x}", heap.span_start());

    drop(unsafe { Box::from_raw(mh.as_ptr()) });
  }

  fn untrack_locked(&self, state: &mut SmallHeapState, mh: NonNull<MiniHeap>, size_class: usize) {
    unsafe { state.littleheaps[size_class].unlink(mh) };
    state.littleheap_counts[size_class] -= 1;
    if state.current[size_class] == Some(mh) {
      state.current[size_class] = None;
    }
  }

  /// Usable bytes behind `ptr`: the class max for small objects, the
  /// recorded request for big ones, zero for null and the mesh marker.
  pub fn usable_size(&self, ptr: *const u8) -> usize {
    if ptr.is_null() || ptr::eq(ptr, MESH_MARKER as *const u8) {
      return 0;
    }
    if let Some(mh) = self.miniheap_for(ptr) {
      return unsafe { mh.as_ref() }.object_size();
    }
    self.big.lock().usable_size(ptr).unwrap_or(0)
  }

  /// One decrement of the mesh cadence counter; true when it strikes zero.
  fn should_mesh(&self) -> bool {
    self.next_mesh_check.fetch_sub(1, Ordering::Relaxed) == 1
  }

  /// Runs the meshing engine over every size class: collect disjoint done
  /// pairs per class in shuffled order, then fuse them with the world
  /// stopped. Also redraws the cadence counter.
  pub fn mesh_all_size_classes(&self) {
    let mut state = self.small.write();

    let period = self.mesh_period.load(Ordering::Relaxed).max(1);
    let draw = state.rng.one_to(period as u64) as usize;
    self.next_mesh_check.store(draw, Ordering::Relaxed);

    let mut merge_sets: Vec<(NonNull<MiniHeap>, NonNull<MiniHeap>)> = Vec::new();
    for size_class in 0..NUM_BINS {
      let heaps: Vec<NonNull<MiniHeap>> = state.littleheaps[size_class].iter().collect();
      unsafe {
        meshing::random_sort(&mut state.rng, &heaps, |dst, src| {
          merge_sets.push((dst, src));
        })
      };
    }

    if merge_sets.is_empty() {
      return;
    }

    self.world.stop_the_world();
    for (dst, src) in merge_sets {
      self.mesh_locked(&mut state, dst, src);
    }
    self.world.start_the_world();
  }

  /// Fuses `src` into `dst`. Requires the exclusive lock and a stopped
  /// world; occupancy bitmaps must be disjoint. On success `src`'s spans
  /// alias `dst`'s physical span, the index points them at `dst`, and the
  /// `src` descriptor is gone. A rejected remap abandons the mesh with
  /// both miniheaps intact.
  fn mesh_locked(
    &self,
    state: &mut SmallHeapState,
    mut dst: NonNull<MiniHeap>,
    src: NonNull<MiniHeap>,
  ) -> bool {
    let (dst_ref, src_ref) = unsafe { (dst.as_ref(), src.as_ref()) };
    debug_assert_eq!(dst_ref.object_size(), src_ref.object_size());
    debug_assert_eq!(dst_ref.span_size(), src_ref.span_size());
    debug_assert!(dst_ref.mesh_count() + src_ref.mesh_count() <= MAX_MESHES);
    debug_assert!(meshing::bitmaps_disjoint(dst_ref.bitmap(), src_ref.bitmap()));

    let object_size = dst_ref.object_size();
    let span_pages = dst_ref.span_size() / PAGE_SIZE;
    let src_span = src_ref.span_start();

    // Move every live object into the same slot of dst. Disjointness
    // guarantees the slot is free; an occupied one means the bitmaps are
    // corrupt and continuing would overwrite a live object.
    let moved: Vec<usize> = src_ref.bitmap().iter().collect();
    for &slot in &moved {
      let Some(dst_object) = dst_ref.malloc_at(slot) else {
        fatal("mesh: destination slot occupied");
      };
      unsafe {
        ptr::copy_nonoverlapping(
          (src_span + slot * object_size) as *const u8,
          dst_object.as_ptr(),
          object_size,
        );
      }
    }

    // Collapse every virtual span of src onto dst's physical extent.
    let dst_page = self.arena.page_index_of(dst_ref.span_start() as *const u8);
    for (i, &span) in src_ref.spans().iter().enumerate() {
      let src_page = self.arena.page_index_of(span as *const u8);
      match self.arena.mesh(dst_page, src_page, span_pages) {
        Ok(()) => {}
        Err(err) if i == 0 => {
          // Nothing remapped yet: withdraw the copies and walk away with
          // both miniheaps untouched.
          for &slot in &moved {
            dst_ref.bitmap().unset(slot);
          }
          log::warn!("mesh abandoned: {err}");
          return false;
        }
        Err(_) => {
          // Part of src already aliases dst; there is no mapping state in
          // which both descriptors are coherent again.
          fatal("mesh: span remap failed mid-merge");
        }
      }
    }

    // Hand src's spans to dst and repoint the index.
    for &span in src_ref.spans() {
      unsafe { dst.as_mut() }.meshed_span(span);
      state.by_span.insert(span, dst);
    }

    let size_class = class_of(object_size);
    self.untrack_locked(state, src, size_class);
    drop(unsafe { Box::from_raw(src.as_ptr()) });

    self.stats.mesh_count.fetch_add(1, Ordering::Relaxed);
    log::debug!(
      "meshed class {size_class}: {} object(s) moved, span {src_span:#x} now aliases {:#x}",
      moved.len(),
      unsafe { dst.as_ref() }.span_start(),
    );
    true
  }

  /// Diagnostic burst for the mesh marker: dump, mesh hard, dump again.
  fn mesh_burst(&self) {
    self.dump_stats();
    for _ in 0..MARKER_BURST_PASSES {
      self.mesh_all_size_classes();
    }
    self.dump_stats();
  }

  /// Statistics snapshot through the logger.
  pub fn dump_stats(&self) {
    log::info!(
      "mesh count: {}  mh alloc: {}  mh free: {}  mh hwm: {}",
      self.stats.mesh_count.load(Ordering::Relaxed),
      self.stats.mh_alloc_count.load(Ordering::Relaxed),
      self.stats.mh_free_count.load(Ordering::Relaxed),
      self.stats.mh_high_water_mark.load(Ordering::Relaxed),
    );

    let state = self.small.read();
    for size_class in 0..NUM_BINS {
      if state.littleheap_counts[size_class] == 0 {
        continue;
      }
      let mut in_use = 0usize;
      let mut capacity = 0usize;
      for mh in state.littleheaps[size_class].iter() {
        let heap = unsafe { mh.as_ref() };
        in_use += heap.in_use_count();
        capacity += heap.object_count();
      }
      log::info!(
        "  class {size_class} ({}B): {} heap(s), occupancy {}/{} (hwm {})",
        byte_size_for_class(size_class),
        state.littleheap_counts[size_class],
        in_use,
        capacity,
        self.stats.mh_class_hwm[size_class].load(Ordering::Relaxed),
      );
    }
  }

  /// Reads one statistics/configuration entry by name.
  pub fn ctl_read(&self, name: &str) -> Result<u64, CtlError> {
    let value = match name {
      "stats.mesh_count" => self.stats.mesh_count.load(Ordering::Relaxed),
      "stats.mh_alloc_count" => self.stats.mh_alloc_count.load(Ordering::Relaxed),
      "stats.mh_free_count" => self.stats.mh_free_count.load(Ordering::Relaxed),
      "stats.mh_high_water_mark" => self.stats.mh_high_water_mark.load(Ordering::Relaxed),
      "arena.in_use_pages" => self.arena.in_use_page_count(),
      "arena.committed_pages" => self.arena.committed_page_count(),
      "mesh.period" => self.mesh_period.load(Ordering::Relaxed),
      "heap.size_classes" => NUM_BINS,
      _ => return Err(CtlError::UnknownName(name.into())),
    };
    Ok(value as u64)
  }

  /// Writes one configuration entry by name. Statistics are read-only.
  pub fn ctl_write(&self, name: &str, value: u64) -> Result<(), CtlError> {
    match name {
      "mesh.period" => {
        if value == 0 {
          return Err(CtlError::InvalidValue);
        }
        self.mesh_period.store(value as usize, Ordering::Relaxed);
        Ok(())
      }
      "stats.mesh_count" | "stats.mh_alloc_count" | "stats.mh_free_count"
      | "stats.mh_high_water_mark" | "arena.in_use_pages" | "arena.committed_pages"
      | "heap.size_classes" => Err(CtlError::ReadOnly),
      _ => Err(CtlError::UnknownName(name.into())),
    }
  }

  /// Reads user bit `kind` for the object owning `ptr`. None for foreign
  /// pointers or an out-of-range kind.
  pub fn bit_get(&self, kind: usize, ptr: *const u8) -> Option<bool> {
    self.with_slot(kind, ptr, |heap, slot| heap.bit_get(kind, slot))
  }

  /// Sets user bit `kind`; returns the previous value.
  pub fn bit_set(&self, kind: usize, ptr: *const u8) -> Option<bool> {
    self.with_slot(kind, ptr, |heap, slot| heap.bit_set(kind, slot))
  }

  /// Clears user bit `kind`; returns the previous value.
  pub fn bit_clear(&self, kind: usize, ptr: *const u8) -> Option<bool> {
    self.with_slot(kind, ptr, |heap, slot| heap.bit_clear(kind, slot))
  }

  fn with_slot(
    &self,
    kind: usize,
    ptr: *const u8,
    op: impl FnOnce(&MiniHeap, usize) -> bool,
  ) -> Option<bool> {
    if kind >= USER_BIT_KINDS {
      return None;
    }
    let state = self.small.read();
    let mh = Self::miniheap_for_locked(&state, ptr)?;
    let heap = unsafe { mh.as_ref() };
    let slot = heap.slot_of(ptr)?;
    Some(op(heap, slot))
  }
}

impl Default for GlobalHeap {
  fn default() -> Self {
    Self::new(HeapOptions::default())
  }
}

impl Drop for GlobalHeap {
  fn drop(&mut self) {
    // Descriptors are owned by the heap; reclaim them so long test runs
    // don't leak. The arena teardown unmaps the spans themselves.
    let state = self.small.get_mut();
    for list in &state.littleheaps {
      let heaps: Vec<NonNull<MiniHeap>> = list.iter().collect();
      for mh in heaps {
        drop(unsafe { Box::from_raw(mh.as_ptr()) });
      }
    }
  }
}
