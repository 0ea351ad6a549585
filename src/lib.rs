#![allow(clippy::missing_safety_doc)]

//! meshalloc is a meshing memory allocator: a small-object heap that, on
//! top of conventional segregated-fit allocation, periodically *meshes*
//! pairs of sparsely used slabs. Two slabs of the same size class whose
//! occupancy bitmaps are disjoint can share one physical span: the live
//! objects of one are copied into the free slots of the other, the two
//! virtual spans are collapsed onto a single physical extent, and the
//! now-redundant pages go back to the OS. Long-running processes whose
//! frees leave many half-empty pages get their memory back without any
//! pointer ever changing value.
//!
//! The pieces, bottom up:
//!
//! - [`bitmap`]: atomic and relaxed fixed-capacity bit vectors with the
//!   scan primitives everything else is built on.
//! - [`miniheap`]: one slab per (size class, span) with an atomic
//!   occupancy bitmap.
//! - [`arena`]: the contiguous file-backed reservation all spans are
//!   carved from, and the remap trick that makes meshing work.
//! - [`meshing`]: the shuffled search for disjoint slab pairs.
//! - [`global_heap`]: ties the above together behind a reader/writer
//!   lock and delegates big objects to [`big_heap`].
//!
//! Start from [`GlobalHeap`] to follow the code.

use std::sync::OnceLock;

pub mod arena;
pub mod big_heap;
pub mod bitmap;
pub mod global_heap;
pub mod meshing;
pub mod miniheap;
pub mod rng;
pub mod size_classes;

pub use arena::{Arena, MeshError};
pub use global_heap::{CtlError, GlobalHeap, HeapOptions, MESH_MARKER, NopWorld, WorldStopper};
pub use miniheap::MiniHeap;

/// Last-resort failure path: invariant violations inside an allocator
/// cannot be reported through anything that might itself allocate, so this
/// writes straight to stderr and aborts.
pub(crate) fn fatal(msg: &str) -> ! {
  unsafe {
    libc::write(2, b"meshalloc: ".as_ptr().cast(), 11);
    libc::write(2, msg.as_ptr().cast(), msg.len());
    libc::write(2, b"\n".as_ptr().cast(), 1);
  }
  std::process::abort()
}

static RUNTIME: OnceLock<GlobalHeap> = OnceLock::new();

/// The process-wide heap instance behind the C-compatible surface.
pub fn runtime() -> &'static GlobalHeap {
  RUNTIME.get_or_init(GlobalHeap::default)
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod c_api {
  use core::ffi::{CStr, c_char, c_int, c_void};
  use std::ptr::{self, null_mut};

  use crate::runtime;
  use crate::size_classes::{MAX_OBJECT_SIZE, class_of};

  const EPERM: c_int = 1;
  const ENOENT: c_int = 2;
  const EINVAL: c_int = 22;

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mesh_malloc(size: usize) -> *mut u8 {
    runtime().malloc(size)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mesh_free(ptr: *mut u8) {
    runtime().free(ptr)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mesh_calloc(nmemb: usize, size: usize) -> *mut u8 {
    let Some(total) = nmemb.checked_mul(size) else {
      return null_mut();
    };
    let ptr = runtime().malloc(total);
    if !ptr.is_null() {
      unsafe { ptr.write_bytes(0, total) };
    }
    ptr
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mesh_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    let heap = runtime();

    if ptr.is_null() {
      return heap.malloc(size);
    }
    if size == 0 {
      heap.free(ptr);
      return null_mut();
    }

    // Staying inside the same size class keeps the pointer.
    let old_size = heap.usable_size(ptr);
    if old_size > 0
      && old_size <= MAX_OBJECT_SIZE
      && size <= MAX_OBJECT_SIZE
      && class_of(old_size) == class_of(size)
    {
      return ptr;
    }

    let new_ptr = heap.malloc(size);
    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size)) };
      heap.free(ptr);
    }
    new_ptr
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mesh_memalign(alignment: usize, size: usize) -> *mut u8 {
    runtime().memalign(alignment, size)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mesh_usable_size(ptr: *const u8) -> usize {
    runtime().usable_size(ptr)
  }

  /// Statistics and configuration namespace in jemalloc's `mallctl` shape:
  /// read into `oldp`/`oldlenp`, write from `newp`/`newlen`, all values
  /// 64-bit. Returns 0 on success or an errno-style code.
  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mesh_mallctl(
    name: *const c_char,
    oldp: *mut c_void,
    oldlenp: *mut usize,
    newp: *const c_void,
    newlen: usize,
  ) -> c_int {
    if name.is_null() {
      return EINVAL;
    }
    let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
      return EINVAL;
    };
    let heap = runtime();

    if !newp.is_null() {
      if newlen != size_of::<u64>() {
        return EINVAL;
      }
      let value = unsafe { (newp as *const u64).read_unaligned() };
      match heap.ctl_write(name, value) {
        Ok(()) => {}
        Err(crate::CtlError::UnknownName(_)) => return ENOENT,
        Err(crate::CtlError::ReadOnly) => return EPERM,
        Err(crate::CtlError::InvalidValue) => return EINVAL,
      }
    }

    if !oldp.is_null() {
      if oldlenp.is_null() || unsafe { *oldlenp } < size_of::<u64>() {
        return EINVAL;
      }
      match heap.ctl_read(name) {
        Ok(value) => unsafe {
          (oldp as *mut u64).write_unaligned(value);
          *oldlenp = size_of::<u64>();
        },
        Err(_) => return ENOENT,
      }
    }

    0
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mesh_bit_get(kind: c_int, ptr: *const u8) -> c_int {
    match runtime().bit_get(kind as usize, ptr) {
      Some(bit) => bit as c_int,
      None => -1,
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mesh_bit_set(kind: c_int, ptr: *const u8) -> c_int {
    match runtime().bit_set(kind as usize, ptr) {
      Some(previous) => previous as c_int,
      None => -1,
    }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn mesh_bit_clear(kind: c_int, ptr: *const u8) -> c_int {
    match runtime().bit_clear(kind as usize, ptr) {
      Some(previous) => previous as c_int,
      None => -1,
    }
  }
}
