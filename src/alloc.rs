use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;

use crate::error;

/// Global allocator adapter that reports every allocation and deallocation
/// to the process-global tracker.
///
/// The backing store defaults to [`System`] but any [`GlobalAlloc`] can be
/// substituted through [`TrackingAllocator::with_allocator`]; the tracker
/// itself never allocates through the hook it instruments.
///
/// ```rust
/// use leakscope::TrackingAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: TrackingAllocator = TrackingAllocator::new();
///
/// fn main() {}
/// ```
#[derive(Debug, Default)]
pub struct TrackingAllocator<A: GlobalAlloc = System> {
  inner: A,
}

impl TrackingAllocator<System> {
  #[must_use]
  pub const fn new() -> Self {
    Self { inner: System }
  }
}

impl<A: GlobalAlloc> TrackingAllocator<A> {
  /// Wraps a custom backing allocator.
  #[must_use]
  pub const fn with_allocator(inner: A) -> Self {
    Self { inner }
  }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let tracker = crate::global();
    let ptr = unsafe { self.inner.alloc(inflated(layout)) };

    if ptr.is_null() {
      error::badalloc(layout);
    }

    if tracker.config().memset_allocations {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
    }

    tracker.watch(ptr as usize, layout.size());

    ptr
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if ptr.is_null() {
      return;
    }

    crate::global().forget(ptr as usize);

    unsafe { self.inner.dealloc(ptr, inflated(layout)) };
  }

  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    let tracker = crate::global();
    let new_ptr = unsafe {
      self
        .inner
        .realloc(ptr, inflated(layout), inflated_size(new_size))
    };

    if new_ptr.is_null() {
      error::badalloc(
        Layout::from_size_align(new_size, layout.align()).unwrap_or(layout),
      );
    }

    tracker.forget(ptr as usize);
    tracker.watch(new_ptr as usize, new_size);

    new_ptr
  }
}

// The same inflation is applied on every path, so the layout handed back to
// the backing allocator always matches the one it allocated with.
fn inflated(layout: Layout) -> Layout {
  Layout::from_size_align(inflated_size(layout.size()), layout.align())
    .unwrap_or(layout)
}

fn inflated_size(size: usize) -> usize {
  let overhead = crate::global().config().allocs_overhead;

  if overhead <= 1.0 {
    return size;
  }

  ((size as f64 * overhead) as usize).max(size)
}

#[cfg(test)]
mod tests {
  use super::*;

  // The adapter has to be constructible in a `static`.
  static _ALLOCATOR: TrackingAllocator = TrackingAllocator::new();

  #[test]
  fn roundtrip_is_tracked_against_the_global_tracker() {
    let allocator = TrackingAllocator::new();
    let layout = Layout::from_size_align(64, 8).unwrap();

    let ptr = unsafe { allocator.alloc(layout) };
    assert!(!ptr.is_null());
    assert_eq!(crate::global().query_size(ptr as usize), Some(64));

    unsafe { allocator.dealloc(ptr, layout) };
    assert_eq!(crate::global().query_size(ptr as usize), None);
  }

  #[test]
  fn fresh_allocations_are_zeroed_by_default() {
    let allocator = TrackingAllocator::new();
    let layout = Layout::from_size_align(32, 8).unwrap();

    let ptr = unsafe { allocator.alloc(layout) };
    let bytes = unsafe { std::slice::from_raw_parts(ptr, 32) };
    assert!(bytes.iter().all(|&byte| byte == 0));

    unsafe { allocator.dealloc(ptr, layout) };
  }

  #[test]
  fn realloc_moves_the_tracked_record() {
    let allocator = TrackingAllocator::new();
    let layout = Layout::from_size_align(16, 8).unwrap();

    let ptr = unsafe { allocator.alloc(layout) };
    let grown = unsafe { allocator.realloc(ptr, layout, 48) };
    assert!(!grown.is_null());
    assert_eq!(crate::global().query_size(grown as usize), Some(48));

    let grown_layout = Layout::from_size_align(48, 8).unwrap();
    unsafe { allocator.dealloc(grown, grown_layout) };
  }

  #[test]
  fn custom_backing_allocators_are_forwarded_to() {
    let allocator = TrackingAllocator::with_allocator(System);
    let layout = Layout::from_size_align(8, 8).unwrap();

    let ptr = unsafe { allocator.alloc(layout) };
    assert!(!ptr.is_null());

    unsafe { allocator.dealloc(ptr, layout) };
  }

  #[test]
  fn default_overhead_leaves_sizes_untouched() {
    assert_eq!(inflated_size(100), 100);
    assert_eq!(inflated(Layout::new::<u64>()), Layout::new::<u64>());
  }
}
