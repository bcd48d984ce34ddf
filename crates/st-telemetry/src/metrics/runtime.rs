//! Process runtime statistics for the observable gauges.
//!
//! Sampling only reads atomics and a monotonic clock, so it is safe to run
//! from any collection cycle.

use std::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Source of live heap usage.
pub trait HeapStats: Send + Sync {
    fn allocated_bytes(&self) -> usize;
}

/// Global allocator wrapper that keeps a running count of live heap bytes.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: TrackingAllocator<mimalloc::MiMalloc> = TrackingAllocator::new(mimalloc::MiMalloc);
/// ```
pub struct TrackingAllocator<A> {
    inner: A,
    allocated: AtomicUsize,
}

impl<A> TrackingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            allocated: AtomicUsize::new(0),
        }
    }
}

impl<A: Send + Sync> HeapStats for TrackingAllocator<A> {
    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for TrackingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            self.allocated.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            self.allocated.fetch_add(layout.size(), Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout);
        self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            if new_size >= layout.size() {
                self.allocated
                    .fetch_add(new_size - layout.size(), Ordering::Relaxed);
            } else {
                self.allocated
                    .fetch_sub(layout.size() - new_size, Ordering::Relaxed);
            }
        }
        new_ptr
    }
}

/// A point-in-time reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeSample {
    pub heap_allocated_bytes: usize,
    pub uptime_secs: f64,
}

/// Pure sampling function over process statistics.
#[derive(Clone)]
pub struct RuntimeSampler {
    started: Instant,
    heap: Option<&'static dyn HeapStats>,
}

impl RuntimeSampler {
    /// Sampler without heap tracking; heap readings are zero.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            heap: None,
        }
    }

    pub fn with_heap_stats(mut self, heap: &'static dyn HeapStats) -> Self {
        self.heap = Some(heap);
        self
    }

    pub fn sample(&self) -> RuntimeSample {
        RuntimeSample {
            heap_allocated_bytes: self.heap.as_ref().map_or(0, |h| h.allocated_bytes()),
            uptime_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

impl Default for RuntimeSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuntimeSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSampler")
            .field("heap_tracked", &self.heap.is_some())
            .finish()
    }
}
