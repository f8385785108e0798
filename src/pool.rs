//! Fixed-size payload buffers without fragmentation.
//!
//! The pool carves blocks of `block_size` buffers from an injected
//! allocator and recycles them through a free list. Memory goes back to
//! the underlying allocator only when the pool is dropped. The pool sits
//! on the eviction-promotion path, which is already rate-limited by cache
//! hit rates, so a single mutex around the free list is enough.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::slot::PAYLOAD_ALIGN;

/// The allocator seam between a tier and its device.
///
/// Constructor-injected per tier: host tiers use [`HeapAllocator`], an HBM
/// tier takes whatever pinned/device allocator the embedder provides. No
/// process-wide allocator state exists.
pub trait ByteAllocator: Send + Sync {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// # Safety
    /// `ptr` must have come from `allocate` on this allocator with the
    /// same layout, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Host-heap allocator.
pub struct HeapAllocator;

impl ByteAllocator for HeapAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        // Zeroed so freshly created slots read as zeros before the
        // default value lands.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
            .ok_or_else(|| Error::invalid(format!("allocation of {} bytes failed", layout.size())))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

struct PoolInner {
    free: Vec<NonNull<f32>>,
    blocks: Vec<NonNull<u8>>,
}

// Raw buffer pointers are only handed out through the pool API.
unsafe impl Send for PoolInner {}

pub struct MemoryPool {
    inner: Mutex<PoolInner>,
    allocator: Arc<dyn ByteAllocator>,
    /// Bytes per buffer, rounded up to the payload alignment.
    buffer_bytes: usize,
    block_size: usize,
}

impl MemoryPool {
    pub fn new(total_dims: usize, block_size: usize, allocator: Arc<dyn ByteAllocator>) -> MemoryPool {
        let raw = total_dims * 4;
        let buffer_bytes = raw.div_ceil(PAYLOAD_ALIGN) * PAYLOAD_ALIGN;
        MemoryPool {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                blocks: Vec::new(),
            }),
            allocator,
            buffer_bytes,
            block_size: block_size.max(1),
        }
    }

    fn block_layout(&self) -> Layout {
        // buffer_bytes is a multiple of PAYLOAD_ALIGN, so every buffer in
        // the block starts aligned.
        Layout::from_size_align(self.buffer_bytes * self.block_size, PAYLOAD_ALIGN)
            .expect("pool block layout")
    }

    /// Pops a zeroed buffer, refilling from the allocator when the free
    /// list is empty. O(1) amortized.
    pub fn allocate(&self) -> Result<NonNull<f32>> {
        let mut inner = self.inner.lock();
        if let Some(ptr) = inner.free.pop() {
            unsafe {
                std::ptr::write_bytes(ptr.as_ptr() as *mut u8, 0, self.buffer_bytes);
            }
            return Ok(ptr);
        }

        let block = self.allocator.allocate(self.block_layout())?;
        inner.blocks.push(block);
        for i in 1..self.block_size {
            let buf = unsafe { block.as_ptr().add(i * self.buffer_bytes) } as *mut f32;
            inner.free.push(unsafe { NonNull::new_unchecked(buf) });
        }
        // The allocator is not required to zero; the handed-out buffer is.
        unsafe {
            std::ptr::write_bytes(block.as_ptr(), 0, self.buffer_bytes);
        }
        Ok(unsafe { NonNull::new_unchecked(block.as_ptr() as *mut f32) })
    }

    pub fn deallocate(&self, ptr: NonNull<f32>) {
        self.inner.lock().free.push(ptr);
    }

    pub fn deallocate_many(&self, ptrs: impl IntoIterator<Item = NonNull<f32>>) {
        let mut inner = self.inner.lock();
        inner.free.extend(ptrs);
    }

    /// Buffers currently sitting on the free list.
    pub fn free_buffers(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let layout = Layout::from_size_align(self.buffer_bytes * self.block_size, PAYLOAD_ALIGN)
            .expect("pool block layout");
        for block in inner.blocks.drain(..) {
            unsafe { self.allocator.deallocate(block, layout) };
        }
    }
}
