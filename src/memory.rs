//! DMA buffer management.
//!
//! Transfer buffers must be physically contiguous and aligned to the
//! platform I/O alignment. [`DmaPool`] carves such buffers out of one
//! contiguous region; [`IoBuffer`] owns a carved block and hands out
//! [`BufferRegion`] views that transfers are bound to.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use crate::error::{Result, UsbError};

/// Platform I/O alignment. Submission rejects buffers that are not
/// aligned to this boundary.
pub const IO_BUFFER_ALIGNMENT: usize = 64;

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

struct PoolBlocks {
    /// Free blocks, offset -> size. Offsets and sizes are always
    /// multiples of the I/O alignment.
    free: BTreeMap<usize, usize>,
    /// Allocated blocks, offset -> size.
    allocated: BTreeMap<usize, usize>,
}

struct PoolShared {
    base: *mut u8,
    phys: u64,
    size: usize,
    /// Layout to return to the global allocator, for pools that own
    /// their backing region.
    owned_layout: Option<Layout>,
    blocks: Mutex<PoolBlocks>,
}

unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

impl Drop for PoolShared {
    fn drop(&mut self) {
        if let Some(layout) = self.owned_layout {
            unsafe { dealloc(self.base, layout) };
        }
    }
}

impl PoolShared {
    fn free_block(&self, offset: usize) {
        let mut blocks = self.blocks.lock();
        let size = match blocks.allocated.remove(&offset) {
            Some(size) => size,
            None => return,
        };
        blocks.free.insert(offset, size);
        Self::coalesce(&mut blocks.free);
    }

    fn coalesce(free: &mut BTreeMap<usize, usize>) {
        let mut merged: BTreeMap<usize, usize> = BTreeMap::new();
        let mut current: Option<(usize, usize)> = None;
        for (&offset, &size) in free.iter() {
            match current {
                Some((start, len)) if start + len == offset => {
                    current = Some((start, len + size));
                }
                Some((start, len)) => {
                    merged.insert(start, len);
                    current = Some((offset, size));
                }
                None => current = Some((offset, size)),
            }
        }
        if let Some((start, len)) = current {
            merged.insert(start, len);
        }
        *free = merged;
    }
}

/// A physically contiguous DMA region carved by a first-fit block
/// allocator.
#[derive(Clone)]
pub struct DmaPool {
    shared: Arc<PoolShared>,
}

impl DmaPool {
    /// Create a pool backed by the global allocator. The region is
    /// treated as identity-mapped; kernels with a real physical address
    /// space use [`DmaPool::from_region`] instead.
    pub fn new(size: usize) -> Result<Self> {
        let size = align_up(size.max(IO_BUFFER_ALIGNMENT), IO_BUFFER_ALIGNMENT);
        let layout = Layout::from_size_align(size, IO_BUFFER_ALIGNMENT)
            .map_err(|_| UsbError::InvalidParameter)?;
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(UsbError::AllocationFailed);
        }
        let phys = base as u64;
        let mut free = BTreeMap::new();
        free.insert(0, size);
        Ok(Self {
            shared: Arc::new(PoolShared {
                base,
                phys,
                size,
                owned_layout: Some(layout),
                blocks: Mutex::new(PoolBlocks {
                    free,
                    allocated: BTreeMap::new(),
                }),
            }),
        })
    }

    /// Create a pool over an externally mapped region.
    ///
    /// # Safety
    ///
    /// `base` must point to a writable, physically contiguous region of
    /// `size` bytes at physical address `phys`, aligned to
    /// [`IO_BUFFER_ALIGNMENT`], that outlives the pool.
    pub unsafe fn from_region(base: *mut u8, phys: u64, size: usize) -> Self {
        debug_assert_eq!(base as usize % IO_BUFFER_ALIGNMENT, 0);
        let size = size & !(IO_BUFFER_ALIGNMENT - 1);
        let mut free = BTreeMap::new();
        free.insert(0, size);
        Self {
            shared: Arc::new(PoolShared {
                base,
                phys,
                size,
                owned_layout: None,
                blocks: Mutex::new(PoolBlocks {
                    free,
                    allocated: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Total size of the backing region.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Allocate a zeroed, aligned buffer of at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<IoBuffer> {
        if size == 0 {
            return Err(UsbError::InvalidParameter);
        }
        let aligned = align_up(size, IO_BUFFER_ALIGNMENT);
        let offset = {
            let mut blocks = self.shared.blocks.lock();
            let found = blocks
                .free
                .iter()
                .find(|(_, &block_size)| block_size >= aligned)
                .map(|(&offset, &block_size)| (offset, block_size));
            let (offset, block_size) = found.ok_or(UsbError::AllocationFailed)?;
            blocks.free.remove(&offset);
            if block_size > aligned {
                blocks.free.insert(offset + aligned, block_size - aligned);
            }
            blocks.allocated.insert(offset, aligned);
            offset
        };
        let buffer = IoBuffer {
            shared: Arc::clone(&self.shared),
            offset,
            len: size,
        };
        unsafe {
            core::ptr::write_bytes(self.shared.base.add(offset), 0, aligned);
        }
        Ok(buffer)
    }
}

impl fmt::Debug for DmaPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let blocks = self.shared.blocks.lock();
        f.debug_struct("DmaPool")
            .field("size", &self.shared.size)
            .field("allocated_blocks", &blocks.allocated.len())
            .field("free_blocks", &blocks.free.len())
            .finish()
    }
}

/// An owned DMA block. Freed back to its pool on drop.
pub struct IoBuffer {
    shared: Arc<PoolShared>,
    offset: usize,
    len: usize,
}

impl IoBuffer {
    /// Physical address of the first byte.
    pub fn phys(&self) -> u64 {
        self.shared.phys + self.offset as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.shared.base.add(self.offset), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.shared.base.add(self.offset), self.len) }
    }

    /// A sub-view suitable for binding to a transfer. The view aliases
    /// this buffer; the caller is responsible for not touching the bytes
    /// while a transfer over them is active.
    pub fn region(&self, offset: usize, len: usize) -> Result<BufferRegion> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(UsbError::InvalidParameter);
        }
        Ok(BufferRegion {
            ptr: unsafe { self.shared.base.add(self.offset + offset) },
            phys: self.phys() + offset as u64,
            capacity: len,
        })
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        self.shared.free_block(self.offset);
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("phys", &format_args!("{:#x}", self.phys()))
            .field("len", &self.len)
            .finish()
    }
}

/// A non-owning view of DMA memory bound to a transfer: virtual pointer,
/// physical address, and capacity.
#[derive(Clone, Copy)]
pub struct BufferRegion {
    ptr: *mut u8,
    phys: u64,
    capacity: usize,
}

unsafe impl Send for BufferRegion {}
unsafe impl Sync for BufferRegion {}

impl BufferRegion {
    /// Fabricate a region from raw parts.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `capacity` writable bytes at physical address
    /// `phys` that outlive every transfer bound to the region.
    pub unsafe fn from_raw_parts(ptr: *mut u8, phys: u64, capacity: usize) -> Self {
        Self {
            ptr,
            phys,
            capacity,
        }
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Copy bytes into the region. Used by the engine to lay down setup
    /// packets and by controller drivers to deliver device-to-host data.
    pub fn copy_from(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.capacity);
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len());
        }
    }

    /// Copy bytes out of the region.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.capacity);
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr.add(offset), dst.as_mut_ptr(), dst.len());
        }
    }
}

impl fmt::Debug for BufferRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRegion")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("capacity", &self.capacity)
            .finish()
    }
}
