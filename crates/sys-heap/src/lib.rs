//! Process-wide heap built on [`pool_alloc`].
//!
//! [`SysHeap`] owns the two-pool allocator behind a spin lock and serves the
//! [`SystemMemory`] contract the portable game code allocates through. It
//! also implements [`GlobalAlloc`](core::alloc::GlobalAlloc), so it can back
//! `alloc` collections as the global allocator.
//!
//! ```rust
//! use sys_heap::{StaticHeap, SysHeap, SystemMemory as _};
//! use pool_alloc::AllocFlags;
//!
//! static MEMORY: StaticHeap<16384, 4096> = StaticHeap::new();
//! static HEAP: SysHeap = SysHeap::new();
//!
//! unsafe { HEAP.init(MEMORY.config()) }.unwrap();
//! let ptr = HEAP.allocate(256, 16, AllocFlags::TEMP).unwrap();
//! unsafe { HEAP.release(ptr.as_ptr()) };
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::{fmt, ptr::NonNull};

use pool_alloc::{
    AllocFlags, BLOCK_SIZE, InvariantViolation, Location, PoolAllocator, PoolConfig, PoolInitError,
    PoolKind, PoolStats,
};
use snafu::{ResultExt as _, Snafu, ensure};
use spin::Mutex;

pub use self::config::{HeapConfig, StaticHeap};

mod config;
mod global;

/// Memory services offered to the portable layer.
///
/// Failures collapse to `None`; the failure reason is logged by the
/// allocator.
pub trait SystemMemory {
    /// Allocates `size` bytes aligned to `align` (`0` for the default).
    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Resizes an earlier allocation, moving it if needed.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer from this heap. If the block
    /// moves, the old pointer must not be used again.
    unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>>;

    /// Returns an allocation to the heap. Null is ignored.
    ///
    /// # Safety
    ///
    /// The memory behind `ptr` must not be used after this call.
    unsafe fn release(&self, ptr: *mut u8);

    /// Free bytes in the pool `flags` selects.
    fn available(&self, flags: AllocFlags) -> usize;

    /// Largest single request the pool `flags` selects can satisfy.
    fn largest_contiguous(&self, flags: AllocFlags) -> usize;

    /// The strictest supported alignment.
    fn max_alignment(&self) -> usize {
        BLOCK_SIZE
    }
}

#[derive(Debug, Snafu)]
pub enum HeapInitError {
    #[snafu(display("system heap is already initialized"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to lay out heap pools: {source}"))]
    Pools {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        source: PoolInitError,
    },
}

/// Usage of both pools, for leak checks at teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapReport {
    pub main: PoolStats,
    pub temp: Option<PoolStats>,
}

impl HeapReport {
    /// Returns `true` if no allocation is live in either pool.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.main.used_blocks == 0 && self.temp.is_none_or(|temp| temp.used_blocks == 0)
    }
}

impl fmt::Display for HeapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "main: {}", self.main)?;
        if let Some(temp) = &self.temp {
            write!(f, "; temp: {temp}")?;
        }
        Ok(())
    }
}

/// The locked, lazily installed system heap.
pub struct SysHeap {
    heap: Mutex<Option<PoolAllocator>>,
}

impl Default for SysHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl SysHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(None),
        }
    }

    /// Installs the pools.
    ///
    /// Only the first successful call takes effect.
    ///
    /// # Safety
    ///
    /// The regions in `config` must be valid for reads and writes and must
    /// not be used by anything else for as long as this heap is in use.
    pub unsafe fn init(&self, config: PoolConfig) -> Result<(), HeapInitError> {
        let mut heap = self.heap.lock();
        ensure!(heap.is_none(), AlreadyInitializedSnafu);
        let allocator = unsafe { PoolAllocator::new(config) }.context(PoolsSnafu)?;
        log::info!(
            "system heap initialized: main={} bytes, temp={} bytes",
            allocator.available(AllocFlags::empty()),
            allocator.available(AllocFlags::TEMP),
        );
        *heap = Some(allocator);
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.heap.lock().is_some()
    }

    /// Runs `f` with the allocator locked, or returns `None` before
    /// [`init`](Self::init).
    fn with<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut PoolAllocator) -> R,
    {
        let mut heap = self.heap.lock();
        let Some(allocator) = heap.as_mut() else {
            log::warn!("system heap used before initialization");
            return None;
        };
        Some(f(allocator))
    }

    /// Usage of both pools, or `None` before initialization.
    #[must_use]
    pub fn report(&self) -> Option<HeapReport> {
        self.with(|heap| HeapReport {
            main: heap.stats(PoolKind::Main),
            temp: heap.has_temp_pool().then(|| heap.stats(PoolKind::Temp)),
        })
    }

    /// Logs every block of both pools.
    pub fn dump(&self) {
        self.with(|heap| heap.dump());
    }

    /// Writes every block of both pools to `out`.
    ///
    /// Writes nothing before initialization.
    pub fn dump_to<W>(&self, out: &mut W) -> fmt::Result
    where
        W: fmt::Write,
    {
        self.with(|heap| heap.dump_to(out)).unwrap_or(Ok(()))
    }

    /// Runs the allocator's integrity walk.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        self.with(|heap| heap.verify()).unwrap_or(Ok(()))
    }
}

impl SystemMemory for SysHeap {
    fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        self.with(|heap| heap.allocate(size, align, flags).ok()).flatten()
    }

    unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        self.with(|heap| unsafe { heap.reallocate(ptr, size, align, flags) }.ok())
            .flatten()
    }

    unsafe fn release(&self, ptr: *mut u8) {
        self.with(|heap| {
            if let Err(err) = unsafe { heap.release(ptr) } {
                log::debug!("release ignored: {err}");
            }
        });
    }

    fn available(&self, flags: AllocFlags) -> usize {
        self.with(|heap| heap.available(flags)).unwrap_or(0)
    }

    fn largest_contiguous(&self, flags: AllocFlags) -> usize {
        self.with(|heap| heap.largest_contiguous(flags)).unwrap_or(0)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
pub(crate) mod testing {
    use std::alloc::{self, Layout};

    use super::*;

    /// Runs `test_fn` against a heap installed in freshly allocated memory.
    pub(crate) fn with_test_heap<F>(config: HeapConfig, test_fn: F)
    where
        F: FnOnce(&SysHeap),
    {
        let layout = Layout::from_size_align(config.total_size(), BLOCK_SIZE).unwrap();
        unsafe {
            let memory = alloc::alloc(layout);
            let heap = SysHeap::new();
            heap.init(config.pool_config(memory)).unwrap();
            test_fn(&heap);
            heap.verify().unwrap();
            alloc::dealloc(memory, layout);
        }
    }
}
