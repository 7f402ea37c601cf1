//! Deterministic fixed-pool heap for memory-constrained targets.
//!
//! The allocator manages two contiguous regions: a large **main** pool and
//! an optional smaller **temp** pool for short-lived data. Each pool is a
//! chain of variable-sized blocks measured in [`BLOCK_SIZE`] granules, each
//! block starting with a header, and terminated by an immovable fencepost
//! header at the high end of the pool. Free blocks are also threaded on an
//! address-ordered free list.
//!
//! # Algorithm
//!
//! - **Allocation**: first fit over the free list of the chosen pool. The
//!   list is walked upward, or downward with [`AllocFlags::TOP`], and the
//!   allocation is cut from the matching end of the block that fits.
//!   [`AllocFlags::TEMP`] requests try the temp pool first and fall back to
//!   the top of the main pool.
//! - **Resize**: shrinks in place, grows into a free successor or a free
//!   predecessor when one is large enough, and relocates otherwise.
//! - **Release**: the block rejoins the free list and is merged with free
//!   neighbours immediately, so no two free blocks are ever adjacent.
//!
//! Every entry point either succeeds or leaves the pools untouched.
//! Detected corruption is fatal.
//!
//! # Usage Example
//!
//! ```rust
//! use pool_alloc::{AllocFlags, PoolAllocator, PoolConfig, PoolRegion};
//!
//! # #[repr(C, align(64))] struct Heap([u8; 8192]);
//! let mut main = Heap([0; 8192]);
//! let mut temp = Heap([0; 8192]);
//! let config = PoolConfig {
//!     main: PoolRegion::new(main.0.as_mut_ptr(), main.0.len()),
//!     temp: Some(PoolRegion::new(temp.0.as_mut_ptr(), 1024)),
//! };
//! let mut heap = unsafe { PoolAllocator::new(config) }.unwrap();
//!
//! let ptr = heap.allocate(100, 16, AllocFlags::CLEAR).unwrap();
//! let ptr = unsafe { heap.reallocate(ptr.as_ptr(), 400, 16, AllocFlags::empty()) }.unwrap();
//! unsafe { heap.release(ptr.as_ptr()) }.unwrap();
//! assert_eq!(heap.largest_contiguous(AllocFlags::empty()), heap.available(AllocFlags::empty()));
//! ```
//!
//! # Thread Safety
//!
//! [`PoolAllocator`] is `Send` but not `Sync`. Callers on several threads
//! must wrap it in a single lock.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use snafu::ensure;

pub use self::{
    block::{BLOCK_SIZE, DEFAULT_ALIGN},
    error::{AllocError, Invariant, InvariantViolation, Location, PoolInitError},
    flags::AllocFlags,
    pool::{PoolKind, PoolRegion},
    report::{BlockInfo, BlockStatus, Blocks, PoolStats},
};
use self::{block::BlockHeader, pool::Pool};

mod allocate;
mod block;
mod error;
mod flags;
mod pool;
mod report;
mod resize;
mod validate;
mod verify;

/// The regions backing the two pools.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub main: PoolRegion,
    /// Without a temp pool, [`AllocFlags::TEMP`] requests go straight to the
    /// top of the main pool.
    pub temp: Option<PoolRegion>,
}

/// The two-pool heap.
pub struct PoolAllocator {
    main: Pool,
    temp: Option<Pool>,
}

unsafe impl Send for PoolAllocator {}

impl PoolAllocator {
    /// Lays out both pools.
    ///
    /// Regions are trimmed to granule boundaries and zero-filled.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - Both regions are valid for reads and writes
    /// - The regions are not used by any other allocator or code
    /// - The regions remain valid for the lifetime of the allocator
    pub unsafe fn new(config: PoolConfig) -> Result<Self, PoolInitError> {
        if let Some(temp) = config.temp {
            let main_range = config.main.addr_range();
            let temp_range = temp.addr_range();
            ensure!(
                main_range.end <= temp_range.start || temp_range.end <= main_range.start,
                error::OverlappingSnafu {
                    main: main_range,
                    temp: temp_range,
                }
            );
        }
        let main = unsafe { Pool::new(PoolKind::Main, config.main)? };
        let temp = config
            .temp
            .map(|region| unsafe { Pool::new(PoolKind::Temp, region) })
            .transpose()?;
        Ok(Self { main, temp })
    }

    /// The strictest alignment an allocation may request.
    #[must_use]
    pub const fn max_alignment() -> usize {
        BLOCK_SIZE
    }

    /// Returns `true` if the allocator has a temp pool.
    #[must_use]
    pub fn has_temp_pool(&self) -> bool {
        self.temp.is_some()
    }

    /// Returns a pointer's block to its pool.
    ///
    /// Null is accepted and ignored. A pointer that does not address a live
    /// allocation, including one that was already released, is rejected
    /// without touching either pool.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the memory behind `ptr` is not accessed
    /// after this call.
    pub unsafe fn release(&mut self, ptr: *mut u8) -> Result<(), AllocError> {
        if ptr.is_null() {
            return Ok(());
        }
        let block = self.lookup_or_reject(ptr)?;
        let size = unsafe { (*block).alloc_size };
        unsafe { self.pool_of_mut(block).release(block) };
        log::trace!("release({ptr:p}) size={size}");
        Ok(())
    }

    fn pool(&self, kind: PoolKind) -> Option<&Pool> {
        match kind {
            PoolKind::Main => Some(&self.main),
            PoolKind::Temp => self.temp.as_ref(),
        }
    }

    fn pools(&self) -> impl Iterator<Item = &Pool> {
        [Some(&self.main), self.temp.as_ref()].into_iter().flatten()
    }

    /// The pool a live block belongs to.
    fn pool_of_mut(&mut self, block: *mut BlockHeader) -> &mut Pool {
        let in_temp = unsafe { (*block).state.contains(block::BlockState::TEMP) };
        match (&mut self.temp, in_temp) {
            (Some(temp), true) => temp,
            (None, true) => self.main.corrupted(block, Invariant::PoolTag),
            (_, false) => &mut self.main,
        }
    }

    /// The pool whose address range could hold `addr` as a user pointer.
    fn pool_containing(&self, addr: usize) -> Option<&Pool> {
        self.pools().find(|pool| pool.may_contain(addr))
    }
}
