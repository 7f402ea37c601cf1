use core::ptr::NonNull;

use snafu::{OptionExt as _, ensure};

use crate::{
    AllocFlags, PoolAllocator, PoolKind,
    block::{self, BLOCK_SIZE, BlockHeader, DEFAULT_ALIGN},
    error::{self, AllocError},
};

/// A validated allocation request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Request {
    pub(crate) size: usize,
    pub(crate) align: usize,
    pub(crate) alignofs: usize,
    pub(crate) nblocks: u32,
    pub(crate) flags: AllocFlags,
}

impl Request {
    #[track_caller]
    pub(crate) fn new(size: usize, align: usize, flags: AllocFlags) -> Result<Self, AllocError> {
        ensure!(size > 0, error::ZeroSizeSnafu);
        let align = normalize_align(align)?;
        let alignofs = block::alignment_offset(align);
        let nblocks = block::granules_for(alignofs, size).context(error::SizeTooLargeSnafu { size })?;
        Ok(Self {
            size,
            align,
            alignofs,
            nblocks,
            flags,
        })
    }
}

/// Maps `0` to the default alignment and rejects anything a granule-aligned
/// header cannot satisfy.
#[track_caller]
pub(crate) fn normalize_align(align: usize) -> Result<usize, AllocError> {
    let align = if align == 0 { DEFAULT_ALIGN } else { align };
    ensure!(
        align.is_power_of_two() && align <= BLOCK_SIZE,
        error::BadAlignmentSnafu { align }
    );
    Ok(align)
}

impl PoolAllocator {
    /// Allocates `size` bytes aligned to `align`.
    ///
    /// An `align` of `0` selects [`DEFAULT_ALIGN`]. Alignments must be
    /// powers of two no larger than [`BLOCK_SIZE`].
    ///
    /// With [`AllocFlags::CLEAR`] the first `size` bytes are zeroed.
    pub fn allocate(
        &mut self,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, AllocError> {
        let request = Request::new(size, align, flags)?;
        let ptr = self.place(&request)?;
        if flags.contains(AllocFlags::CLEAR) {
            unsafe { ptr.as_ptr().write_bytes(0, size) };
        }
        log::trace!("allocate({size}, {align}, {flags:?}) -> {ptr:p}");
        Ok(ptr)
    }

    /// Finds room for `request`, carves a block for it, and records the
    /// allocation in the block's header.
    ///
    /// Nothing is modified when no pool has room.
    pub(crate) fn place(&mut self, request: &Request) -> Result<NonNull<u8>, AllocError> {
        let (kind, block) = self.find_room(request).context(error::OutOfMemorySnafu {
            size: request.size,
            align: request.align,
            flags: request.flags,
        })?;

        let top = request.flags.contains(AllocFlags::TOP)
            || (kind == PoolKind::Main && request.flags.contains(AllocFlags::TEMP));
        let pool = match kind {
            PoolKind::Temp => self.temp.as_mut(),
            PoolKind::Main => Some(&mut self.main),
        };
        let Some(pool) = pool else {
            unreachable!("room found in a missing pool");
        };
        unsafe {
            let block = pool.take(block, request.nblocks, top);
            let base = BlockHeader::record(
                block,
                request.size,
                request.align,
                request.alignofs,
                request.flags.policy(),
            );
            Ok(NonNull::new_unchecked(base))
        }
    }

    /// Picks the free block a request would be carved from.
    fn find_room(&self, request: &Request) -> Option<(PoolKind, *mut BlockHeader)> {
        let top = request.flags.contains(AllocFlags::TOP);
        if request.flags.contains(AllocFlags::TEMP) {
            if let Some(block) = self
                .temp
                .as_ref()
                .and_then(|temp| temp.find_free(request.nblocks, top))
            {
                return Some((PoolKind::Temp, block));
            }
            if self.temp.is_some() {
                log::debug!(
                    "temp pool cannot hold {} bytes, falling back to main pool",
                    request.size
                );
            }
            return self
                .main
                .find_free(request.nblocks, true)
                .map(|block| (PoolKind::Main, block));
        }
        self.main
            .find_free(request.nblocks, top)
            .map(|block| (PoolKind::Main, block))
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fill, holds, with_test_allocator};

    #[test]
    fn basic_allocation() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let ptr = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            assert_eq!(ptr.addr().get() % 16, 0);
            fill(ptr, 100, 0x33);
            heap.verify().unwrap();
            heap.release(ptr.as_ptr()).unwrap();
        });
    }

    #[test]
    fn zero_size_is_rejected() {
        with_test_allocator(4096, 1024, |heap| {
            assert!(matches!(
                heap.allocate(0, 16, AllocFlags::empty()),
                Err(AllocError::ZeroSize { .. })
            ));
        });
    }

    #[test]
    fn alignment_limits() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            for align in [1, 2, 4, 8, 16, 32, 64] {
                let ptr = heap.allocate(24, align, AllocFlags::empty()).unwrap();
                assert_eq!(ptr.addr().get() % align, 0, "align={align}");
                heap.verify().unwrap();
                heap.release(ptr.as_ptr()).unwrap();
            }
            let ptr = heap.allocate(24, 0, AllocFlags::empty()).unwrap();
            assert_eq!(ptr.addr().get() % DEFAULT_ALIGN, 0);
            assert_eq!(heap.usable_size(ptr.as_ptr()), Some(24));
            heap.release(ptr.as_ptr()).unwrap();

            for align in [128, 3, 48] {
                assert!(matches!(
                    heap.allocate(24, align, AllocFlags::empty()),
                    Err(AllocError::BadAlignment { .. })
                ));
            }
        });
    }

    #[test]
    fn oversized_request_is_rejected() {
        with_test_allocator(4096, 1024, |heap| {
            assert!(matches!(
                heap.allocate(usize::MAX - 8, 16, AllocFlags::empty()),
                Err(AllocError::SizeTooLarge { .. })
            ));
            let before = heap.stats(PoolKind::Main);
            assert!(matches!(
                heap.allocate(8192, 16, AllocFlags::empty()),
                Err(AllocError::OutOfMemory { .. })
            ));
            assert_eq!(heap.stats(PoolKind::Main), before);
        });
    }

    #[test]
    fn clear_zeroes_requested_bytes() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let ptr = heap.allocate(120, 16, AllocFlags::empty()).unwrap();
            fill(ptr, 120, 0xAA);
            heap.release(ptr.as_ptr()).unwrap();

            let ptr = heap.allocate(100, 16, AllocFlags::CLEAR).unwrap();
            assert!(holds(ptr, 100, 0));
            assert!(holds(ptr.add(100), 20, 0xAA));
            heap.release(ptr.as_ptr()).unwrap();
        });
    }

    #[test]
    fn top_allocations_come_from_high_addresses() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let x = heap.allocate(100, 16, AllocFlags::TOP).unwrap();
            let y = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            assert!(x > y);
            let z = heap.allocate(100, 16, AllocFlags::TOP).unwrap();
            assert!(z < x && z > y);
            heap.verify().unwrap();
            for p in [x, y, z] {
                heap.release(p.as_ptr()).unwrap();
            }
        });
    }

    #[test]
    fn temp_requests_prefer_temp_pool() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let main_before = heap.available(AllocFlags::empty());
            let ptr = heap.allocate(100, 16, AllocFlags::TEMP).unwrap();
            assert_eq!(heap.available(AllocFlags::empty()), main_before);
            let info = heap.block_info(ptr.as_ptr()).unwrap();
            assert_eq!(info.pool, PoolKind::Temp);
            assert_eq!(info.alloc_flags, AllocFlags::TEMP);
            heap.release(ptr.as_ptr()).unwrap();
        });
    }

    #[test]
    fn temp_request_without_temp_pool_goes_to_main_top() {
        with_test_allocator(4096, 0, |heap| unsafe {
            let low = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let temp = heap.allocate(100, 16, AllocFlags::TEMP).unwrap();
            assert!(temp > low);
            let info = heap.block_info(temp.as_ptr()).unwrap();
            assert_eq!(info.pool, PoolKind::Main);
            assert_eq!(info.alloc_flags, AllocFlags::TEMP);
            assert_eq!(info.range.end, heap.pool_range(PoolKind::Main).unwrap().end - BLOCK_SIZE);
            assert_eq!(heap.available(AllocFlags::TEMP), 0);
            heap.release(low.as_ptr()).unwrap();
            heap.release(temp.as_ptr()).unwrap();
        });
    }

    #[test]
    fn failed_allocation_leaves_pools_untouched() {
        with_test_allocator(1024, 512, |heap| unsafe {
            let a = heap.allocate(300, 16, AllocFlags::empty()).unwrap();
            let main = heap.stats(PoolKind::Main);
            let temp = heap.stats(PoolKind::Temp);
            assert!(matches!(
                heap.allocate(1024, 16, AllocFlags::TEMP),
                Err(AllocError::OutOfMemory { .. })
            ));
            assert_eq!(heap.stats(PoolKind::Main), main);
            assert_eq!(heap.stats(PoolKind::Temp), temp);
            heap.release(a.as_ptr()).unwrap();
        });
    }
}
