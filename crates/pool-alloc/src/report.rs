//! Heap introspection: free-space queries, block walks and dumps.

use core::{fmt, iter::FusedIterator, ops::Range, ptr};

use crate::{
    AllocFlags, PoolAllocator, PoolKind,
    block::{BLOCK_SIZE, BlockHeader},
    pool::Pool,
};

/// Whether a block is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Free,
    Allocated,
}

/// A snapshot of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub pool: PoolKind,
    /// Addresses covered by the block, header included.
    pub range: Range<usize>,
    pub granules: u32,
    pub status: BlockStatus,
    /// Requested size of an allocated block, `0` for a free one.
    pub requested: usize,
    pub align: usize,
    /// Placement policy the block was allocated with.
    pub alloc_flags: AllocFlags,
}

impl BlockInfo {
    /// # Safety
    ///
    /// `block` must be a live, non-fencepost header of `pool`.
    unsafe fn read(pool: PoolKind, block: *mut BlockHeader) -> Self {
        unsafe {
            let free = BlockHeader::is_free(block);
            Self {
                pool,
                range: BlockHeader::range(block),
                granules: (*block).nblocks,
                status: if free {
                    BlockStatus::Free
                } else {
                    BlockStatus::Allocated
                },
                requested: (*block).alloc_size,
                align: (*block).align as usize,
                alloc_flags: (*block).state.policy(),
            }
        }
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:#010x}..{:#010x} {:>5} ",
            self.pool, self.range.start, self.range.end, self.granules
        )?;
        match self.status {
            BlockStatus::Free => write!(f, "FREE"),
            BlockStatus::Allocated => write!(
                f,
                "USED size={} align={} flags={:?}",
                self.requested, self.align, self.alloc_flags
            ),
        }
    }
}

/// Usage summary of one pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes managed by the pool, fencepost included.
    pub total: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    /// Sum of the requested sizes of all live allocations.
    pub used_bytes: usize,
    pub available: usize,
    pub largest: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} used={} in {} blocks, available={} in {} blocks, largest={}",
            self.total,
            self.used_bytes,
            self.used_blocks,
            self.available,
            self.free_blocks,
            self.largest
        )
    }
}

/// Iterator over the blocks of a pool in address order.
///
/// Created by [`PoolAllocator::blocks`].
pub struct Blocks<'a> {
    pool: Option<&'a Pool>,
    cursor: *mut BlockHeader,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let pool = self.pool?;
        let block = self.cursor;
        pool.check_magic(block);
        unsafe {
            if BlockHeader::is_fencepost(block) {
                self.pool = None;
                return None;
            }
            self.cursor = BlockHeader::next(block);
            Some(BlockInfo::read(pool.kind(), block))
        }
    }
}

impl FusedIterator for Blocks<'_> {}

impl PoolAllocator {
    fn select(&self, flags: AllocFlags) -> Option<&Pool> {
        if flags.contains(AllocFlags::TEMP) {
            self.temp.as_ref()
        } else {
            Some(&self.main)
        }
    }

    /// Free bytes in the pool `flags` selects: the temp pool with
    /// [`AllocFlags::TEMP`], the main pool otherwise.
    ///
    /// Each free block contributes its size minus one granule of header
    /// overhead. Without a temp pool, TEMP selects nothing and the result
    /// is `0`.
    #[must_use]
    pub fn available(&self, flags: AllocFlags) -> usize {
        self.select(flags).map_or(0, Pool::available)
    }

    /// The largest request the pool `flags` selects could satisfy at
    /// [`DEFAULT_ALIGN`](crate::DEFAULT_ALIGN) or any stricter alignment.
    #[must_use]
    pub fn largest_contiguous(&self, flags: AllocFlags) -> usize {
        self.select(flags).map_or(0, Pool::largest_contiguous)
    }

    /// Address range managed by a pool, or `None` if the allocator has no
    /// such pool.
    #[must_use]
    pub fn pool_range(&self, kind: PoolKind) -> Option<Range<usize>> {
        self.pool(kind).map(Pool::addr_range)
    }

    /// Walks the blocks of a pool from low to high addresses, excluding the
    /// fencepost.
    #[must_use]
    pub fn blocks(&self, kind: PoolKind) -> Blocks<'_> {
        let pool = self.pool(kind);
        Blocks {
            pool,
            cursor: pool.map_or(ptr::null_mut(), Pool::first_block),
        }
    }

    /// Describes the block of a live allocation.
    #[must_use]
    pub fn block_info(&self, ptr: *mut u8) -> Option<BlockInfo> {
        let block = self.lookup(ptr)?;
        let kind = self.pool_containing(ptr.addr())?.kind();
        Some(unsafe { BlockInfo::read(kind, block) })
    }

    /// Requested size of a live allocation.
    #[must_use]
    pub fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        let block = self.lookup(ptr)?;
        Some(unsafe { (*block).alloc_size })
    }

    /// Summarizes a pool; all zero if the allocator has no such pool.
    #[must_use]
    pub fn stats(&self, kind: PoolKind) -> PoolStats {
        let Some(pool) = self.pool(kind) else {
            return PoolStats::default();
        };
        let mut stats = PoolStats {
            total: pool.size(),
            available: pool.available(),
            largest: pool.largest_contiguous(),
            ..PoolStats::default()
        };
        for block in self.blocks(kind) {
            match block.status {
                BlockStatus::Free => stats.free_blocks += 1,
                BlockStatus::Allocated => {
                    stats.used_blocks += 1;
                    stats.used_bytes += block.requested;
                }
            }
        }
        stats
    }

    /// Logs every block of every pool at info level.
    pub fn dump(&self) {
        for pool in self.pools() {
            let kind = pool.kind();
            log::info!("{kind} pool: {}", self.stats(kind));
            for block in self.blocks(kind) {
                log::info!("  {block}");
            }
        }
    }

    /// Writes the records [`dump`](Self::dump) logs, one line per block.
    ///
    /// # Errors
    ///
    /// Propagates errors from `out`.
    pub fn dump_to<W>(&self, out: &mut W) -> fmt::Result
    where
        W: fmt::Write,
    {
        for pool in self.pools() {
            let kind = pool.kind();
            writeln!(out, "{kind} pool: {}", self.stats(kind))?;
            for block in self.blocks(kind) {
                writeln!(out, "  {block}")?;
            }
        }
        Ok(())
    }
}

/// Bytes of a pool that blocks can cover: everything but the fencepost.
pub(crate) fn block_capacity(pool: &Pool) -> usize {
    pool.size() - BLOCK_SIZE
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::with_test_allocator;

    #[test]
    fn fresh_pools_report_full_capacity() {
        with_test_allocator(4096, 1024, |heap| {
            assert_eq!(heap.available(AllocFlags::empty()), 62 * BLOCK_SIZE);
            assert_eq!(heap.available(AllocFlags::TEMP), 14 * BLOCK_SIZE);
            assert_eq!(heap.available(AllocFlags::TEMP | AllocFlags::TOP), 14 * BLOCK_SIZE);
            assert_eq!(
                heap.largest_contiguous(AllocFlags::empty()),
                heap.available(AllocFlags::empty())
            );

            let stats = heap.stats(PoolKind::Temp);
            assert_eq!(
                stats,
                PoolStats {
                    total: 1024,
                    used_blocks: 0,
                    free_blocks: 1,
                    used_bytes: 0,
                    available: 14 * BLOCK_SIZE,
                    largest: 14 * BLOCK_SIZE,
                }
            );
        });
    }

    #[test]
    fn missing_temp_pool_reports_nothing() {
        with_test_allocator(4096, 0, |heap| {
            assert_eq!(heap.available(AllocFlags::TEMP), 0);
            assert_eq!(heap.largest_contiguous(AllocFlags::TEMP), 0);
            assert_eq!(heap.pool_range(PoolKind::Temp), None);
            assert_eq!(heap.blocks(PoolKind::Temp).count(), 0);
            assert_eq!(heap.stats(PoolKind::Temp), PoolStats::default());
        });
    }

    #[test]
    fn blocks_walk_in_address_order() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let a = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let b = heap.allocate(10, 32, AllocFlags::TOP).unwrap();

            let blocks: Vec<_> = heap.blocks(PoolKind::Main).collect();
            assert_eq!(blocks.len(), 3);
            assert!(blocks.windows(2).all(|w| w[0].range.end == w[1].range.start));
            assert_eq!(
                blocks.iter().map(|b| b.range.len()).sum::<usize>(),
                block_capacity(&heap.main)
            );

            assert_eq!(blocks[0], heap.block_info(a.as_ptr()).unwrap());
            assert_eq!(blocks[0].status, BlockStatus::Allocated);
            assert_eq!(blocks[0].requested, 100);
            assert_eq!(blocks[1].status, BlockStatus::Free);
            assert_eq!(blocks[1].requested, 0);
            assert_eq!(blocks[2].align, 32);
            assert_eq!(blocks[2].alloc_flags, AllocFlags::TOP);

            let stats = heap.stats(PoolKind::Main);
            assert_eq!(stats.used_blocks, 2);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.used_bytes, 110);

            heap.release(a.as_ptr()).unwrap();
            heap.release(b.as_ptr()).unwrap();
        });
    }

    #[test]
    fn largest_never_exceeds_available() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let a = heap.allocate(300, 16, AllocFlags::empty()).unwrap();
            let b = heap.allocate(64, 16, AllocFlags::empty()).unwrap();
            heap.release(a.as_ptr()).unwrap();
            let largest = heap.largest_contiguous(AllocFlags::empty());
            let available = heap.available(AllocFlags::empty());
            assert!(largest < available);
            assert_eq!(available, largest + 5 * BLOCK_SIZE);
            heap.release(b.as_ptr()).unwrap();
        });
    }

    #[test]
    fn dump_lists_every_block() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let a = heap.allocate(100, 16, AllocFlags::TEMP).unwrap();
            let mut out = String::new();
            heap.dump_to(&mut out).unwrap();
            let lines: Vec<_> = out.lines().collect();
            assert_eq!(lines.len(), 5);
            assert!(lines[0].starts_with("main pool: "));
            assert!(lines[1].ends_with("FREE"));
            assert!(lines[2].starts_with("temp pool: "));
            assert!(lines[3].contains("USED size=100 align=16"));
            heap.dump();
            heap.release(a.as_ptr()).unwrap();
        });
    }
}
