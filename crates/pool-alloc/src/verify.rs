//! Full integrity walk over both pools.

use core::ptr;

use crate::{
    PoolAllocator,
    block::{BLOCK_SIZE, BlockHeader, HEADER_SIZE, MAGIC},
    error::{Invariant, InvariantViolation},
    pool::Pool,
    report,
};

impl PoolAllocator {
    /// Checks every structural invariant of both pools.
    ///
    /// Unlike the checks on the allocation paths, which abort, this returns
    /// the first violation found. Every walk is bounded by the pool size, so
    /// a corrupted chain cannot make it loop.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        for pool in self.pools() {
            let free_count = verify_chain(pool)?;
            verify_free_list(pool, free_count)?;
        }
        Ok(())
    }
}

/// Walks the block chain up to the fencepost and returns how many free
/// blocks it holds.
fn verify_chain(pool: &Pool) -> Result<usize, InvariantViolation> {
    let fail = |block, invariant| Err(pool.violation(block, invariant));
    let fencepost = pool.fencepost();
    let tag = pool.kind().tag();

    let mut prev: *mut BlockHeader = ptr::null_mut();
    let mut prev_free = false;
    let mut block = pool.first_block();
    let mut covered = 0;
    let mut free_count = 0;
    loop {
        unsafe {
            if (*block).magic != MAGIC {
                return fail(block, Invariant::Magic);
            }
            if !ptr::eq((*block).prev, prev) {
                return fail(block, Invariant::PrevLink);
            }
            if (*block).state.pool_tag() != tag {
                return fail(block, Invariant::PoolTag);
            }
            if BlockHeader::is_fencepost(block) || block == fencepost {
                let intact = block == fencepost
                    && BlockHeader::is_fencepost(block)
                    && !BlockHeader::is_free(block);
                if !intact {
                    return fail(block, Invariant::Fencepost);
                }
                break;
            }

            let len = (*block).nblocks as usize * BLOCK_SIZE;
            if len > fencepost.addr() - block.addr() {
                return fail(block, Invariant::Bounds);
            }
            let free = BlockHeader::is_free(block);
            if free {
                if prev_free {
                    return fail(block, Invariant::Coalesce);
                }
                free_count += 1;
            } else if !user_pointer_ok(block) {
                return fail(block, Invariant::UserPointer);
            }

            covered += len;
            prev_free = free;
            prev = block;
            block = BlockHeader::next(block);
        }
    }

    if covered != report::block_capacity(pool) {
        return fail(fencepost, Invariant::BlockSum);
    }
    Ok(free_count)
}

/// Checks the allocation record of an allocated block.
///
/// # Safety
///
/// `block` must be a live, non-fencepost header.
unsafe fn user_pointer_ok(block: *mut BlockHeader) -> bool {
    unsafe {
        let align = (*block).align as usize;
        let base = (*block).base;
        let expected = block.addr() + HEADER_SIZE + usize::from((*block).alignofs);
        let end = BlockHeader::range(block).end;
        align.is_power_of_two()
            && align <= BLOCK_SIZE
            && base.addr() == expected
            && base.addr() % align == 0
            && (*block).alloc_size > 0
            && (*block).alloc_size <= end - expected
    }
}

/// Walks the free list and checks it against the chain walk.
fn verify_free_list(pool: &Pool, free_count: usize) -> Result<(), InvariantViolation> {
    let fail = |block, invariant| Err(pool.violation(block, invariant));
    let range = pool.addr_range();
    let fencepost = pool.fencepost();

    let mut prev: *mut BlockHeader = ptr::null_mut();
    let mut cursor = pool.first_free();
    let mut listed = 0;
    while !cursor.is_null() {
        let placed = range.contains(&cursor.addr())
            && cursor < fencepost
            && cursor.addr() % BLOCK_SIZE == 0;
        if !placed {
            return fail(cursor, Invariant::FreeList);
        }
        if !prev.is_null() && cursor <= prev {
            return fail(cursor, Invariant::FreeListOrder);
        }
        unsafe {
            if (*cursor).magic != MAGIC {
                return fail(cursor, Invariant::Magic);
            }
            if !BlockHeader::is_free(cursor) || BlockHeader::is_fencepost(cursor) {
                return fail(cursor, Invariant::FreeList);
            }
            if !ptr::eq((*cursor).prev_free, prev) {
                return fail(cursor, Invariant::FreeListLink);
            }
            listed += 1;
            if listed > free_count {
                return fail(cursor, Invariant::FreeList);
            }
            prev = cursor;
            cursor = (*cursor).next_free;
        }
    }

    if !ptr::eq(pool.last_free(), prev) {
        return fail(pool.last_free(), Invariant::FreeListLink);
    }
    if listed != free_count {
        return fail(pool.first_free(), Invariant::FreeList);
    }
    Ok(())
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocFlags, PoolKind, block::BlockState, testing::with_test_allocator};

    fn header_of(heap: &PoolAllocator, ptr: ptr::NonNull<u8>) -> *mut BlockHeader {
        heap.lookup(ptr.as_ptr()).unwrap()
    }

    #[test]
    fn healthy_heap_verifies() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            heap.verify().unwrap();
            let a = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let b = heap.allocate(100, 64, AllocFlags::TOP).unwrap();
            let c = heap.allocate(100, 1, AllocFlags::TEMP).unwrap();
            heap.verify().unwrap();
            heap.release(b.as_ptr()).unwrap();
            heap.verify().unwrap();
            heap.release(a.as_ptr()).unwrap();
            heap.release(c.as_ptr()).unwrap();
        });
    }

    #[test]
    fn detects_bad_magic() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let a = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let block = header_of(heap, a);
            (*block).magic = 0;
            let err = heap.verify().unwrap_err();
            assert_eq!(err.invariant, Invariant::Magic);
            assert_eq!(err.pool, PoolKind::Main);
            assert_eq!(err.block, block.addr()..block.addr() + BLOCK_SIZE);
            (*block).magic = MAGIC;
            heap.release(a.as_ptr()).unwrap();
        });
    }

    #[test]
    fn detects_broken_prev_link() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let a = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let b = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let block = header_of(heap, b);
            let saved = (*block).prev;
            (*block).prev = block;
            assert_eq!(heap.verify().unwrap_err().invariant, Invariant::PrevLink);
            (*block).prev = saved;
            heap.release(a.as_ptr()).unwrap();
            heap.release(b.as_ptr()).unwrap();
        });
    }

    #[test]
    fn detects_adjacent_free_blocks() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let a = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let b = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            heap.release(a.as_ptr()).unwrap();
            let block = header_of(heap, b);
            let saved = (*block).state;
            (*block).state = saved | BlockState::FREE;
            assert_eq!(heap.verify().unwrap_err().invariant, Invariant::Coalesce);
            (*block).state = saved;
            heap.release(b.as_ptr()).unwrap();
        });
    }

    #[test]
    fn detects_unlisted_free_block() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let a = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let b = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let block = header_of(heap, a);
            let saved = (*block).state;
            (*block).state = saved | BlockState::FREE;
            assert_eq!(heap.verify().unwrap_err().invariant, Invariant::FreeList);
            (*block).state = saved;
            heap.release(a.as_ptr()).unwrap();
            heap.release(b.as_ptr()).unwrap();
        });
    }

    #[test]
    fn detects_broken_free_list_links() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let a = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let b = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let c = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            heap.release(b.as_ptr()).unwrap();

            let listed = heap.main.first_free();
            let saved = (*listed).prev_free;
            (*listed).prev_free = listed;
            assert_eq!(heap.verify().unwrap_err().invariant, Invariant::FreeListLink);
            (*listed).prev_free = saved;

            let second = (*listed).next_free;
            (*listed).next_free = listed;
            assert_eq!(heap.verify().unwrap_err().invariant, Invariant::FreeListOrder);
            (*listed).next_free = second;

            for p in [a, c] {
                heap.release(p.as_ptr()).unwrap();
            }
        });
    }

    #[test]
    fn detects_bad_user_pointer_and_tag() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let a = heap.allocate(100, 16, AllocFlags::TEMP).unwrap();
            let block = header_of(heap, a);

            (*block).alloc_size = 4096;
            let err = heap.verify().unwrap_err();
            assert_eq!(err.invariant, Invariant::UserPointer);
            assert_eq!(err.pool, PoolKind::Temp);
            assert_eq!(err.block, block.addr()..block.addr() + 3 * BLOCK_SIZE);
            (*block).alloc_size = 100;

            (*block).state = (*block).state.difference(BlockState::TEMP);
            assert_eq!(heap.verify().unwrap_err().invariant, Invariant::PoolTag);
            (*block).state.insert(BlockState::TEMP);

            heap.release(a.as_ptr()).unwrap();
        });
    }

    #[test]
    fn detects_oversized_block() {
        with_test_allocator(4096, 1024, |heap| unsafe {
            let a = heap.allocate(100, 16, AllocFlags::empty()).unwrap();
            let block = header_of(heap, a);
            let saved = (*block).nblocks;
            (*block).nblocks = 1000;
            let err = heap.verify().unwrap_err();
            assert_eq!(err.invariant, Invariant::Bounds);
            assert_eq!(err.block, block.addr()..heap.main.addr_range().end);
            (*block).nblocks = saved;
            heap.release(a.as_ptr()).unwrap();
        });
    }
}
