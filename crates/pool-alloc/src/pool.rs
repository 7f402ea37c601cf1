//! A single pool: one contiguous region carved into a block chain.
//!
//! The free list threads every free block of the pool in ascending address
//! order through `prev_free`/`next_free`. The pool keeps both ends so the
//! list can be searched from either side.

use core::{fmt, ops::Range, ptr};

use snafu::ensure;

use crate::{
    block::{BLOCK_SIZE, BlockHeader, BlockState, HEADER_OVERHEAD, MAGIC},
    error::{self, Invariant, InvariantViolation, PoolInitError},
};

/// Identifies one of the allocator's two pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// The general heap.
    Main,
    /// The heap for short-lived allocations.
    Temp,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Main => "main",
            Self::Temp => "temp",
        })
    }
}

impl PoolKind {
    pub(crate) fn tag(self) -> BlockState {
        match self {
            Self::Main => BlockState::empty(),
            Self::Temp => BlockState::TEMP,
        }
    }
}

/// A memory region handed to the allocator.
#[derive(Debug, Clone, Copy)]
pub struct PoolRegion {
    pub base: *mut u8,
    pub size: usize,
}

impl PoolRegion {
    #[must_use]
    pub const fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }

    /// The part of the region that starts and ends on granule boundaries.
    fn granule_aligned(self) -> (*mut u8, usize) {
        let align_offset = self.base.align_offset(BLOCK_SIZE);
        if align_offset == usize::MAX || align_offset > self.size {
            return (self.base, 0);
        }
        let base = self.base.wrapping_add(align_offset);
        let size = (self.size - align_offset) / BLOCK_SIZE * BLOCK_SIZE;
        (base, size)
    }

    pub(crate) fn addr_range(self) -> Range<usize> {
        let (base, size) = self.granule_aligned();
        base.addr()..base.addr() + size
    }
}

pub(crate) struct Pool {
    kind: PoolKind,
    base: *mut u8,
    size: usize,
    first_free: *mut BlockHeader,
    last_free: *mut BlockHeader,
}

impl Pool {
    /// Lays `region` out as one free block followed by the fencepost.
    ///
    /// The region is zero-filled first, so every byte the allocator has not
    /// handed out reads as zero.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes, and must stay
    /// reserved for this pool for as long as the pool is in use.
    pub(crate) unsafe fn new(kind: PoolKind, region: PoolRegion) -> Result<Self, PoolInitError> {
        let (base, size) = region.granule_aligned();
        let granules = size / BLOCK_SIZE;
        ensure!(
            granules >= 2,
            error::TooSmallSnafu {
                kind,
                base: region.base.addr(),
                size: region.size,
            }
        );
        let Ok(nblocks) = u32::try_from(granules - 1) else {
            return error::PoolTooLargeSnafu { kind, size }.fail();
        };

        unsafe {
            base.write_bytes(0, size);
            let first = BlockHeader::init(base, nblocks, ptr::null_mut(), kind.tag() | BlockState::FREE);
            let fencepost = BlockHeader::next(first);
            BlockHeader::init(fencepost.cast(), 0, first, kind.tag());

            log::debug!(
                "{kind} pool initialized: {:#x}..{:#x} ({nblocks} granules)",
                base.addr(),
                base.addr() + size,
            );

            Ok(Self {
                kind,
                base,
                size,
                first_free: first,
                last_free: first,
            })
        }
    }

    pub(crate) fn kind(&self) -> PoolKind {
        self.kind
    }

    pub(crate) fn addr_range(&self) -> Range<usize> {
        self.base.addr()..self.base.addr() + self.size
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn first_block(&self) -> *mut BlockHeader {
        self.base.cast()
    }

    pub(crate) fn fencepost(&self) -> *mut BlockHeader {
        self.base.wrapping_add(self.size - BLOCK_SIZE).cast()
    }

    pub(crate) fn first_free(&self) -> *mut BlockHeader {
        self.first_free
    }

    pub(crate) fn last_free(&self) -> *mut BlockHeader {
        self.last_free
    }

    /// Returns `true` if `addr` could be a user pointer into this pool.
    pub(crate) fn may_contain(&self, addr: usize) -> bool {
        self.base.addr() < addr && addr <= self.fencepost().addr()
    }

    /// Header of the granule holding the byte just below `addr`.
    ///
    /// A user pointer is at most one granule above its header, so this is
    /// the only place the header of a valid pointer can be.
    pub(crate) fn header_below(&self, addr: usize) -> *mut BlockHeader {
        debug_assert!(self.may_contain(addr));
        let offset = (addr - 1 - self.base.addr()) / BLOCK_SIZE * BLOCK_SIZE;
        self.base.wrapping_add(offset).cast()
    }

    /// Aborts if `block` is not a live header of this pool.
    pub(crate) fn check_magic(&self, block: *mut BlockHeader) {
        if unsafe { (*block).magic } != MAGIC {
            self.corrupted(block, Invariant::Magic);
        }
    }

    #[cold]
    #[track_caller]
    pub(crate) fn corrupted(&self, block: *mut BlockHeader, invariant: Invariant) -> ! {
        error::fatal(&self.violation(block, invariant))
    }

    /// Describes a failed invariant at `block`.
    ///
    /// The range covers the whole block when its header is a live header
    /// inside this pool, clipped to the pool's end. A header that is
    /// misplaced or has lost its magic reports its own granule only.
    pub(crate) fn violation(
        &self,
        block: *mut BlockHeader,
        invariant: Invariant,
    ) -> InvariantViolation {
        let start = block.addr();
        let pool = self.addr_range();
        let placed = pool.contains(&start) && start % BLOCK_SIZE == 0;
        let end = if placed && unsafe { (*block).magic } == MAGIC {
            unsafe { BlockHeader::range(block) }.end.min(pool.end)
        } else {
            start.saturating_add(BLOCK_SIZE)
        };
        InvariantViolation {
            pool: self.kind,
            block: start..end,
            invariant,
        }
    }

    /// The free block that follows `block`, if there is one.
    ///
    /// # Safety
    ///
    /// `block` must be a live, non-fencepost header of this pool.
    pub(crate) unsafe fn free_successor(&self, block: *mut BlockHeader) -> Option<*mut BlockHeader> {
        unsafe {
            let next = BlockHeader::next(block);
            self.check_magic(next);
            BlockHeader::is_free_block(next).then_some(next)
        }
    }

    /// The free block that precedes `block`, if there is one.
    ///
    /// # Safety
    ///
    /// `block` must be a live header of this pool.
    pub(crate) unsafe fn free_predecessor(
        &self,
        block: *mut BlockHeader,
    ) -> Option<*mut BlockHeader> {
        unsafe {
            let prev = (*block).prev;
            if prev.is_null() {
                return None;
            }
            self.check_magic(prev);
            BlockHeader::is_free(prev).then_some(prev)
        }
    }

    /// Finds the first free block of at least `nblocks` granules.
    ///
    /// With `top` the list is walked from its high-address end.
    pub(crate) fn find_free(&self, nblocks: u32, top: bool) -> Option<*mut BlockHeader> {
        let mut cursor = if top { self.last_free } else { self.first_free };
        while !cursor.is_null() {
            unsafe {
                self.check_magic(cursor);
                if (*cursor).nblocks >= nblocks {
                    return Some(cursor);
                }
                cursor = if top {
                    (*cursor).prev_free
                } else {
                    (*cursor).next_free
                };
            }
        }
        None
    }

    /// Bytes a caller could obtain from the free block `block`.
    ///
    /// # Safety
    ///
    /// `block` must be a live, non-fencepost header.
    pub(crate) unsafe fn usable_bytes(block: *mut BlockHeader) -> usize {
        unsafe { (*block).nblocks as usize * BLOCK_SIZE - HEADER_OVERHEAD }
    }

    /// Threads `block` onto the free list after `after`, or at the head if
    /// `after` is null.
    ///
    /// # Safety
    ///
    /// `block` must be a live header not on the list; `after` must be null
    /// or a listed block.
    unsafe fn link_free_after(&mut self, block: *mut BlockHeader, after: *mut BlockHeader) {
        unsafe {
            let next = if after.is_null() {
                self.first_free
            } else {
                (*after).next_free
            };
            (*block).prev_free = after;
            (*block).next_free = next;
            if after.is_null() {
                self.first_free = block;
            } else {
                (*after).next_free = block;
            }
            if next.is_null() {
                self.last_free = block;
            } else {
                (*next).prev_free = block;
            }
        }
    }

    /// Inserts `block` into the free list at its address-ordered position.
    ///
    /// # Safety
    ///
    /// `block` must be a live header of this pool that is not on the list.
    pub(crate) unsafe fn insert_free(&mut self, block: *mut BlockHeader) {
        unsafe {
            debug_assert!(BlockHeader::is_free(block));
            let mut after = ptr::null_mut();
            let mut cursor = self.first_free;
            while !cursor.is_null() && cursor < block {
                after = cursor;
                cursor = (*cursor).next_free;
            }
            self.link_free_after(block, after);
        }
    }

    /// Unthreads `block` from the free list.
    ///
    /// # Safety
    ///
    /// `block` must be on this pool's free list.
    pub(crate) unsafe fn unlink_free(&mut self, block: *mut BlockHeader) {
        unsafe {
            let prev = (*block).prev_free;
            let next = (*block).next_free;
            if prev.is_null() {
                self.first_free = next;
            } else {
                (*prev).next_free = next;
            }
            if next.is_null() {
                self.last_free = prev;
            } else {
                (*next).prev_free = prev;
            }
            (*block).prev_free = ptr::null_mut();
            (*block).next_free = ptr::null_mut();
        }
    }

    /// Puts `new` in the free-list slot occupied by `old`.
    ///
    /// Both blocks must fall between the same listed neighbours, which holds
    /// when `new` is carved out of `old`.
    ///
    /// # Safety
    ///
    /// `old` must be listed and `new` must be a live header that is not.
    pub(crate) unsafe fn replace_free(&mut self, old: *mut BlockHeader, new: *mut BlockHeader) {
        unsafe {
            let after = (*old).prev_free;
            self.unlink_free(old);
            self.link_free_after(new, after);
        }
    }

    /// Takes `nblocks` granules out of the free block `block`.
    ///
    /// The allocated part is the low end of `block`, or the high end with
    /// `top`; whatever is left over stays on the free list.
    ///
    /// # Safety
    ///
    /// `block` must be on this pool's free list with at least `nblocks`
    /// granules.
    pub(crate) unsafe fn take(
        &mut self,
        block: *mut BlockHeader,
        nblocks: u32,
        top: bool,
    ) -> *mut BlockHeader {
        unsafe {
            let total = (*block).nblocks;
            debug_assert!(total >= nblocks);
            let tag = self.kind.tag();
            let follower = BlockHeader::next(block);

            if total == nblocks {
                self.unlink_free(block);
                (*block).state = tag;
                return block;
            }

            let rest = total - nblocks;
            if top {
                (*block).nblocks = rest;
                let used = BlockHeader::init(BlockHeader::next(block).cast(), nblocks, block, tag);
                (*follower).prev = used;
                used
            } else {
                let free = BlockHeader::init(
                    BlockHeader::offset(block, nblocks).cast(),
                    rest,
                    block,
                    tag | BlockState::FREE,
                );
                (*follower).prev = free;
                self.replace_free(block, free);
                (*block).nblocks = nblocks;
                (*block).state = tag;
                block
            }
        }
    }

    /// Splits the granules of an allocated `block` beyond `nblocks` off into
    /// a free block, merging it with a free block that follows.
    ///
    /// # Safety
    ///
    /// `block` must be an allocated block of this pool larger than
    /// `nblocks`.
    pub(crate) unsafe fn shrink(&mut self, block: *mut BlockHeader, nblocks: u32) {
        unsafe {
            let total = (*block).nblocks;
            debug_assert!(nblocks < total);
            let follower = BlockHeader::next(block);
            self.check_magic(follower);
            let tail = BlockHeader::init(
                BlockHeader::offset(block, nblocks).cast(),
                total - nblocks,
                block,
                self.kind.tag() | BlockState::FREE,
            );
            (*follower).prev = tail;
            (*block).nblocks = nblocks;
            self.insert_free(tail);
            if BlockHeader::is_free_block(follower) {
                self.absorb_next(tail);
            }
        }
    }

    /// Merges the free block after `block` into `block`.
    ///
    /// # Safety
    ///
    /// `block` must be a live header of this pool whose successor is free.
    pub(crate) unsafe fn absorb_next(&mut self, block: *mut BlockHeader) {
        unsafe {
            let next = BlockHeader::next(block);
            debug_assert!(BlockHeader::is_free_block(next));
            let follower = BlockHeader::next(next);
            self.check_magic(follower);
            self.unlink_free(next);
            (*block).nblocks += (*next).nblocks;
            (*follower).prev = block;
            BlockHeader::clear(next);
        }
    }

    /// Returns an allocated block to the free list, coalescing it with free
    /// neighbours.
    ///
    /// # Safety
    ///
    /// `block` must be a validated, allocated block of this pool.
    pub(crate) unsafe fn release(&mut self, block: *mut BlockHeader) {
        unsafe {
            BlockHeader::forget_allocation(block);
            self.insert_free(block);
            if self.free_successor(block).is_some() {
                self.absorb_next(block);
            }
            if let Some(prev) = self.free_predecessor(block) {
                self.absorb_next(prev);
            }
        }
    }

    /// Sum of usable bytes over the free list.
    pub(crate) fn available(&self) -> usize {
        self.free_blocks()
            .map(|block| unsafe { Self::usable_bytes(block) })
            .sum()
    }

    /// Usable bytes of the largest free block.
    pub(crate) fn largest_contiguous(&self) -> usize {
        self.free_blocks()
            .map(|block| unsafe { Self::usable_bytes(block) })
            .max()
            .unwrap_or(0)
    }

    /// Iterates the free list from low to high addresses.
    pub(crate) fn free_blocks(&self) -> impl Iterator<Item = *mut BlockHeader> + '_ {
        let mut cursor = self.first_free;
        core::iter::from_fn(move || {
            if cursor.is_null() {
                return None;
            }
            let block = cursor;
            self.check_magic(block);
            cursor = unsafe { (*block).next_free };
            Some(block)
        })
    }
}
