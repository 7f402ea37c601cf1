//! Resizing live allocations.
//!
//! A resize that keeps the recorded placement policy is served in place
//! when it can be: shrinking returns the tail to the free list, and growing
//! absorbs a free successor or a free predecessor. Anything else moves the
//! data into a fresh block.

use core::ptr::{self, NonNull};

use snafu::{OptionExt as _, ensure};

use crate::{
    AllocFlags, PoolAllocator,
    allocate::{self, Request},
    block::{self, BLOCK_SIZE, BlockHeader, BlockState},
    error::{self, AllocError},
    pool::Pool,
};

/// How a resize was served, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    Unchanged,
    Shrunk,
    Forward,
    Backward,
    Relocated,
}

impl PoolAllocator {
    /// Resizes the allocation at `ptr` to `size` bytes.
    ///
    /// The first `min(size, old_size)` bytes are preserved. The returned
    /// pointer may differ from `ptr`, in which case `ptr` is no longer
    /// valid. A null `ptr` behaves like [`allocate`](Self::allocate).
    ///
    /// Asking for a different TEMP/TOP policy than the allocation was made
    /// with, or for an alignment the current pointer does not satisfy,
    /// always moves the data. [`AllocFlags::CLEAR`] is ignored.
    ///
    /// On failure, the original allocation is left untouched.
    ///
    /// # Safety
    ///
    /// If the allocation moves, the caller must not access the memory
    /// behind `ptr` afterwards.
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, AllocError> {
        let flags = flags.difference(AllocFlags::CLEAR);
        if ptr.is_null() {
            return self.allocate(size, align, flags);
        }
        let block = self.lookup_or_reject(ptr)?;
        ensure!(size > 0, error::ZeroSizeSnafu);
        let align = allocate::normalize_align(align)?;

        let (new_ptr, path) = unsafe {
            let same_policy = (*block).state.policy() == flags.policy();
            if same_policy && ptr.addr() % align == 0 {
                self.resize_in_place(block, size, align)?
            } else {
                (self.relocate(block, size, align, flags)?, Path::Relocated)
            }
        };
        log::trace!("reallocate({ptr:p}, {size}, {align}, {flags:?}) -> {new_ptr:p} ({path:?})");
        Ok(new_ptr)
    }

    /// Tries every in-place strategy before falling back to relocation.
    unsafe fn resize_in_place(
        &mut self,
        block: *mut BlockHeader,
        size: usize,
        align: usize,
    ) -> Result<(NonNull<u8>, Path), AllocError> {
        unsafe {
            let alignofs = usize::from((*block).alignofs);
            let nblocks =
                block::granules_for(alignofs, size).context(error::SizeTooLargeSnafu { size })?;
            let current = (*block).nblocks;
            let policy = (*block).state.policy();

            let path = if nblocks == current {
                Path::Unchanged
            } else if nblocks < current {
                self.pool_of_mut(block).shrink(block, nblocks);
                Path::Shrunk
            } else if self.pool_of_mut(block).extend_forward(block, nblocks) {
                Path::Forward
            } else if let Some(moved) = self.pool_of_mut(block).extend_backward(block, nblocks) {
                let base = BlockHeader::record(moved, size, align, alignofs, policy);
                return Ok((NonNull::new_unchecked(base), Path::Backward));
            } else {
                return Ok((self.relocate(block, size, align, policy)?, Path::Relocated));
            };

            let base = BlockHeader::record(block, size, align, alignofs, policy);
            Ok((NonNull::new_unchecked(base), path))
        }
    }

    /// Moves the allocation into a new block placed according to `flags`.
    unsafe fn relocate(
        &mut self,
        block: *mut BlockHeader,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, AllocError> {
        let request = Request::new(size, align, flags)?;
        let new_ptr = self.place(&request)?;
        unsafe {
            let old_base = (*block).base;
            let len = (*block).alloc_size.min(size);
            ptr::copy_nonoverlapping(old_base, new_ptr.as_ptr(), len);
            self.pool_of_mut(block).release(block);
        }
        Ok(new_ptr)
    }
}

impl Pool {
    /// Grows `block` to `nblocks` granules by absorbing the front of a free
    /// successor. Returns `false`, changing nothing, if the successor is not
    /// free or too small.
    ///
    /// # Safety
    ///
    /// `block` must be an allocated block of this pool with fewer than
    /// `nblocks` granules.
    unsafe fn extend_forward(&mut self, block: *mut BlockHeader, nblocks: u32) -> bool {
        unsafe {
            let need = nblocks - (*block).nblocks;
            let Some(next) = self.free_successor(block) else {
                return false;
            };
            let available = (*next).nblocks;
            if available < need {
                return false;
            }

            let follower = BlockHeader::next(next);
            self.check_magic(follower);
            if available == need {
                self.unlink_free(next);
                (*follower).prev = block;
            } else {
                let rest = BlockHeader::init(
                    BlockHeader::offset(next, need).cast(),
                    available - need,
                    block,
                    (*next).state.pool_tag() | BlockState::FREE,
                );
                self.replace_free(next, rest);
                (*follower).prev = rest;
            }
            BlockHeader::clear(next);
            (*block).nblocks = nblocks;
            true
        }
    }

    /// Grows `block` to `nblocks` granules by merging it with its free
    /// predecessor, and its free successor if there is one, then carving
    /// the result back down. The user data is moved to the new position.
    ///
    /// Returns the header of the grown block, or `None`, changing nothing,
    /// if the neighbours together are too small. The allocation record of
    /// the returned header still has to be written.
    ///
    /// # Safety
    ///
    /// `block` must be an allocated block of this pool with fewer than
    /// `nblocks` granules, whose successor is not free with room for the
    /// whole growth.
    unsafe fn extend_backward(
        &mut self,
        block: *mut BlockHeader,
        nblocks: u32,
    ) -> Option<*mut BlockHeader> {
        unsafe {
            let prev = self.free_predecessor(block)?;
            let next = self.free_successor(block);
            let prev_len = (*prev).nblocks;
            let next_len = next.map_or(0, |next| (*next).nblocks);
            let total = u64::from(prev_len) + u64::from((*block).nblocks) + u64::from(next_len);
            if total < u64::from(nblocks) {
                return None;
            }
            let Ok(total) = u32::try_from(total) else {
                return None;
            };

            let tag = (*block).state.pool_tag();
            let old_base = (*block).base;
            let old_size = (*block).alloc_size;
            let alignofs = usize::from((*block).alignofs);
            let below = (*prev).prev;
            let follower = next.map_or_else(|| BlockHeader::next(block), |next| BlockHeader::next(next));
            self.check_magic(follower);

            self.unlink_free(prev);
            if let Some(next) = next {
                self.unlink_free(next);
                BlockHeader::clear(next);
            }
            BlockHeader::clear(block);

            // When the successor is the bigger neighbour the block is cut from
            // the front of the merged region, otherwise from its back.
            let from_front = next_len > prev_len;
            let rest = total - nblocks;
            let start = if from_front {
                prev
            } else {
                BlockHeader::offset(prev, rest)
            };
            let new_base = start.cast::<u8>().add(block::HEADER_SIZE + alignofs);
            ptr::copy(old_base, new_base, old_size);

            let grown;
            if from_front {
                grown = BlockHeader::init(start.cast(), nblocks, below, tag);
                if rest == 0 {
                    (*follower).prev = grown;
                } else {
                    let free = BlockHeader::init(
                        BlockHeader::offset(grown, nblocks).cast(),
                        rest,
                        grown,
                        tag | BlockState::FREE,
                    );
                    self.insert_free(free);
                    (*follower).prev = free;
                }
            } else {
                let mut lower = below;
                if rest > 0 {
                    lower = BlockHeader::init(prev.cast(), rest, below, tag | BlockState::FREE);
                    self.insert_free(lower);
                }
                grown = BlockHeader::init(start.cast(), nblocks, lower, tag);
                (*follower).prev = grown;
            }
            debug_assert_eq!(BlockHeader::next(grown).addr() % BLOCK_SIZE, 0);
            Some(grown)
        }
    }
}
