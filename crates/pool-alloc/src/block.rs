//! Block headers and granule arithmetic.
//!
//! Every block starts on a granule boundary with a [`BlockHeader`]; the
//! header of the block that follows sits `nblocks * BLOCK_SIZE` bytes
//! further on. A header with `nblocks == 0` is the pool's fencepost.
//!
//! ```text
//!  granule boundary                                   next header
//!  ↓                                                  ↓
//!  ┌────────────────┬──────────┬────────────────────┬──────────
//!  │ BlockHeader    │ alignofs │ user data ...      │ BlockHeader
//!  └────────────────┴──────────┴────────────────────┴──────────
//!                              ↑
//!                              base
//! ```

use core::ptr;

use bitflags::bitflags;

use crate::AllocFlags;

/// Size of the allocation granule in bytes.
///
/// Every block spans a whole number of granules, and no allocation may ask
/// for a stricter alignment than this.
pub const BLOCK_SIZE: usize = 64;

/// Alignment used when a caller passes `0`.
pub const DEFAULT_ALIGN: usize = 16;

/// Sentinel stamped into every live header.
pub(crate) const MAGIC: u32 = 0x504F_4F4C;

pub(crate) const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Bytes at the start of every block that can never be handed to a caller,
/// whatever alignment the caller asks for.
pub(crate) const HEADER_OVERHEAD: usize = HEADER_SIZE.next_multiple_of(BLOCK_SIZE);

const _: () = assert!(BLOCK_SIZE.is_power_of_two());
const _: () = assert!(HEADER_SIZE <= BLOCK_SIZE);
const _: () = assert!(align_of::<BlockHeader>() <= BLOCK_SIZE);
const _: () = assert!(DEFAULT_ALIGN <= BLOCK_SIZE);

bitflags! {
    /// Per-block state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct BlockState: u8 {
        /// The block is threaded on its pool's free list.
        const FREE = 1 << 0;
        /// The block lives in the temp pool.
        const TEMP = 1 << 1;
        /// The caller asked for `AllocFlags::TEMP`.
        const ALLOC_TEMP = 1 << 2;
        /// The caller asked for `AllocFlags::TOP`.
        const ALLOC_TOP = 1 << 3;
    }
}

impl BlockState {
    pub(crate) fn from_policy(flags: AllocFlags) -> Self {
        let mut state = Self::empty();
        state.set(Self::ALLOC_TEMP, flags.contains(AllocFlags::TEMP));
        state.set(Self::ALLOC_TOP, flags.contains(AllocFlags::TOP));
        state
    }

    pub(crate) fn policy(self) -> AllocFlags {
        let mut flags = AllocFlags::empty();
        flags.set(AllocFlags::TEMP, self.contains(Self::ALLOC_TEMP));
        flags.set(AllocFlags::TOP, self.contains(Self::ALLOC_TOP));
        flags
    }

    /// The pool tag alone.
    pub(crate) fn pool_tag(self) -> Self {
        self.intersection(Self::TEMP)
    }
}

/// Metadata at the low address of every block.
///
/// The layout has no padding, so writing a header leaves every byte it
/// covers in a defined state.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct BlockHeader {
    pub(crate) magic: u32,
    /// Block size in granules; `0` marks the fencepost.
    pub(crate) nblocks: u32,
    pub(crate) align: u32,
    /// Bytes between the end of the header and `base`.
    pub(crate) alignofs: u16,
    pub(crate) state: BlockState,
    reserved: u8,
    /// The block immediately below this one, or null for the lowest block.
    pub(crate) prev: *mut Self,
    pub(crate) prev_free: *mut Self,
    pub(crate) next_free: *mut Self,
    /// Requested byte count of an allocated block.
    pub(crate) alloc_size: usize,
    /// User pointer of an allocated block.
    pub(crate) base: *mut u8,
}

impl BlockHeader {
    /// Writes a fresh header at `at` and returns it.
    ///
    /// # Safety
    ///
    /// `at` must be a granule-aligned address inside a pool, valid for
    /// writes of `HEADER_SIZE` bytes.
    pub(crate) unsafe fn init(
        at: *mut u8,
        nblocks: u32,
        prev: *mut Self,
        state: BlockState,
    ) -> *mut Self {
        #[expect(clippy::cast_ptr_alignment)]
        let block = at.cast::<Self>();
        debug_assert!(at.addr() % BLOCK_SIZE == 0, "header must sit on a granule");
        unsafe {
            block.write(Self {
                magic: MAGIC,
                nblocks,
                align: 0,
                alignofs: 0,
                state,
                reserved: 0,
                prev,
                prev_free: ptr::null_mut(),
                next_free: ptr::null_mut(),
                alloc_size: 0,
                base: ptr::null_mut(),
            });
        }
        block
    }

    /// Wipes a header that has been absorbed by a neighbour.
    ///
    /// # Safety
    ///
    /// `block` must point at header memory owned by a pool.
    pub(crate) unsafe fn clear(block: *mut Self) {
        unsafe { block.cast::<u8>().write_bytes(0, HEADER_SIZE) }
    }

    /// Returns the header `granules` granules above `block`.
    ///
    /// # Safety
    ///
    /// The resulting address must stay inside the pool containing `block`.
    pub(crate) unsafe fn offset(block: *mut Self, granules: u32) -> *mut Self {
        unsafe { block.byte_add(granules as usize * BLOCK_SIZE) }
    }

    /// Returns the header that follows `block` in address order.
    ///
    /// # Safety
    ///
    /// `block` must be a live, non-fencepost header.
    pub(crate) unsafe fn next(block: *mut Self) -> *mut Self {
        unsafe { Self::offset(block, (*block).nblocks) }
    }

    /// # Safety
    ///
    /// `block` must be a live header.
    pub(crate) unsafe fn is_free(block: *mut Self) -> bool {
        unsafe { (*block).state.contains(BlockState::FREE) }
    }

    /// # Safety
    ///
    /// `block` must be a live header.
    pub(crate) unsafe fn is_fencepost(block: *mut Self) -> bool {
        unsafe { (*block).nblocks == 0 }
    }

    /// Returns `true` if `block` is non-null, not the fencepost, and free.
    ///
    /// # Safety
    ///
    /// `block` must be null or a live header.
    pub(crate) unsafe fn is_free_block(block: *mut Self) -> bool {
        !block.is_null() && unsafe { !Self::is_fencepost(block) && Self::is_free(block) }
    }

    /// Address range covered by `block`, for diagnostics.
    ///
    /// # Safety
    ///
    /// `block` must be a live header.
    pub(crate) unsafe fn range(block: *mut Self) -> core::ops::Range<usize> {
        let start = block.addr();
        let len = unsafe { (*block).nblocks as usize * BLOCK_SIZE };
        start..start + len.max(HEADER_SIZE)
    }

    /// Stamps the allocation record of a block that has just been taken.
    ///
    /// # Safety
    ///
    /// `block` must be a live header of an allocated block large enough for
    /// `alignofs + size` bytes past its header. `align` must not exceed
    /// [`BLOCK_SIZE`].
    #[expect(clippy::cast_possible_truncation)]
    pub(crate) unsafe fn record(
        block: *mut Self,
        size: usize,
        align: usize,
        alignofs: usize,
        policy: AllocFlags,
    ) -> *mut u8 {
        unsafe {
            let base = block.cast::<u8>().add(HEADER_SIZE + alignofs);
            debug_assert!(base.addr() + size <= Self::range(block).end);
            (*block).alloc_size = size;
            (*block).align = align as u32;
            (*block).alignofs = alignofs as u16;
            let tag = (*block).state.pool_tag();
            (*block).state = tag | BlockState::from_policy(policy);
            (*block).base = base;
            base
        }
    }

    /// Drops the allocation record, leaving the header as a fresh free one.
    ///
    /// # Safety
    ///
    /// `block` must be a live header.
    pub(crate) unsafe fn forget_allocation(block: *mut Self) {
        unsafe {
            (*block).alloc_size = 0;
            (*block).align = 0;
            (*block).alignofs = 0;
            (*block).base = ptr::null_mut();
            (*block).state = (*block).state.pool_tag() | BlockState::FREE;
        }
    }
}

/// Bytes between the end of a header and a user pointer aligned to `align`.
///
/// Headers sit on granule boundaries, so the result depends only on the
/// header size.
pub(crate) const fn alignment_offset(align: usize) -> usize {
    (align - HEADER_SIZE % align) % align
}

/// Number of granules a block needs to hold `size` bytes after its header
/// and alignment padding, or `None` if that does not fit a header's count.
pub(crate) fn granules_for(alignofs: usize, size: usize) -> Option<u32> {
    let bytes = HEADER_SIZE.checked_add(alignofs)?.checked_add(size)?;
    u32::try_from(bytes.div_ceil(BLOCK_SIZE)).ok()
}
