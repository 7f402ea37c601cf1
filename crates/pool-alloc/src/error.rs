//! Error types reported by the pool allocator.
//!
//! Recoverable failures ([`AllocError`], [`PoolInitError`]) never leave a
//! pool half-modified. Heap corruption is reported as an
//! [`InvariantViolation`], which the allocator treats as fatal.

use core::{fmt, ops::Range};

use snafu::{GenerateImplicitData, Snafu};

use crate::{AllocFlags, PoolKind};

/// Source location captured when an error value is built.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Soft failures of [`allocate`], [`reallocate`] and [`release`].
///
/// [`allocate`]: crate::PoolAllocator::allocate
/// [`reallocate`]: crate::PoolAllocator::reallocate
/// [`release`]: crate::PoolAllocator::release
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("zero-sized allocation requested"))]
    ZeroSize {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocation size does not fit in a pool block: size={size}"))]
    SizeTooLarge {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("unsupported alignment: align={align}"))]
    BadAlignment {
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("out of memory: size={size}, align={align}, flags={flags:?}"))]
    OutOfMemory {
        size: usize,
        align: usize,
        flags: AllocFlags,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pointer was not returned by this allocator: addr={addr:#x}"))]
    InvalidPointer {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    /// Returns where the error was raised.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::ZeroSize { location }
            | Self::SizeTooLarge { location, .. }
            | Self::BadAlignment { location, .. }
            | Self::OutOfMemory { location, .. }
            | Self::InvalidPointer { location, .. } => *location,
        }
    }
}

/// Failures while laying out the pools.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PoolInitError {
    #[snafu(display(
        "{kind} pool is too small after granule alignment: base={base:#x}, size={size}"
    ))]
    TooSmall {
        kind: PoolKind,
        base: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{kind} pool has more granules than a block header can count: size={size}"))]
    PoolTooLarge {
        kind: PoolKind,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "main and temp pools overlap: main={:#x}..{:#x}, temp={:#x}..{:#x}",
        main.start, main.end, temp.start, temp.end,
    ))]
    Overlapping {
        main: Range<usize>,
        temp: Range<usize>,
        #[snafu(implicit)]
        location: Location,
    },
}

/// The structural property a corrupted pool no longer satisfies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invariant {
    /// A header does not carry the block sentinel.
    Magic,
    /// `prev` does not point at the block that precedes it in the pool.
    PrevLink,
    /// A block runs past the fencepost or off the end of the pool.
    Bounds,
    /// The fencepost is missing, free, or sized.
    Fencepost,
    /// A free block is missing from the free list, or a listed block is not free.
    FreeList,
    /// The free list is not in ascending address order.
    FreeListOrder,
    /// `prev_free` does not mirror `next_free`.
    FreeListLink,
    /// Two neighbouring blocks are both free.
    Coalesce,
    /// A block's pool tag disagrees with the pool it lives in.
    PoolTag,
    /// An allocated block's user pointer is outside the block or misaligned.
    UserPointer,
    /// Block sizes do not add up to the pool size.
    BlockSum,
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Magic => "bad header magic",
            Self::PrevLink => "broken prev link",
            Self::Bounds => "block out of pool bounds",
            Self::Fencepost => "corrupted fencepost",
            Self::FreeList => "free list out of sync with block states",
            Self::FreeListOrder => "free list not sorted by address",
            Self::FreeListLink => "broken free list back link",
            Self::Coalesce => "adjacent free blocks",
            Self::PoolTag => "block tagged with the wrong pool",
            Self::UserPointer => "user pointer outside block or misaligned",
            Self::BlockSum => "block sizes do not cover the pool",
        };
        f.write_str(msg)
    }
}

/// Detected heap corruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub pool: PoolKind,
    pub block: Range<usize>,
    pub invariant: Invariant,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pool block {:#x}..{:#x}: {}",
            self.pool, self.block.start, self.block.end, self.invariant
        )
    }
}

impl core::error::Error for InvariantViolation {}

/// Aborts on heap corruption.
#[cold]
#[track_caller]
pub(crate) fn fatal(violation: &InvariantViolation) -> ! {
    log::error!("heap corruption: {violation}");
    panic!("heap corruption: {violation}");
}
