use bitflags::bitflags;

bitflags! {
    /// Placement and initialization hints for an allocation request.
    ///
    /// The empty set allocates from the main pool, searching upward from the
    /// lowest free address.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Prefer the temp pool.
        ///
        /// A request that does not fit there falls back to the main pool and
        /// is placed as if [`TOP`](Self::TOP) were also set, keeping
        /// short-lived data away from the low end of the general heap.
        const TEMP = 1 << 0;

        /// Search the free list from its high-address end, and carve the
        /// allocation from the high end of the chosen free block.
        const TOP = 1 << 1;

        /// Zero the requested bytes of a fresh allocation.
        ///
        /// Ignored by [`reallocate`](crate::PoolAllocator::reallocate).
        const CLEAR = 1 << 2;
    }
}

impl AllocFlags {
    /// The bits recorded in a block and compared when it is resized.
    #[must_use]
    pub const fn policy(self) -> Self {
        self.intersection(Self::TEMP.union(Self::TOP))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_drops_clear() {
        assert_eq!(AllocFlags::all().policy(), AllocFlags::TEMP | AllocFlags::TOP);
        assert_eq!(AllocFlags::CLEAR.policy(), AllocFlags::empty());
        assert_eq!(AllocFlags::TOP.policy(), AllocFlags::TOP);
    }
}
