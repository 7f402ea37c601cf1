use core::cell::UnsafeCell;

use pool_alloc::{BLOCK_SIZE, PoolConfig, PoolRegion};

/// Pool sizes carved from one contiguous region, main pool first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    pub main_size: usize,
    /// `0` configures no temp pool.
    pub temp_size: usize,
}

impl HeapConfig {
    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.main_size + self.temp_size
    }

    /// Splits the region at `base` into the two pools.
    ///
    /// The region should be aligned to [`BLOCK_SIZE`] and `main_size` a
    /// multiple of it, otherwise each pool loses the partial granules at
    /// its ends.
    #[must_use]
    pub fn pool_config(&self, base: *mut u8) -> PoolConfig {
        PoolConfig {
            main: PoolRegion::new(base, self.main_size),
            temp: (self.temp_size > 0)
                .then(|| PoolRegion::new(base.wrapping_add(self.main_size), self.temp_size)),
        }
    }
}

/// Statically reserved backing storage for both pools.
#[repr(C, align(64))]
pub struct StaticHeap<const MAIN: usize, const TEMP: usize> {
    main: UnsafeCell<[u8; MAIN]>,
    temp: UnsafeCell<[u8; TEMP]>,
}

const _: () = assert!(align_of::<StaticHeap<0, 0>>() == BLOCK_SIZE);

unsafe impl<const MAIN: usize, const TEMP: usize> Sync for StaticHeap<MAIN, TEMP> {}

impl<const MAIN: usize, const TEMP: usize> Default for StaticHeap<MAIN, TEMP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const MAIN: usize, const TEMP: usize> StaticHeap<MAIN, TEMP> {
    pub const CONFIG: HeapConfig = HeapConfig {
        main_size: MAIN,
        temp_size: TEMP,
    };

    #[must_use]
    pub const fn new() -> Self {
        Self {
            main: UnsafeCell::new([0; MAIN]),
            temp: UnsafeCell::new([0; TEMP]),
        }
    }

    /// The pool regions backed by this storage.
    ///
    /// Requires `'static` so the regions outlive the heap they are handed to.
    #[must_use]
    pub fn config(&'static self) -> PoolConfig {
        PoolConfig {
            main: PoolRegion::new(self.main.get().cast(), MAIN),
            temp: (TEMP > 0).then(|| PoolRegion::new(self.temp.get().cast(), TEMP)),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use pool_alloc::AllocFlags;

    use super::*;
    use crate::{SysHeap, SystemMemory as _};

    #[test]
    fn split_places_temp_after_main() {
        let config = HeapConfig {
            main_size: 4096,
            temp_size: 1024,
        };
        assert_eq!(config.total_size(), 5120);
        let base = core::ptr::without_provenance_mut::<u8>(0x1_0000);
        let pools = config.pool_config(base);
        assert_eq!(pools.main.base, base);
        assert_eq!(pools.main.size, 4096);
        let temp = pools.temp.unwrap();
        assert_eq!(temp.base.addr(), 0x1_0000 + 4096);
        assert_eq!(temp.size, 1024);

        let no_temp = HeapConfig {
            temp_size: 0,
            ..config
        };
        assert!(no_temp.pool_config(base).temp.is_none());
    }

    #[test]
    fn static_storage_backs_a_heap() {
        static MEMORY: StaticHeap<8192, 1024> = StaticHeap::new();
        static HEAP: SysHeap = SysHeap::new();

        assert_eq!(StaticHeap::<8192, 1024>::CONFIG.total_size(), 9216);
        unsafe { HEAP.init(MEMORY.config()) }.unwrap();
        let main = HEAP.available(AllocFlags::empty());
        let temp = HEAP.available(AllocFlags::TEMP);
        assert_eq!(main, 8192 - 2 * BLOCK_SIZE);
        assert_eq!(temp, 1024 - 2 * BLOCK_SIZE);

        let p = HEAP.allocate(500, 64, AllocFlags::TEMP).unwrap();
        assert!(MEMORY.temp.get().addr() < p.addr().get());
        unsafe { HEAP.release(p.as_ptr()) };
        assert_eq!(HEAP.available(AllocFlags::TEMP), temp);
        HEAP.verify().unwrap();
    }
}
