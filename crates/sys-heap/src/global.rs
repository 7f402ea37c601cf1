use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use pool_alloc::{AllocFlags, BLOCK_SIZE};

use crate::{SysHeap, SystemMemory as _};

unsafe impl GlobalAlloc for SysHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCK_SIZE {
            return ptr::null_mut();
        }
        self.allocate(layout.size(), layout.align(), AllocFlags::empty())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCK_SIZE {
            return ptr::null_mut();
        }
        self.allocate(layout.size(), layout.align(), AllocFlags::CLEAR)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.release(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { self.reallocate(ptr, new_size, layout.align(), AllocFlags::empty()) }
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::slice;

    use super::*;
    use crate::{HeapConfig, testing::with_test_heap};

    const CONFIG: HeapConfig = HeapConfig {
        main_size: 4096,
        temp_size: 0,
    };

    #[test]
    fn global_alloc_follows_layouts() {
        with_test_heap(CONFIG, |heap| unsafe {
            let layout = Layout::from_size_align(200, 32).unwrap();
            let p = heap.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p.addr() % 32, 0);
            p.write_bytes(0xC3, 200);

            let q = heap.realloc(p, layout, 2000);
            assert!(!q.is_null());
            assert!(slice::from_raw_parts(q, 200).iter().all(|&b| b == 0xC3));
            assert!(heap.realloc(q, Layout::from_size_align(2000, 32).unwrap(), 1 << 16).is_null());

            heap.dealloc(q, Layout::from_size_align(2000, 32).unwrap());
            assert!(heap.report().unwrap().is_empty());
        });
    }

    #[test]
    fn zeroed_allocations_are_cleared() {
        with_test_heap(CONFIG, |heap| unsafe {
            let layout = Layout::from_size_align(300, 8).unwrap();
            let p = heap.alloc(layout);
            p.write_bytes(0xFF, 300);
            heap.dealloc(p, layout);

            let z = heap.alloc_zeroed(layout);
            assert!(slice::from_raw_parts(z, 300).iter().all(|&b| b == 0));
            heap.dealloc(z, layout);
        });
    }

    #[test]
    fn over_aligned_layouts_are_refused() {
        with_test_heap(CONFIG, |heap| unsafe {
            let layout = Layout::from_size_align(64, 128).unwrap();
            assert!(heap.alloc(layout).is_null());
            assert!(heap.alloc_zeroed(layout).is_null());
            let layout = Layout::from_size_align(0, 8).unwrap();
            assert!(heap.alloc(layout).is_null());
        });
    }
}
