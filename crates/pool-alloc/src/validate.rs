//! User-pointer validation.
//!
//! The constant-time check trusts the header found in the granule just
//! below the pointer. With the `deep-check` feature the pool's block chain
//! is walked instead, which also catches a header whose `prev` link has been
//! damaged.

use core::ptr;

use cfg_if::cfg_if;
use snafu::OptionExt as _;

use crate::{
    PoolAllocator,
    block::{BlockHeader, MAGIC},
    error::{self, AllocError},
    pool::Pool,
};

impl PoolAllocator {
    /// Returns the header of the live allocation whose user pointer is
    /// `ptr`, or `None` if there is none.
    pub(crate) fn lookup(&self, ptr: *mut u8) -> Option<*mut BlockHeader> {
        let pool = self.pool_containing(ptr.addr())?;
        cfg_if! {
            if #[cfg(feature = "deep-check")] {
                walk_lookup(pool, ptr)
            } else {
                header_lookup(pool, ptr)
            }
        }
    }

    #[track_caller]
    pub(crate) fn lookup_or_reject(&self, ptr: *mut u8) -> Result<*mut BlockHeader, AllocError> {
        let block = self.lookup(ptr);
        if block.is_none() {
            log::warn!("rejecting pointer {ptr:p}: not a live allocation");
        }
        block.context(error::InvalidPointerSnafu { addr: ptr.addr() })
    }
}

#[cfg_attr(all(feature = "deep-check", not(test)), expect(dead_code))]
fn header_lookup(pool: &Pool, ptr: *mut u8) -> Option<*mut BlockHeader> {
    let block = pool.header_below(ptr.addr());
    unsafe {
        let valid = (*block).magic == MAGIC
            && !BlockHeader::is_free(block)
            && !BlockHeader::is_fencepost(block)
            && ptr::eq((*block).base, ptr);
        valid.then_some(block)
    }
}

#[cfg_attr(all(not(feature = "deep-check"), not(test)), expect(dead_code))]
fn walk_lookup(pool: &Pool, ptr: *mut u8) -> Option<*mut BlockHeader> {
    let fencepost = pool.fencepost();
    let mut prev: *mut BlockHeader = ptr::null_mut();
    let mut block = pool.first_block();
    unsafe {
        while block < fencepost {
            pool.check_magic(block);
            if BlockHeader::is_fencepost(block) {
                break;
            }
            if !BlockHeader::is_free(block) && ptr::eq((*block).base, ptr) {
                return ptr::eq((*block).prev, prev).then_some(block);
            }
            if block.addr() >= ptr.addr() {
                return None;
            }
            prev = block;
            block = BlockHeader::next(block);
        }
    }
    None
}
