//! The page allocator as seen by the arena/slab core: a small trait boundary instead of
//! a direct dependency on [`crate::mm::page`].
//!
//! Production code is backed by [`BuddyPageSource`], a thin wrapper over the crate's
//! buddy allocator. Hosted tests back the same trait with a heap-allocated byte arena
//! (see [`test_support`]), so the arena and slab invariants in the allocator's test
//! suites can run under `cargo test` without a booted kernel or real physical memory.

use crate::mm::page;

/// The page-allocator contract the arena and slab layers depend on.
///
/// `alloc_page`/`free_page` hand out single pages (used by small slabs and the
/// base-arena bootstrap); `alloc_contig`/`free_contig` hand out `2^order` contiguous
/// pages (used by large-object slabs and by spans the base arena imports for itself).
/// All addresses returned are directly usable (this kernel runs identity-mapped), not
/// merely reserved.
pub trait PageSource: Sync {
    /// Returns `0` on exhaustion.
    fn alloc_page(&self) -> usize;

    fn free_page(&self, addr: usize);

    /// Allocate `2^order` contiguous pages. Returns `0` on exhaustion.
    fn alloc_contig(&self, order: usize) -> usize;

    fn free_contig(&self, addr: usize, order: usize);
}

/// Production [`PageSource`] backed by the crate's internal buddy allocator.
pub struct BuddyPageSource;

impl PageSource for BuddyPageSource {
    #[inline]
    fn alloc_page(&self) -> usize {
        page::alloc_page(crate::gfp::GFP_KERNEL as usize)
    }

    #[inline]
    fn free_page(&self, addr: usize) {
        if addr != 0 {
            page::free_page(addr);
        }
    }

    #[inline]
    fn alloc_contig(&self, order: usize) -> usize {
        page::alloc_pages(crate::gfp::GFP_KERNEL as usize, order)
    }

    #[inline]
    fn free_contig(&self, addr: usize, order: usize) {
        if addr != 0 {
            page::free_pages(addr, order);
        }
    }
}

/// The page source every `Arena`/`KmemCache` call goes through in production.
pub static PAGE_SOURCE: BuddyPageSource = BuddyPageSource;

/// The page source the arena layer actually calls through: the real buddy allocator in
/// production, the heap-backed double under `cargo test` so the arena/slab suites never
/// need a booted kernel's physical memory map.
#[inline]
#[cfg(not(test))]
pub fn active() -> &'static dyn PageSource {
    &PAGE_SOURCE
}

#[inline]
#[cfg(test)]
pub fn active() -> &'static dyn PageSource {
    &test_support::TEST_PAGE_SOURCE
}

#[cfg(test)]
pub mod test_support {
    //! A heap-backed [`PageSource`] double, standing in for the buddy allocator under a
    //! hosted `cargo test` run.

    use super::PageSource;
    use crate::mm::PAGE_SIZE;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    pub struct HeapPageSource;

    impl PageSource for HeapPageSource {
        fn alloc_page(&self) -> usize {
            self.alloc_contig(0)
        }

        fn free_page(&self, addr: usize) {
            self.free_contig(addr, 0)
        }

        fn alloc_contig(&self, order: usize) -> usize {
            let size = PAGE_SIZE << order;
            let layout = Layout::from_size_align(size, PAGE_SIZE).expect("bad test page layout");
            let ptr = unsafe { alloc_zeroed(layout) };
            ptr as usize
        }

        fn free_contig(&self, addr: usize, order: usize) {
            if addr == 0 {
                return;
            }
            let size = PAGE_SIZE << order;
            let layout = Layout::from_size_align(size, PAGE_SIZE).expect("bad test page layout");
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }

    pub static TEST_PAGE_SOURCE: HeapPageSource = HeapPageSource;
}
