//! Slab allocator: fixed-size object caches carved out of arena-provided pages.
//!
//! A [`KmemCache`] is a named collection of slabs for one object size, split across
//! three lists — empty, partial, full — by how many of a slab's slots are busy. Small
//! objects (`object_size <= SLAB_LARGE_CUTOFF`) are packed into a single page whose top
//! also hosts the [`Slab`] bookkeeping record; larger objects are packed into a
//! contiguous page run whose [`Slab`] record lives in a dedicated cache instead (a page
//! run has no fixed "top" to carve a record out of without stealing a slot's worth of
//! space from every large-object slab). Both layouts thread their free list through the
//! same mechanism: the trailing machine word of every slot, re-purposed depending on
//! slab kind (see [`slot_size`] and the module's two reverse-mapping paths).
//!
//! Every slab's page backing comes from [`crate::mm::vmem::kpages_arena`], not directly
//! from the page source — the arena layer is what turns raw pages into the contiguous
//! runs large objects need and is the thing `arena_free` eventually coalesces and hands
//! back upstream.
//!
//! [`kmalloc`]/[`kzalloc`]/[`kfree`] are a general-purpose layer on top: a fixed ladder
//! of power-of-two `KmemCache`s (one per size class), selected by request size. Because
//! `kfree` is handed only a bare pointer — no cache, no size — every returned pointer is
//! preceded by one header word recording how to free it: either an (always even,
//! pointer-aligned) `*mut KmemCache` to free back through, or an odd tagged value
//! encoding the page-run order for requests too big for the largest bucket.

use core::mem::size_of;
use core::ptr::null_mut;

use crate::base::sync::IrqSpinLock;
use crate::errno::KernError;
use crate::gfp;
use crate::mm::vmem::{arena_alloc, arena_free, kpages_arena};
use crate::mm::PAGE_SIZE;
use crate::util::align::align_up_by;
use crate::util::bit::ceil_log2;
use crate::util::forward_list::{self, ForwardList};
use crate::util::list::{self, List};

/// Cutoff below (and at) which objects get the in-page small-slab layout; above it they
/// get the page-run large-slab layout. Chosen so the three bootstrap record types
/// (`KmemCache`, `Slab`, `BufCtl`) are always small objects, breaking the bootstrap
/// circularity described in [`kmem_cache_init`].
pub const SLAB_LARGE_CUTOFF: usize = PAGE_SIZE / 8;

/// Large slabs hold enough buffers that the backing page run amortizes its own
/// allocation cost; this is the target count `calc_large_order` sizes the run around.
const NUM_BUF_PER_SLAB: usize = 8;

/// Max bytes of a cache's name, including any truncation.
pub const KMEM_CACHE_NAME_SZ: usize = 32;

/// Object constructor, invoked once per slot at slab-grow time, before the slot is
/// ever handed to a caller.
pub type CtorFn = fn(*mut u8);
/// Object destructor, invoked once per slot at slab-destroy time (`cache_reap` /
/// `cache_destroy`), mirroring the corresponding `ctor` call.
pub type DtorFn = fn(*mut u8);

/// `⌈(object_size + one machine word for the free-list link) / align⌉ * align`: the
/// actual per-slot footprint a cache reserves, shared by both slab kinds.
#[inline]
const fn slot_size(object_size: usize, align: usize) -> usize {
    align_up_by(object_size + size_of::<usize>(), align)
}

#[inline]
unsafe fn write_tail(addr: usize, size: usize, val: usize) {
    ((addr + size - size_of::<usize>()) as *mut usize).write(val);
}

#[inline]
unsafe fn read_tail(addr: usize, size: usize) -> usize {
    ((addr + size - size_of::<usize>()) as *const usize).read()
}

/// Per-slot metadata for a large-object slab: links an allocated buffer back to the
/// slab that owns it. Small slabs don't need this — the owning slab is recovered by
/// page-aligned arithmetic instead (see [`Slab::small_slab_of`]).
#[repr(C)]
struct BufCtl {
    buf_addr: usize,
    my_slab: *mut Slab,
    link: ForwardList,
}

/// A container for `num_total_obj` equal-sized slots carved from one page (small) or
/// one `2^order`-page run (large).
///
/// Rust's static typing can't give one struct two shapes depending on a runtime tag the
/// way the source's single "slab" record does; rather than a second distinct type, this
/// keeps both kinds' fields side by side with the invariant that only the fields named
/// for a slab's own `is_large` are ever read.
#[repr(C)]
struct Slab {
    /// This slab's per-slot footprint (== its cache's [`slot_size`]).
    obj_size: usize,
    num_total_obj: u32,
    num_busy_obj: u32,
    is_large: bool,
    /// Base of the backing page (small) or page run (large).
    page_addr: usize,
    /// Page-run order; `0` for small slabs.
    order: usize,
    /// Head of the small-slab singly linked free list (threaded through each free
    /// slot's trailing word). Unused for large slabs.
    free_small_obj: *mut u8,
    /// Head of the large-slab free [`BufCtl`] list. Unused for small slabs.
    bufctl_free: ForwardList,
    /// Link into the owning cache's empty/partial/full list.
    list_link: List,
}

impl Slab {
    /// Reverse-map a small-slab buffer to its slab record: slabs always occupy the top
    /// of their page.
    #[inline]
    unsafe fn small_slab_of(buf_addr: usize) -> *mut Slab {
        let page_base = crate::util::align::align_down_by(buf_addr, PAGE_SIZE);
        (page_base + PAGE_SIZE - size_of::<Slab>()) as *mut Slab
    }

    /// Address of slot `idx`, valid for both slab kinds (both tile their backing region
    /// from its base in increasing address order).
    #[inline]
    fn slot_addr(&self, idx: u32) -> usize {
        self.page_addr + idx as usize * self.obj_size
    }
}

unsafe fn bufctl_of_link(link: *mut ForwardList) -> *mut BufCtl {
    crate::container_of_mut!(link, BufCtl, link)
}

/// Three slab lists (empty / partial / full) for one cache, guarded by the cache's own
/// lock.
struct CacheState {
    slabs_empty: List,
    slabs_partial: List,
    slabs_full: List,
}

impl CacheState {
    const fn new() -> Self {
        Self { slabs_empty: List::new(), slabs_partial: List::new(), slabs_full: List::new() }
    }

    fn init_empty(&mut self) {
        self.slabs_empty.init_empty();
        self.slabs_partial.init_empty();
        self.slabs_full.init_empty();
    }
}

/// A named collection of slabs for one fixed object size.
#[repr(C)]
pub struct KmemCache {
    name: [u8; KMEM_CACHE_NAME_SZ],
    name_len: u8,
    /// The size callers asked for.
    object_size: usize,
    /// This cache's per-slot footprint ([`slot_size`] of `object_size`/`align`).
    slot_size: usize,
    align: usize,
    is_large: bool,
    /// Page-run order for large-object slabs; `0` for small.
    order: usize,
    ctor: Option<CtorFn>,
    dtor: Option<DtorFn>,
    lock: IrqSpinLock<CacheState>,
    registry_link: List,
}

unsafe impl Sync for KmemCache {}
unsafe impl Send for KmemCache {}

impl KmemCache {
    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(KMEM_CACHE_NAME_SZ);
        self.name[..n].copy_from_slice(&bytes[..n]);
        self.name_len = n as u8;
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("<cache>")
    }
}

/// Fill in every derived field of an already-placed `KmemCache` record. Performs no
/// allocation itself — this is what lets the three bootstrap caches (`§ kmem_cache_init`)
/// come up before a general allocator exists to allocate their own records from.
fn init_cache_record(
    c: &mut KmemCache,
    name: &str,
    object_size: usize,
    align: usize,
    ctor: Option<CtorFn>,
    dtor: Option<DtorFn>,
) {
    assert!(object_size > 0, "kmem_cache_create: zero-sized object");
    let align = if align == 0 { size_of::<usize>() } else { align };
    c.set_name(name);
    c.object_size = object_size;
    c.align = align;
    c.slot_size = slot_size(object_size, align);
    c.is_large = object_size > SLAB_LARGE_CUTOFF;
    c.order = if c.is_large { calc_large_order(c.slot_size) } else { 0 };
    c.ctor = ctor;
    c.dtor = dtor;
    c.lock = IrqSpinLock::new(CacheState::new());
    unsafe { c.lock.get_mut_unchecked().init_empty() };
    c.registry_link = List::new();
}

/// Smallest order `o` such that a `2^o`-page run holds roughly [`NUM_BUF_PER_SLAB`]
/// slots of `slot_size` bytes.
fn calc_large_order(slot_size: usize) -> usize {
    let bytes_needed = NUM_BUF_PER_SLAB * slot_size;
    let pages_needed = (bytes_needed + PAGE_SIZE - 1) / PAGE_SIZE;
    ceil_log2(pages_needed.max(1))
}

// ---- slab growth ----------------------------------------------------------------

fn grow_small(c: &KmemCache, flags: u32) -> Result<*mut Slab, KernError> {
    let page = arena_alloc(kpages_arena(), PAGE_SIZE, flags)?;
    let num_total = ((PAGE_SIZE - size_of::<Slab>()) / c.slot_size) as u32;
    assert!(num_total > 0, "kmem cache '{}': object too large for a small slab", c.name());

    let mut free_head = 0usize;
    for i in (0..num_total).rev() {
        let addr = page + i as usize * c.slot_size;
        if let Some(ctor) = c.ctor {
            ctor(addr as *mut u8);
        }
        unsafe { write_tail(addr, c.slot_size, free_head) };
        free_head = addr;
    }

    let slab_ptr = (page + PAGE_SIZE - size_of::<Slab>()) as *mut Slab;
    unsafe {
        slab_ptr.write(Slab {
            obj_size: c.slot_size,
            num_total_obj: num_total,
            num_busy_obj: 0,
            is_large: false,
            page_addr: page,
            order: 0,
            free_small_obj: free_head as *mut u8,
            bufctl_free: ForwardList::new_empty(),
            list_link: List::new(),
        });
    }
    log::debug!("kmem cache '{}': grew a small slab at {:#x} ({} objects)", c.name(), page, num_total);
    Ok(slab_ptr)
}

fn grow_large(c: &KmemCache, flags: u32) -> Result<*mut Slab, KernError> {
    let slab_mem = kmem_cache_alloc(kmem_slab_cache(), flags)?;
    let page = match arena_alloc(kpages_arena(), PAGE_SIZE << c.order, flags) {
        Ok(p) => p,
        Err(e) => {
            kmem_cache_free(kmem_slab_cache(), slab_mem);
            return Err(e);
        }
    };

    let num_total = (((PAGE_SIZE << c.order) / c.slot_size) as u32).max(1);
    let slab_ptr = slab_mem as *mut Slab;
    unsafe {
        slab_ptr.write(Slab {
            obj_size: c.slot_size,
            num_total_obj: num_total,
            num_busy_obj: 0,
            is_large: true,
            page_addr: page,
            order: c.order,
            free_small_obj: null_mut(),
            bufctl_free: ForwardList::new_empty(),
            list_link: List::new(),
        });
    }

    for i in 0..num_total {
        let addr = page + i as usize * c.slot_size;
        if let Some(ctor) = c.ctor {
            ctor(addr as *mut u8);
        }
        let bufctl_mem = match kmem_cache_alloc(kmem_bufctl_cache(), flags) {
            Ok(b) => b as *mut BufCtl,
            Err(e) => {
                // ctor has only run for slots [0, i]; unwind exactly those, plus
                // whatever bufctls the earlier iterations already committed.
                if let Some(dtor) = c.dtor {
                    for j in 0..=i {
                        dtor((page + j as usize * c.slot_size) as *mut u8);
                    }
                }
                unsafe {
                    let mut cur = (*slab_ptr).bufctl_free.next();
                    while !cur.is_null() {
                        let next = (*cur).next();
                        kmem_cache_free(kmem_bufctl_cache(), bufctl_of_link(cur) as usize);
                        cur = next;
                    }
                }
                arena_free(kpages_arena(), page, PAGE_SIZE << c.order);
                kmem_cache_free(kmem_slab_cache(), slab_mem);
                return Err(e);
            }
        };
        unsafe {
            bufctl_mem.write(BufCtl { buf_addr: addr, my_slab: slab_ptr, link: ForwardList::new_empty() });
            write_tail(addr, c.slot_size, bufctl_mem as usize);
            forward_list::insert_after(&mut (*slab_ptr).bufctl_free, &mut (*bufctl_mem).link);
        }
    }
    log::debug!(
        "kmem cache '{}': grew a large slab at {:#x} (order {}, {} objects)",
        c.name(),
        page,
        c.order,
        num_total
    );
    Ok(slab_ptr)
}

fn grow(c: &KmemCache, flags: u32) -> Result<*mut Slab, KernError> {
    if c.is_large {
        grow_large(c, flags)
    } else {
        grow_small(c, flags)
    }
}

fn destroy_slab(c: &KmemCache, slab: *mut Slab) {
    unsafe {
        let total = (*slab).num_total_obj;
        for i in 0..total {
            let addr = (*slab).slot_addr(i);
            if let Some(dtor) = c.dtor {
                dtor(addr as *mut u8);
            }
        }

        if (*slab).is_large {
            let mut cur = (*slab).bufctl_free.next();
            while !cur.is_null() {
                let next = (*cur).next();
                let bufctl = bufctl_of_link(cur);
                kmem_cache_free(kmem_bufctl_cache(), bufctl as usize);
                cur = next;
            }
            arena_free(kpages_arena(), (*slab).page_addr, PAGE_SIZE << (*slab).order);
            kmem_cache_free(kmem_slab_cache(), slab as usize);
        } else {
            arena_free(kpages_arena(), (*slab).page_addr, PAGE_SIZE);
            // The slab record itself lived inside the freed page; nothing left to do.
        }
    }
    log::debug!("kmem cache '{}': destroyed a slab", c.name());
}

// ---- allocation / free -----------------------------------------------------------

fn pop_obj(slab: *mut Slab, is_large: bool) -> usize {
    unsafe {
        if is_large {
            let link = (*slab).bufctl_free.next();
            assert!(!link.is_null(), "kmem: slab claimed a free slot it does not have");
            forward_list::remove_next(&mut (*slab).bufctl_free);
            let bufctl = bufctl_of_link(link);
            (*bufctl).buf_addr
        } else {
            let addr = (*slab).free_small_obj as usize;
            assert!(addr != 0, "kmem: slab claimed a free slot it does not have");
            (*slab).free_small_obj = read_tail(addr, (*slab).obj_size) as *mut u8;
            addr
        }
    }
}

fn push_obj(slab: *mut Slab, addr: usize, is_large: bool) {
    unsafe {
        if is_large {
            let bufctl = read_tail(addr, (*slab).obj_size) as *mut BufCtl;
            forward_list::insert_after(&mut (*slab).bufctl_free, &mut (*bufctl).link);
        } else {
            write_tail(addr, (*slab).obj_size, (*slab).free_small_obj as usize);
            (*slab).free_small_obj = addr as *mut u8;
        }
    }
}

/// Pop a slot from the partial list's head slab, promoting an empty slab (growing if
/// none exists) when the partial list is itself empty.
pub fn kmem_cache_alloc(cache: *mut KmemCache, flags: u32) -> Result<usize, KernError> {
    let c = unsafe { &*cache };
    let mut st = c.lock.lock();
    loop {
        if !list::is_empty(&st.slabs_partial) {
            let slab = unsafe { crate::container_of_mut!(st.slabs_partial.next, Slab, list_link) };
            let addr = pop_obj(slab, c.is_large);
            unsafe {
                list::delete(&mut (*slab).list_link);
                (*slab).num_busy_obj += 1;
                if (*slab).num_busy_obj == (*slab).num_total_obj {
                    list::head_append(&mut st.slabs_full, &mut (*slab).list_link);
                } else {
                    list::head_append(&mut st.slabs_partial, &mut (*slab).list_link);
                }
            }
            return Ok(addr);
        }

        if !list::is_empty(&st.slabs_empty) {
            let link = st.slabs_empty.next;
            unsafe { list::delete(&mut *link) };
            list::head_append(&mut st.slabs_partial, unsafe { &mut *link });
            continue;
        }

        match grow(c, flags) {
            Ok(slab) => {
                list::head_append(&mut st.slabs_empty, unsafe { &mut (*slab).list_link });
                continue;
            }
            Err(e) => {
                if gfp::is_atomic(flags) || gfp::wants_error(flags) {
                    return Err(e);
                }
                log::error!("kmem cache '{}': exhausted growing for a mandatory allocation", c.name());
                panic!("kmem cache '{}': out of memory with no escape-hatch flag set", c.name());
            }
        }
    }
}

/// Reverse-map `buf` to its slab, push the slot back, and move the slab between lists
/// as its busy count crosses `0` or `num_total_obj`.
pub fn kmem_cache_free(cache: *mut KmemCache, buf: usize) {
    let c = unsafe { &*cache };
    let mut st = c.lock.lock();
    let slab = if c.is_large {
        let bufctl = unsafe { read_tail(buf, c.slot_size) as *mut BufCtl };
        unsafe { (*bufctl).my_slab }
    } else {
        unsafe { Slab::small_slab_of(buf) }
    };

    push_obj(slab, buf, c.is_large);
    unsafe {
        list::delete(&mut (*slab).list_link);
        (*slab).num_busy_obj -= 1;
        if (*slab).num_busy_obj == 0 {
            list::head_append(&mut st.slabs_empty, &mut (*slab).list_link);
        } else {
            list::head_append(&mut st.slabs_partial, &mut (*slab).list_link);
        }
    }
}

/// Destroy every slab on the empty list. Idempotent: a cache with nothing on its empty
/// list is a no-op.
pub fn kmem_cache_reap(cache: *mut KmemCache) {
    let c = unsafe { &*cache };
    loop {
        let slab = {
            let st = c.lock.lock();
            if list::is_empty(&st.slabs_empty) {
                break;
            }
            let link = st.slabs_empty.next;
            list::delete(unsafe { &mut *link });
            unsafe { crate::container_of_mut!(link, Slab, list_link) }
        };
        destroy_slab(c, slab);
    }
}

/// Create a cache for a fixed object size, backed by slabs grown from `kpages_arena`.
pub fn kmem_cache_create(
    name: &'static str,
    object_size: usize,
    align: usize,
    _flags: u32,
    ctor: Option<CtorFn>,
    dtor: Option<DtorFn>,
) -> *mut KmemCache {
    let mem = kmem_cache_alloc(kmem_cache_cache(), 0)
        .unwrap_or_else(|_| panic!("kmem_cache_create: out of memory allocating the cache record for '{}'", name))
        as *mut KmemCache;
    unsafe {
        init_cache_record(&mut *mem, name, object_size, align, ctor, dtor);
    }
    registry::register(mem);
    log::debug!("kmem cache '{}' created (object_size={}, slot_size={})", name, object_size, unsafe { (*mem).slot_size });
    mem
}

/// Requires the full and partial lists to already be empty. Reaps the empty list,
/// unlinks the cache from the registry, and returns its record to `kmem_cache_cache`.
pub fn kmem_cache_destroy(cache: *mut KmemCache) {
    let c = unsafe { &*cache };
    {
        let st = c.lock.lock();
        assert!(
            list::is_empty(&st.slabs_full) && list::is_empty(&st.slabs_partial),
            "kmem_cache_destroy: cache '{}' has outstanding allocations",
            c.name()
        );
    }
    kmem_cache_reap(cache);
    registry::unregister(cache);
    kmem_cache_free(kmem_cache_cache(), cache as usize);
    log::debug!("kmem cache '{}' destroyed", c.name());
}

pub fn print_kmem_cache(cache: *mut KmemCache) {
    let c = unsafe { &*cache };
    let st = c.lock.lock();
    log::info!(
        "kmem cache '{}': object_size={} slot_size={} kind={} empty={} partial={} full={}",
        c.name(),
        c.object_size,
        c.slot_size,
        if c.is_large { "large" } else { "small" },
        list::count(&st.slabs_empty),
        list::count(&st.slabs_partial),
        list::count(&st.slabs_full)
    );
}

mod registry {
    use super::KmemCache;
    use crate::base::sync::IrqSpinLock;
    use crate::util::list::{self, List};

    static REGISTRY: IrqSpinLock<List> = IrqSpinLock::new(List::new());

    pub fn init() {
        unsafe { REGISTRY.get_mut_unchecked().init_empty() };
    }

    /// Insert keeping ascending `object_size` order, per the registry's documented
    /// traversal contract.
    pub fn register(cache: *mut KmemCache) {
        let mut g = REGISTRY.lock();
        let size = unsafe { (*cache).object_size };
        let head = &mut *g as *mut List;
        let mut cur = unsafe { (*head).next };
        while cur as *const List != head as *const List {
            let cur_cache = unsafe { crate::container_of_mut!(cur, KmemCache, registry_link) };
            if unsafe { (*cur_cache).object_size } > size {
                break;
            }
            cur = unsafe { (*cur).next };
        }
        unsafe {
            let prev = (*cur).prev;
            list::partial_append(&mut *prev, &mut (*cache).registry_link);
        }
    }

    pub fn unregister(cache: *mut KmemCache) {
        let _g = REGISTRY.lock();
        unsafe { list::delete(&mut (*cache).registry_link) };
    }

    pub fn for_each<F: FnMut(&KmemCache)>(mut f: F) {
        let g = REGISTRY.lock();
        list::for_each(&g, |link| unsafe {
            let cache = crate::container_of_mut!(link, KmemCache, registry_link);
            f(&*cache);
        });
    }
}

/// Print every registered cache's stats. Useful from a debug shell command.
pub fn print_all_kmem_caches() {
    registry::for_each(|cache| print_kmem_cache(cache as *const KmemCache as *mut KmemCache));
}

// ---- bootstrap --------------------------------------------------------------------

static mut KMEM_CACHE_CACHE: KmemCache = blank_cache();
static mut KMEM_SLAB_CACHE: KmemCache = blank_cache();
static mut KMEM_BUFCTL_CACHE: KmemCache = blank_cache();

const fn blank_cache() -> KmemCache {
    KmemCache {
        name: [0; KMEM_CACHE_NAME_SZ],
        name_len: 0,
        object_size: 0,
        slot_size: 0,
        align: 0,
        is_large: false,
        order: 0,
        ctor: None,
        dtor: None,
        lock: IrqSpinLock::new(CacheState::new()),
        registry_link: List::new(),
    }
}

fn kmem_cache_cache() -> *mut KmemCache {
    unsafe { &mut KMEM_CACHE_CACHE as *mut KmemCache }
}

fn kmem_slab_cache() -> *mut KmemCache {
    unsafe { &mut KMEM_SLAB_CACHE as *mut KmemCache }
}

fn kmem_bufctl_cache() -> *mut KmemCache {
    unsafe { &mut KMEM_BUFCTL_CACHE as *mut KmemCache }
}

/// Bring up the three bootstrap caches (`kmem_cache`, `kmem_slab`, `kmem_bufctl`)
/// without allocating anything, breaking the circular dependency where creating a
/// cache ordinarily requires allocating its record from a cache. Also brings up the
/// general-purpose `kmalloc` size-class ladder, which depends on `kmem_cache_cache`
/// being usable.
pub(super) fn kmem_init() {
    registry::init();

    unsafe {
        init_cache_record(&mut KMEM_CACHE_CACHE, "kmem_cache", size_of::<KmemCache>(), 0, None, None);
        init_cache_record(&mut KMEM_SLAB_CACHE, "kmem_slab", size_of::<Slab>(), 0, None, None);
        init_cache_record(&mut KMEM_BUFCTL_CACHE, "kmem_bufctl", size_of::<BufCtl>(), 0, None, None);
        registry::register(kmem_cache_cache());
        registry::register(kmem_slab_cache());
        registry::register(kmem_bufctl_cache());
    }

    sa::const_assert!(size_of::<KmemCache>() <= SLAB_LARGE_CUTOFF);
    sa::const_assert!(size_of::<Slab>() <= SLAB_LARGE_CUTOFF);
    sa::const_assert!(size_of::<BufCtl>() <= SLAB_LARGE_CUTOFF);

    init_kmalloc_caches();
    log::info!("kmem: slab allocator is up");
}

// ---- general-purpose kmalloc --------------------------------------------------------

const KMALLOC_HEADER_SIZE: usize = size_of::<usize>();
/// Smallest `kmalloc` bucket is `2^4 = 16` bytes.
const KMALLOC_MIN_SHIFT: usize = 4;
/// Largest `kmalloc` bucket is `2^12 = 4096` bytes; bigger requests skip the cache
/// ladder and go straight to a `kpages_arena` page run.
const KMALLOC_MAX_SHIFT: usize = 12;
const KMALLOC_NUM_BUCKETS: usize = KMALLOC_MAX_SHIFT - KMALLOC_MIN_SHIFT + 1;

const KMALLOC_BUCKET_NAMES: [&str; KMALLOC_NUM_BUCKETS] = [
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1024",
    "kmalloc-2048",
    "kmalloc-4096",
];

static mut KMALLOC_CACHES: [*mut KmemCache; KMALLOC_NUM_BUCKETS] = [null_mut(); KMALLOC_NUM_BUCKETS];

fn init_kmalloc_caches() {
    for i in 0..KMALLOC_NUM_BUCKETS {
        let size = 1usize << (KMALLOC_MIN_SHIFT + i);
        let cache = kmem_cache_create(KMALLOC_BUCKET_NAMES[i], size, size_of::<usize>(), 0, None, None);
        unsafe { KMALLOC_CACHES[i] = cache };
    }
}

/// Smallest bucket whose slot can hold `need` bytes, or `None` if it exceeds the
/// largest bucket.
fn kmalloc_bucket_index(need: usize) -> Option<usize> {
    for i in 0..KMALLOC_NUM_BUCKETS {
        if (1usize << (KMALLOC_MIN_SHIFT + i)) >= need {
            return Some(i);
        }
    }
    None
}

/// Allocate `sz` bytes, `8`-byte aligned at minimum. Returns a null pointer on failure
/// to grow (callers that need `MEM_ATOMIC`/`MEM_ERROR` semantics should go through
/// [`kmem_cache_alloc`] directly instead — this entry point always treats exhaustion as
/// the atomic case, matching the source's general-purpose `kmalloc`, which never
/// panics on its own).
pub fn kmalloc(sz: usize, flags: u32) -> *mut u8 {
    if sz == 0 {
        return null_mut();
    }
    let flags = flags | gfp::MEM_ATOMIC;
    let need = sz.checked_add(KMALLOC_HEADER_SIZE).expect("kmalloc: requested size overflows");

    if let Some(idx) = kmalloc_bucket_index(need) {
        let cache = unsafe { KMALLOC_CACHES[idx] };
        match kmem_cache_alloc(cache, flags) {
            Ok(raw) => unsafe {
                (raw as *mut usize).write(cache as usize);
                (raw + KMALLOC_HEADER_SIZE) as *mut u8
            },
            Err(_) => null_mut(),
        }
    } else {
        let total = align_up_by(need, PAGE_SIZE);
        let npages = (total / PAGE_SIZE).max(1).next_power_of_two();
        let order = npages.trailing_zeros() as usize;
        match arena_alloc(kpages_arena(), PAGE_SIZE << order, flags) {
            Ok(addr) => unsafe {
                (addr as *mut usize).write((order << 1) | 1);
                (addr + KMALLOC_HEADER_SIZE) as *mut u8
            },
            Err(_) => null_mut(),
        }
    }
}

/// Like [`kmalloc`], but the returned memory is zeroed.
pub fn kzalloc(sz: usize, flags: u32) -> *mut u8 {
    let ptr = kmalloc(sz, flags);
    if !ptr.is_null() {
        unsafe { core::ptr::write_bytes(ptr, 0, sz) };
    }
    ptr
}

/// Free memory obtained from [`kmalloc`]/[`kzalloc`]. A null pointer is a no-op.
pub fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        let raw = (ptr as usize) - KMALLOC_HEADER_SIZE;
        let tag = (raw as *const usize).read();
        if tag & 1 == 1 {
            let order = tag >> 1;
            arena_free(kpages_arena(), raw, PAGE_SIZE << order);
        } else {
            kmem_cache_free(tag as *mut KmemCache, raw);
        }
    }
}

/// Test-only bootstrap: brings up `base_arena`/`kpages_arena` and this module's own
/// bootstrap caches + kmalloc ladder exactly once per test binary, so individual tests
/// (here and in `crate::mm::vmem`, whose `arena_create` goes through `kmalloc`) can rely
/// on a live allocator without a booted kernel.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Once;

    static KMEM_INIT: Once = Once::new();

    pub fn ensure_test_kmem() {
        crate::mm::vmem::test_support::ensure_test_arenas();
        KMEM_INIT.call_once(super::kmem_init);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn fresh_cache(object_size: usize, ctor: Option<CtorFn>, dtor: Option<DtorFn>) -> *mut KmemCache {
        kmem_cache_create("test-cache", object_size, 8, 0, ctor, dtor)
    }

    #[test]
    fn small_objects_round_trip_distinct_and_aligned() {
        test_support::ensure_test_kmem();
        let cache = fresh_cache(32, None, None);
        let mut ptrs = alloc::vec::Vec::new();
        for _ in 0..200 {
            let p = kmem_cache_alloc(cache, 0).unwrap();
            assert_eq!(p % 8, 0, "object must be 8-byte aligned");
            ptrs.push(p);
        }
        for i in 0..ptrs.len() {
            for j in (i + 1)..ptrs.len() {
                assert_ne!(ptrs[i], ptrs[j], "every live object must be distinct");
            }
        }
        for &p in ptrs.iter().rev() {
            kmem_cache_free(cache, p);
        }
        kmem_cache_reap(cache);
        let st = unsafe { (*cache).lock.lock() };
        assert!(list::is_empty(&st.slabs_partial) && list::is_empty(&st.slabs_full));
        drop(st);
        kmem_cache_destroy(cache);
    }

    #[test]
    fn large_object_round_trip() {
        test_support::ensure_test_kmem();
        let cache = fresh_cache(SLAB_LARGE_CUTOFF + 64, None, None);
        assert!(unsafe { (*cache).is_large });
        let a = kmem_cache_alloc(cache, 0).unwrap();
        let b = kmem_cache_alloc(cache, 0).unwrap();
        assert_ne!(a, b);
        kmem_cache_free(cache, a);
        kmem_cache_free(cache, b);
        kmem_cache_reap(cache);
        kmem_cache_destroy(cache);
    }

    #[test]
    fn ctor_and_dtor_run_once_per_slot() {
        test_support::ensure_test_kmem();
        static CTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
        static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
        fn ctor(_p: *mut u8) {
            CTOR_CALLS.fetch_add(1, Ordering::Relaxed);
        }
        fn dtor(_p: *mut u8) {
            DTOR_CALLS.fetch_add(1, Ordering::Relaxed);
        }
        let cache = fresh_cache(16, Some(ctor), Some(dtor));
        let p = kmem_cache_alloc(cache, 0).unwrap();
        let total = unsafe {
            let st = (*cache).lock.lock();
            let slab = crate::container_of_mut!(st.slabs_partial.next, Slab, list_link);
            (*slab).num_total_obj
        };
        assert_eq!(CTOR_CALLS.load(Ordering::Relaxed), total as usize);
        kmem_cache_free(cache, p);
        kmem_cache_reap(cache);
        assert_eq!(DTOR_CALLS.load(Ordering::Relaxed), total as usize);
        kmem_cache_destroy(cache);
    }

    #[test]
    fn kmalloc_round_trips_and_is_header_safe() {
        test_support::ensure_test_kmem();
        let p = kmalloc(100, 0);
        assert!(!p.is_null());
        unsafe { core::ptr::write_bytes(p, 0xAA, 100) };
        kfree(p);

        let big = kmalloc(PAGE_SIZE * 3, 0);
        assert!(!big.is_null());
        kfree(big);
    }
}
