//! Allocation flag bits shared by the arena and slab allocators, and the page-backing
//! `GFP`-style request bits passed through to the page source.
//!
//! The flag word passed to `arena_alloc`/`arena_xalloc`/`kmem_cache_alloc` packs two
//! disjoint bit ranges: a **fit-policy selector** (at most one of `BESTFIT`,
//! `INSTANTFIT`, `NEXTFIT` — none selected means instant fit) and **memory-behavior**
//! bits that are passed through unchanged to any nested allocation call.

/// Scan the free list for the smallest sufficient block.
pub const BESTFIT: u32 = 0x100;
/// Take the first block from the next-larger size class; the default policy.
pub const INSTANTFIT: u32 = 0x200;
/// Allocate circularly by address, resuming after the last allocation.
pub const NEXTFIT: u32 = 0x400;

const POLICY_MASK: u32 = BESTFIT | INSTANTFIT | NEXTFIT;

/// Never block; return failure instead of panicking on exhaustion.
pub const MEM_ATOMIC: u32 = 0x1;
/// Block until memory is available (unsupported — see crate-level docs; currently
/// treated identically to the default mandatory-allocation path, which panics on OOM).
pub const MEM_WAIT: u32 = 0x2;
/// On exhaustion, surface an `Err(KernError::NoMem)` instead of panicking.
pub const MEM_ERROR: u32 = 0x4;

const BEHAVIOR_MASK: u32 = MEM_ATOMIC | MEM_WAIT | MEM_ERROR;

// Policy-selector bits and memory-behavior bits must never alias; both halves of the
// flag word are decoded independently.
sa::const_assert_eq!(POLICY_MASK & BEHAVIOR_MASK, 0);

/// The three mutually exclusive segment-selection strategies `arena_alloc` and
/// `arena_xalloc` may run. Decoded once from the raw flag word at each call site.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FitPolicy {
    Instant,
    Best,
    Next,
}

impl FitPolicy {
    /// Decode the policy bits of `flags`. Panics if more than one policy bit is set.
    #[inline]
    pub fn from_flags(flags: u32) -> Self {
        match flags & POLICY_MASK {
            0 | INSTANTFIT => FitPolicy::Instant,
            BESTFIT => FitPolicy::Best,
            NEXTFIT => FitPolicy::Next,
            _ => panic!("conflicting fit-policy bits in allocation flags"),
        }
    }
}

/// `true` if the caller asked to observe failure rather than block or panic.
#[inline(always)]
pub fn is_atomic(flags: u32) -> bool {
    flags & MEM_ATOMIC != 0
}

/// `true` if the caller asked for exhaustion to come back as `Err` rather than panic.
#[inline(always)]
pub fn wants_error(flags: u32) -> bool {
    flags & MEM_ERROR != 0
}

/// Page-source request bits, passed through to [`crate::mm::page`] unchanged. Only the
/// subset this crate actually branches on is defined.
pub const GFP_KERNEL: u32 = 0;
pub const GFP_ATOMIC: u32 = 1 << 0;
pub const GFP_DMA: u32 = 1 << 1;
pub const GFP_DMA32: u32 = 1 << 2;
pub const GFP_RECLAIMABLE: u32 = 1 << 3;
pub const GFP_COMPOUND: u32 = 1 << 4;
