//! Kernel-style error codes.
//!
//! Mirrors the small set of `errno`-style constants the allocator's call sites expect
//! (`crate::errno::{E_INVALID, E_NO_SYS}` and friends) without pulling in a full POSIX
//! errno table — only the handful of codes actually returned on this crate's
//! transient-failure paths are defined.

/// Invalid argument.
pub const E_INVALID: i32 = 22;
/// Function not implemented / not supported in this configuration.
pub const E_NO_SYS: i32 = 38;
/// Out of memory.
pub const ENOMEM: i32 = 12;

/// Error kind returned on the allocator's caller-observable failure paths (`MEM_ATOMIC`
/// / `MEM_ERROR`). Programmer errors and hard OOM never construct this type — they
/// panic directly, per the allocator's error-handling design.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(i32)]
pub enum KernError {
    NoMem = ENOMEM,
    Invalid = E_INVALID,
    NoSys = E_NO_SYS,
}

impl KernError {
    #[inline(always)]
    pub const fn code(self) -> i32 {
        self as i32
    }
}
