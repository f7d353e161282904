//! RISC-V `sstatus` access: the only CSR the arena/slab allocator's IRQ-safe spinlock
//! needs. Everything else the host binary's CPU module carries (GPR/FPR enumerations,
//! `satp`, `sepc`, `sscratch`, performance counters) belongs to context switching and
//! paging, neither of which this crate implements.

use core::arch::asm;

/// `sstatus.SIE`: the supervisor interrupt-enable bit.
const SSTATUS_SIE: usize = 1 << 1;

pub fn sstatus_read() -> usize {
    unsafe {
        let rval;
        asm!("csrr {}, sstatus", out(reg) rval);
        rval
    }
}

pub fn sstatus_write(val: usize) {
    unsafe {
        asm!("csrw sstatus, {}", in(reg) val);
    }
}

/// Set `sstatus.SIE`, enabling interrupts on this hart.
#[inline(always)]
pub fn sstatus_sti() {
    unsafe {
        asm!("csrs sstatus, {}", in(reg) SSTATUS_SIE);
    }
}

/// Clear `sstatus.SIE`, disabling interrupts on this hart.
#[inline(always)]
pub fn sstatus_cli() {
    unsafe {
        asm!("csrc sstatus, {}", in(reg) SSTATUS_SIE);
    }
}

/// Disable interrupts and return the previous `sstatus` value, for later restore.
#[inline(always)]
pub fn sstatus_cli_save() -> usize {
    let prev: usize;
    unsafe {
        asm!("csrrc {}, sstatus, {}", out(reg) prev, in(reg) SSTATUS_SIE);
    }
    prev
}

/// `true` if `sstatus.SIE` is clear in the given saved flags.
#[inline(always)]
pub fn check_irq_disabled_flags(flags: usize) -> bool {
    flags & SSTATUS_SIE == 0
}
