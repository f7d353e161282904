mod riscv;

pub use riscv::*;

/// If the IRQ is disabled, return `true`, otherwise return `false`.
#[inline(always)]
pub fn is_irq_disabled() -> bool {
    check_irq_disabled_flags(sstatus_read())
}
