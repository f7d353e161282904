//! Low-level kernel base utilities: IRQ control and the locking primitives built on it.

pub mod irq;
pub mod sync;
