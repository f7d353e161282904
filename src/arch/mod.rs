//! Platform-specific primitives. The only thing the arena/slab allocators pull from
//! here is `cpu`'s `sstatus` access, used by [`crate::base::irq`] to implement the
//! IRQ-safe spinlock's interrupt save/restore half.

pub mod cpu;
