//! Pointer/offset macros used throughout the arena and slab allocators.

mod ptr;
