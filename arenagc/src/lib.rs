//! Heap core for a non-moving tracing collector.
//!
//! Memory comes in size-aligned arenas whose per-cell state lives in two side
//! bitmaps rather than in object headers. A bump allocator carves fresh
//! space linearly; a fit allocator recycles swept spans; `Heap` routes
//! requests through bump, then fit, then a new arena.

mod allocator;
pub mod arena;
mod blockmeta;
mod bumpalloc;
pub mod constants;
pub mod eventlog;
mod fitalloc;
mod heap;
mod rawptr;

pub use crate::allocator::{bytes_to_cells, AllocError, SizeClass};

pub use crate::arena::{Arena, Cell, FreeSpan};

pub use crate::blockmeta::BlockType;

pub use crate::bumpalloc::BumpAllocator;

pub use crate::fitalloc::FitAllocator;

pub use crate::heap::{Heap, SweepStats};

pub use crate::rawptr::RawPtr;
