//! Heap geometry, fixed at build time.
//!
//! An arena is `1 << ARENA_SIZE_BITS` bytes, aligned to its own size. Its first
//! cells hold the block bitmap followed by the mark bitmap, one bit per cell
//! each; payload cells start at `ARENA_FIRST_CELL_INDEX`.

pub const CELL_SIZE_BITS: usize = 4;
pub const CELL_SIZE: usize = 1 << CELL_SIZE_BITS;

pub const ARENA_SIZE_BITS: usize = 20;
pub const ARENA_SIZE: usize = arena_size(ARENA_SIZE_BITS);
pub const ARENA_PTR_MASK: usize = !(ARENA_SIZE - 1);

pub const ARENA_BITMAP_SIZE: usize = bitmap_size(ARENA_SIZE_BITS);
pub const ARENA_CELLS_COUNT: usize = cells_count(ARENA_SIZE_BITS);
pub const ARENA_FIRST_CELL_INDEX: usize = first_cell_index(ARENA_SIZE_BITS);
pub const ARENA_PAYLOAD_CELLS: usize = ARENA_CELLS_COUNT - ARENA_FIRST_CELL_INDEX;

/// Requests of at least this many bytes are classed as large
pub const LARGE_ALLOC_THRESHOLD_BITS: usize = 14;
pub const LARGE_ALLOC_THRESHOLD: usize = 1 << LARGE_ALLOC_THRESHOLD_BITS;

/// Spans of 1..=SMALL_FREE_LISTS cells are kept in exact-size lists
pub const SMALL_FREE_LISTS: usize = 32;

/// Larger spans go into exponentially sized lists; list `i` holds spans of
/// `[2^(i + FIRST), 2^(i + FIRST + 1))` cells
pub const LARGE_FREE_LIST_FIRST_BITS: usize = 5;
pub const LARGE_FREE_LISTS: usize =
    ARENA_SIZE_BITS - CELL_SIZE_BITS - LARGE_FREE_LIST_FIRST_BITS + 1;

/// Smallest exponent for which the bitmaps fill a whole number of cells
pub const MIN_ARENA_SIZE_BITS: usize = 10;

pub const fn arena_size(size_bits: usize) -> usize {
    1 << size_bits
}

/// Bytes per bitmap: one bit for each cell of the arena
pub const fn bitmap_size(size_bits: usize) -> usize {
    arena_size(size_bits) / (8 * CELL_SIZE)
}

pub const fn cells_count(size_bits: usize) -> usize {
    arena_size(size_bits) / CELL_SIZE
}

/// Both bitmaps occupy the leading cells of the arena
pub const fn first_cell_index(size_bits: usize) -> usize {
    2 * bitmap_size(size_bits) / CELL_SIZE
}
