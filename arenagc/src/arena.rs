use std::alloc::{handle_alloc_error, Layout};
use std::fmt;
use std::ptr::NonNull;

use blockalloc::Block;

use crate::allocator::AllocError;
use crate::blockmeta::{BlockMeta, BlockType};
use crate::constants;

/// The unit of allocation. Payload only: all per-cell state lives in the
/// arena's bitmaps.
#[repr(C, align(16))]
pub struct Cell {
    _bytes: [u8; constants::CELL_SIZE],
}

/// Base address of the arena that `ptr` lies in
pub fn arena_base(ptr: *const Cell) -> usize {
    ptr as usize & constants::ARENA_PTR_MASK
}

/// Index of the cell that `ptr` lies in, counted from the arena base
pub fn cell_index(ptr: *const Cell) -> usize {
    (ptr as usize & !constants::ARENA_PTR_MASK) >> constants::CELL_SIZE_BITS
}

unsafe fn meta_for(ptr: *const Cell) -> BlockMeta {
    BlockMeta::from_base(arena_base(ptr) as *mut u8)
}

/// Read the block type tagged at `ptr`.
///
/// # Safety
/// `ptr` must lie inside a live arena.
pub unsafe fn block_type_at(ptr: *const Cell) -> BlockType {
    meta_for(ptr).get(cell_index(ptr))
}

/// Tag the cell at `ptr`. This is the primitive the mark phase uses to turn
/// reached blocks black.
///
/// # Safety
/// `ptr` must lie inside a live arena.
pub unsafe fn set_block_type_at(ptr: *const Cell, block_type: BlockType) {
    meta_for(ptr).set(cell_index(ptr), block_type)
}

/// Commit `cells` cells at `ptr` as one white block.
///
/// # Safety
/// `ptr` must lie inside a live arena's payload, and the `cells` cells from
/// `ptr` must currently be free and within that arena.
pub unsafe fn mark_allocated_at(ptr: *const Cell, cells: usize) {
    meta_for(ptr).mark_allocated(cell_index(ptr), cells)
}

/// Turn the block headed at `ptr` back into a free block.
///
/// # Safety
/// `ptr` must be a block head inside a live arena's payload.
pub unsafe fn mark_free_at(ptr: *const Cell) {
    meta_for(ptr).mark_free(cell_index(ptr))
}

/// Length in cells of the block headed at `ptr`.
///
/// # Safety
/// `ptr` must lie inside a live arena.
pub unsafe fn block_len_at(ptr: *const Cell) -> usize {
    let index = cell_index(ptr);
    meta_for(ptr).block_end(index) - index
}

/// A free block: its head cell and length in cells
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeSpan {
    pub ptr: NonNull<Cell>,
    pub cells: usize,
}

/// An arena of `ARENA_SIZE` bytes aligned to its own size, so that the arena
/// owning any interior pointer is found by masking off the low bits.
/// The leading cells hold the block and mark bitmaps.
pub struct Arena {
    block: Block,
}

impl Arena {
    /// Map a new arena. Its payload is tagged as a single free block.
    pub fn try_new() -> Result<Arena, AllocError> {
        let block = Block::new(constants::ARENA_SIZE)?;
        let arena = Arena { block };
        arena.meta().init();

        log::debug!("created arena at {:p}", arena.block.as_ptr());

        Ok(arena)
    }

    /// Map a new arena, aborting through the global allocation error handler
    /// if the system cannot provide one. Without an arena there is no heap to
    /// collect into.
    pub fn new() -> Arena {
        match Arena::try_new() {
            Ok(arena) => arena,
            Err(_) => {
                let layout = unsafe {
                    Layout::from_size_align_unchecked(constants::ARENA_SIZE, constants::ARENA_SIZE)
                };
                handle_alloc_error(layout)
            }
        }
    }

    fn meta(&self) -> BlockMeta {
        unsafe { BlockMeta::from_base(self.block.as_mut_ptr()) }
    }

    pub fn base(&self) -> usize {
        self.block.as_ptr() as usize
    }

    /// Pointer to the cell at `index`
    pub fn cell(&self, index: usize) -> NonNull<Cell> {
        assert!(index < constants::ARENA_CELLS_COUNT);
        unsafe {
            let ptr = self.block.as_mut_ptr().add(index * constants::CELL_SIZE);
            NonNull::new_unchecked(ptr as *mut Cell)
        }
    }

    /// Pointer to the first payload cell
    pub fn first_cell(&self) -> NonNull<Cell> {
        self.cell(constants::ARENA_FIRST_CELL_INDEX)
    }

    /// True if `ptr` lies in this arena's payload
    pub fn contains(&self, ptr: *const Cell) -> bool {
        arena_base(ptr) == self.base() && cell_index(ptr) >= constants::ARENA_FIRST_CELL_INDEX
    }

    fn payload_index(&self, ptr: *const Cell) -> usize {
        assert!(self.contains(ptr), "pointer {:p} is not in arena {:#x}", ptr, self.base());
        cell_index(ptr)
    }

    /// Tag at `index`, without resolving extents to their block head
    pub fn block_type(&self, index: usize) -> BlockType {
        self.meta().get(index)
    }

    pub fn set_block_type(&mut self, index: usize, block_type: BlockType) {
        self.meta().set(index, block_type)
    }

    /// Block type at a payload pointer
    pub fn block_type_of(&self, ptr: *const Cell) -> BlockType {
        self.block_type(self.payload_index(ptr))
    }

    /// Index of the head of the block containing `index`
    pub fn block_head(&self, index: usize) -> usize {
        self.meta().block_head(index)
    }

    /// State of the block that `index` belongs to
    pub fn cell_state(&self, index: usize) -> BlockType {
        self.block_type(self.block_head(index))
    }

    /// Length in cells of the block headed at `index`
    pub fn block_len(&self, index: usize) -> usize {
        self.meta().block_end(index) - index
    }

    pub fn mark_allocated(&mut self, ptr: *const Cell, cells: usize) {
        let index = self.payload_index(ptr);
        assert!(index + cells <= constants::ARENA_CELLS_COUNT);
        self.meta().mark_allocated(index, cells)
    }

    pub fn mark_free(&mut self, ptr: *const Cell) {
        let index = self.payload_index(ptr);
        self.meta().mark_free(index)
    }

    pub fn free_blocks(&self) -> usize {
        self.meta().count(BlockType::Free)
    }

    pub fn white_blocks(&self) -> usize {
        self.meta().count(BlockType::White)
    }

    pub fn black_blocks(&self) -> usize {
        self.meta().count(BlockType::Black)
    }

    /// No white or black block remains
    pub fn is_empty(&self) -> bool {
        self.meta().is_empty()
    }

    /// No two free blocks abut
    pub fn is_coalesced(&self) -> bool {
        self.meta().is_coalesced()
    }

    /// Merge abutting free blocks, returning how many free heads were absorbed
    pub fn coalesce(&mut self) -> usize {
        self.meta().coalesce()
    }

    /// Free white blocks, whiten black blocks, and coalesce. Returns true if
    /// the arena holds no allocation afterwards.
    pub fn sweep(&mut self) -> bool {
        self.meta().sweep()
    }

    /// Iterate over the free blocks of the payload in address order
    pub fn free_spans(&self) -> FreeSpans<'_> {
        FreeSpans {
            arena: self,
            index: constants::ARENA_FIRST_CELL_INDEX,
        }
    }
}

impl Default for Arena {
    fn default() -> Arena {
        Arena::new()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Arena").field("base", &format_args!("{:#x}", self.base())).finish()
    }
}

pub struct FreeSpans<'arena> {
    arena: &'arena Arena,
    index: usize,
}

impl<'arena> Iterator for FreeSpans<'arena> {
    type Item = FreeSpan;

    fn next(&mut self) -> Option<FreeSpan> {
        let meta = self.arena.meta();

        while self.index < constants::ARENA_CELLS_COUNT {
            let head = self.index;
            let end = meta.block_end(head);
            self.index = end;

            if meta.get(head) == BlockType::Free {
                return Some(FreeSpan {
                    ptr: self.arena.cell(head),
                    cells: end - head,
                });
            }
        }

        None
    }
}
