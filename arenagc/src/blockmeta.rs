use crate::constants;

/// State of a cell, decoded from one bit in the block bitmap and one bit in
/// the mark bitmap at the cell's index.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// Continuation cell of a multi-cell block. Never a block head.
    Extent,
    /// Head of an unallocated span
    Free,
    /// Head of an allocation not (yet) reached by the current trace
    White,
    /// Head of an allocation reached by the current trace
    Black,
}

impl BlockType {
    /// (block bit, mark bit) -> type. Zeroed bitmaps decode to `Extent`.
    fn from_bits(block: bool, mark: bool) -> BlockType {
        match (block, mark) {
            (false, false) => BlockType::Extent,
            (false, true) => BlockType::Free,
            (true, false) => BlockType::White,
            (true, true) => BlockType::Black,
        }
    }

    fn bits(self) -> (bool, bool) {
        match self {
            BlockType::Extent => (false, false),
            BlockType::Free => (false, true),
            BlockType::White => (true, false),
            BlockType::Black => (true, true),
        }
    }

    /// White or black: the block holds an allocation, live or condemned
    pub fn is_allocated(self) -> bool {
        match self {
            BlockType::White | BlockType::Black => true,
            BlockType::Extent | BlockType::Free => false,
        }
    }

    pub fn is_head(self) -> bool {
        self != BlockType::Extent
    }
}

const BLOCK_BITMAP_OFFSET: usize = 0;
const MARK_BITMAP_OFFSET: usize = constants::ARENA_BITMAP_SIZE;

/// Accessor for the block and mark bitmaps stored in the leading cells of an
/// arena. All bitmap reads and writes in the crate go through this type, and
/// so do the block state transitions built on them.
pub struct BlockMeta {
    base: *mut u8,
}

impl BlockMeta {
    /// # Safety
    /// `base` must point to at least `2 * ARENA_BITMAP_SIZE` bytes that stay
    /// valid and unaliased by references while this value is in use; in
    /// practice, the base of a live arena.
    pub unsafe fn from_base(base: *mut u8) -> BlockMeta {
        BlockMeta { base }
    }

    fn get_entry(&self, bitmap: usize, index: usize) -> bool {
        debug_assert!(index < constants::ARENA_CELLS_COUNT);
        let byte = unsafe { *self.base.add(bitmap + index / 8) };
        (byte >> (index % 8)) & 0x1 == 0x1
    }

    fn set_entry(&mut self, bitmap: usize, index: usize, value: bool) {
        debug_assert!(index < constants::ARENA_CELLS_COUNT);
        unsafe {
            let byte = self.base.add(bitmap + index / 8);
            if value {
                *byte |= 1 << (index % 8);
            } else {
                *byte &= !(1 << (index % 8));
            }
        }
    }

    pub fn get(&self, index: usize) -> BlockType {
        BlockType::from_bits(
            self.get_entry(BLOCK_BITMAP_OFFSET, index),
            self.get_entry(MARK_BITMAP_OFFSET, index),
        )
    }

    pub fn set(&mut self, index: usize, block_type: BlockType) {
        let (block, mark) = block_type.bits();
        self.set_entry(BLOCK_BITMAP_OFFSET, index, block);
        self.set_entry(MARK_BITMAP_OFFSET, index, mark);
    }

    /// Tag zeroed bitmaps as one free block spanning the whole payload
    pub fn init(&mut self) {
        self.set(constants::ARENA_FIRST_CELL_INDEX, BlockType::Free);
    }

    /// Make `index` the head of a white block of `cells` cells. The cell
    /// following the block, if it continued the free block being carved,
    /// becomes the head of the free remainder.
    pub fn mark_allocated(&mut self, index: usize, cells: usize) {
        debug_assert!(cells > 0);
        debug_assert!(index + cells <= constants::ARENA_CELLS_COUNT);

        self.set(index, BlockType::White);
        for extent in index + 1..index + cells {
            self.set(extent, BlockType::Extent);
        }

        let next = index + cells;
        if next < constants::ARENA_CELLS_COUNT && self.get(next) == BlockType::Extent {
            self.set(next, BlockType::Free);
        }
    }

    /// Free the block headed at `index`. Its extent cells now continue a free
    /// block; no coalescing with neighbours happens here.
    pub fn mark_free(&mut self, index: usize) {
        self.set(index, BlockType::Free);
    }

    /// Index one past the last cell of the block headed at `index`
    pub fn block_end(&self, index: usize) -> usize {
        let mut end = index + 1;
        while end < constants::ARENA_CELLS_COUNT && self.get(end) == BlockType::Extent {
            end += 1;
        }
        end
    }

    /// Index of the head of the block containing `index`
    pub fn block_head(&self, index: usize) -> usize {
        let mut head = index;
        while head > constants::ARENA_FIRST_CELL_INDEX && self.get(head) == BlockType::Extent {
            head -= 1;
        }
        head
    }

    fn payload(&self) -> impl Iterator<Item = (usize, BlockType)> + '_ {
        (constants::ARENA_FIRST_CELL_INDEX..constants::ARENA_CELLS_COUNT)
            .map(move |index| (index, self.get(index)))
    }

    /// Number of block heads of the given type
    pub fn count(&self, block_type: BlockType) -> usize {
        self.payload().filter(|(_, t)| *t == block_type).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.payload().any(|(_, t)| t.is_allocated())
    }

    pub fn is_coalesced(&self) -> bool {
        let mut prev_was_free = false;

        for (_, block_type) in self.payload() {
            match block_type {
                BlockType::White | BlockType::Black => prev_was_free = false,
                BlockType::Free => {
                    if prev_was_free {
                        return false;
                    }
                    prev_was_free = true;
                }
                BlockType::Extent => (),
            }
        }

        true
    }

    /// Merge every run of abutting free blocks into its first block. Returns
    /// the number of free heads that were absorbed.
    pub fn coalesce(&mut self) -> usize {
        let mut merged = 0;
        let mut prev_was_free = false;

        for index in constants::ARENA_FIRST_CELL_INDEX..constants::ARENA_CELLS_COUNT {
            match self.get(index) {
                BlockType::White | BlockType::Black => prev_was_free = false,
                BlockType::Free => {
                    if prev_was_free {
                        self.set(index, BlockType::Extent);
                        merged += 1;
                    }
                    prev_was_free = true;
                }
                BlockType::Extent => (),
            }
        }

        merged
    }

    /// Reclaim white blocks, reset black blocks to white for the next trace
    /// and coalesce the resulting free runs. Returns true if no allocation
    /// survived.
    pub fn sweep(&mut self) -> bool {
        let mut empty = true;
        let mut coalesce = false;

        for index in constants::ARENA_FIRST_CELL_INDEX..constants::ARENA_CELLS_COUNT {
            match self.get(index) {
                BlockType::Extent => (),
                BlockType::Free => {
                    if coalesce {
                        self.set(index, BlockType::Extent);
                    }
                    coalesce = true;
                }
                BlockType::White => {
                    if coalesce {
                        self.set(index, BlockType::Extent);
                    } else {
                        self.set(index, BlockType::Free);
                    }
                    coalesce = true;
                }
                BlockType::Black => {
                    empty = false;
                    coalesce = false;
                    self.set(index, BlockType::White);
                }
            }
        }

        empty
    }
}
