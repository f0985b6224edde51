use std::ptr::NonNull;

use crate::allocator::bytes_to_cells;
use crate::arena::{self, Cell, FreeSpan};

/// Linear allocator over one contiguous free region. Each allocation commits
/// its cells as a white block and advances the cursor; when the region can't
/// satisfy a request the caller must assign a new one.
#[derive(Debug)]
pub struct BumpAllocator {
    cursor: Option<NonNull<Cell>>,
    remaining: usize,
}

impl BumpAllocator {
    /// An allocator with no region assigned. Every request fails until
    /// `assign` is called.
    pub fn new() -> BumpAllocator {
        BumpAllocator {
            cursor: None,
            remaining: 0,
        }
    }

    /// Replace the current region with `cells` cells starting at `ptr`. The
    /// bitmaps are not touched.
    ///
    /// # Safety
    /// The region must lie inside the payload of one live arena, start at the
    /// head of a free block and be free throughout, and the arena must
    /// outlive its use by this allocator.
    pub unsafe fn assign(&mut self, ptr: NonNull<Cell>, cells: usize) {
        self.cursor = Some(ptr);
        self.remaining = cells;
    }

    /// Carve `ceil(bytes / CELL_SIZE)` cells off the front of the region.
    /// Returns `None`, leaving the region unchanged, if it is too small.
    pub fn allocate(&mut self, bytes: usize) -> Option<NonNull<Cell>> {
        let cells = bytes_to_cells(bytes);
        if cells > self.remaining {
            return None;
        }

        let result = self.cursor?;

        unsafe {
            // the region contract of `assign` covers these cells
            arena::mark_allocated_at(result.as_ptr(), cells);
            self.cursor = Some(NonNull::new_unchecked(result.as_ptr().add(cells)));
        }
        self.remaining -= cells;

        Some(result)
    }

    /// Next cell to be handed out, if a region is assigned
    pub fn cursor(&self) -> Option<NonNull<Cell>> {
        self.cursor
    }

    pub fn remaining_cells(&self) -> usize {
        self.remaining
    }

    /// Detach the unused rest of the region, leaving the allocator unassigned.
    /// The returned span is a free block.
    pub fn release(&mut self) -> Option<FreeSpan> {
        let cursor = self.cursor.take();
        let cells = std::mem::replace(&mut self.remaining, 0);

        match cursor {
            Some(ptr) if cells > 0 => Some(FreeSpan { ptr, cells }),
            _ => None,
        }
    }

    /// True if the unused region lies in the arena based at `base`
    pub fn is_in_arena(&self, base: usize) -> bool {
        match self.cursor {
            Some(ptr) if self.remaining > 0 => arena::arena_base(ptr.as_ptr()) == base,
            _ => false,
        }
    }
}

impl Default for BumpAllocator {
    fn default() -> BumpAllocator {
        BumpAllocator::new()
    }
}
