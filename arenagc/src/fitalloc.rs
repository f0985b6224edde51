use std::ptr::NonNull;

use crate::allocator::bytes_to_cells;
use crate::arena::{self, Cell, FreeSpan};
use crate::blockmeta::BlockType;
use crate::constants;

/// Registry of reclaimed free blocks, consulted when the bump allocator runs
/// dry. Spans of up to `SMALL_FREE_LISTS` cells are kept in exact-size lists;
/// longer spans go into lists of exponentially growing size ranges.
///
/// The registry never touches the bitmaps. Entries are checked against them
/// on the way out, and an entry that no longer describes a free block is
/// dropped.
#[derive(Debug)]
pub struct FitAllocator {
    small_free_lists: Vec<Vec<NonNull<Cell>>>,
    large_free_lists: Vec<Vec<FreeSpan>>,
}

fn is_small(cells: usize) -> bool {
    cells <= constants::SMALL_FREE_LISTS
}

fn small_index(cells: usize) -> usize {
    debug_assert!(cells > 0 && is_small(cells));
    cells - 1
}

fn small_index_to_cells(index: usize) -> usize {
    index + 1
}

/// floor(log2(cells >> LARGE_FREE_LIST_FIRST_BITS))
fn large_index(cells: usize) -> usize {
    debug_assert!(!is_small(cells));
    let scaled = cells >> constants::LARGE_FREE_LIST_FIRST_BITS;
    (usize::BITS - 1 - scaled.leading_zeros()) as usize
}

/// The span is still exactly one free block
unsafe fn valid_span(ptr: NonNull<Cell>, cells: usize) -> bool {
    arena::block_type_at(ptr.as_ptr()) == BlockType::Free
        && arena::block_len_at(ptr.as_ptr()) == cells
}

impl FitAllocator {
    pub fn new() -> FitAllocator {
        FitAllocator {
            small_free_lists: (0..constants::SMALL_FREE_LISTS).map(|_| Vec::new()).collect(),
            large_free_lists: (0..constants::LARGE_FREE_LISTS).map(|_| Vec::new()).collect(),
        }
    }

    /// Register a free block of `cells` cells headed at `ptr`. Empty spans
    /// are ignored.
    ///
    /// # Safety
    /// `ptr` must head a free block of exactly `cells` cells in a live arena,
    /// not overlapping any registered span or assigned bump region, and the
    /// arena must outlive the entry (see `forget_arena`).
    pub unsafe fn add(&mut self, ptr: NonNull<Cell>, cells: usize) {
        if cells == 0 {
            return;
        }

        if is_small(cells) {
            self.small_free_lists[small_index(cells)].push(ptr);
        } else {
            self.large_free_lists[large_index(cells)].push(FreeSpan { ptr, cells });
        }
    }

    /// Remove and return a registered span of at least `ceil(bytes / CELL_SIZE)`
    /// cells, first fit from the smallest suitable list upwards. The whole
    /// span is handed over; the caller owns any cells beyond the request.
    pub fn take(&mut self, bytes: usize) -> Option<FreeSpan> {
        let cells = bytes_to_cells(bytes);

        if is_small(cells) {
            self.small_first_fit(cells)
                .or_else(|| self.large_first_fit(0, cells))
        } else {
            self.large_first_fit(large_index(cells), cells)
        }
    }

    fn small_first_fit(&mut self, cells: usize) -> Option<FreeSpan> {
        for index in small_index(cells)..constants::SMALL_FREE_LISTS {
            let span_cells = small_index_to_cells(index);

            while let Some(ptr) = self.small_free_lists[index].pop() {
                if unsafe { valid_span(ptr, span_cells) } {
                    return Some(FreeSpan {
                        ptr,
                        cells: span_cells,
                    });
                }
                log::trace!("dropping stale free span at {:p}", ptr);
            }
        }

        None
    }

    fn large_first_fit(&mut self, first: usize, cells: usize) -> Option<FreeSpan> {
        for index in first..constants::LARGE_FREE_LISTS {
            let free_list = &mut self.large_free_lists[index];

            // walk from the back so swap_remove only moves entries already seen
            let mut item = free_list.len();
            while item > 0 {
                item -= 1;

                if free_list[item].cells < cells {
                    continue;
                }

                let span = free_list.swap_remove(item);
                if unsafe { valid_span(span.ptr, span.cells) } {
                    return Some(span);
                }
                log::trace!("dropping stale free span at {:p}", span.ptr);
            }
        }

        None
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        for free_list in self.small_free_lists.iter_mut() {
            free_list.clear();
        }
        for free_list in self.large_free_lists.iter_mut() {
            free_list.clear();
        }
    }

    /// Drop the entries that lie in the arena based at `base`, before that
    /// arena is unmapped
    pub fn forget_arena(&mut self, base: usize) {
        for free_list in self.small_free_lists.iter_mut() {
            free_list.retain(|ptr| arena::arena_base(ptr.as_ptr()) != base);
        }
        for free_list in self.large_free_lists.iter_mut() {
            free_list.retain(|span| arena::arena_base(span.ptr.as_ptr()) != base);
        }
    }

    /// Number of registered spans
    pub fn len(&self) -> usize {
        self.small_free_lists.iter().map(Vec::len).sum::<usize>()
            + self.large_free_lists.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total cells across all registered spans
    pub fn free_cells(&self) -> usize {
        self.spans().map(|span| span.cells).sum()
    }

    /// All registered spans, small lists first
    pub fn spans(&self) -> impl Iterator<Item = FreeSpan> + '_ {
        let small = self
            .small_free_lists
            .iter()
            .enumerate()
            .flat_map(|(index, free_list)| {
                free_list.iter().map(move |ptr| FreeSpan {
                    ptr: *ptr,
                    cells: small_index_to_cells(index),
                })
            });

        let large = self.large_free_lists.iter().flat_map(|free_list| free_list.iter().copied());

        small.chain(large)
    }
}

impl Default for FitAllocator {
    fn default() -> FitAllocator {
        FitAllocator::new()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::arena::Arena;
    use crate::bumpalloc::BumpAllocator;
    use crate::constants::{ARENA_FIRST_CELL_INDEX, ARENA_PAYLOAD_CELLS, CELL_SIZE};

    const FIRST: usize = ARENA_FIRST_CELL_INDEX;

    /// Allocate consecutive blocks of the given sizes from the start of the
    /// arena, each followed by a one-cell separator, then free the sized
    /// blocks and return them as spans
    fn free_blocks_of(arena: &mut Arena, sizes: &[usize]) -> Vec<FreeSpan> {
        let mut index = FIRST;
        let mut spans = Vec::new();

        for cells in sizes {
            let ptr = arena.cell(index);
            arena.mark_allocated(ptr.as_ptr(), *cells);
            arena.mark_allocated(arena.cell(index + cells).as_ptr(), 1);
            spans.push(FreeSpan { ptr, cells: *cells });
            index += cells + 1;
        }

        for span in spans.iter() {
            arena.mark_free(span.ptr.as_ptr());
        }

        spans
    }

    fn register(fit: &mut FitAllocator, spans: &[FreeSpan]) {
        for span in spans {
            unsafe { fit.add(span.ptr, span.cells) };
        }
    }

    #[test]
    fn test_list_indices() {
        assert_eq!(small_index(1), 0);
        assert_eq!(small_index(32), 31);
        assert_eq!(large_index(33), 0);
        assert_eq!(large_index(63), 0);
        assert_eq!(large_index(64), 1);
        assert_eq!(large_index(127), 1);
        assert_eq!(large_index(128), 2);
        assert_eq!(large_index(ARENA_PAYLOAD_CELLS), 10);
    }

    #[test]
    fn test_reuse_old_free_space() {
        let arena = Arena::new();
        let mut fit = FitAllocator::new();
        unsafe { fit.add(arena.first_cell(), ARENA_PAYLOAD_CELLS) };

        let span = fit.take(16).unwrap();
        assert_eq!(span.ptr, arena.first_cell());
        assert_eq!(span.cells, ARENA_PAYLOAD_CELLS);
        assert!(fit.is_empty());

        let mut bump = BumpAllocator::new();
        unsafe { bump.assign(span.ptr, span.cells) };
        assert_eq!(bump.allocate(16), Some(arena.first_cell()));
    }

    #[test]
    fn test_small_first_fit() {
        let mut arena = Arena::new();
        let spans = free_blocks_of(&mut arena, &[3, 5, 40]);

        let mut fit = FitAllocator::new();
        register(&mut fit, &spans);
        assert_eq!(fit.len(), 3);
        assert_eq!(fit.free_cells(), 48);

        // nothing of exactly two cells; the three-cell span is next up
        assert_eq!(fit.take(2 * CELL_SIZE), Some(spans[0]));
        assert_eq!(fit.take(4 * CELL_SIZE), Some(spans[1]));
        // no small span left, so the search moves on to the large lists
        assert_eq!(fit.take(CELL_SIZE), Some(spans[2]));
        assert_eq!(fit.take(CELL_SIZE), None);
    }

    #[test]
    fn test_large_first_fit() {
        let mut arena = Arena::new();
        let spans = free_blocks_of(&mut arena, &[100, 40, 1000]);

        let mut fit = FitAllocator::new();
        register(&mut fit, &spans);

        // 40 and 100 share no list; 500 cells must skip both
        assert_eq!(fit.take(500 * CELL_SIZE), Some(spans[2]));
        assert_eq!(fit.take(50 * CELL_SIZE), Some(spans[0]));
        assert_eq!(fit.take(34 * CELL_SIZE), Some(spans[1]));
        assert!(fit.is_empty());
    }

    #[test]
    fn test_too_small_span_is_kept() {
        let mut arena = Arena::new();
        let spans = free_blocks_of(&mut arena, &[40]);

        let mut fit = FitAllocator::new();
        register(&mut fit, &spans);

        // same list as the 40-cell span, but larger
        assert_eq!(fit.take(50 * CELL_SIZE), None);
        assert_eq!(fit.len(), 1);
        assert_eq!(fit.free_cells(), 40);

        assert_eq!(fit.take(40 * CELL_SIZE), Some(spans[0]));
    }

    #[test]
    fn test_miss() {
        let mut fit = FitAllocator::new();
        assert_eq!(fit.take(16), None);

        let mut arena = Arena::new();
        let spans = free_blocks_of(&mut arena, &[2]);
        register(&mut fit, &spans);
        assert_eq!(fit.take(3 * CELL_SIZE), None);
        assert_eq!(fit.free_cells(), 2);
    }

    #[test]
    fn test_huge_request_misses() {
        let mut arena = Arena::new();
        let spans = free_blocks_of(&mut arena, &[1000]);

        let mut fit = FitAllocator::new();
        register(&mut fit, &spans);

        assert_eq!(fit.take(usize::MAX), None);
        assert_eq!(fit.take(usize::MAX - 3), None);
        assert_eq!(fit.free_cells(), 1000);
    }

    #[test]
    fn test_stale_span_dropped() {
        let mut arena = Arena::new();
        let spans = free_blocks_of(&mut arena, &[4, 4]);

        let mut fit = FitAllocator::new();
        register(&mut fit, &spans);

        // someone else allocated the second span behind the registry's back
        arena.mark_allocated(spans[1].ptr.as_ptr(), 4);

        assert_eq!(fit.take(4 * CELL_SIZE), Some(spans[0]));
        assert_eq!(fit.take(4 * CELL_SIZE), None);
        assert!(fit.is_empty());
    }

    #[test]
    fn test_take_accounting() {
        let mut arena = Arena::new();
        let sizes = [1, 2, 7, 32, 33, 64, 300];
        let spans = free_blocks_of(&mut arena, &sizes);
        let total: usize = sizes.iter().sum();

        let mut fit = FitAllocator::new();
        register(&mut fit, &spans);

        let mut taken = 0;
        for request in &[5, 1, 40, 200] {
            let span = fit.take(request * CELL_SIZE).unwrap();
            assert!(span.cells >= *request);
            taken += span.cells;
            assert_eq!(taken + fit.free_cells(), total);
        }
    }

    #[test]
    fn test_forget_arena() {
        let mut a = Arena::new();
        let mut b = Arena::new();
        let a_spans = free_blocks_of(&mut a, &[3, 50]);
        let b_spans = free_blocks_of(&mut b, &[3]);

        let mut fit = FitAllocator::new();
        register(&mut fit, &a_spans);
        register(&mut fit, &b_spans);
        assert_eq!(fit.len(), 3);

        fit.forget_arena(a.base());
        assert_eq!(fit.len(), 1);
        assert_eq!(fit.take(CELL_SIZE), Some(b_spans[0]));

        register(&mut fit, &a_spans);
        fit.clear();
        assert!(fit.is_empty());
    }
}
