use std::ptr::NonNull;

use proptest::prelude::*;

use arenagc::arena::{self, Arena};
use arenagc::constants::{ARENA_FIRST_CELL_INDEX, ARENA_PAYLOAD_CELLS, CELL_SIZE};
use arenagc::{bytes_to_cells, BlockType, BumpAllocator, Cell, FitAllocator, FreeSpan, Heap};

fn addr(ptr: NonNull<Cell>) -> usize {
    ptr.as_ptr() as usize
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn bump_allocations_are_ordered_and_disjoint(
        region in 1usize..2000,
        sizes in prop::collection::vec(0usize..400, 1..200),
    ) {
        let arena = Arena::new();
        let mut bump = BumpAllocator::new();
        unsafe { bump.assign(arena.first_cell(), region) };

        let start = addr(arena.first_cell());
        let end = start + region * CELL_SIZE;
        let mut next = start;

        for bytes in sizes {
            let remaining = bump.remaining_cells();
            let cells = bytes_to_cells(bytes);

            match bump.allocate(bytes) {
                Some(p) => {
                    prop_assert!(cells <= remaining);
                    prop_assert_eq!(addr(p), next);
                    prop_assert!(addr(p) + cells * CELL_SIZE <= end);
                    prop_assert_eq!(bump.remaining_cells(), remaining - cells);
                    prop_assert_eq!(arena.block_type(arena::cell_index(p.as_ptr())), BlockType::White);
                    next += cells * CELL_SIZE;
                }
                None => {
                    prop_assert!(cells > remaining);
                    prop_assert_eq!(bump.remaining_cells(), remaining);
                }
            }
        }

        prop_assert!(arena.is_coalesced());
    }

    #[test]
    fn fit_take_never_loses_cells(
        sizes in prop::collection::vec(1usize..300, 1..40),
        requests in prop::collection::vec(1usize..300, 1..40),
    ) {
        let mut arena = Arena::new();
        let mut index = ARENA_FIRST_CELL_INDEX;
        let mut spans = Vec::new();

        // free blocks separated by single live cells
        for cells in sizes.iter() {
            let ptr = arena.cell(index);
            arena.mark_allocated(ptr.as_ptr(), *cells);
            arena.mark_allocated(arena.cell(index + cells).as_ptr(), 1);
            spans.push(FreeSpan { ptr, cells: *cells });
            index += cells + 1;
        }

        let mut fit = FitAllocator::new();
        for span in spans.iter() {
            arena.mark_free(span.ptr.as_ptr());
            unsafe { fit.add(span.ptr, span.cells) };
        }

        let total: usize = sizes.iter().sum();
        let mut taken = 0;

        for cells in requests {
            let largest = fit.spans().map(|span| span.cells).max().unwrap_or(0);

            match fit.take(cells * CELL_SIZE) {
                Some(span) => {
                    prop_assert!(span.cells >= cells);
                    prop_assert!(spans.contains(&span));
                    taken += span.cells;
                }
                None => prop_assert!(largest < cells),
            }

            prop_assert_eq!(taken + fit.free_cells(), total);
        }
    }

    #[test]
    fn heap_addresses_resolve_to_their_arena(
        sizes in prop::collection::vec(1usize..(64 * 1024), 1..100),
    ) {
        let mut heap = Heap::new();
        let mut seen = Vec::new();

        for bytes in sizes {
            let p = heap.allocate(bytes).unwrap();
            let owner = heap.owning_arena(p.as_ptr()).unwrap();

            prop_assert_eq!(owner.base(), arena::arena_base(p.as_ptr()));
            prop_assert_eq!(owner.block_len(arena::cell_index(p.as_ptr())), bytes_to_cells(bytes));
            prop_assert!(!seen.contains(&addr(p)));
            seen.push(addr(p));
        }
    }
}

#[test]
fn thousand_small_allocations_share_one_arena() {
    let mut heap = Heap::new();
    let mut seen = Vec::new();

    for _ in 0..1000 {
        let p = heap.allocate(16).unwrap();
        assert!(!seen.contains(&addr(p)));
        seen.push(addr(p));
    }

    let base = arena::arena_base(seen[0] as *const Cell);
    assert!(seen.iter().all(|p| arena::arena_base(*p as *const Cell) == base));
    assert_eq!(heap.arenas().len(), 1);
    assert_eq!(heap.arenas()[0].white_blocks(), 1000);
}

#[test]
fn collect_cycle_recycles_garbage() {
    let mut heap = Heap::new();

    // every other object survives
    let objects: Vec<NonNull<Cell>> = (0..200).map(|_| heap.allocate(3 * CELL_SIZE).unwrap()).collect();
    heap.log_event(arenagc::eventlog::EventKind::MarkStart, &[]);
    for p in objects.iter().step_by(2) {
        heap.set_block_type(p.as_ptr(), BlockType::Black).unwrap();
    }

    let stats = heap.sweep();
    assert_eq!(stats.empty_arenas, 0);
    assert_eq!(stats.free_spans, 100);
    assert_eq!(stats.free_cells, ARENA_PAYLOAD_CELLS - 100 * 3);
    assert!(heap.arenas()[0].is_coalesced());
    assert_eq!(heap.arenas()[0].white_blocks(), 100);

    // the last hole merged with the tail; the rest are three cells each and
    // get reused before anything else
    let p = heap.allocate(2 * CELL_SIZE).unwrap();
    assert!(objects.contains(&p));
    assert_eq!(heap.arenas().len(), 1);
}
