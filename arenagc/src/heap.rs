use std::io::{self, Write};
use std::mem::{align_of, size_of};
use std::ptr::{write, NonNull};

use crate::allocator::{bytes_to_cells, AllocError};
use crate::arena::{self, Arena, Cell};
use crate::blockmeta::BlockType;
use crate::bumpalloc::BumpAllocator;
use crate::constants;
use crate::eventlog::{words_payload, EventKind, EventWriter};
use crate::fitalloc::FitAllocator;
use crate::rawptr::RawPtr;

/// Outcome of a heap-wide sweep
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SweepStats {
    pub arenas: usize,
    pub empty_arenas: usize,
    pub free_spans: usize,
    pub free_cells: usize,
}

/// The allocation context: the arenas, the bump allocator and the fit
/// allocator, owned together by one mutator.
///
/// Requests are served from the bump region first. When it runs dry the
/// unused rest of the region is handed to the fit allocator, a recycled span
/// large enough for the request becomes the new bump region, and only if
/// there is none is a new arena mapped.
///
/// Does not allocate internally on initialization.
pub struct Heap {
    arenas: Vec<Arena>,
    bump: BumpAllocator,
    fit: FitAllocator,
    events: Option<EventWriter<Box<dyn Write>>>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            arenas: Vec::new(),
            bump: BumpAllocator::new(),
            fit: FitAllocator::new(),
            events: None,
        }
    }

    /// A heap that records instrumentation events to `out`
    pub fn with_event_log<W: Write + 'static>(out: W) -> io::Result<Heap> {
        let mut heap = Heap::new();
        heap.events = Some(EventWriter::new(Box::new(out) as Box<dyn Write>)?);
        Ok(heap)
    }

    /// Allocate `bytes` rounded up to whole cells, committed as a white
    /// block. Fails only for requests larger than an arena's payload.
    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<Cell>, AllocError> {
        let cells = bytes_to_cells(bytes);
        if cells > constants::ARENA_PAYLOAD_CELLS {
            return Err(AllocError::BadRequest);
        }

        if let Some(ptr) = self.bump.allocate(bytes) {
            return Ok(ptr);
        }

        self.retire_bump_region();

        if let Some(span) = self.fit.take(bytes) {
            log::trace!("bump allocator switched to free span of {} cells", span.cells);
            self.log(EventKind::AllocatorSwitch, &(span.cells as u64).to_ne_bytes());

            // registered spans are whole free blocks in our own arenas
            unsafe { self.bump.assign(span.ptr, span.cells) };
        } else {
            let first = self.new_arena();
            log::trace!("bump allocator switched to new arena");

            unsafe { self.bump.assign(first, constants::ARENA_PAYLOAD_CELLS) };
        }

        self.bump.allocate(bytes).ok_or(AllocError::BadRequest)
    }

    /// Write an object into the heap and return a pointer to it. The object is
    /// never dropped; the cells are simply reclaimed when it becomes garbage.
    pub fn alloc<T>(&mut self, object: T) -> Result<RawPtr<T>, AllocError> {
        if align_of::<T>() > constants::CELL_SIZE {
            return Err(AllocError::BadRequest);
        }

        let space = self.allocate(size_of::<T>())?;
        unsafe { write(space.as_ptr() as *mut T, object) };

        Ok(RawPtr::from_cell(space))
    }

    /// Hand the unused rest of the bump region to the fit allocator so that
    /// no free cells drop out of tracking
    fn retire_bump_region(&mut self) {
        if let Some(rest) = self.bump.release() {
            unsafe { self.fit.add(rest.ptr, rest.cells) };
        }
    }

    fn new_arena(&mut self) -> NonNull<Cell> {
        let arena = Arena::new();
        let first = arena.first_cell();

        self.log(EventKind::NewArena, &(arena.base() as u64).to_ne_bytes());
        self.arenas.push(arena);

        first
    }

    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    pub fn bump_allocator(&self) -> &BumpAllocator {
        &self.bump
    }

    pub fn fit_allocator(&self) -> &FitAllocator {
        &self.fit
    }

    /// The arena whose payload holds `ptr`
    pub fn owning_arena(&self, ptr: *const Cell) -> Option<&Arena> {
        let base = arena::arena_base(ptr);
        self.arenas
            .iter()
            .find(|arena| arena.base() == base && arena.contains(ptr))
    }

    fn owning_arena_mut(&mut self, ptr: *const Cell) -> Result<&mut Arena, AllocError> {
        let base = arena::arena_base(ptr);
        self.arenas
            .iter_mut()
            .find(|arena| arena.base() == base && arena.contains(ptr))
            .ok_or(AllocError::NotInHeap)
    }

    /// Tag at `ptr`
    pub fn block_type(&self, ptr: *const Cell) -> Result<BlockType, AllocError> {
        self.owning_arena(ptr)
            .map(|arena| arena.block_type_of(ptr))
            .ok_or(AllocError::NotInHeap)
    }

    /// Retag the block headed at `ptr`; the mark phase uses this to blacken
    /// reached blocks
    pub fn set_block_type(&mut self, ptr: *const Cell, block_type: BlockType) -> Result<(), AllocError> {
        let arena = self.owning_arena_mut(ptr)?;
        let index = arena::cell_index(ptr);
        arena.set_block_type(index, block_type);
        Ok(())
    }

    /// Free the allocated block headed at `ptr`. The block is not coalesced
    /// or registered for reuse until the next sweep.
    pub fn mark_free(&mut self, ptr: *const Cell) -> Result<(), AllocError> {
        let arena = self.owning_arena_mut(ptr)?;
        if !arena.block_type_of(ptr).is_allocated() {
            return Err(AllocError::BadRequest);
        }
        arena.mark_free(ptr);
        Ok(())
    }

    /// Reclaim every white block, whiten the black ones and coalesce, then
    /// rebuild the fit allocator from the free blocks of every arena. The mark
    /// phase must have blackened all reachable blocks beforehand.
    pub fn sweep(&mut self) -> SweepStats {
        self.log(EventKind::SweepStart, &[]);

        // both would describe space that sweeping may merge or move heads in
        self.bump.release();
        self.fit.clear();

        let mut stats = SweepStats {
            arenas: self.arenas.len(),
            ..SweepStats::default()
        };

        for arena in self.arenas.iter_mut() {
            if arena.sweep() {
                stats.empty_arenas += 1;
            }

            for span in arena.free_spans() {
                unsafe { self.fit.add(span.ptr, span.cells) };
                stats.free_spans += 1;
                stats.free_cells += span.cells;
            }
        }

        log::debug!(
            "swept {} arenas: {} empty, {} free cells in {} spans",
            stats.arenas,
            stats.empty_arenas,
            stats.free_cells,
            stats.free_spans
        );
        self.log(EventKind::SweepDone, &(stats.free_cells as u64).to_ne_bytes());

        stats
    }

    /// Unmap every arena that holds no allocation. Returns how many were
    /// released.
    pub fn release_empty_arenas(&mut self) -> usize {
        let before = self.arenas.len();
        let fit = &mut self.fit;
        let bump = &mut self.bump;

        self.arenas.retain(|arena| {
            if !arena.is_empty() {
                return true;
            }

            fit.forget_arena(arena.base());
            if bump.is_in_arena(arena.base()) {
                bump.release();
            }
            log::debug!("releasing empty arena at {:#x}", arena.base());

            false
        });

        before - self.arenas.len()
    }

    /// Record the size of every registered free span
    pub fn dump_free_lists(&mut self) {
        let payload = words_payload(self.fit.spans().map(|span| span.cells as u64));
        self.log(EventKind::FreelistDump, &payload);
    }

    /// Record an event on behalf of a collector phase this heap does not
    /// drive itself, such as `MarkStart`/`MarkDone`
    pub fn log_event(&mut self, kind: EventKind, payload: &[u8]) {
        self.log(kind, payload);
    }

    fn log(&mut self, kind: EventKind, payload: &[u8]) {
        if let Some(events) = self.events.as_mut() {
            if let Err(e) = events.log(kind, payload) {
                log::warn!("could not write {:?} event: {}", kind, e);
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}
