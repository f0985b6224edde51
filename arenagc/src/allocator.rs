use std::error::Error;
use std::fmt;

use blockalloc::BlockError;

use crate::constants;

/// An allocation error type
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AllocError {
    /// Some attribute of the allocation, most likely the size requested,
    /// could not be fulfilled
    BadRequest,
    /// Out of memory - mapping a new arena failed
    OOM,
    /// The pointer does not lie in any arena owned by this heap
    NotInHeap,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocError::BadRequest => write!(f, "allocation request cannot be satisfied"),
            AllocError::OOM => write!(f, "out of memory"),
            AllocError::NotInHeap => write!(f, "pointer is not inside the heap"),
        }
    }
}

impl Error for AllocError {}

impl From<BlockError> for AllocError {
    fn from(error: BlockError) -> AllocError {
        match error {
            BlockError::BadRequest => AllocError::BadRequest,
            BlockError::OOM => AllocError::OOM,
        }
    }
}

/// Object size class.
/// - Small objects are below the large-allocation threshold
/// - Large objects are at or above it. They are allocated the same way, by
///   cell count, but collector policy may treat them differently.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    pub fn get_for_size(object_size: usize) -> SizeClass {
        if object_size < constants::LARGE_ALLOC_THRESHOLD {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }
}

/// Number of cells needed to hold `bytes`, never less than one
pub fn bytes_to_cells(bytes: usize) -> usize {
    let partial = bytes & (constants::CELL_SIZE - 1) != 0;
    ((bytes >> constants::CELL_SIZE_BITS) + partial as usize).max(1)
}
