/// A block allocator for regions of memory that must be:
///  - powers of two in size
///  - aligned to their size
///  - zero-filled on return
///
/// On unix the region comes from an anonymous `mmap` that is over-allocated
/// and trimmed down to a size-aligned window. Elsewhere the std Alloc API is
/// used with a size-aligned layout.
///
/// Usage:
/// ```
/// use blockalloc::Block;
///
/// let size = 4096;  // must be a power of 2
/// let block = Block::new(size).unwrap();
/// assert_eq!(block.as_ptr() as usize % size, 0);
/// ```
///
/// Normal scoping rules will call Block::drop() when `block` goes out of scope
/// causing the block to be fully deallocated.
use std::fmt;
use std::ptr::NonNull;

pub type BlockPtr = NonNull<u8>;
pub type BlockSize = usize;

/// Set of possible block allocation failures
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BlockError {
    /// Usually means requested block size, and therefore alignment, wasn't a
    /// power of two
    BadRequest,
    /// Insufficient memory, couldn't allocate a block
    OOM,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockError::BadRequest => write!(f, "block size must be a non-zero power of two"),
            BlockError::OOM => write!(f, "out of memory allocating block"),
        }
    }
}

impl std::error::Error for BlockError {}

/// A block-size-aligned, zero-initialized region of memory
pub struct Block {
    ptr: BlockPtr,
    size: BlockSize,
}

impl Block {
    /// Instantiate a new block of the given size. Size must be a power of two.
    pub fn new(size: BlockSize) -> Result<Block, BlockError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(BlockError::BadRequest);
        }

        Ok(Block {
            ptr: internal::alloc_block(size)?,
            size,
        })
    }

    /// Return the size in bytes of the block
    pub fn size(&self) -> BlockSize {
        self.size
    }

    /// Return a bare pointer to the base of the block
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Return a mutable bare pointer to the base of the block
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// True if `addr` falls inside this block
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr - base < self.size
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        internal::dealloc_block(self.ptr, self.size);
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Block")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}

/// The set of possible allocation sources
#[derive(Debug, PartialEq)]
pub enum BlockSource {
    RustAlloc,
    Mmap,
}

pub fn block_source() -> BlockSource {
    internal::BLOCK_SOURCE
}

#[cfg(unix)]
mod internal {
    use super::{BlockError, BlockPtr, BlockSize, BlockSource};
    use std::ptr::{self, NonNull};

    pub const BLOCK_SOURCE: BlockSource = BlockSource::Mmap;

    fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    unsafe fn map(len: usize) -> Result<usize, BlockError> {
        let mem = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if mem == libc::MAP_FAILED {
            Err(BlockError::OOM)
        } else {
            Ok(mem as usize)
        }
    }

    /// Anonymous mappings are zero-filled and page aligned. For blocks larger
    /// than a page, map twice the size and unmap the misaligned head and tail.
    pub fn alloc_block(size: BlockSize) -> Result<BlockPtr, BlockError> {
        let page = page_size();

        unsafe {
            let aligned = if size <= page {
                map(page)?
            } else {
                let len = size.checked_mul(2).ok_or(BlockError::BadRequest)?;
                let mem = map(len)?;

                let aligned = (mem + size - 1) & !(size - 1);
                let before = aligned - mem;
                let after = len - before - size;

                if before > 0 {
                    libc::munmap(mem as *mut libc::c_void, before);
                }
                if after > 0 {
                    libc::munmap((aligned + size) as *mut libc::c_void, after);
                }

                aligned
            };

            Ok(NonNull::new_unchecked(aligned as *mut u8))
        }
    }

    pub fn dealloc_block(ptr: BlockPtr, size: BlockSize) {
        // munmap rounds the length up to whole pages, which also covers the
        // single-page mapping made for sub-page blocks
        unsafe {
            libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
        }
    }
}

#[cfg(not(unix))]
mod internal {
    use super::{BlockError, BlockPtr, BlockSize, BlockSource};
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::ptr::NonNull;

    pub const BLOCK_SOURCE: BlockSource = BlockSource::RustAlloc;

    pub fn alloc_block(size: BlockSize) -> Result<BlockPtr, BlockError> {
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, size);

            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                Err(BlockError::OOM)
            } else {
                Ok(NonNull::new_unchecked(ptr))
            }
        }
    }

    pub fn dealloc_block(ptr: BlockPtr, size: BlockSize) {
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, size);

            dealloc(ptr.as_ptr(), layout);
        }
    }
}
