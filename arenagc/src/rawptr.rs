use std::ptr::NonNull;

use crate::arena::{self, Cell};

/// A container for a bare pointer to an object of type `T` stored in heap
/// cells. At this level, compile-time type information is still part of the
/// type.
pub struct RawPtr<T: Sized> {
    ptr: NonNull<T>,
}

impl<T: Sized> RawPtr<T> {
    /// Create a new RawPtr from the head cell of the object's block
    pub fn from_cell(cell: NonNull<Cell>) -> RawPtr<T> {
        RawPtr { ptr: cell.cast() }
    }

    /// Get the pointer value as a word-sized integer
    pub fn as_word(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// The head cell of the block holding the object
    pub fn as_cell(&self) -> NonNull<Cell> {
        self.ptr.cast()
    }

    /// Base address of the arena holding the object
    pub fn arena_base(&self) -> usize {
        arena::arena_base(self.as_cell().as_ptr())
    }

    /// Get a `&` reference to the object. Unsafe because there are no guarantees at this level
    /// about the internal pointer's validity.
    pub unsafe fn as_ref(&self) -> &T {
        self.ptr.as_ref()
    }

    /// Get a `&mut` reference to the object. Unsafe because there are no guarantees at this level
    /// about the internal pointer's validity, nor any prevention of mutable aliasing.
    pub unsafe fn as_mut_ref(&mut self) -> &mut T {
        self.ptr.as_mut()
    }
}

impl<T> Clone for RawPtr<T> {
    fn clone(&self) -> RawPtr<T> {
        RawPtr { ptr: self.ptr }
    }
}

impl<T> Copy for RawPtr<T> {}

impl<T: Sized> PartialEq for RawPtr<T> {
    fn eq(&self, other: &RawPtr<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> std::fmt::Debug for RawPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RawPtr({:p})", self.ptr)
    }
}
