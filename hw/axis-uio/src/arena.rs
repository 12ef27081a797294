// Licensed under the Apache-2.0 license

//! Bump allocator over the DMA window.
//!
//! Buffers are carved out page by page from a single cursor that only moves
//! forward. There is no free: every buffer lives until the window is unmapped,
//! and the borrow checker ties each [`DmaBuffer`] to the arena it came from.

use crate::error::{AxisError, AxisResult};
use crate::mapper::DmaRegion;
use crate::translate::{alloc_length, alloc_size, try_alloc_size};
use log::debug;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use zerocopy::{FromBytes, IntoBytes};

pub struct DmaArena {
    region: DmaRegion,
    cursor: Cell<usize>,
    page_size: usize,
}

impl DmaArena {
    pub fn new(region: DmaRegion, page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            region,
            cursor: Cell::new(0),
            page_size,
        }
    }

    pub fn region(&self) -> &DmaRegion {
        &self.region
    }

    pub(crate) fn into_region(self) -> DmaRegion {
        self.region
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.cursor.get()
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    /// See [`crate::translate::alloc_size`].
    pub fn alloc_size(&self, length: usize, byte_nb: usize) -> usize {
        alloc_size(length, byte_nb, self.page_size)
    }

    /// See [`crate::translate::alloc_length`].
    pub fn alloc_length(&self, length: usize, byte_nb: usize) -> usize {
        alloc_length(length, byte_nb, self.page_size)
    }

    /// Reserve a zeroed, page-aligned block for `length` elements of
    /// `byte_nb` bytes and return its offset and rounded size.
    fn reserve(&self, length: usize, byte_nb: usize) -> AxisResult<(usize, usize)> {
        let exhausted = |requested| AxisError::ArenaExhausted {
            requested,
            remaining: self.remaining(),
            capacity: self.capacity(),
        };
        // A size that does not fit in usize does not fit in any window.
        let requested = try_alloc_size(length, byte_nb, self.page_size)
            .ok_or_else(|| exhausted(length.saturating_mul(byte_nb)))?;
        let offset = self.cursor.get();
        if requested > self.remaining() {
            return Err(exhausted(requested));
        }
        self.cursor.set(offset + requested);

        // SAFETY: offset..offset+requested lies inside the window and has
        // never been handed out before.
        unsafe {
            std::ptr::write_bytes(self.region.as_mut_ptr().add(offset), 0, requested);
        }
        debug!(
            "DMA alloc {length} x {byte_nb} bytes at offset {offset:#x} ({requested:#x} bytes, {:#x} left)",
            self.remaining()
        );
        Ok((offset, requested))
    }

    /// Allocate a buffer of `length` elements of `T`.
    ///
    /// # Panics
    ///
    /// Panics if `length` is zero or `T` is zero-sized.
    pub fn alloc<T: FromBytes + IntoBytes>(&self, length: usize) -> AxisResult<DmaBuffer<'_, T>> {
        let byte_nb = std::mem::size_of::<T>();
        assert!(
            std::mem::align_of::<T>() <= self.page_size,
            "element alignment exceeds the page size"
        );
        let (offset, byte_len) = self.reserve(length, byte_nb)?;
        Ok(self.buffer(offset, length, byte_len))
    }

    /// Allocate `length * byte_nb` raw bytes.
    ///
    /// # Panics
    ///
    /// Panics if `length` or `byte_nb` is zero.
    pub fn alloc_raw(&self, length: usize, byte_nb: usize) -> AxisResult<DmaBuffer<'_, u8>> {
        let (offset, byte_len) = self.reserve(length, byte_nb)?;
        Ok(self.buffer(offset, length * byte_nb, byte_len))
    }

    fn buffer<T>(&self, offset: usize, len: usize, byte_len: usize) -> DmaBuffer<'_, T> {
        // SAFETY: offset is inside the mapping, which is never null.
        let ptr = unsafe { NonNull::new_unchecked(self.region.as_mut_ptr().add(offset) as *mut T) };
        DmaBuffer {
            ptr,
            len,
            offset,
            byte_len,
            _arena: PhantomData,
        }
    }
}

impl std::fmt::Debug for DmaArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaArena")
            .field("region", &self.region)
            .field("used", &format_args!("{:#x}", self.used()))
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// A typed view of one arena allocation.
///
/// The hardware may write the memory at any time while a transfer runs; use
/// [`DmaBuffer::read_volatile`] when polling data the engine produces.
pub struct DmaBuffer<'a, T> {
    ptr: NonNull<T>,
    len: usize,
    offset: usize,
    byte_len: usize,
    _arena: PhantomData<&'a mut [T]>,
}

impl<T> DmaBuffer<'_, T> {
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    /// Number of elements requested at allocation.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte offset of the buffer within the DMA window.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Page-rounded size reserved for the buffer.
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Elements that fit in the reserved pages. Never less than `len`.
    pub fn capacity(&self) -> usize {
        match std::mem::size_of::<T>() {
            0 => self.len,
            size => self.byte_len / size,
        }
    }

    pub fn read_volatile(&self, index: usize) -> T {
        assert!(index < self.len, "index {index} out of bounds ({})", self.len);
        // SAFETY: in bounds of a live, aligned allocation.
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(index)) }
    }

    pub fn write_volatile(&mut self, index: usize, value: T) {
        assert!(index < self.len, "index {index} out of bounds ({})", self.len);
        // SAFETY: in bounds of a live, aligned allocation.
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(index), value) }
    }
}

impl<T> Deref for DmaBuffer<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: allocations never overlap and live as long as the arena
        // borrow; T accepts any bit pattern.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for DmaBuffer<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as for `deref`, and `&mut self` is unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> std::fmt::Debug for DmaBuffer<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("len", &self.len)
            .field("byte_len", &format_args!("{:#x}", self.byte_len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::physical_address;

    const PAGE: usize = 4096;
    const BASE: u32 = 0x1b90_0000;

    fn arena(pages: usize) -> DmaArena {
        DmaArena::new(DmaRegion::anonymous(pages * PAGE, BASE).unwrap(), PAGE)
    }

    #[test]
    fn test_alloc_rounds_to_pages() {
        let arena = arena(16);
        let buf = arena.alloc::<u32>(100).unwrap();
        assert_eq!(buf.offset(), 0);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.byte_len(), PAGE);
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(arena.used(), PAGE);
        assert_eq!(arena.alloc_length(100, 4), 1024);
    }

    #[test]
    fn test_cursor_is_sum_of_rounded_sizes() {
        let arena = arena(16);
        let sizes = [(1usize, 1usize), (1024, 4), (1025, 4), (3, 1000)];
        let mut expected = 0;
        for (length, byte_nb) in sizes {
            let buf = arena.alloc_raw(length, byte_nb).unwrap();
            assert_eq!(buf.offset(), expected);
            assert_eq!(buf.len(), length * byte_nb);
            expected += crate::translate::align_up(length * byte_nb, PAGE);
            assert_eq!(arena.used(), expected);
        }
        assert_eq!(expected, 5 * PAGE);
    }

    #[test]
    fn test_exhaustion_keeps_cursor() {
        let arena = arena(4);
        let _a = arena.alloc::<u64>(512).unwrap();
        let _b = arena.alloc::<u8>(2 * PAGE).unwrap();
        assert_eq!(arena.remaining(), PAGE);

        let err = arena.alloc::<u8>(PAGE + 1).unwrap_err();
        assert!(matches!(
            err,
            AxisError::ArenaExhausted {
                requested,
                remaining,
                capacity,
            } if requested == 2 * PAGE && remaining == PAGE && capacity == 4 * PAGE
        ));
        assert_eq!(arena.used(), 3 * PAGE);

        let last = arena.alloc::<u8>(PAGE).unwrap();
        assert_eq!(last.offset(), 3 * PAGE);
        assert_eq!(arena.remaining(), 0);
    }

    #[test]
    fn test_oversized_request_is_exhaustion() {
        let arena = arena(4);
        let _a = arena.alloc::<u32>(1).unwrap();

        let err = arena.alloc::<u8>(usize::MAX - 10).unwrap_err();
        assert!(matches!(
            err,
            AxisError::ArenaExhausted { requested, capacity, .. }
                if requested == usize::MAX - 10 && capacity == 4 * PAGE
        ));
        let err = arena.alloc::<u64>(usize::MAX / 2).unwrap_err();
        assert!(matches!(
            err,
            AxisError::ArenaExhausted { requested: usize::MAX, .. }
        ));
        let err = arena.alloc_raw(usize::MAX, usize::MAX).unwrap_err();
        assert!(matches!(err, AxisError::ArenaExhausted { .. }));

        assert_eq!(arena.used(), PAGE);
        assert_eq!(arena.alloc::<u8>(1).unwrap().offset(), PAGE);
    }

    #[test]
    fn test_buffers_are_disjoint_and_zeroed() {
        let arena = arena(4);
        let mut a = arena.alloc::<u32>(16).unwrap();
        let mut b = arena.alloc::<u32>(16).unwrap();
        assert!(a.iter().all(|v| *v == 0));
        a.fill(0xaaaa_aaaa);
        b.fill(0x5555_5555);
        assert!(a.iter().all(|v| *v == 0xaaaa_aaaa));
        b.write_volatile(3, 9);
        assert_eq!(b.read_volatile(3), 9);
        assert_eq!(b[2], 0x5555_5555);
    }

    #[test]
    fn test_physical_address_round_trip() {
        let arena = arena(8);
        let _skip = arena.alloc::<u8>(3 * PAGE).unwrap();
        let buf = arena.alloc::<u16>(10).unwrap();
        let phys = physical_address(arena.region(), &buf);
        assert_eq!((phys - arena.region().base_address()) as usize, buf.offset());
        assert_eq!(phys, BASE + 3 * PAGE as u32);
    }

    #[test]
    #[should_panic(expected = "outside the DMA window")]
    fn test_physical_address_foreign_buffer() {
        let first = arena(2);
        let second = arena(2);
        let buf = second.alloc::<u32>(1).unwrap();
        physical_address(first.region(), &buf);
    }

    #[test]
    #[should_panic(expected = "length must be non-zero")]
    fn test_zero_length() {
        let arena = arena(1);
        let _ = arena.alloc::<u32>(0);
    }

    #[test]
    #[should_panic(expected = "element size must be non-zero")]
    fn test_zero_sized_element() {
        let arena = arena(1);
        let _ = arena.alloc::<()>(4);
    }
}
