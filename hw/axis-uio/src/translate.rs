// Licensed under the Apache-2.0 license

//! Conversions from host-side quantities to the encodings the control bus
//! expects: physical addresses, bus word counts and port identifiers.

use crate::arena::DmaBuffer;
use crate::config::{AXIS_NB, BUS_WORD_SIZE};
use crate::mapper::DmaRegion;

/// Side of an AXI-Stream port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Stream reads from memory.
    Src,
    /// Stream writes to memory.
    Dst,
}

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

fn check_operands(length: usize, byte_nb: usize) {
    assert!(length > 0, "allocation length must be non-zero");
    assert!(byte_nb > 0, "element size must be non-zero");
}

fn checked_byte_len(length: usize, byte_nb: usize) -> usize {
    check_operands(length, byte_nb);
    match length.checked_mul(byte_nb) {
        Some(bytes) => bytes,
        None => panic!("{length} elements of {byte_nb} bytes overflow usize"),
    }
}

/// Page-rounded byte size of `length` elements of `byte_nb` bytes, or `None`
/// if the size is not representable.
///
/// # Panics
///
/// Panics if `length` or `byte_nb` is zero.
pub fn try_alloc_size(length: usize, byte_nb: usize, page_size: usize) -> Option<usize> {
    debug_assert!(page_size.is_power_of_two());
    check_operands(length, byte_nb);
    let bytes = length.checked_mul(byte_nb)?;
    bytes.checked_add(page_size - 1)?;
    Some(align_up(bytes, page_size))
}

/// Page-rounded byte size of an allocation of `length` elements of
/// `byte_nb` bytes each.
///
/// # Panics
///
/// Panics if `length` or `byte_nb` is zero, or if the size overflows.
pub fn alloc_size(length: usize, byte_nb: usize, page_size: usize) -> usize {
    match try_alloc_size(length, byte_nb, page_size) {
        Some(size) => size,
        None => panic!("{length} elements of {byte_nb} bytes overflow a page-rounded size"),
    }
}

/// Number of `byte_nb` sized elements that fit in [`alloc_size`].
/// Never less than `length`.
pub fn alloc_length(length: usize, byte_nb: usize, page_size: usize) -> usize {
    alloc_size(length, byte_nb, page_size) / byte_nb
}

/// Length of a stream in control bus words. The bus always moves 4-byte
/// words, whatever the element size.
///
/// # Panics
///
/// Panics if `length` or `byte_nb` is zero, or if the word count does not
/// fit in a 32-bit register.
pub fn stream_word_count(length: usize, byte_nb: usize) -> u32 {
    let bytes = checked_byte_len(length, byte_nb);
    let words = bytes.div_ceil(BUS_WORD_SIZE);
    match u32::try_from(words) {
        Ok(words) => words,
        Err(_) => panic!("stream of {words} words exceeds the 32-bit length register"),
    }
}

/// Control bus identifier of port `index` on side `direction`: `2i + 1` for
/// the source side, `2i + 2` for the destination side.
///
/// # Panics
///
/// Panics if `index >= AXIS_NB`.
pub fn port_id(index: usize, direction: Direction) -> u32 {
    assert!(index < AXIS_NB, "AXIS port {index} out of range (0..{AXIS_NB})");
    let base = 2 * index as u32;
    match direction {
        Direction::Src => base + 1,
        Direction::Dst => base + 2,
    }
}

/// Physical address of `buffer` as seen by the streaming engine.
///
/// # Panics
///
/// Panics if `buffer` does not lie within `region`.
pub fn physical_address<T>(region: &DmaRegion, buffer: &DmaBuffer<'_, T>) -> u32 {
    let start = region.as_ptr() as usize;
    let addr = buffer.as_ptr() as usize;
    assert!(
        addr >= start && addr < start + region.len(),
        "buffer at {addr:#x} is outside the DMA window {start:#x}..{:#x}",
        start + region.len()
    );
    let offset = addr - start;
    debug_assert_eq!(offset, buffer.offset());
    // The window was checked to fit in 32 bits when the base was resolved.
    region.base_address() + offset as u32
}
