//! Bit-field codec for byte-wide registers
//!
//! A logical value is mapped onto a register through an ordered list of
//! hardware bit positions: bit `i` of the logical value lives at hardware bit
//! `positions[i]`. The list acts as a little-endian virtual field and does not
//! need to be contiguous or sorted.
//!
//! Out-of-range hardware bits read as `0` and are never written. Positions
//! beyond the logical width are dropped silently.

/// Logical width of the value returned by [`extract_bits`]
pub const LOGICAL_WIDTH_BITS: u32 = u32::BITS;

/// Read a single bit of `byte`
pub fn get_bit(byte: u8, bit: u8) -> bool {
    byte.checked_shr(u32::from(bit)).map_or(false, |b| b & 1 == 1)
}

/// Return `byte` with `bit` set or cleared
pub fn set_bit(byte: u8, bit: u8, value: bool) -> u8 {
    let Some(mask) = 1u8.checked_shl(u32::from(bit)) else {
        return byte;
    };
    if value {
        byte | mask
    } else {
        byte & !mask
    }
}

/// Gather the bits at `positions` into a logical value, LSB first
pub fn extract_bits(byte: u8, positions: &[u8]) -> u32 {
    extract_bits_width(byte, positions, LOGICAL_WIDTH_BITS)
}

/// Like [`extract_bits`], with an explicit logical width.
///
/// Only the first `width` positions contribute; the rest are ignored.
pub fn extract_bits_width(byte: u8, positions: &[u8], width: u32) -> u32 {
    let width = width.min(LOGICAL_WIDTH_BITS) as usize;
    positions
        .iter()
        .take(width)
        .enumerate()
        .filter(|&(_, &bit)| get_bit(byte, bit))
        .fold(0u32, |acc, (i, _)| acc | (1 << i))
}

/// Scatter `logical` into the bits at `positions` of `current`.
///
/// Hardware bits not listed in `positions` keep their value from `current`.
pub fn pack_bits(current: u8, positions: &[u8], logical: u32) -> u8 {
    positions
        .iter()
        .take(LOGICAL_WIDTH_BITS as usize)
        .enumerate()
        .fold(current, |acc, (i, &bit)| {
            set_bit(acc, bit, (logical >> i) & 1 == 1)
        })
}

/// Mask with every listed in-range position set
pub fn field_mask(positions: &[u8]) -> u8 {
    positions.iter().fold(0u8, |acc, &bit| set_bit(acc, bit, true))
}
