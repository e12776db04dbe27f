//! Little-endian field access for on-disk structures
//!
//! All NTFS structures are little-endian and may sit at any alignment inside
//! a sector buffer. Out-of-range fields are reported as corruption.

use crate::error::{NtfsError, Result};

#[inline]
fn field<const N: usize>(buf: &[u8], off: usize) -> Result<[u8; N]> {
    off.checked_add(N)
        .and_then(|end| buf.get(off..end))
        .and_then(|s| s.try_into().ok())
        .ok_or(NtfsError::Corrupt)
}

pub fn le_u8(buf: &[u8], off: usize) -> Result<u8> {
    buf.get(off).copied().ok_or(NtfsError::Corrupt)
}

pub fn le_u16(buf: &[u8], off: usize) -> Result<u16> {
    field::<2>(buf, off).map(u16::from_le_bytes)
}

pub fn le_u32(buf: &[u8], off: usize) -> Result<u32> {
    field::<4>(buf, off).map(u32::from_le_bytes)
}

pub fn le_u64(buf: &[u8], off: usize) -> Result<u64> {
    field::<8>(buf, off).map(u64::from_le_bytes)
}

/// Bounds-checked sub-slice `buf[off..off + len]`
pub fn slice(buf: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    off.checked_add(len)
        .and_then(|end| buf.get(off..end))
        .ok_or(NtfsError::Corrupt)
}

/// Decode `count` UTF-16LE code units starting at `off`
pub fn utf16_units(buf: &[u8], off: usize, count: usize) -> Result<alloc::vec::Vec<u16>> {
    let raw = slice(buf, off, count * 2)?;
    Ok(raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}
