//! File name handling
//!
//! NTFS names are UTF-16 and compared case-insensitively through the
//! volume's `$UpCase` table (one upper-case code unit per code unit,
//! 65536 entries). Directory indexes are sorted in that order, so lookups
//! must collate with the same table the volume was written with.

use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::Ordering;

/// Entries in a complete `$UpCase` table
pub const UPCASE_ENTRIES: usize = 65536;

/// Byte size of a complete `$UpCase` table
pub const UPCASE_TABLE_SIZE: u64 = UPCASE_ENTRIES as u64 * 2;

/// Case folding table
#[derive(Clone, Debug, Default)]
pub struct UpcaseTable {
    /// Volume table; `None` uses the built-in fold
    table: Option<Vec<u16>>,
}

impl UpcaseTable {
    /// Built-in fold for volumes whose `$UpCase` is unreadable
    pub fn fallback() -> Self {
        Self { table: None }
    }

    /// Decode a `$UpCase` value; anything but a full table is rejected
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() as u64 != UPCASE_TABLE_SIZE {
            return None;
        }
        let table = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Some(Self { table: Some(table) })
    }

    /// Check whether the volume's own table is in use
    pub fn is_volume_table(&self) -> bool {
        self.table.is_some()
    }

    /// Upper-case one code unit
    pub fn upcase(&self, unit: u16) -> u16 {
        match &self.table {
            Some(table) => table[unit as usize],
            None => fallback_upcase(unit),
        }
    }

    /// Collate two names the way directory indexes are sorted
    pub fn collate(&self, a: &[u16], b: &[u16]) -> Ordering {
        a.iter()
            .map(|&u| self.upcase(u))
            .cmp(b.iter().map(|&u| self.upcase(u)))
    }

    /// Case-insensitive equality
    pub fn eq_ignore_case(&self, a: &[u16], b: &[u16]) -> bool {
        a.len() == b.len() && self.collate(a, b) == Ordering::Equal
    }
}

fn fallback_upcase(unit: u16) -> u16 {
    if unit < 0x80 {
        return (unit as u8).to_ascii_uppercase() as u16;
    }
    let Some(c) = char::from_u32(unit as u32) else {
        // Surrogate halves fold to themselves
        return unit;
    };
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) if (u as u32) <= 0xFFFF => u as u16,
        _ => unit,
    }
}

/// Render a UTF-16 name as printable ASCII
///
/// Code units outside 0x20..=0x7E become `?`; a NUL ends the name.
pub fn to_ascii_lossy(units: &[u16]) -> String {
    units
        .iter()
        .take_while(|&&u| u != 0)
        .map(|&u| match u {
            0x20..=0x7E => u as u8 as char,
            _ => '?',
        })
        .collect()
}

/// Encode a path component for lookup
pub fn to_utf16(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}
