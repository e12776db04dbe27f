//! Update Sequence Array (fixup) processing
//!
//! Multi-sector structures (FILE records and INDX blocks) reserve the last
//! two bytes of every sector for the update sequence number. The original
//! bytes are saved in the update sequence array in the structure header:
//!
//! ```text
//! ┌───────────────────────── header ─────────────────────────┐
//! │ magic │ usa_offset │ usa_count │ ... │ USN │ s1 │ s2 │ ... │
//! └──────────────────────────────────────────────────────────┘
//!   sector 0: ....................................... [USN]   <- restore s1
//!   sector 1: ....................................... [USN]   <- restore s2
//! ```
//!
//! A sector whose trailing bytes differ from the USN was torn by an
//! interrupted write; the whole structure is rejected.

use crate::bytes::{le_u16, le_u32};
use crate::error::{NtfsError, Result};

/// "FILE" in little-endian
pub const FILE_MAGIC: u32 = 0x454C4946;

/// "INDX" in little-endian
pub const INDX_MAGIC: u32 = 0x58444E49;

/// "BAAD" in little-endian (chkdsk marked the record unreadable)
pub const BAAD_MAGIC: u32 = 0x44414142;

/// Bytes covered by one update sequence entry, independent of the
/// device sector size
pub const FIXUP_STRIDE: usize = 512;

/// Verify the signature and apply the update sequence array in place
///
/// Runs before any other field of the structure is trusted. On error the
/// buffer is left in an unspecified state and must be discarded.
pub fn apply_fixup(buf: &mut [u8], expected_magic: u32) -> Result<()> {
    let magic = le_u32(buf, 0)?;
    if magic != expected_magic {
        if magic == BAAD_MAGIC {
            log::warn!("NTFS: structure marked BAAD");
        } else {
            log::warn!("NTFS: bad signature {:#010x}, expected {:#010x}", magic, expected_magic);
        }
        return Err(NtfsError::Corrupt);
    }

    let usa_offset = le_u16(buf, 4)? as usize;
    let usa_count = le_u16(buf, 6)? as usize;

    // usa_count includes the update sequence number itself
    if usa_count < 2 {
        log::warn!("NTFS: update sequence array too short ({})", usa_count);
        return Err(NtfsError::Corrupt);
    }

    // Structures smaller than one stride carry a single entry
    let stride = FIXUP_STRIDE.min(buf.len());
    let sectors = usa_count - 1;
    if stride < 2 || buf.len() % stride != 0 || sectors != buf.len() / stride {
        log::warn!("NTFS: {} fixup entries do not tile {} bytes", sectors, buf.len());
        return Err(NtfsError::Corrupt);
    }
    if usa_offset + usa_count * 2 > stride - 2 {
        log::warn!("NTFS: update sequence array at {} overruns first sector", usa_offset);
        return Err(NtfsError::Corrupt);
    }

    let usn = le_u16(buf, usa_offset)?;

    // Check every sector before touching any of them
    for i in 0..sectors {
        let tail = (i + 1) * stride - 2;
        if le_u16(buf, tail)? != usn {
            log::warn!("NTFS: fixup mismatch in sector {}", i);
            return Err(NtfsError::Corrupt);
        }
    }

    for i in 0..sectors {
        let tail = (i + 1) * stride - 2;
        let saved = usa_offset + 2 + i * 2;
        buf.copy_within(saved..saved + 2, tail);
    }

    Ok(())
}
