//! Read-only NTFS Driver
//!
//! Decodes an NTFS volume from raw device blocks: boot sector, master file
//! table, attributes, data runs and directory indexes. The driver needs
//! nothing from its host but a [`BlockDevice`] and an allocator.
//!
//! # NTFS Features Supported
//! - Boot sector and BPB parsing
//! - Master File Table (MFT) reading, including a fragmented `$MFT`
//! - Update sequence (fixup) validation of FILE and INDX structures
//! - Resident and non-resident attributes, attribute lists
//! - Directory lookup and enumeration through `$I30` B+ trees
//! - File reading, sparse runs and uninitialized tails read as zeros
//! - Volume label and free space from `$Bitmap`
//!
//! Compressed and encrypted streams are reported as
//! [`NtfsError::Unsupported`].
//!
//! # Read Path
//!
//! ```text
//!  NtfsVolume::read_file("/DOCS/README.TXT")
//!        │
//!        ▼
//!  path::resolve ── "DOCS", "README.TXT" ──▶ index::DirectoryIndex::lookup
//!        │                                    $INDEX_ROOT, then INDX blocks
//!        │                                    (fixup, $BITMAP checked)
//!        ▼
//!  mft::Mft::get(ref) ──▶ FILE record: fixup, in-use and sequence checks
//!        │
//!        ▼
//!  attr::AttributeSet ── base + extension records ($ATTRIBUTE_LIST)
//!        │
//!        ▼
//!  runs::RunStream ── VCN ─▶ LCN, sparse runs as zeros
//!        │
//!        ▼
//!  device::BlockReader ──▶ BlockDevice::read_blocks(lba, count)
//! ```
//!
//! Mount reads the boot sector (`boot`), then record 0 of `$MFT` at the
//! cluster it names; every later record is found through the `$MFT` run
//! map.
//!
//! # Example
//!
//! ```ignore
//! let mut vol = NtfsVolume::mount(ReadCallback(read_sectors), 512)?;
//! let mut entries = [DirEntry::default(), DirEntry::default()];
//! let n = vol.read_dir("/DOCS", &mut entries)?;
//! let text = vol.read_file("/DOCS/README.TXT")?;
//! ```
//!
//! # References
//! - Windows Internals, 6th Edition
//! - NTFS Documentation Project (ntfs.com)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod attr;
pub mod boot;
mod bytes;
pub mod device;
pub mod error;
pub mod file;
pub mod fixup;
pub mod index;
pub mod mft;
pub mod name;
pub mod path;
pub mod runs;

// Re-export commonly used items
pub use attr::{attr_types, Attribute, AttributeFlags, AttributeSet, FileAttributes, FileName, Namespace};
pub use boot::{detect_ntfs, NtfsBpb, VolumeGeometry, NTFS_SIGNATURE};
pub use device::{BlockDevice, BlockReader, CacheStats, ReadCallback};
pub use error::{NtfsError, Result};
pub use file::{DirEntry, FileStat, NtfsStats, NtfsVolume, VolumeInfo};
pub use mft::{well_known_mft, FileRecord, MftRef, RecordFlags};
pub use runs::{DataRun, DataRunList};
