//! NTFS Volume
//!
//! The public face of the driver: mount a block device, then list
//! directories, read files and query sizes by path.
//!
//! ```text
//!   NtfsVolume::mount(device, block_size)
//!     │
//!     ├─ boot sector ──────────▶ VolumeGeometry
//!     ├─ $MFT bootstrap ───────▶ Mft (Ready)
//!     ├─ $UpCase ──────────────▶ UpcaseTable (fallback on failure)
//!     ├─ $Volume ──────────────▶ label (empty on failure)
//!     └─ root directory check
//! ```
//!
//! Every call resolves its path from the root; nothing but the record and
//! block caches survives between calls. A failed call leaves the volume
//! usable.

use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::vec::Vec;

use crate::attr::{attr_types, value_buffer, volume_name, FileAttributes, FileName};
use crate::boot::{VolumeGeometry, BOOT_SECTOR_SIZE};
use crate::device::{BlockDevice, BlockReader, CacheStats};
use crate::error::{NtfsError, Result};
use crate::index::DirectoryIndex;
use crate::mft::{well_known_mft, Mft, MftRef};
use crate::name::{to_ascii_lossy, UpcaseTable, UPCASE_TABLE_SIZE};
use crate::path::{resolve, Node};

/// Bytes of `$Bitmap` scanned per step by [`NtfsVolume::volume_info`]
pub const BITMAP_CHUNK_SIZE: usize = 65536;

/// One directory listing entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirEntry {
    /// Name, transliterated to printable ASCII
    pub name: String,
    pub is_dir: bool,
    /// Logical size in bytes (0 for directories)
    pub size: u64,
}

/// Volume capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Metadata of one file or directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    /// Logical size of the unnamed data stream (0 for directories)
    pub size: u64,
    pub reference: MftRef,
    /// File attributes from $STANDARD_INFORMATION
    pub attributes: FileAttributes,
    /// Times in 100-ns units since 1601-01-01 UTC
    pub creation_time: u64,
    pub modification_time: u64,
    pub mft_modification_time: u64,
    pub access_time: u64,
}

/// NTFS volume statistics
#[derive(Debug, Clone, Copy)]
pub struct NtfsStats {
    /// Bytes per cluster
    pub bytes_per_cluster: u32,
    /// Total clusters
    pub total_clusters: u64,
    /// MFT record size
    pub mft_record_size: u32,
    /// Records the MFT can hold
    pub mft_records: u64,
    /// MFT record cache hits
    pub mft_cache_hits: u64,
    /// MFT record cache misses
    pub mft_cache_misses: u64,
    /// Device block cache counters
    pub block_cache: CacheStats,
}

/// A mounted read-only NTFS volume
pub struct NtfsVolume<D> {
    mft: Mft<D>,
    upcase: UpcaseTable,
    label: String,
}

impl<D: BlockDevice> NtfsVolume<D> {
    /// Mount the volume on `device`
    ///
    /// Fails with `NotThisFormat` when the first block is not an NTFS boot
    /// sector. On failure nothing is retained; the device is dropped.
    pub fn mount(device: D, block_size: u32) -> Result<Self> {
        let mut reader = BlockReader::new(device, block_size)?;

        let mut sector = [0u8; BOOT_SECTOR_SIZE];
        reader.read_bytes(0, &mut sector)?;
        let geometry = VolumeGeometry::from_boot_sector(&sector)?;

        let mut mft = Mft::load(reader, geometry)?;
        let upcase = load_upcase(&mut mft);
        let label = load_label(&mut mft);
        Node::root(&mut mft)?;

        log::info!(
            "NTFS: mounted \"{}\" serial {:016x}, {} clusters of {} bytes, {}-byte records",
            label,
            geometry.volume_serial,
            geometry.total_clusters,
            geometry.bytes_per_cluster,
            geometry.record_size
        );

        Ok(Self { mft, upcase, label })
    }

    /// Release every cache and hand the device back
    pub fn unmount(self) -> D {
        log::info!("NTFS: unmounting \"{}\"", self.label);
        self.mft.into_device()
    }

    /// Volume geometry
    pub fn geometry(&self) -> &VolumeGeometry {
        self.mft.geometry()
    }

    /// Volume label, empty when the volume has none
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Volume serial number
    pub fn serial(&self) -> u64 {
        self.mft.geometry().volume_serial
    }

    /// Cache and layout counters
    pub fn stats(&self) -> NtfsStats {
        let geo = self.mft.geometry();
        let (hits, misses) = self.mft.cache_stats();
        NtfsStats {
            bytes_per_cluster: geo.bytes_per_cluster,
            total_clusters: geo.total_clusters,
            mft_record_size: geo.record_size,
            mft_records: self.mft.record_count(),
            mft_cache_hits: hits,
            mft_cache_misses: misses,
            block_cache: self.mft.block_cache_stats(),
        }
    }

    /// List a directory into `out`
    ///
    /// Returns the number of entries written. A listing longer than `out`
    /// is cut short without error; compare the count with `out.len()`.
    pub fn read_dir(&mut self, path: &str, out: &mut [DirEntry]) -> Result<usize> {
        let entries = self.read_dir_all(path)?;
        let n = entries.len().min(out.len());
        for (slot, entry) in out.iter_mut().zip(entries) {
            *slot = entry;
        }
        Ok(n)
    }

    /// List a directory in collated name order
    ///
    /// DOS short names are left out when the same file also has a long
    /// name, and the root's `.` entry is skipped.
    pub fn read_dir_all(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let node = resolve(&mut self.mft, &self.upcase, path)?;
        if !node.is_directory() {
            return Err(NtfsError::NotADirectory);
        }
        let index = DirectoryIndex::open(&mut self.mft, &node.attrs)?;

        let mut names: Vec<(MftRef, FileName)> = Vec::new();
        for entry in index.entries(&mut self.mft) {
            let entry = entry?;
            let Some(key) = entry.key else {
                continue;
            };
            if key.name == [b'.' as u16] {
                continue;
            }
            names.push((entry.reference, key));
        }

        let long_named: BTreeSet<u64> = names
            .iter()
            .filter(|(_, key)| !key.namespace.is_dos_only())
            .map(|(r, _)| r.file_number())
            .collect();

        let mut out = Vec::new();
        out.try_reserve_exact(names.len())?;
        for (reference, key) in names {
            if key.namespace.is_dos_only() && long_named.contains(&reference.file_number()) {
                continue;
            }
            let is_dir = key.is_directory();
            out.push(DirEntry {
                name: to_ascii_lossy(&key.name),
                is_dir,
                size: if is_dir { 0 } else { key.data_size },
            });
        }

        log::debug!("NTFS: listed {} entries in {:?}", out.len(), path);
        Ok(out)
    }

    /// Read a whole file into a new buffer
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let node = self.open_file(path)?;
        let data = node.attrs.data()?;
        let size = usize::try_from(data.value_size()).map_err(|_| NtfsError::OutOfMemory)?;

        let mut buf = value_buffer(size)?;
        let n = data.read_at(&mut self.mft, 0, &mut buf)?;
        if n != size {
            return Err(NtfsError::Corrupt);
        }
        Ok(buf)
    }

    /// Read part of a file starting at `offset`
    ///
    /// Returns the bytes read, short at end of file.
    pub fn read_file_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let node = self.open_file(path)?;
        let data = node.attrs.data()?;
        data.read_at(&mut self.mft, offset, buf)
    }

    /// Size of a file's unnamed data stream
    ///
    /// A zero-byte file reports `Ok(0)`; a directory is `IsADirectory`.
    pub fn file_size(&mut self, path: &str) -> Result<u64> {
        let node = self.open_file(path)?;
        data_size(&node)
    }

    /// Check whether a path names a file or directory
    ///
    /// Missing components and files used as directories are `Ok(false)`;
    /// corruption and I/O errors still propagate.
    pub fn exists(&mut self, path: &str) -> Result<bool> {
        match resolve(&mut self.mft, &self.upcase, path) {
            Ok(_) => Ok(true),
            Err(NtfsError::NotFound | NtfsError::NotADirectory) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Metadata of a file or directory
    pub fn stat(&mut self, path: &str) -> Result<FileStat> {
        let node = resolve(&mut self.mft, &self.upcase, path)?;
        let is_dir = node.is_directory();
        let size = if is_dir { 0 } else { data_size(&node)? };
        let info = node.attrs.standard_information().unwrap_or_default();

        Ok(FileStat {
            is_dir,
            size,
            reference: node.reference(),
            attributes: info.file_attributes,
            creation_time: info.creation_time,
            modification_time: info.modification_time,
            mft_modification_time: info.mft_modification_time,
            access_time: info.access_time,
        })
    }

    /// Total and free bytes
    ///
    /// Free space counts the clear bits of `$Bitmap`, one per cluster.
    pub fn volume_info(&mut self) -> Result<VolumeInfo> {
        let geo = *self.mft.geometry();
        let node = Node::open_well_known(&mut self.mft, well_known_mft::BITMAP)?;
        let bitmap = node.attrs.data()?;

        let total = geo.total_clusters;
        let needed = total.div_ceil(8);
        let mut chunk = value_buffer(BITMAP_CHUNK_SIZE)?;
        let mut used = 0u64;
        let mut offset = 0u64;

        while offset < needed {
            let want = (needed - offset).min(BITMAP_CHUNK_SIZE as u64) as usize;
            let n = bitmap.read_at(&mut self.mft, offset, &mut chunk[..want])?;
            if n != want {
                log::warn!("NTFS: $Bitmap covers {} of {} clusters", (offset + n as u64) * 8, total);
                return Err(NtfsError::Corrupt);
            }
            for (i, &byte) in chunk[..n].iter().enumerate() {
                let first = (offset + i as u64) * 8;
                let bits = (total - first).min(8);
                let mask = if bits == 8 { 0xFF } else { (1u8 << bits) - 1 };
                used += (byte & mask).count_ones() as u64;
            }
            offset += n as u64;
        }

        let bpc = geo.bytes_per_cluster as u64;
        Ok(VolumeInfo {
            total_bytes: geo.total_bytes(),
            free_bytes: (total - used) * bpc,
        })
    }

    /// Resolve a path that must name a file
    fn open_file(&mut self, path: &str) -> Result<Node> {
        let node = resolve(&mut self.mft, &self.upcase, path)?;
        if node.is_directory() {
            return Err(NtfsError::IsADirectory);
        }
        Ok(node)
    }
}

/// Logical size of a file node's unnamed $DATA
fn data_size(node: &Node) -> Result<u64> {
    node.attrs
        .find(attr_types::DATA, &[])
        .map(|a| a.value_size())
        .ok_or_else(|| {
            log::warn!("NTFS: file record {} has no $DATA", node.reference().file_number());
            NtfsError::Corrupt
        })
}

/// Load `$UpCase`, falling back to the built-in fold
fn load_upcase<D: BlockDevice>(mft: &mut Mft<D>) -> UpcaseTable {
    let table = Node::open_well_known(mft, well_known_mft::UPCASE).and_then(|node| {
        let raw = node.attrs.data()?.read_all(mft, UPCASE_TABLE_SIZE)?;
        UpcaseTable::from_bytes(&raw).ok_or(NtfsError::Corrupt)
    });
    match table {
        Ok(table) => table,
        Err(e) => {
            log::warn!("NTFS: $UpCase unusable ({}), using built-in case folding", e);
            UpcaseTable::fallback()
        }
    }
}

/// Read the label from `$Volume`; empty when absent or unreadable
fn load_label<D: BlockDevice>(mft: &mut Mft<D>) -> String {
    let label = Node::open_well_known(mft, well_known_mft::VOLUME).and_then(|node| {
        match node.attrs.find(attr_types::VOLUME_NAME, &[]) {
            Some(attr) => {
                let value = attr.resident().ok_or(NtfsError::Corrupt)?;
                Ok(to_ascii_lossy(&volume_name(value)?))
            }
            None => Ok(String::new()),
        }
    });
    label.unwrap_or_else(|e| {
        log::warn!("NTFS: volume label unreadable ({})", e);
        String::new()
    })
}
