//! NTFS Boot Sector and BIOS Parameter Block
//!
//! The NTFS boot sector contains critical volume information:
//! - BIOS Parameter Block (BPB) with sector/cluster sizes
//! - Extended BPB with NTFS-specific parameters
//! - Location of the Master File Table (MFT)
//!
//! # Boot Sector Layout
//!
//! ```text
//! Offset  Size  Description
//! 0x00    3     Jump instruction
//! 0x03    8     OEM ID ("NTFS    ")
//! 0x0B    2     Bytes per sector
//! 0x0D    1     Sectors per cluster
//! 0x0E    2     Reserved sectors (always 0)
//! 0x15    1     Media descriptor
//! 0x28    8     Total sectors
//! 0x30    8     MFT starting cluster
//! 0x38    8     MFT mirror starting cluster
//! 0x40    1     Clusters per file record (or negative power of 2)
//! 0x44    1     Clusters per index block (or negative power of 2)
//! 0x48    8     Volume serial number
//! 0x1FE   2     End of sector marker (0xAA55)
//! ```

use crate::bytes::{le_u16, le_u64, le_u8};
use crate::error::{NtfsError, Result};

/// NTFS boot sector signature in OEM ID field
pub const NTFS_SIGNATURE: &[u8; 8] = b"NTFS    ";

/// End of sector marker
pub const BOOT_SECTOR_MARKER: u16 = 0xAA55;

/// Size of the boot sector structure
pub const BOOT_SECTOR_SIZE: usize = 512;

/// Largest supported file record
pub const MAX_RECORD_SIZE: u32 = 4096;

/// Largest supported index block
pub const MAX_INDEX_BLOCK_SIZE: u32 = 65536;

/// NTFS BIOS Parameter Block (decoded)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtfsBpb {
    /// Bytes per sector (power of 2, 256-4096)
    pub bytes_per_sector: u16,
    /// Sectors per cluster (power of 2, 1-128)
    pub sectors_per_cluster: u8,
    /// Total sectors in volume
    pub total_sectors: u64,
    /// Starting cluster of MFT
    pub mft_cluster: u64,
    /// Starting cluster of MFT mirror
    pub mft_mirror_cluster: u64,
    /// Clusters per file record segment (or negative log2 if < 0)
    pub clusters_per_file_record: i8,
    /// Clusters per index block (or negative log2 if < 0)
    pub clusters_per_index_block: i8,
    /// Volume serial number
    pub volume_serial: u64,
    /// End of sector marker as found on disk
    pub marker: u16,
}

/// Size encoded as "clusters if positive, 2^-n bytes if negative"
fn encoded_size(value: i8, bytes_per_cluster: u32) -> Option<u32> {
    if value > 0 {
        (value as u32).checked_mul(bytes_per_cluster)
    } else if value < 0 && value > -32 {
        Some(1u32 << (-(value as i32)) as u32)
    } else {
        None
    }
}

impl NtfsBpb {
    /// Parse the BPB from the first 512 bytes of the volume
    ///
    /// Fails with `NotThisFormat` when the OEM identifier is missing.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < BOOT_SECTOR_SIZE {
            return Err(NtfsError::NotThisFormat);
        }
        if &sector[3..11] != NTFS_SIGNATURE {
            return Err(NtfsError::NotThisFormat);
        }

        Ok(Self {
            bytes_per_sector: le_u16(sector, 0x0B)?,
            sectors_per_cluster: le_u8(sector, 0x0D)?,
            total_sectors: le_u64(sector, 0x28)?,
            mft_cluster: le_u64(sector, 0x30)?,
            mft_mirror_cluster: le_u64(sector, 0x38)?,
            clusters_per_file_record: le_u8(sector, 0x40)? as i8,
            clusters_per_index_block: le_u8(sector, 0x44)? as i8,
            volume_serial: le_u64(sector, 0x48)?,
            marker: le_u16(sector, 0x1FE)?,
        })
    }

    /// Get bytes per cluster
    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    /// Get the actual file record size in bytes
    pub fn file_record_size(&self) -> Option<u32> {
        encoded_size(self.clusters_per_file_record, self.bytes_per_cluster())
    }

    /// Get the actual index block size in bytes
    pub fn index_block_size(&self) -> Option<u32> {
        encoded_size(self.clusters_per_index_block, self.bytes_per_cluster())
    }

    /// Validate BPB parameters
    pub fn is_valid(&self) -> bool {
        // Bytes per sector must be a power of 2 in 256-4096
        let bps = self.bytes_per_sector;
        if !bps.is_power_of_two() || !(256..=4096).contains(&bps) {
            return false;
        }

        // Sectors per cluster must be a power of 2 in 1-128
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return false;
        }

        if self.total_sectors == 0 {
            return false;
        }

        let total_clusters = self.total_sectors / self.sectors_per_cluster as u64;
        if self.mft_cluster == 0 || self.mft_cluster >= total_clusters {
            return false;
        }

        match self.file_record_size() {
            Some(size) if size.is_power_of_two() && (256..=MAX_RECORD_SIZE).contains(&size) => {}
            _ => return false,
        }
        match self.index_block_size() {
            Some(size) if size.is_power_of_two() && (256..=MAX_INDEX_BLOCK_SIZE).contains(&size) => {}
            _ => return false,
        }

        true
    }
}

/// Volume geometry derived from the boot sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeGeometry {
    /// Bytes per sector
    pub bytes_per_sector: u32,
    /// Sectors per cluster
    pub sectors_per_cluster: u32,
    /// Bytes per cluster
    pub bytes_per_cluster: u32,
    /// Total sectors in volume
    pub total_sectors: u64,
    /// Total clusters in volume
    pub total_clusters: u64,
    /// MFT starting cluster
    pub mft_cluster: u64,
    /// MFT mirror starting cluster
    pub mft_mirror_cluster: u64,
    /// File record size in bytes
    pub record_size: u32,
    /// Index block size in bytes
    pub index_block_size: u32,
    /// Volume serial number
    pub volume_serial: u64,
}

impl VolumeGeometry {
    /// Decode and validate the boot sector
    pub fn from_boot_sector(sector: &[u8]) -> Result<Self> {
        let bpb = NtfsBpb::parse(sector)?;

        if !bpb.is_valid() {
            log::warn!(
                "NTFS: invalid BPB (bps={} spc={} rec={} idx={})",
                bpb.bytes_per_sector,
                bpb.sectors_per_cluster,
                bpb.clusters_per_file_record,
                bpb.clusters_per_index_block
            );
            return Err(NtfsError::Corrupt);
        }
        if bpb.marker != BOOT_SECTOR_MARKER {
            log::debug!("NTFS: boot sector end marker is {:#06x}", bpb.marker);
        }

        let record_size = bpb.file_record_size().ok_or(NtfsError::Corrupt)?;
        let index_block_size = bpb.index_block_size().ok_or(NtfsError::Corrupt)?;

        Ok(Self {
            bytes_per_sector: bpb.bytes_per_sector as u32,
            sectors_per_cluster: bpb.sectors_per_cluster as u32,
            bytes_per_cluster: bpb.bytes_per_cluster(),
            total_sectors: bpb.total_sectors,
            total_clusters: bpb.total_sectors / bpb.sectors_per_cluster as u64,
            mft_cluster: bpb.mft_cluster,
            mft_mirror_cluster: bpb.mft_mirror_cluster,
            record_size,
            index_block_size,
            volume_serial: bpb.volume_serial,
        })
    }

    /// Byte offset of a cluster from the start of the volume
    pub fn cluster_offset(&self, lcn: u64) -> u64 {
        lcn * self.bytes_per_cluster as u64
    }

    /// Device block address of a cluster for a given device block size
    pub fn cluster_to_lba(&self, lcn: u64, device_block_size: u32) -> u64 {
        lcn * self.sectors_per_cluster as u64 * self.bytes_per_sector as u64
            / device_block_size as u64
    }

    /// Volume size in bytes
    pub fn total_bytes(&self) -> u64 {
        self.total_sectors * self.bytes_per_sector as u64
    }
}

/// Detect if a sector looks like an NTFS boot sector
pub fn detect_ntfs(sector_data: &[u8]) -> bool {
    sector_data.len() >= BOOT_SECTOR_SIZE && &sector_data[3..11] == NTFS_SIGNATURE
}
