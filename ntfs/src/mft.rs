//! NTFS Master File Table (MFT)
//!
//! The MFT is the heart of NTFS, containing an entry (file record) for every
//! file and directory on the volume. The first 16 entries are reserved for
//! system files.
//!
//! # MFT Entry Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    File Record Header (48 bytes)                      │
//! │  - Signature "FILE"                                                   │
//! │  - Fixup array offset/count                                          │
//! │  - Sequence number                                                    │
//! │  - Flags (in use, directory)                                         │
//! │  - First attribute offset                                            │
//! │  - Base record reference (extension records only)                    │
//! └──────────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    Attribute 1 (e.g., $STANDARD_INFORMATION)          │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                    ... more attributes ...                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                    End marker (0xFFFFFFFF)                           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Bootstrap
//!
//! The MFT is itself a file (record 0) whose `$DATA` may be fragmented, so
//! the table is needed to read the table. Loading is therefore split:
//!
//! ```text
//!  Uninitialized ──(record 0 read at the boot-sector LCN)──▶ Bootstrapped
//!  Bootstrapped  ──(attribute-list fragments merged)──────▶ Ready
//! ```
//!
//! In `Bootstrapped` only the records covered by record 0's own run list
//! are reachable, which is enough to fetch `$MFT`'s extension records.

use alloc::vec;
use alloc::vec::Vec;

use crate::attr::{attr_types, AttributeSet};
use crate::boot::VolumeGeometry;
use crate::bytes::{le_u16, le_u32, le_u64};
use crate::device::{BlockDevice, BlockReader, CacheStats};
use crate::error::{NtfsError, Result};
use crate::fixup::{apply_fixup, FILE_MAGIC};
use crate::runs::{DataRunList, RunStream};

/// Maximum entries in MFT cache
pub const MFT_CACHE_SIZE: usize = 32;

bitflags::bitflags! {
    /// File record header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecordFlags: u16 {
        /// Record is allocated
        const IN_USE = 0x0001;
        /// Record holds a file-name index (a directory)
        const IS_DIRECTORY = 0x0002;
        /// Record is in $Extend
        const IS_EXTENSION = 0x0004;
        /// Record holds a view index other than file names
        const HAS_VIEW_INDEX = 0x0008;
    }
}

/// Well-known MFT entry indices
pub mod well_known_mft {
    /// $MFT - Master File Table
    pub const MFT: u64 = 0;
    /// $MFTMirr - MFT mirror
    pub const MFT_MIRR: u64 = 1;
    /// $LogFile - Transaction log
    pub const LOG_FILE: u64 = 2;
    /// $Volume - Volume information
    pub const VOLUME: u64 = 3;
    /// $AttrDef - Attribute definitions
    pub const ATTR_DEF: u64 = 4;
    /// Root directory (.)
    pub const ROOT_DIR: u64 = 5;
    /// $Bitmap - Cluster allocation bitmap
    pub const BITMAP: u64 = 6;
    /// $Boot - Boot sector
    pub const BOOT: u64 = 7;
    /// $BadClus - Bad cluster list
    pub const BAD_CLUS: u64 = 8;
    /// $Secure - Security descriptors
    pub const SECURE: u64 = 9;
    /// $UpCase - Uppercase table
    pub const UPCASE: u64 = 10;
    /// $Extend - Extended metadata directory
    pub const EXTEND: u64 = 11;
}

/// MFT Reference (48-bit file number + 16-bit sequence number)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MftRef {
    file_number: u64,
    sequence_number: u16,
}

impl MftRef {
    /// Create a new MFT reference
    pub const fn new(file_number: u64, sequence: u16) -> Self {
        Self {
            file_number: file_number & 0x0000_FFFF_FFFF_FFFF,
            sequence_number: sequence,
        }
    }

    /// Create from raw 64-bit value
    pub const fn from_u64(val: u64) -> Self {
        Self::new(val, (val >> 48) as u16)
    }

    /// Convert to raw 64-bit value
    pub const fn to_u64(&self) -> u64 {
        self.file_number | (self.sequence_number as u64) << 48
    }

    /// Get the file number
    pub const fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Get the sequence number
    pub const fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    /// Check if this is a valid reference (not empty)
    pub const fn is_valid(&self) -> bool {
        self.file_number != 0 || self.sequence_number != 0
    }
}

/// File record header (beginning of every MFT entry)
#[derive(Clone, Copy, Debug)]
pub struct FileRecordHeader {
    /// $LogFile sequence number (LSN)
    pub lsn: u64,
    /// Sequence number
    pub sequence_number: u16,
    /// Hard link count
    pub hard_link_count: u16,
    /// Offset to first attribute
    pub first_attribute_offset: u16,
    /// Flags (in use, directory, etc.)
    pub flags: RecordFlags,
    /// Real size of file record
    pub used_size: u32,
    /// Allocated size of file record
    pub allocated_size: u32,
    /// Base file record (empty if this is the base)
    pub base_record: MftRef,
    /// Next attribute ID
    pub next_attribute_id: u16,
}

impl FileRecordHeader {
    /// Parse a fixed-up record header
    fn parse(data: &[u8]) -> Result<Self> {
        let header = Self {
            lsn: le_u64(data, 8)?,
            sequence_number: le_u16(data, 16)?,
            hard_link_count: le_u16(data, 18)?,
            first_attribute_offset: le_u16(data, 20)?,
            flags: RecordFlags::from_bits_retain(le_u16(data, 22)?),
            used_size: le_u32(data, 24)?,
            allocated_size: le_u32(data, 28)?,
            base_record: MftRef::from_u64(le_u64(data, 32)?),
            next_attribute_id: le_u16(data, 40)?,
        };

        let first = header.first_attribute_offset as usize;
        let used = header.used_size as usize;
        if first < 42 || first % 8 != 0 || used > data.len() || first + 4 > used {
            log::warn!(
                "NTFS: bad record layout (first attr {}, used {}, size {})",
                first,
                used,
                data.len()
            );
            return Err(NtfsError::Corrupt);
        }

        Ok(header)
    }

    /// Check if this is a base record
    pub fn is_base_record(&self) -> bool {
        !self.base_record.is_valid()
    }
}

/// File record (MFT entry), fixups already applied
#[derive(Clone, Debug)]
pub struct FileRecord {
    number: u64,
    header: FileRecordHeader,
    data: Vec<u8>,
}

impl FileRecord {
    /// Validate raw record bytes read from the table
    pub fn from_bytes(number: u64, mut data: Vec<u8>) -> Result<Self> {
        apply_fixup(&mut data, FILE_MAGIC).inspect_err(|_| {
            log::warn!("NTFS: MFT record {} failed fixup", number);
        })?;
        let header = FileRecordHeader::parse(&data)?;
        Ok(Self { number, header, data })
    }

    /// Get the file record header
    pub fn header(&self) -> &FileRecordHeader {
        &self.header
    }

    /// Get raw (fixed-up) data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get MFT record number
    pub fn record_number(&self) -> u64 {
        self.number
    }

    /// Get sequence number
    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    /// Reference naming the current occupant of this record
    pub fn reference(&self) -> MftRef {
        MftRef::new(self.number, self.header.sequence_number)
    }

    /// Check if record is in use
    pub fn is_in_use(&self) -> bool {
        self.header.flags.contains(RecordFlags::IN_USE)
    }

    /// Check if record is a directory
    pub fn is_directory(&self) -> bool {
        self.header.flags.contains(RecordFlags::IS_DIRECTORY)
    }
}

/// Bootstrap state of the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MftState {
    /// No run map yet; only the boot-sector location of record 0 is known
    Uninitialized,
    /// Run map of record 0's first `$DATA` fragment installed
    Bootstrapped,
    /// Complete run map installed
    Ready,
}

/// MFT cache entry
#[derive(Debug)]
struct MftCacheEntry {
    /// Cached file record
    record: FileRecord,
    /// Last access time (for LRU)
    last_access: u64,
}

/// Master file table accessor
///
/// Owns the block reader and the volume geometry: every other structure
/// on the volume is reached through a record fetched here.
pub struct Mft<D> {
    reader: BlockReader<D>,
    geometry: VolumeGeometry,
    state: MftState,
    /// Cached $MFT data runs
    runs: DataRunList,
    data_size: u64,
    initialized_size: u64,
    /// Cached MFT records
    cache: Vec<MftCacheEntry>,
    tick: u64,
    cache_hits: u64,
    cache_misses: u64,
}

impl<D: BlockDevice> Mft<D> {
    /// Create an accessor that has not read anything yet
    pub fn new(reader: BlockReader<D>, geometry: VolumeGeometry) -> Self {
        Self {
            reader,
            geometry,
            state: MftState::Uninitialized,
            runs: DataRunList::empty_at(0),
            data_size: 0,
            initialized_size: 0,
            cache: Vec::new(),
            tick: 0,
            cache_hits: 0,
            cache_misses: 0,
        }
    }

    /// Read record 0 and install the complete $MFT run map
    pub fn load(reader: BlockReader<D>, geometry: VolumeGeometry) -> Result<Self> {
        let mut mft = Self::new(reader, geometry);
        let record0 = mft.bootstrap()?;
        mft.complete(&record0)?;
        Ok(mft)
    }

    /// Phase one: read record 0 at its boot-sector location
    fn bootstrap(&mut self) -> Result<FileRecord> {
        debug_assert_eq!(self.state, MftState::Uninitialized);

        let size = self.geometry.record_size as usize;
        let mut buf = vec![0u8; size];
        let offset = self.geometry.cluster_offset(self.geometry.mft_cluster);
        self.reader.read_bytes(offset, &mut buf)?;

        let record = FileRecord::from_bytes(well_known_mft::MFT, buf)?;
        if !record.is_in_use() {
            log::warn!("NTFS: $MFT record not in use");
            return Err(NtfsError::Corrupt);
        }

        let attrs = crate::attr::parse_attributes(&record)?;
        let data = attrs
            .iter()
            .find(|a| a.type_code == attr_types::DATA && a.name.is_empty())
            .ok_or_else(|| {
                log::warn!("NTFS: $MFT has no $DATA attribute");
                NtfsError::Corrupt
            })?;
        let nr = data.non_resident().ok_or_else(|| {
            log::warn!("NTFS: $MFT $DATA is resident");
            NtfsError::Corrupt
        })?;
        if nr.start_vcn != 0 {
            return Err(NtfsError::Corrupt);
        }
        nr.runs.validate(self.geometry.total_clusters)?;

        self.runs = nr.runs.clone();
        self.data_size = nr.data_size;
        self.initialized_size = nr.initialized_size;
        self.state = MftState::Bootstrapped;
        log::debug!(
            "NTFS: MFT bootstrapped ({} runs, {} bytes)",
            self.runs.count(),
            self.data_size
        );

        Ok(record)
    }

    /// Phase two: merge $DATA fragments held in extension records
    fn complete(&mut self, record0: &FileRecord) -> Result<()> {
        debug_assert_eq!(self.state, MftState::Bootstrapped);

        let set = AttributeSet::load(self, record0)?;
        if set.has_attribute_list() {
            let data = set.find(attr_types::DATA, &[]).ok_or(NtfsError::Corrupt)?;
            let nr = data.non_resident().ok_or(NtfsError::Corrupt)?;
            if nr.runs.total_clusters() < self.runs.total_clusters() {
                return Err(NtfsError::Corrupt);
            }
            self.runs = nr.runs.clone();
            log::debug!("NTFS: MFT run map extended to {} runs", self.runs.count());
        }

        self.state = MftState::Ready;
        Ok(())
    }

    /// Volume geometry
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Number of records the table can hold
    pub fn record_count(&self) -> u64 {
        self.data_size / self.geometry.record_size as u64
    }

    /// Cache hit and miss counters
    pub fn cache_stats(&self) -> (u64, u64) {
        (self.cache_hits, self.cache_misses)
    }

    /// Device block cache counters
    pub fn block_cache_stats(&self) -> CacheStats {
        self.reader.stats()
    }

    /// Give the block device back, releasing every cache
    pub fn into_device(self) -> D {
        self.reader.into_inner()
    }

    /// Read from a non-resident stream on this volume
    pub fn read_stream(&mut self, stream: &RunStream<'_>, offset: u64, buf: &mut [u8]) -> Result<usize> {
        stream.read_at(&mut self.reader, &self.geometry, offset, buf)
    }

    /// Fetch a record by reference
    ///
    /// A record that is free, or whose sequence number differs from the
    /// reference, is reported as `NotFound`. On-disk references always
    /// carry a sequence number, so 0 is `Corrupt`.
    pub fn get(&mut self, reference: MftRef) -> Result<FileRecord> {
        let seq = reference.sequence_number();
        if seq == 0 {
            log::warn!("NTFS: reference to record {} has no sequence number", reference.file_number());
            return Err(NtfsError::Corrupt);
        }

        let record = self.get_well_known(reference.file_number())?;
        if seq != record.sequence_number() {
            log::debug!(
                "NTFS: stale reference to record {} (seq {} != {})",
                reference.file_number(),
                seq,
                record.sequence_number()
            );
            return Err(NtfsError::NotFound);
        }

        Ok(record)
    }

    /// Fetch an in-use record by number alone
    ///
    /// Only for the metafiles in [`well_known_mft`], whose numbers are
    /// fixed by the format.
    pub fn get_well_known(&mut self, record_number: u64) -> Result<FileRecord> {
        let record = self.read_record(record_number)?;
        if !record.is_in_use() {
            log::debug!("NTFS: record {} is not in use", record_number);
            return Err(NtfsError::NotFound);
        }
        Ok(record)
    }

    /// Read an MFT record by number
    pub fn read_record(&mut self, record_number: u64) -> Result<FileRecord> {
        if self.state == MftState::Uninitialized {
            return Err(NtfsError::Corrupt);
        }

        self.tick += 1;
        let tick = self.tick;
        if let Some(cached) = self
            .cache
            .iter_mut()
            .find(|e| e.record.record_number() == record_number)
        {
            cached.last_access = tick;
            self.cache_hits += 1;
            return Ok(cached.record.clone());
        }
        self.cache_misses += 1;

        let size = self.geometry.record_size as u64;
        let offset = record_number
            .checked_mul(size)
            .filter(|off| off + size <= self.data_size)
            .ok_or(NtfsError::NotFound)?;

        let mut buf = vec![0u8; size as usize];
        let stream = RunStream::new(&self.runs, self.data_size, self.initialized_size);
        let n = stream.read_at(&mut self.reader, &self.geometry, offset, &mut buf)?;
        if n != buf.len() {
            return Err(NtfsError::Corrupt);
        }

        let record = FileRecord::from_bytes(record_number, buf)?;
        self.cache_record(record.clone());
        Ok(record)
    }

    /// Cache an MFT record, evicting the least recently used entry
    fn cache_record(&mut self, record: FileRecord) {
        let entry = MftCacheEntry {
            record,
            last_access: self.tick,
        };

        if self.cache.len() < MFT_CACHE_SIZE {
            self.cache.push(entry);
            return;
        }
        if let Some(oldest) = self.cache.iter_mut().min_by_key(|e| e.last_access) {
            *oldest = entry;
        }
    }
}
