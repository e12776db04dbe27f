//! NTFS Attributes
//!
//! Every file in NTFS is represented by a set of attributes stored in the MFT.
//! Each attribute has a type, name (optional), and data (resident or non-resident).
//!
//! # Attribute Types
//!
//! | Type   | Name                      | Description                    |
//! |--------|---------------------------|--------------------------------|
//! | 0x10   | $STANDARD_INFORMATION     | Timestamps, flags              |
//! | 0x20   | $ATTRIBUTE_LIST           | List of attribute locations    |
//! | 0x30   | $FILE_NAME                | File name (8.3 and long)       |
//! | 0x60   | $VOLUME_NAME              | Volume label                   |
//! | 0x80   | $DATA                     | File contents                  |
//! | 0x90   | $INDEX_ROOT               | Index root for directories     |
//! | 0xA0   | $INDEX_ALLOCATION         | Index allocation for dirs      |
//! | 0xB0   | $BITMAP                   | Bitmap for indexes/MFT         |
//!
//! # Attribute Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                 Attribute Header (common to all)                     │
//! │  - Type (4 bytes)                                                    │
//! │  - Record length (4 bytes)                                          │
//! │  - Non-resident flag (1 byte)                                       │
//! │  - Name length/offset (for named attributes)                        │
//! │  - Flags (compressed, encrypted, sparse)                            │
//! │  - Instance (unique within file record)                             │
//! └─────────────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┴───────────────────┐
//!          ▼                                       ▼
//! ┌─────────────────────┐              ┌─────────────────────┐
//! │  Resident Data       │              │  Non-Resident Data   │
//! │  - Data length       │              │  - VCN range         │
//! │  - Data offset       │              │  - Data runs         │
//! │  - Data bytes inline │              │  - Actual/alloc size │
//! │                      │              │  - Compression unit  │
//! └─────────────────────┘              └─────────────────────┘
//! ```
//!
//! # Attribute Lists
//!
//! When a file's attributes do not fit in one record, the base record gets
//! an `$ATTRIBUTE_LIST` naming the extension records that hold the rest.
//! [`AttributeSet::load`] merges base and extension records into one flat
//! set and stitches the VCN fragments of split non-resident attributes.

use alloc::vec::Vec;

use crate::bytes::{le_u16, le_u32, le_u64, le_u8, slice, utf16_units};
use crate::device::BlockDevice;
use crate::error::{NtfsError, Result};
use crate::mft::{FileRecord, Mft, MftRef};
use crate::runs::{DataRunList, RunStream};

/// Attribute type codes
pub mod attr_types {
    /// Standard timestamps, flags, etc.
    pub const STANDARD_INFORMATION: u32 = 0x10;
    /// List of attributes when they don't fit in one record
    pub const ATTRIBUTE_LIST: u32 = 0x20;
    /// File name (one or more per file)
    pub const FILE_NAME: u32 = 0x30;
    /// Object identifier (GUID)
    pub const OBJECT_ID: u32 = 0x40;
    /// Security descriptor
    pub const SECURITY_DESCRIPTOR: u32 = 0x50;
    /// Volume name (label)
    pub const VOLUME_NAME: u32 = 0x60;
    /// Volume information
    pub const VOLUME_INFORMATION: u32 = 0x70;
    /// File data stream
    pub const DATA: u32 = 0x80;
    /// Directory index root
    pub const INDEX_ROOT: u32 = 0x90;
    /// Directory index allocation
    pub const INDEX_ALLOCATION: u32 = 0xA0;
    /// Bitmap for index or MFT
    pub const BITMAP: u32 = 0xB0;
    /// Reparse point
    pub const REPARSE_POINT: u32 = 0xC0;
    /// End of attributes marker
    pub const END: u32 = 0xFFFFFFFF;
}

/// Get attribute type name
pub fn attr_type_name(type_code: u32) -> &'static str {
    match type_code {
        attr_types::STANDARD_INFORMATION => "$STANDARD_INFORMATION",
        attr_types::ATTRIBUTE_LIST => "$ATTRIBUTE_LIST",
        attr_types::FILE_NAME => "$FILE_NAME",
        attr_types::OBJECT_ID => "$OBJECT_ID",
        attr_types::SECURITY_DESCRIPTOR => "$SECURITY_DESCRIPTOR",
        attr_types::VOLUME_NAME => "$VOLUME_NAME",
        attr_types::VOLUME_INFORMATION => "$VOLUME_INFORMATION",
        attr_types::DATA => "$DATA",
        attr_types::INDEX_ROOT => "$INDEX_ROOT",
        attr_types::INDEX_ALLOCATION => "$INDEX_ALLOCATION",
        attr_types::BITMAP => "$BITMAP",
        attr_types::REPARSE_POINT => "$REPARSE_POINT",
        _ => "<unknown>",
    }
}

/// Most extension records merged into one attribute set
pub const MAX_EXTENSION_RECORDS: usize = 64;

/// Largest `$ATTRIBUTE_LIST` value accepted
pub const MAX_ATTRIBUTE_LIST_SIZE: u64 = 256 * 1024;

bitflags::bitflags! {
    /// Attribute header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttributeFlags: u16 {
        /// Attribute is compressed
        const COMPRESSED = 0x0001;
        /// Attribute is encrypted
        const ENCRYPTED = 0x4000;
        /// Attribute is sparse
        const SPARSE = 0x8000;
    }
}

bitflags::bitflags! {
    /// File attribute flags ($STANDARD_INFORMATION and $FILE_NAME)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const ARCHIVE = 0x0020;
        const DEVICE = 0x0040;
        const NORMAL = 0x0080;
        const TEMPORARY = 0x0100;
        const SPARSE_FILE = 0x0200;
        const REPARSE_POINT = 0x0400;
        const COMPRESSED = 0x0800;
        const OFFLINE = 0x1000;
        const NOT_CONTENT_INDEXED = 0x2000;
        const ENCRYPTED = 0x4000;
        /// Set in $FILE_NAME for directories
        const DIRECTORY = 0x1000_0000;
    }
}

/// Non-resident attribute body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonResident {
    /// Starting Virtual Cluster Number (VCN)
    pub start_vcn: u64,
    /// Last VCN covered by this fragment
    pub last_vcn: u64,
    /// Decoded runs, absolute LCNs
    pub runs: DataRunList,
    /// Compression unit size (log2 clusters, 0 = uncompressed)
    pub compression_unit: u16,
    /// Allocated size (on disk, cluster-aligned)
    pub allocated_size: u64,
    /// Actual data size
    pub data_size: u64,
    /// Initialized data size
    pub initialized_size: u64,
}

/// Attribute value: inline bytes or a run list
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttributeValue {
    Resident(Vec<u8>),
    NonResident(NonResident),
}

/// One decoded attribute
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute type code
    pub type_code: u32,
    /// Attribute name (UTF-16), empty when unnamed
    pub name: Vec<u16>,
    /// Attribute flags
    pub flags: AttributeFlags,
    /// Attribute instance (unique within file record)
    pub instance: u16,
    /// Value
    pub value: AttributeValue,
}

impl Attribute {
    /// Decode the attribute starting at `off` in a fixed-up record
    fn parse(data: &[u8], off: usize, limit: usize) -> Result<Self> {
        let type_code = le_u32(data, off)?;
        let length = le_u32(data, off + 4)? as usize;
        if length < 16 || length % 8 != 0 || off + length > limit {
            log::warn!(
                "NTFS: attribute {:#x} at {} has bad length {}",
                type_code,
                off,
                length
            );
            return Err(NtfsError::Corrupt);
        }
        let attr = slice(data, off, length)?;

        let non_resident = le_u8(attr, 8)? != 0;
        let name_length = le_u8(attr, 9)? as usize;
        let name_offset = le_u16(attr, 10)? as usize;
        let flags = AttributeFlags::from_bits_retain(le_u16(attr, 12)?);
        let instance = le_u16(attr, 14)?;
        let name = if name_length > 0 {
            utf16_units(attr, name_offset, name_length)?
        } else {
            Vec::new()
        };

        let value = if !non_resident {
            let value_length = le_u32(attr, 16)? as usize;
            let value_offset = le_u16(attr, 20)? as usize;
            AttributeValue::Resident(slice(attr, value_offset, value_length)?.to_vec())
        } else {
            if length < 64 {
                return Err(NtfsError::Corrupt);
            }
            let start_vcn = le_u64(attr, 16)?;
            let last_vcn = le_u64(attr, 24)?;
            let runs_offset = le_u16(attr, 32)? as usize;
            if runs_offset < 64 || runs_offset > length {
                return Err(NtfsError::Corrupt);
            }
            let runs = DataRunList::decode(&attr[runs_offset..], start_vcn)?;
            if runs.count() > 0 && runs.next_vcn() != last_vcn.wrapping_add(1) {
                log::warn!(
                    "NTFS: runs end at VCN {}, header says {}",
                    runs.next_vcn(),
                    last_vcn
                );
                return Err(NtfsError::Corrupt);
            }
            let nr = NonResident {
                start_vcn,
                last_vcn,
                runs,
                compression_unit: le_u16(attr, 34)?,
                allocated_size: le_u64(attr, 40)?,
                data_size: le_u64(attr, 48)?,
                initialized_size: le_u64(attr, 56)?,
            };
            if nr.start_vcn == 0
                && (nr.data_size > nr.allocated_size || nr.initialized_size > nr.data_size)
            {
                log::warn!("NTFS: attribute {:#x} has inconsistent sizes", type_code);
                return Err(NtfsError::Corrupt);
            }
            AttributeValue::NonResident(nr)
        };

        Ok(Self {
            type_code,
            name,
            flags,
            instance,
            value,
        })
    }

    /// Check if attribute is resident
    pub fn is_resident(&self) -> bool {
        matches!(self.value, AttributeValue::Resident(_))
    }

    /// Resident value bytes
    pub fn resident(&self) -> Option<&[u8]> {
        match &self.value {
            AttributeValue::Resident(data) => Some(data),
            AttributeValue::NonResident(_) => None,
        }
    }

    /// Non-resident body
    pub fn non_resident(&self) -> Option<&NonResident> {
        match &self.value {
            AttributeValue::NonResident(nr) => Some(nr),
            AttributeValue::Resident(_) => None,
        }
    }

    /// First VCN held by this fragment (0 for resident attributes)
    pub fn start_vcn(&self) -> u64 {
        self.non_resident().map_or(0, |nr| nr.start_vcn)
    }

    /// Logical size of the value
    pub fn value_size(&self) -> u64 {
        match &self.value {
            AttributeValue::Resident(data) => data.len() as u64,
            AttributeValue::NonResident(nr) => nr.data_size,
        }
    }

    /// Reject values the driver cannot decode
    ///
    /// Compressed, encrypted and sparse-flagged streams are `Unsupported`.
    pub fn check_supported(&self) -> Result<()> {
        let flagged = self
            .flags
            .intersects(AttributeFlags::COMPRESSED | AttributeFlags::ENCRYPTED | AttributeFlags::SPARSE);
        let compressed = self.non_resident().is_some_and(|nr| nr.compression_unit != 0);
        if flagged || compressed {
            log::debug!(
                "NTFS: {} has unsupported flags {:#06x}",
                attr_type_name(self.type_code),
                self.flags.bits()
            );
            return Err(NtfsError::Unsupported);
        }
        Ok(())
    }

    /// Read from byte `offset` of the value
    ///
    /// Returns the bytes produced; zero at or past the end of the value.
    pub fn read_at<D: BlockDevice>(&self, mft: &mut Mft<D>, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match &self.value {
            AttributeValue::Resident(data) => {
                let Ok(start) = usize::try_from(offset) else {
                    return Ok(0);
                };
                if start >= data.len() {
                    return Ok(0);
                }
                let n = (data.len() - start).min(buf.len());
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            AttributeValue::NonResident(nr) => {
                let stream = RunStream::new(&nr.runs, nr.data_size, nr.initialized_size);
                mft.read_stream(&stream, offset, buf)
            }
        }
    }

    /// Read the whole value, refusing values larger than `limit`
    pub fn read_all<D: BlockDevice>(&self, mft: &mut Mft<D>, limit: u64) -> Result<Vec<u8>> {
        let size = self.value_size();
        if size > limit {
            log::warn!(
                "NTFS: {} value of {} bytes exceeds {}",
                attr_type_name(self.type_code),
                size,
                limit
            );
            return Err(NtfsError::Corrupt);
        }

        let mut out = value_buffer(size as usize)?;
        let n = self.read_at(mft, 0, &mut out)?;
        if n != out.len() {
            return Err(NtfsError::Corrupt);
        }
        Ok(out)
    }
}

/// Decode every attribute of one record, in record order
pub fn parse_attributes(record: &FileRecord) -> Result<Vec<Attribute>> {
    let data = record.data();
    let limit = record.header().used_size as usize;
    let mut off = record.header().first_attribute_offset as usize;
    let mut attrs = Vec::new();

    loop {
        if off + 4 > limit {
            log::warn!("NTFS: record {} has no end marker", record.record_number());
            return Err(NtfsError::Corrupt);
        }
        let type_code = le_u32(data, off)?;
        if type_code == attr_types::END {
            break;
        }
        let attr = Attribute::parse(data, off, limit)?;
        off += le_u32(data, off + 4)? as usize;
        attrs.push(attr);
    }

    Ok(attrs)
}

/// One `$ATTRIBUTE_LIST` entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeListEntry {
    pub type_code: u32,
    pub name: Vec<u16>,
    pub start_vcn: u64,
    /// Record holding the attribute
    pub reference: MftRef,
    pub instance: u16,
}

impl AttributeListEntry {
    /// Decode every entry of an attribute list value
    pub fn parse_all(value: &[u8]) -> Result<Vec<Self>> {
        let mut entries = Vec::new();
        let mut off = 0usize;

        while off < value.len() {
            let type_code = le_u32(value, off)?;
            if type_code == attr_types::END {
                break;
            }
            let length = le_u16(value, off + 4)? as usize;
            if length < 26 || off + length > value.len() {
                log::warn!("NTFS: attribute list entry at {} has length {}", off, length);
                return Err(NtfsError::Corrupt);
            }
            let entry = slice(value, off, length)?;
            let name_length = le_u8(entry, 6)? as usize;
            let name_offset = le_u8(entry, 7)? as usize;

            entries.push(Self {
                type_code,
                name: utf16_units(entry, name_offset, name_length)?,
                start_vcn: le_u64(entry, 8)?,
                reference: MftRef::from_u64(le_u64(entry, 16)?),
                instance: le_u16(entry, 24)?,
            });
            off += length;
        }

        Ok(entries)
    }
}

/// File name namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// POSIX (case-sensitive, allows any Unicode)
    Posix,
    /// Win32 (case-insensitive, restricted chars)
    Win32,
    /// DOS 8.3 name
    Dos,
    /// Win32 and DOS (when name fits 8.3)
    Win32AndDos,
}

impl Namespace {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(Namespace::Posix),
            1 => Ok(Namespace::Win32),
            2 => Ok(Namespace::Dos),
            3 => Ok(Namespace::Win32AndDos),
            _ => Err(NtfsError::Corrupt),
        }
    }

    /// Check if this is a DOS-only 8.3 name
    pub fn is_dos_only(&self) -> bool {
        *self == Namespace::Dos
    }
}

/// $FILE_NAME attribute value (also the key of directory index entries)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileName {
    /// Parent directory MFT reference
    pub parent: MftRef,
    /// File creation time (100-ns since 1601)
    pub creation_time: u64,
    /// File modification time
    pub modification_time: u64,
    /// MFT modification time
    pub mft_modification_time: u64,
    /// File access time
    pub access_time: u64,
    /// Allocated size (for directories: size of index)
    pub allocated_size: u64,
    /// Real file size
    pub data_size: u64,
    /// File attributes
    pub file_attributes: FileAttributes,
    /// File name type (POSIX, Win32, DOS, Win32_and_DOS)
    pub namespace: Namespace,
    /// File name (UTF-16)
    pub name: Vec<u16>,
}

impl FileName {
    /// Fixed part of the value, before the name
    pub const HEADER_SIZE: usize = 66;

    pub fn parse(value: &[u8]) -> Result<Self> {
        let name_length = le_u8(value, 64)? as usize;
        Ok(Self {
            parent: MftRef::from_u64(le_u64(value, 0)?),
            creation_time: le_u64(value, 8)?,
            modification_time: le_u64(value, 16)?,
            mft_modification_time: le_u64(value, 24)?,
            access_time: le_u64(value, 32)?,
            allocated_size: le_u64(value, 40)?,
            data_size: le_u64(value, 48)?,
            file_attributes: FileAttributes::from_bits_retain(le_u32(value, 56)?),
            namespace: Namespace::from_raw(le_u8(value, 65)?)?,
            name: utf16_units(value, Self::HEADER_SIZE, name_length)?,
        })
    }

    /// Check if the name belongs to a directory
    pub fn is_directory(&self) -> bool {
        self.file_attributes.contains(FileAttributes::DIRECTORY)
    }
}

/// $STANDARD_INFORMATION attribute value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StandardInformation {
    /// File creation time (100-ns since 1601)
    pub creation_time: u64,
    /// File modification time
    pub modification_time: u64,
    /// MFT modification time
    pub mft_modification_time: u64,
    /// File access time
    pub access_time: u64,
    /// File attributes (flags)
    pub file_attributes: FileAttributes,
}

impl StandardInformation {
    pub fn parse(value: &[u8]) -> Result<Self> {
        Ok(Self {
            creation_time: le_u64(value, 0)?,
            modification_time: le_u64(value, 8)?,
            mft_modification_time: le_u64(value, 16)?,
            access_time: le_u64(value, 24)?,
            file_attributes: FileAttributes::from_bits_retain(le_u32(value, 32)?),
        })
    }
}

/// All attributes of one file, extension records merged in
#[derive(Clone, Debug)]
pub struct AttributeSet {
    /// Base record reference
    reference: MftRef,
    is_directory: bool,
    has_list: bool,
    /// Sorted by type, then name; split attributes already stitched
    attrs: Vec<Attribute>,
}

impl AttributeSet {
    /// Build the merged attribute set of a base record
    pub fn load<D: BlockDevice>(mft: &mut Mft<D>, base: &FileRecord) -> Result<Self> {
        let mut attrs = parse_attributes(base)?;

        let list = attrs
            .iter()
            .find(|a| a.type_code == attr_types::ATTRIBUTE_LIST)
            .cloned();
        let has_list = list.is_some();

        if let Some(list) = list {
            let value = list.read_all(mft, MAX_ATTRIBUTE_LIST_SIZE)?;
            let mut extensions: Vec<MftRef> = Vec::new();
            for entry in AttributeListEntry::parse_all(&value)? {
                if entry.reference.file_number() == base.record_number() {
                    continue;
                }
                if extensions.iter().any(|r| r.file_number() == entry.reference.file_number()) {
                    continue;
                }
                if extensions.len() >= MAX_EXTENSION_RECORDS {
                    log::warn!(
                        "NTFS: record {} lists more than {} extension records",
                        base.record_number(),
                        MAX_EXTENSION_RECORDS
                    );
                    return Err(NtfsError::Corrupt);
                }
                extensions.push(entry.reference);
            }

            for reference in extensions {
                let ext = mft.get(reference).map_err(|e| match e {
                    NtfsError::NotFound => NtfsError::Corrupt,
                    other => other,
                })?;
                if ext.header().base_record.file_number() != base.record_number() {
                    log::warn!(
                        "NTFS: record {} does not extend record {}",
                        reference.file_number(),
                        base.record_number()
                    );
                    return Err(NtfsError::Corrupt);
                }
                attrs.extend(parse_attributes(&ext)?);
            }
        }

        attrs.sort_by(|a, b| {
            a.type_code
                .cmp(&b.type_code)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.start_vcn().cmp(&b.start_vcn()))
        });

        let geo = *mft.geometry();
        let attrs = stitch(attrs)?;
        for attr in &attrs {
            if let Some(nr) = attr.non_resident() {
                nr.runs.validate(geo.total_clusters)?;
                let mapped = nr.runs.total_clusters().saturating_mul(geo.bytes_per_cluster as u64);
                if mapped < nr.allocated_size {
                    log::warn!(
                        "NTFS: {} of record {} maps {} of {} allocated bytes",
                        attr_type_name(attr.type_code),
                        base.record_number(),
                        mapped,
                        nr.allocated_size
                    );
                    return Err(NtfsError::Corrupt);
                }
            }
        }

        Ok(Self {
            reference: base.reference(),
            is_directory: base.is_directory(),
            has_list,
            attrs,
        })
    }

    /// Base record reference
    pub fn reference(&self) -> MftRef {
        self.reference
    }

    /// Base record carries the directory flag
    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    /// Base record carries an `$ATTRIBUTE_LIST`
    pub fn has_attribute_list(&self) -> bool {
        self.has_list
    }

    /// Iterate over all attributes
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter()
    }

    /// Find an attribute by type and exact name
    pub fn find(&self, type_code: u32, name: &[u16]) -> Option<&Attribute> {
        self.attrs
            .iter()
            .find(|a| a.type_code == type_code && a.name == name)
    }

    /// Find an attribute by type and ASCII name
    pub fn find_named(&self, type_code: u32, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| {
            a.type_code == type_code
                && a.name.len() == name.len()
                && a.name.iter().zip(name.bytes()).all(|(&u, b)| u == b as u16)
        })
    }

    /// The unnamed data stream, checked for decodability
    pub fn data(&self) -> Result<&Attribute> {
        let attr = self.find(attr_types::DATA, &[]).ok_or_else(|| {
            log::warn!("NTFS: record {} has no $DATA", self.reference.file_number());
            NtfsError::Corrupt
        })?;
        attr.check_supported()?;
        Ok(attr)
    }

    /// Decoded $STANDARD_INFORMATION
    pub fn standard_information(&self) -> Option<StandardInformation> {
        self.find(attr_types::STANDARD_INFORMATION, &[])
            .and_then(|a| a.resident())
            .and_then(|v| StandardInformation::parse(v).ok())
    }
}

/// Merge non-resident fragments into their VCN-0 attribute
///
/// Input is sorted by (type, name, start VCN).
fn stitch(sorted: Vec<Attribute>) -> Result<Vec<Attribute>> {
    let mut out: Vec<Attribute> = Vec::with_capacity(sorted.len());

    for attr in sorted {
        let fragment = attr.non_resident().is_some_and(|nr| nr.start_vcn != 0);
        if !fragment {
            out.push(attr);
            continue;
        }

        let head = out
            .last_mut()
            .filter(|h| h.type_code == attr.type_code && h.name == attr.name);
        let (Some(head), AttributeValue::NonResident(tail)) = (head, attr.value) else {
            log::warn!(
                "NTFS: {} fragment without a VCN-0 fragment",
                attr_type_name(attr.type_code)
            );
            return Err(NtfsError::Corrupt);
        };
        let AttributeValue::NonResident(nr) = &mut head.value else {
            return Err(NtfsError::Corrupt);
        };
        nr.runs.append(tail.runs)?;
        nr.last_vcn = tail.last_vcn;
    }

    Ok(out)
}

/// Decode a `$VOLUME_NAME` value
pub fn volume_name(value: &[u8]) -> Result<Vec<u16>> {
    if value.len() % 2 != 0 {
        return Err(NtfsError::Corrupt);
    }
    utf16_units(value, 0, value.len() / 2)
}

/// Zero-filled buffer sized for one value, reporting allocation failure
pub fn value_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, 0);
    Ok(buf)
}
