//! Directory Indexes
//!
//! A directory's entries are kept in a B+ tree keyed by collated file name:
//!
//! ```text
//!  $INDEX_ROOT ($I30, resident)
//!  ┌──────────────────────────────────────────────┐
//!  │ [ALPHA]  [KAPPA]  [last] ──────────┐          │
//!  └────┬───────┬───────────────────────┼──────────┘
//!       │VCN 0  │VCN 2                  │VCN 4
//!       ▼       ▼                       ▼
//!  $INDEX_ALLOCATION ($I30, non-resident, "INDX" blocks)
//!  ┌────────┐ ┌────────┐            ┌────────┐
//!  │ a .. z │ │ l .. p │     ...    │ q .. z │
//!  └────────┘ └────────┘            └────────┘
//! ```
//!
//! Each entry optionally points at the sub-block holding every name that
//! sorts before it; the terminating `last` entry points at the names that
//! sort after the final key. `$BITMAP` ($I30) marks which blocks of the
//! allocation are in use. Traversal is iterative and bounded by
//! [`MAX_INDEX_DEPTH`], so a corrupt tree cannot recurse without limit.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::attr::{attr_types, value_buffer, Attribute, AttributeSet, FileName};
use crate::bytes::{le_u16, le_u32, le_u64, le_u8};
use crate::device::BlockDevice;
use crate::error::{NtfsError, Result};
use crate::fixup::{apply_fixup, INDX_MAGIC};
use crate::mft::{Mft, MftRef};
use crate::name::UpcaseTable;

/// Deepest index tree walked before the index is declared corrupt
pub const MAX_INDEX_DEPTH: usize = 32;

/// Collation rule of file-name indexes
pub const COLLATION_FILE_NAME: u32 = 0x01;

/// Name of the file-name index
pub const I30: &str = "$I30";

/// Largest `$BITMAP` ($I30) value accepted
const MAX_INDEX_BITMAP_SIZE: u64 = 1024 * 1024;

/// Offset of the node header inside an INDX block
const INDX_NODE_OFFSET: usize = 24;

/// Offset of the node header inside the `$INDEX_ROOT` value
const ROOT_NODE_OFFSET: usize = 16;

bitflags::bitflags! {
    /// Index node header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IndexNodeFlags: u32 {
        /// Node has sub-blocks in $INDEX_ALLOCATION
        const LARGE_INDEX = 0x01;
    }
}

bitflags::bitflags! {
    /// Index entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IndexEntryFlags: u16 {
        /// Entry ends with a sub-block VCN
        const HAS_SUBNODE = 0x01;
        /// Terminating entry, carries no key
        const LAST = 0x02;
    }
}

/// Index node header (shared by the root and INDX blocks)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexNodeHeader {
    /// Offset to the first entry, relative to this header
    pub entries_offset: u32,
    /// End of the last entry, relative to this header
    pub index_length: u32,
    pub allocated_size: u32,
    pub flags: IndexNodeFlags,
}

/// One directory index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// File the entry names
    pub reference: MftRef,
    pub flags: IndexEntryFlags,
    /// `$FILE_NAME` key; `None` on the terminating entry
    pub key: Option<FileName>,
    /// Sub-block holding the names sorting before this entry
    pub subnode_vcn: Option<u64>,
}

impl IndexEntry {
    /// Check if this is the terminating entry
    pub fn is_last(&self) -> bool {
        self.flags.contains(IndexEntryFlags::LAST)
    }
}

/// Decode the node header at `node` and every entry it covers
fn parse_node(buf: &[u8], node: usize) -> Result<(IndexNodeHeader, Vec<IndexEntry>)> {
    let header = IndexNodeHeader {
        entries_offset: le_u32(buf, node)?,
        index_length: le_u32(buf, node + 4)?,
        allocated_size: le_u32(buf, node + 8)?,
        flags: IndexNodeFlags::from_bits_retain(le_u8(buf, node + 12)? as u32),
    };

    let mut pos = node + header.entries_offset as usize;
    let end = node + header.index_length as usize;
    if end > buf.len() || pos > end {
        log::warn!(
            "NTFS: index node entries {}..{} outside {} bytes",
            pos,
            end,
            buf.len()
        );
        return Err(NtfsError::Corrupt);
    }

    let mut entries = Vec::new();
    loop {
        if pos + 16 > end {
            log::warn!("NTFS: index node has no terminating entry");
            return Err(NtfsError::Corrupt);
        }
        let entry_length = le_u16(buf, pos + 8)? as usize;
        let key_length = le_u16(buf, pos + 10)? as usize;
        let flags = IndexEntryFlags::from_bits_retain(le_u16(buf, pos + 12)?);
        let has_subnode = flags.contains(IndexEntryFlags::HAS_SUBNODE);

        let key_room = entry_length.saturating_sub(if has_subnode { 24 } else { 16 });
        if entry_length < 16 || entry_length % 8 != 0 || pos + entry_length > end {
            log::warn!("NTFS: index entry at {} has length {}", pos, entry_length);
            return Err(NtfsError::Corrupt);
        }

        let subnode_vcn = if has_subnode {
            if entry_length < 24 {
                return Err(NtfsError::Corrupt);
            }
            Some(le_u64(buf, pos + entry_length - 8)?)
        } else {
            None
        };

        let last = flags.contains(IndexEntryFlags::LAST);
        let key = if last {
            None
        } else {
            if key_length < FileName::HEADER_SIZE || key_length > key_room {
                log::warn!("NTFS: index key of {} bytes at {}", key_length, pos);
                return Err(NtfsError::Corrupt);
            }
            Some(FileName::parse(&buf[pos + 16..pos + 16 + key_length])?)
        };

        entries.push(IndexEntry {
            reference: MftRef::from_u64(le_u64(buf, pos)?),
            flags,
            key,
            subnode_vcn,
        });
        if last {
            break;
        }
        pos += entry_length;
    }

    Ok((header, entries))
}

/// Decoded `$INDEX_ROOT` value
#[derive(Debug, Clone)]
pub struct IndexRoot {
    /// Type of the indexed attribute ($FILE_NAME for directories)
    pub indexed_type: u32,
    pub collation_rule: u32,
    /// INDX block size in bytes
    pub index_block_size: u32,
    pub clusters_per_index_block: u8,
    pub header: IndexNodeHeader,
    pub entries: Vec<IndexEntry>,
}

impl IndexRoot {
    pub fn parse(value: &[u8]) -> Result<Self> {
        let (header, entries) = parse_node(value, ROOT_NODE_OFFSET)?;
        Ok(Self {
            indexed_type: le_u32(value, 0)?,
            collation_rule: le_u32(value, 4)?,
            index_block_size: le_u32(value, 8)?,
            clusters_per_index_block: le_u8(value, 12)?,
            header,
            entries,
        })
    }

    /// Check whether entries continue in $INDEX_ALLOCATION
    pub fn is_large(&self) -> bool {
        self.header.flags.contains(IndexNodeFlags::LARGE_INDEX)
    }
}

/// Opened file-name index of one directory
#[derive(Debug, Clone)]
pub struct DirectoryIndex {
    record: u64,
    root: IndexRoot,
    /// $INDEX_ALLOCATION ($I30), present for large indexes
    allocation: Option<Attribute>,
    /// $BITMAP ($I30) value
    bitmap: Vec<u8>,
    /// Bytes addressed by one index VCN
    vcn_size: u64,
}

impl DirectoryIndex {
    /// Open the `$I30` index of a directory
    pub fn open<D: BlockDevice>(mft: &mut Mft<D>, set: &AttributeSet) -> Result<Self> {
        let record = set.reference().file_number();
        if !set.is_directory() {
            return Err(NtfsError::NotADirectory);
        }

        let root_attr = set.find_named(attr_types::INDEX_ROOT, I30).ok_or_else(|| {
            log::warn!("NTFS: directory {} has no $INDEX_ROOT", record);
            NtfsError::Corrupt
        })?;
        let value = root_attr.resident().ok_or_else(|| {
            log::warn!("NTFS: $INDEX_ROOT of {} is non-resident", record);
            NtfsError::Corrupt
        })?;
        let root = IndexRoot::parse(value)?;

        if root.indexed_type != attr_types::FILE_NAME || root.collation_rule != COLLATION_FILE_NAME {
            log::warn!(
                "NTFS: directory {} index type {:#x} collation {:#x}",
                record,
                root.indexed_type,
                root.collation_rule
            );
            return Err(NtfsError::Unsupported);
        }
        let block_size = root.index_block_size;
        if !block_size.is_power_of_two()
            || !(256..=crate::boot::MAX_INDEX_BLOCK_SIZE).contains(&block_size)
        {
            log::warn!("NTFS: directory {} index block size {}", record, block_size);
            return Err(NtfsError::Corrupt);
        }

        let bpc = mft.geometry().bytes_per_cluster;
        let vcn_size = if block_size >= bpc { bpc as u64 } else { 512 };

        let (allocation, bitmap) = if root.is_large() {
            let alloc = set
                .find_named(attr_types::INDEX_ALLOCATION, I30)
                .ok_or_else(|| {
                    log::warn!("NTFS: large directory {} has no $INDEX_ALLOCATION", record);
                    NtfsError::Corrupt
                })?;
            alloc.check_supported()?;
            if alloc.is_resident() {
                return Err(NtfsError::Corrupt);
            }
            let bitmap_attr = set.find_named(attr_types::BITMAP, I30).ok_or_else(|| {
                log::warn!("NTFS: large directory {} has no $BITMAP", record);
                NtfsError::Corrupt
            })?;
            let bitmap = bitmap_attr.read_all(mft, MAX_INDEX_BITMAP_SIZE)?;
            (Some(alloc.clone()), bitmap)
        } else {
            (None, Vec::new())
        };

        Ok(Self {
            record,
            root,
            allocation,
            bitmap,
            vcn_size,
        })
    }

    /// Root node of the index
    pub fn root(&self) -> &IndexRoot {
        &self.root
    }

    fn block_allocated(&self, block: u64) -> bool {
        usize::try_from(block / 8)
            .ok()
            .and_then(|i| self.bitmap.get(i))
            .is_some_and(|&b| (b >> (block % 8)) & 1 == 1)
    }

    /// Read and decode the INDX block at `vcn`
    ///
    /// Returns `None` for a block the bitmap marks free.
    fn read_block<D: BlockDevice>(&self, mft: &mut Mft<D>, vcn: u64) -> Result<Option<Vec<IndexEntry>>> {
        let alloc = self.allocation.as_ref().ok_or_else(|| {
            log::warn!("NTFS: directory {} points at VCN {} without allocation", self.record, vcn);
            NtfsError::Corrupt
        })?;
        let block_size = self.root.index_block_size as u64;
        let offset = vcn.checked_mul(self.vcn_size).ok_or(NtfsError::Corrupt)?;
        if offset % block_size != 0 {
            log::warn!("NTFS: VCN {} is not on an index block boundary", vcn);
            return Err(NtfsError::Corrupt);
        }

        if !self.block_allocated(offset / block_size) {
            log::warn!(
                "NTFS: directory {} references free index block at VCN {}",
                self.record,
                vcn
            );
            return Ok(None);
        }

        let mut buf = value_buffer(block_size as usize)?;
        if alloc.read_at(mft, offset, &mut buf)? != buf.len() {
            log::warn!("NTFS: index block at VCN {} past end of allocation", vcn);
            return Err(NtfsError::Corrupt);
        }
        apply_fixup(&mut buf, INDX_MAGIC).inspect_err(|_| {
            log::warn!("NTFS: index block VCN {} of directory {} failed fixup", vcn, self.record);
        })?;
        let stored = le_u64(&buf, 16)?;
        if stored != vcn {
            log::warn!("NTFS: index block at VCN {} claims VCN {}", vcn, stored);
            return Err(NtfsError::Corrupt);
        }

        let (_, entries) = parse_node(&buf, INDX_NODE_OFFSET)?;
        Ok(Some(entries))
    }

    /// Find the entry whose name collates equal to `name`
    pub fn lookup<D: BlockDevice>(
        &self,
        mft: &mut Mft<D>,
        upcase: &UpcaseTable,
        name: &[u16],
    ) -> Result<IndexEntry> {
        let mut node: Option<Vec<IndexEntry>> = None;
        let mut depth = 0usize;

        loop {
            let entries = node.as_deref().unwrap_or(&self.root.entries[..]);
            let mut descend = None;
            for entry in entries {
                let order = match &entry.key {
                    Some(key) => upcase.collate(name, &key.name),
                    None => Ordering::Less,
                };
                match order {
                    Ordering::Equal => return Ok(entry.clone()),
                    Ordering::Less => {
                        descend = entry.subnode_vcn;
                        break;
                    }
                    Ordering::Greater => {}
                }
            }

            let Some(vcn) = descend else {
                return Err(NtfsError::NotFound);
            };
            depth += 1;
            if depth > MAX_INDEX_DEPTH {
                log::warn!("NTFS: index of directory {} deeper than {}", self.record, MAX_INDEX_DEPTH);
                return Err(NtfsError::Corrupt);
            }
            log::trace!("NTFS: descending to VCN {} of directory {}", vcn, self.record);
            match self.read_block(mft, vcn)? {
                Some(entries) => node = Some(entries),
                None => return Err(NtfsError::NotFound),
            }
        }
    }

    /// Iterate over every entry in collated order
    pub fn entries<'a, D: BlockDevice>(&'a self, mft: &'a mut Mft<D>) -> IndexEntries<'a, D> {
        IndexEntries {
            index: self,
            mft,
            stack: alloc::vec![Frame::new(self.root.entries.clone())],
            visited: BTreeSet::new(),
            failed: false,
        }
    }
}

/// Entries of one node still to be visited
struct Frame {
    entries: Vec<IndexEntry>,
    pos: usize,
    /// Sub-block of `entries[pos]` already walked
    descended: bool,
}

impl Frame {
    fn new(entries: Vec<IndexEntry>) -> Self {
        Self {
            entries,
            pos: 0,
            descended: false,
        }
    }
}

/// In-order walk over a directory index
///
/// Yields key entries (never the terminating ones). After an error the
/// iterator is exhausted.
pub struct IndexEntries<'a, D> {
    index: &'a DirectoryIndex,
    mft: &'a mut Mft<D>,
    stack: Vec<Frame>,
    /// Every sub-block entered so far
    visited: BTreeSet<u64>,
    failed: bool,
}

impl<D: BlockDevice> IndexEntries<'_, D> {
    fn advance(&mut self) -> Result<Option<IndexEntry>> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(entry) = frame.entries.get(frame.pos) else {
                self.stack.pop();
                continue;
            };

            if !frame.descended {
                frame.descended = true;
                if let Some(vcn) = entry.subnode_vcn {
                    if !self.visited.insert(vcn) {
                        log::warn!(
                            "NTFS: index of directory {} revisits VCN {}",
                            self.index.record,
                            vcn
                        );
                        return Err(NtfsError::Corrupt);
                    }
                    if self.stack.len() >= MAX_INDEX_DEPTH {
                        log::warn!(
                            "NTFS: index of directory {} deeper than {}",
                            self.index.record,
                            MAX_INDEX_DEPTH
                        );
                        return Err(NtfsError::Corrupt);
                    }
                    if let Some(child) = self.index.read_block(self.mft, vcn)? {
                        self.stack.push(Frame::new(child));
                    }
                    continue;
                }
            }

            let found = entry.key.is_some().then(|| entry.clone());
            frame.pos += 1;
            frame.descended = false;
            if found.is_some() {
                return Ok(found);
            }
        }
    }
}

impl<D: BlockDevice> Iterator for IndexEntries<'_, D> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
