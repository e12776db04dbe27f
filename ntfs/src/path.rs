//! Path parsing and resolution
//!
//! Paths are `/`-separated ASCII strings. Empty components (`//`, a
//! trailing `/`) are ignored, so `""`, `"/"` and `"//"` all name the root
//! directory. Component matching is case-insensitive through the volume's
//! upcase table.

use alloc::vec::Vec;

use crate::attr::AttributeSet;
use crate::device::BlockDevice;
use crate::error::{NtfsError, Result};
use crate::index::{DirectoryIndex, IndexEntry};
use crate::mft::{well_known_mft, FileRecord, Mft, MftRef};
use crate::name::{to_utf16, UpcaseTable};

/// Maximum number of components in a path
pub const MAX_PATH_DEPTH: usize = 32;

/// Maximum path component length
pub const MAX_COMPONENT: usize = 255;

/// Path separator
pub const PATH_SEPARATOR: char = '/';

/// Parsed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath<'a> {
    components: Vec<&'a str>,
}

impl<'a> ParsedPath<'a> {
    /// Split a path into its non-empty components
    pub fn parse(path: &'a str) -> Result<Self> {
        let mut components = Vec::new();
        for comp in path.split(PATH_SEPARATOR).filter(|c| !c.is_empty()) {
            if comp.contains(':') {
                log::debug!("NTFS: stream syntax in path component {:?}", comp);
                return Err(NtfsError::Unsupported);
            }
            if comp.len() > MAX_COMPONENT {
                return Err(NtfsError::NotFound);
            }
            if components.len() == MAX_PATH_DEPTH {
                log::debug!("NTFS: path deeper than {} components", MAX_PATH_DEPTH);
                return Err(NtfsError::Unsupported);
            }
            components.push(comp);
        }
        Ok(Self { components })
    }

    /// Check if the path names the root directory
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Final component
    pub fn file_name(&self) -> Option<&'a str> {
        self.components.last().copied()
    }

    /// Iterate over components
    pub fn iter(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.components.iter().copied()
    }
}

/// A resolved path: one file or directory with its attributes loaded
#[derive(Debug, Clone)]
pub struct Node {
    pub record: FileRecord,
    pub attrs: AttributeSet,
    /// Directory entry the node was reached through; `None` for the root
    pub entry: Option<IndexEntry>,
}

impl Node {
    /// Load the base record a reference points at
    pub fn open<D: BlockDevice>(mft: &mut Mft<D>, reference: MftRef, entry: Option<IndexEntry>) -> Result<Self> {
        let record = mft.get(reference)?;
        Self::from_record(mft, record, entry)
    }

    /// Load a metafile by its fixed record number
    pub fn open_well_known<D: BlockDevice>(mft: &mut Mft<D>, record_number: u64) -> Result<Self> {
        let record = mft.get_well_known(record_number)?;
        Self::from_record(mft, record, None)
    }

    fn from_record<D: BlockDevice>(mft: &mut Mft<D>, record: FileRecord, entry: Option<IndexEntry>) -> Result<Self> {
        if !record.header().is_base_record() {
            log::warn!("NTFS: reference to extension record {}", record.record_number());
            return Err(NtfsError::Corrupt);
        }
        let attrs = AttributeSet::load(mft, &record)?;
        Ok(Self { record, attrs, entry })
    }

    /// Open the volume root directory
    pub fn root<D: BlockDevice>(mft: &mut Mft<D>) -> Result<Self> {
        let root = Self::open_well_known(mft, well_known_mft::ROOT_DIR)?;
        if !root.is_directory() {
            log::warn!("NTFS: root record is not a directory");
            return Err(NtfsError::Corrupt);
        }
        Ok(root)
    }

    pub fn reference(&self) -> MftRef {
        self.record.reference()
    }

    pub fn is_directory(&self) -> bool {
        self.record.is_directory()
    }
}

/// Walk `path` from the root directory
pub fn resolve<D: BlockDevice>(mft: &mut Mft<D>, upcase: &UpcaseTable, path: &str) -> Result<Node> {
    let parsed = ParsedPath::parse(path)?;
    let mut current = Node::root(mft)?;

    for comp in parsed.iter() {
        if !current.is_directory() {
            return Err(NtfsError::NotADirectory);
        }
        let index = DirectoryIndex::open(mft, &current.attrs)?;
        let entry = index.lookup(mft, upcase, &to_utf16(comp))?;
        current = Node::open(mft, entry.reference, Some(entry))?;
    }

    Ok(current)
}
