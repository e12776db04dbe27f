//! Data Runs (cluster run lists)
//!
//! A non-resident attribute stores its value outside the file record. The
//! mapping from virtual cluster numbers (VCN, relative to the attribute) to
//! logical cluster numbers (LCN, relative to the volume) is encoded as a
//! list of runs:
//!
//! ```text
//! ┌────────┬──────────────────┬───────────────────────┐
//! │ header │ length (L bytes) │ LCN delta (O bytes)   │ ... 0x00
//! └────────┴──────────────────┴───────────────────────┘
//!   header = (O << 4) | L
//!   length  : unsigned cluster count
//!   delta   : signed, relative to the previous run's LCN (first: to 0)
//!   O == 0  : sparse run, no clusters on disk
//! ```
//!
//! Decoded runs carry absolute LCNs. Reads through a run list are bounded
//! by the attribute's data size and never touch clusters outside the list.

use alloc::vec::Vec;

use crate::boot::VolumeGeometry;
use crate::device::{BlockDevice, BlockReader};
use crate::error::{NtfsError, Result};

/// One contiguous run of clusters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataRun {
    /// `length` clusters stored from `lcn` onwards
    Backed { lcn: u64, length: u64 },
    /// `length` clusters with no storage; reads as zeros
    Sparse { length: u64 },
}

impl DataRun {
    /// Number of clusters in this run
    pub fn length(&self) -> u64 {
        match *self {
            DataRun::Backed { length, .. } | DataRun::Sparse { length } => length,
        }
    }
}

/// A run positioned in the attribute's VCN space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// First VCN covered by this run
    pub vcn: u64,
    pub run: DataRun,
}

impl Extent {
    /// One past the last VCN covered
    pub fn end_vcn(&self) -> u64 {
        self.vcn + self.run.length()
    }
}

/// Ordered, absolute run list of one non-resident attribute
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataRunList {
    extents: Vec<Extent>,
    start_vcn: u64,
    next_vcn: u64,
}

/// Read an unsigned little-endian integer of `width` bytes
fn read_unsigned(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Read a sign-extended little-endian integer of `width` bytes
fn read_signed(bytes: &[u8]) -> i64 {
    let raw = read_unsigned(bytes);
    let bits = bytes.len() * 8;
    if bits < 64 && bytes.last().is_some_and(|&b| b & 0x80 != 0) {
        (raw | (!0u64 << bits)) as i64
    } else {
        raw as i64
    }
}

impl DataRunList {
    /// Empty list starting at `start_vcn`
    pub fn empty_at(start_vcn: u64) -> Self {
        Self {
            extents: Vec::new(),
            start_vcn,
            next_vcn: start_vcn,
        }
    }

    /// Decode mapping pairs whose first run begins at `start_vcn`
    pub fn decode(data: &[u8], start_vcn: u64) -> Result<Self> {
        let mut list = Self::empty_at(start_vcn);
        let mut pos = 0usize;
        let mut current_lcn: i64 = 0;

        while pos < data.len() {
            let header = data[pos];
            if header == 0 {
                break;
            }

            let length_size = (header & 0x0F) as usize;
            let offset_size = (header >> 4) as usize;
            pos += 1;

            if length_size == 0 || length_size > 8 || offset_size > 8 {
                log::warn!("NTFS: bad run header {:#04x} at byte {}", header, pos - 1);
                return Err(NtfsError::Corrupt);
            }
            if pos + length_size + offset_size > data.len() {
                log::warn!("NTFS: truncated run at byte {}", pos - 1);
                return Err(NtfsError::Corrupt);
            }

            let length = read_unsigned(&data[pos..pos + length_size]);
            pos += length_size;
            if length == 0 || length > i64::MAX as u64 {
                log::warn!("NTFS: run of {} clusters", length);
                return Err(NtfsError::Corrupt);
            }

            let run = if offset_size == 0 {
                DataRun::Sparse { length }
            } else {
                let delta = read_signed(&data[pos..pos + offset_size]);
                pos += offset_size;
                current_lcn = current_lcn.checked_add(delta).ok_or(NtfsError::Corrupt)?;
                if current_lcn < 0 {
                    log::warn!("NTFS: run resolves to negative LCN {}", current_lcn);
                    return Err(NtfsError::Corrupt);
                }
                DataRun::Backed { lcn: current_lcn as u64, length }
            };

            list.push(run)?;
        }

        Ok(list)
    }

    fn push(&mut self, run: DataRun) -> Result<()> {
        let end = self
            .next_vcn
            .checked_add(run.length())
            .ok_or(NtfsError::Corrupt)?;
        self.extents.push(Extent { vcn: self.next_vcn, run });
        self.next_vcn = end;
        Ok(())
    }

    /// Append a later fragment of the same attribute
    ///
    /// The fragment must start exactly where this list ends.
    pub fn append(&mut self, other: DataRunList) -> Result<()> {
        if other.start_vcn != self.next_vcn {
            log::warn!(
                "NTFS: run fragment starts at VCN {}, expected {}",
                other.start_vcn,
                self.next_vcn
            );
            return Err(NtfsError::Corrupt);
        }
        for ext in other.extents {
            self.push(ext.run)?;
        }
        Ok(())
    }

    /// First VCN mapped by this list
    pub fn start_vcn(&self) -> u64 {
        self.start_vcn
    }

    /// One past the last VCN mapped by this list
    pub fn next_vcn(&self) -> u64 {
        self.next_vcn
    }

    /// Total clusters covered, sparse runs included
    pub fn total_clusters(&self) -> u64 {
        self.next_vcn - self.start_vcn
    }

    /// Get number of runs
    pub fn count(&self) -> usize {
        self.extents.len()
    }

    /// Iterate over runs in VCN order
    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.extents.iter()
    }

    /// Find the extent containing a given VCN
    pub fn find_vcn(&self, vcn: u64) -> Option<&Extent> {
        let idx = self.extents.partition_point(|e| e.end_vcn() <= vcn);
        self.extents.get(idx).filter(|e| e.vcn <= vcn)
    }

    /// Check every backed run lies inside the volume
    pub fn validate(&self, total_clusters: u64) -> Result<()> {
        for ext in &self.extents {
            if let DataRun::Backed { lcn, length } = ext.run {
                if lcn.checked_add(length).map_or(true, |end| end > total_clusters) {
                    log::warn!(
                        "NTFS: run at LCN {} (+{}) beyond volume end {}",
                        lcn,
                        length,
                        total_clusters
                    );
                    return Err(NtfsError::Corrupt);
                }
            }
        }
        Ok(())
    }
}

/// A non-resident byte stream: run list plus its sizes
#[derive(Clone, Copy, Debug)]
pub struct RunStream<'a> {
    pub runs: &'a DataRunList,
    /// Logical size of the stream
    pub data_size: u64,
    /// Bytes at or past this offset read as zero
    pub initialized_size: u64,
}

impl<'a> RunStream<'a> {
    pub fn new(runs: &'a DataRunList, data_size: u64, initialized_size: u64) -> Self {
        Self {
            runs,
            data_size,
            initialized_size: initialized_size.min(data_size),
        }
    }

    /// Read from byte `offset` of the stream into `buf`
    ///
    /// Returns the number of bytes produced, which is short only when the
    /// request crosses the end of the stream.
    pub fn read_at<D: BlockDevice>(
        &self,
        reader: &mut BlockReader<D>,
        geo: &VolumeGeometry,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if offset >= self.data_size {
            return Ok(0);
        }
        let end = offset
            .saturating_add(buf.len() as u64)
            .min(self.data_size);
        let valid_end = end.min(self.initialized_size.max(offset));
        let bpc = geo.bytes_per_cluster as u64;

        let mut pos = offset;
        while pos < valid_end {
            let vcn = pos / bpc;
            let ext = self.runs.find_vcn(vcn).ok_or_else(|| {
                log::warn!("NTFS: VCN {} not mapped by run list", vcn);
                NtfsError::Corrupt
            })?;
            let chunk_end = valid_end.min(ext.end_vcn().saturating_mul(bpc));
            let dst = &mut buf[(pos - offset) as usize..(chunk_end - offset) as usize];

            match ext.run {
                DataRun::Sparse { .. } => dst.fill(0),
                DataRun::Backed { lcn, length } => {
                    if lcn.saturating_add(length) > geo.total_clusters {
                        log::warn!("NTFS: run at LCN {} beyond volume end", lcn);
                        return Err(NtfsError::Corrupt);
                    }
                    let disk = geo.cluster_offset(lcn + (vcn - ext.vcn)) + pos % bpc;
                    reader.read_bytes(disk, dst)?;
                }
            }
            pos = chunk_end;
        }

        let produced = (end - offset) as usize;
        buf[(valid_end - offset) as usize..produced].fill(0);
        Ok(produced)
    }
}
