//! In-memory NTFS image builder and RAM block device for integration tests
//!
//! Layout: 512-byte sectors, 4096-byte clusters, 1024-byte records and
//! 4096-byte index blocks. Metafiles live in their well-known records
//! (0 $MFT, 3 $Volume, 5 root, 6 $Bitmap, 10 $UpCase); user records start
//! at 16. Directory indexes are real $I30 B+ trees: small directories stay
//! in $INDEX_ROOT, larger ones spill into fixup-protected INDX blocks.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use ntfs_ro::{attr_types, BlockDevice, MftRef, NtfsError, NtfsVolume, Result};

pub const SECTOR: usize = 512;
pub const CLUSTER: usize = 4096;
pub const RECORD: usize = 1024;
pub const INDEX_BLOCK: usize = 4096;
pub const MFT_LCN: u64 = 4;
pub const SERIAL: u64 = 0x1234_5678_9ABC_DEF0;
pub const ROOT: u64 = 5;

pub const POSIX: u8 = 0;
pub const WIN32: u8 = 1;
pub const DOS: u8 = 2;
pub const WIN32_AND_DOS: u8 = 3;

/// Attribute header flag bits
pub const ATTR_COMPRESSED: u16 = 0x0001;
pub const ATTR_ENCRYPTED: u16 = 0x4000;
pub const ATTR_SPARSE: u16 = 0x8000;

const FIRST_USER_RECORD: u64 = 16;
const MFT_EXTENSION_RECORD: u64 = 15;
/// Bytes of index entries kept in $INDEX_ROOT before spilling to INDX blocks
const ROOT_BUDGET: usize = 400;
/// Largest file stored resident
const RESIDENT_LIMIT: usize = 512;
const TIME: u64 = 0x01D9_0000_0000_0000;

// ============================================================================
// RAM block device
// ============================================================================

pub struct RamDisk {
    data: Vec<u8>,
    block_size: usize,
    fail: Rc<Cell<bool>>,
}

impl RamDisk {
    pub fn new(data: Vec<u8>, block_size: usize) -> Self {
        Self {
            data,
            block_size,
            fail: Rc::new(Cell::new(false)),
        }
    }

    /// Shared switch that makes every read fail while set
    pub fn fail_switch(&self) -> Rc<Cell<bool>> {
        self.fail.clone()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for RamDisk {
    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        if self.fail.get() {
            return Err(NtfsError::Io);
        }
        let start = lba as usize * self.block_size;
        let len = count as usize * self.block_size;
        assert_eq!(buf.len(), len, "driver passed a mis-sized buffer");
        let src = self.data.get(start..start + len).ok_or(NtfsError::Io)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

pub fn utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

fn put16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_units(buf: &mut [u8], off: usize, units: &[u16]) {
    for (i, u) in units.iter().enumerate() {
        put16(buf, off + i * 2, *u);
    }
}

/// Fold used to sort index entries (matches the $UpCase table written)
fn fold(units: &[u16]) -> Vec<u16> {
    units
        .iter()
        .map(|&u| if (0x61..=0x7A).contains(&u) { u - 0x20 } else { u })
        .collect()
}

/// Write the update sequence array: save every sector tail, stamp `usn`
pub fn protect(buf: &mut [u8], usa_offset: usize, usn: u16) {
    let sectors = buf.len() / SECTOR;
    put16(buf, usa_offset, usn);
    for s in 0..sectors {
        let tail = (s + 1) * SECTOR - 2;
        let saved = usa_offset + 2 + s * 2;
        let orig = [buf[tail], buf[tail + 1]];
        buf[saved..saved + 2].copy_from_slice(&orig);
        put16(buf, tail, usn);
    }
}

/// Undo [`protect`], restoring the saved sector tails
pub fn unprotect(buf: &mut [u8]) -> u16 {
    let usa_offset = u16::from_le_bytes([buf[4], buf[5]]) as usize;
    let usn = u16::from_le_bytes([buf[usa_offset], buf[usa_offset + 1]]);
    let sectors = buf.len() / SECTOR;
    for s in 0..sectors {
        let tail = (s + 1) * SECTOR - 2;
        let saved = usa_offset + 2 + s * 2;
        buf.copy_within(saved..saved + 2, tail);
    }
    usn
}

fn unsigned_bytes(v: u64) -> Vec<u8> {
    let mut bytes = v.to_le_bytes().to_vec();
    while bytes.len() > 1 && *bytes.last().unwrap() == 0 {
        bytes.pop();
    }
    bytes
}

fn signed_bytes(v: i64) -> Vec<u8> {
    for n in 1..=8usize {
        let bits = 8 * n as u32 - 1;
        let lo = if bits == 63 { i64::MIN } else { -(1i64 << bits) };
        let hi = if bits == 63 { i64::MAX } else { (1i64 << bits) - 1 };
        if v >= lo && v <= hi {
            return v.to_le_bytes()[..n].to_vec();
        }
    }
    unreachable!()
}

/// Mapping pairs for `(lcn, clusters)` runs; `None` is a hole
pub fn encode_runs(runs: &[(Option<u64>, u64)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev: i64 = 0;
    for &(lcn, len) in runs {
        let len_bytes = unsigned_bytes(len);
        match lcn {
            Some(lcn) => {
                let off_bytes = signed_bytes(lcn as i64 - prev);
                out.push(((off_bytes.len() << 4) | len_bytes.len()) as u8);
                out.extend_from_slice(&len_bytes);
                out.extend_from_slice(&off_bytes);
                prev = lcn as i64;
            }
            None => {
                out.push(len_bytes.len() as u8);
                out.extend_from_slice(&len_bytes);
            }
        }
    }
    out.push(0);
    out
}

fn resident_attr(type_code: u32, name: &str, value: &[u8], indexed: bool) -> Vec<u8> {
    let name = utf16(name);
    let value_off = align8(24 + name.len() * 2);
    let len = align8(value_off + value.len());
    let mut a = vec![0u8; len];
    put32(&mut a, 0, type_code);
    put32(&mut a, 4, len as u32);
    a[9] = name.len() as u8;
    put16(&mut a, 10, 24);
    put32(&mut a, 16, value.len() as u32);
    put16(&mut a, 20, value_off as u16);
    a[22] = indexed as u8;
    put_units(&mut a, 24, &name);
    a[value_off..value_off + value.len()].copy_from_slice(value);
    a
}

/// A non-resident stream fragment
#[derive(Clone, Debug)]
struct Stream {
    runs: Vec<(Option<u64>, u64)>,
    start_vcn: u64,
    allocated: u64,
    size: u64,
    initialized: u64,
    flags: u16,
}

impl Stream {
    fn clusters(&self) -> u64 {
        self.runs.iter().map(|r| r.1).sum()
    }
}

fn non_resident_attr(type_code: u32, name: &str, s: &Stream) -> Vec<u8> {
    let name = utf16(name);
    let runs_off = align8(64 + name.len() * 2);
    let runs = encode_runs(&s.runs);
    let len = align8(runs_off + runs.len());
    let mut a = vec![0u8; len];
    put32(&mut a, 0, type_code);
    put32(&mut a, 4, len as u32);
    a[8] = 1;
    a[9] = name.len() as u8;
    put16(&mut a, 10, 64);
    put16(&mut a, 12, s.flags);
    put64(&mut a, 16, s.start_vcn);
    put64(&mut a, 24, s.start_vcn + s.clusters() - 1);
    put16(&mut a, 32, runs_off as u16);
    put64(&mut a, 40, s.allocated);
    put64(&mut a, 48, s.size);
    put64(&mut a, 56, s.initialized);
    put_units(&mut a, 64, &name);
    a[runs_off..runs_off + runs.len()].copy_from_slice(&runs);
    a
}

fn standard_information(n: u64, is_dir: bool) -> Vec<u8> {
    let mut v = vec![0u8; 72];
    for i in 0..4 {
        put64(&mut v, i * 8, TIME + n * 16 + i as u64);
    }
    put32(&mut v, 32, if is_dir { 0 } else { 0x20 });
    v
}

fn file_name_value(parent: MftRef, name: &[u16], namespace: u8, is_dir: bool, size: u64) -> Vec<u8> {
    let mut v = vec![0u8; 66 + name.len() * 2];
    put64(&mut v, 0, parent.to_u64());
    for i in 0..4 {
        put64(&mut v, 8 + i * 8, TIME + i as u64);
    }
    if !is_dir {
        put64(&mut v, 40, size.div_ceil(CLUSTER as u64) * CLUSTER as u64);
        put64(&mut v, 48, size);
    }
    put32(&mut v, 56, if is_dir { 0x1000_0000 } else { 0x20 });
    v[64] = name.len() as u8;
    v[65] = namespace;
    put_units(&mut v, 66, name);
    v
}

fn index_entry(reference: MftRef, key: &[u8], child: Option<u64>) -> Vec<u8> {
    let mut len = align8(16 + key.len());
    if child.is_some() {
        len += 8;
    }
    let mut e = vec![0u8; len];
    put64(&mut e, 0, reference.to_u64());
    put16(&mut e, 8, len as u16);
    put16(&mut e, 10, key.len() as u16);
    put16(&mut e, 12, if child.is_some() { 1 } else { 0 });
    e[16..16 + key.len()].copy_from_slice(key);
    if let Some(vcn) = child {
        put64(&mut e, len - 8, vcn);
    }
    e
}

fn last_entry(child: Option<u64>) -> Vec<u8> {
    let len = if child.is_some() { 24 } else { 16 };
    let mut e = vec![0u8; len];
    put16(&mut e, 8, len as u16);
    put16(&mut e, 12, 2 | if child.is_some() { 1 } else { 0 });
    if let Some(vcn) = child {
        put64(&mut e, 16, vcn);
    }
    e
}

/// One entry of a directory index under construction
#[derive(Clone)]
struct Item {
    reference: MftRef,
    key: Vec<u8>,
    child: Option<u64>,
}

fn encode_node(items: &[Item], last_child: Option<u64>) -> Vec<u8> {
    let mut body = Vec::new();
    for item in items {
        body.extend_from_slice(&index_entry(item.reference, &item.key, item.child));
    }
    body.extend_from_slice(&last_entry(last_child));
    body
}

fn node_has_children(items: &[Item], last_child: Option<u64>) -> bool {
    last_child.is_some() || items.iter().any(|i| i.child.is_some())
}

fn encode_index_block(vcn: u64, items: &[Item], last_child: Option<u64>) -> Vec<u8> {
    let mut b = vec![0u8; INDEX_BLOCK];
    b[0..4].copy_from_slice(b"INDX");
    put16(&mut b, 4, 40);
    put16(&mut b, 6, (INDEX_BLOCK / SECTOR + 1) as u16);
    put64(&mut b, 16, vcn);
    let body = encode_node(items, last_child);
    assert!(64 + body.len() <= INDEX_BLOCK, "index block overflow");
    put32(&mut b, 24, 40);
    put32(&mut b, 28, (40 + body.len()) as u32);
    put32(&mut b, 32, (INDEX_BLOCK - 24) as u32);
    b[36] = node_has_children(items, last_child) as u8;
    b[64..64 + body.len()].copy_from_slice(&body);
    protect(&mut b, 40, 0x0100 + vcn as u16);
    b
}

fn upcase_table() -> Vec<u8> {
    let mut raw = vec![0u8; 65536 * 2];
    for i in 0..65536usize {
        let u = i as u16;
        let up = if (0x61..=0x7A).contains(&u) { u - 0x20 } else { u };
        put16(&mut raw, i * 2, up);
    }
    raw
}

// ============================================================================
// Image builder
// ============================================================================

/// Piece of a multi-run file
#[derive(Clone, Debug)]
pub enum Segment {
    /// Bytes stored in freshly allocated clusters (one run)
    Data(Vec<u8>),
    /// Clusters with no storage
    Hole(u64),
}

/// Placement of the $MFT itself
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MftLayout {
    Contiguous,
    /// Two runs, both listed in record 0
    Fragmented,
    /// Two runs, the second held by an extension record via $ATTRIBUTE_LIST
    FragmentedWithList,
}

struct Link {
    parent: u64,
    name: Vec<u16>,
    namespace: u8,
    target: u64,
    indexed: bool,
}

enum Data {
    None,
    Resident(Vec<u8>),
    NonResident(Stream),
}

struct RecordSpec {
    seq: u16,
    is_dir: bool,
    base: Option<u64>,
    data: Data,
    extensions: Vec<u64>,
    /// $ATTRIBUTE_LIST moved out of the record when it outgrows it
    list: Option<Stream>,
    extra: Vec<(u32, Vec<u8>)>,
}

impl RecordSpec {
    fn new(seq: u16, is_dir: bool) -> Self {
        Self {
            seq,
            is_dir,
            base: None,
            data: Data::None,
            extensions: Vec::new(),
            list: None,
            extra: Vec::new(),
        }
    }
}

pub struct ImageBuilder {
    total_clusters: u64,
    mft_records: u64,
    mft_extents: Vec<(u64, u64)>,
    image: Vec<u8>,
    allocated: Vec<bool>,
    next_cluster: u64,
    next_record: u64,
    records: BTreeMap<u64, RecordSpec>,
    links: Vec<Link>,
    label: Option<Vec<u16>>,
    upcase: bool,
    /// Entries per INDX block when a directory spills out of its root
    pub entries_per_block: usize,
    dir_blocks: BTreeMap<u64, Vec<usize>>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// 16 MiB volume, 128-record contiguous MFT
    pub fn new() -> Self {
        Self::with_layout(4096, 128, MftLayout::Contiguous)
    }

    pub fn with_layout(total_clusters: u64, mft_records: u64, layout: MftLayout) -> Self {
        let mut b = Self {
            total_clusters,
            mft_records,
            mft_extents: Vec::new(),
            image: vec![0u8; total_clusters as usize * CLUSTER],
            allocated: vec![false; total_clusters as usize],
            next_cluster: MFT_LCN,
            next_record: FIRST_USER_RECORD,
            records: BTreeMap::new(),
            links: Vec::new(),
            label: None,
            upcase: true,
            entries_per_block: 16,
            dir_blocks: BTreeMap::new(),
        };
        b.allocated[0] = true;

        let mft_clusters = mft_records * RECORD as u64 / CLUSTER as u64;
        let mft_bytes = mft_records * RECORD as u64;
        match layout {
            MftLayout::Contiguous => {
                let lcn = b.alloc(mft_clusters);
                b.mft_extents.push((lcn, mft_clusters));
            }
            MftLayout::Fragmented | MftLayout::FragmentedWithList => {
                let first = b.alloc(4);
                b.gap(3);
                let rest = b.alloc(mft_clusters - 4);
                b.mft_extents.push((first, 4));
                b.mft_extents.push((rest, mft_clusters - 4));
            }
        }

        let mut mft = RecordSpec::new(1, false);
        if layout == MftLayout::FragmentedWithList {
            let (first, _) = b.mft_extents[0];
            let (rest, rest_len) = b.mft_extents[1];
            mft.data = Data::NonResident(Stream {
                runs: vec![(Some(first), 4)],
                start_vcn: 0,
                allocated: mft_bytes,
                size: mft_bytes,
                initialized: mft_bytes,
                flags: 0,
            });
            mft.extensions.push(MFT_EXTENSION_RECORD);
            let mut ext = RecordSpec::new(MFT_EXTENSION_RECORD as u16, false);
            ext.base = Some(0);
            ext.data = Data::NonResident(Stream {
                runs: vec![(Some(rest), rest_len)],
                start_vcn: 4,
                allocated: 0,
                size: 0,
                initialized: 0,
                flags: 0,
            });
            b.records.insert(MFT_EXTENSION_RECORD, ext);
        } else {
            mft.data = Data::NonResident(Stream {
                runs: b.mft_extents.iter().map(|&(l, n)| (Some(l), n)).collect(),
                start_vcn: 0,
                allocated: mft_bytes,
                size: mft_bytes,
                initialized: mft_bytes,
                flags: 0,
            });
        }
        b.records.insert(0, mft);
        b.name_metafile(0, "$MFT");

        let mut volume = RecordSpec::new(3, false);
        volume.data = Data::Resident(Vec::new());
        b.records.insert(3, volume);
        b.name_metafile(3, "$Volume");

        b.records.insert(ROOT, RecordSpec::new(5, true));
        b.links.push(Link {
            parent: ROOT,
            name: utf16("."),
            namespace: WIN32_AND_DOS,
            target: ROOT,
            indexed: true,
        });

        b.records.insert(6, RecordSpec::new(6, false));
        b.name_metafile(6, "$Bitmap");
        b.records.insert(10, RecordSpec::new(10, false));
        b.name_metafile(10, "$UpCase");
        b
    }

    fn name_metafile(&mut self, n: u64, name: &str) {
        self.links.push(Link {
            parent: ROOT,
            name: utf16(name),
            namespace: WIN32_AND_DOS,
            target: n,
            indexed: false,
        });
    }

    /// Allocate `n` contiguous clusters
    pub fn alloc(&mut self, n: u64) -> u64 {
        let lcn = self.next_cluster;
        assert!(lcn + n <= self.total_clusters, "image full");
        for c in lcn..lcn + n {
            self.allocated[c as usize] = true;
        }
        self.next_cluster += n;
        lcn
    }

    /// Leave `n` clusters free
    pub fn gap(&mut self, n: u64) {
        self.next_cluster += n;
    }

    fn write_clusters(&mut self, lcn: u64, data: &[u8]) {
        let off = lcn as usize * CLUSTER;
        self.image[off..off + data.len()].copy_from_slice(data);
    }

    fn new_record(&mut self, is_dir: bool) -> u64 {
        let n = self.next_record;
        assert!(n < self.mft_records, "MFT full");
        self.next_record += 1;
        self.records.insert(n, RecordSpec::new((n % 5 + 1) as u16, is_dir));
        n
    }

    fn link(&mut self, parent: u64, name: &str, namespace: u8, target: u64) {
        assert!(self.records[&parent].is_dir, "parent is not a directory");
        self.links.push(Link {
            parent,
            name: utf16(name),
            namespace,
            target,
            indexed: true,
        });
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = Some(utf16(label));
    }

    pub fn set_label_units(&mut self, units: &[u16]) {
        self.label = Some(units.to_vec());
    }

    /// Leave record 10 empty so the driver must fall back
    pub fn without_upcase(&mut self) {
        self.upcase = false;
        self.records.remove(&10);
    }

    pub fn add_dir(&mut self, parent: u64, name: &str) -> u64 {
        let n = self.new_record(true);
        self.link(parent, name, WIN32, n);
        n
    }

    /// Small files stay resident; larger ones get one contiguous run
    pub fn add_file(&mut self, parent: u64, name: &str, content: &[u8]) -> u64 {
        if content.len() <= RESIDENT_LIMIT {
            let n = self.new_record(false);
            self.records.get_mut(&n).unwrap().data = Data::Resident(content.to_vec());
            self.link(parent, name, WIN32, n);
            n
        } else {
            self.add_file_flagged(parent, name, content, 0)
        }
    }

    /// Non-resident file with the given attribute flags
    pub fn add_file_flagged(&mut self, parent: u64, name: &str, content: &[u8], flags: u16) -> u64 {
        let clusters = (content.len() as u64).div_ceil(CLUSTER as u64).max(1);
        let lcn = self.alloc(clusters);
        self.write_clusters(lcn, content);
        let n = self.new_record(false);
        self.records.get_mut(&n).unwrap().data = Data::NonResident(Stream {
            runs: vec![(Some(lcn), clusters)],
            start_vcn: 0,
            allocated: clusters * CLUSTER as u64,
            size: content.len() as u64,
            initialized: content.len() as u64,
            flags,
        });
        self.link(parent, name, WIN32, n);
        n
    }

    /// File assembled from data runs and holes, each data run placed after
    /// a free cluster so runs are never adjacent
    pub fn add_file_segments(
        &mut self,
        parent: u64,
        name: &str,
        segments: &[Segment],
        size: u64,
        initialized: u64,
    ) -> u64 {
        let mut runs = Vec::new();
        for seg in segments {
            match seg {
                Segment::Data(bytes) => {
                    let clusters = (bytes.len() as u64).div_ceil(CLUSTER as u64);
                    self.gap(1);
                    let lcn = self.alloc(clusters);
                    self.write_clusters(lcn, bytes);
                    runs.push((Some(lcn), clusters));
                }
                Segment::Hole(clusters) => runs.push((None, *clusters)),
            }
        }
        let clusters: u64 = runs.iter().map(|r| r.1).sum();
        let n = self.new_record(false);
        self.records.get_mut(&n).unwrap().data = Data::NonResident(Stream {
            runs,
            start_vcn: 0,
            allocated: clusters * CLUSTER as u64,
            size,
            initialized,
            flags: 0,
        });
        self.link(parent, name, WIN32, n);
        n
    }

    /// File whose $DATA is split over `pieces` extension records listed by
    /// an $ATTRIBUTE_LIST in the base record
    pub fn add_file_split(&mut self, parent: u64, name: &str, content: &[u8], pieces: usize) -> u64 {
        let clusters = (content.len() as u64).div_ceil(CLUSTER as u64);
        assert!(pieces >= 1 && clusters >= pieces as u64);
        let base = self.new_record(false);

        let per = clusters / pieces as u64;
        let mut vcn = 0u64;
        for i in 0..pieces {
            let len = if i + 1 == pieces { clusters - vcn } else { per };
            self.gap(1);
            let lcn = self.alloc(len);
            let start = vcn as usize * CLUSTER;
            let end = ((vcn + len) as usize * CLUSTER).min(content.len());
            self.write_clusters(lcn, &content[start..end]);

            let ext = self.new_record(false);
            let first = i == 0;
            let spec = self.records.get_mut(&ext).unwrap();
            spec.base = Some(base);
            spec.data = Data::NonResident(Stream {
                runs: vec![(Some(lcn), len)],
                start_vcn: vcn,
                allocated: if first { clusters * CLUSTER as u64 } else { 0 },
                size: if first { content.len() as u64 } else { 0 },
                initialized: if first { content.len() as u64 } else { 0 },
                flags: 0,
            });
            self.records.get_mut(&base).unwrap().extensions.push(ext);
            vcn += len;
        }

        self.link(parent, name, WIN32, base);
        base
    }

    /// Extra name for an existing file or directory
    pub fn add_link(&mut self, parent: u64, target: u64, name: &str, namespace: u8) {
        self.link(parent, name, namespace, target);
    }

    fn seq(&self, n: u64) -> u16 {
        self.records[&n].seq
    }

    fn reference(&self, n: u64) -> MftRef {
        MftRef::new(n, self.seq(n))
    }

    /// Logical size of a record's unnamed data
    fn data_size(&self, n: u64) -> u64 {
        let spec = &self.records[&n];
        match &spec.data {
            Data::Resident(bytes) => bytes.len() as u64,
            Data::NonResident(s) if s.start_vcn == 0 => s.size,
            _ => spec
                .extensions
                .iter()
                .filter_map(|e| match &self.records[e].data {
                    Data::NonResident(s) if s.start_vcn == 0 => Some(s.size),
                    _ => None,
                })
                .next()
                .unwrap_or(0),
        }
    }

    fn build_index(&mut self, dir: u64) {
        let dir_ref = self.reference(dir);
        let mut items: Vec<Item> = self
            .links
            .iter()
            .filter(|l| l.parent == dir && l.indexed)
            .map(|l| {
                let is_dir = self.records[&l.target].is_dir;
                let size = if is_dir { 0 } else { self.data_size(l.target) };
                Item {
                    reference: self.reference(l.target),
                    key: file_name_value(dir_ref, &l.name, l.namespace, is_dir, size),
                    child: None,
                }
            })
            .collect();
        items.sort_by_cached_key(|item| {
            let len = item.key[64] as usize;
            let units: Vec<u16> = item.key[66..66 + len * 2]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            fold(&units)
        });

        let fits = |items: &[Item], last: Option<u64>| encode_node(items, last).len() <= ROOT_BUDGET;
        let mut last_child = None;
        let mut blocks: Vec<Vec<u8>> = Vec::new();
        let per = self.entries_per_block.max(1);
        while !fits(&items, last_child) {
            let mut up = Vec::new();
            let mut group: Vec<Item> = Vec::new();
            for item in items {
                if group.len() == per {
                    let vcn = blocks.len() as u64;
                    blocks.push(encode_index_block(vcn, &group, item.child));
                    group.clear();
                    up.push(Item {
                        child: Some(vcn),
                        ..item
                    });
                } else {
                    group.push(item);
                }
            }
            let vcn = blocks.len() as u64;
            blocks.push(encode_index_block(vcn, &group, last_child));
            items = up;
            last_child = Some(vcn);
        }

        let body = encode_node(&items, last_child);
        let mut root = vec![0u8; 32];
        put32(&mut root, 0, attr_types::FILE_NAME);
        put32(&mut root, 4, 1);
        put32(&mut root, 8, INDEX_BLOCK as u32);
        root[12] = (INDEX_BLOCK / CLUSTER) as u8;
        put32(&mut root, 16, 16);
        put32(&mut root, 20, (16 + body.len()) as u32);
        put32(&mut root, 24, (16 + body.len()) as u32);
        root[28] = node_has_children(&items, last_child) as u8;
        root.extend_from_slice(&body);

        let mut extra = vec![(
            attr_types::INDEX_ROOT,
            resident_attr(attr_types::INDEX_ROOT, "$I30", &root, false),
        )];

        if !blocks.is_empty() {
            let nblocks = blocks.len() as u64;
            let lcn = self.alloc(nblocks);
            let mut offsets = Vec::new();
            for (i, block) in blocks.iter().enumerate() {
                self.write_clusters(lcn + i as u64, block);
                offsets.push((lcn as usize + i) * CLUSTER);
            }
            self.dir_blocks.insert(dir, offsets);

            let stream = Stream {
                runs: vec![(Some(lcn), nblocks)],
                start_vcn: 0,
                allocated: nblocks * CLUSTER as u64,
                size: nblocks * INDEX_BLOCK as u64,
                initialized: nblocks * INDEX_BLOCK as u64,
                flags: 0,
            };
            extra.push((
                attr_types::INDEX_ALLOCATION,
                non_resident_attr(attr_types::INDEX_ALLOCATION, "$I30", &stream),
            ));

            let mut bitmap = vec![0u8; align8((blocks.len() + 7) / 8)];
            for i in 0..blocks.len() {
                bitmap[i / 8] |= 1 << (i % 8);
            }
            extra.push((
                attr_types::BITMAP,
                resident_attr(attr_types::BITMAP, "$I30", &bitmap, false),
            ));
        }

        self.records.get_mut(&dir).unwrap().extra.extend(extra);
    }

    fn attribute_list(&self, n: u64, spec: &RecordSpec) -> Vec<u8> {
        let entry = |type_code: u32, start_vcn: u64, reference: MftRef| {
            let mut e = vec![0u8; 32];
            put32(&mut e, 0, type_code);
            put16(&mut e, 4, 32);
            e[7] = 26;
            put64(&mut e, 8, start_vcn);
            put64(&mut e, 16, reference.to_u64());
            e
        };
        let me = self.reference(n);
        let mut v = entry(attr_types::STANDARD_INFORMATION, 0, me);
        for _ in self.links.iter().filter(|l| l.target == n) {
            v.extend(entry(attr_types::FILE_NAME, 0, me));
        }
        if let Data::NonResident(s) = &spec.data {
            v.extend(entry(attr_types::DATA, s.start_vcn, me));
        }
        for &ext in &spec.extensions {
            if let Data::NonResident(s) = &self.records[&ext].data {
                v.extend(entry(attr_types::DATA, s.start_vcn, self.reference(ext)));
            }
        }
        v
    }

    fn encode_record(&self, n: u64, spec: &RecordSpec) -> Vec<u8> {
        let mut attrs: Vec<(u32, Vec<u8>)> = Vec::new();
        let names: Vec<&Link> = self.links.iter().filter(|l| l.target == n).collect();

        if spec.base.is_none() {
            attrs.push((
                attr_types::STANDARD_INFORMATION,
                resident_attr(attr_types::STANDARD_INFORMATION, "", &standard_information(n, spec.is_dir), false),
            ));
            if let Some(list) = &spec.list {
                attrs.push((
                    attr_types::ATTRIBUTE_LIST,
                    non_resident_attr(attr_types::ATTRIBUTE_LIST, "", list),
                ));
            } else if !spec.extensions.is_empty() {
                attrs.push((
                    attr_types::ATTRIBUTE_LIST,
                    resident_attr(attr_types::ATTRIBUTE_LIST, "", &self.attribute_list(n, spec), false),
                ));
            }
            let size = self.data_size(n);
            for link in &names {
                let value = file_name_value(self.reference(link.parent), &link.name, link.namespace, spec.is_dir, size);
                attrs.push((attr_types::FILE_NAME, resident_attr(attr_types::FILE_NAME, "", &value, true)));
            }
        }
        attrs.extend(spec.extra.iter().cloned());
        match &spec.data {
            Data::None => {}
            Data::Resident(bytes) => {
                attrs.push((attr_types::DATA, resident_attr(attr_types::DATA, "", bytes, false)));
            }
            Data::NonResident(s) => {
                attrs.push((attr_types::DATA, non_resident_attr(attr_types::DATA, "", s)));
            }
        }
        attrs.sort_by_key(|a| a.0);

        let mut buf = vec![0u8; RECORD];
        let mut off = 56;
        for (i, (_, a)) in attrs.iter().enumerate() {
            assert!(off + a.len() + 8 <= RECORD, "record {} overflows", n);
            buf[off..off + a.len()].copy_from_slice(a);
            put16(&mut buf, off + 14, i as u16);
            off += a.len();
        }
        put32(&mut buf, off, attr_types::END);
        let used = off + 8;

        buf[0..4].copy_from_slice(b"FILE");
        put16(&mut buf, 4, 48);
        put16(&mut buf, 6, (RECORD / SECTOR + 1) as u16);
        put16(&mut buf, 16, spec.seq);
        put16(&mut buf, 18, names.len() as u16);
        put16(&mut buf, 20, 56);
        put16(&mut buf, 22, 1 | if spec.is_dir { 2 } else { 0 });
        put32(&mut buf, 24, used as u32);
        put32(&mut buf, 28, RECORD as u32);
        if let Some(base) = spec.base {
            put64(&mut buf, 32, self.reference(base).to_u64());
        }
        put16(&mut buf, 40, attrs.len() as u16);
        put32(&mut buf, 44, n as u32);
        protect(&mut buf, 48, (n as u16).wrapping_add(1));
        buf
    }

    pub fn finish(mut self) -> Image {
        let dirs: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, s)| s.is_dir)
            .map(|(&n, _)| n)
            .collect();
        for dir in dirs {
            self.build_index(dir);
        }

        let split: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, s)| !s.extensions.is_empty())
            .map(|(&n, _)| n)
            .collect();
        for n in split {
            let value = self.attribute_list(n, &self.records[&n]);
            if value.len() <= RESIDENT_LIMIT {
                continue;
            }
            let clusters = (value.len() as u64).div_ceil(CLUSTER as u64);
            let lcn = self.alloc(clusters);
            self.write_clusters(lcn, &value);
            self.records.get_mut(&n).unwrap().list = Some(Stream {
                runs: vec![(Some(lcn), clusters)],
                start_vcn: 0,
                allocated: clusters * CLUSTER as u64,
                size: value.len() as u64,
                initialized: value.len() as u64,
                flags: 0,
            });
        }

        if let Some(label) = self.label.clone() {
            let value: Vec<u8> = label.iter().flat_map(|u| u.to_le_bytes()).collect();
            self.records
                .get_mut(&3)
                .unwrap()
                .extra
                .push((attr_types::VOLUME_NAME, resident_attr(attr_types::VOLUME_NAME, "", &value, false)));
        }

        if self.upcase {
            let raw = upcase_table();
            let clusters = (raw.len() / CLUSTER) as u64;
            let lcn = self.alloc(clusters);
            self.write_clusters(lcn, &raw);
            self.records.get_mut(&10).unwrap().data = Data::NonResident(Stream {
                runs: vec![(Some(lcn), clusters)],
                start_vcn: 0,
                allocated: raw.len() as u64,
                size: raw.len() as u64,
                initialized: raw.len() as u64,
                flags: 0,
            });
        }

        let bitmap_bytes = self.total_clusters.div_ceil(8);
        let bitmap_clusters = bitmap_bytes.div_ceil(CLUSTER as u64);
        let bitmap_lcn = self.alloc(bitmap_clusters);
        let mut bitmap = vec![0u8; bitmap_bytes as usize];
        for (i, &used) in self.allocated.iter().enumerate() {
            if used {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        self.write_clusters(bitmap_lcn, &bitmap);
        self.records.get_mut(&6).unwrap().data = Data::NonResident(Stream {
            runs: vec![(Some(bitmap_lcn), bitmap_clusters)],
            start_vcn: 0,
            allocated: bitmap_clusters * CLUSTER as u64,
            size: bitmap_bytes,
            initialized: bitmap_bytes,
            flags: 0,
        });

        let encoded: Vec<(u64, Vec<u8>)> = self
            .records
            .iter()
            .map(|(&n, spec)| (n, self.encode_record(n, spec)))
            .collect();

        let mut image = Image {
            bytes: Vec::new(),
            total_clusters: self.total_clusters,
            free_clusters: self.allocated.iter().filter(|&&a| !a).count() as u64,
            mft_extents: self.mft_extents.clone(),
            dir_blocks: self.dir_blocks.clone(),
        };
        image.bytes = self.image;
        for (n, raw) in encoded {
            let off = image.record_offset(n);
            image.bytes[off..off + RECORD].copy_from_slice(&raw);
        }
        image.write_boot_sector();
        image
    }
}

// ============================================================================
// Finished image
// ============================================================================

pub struct Image {
    pub bytes: Vec<u8>,
    pub total_clusters: u64,
    pub free_clusters: u64,
    mft_extents: Vec<(u64, u64)>,
    dir_blocks: BTreeMap<u64, Vec<usize>>,
}

impl Image {
    fn write_boot_sector(&mut self) {
        let s = &mut self.bytes[..SECTOR];
        s[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        s[3..11].copy_from_slice(b"NTFS    ");
        put16(s, 0x0B, SECTOR as u16);
        s[0x0D] = (CLUSTER / SECTOR) as u8;
        s[0x15] = 0xF8;
        put64(s, 0x28, self.total_clusters * (CLUSTER / SECTOR) as u64);
        put64(s, 0x30, self.mft_extents[0].0);
        put64(s, 0x38, 2);
        s[0x40] = (-10i8) as u8;
        s[0x44] = 1;
        put64(s, 0x48, SERIAL);
        put16(s, 0x1FE, 0xAA55);
    }

    /// Byte offset of an MFT record in the image
    pub fn record_offset(&self, n: u64) -> usize {
        let byte = n * RECORD as u64;
        let mut vcn_base = 0u64;
        for &(lcn, len) in &self.mft_extents {
            let start = vcn_base * CLUSTER as u64;
            let end = (vcn_base + len) * CLUSTER as u64;
            if byte < end {
                return (lcn * CLUSTER as u64 + (byte - start)) as usize;
            }
            vcn_base += len;
        }
        panic!("record {} outside the MFT", n);
    }

    /// Edit a record's fixed-up bytes, then re-apply its fixups
    pub fn patch_record(&mut self, n: u64, f: impl FnOnce(&mut [u8])) {
        let off = self.record_offset(n);
        let rec = &mut self.bytes[off..off + RECORD];
        let usn = unprotect(rec);
        f(&mut *rec);
        protect(rec, 48, usn);
    }

    /// Edit the value of the first resident attribute of `type_code` in a
    /// record
    pub fn patch_resident_value(&mut self, n: u64, type_code: u32, f: impl FnOnce(&mut [u8])) {
        self.patch_record(n, |rec| {
            let mut off = u16::from_le_bytes([rec[20], rec[21]]) as usize;
            loop {
                let ty = u32::from_le_bytes(rec[off..off + 4].try_into().unwrap());
                assert_ne!(ty, attr_types::END, "record {} has no resident {:#x}", n, type_code);
                let len = u32::from_le_bytes(rec[off + 4..off + 8].try_into().unwrap()) as usize;
                if ty == type_code && rec[off + 8] == 0 {
                    let value_len = u32::from_le_bytes(rec[off + 16..off + 20].try_into().unwrap()) as usize;
                    let value_off = off + u16::from_le_bytes([rec[off + 20], rec[off + 21]]) as usize;
                    f(&mut rec[value_off..value_off + value_len]);
                    return;
                }
                off += len;
            }
        });
    }

    /// Edit an INDX block's fixed-up bytes, then re-apply its fixups
    pub fn patch_index_block(&mut self, dir: u64, vcn: usize, f: impl FnOnce(&mut [u8])) {
        let off = self.index_blocks(dir)[vcn];
        let block = &mut self.bytes[off..off + INDEX_BLOCK];
        let usn = unprotect(block);
        f(&mut *block);
        protect(block, 40, usn);
    }

    /// Corrupt the update sequence tag of one sector of a record
    pub fn flip_record_tag(&mut self, n: u64, sector: usize) {
        let off = self.record_offset(n) + (sector + 1) * SECTOR - 2;
        self.bytes[off] ^= 0xFF;
    }

    /// Byte offsets of a directory's INDX blocks, in VCN order
    pub fn index_blocks(&self, dir: u64) -> &[usize] {
        self.dir_blocks.get(&dir).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn disk(&self, block_size: usize) -> RamDisk {
        RamDisk::new(self.bytes.clone(), block_size)
    }

    pub fn mount(&self) -> NtfsVolume<RamDisk> {
        NtfsVolume::mount(self.disk(512), 512).expect("mount test image")
    }
}

/// Deterministic file content
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).rotate_left(seed as u32 % 32) as u8 ^ seed)
        .collect()
}
