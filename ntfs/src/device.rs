//! Block Device Access
//!
//! The driver never talks to hardware. It consumes storage through the
//! [`BlockDevice`] trait (logical block address, block count, destination
//! buffer) in units of the device block size supplied at mount time.
//!
//! [`BlockReader`] turns arbitrary byte ranges into block reads:
//!
//! ```text
//!   byte range:        |----+---------------------------+------|
//!   device blocks:  [ head ][  block-aligned middle ...  ][ tail ]
//!                     │              │                       │
//!                 block cache   one direct read         block cache
//! ```
//!
//! The aligned middle of a request goes straight to the device in a single
//! multi-block transfer. Partial head/tail blocks are served through a small
//! clock cache of whole device blocks, which also covers devices whose block
//! size is larger than the NTFS sector size.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{NtfsError, Result};

/// Number of device blocks held by the head/tail cache
pub const BLOCK_CACHE_SIZE: usize = 16;

/// Largest single transfer handed to the device, in bytes
pub const MAX_TRANSFER_BYTES: usize = 256 * 1024;

/// Smallest supported device block size
pub const MIN_DEVICE_BLOCK_SIZE: u32 = 256;

/// Largest supported device block size
pub const MAX_DEVICE_BLOCK_SIZE: u32 = 65536;

/// Synchronous, read-only block device
///
/// Implementations must fill `buf` completely on success. On failure the
/// contents of `buf` are treated as undefined.
pub trait BlockDevice {
    /// Read `count` device blocks starting at `lba` into `buf`.
    /// `buf.len()` is always `count * block_size`.
    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_blocks(lba, count, buf)
    }
}

/// Adapter for a plain read callback
///
/// The callback receives `(lba, count, buf)` and returns `true` on success.
/// Any context the callback needs is captured by the closure.
pub struct ReadCallback<F>(pub F);

impl<F> BlockDevice for ReadCallback<F>
where
    F: FnMut(u64, u32, &mut [u8]) -> bool,
{
    fn read_blocks(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> Result<()> {
        if (self.0)(lba, count, buf) {
            Ok(())
        } else {
            Err(NtfsError::Io)
        }
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// One cached device block
struct CachedBlock {
    lba: u64,
    valid: bool,
    data: Vec<u8>,
}

/// Byte-addressed reader over a block device
pub struct BlockReader<D> {
    device: D,
    block_size: u32,
    cache: Vec<CachedBlock>,
    /// Next slot to evict
    clock: usize,
    stats: CacheStats,
}

impl<D: BlockDevice> BlockReader<D> {
    /// Wrap a device. `block_size` must be a power of two in
    /// [`MIN_DEVICE_BLOCK_SIZE`, `MAX_DEVICE_BLOCK_SIZE`].
    pub fn new(device: D, block_size: u32) -> Result<Self> {
        if !block_size.is_power_of_two()
            || !(MIN_DEVICE_BLOCK_SIZE..=MAX_DEVICE_BLOCK_SIZE).contains(&block_size)
        {
            log::warn!("NTFS: unsupported device block size {}", block_size);
            return Err(NtfsError::Corrupt);
        }

        Ok(Self {
            device,
            block_size,
            cache: Vec::new(),
            clock: 0,
            stats: CacheStats::default(),
        })
    }

    /// Device block size in bytes
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Cache statistics
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Give the device back, dropping every cached block
    pub fn into_inner(self) -> D {
        self.device
    }

    /// Read `buf.len()` bytes starting at byte `offset` of the device
    pub fn read_bytes(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bs = self.block_size as usize;
        let max_blocks = (MAX_TRANSFER_BYTES / bs).max(1);
        let mut pos = 0usize;
        let mut off = offset;

        while pos < buf.len() {
            let in_block = (off % bs as u64) as usize;
            let remaining = buf.len() - pos;
            let lba = off / bs as u64;

            if in_block == 0 && remaining >= bs {
                // Direct transfer of whole blocks
                let blocks = (remaining / bs).min(max_blocks);
                let len = blocks * bs;
                self.device
                    .read_blocks(lba, blocks as u32, &mut buf[pos..pos + len])?;
                pos += len;
                off += len as u64;
            } else {
                let slot = self.cached_block(lba)?;
                let n = (bs - in_block).min(remaining);
                buf[pos..pos + n]
                    .copy_from_slice(&self.cache[slot].data[in_block..in_block + n]);
                pos += n;
                off += n as u64;
            }
        }

        Ok(())
    }

    /// Find or load a device block, returning its cache slot
    fn cached_block(&mut self, lba: u64) -> Result<usize> {
        if let Some(i) = self.cache.iter().position(|b| b.valid && b.lba == lba) {
            self.stats.hits += 1;
            return Ok(i);
        }
        self.stats.misses += 1;

        let slot = if self.cache.len() < BLOCK_CACHE_SIZE {
            self.cache.push(CachedBlock {
                lba,
                valid: false,
                data: vec![0u8; self.block_size as usize],
            });
            self.cache.len() - 1
        } else {
            let s = self.clock;
            self.clock = (self.clock + 1) % BLOCK_CACHE_SIZE;
            s
        };

        let entry = &mut self.cache[slot];
        entry.valid = false;
        self.device.read_blocks(lba, 1, &mut entry.data)?;
        entry.lba = lba;
        entry.valid = true;
        Ok(slot)
    }
}
