//! NTFS Driver Status Codes
//!
//! Every public operation returns [`Result`]. The error kinds are kept flat
//! (like the VFS `FsStatus` codes): the precise location of a corruption is
//! reported through the log at the point of detection, not carried in the
//! error value.

use core::fmt;

/// NTFS driver error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtfsError {
    /// Boot sector does not carry the NTFS OEM identifier
    NotThisFormat,
    /// On-disk structure failed validation (fixups, geometry, runs, headers)
    Corrupt,
    /// The block device reported a read failure
    Io,
    /// Path component absent, stale file reference or deleted record
    NotFound,
    /// A non-directory was found where a directory was required
    NotADirectory,
    /// A directory was found where a file was required
    IsADirectory,
    /// Compressed, encrypted, sparse or alternate-stream content
    Unsupported,
    /// A buffer could not be allocated
    OutOfMemory,
}

impl NtfsError {
    /// Short, stable name of the error kind
    pub fn as_str(&self) -> &'static str {
        match self {
            NtfsError::NotThisFormat => "not an NTFS volume",
            NtfsError::Corrupt => "corrupt on-disk structure",
            NtfsError::Io => "block device read failed",
            NtfsError::NotFound => "not found",
            NtfsError::NotADirectory => "not a directory",
            NtfsError::IsADirectory => "is a directory",
            NtfsError::Unsupported => "unsupported NTFS feature",
            NtfsError::OutOfMemory => "out of memory",
        }
    }
}

impl fmt::Display for NtfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::error::Error for NtfsError {}

impl From<alloc::collections::TryReserveError> for NtfsError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        NtfsError::OutOfMemory
    }
}

/// Result type used throughout the driver
pub type Result<T> = core::result::Result<T, NtfsError>;
