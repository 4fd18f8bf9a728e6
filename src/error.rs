//! Error types for demand-paged loading.

use thiserror::Error;

/// Errors that can occur while validating, mapping, or running an image.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The image failed ELF structural validation.
    #[error("invalid ELF image: {0}")]
    InvalidFormat(&'static str),
    /// An open, seek, or read on the image file failed.
    #[error("image I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The host refused to map a page at the address the image requires.
    #[error("failed to map page at {addr:#010x}")]
    OutOfMemory {
        /// Page-aligned address the mapping was requested at.
        addr: u32,
    },
    /// A fault address is owned by no LOAD segment.
    #[error("fault address {addr:#010x} not covered by any LOAD segment")]
    NoSegment {
        /// The faulting virtual address.
        addr: u32,
    },
    /// A loader session is already installed in this process.
    #[error("a loader session is already active in this process")]
    AlreadyActive,
}
