//! User-space demand-paging loader for 32-bit ELF executables.
//!
//! Instead of mapping every `PT_LOAD` segment up front, the loader validates
//! the image, transfers control to its entry point with nothing mapped, and
//! resolves each page fault as it happens: the faulting address is attributed
//! to a segment, exactly one read-write-execute page is mapped at the address
//! the image laid out for itself, and the page is populated with the
//! segment's file bytes. Once the target returns, every page ever granted is
//! released and the fault, allocation, and internal-fragmentation counters
//! are reported.
//!
//! Fault delivery is decoupled from fault resolution:
//! [`LoaderSession::handle_fault`] is an ordinary method driven by an
//! address, and the [`trap`] module is the only code that knows faults
//! arrive as SIGSEGV.

#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic, clippy::nursery)]

mod error;
pub mod image;
pub mod loader;
pub mod logging;
pub mod pages;
pub mod segments;
pub mod trap;

pub use error::LoaderError;
pub use loader::{LoaderSession, LoaderStats, RunReport, run_program};

/// Result type for loader operations.
pub type Result<T> = core::result::Result<T, LoaderError>;

/// Page granularity used for all lazy mappings.
pub const PAGE_SIZE: u32 = 4096;
