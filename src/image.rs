//! ELF image access: header validation and random-offset file reads.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use crate::{LoaderError, Result};

/// Size of an ELF32 file header in bytes.
pub const EHDR_SIZE: usize = 52;

/// Byte index of the ELF class field in `e_ident`.
const EI_CLASS: usize = 4;
/// Byte index of the data encoding field in `e_ident`.
const EI_DATA: usize = 5;
/// Byte index of the ELF version field in `e_ident`.
const EI_VERSION: usize = 6;

const ELFMAG0: u8 = 0x7F;
const ELFMAG1: u8 = b'E';
const ELFMAG2: u8 = b'L';
const ELFMAG3: u8 = b'F';

/// ELF class: no class.
const ELFCLASSNONE: u8 = 0;
/// ELF data encoding: 2's complement, little-endian.
const ELFDATA2LSB: u8 = 1;
/// ELF version: current (1).
const EV_CURRENT: u8 = 1;

/// Decoded ELF32 file header, restricted to the fields the loader consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    /// Magic number and ELF identification fields (`e_ident`).
    pub ident: [u8; 16],
    /// ELF format version (`e_version`); must equal `EV_CURRENT`.
    pub version: u32,
    /// Virtual address of the program entry point (`e_entry`).
    pub entry: u32,
    /// File offset of the program header table (`e_phoff`).
    pub phoff: u32,
    /// Size of one program header entry in bytes (`e_phentsize`).
    pub phentsize: u16,
    /// Number of program header entries (`e_phnum`).
    pub phnum: u16,
}

impl ElfHeader {
    /// Decode a header from the first [`EHDR_SIZE`] bytes of an image.
    #[must_use]
    pub fn decode(raw: &[u8; EHDR_SIZE]) -> Self {
        let mut ident = [0u8; 16];
        ident.copy_from_slice(&raw[..16]);
        Self {
            ident,
            version: u32_at(raw, 20),
            entry: u32_at(raw, 24),
            phoff: u32_at(raw, 28),
            phentsize: u16_at(raw, 42),
            phnum: u16_at(raw, 44),
        }
    }

    /// Validate the header against the supported profile: little-endian,
    /// classed, current-version ELF.
    ///
    /// Checks run in order and stop at the first failure: the four magic
    /// bytes, the data encoding, the class, the ident version, and finally
    /// the top-level file version.
    ///
    /// # Errors
    ///
    /// `LoaderError::InvalidFormat` naming the first check that failed.
    pub fn validate(&self) -> Result<()> {
        if self.ident[0] != ELFMAG0 {
            return Err(LoaderError::InvalidFormat("bad ELF magic (byte 0)"));
        }
        if self.ident[1] != ELFMAG1 {
            return Err(LoaderError::InvalidFormat("bad ELF magic (byte 1)"));
        }
        if self.ident[2] != ELFMAG2 {
            return Err(LoaderError::InvalidFormat("bad ELF magic (byte 2)"));
        }
        if self.ident[3] != ELFMAG3 {
            return Err(LoaderError::InvalidFormat("bad ELF magic (byte 3)"));
        }
        if self.ident[EI_DATA] != ELFDATA2LSB {
            return Err(LoaderError::InvalidFormat(
                "unsupported byte order (ELFDATA2LSB required)",
            ));
        }
        if self.ident[EI_CLASS] == ELFCLASSNONE {
            return Err(LoaderError::InvalidFormat("invalid ELF class (ELFCLASSNONE)"));
        }
        if self.ident[EI_VERSION] != EV_CURRENT {
            return Err(LoaderError::InvalidFormat("ELF ident version is not EV_CURRENT"));
        }
        if self.version != u32::from(EV_CURRENT) {
            return Err(LoaderError::InvalidFormat("ELF file version is not EV_CURRENT"));
        }
        Ok(())
    }
}

/// An opened image: a validated header and the long-lived handle used for
/// all segment reads during execution.
#[derive(Debug)]
pub struct ImageReader {
    file: File,
    header: ElfHeader,
}

impl ImageReader {
    /// Open `path`, decode and validate its ELF header, and keep the handle.
    ///
    /// No page is ever mapped for an image that fails validation.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be opened or is shorter than an ELF32 header;
    /// `InvalidFormat` if the header is rejected.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut raw = [0u8; EHDR_SIZE];
        file.read_exact(&mut raw)?;
        let header = ElfHeader::decode(&raw);
        header.validate()?;
        Ok(Self { file, header })
    }

    /// The validated header.
    #[must_use]
    pub const fn header(&self) -> &ElfHeader {
        &self.header
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// `Io` on seek or read failure; a partial read is an error, not
    /// silently ignored.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `offset`, stopping early only at end
    /// of file. Returns the number of bytes read.
    ///
    /// Used for the last file-backed page of a segment, where the file may
    /// legitimately end inside the page.
    ///
    /// # Errors
    ///
    /// `Io` on seek or read failure.
    pub fn read_up_to(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(filled)
    }
}

#[inline]
fn u16_at(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(raw[offset..offset + 2].try_into().unwrap())
}

#[inline]
fn u32_at(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap())
}
