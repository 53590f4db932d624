//! Raw ELF header field extraction.
//!
//! Field offsets for both ELF classes, little-endian only, using safe
//! extraction via `from_le_bytes`. The owned-file view lives in [`crate::file`].

use core::fmt;

/// ELF magic bytes: `\x7fELF`.
pub(crate) const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF class: 32-bit.
pub(crate) const ELFCLASS32: u8 = 1;

/// ELF class: 64-bit.
pub(crate) const ELFCLASS64: u8 = 2;

/// ELF data encoding: little-endian.
pub(crate) const ELFDATA2LSB: u8 = 1;

/// ELF version: current.
pub(crate) const EV_CURRENT: u8 = 1;

/// OS ABI: standalone (embedded) application.
pub(crate) const ELFOSABI_STANDALONE: u8 = 255;

/// ELF type: executable.
pub(crate) const ET_EXEC: u16 = 2;

/// Program header type: loadable segment.
pub(crate) const PT_LOAD: u32 = 1;

/// Section header type: symbol table.
pub(crate) const SHT_SYMTAB: u32 = 2;

/// Segment flag: executable.
pub const PF_X: u32 = 0x1;

/// Segment flag: writable.
pub const PF_W: u32 = 0x2;

/// Segment flag: readable.
pub const PF_R: u32 = 0x4;

/// ELF64 file header size (including the 16 identification bytes).
pub(crate) const ELF64_EHDR_SIZE: usize = 64;

/// ELF64 program header entry size.
pub(crate) const ELF64_PHDR_SIZE: usize = 56;

/// Machine type recorded in the ELF header of an emitted file.
///
/// Only the architectures the builder targets are enumerated; the *reader*
/// accepts any machine value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MachineType {
    /// AArch64 (`EM_AARCH64`).
    Aarch64 = 183,
    /// RISC-V (`EM_RISCV`).
    Riscv = 243,
    /// x86-64 (`EM_X86_64`).
    X86_64 = 62,
}

/// Read a little-endian `u16` from `data` at byte offset `off`.
///
/// Callers must bounds-check first; a short slice is a parser bug.
pub(crate) fn le_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(data[off..off + 2].try_into().unwrap())
}

/// Read a little-endian `u32` from `data` at byte offset `off`.
pub(crate) fn le_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

/// Read a little-endian `u64` from `data` at byte offset `off`.
pub(crate) fn le_u64(data: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

/// Errors that can occur when parsing an ELF file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElfError {
    /// The file does not start with the ELF magic bytes.
    BadMagic,
    /// The ELF class byte is neither `ELFCLASS32` nor `ELFCLASS64`.
    UnsupportedClass(u8),
    /// The ELF file is not little-endian.
    UnsupportedEncoding,
    /// The input data is too short for the declared structure.
    Truncated,
    /// A header offset or size points outside the file.
    InvalidOffset,
    /// The section header string table could not be found.
    MissingStringTable,
    /// The file has no symbol table section.
    MissingSymbolTable,
    /// No symbol with the requested name exists.
    MissingSymbol(String),
    /// More than one symbol carries the requested name.
    DuplicateSymbol(String),
    /// No loadable segment covers the requested virtual address range.
    AddressNotMapped { vaddr: u64, size: u64 },
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "invalid ELF magic bytes"),
            Self::UnsupportedClass(class) => write!(f, "invalid ELF class '{class}'"),
            Self::UnsupportedEncoding => {
                write!(f, "unsupported data encoding (expected little-endian)")
            }
            Self::Truncated => write!(f, "input data truncated"),
            Self::InvalidOffset => write!(f, "invalid header offset or size"),
            Self::MissingStringTable => write!(f, "unable to find string table section"),
            Self::MissingSymbolTable => write!(f, "unable to find symbol table section"),
            Self::MissingSymbol(name) => write!(f, "no symbol named '{name}' found"),
            Self::DuplicateSymbol(name) => write!(f, "multiple symbols named '{name}'"),
            Self::AddressNotMapped { vaddr, size } => {
                write!(f, "no segment covers vaddr=0x{vaddr:x} size=0x{size:x}")
            }
        }
    }
}

impl std::error::Error for ElfError {}

/// File header fields common to both ELF classes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FileHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
    pub shoff: u64,
    pub shentsize: u16,
    pub shnum: u16,
}

impl FileHeader {
    /// Parse the class-dependent tail of the file header.
    ///
    /// `data` is the whole file; the magic and class bytes have already been
    /// validated by the caller.
    pub(crate) fn parse(data: &[u8], word_size: u8) -> Result<Self, ElfError> {
        let min_len = if word_size == 64 { ELF64_EHDR_SIZE } else { 52 };
        if data.len() < min_len {
            return Err(ElfError::Truncated);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ElfError::UnsupportedEncoding);
        }

        let header = if word_size == 64 {
            Self {
                entry: le_u64(data, 24),
                phoff: le_u64(data, 32),
                shoff: le_u64(data, 40),
                phentsize: le_u16(data, 54),
                phnum: le_u16(data, 56),
                shentsize: le_u16(data, 58),
                shnum: le_u16(data, 60),
            }
        } else {
            Self {
                entry: u64::from(le_u32(data, 24)),
                phoff: u64::from(le_u32(data, 28)),
                shoff: u64::from(le_u32(data, 32)),
                phentsize: le_u16(data, 42),
                phnum: le_u16(data, 44),
                shentsize: le_u16(data, 46),
                shnum: le_u16(data, 48),
            }
        };
        Ok(header)
    }
}

/// Program header fields common to both ELF classes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgramHeader {
    pub seg_type: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub flags: u32,
}

impl ProgramHeader {
    /// Parse one program header entry at byte offset `off`.
    pub(crate) fn parse(data: &[u8], off: usize, word_size: u8) -> Result<Self, ElfError> {
        let entry_size = if word_size == 64 { ELF64_PHDR_SIZE } else { 32 };
        if off + entry_size > data.len() {
            return Err(ElfError::InvalidOffset);
        }

        let header = if word_size == 64 {
            Self {
                seg_type: le_u32(data, off),
                flags: le_u32(data, off + 4),
                offset: le_u64(data, off + 8),
                vaddr: le_u64(data, off + 16),
                paddr: le_u64(data, off + 24),
                filesz: le_u64(data, off + 32),
                memsz: le_u64(data, off + 40),
            }
        } else {
            Self {
                seg_type: le_u32(data, off),
                offset: u64::from(le_u32(data, off + 4)),
                vaddr: u64::from(le_u32(data, off + 8)),
                paddr: u64::from(le_u32(data, off + 12)),
                filesz: u64::from(le_u32(data, off + 16)),
                memsz: u64::from(le_u32(data, off + 20)),
                flags: le_u32(data, off + 24),
            }
        };
        Ok(header)
    }
}

/// Section header fields common to both ELF classes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SectionHeader {
    pub sh_type: u32,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
}

impl SectionHeader {
    /// Parse one section header entry at byte offset `off`.
    pub(crate) fn parse(data: &[u8], off: usize, word_size: u8) -> Result<Self, ElfError> {
        let entry_size = if word_size == 64 { 64 } else { 40 };
        if off + entry_size > data.len() {
            return Err(ElfError::InvalidOffset);
        }

        let header = if word_size == 64 {
            Self {
                sh_type: le_u32(data, off + 4),
                offset: le_u64(data, off + 24),
                size: le_u64(data, off + 32),
                link: le_u32(data, off + 40),
            }
        } else {
            Self {
                sh_type: le_u32(data, off + 4),
                offset: u64::from(le_u32(data, off + 16)),
                size: u64::from(le_u32(data, off + 20)),
                link: le_u32(data, off + 24),
            }
        };
        Ok(header)
    }
}

/// A symbol table entry, reduced to what the builder consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol value (a virtual address for the objects the builder patches).
    pub value: u64,
    /// Symbol size in bytes.
    pub size: u64,
}

impl Symbol {
    /// Size of one symbol table entry for the given class.
    pub(crate) fn entry_size(word_size: u8) -> usize {
        if word_size == 64 { 24 } else { 16 }
    }

    /// Parse one symbol table entry, returning its name-index and fields.
    pub(crate) fn parse(data: &[u8], off: usize, word_size: u8) -> (u32, Self) {
        if word_size == 64 {
            // Elf64_Sym: name(4) info(1) other(1) shndx(2) value(8) size(8)
            let name = le_u32(data, off);
            let value = le_u64(data, off + 8);
            let size = le_u64(data, off + 16);
            (name, Self { value, size })
        } else {
            // Elf32_Sym: name(4) value(4) size(4) info(1) other(1) shndx(2)
            let name = le_u32(data, off);
            let value = u64::from(le_u32(data, off + 4));
            let size = u64::from(le_u32(data, off + 8));
            (name, Self { value, size })
        }
    }
}
