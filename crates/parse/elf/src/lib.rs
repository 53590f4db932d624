//! ELF support for the muon system builder.
//!
//! Reads both ELF32 and ELF64 (little-endian, any machine type) into an
//! owned representation: entry point, program-header segments with their
//! zero-extended contents, and the symbol table. Segments are mutable so
//! symbols can be patched in place, and the result can be re-emitted as a
//! minimal flat ELF64 with one program header per segment.
//!
//! # Usage
//!
//! ```
//! use muon_elf::ElfFile;
//!
//! fn patch(data: &[u8]) {
//!     let mut elf = ElfFile::parse(data).expect("valid ELF");
//!     if elf.find_symbol_if_exists("flag").expect("unique symbol").is_some() {
//!         elf.write_symbol("flag", &1u64.to_le_bytes()).unwrap();
//!     }
//! }
//! ```

#![forbid(unsafe_code)]

mod file;
pub mod header;
pub mod testelf;

pub use file::{ElfFile, ElfSegment};
pub use header::{ElfError, MachineType, PF_R, PF_W, PF_X, Symbol};
