//! Owned ELF file view: segments, symbols, patching, and the flat writer.

use std::collections::HashMap;
use std::path::Path;

use crate::header::{
    ELF64_EHDR_SIZE, ELF64_PHDR_SIZE, ELF_MAGIC, ELFCLASS32, ELFCLASS64, ELFOSABI_STANDALONE,
    ET_EXEC, EV_CURRENT, ElfError, FileHeader, MachineType, PF_R, PF_W, PF_X, PT_LOAD,
    ProgramHeader, SHT_SYMTAB, SectionHeader, Symbol,
};

/// One program-header segment with its (zero-extended) contents.
///
/// `data` always holds `memsz` bytes: the file-backed prefix followed by the
/// zero fill, so patches can land anywhere in the segment's memory image.
#[derive(Debug, Clone)]
pub struct ElfSegment {
    /// Physical load address.
    pub phys_addr: u64,
    /// Virtual load address.
    pub virt_addr: u64,
    /// Segment contents, zero-extended to the in-memory size.
    pub data: Vec<u8>,
    /// Whether this is a `PT_LOAD` segment.
    pub loadable: bool,
    /// Raw `p_flags` permission bits.
    pub flags: u32,
}

impl ElfSegment {
    /// In-memory size of the segment.
    #[must_use]
    pub fn mem_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Whether the segment is mapped readable.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.flags & PF_R != 0
    }

    /// Whether the segment is mapped writable.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    /// Whether the segment is mapped executable.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    fn contains(&self, vaddr: u64, size: u64) -> bool {
        vaddr >= self.virt_addr && vaddr + size <= self.virt_addr + self.mem_size()
    }
}

/// A parsed ELF file, holding owned copies of every segment.
///
/// Segment data is mutable so symbols can be patched in place before the
/// image is re-emitted.
#[derive(Debug, Clone)]
pub struct ElfFile {
    /// 32 or 64, from the class byte.
    pub word_size: u8,
    /// Machine type from the file header.
    pub machine: u16,
    /// Entry point virtual address.
    pub entry: u64,
    /// All segments, in program-header order.
    pub segments: Vec<ElfSegment>,
    symbols: HashMap<String, (Symbol, bool)>,
}

impl ElfFile {
    /// Parse an ELF file from raw bytes.
    ///
    /// Both ELF classes are accepted (little-endian only). The symbol table
    /// is required: the builder patches every image it loads by symbol.
    ///
    /// # Errors
    ///
    /// Returns [`ElfError`] on malformed input or a missing symbol/string
    /// table.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < 6 {
            return Err(ElfError::Truncated);
        }
        if data[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        let word_size = match data[4] {
            ELFCLASS32 => 32,
            ELFCLASS64 => 64,
            class => return Err(ElfError::UnsupportedClass(class)),
        };

        let header = FileHeader::parse(data, word_size)?;
        let machine = crate::header::le_u16(data, 18);

        let mut segments = Vec::with_capacity(usize::from(header.phnum));
        for idx in 0..usize::from(header.phnum) {
            let off = usize::try_from(header.phoff).map_err(|_| ElfError::InvalidOffset)?
                + idx * usize::from(header.phentsize);
            let phdr = ProgramHeader::parse(data, off, word_size)?;

            let file_start = usize::try_from(phdr.offset).map_err(|_| ElfError::InvalidOffset)?;
            let file_size = usize::try_from(phdr.filesz).map_err(|_| ElfError::InvalidOffset)?;
            let mem_size = usize::try_from(phdr.memsz).map_err(|_| ElfError::InvalidOffset)?;
            if file_start + file_size > data.len() || mem_size < file_size {
                return Err(ElfError::InvalidOffset);
            }

            let mut seg_data = Vec::with_capacity(mem_size);
            seg_data.extend_from_slice(&data[file_start..file_start + file_size]);
            seg_data.resize(mem_size, 0);

            segments.push(ElfSegment {
                phys_addr: phdr.paddr,
                virt_addr: phdr.vaddr,
                data: seg_data,
                loadable: phdr.seg_type == PT_LOAD,
                flags: phdr.flags,
            });
        }

        // Locate the symbol table; its sh_link names the string table that
        // holds the symbol names.
        let mut symtab: Option<SectionHeader> = None;
        let mut sections = Vec::with_capacity(usize::from(header.shnum));
        for idx in 0..usize::from(header.shnum) {
            let off = usize::try_from(header.shoff).map_err(|_| ElfError::InvalidOffset)?
                + idx * usize::from(header.shentsize);
            let shdr = SectionHeader::parse(data, off, word_size)?;
            if shdr.sh_type == SHT_SYMTAB {
                symtab = Some(shdr);
            }
            sections.push(shdr);
        }
        let symtab = symtab.ok_or(ElfError::MissingSymbolTable)?;
        let strtab = sections
            .get(symtab.link as usize)
            .ok_or(ElfError::MissingStringTable)?;

        let sym_bytes = section_bytes(data, &symtab)?;
        let str_bytes = section_bytes(data, strtab)?;

        let mut symbols: HashMap<String, (Symbol, bool)> = HashMap::new();
        let entry_size = Symbol::entry_size(word_size);
        let mut offset = 0;
        while offset + entry_size <= sym_bytes.len() {
            let (name_idx, sym) = Symbol::parse(sym_bytes, offset, word_size);
            offset += entry_size;
            let name = string_at(str_bytes, name_idx as usize);
            if name.is_empty() {
                continue;
            }
            symbols
                .entry(name)
                .and_modify(|slot| slot.1 = true)
                .or_insert((sym, false));
        }

        Ok(Self {
            word_size,
            machine,
            entry: header.entry,
            segments,
            symbols,
        })
    }

    /// Read and parse an ELF file from disk.
    ///
    /// # Errors
    ///
    /// I/O failures are reported as a boxed error alongside parse errors.
    pub fn from_path(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let data = std::fs::read(path)?;
        Ok(Self::parse(&data)?)
    }

    /// Look up a symbol, failing if it is absent.
    ///
    /// Returns `(value, size)`.
    ///
    /// # Errors
    ///
    /// [`ElfError::MissingSymbol`] if absent, [`ElfError::DuplicateSymbol`]
    /// if defined more than once.
    pub fn find_symbol(&self, name: &str) -> Result<(u64, u64), ElfError> {
        self.find_symbol_if_exists(name)?
            .ok_or_else(|| ElfError::MissingSymbol(name.to_string()))
    }

    /// Look up a symbol that may legitimately be absent.
    ///
    /// # Errors
    ///
    /// [`ElfError::DuplicateSymbol`] if the name is defined more than once;
    /// absence is `Ok(None)`.
    pub fn find_symbol_if_exists(&self, name: &str) -> Result<Option<(u64, u64)>, ElfError> {
        match self.symbols.get(name) {
            Some((_, true)) => Err(ElfError::DuplicateSymbol(name.to_string())),
            Some((sym, false)) => Ok(Some((sym.value, sym.size))),
            None => Ok(None),
        }
    }

    /// Return `size` bytes at virtual address `vaddr`.
    ///
    /// # Errors
    ///
    /// Fails if no single segment covers the whole range.
    pub fn get_data(&self, vaddr: u64, size: u64) -> Result<&[u8], ElfError> {
        for seg in &self.segments {
            if seg.contains(vaddr, size) {
                let offset = (vaddr - seg.virt_addr) as usize;
                return Ok(&seg.data[offset..offset + size as usize]);
            }
        }
        Err(ElfError::AddressNotMapped { vaddr, size })
    }

    /// Patch the in-memory copy of the segment backing `name` with `data`.
    ///
    /// `data` must not exceed the symbol's size; a longer patch is a caller
    /// bug, not an input error.
    ///
    /// # Errors
    ///
    /// Fails if the symbol does not exist or no segment backs it.
    pub fn write_symbol(&mut self, name: &str, data: &[u8]) -> Result<(), ElfError> {
        let (vaddr, size) = self.find_symbol(name)?;
        assert!(
            data.len() as u64 <= size,
            "patch for '{name}' is {} bytes but symbol is {size}",
            data.len()
        );
        for seg in &mut self.segments {
            if seg.contains(vaddr, size) {
                let offset = (vaddr - seg.virt_addr) as usize;
                seg.data[offset..offset + data.len()].copy_from_slice(data);
                return Ok(());
            }
        }
        Err(ElfError::AddressNotMapped { vaddr, size })
    }

    /// Serialize as a minimal ELF64 executable.
    ///
    /// One `PT_LOAD` program header per segment, permissions fixed to RWX,
    /// alignment 1, no sections. This is the flat form handed to the
    /// platform's boot chain, which only walks program headers.
    #[must_use]
    pub fn emit(&self, machine: MachineType) -> Vec<u8> {
        let phoff = ELF64_EHDR_SIZE;
        let total_header = phoff + self.segments.len() * ELF64_PHDR_SIZE;
        let data_size: usize = self.segments.iter().map(|s| s.data.len()).sum();
        let mut out = Vec::with_capacity(total_header + data_size);

        // e_ident
        out.extend_from_slice(&ELF_MAGIC);
        out.push(ELFCLASS64);
        out.push(crate::header::ELFDATA2LSB);
        out.push(EV_CURRENT);
        out.push(ELFOSABI_STANDALONE);
        out.extend_from_slice(&[0u8; 8]); // abi version + padding

        out.extend_from_slice(&ET_EXEC.to_le_bytes()); // e_type
        out.extend_from_slice(&(machine as u16).to_le_bytes()); // e_machine
        out.extend_from_slice(&u32::from(EV_CURRENT).to_le_bytes()); // e_version
        out.extend_from_slice(&self.entry.to_le_bytes()); // e_entry
        out.extend_from_slice(&(phoff as u64).to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(ELF64_EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
        out.extend_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes()); // e_phnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        debug_assert_eq!(out.len(), ELF64_EHDR_SIZE);

        let mut data_offset = total_header as u64;
        for seg in &self.segments {
            out.extend_from_slice(&PT_LOAD.to_le_bytes()); // p_type
            out.extend_from_slice(&(PF_R | PF_W | PF_X).to_le_bytes()); // p_flags
            out.extend_from_slice(&data_offset.to_le_bytes()); // p_offset
            out.extend_from_slice(&seg.virt_addr.to_le_bytes()); // p_vaddr
            out.extend_from_slice(&seg.phys_addr.to_le_bytes()); // p_paddr
            out.extend_from_slice(&seg.mem_size().to_le_bytes()); // p_filesz
            out.extend_from_slice(&seg.mem_size().to_le_bytes()); // p_memsz
            out.extend_from_slice(&1u64.to_le_bytes()); // p_align
            data_offset += seg.mem_size();
        }

        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        out
    }

    /// Serialize and write to `path`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying I/O error.
    pub fn write(&self, path: &Path, machine: MachineType) -> std::io::Result<()> {
        std::fs::write(path, self.emit(machine))
    }
}

fn section_bytes<'a>(data: &'a [u8], shdr: &SectionHeader) -> Result<&'a [u8], ElfError> {
    let start = usize::try_from(shdr.offset).map_err(|_| ElfError::InvalidOffset)?;
    let size = usize::try_from(shdr.size).map_err(|_| ElfError::InvalidOffset)?;
    if start + size > data.len() {
        return Err(ElfError::InvalidOffset);
    }
    Ok(&data[start..start + size])
}

fn string_at(strtab: &[u8], idx: usize) -> String {
    let end = strtab[idx..]
        .iter()
        .position(|&b| b == 0)
        .map_or(strtab.len(), |p| idx + p);
    String::from_utf8_lossy(&strtab[idx..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testelf::TestElf;

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(ElfFile::parse(&[]), Err(ElfError::Truncated)));
        assert!(matches!(
            ElfFile::parse(&[0u8; 64]),
            Err(ElfError::BadMagic)
        ));
    }

    #[test]
    fn parse_rejects_bad_class() {
        let mut data = TestElf::new().build();
        data[4] = 7;
        assert!(matches!(
            ElfFile::parse(&data),
            Err(ElfError::UnsupportedClass(7))
        ));
    }

    #[test]
    fn entry_and_machine_roundtrip() {
        let data = TestElf::new().entry(0x40_1000).build();
        let elf = ElfFile::parse(&data).expect("valid ELF");
        assert_eq!(elf.word_size, 64);
        assert_eq!(elf.entry, 0x40_1000);
        assert_eq!(elf.machine, 183);
    }

    #[test]
    fn segment_is_zero_extended_to_memsz() {
        let data = TestElf::new()
            .segment(0x8_0000, 0x40_0000, b"abcd".to_vec(), 0x100)
            .build();
        let elf = ElfFile::parse(&data).expect("valid ELF");
        assert_eq!(elf.segments.len(), 1);
        let seg = &elf.segments[0];
        assert_eq!(seg.mem_size(), 0x100);
        assert_eq!(&seg.data[..4], b"abcd");
        assert!(seg.data[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn symbol_lookup() {
        let data = TestElf::new()
            .segment(0x8_0000, 0x40_0000, vec![0u8; 64], 64)
            .symbol("marker", 0x40_0010, 8)
            .build();
        let elf = ElfFile::parse(&data).expect("valid ELF");
        assert_eq!(elf.find_symbol("marker").unwrap(), (0x40_0010, 8));
        assert_eq!(elf.find_symbol_if_exists("absent").unwrap(), None);
        assert!(matches!(
            elf.find_symbol("absent"),
            Err(ElfError::MissingSymbol(_))
        ));
    }

    #[test]
    fn duplicate_symbol_is_an_error_even_for_if_exists() {
        let data = TestElf::new()
            .segment(0x8_0000, 0x40_0000, vec![0u8; 64], 64)
            .symbol("twice", 0x40_0000, 8)
            .symbol("twice", 0x40_0008, 8)
            .build();
        let elf = ElfFile::parse(&data).expect("valid ELF");
        assert!(matches!(
            elf.find_symbol_if_exists("twice"),
            Err(ElfError::DuplicateSymbol(_))
        ));
    }

    #[test]
    fn get_data_reads_through_symbol() {
        let mut payload = vec![0u8; 32];
        payload[8..16].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes());
        let data = TestElf::new()
            .segment(0x8_0000, 0x40_0000, payload, 32)
            .symbol("value", 0x40_0008, 8)
            .build();
        let elf = ElfFile::parse(&data).expect("valid ELF");
        let (vaddr, size) = elf.find_symbol("value").unwrap();
        let bytes = elf.get_data(vaddr, size).unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 0xDEAD_BEEF);
    }

    #[test]
    fn get_data_rejects_unmapped_range() {
        let data = TestElf::new()
            .segment(0x8_0000, 0x40_0000, vec![0u8; 16], 16)
            .build();
        let elf = ElfFile::parse(&data).expect("valid ELF");
        assert!(matches!(
            elf.get_data(0x50_0000, 8),
            Err(ElfError::AddressNotMapped { .. })
        ));
        // Range straddling the segment end is also unmapped.
        assert!(matches!(
            elf.get_data(0x40_000c, 8),
            Err(ElfError::AddressNotMapped { .. })
        ));
    }

    #[test]
    fn write_symbol_patches_segment() {
        let data = TestElf::new()
            .segment(0x8_0000, 0x40_0000, vec![0u8; 32], 32)
            .symbol("patch_me", 0x40_0010, 16)
            .build();
        let mut elf = ElfFile::parse(&data).expect("valid ELF");
        elf.write_symbol("patch_me", &0x1234u64.to_le_bytes()).unwrap();
        let bytes = elf.get_data(0x40_0010, 8).unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 0x1234);
        // A short patch leaves the symbol's tail untouched.
        assert_eq!(elf.get_data(0x40_0018, 8).unwrap(), &[0u8; 8]);
    }

    #[test]
    fn emit_then_reparse_preserves_segments() {
        let data = TestElf::new()
            .entry(0x40_0000)
            .segment(0x8_0000, 0x40_0000, b"code".to_vec(), 4)
            .segment(0x9_0000, 0x50_0000, b"data".to_vec(), 4)
            .symbol("x", 0x40_0000, 4)
            .build();
        let elf = ElfFile::parse(&data).expect("valid ELF");
        let emitted = elf.emit(MachineType::Aarch64);

        // The emitted file has no sections, so parse the headers by hand.
        assert_eq!(&emitted[..4], b"\x7fELF");
        assert_eq!(emitted[4], ELFCLASS64);
        let phnum = u16::from_le_bytes(emitted[56..58].try_into().unwrap());
        assert_eq!(phnum, 2);
        let machine = u16::from_le_bytes(emitted[18..20].try_into().unwrap());
        assert_eq!(machine, MachineType::Aarch64 as u16);
        // Segment bodies follow the headers back to back.
        let body_start = 64 + 2 * 56;
        assert_eq!(&emitted[body_start..body_start + 4], b"code");
        assert_eq!(&emitted[body_start + 4..body_start + 8], b"data");
    }
}
