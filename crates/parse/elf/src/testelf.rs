//! Synthetic ELF builder for tests.
//!
//! Produces a complete little-endian ELF64 image — program headers, segment
//! data, a symbol table and its string table — entirely in memory. Used by
//! this crate's unit tests and by the builder's end-to-end scenarios, which
//! need kernel/monitor/program fixtures with real symbols.

/// Builder for a synthetic ELF64 image.
#[derive(Debug, Default)]
pub struct TestElf {
    entry: u64,
    machine: u16,
    segments: Vec<SegmentSpec>,
    symbols: Vec<(String, u64, u64)>,
}

#[derive(Debug)]
struct SegmentSpec {
    phys_addr: u64,
    virt_addr: u64,
    data: Vec<u8>,
    memsz: u64,
    flags: u32,
}

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

impl TestElf {
    /// Start an empty image (AArch64 machine type, entry 0).
    #[must_use]
    pub fn new() -> Self {
        Self {
            machine: 183, // EM_AARCH64
            ..Self::default()
        }
    }

    /// Set the entry point.
    #[must_use]
    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    /// Append a readable+writable+executable `PT_LOAD` segment.
    ///
    /// `data` is the file-backed prefix; `memsz` may exceed its length to
    /// model a `.bss` tail.
    #[must_use]
    pub fn segment(mut self, phys_addr: u64, virt_addr: u64, data: Vec<u8>, memsz: u64) -> Self {
        assert!(memsz >= data.len() as u64);
        self.segments.push(SegmentSpec {
            phys_addr,
            virt_addr,
            data,
            memsz,
            flags: 0x7, // PF_R | PF_W | PF_X
        });
        self
    }

    /// Append a `PT_LOAD` segment with explicit permission flags.
    #[must_use]
    pub fn segment_with_flags(
        mut self,
        phys_addr: u64,
        virt_addr: u64,
        data: Vec<u8>,
        memsz: u64,
        flags: u32,
    ) -> Self {
        assert!(memsz >= data.len() as u64);
        self.segments.push(SegmentSpec {
            phys_addr,
            virt_addr,
            data,
            memsz,
            flags,
        });
        self
    }

    /// Add a named symbol with the given value and size.
    #[must_use]
    pub fn symbol(mut self, name: &str, value: u64, size: u64) -> Self {
        self.symbols.push((name.to_string(), value, size));
        self
    }

    /// Serialize the image.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let data_start = phoff + self.segments.len() * PHDR_SIZE;

        // Segment bodies, back to back after the program headers.
        let mut seg_offsets = Vec::with_capacity(self.segments.len());
        let mut cursor = data_start;
        for seg in &self.segments {
            seg_offsets.push(cursor);
            cursor += seg.data.len();
        }

        // Symbol table (one null entry first) and its string table.
        let symtab_off = cursor;
        let symtab_size = (1 + self.symbols.len()) * SYM_SIZE;
        let strtab_off = symtab_off + symtab_size;

        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::with_capacity(self.symbols.len());
        for (name, _, _) in &self.symbols {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }
        let shoff = strtab_off + strtab.len();

        let mut out = Vec::with_capacity(shoff + 3 * SHDR_SIZE);

        // ELF header.
        out.extend_from_slice(b"\x7fELF");
        out.push(2); // ELFCLASS64
        out.push(1); // ELFDATA2LSB
        out.push(1); // EV_CURRENT
        out.extend_from_slice(&[0u8; 9]); // osabi, abiversion, padding
        out.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
        out.extend_from_slice(&self.machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(phoff as u64).to_le_bytes());
        out.extend_from_slice(&(shoff as u64).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&3u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(out.len(), EHDR_SIZE);

        // Program headers.
        for (seg, &off) in self.segments.iter().zip(&seg_offsets) {
            out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            out.extend_from_slice(&seg.flags.to_le_bytes());
            out.extend_from_slice(&(off as u64).to_le_bytes());
            out.extend_from_slice(&seg.virt_addr.to_le_bytes());
            out.extend_from_slice(&seg.phys_addr.to_le_bytes());
            out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&seg.memsz.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
        }

        // Segment bodies.
        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        assert_eq!(out.len(), symtab_off);

        // Symbol table: null entry, then the declared symbols.
        out.extend_from_slice(&[0u8; SYM_SIZE]);
        for ((_, value, size), &name_off) in self.symbols.iter().zip(&name_offsets) {
            out.extend_from_slice(&name_off.to_le_bytes()); // st_name
            out.push(1); // st_info: STT_OBJECT
            out.push(0); // st_other
            out.extend_from_slice(&1u16.to_le_bytes()); // st_shndx
            out.extend_from_slice(&value.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
        }
        out.extend_from_slice(&strtab);
        assert_eq!(out.len(), shoff);

        // Section headers: null, .symtab (link -> 2), .strtab.
        out.extend_from_slice(&[0u8; SHDR_SIZE]);
        push_shdr(&mut out, 2, symtab_off, symtab_size, 2); // SHT_SYMTAB
        push_shdr(&mut out, 3, strtab_off, strtab.len(), 0); // SHT_STRTAB
        out
    }
}

fn push_shdr(out: &mut Vec<u8>, sh_type: u32, offset: usize, size: usize, link: u32) {
    out.extend_from_slice(&0u32.to_le_bytes()); // sh_name
    out.extend_from_slice(&sh_type.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_flags
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
    out.extend_from_slice(&(offset as u64).to_le_bytes());
    out.extend_from_slice(&(size as u64).to_le_bytes());
    out.extend_from_slice(&link.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // sh_info
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_addralign
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_entsize
}
