//! Loader image formatter.
//!
//! Packs the boot loader's own segment, the kernel, the monitor, and every
//! initialized-memory region produced by the builder into the flat binary
//! the platform boots from. The output is the loader segment followed by a
//! fixed header, per-region descriptors, and the region bodies.
//!
//! On AArch64 the loader's boot page tables are constructed here and
//! patched into the loader image: the lower half identity-maps the physical
//! address space with 1 GiB device blocks, the upper half maps the kernel's
//! virtual range onto its load address with 2 MiB normal-memory blocks.

use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use muon_elf::ElfFile;

use crate::memory::MemoryRegion;
use crate::sel4::{Arch, KernelConfig};
use crate::util::round_up;

const AARCH64_1GB_BLOCK_BITS: u64 = 30;
const AARCH64_2MB_BLOCK_BITS: u64 = 21;

const AARCH64_LVL0_BITS: u64 = 9;
const AARCH64_LVL1_BITS: u64 = 9;
const AARCH64_LVL2_BITS: u64 = 9;

const PAGE_TABLE_SIZE: usize = 4096;

/// Loader image magic; the value differs by word size so a mismatched
/// loader build is caught immediately.
const MAGIC_32: u64 = 0x5e14_dead;
const MAGIC_64: u64 = 0x5e14_dead_14de_5ead;

fn mask(bits: u64) -> u64 {
    (1 << bits) - 1
}

fn lvl0_index(addr: u64) -> usize {
    ((addr >> (AARCH64_2MB_BLOCK_BITS + AARCH64_LVL2_BITS + AARCH64_LVL1_BITS))
        & mask(AARCH64_LVL0_BITS)) as usize
}

fn lvl1_index(addr: u64) -> usize {
    ((addr >> (AARCH64_2MB_BLOCK_BITS + AARCH64_LVL2_BITS)) & mask(AARCH64_LVL1_BITS)) as usize
}

fn lvl2_index(addr: u64) -> usize {
    ((addr >> AARCH64_2MB_BLOCK_BITS) & mask(AARCH64_LVL2_BITS)) as usize
}

fn check_non_overlapping(regions: &[(u64, Vec<u8>)]) -> Result<()> {
    let mut checked: Vec<MemoryRegion> = Vec::with_capacity(regions.len());
    for &(base, ref data) in regions {
        let region = MemoryRegion::new(base, base + data.len() as u64);
        for other in &checked {
            if region.overlaps(other) {
                bail!(
                    "Error: loader regions overlap: 0x{:x}--0x{:x} overlaps 0x{:x}--0x{:x}",
                    region.base,
                    region.end,
                    other.base,
                    other.end
                );
            }
        }
        checked.push(region);
    }
    Ok(())
}

/// The assembled loader image, ready to be written out.
pub struct Loader {
    word_size: u8,
    /// The loader's own segment, with the boot page tables patched in.
    image: Vec<u8>,
    header: [u64; 10],
    regions: Vec<(u64, Vec<u8>)>,
}

impl Loader {
    /// Assemble the image.
    ///
    /// `regions` are the builder-produced `(physical address, bytes)` pairs;
    /// the kernel's and monitor's segments are added here. The monitor is
    /// relocated to `initial_task_phys_base` rather than its linked
    /// physical address.
    pub fn new(
        config: &KernelConfig,
        loader_elf: &ElfFile,
        kernel_elf: &ElfFile,
        monitor_elf: &ElfFile,
        initial_task_phys_base: u64,
        reserved_region: MemoryRegion,
        regions: Vec<(u64, Vec<u8>)>,
    ) -> Result<Self> {
        let word_size = loader_elf.word_size;
        let magic = match word_size {
            32 => MAGIC_32,
            64 => MAGIC_64,
            _ => unreachable!("ELF parser only produces 32/64"),
        };

        let loader_segment = loader_elf
            .segments
            .iter()
            .find(|seg| seg.loadable)
            .ok_or_else(|| anyhow!("Error: loader ELF has no loadable segment"))?;
        if loader_segment.virt_addr != loader_elf.entry {
            bail!("Error: the loader entry point must be the first byte of its image");
        }
        let mut image = loader_segment.data.clone();

        let mut all_regions: Vec<(u64, Vec<u8>)> = Vec::new();

        // Kernel segments load at their linked physical addresses; the
        // virt-to-phys offset must be the same across all of them.
        let mut kernel_first_vaddr = u64::MAX;
        let mut kernel_first_paddr = u64::MAX;
        let mut kernel_p_v_offset: Option<u64> = None;
        for segment in kernel_elf.segments.iter().filter(|seg| seg.loadable) {
            kernel_first_vaddr = kernel_first_vaddr.min(segment.virt_addr);
            kernel_first_paddr = kernel_first_paddr.min(segment.phys_addr);

            let offset = segment.virt_addr.wrapping_sub(segment.phys_addr);
            match kernel_p_v_offset {
                None => kernel_p_v_offset = Some(offset),
                Some(existing) if existing != offset => {
                    bail!("Error: kernel does not have a consistent physical-to-virtual offset")
                }
                Some(_) => {}
            }

            all_regions.push((segment.phys_addr, segment.data.clone()));
        }
        if kernel_p_v_offset.is_none() {
            bail!("Error: kernel ELF has no loadable segment");
        }

        // The monitor must be a single segment; multi-segment initial tasks
        // would complicate the kernel's boot mapping for no benefit.
        assert_eq!(monitor_elf.segments.len(), 1);
        let segment = &monitor_elf.segments[0];
        assert!(segment.loadable);

        let inittask_first_vaddr = segment.virt_addr;
        let inittask_last_vaddr = round_up(segment.virt_addr + segment.mem_size(), 1 << 12);
        let inittask_p_v_offset = inittask_first_vaddr.wrapping_sub(initial_task_phys_base);
        all_regions.push((initial_task_phys_base, segment.data.clone()));

        // Boot page tables, patched directly into the loader image.
        if config.arch == Arch::Aarch64 {
            let pagetables = if config.hyp_mode {
                setup_pagetables_hypervisor(loader_elf, kernel_first_vaddr, kernel_first_paddr)?
            } else {
                setup_pagetables(loader_elf, kernel_first_vaddr, kernel_first_paddr)?
            };
            for (name, data) in pagetables {
                let (var_addr, var_size) = loader_elf.find_symbol(name)?;
                assert_eq!(var_size as usize, data.len());
                let offset = (var_addr - loader_segment.virt_addr) as usize;
                assert!(offset + data.len() <= image.len());
                image[offset..offset + data.len()].copy_from_slice(&data);
            }
        }

        let ui_p_reg_start = initial_task_phys_base;
        let ui_p_reg_end = inittask_last_vaddr.wrapping_sub(inittask_p_v_offset);
        assert!(ui_p_reg_end > ui_p_reg_start);
        let pv_offset = initial_task_phys_base.wrapping_sub(inittask_first_vaddr);

        all_regions.extend(regions);
        check_non_overlapping(&all_regions)?;

        // The only flag so far says whether the kernel runs in hypervisor
        // mode.
        let flags = u64::from(config.hyp_mode);

        let header = [
            magic,
            flags,
            kernel_elf.entry,
            ui_p_reg_start,
            ui_p_reg_end,
            pv_offset,
            monitor_elf.entry,
            reserved_region.base,
            reserved_region.size(),
            all_regions.len() as u64,
        ];

        Ok(Self {
            word_size,
            image,
            header,
            regions: all_regions,
        })
    }

    fn push_word(&self, out: &mut Vec<u8>, value: u64) {
        if self.word_size == 64 {
            out.extend_from_slice(&value.to_le_bytes());
        } else {
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
    }

    /// Serialize: loader segment, header, region descriptors, region
    /// bodies.
    #[must_use]
    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.image.len() + 4096);
        out.extend_from_slice(&self.image);

        for value in self.header {
            self.push_word(&mut out, value);
        }

        let mut offset = 0u64;
        for (addr, data) in &self.regions {
            self.push_word(&mut out, *addr); // load address
            self.push_word(&mut out, data.len() as u64); // size
            self.push_word(&mut out, offset); // offset into the body blob
            self.push_word(&mut out, 1); // region type
            offset += data.len() as u64;
        }

        for (_, data) in &self.regions {
            out.extend_from_slice(data);
        }
        out
    }

    /// Write the image to `path`.
    pub fn write_image(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.emit())
            .with_context(|| format!("writing image {}", path.display()))
    }
}

type PageTables = Vec<(&'static str, Vec<u8>)>;

fn write_entry(table: &mut [u8], index: usize, entry: u64) {
    table[8 * index..8 * (index + 1)].copy_from_slice(&entry.to_le_bytes());
}

/// Boot page tables for EL1 kernels: separate lower (identity) and upper
/// (kernel window) translation roots.
fn setup_pagetables(loader_elf: &ElfFile, first_vaddr: u64, first_paddr: u64) -> Result<PageTables> {
    let (boot_lvl1_lower_addr, _) = loader_elf.find_symbol("boot_lvl1_lower")?;
    let (boot_lvl1_upper_addr, _) = loader_elf.find_symbol("boot_lvl1_upper")?;
    let (boot_lvl2_upper_addr, _) = loader_elf.find_symbol("boot_lvl2_upper")?;

    let mut boot_lvl0_lower = vec![0u8; PAGE_TABLE_SIZE];
    write_entry(&mut boot_lvl0_lower, 0, boot_lvl1_lower_addr | 3);

    let mut boot_lvl1_lower = vec![0u8; PAGE_TABLE_SIZE];
    for i in 0..512u64 {
        let entry = (i << AARCH64_1GB_BLOCK_BITS)
            | (1 << 10) // access flag
            | (0 << 2)  // strongly ordered memory
            | 1; // 1 GiB block
        write_entry(&mut boot_lvl1_lower, i as usize, entry);
    }

    let mut boot_lvl0_upper = vec![0u8; PAGE_TABLE_SIZE];
    write_entry(
        &mut boot_lvl0_upper,
        lvl0_index(first_vaddr),
        boot_lvl1_upper_addr | 3,
    );

    let mut boot_lvl1_upper = vec![0u8; PAGE_TABLE_SIZE];
    write_entry(
        &mut boot_lvl1_upper,
        lvl1_index(first_vaddr),
        boot_lvl2_upper_addr | 3,
    );

    let mut boot_lvl2_upper = vec![0u8; PAGE_TABLE_SIZE];
    let mut paddr = first_paddr;
    for i in lvl2_index(first_vaddr)..512 {
        let entry = paddr
            | (1 << 10) // access flag
            | (3 << 8)  // shareability, as the kernel maps it
            | (4 << 2)  // MT_NORMAL memory
            | 1; // 2 MiB block
        write_entry(&mut boot_lvl2_upper, i, entry);
        paddr += 1 << AARCH64_2MB_BLOCK_BITS;
    }

    Ok(vec![
        ("boot_lvl0_lower", boot_lvl0_lower),
        ("boot_lvl1_lower", boot_lvl1_lower),
        ("boot_lvl0_upper", boot_lvl0_upper),
        ("boot_lvl1_upper", boot_lvl1_upper),
        ("boot_lvl2_upper", boot_lvl2_upper),
    ])
}

/// Boot page tables for EL2 kernels: a single translation regime, so the
/// kernel window hangs off the lower root as well.
fn setup_pagetables_hypervisor(
    loader_elf: &ElfFile,
    first_vaddr: u64,
    first_paddr: u64,
) -> Result<PageTables> {
    let (boot_lvl1_lower_addr, _) = loader_elf.find_symbol("boot_lvl1_lower")?;
    let (boot_lvl1_upper_addr, _) = loader_elf.find_symbol("boot_lvl1_upper")?;
    let (boot_lvl2_upper_addr, _) = loader_elf.find_symbol("boot_lvl2_upper")?;

    let mut boot_lvl0_lower = vec![0u8; PAGE_TABLE_SIZE];
    write_entry(&mut boot_lvl0_lower, 0, boot_lvl1_lower_addr | 3);

    let boot_lvl0_upper = vec![0u8; PAGE_TABLE_SIZE];

    let mut boot_lvl1_lower = vec![0u8; PAGE_TABLE_SIZE];
    for i in 0..512u64 {
        let entry = (i << AARCH64_1GB_BLOCK_BITS)
            | (1 << 10) // access flag
            | (0 << 2)  // strongly ordered memory
            | 1; // 1 GiB block
        write_entry(&mut boot_lvl1_lower, i as usize, entry);
    }

    write_entry(
        &mut boot_lvl0_lower,
        lvl0_index(first_vaddr),
        boot_lvl1_upper_addr | 3,
    );

    let mut boot_lvl1_upper = vec![0u8; PAGE_TABLE_SIZE];
    write_entry(
        &mut boot_lvl1_upper,
        lvl1_index(first_vaddr),
        boot_lvl2_upper_addr | 3,
    );

    let mut boot_lvl2_upper = vec![0u8; PAGE_TABLE_SIZE];
    for i in lvl2_index(first_vaddr)..512 {
        let entry = (((i - lvl2_index(first_vaddr)) as u64) << AARCH64_2MB_BLOCK_BITS)
            .wrapping_add(first_paddr)
            | (1 << 10) // access flag
            | (3 << 8)  // shareability, as the kernel maps it
            | (4 << 2)  // MT_NORMAL memory
            | 1; // 2 MiB block
        write_entry(&mut boot_lvl2_upper, i, entry);
    }

    Ok(vec![
        ("boot_lvl0_lower", boot_lvl0_lower),
        ("boot_lvl1_lower", boot_lvl1_lower),
        ("boot_lvl0_upper", boot_lvl0_upper),
        ("boot_lvl1_upper", boot_lvl1_upper),
        ("boot_lvl2_upper", boot_lvl2_upper),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use muon_elf::testelf::TestElf;

    const LOADER_BASE: u64 = 0x4000_0000;
    const KERNEL_PHYS: u64 = 0x6000_0000;
    const KERNEL_VIRT: u64 = 0xffff_ff80_6000_0000;
    const MONITOR_VIRT: u64 = 0x40_0000;

    fn test_config() -> KernelConfig {
        KernelConfig {
            arch: Arch::Aarch64,
            word_size: 64,
            minimum_page_size: 0x1000,
            paddr_user_device_top: 1 << 32,
            kernel_frame_size: 1 << 12,
            init_cnode_bits: 12,
            cap_address_bits: 64,
            fan_out_limit: 256,
            have_fpu: true,
            hyp_mode: false,
            num_cpus: 1,
            arm_pa_size_bits: Some(40),
            riscv_pt_levels: None,
            x86_xsave_size: None,
        }
    }

    /// A loader with one segment holding the five boot page tables.
    fn loader_elf() -> ElfFile {
        let mut builder = TestElf::new()
            .entry(LOADER_BASE)
            .segment(LOADER_BASE, LOADER_BASE, vec![0u8; 0x6000], 0x6000);
        for (idx, name) in [
            "boot_lvl0_lower",
            "boot_lvl1_lower",
            "boot_lvl0_upper",
            "boot_lvl1_upper",
            "boot_lvl2_upper",
        ]
        .iter()
        .enumerate()
        {
            builder = builder.symbol(name, LOADER_BASE + 0x1000 * (idx as u64 + 1), 0x1000);
        }
        ElfFile::parse(&builder.build()).expect("valid loader fixture")
    }

    fn kernel_elf() -> ElfFile {
        let bytes = TestElf::new()
            .entry(KERNEL_VIRT)
            .segment(KERNEL_PHYS, KERNEL_VIRT, vec![0xAA; 0x100], 0x100)
            .symbol("unused", KERNEL_VIRT, 0)
            .build();
        ElfFile::parse(&bytes).expect("valid kernel fixture")
    }

    fn monitor_elf() -> ElfFile {
        let bytes = TestElf::new()
            .entry(MONITOR_VIRT)
            .segment(0, MONITOR_VIRT, vec![0xBB; 0x2000], 0x2000)
            .symbol("unused", MONITOR_VIRT, 0)
            .build();
        ElfFile::parse(&bytes).expect("valid monitor fixture")
    }

    fn words(bytes: &[u8]) -> Vec<u64> {
        bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn header_layout() {
        let config = test_config();
        let monitor_phys = 0x6100_0000;
        let reserved = MemoryRegion::new(0x6080_0000, 0x6090_0000);
        let loader = Loader::new(
            &config,
            &loader_elf(),
            &kernel_elf(),
            &monitor_elf(),
            monitor_phys,
            reserved,
            vec![(0x6090_0000, vec![1, 2, 3, 4])],
        )
        .unwrap();
        let out = loader.emit();

        // The header follows the loader's segment.
        let header = words(&out[0x6000..0x6000 + 80]);
        assert_eq!(header[0], MAGIC_64);
        assert_eq!(header[1], 0); // not hypervisor mode
        assert_eq!(header[2], KERNEL_VIRT); // kernel entry
        assert_eq!(header[3], monitor_phys); // ui_p_reg_start
        assert_eq!(header[4], monitor_phys + 0x2000); // ui_p_reg_end
        assert_eq!(header[5], monitor_phys.wrapping_sub(MONITOR_VIRT)); // pv_offset
        assert_eq!(header[6], MONITOR_VIRT); // v_entry
        assert_eq!(header[7], reserved.base);
        assert_eq!(header[8], reserved.size());
        assert_eq!(header[9], 3); // kernel + monitor + one extra region

        // Region descriptors: kernel first, then monitor, then the extra.
        let descriptors = words(&out[0x6000 + 80..0x6000 + 80 + 3 * 32]);
        assert_eq!(descriptors[0], KERNEL_PHYS);
        assert_eq!(descriptors[1], 0x100);
        assert_eq!(descriptors[2], 0); // offset
        assert_eq!(descriptors[3], 1); // type
        assert_eq!(descriptors[4], monitor_phys);
        assert_eq!(descriptors[5], 0x2000);
        assert_eq!(descriptors[6], 0x100);
        assert_eq!(descriptors[8], 0x6090_0000);
        assert_eq!(descriptors[11], 1);

        // Bodies are concatenated after the descriptors.
        let body_start = 0x6000 + 80 + 3 * 32;
        assert_eq!(out[body_start], 0xAA);
        assert_eq!(out[body_start + 0x100], 0xBB);
        assert_eq!(
            &out[body_start + 0x100 + 0x2000..body_start + 0x100 + 0x2000 + 4],
            &[1, 2, 3, 4]
        );
    }

    #[test]
    fn lower_half_identity_maps_with_device_attributes() {
        let config = test_config();
        let loader = Loader::new(
            &config,
            &loader_elf(),
            &kernel_elf(),
            &monitor_elf(),
            0x6100_0000,
            MemoryRegion::new(0x6080_0000, 0x6090_0000),
            vec![],
        )
        .unwrap();

        // boot_lvl0_lower[0] points at boot_lvl1_lower with the table bits.
        let lvl0 = words(&loader.image[0x1000..0x1008]);
        assert_eq!(lvl0[0], (LOADER_BASE + 0x2000) | 3);

        // boot_lvl1_lower: 512 one-GiB identity blocks, access flag set,
        // strongly ordered, block descriptor.
        let lvl1 = words(&loader.image[0x2000..0x3000]);
        for (i, &entry) in lvl1.iter().enumerate() {
            assert_eq!(entry, ((i as u64) << 30) | (1 << 10) | 1);
        }
    }

    #[test]
    fn upper_half_maps_kernel_window() {
        let config = test_config();
        let loader = Loader::new(
            &config,
            &loader_elf(),
            &kernel_elf(),
            &monitor_elf(),
            0x6100_0000,
            MemoryRegion::new(0x6080_0000, 0x6090_0000),
            vec![],
        )
        .unwrap();

        // boot_lvl0_upper has one entry for the kernel vaddr.
        let lvl0 = words(&loader.image[0x3000..0x4000]);
        let l0_idx = lvl0_index(KERNEL_VIRT);
        assert_eq!(lvl0[l0_idx], (LOADER_BASE + 0x4000) | 3);
        assert_eq!(lvl0.iter().filter(|&&e| e != 0).count(), 1);

        // boot_lvl2_upper maps 2 MiB normal-memory blocks starting at the
        // kernel's physical base.
        let lvl2 = words(&loader.image[0x5000..0x6000]);
        let l2_idx = lvl2_index(KERNEL_VIRT);
        assert_eq!(
            lvl2[l2_idx],
            KERNEL_PHYS | (1 << 10) | (3 << 8) | (4 << 2) | 1
        );
        assert_eq!(
            lvl2[l2_idx + 1],
            (KERNEL_PHYS + (1 << 21)) | (1 << 10) | (3 << 8) | (4 << 2) | 1
        );
        // Entries below the kernel window stay empty.
        assert!(lvl2[..l2_idx].iter().all(|&e| e == 0));
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let config = test_config();
        let result = Loader::new(
            &config,
            &loader_elf(),
            &kernel_elf(),
            &monitor_elf(),
            0x6100_0000,
            MemoryRegion::new(0x6080_0000, 0x6090_0000),
            // Overlaps the kernel segment at KERNEL_PHYS.
            vec![(KERNEL_PHYS + 0x80, vec![0u8; 0x100])],
        );
        assert!(result.is_err());
    }

    #[test]
    fn hypervisor_mode_sets_flag_and_reuses_lower_root() {
        let mut config = test_config();
        config.hyp_mode = true;
        let loader = Loader::new(
            &config,
            &loader_elf(),
            &kernel_elf(),
            &monitor_elf(),
            0x6100_0000,
            MemoryRegion::new(0x6080_0000, 0x6090_0000),
            vec![],
        )
        .unwrap();
        let out = loader.emit();
        let header = words(&out[0x6000..0x6000 + 80]);
        assert_eq!(header[1], 1); // hypervisor flag

        // The kernel window entry lands in the *lower* root table.
        let lvl0_lower = words(&loader.image[0x1000..0x2000]);
        assert_eq!(
            lvl0_lower[lvl0_index(KERNEL_VIRT)],
            (LOADER_BASE + 0x4000) | 3
        );
        // The upper root stays empty.
        let lvl0_upper = words(&loader.image[0x3000..0x4000]);
        assert!(lvl0_upper.iter().all(|&e| e == 0));
    }
}
