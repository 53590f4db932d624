//! Kernel boot emulation.
//!
//! Reconstructs, deterministically, what the kernel's boot code will compute
//! at run time: which physical memory ends up as which untyped capability,
//! where the rootserver objects land, and the first free cap slot. The
//! builder's physical-address predictions are only valid if this matches the
//! kernel byte for byte.

use anyhow::{Context, Result, anyhow, bail};
use muon_elf::ElfFile;

use crate::memory::{DisjointMemoryRegion, MemoryRegion};
use crate::sel4::{Arch, FIXED_CAP_COUNT, KernelConfig, MIN_SCHED_CONTEXT_BITS, ObjectType, SLOT_BITS, UntypedObject};
use crate::util::{round_down, round_up};

/// The kernel's boot-time view, as the initial task will observe it.
#[derive(Debug, Clone)]
pub struct KernelBootInfo {
    pub fixed_cap_count: u64,
    /// First schedule-control cap (one per CPU follows).
    pub schedcontrol_cap: u64,
    pub paging_cap_count: u64,
    pub page_cap_count: u64,
    /// Untypeds in the exact order the kernel exposes them: device first.
    pub untyped_objects: Vec<UntypedObject>,
    pub first_available_cap: u64,
}

/// Memory state after the parts of boot that are independent of the
/// reserved/initial-task placement.
pub struct PartialBootInfo {
    pub device_memory: DisjointMemoryRegion,
    pub normal_memory: DisjointMemoryRegion,
    /// Kernel boot code and data, reclaimed as normal memory after boot.
    pub boot_region: MemoryRegion,
}

/// Physical addresses of the kernel-only device frames.
///
/// The `kernel_device_frames` symbol may be absent: boards without kernel
/// devices let the compiler discard the empty array.
fn kernel_device_addrs(config: &KernelConfig, kernel_elf: &ElfFile) -> Result<Vec<u64>> {
    // One record per frame; layout follows the kernel's `kernel_frame_t`.
    let record_size = match config.arch {
        Arch::Aarch64 => 24, // paddr, pptr, two 32-bit flags
        Arch::Riscv64 => 24, // paddr, pptr, word-sized userAvailable
        Arch::X86_64 => unreachable!("x86_64 image generation is rejected at startup"),
    };

    let mut addrs = Vec::new();
    let Some((vaddr, size)) = kernel_elf.find_symbol_if_exists("kernel_device_frames")? else {
        return Ok(addrs);
    };
    let data = kernel_elf.get_data(vaddr, size)?;
    for record in data.chunks_exact(record_size) {
        let paddr = u64::from_le_bytes(record[0..8].try_into().unwrap());
        let user_available = match config.arch {
            Arch::Aarch64 => u32::from_le_bytes(record[20..24].try_into().unwrap()) != 0,
            Arch::Riscv64 => u64::from_le_bytes(record[16..24].try_into().unwrap()) != 0,
            Arch::X86_64 => unreachable!(),
        };
        if !user_available {
            addrs.push(paddr);
        }
    }
    Ok(addrs)
}

/// The available physical memory blocks from the kernel's `avail_p_regs`.
fn kernel_phys_mem(kernel_elf: &ElfFile) -> Result<Vec<(u64, u64)>> {
    let (vaddr, size) = kernel_elf
        .find_symbol("avail_p_regs")
        .context("kernel ELF is missing 'avail_p_regs'")?;
    let data = kernel_elf.get_data(vaddr, size)?;
    Ok(data
        .chunks_exact(16)
        .map(|record| {
            (
                u64::from_le_bytes(record[0..8].try_into().unwrap()),
                u64::from_le_bytes(record[8..16].try_into().unwrap()),
            )
        })
        .collect())
}

/// Translate a kernel virtual symbol to a physical address using the first
/// segment's phys/virt offset.
fn kernel_phys_of(kernel_elf: &ElfFile, symbol: &str) -> Result<u64> {
    let seg = kernel_elf
        .segments
        .first()
        .ok_or_else(|| anyhow!("kernel ELF has no segments"))?;
    let (vaddr, _) = kernel_elf.find_symbol(symbol)?;
    Ok(vaddr - seg.virt_addr + seg.phys_addr)
}

/// Physical memory used by the kernel image itself.
fn kernel_self_mem(kernel_elf: &ElfFile) -> Result<MemoryRegion> {
    let base = kernel_elf.segments[0].phys_addr;
    Ok(MemoryRegion::new(base, kernel_phys_of(kernel_elf, "ki_end")?))
}

/// Physical memory holding the kernel's boot-only code and data.
fn kernel_boot_mem(kernel_elf: &ElfFile) -> Result<MemoryRegion> {
    let base = kernel_elf.segments[0].phys_addr;
    Ok(MemoryRegion::new(
        base,
        kernel_phys_of(kernel_elf, "ki_boot_end")?,
    ))
}

/// Emulate boot up to the point where the reserved region would be placed.
///
/// Device memory starts as the whole user-device space and loses the kernel
/// device frames and all RAM; normal memory gains the RAM and loses the
/// kernel image.
pub fn emulate_kernel_boot_partial(
    config: &KernelConfig,
    kernel_elf: &ElfFile,
) -> Result<PartialBootInfo> {
    let mut device_memory = DisjointMemoryRegion::new();
    let mut normal_memory = DisjointMemoryRegion::new();

    device_memory.insert_region(0, config.paddr_user_device_top);

    for paddr in kernel_device_addrs(config, kernel_elf)? {
        device_memory.remove_region(paddr, paddr + config.kernel_frame_size);
    }

    for (start, end) in kernel_phys_mem(kernel_elf)? {
        device_memory.remove_region(start, end);
        normal_memory.insert_region(start, end);
    }

    let self_mem = kernel_self_mem(kernel_elf)?;
    normal_memory.remove_region(self_mem.base, self_mem.end);

    let boot_region = kernel_boot_mem(kernel_elf)?;

    Ok(PartialBootInfo {
        device_memory,
        normal_memory,
        boot_region,
    })
}

/// Bytes of kernel objects the rootserver allocation must hold.
pub fn calculate_rootserver_size(
    config: &KernelConfig,
    initial_task_region: MemoryRegion,
) -> u64 {
    let tcb_bits = crate::util::lsb(
        ObjectType::Tcb
            .fixed_size(config)
            .expect("TCB has a fixed size"),
    );
    let vspace_bits = crate::util::lsb(
        ObjectType::VSpace
            .fixed_size(config)
            .expect("VSpace has a fixed size"),
    );
    let page_bits = 12; // seL4_PageBits
    let asid_pool_bits = 12; // seL4_ASIDPoolBits
    let page_table_bits = 12; // seL4_PageTableBits

    let mut size = 0;
    size += 1 << (config.init_cnode_bits + SLOT_BITS);
    size += 1 << tcb_bits;
    size += 2 * (1 << page_bits); // boot info frame + IPC buffer
    size += 1 << asid_pool_bits;
    size += 1 << vspace_bits;
    size += arch_n_paging(config, initial_task_region) * (1 << page_table_bits);
    size += 1 << MIN_SCHED_CONTEXT_BITS;
    size
}

/// Alignment of the rootserver allocation.
fn rootserver_max_size_bits(config: &KernelConfig) -> u64 {
    let cnode_size_bits = config.init_cnode_bits + SLOT_BITS;
    let vspace_bits = crate::util::lsb(
        ObjectType::VSpace
            .fixed_size(config)
            .expect("VSpace has a fixed size"),
    );
    cnode_size_bits.max(vspace_bits)
}

fn n_paging(region: MemoryRegion, bits: u64) -> u64 {
    let start = round_down(region.base, 1 << bits);
    let end = round_up(region.end, 1 << bits);
    (end - start) >> bits
}

/// Translation tables the kernel creates to cover the initial task.
fn arch_n_paging(config: &KernelConfig, region: MemoryRegion) -> u64 {
    config
        .intermediate_levels()
        .iter()
        .map(|level| n_paging(region, level.granule_bits))
        .sum()
}

/// Emulate the kernel boot, producing the boot info the initial task will
/// observe.
pub fn emulate_kernel_boot(
    config: &KernelConfig,
    kernel_elf: &ElfFile,
    initial_task_phys_region: MemoryRegion,
    initial_task_virt_region: MemoryRegion,
    reserved_region: MemoryRegion,
) -> Result<KernelBootInfo> {
    assert_eq!(
        initial_task_phys_region.size(),
        initial_task_virt_region.size()
    );
    let partial = emulate_kernel_boot_partial(config, kernel_elf)?;
    let mut normal_memory = partial.normal_memory;
    let device_memory = partial.device_memory;
    let boot_region = partial.boot_region;

    normal_memory.remove_region(initial_task_phys_region.base, initial_task_phys_region.end);
    normal_memory.remove_region(reserved_region.base, reserved_region.end);

    // The kernel carves the rootserver objects out of the highest suitable
    // region, aligned block taken from the top downward.
    let initial_objects_size = calculate_rootserver_size(config, initial_task_virt_region);
    let initial_objects_align = rootserver_max_size_bits(config);
    let mut carved = false;
    for region in normal_memory.regions().iter().rev().copied().collect::<Vec<_>>() {
        if region.size() < initial_objects_size {
            continue;
        }
        let start = round_down(
            region.end - initial_objects_size,
            1 << initial_objects_align,
        );
        if start >= region.base {
            normal_memory.remove_region(start, start + initial_objects_size);
            carved = true;
            break;
        }
    }
    if !carved {
        bail!(
            "no physical memory region large enough for the rootserver objects \
             ({initial_objects_size} bytes aligned to 1 << {initial_objects_align})"
        );
    }

    let fixed_cap_count = FIXED_CAP_COUNT;
    let sched_control_cap_count = config.num_cpus;
    let paging_cap_count = arch_n_paging(config, initial_task_virt_region);
    let page_cap_count = initial_task_virt_region.size() / config.minimum_page_size;
    let first_untyped_cap =
        fixed_cap_count + paging_cap_count + sched_control_cap_count + page_cap_count;
    let schedcontrol_cap = fixed_cap_count + paging_cap_count;

    let max_bits = config.arch.max_untyped_bits();
    let device_regions: Vec<MemoryRegion> = [
        reserved_region.aligned_power_of_two_regions(max_bits),
        device_memory.aligned_power_of_two_regions(max_bits),
    ]
    .concat();
    let normal_regions: Vec<MemoryRegion> = [
        boot_region.aligned_power_of_two_regions(max_bits),
        normal_memory.aligned_power_of_two_regions(max_bits),
    ]
    .concat();

    let mut untyped_objects = Vec::with_capacity(device_regions.len() + normal_regions.len());
    let mut cap = first_untyped_cap;
    for region in device_regions {
        untyped_objects.push(UntypedObject {
            cap,
            region,
            is_device: true,
        });
        cap += 1;
    }
    for region in normal_regions {
        untyped_objects.push(UntypedObject {
            cap,
            region,
            is_device: false,
        });
        cap += 1;
    }

    Ok(KernelBootInfo {
        fixed_cap_count,
        schedcontrol_cap,
        paging_cap_count,
        page_cap_count,
        first_available_cap: cap,
        untyped_objects,
    })
}
