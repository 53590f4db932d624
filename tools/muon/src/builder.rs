//! System builder.
//!
//! Translates the parsed system description into the two invocation streams
//! and every symbol patch, by planning kernel objects against the emulated
//! boot state. Ordering is a correctness contract: the kernel executes the
//! invocations sequentially and its allocator only moves forward, so every
//! allocation here must be made — and its retype emitted — in the exact
//! order the kernel will perform it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use muon_elf::ElfFile;

use crate::alloc::ObjectAllocator;
use crate::bootinfo::{KernelBootInfo, emulate_kernel_boot, emulate_kernel_boot_partial};
use crate::memory::MemoryRegion;
use crate::sel4::{
    ASID_CONTROL_CAP_ADDRESS, Aarch64Regs, Arch, BOOT_INFO_FRAME_CAP_ADDRESS, DOMAIN_CAP_ADDRESS,
    INIT_ASID_POOL_CAP_ADDRESS, INIT_CNODE_CAP_ADDRESS, INIT_NULL_CAP_ADDRESS,
    INIT_TCB_CAP_ADDRESS, INIT_THREAD_IPC_BUFFER_CAP_ADDRESS, INIT_THREAD_SC_CAP_ADDRESS,
    INIT_VSPACE_CAP_ADDRESS, IO_PORT_CONTROL_CAP_ADDRESS, IO_SPACE_CAP_ADDRESS,
    IRQ_CONTROL_CAP_ADDRESS, Invocation, InvocationArgs, KernelConfig, ObjectType, Regs,
    RiscvRegs, SEL4_RIGHTS_ALL, SEL4_RIGHTS_READ, SEL4_RIGHTS_WRITE, SLOT_SIZE,
    SMMU_CB_CONTROL_CAP_ADDRESS, SMMU_SID_CONTROL_CAP_ADDRESS, UntypedObject,
    default_vm_attributes, page_attributes,
};
use crate::sysxml::{SetVarKind, SysMap, SysMemoryRegion, SystemDescription};
use crate::util::{human_size_strict, is_power_of_two, lsb, mb, msb, round_down, round_up};
use crate::verbose::vprintln;

// Well-known indices in each PD's CSpace.
pub const INPUT_CAP_IDX: u64 = 1;
pub const FAULT_EP_CAP_IDX: u64 = 2;
pub const VSPACE_CAP_IDX: u64 = 3;
pub const REPLY_CAP_IDX: u64 = 4;
/// Monitor endpoint, passive PDs only.
pub const MONITOR_EP_CAP_IDX: u64 = 5;
/// The PD's own TCB, for debugging convenience.
pub const TCB_CAP_IDX: u64 = 6;
pub const BASE_OUTPUT_NOTIFICATION_CAP: u64 = 10;
pub const BASE_OUTPUT_ENDPOINT_CAP: u64 = BASE_OUTPUT_NOTIFICATION_CAP + 64;
pub const BASE_IRQ_CAP: u64 = BASE_OUTPUT_ENDPOINT_CAP + 64;
pub const BASE_PD_TCB_CAP: u64 = BASE_IRQ_CAP + 64;
pub const BASE_VM_TCB_CAP: u64 = BASE_PD_TCB_CAP + 64;
pub const BASE_VCPU_CAP: u64 = BASE_VM_TCB_CAP + 64;

/// Slots in each PD's CNode; must cover `BASE_VCPU_CAP + 64`.
pub const PD_CAP_SIZE: u64 = 512;
pub const PD_CAP_BITS: u64 = 9;
/// `size_bits` of each PD/VM scheduling context.
pub const PD_SCHEDCONTEXT_SIZE: u64 = 1 << 8;

/// Hard ceiling on the invocation table; bounds the sizing loop.
pub const MAX_SYSTEM_INVOCATION_SIZE: u64 = mb(128);

// Every well-known index must fit the PD CNode.
const _: () = {
    assert!(FAULT_EP_CAP_IDX < BASE_OUTPUT_NOTIFICATION_CAP);
    assert!(BASE_VCPU_CAP + 64 <= PD_CAP_SIZE);
};

/// Virtual base at which the monitor maps the invocation table.
const INVOCATION_TABLE_VADDR: u64 = 0x8000_0000;

/// Symbol giving each PD's IPC buffer location.
const IPC_BUFFER_SYMBOL: &str = "__sel4_ipc_buffer_obj";

/// One planned kernel object.
#[derive(Debug, Clone)]
pub struct KernelObject {
    pub object_type: ObjectType,
    pub cap_slot: u64,
    /// Cap address valid in the monitor's final CSpace.
    pub cap_addr: u64,
    pub phys_addr: u64,
    pub name: String,
}

/// One blob of initialized physical memory in the final image.
#[derive(Debug)]
pub struct Region {
    pub name: String,
    pub addr: u64,
    pub data: Vec<u8>,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Region name={} addr=0x{:x} size={}>",
            self.name,
            self.addr,
            self.data.len()
        )
    }
}

/// Everything one build iteration produces.
#[derive(Debug)]
pub struct BuiltSystem {
    pub number_of_system_caps: u64,
    pub invocation_data_size: u64,
    pub bootstrap_invocations: Vec<Invocation>,
    pub system_invocations: Vec<Invocation>,
    pub kernel_boot_info: KernelBootInfo,
    pub reserved_region: MemoryRegion,
    pub fault_ep_cap_address: u64,
    pub reply_cap_address: u64,
    pub cap_lookup: HashMap<u64, String>,
    /// TCB cap addresses, PDs then VMs.
    pub tcb_caps: Vec<u64>,
    /// Scheduling-context cap addresses, PDs then VMs.
    pub sched_caps: Vec<u64>,
    /// Notification cap addresses, one per PD.
    pub notification_caps: Vec<u64>,
    pub regions: Vec<Region>,
    pub kernel_objects: Vec<KernelObject>,
    pub initial_task_virt_region: MemoryRegion,
    pub initial_task_phys_region: MemoryRegion,
}

/// Resolve a program image against the search path list.
fn get_full_path(filename: &Path, search_paths: &[PathBuf]) -> Result<PathBuf> {
    for search_path in search_paths {
        let full_path = search_path.join(filename);
        if full_path.exists() {
            return Ok(full_path);
        }
    }
    bail!(
        "Error: unable to find program image: '{}'",
        filename.display()
    )
}

/// Page-aligned physical footprint of an ELF's loadable segments.
fn elf_phys_footprint(elf: &ElfFile, alignment: u64) -> u64 {
    elf.segments
        .iter()
        .filter(|seg| seg.loadable)
        .map(|seg| {
            round_up(seg.virt_addr + seg.mem_size(), alignment)
                - round_down(seg.virt_addr, alignment)
        })
        .sum()
}

/// Virtual memory region of a single-segment ELF, page aligned.
fn virt_mem_region_from_elf(elf: &ElfFile, alignment: u64) -> MemoryRegion {
    assert_eq!(elf.segments.len(), 1);
    let seg = &elf.segments[0];
    MemoryRegion::new(
        round_down(seg.virt_addr, alignment),
        round_up(seg.virt_addr + seg.mem_size(), alignment),
    )
}

/// Check that a group of objects occupies adjacent cap slots.
fn assert_objects_adjacent(objects: &[KernelObject]) {
    for pair in objects.windows(2) {
        assert_eq!(pair[1].cap_slot, pair[0].cap_slot + 1);
        assert_eq!(pair[1].cap_addr, pair[0].cap_addr + 1);
    }
}

/// A device untyped with the watermark for fixed-address allocation.
struct FixedUntypedAlloc {
    ut: UntypedObject,
    watermark: u64,
}

impl FixedUntypedAlloc {
    fn contains(&self, addr: u64) -> bool {
        self.ut.region.base <= addr && addr < self.ut.region.end
    }
}

/// Mutable planning state threaded through object allocation.
///
/// Owns the cap-slot counter for the system CNode, the device-memory
/// watermarks, and appends every retype to the (single) system invocation
/// list, in allocation order.
struct InitSystem<'a> {
    config: &'a KernelConfig,
    cnode_cap: u64,
    cnode_mask: u64,
    cap_slot: u64,
    last_fixed_address: u64,
    device_untyped: Vec<FixedUntypedAlloc>,
    kao: &'a mut ObjectAllocator,
    invocations: &'a mut Vec<Invocation>,
    cap_address_names: &'a mut HashMap<u64, String>,
    objects: Vec<KernelObject>,
}

impl<'a> InitSystem<'a> {
    #[expect(clippy::too_many_arguments)]
    fn new(
        config: &'a KernelConfig,
        cnode_cap: u64,
        cnode_mask: u64,
        first_available_cap_slot: u64,
        kao: &'a mut ObjectAllocator,
        kernel_boot_info: &KernelBootInfo,
        invocations: &'a mut Vec<Invocation>,
        cap_address_names: &'a mut HashMap<u64, String>,
    ) -> Self {
        let mut device_untyped: Vec<FixedUntypedAlloc> = kernel_boot_info
            .untyped_objects
            .iter()
            .filter(|ut| ut.is_device)
            .map(|ut| FixedUntypedAlloc {
                ut: *ut,
                watermark: ut.region.base,
            })
            .collect();
        device_untyped.sort_by_key(|fut| fut.ut.region.base);
        Self {
            config,
            cnode_cap,
            cnode_mask,
            cap_slot: first_available_cap_slot,
            last_fixed_address: 0,
            device_untyped,
            kao,
            invocations,
            cap_address_names,
            objects: Vec::new(),
        }
    }

    /// Mark device memory already consumed during bootstrap (the
    /// invocation-table pages) so fixed allocations skip past it.
    fn reserve(&mut self, allocations: &[(u64, u64)]) {
        for &(cap, watermark) in allocations {
            let fut = self
                .device_untyped
                .iter_mut()
                .find(|fut| fut.ut.cap == cap)
                .unwrap_or_else(|| panic!("reservation against unknown untyped cap {cap}"));
            assert!(
                fut.ut.region.base <= watermark && watermark <= fut.ut.region.end,
                "reservation watermark outside untyped region"
            );
            fut.watermark = watermark;
        }
    }

    /// Allocate objects of `object_type` at a fixed physical address.
    ///
    /// Fixed allocations must be made in ascending address order across the
    /// whole build. When the target address is past the watermark, padding
    /// untypeds are retyped to advance it; each padding object is the
    /// largest size the alignment and remaining gap allow.
    fn allocate_fixed_objects(
        &mut self,
        phys_address: u64,
        object_type: ObjectType,
        names: &[String],
    ) -> Result<Vec<KernelObject>> {
        assert!(phys_address >= self.last_fixed_address);
        assert_eq!(names.len(), 1, "fixed objects are allocated one at a time");
        let alloc_size = object_type
            .fixed_size(self.config)
            .expect("fixed allocation requires a fixed-size object");

        let fut = self
            .device_untyped
            .iter_mut()
            .find(|fut| fut.contains(phys_address))
            .ok_or_else(|| {
                anyhow!("physical address 0x{phys_address:x} is not in any device untyped")
            })?;
        if phys_address < fut.watermark {
            bail!(
                "physical address 0x{phys_address:x} is below the allocation watermark \
                 0x{:x} (overlapping fixed allocations?)",
                fut.watermark
            );
        }

        if fut.watermark != phys_address {
            // Pad with power-of-two untypeds until the watermark lands on
            // the requested address.
            let mut padding_sizes = Vec::new();
            let mut wm = fut.watermark;
            let mut padding_required = phys_address - wm;
            while padding_required > 0 {
                // A zero watermark imposes no alignment limit.
                let align_bits = if wm == 0 {
                    msb(padding_required)
                } else {
                    lsb(wm).min(msb(padding_required))
                };
                let pad = 1 << align_bits;
                padding_sizes.push(pad);
                wm += pad;
                padding_required -= pad;
            }
            for pad in padding_sizes {
                self.invocations.push(Invocation::new(
                    InvocationArgs::UntypedRetype {
                        untyped: fut.ut.cap,
                        object_type: ObjectType::Untyped,
                        size_bits: lsb(pad),
                        root: self.cnode_cap,
                        node_index: 1,
                        node_depth: 1,
                        node_offset: self.cap_slot,
                        num_objects: 1,
                    },
                ));
                self.cap_slot += 1;
            }
        }

        let object_cap = self.cap_slot;
        self.cap_slot += 1;
        self.invocations.push(Invocation::new(
            InvocationArgs::UntypedRetype {
                untyped: fut.ut.cap,
                object_type,
                size_bits: 0,
                root: self.cnode_cap,
                node_index: 1,
                node_depth: 1,
                node_offset: object_cap,
                num_objects: 1,
            },
        ));

        fut.watermark = phys_address + alloc_size;
        self.last_fixed_address = fut.watermark;
        let cap_addr = self.cnode_mask | object_cap;
        self.cap_address_names.insert(cap_addr, names[0].clone());
        let object = KernelObject {
            object_type,
            cap_slot: object_cap,
            cap_addr,
            phys_addr: phys_address,
            name: names[0].clone(),
        };
        self.objects.push(object.clone());
        Ok(vec![object])
    }

    /// Allocate `names.len()` objects of `object_type` from normal memory.
    ///
    /// `size` is required for the variable-size object types: slot count
    /// for CNodes, bytes for untypeds and scheduling contexts.
    fn allocate_objects(
        &mut self,
        object_type: ObjectType,
        names: Vec<String>,
        size: Option<u64>,
    ) -> Result<Vec<KernelObject>> {
        let count = names.len() as u64;
        if count == 0 {
            return Ok(Vec::new());
        }

        let (alloc_size, api_size) = match object_type.fixed_size(self.config) {
            Some(fixed) => {
                assert!(size.is_none(), "fixed-size object given an explicit size");
                (fixed, 0)
            }
            None => {
                let size = size.expect("variable-size object requires a size");
                assert!(is_power_of_two(size));
                match object_type {
                    ObjectType::CNode => (size * SLOT_SIZE, lsb(size)),
                    ObjectType::Untyped | ObjectType::SchedContext => (size, lsb(size)),
                    _ => panic!("object {object_type:?} is not variable-size"),
                }
            }
        };

        let allocation = self.kao.alloc(alloc_size, count)?;
        vprintln!(
            "  alloc #{:<4} {object_type:?} x{count} @ 0x{:x}",
            allocation.allocation_order,
            allocation.phys_addr
        );
        let base_cap_slot = self.cap_slot;
        self.cap_slot += count;

        // The kernel caps the number of objects per retype, so large groups
        // become several invocations over the same untyped.
        let mut to_alloc = count;
        let mut alloc_cap_slot = base_cap_slot;
        while to_alloc > 0 {
            let call_count = to_alloc.min(self.config.fan_out_limit);
            self.invocations.push(Invocation::new(
                InvocationArgs::UntypedRetype {
                    untyped: allocation.untyped_cap_address,
                    object_type,
                    size_bits: api_size,
                    root: self.cnode_cap,
                    node_index: 1,
                    node_depth: 1,
                    node_offset: alloc_cap_slot,
                    num_objects: call_count,
                },
            ));
            to_alloc -= call_count;
            alloc_cap_slot += call_count;
        }

        let mut kernel_objects = Vec::with_capacity(names.len());
        let mut phys_addr = allocation.phys_addr;
        for (idx, name) in names.into_iter().enumerate() {
            let cap_slot = base_cap_slot + idx as u64;
            let cap_addr = self.cnode_mask | cap_slot;
            self.cap_address_names.insert(cap_addr, name.clone());
            kernel_objects.push(KernelObject {
                object_type,
                cap_slot,
                cap_addr,
                phys_addr,
                name,
            });
            phys_addr += alloc_size;
        }
        self.objects.extend(kernel_objects.iter().cloned());
        Ok(kernel_objects)
    }
}

/// A schedulable domain: a protection domain or a virtual machine. VMs
/// inherit the scheduling parameters of their hosting PD.
struct Domain {
    name: String,
    is_vm: bool,
    priority: u64,
    budget: u64,
    period: u64,
    cpu: u64,
}

/// Whether a PD needs its own endpoint: it accepts protected procedure
/// calls, or it handles faults for child PDs or a virtual machine.
fn pd_needs_ep(pd_idx: usize, system: &SystemDescription) -> bool {
    let pd = &system.protection_domains[pd_idx];
    pd.pp
        || pd.virtual_machine.is_some()
        || system
            .protection_domains
            .iter()
            .any(|other| other.parent == Some(pd_idx))
}

/// Build the system: plan all objects, generate both invocation streams,
/// and patch the PD images.
pub fn build_system(
    config: &KernelConfig,
    kernel_elf: &ElfFile,
    monitor_elf: &ElfFile,
    system: &SystemDescription,
    invocation_table_size: u64,
    system_cnode_size: u64,
    search_paths: &[PathBuf],
) -> Result<BuiltSystem> {
    assert!(is_power_of_two(system_cnode_size));
    assert!(invocation_table_size % config.minimum_page_size == 0);
    assert!(invocation_table_size <= MAX_SYSTEM_INVOCATION_SIZE);

    let mut cap_address_names: HashMap<u64, String> = HashMap::new();
    for (cap, name) in [
        (INIT_NULL_CAP_ADDRESS, "null"),
        (INIT_TCB_CAP_ADDRESS, "TCB: init"),
        (INIT_CNODE_CAP_ADDRESS, "CNode: init"),
        (INIT_VSPACE_CAP_ADDRESS, "VSpace: init"),
        (IRQ_CONTROL_CAP_ADDRESS, "IRQ Control"),
        (ASID_CONTROL_CAP_ADDRESS, "ASID Control"),
        (INIT_ASID_POOL_CAP_ADDRESS, "ASID Pool: init"),
        (IO_PORT_CONTROL_CAP_ADDRESS, "IO Port Control"),
        (IO_SPACE_CAP_ADDRESS, "IO Space"),
        (BOOT_INFO_FRAME_CAP_ADDRESS, "BootInfo Frame"),
        (INIT_THREAD_IPC_BUFFER_CAP_ADDRESS, "IPC Buffer: init"),
        (DOMAIN_CAP_ADDRESS, "Domain"),
        (SMMU_SID_CONTROL_CAP_ADDRESS, "SMMU SID Control"),
        (SMMU_CB_CONTROL_CAP_ADDRESS, "SMMU CB Control"),
        (INIT_THREAD_SC_CAP_ADDRESS, "SchedContext: init"),
    ] {
        cap_address_names.insert(cap, name.to_string());
    }

    let system_cnode_bits = lsb(system_cnode_size);
    let pds = &system.protection_domains;
    let virtual_machines = system.virtual_machines();

    for pd in pds {
        if pd.cpu >= config.num_cpus {
            bail!(
                "Error: CPU {} out of range for protection domain '{}' ({} CPU(s) available)",
                pd.cpu,
                pd.name,
                config.num_cpus
            );
        }
    }
    if !virtual_machines.is_empty() && !(config.arch == Arch::Aarch64 && config.hyp_mode) {
        bail!("Error: virtual machines require an AArch64 hypervisor configuration");
    }

    // Physical memory for the monitor (the initial task).
    assert_eq!(monitor_elf.segments.len(), 1);
    let initial_task_size = elf_phys_footprint(monitor_elf, config.minimum_page_size);

    // Program images for every PD and VM.
    let mut pd_elf_files = Vec::with_capacity(pds.len());
    for pd in pds {
        let path = get_full_path(&pd.program_image, search_paths)?;
        let data = std::fs::read(&path)
            .with_context(|| format!("reading program image {}", path.display()))?;
        pd_elf_files.push(
            ElfFile::parse(&data)
                .map_err(|e| anyhow!("Error: parsing program image {}: {e}", path.display()))?,
        );
    }
    let mut vm_images = Vec::with_capacity(virtual_machines.len());
    for &(_, vm) in &virtual_machines {
        let image_path = get_full_path(&vm.program_image, search_paths)?;
        let image = std::fs::read(&image_path)
            .with_context(|| format!("reading VM image {}", image_path.display()))?;
        let device_tree = match &vm.device_tree {
            Some(dtb) => {
                let dtb_path = get_full_path(dtb, search_paths)?;
                Some(std::fs::read(&dtb_path).with_context(|| {
                    format!("reading VM device tree {}", dtb_path.display())
                })?)
            }
            None => None,
        };
        vm_images.push((image, device_tree));
    }

    // The reserved region holds the invocation table followed by every PD
    // ELF segment and VM image, page aligned.
    let pd_elf_size: u64 = pd_elf_files
        .iter()
        .map(|elf| elf_phys_footprint(elf, config.minimum_page_size))
        .sum();
    let vm_image_size: u64 = vm_images
        .iter()
        .map(|(image, dtb)| {
            round_up(image.len() as u64, config.minimum_page_size)
                + dtb.as_ref().map_or(0, |d| {
                    round_up(d.len() as u64, config.minimum_page_size)
                })
        })
        .sum();
    let reserved_size = invocation_table_size + pd_elf_size + vm_image_size;
    vprintln!("reserved size: {reserved_size} bytes");

    // Place the reserved region above the kernel boot region, and the
    // initial task strictly above the reserved region; the kernel relies on
    // this ordering.
    let partial = emulate_kernel_boot_partial(config, kernel_elf)?;
    let mut available_memory = partial.normal_memory;
    let reserved_base = available_memory
        .allocate_from(reserved_size, partial.boot_region.end)
        .ok_or_else(|| {
            anyhow!("Error: unable to allocate {reserved_size} bytes for the reserved region")
        })?;
    let initial_task_phys_base = available_memory
        .allocate_from(initial_task_size, reserved_base + reserved_size)
        .ok_or_else(|| {
            anyhow!("Error: unable to allocate {initial_task_size} bytes for the initial task")
        })?;
    assert!(reserved_base < initial_task_phys_base);

    let initial_task_phys_region = MemoryRegion::new(
        initial_task_phys_base,
        initial_task_phys_base + initial_task_size,
    );
    let initial_task_virt_region =
        virt_mem_region_from_elf(monitor_elf, config.minimum_page_size);
    let reserved_region = MemoryRegion::new(reserved_base, reserved_base + reserved_size);
    let invocation_table_region =
        MemoryRegion::new(reserved_base, reserved_base + invocation_table_size);

    let kernel_boot_info = emulate_kernel_boot(
        config,
        kernel_elf,
        initial_task_phys_region,
        initial_task_virt_region,
        reserved_region,
    )?;
    for ut in &kernel_boot_info.untyped_objects {
        let dev_str = if ut.is_device { " (device)" } else { "" };
        cap_address_names.insert(
            ut.cap,
            format!("Untyped @ 0x{:x}:0x{:x}{dev_str}", ut.region.base, ut.region.size()),
        );
    }

    let mut kao = ObjectAllocator::new(&kernel_boot_info);

    // ----------------------------------------------------------------
    // Bootstrap invocations: grow the monitor's CSpace, then map the
    // invocation table into its address space.
    // ----------------------------------------------------------------

    // The final CSpace is a two-slot root CNode: slot 0 holds the initial
    // CNode (so boot-time cap addresses stay valid), slot 1 the system
    // CNode. The top bit of a cap address selects between them.
    let root_cnode_bits = 1;
    let root_cnode_allocation = kao.alloc((1 << root_cnode_bits) * SLOT_SIZE, 1)?;
    let root_cnode_cap = kernel_boot_info.first_available_cap;
    cap_address_names.insert(root_cnode_cap, "CNode: root".to_string());

    let system_cnode_allocation = kao.alloc(system_cnode_size * SLOT_SIZE, 1)?;
    let system_cnode_cap = kernel_boot_info.first_available_cap + 1;
    cap_address_names.insert(system_cnode_cap, "CNode: system".to_string());

    let mut bootstrap_invocations = Vec::new();

    bootstrap_invocations.push(Invocation::new(InvocationArgs::UntypedRetype {
        untyped: root_cnode_allocation.untyped_cap_address,
        object_type: ObjectType::CNode,
        size_bits: root_cnode_bits,
        root: INIT_CNODE_CAP_ADDRESS,
        node_index: 0,
        node_depth: 0,
        node_offset: root_cnode_cap,
        num_objects: 1,
    }));

    // Mint the initial CNode into slot 0 with a guard padding cap
    // addresses out to the full word.
    let guard = config.cap_address_bits - root_cnode_bits - config.init_cnode_bits;
    bootstrap_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
        cnode: root_cnode_cap,
        dest_index: 0,
        dest_depth: root_cnode_bits,
        src_root: INIT_CNODE_CAP_ADDRESS,
        src_obj: INIT_CNODE_CAP_ADDRESS,
        src_depth: config.cap_address_bits,
        rights: SEL4_RIGHTS_ALL,
        badge: guard,
    }));

    // Adopt the new root CNode (zero guard).
    bootstrap_invocations.push(Invocation::new(InvocationArgs::TcbSetSpace {
        tcb: INIT_TCB_CAP_ADDRESS,
        fault_ep: INIT_NULL_CAP_ADDRESS,
        cspace_root: root_cnode_cap,
        cspace_root_data: 0,
        vspace_root: INIT_VSPACE_CAP_ADDRESS,
        vspace_root_data: 0,
    }));

    bootstrap_invocations.push(Invocation::new(InvocationArgs::UntypedRetype {
        untyped: system_cnode_allocation.untyped_cap_address,
        object_type: ObjectType::CNode,
        size_bits: system_cnode_bits,
        root: INIT_CNODE_CAP_ADDRESS,
        node_index: 0,
        node_depth: 0,
        node_offset: system_cnode_cap,
        num_objects: 1,
    }));

    let guard = config.cap_address_bits - root_cnode_bits - system_cnode_bits;
    let system_cap_address_mask = 1 << (config.cap_address_bits - 1);
    bootstrap_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
        cnode: root_cnode_cap,
        dest_index: 1,
        dest_depth: root_cnode_bits,
        src_root: INIT_CNODE_CAP_ADDRESS,
        src_obj: system_cnode_cap,
        src_depth: config.cap_address_bits,
        rights: SEL4_RIGHTS_ALL,
        badge: guard,
    }));

    // Retype the invocation-table memory (the start of the reserved
    // region) into small pages, batching one retype per source untyped.
    let pages_required = invocation_table_size / config.minimum_page_size;
    let base_page_cap = 0;
    for pta in base_page_cap..base_page_cap + pages_required {
        cap_address_names.insert(
            system_cap_address_mask | pta,
            "SmallPage: monitor invocation table".to_string(),
        );
    }
    let mut remaining_pages = pages_required;
    let mut cap_slot = base_page_cap;
    let mut phys_addr = invocation_table_region.base;
    let mut invocation_table_allocations: Vec<(u64, u64)> = Vec::new();
    for ut in kernel_boot_info.untyped_objects.iter().filter(|ut| ut.is_device) {
        let ut_pages = ut.region.size() / config.minimum_page_size;
        let retype_page_count = ut_pages.min(remaining_pages);
        assert!(retype_page_count <= config.fan_out_limit);
        bootstrap_invocations.push(Invocation::new(InvocationArgs::UntypedRetype {
            untyped: ut.cap,
            object_type: ObjectType::SmallPage,
            size_bits: 0,
            root: root_cnode_cap,
            node_index: 1,
            node_depth: 1,
            node_offset: cap_slot,
            num_objects: retype_page_count,
        }));

        remaining_pages -= retype_page_count;
        cap_slot += retype_page_count;
        phys_addr += retype_page_count * config.minimum_page_size;
        invocation_table_allocations.push((ut.cap, phys_addr));
        if remaining_pages == 0 {
            break;
        }
    }

    // Page tables to span the table, mapped at a fixed high virtual
    // address, then the pages themselves (read-only, never executable).
    let large_page_size = config.page_sizes()[1];
    let page_tables_required =
        round_up(invocation_table_size, large_page_size) / large_page_size;
    let page_table_allocation = kao.alloc(
        ObjectType::PageTable.fixed_size(config).unwrap(),
        page_tables_required,
    )?;
    let base_page_table_cap = cap_slot;
    for pta in base_page_table_cap..base_page_table_cap + page_tables_required {
        cap_address_names.insert(system_cap_address_mask | pta, "PageTable: monitor".to_string());
    }
    assert!(page_tables_required <= config.fan_out_limit);
    bootstrap_invocations.push(Invocation::new(InvocationArgs::UntypedRetype {
        untyped: page_table_allocation.untyped_cap_address,
        object_type: ObjectType::PageTable,
        size_bits: 0,
        root: root_cnode_cap,
        node_index: 1,
        node_depth: 1,
        node_offset: cap_slot,
        num_objects: page_tables_required,
    }));
    cap_slot += page_tables_required;

    let mut invocation = Invocation::new(InvocationArgs::PageTableMap {
        page_table: system_cap_address_mask | base_page_table_cap,
        vspace: INIT_VSPACE_CAP_ADDRESS,
        vaddr: INVOCATION_TABLE_VADDR,
        attr: default_vm_attributes(config.arch),
    });
    invocation.repeat(
        page_tables_required,
        InvocationArgs::PageTableMap {
            page_table: 1,
            vspace: 0,
            vaddr: large_page_size,
            attr: 0,
        },
    );
    bootstrap_invocations.push(invocation);

    let mut invocation = Invocation::new(InvocationArgs::PageMap {
        page: system_cap_address_mask | base_page_cap,
        vspace: INIT_VSPACE_CAP_ADDRESS,
        vaddr: INVOCATION_TABLE_VADDR,
        rights: SEL4_RIGHTS_READ,
        attr: page_attributes(config.arch, true, false),
    });
    invocation.repeat(
        pages_required,
        InvocationArgs::PageMap {
            page: 1,
            vspace: 0,
            vaddr: config.minimum_page_size,
            rights: 0,
            attr: 0,
        },
    );
    bootstrap_invocations.push(invocation);

    // ----------------------------------------------------------------
    // Synthetic regions: PD ELF segments and VM images are packed into
    // the reserved region behind the invocation table, each becoming a
    // fixed-address memory region plus a mapping.
    // ----------------------------------------------------------------

    let num_domains = pds.len() + virtual_machines.len();
    let mut extra_mrs: Vec<SysMemoryRegion> = Vec::new();
    let mut extra_maps: Vec<Vec<SysMap>> = vec![Vec::new(); num_domains];
    // (region name, data address, pd index, segment index) for the blobs,
    // materialized only after the images are patched.
    let mut pd_elf_layout: Vec<(String, u64, usize, usize)> = Vec::new();

    let mut phys_addr_next = invocation_table_region.end;
    for (pd_idx, pd) in pds.iter().enumerate() {
        let mut load_idx = 0;
        for (seg_idx, segment) in pd_elf_files[pd_idx].segments.iter().enumerate() {
            if !segment.loadable {
                continue;
            }
            let mut perms = String::new();
            if segment.is_readable() {
                perms.push('r');
            }
            if segment.is_writable() {
                perms.push('w');
            }
            if segment.is_executable() {
                perms.push('x');
            }

            let base_vaddr = round_down(segment.virt_addr, config.minimum_page_size);
            let end_vaddr = round_up(
                segment.virt_addr + segment.mem_size(),
                config.minimum_page_size,
            );
            let aligned_size = end_vaddr - base_vaddr;
            let name = format!("ELF:{}-{load_idx}", pd.name);
            extra_mrs.push(SysMemoryRegion {
                name: name.clone(),
                size: aligned_size,
                page_size: config.minimum_page_size,
                page_count: aligned_size / config.minimum_page_size,
                phys_addr: Some(phys_addr_next),
            });
            extra_maps[pd_idx].push(SysMap {
                mr: name,
                vaddr: base_vaddr,
                perms,
                cached: true,
                loc: None,
            });
            pd_elf_layout.push((
                format!("PD-ELF {}-{load_idx}", pd.name),
                phys_addr_next + (segment.virt_addr - base_vaddr),
                pd_idx,
                seg_idx,
            ));
            phys_addr_next += aligned_size;
            load_idx += 1;
        }
    }

    let mut vm_regions: Vec<Region> = Vec::new();
    for (vm_idx, &(_, vm)) in virtual_machines.iter().enumerate() {
        let dom_idx = pds.len() + vm_idx;
        let (image, device_tree) = &vm_images[vm_idx];

        vm_regions.push(Region {
            name: format!("VM-IMAGE {}", vm.name),
            addr: phys_addr_next,
            data: image.clone(),
        });
        let aligned_size = round_up(image.len() as u64, config.minimum_page_size);
        let name = format!("IMAGE:{}", vm.name);
        extra_mrs.push(SysMemoryRegion {
            name: name.clone(),
            size: aligned_size,
            page_size: config.minimum_page_size,
            page_count: aligned_size / config.minimum_page_size,
            phys_addr: Some(phys_addr_next),
        });
        extra_maps[dom_idx].push(SysMap {
            mr: name,
            vaddr: 0x4008_0000,
            perms: "rwx".to_string(),
            cached: false,
            loc: None,
        });
        phys_addr_next += aligned_size;

        if let Some(dtb) = device_tree {
            vm_regions.push(Region {
                name: format!("VM-DTB {}", vm.name),
                addr: phys_addr_next,
                data: dtb.clone(),
            });
            let aligned_size = round_up(dtb.len() as u64, config.minimum_page_size);
            let name = format!("DTB:{}", vm.name);
            extra_mrs.push(SysMemoryRegion {
                name: name.clone(),
                size: aligned_size,
                page_size: config.minimum_page_size,
                page_count: aligned_size / config.minimum_page_size,
                phys_addr: Some(phys_addr_next),
            });
            extra_maps[dom_idx].push(SysMap {
                mr: name,
                vaddr: 0x4f00_0000,
                perms: "rwx".to_string(),
                cached: false,
                loc: None,
            });
            phys_addr_next += aligned_size;
        }
    }

    let all_mrs: Vec<&SysMemoryRegion> =
        system.memory_regions.iter().chain(extra_mrs.iter()).collect();
    let mr_index_by_name: HashMap<&str, usize> = all_mrs
        .iter()
        .enumerate()
        .map(|(idx, mr)| (mr.name.as_str(), idx))
        .collect();

    // The schedulable domains: every PD, then every VM (inheriting its
    // host's scheduling parameters).
    let mut domains: Vec<Domain> = pds
        .iter()
        .map(|pd| Domain {
            name: pd.name.clone(),
            is_vm: false,
            priority: pd.priority,
            budget: pd.budget,
            period: pd.period,
            cpu: pd.cpu,
        })
        .collect();
    for &(host_idx, vm) in &virtual_machines {
        let host = &pds[host_idx];
        domains.push(Domain {
            name: vm.name.clone(),
            is_vm: true,
            priority: host.priority,
            budget: host.budget,
            period: host.period,
            cpu: host.cpu,
        });
    }

    let domain_maps: Vec<Vec<SysMap>> = (0..num_domains)
        .map(|dom_idx| {
            let mut maps = Vec::new();
            if dom_idx < pds.len() {
                maps.extend(pds[dom_idx].maps.iter().cloned());
            }
            maps.extend(extra_maps[dom_idx].iter().cloned());
            maps
        })
        .collect();

    // ----------------------------------------------------------------
    // Plan all kernel objects, in the fixed order the kernel will
    // allocate them.
    // ----------------------------------------------------------------

    let mut system_invocations: Vec<Invocation> = Vec::new();
    let mut init_system = InitSystem::new(
        config,
        root_cnode_cap,
        system_cap_address_mask,
        cap_slot,
        &mut kao,
        &kernel_boot_info,
        &mut system_invocations,
        &mut cap_address_names,
    );
    init_system.reserve(&invocation_table_allocations);

    // 1. Variable pages, large sizes first; the PD IPC buffers lead the
    // small-page group.
    let page_sizes = config.page_sizes();
    let page_object_by_size = |page_size: u64| match page_size {
        0x1000 => ObjectType::SmallPage,
        0x200_000 => ObjectType::LargePage,
        0x4000_0000 => ObjectType::HugePage,
        _ => panic!("invalid page size 0x{page_size:x}"),
    };
    let mut page_names_by_size: HashMap<u64, Vec<String>> =
        page_sizes.iter().map(|&sz| (sz, Vec::new())).collect();
    page_names_by_size.get_mut(&0x1000).unwrap().extend(
        pds.iter()
            .map(|pd| format!("Page({}): IPC Buffer PD={}", human_size_strict(0x1000), pd.name)),
    );
    for mr in &all_mrs {
        if mr.phys_addr.is_some() {
            continue;
        }
        let page_size_human = human_size_strict(mr.page_size);
        page_names_by_size
            .get_mut(&mr.page_size)
            .unwrap()
            .extend((0..mr.page_count).map(|idx| {
                format!("Page({page_size_human}): MR={} #{idx}", mr.name)
            }));
    }
    let mut page_objects_by_size: HashMap<u64, Vec<KernelObject>> = HashMap::new();
    for &page_size in page_sizes.iter().rev() {
        let names = page_names_by_size.remove(&page_size).unwrap();
        let objects =
            init_system.allocate_objects(page_object_by_size(page_size), names, None)?;
        page_objects_by_size.insert(page_size, objects);
    }
    let ipc_buffer_objects: Vec<KernelObject> =
        page_objects_by_size[&0x1000][..pds.len()].to_vec();

    // Hand the variable pages out to their memory regions.
    let mut pg_idx: HashMap<u64, usize> = page_sizes.iter().map(|&sz| (sz, 0)).collect();
    *pg_idx.get_mut(&0x1000).unwrap() = pds.len();
    let mut mr_pages: Vec<Vec<KernelObject>> = vec![Vec::new(); all_mrs.len()];
    for (mr_idx, mr) in all_mrs.iter().enumerate() {
        if mr.phys_addr.is_some() {
            continue;
        }
        let idx = pg_idx[&mr.page_size];
        mr_pages[mr_idx] = page_objects_by_size[&mr.page_size]
            [idx..idx + mr.page_count as usize]
            .to_vec();
        *pg_idx.get_mut(&mr.page_size).unwrap() += mr.page_count as usize;
    }

    // 2. Fixed-address pages, ascending physical address.
    let mut fixed_pages: Vec<(u64, usize)> = Vec::new();
    for (mr_idx, mr) in all_mrs.iter().enumerate() {
        let Some(base) = mr.phys_addr else { continue };
        let mut phys_addr = base;
        for _ in 0..mr.page_count {
            fixed_pages.push((phys_addr, mr_idx));
            phys_addr += mr.page_size;
        }
    }
    fixed_pages.sort_by_key(|&(phys_addr, _)| phys_addr);
    for (phys_addr, mr_idx) in fixed_pages {
        let mr = all_mrs[mr_idx];
        let obj_type = page_object_by_size(mr.page_size);
        let name = format!(
            "Page({}): MR={} @ {phys_addr:x}",
            human_size_strict(mr.page_size),
            mr.name
        );
        let page =
            init_system.allocate_fixed_objects(phys_addr, obj_type, &[name])?;
        mr_pages[mr_idx].extend(page);
    }

    // 3. TCBs, PDs then VMs.
    let tcb_names: Vec<String> = domains
        .iter()
        .map(|d| {
            if d.is_vm {
                format!("TCB: VM={}", d.name)
            } else {
                format!("TCB: PD={}", d.name)
            }
        })
        .collect();
    let tcb_objects = init_system.allocate_objects(ObjectType::Tcb, tcb_names, None)?;
    let tcb_caps: Vec<u64> = tcb_objects.iter().map(|obj| obj.cap_addr).collect();

    // 4. VCPUs, one per VM.
    let vcpu_names: Vec<String> = virtual_machines
        .iter()
        .map(|&(_, vm)| format!("VCPU: VM={}", vm.name))
        .collect();
    let vcpu_objects = init_system.allocate_objects(ObjectType::Vcpu, vcpu_names, None)?;

    // 5. Scheduling contexts, one per domain.
    let sched_context_names: Vec<String> = domains
        .iter()
        .map(|d| {
            if d.is_vm {
                format!("SchedContext: VM={}", d.name)
            } else {
                format!("SchedContext: PD={}", d.name)
            }
        })
        .collect();
    let sched_context_objects = init_system.allocate_objects(
        ObjectType::SchedContext,
        sched_context_names,
        Some(PD_SCHEDCONTEXT_SIZE),
    )?;
    let sched_caps: Vec<u64> = sched_context_objects.iter().map(|obj| obj.cap_addr).collect();

    // 6. Reply objects: the monitor's, then one per PD.
    let mut reply_names = vec!["Reply: Monitor".to_string()];
    reply_names.extend(pds.iter().map(|pd| format!("Reply: PD={}", pd.name)));
    let reply_objects = init_system.allocate_objects(ObjectType::Reply, reply_names, None)?;
    let reply_object = &reply_objects[0];
    let pd_reply_objects = &reply_objects[1..];

    // 7. Endpoints: the monitor's fault endpoint, then one per PD that
    // needs one.
    let pds_with_endpoints: Vec<usize> = (0..pds.len())
        .filter(|&idx| pd_needs_ep(idx, system))
        .collect();
    let mut endpoint_names = vec!["EP: Monitor Fault".to_string()];
    endpoint_names.extend(
        pds_with_endpoints
            .iter()
            .map(|&idx| format!("EP: PD={}", pds[idx].name)),
    );
    let endpoint_objects =
        init_system.allocate_objects(ObjectType::Endpoint, endpoint_names, None)?;
    let fault_ep_endpoint_object = &endpoint_objects[0];
    let pd_endpoint_objects: HashMap<usize, &KernelObject> = pds_with_endpoints
        .iter()
        .zip(&endpoint_objects[1..])
        .map(|(&idx, obj)| (idx, obj))
        .collect();

    // 8. Notifications, one per PD.
    let notification_names: Vec<String> = pds
        .iter()
        .map(|pd| format!("Notification: PD={}", pd.name))
        .collect();
    let notification_objects =
        init_system.allocate_objects(ObjectType::Notification, notification_names, None)?;
    let notification_caps: Vec<u64> =
        notification_objects.iter().map(|obj| obj.cap_addr).collect();

    // 9. Translation structures. For every domain, the vaddrs of all its
    // mappings (plus the IPC buffer for PDs) decide which tables each
    // level needs: one per distinct granule-aligned address.
    let levels = config.intermediate_levels();
    let mut level_tables: Vec<Vec<(usize, u64)>> = vec![Vec::new(); levels.len()];
    for dom_idx in 0..num_domains {
        let mut vaddrs: Vec<(u64, u64)> = Vec::new();
        if dom_idx < pds.len() {
            let (ipc_buffer_vaddr, _) = pd_elf_files[dom_idx]
                .find_symbol(IPC_BUFFER_SYMBOL)
                .map_err(|e| {
                    anyhow!(
                        "Error: PD '{}' program image: {e}",
                        pds[dom_idx].name
                    )
                })?;
            vaddrs.push((ipc_buffer_vaddr, 0x1000));
        }
        for map in &domain_maps[dom_idx] {
            let mr = all_mrs[mr_index_by_name[map.mr.as_str()]];
            let mut vaddr = map.vaddr;
            for _ in 0..mr.page_count {
                vaddrs.push((vaddr, mr.page_size));
                vaddr += mr.page_size;
            }
        }
        for (level_idx, level) in levels.iter().enumerate() {
            let mut table_vaddrs: Vec<u64> = vaddrs
                .iter()
                .filter(|&&(_, page_size)| page_size < (1 << level.granule_bits))
                .map(|&(vaddr, _)| crate::util::mask_bits(vaddr, level.granule_bits))
                .collect::<HashSet<u64>>()
                .into_iter()
                .collect();
            table_vaddrs.sort_unstable();
            level_tables[level_idx].extend(table_vaddrs.into_iter().map(|v| (dom_idx, v)));
        }
    }

    let vspace_names: Vec<String> = domains
        .iter()
        .map(|d| {
            if d.is_vm {
                format!("VSpace: VM={}", d.name)
            } else {
                format!("VSpace: PD={}", d.name)
            }
        })
        .collect();
    let vspace_objects = init_system.allocate_objects(ObjectType::VSpace, vspace_names, None)?;

    let level_short_name = |object_type: ObjectType| match object_type {
        ObjectType::PageUpperDirectory => "PageUpperDirectory",
        ObjectType::PageDirectory => "PageDirectory",
        ObjectType::PageTable => "PageTable",
        _ => unreachable!("not a translation-table object"),
    };
    let mut level_objects: Vec<Vec<KernelObject>> = Vec::with_capacity(levels.len());
    for (level_idx, level) in levels.iter().enumerate() {
        let names: Vec<String> = level_tables[level_idx]
            .iter()
            .map(|&(dom_idx, vaddr)| {
                let d = &domains[dom_idx];
                let kind = if d.is_vm { "VM" } else { "PD" };
                format!(
                    "{}: {kind}={} VADDR=0x{vaddr:x}",
                    level_short_name(level.object_type),
                    d.name
                )
            })
            .collect();
        level_objects.push(init_system.allocate_objects(level.object_type, names, None)?);
    }

    // 10. CNodes, one per domain.
    let cnode_names: Vec<String> = domains
        .iter()
        .map(|d| {
            if d.is_vm {
                format!("CNode: VM={}", d.name)
            } else {
                format!("CNode: PD={}", d.name)
            }
        })
        .collect();
    let cnode_objects =
        init_system.allocate_objects(ObjectType::CNode, cnode_names, Some(PD_CAP_SIZE))?;

    let mut cap_slot = init_system.cap_slot;
    let kernel_objects = init_system.objects;

    // 11. IRQ handlers, via the IRQ control cap (not retyped from memory).
    let mut irq_cap_addresses: Vec<Vec<u64>> = vec![Vec::new(); pds.len()];
    for (pd_idx, pd) in pds.iter().enumerate() {
        for sysirq in &pd.irqs {
            let cap_address = system_cap_address_mask | cap_slot;
            system_invocations.push(Invocation::new(InvocationArgs::IrqControlGetTrigger {
                irq_control: IRQ_CONTROL_CAP_ADDRESS,
                irq: sysirq.irq,
                trigger: sysirq.trigger as u64,
                dest_root: root_cnode_cap,
                dest_index: cap_address,
                dest_depth: config.cap_address_bits,
            }));
            cap_slot += 1;
            cap_address_names.insert(cap_address, format!("IRQ Handler: irq={}", sysirq.irq));
            irq_cap_addresses[pd_idx].push(cap_address);
        }
    }

    // Assign every VSpace to the initial ASID pool; one repeat block
    // covers them all.
    let mut invocation = Invocation::new(InvocationArgs::AsidPoolAssign {
        asid_pool: INIT_ASID_POOL_CAP_ADDRESS,
        vspace: vspace_objects[0].cap_addr,
    });
    invocation.repeat(
        num_domains as u64,
        InvocationArgs::AsidPoolAssign {
            asid_pool: 0,
            vspace: 1,
        },
    );
    system_invocations.push(invocation);

    // ----------------------------------------------------------------
    // Mint the derived caps the system needs.
    // ----------------------------------------------------------------

    // Page caps with each mapping's rights; execute is handled through the
    // mapping attributes, not the rights mask.
    struct PageDescriptor {
        cap_address: u64,
        dom_idx: usize,
        vaddr: u64,
        rights: u64,
        attrs: u64,
        count: u64,
        vaddr_incr: u64,
    }
    let mut page_descriptors: Vec<PageDescriptor> = Vec::new();
    for dom_idx in 0..num_domains {
        for map in &domain_maps[dom_idx] {
            let mr_idx = mr_index_by_name[map.mr.as_str()];
            let mr = all_mrs[mr_idx];
            let mut rights = 0;
            if map.has_perm('r') {
                rights |= SEL4_RIGHTS_READ;
            }
            if map.has_perm('w') {
                rights |= SEL4_RIGHTS_WRITE;
            }
            let attrs = page_attributes(config.arch, map.cached, map.has_perm('x'));

            let pages = &mr_pages[mr_idx];
            assert!(!pages.is_empty());
            assert_objects_adjacent(pages);

            let mut invocation = Invocation::new(InvocationArgs::CnodeMint {
                cnode: system_cnode_cap,
                dest_index: cap_slot,
                dest_depth: system_cnode_bits,
                src_root: root_cnode_cap,
                src_obj: pages[0].cap_addr,
                src_depth: config.cap_address_bits,
                rights,
                badge: 0,
            });
            invocation.repeat(
                pages.len() as u64,
                InvocationArgs::CnodeMint {
                    cnode: 0,
                    dest_index: 1,
                    dest_depth: 0,
                    src_root: 0,
                    src_obj: 1,
                    src_depth: 0,
                    rights: 0,
                    badge: 0,
                },
            );
            system_invocations.push(invocation);

            page_descriptors.push(PageDescriptor {
                cap_address: system_cap_address_mask | cap_slot,
                dom_idx,
                vaddr: map.vaddr,
                rights,
                attrs,
                count: pages.len() as u64,
                vaddr_incr: mr.page_size,
            });

            for (idx, page) in pages.iter().enumerate() {
                cap_address_names.insert(
                    system_cap_address_mask | (cap_slot + idx as u64),
                    format!("{} (derived)", page.name),
                );
            }
            cap_slot += pages.len() as u64;
        }
    }

    // Badged notification caps for interrupt delivery.
    let mut badged_irq_caps: Vec<Vec<u64>> = vec![Vec::new(); pds.len()];
    for (pd_idx, pd) in pds.iter().enumerate() {
        for sysirq in &pd.irqs {
            let badge = 1 << sysirq.id;
            let badged_cap_address = system_cap_address_mask | cap_slot;
            system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
                cnode: system_cnode_cap,
                dest_index: cap_slot,
                dest_depth: system_cnode_bits,
                src_root: root_cnode_cap,
                src_obj: notification_objects[pd_idx].cap_addr,
                src_depth: config.cap_address_bits,
                rights: SEL4_RIGHTS_ALL,
                badge,
            }));
            cap_address_names.insert(
                badged_cap_address,
                format!("{} (badge=0x{badge:x})", notification_objects[pd_idx].name),
            );
            badged_irq_caps[pd_idx].push(badged_cap_address);
            cap_slot += 1;
        }
    }

    // Badged fault endpoints: root PDs fault to the monitor, children and
    // VMs to their parent's endpoint.
    let badged_fault_ep = system_cap_address_mask | cap_slot;
    for (idx, pd) in pds.iter().enumerate() {
        let (fault_ep_cap, badge) = match pd.parent {
            None => (fault_ep_endpoint_object.cap_addr, idx as u64 + 1),
            Some(parent_idx) => {
                let pd_id = pd.pd_id.expect("child PD has an id");
                (
                    pd_endpoint_objects[&parent_idx].cap_addr,
                    1 << 62 | pd_id,
                )
            }
        };
        system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
            cnode: system_cnode_cap,
            dest_index: cap_slot,
            dest_depth: system_cnode_bits,
            src_root: root_cnode_cap,
            src_obj: fault_ep_cap,
            src_depth: config.cap_address_bits,
            rights: SEL4_RIGHTS_ALL,
            badge,
        }));
        cap_slot += 1;
    }
    for &(host_idx, vm) in &virtual_machines {
        let fault_ep_cap = pd_endpoint_objects[&host_idx].cap_addr;
        let badge = 1 << 62 | vm.vm_id;
        system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
            cnode: system_cnode_cap,
            dest_index: cap_slot,
            dest_depth: system_cnode_bits,
            src_root: root_cnode_cap,
            src_obj: fault_ep_cap,
            src_depth: config.cap_address_bits,
            rights: SEL4_RIGHTS_ALL,
            badge,
        }));
        cap_slot += 1;
    }

    let final_cap_slot = cap_slot;

    // ----------------------------------------------------------------
    // Populate each PD's CSpace at the well-known indices.
    // ----------------------------------------------------------------

    // Index 1: the input cap — the PD's endpoint when it accepts protected
    // procedure calls, its own notification otherwise.
    for (pd_idx, pd) in pds.iter().enumerate() {
        let obj_cap_addr = if pd.pp {
            pd_endpoint_objects[&pd_idx].cap_addr
        } else {
            notification_objects[pd_idx].cap_addr
        };
        assert!(INPUT_CAP_IDX < PD_CAP_SIZE);
        system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
            cnode: cnode_objects[pd_idx].cap_addr,
            dest_index: INPUT_CAP_IDX,
            dest_depth: PD_CAP_BITS,
            src_root: root_cnode_cap,
            src_obj: obj_cap_addr,
            src_depth: config.cap_address_bits,
            rights: SEL4_RIGHTS_ALL,
            badge: 0,
        }));
    }

    // Index 4: the reply object, one repeat block across all PDs.
    assert!(REPLY_CAP_IDX < PD_CAP_SIZE);
    let mut invocation = Invocation::new(InvocationArgs::CnodeMint {
        cnode: cnode_objects[0].cap_addr,
        dest_index: REPLY_CAP_IDX,
        dest_depth: PD_CAP_BITS,
        src_root: root_cnode_cap,
        src_obj: pd_reply_objects[0].cap_addr,
        src_depth: config.cap_address_bits,
        rights: SEL4_RIGHTS_ALL,
        badge: 1,
    });
    invocation.repeat(
        pds.len() as u64,
        InvocationArgs::CnodeMint {
            cnode: 1,
            dest_index: 0,
            dest_depth: 0,
            src_root: 0,
            src_obj: 1,
            src_depth: 0,
            rights: 0,
            badge: 0,
        },
    );
    system_invocations.push(invocation);

    // Index 3: the VSpace root, for introspection, across all domains.
    assert!(VSPACE_CAP_IDX < PD_CAP_SIZE);
    let mut invocation = Invocation::new(InvocationArgs::CnodeMint {
        cnode: cnode_objects[0].cap_addr,
        dest_index: VSPACE_CAP_IDX,
        dest_depth: PD_CAP_BITS,
        src_root: root_cnode_cap,
        src_obj: vspace_objects[0].cap_addr,
        src_depth: config.cap_address_bits,
        rights: SEL4_RIGHTS_ALL,
        badge: 0,
    });
    invocation.repeat(
        num_domains as u64,
        InvocationArgs::CnodeMint {
            cnode: 1,
            dest_index: 0,
            dest_depth: 0,
            src_root: 0,
            src_obj: 1,
            src_depth: 0,
            rights: 0,
            badge: 0,
        },
    );
    system_invocations.push(invocation);

    // Index 5: the monitor endpoint, for passive PDs, badged like the
    // fault endpoint.
    for (pd_idx, pd) in pds.iter().enumerate() {
        if !pd.passive {
            continue;
        }
        assert!(MONITOR_EP_CAP_IDX < PD_CAP_SIZE);
        system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
            cnode: cnode_objects[pd_idx].cap_addr,
            dest_index: MONITOR_EP_CAP_IDX,
            dest_depth: PD_CAP_BITS,
            src_root: root_cnode_cap,
            src_obj: fault_ep_endpoint_object.cap_addr,
            src_depth: config.cap_address_bits,
            rights: SEL4_RIGHTS_ALL,
            badge: pd_idx as u64 + 1,
        }));
    }

    // Indices 138..: IRQ handler caps, keyed by channel id.
    for (pd_idx, pd) in pds.iter().enumerate() {
        for (sysirq, &irq_cap_address) in pd.irqs.iter().zip(&irq_cap_addresses[pd_idx]) {
            let cap_idx = BASE_IRQ_CAP + sysirq.id;
            assert!(cap_idx < PD_CAP_SIZE);
            system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
                cnode: cnode_objects[pd_idx].cap_addr,
                dest_index: cap_idx,
                dest_depth: PD_CAP_BITS,
                src_root: root_cnode_cap,
                src_obj: irq_cap_address,
                src_depth: config.cap_address_bits,
                rights: SEL4_RIGHTS_ALL,
                badge: 0,
            }));
        }
    }

    // Indices 202..: child PD TCBs in the parent's CSpace.
    for pd_idx in 0..pds.len() {
        for child_idx in system.children_of(pd_idx) {
            let child = &pds[child_idx];
            let cap_idx = BASE_PD_TCB_CAP + child.pd_id.expect("child PD has an id");
            assert!(cap_idx < PD_CAP_SIZE);
            system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
                cnode: cnode_objects[pd_idx].cap_addr,
                dest_index: cap_idx,
                dest_depth: PD_CAP_BITS,
                src_root: root_cnode_cap,
                src_obj: tcb_objects[child_idx].cap_addr,
                src_depth: config.cap_address_bits,
                rights: SEL4_RIGHTS_ALL,
                badge: 0,
            }));
        }
    }

    // Indices 266.. and 330..: the VM's TCB and VCPU in the host's CSpace.
    for (vm_idx, &(host_idx, vm)) in virtual_machines.iter().enumerate() {
        let vm_tcb_cap = tcb_objects[pds.len() + vm_idx].cap_addr;
        let tcb_idx = BASE_VM_TCB_CAP + vm.vm_id;
        let vcpu_idx = BASE_VCPU_CAP + vm.vm_id;
        assert!(tcb_idx < PD_CAP_SIZE && vcpu_idx < PD_CAP_SIZE);
        system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
            cnode: cnode_objects[host_idx].cap_addr,
            dest_index: tcb_idx,
            dest_depth: PD_CAP_BITS,
            src_root: root_cnode_cap,
            src_obj: vm_tcb_cap,
            src_depth: config.cap_address_bits,
            rights: SEL4_RIGHTS_ALL,
            badge: 0,
        }));
        system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
            cnode: cnode_objects[host_idx].cap_addr,
            dest_index: vcpu_idx,
            dest_depth: PD_CAP_BITS,
            src_root: root_cnode_cap,
            src_obj: vcpu_objects[vm_idx].cap_addr,
            src_depth: config.cap_address_bits,
            rights: SEL4_RIGHTS_ALL,
            badge: 0,
        }));
    }

    // Channels: each end gets a badged cap to its partner's notification
    // (and endpoint, when the partner accepts protected calls).
    for cc in &system.channels {
        let pd_a = system.pd_index(&cc.pd_a).expect("validated channel end");
        let pd_b = system.pd_index(&cc.pd_b).expect("validated channel end");

        for (this_pd, this_id, other_pd, other_id) in [
            (pd_a, cc.id_a, pd_b, cc.id_b),
            (pd_b, cc.id_b, pd_a, cc.id_a),
        ] {
            let cap_idx = BASE_OUTPUT_NOTIFICATION_CAP + this_id;
            let badge = 1 << other_id;
            assert!(cap_idx < PD_CAP_SIZE);
            system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
                cnode: cnode_objects[this_pd].cap_addr,
                dest_index: cap_idx,
                dest_depth: PD_CAP_BITS,
                src_root: root_cnode_cap,
                src_obj: notification_objects[other_pd].cap_addr,
                src_depth: config.cap_address_bits,
                rights: SEL4_RIGHTS_ALL,
                badge,
            }));

            if pds[other_pd].pp {
                let cap_idx = BASE_OUTPUT_ENDPOINT_CAP + this_id;
                let badge = 1 << 63 | other_id;
                assert!(cap_idx < PD_CAP_SIZE);
                system_invocations.push(Invocation::new(InvocationArgs::CnodeMint {
                    cnode: cnode_objects[this_pd].cap_addr,
                    dest_index: cap_idx,
                    dest_depth: PD_CAP_BITS,
                    src_root: root_cnode_cap,
                    src_obj: pd_endpoint_objects[&other_pd].cap_addr,
                    src_depth: config.cap_address_bits,
                    rights: SEL4_RIGHTS_ALL,
                    badge,
                }));
            }
        }
    }

    // Tie each IRQ handler to its badged notification.
    for pd_idx in 0..pds.len() {
        for (&irq_cap_address, &badged_notification_cap_address) in
            irq_cap_addresses[pd_idx].iter().zip(&badged_irq_caps[pd_idx])
        {
            system_invocations.push(Invocation::new(
                InvocationArgs::IrqHandlerSetNotification {
                    irq_handler: irq_cap_address,
                    notification: badged_notification_cap_address,
                },
            ));
        }
    }

    // ----------------------------------------------------------------
    // Install the VSpaces: tables top-down, then pages, then IPC buffers.
    // ----------------------------------------------------------------

    for (level_idx, level) in levels.iter().enumerate() {
        for (&(dom_idx, vaddr), obj) in level_tables[level_idx].iter().zip(&level_objects[level_idx])
        {
            let vspace = vspace_objects[dom_idx].cap_addr;
            let attr = default_vm_attributes(config.arch);
            let args = match level.object_type {
                ObjectType::PageUpperDirectory => InvocationArgs::PageUpperDirectoryMap {
                    page_upper_directory: obj.cap_addr,
                    vspace,
                    vaddr,
                    attr,
                },
                ObjectType::PageDirectory => InvocationArgs::PageDirectoryMap {
                    page_directory: obj.cap_addr,
                    vspace,
                    vaddr,
                    attr,
                },
                ObjectType::PageTable => InvocationArgs::PageTableMap {
                    page_table: obj.cap_addr,
                    vspace,
                    vaddr,
                    attr,
                },
                _ => unreachable!("not a translation-table object"),
            };
            system_invocations.push(Invocation::new(args));
        }
    }

    for desc in &page_descriptors {
        let mut invocation = Invocation::new(InvocationArgs::PageMap {
            page: desc.cap_address,
            vspace: vspace_objects[desc.dom_idx].cap_addr,
            vaddr: desc.vaddr,
            rights: desc.rights,
            attr: desc.attrs,
        });
        invocation.repeat(
            desc.count,
            InvocationArgs::PageMap {
                page: 1,
                vspace: 0,
                vaddr: desc.vaddr_incr,
                rights: 0,
                attr: 0,
            },
        );
        system_invocations.push(invocation);
    }

    for (pd_idx, pd) in pds.iter().enumerate() {
        let (ipc_buffer_vaddr, _) = pd_elf_files[pd_idx]
            .find_symbol(IPC_BUFFER_SYMBOL)
            .map_err(|e| anyhow!("Error: PD '{}' program image: {e}", pd.name))?;
        system_invocations.push(Invocation::new(InvocationArgs::PageMap {
            page: ipc_buffer_objects[pd_idx].cap_addr,
            vspace: vspace_objects[pd_idx].cap_addr,
            vaddr: ipc_buffer_vaddr,
            rights: SEL4_RIGHTS_READ | SEL4_RIGHTS_WRITE,
            attr: page_attributes(config.arch, true, false),
        }));
    }

    // ----------------------------------------------------------------
    // Configure and start the threads.
    // ----------------------------------------------------------------

    for (idx, (domain, sched_obj)) in domains.iter().zip(&sched_context_objects).enumerate() {
        system_invocations.push(Invocation::new(
            InvocationArgs::SchedControlConfigureFlags {
                sched_control: kernel_boot_info.schedcontrol_cap + domain.cpu,
                sched_context: sched_obj.cap_addr,
                budget: domain.budget,
                period: domain.period,
                extra_refills: 0,
                badge: 0x100 + idx as u64,
                flags: 0,
            },
        ));
    }

    for (idx, (domain, tcb_obj)) in domains.iter().zip(&tcb_objects).enumerate() {
        system_invocations.push(Invocation::new(InvocationArgs::TcbSetSchedParams {
            tcb: tcb_obj.cap_addr,
            authority: INIT_TCB_CAP_ADDRESS,
            mcp: domain.priority,
            priority: domain.priority,
            sched_context: sched_context_objects[idx].cap_addr,
            fault_ep: badged_fault_ep + idx as u64,
        }));
    }

    // Each PD gets a copy of its own TCB cap for debugging.
    for pd_idx in 0..pds.len() {
        assert!(TCB_CAP_IDX < PD_CAP_SIZE);
        system_invocations.push(Invocation::new(InvocationArgs::CnodeCopy {
            cnode: cnode_objects[pd_idx].cap_addr,
            dest_index: TCB_CAP_IDX,
            dest_depth: PD_CAP_BITS,
            src_root: root_cnode_cap,
            src_obj: tcb_objects[pd_idx].cap_addr,
            src_depth: config.cap_address_bits,
            rights: SEL4_RIGHTS_ALL,
        }));
    }

    let mut invocation = Invocation::new(InvocationArgs::TcbSetSpace {
        tcb: tcb_objects[0].cap_addr,
        fault_ep: badged_fault_ep,
        cspace_root: cnode_objects[0].cap_addr,
        cspace_root_data: config.cap_address_bits - PD_CAP_BITS,
        vspace_root: vspace_objects[0].cap_addr,
        vspace_root_data: 0,
    });
    invocation.repeat(
        num_domains as u64,
        InvocationArgs::TcbSetSpace {
            tcb: 1,
            fault_ep: 1,
            cspace_root: 1,
            cspace_root_data: 0,
            vspace_root: 1,
            vspace_root_data: 0,
        },
    );
    system_invocations.push(invocation);

    for (pd_idx, tcb_obj) in tcb_objects.iter().take(pds.len()).enumerate() {
        let (ipc_buffer_vaddr, _) = pd_elf_files[pd_idx].find_symbol(IPC_BUFFER_SYMBOL)?;
        system_invocations.push(Invocation::new(InvocationArgs::TcbSetIpcBuffer {
            tcb: tcb_obj.cap_addr,
            buffer: ipc_buffer_vaddr,
            buffer_frame: ipc_buffer_objects[pd_idx].cap_addr,
        }));
    }

    for (pd_idx, tcb_obj) in tcb_objects.iter().take(pds.len()).enumerate() {
        let regs = match config.arch {
            Arch::Aarch64 => Regs::Aarch64(Box::new(Aarch64Regs {
                pc: pd_elf_files[pd_idx].entry,
                ..Aarch64Regs::default()
            })),
            Arch::Riscv64 => Regs::Riscv(Box::new(RiscvRegs {
                pc: pd_elf_files[pd_idx].entry,
                ..RiscvRegs::default()
            })),
            Arch::X86_64 => unreachable!("x86_64 image generation is rejected at startup"),
        };
        system_invocations.push(Invocation::new(InvocationArgs::TcbWriteRegisters {
            tcb: tcb_obj.cap_addr,
            resume: false,
            arch_flags: 0,
            regs,
        }));
    }

    let mut invocation = Invocation::new(InvocationArgs::TcbBindNotification {
        tcb: tcb_objects[0].cap_addr,
        notification: notification_objects[0].cap_addr,
    });
    invocation.repeat(
        pds.len() as u64,
        InvocationArgs::TcbBindNotification {
            tcb: 1,
            notification: 1,
        },
    );
    system_invocations.push(invocation);

    if !virtual_machines.is_empty() {
        let mut invocation = Invocation::new(InvocationArgs::VcpuSetTcb {
            vcpu: vcpu_objects[0].cap_addr,
            tcb: tcb_objects[pds.len()].cap_addr,
        });
        invocation.repeat(
            virtual_machines.len() as u64,
            InvocationArgs::VcpuSetTcb { vcpu: 1, tcb: 1 },
        );
        system_invocations.push(invocation);
    }

    // Start the PDs; VMs are started by their host.
    let mut invocation = Invocation::new(InvocationArgs::TcbResume {
        tcb: tcb_objects[0].cap_addr,
    });
    invocation.repeat(pds.len() as u64, InvocationArgs::TcbResume { tcb: 1 });
    system_invocations.push(invocation);

    // ----------------------------------------------------------------
    // Patch the PD images, then materialize the reserved-region blobs
    // from the patched segments.
    // ----------------------------------------------------------------

    for (pd_idx, pd) in pds.iter().enumerate() {
        let mut name_bytes = [0u8; 16];
        let name = pd.name.as_bytes();
        let len = name.len().min(16);
        name_bytes[..len].copy_from_slice(&name[..len]);
        pd_elf_files[pd_idx]
            .write_symbol("microkit_name", &name_bytes)
            .map_err(|_| {
                anyhow!(
                    "Unable to patch variable 'microkit_name' in protection domain: '{}': \
                     variable not found.",
                    pd.name
                )
            })?;
        if pd_elf_files[pd_idx].find_symbol_if_exists("passive")?.is_some() {
            pd_elf_files[pd_idx].write_symbol("passive", &[u8::from(pd.passive)])?;
        }
    }

    for (pd_idx, pd) in pds.iter().enumerate() {
        for setvar in &pd.setvars {
            let value = match &setvar.kind {
                SetVarKind::RegionPaddr(region) => {
                    let mr_idx = system
                        .memory_regions
                        .iter()
                        .position(|mr| &mr.name == region)
                        .ok_or_else(|| {
                            anyhow!("Error: can't find region: {region}")
                        })?;
                    mr_pages[mr_idx][0].phys_addr
                }
                SetVarKind::Vaddr(vaddr) => *vaddr,
            };
            pd_elf_files[pd_idx]
                .write_symbol(&setvar.symbol, &value.to_le_bytes())
                .map_err(|_| {
                    anyhow!(
                        "Unable to patch variable '{}' in protection domain: '{}': \
                         variable not found.",
                        setvar.symbol,
                        pd.name
                    )
                })?;
        }
    }

    let mut regions: Vec<Region> = Vec::with_capacity(pd_elf_layout.len() + vm_regions.len());
    for (name, addr, pd_idx, seg_idx) in pd_elf_layout {
        regions.push(Region {
            name,
            addr,
            data: pd_elf_files[pd_idx].segments[seg_idx].data.clone(),
        });
    }
    regions.extend(vm_regions);

    let invocation_data_size: u64 = system_invocations
        .iter()
        .map(|inv| inv.size_bytes(config))
        .sum();

    Ok(BuiltSystem {
        number_of_system_caps: final_cap_slot,
        invocation_data_size,
        bootstrap_invocations,
        system_invocations,
        kernel_boot_info,
        reserved_region,
        fault_ep_cap_address: fault_ep_endpoint_object.cap_addr,
        reply_cap_address: reply_object.cap_addr,
        cap_lookup: cap_address_names,
        tcb_caps,
        sched_caps,
        notification_caps,
        regions,
        kernel_objects,
        initial_task_virt_region,
        initial_task_phys_region,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysxml::{PlatformDescription, parse_system};
    use muon_elf::testelf::TestElf;

    const KERNEL_PHYS_BASE: u64 = 0x6000_0000;
    const KERNEL_VIRT_BASE: u64 = 0xffff_ff80_6000_0000;
    const MONITOR_VIRT: u64 = 0x40_0000;
    const PD_ENTRY: u64 = 0x20_0000;

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

    /// Kernel fixture: 128 MiB of RAM, 2 MiB kernel image, 1 MiB of it
    /// boot-only.
    fn kernel_elf() -> ElfFile {
        let mut avail = Vec::new();
        avail.extend_from_slice(&KERNEL_PHYS_BASE.to_le_bytes());
        avail.extend_from_slice(&(KERNEL_PHYS_BASE + 0x800_0000).to_le_bytes());
        let mut data = vec![0u8; 0x1000];
        data[..avail.len()].copy_from_slice(&avail);

        let bytes = TestElf::new()
            .entry(KERNEL_VIRT_BASE)
            .segment(KERNEL_PHYS_BASE, KERNEL_VIRT_BASE, data, 0x1000)
            .symbol("avail_p_regs", KERNEL_VIRT_BASE, 16)
            .symbol("ki_end", KERNEL_VIRT_BASE + 0x20_0000, 0)
            .symbol("ki_boot_end", KERNEL_VIRT_BASE + 0x10_0000, 0)
            .build();
        ElfFile::parse(&bytes).expect("valid kernel fixture")
    }

    /// Monitor fixture: one two-page segment.
    fn monitor_elf() -> ElfFile {
        let bytes = TestElf::new()
            .entry(MONITOR_VIRT)
            .segment(0, MONITOR_VIRT, vec![0u8; 0x2000], 0x2000)
            .symbol("unused", MONITOR_VIRT, 0)
            .build();
        ElfFile::parse(&bytes).expect("valid monitor fixture")
    }

    /// PD program fixture: one executable page with the patchable symbols
    /// and an IPC buffer on the following page.
    fn pd_elf_bytes() -> Vec<u8> {
        TestElf::new()
            .entry(PD_ENTRY)
            .segment(0, PD_ENTRY, vec![0u8; 0x1000], 0x1000)
            .symbol(IPC_BUFFER_SYMBOL, PD_ENTRY + 0x1000, 0)
            .symbol("microkit_name", PD_ENTRY + 0x10, 16)
            .symbol("passive", PD_ENTRY + 0x20, 1)
            .symbol("dma_paddr", PD_ENTRY + 0x28, 8)
            .build()
    }

    /// Write one fixture program image per referenced name into a fresh
    /// directory under the system temp dir.
    fn fixture_dir(test: &str, image_names: &[&str]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("muon-builder-{test}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create fixture dir");
        for name in image_names {
            std::fs::write(dir.join(name), pd_elf_bytes()).expect("write fixture image");
        }
        dir
    }

    fn build_sized(
        test: &str,
        xml: &str,
        image_names: &[&str],
        invocation_table_size: u64,
        system_cnode_size: u64,
    ) -> Result<BuiltSystem> {
        let config = test_config();
        let system = parse_system("test.system", xml, &PlatformDescription::default()).unwrap();
        let dir = fixture_dir(test, image_names);
        let result = build_system(
            &config,
            &kernel_elf(),
            &monitor_elf(),
            &system,
            invocation_table_size,
            system_cnode_size,
            &[dir.clone()],
        );
        let _ = std::fs::remove_dir_all(&dir);
        result
    }

    fn build(test: &str, xml: &str, image_names: &[&str]) -> BuiltSystem {
        build_sized(test, xml, image_names, 0x1000, 1024).expect("build should succeed")
    }

    fn count_objects(built: &BuiltSystem, object_type: ObjectType) -> usize {
        built
            .kernel_objects
            .iter()
            .filter(|obj| obj.object_type == object_type)
            .count()
    }

    fn serialize(built: &BuiltSystem) -> Vec<u8> {
        let config = test_config();
        let mut data = Vec::new();
        for invocation in &built.system_invocations {
            invocation.add_raw_invocation(&config, &mut data);
        }
        data
    }

    /// Every CNodeMint in the system stream, as (cnode, dest_index,
    /// src_obj, badge).
    fn mints(built: &BuiltSystem) -> Vec<(u64, u64, u64, u64)> {
        built
            .system_invocations
            .iter()
            .filter_map(|inv| match inv.args() {
                InvocationArgs::CnodeMint {
                    cnode,
                    dest_index,
                    src_obj,
                    badge,
                    ..
                } => Some((*cnode, *dest_index, *src_obj, *badge)),
                _ => None,
            })
            .collect()
    }

    fn object_named<'a>(built: &'a BuiltSystem, name: &str) -> &'a KernelObject {
        built
            .kernel_objects
            .iter()
            .find(|obj| obj.name == name)
            .unwrap_or_else(|| panic!("no object named '{name}'"))
    }

    fn region_named<'a>(built: &'a BuiltSystem, name: &str) -> &'a Region {
        built
            .regions
            .iter()
            .find(|region| region.name == name)
            .unwrap_or_else(|| panic!("no region named '{name}'"))
    }

    const S1_XML: &str = r#"<system>
    <memory_region name="buf" size="0x1000" />
    <protection_domain name="hello" priority="100" budget="1000" period="1000">
        <program_image path="hello.elf" />
        <map mr="buf" vaddr="0x10000" perms="rw" />
    </protection_domain>
</system>"#;

    #[test]
    fn s1_single_pd_object_counts() {
        let built = build("s1", S1_XML, &["hello.elf"]);

        assert_eq!(count_objects(&built, ObjectType::Tcb), 1);
        assert_eq!(count_objects(&built, ObjectType::VSpace), 1);
        assert_eq!(count_objects(&built, ObjectType::CNode), 1);
        assert_eq!(count_objects(&built, ObjectType::Notification), 1);
        assert_eq!(count_objects(&built, ObjectType::SchedContext), 1);
        assert_eq!(count_objects(&built, ObjectType::Vcpu), 0);

        // No interrupts configured.
        let irq_invocations = built
            .system_invocations
            .iter()
            .filter(|inv| matches!(inv.args(), InvocationArgs::IrqControlGetTrigger { .. }))
            .count();
        assert_eq!(irq_invocations, 0);

        // CSpace construction (5) + page retype + page-table retype + the
        // two repeat-block maps.
        assert_eq!(built.bootstrap_invocations.len(), 9);
    }

    #[test]
    fn s1_predicted_invocation_size_matches_emission() {
        let built = build("s1size", S1_XML, &["hello.elf"]);
        let data = serialize(&built);
        assert_eq!(data.len() as u64, built.invocation_data_size);
    }

    #[test]
    fn s1_cap_slot_accounting() {
        let built = build("s1caps", S1_XML, &["hello.elf"]);
        // Bootstrap consumes two system-CNode slots (one invocation-table
        // page, one page table); then 15 objects, two minted map groups,
        // and one badged fault endpoint.
        assert_eq!(built.kernel_objects.len(), 15);
        assert_eq!(built.number_of_system_caps, 20);
    }

    #[test]
    fn s1_fault_ep_and_patched_name() {
        let built = build("s1ep", S1_XML, &["hello.elf"]);
        assert_eq!(
            built.cap_lookup[&built.fault_ep_cap_address],
            "EP: Monitor Fault"
        );
        // The image blob carries the patched PD name (the fixture places
        // `microkit_name` at segment offset 0x10).
        let region = region_named(&built, "PD-ELF hello-0");
        assert_eq!(&region.data[0x10..0x15], b"hello");
        assert!(region.data[0x15..0x20].iter().all(|&b| b == 0));
    }

    const S2_XML: &str = r#"<system>
    <protection_domain name="a" priority="10">
        <program_image path="a.elf" />
    </protection_domain>
    <protection_domain name="b" priority="10">
        <program_image path="b.elf" />
    </protection_domain>
    <channel>
        <end pd="a" id="3" />
        <end pd="b" id="5" />
    </channel>
</system>"#;

    #[test]
    fn s2_channel_notification_caps() {
        let built = build("s2", S2_XML, &["a.elf", "b.elf"]);
        let cnode_a = object_named(&built, "CNode: PD=a").cap_addr;
        let cnode_b = object_named(&built, "CNode: PD=b").cap_addr;
        let ntfn_a = object_named(&built, "Notification: PD=a").cap_addr;
        let ntfn_b = object_named(&built, "Notification: PD=b").cap_addr;

        let mints = mints(&built);
        // a's slot 13 (10 + 3) holds b's notification badged 1 << 5.
        assert!(mints.contains(&(cnode_a, 13, ntfn_b, 0x20)));
        assert_eq!(built.cap_lookup[&ntfn_b], "Notification: PD=b");
        // b's slot 15 (10 + 5) holds a's notification badged 1 << 3.
        assert!(mints.contains(&(cnode_b, 15, ntfn_a, 0x8)));

        // Neither PD accepts protected calls: no endpoint caps minted into
        // the channel range.
        for &(cnode, dest_index, _, _) in &mints {
            if cnode == cnode_a || cnode == cnode_b {
                assert!(
                    !(BASE_OUTPUT_ENDPOINT_CAP..BASE_IRQ_CAP).contains(&dest_index),
                    "unexpected endpoint cap at slot {dest_index}"
                );
            }
        }
    }

    const S3_XML: &str = r#"<system>
    <protection_domain name="driver" priority="200">
        <program_image path="driver.elf" />
        <irq irq="37" id="2" />
    </protection_domain>
</system>"#;

    #[test]
    fn s3_irq_wiring() {
        let built = build("s3", S3_XML, &["driver.elf"]);

        // One handler issued for IRQ 37.
        let handlers: Vec<(u64, u64)> = built
            .system_invocations
            .iter()
            .filter_map(|inv| match inv.args() {
                InvocationArgs::IrqControlGetTrigger {
                    irq, dest_index, ..
                } => Some((*irq, *dest_index)),
                _ => None,
            })
            .collect();
        assert_eq!(handlers.len(), 1);
        let (irq, handler_cap) = handlers[0];
        assert_eq!(irq, 37);
        assert_eq!(built.cap_lookup[&handler_cap], "IRQ Handler: irq=37");

        // One notification cap badged 1 << 2, tied to the handler.
        let ntfn = object_named(&built, "Notification: PD=driver").cap_addr;
        let badged: Vec<u64> = mints(&built)
            .iter()
            .filter(|&&(_, _, src, badge)| src == ntfn && badge == 4)
            .map(|&(_, dest, _, _)| dest)
            .collect();
        assert_eq!(badged.len(), 1);

        let ties: Vec<(u64, u64)> = built
            .system_invocations
            .iter()
            .filter_map(|inv| match inv.args() {
                InvocationArgs::IrqHandlerSetNotification {
                    irq_handler,
                    notification,
                } => Some((*irq_handler, *notification)),
                _ => None,
            })
            .collect();
        assert_eq!(ties.len(), 1);
        assert_eq!(ties[0].0, handler_cap);
        assert!(built.cap_lookup[&ties[0].1].contains("badge=0x4"));

        // The handler cap sits at CSpace slot 140 (138 + 2).
        let cnode = object_named(&built, "CNode: PD=driver").cap_addr;
        assert!(mints(&built).contains(&(cnode, 140, handler_cap, 0)));
    }

    const S4_XML: &str = r#"<system>
    <protection_domain name="parent" priority="100">
        <program_image path="parent.elf" />
        <protection_domain name="kid" pd_id="1" priority="50">
            <program_image path="kid.elf" />
        </protection_domain>
    </protection_domain>
</system>"#;

    #[test]
    fn s4_parent_child_wiring() {
        let built = build("s4", S4_XML, &["parent.elf", "kid.elf"]);

        // The child faults to the parent's endpoint, badged (1 << 62) | 1.
        let parent_ep = object_named(&built, "EP: PD=parent").cap_addr;
        let kid_badge = (1u64 << 62) | 1;
        assert!(
            mints(&built)
                .iter()
                .any(|&(_, _, src, badge)| src == parent_ep && badge == kid_badge)
        );

        // The parent holds the child's TCB at slot 203 (202 + 1).
        let parent_cnode = object_named(&built, "CNode: PD=parent").cap_addr;
        let kid_tcb = object_named(&built, "TCB: PD=kid").cap_addr;
        assert!(mints(&built).contains(&(parent_cnode, 203, kid_tcb, 0)));
    }

    const S5_XML: &str = r#"<system>
    <memory_region name="dev" size="0x1000" phys_addr="0x40003000" />
    <protection_domain name="driver" priority="100">
        <program_image path="driver.elf" />
        <map mr="dev" vaddr="0x30000" perms="rw" cached="false" />
    </protection_domain>
</system>"#;

    #[test]
    fn s5_fixed_address_padding() {
        let built = build("s5", S5_XML, &["driver.elf"]);

        // The page for the fixed MR lands exactly at its physical address.
        let page = object_named(&built, "Page(4 KiB): MR=dev @ 40003000");
        assert_eq!(page.phys_addr, 0x4000_3000);

        // The gap [0x40000000, 0x40003000) inside the device untyped is
        // padded with untypeds of 0x2000 then 0x1000 (alignment-limited),
        // immediately before the page's own retype.
        let retypes: Vec<(ObjectType, u64, u64)> = built
            .system_invocations
            .iter()
            .filter_map(|inv| match inv.args() {
                InvocationArgs::UntypedRetype {
                    untyped,
                    object_type,
                    size_bits,
                    ..
                } => Some((*object_type, *size_bits, *untyped)),
                _ => None,
            })
            .collect();
        let pad_pos = retypes
            .iter()
            .position(|&(ot, bits, _)| ot == ObjectType::Untyped && bits == 13)
            .expect("first padding untyped");
        assert_eq!(retypes[pad_pos + 1].0, ObjectType::Untyped);
        assert_eq!(retypes[pad_pos + 1].1, 12);
        assert_eq!(retypes[pad_pos + 2].0, ObjectType::SmallPage);
        // All three retype the same source untyped.
        assert_eq!(retypes[pad_pos].2, retypes[pad_pos + 1].2);
        assert_eq!(retypes[pad_pos].2, retypes[pad_pos + 2].2);
    }

    #[test]
    fn s6_sizing_loop_converges() {
        // 64 IRQs across two PDs overflow both initial size estimates.
        let mut pds = String::new();
        for (pd, irq_base) in [("eth", 100), ("usb", 200)] {
            pds.push_str(&format!(
                "    <protection_domain name=\"{pd}\" priority=\"10\">\n        \
                 <program_image path=\"{pd}.elf\" />\n"
            ));
            for i in 0..32 {
                pds.push_str(&format!(
                    "        <irq irq=\"{}\" id=\"{i}\" />\n",
                    irq_base + i
                ));
            }
            pds.push_str("    </protection_domain>\n");
        }
        let xml = format!("<system>\n{pds}</system>");

        let config = test_config();
        let mut invocation_table_size = config.minimum_page_size;
        let mut system_cnode_size = 2;
        let mut iterations = 0;
        let built = loop {
            iterations += 1;
            assert!(iterations <= 5, "sizing loop failed to converge");
            let built = build_sized(
                "s6",
                &xml,
                &["eth.elf", "usb.elf"],
                invocation_table_size,
                system_cnode_size,
            )
            .expect("build should succeed");
            if built.number_of_system_caps <= system_cnode_size
                && built.invocation_data_size <= invocation_table_size
            {
                break built;
            }
            invocation_table_size = invocation_table_size.max(round_up(
                built.invocation_data_size,
                config.minimum_page_size,
            ));
            system_cnode_size =
                system_cnode_size.max(built.number_of_system_caps.next_power_of_two());
        };

        assert!(iterations > 1, "fixture should overflow the first estimate");
        assert!(system_cnode_size.is_power_of_two());
        assert!(system_cnode_size >= built.number_of_system_caps);
        assert_eq!(invocation_table_size % config.minimum_page_size, 0);

        // Re-running with the converged sizes reproduces the exact stream.
        let again = build_sized(
            "s6again",
            &xml,
            &["eth.elf", "usb.elf"],
            invocation_table_size,
            system_cnode_size,
        )
        .expect("build should succeed");
        assert_eq!(serialize(&built), serialize(&again));
        assert_eq!(built.number_of_system_caps, again.number_of_system_caps);
    }

    #[test]
    fn builds_are_deterministic() {
        let a = build("det1", S2_XML, &["a.elf", "b.elf"]);
        let b = build("det2", S2_XML, &["a.elf", "b.elf"]);
        assert_eq!(serialize(&a), serialize(&b));
        assert_eq!(a.number_of_system_caps, b.number_of_system_caps);
        assert_eq!(a.kernel_objects.len(), b.kernel_objects.len());
        for (x, y) in a.kernel_objects.iter().zip(&b.kernel_objects) {
            assert_eq!(x.name, y.name);
            assert_eq!(x.phys_addr, y.phys_addr);
            assert_eq!(x.cap_addr, y.cap_addr);
        }
    }

    #[test]
    fn passive_pd_gets_monitor_endpoint() {
        let xml = r#"<system>
    <protection_domain name="init" priority="100" passive="true">
        <program_image path="init.elf" />
    </protection_domain>
</system>"#;
        let built = build("passive", xml, &["init.elf"]);
        let cnode = object_named(&built, "CNode: PD=init").cap_addr;
        let monitor_ep = built.fault_ep_cap_address;
        assert!(
            mints(&built)
                .iter()
                .any(|&(c, dest, src, badge)| c == cnode
                    && dest == MONITOR_EP_CAP_IDX
                    && src == monitor_ep
                    && badge == 1)
        );
        // The passive flag is patched into the image (fixture offset 0x20).
        let region = region_named(&built, "PD-ELF init-0");
        assert_eq!(region.data[0x20], 1);
    }

    #[test]
    fn setvar_patches_region_paddr() {
        let xml = r#"<system>
    <memory_region name="dma" size="0x1000" phys_addr="0x40000000" />
    <protection_domain name="drv" priority="100">
        <program_image path="drv.elf" />
        <map mr="dma" vaddr="0x30000" perms="rw" cached="false" />
        <setvar symbol="dma_paddr" region_paddr="dma" />
    </protection_domain>
</system>"#;
        let built = build("setvar", xml, &["drv.elf"]);
        // The fixture places `dma_paddr` at segment offset 0x28.
        let region = region_named(&built, "PD-ELF drv-0");
        let data = &region.data[0x28..0x30];
        assert_eq!(
            u64::from_le_bytes(data.try_into().unwrap()),
            0x4000_0000
        );
    }

    #[test]
    fn missing_setvar_symbol_is_fatal() {
        let xml = r#"<system>
    <memory_region name="dma" size="0x1000" phys_addr="0x40000000" />
    <protection_domain name="drv" priority="100">
        <program_image path="drv.elf" />
        <map mr="dma" vaddr="0x30000" perms="rw" cached="false" />
        <setvar symbol="no_such_symbol" region_paddr="dma" />
    </protection_domain>
</system>"#;
        let err = build_sized("setvar-missing", xml, &["drv.elf"], 0x1000, 1024)
            .expect_err("missing symbol should fail");
        assert!(
            err.to_string()
                .starts_with("Unable to patch variable 'no_such_symbol'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn missing_program_image_is_fatal() {
        let err = build_sized("missing-image", S1_XML, &[], 0x1000, 1024)
            .expect_err("missing image should fail");
        assert!(
            err.to_string()
                .starts_with("Error: unable to find program image: 'hello.elf'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn cpu_affinity_out_of_range_is_fatal() {
        let xml = r#"<system>
    <protection_domain name="main" priority="100" cpu="3">
        <program_image path="main.elf" />
    </protection_domain>
</system>"#;
        let err = build_sized("cpu-range", xml, &["main.elf"], 0x1000, 1024)
            .expect_err("cpu out of range should fail");
        assert!(err.to_string().starts_with("Error: CPU 3 out of range"));
    }
}
