//! Kernel capability model.
//!
//! Everything here is a kernel-visible contract: object type codes,
//! invocation labels, the message-info bit layout, rights and attribute
//! bits, and the fixed capability addresses of the initial task. The values
//! must match the kernel build the images target, byte for byte.

use crate::memory::MemoryRegion;
use crate::util::lsb;

/// Target architecture. A closed set; every architecture branch in the
/// builder goes through methods on this type or [`KernelConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Aarch64,
    Riscv64,
    X86_64,
}

impl Arch {
    /// `seL4_MaxUntypedBits`: the largest untyped the kernel will create.
    #[must_use]
    pub fn max_untyped_bits(self) -> u64 {
        match self {
            Self::Aarch64 | Self::X86_64 => 47,
            Self::Riscv64 => 38,
        }
    }

    /// Size of one kernel-device frame, matching the kernel's
    /// `map_kernel_devices`.
    #[must_use]
    pub fn kernel_frame_size(self) -> u64 {
        match self {
            Self::Aarch64 | Self::X86_64 => 1 << 12,
            Self::Riscv64 => 1 << 21,
        }
    }
}

/// Immutable kernel configuration for one board/config combination.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub arch: Arch,
    pub word_size: u64,
    pub minimum_page_size: u64,
    pub paddr_user_device_top: u64,
    pub kernel_frame_size: u64,
    /// Radix bits of the kernel's initial CNode (`CONFIG_ROOT_CNODE_SIZE_BITS`).
    pub init_cnode_bits: u64,
    pub cap_address_bits: u64,
    /// `CONFIG_RETYPE_FAN_OUT_LIMIT`.
    pub fan_out_limit: u64,
    pub have_fpu: bool,
    pub hyp_mode: bool,
    pub num_cpus: u64,
    /// `CONFIG_ARM_PA_SIZE_BITS` (AArch64 only).
    pub arm_pa_size_bits: Option<u64>,
    /// `CONFIG_PT_LEVELS` (RISC-V only).
    pub riscv_pt_levels: Option<u64>,
    /// `CONFIG_XSAVE_SIZE` (x86 only).
    pub x86_xsave_size: Option<u64>,
}

impl KernelConfig {
    /// Whether the hypervisor configuration drops the topmost translation
    /// level (AArch64 stage-2 starting at level 1).
    #[must_use]
    pub fn hyp_skips_top_level(&self) -> bool {
        self.arch == Arch::Aarch64 && self.hyp_mode && self.arm_pa_size_bits == Some(40)
    }

    /// The intermediate translation-table levels between the VSpace root and
    /// the pages, largest granule first.
    ///
    /// This is the single source of truth for level geometry: boot
    /// emulation, object planning, and VSpace installation all iterate this
    /// table, so they cannot disagree about the level count.
    #[must_use]
    pub fn intermediate_levels(&self) -> Vec<PagingLevel> {
        match self.arch {
            Arch::Aarch64 => {
                let mut levels = Vec::with_capacity(3);
                if !self.hyp_skips_top_level() {
                    levels.push(PagingLevel {
                        object_type: ObjectType::PageUpperDirectory,
                        granule_bits: 12 + 9 + 9 + 9,
                    });
                }
                levels.push(PagingLevel {
                    object_type: ObjectType::PageDirectory,
                    granule_bits: 12 + 9 + 9,
                });
                levels.push(PagingLevel {
                    object_type: ObjectType::PageTable,
                    granule_bits: 12 + 9,
                });
                levels
            }
            Arch::Riscv64 => {
                // Sv39: two intermediate levels below the root page table.
                let levels = self.riscv_pt_levels.unwrap_or(3);
                (1..levels)
                    .rev()
                    .map(|lvl| PagingLevel {
                        object_type: ObjectType::PageTable,
                        granule_bits: 12 + 9 * lvl,
                    })
                    .collect()
            }
            Arch::X86_64 => unreachable!("x86_64 image generation is rejected at startup"),
        }
    }

    /// The page sizes user mappings may use, ascending.
    #[must_use]
    pub fn page_sizes(&self) -> [u64; 2] {
        [0x1000, 0x200_000]
    }
}

/// One intermediate translation-table level.
#[derive(Debug, Clone, Copy)]
pub struct PagingLevel {
    /// Object retyped for this level.
    pub object_type: ObjectType,
    /// Bits covered by one entry's span: a table at this level is required
    /// for every distinct `vaddr & !((1 << granule_bits) - 1)`.
    pub granule_bits: u64,
}

/// Architecture-independent kernel object types.
///
/// The kernel's `UntypedRetype` takes an architecture-specific code;
/// [`ObjectType::value`] performs the translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Untyped,
    Tcb,
    Endpoint,
    Notification,
    CNode,
    SchedContext,
    Reply,
    HugePage,
    VSpace,
    SmallPage,
    LargePage,
    PageTable,
    PageDirectory,
    PageUpperDirectory,
    Vcpu,
}

impl ObjectType {
    /// The architecture-specific object code used on the wire.
    #[must_use]
    pub fn value(self, config: &KernelConfig) -> u64 {
        match self {
            Self::Untyped => 0,
            Self::Tcb => 1,
            Self::Endpoint => 2,
            Self::Notification => 3,
            Self::CNode => 4,
            Self::SchedContext => 5,
            Self::Reply => 6,
            _ => match config.arch {
                Arch::Aarch64 => match self {
                    Self::HugePage => 7,
                    Self::PageUpperDirectory => 8,
                    // A VSpace is represented by a PageGlobalDirectory.
                    Self::VSpace => 9,
                    Self::SmallPage => 10,
                    Self::LargePage => 11,
                    Self::PageTable => 12,
                    Self::PageDirectory => 13,
                    Self::Vcpu => 14,
                    _ => unreachable!(),
                },
                Arch::Riscv64 => match self {
                    Self::HugePage => 7,
                    Self::SmallPage => 8,
                    Self::LargePage => 9,
                    // A VSpace is represented by the top-level PageTable.
                    Self::PageTable | Self::VSpace => 10,
                    _ => panic!("object {self:?} does not exist on RISC-V"),
                },
                Arch::X86_64 => unreachable!("x86_64 image generation is rejected at startup"),
            },
        }
    }

    /// Size in bytes for fixed-size objects; `None` for the variable-size
    /// ones (CNode, untyped, scheduling context).
    #[must_use]
    pub fn fixed_size(self, config: &KernelConfig) -> Option<u64> {
        let size = match self {
            Self::Tcb => match config.arch {
                Arch::Riscv64 if !config.have_fpu => 1 << 10,
                // The x86 TCB embeds the XSAVE area; a large area pushes
                // the TCB into the next power of two.
                Arch::X86_64 if config.x86_xsave_size.unwrap_or(512) > 576 => 1 << 12,
                _ => 1 << 11,
            },
            Self::Endpoint => 1 << 4,
            Self::Notification => 1 << 6,
            Self::Reply => 1 << 5,
            // With stage-2 translation starting at level 1 the root is a
            // concatenated table twice the normal size.
            Self::VSpace => {
                if config.hyp_skips_top_level() {
                    1 << 13
                } else {
                    1 << 12
                }
            }
            Self::HugePage => 1 << 30,
            Self::SmallPage => 1 << 12,
            Self::LargePage => 1 << 21,
            Self::PageTable | Self::PageDirectory | Self::PageUpperDirectory => 1 << 12,
            Self::Vcpu => 1 << 12,
            Self::Untyped | Self::CNode | Self::SchedContext => return None,
        };
        Some(size)
    }

    /// The kernel API name, for the report.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Untyped => "SEL4_UNTYPED_OBJECT",
            Self::Tcb => "SEL4_TCB_OBJECT",
            Self::Endpoint => "SEL4_ENDPOINT_OBJECT",
            Self::Notification => "SEL4_NOTIFICATION_OBJECT",
            Self::CNode => "SEL4_CNODE_OBJECT",
            Self::SchedContext => "SEL4_SCHEDCONTEXT_OBJECT",
            Self::Reply => "SEL4_REPLY_OBJECT",
            Self::HugePage => "SEL4_HUGE_PAGE_OBJECT",
            Self::VSpace => "SEL4_VSPACE_OBJECT",
            Self::SmallPage => "SEL4_SMALL_PAGE_OBJECT",
            Self::LargePage => "SEL4_LARGE_PAGE_OBJECT",
            Self::PageTable => "SEL4_PAGE_TABLE_OBJECT",
            Self::PageDirectory => "SEL4_PAGE_DIRECTORY_OBJECT",
            Self::PageUpperDirectory => "SEL4_PAGE_UPPER_DIRECTORY_OBJECT",
            Self::Vcpu => "SEL4_VCPU_OBJECT",
        }
    }
}

/// `seL4_SlotBits`: size of one CNode slot.
pub const SLOT_BITS: u64 = 5;
/// One CNode slot in bytes.
pub const SLOT_SIZE: u64 = 1 << SLOT_BITS;

/// `seL4_MinSchedContextBits`.
pub const MIN_SCHED_CONTEXT_BITS: u64 = 7;

pub const SEL4_RIGHTS_WRITE: u64 = 1;
pub const SEL4_RIGHTS_READ: u64 = 2;
pub const SEL4_RIGHTS_ALL: u64 = 0xf;

pub const SEL4_ARM_PAGE_CACHEABLE: u64 = 1;
pub const SEL4_ARM_PARITY_ENABLED: u64 = 2;
pub const SEL4_ARM_EXECUTE_NEVER: u64 = 4;
pub const SEL4_ARM_DEFAULT_VMATTRIBUTES: u64 = 3;

pub const SEL4_RISCV_DEFAULT_VMATTRIBUTES: u64 = 0;
pub const SEL4_RISCV_EXECUTE_NEVER: u64 = 1;

// Fixed capability addresses in the initial task's CSpace.
pub const INIT_NULL_CAP_ADDRESS: u64 = 0;
pub const INIT_TCB_CAP_ADDRESS: u64 = 1;
pub const INIT_CNODE_CAP_ADDRESS: u64 = 2;
pub const INIT_VSPACE_CAP_ADDRESS: u64 = 3;
pub const IRQ_CONTROL_CAP_ADDRESS: u64 = 4;
pub const ASID_CONTROL_CAP_ADDRESS: u64 = 5;
pub const INIT_ASID_POOL_CAP_ADDRESS: u64 = 6;
pub const IO_PORT_CONTROL_CAP_ADDRESS: u64 = 7;
pub const IO_SPACE_CAP_ADDRESS: u64 = 8;
pub const BOOT_INFO_FRAME_CAP_ADDRESS: u64 = 9;
pub const INIT_THREAD_IPC_BUFFER_CAP_ADDRESS: u64 = 10;
pub const DOMAIN_CAP_ADDRESS: u64 = 11;
pub const SMMU_SID_CONTROL_CAP_ADDRESS: u64 = 12;
pub const SMMU_CB_CONTROL_CAP_ADDRESS: u64 = 13;
pub const INIT_THREAD_SC_CAP_ADDRESS: u64 = 14;

/// Number of fixed capabilities the kernel hands the initial task.
pub const FIXED_CAP_COUNT: u64 = 15;

/// Default virtual-memory attributes for translation tables.
#[must_use]
pub fn default_vm_attributes(arch: Arch) -> u64 {
    match arch {
        Arch::Aarch64 => SEL4_ARM_DEFAULT_VMATTRIBUTES,
        Arch::Riscv64 => SEL4_RISCV_DEFAULT_VMATTRIBUTES,
        Arch::X86_64 => unreachable!("x86_64 image generation is rejected at startup"),
    }
}

/// Page mapping attributes from a map's `cached` and execute flags.
///
/// Execute permission is controlled here (via execute-never), not through
/// the rights mask.
#[must_use]
pub fn page_attributes(arch: Arch, cached: bool, executable: bool) -> u64 {
    match arch {
        Arch::Aarch64 => {
            let mut attrs = SEL4_ARM_PARITY_ENABLED;
            if cached {
                attrs |= SEL4_ARM_PAGE_CACHEABLE;
            }
            if !executable {
                attrs |= SEL4_ARM_EXECUTE_NEVER;
            }
            attrs
        }
        Arch::Riscv64 => {
            if executable {
                0
            } else {
                SEL4_RISCV_EXECUTE_NEVER
            }
        }
        Arch::X86_64 => unreachable!("x86_64 image generation is rejected at startup"),
    }
}

/// Interrupt trigger mode, encoded as the kernel expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqTrigger {
    Level = 0,
    Edge = 1,
}

/// AArch64 `seL4_UserContext`, fields in kernel declaration order.
#[derive(Debug, Clone, Default)]
pub struct Aarch64Regs {
    pub pc: u64,
    pub sp: u64,
    pub spsr: u64,
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
    pub x4: u64,
    pub x5: u64,
    pub x6: u64,
    pub x7: u64,
    pub x8: u64,
    pub x16: u64,
    pub x17: u64,
    pub x18: u64,
    pub x29: u64,
    pub x30: u64,
    pub x9: u64,
    pub x10: u64,
    pub x11: u64,
    pub x12: u64,
    pub x13: u64,
    pub x14: u64,
    pub x15: u64,
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub tpidr_el0: u64,
    pub tpidrro_el0: u64,
}

impl Aarch64Regs {
    /// The registers as the word vector `TCBWriteRegisters` carries.
    #[must_use]
    pub fn as_words(&self) -> Vec<u64> {
        vec![
            self.pc,
            self.sp,
            self.spsr,
            self.x0,
            self.x1,
            self.x2,
            self.x3,
            self.x4,
            self.x5,
            self.x6,
            self.x7,
            self.x8,
            self.x16,
            self.x17,
            self.x18,
            self.x29,
            self.x30,
            self.x9,
            self.x10,
            self.x11,
            self.x12,
            self.x13,
            self.x14,
            self.x15,
            self.x19,
            self.x20,
            self.x21,
            self.x22,
            self.x23,
            self.x24,
            self.x25,
            self.x26,
            self.x27,
            self.x28,
            self.tpidr_el0,
            self.tpidrro_el0,
        ]
    }
}

/// RISC-V `seL4_UserContext`, fields in kernel declaration order.
#[derive(Debug, Clone, Default)]
pub struct RiscvRegs {
    pub pc: u64,
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub s0: u64,
    pub s1: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
    pub tp: u64,
}

impl RiscvRegs {
    /// The registers as the word vector `TCBWriteRegisters` carries.
    #[must_use]
    pub fn as_words(&self) -> Vec<u64> {
        vec![
            self.pc, self.ra, self.sp, self.gp, self.s0, self.s1, self.s2, self.s3, self.s4,
            self.s5, self.s6, self.s7, self.s8, self.s9, self.s10, self.s11, self.a0, self.a1,
            self.a2, self.a3, self.a4, self.a5, self.a6, self.a7, self.t0, self.t1, self.t2,
            self.t3, self.t4, self.t5, self.t6, self.tp,
        ]
    }
}

/// Per-architecture register file for thread creation.
#[derive(Debug, Clone)]
pub enum Regs {
    Aarch64(Box<Aarch64Regs>),
    Riscv(Box<RiscvRegs>),
}

impl Regs {
    fn as_words(&self) -> Vec<u64> {
        match self {
            Self::Aarch64(regs) => regs.as_words(),
            Self::Riscv(regs) => regs.as_words(),
        }
    }
}

/// Typed arguments for every invocation the builder emits.
///
/// Each variant lists its fields in the kernel's declared order; the first
/// field is always the service capability. Which of the remaining fields
/// travel as extra caps (versus message registers) is decided by
/// [`Invocation`] in a single `match`, replacing the original's runtime
/// attribute reflection.
#[derive(Debug, Clone)]
pub enum InvocationArgs {
    UntypedRetype {
        untyped: u64,
        object_type: ObjectType,
        size_bits: u64,
        root: u64,
        node_index: u64,
        node_depth: u64,
        node_offset: u64,
        num_objects: u64,
    },
    TcbSetSchedParams {
        tcb: u64,
        authority: u64,
        mcp: u64,
        priority: u64,
        sched_context: u64,
        fault_ep: u64,
    },
    TcbSetSpace {
        tcb: u64,
        fault_ep: u64,
        cspace_root: u64,
        cspace_root_data: u64,
        vspace_root: u64,
        vspace_root_data: u64,
    },
    TcbSetIpcBuffer {
        tcb: u64,
        buffer: u64,
        buffer_frame: u64,
    },
    TcbResume {
        tcb: u64,
    },
    TcbWriteRegisters {
        tcb: u64,
        resume: bool,
        arch_flags: u64,
        regs: Regs,
    },
    TcbBindNotification {
        tcb: u64,
        notification: u64,
    },
    AsidPoolAssign {
        asid_pool: u64,
        vspace: u64,
    },
    IrqControlGetTrigger {
        irq_control: u64,
        irq: u64,
        trigger: u64,
        dest_root: u64,
        dest_index: u64,
        dest_depth: u64,
    },
    IrqHandlerSetNotification {
        irq_handler: u64,
        notification: u64,
    },
    PageUpperDirectoryMap {
        page_upper_directory: u64,
        vspace: u64,
        vaddr: u64,
        attr: u64,
    },
    PageDirectoryMap {
        page_directory: u64,
        vspace: u64,
        vaddr: u64,
        attr: u64,
    },
    PageTableMap {
        page_table: u64,
        vspace: u64,
        vaddr: u64,
        attr: u64,
    },
    PageMap {
        page: u64,
        vspace: u64,
        vaddr: u64,
        rights: u64,
        attr: u64,
    },
    CnodeMint {
        cnode: u64,
        dest_index: u64,
        dest_depth: u64,
        src_root: u64,
        src_obj: u64,
        src_depth: u64,
        rights: u64,
        badge: u64,
    },
    CnodeCopy {
        cnode: u64,
        dest_index: u64,
        dest_depth: u64,
        src_root: u64,
        src_obj: u64,
        src_depth: u64,
        rights: u64,
    },
    SchedControlConfigureFlags {
        sched_control: u64,
        sched_context: u64,
        budget: u64,
        period: u64,
        extra_refills: u64,
        badge: u64,
        flags: u64,
    },
    VcpuSetTcb {
        vcpu: u64,
        tcb: u64,
    },
}

/// The decomposition of an invocation into wire fields.
struct Parts {
    service: u64,
    caps: Vec<u64>,
    args: Vec<u64>,
}

/// One kernel invocation, optionally with a repeat block.
///
/// A repeat block means: apply this invocation `count` times, adding the
/// delta's fields on each iteration. The kernel-side replayer decodes it
/// back into `count` real system calls.
#[derive(Debug, Clone)]
pub struct Invocation {
    args: InvocationArgs,
    repeat: Option<(u64, InvocationArgs)>,
}

impl Invocation {
    #[must_use]
    pub fn new(args: InvocationArgs) -> Self {
        Self { args, repeat: None }
    }

    /// The invocation's arguments, for reporting.
    #[must_use]
    pub fn args(&self) -> &InvocationArgs {
        &self.args
    }

    /// The repeat block, if any, for reporting.
    #[must_use]
    pub fn repeat_block(&self) -> Option<(u64, &InvocationArgs)> {
        self.repeat.as_ref().map(|(count, delta)| (*count, delta))
    }

    /// Attach a repeat block. A count of one (or zero) is a no-op, so call
    /// sites don't need to special-case single-element groups.
    ///
    /// The delta must be the same invocation kind; any field that should not
    /// advance is zero in the delta.
    pub fn repeat(&mut self, count: u64, delta: InvocationArgs) {
        if count > 1 {
            assert_eq!(
                std::mem::discriminant(&self.args),
                std::mem::discriminant(&delta),
                "repeat delta kind does not match the invocation"
            );
            self.repeat = Some((count, delta));
        }
    }

    /// The kernel label value for this invocation under `config`.
    ///
    /// Common labels are architecture-independent. Architecture labels are
    /// assigned by the kernel's generated enum, whose values shift with the
    /// configuration (interfaces are conditionally compiled), so they are
    /// computed rather than tabulated.
    #[must_use]
    pub fn label(&self, config: &KernelConfig) -> u64 {
        match &self.args {
            InvocationArgs::UntypedRetype { .. } => 1,
            InvocationArgs::TcbWriteRegisters { .. } => 3,
            InvocationArgs::TcbSetSchedParams { .. } => 8,
            InvocationArgs::TcbSetIpcBuffer { .. } => 10,
            InvocationArgs::TcbSetSpace { .. } => 11,
            InvocationArgs::TcbResume { .. } => 13,
            InvocationArgs::TcbBindNotification { .. } => 14,
            InvocationArgs::CnodeCopy { .. } => 20,
            InvocationArgs::CnodeMint { .. } => 21,
            InvocationArgs::IrqHandlerSetNotification { .. } => 27,
            InvocationArgs::SchedControlConfigureFlags { .. } => 30,
            InvocationArgs::PageUpperDirectoryMap { .. } => {
                assert!(config.arch == Arch::Aarch64);
                arm_labels(config).pud_map
            }
            InvocationArgs::PageDirectoryMap { .. } => {
                assert!(config.arch == Arch::Aarch64);
                arm_labels(config).pd_map
            }
            InvocationArgs::PageTableMap { .. } => match config.arch {
                Arch::Aarch64 => arm_labels(config).pt_map,
                Arch::Riscv64 => 36,
                Arch::X86_64 => unreachable!(),
            },
            InvocationArgs::PageMap { .. } => match config.arch {
                Arch::Aarch64 => arm_labels(config).page_map,
                Arch::Riscv64 => 38,
                Arch::X86_64 => unreachable!(),
            },
            InvocationArgs::AsidPoolAssign { .. } => match config.arch {
                Arch::Aarch64 => arm_labels(config).asid_pool_assign,
                Arch::Riscv64 => 42,
                Arch::X86_64 => unreachable!(),
            },
            InvocationArgs::IrqControlGetTrigger { .. } => match config.arch {
                Arch::Aarch64 => arm_labels(config).irq_issue_trigger,
                Arch::Riscv64 => 43,
                Arch::X86_64 => unreachable!(),
            },
            InvocationArgs::VcpuSetTcb { .. } => {
                assert!(config.arch == Arch::Aarch64 && config.hyp_mode);
                arm_labels(config).vcpu_set_tcb
            }
        }
    }

    /// Pack the message-info tag.
    ///
    /// Field widths are label/caps/extra-caps/length = 50/3/2/7 bits; a
    /// repeat count minus one occupies bits 32 and up (the label values in
    /// use never reach them).
    #[must_use]
    pub fn message_info(label: u64, caps: u64, extra_caps: u64, length: u64) -> u64 {
        assert!(label < 1 << 50);
        assert!(caps < 8);
        assert!(extra_caps < 4);
        assert!(length < 0x80);
        label << 12 | caps << 9 | extra_caps << 7 | length
    }

    /// Append the invocation's native-endian word encoding to `out`.
    ///
    /// Layout: tag, service cap, extra caps, arguments, then — when a repeat
    /// block is present — the per-iteration deltas in the same field order.
    pub fn add_raw_invocation(&self, config: &KernelConfig, out: &mut Vec<u8>) {
        let parts = decompose(&self.args, config, false);
        let label = self.label(config);
        let mut tag = Self::message_info(
            label,
            0,
            parts.caps.len() as u64,
            parts.args.len() as u64,
        );
        if let Some((count, _)) = &self.repeat {
            tag |= (count - 1) << 32;
        }

        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&parts.service.to_le_bytes());
        for cap in &parts.caps {
            out.extend_from_slice(&cap.to_le_bytes());
        }
        for arg in &parts.args {
            out.extend_from_slice(&arg.to_le_bytes());
        }

        if let Some((_, delta)) = &self.repeat {
            let delta_parts = decompose(delta, config, true);
            assert_eq!(delta_parts.caps.len(), parts.caps.len());
            assert_eq!(delta_parts.args.len(), parts.args.len());
            out.extend_from_slice(&delta_parts.service.to_le_bytes());
            for cap in &delta_parts.caps {
                out.extend_from_slice(&cap.to_le_bytes());
            }
            for arg in &delta_parts.args {
                out.extend_from_slice(&arg.to_le_bytes());
            }
        }
    }

    /// Number of raw bytes [`Self::add_raw_invocation`] will produce.
    #[must_use]
    pub fn size_bytes(&self, config: &KernelConfig) -> u64 {
        let parts = decompose(&self.args, config, false);
        let words = 2 + parts.caps.len() + parts.args.len();
        let total = if self.repeat.is_some() {
            words + 1 + parts.caps.len() + parts.args.len()
        } else {
            words
        };
        (total * 8) as u64
    }
}

/// ARM label values under a given kernel configuration.
///
/// The generated invocation enum omits the PageUpperDirectory interface
/// when stage-2 translation starts at level 1, and inserts the five VCPU
/// operations before the IRQ trigger issue when the hypervisor is enabled.
struct ArmLabels {
    pud_map: u64,
    pd_map: u64,
    pt_map: u64,
    page_map: u64,
    asid_pool_assign: u64,
    vcpu_set_tcb: u64,
    irq_issue_trigger: u64,
}

fn arm_labels(config: &KernelConfig) -> ArmLabels {
    // The four VSpace operations occupy 36..=39.
    let mut next = 40;
    let pud_map = next;
    if !config.hyp_skips_top_level() {
        next += 2; // PageUpperDirectory Map/Unmap
    }
    let pd_map = next; // PageDirectory Map/Unmap
    let pt_map = next + 2; // PageTable Map/Unmap
    let page_map = next + 4; // Page Map/Unmap/Clean/Invalidate/CleanInvalidate/Unify/GetAddress
    let asid_pool_assign = next + 12; // after ASIDControlMakePool
    let mut irq_issue_trigger = asid_pool_assign + 1;
    let vcpu_set_tcb = irq_issue_trigger;
    if config.hyp_mode {
        irq_issue_trigger += 5; // VCPU SetTCB/ReadRegs/WriteRegs/InjectIRQ/AckVPPI
    }
    ArmLabels {
        pud_map,
        pd_map,
        pt_map,
        page_map,
        asid_pool_assign,
        vcpu_set_tcb,
        irq_issue_trigger,
    }
}

/// Split an invocation into (service, extra caps, argument words).
///
/// For a repeat delta (`is_delta`), fields that encode types rather than
/// counters contribute zero.
fn decompose(args: &InvocationArgs, config: &KernelConfig, is_delta: bool) -> Parts {
    match args {
        InvocationArgs::UntypedRetype {
            untyped,
            object_type,
            size_bits,
            root,
            node_index,
            node_depth,
            node_offset,
            num_objects,
        } => Parts {
            service: *untyped,
            caps: vec![*root],
            args: vec![
                if is_delta { 0 } else { object_type.value(config) },
                *size_bits,
                *node_index,
                *node_depth,
                *node_offset,
                *num_objects,
            ],
        },
        InvocationArgs::TcbSetSchedParams {
            tcb,
            authority,
            mcp,
            priority,
            sched_context,
            fault_ep,
        } => Parts {
            service: *tcb,
            caps: vec![*authority, *sched_context, *fault_ep],
            args: vec![*mcp, *priority],
        },
        InvocationArgs::TcbSetSpace {
            tcb,
            fault_ep,
            cspace_root,
            cspace_root_data,
            vspace_root,
            vspace_root_data,
        } => Parts {
            service: *tcb,
            caps: vec![*fault_ep, *cspace_root, *vspace_root],
            args: vec![*cspace_root_data, *vspace_root_data],
        },
        InvocationArgs::TcbSetIpcBuffer {
            tcb,
            buffer,
            buffer_frame,
        } => Parts {
            service: *tcb,
            caps: vec![*buffer_frame],
            args: vec![*buffer],
        },
        InvocationArgs::TcbResume { tcb } => Parts {
            service: *tcb,
            caps: vec![],
            args: vec![],
        },
        InvocationArgs::TcbWriteRegisters {
            tcb,
            resume,
            arch_flags,
            regs,
        } => {
            let words = regs.as_words();
            let mut args = vec![arch_flags << 8 | u64::from(*resume), words.len() as u64];
            args.extend(words);
            Parts {
                service: *tcb,
                caps: vec![],
                args,
            }
        }
        InvocationArgs::TcbBindNotification { tcb, notification } => Parts {
            service: *tcb,
            caps: vec![*notification],
            args: vec![],
        },
        InvocationArgs::AsidPoolAssign { asid_pool, vspace } => Parts {
            service: *asid_pool,
            caps: vec![*vspace],
            args: vec![],
        },
        InvocationArgs::IrqControlGetTrigger {
            irq_control,
            irq,
            trigger,
            dest_root,
            dest_index,
            dest_depth,
        } => Parts {
            service: *irq_control,
            caps: vec![*dest_root],
            args: vec![*irq, *trigger, *dest_index, *dest_depth],
        },
        InvocationArgs::IrqHandlerSetNotification {
            irq_handler,
            notification,
        } => Parts {
            service: *irq_handler,
            caps: vec![*notification],
            args: vec![],
        },
        InvocationArgs::PageUpperDirectoryMap {
            page_upper_directory,
            vspace,
            vaddr,
            attr,
        } => Parts {
            service: *page_upper_directory,
            caps: vec![*vspace],
            args: vec![*vaddr, *attr],
        },
        InvocationArgs::PageDirectoryMap {
            page_directory,
            vspace,
            vaddr,
            attr,
        } => Parts {
            service: *page_directory,
            caps: vec![*vspace],
            args: vec![*vaddr, *attr],
        },
        InvocationArgs::PageTableMap {
            page_table,
            vspace,
            vaddr,
            attr,
        } => Parts {
            service: *page_table,
            caps: vec![*vspace],
            args: vec![*vaddr, *attr],
        },
        InvocationArgs::PageMap {
            page,
            vspace,
            vaddr,
            rights,
            attr,
        } => Parts {
            service: *page,
            caps: vec![*vspace],
            args: vec![*vaddr, *rights, *attr],
        },
        InvocationArgs::CnodeMint {
            cnode,
            dest_index,
            dest_depth,
            src_root,
            src_obj,
            src_depth,
            rights,
            badge,
        } => Parts {
            service: *cnode,
            caps: vec![*src_root],
            args: vec![
                *dest_index,
                *dest_depth,
                *src_obj,
                *src_depth,
                *rights,
                *badge,
            ],
        },
        InvocationArgs::CnodeCopy {
            cnode,
            dest_index,
            dest_depth,
            src_root,
            src_obj,
            src_depth,
            rights,
        } => Parts {
            service: *cnode,
            caps: vec![*src_root],
            args: vec![*dest_index, *dest_depth, *src_obj, *src_depth, *rights],
        },
        InvocationArgs::SchedControlConfigureFlags {
            sched_control,
            sched_context,
            budget,
            period,
            extra_refills,
            badge,
            flags,
        } => Parts {
            service: *sched_control,
            caps: vec![*sched_context],
            args: vec![*budget, *period, *extra_refills, *badge, *flags],
        },
        InvocationArgs::VcpuSetTcb { vcpu, tcb } => Parts {
            service: *vcpu,
            caps: vec![*tcb],
            args: vec![],
        },
    }
}

/// A single untyped capability the kernel hands the initial task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UntypedObject {
    /// Slot in the initial CSpace.
    pub cap: u64,
    /// Physical memory the untyped covers (power-of-two sized and aligned).
    pub region: MemoryRegion,
    /// Whether this is device memory.
    pub is_device: bool,
}

impl UntypedObject {
    /// Base physical address.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.region.base
    }

    /// Size exponent of the (power-of-two) region.
    #[must_use]
    pub fn size_bits(&self) -> u64 {
        lsb(self.region.size())
    }
}
