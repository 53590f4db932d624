//! Allocation report.
//!
//! A human-readable account of everything the builder planned: boot info,
//! loader regions, object allocations, and a full dump of both invocation
//! streams with capability arguments resolved to their display names.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::builder::BuiltSystem;
use crate::sel4::{Invocation, InvocationArgs, KernelConfig, ObjectType, Regs};
use crate::util::group_thousands;

/// How an argument renders in the dump.
enum Arg {
    /// A capability address, resolved against the lookup table.
    Cap(u64),
    /// A plain integer.
    Value(u64),
    /// A virtual address.
    Vaddr(u64),
    /// An object-size exponent (0 means "fixed size").
    SizeBits(u64),
    /// An object type code.
    Object(ObjectType),
}

/// The service cap, object/method names, and named arguments of an
/// invocation, in declaration order.
fn describe(args: &InvocationArgs) -> (&'static str, &'static str, u64, Vec<(&'static str, Arg)>) {
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
        } => (
            "Untyped",
            "Retype",
            *untyped,
            vec![
                ("object_type", Arg::Object(*object_type)),
                ("size_bits", Arg::SizeBits(*size_bits)),
                ("root", Arg::Cap(*root)),
                ("node_index", Arg::Value(*node_index)),
                ("node_depth", Arg::Value(*node_depth)),
                ("node_offset", Arg::Value(*node_offset)),
                ("num_objects", Arg::Value(*num_objects)),
            ],
        ),
        InvocationArgs::TcbSetSchedParams {
            tcb,
            authority,
            mcp,
            priority,
            sched_context,
            fault_ep,
        } => (
            "TCB",
            "SetSchedParams",
            *tcb,
            vec![
                ("authority", Arg::Cap(*authority)),
                ("mcp", Arg::Value(*mcp)),
                ("priority", Arg::Value(*priority)),
                ("sched_context", Arg::Cap(*sched_context)),
                ("fault_ep", Arg::Cap(*fault_ep)),
            ],
        ),
        InvocationArgs::TcbSetSpace {
            tcb,
            fault_ep,
            cspace_root,
            cspace_root_data,
            vspace_root,
            vspace_root_data,
        } => (
            "TCB",
            "SetSpace",
            *tcb,
            vec![
                ("fault_ep", Arg::Cap(*fault_ep)),
                ("cspace_root", Arg::Cap(*cspace_root)),
                ("cspace_root_data", Arg::Value(*cspace_root_data)),
                ("vspace_root", Arg::Cap(*vspace_root)),
                ("vspace_root_data", Arg::Value(*vspace_root_data)),
            ],
        ),
        InvocationArgs::TcbSetIpcBuffer {
            tcb,
            buffer,
            buffer_frame,
        } => (
            "TCB",
            "SetIPCBuffer",
            *tcb,
            vec![
                ("buffer", Arg::Vaddr(*buffer)),
                ("buffer_frame", Arg::Cap(*buffer_frame)),
            ],
        ),
        InvocationArgs::TcbResume { tcb } => ("TCB", "Resume", *tcb, vec![]),
        InvocationArgs::TcbWriteRegisters {
            tcb,
            resume,
            arch_flags,
            regs,
        } => {
            let pc = match regs {
                Regs::Aarch64(regs) => regs.pc,
                Regs::Riscv(regs) => regs.pc,
            };
            (
                "TCB",
                "WriteRegisters",
                *tcb,
                vec![
                    ("resume", Arg::Value(u64::from(*resume))),
                    ("arch_flags", Arg::Value(*arch_flags)),
                    ("pc", Arg::Vaddr(pc)),
                ],
            )
        }
        InvocationArgs::TcbBindNotification { tcb, notification } => (
            "TCB",
            "BindNotification",
            *tcb,
            vec![("notification", Arg::Cap(*notification))],
        ),
        InvocationArgs::AsidPoolAssign { asid_pool, vspace } => (
            "ASID Pool",
            "Assign",
            *asid_pool,
            vec![("vspace", Arg::Cap(*vspace))],
        ),
        InvocationArgs::IrqControlGetTrigger {
            irq_control,
            irq,
            trigger,
            dest_root,
            dest_index,
            dest_depth,
        } => (
            "IRQ Control",
            "Get",
            *irq_control,
            vec![
                ("irq", Arg::Value(*irq)),
                ("trigger", Arg::Value(*trigger)),
                ("dest_root", Arg::Cap(*dest_root)),
                ("dest_index", Arg::Value(*dest_index)),
                ("dest_depth", Arg::Value(*dest_depth)),
            ],
        ),
        InvocationArgs::IrqHandlerSetNotification {
            irq_handler,
            notification,
        } => (
            "IRQ Handler",
            "SetNotification",
            *irq_handler,
            vec![("notification", Arg::Cap(*notification))],
        ),
        InvocationArgs::PageUpperDirectoryMap {
            page_upper_directory,
            vspace,
            vaddr,
            attr,
        } => (
            "Page Upper Directory",
            "Map",
            *page_upper_directory,
            vec![
                ("vspace", Arg::Cap(*vspace)),
                ("vaddr", Arg::Vaddr(*vaddr)),
                ("attr", Arg::Value(*attr)),
            ],
        ),
        InvocationArgs::PageDirectoryMap {
            page_directory,
            vspace,
            vaddr,
            attr,
        } => (
            "Page Directory",
            "Map",
            *page_directory,
            vec![
                ("vspace", Arg::Cap(*vspace)),
                ("vaddr", Arg::Vaddr(*vaddr)),
                ("attr", Arg::Value(*attr)),
            ],
        ),
        InvocationArgs::PageTableMap {
            page_table,
            vspace,
            vaddr,
            attr,
        } => (
            "Page Table",
            "Map",
            *page_table,
            vec![
                ("vspace", Arg::Cap(*vspace)),
                ("vaddr", Arg::Vaddr(*vaddr)),
                ("attr", Arg::Value(*attr)),
            ],
        ),
        InvocationArgs::PageMap {
            page,
            vspace,
            vaddr,
            rights,
            attr,
        } => (
            "Page",
            "Map",
            *page,
            vec![
                ("vspace", Arg::Cap(*vspace)),
                ("vaddr", Arg::Vaddr(*vaddr)),
                ("rights", Arg::Value(*rights)),
                ("attr", Arg::Value(*attr)),
            ],
        ),
        InvocationArgs::CnodeMint {
            cnode,
            dest_index,
            dest_depth,
            src_root,
            src_obj,
            src_depth,
            rights,
            badge,
        } => (
            "CNode",
            "Mint",
            *cnode,
            vec![
                ("dest_index", Arg::Value(*dest_index)),
                ("dest_depth", Arg::Value(*dest_depth)),
                ("src_root", Arg::Cap(*src_root)),
                ("src_obj", Arg::Cap(*src_obj)),
                ("src_depth", Arg::Value(*src_depth)),
                ("rights", Arg::Value(*rights)),
                ("badge", Arg::Value(*badge)),
            ],
        ),
        InvocationArgs::CnodeCopy {
            cnode,
            dest_index,
            dest_depth,
            src_root,
            src_obj,
            src_depth,
            rights,
        } => (
            "CNode",
            "Copy",
            *cnode,
            vec![
                ("dest_index", Arg::Value(*dest_index)),
                ("dest_depth", Arg::Value(*dest_depth)),
                ("src_root", Arg::Cap(*src_root)),
                ("src_obj", Arg::Cap(*src_obj)),
                ("src_depth", Arg::Value(*src_depth)),
                ("rights", Arg::Value(*rights)),
            ],
        ),
        InvocationArgs::SchedControlConfigureFlags {
            sched_control,
            sched_context,
            budget,
            period,
            extra_refills,
            badge,
            flags,
        } => (
            "SchedControl",
            "ConfigureFlags",
            *sched_control,
            vec![
                ("sched_context", Arg::Cap(*sched_context)),
                ("budget", Arg::Value(*budget)),
                ("period", Arg::Value(*period)),
                ("extra_refills", Arg::Value(*extra_refills)),
                ("badge", Arg::Value(*badge)),
                ("flags", Arg::Value(*flags)),
            ],
        ),
        InvocationArgs::VcpuSetTcb { vcpu, tcb } => {
            ("VCPU", "SetTCB", *vcpu, vec![("tcb", Arg::Cap(*tcb))])
        }
    }
}

/// Render one invocation with resolved capability names.
pub fn invocation_to_str(
    config: &KernelConfig,
    inv: &Invocation,
    cap_lookup: &HashMap<u64, String>,
) -> String {
    let resolve = |cap: u64| -> &str {
        cap_lookup.get(&cap).map_or("<unknown>", String::as_str)
    };

    let (object_type, method, service, args) = describe(inv.args());
    let mut lines = Vec::with_capacity(args.len() + 1);
    lines.push(format!(
        "{object_type:20} - {method:17} - 0x{service:016x} ({})",
        resolve(service)
    ));
    for (name, arg) in args {
        let (name, value) = match arg {
            Arg::Cap(cap) => (
                format!("{name} (cap)"),
                format!("0x{cap:016x} ({})", resolve(cap)),
            ),
            Arg::Value(v) => (name.to_string(), v.to_string()),
            Arg::Vaddr(v) => (name.to_string(), format!("0x{v:x}")),
            Arg::SizeBits(0) => (name.to_string(), "0 (N/A)".to_string()),
            Arg::SizeBits(bits) => (name.to_string(), format!("{bits} (0x{:x})", 1u64 << bits)),
            Arg::Object(object_type) => {
                let desc = match object_type.fixed_size(config) {
                    Some(size) => format!(
                        "{} ({} - 0x{size:x})",
                        object_type.value(config),
                        object_type.display_name()
                    ),
                    None => format!(
                        "{} ({} - variable size)",
                        object_type.value(config),
                        object_type.display_name()
                    ),
                };
                (name.to_string(), desc)
            }
        };
        lines.push(format!("         {name:20} {value}"));
    }
    if let Some((count, _)) = inv.repeat_block() {
        lines.push(format!("      REPEAT: count={count}"));
    }
    lines.join("\n")
}

/// Write the allocation report.
pub fn write_report(
    out: &mut impl Write,
    config: &KernelConfig,
    built: &BuiltSystem,
    bootstrap_invocation_data_len: usize,
    system_invocation_data_len: usize,
) -> io::Result<()> {
    let boot_info = &built.kernel_boot_info;

    writeln!(out, "# Kernel Boot Info\n")?;
    writeln!(
        out,
        "    # of fixed caps     : {:>8}",
        group_thousands(boot_info.fixed_cap_count)
    )?;
    writeln!(
        out,
        "    # of page table caps: {:>8}",
        group_thousands(boot_info.paging_cap_count)
    )?;
    writeln!(
        out,
        "    # of page caps      : {:>8}",
        group_thousands(boot_info.page_cap_count)
    )?;
    writeln!(
        out,
        "    # of untyped objects: {:>8}",
        group_thousands(boot_info.untyped_objects.len() as u64)
    )?;

    writeln!(out, "\n# Loader Regions\n")?;
    for region in &built.regions {
        writeln!(out, "       {region}")?;
    }

    writeln!(out, "\n# Monitor (Initial Task) Info\n")?;
    writeln!(out, "     virtual memory : {}", built.initial_task_virt_region)?;
    writeln!(out, "     physical memory: {}", built.initial_task_phys_region)?;

    writeln!(out, "\n# Allocated Kernel Objects Summary\n")?;
    writeln!(
        out,
        "     # of allocated objects: {}",
        group_thousands(built.kernel_objects.len() as u64)
    )?;

    writeln!(out, "\n# Bootstrap Kernel Invocations Summary\n")?;
    writeln!(
        out,
        "     # of invocations   : {:>10}",
        group_thousands(built.bootstrap_invocations.len() as u64)
    )?;
    writeln!(
        out,
        "     size of invocations: {:>10}",
        group_thousands(bootstrap_invocation_data_len as u64)
    )?;

    writeln!(out, "\n# System Kernel Invocations Summary\n")?;
    writeln!(
        out,
        "     # of invocations   : {:>10}",
        group_thousands(built.system_invocations.len() as u64)
    )?;
    writeln!(
        out,
        "     size of invocations: {:>10}",
        group_thousands(system_invocation_data_len as u64)
    )?;

    writeln!(out, "\n# Allocated Kernel Objects Detail\n")?;
    for ko in &built.kernel_objects {
        writeln!(
            out,
            "    {:<50} {} cap_addr={:x} phys_addr={:x}",
            ko.name,
            ko.object_type.display_name(),
            ko.cap_addr,
            ko.phys_addr
        )?;
    }

    writeln!(out, "\n# Bootstrap Kernel Invocations Detail\n")?;
    for (idx, invocation) in built.bootstrap_invocations.iter().enumerate() {
        writeln!(
            out,
            "    0x{idx:04x} {}",
            invocation_to_str(config, invocation, &built.cap_lookup)
        )?;
    }

    writeln!(out, "\n# System Kernel Invocations Detail\n")?;
    for (idx, invocation) in built.system_invocations.iter().enumerate() {
        writeln!(
            out,
            "    0x{idx:04x} {}",
            invocation_to_str(config, invocation, &built.cap_lookup)
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sel4::{Arch, SEL4_RIGHTS_ALL};

    fn test_config() -> KernelConfig {
        KernelConfig {
            arch: Arch::Aarch64,
            word_size: 64,
            minimum_page_size: 0x1000,
            paddr_user_device_top: 1 << 40,
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

    #[test]
    fn cnode_mint_resolves_cap_names() {
        let config = test_config();
        let mut lookup = HashMap::new();
        lookup.insert(0x8000_0000_0000_0123, "CNode: PD=a".to_string());
        lookup.insert(0x44, "CNode: root".to_string());
        lookup.insert(0x8000_0000_0000_0456, "Notification: PD=b".to_string());

        let inv = Invocation::new(InvocationArgs::CnodeMint {
            cnode: 0x8000_0000_0000_0123,
            dest_index: 13,
            dest_depth: 9,
            src_root: 0x44,
            src_obj: 0x8000_0000_0000_0456,
            src_depth: 64,
            rights: SEL4_RIGHTS_ALL,
            badge: 0x20,
        });
        let text = invocation_to_str(&config, &inv, &lookup);
        assert!(text.contains("CNode"));
        assert!(text.contains("Mint"));
        assert!(text.contains("(CNode: PD=a)"));
        assert!(text.contains("(Notification: PD=b)"));
        assert!(text.contains("badge"));
        assert!(text.contains("32")); // badge value in decimal
    }

    #[test]
    fn untyped_retype_shows_object_type_and_size() {
        let config = test_config();
        let inv = Invocation::new(InvocationArgs::UntypedRetype {
            untyped: 0x20,
            object_type: ObjectType::Tcb,
            size_bits: 0,
            root: 2,
            node_index: 1,
            node_depth: 1,
            node_offset: 10,
            num_objects: 1,
        });
        let text = invocation_to_str(&config, &inv, &HashMap::new());
        assert!(text.contains("SEL4_TCB_OBJECT"));
        assert!(text.contains("0 (N/A)"));
    }

    #[test]
    fn repeat_block_is_reported() {
        let config = test_config();
        let mut inv = Invocation::new(InvocationArgs::TcbResume { tcb: 1 });
        inv.repeat(5, InvocationArgs::TcbResume { tcb: 1 });
        let text = invocation_to_str(&config, &inv, &HashMap::new());
        assert!(text.contains("REPEAT: count=5"));
    }
}
