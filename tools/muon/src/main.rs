//! Static system image builder for seL4-based systems.
//!
//! Takes a declarative XML description of a static system and the
//! pre-built board ELFs (loader, kernel, monitor) from the SDK, and
//! produces a single bootable image plus an allocation report. The monitor
//! replays the generated invocation streams at boot, reconstructing exactly
//! the capability graph the description declares.
//!
//! Pipeline: parse XML → emulate kernel boot → plan objects and generate
//!           invocations (iterating the size estimates to a fixed point) →
//!           patch monitor/PD symbols → pack the loader image.

mod alloc;
mod bootinfo;
mod builder;
mod cli;
mod loader;
mod memory;
mod report;
mod sel4;
mod sysxml;
mod util;
mod verbose;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use muon_elf::ElfFile;
use serde::Deserialize;

use crate::builder::BuiltSystem;
use crate::sel4::{Arch, KernelConfig};
use crate::util::{kb, round_up};
use crate::verbose::{dprintln, vprintln};

/// Environment variable naming the SDK root.
const SDK_ENV: &str = "MUON_SDK";

/// Monitor symbols the builder patches. The struct layouts are fixed
/// contracts with the monitor's C code; the capacities are discovered from
/// the symbol sizes so the monitor can grow without retooling.
struct MonitorConfig {
    untyped_info_symbol_name: &'static str,
    /// `(cap_start, cap_end)`.
    untyped_info_header_size: u64,
    /// `(base, size_bits, is_device)` per untyped.
    untyped_info_object_size: u64,
    bootstrap_invocation_count_symbol_name: &'static str,
    bootstrap_invocation_data_symbol_name: &'static str,
    system_invocation_count_symbol_name: &'static str,
}

const MONITOR_CONFIG: MonitorConfig = MonitorConfig {
    untyped_info_symbol_name: "untyped_info",
    untyped_info_header_size: 16,
    untyped_info_object_size: 24,
    bootstrap_invocation_count_symbol_name: "bootstrap_invocation_count",
    bootstrap_invocation_data_symbol_name: "bootstrap_invocation_data",
    system_invocation_count_symbol_name: "system_invocation_count",
};

impl MonitorConfig {
    fn max_untyped_objects(&self, symbol_size: u64) -> u64 {
        (symbol_size - self.untyped_info_header_size) / self.untyped_info_object_size
    }
}

/// The flat `config.json` an SDK board/config directory carries.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BoardConfig {
    arch: String,
    word_size: u64,
    paddr_user_device_top: u64,
    root_cnode_bits: u64,
    retype_fan_out_limit: u64,
    #[serde(default = "default_num_cpus")]
    num_cpus: u64,
    #[serde(default)]
    have_fpu: bool,
    #[serde(default)]
    hypervisor: bool,
    #[serde(default)]
    arm_pa_size_bits: Option<u64>,
    #[serde(default)]
    riscv_pt_levels: Option<u64>,
    #[serde(default)]
    x86_xsave_size: Option<u64>,
}

fn default_num_cpus() -> u64 {
    1
}

fn kernel_config_from_board(config: &BoardConfig) -> Result<KernelConfig> {
    let arch = match config.arch.as_str() {
        "aarch64" => Arch::Aarch64,
        "riscv64" => Arch::Riscv64,
        "x86_64" => Arch::X86_64,
        other => bail!("Error: unknown architecture '{other}' in config.json"),
    };
    // The loader's boot page tables and the thread register file are only
    // defined for AArch64 and RISC-V; accept the x86 configuration fields
    // but refuse to generate an image.
    if arch == Arch::X86_64 {
        bail!("Error: x86_64 board configurations are not supported for image generation");
    }
    Ok(KernelConfig {
        arch,
        word_size: config.word_size,
        minimum_page_size: kb(4),
        paddr_user_device_top: config.paddr_user_device_top,
        kernel_frame_size: arch.kernel_frame_size(),
        init_cnode_bits: config.root_cnode_bits,
        cap_address_bits: 64,
        fan_out_limit: config.retype_fan_out_limit,
        have_fpu: config.have_fpu,
        hyp_mode: config.hypervisor,
        num_cpus: config.num_cpus,
        arm_pa_size_bits: config.arm_pa_size_bits,
        riscv_pt_levels: config.riscv_pt_levels,
        x86_xsave_size: config.x86_xsave_size,
    })
}

fn load_elf(path: &Path) -> Result<ElfFile> {
    let data =
        std::fs::read(path).with_context(|| format!("Error: reading ELF '{}'", path.display()))?;
    ElfFile::parse(&data).map_err(|e| anyhow!("Error: parsing ELF '{}': {e}", path.display()))
}

/// A word array symbol holding a zero entry followed by per-PD caps.
fn cap_array_bytes(caps: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((caps.len() + 1) * 8);
    bytes.extend_from_slice(&0u64.to_le_bytes());
    for cap in caps {
        bytes.extend_from_slice(&cap.to_le_bytes());
    }
    bytes
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    verbose::init(cli.quiet, cli.verbose);

    let Ok(sdk_dir) = std::env::var(SDK_ENV) else {
        bail!("Error: {SDK_ENV} must be set");
    };
    let sdk_dir = PathBuf::from(sdk_dir);
    if !sdk_dir.exists() {
        bail!(
            "Error: SDK directory '{}' does not exist. Check the {SDK_ENV} environment variable \
             is set correctly",
            sdk_dir.display()
        );
    }
    let boards_path = sdk_dir.join("board");
    if !boards_path.exists() {
        bail!(
            "Error: SDK directory '{}' does not have a 'board' sub-directory. Check the \
             {SDK_ENV} environment variable is set correctly",
            sdk_dir.display()
        );
    }
    let board_path = boards_path.join(&cli.board);
    if !board_path.exists() {
        bail!("Error: board path '{}' does not exist.", board_path.display());
    }
    let config_path = board_path.join(&cli.config);
    if !config_path.exists() {
        bail!(
            "Error: config path '{}' does not exist.",
            config_path.display()
        );
    }

    let board_config_path = config_path.join("config.json");
    let elf_path = config_path.join("elf");
    let loader_elf_path = elf_path.join("loader.elf");
    let kernel_elf_path = elf_path.join("sel4.elf");
    let monitor_elf_path = elf_path.join("monitor.elf");
    for (what, path) in [
        ("kernel configuration", &board_config_path),
        ("loader ELF", &loader_elf_path),
        ("kernel ELF", &kernel_elf_path),
        ("monitor ELF", &monitor_elf_path),
    ] {
        if !path.exists() {
            bail!("Error: {what} '{}' does not exist", path.display());
        }
    }
    if !cli.system.exists() {
        bail!(
            "Error: system description file '{}' does not exist",
            cli.system.display()
        );
    }

    let board_config: BoardConfig = serde_json::from_str(
        &std::fs::read_to_string(&board_config_path)
            .with_context(|| format!("Error: reading '{}'", board_config_path.display()))?,
    )
    .with_context(|| format!("Error: parsing '{}'", board_config_path.display()))?;
    let kernel_config = kernel_config_from_board(&board_config)?;

    let mut search_paths = vec![std::env::current_dir()?];
    search_paths.extend(cli.search_paths.iter().cloned());

    let system_xml = std::fs::read_to_string(&cli.system)
        .with_context(|| format!("Error: reading '{}'", cli.system.display()))?;
    let system = sysxml::parse_system(
        &cli.system.display().to_string(),
        &system_xml,
        &sysxml::PlatformDescription::default(),
    )?;

    let loader_elf = load_elf(&loader_elf_path)?;
    let kernel_elf = load_elf(&kernel_elf_path)?;
    if u64::from(kernel_elf.word_size) != kernel_config.word_size {
        bail!(
            "Error: kernel ELF word size ({}) does not match the configuration ({})",
            kernel_elf.word_size,
            kernel_config.word_size
        );
    }
    let mut monitor_elf = load_elf(&monitor_elf_path)?;
    if monitor_elf.segments.len() > 1 {
        bail!(
            "Error: monitor ('{}') has {} segments; must only have one",
            monitor_elf_path.display(),
            monitor_elf.segments.len()
        );
    }

    // Iterate the two size estimates to a fixed point: the first pass uses
    // minimal sizes, later passes grow the invocation table to a page
    // multiple and the system CNode to the next power of two. Every
    // increase is strict, so the loop terminates.
    let mut invocation_table_size = kernel_config.minimum_page_size;
    let mut system_cnode_size = 2;
    let built_system: BuiltSystem = loop {
        let built = builder::build_system(
            &kernel_config,
            &kernel_elf,
            &monitor_elf,
            &system,
            invocation_table_size,
            system_cnode_size,
            &search_paths,
        )?;
        vprintln!(
            "BUILT: system_cnode_size={system_cnode_size} number_of_system_caps={} \
             invocation_table_size={invocation_table_size} invocation_data_size={}",
            built.number_of_system_caps,
            built.invocation_data_size
        );
        if built.number_of_system_caps <= system_cnode_size
            && built.invocation_data_size <= invocation_table_size
        {
            break built;
        }
        invocation_table_size = invocation_table_size.max(round_up(
            built.invocation_data_size,
            kernel_config.minimum_page_size,
        ));
        system_cnode_size =
            system_cnode_size.max(built.number_of_system_caps.next_power_of_two());
    };

    // The monitor cross-checks the emulated boot against the real BootInfo
    // at run time; give it the untyped list we computed.
    let (_, untyped_info_size) = monitor_elf.find_symbol(MONITOR_CONFIG.untyped_info_symbol_name)?;
    let max_untyped_objects = MONITOR_CONFIG.max_untyped_objects(untyped_info_size);
    let untyped_objects = &built_system.kernel_boot_info.untyped_objects;
    if untyped_objects.len() as u64 > max_untyped_objects {
        bail!(
            "Error: too many untyped objects: monitor ('{}') supports {max_untyped_objects} \
             regions. System has {} objects.",
            monitor_elf_path.display(),
            untyped_objects.len()
        );
    }
    let mut untyped_info = Vec::new();
    untyped_info.extend_from_slice(&untyped_objects[0].cap.to_le_bytes());
    untyped_info.extend_from_slice(&(untyped_objects.last().unwrap().cap + 1).to_le_bytes());
    for ut in untyped_objects {
        untyped_info.extend_from_slice(&ut.base().to_le_bytes());
        untyped_info.extend_from_slice(&ut.size_bits().to_le_bytes());
        untyped_info.extend_from_slice(&u64::from(ut.is_device).to_le_bytes());
    }
    monitor_elf.write_symbol(MONITOR_CONFIG.untyped_info_symbol_name, &untyped_info)?;

    let mut bootstrap_invocation_data = Vec::new();
    for invocation in &built_system.bootstrap_invocations {
        invocation.add_raw_invocation(&kernel_config, &mut bootstrap_invocation_data);
    }
    let (_, bootstrap_data_capacity) =
        monitor_elf.find_symbol(MONITOR_CONFIG.bootstrap_invocation_data_symbol_name)?;
    if bootstrap_invocation_data.len() as u64 > bootstrap_data_capacity {
        eprintln!("INTERNAL ERROR: bootstrap invocations too large");
        eprintln!("bootstrap invocation array size   : {bootstrap_data_capacity}");
        eprintln!(
            "bootstrap invocation required size: {}",
            bootstrap_invocation_data.len()
        );
        for invocation in &built_system.bootstrap_invocations {
            eprintln!(
                "{}",
                report::invocation_to_str(&kernel_config, invocation, &built_system.cap_lookup)
            );
        }
        bail!("Error: bootstrap invocations too large for monitor");
    }

    monitor_elf.write_symbol(
        MONITOR_CONFIG.bootstrap_invocation_count_symbol_name,
        &(built_system.bootstrap_invocations.len() as u64).to_le_bytes(),
    )?;
    monitor_elf.write_symbol(
        MONITOR_CONFIG.system_invocation_count_symbol_name,
        &(built_system.system_invocations.len() as u64).to_le_bytes(),
    )?;
    monitor_elf.write_symbol(
        MONITOR_CONFIG.bootstrap_invocation_data_symbol_name,
        &bootstrap_invocation_data,
    )?;

    monitor_elf.write_symbol("fault_ep", &built_system.fault_ep_cap_address.to_le_bytes())?;
    monitor_elf.write_symbol("reply", &built_system.reply_cap_address.to_le_bytes())?;
    monitor_elf.write_symbol("tcbs", &cap_array_bytes(&built_system.tcb_caps))?;
    monitor_elf.write_symbol(
        "scheduling_contexts",
        &cap_array_bytes(&built_system.sched_caps),
    )?;
    monitor_elf.write_symbol(
        "notification_caps",
        &cap_array_bytes(&built_system.notification_caps),
    )?;
    let mut names_array = vec![0u8; 64 * 16];
    for (idx, pd) in system.protection_domains.iter().enumerate() {
        // Index 0 is reserved; names are nul-terminated 16-byte fields.
        let name = pd.name.as_bytes();
        let len = name.len().min(15);
        let offset = (idx + 1) * 16;
        names_array[offset..offset + len].copy_from_slice(&name[..len]);
    }
    monitor_elf.write_symbol("pd_names", &names_array)?;

    let mut system_invocation_data = Vec::new();
    for invocation in &built_system.system_invocations {
        invocation.add_raw_invocation(&kernel_config, &mut system_invocation_data);
    }
    assert_eq!(
        system_invocation_data.len() as u64,
        built_system.invocation_data_size
    );

    let mut regions: Vec<(u64, Vec<u8>)> = Vec::with_capacity(built_system.regions.len() + 1);
    regions.push((built_system.reserved_region.base, system_invocation_data.clone()));
    regions.extend(
        built_system
            .regions
            .iter()
            .map(|r| (r.addr, r.data.clone())),
    );

    let mut report_file = std::fs::File::create(&cli.report)
        .with_context(|| format!("Error: creating report '{}'", cli.report.display()))?;
    report::write_report(
        &mut report_file,
        &kernel_config,
        &built_system,
        bootstrap_invocation_data.len(),
        system_invocation_data.len(),
    )
    .with_context(|| format!("Error: writing report '{}'", cli.report.display()))?;

    let loader = loader::Loader::new(
        &kernel_config,
        &loader_elf,
        &kernel_elf,
        &monitor_elf,
        built_system.initial_task_phys_region.base,
        built_system.reserved_region,
        regions,
    )?;
    loader.write_image(&cli.output)?;

    dprintln!("Generated image: {}", cli.output.display());
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
