//! System description parser.
//!
//! Parses the declarative XML into owned, validated records. Every element
//! is checked for unknown attributes and stray text, every value for range
//! and format, and every failure carries a `file:line.column` tag so the
//! user can find the offending element.
//!
//! The protection-domain tree is flattened before use: each PD ends up in
//! one owning vector with a parent *index* instead of a back-reference.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use roxmltree::{Document, Node};

use crate::sel4::IrqTrigger;
use crate::util::parse_int;
use crate::verbose::dprintln;

/// Page sizes the platform supports, ascending.
#[derive(Debug, Clone, Copy)]
pub struct PlatformDescription {
    pub page_sizes: [u64; 2],
}

impl Default for PlatformDescription {
    fn default() -> Self {
        Self {
            page_sizes: [0x1000, 0x200_000],
        }
    }
}

/// A user-declared (or synthetic) memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysMemoryRegion {
    pub name: String,
    pub size: u64,
    pub page_size: u64,
    pub page_count: u64,
    pub phys_addr: Option<u64>,
}

/// A mapping of a memory region into a PD's (or VM's) address space.
#[derive(Debug, Clone)]
pub struct SysMap {
    pub mr: String,
    pub vaddr: u64,
    /// Subset of "rwx"; write-only is rejected at parse time.
    pub perms: String,
    pub cached: bool,
    /// Source location, absent for maps the builder synthesizes.
    pub loc: Option<String>,
}

impl SysMap {
    pub fn has_perm(&self, perm: char) -> bool {
        self.perms.contains(perm)
    }
}

/// An interrupt delivered to a PD as a channel identifier.
#[derive(Debug, Clone, Copy)]
pub struct SysIrq {
    pub irq: u64,
    pub id: u64,
    pub trigger: IrqTrigger,
}

/// A symbol patch requested in the system description.
#[derive(Debug, Clone)]
pub struct SysSetVar {
    pub symbol: String,
    pub kind: SetVarKind,
}

/// What a `setvar` patches the symbol with.
#[derive(Debug, Clone)]
pub enum SetVarKind {
    /// Physical base address of the named memory region.
    RegionPaddr(String),
    /// A literal virtual address (from `setvar_vaddr` on a map).
    Vaddr(u64),
}

/// A virtual machine hosted by a protection domain.
#[derive(Debug, Clone)]
pub struct VirtualMachine {
    pub name: String,
    pub vm_id: u64,
    pub program_image: PathBuf,
    pub device_tree: Option<PathBuf>,
}

/// A protection domain.
///
/// After [`SystemDescription`] construction, `child_pds` is always empty:
/// the tree has been flattened and children point back via `parent`.
#[derive(Debug, Clone)]
pub struct ProtectionDomain {
    /// Identifier of a non-root PD, unique within its parent.
    pub pd_id: Option<u64>,
    pub name: String,
    pub priority: u64,
    pub budget: u64,
    pub period: u64,
    /// Whether the PD accepts protected procedure calls.
    pub pp: bool,
    pub passive: bool,
    /// CPU affinity.
    pub cpu: u64,
    pub program_image: PathBuf,
    pub maps: Vec<SysMap>,
    pub irqs: Vec<SysIrq>,
    pub setvars: Vec<SysSetVar>,
    pub virtual_machine: Option<VirtualMachine>,
    child_pds: Vec<ProtectionDomain>,
    /// Index of the parent PD in the flattened vector.
    pub parent: Option<usize>,
    pub loc: String,
}

/// A bidirectional channel between two PDs.
#[derive(Debug, Clone)]
pub struct Channel {
    pub pd_a: String,
    pub id_a: u64,
    pub pd_b: String,
    pub id_b: u64,
    pub loc: String,
}

/// The parsed, validated system. Immutable after construction.
#[derive(Debug)]
pub struct SystemDescription {
    pub memory_regions: Vec<SysMemoryRegion>,
    /// All PDs, roots first in document order, each subtree pre-order.
    pub protection_domains: Vec<ProtectionDomain>,
    pub channels: Vec<Channel>,
    pd_by_name: HashMap<String, usize>,
}

impl SystemDescription {
    /// Index of the PD with the given name.
    #[must_use]
    pub fn pd_index(&self, name: &str) -> Option<usize> {
        self.pd_by_name.get(name).copied()
    }

    /// The virtual machines, paired with the index of their hosting PD.
    #[must_use]
    pub fn virtual_machines(&self) -> Vec<(usize, &VirtualMachine)> {
        self.protection_domains
            .iter()
            .enumerate()
            .filter_map(|(idx, pd)| pd.virtual_machine.as_ref().map(|vm| (idx, vm)))
            .collect()
    }

    /// Indices of the children of PD `parent_idx`, in order.
    #[must_use]
    pub fn children_of(&self, parent_idx: usize) -> Vec<usize> {
        self.protection_domains
            .iter()
            .enumerate()
            .filter_map(|(idx, pd)| (pd.parent == Some(parent_idx)).then_some(idx))
            .collect()
    }

    fn new(
        memory_regions: Vec<SysMemoryRegion>,
        root_pds: Vec<ProtectionDomain>,
        channels: Vec<Channel>,
    ) -> Result<Self> {
        let protection_domains = flatten_pds(root_pds)?;

        if protection_domains.is_empty() {
            bail!("At least one protection domain must be defined");
        }
        if protection_domains.len() > 63 {
            bail!(
                "Too many protection domains ({}) defined. Maximum is 63.",
                protection_domains.len()
            );
        }

        let mut pd_by_name = HashMap::new();
        for (idx, pd) in protection_domains.iter().enumerate() {
            if pd_by_name.insert(pd.name.clone(), idx).is_some() {
                bail!("Duplicate protection domain name '{}'.", pd.name);
            }
        }

        let mut mr_by_name: HashMap<&str, &SysMemoryRegion> = HashMap::new();
        for mr in &memory_regions {
            if mr_by_name.insert(&mr.name, mr).is_some() {
                bail!("Duplicate memory region name '{}'.", mr.name);
            }
        }

        let mut vm_names = HashSet::new();
        let mut vm_ids = HashSet::new();
        for pd in &protection_domains {
            if let Some(vm) = &pd.virtual_machine {
                if !vm_names.insert(vm.name.clone()) {
                    bail!("Duplicate virtual machine name '{}'.", vm.name);
                }
                if !vm_ids.insert(vm.vm_id) {
                    bail!("Duplicate virtual machine id: {}", vm.vm_id);
                }
            }
        }

        for ch in &channels {
            for pd_name in [&ch.pd_a, &ch.pd_b] {
                if !pd_by_name.contains_key(pd_name.as_str()) {
                    bail!(
                        "Invalid pd name '{pd_name}'. on element 'channel': {}",
                        ch.loc
                    );
                }
            }
        }

        // IRQ numbers are global; channel-end ids and IRQ ids share a
        // per-PD namespace.
        let mut all_irqs = HashSet::new();
        let mut ch_ids: HashMap<&str, HashSet<u64>> = protection_domains
            .iter()
            .map(|pd| (pd.name.as_str(), HashSet::new()))
            .collect();
        for pd in &protection_domains {
            for irq in &pd.irqs {
                if !all_irqs.insert(irq.irq) {
                    bail!(
                        "duplicate irq: {} in protection domain: '{}' @ {}",
                        irq.irq,
                        pd.name,
                        pd.loc
                    );
                }
                if !ch_ids.get_mut(pd.name.as_str()).unwrap().insert(irq.id) {
                    bail!(
                        "duplicate channel id: {} in protection domain: '{}' @ {}",
                        irq.id,
                        pd.name,
                        pd.loc
                    );
                }
            }
        }
        for ch in &channels {
            for (pd_name, id) in [(&ch.pd_a, ch.id_a), (&ch.pd_b, ch.id_b)] {
                if !ch_ids.get_mut(pd_name.as_str()).unwrap().insert(id) {
                    let pd = &protection_domains[pd_by_name[pd_name.as_str()]];
                    bail!(
                        "duplicate channel id: {id} in protection domain: '{}' @ {}",
                        pd.name,
                        pd.loc
                    );
                }
            }
        }

        for pd in &protection_domains {
            for map in &pd.maps {
                let Some(mr) = mr_by_name.get(map.mr.as_str()) else {
                    bail!(
                        "Invalid memory region name '{}' on 'map' @ {}",
                        map.mr,
                        map.loc.as_deref().unwrap_or("<synthetic>")
                    );
                };
                if map.vaddr % mr.page_size != 0 {
                    bail!(
                        "Invalid vaddr alignment on 'map' @ {}",
                        map.loc.as_deref().unwrap_or("<synthetic>")
                    );
                }
            }
        }

        // Overlap of memory regions is checked during the build; unused
        // regions only warrant a warning.
        let mut unmapped: HashSet<&str> = memory_regions.iter().map(|mr| mr.name.as_str()).collect();
        for pd in &protection_domains {
            for map in &pd.maps {
                unmapped.remove(map.mr.as_str());
            }
        }
        for mr in &memory_regions {
            if unmapped.contains(mr.name.as_str()) {
                dprintln!("WARNING: Unused memory region: {}", mr.name);
            }
        }

        Ok(Self {
            memory_regions,
            protection_domains,
            channels,
            pd_by_name,
        })
    }
}

/// Flatten the PD tree, pre-order, replacing the child lists with parent
/// indices.
fn flatten_pds(root_pds: Vec<ProtectionDomain>) -> Result<Vec<ProtectionDomain>> {
    fn visit(
        mut pd: ProtectionDomain,
        parent: Option<usize>,
        out: &mut Vec<ProtectionDomain>,
    ) -> Result<()> {
        let children = std::mem::take(&mut pd.child_pds);
        let mut child_ids = HashSet::new();
        for child in &children {
            if !child_ids.insert(child.pd_id) {
                bail!(
                    "duplicate pd_id: {} in protection domain: '{}' @ {}",
                    child.pd_id.unwrap_or_default(),
                    pd.name,
                    child.loc
                );
            }
        }
        pd.parent = parent;
        let idx = out.len();
        out.push(pd);
        for child in children {
            visit(child, Some(idx), out)?;
        }
        Ok(())
    }

    let mut out = Vec::new();
    for pd in root_pds {
        visit(pd, None, &mut out)?;
    }
    Ok(out)
}

/// Parse context: source path plus the document for position lookups.
struct Ctx<'a, 'input> {
    path: &'a str,
    doc: &'a Document<'input>,
}

impl Ctx<'_, '_> {
    /// `file:line.column` for an element, column zero-based to match the
    /// established diagnostic format.
    fn loc(&self, node: Node) -> String {
        let pos = self.doc.text_pos_at(node.range().start);
        format!("{}:{}.{}", self.path, pos.row, pos.col.saturating_sub(1))
    }

    /// Wrap a value error with the element it occurred on.
    fn value_error(&self, node: Node, msg: &str) -> anyhow::Error {
        anyhow!(
            "Error: {msg} on element '{}': {}",
            node.tag_name().name(),
            self.loc(node)
        )
    }

    fn invalid_element(&self, node: Node) -> anyhow::Error {
        anyhow!(
            "Invalid XML element '{}': {}",
            node.tag_name().name(),
            self.loc(node)
        )
    }

    /// Reject attributes outside `valid`.
    fn check_attrs(&self, node: Node, valid: &[&str]) -> Result<()> {
        for attr in node.attributes() {
            if !valid.contains(&attr.name()) {
                return Err(self.value_error(node, &format!("invalid attribute '{}'", attr.name())));
            }
        }
        Ok(())
    }

    /// A required attribute.
    fn checked_lookup<'a, 'input>(&self, node: Node<'a, 'input>, attr: &str) -> Result<&'a str> {
        node.attribute(attr).ok_or_else(|| {
            anyhow!(
                "Error: Missing required attribute '{attr}' on element '{}': {}",
                node.tag_name().name(),
                self.loc(node)
            )
        })
    }

    fn int_attr(&self, node: Node, raw: &str) -> Result<u64> {
        parse_int(raw).ok_or_else(|| {
            self.value_error(node, &format!("invalid literal for int() with base 0: '{raw}'"))
        })
    }

    fn bool_attr(&self, node: Node, raw: &str) -> Result<bool> {
        match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(self.value_error(node, "invalid boolean value")),
        }
    }
}

fn parse_mr(ctx: &Ctx, node: Node, plat: &PlatformDescription) -> Result<SysMemoryRegion> {
    ctx.check_attrs(node, &["name", "size", "page_size", "phys_addr"])?;
    let name = ctx.checked_lookup(node, "name")?.to_string();
    let size = ctx.int_attr(node, ctx.checked_lookup(node, "size")?)?;
    let page_size = match node.attribute("page_size") {
        Some(raw) => ctx.int_attr(node, raw)?,
        None => plat.page_sizes[0],
    };
    if !plat.page_sizes.contains(&page_size) {
        return Err(ctx.value_error(node, &format!("page size 0x{page_size:x} not supported")));
    }
    if size % page_size != 0 {
        return Err(ctx.value_error(node, "size is not a multiple of the page size"));
    }
    let phys_addr = match node.attribute("phys_addr") {
        Some(raw) => Some(ctx.int_attr(node, raw)?),
        None => None,
    };
    if let Some(paddr) = phys_addr {
        if paddr % page_size != 0 {
            return Err(ctx.value_error(node, "phys_addr is not aligned to the page size"));
        }
    }
    Ok(SysMemoryRegion {
        name,
        size,
        page_size,
        page_count: size / page_size,
        phys_addr,
    })
}

fn parse_vm(ctx: &Ctx, node: Node) -> Result<VirtualMachine> {
    ctx.check_attrs(node, &["name", "id"])?;
    let name = ctx.checked_lookup(node, "name")?.to_string();
    let vm_id = ctx.int_attr(node, ctx.checked_lookup(node, "id")?)?;
    if vm_id > 255 {
        return Err(ctx.value_error(node, "id must be between 0 and 255"));
    }

    let mut program_image = None;
    let mut device_tree = None;
    for child in node.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "program_image" => {
                ctx.check_attrs(child, &["path"])?;
                if program_image.is_some() {
                    return Err(ctx.value_error(child, "program_image must only be specified once"));
                }
                program_image = Some(PathBuf::from(ctx.checked_lookup(child, "path")?));
            }
            "device_tree" => {
                ctx.check_attrs(child, &["path"])?;
                if device_tree.is_some() {
                    return Err(ctx.value_error(child, "device_tree must only be specified once"));
                }
                device_tree = Some(PathBuf::from(ctx.checked_lookup(child, "path")?));
            }
            _ => return Err(ctx.invalid_element(child)),
        }
    }

    let program_image =
        program_image.ok_or_else(|| ctx.value_error(node, "program_image must be specified"))?;
    Ok(VirtualMachine {
        name,
        vm_id,
        program_image,
        device_tree,
    })
}

fn parse_pd(ctx: &Ctx, node: Node, is_child: bool) -> Result<ProtectionDomain> {
    const ROOT_ATTRS: &[&str] = &["name", "priority", "pp", "passive", "cpu", "budget", "period"];
    const CHILD_ATTRS: &[&str] = &[
        "name", "priority", "pp", "passive", "cpu", "budget", "period", "pd_id",
    ];
    ctx.check_attrs(node, if is_child { CHILD_ATTRS } else { ROOT_ATTRS })?;

    let name = ctx.checked_lookup(node, "name")?.to_string();
    let priority = match node.attribute("priority") {
        Some(raw) => ctx.int_attr(node, raw)?,
        None => 0,
    };
    if priority > 254 {
        return Err(ctx.value_error(node, "priority must be between 0 and 254"));
    }
    let budget = match node.attribute("budget") {
        Some(raw) => ctx.int_attr(node, raw)?,
        None => 1000,
    };
    let period = match node.attribute("period") {
        Some(raw) => ctx.int_attr(node, raw)?,
        None => budget,
    };
    if budget > period {
        return Err(ctx.value_error(
            node,
            &format!("budget ({budget}) must be less than, or equal to, period ({period})"),
        ));
    }
    let pd_id = if is_child {
        let id = ctx.int_attr(node, ctx.checked_lookup(node, "pd_id")?)?;
        if id > 255 {
            return Err(ctx.value_error(node, "pd_id must be between 0 and 255"));
        }
        Some(id)
    } else {
        None
    };
    let pp = match node.attribute("pp") {
        Some(raw) => ctx.bool_attr(node, raw)?,
        None => false,
    };
    let passive = match node.attribute("passive") {
        Some(raw) => ctx.bool_attr(node, raw)?,
        None => false,
    };
    let cpu = match node.attribute("cpu") {
        Some(raw) => ctx.int_attr(node, raw)?,
        None => 0,
    };

    let mut program_image = None;
    let mut maps = Vec::new();
    let mut irqs = Vec::new();
    let mut setvars = Vec::new();
    let mut child_pds = Vec::new();
    let mut virtual_machine = None;

    for child in node.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "program_image" => {
                ctx.check_attrs(child, &["path"])?;
                if program_image.is_some() {
                    return Err(ctx.value_error(child, "program_image must only be specified once"));
                }
                program_image = Some(PathBuf::from(ctx.checked_lookup(child, "path")?));
            }
            "map" => {
                ctx.check_attrs(child, &["mr", "vaddr", "perms", "cached", "setvar_vaddr"])?;
                let mr = ctx.checked_lookup(child, "mr")?.to_string();
                let vaddr = ctx.int_attr(child, ctx.checked_lookup(child, "vaddr")?)?;
                let perms = child.attribute("perms").unwrap_or("rw").to_string();
                if let Some(bad) = perms.chars().find(|c| !"rwx".contains(*c)) {
                    return Err(
                        ctx.value_error(child, &format!("invalid permission character '{bad}'"))
                    );
                }
                if perms.contains('w') && !perms.contains('r') {
                    return Err(ctx.value_error(child, "write-only mappings are not supported"));
                }
                let cached = match child.attribute("cached") {
                    Some(raw) => ctx.bool_attr(child, raw)?,
                    None => true,
                };
                maps.push(SysMap {
                    mr,
                    vaddr,
                    perms,
                    cached,
                    loc: Some(ctx.loc(child)),
                });
                if let Some(symbol) = child.attribute("setvar_vaddr") {
                    setvars.push(SysSetVar {
                        symbol: symbol.to_string(),
                        kind: SetVarKind::Vaddr(vaddr),
                    });
                }
            }
            "irq" => {
                ctx.check_attrs(child, &["irq", "id", "trigger"])?;
                let irq = ctx.int_attr(child, ctx.checked_lookup(child, "irq")?)?;
                let id = ctx.int_attr(child, ctx.checked_lookup(child, "id")?)?;
                if id >= 64 {
                    return Err(ctx.value_error(child, "id must be < 64"));
                }
                let trigger = match child.attribute("trigger") {
                    Some("level") | None => IrqTrigger::Level,
                    Some("edge") => IrqTrigger::Edge,
                    Some(other) => {
                        return Err(ctx.value_error(child, &format!("invalid trigger '{other}'")));
                    }
                };
                irqs.push(SysIrq { irq, id, trigger });
            }
            "setvar" => {
                ctx.check_attrs(child, &["symbol", "region_paddr"])?;
                setvars.push(SysSetVar {
                    symbol: ctx.checked_lookup(child, "symbol")?.to_string(),
                    kind: SetVarKind::RegionPaddr(
                        ctx.checked_lookup(child, "region_paddr")?.to_string(),
                    ),
                });
            }
            "protection_domain" => child_pds.push(parse_pd(ctx, child, true)?),
            "virtual_machine" => {
                if virtual_machine.is_some() {
                    return Err(
                        ctx.value_error(child, "virtual_machine must only be specified once")
                    );
                }
                virtual_machine = Some(parse_vm(ctx, child)?);
            }
            _ => return Err(ctx.invalid_element(child)),
        }
    }

    let program_image =
        program_image.ok_or_else(|| ctx.value_error(node, "program_image must be specified"))?;

    Ok(ProtectionDomain {
        pd_id,
        name,
        priority,
        budget,
        period,
        pp,
        passive,
        cpu,
        program_image,
        maps,
        irqs,
        setvars,
        virtual_machine,
        child_pds,
        parent: None,
        loc: ctx.loc(node),
    })
}

fn parse_channel(ctx: &Ctx, node: Node) -> Result<Channel> {
    ctx.check_attrs(node, &[])?;
    let mut ends = Vec::new();
    for child in node.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "end" => {
                ctx.check_attrs(child, &["pd", "id"])?;
                let pd = ctx.checked_lookup(child, "pd")?.to_string();
                let id = ctx.int_attr(child, ctx.checked_lookup(child, "id")?)?;
                if id >= 64 {
                    return Err(ctx.value_error(child, "id must be < 64"));
                }
                ends.push((pd, id));
            }
            _ => return Err(ctx.invalid_element(child)),
        }
    }
    if ends.len() != 2 {
        return Err(ctx.value_error(node, "exactly two end elements must be specified"));
    }
    let (pd_b, id_b) = ends.pop().unwrap();
    let (pd_a, id_a) = ends.pop().unwrap();
    Ok(Channel {
        pd_a,
        id_a,
        pd_b,
        id_b,
        loc: ctx.loc(node),
    })
}

/// Reject non-whitespace text anywhere in the document.
fn check_no_text(ctx: &Ctx, root: Node) -> Result<()> {
    for node in root.descendants() {
        if node.is_text() && !node.text().unwrap_or("").trim().is_empty() {
            let parent = node.parent_element().unwrap_or(root);
            bail!(
                "Error: unexpected text found in element '{}' @ {}",
                parent.tag_name().name(),
                ctx.loc(parent)
            );
        }
    }
    Ok(())
}

/// Parse a system description from XML text.
///
/// `path` is only used for diagnostics; the caller has already read the
/// file.
pub fn parse_system(
    path: &str,
    xml: &str,
    plat: &PlatformDescription,
) -> Result<SystemDescription> {
    let doc = Document::parse(xml).map_err(|e| {
        let pos = e.pos();
        anyhow!("XML parse error: {path}:{}.{}", pos.row, pos.col)
    })?;
    let ctx = Ctx { path, doc: &doc };
    let root = doc.root_element();

    check_no_text(&ctx, root)?;

    let mut memory_regions = Vec::new();
    let mut protection_domains = Vec::new();
    let mut channels = Vec::new();
    for child in root.children().filter(Node::is_element) {
        match child.tag_name().name() {
            "memory_region" => memory_regions.push(parse_mr(&ctx, child, plat)?),
            "protection_domain" => protection_domains.push(parse_pd(&ctx, child, false)?),
            "channel" => channels.push(parse_channel(&ctx, child)?),
            _ => return Err(ctx.invalid_element(child)),
        }
    }

    SystemDescription::new(memory_regions, protection_domains, channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Result<SystemDescription> {
        parse_system("test.system", xml, &PlatformDescription::default())
    }

    fn parse_err(xml: &str) -> String {
        parse(xml).expect_err("fixture should be rejected").to_string()
    }

    fn one_pd(extra: &str) -> String {
        format!(
            r#"<system>
    <protection_domain name="main" priority="254">
        <program_image path="main.elf" />
    </protection_domain>
{extra}
</system>"#
        )
    }

    #[test]
    fn minimal_system_parses() {
        let system = parse(&one_pd("")).unwrap();
        assert_eq!(system.protection_domains.len(), 1);
        let pd = &system.protection_domains[0];
        assert_eq!(pd.name, "main");
        assert_eq!(pd.priority, 254);
        assert_eq!(pd.budget, 1000);
        assert_eq!(pd.period, 1000);
        assert!(!pd.pp);
        assert!(!pd.passive);
        assert_eq!(pd.cpu, 0);
    }

    #[test]
    fn mr_bad_size_literal() {
        let xml = one_pd(r#"    <memory_region name="mr" size="0x200_000sd" />"#);
        let err = parse_err(&xml);
        assert!(
            err.starts_with(
                "Error: invalid literal for int() with base 0: '0x200_000sd' on element 'memory_region'"
            ),
            "unexpected: {err}"
        );
    }

    #[test]
    fn mr_unsupported_page_size() {
        let xml = one_pd(r#"    <memory_region name="mr" size="0x400002" page_size="0x200001" />"#);
        let err = parse_err(&xml);
        assert!(
            err.starts_with("Error: page size 0x200001 not supported on element 'memory_region'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn mr_size_not_page_multiple() {
        let xml = one_pd(r#"    <memory_region name="mr" size="0x1000" page_size="0x200000" />"#);
        let err = parse_err(&xml);
        assert!(
            err.starts_with("Error: size is not a multiple of the page size on element 'memory_region'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn mr_misaligned_phys_addr() {
        let xml = one_pd(r#"    <memory_region name="mr" size="0x1000" phys_addr="0x1001" />"#);
        let err = parse_err(&xml);
        assert!(
            err.starts_with(
                "Error: phys_addr is not aligned to the page size on element 'memory_region'"
            ),
            "unexpected: {err}"
        );
    }

    #[test]
    fn duplicate_pd_names() {
        let xml = r#"<system>
    <protection_domain name="test"><program_image path="a.elf" /></protection_domain>
    <protection_domain name="test"><program_image path="b.elf" /></protection_domain>
</system>"#;
        assert_eq!(parse_err(xml), "Duplicate protection domain name 'test'.");
    }

    #[test]
    fn channel_id_out_of_range() {
        let xml = r#"<system>
    <protection_domain name="a"><program_image path="a.elf" /></protection_domain>
    <protection_domain name="b"><program_image path="b.elf" /></protection_domain>
    <channel>
        <end pd="a" id="64" />
        <end pd="b" id="1" />
    </channel>
</system>"#;
        let err = parse_err(xml);
        assert!(
            err.starts_with("Error: id must be < 64 on element 'end'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn too_many_pds() {
        let pds: String = (0..64)
            .map(|i| {
                format!(
                    r#"    <protection_domain name="pd{i}"><program_image path="p.elf" /></protection_domain>
"#
                )
            })
            .collect();
        let xml = format!("<system>\n{pds}</system>");
        assert_eq!(
            parse_err(&xml),
            "Too many protection domains (64) defined. Maximum is 63."
        );
    }

    #[test]
    fn unknown_attribute_rejected() {
        let xml = one_pd(r#"    <memory_region name="mr" size="0x1000" colour="red" />"#);
        let err = parse_err(&xml);
        assert!(
            err.starts_with("Error: invalid attribute 'colour' on element 'memory_region'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn missing_required_attribute() {
        let xml = one_pd(r#"    <memory_region size="0x1000" />"#);
        let err = parse_err(&xml);
        assert!(
            err.starts_with("Error: Missing required attribute 'name' on element 'memory_region'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn stray_text_rejected() {
        let xml = r#"<system>
    <protection_domain name="main">hello
        <program_image path="main.elf" />
    </protection_domain>
</system>"#;
        let err = parse_err(xml);
        assert!(
            err.starts_with("Error: unexpected text found in element 'protection_domain'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn error_location_is_tagged() {
        let xml = one_pd(r#"    <memory_region name="mr" size="0x1001" />"#);
        let err = parse_err(&xml);
        assert!(err.contains("test.system:5."), "unexpected: {err}");
    }

    #[test]
    fn write_only_map_rejected() {
        let xml = r#"<system>
    <memory_region name="buf" size="0x1000" />
    <protection_domain name="main">
        <program_image path="main.elf" />
        <map mr="buf" vaddr="0x400000" perms="w" />
    </protection_domain>
</system>"#;
        let err = parse_err(xml);
        assert!(
            err.starts_with("Error: write-only mappings are not supported on element 'map'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn misaligned_map_rejected() {
        let xml = r#"<system>
    <memory_region name="buf" size="0x200000" page_size="0x200000" />
    <protection_domain name="main">
        <program_image path="main.elf" />
        <map mr="buf" vaddr="0x1000" perms="rw" />
    </protection_domain>
</system>"#;
        let err = parse_err(xml);
        assert!(
            err.starts_with("Invalid vaddr alignment on 'map'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn dangling_map_reference_rejected() {
        let xml = r#"<system>
    <protection_domain name="main">
        <program_image path="main.elf" />
        <map mr="nope" vaddr="0x1000" />
    </protection_domain>
</system>"#;
        let err = parse_err(xml);
        assert!(
            err.starts_with("Invalid memory region name 'nope' on 'map'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn dangling_channel_reference_rejected() {
        let xml = r#"<system>
    <protection_domain name="a"><program_image path="a.elf" /></protection_domain>
    <channel>
        <end pd="a" id="1" />
        <end pd="ghost" id="2" />
    </channel>
</system>"#;
        let err = parse_err(xml);
        assert!(
            err.starts_with("Invalid pd name 'ghost'."),
            "unexpected: {err}"
        );
    }

    #[test]
    fn duplicate_irq_rejected() {
        let xml = r#"<system>
    <protection_domain name="a">
        <program_image path="a.elf" />
        <irq irq="5" id="1" />
    </protection_domain>
    <protection_domain name="b">
        <program_image path="b.elf" />
        <irq irq="5" id="1" />
    </protection_domain>
</system>"#;
        let err = parse_err(xml);
        assert!(err.starts_with("duplicate irq: 5"), "unexpected: {err}");
    }

    #[test]
    fn irq_and_channel_share_id_namespace() {
        let xml = r#"<system>
    <protection_domain name="a">
        <program_image path="a.elf" />
        <irq irq="5" id="3" />
    </protection_domain>
    <protection_domain name="b"><program_image path="b.elf" /></protection_domain>
    <channel>
        <end pd="a" id="3" />
        <end pd="b" id="1" />
    </channel>
</system>"#;
        let err = parse_err(xml);
        assert!(
            err.starts_with("duplicate channel id: 3 in protection domain: 'a'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn pd_tree_is_flattened_with_parent_indices() {
        let xml = r#"<system>
    <protection_domain name="parent">
        <program_image path="parent.elf" />
        <protection_domain name="kid" pd_id="1">
            <program_image path="kid.elf" />
        </protection_domain>
    </protection_domain>
    <protection_domain name="other"><program_image path="other.elf" /></protection_domain>
</system>"#;
        let system = parse(xml).unwrap();
        let names: Vec<&str> = system
            .protection_domains
            .iter()
            .map(|pd| pd.name.as_str())
            .collect();
        assert_eq!(names, vec!["parent", "kid", "other"]);
        assert_eq!(system.protection_domains[0].parent, None);
        assert_eq!(system.protection_domains[1].parent, Some(0));
        assert_eq!(system.protection_domains[1].pd_id, Some(1));
        assert_eq!(system.children_of(0), vec![1]);
        assert_eq!(system.pd_index("other"), Some(2));
    }

    #[test]
    fn duplicate_child_pd_id_rejected() {
        let xml = r#"<system>
    <protection_domain name="parent">
        <program_image path="parent.elf" />
        <protection_domain name="a" pd_id="1"><program_image path="a.elf" /></protection_domain>
        <protection_domain name="b" pd_id="1"><program_image path="b.elf" /></protection_domain>
    </protection_domain>
</system>"#;
        let err = parse_err(xml);
        assert!(
            err.starts_with("duplicate pd_id: 1 in protection domain: 'parent'"),
            "unexpected: {err}"
        );
    }

    #[test]
    fn virtual_machine_parses() {
        let xml = r#"<system>
    <protection_domain name="vmm">
        <program_image path="vmm.elf" />
        <virtual_machine name="linux" id="1">
            <program_image path="linux.bin" />
            <device_tree path="linux.dtb" />
        </virtual_machine>
    </protection_domain>
</system>"#;
        let system = parse(xml).unwrap();
        let vms = system.virtual_machines();
        assert_eq!(vms.len(), 1);
        let (host, vm) = vms[0];
        assert_eq!(host, 0);
        assert_eq!(vm.name, "linux");
        assert_eq!(vm.vm_id, 1);
        assert_eq!(vm.device_tree.as_deref(), Some(std::path::Path::new("linux.dtb")));
    }

    #[test]
    fn irq_trigger_modes() {
        let xml = r#"<system>
    <protection_domain name="drv">
        <program_image path="drv.elf" />
        <irq irq="33" id="0" />
        <irq irq="34" id="1" trigger="edge" />
    </protection_domain>
</system>"#;
        let system = parse(xml).unwrap();
        let irqs = &system.protection_domains[0].irqs;
        assert_eq!(irqs[0].trigger, IrqTrigger::Level);
        assert_eq!(irqs[1].trigger, IrqTrigger::Edge);
    }

    #[test]
    fn setvars_collected_from_both_forms() {
        let xml = r#"<system>
    <memory_region name="dma" size="0x1000" phys_addr="0x30000000" />
    <protection_domain name="drv">
        <program_image path="drv.elf" />
        <map mr="dma" vaddr="0x400000" setvar_vaddr="dma_base" />
        <setvar symbol="dma_paddr" region_paddr="dma" />
    </protection_domain>
</system>"#;
        let system = parse(xml).unwrap();
        let setvars = &system.protection_domains[0].setvars;
        assert_eq!(setvars.len(), 2);
        assert!(matches!(
            (&setvars[0].kind, setvars[0].symbol.as_str()),
            (SetVarKind::Vaddr(0x40_0000), "dma_base")
        ));
        assert!(matches!(
            (&setvars[1].kind, setvars[1].symbol.as_str()),
            (SetVarKind::RegionPaddr(_), "dma_paddr")
        ));
    }
}
