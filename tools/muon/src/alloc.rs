//! Untyped-pool allocator for kernel objects.
//!
//! Tracks the space remaining in each non-device untyped with a bump
//! watermark, mimicking the kernel's own allocation policy. The only choice
//! the allocator makes is which untyped to use, and that is first fit —
//! matching the kernel is mandatory, because the generated retype
//! invocations execute in allocation order and untyped memory only advances.
//!
//! The allocator does not emit the retype invocations itself; the caller
//! does, with the destination cap slots it manages.

use anyhow::{Result, bail};

use crate::bootinfo::KernelBootInfo;
use crate::sel4::UntypedObject;
use crate::util::{is_power_of_two, round_up};

/// One planned allocation out of an untyped.
#[derive(Debug, Clone, Copy)]
pub struct KernelAllocation {
    /// Cap address of the source untyped in the initial CSpace.
    pub untyped_cap_address: u64,
    /// Physical address the object(s) will occupy.
    pub phys_addr: u64,
    /// Sequential allocation index, for reporting.
    pub allocation_order: u64,
}

#[derive(Debug)]
struct UntypedAllocator {
    untyped_object: UntypedObject,
    allocation_point: u64,
}

impl UntypedAllocator {
    fn base(&self) -> u64 {
        self.untyped_object.region.base
    }

    fn end(&self) -> u64 {
        self.untyped_object.region.end
    }
}

/// First-fit bump allocator over the normal-memory untypeds.
#[derive(Debug)]
pub struct ObjectAllocator {
    allocation_idx: u64,
    untyped: Vec<UntypedAllocator>,
}

impl ObjectAllocator {
    /// Build the allocator from the emulated boot info.
    ///
    /// Device untypeds are excluded: kernel objects only come from normal
    /// memory.
    #[must_use]
    pub fn new(boot_info: &KernelBootInfo) -> Self {
        let untyped = boot_info
            .untyped_objects
            .iter()
            .filter(|ut| !ut.is_device)
            .map(|ut| UntypedAllocator {
                untyped_object: *ut,
                allocation_point: 0,
            })
            .collect();
        Self {
            allocation_idx: 0,
            untyped,
        }
    }

    /// Allocate `count` objects of `size` bytes each (a power of two).
    ///
    /// The watermark is rounded up to the object size first, exactly as the
    /// kernel aligns during retype.
    ///
    /// # Errors
    ///
    /// Fails when no untyped has enough room — an under-provisioned board.
    pub fn alloc(&mut self, size: u64, count: u64) -> Result<KernelAllocation> {
        assert!(is_power_of_two(size));
        for ut in &mut self.untyped {
            let start = round_up(ut.base() + ut.allocation_point, size);
            if start + count * size <= ut.end() {
                ut.allocation_point = (start - ut.base()) + count * size;
                self.allocation_idx += 1;
                return Ok(KernelAllocation {
                    untyped_cap_address: ut.untyped_object.cap,
                    phys_addr: start,
                    allocation_order: self.allocation_idx,
                });
            }
        }
        bail!(
            "no untyped object has room for {count} object(s) of {size} bytes \
             ({} bytes total)",
            count * size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegion;

    fn boot_info_with(untypeds: &[(u64, u64, bool)]) -> KernelBootInfo {
        KernelBootInfo {
            fixed_cap_count: 15,
            schedcontrol_cap: 20,
            paging_cap_count: 3,
            page_cap_count: 16,
            untyped_objects: untypeds
                .iter()
                .enumerate()
                .map(|(idx, &(base, end, is_device))| UntypedObject {
                    cap: 100 + idx as u64,
                    region: MemoryRegion::new(base, end),
                    is_device,
                })
                .collect(),
            first_available_cap: 200,
        }
    }

    #[test]
    fn device_untypeds_are_excluded() {
        let info = boot_info_with(&[
            (0x0, 0x1000_0000, true),
            (0x4000_0000, 0x4001_0000, false),
        ]);
        let mut alloc = ObjectAllocator::new(&info);
        let a = alloc.alloc(0x1000, 1).unwrap();
        assert_eq!(a.untyped_cap_address, 101);
        assert_eq!(a.phys_addr, 0x4000_0000);
    }

    #[test]
    fn watermark_advances_and_aligns() {
        let info = boot_info_with(&[(0x4000_0000, 0x4010_0000, false)]);
        let mut alloc = ObjectAllocator::new(&info);

        let a = alloc.alloc(0x20, 1).unwrap();
        assert_eq!(a.phys_addr, 0x4000_0000);
        assert_eq!(a.allocation_order, 1);

        // A page-sized object must skip to the next page boundary.
        let b = alloc.alloc(0x1000, 2).unwrap();
        assert_eq!(b.phys_addr, 0x4000_1000);
        assert_eq!(b.allocation_order, 2);

        // The small gap behind the watermark is not reused.
        let c = alloc.alloc(0x20, 1).unwrap();
        assert_eq!(c.phys_addr, 0x4000_3000);
    }

    #[test]
    fn first_fit_spills_to_next_untyped() {
        let info = boot_info_with(&[
            (0x4000_0000, 0x4000_2000, false),
            (0x5000_0000, 0x5010_0000, false),
        ]);
        let mut alloc = ObjectAllocator::new(&info);
        // Too large for the first untyped.
        let a = alloc.alloc(0x1000, 4).unwrap();
        assert_eq!(a.phys_addr, 0x5000_0000);
        // Small object still lands in the first.
        let b = alloc.alloc(0x1000, 1).unwrap();
        assert_eq!(b.phys_addr, 0x4000_0000);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let info = boot_info_with(&[(0x4000_0000, 0x4000_2000, false)]);
        let mut alloc = ObjectAllocator::new(&info);
        assert!(alloc.alloc(0x1000, 16).is_err());
    }
}
