//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated MMU that can run on any host, so the whole
//! address-space core can be exercised without hardware access.
//!
//! The software-emulated architecture is a "scale model" of x86_64:
//! - 16-bit addresses (vs 48-bit on x86_64)
//! - 3 levels of page tables (vs 4 on x86_64)
//! - 4-bit indexes (16 entries per table, vs 9-bit/512 entries on x86_64)
//! - 4-bit page offset (16-byte pages, vs 12-bit/4KB on x86_64)

mod entry;
mod flags;
mod memory;
mod table;

use alloc::vec::Vec;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use memory::EmulatedMemory;
pub use table::PageTable;

use crate::{AreaFlags, AsFlags, Asid, FrameNumber, Result, VirtualAddress};

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 16;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = 16;

/// Page size in bytes (16 bytes = 2^4).
pub const PAGE_SIZE: usize = 16;

/// Number of page table levels (3 levels: level 2, 1, 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// First usable user address. Page zero stays unmapped.
pub const USER_SPACE_START: usize = PAGE_SIZE;

/// End (exclusive) of the user half of the address space.
pub const USER_SPACE_END: usize = 0x8000;

/// First address of the kernel half of the address space.
pub const KERNEL_SPACE_START: usize = 0xFFFF_FFFF_FFFF_8000;

/// Last address (inclusive) kernel areas may cover.
///
/// The topmost page is never handed out so that the end of every area is representable.
pub const KERNEL_SPACE_LAST: usize = usize::MAX - PAGE_SIZE;

/// Returns the page table index for a given virtual address at the specified level.
///
/// For software emulation:
/// - Level 0: Bits 4-7 (page table)
/// - Level 1: Bits 8-11 (page directory)
/// - Level 2: Bits 12-15 (root/page directory pointer)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for software emulation (0-2)");
    (address >> (4 + level * 4)) & 0xF
}

/// Validates a physical address for software emulation.
///
/// Physical addresses must fit within 16 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF
}

/// Validates a virtual address for software emulation.
///
/// Virtual addresses must be canonical (bits 16-63 must be sign-extended from bit 15).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let canonical = if (addr & 0x8000) != 0 {
        addr | 0xFFFF_FFFF_FFFF_0000
    } else {
        addr & 0xFFFF
    };
    canonical == addr
}

#[derive(Default)]
struct MmuState {
    next_table: usize,
    live_tables: usize,
    active: Option<(usize, Asid)>,
    invalidated_pages: Vec<(Option<Asid>, VirtualAddress)>,
    invalidated_asids: Vec<Asid>,
}

/// Software MMU implementing the architecture hooks.
///
/// Besides maintaining the emulated tables, it records the side effects real hardware would
/// have (activations and TLB invalidations) so they can be inspected.
pub struct SoftwareMmu {
    asid_count: usize,
    eager_reprotect: bool,
    state: spin::Mutex<MmuState>,
}

impl SoftwareMmu {
    /// Creates an MMU with `asid_count` hardware ASIDs (including the kernel's).
    pub fn new(asid_count: usize) -> Self {
        Self {
            asid_count,
            eager_reprotect: true,
            state: spin::Mutex::new(MmuState::default()),
        }
    }

    /// Makes flag changes leave existing mappings alone until the next fault.
    pub fn with_lazy_reprotect(mut self) -> Self {
        self.eager_reprotect = false;
        self
    }

    /// Table id and ASID most recently activated.
    pub fn active(&self) -> Option<(usize, Asid)> {
        self.state.lock().active
    }

    /// Number of tables created and not yet destroyed.
    pub fn live_tables(&self) -> usize {
        self.state.lock().live_tables
    }

    /// Every ASID whose translations have been flushed, oldest first.
    pub fn invalidated_asids(&self) -> Vec<Asid> {
        self.state.lock().invalidated_asids.clone()
    }

    /// Returns true if a translation of `page` has been flushed.
    pub fn was_invalidated(&self, page: VirtualAddress) -> bool {
        self.state
            .lock()
            .invalidated_pages
            .iter()
            .any(|(_, invalidated)| *invalidated == page)
    }
}

impl crate::Arch for SoftwareMmu {
    type PageTable = PageTable;

    fn asid_count(&self) -> usize {
        self.asid_count
    }

    fn create_table(&self, flags: AsFlags) -> Result<PageTable> {
        let mut state = self.state.lock();
        state.next_table += 1;
        state.live_tables += 1;
        Ok(PageTable::new(state.next_table, !flags.contains(AsFlags::KERNEL)))
    }

    fn destroy_table(&self, table: PageTable) {
        debug_assert_eq!(table.mapped_pages(), 0, "destroying a table with live mappings");
        self.state.lock().live_tables -= 1;
    }

    fn install_mapping(
        &self,
        table: &mut PageTable,
        page: VirtualAddress,
        frame: FrameNumber,
        flags: AreaFlags,
    ) -> Result<()> {
        debug_assert!(page.is_page_aligned(), "virtual address must be page-aligned");
        let user = table.is_user();
        *table.walk_or_create(page) = PageEntry::new(frame, PageFlags::for_area(flags, user));
        Ok(())
    }

    fn remove_mapping(&self, table: &mut PageTable, page: VirtualAddress) -> Option<FrameNumber> {
        let entry = table.walk_mut(page)?;
        let frame = entry.frame()?;
        entry.clear();
        Some(frame)
    }

    fn lookup(&self, table: &PageTable, page: VirtualAddress) -> Option<(FrameNumber, AreaFlags)> {
        let entry = table.walk(page)?;
        Some((entry.frame()?, entry.flags().to_area_flags()))
    }

    fn invalidate(&self, asid: Option<Asid>, page: VirtualAddress) {
        self.state.lock().invalidated_pages.push((asid, page));
    }

    fn invalidate_asid(&self, asid: Asid) {
        self.state.lock().invalidated_asids.push(asid);
    }

    fn activate(&self, table: &PageTable, asid: Asid) {
        self.state.lock().active = Some((table.id(), asid));
    }

    fn reprotects_eagerly(&self) -> bool {
        self.eager_reprotect
    }
}
