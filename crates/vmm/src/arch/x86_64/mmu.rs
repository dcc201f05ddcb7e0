//! Page-table hooks for x86_64 hardware.

use alloc::sync::Arc;

use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::mapper::{MapToError, MappedFrame, TranslateResult};
use x86_64::structures::paging::{
    FrameAllocator as HardwareFrameAllocator, Mapper, OffsetPageTable, Page,
    PageTable as HardwareTable, PageTableFlags, PhysFrame, Size4KiB, Translate,
};
use x86_64::{PhysAddr, VirtAddr};

use crate::{
    AreaFlags, AsFlags, Asid, Error, FrameAllocator, FrameNumber, PhysicalAddress, Result,
    VirtualAddress,
};

use super::flags::PageFlags;

/// Index of the first PML4 entry of the kernel half.
const KERNEL_HALF: usize = 256;

/// PCIDs are 12 bits wide.
const PCID_COUNT: usize = 4096;

/// Handle to the PML4 of an address space.
pub struct PageTable {
    root: FrameNumber,
    user: bool,
}

impl PageTable {
    pub fn root(&self) -> FrameNumber {
        self.root
    }
}

fn frame_address(frame: FrameNumber) -> PhysAddr {
    PhysAddr::new(frame.start().as_usize() as u64)
}

fn frame_containing(addr: PhysAddr) -> FrameNumber {
    PhysicalAddress::new(addr.as_u64() as usize).frame_number()
}

fn frame_number(frame: PhysFrame<Size4KiB>) -> FrameNumber {
    frame_containing(frame.start_address())
}

fn page(addr: VirtualAddress) -> Page<Size4KiB> {
    Page::containing_address(VirtAddr::new(addr.as_usize() as u64))
}

/// Supplies intermediate tables to the `x86_64` crate's mapper.
struct TableFrames<'a>(&'a dyn FrameAllocator);

unsafe impl HardwareFrameAllocator<Size4KiB> for TableFrames<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.0.allocate_frame().ok()?;
        self.0.zero_frame(frame);
        Some(PhysFrame::containing_address(frame_address(frame)))
    }
}

/// The x86_64 MMU, reached through the kernel's direct map of physical memory.
///
/// ASIDs are tracked but not loaded into CR3: without PCIDs every CR3 write flushes the
/// non-global translations anyway.
pub struct X86_64Mmu {
    direct_map_offset: usize,
    frames: Arc<dyn FrameAllocator>,
}

impl X86_64Mmu {
    /// Creates the MMU hooks.
    ///
    /// # Safety
    /// All physical memory must be mapped at `direct_map_offset`, and the kernel half of the
    /// active PML4 must be fully populated so that copying its entries shares every kernel
    /// mapping with new address spaces.
    pub unsafe fn new(direct_map_offset: usize, frames: Arc<dyn FrameAllocator>) -> Self {
        Self {
            direct_map_offset,
            frames,
        }
    }

    fn table_ptr(&self, addr: PhysAddr) -> *mut HardwareTable {
        (self.direct_map_offset + addr.as_u64() as usize) as *mut HardwareTable
    }

    /// # Safety
    /// The caller must have exclusive access to the table, which holds while the owning
    /// address space is locked.
    unsafe fn mapper(&self, table: &PageTable) -> OffsetPageTable<'static> {
        // SAFETY: The root frame is a live PML4 reachable through the direct map.
        unsafe {
            OffsetPageTable::new(
                &mut *self.table_ptr(frame_address(table.root)),
                VirtAddr::new(self.direct_map_offset as u64),
            )
        }
    }

    /// Frees the intermediate tables below `table`, which sits at `level` (4 is the PML4).
    fn free_subtables(&self, table: PhysAddr, level: usize, entries: core::ops::Range<usize>) {
        // SAFETY: Page-table frames are only reachable through the address space being torn
        // down.
        let table = unsafe { &mut *self.table_ptr(table) };
        for index in entries {
            let entry = &mut table[index];
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                continue;
            }
            let child = entry.addr();
            if level > 2 {
                self.free_subtables(child, level - 1, 0..512);
            }
            self.frames.free_frame(frame_containing(child));
            entry.set_unused();
        }
    }
}

impl crate::Arch for X86_64Mmu {
    type PageTable = PageTable;

    fn asid_count(&self) -> usize {
        PCID_COUNT
    }

    fn create_table(&self, flags: AsFlags) -> Result<PageTable> {
        let root = self.frames.allocate_frame()?;
        self.frames.zero_frame(root);

        let (current, _) = Cr3::read();
        // SAFETY: Both tables are mapped through the direct map; the new one is not yet
        // visible to anyone else.
        let (active, fresh) = unsafe {
            (
                &*self.table_ptr(current.start_address()),
                &mut *self.table_ptr(frame_address(root)),
            )
        };
        for index in KERNEL_HALF..512 {
            fresh[index] = active[index].clone();
        }

        Ok(PageTable {
            root,
            user: !flags.contains(AsFlags::KERNEL),
        })
    }

    fn destroy_table(&self, table: PageTable) {
        self.free_subtables(frame_address(table.root), 4, 0..KERNEL_HALF);
        self.frames.free_frame(table.root);
    }

    fn install_mapping(
        &self,
        table: &mut PageTable,
        virt: VirtualAddress,
        frame: FrameNumber,
        flags: AreaFlags,
    ) -> Result<()> {
        // SAFETY: `table` is borrowed mutably, so the address space is locked.
        let mut mapper = unsafe { self.mapper(table) };
        let page = page(virt);
        if let Ok((_, flush)) = mapper.unmap(page) {
            flush.ignore();
        }

        let leaf = PageFlags::for_area(flags, table.user).bits();
        let parent = PageFlags::for_parent(table.user);
        let mut allocator = TableFrames(&*self.frames);
        let frame = PhysFrame::containing_address(frame_address(frame));
        // SAFETY: The frame is owned by the area being mapped.
        let mapped = unsafe {
            mapper.map_to_with_table_flags(page, frame, leaf, parent, &mut allocator)
        };
        match mapped {
            Ok(flush) => {
                flush.ignore();
                Ok(())
            }
            Err(MapToError::FrameAllocationFailed) => Err(Error::OutOfMemory),
            Err(err) => {
                log::warn!("cannot map {virt}: {err:?}");
                Err(Error::Integrity)
            }
        }
    }

    fn remove_mapping(&self, table: &mut PageTable, virt: VirtualAddress) -> Option<FrameNumber> {
        // SAFETY: `table` is borrowed mutably, so the address space is locked.
        let mut mapper = unsafe { self.mapper(table) };
        let (frame, flush) = mapper.unmap(page(virt)).ok()?;
        flush.ignore();
        Some(frame_number(frame))
    }

    fn lookup(&self, table: &PageTable, virt: VirtualAddress) -> Option<(FrameNumber, AreaFlags)> {
        // SAFETY: The address space is locked by the caller; translation only reads.
        let mapper = unsafe { self.mapper(table) };
        match mapper.translate(VirtAddr::new(virt.as_usize() as u64)) {
            TranslateResult::Mapped {
                frame: MappedFrame::Size4KiB(frame),
                flags,
                ..
            } => Some((frame_number(frame), PageFlags::from(flags).to_area_flags())),
            _ => None,
        }
    }

    fn invalidate(&self, _asid: Option<Asid>, virt: VirtualAddress) {
        tlb::flush(VirtAddr::new(virt.as_usize() as u64));
    }

    fn invalidate_asid(&self, _asid: Asid) {}

    fn activate(&self, table: &PageTable, _asid: Asid) {
        let root = PhysFrame::containing_address(frame_address(table.root));
        // SAFETY: Every table shares the kernel half of the boot PML4.
        unsafe { Cr3::write(root, Cr3Flags::empty()) };
    }
}
