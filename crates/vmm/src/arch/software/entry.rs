//! Page table entry for software emulation.

use crate::{FrameNumber, PhysicalAddress};

use super::flags::PageFlags;

/// A single leaf page table entry for software emulation.
///
/// Scale model of an x86_64 entry using 16-bit physical addresses:
/// - Bits 0-3: Flags
/// - Bits 4-15: Frame number (the physical address with the 16-byte page offset dropped)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    /// Physical address mask (bits 4-15, aligned to 16-byte pages).
    const ADDRESS_MASK: usize = 0xFFF0;

    /// Flag bits mask (bits 0-3).
    const FLAGS_MASK: usize = 0xF;

    /// Creates a new page table entry mapping `frame`.
    pub fn new(frame: FrameNumber, flags: PageFlags) -> Self {
        let addr = frame.start().as_usize();
        debug_assert!(
            addr & !Self::ADDRESS_MASK == 0,
            "frame outside the emulated physical address space"
        );
        Self((addr & Self::ADDRESS_MASK) | (flags.to_raw() & Self::FLAGS_MASK))
    }

    /// Returns the frame stored in this entry, or None if the entry is not present.
    pub fn frame(self) -> Option<FrameNumber> {
        if self.is_present() {
            Some(PhysicalAddress::new(self.0 & Self::ADDRESS_MASK).frame_number())
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & Self::FLAGS_MASK)
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Clears this entry (sets it to zero).
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
