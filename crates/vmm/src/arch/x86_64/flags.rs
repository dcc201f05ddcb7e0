//! Page table entry flags for x86_64 architecture.

use x86_64::structures::paging::PageTableFlags;

use crate::AreaFlags;

/// Leaf entry flags for x86_64.
///
/// Wraps the x86_64 crate's page table entry flags and converts between them and the
/// access policy of an area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    /// Builds present leaf flags for an area mapping.
    pub fn for_area(flags: AreaFlags, user: bool) -> Self {
        let mut bits = PageTableFlags::PRESENT;
        bits.set(PageTableFlags::WRITABLE, flags.contains(AreaFlags::WRITE));
        bits.set(PageTableFlags::NO_EXECUTE, !flags.contains(AreaFlags::EXEC));
        bits.set(PageTableFlags::NO_CACHE, !flags.contains(AreaFlags::CACHEABLE));
        bits.set(PageTableFlags::USER_ACCESSIBLE, user);
        Self(bits)
    }

    /// Flags for intermediate tables. Leaf entries alone restrict access.
    pub fn for_parent(user: bool) -> PageTableFlags {
        let mut bits = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        bits.set(PageTableFlags::USER_ACCESSIBLE, user);
        bits
    }

    /// Converts the hardware bits back into the access policy they enforce.
    pub fn to_area_flags(self) -> AreaFlags {
        let mut flags = AreaFlags::READ;
        flags.set(AreaFlags::WRITE, self.0.contains(PageTableFlags::WRITABLE));
        flags.set(AreaFlags::EXEC, !self.0.contains(PageTableFlags::NO_EXECUTE));
        flags.set(AreaFlags::CACHEABLE, !self.0.contains(PageTableFlags::NO_CACHE));
        flags
    }

    pub const fn bits(self) -> PageTableFlags {
        self.0
    }
}

impl From<PageTableFlags> for PageFlags {
    fn from(value: PageTableFlags) -> Self {
        Self(value)
    }
}
