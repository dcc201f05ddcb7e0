//! Flag sets describing address spaces, areas and faulting accesses.

use core::fmt;

bitflags::bitflags! {
    /// Access policy of an area, enforced on every page fault.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct AreaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const CACHEABLE = 1 << 3;
    }
}

impl fmt::Display for AreaFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag: AreaFlags, c: char| if self.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            bit(AreaFlags::READ, 'r'),
            bit(AreaFlags::WRITE, 'w'),
            bit(AreaFlags::EXEC, 'x'),
            bit(AreaFlags::CACHEABLE, 'c'),
        )
    }
}

bitflags::bitflags! {
    /// Attributes of the area itself rather than of the memory it maps.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct AreaAttributes: u32 {
        /// The area is reserved but not fully initialized yet.
        const PARTIAL = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Flags passed to [`crate::VirtualMemoryManager::create`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct AsFlags: u32 {
        /// The distinguished kernel address space.
        const KERNEL = 1 << 0;
    }
}

/// Kind of memory access that raised a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl AreaFlags {
    /// Returns true if an area with these flags permits `access`.
    ///
    /// Reads are always allowed once an area exists.
    pub fn permits(self, access: Access) -> bool {
        match access {
            Access::Read => true,
            Access::Write => self.contains(AreaFlags::WRITE),
            Access::Execute => self.contains(AreaFlags::EXEC),
        }
    }
}
