//! x86_64 architecture-specific implementation.
//!
//! This module provides the hardware implementation for x86_64 architecture:
//! address validation, address-space layout and the [`X86_64Mmu`] page-table hooks built
//! on the `x86_64` crate.

mod flags;
mod mmu;

pub use flags::PageFlags;
pub use mmu::{PageTable, X86_64Mmu};

/// Maximum number of bits in a physical address on x86_64.
/// This is typically 52 bits on modern CPUs, but we use 48 as a conservative default.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address on x86_64 with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Default page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of page table levels in x86_64 (4-level paging).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// First usable user address. Page zero stays unmapped to catch null dereferences.
pub const USER_SPACE_START: usize = PAGE_SIZE;

/// End (exclusive) of the lower canonical half.
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

/// First address of the higher canonical half.
pub const KERNEL_SPACE_START: usize = 0xFFFF_8000_0000_0000;

/// Last address (inclusive) kernel areas may cover.
///
/// The topmost page is never handed out so that the end of every area is representable.
pub const KERNEL_SPACE_LAST: usize = usize::MAX - PAGE_SIZE;

/// Validates a physical address for x86_64.
///
/// Physical addresses must not exceed the maximum physical address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    let max_addr = (1usize << MAX_PHYSICAL_BITS) - 1;
    addr <= max_addr
}

/// Validates a virtual address for x86_64.
///
/// Virtual addresses must be canonical (bits 47-63 must be sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let canonical = if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    };
    canonical == addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_are_canonical() {
        assert!(validate_virtual(USER_SPACE_END - 1));
        assert!(!validate_virtual(USER_SPACE_END));
        assert!(validate_virtual(KERNEL_SPACE_START));
        assert!(validate_virtual(KERNEL_SPACE_LAST));
    }

    #[test]
    fn physical_width() {
        assert!(validate_physical((1 << MAX_PHYSICAL_BITS) - 1));
        assert!(!validate_physical(1 << MAX_PHYSICAL_BITS));
    }
}
