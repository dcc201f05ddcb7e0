//! Architecture-specific page-table hooks.
//!
//! The core never touches hardware directly. Everything it needs from the MMU goes through
//! the [`Arch`] trait, with one implementation per target that the kernel injects when it
//! builds the [`crate::VirtualMemoryManager`]. Compile-time constants (page size, address
//! space bounds) are selected here based on the target architecture and features.

use crate::{AreaFlags, AsFlags, Asid, FrameNumber, Result, VirtualAddress};

// Use x86_64 hardware implementation when we're on x86_64 and not testing or emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Page-table operations the address-space core needs from an architecture.
///
/// Page-table locking is expressed through ownership: tables live inside their address
/// space's lock, so holding `&mut Self::PageTable` means the table is locked.
pub trait Arch: Send + Sync {
    /// Architecture-private page-table handle.
    type PageTable: Send;

    /// Number of hardware ASIDs, including the one reserved for the kernel.
    fn asid_count(&self) -> usize;

    /// Builds a fresh page table for a new address space.
    fn create_table(&self, flags: AsFlags) -> Result<Self::PageTable>;

    /// Discards a page table. Leaf frames are owned by areas and must already be unmapped.
    fn destroy_table(&self, table: Self::PageTable);

    /// Maps `page` to `frame`, replacing any previous mapping of `page`.
    fn install_mapping(
        &self,
        table: &mut Self::PageTable,
        page: VirtualAddress,
        frame: FrameNumber,
        flags: AreaFlags,
    ) -> Result<()>;

    /// Unmaps `page`, returning the frame it was mapped to.
    fn remove_mapping(&self, table: &mut Self::PageTable, page: VirtualAddress)
    -> Option<FrameNumber>;

    /// Returns the frame and effective flags of the mapping for `page`.
    fn lookup(&self, table: &Self::PageTable, page: VirtualAddress)
    -> Option<(FrameNumber, AreaFlags)>;

    /// Drops any cached translation of `page`.
    fn invalidate(&self, asid: Option<Asid>, page: VirtualAddress);

    /// Drops every cached translation tagged with `asid`.
    fn invalidate_asid(&self, asid: Asid);

    /// Makes `table` the active translation on the current processor.
    fn activate(&self, table: &Self::PageTable, asid: Asid);

    /// Whether changing an area's flags rewrites its existing mappings immediately.
    ///
    /// When false, stale mappings are upgraded lazily by the fault path.
    fn reprotects_eagerly(&self) -> bool {
        true
    }
}
