//! Page table structure for software emulation.

use alloc::boxed::Box;

use crate::VirtualAddress;

use super::entry::PageEntry;
use super::{PAGE_TABLE_LEVELS, page_index};

/// Number of entries in a software-emulated page table.
/// With 4-bit indexes, we have 16 entries per table.
const ENTRY_COUNT: usize = 16;

/// One level of the emulated hierarchy.
///
/// Directory levels only use `children`; the last level only uses `entries`.
struct Table {
    entries: [PageEntry; ENTRY_COUNT],
    children: [Option<Box<Table>>; ENTRY_COUNT],
}

impl Table {
    fn boxed() -> Box<Self> {
        Box::new(Self {
            entries: [PageEntry::default(); ENTRY_COUNT],
            children: [const { None }; ENTRY_COUNT],
        })
    }

    fn mapped_pages(&self, level: usize) -> usize {
        if level == 0 {
            self.entries.iter().filter(|entry| entry.is_present()).count()
        } else {
            self.children
                .iter()
                .flatten()
                .map(|child| child.mapped_pages(level - 1))
                .sum()
        }
    }
}

/// A page table hierarchy for software emulation.
///
/// This is a scale model of x86_64 page tables:
/// - 16-bit virtual addresses (stored as usize with sign-extension)
/// - 3 levels of page tables (level 2, level 1, level 0)
/// - 4-bit index at each level (16 entries per table)
/// - 4-bit page offset (16-byte pages)
///
/// Intermediate tables are heap allocated instead of being carved out of emulated physical
/// memory, so every emulated frame is available to the address spaces under test.
pub struct PageTable {
    id: usize,
    user: bool,
    root: Box<Table>,
}

impl PageTable {
    pub(super) fn new(id: usize, user: bool) -> Self {
        Self {
            id,
            user,
            root: Table::boxed(),
        }
    }

    /// Identifier distinguishing this table from every other table of the same MMU.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether leaf entries are installed user-accessible.
    pub fn is_user(&self) -> bool {
        self.user
    }

    /// Number of present leaf entries.
    pub fn mapped_pages(&self) -> usize {
        self.root.mapped_pages(PAGE_TABLE_LEVELS - 1)
    }

    /// Walks the hierarchy to find the leaf entry for `virt`.
    ///
    /// Returns None if any intermediate table is missing.
    pub(super) fn walk(&self, virt: VirtualAddress) -> Option<&PageEntry> {
        let mut table = &*self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            table = table.children[page_index(virt.as_usize(), level)].as_deref()?;
        }
        Some(&table.entries[page_index(virt.as_usize(), 0)])
    }

    /// Mutable variant of [`PageTable::walk`].
    pub(super) fn walk_mut(&mut self, virt: VirtualAddress) -> Option<&mut PageEntry> {
        let mut table = &mut *self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            table = table.children[page_index(virt.as_usize(), level)].as_deref_mut()?;
        }
        Some(&mut table.entries[page_index(virt.as_usize(), 0)])
    }

    /// Walks the hierarchy, creating intermediate tables as needed.
    pub(super) fn walk_or_create(&mut self, virt: VirtualAddress) -> &mut PageEntry {
        let mut table = &mut *self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            let index = page_index(virt.as_usize(), level);
            table = &mut **table.children[index].get_or_insert_with(Table::boxed);
        }
        &mut table.entries[page_index(virt.as_usize(), 0)]
    }
}
