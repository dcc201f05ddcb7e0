//! Address-space areas.

use core::fmt;

use crate::{
    Access, AreaAttributes, AreaFlags, Arch, AsId, Asid, Backend, FrameAllocator, PAGE_SIZE,
    ShareLink, UsedSpace, VirtualAddress,
};

/// Mutable part of an area, guarded by the area lock.
pub(crate) struct AreaState {
    pub pages: usize,
    pub flags: AreaFlags,
    pub attributes: AreaAttributes,
    pub used_space: UsedSpace,
    pub backend: Backend,
    pub share: Option<ShareLink>,
}

/// A contiguous, page-aligned region of an address space with a uniform access policy and
/// a single backend.
pub(crate) struct Area {
    owner: AsId,
    base: VirtualAddress,
    state: spin::Mutex<AreaState>,
}

impl Area {
    pub fn new(
        owner: AsId,
        base: VirtualAddress,
        pages: usize,
        flags: AreaFlags,
        attributes: AreaAttributes,
        backend: Backend,
        share: Option<ShareLink>,
    ) -> Self {
        debug_assert!(pages > 0, "areas span at least one page");
        Self {
            owner,
            base,
            state: spin::Mutex::new(AreaState {
                pages,
                flags,
                attributes,
                used_space: UsedSpace::new(),
                backend,
                share,
            }),
        }
    }

    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, AreaState> {
        self.state.lock()
    }

    /// First address past the end of the area.
    pub fn end(&self) -> usize {
        self.base.as_usize() + self.state.lock().pages * PAGE_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.base.as_usize() <= addr && addr < self.end()
    }

    pub fn info(&self) -> AreaInfo {
        let state = self.state.lock();
        AreaInfo {
            owner: self.owner,
            base: self.base,
            pages: state.pages,
            flags: state.flags,
            attributes: state.attributes,
            backend: state.backend.name(),
            resident_pages: state.used_space.pages(),
            shared: state.share.is_some(),
        }
    }
}

impl AreaState {
    pub fn is_partial(&self) -> bool {
        self.attributes.contains(AreaAttributes::PARTIAL)
    }

    /// Unmaps the pages of the area from `first_page` on, releasing their frames through the
    /// backend and forgetting them in the used space.
    pub fn release_from<A: Arch>(
        &mut self,
        base: VirtualAddress,
        first_page: usize,
        arch: &A,
        table: &mut A::PageTable,
        frames: &dyn FrameAllocator,
        asid: Option<Asid>,
    ) {
        let start = base.as_usize() + first_page * PAGE_SIZE;
        let shared = self.share.is_some();

        if let Backend::Physical(_) = self.backend {
            for index in first_page..self.pages {
                let page = VirtualAddress::new(base.as_usize() + index * PAGE_SIZE);
                if arch.remove_mapping(table, page).is_some() {
                    arch.invalidate(asid, page);
                }
            }
            return;
        }

        let dropped: alloc::vec::Vec<VirtualAddress> = self
            .used_space
            .iter_pages()
            .filter(|page| page.as_usize() >= start)
            .collect();
        for page in dropped {
            match arch.remove_mapping(table, page) {
                Some(frame) => {
                    self.backend.frame_free(frames, frame, shared);
                    arch.invalidate(asid, page);
                }
                None => log::warn!("used page {page} has no mapping"),
            }
        }

        if first_page < self.pages {
            self.used_space
                .remove(VirtualAddress::new(start), self.pages - first_page);
        }
    }
}

/// Snapshot of an area, as reported by [`crate::AddressSpace::areas`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaInfo {
    pub owner: AsId,
    pub base: VirtualAddress,
    pub pages: usize,
    pub flags: AreaFlags,
    pub attributes: AreaAttributes,
    pub backend: &'static str,
    /// Pages currently backed by a frame the area tracks.
    pub resident_pages: usize,
    pub shared: bool,
}

impl AreaInfo {
    /// Size of the area in bytes.
    pub fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// First address past the end of the area.
    pub fn end(&self) -> usize {
        self.base.as_usize() + self.size()
    }

    pub fn check_access(&self, access: Access) -> bool {
        self.flags.permits(access)
    }
}

impl fmt::Display for AreaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:#x} {} {:>9} {} pages ({} resident)",
            self.base,
            self.end(),
            self.flags,
            self.backend,
            self.pages,
            self.resident_pages,
        )?;
        if self.attributes.contains(AreaAttributes::PARTIAL) {
            f.write_str(" partial")?;
        }
        if self.shared {
            f.write_str(" shared")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(pages: usize) -> Area {
        Area::new(
            AsId::new(1),
            VirtualAddress::new(0x1000),
            pages,
            AreaFlags::READ | AreaFlags::WRITE,
            AreaAttributes::empty(),
            Backend::anonymous(),
            None,
        )
    }

    #[test]
    fn bounds_follow_page_count() {
        let area = area(4);
        assert_eq!(area.end(), 0x1000 + 4 * PAGE_SIZE);
        assert!(area.contains(0x1000));
        assert!(area.contains(0x1000 + 4 * PAGE_SIZE - 1));
        assert!(!area.contains(0x1000 + 4 * PAGE_SIZE));
        assert!(!area.contains(0x0fff));
    }

    #[test]
    fn info_reports_access_policy() {
        let info = area(2).info();
        assert_eq!(info.size(), 2 * PAGE_SIZE);
        assert!(info.check_access(Access::Write));
        assert!(!info.check_access(Access::Execute));
        assert_eq!(info.backend, "anonymous");
        assert!(!info.shared);
    }

    #[test]
    fn display_marks_partial_areas() {
        let area = area(1);
        area.lock().attributes = AreaAttributes::PARTIAL;
        let line = format!("{}", area.info());
        assert!(line.starts_with("0x1000-"));
        assert!(line.ends_with("partial"));
    }
}
