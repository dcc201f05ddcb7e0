//! Address spaces.
//!
//! An address space owns an ordered index of non-overlapping areas and the architecture
//! page table that realizes them. Every structural change happens under the address-space
//! lock, and per-area work additionally under the area lock, always in that order.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Bound;

use crate::area::{Area, AreaInfo, AreaState};
use crate::asid::{AsidBinding, SharedBinding};
use crate::backend::FaultContext;
use crate::{
    Access, AreaAttributes, AreaFlags, Arch, AsFlags, Asid, Backend, Error, FrameAllocator,
    FrameNumber, PAGE_SIZE, Result, ShareInfo, ShareLink, VirtualAddress, arch, pages_for,
};

/// Stable identity of an address space.
///
/// Used to order locks when two address spaces are involved in one operation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AsId(usize);

impl AsId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsId({})", self.0)
    }
}

impl fmt::Display for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Collaborators shared by every address space of one manager.
pub(crate) struct Platform<A: Arch> {
    pub arch: A,
    pub frames: Arc<dyn FrameAllocator>,
}

struct AsInner<A: Arch> {
    areas: BTreeMap<VirtualAddress, Area>,
    /// Number of tasks using this address space.
    refcount: usize,
    /// None once the address space has been destroyed.
    table: Option<A::PageTable>,
}

impl<A: Arch> AsInner<A> {
    fn table(&mut self) -> Result<&mut A::PageTable> {
        self.table.as_mut().ok_or(Error::NotFound)
    }

    /// Base of the area containing `addr`.
    fn find(&self, addr: VirtualAddress) -> Option<VirtualAddress> {
        let (base, area) = self.areas.range(..=addr).next_back()?;
        area.contains(addr.as_usize()).then_some(*base)
    }

    /// Returns true if `[start, end)` intersects an area.
    ///
    /// Only the areas on either side of `start` can intersect the range.
    fn collides(&self, start: VirtualAddress, end: usize) -> bool {
        let below = self
            .areas
            .range(..=start)
            .next_back()
            .is_some_and(|(_, area)| area.end() > start.as_usize());
        let above = self
            .areas
            .range((Bound::Excluded(start), Bound::Unbounded))
            .next()
            .is_some_and(|(base, _)| base.as_usize() < end);
        below || above
    }
}

/// A virtual address space: areas plus the page table that realizes them.
pub struct AddressSpace<A: Arch> {
    id: AsId,
    flags: AsFlags,
    platform: Arc<Platform<A>>,
    inner: spin::Mutex<AsInner<A>>,
    pub(crate) binding: SharedBinding,
}

impl<A: Arch> AddressSpace<A> {
    pub(crate) fn new(
        id: AsId,
        flags: AsFlags,
        platform: Arc<Platform<A>>,
        asid: Option<Asid>,
    ) -> Result<Self> {
        let table = platform.arch.create_table(flags)?;
        Ok(Self {
            id,
            flags,
            platform,
            inner: spin::Mutex::new(AsInner {
                areas: BTreeMap::new(),
                refcount: 0,
                table: Some(table),
            }),
            binding: AsidBinding::shared(asid),
        })
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn flags(&self) -> AsFlags {
        self.flags
    }

    pub fn is_kernel(&self) -> bool {
        self.flags.contains(AsFlags::KERNEL)
    }

    /// The hardware ASID currently assigned, if any.
    pub fn asid(&self) -> Option<Asid> {
        self.binding.lock().asid
    }

    /// Number of processors this address space is active on.
    pub fn cpu_refcount(&self) -> usize {
        self.binding.lock().cpu_refcount
    }

    /// Number of tasks using this address space.
    pub fn refcount(&self) -> usize {
        self.inner.lock().refcount
    }

    /// Registers a task using this address space.
    pub fn attach(&self) {
        self.inner.lock().refcount += 1;
    }

    /// Unregisters a task. Returns true when no task is left.
    pub fn detach(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.refcount == 0 {
            return Err(Error::Integrity);
        }
        inner.refcount -= 1;
        Ok(inner.refcount == 0)
    }

    /// Inclusive address range areas of this space may occupy.
    fn bounds(&self) -> (usize, usize) {
        if self.is_kernel() {
            (arch::KERNEL_SPACE_START, arch::KERNEL_SPACE_LAST)
        } else {
            (arch::USER_SPACE_START, arch::USER_SPACE_END - 1)
        }
    }

    /// Validates `[base, base + pages)` against the bounds and returns its end.
    fn check_range(&self, base: VirtualAddress, pages: usize) -> Result<usize> {
        let (first, last) = self.bounds();
        let size = pages.checked_mul(PAGE_SIZE).ok_or(Error::InvalidArgument)?;
        let end_inclusive = base
            .as_usize()
            .checked_add(size - 1)
            .ok_or(Error::InvalidArgument)?;
        if base.as_usize() < first || end_inclusive > last {
            return Err(Error::InvalidArgument);
        }
        Ok(base.as_usize() + size)
    }

    fn asid_for_flush(&self) -> Option<Asid> {
        self.binding.lock().asid
    }

    /// Creates an area of `size` bytes, rounded up to whole pages, at `base`.
    ///
    /// Areas whose backend needs staged set-up start out partial.
    pub fn area_create(
        &self,
        flags: AreaFlags,
        size: usize,
        base: VirtualAddress,
        attributes: AreaAttributes,
        backend: Backend,
    ) -> Result<VirtualAddress> {
        if size == 0 || !base.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }
        let pages = pages_for(size);
        let end = self.check_range(base, pages)?;
        backend.check_area(flags, pages)?;

        let mut inner = self.inner.lock();
        inner.table()?;
        if inner.collides(base, end) {
            log::warn!("AS {}: area at {base} ({pages} pages) overlaps", self.id);
            return Err(Error::Overlap);
        }

        let attributes = if backend.requires_staging() {
            attributes | AreaAttributes::PARTIAL
        } else {
            attributes
        };
        log::debug!(
            "AS {}: created {} area {base} ({pages} pages, {flags})",
            self.id,
            backend.name()
        );
        inner.areas.insert(
            base,
            Area::new(self.id, base, pages, flags, attributes, backend, None),
        );
        Ok(base)
    }

    /// Changes the size of the area starting at `address`.
    ///
    /// Shrinking releases the frames of the dropped pages.
    pub fn area_resize(&self, address: VirtualAddress, size: usize) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let table = inner.table.as_mut().ok_or(Error::NotFound)?;
        let area = inner.areas.get(&address).ok_or(Error::NotFound)?;

        let mut state = area.lock();
        if state.is_partial() {
            return Err(Error::NotFound);
        }
        if state.share.is_some() || matches!(state.backend, Backend::Physical(_)) {
            return Err(Error::PermissionDenied);
        }
        if size == 0 {
            return Err(Error::InvalidArgument);
        }

        let pages = pages_for(size);
        if pages > state.pages {
            let end = self.check_range(address, pages)?;
            let old_end = address.as_usize() + state.pages * PAGE_SIZE;
            let next = inner
                .areas
                .range(address..)
                .nth(1)
                .map(|(base, _)| base.as_usize());
            if next.is_some_and(|next| next < end) {
                debug_assert!(next.is_some_and(|next| next >= old_end));
                return Err(Error::Overlap);
            }
        } else if pages < state.pages {
            let asid = self.asid_for_flush();
            state.release_from(
                address,
                pages,
                &self.platform.arch,
                table,
                &*self.platform.frames,
                asid,
            );
        }

        log::debug!(
            "AS {}: resized area {address} from {} to {pages} pages",
            self.id,
            state.pages
        );
        state.pages = pages;
        Ok(())
    }

    /// Destroys the area containing `address`, releasing every frame it holds.
    pub fn area_destroy(&self, address: VirtualAddress) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let base = inner.find(address).ok_or(Error::NotFound)?;
        let area = inner.areas.remove(&base).ok_or(Error::NotFound)?;
        let table = inner.table.as_mut().ok_or(Error::Integrity)?;
        let asid = self.asid_for_flush();
        self.release_area(area, table, asid);
        Ok(())
    }

    fn release_area(&self, area: Area, table: &mut A::PageTable, asid: Option<Asid>) {
        let base = area.base();
        let mut state = area.lock();
        state.release_from(
            base,
            0,
            &self.platform.arch,
            table,
            &*self.platform.frames,
            asid,
        );
        if let Some(link) = state.share.take() {
            link.info.release(&*self.platform.frames);
        }
        log::debug!("AS {}: destroyed area {base}", self.id);
    }

    /// Replaces the flags of the area containing `address`.
    pub fn area_change_flags(&self, address: VirtualAddress, flags: AreaFlags) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let base = inner.find(address).ok_or(Error::NotFound)?;
        let table = inner.table.as_mut().ok_or(Error::NotFound)?;
        let area = &inner.areas[&base];

        let mut state = area.lock();
        if state.is_partial() {
            return Err(Error::NotFound);
        }
        if state.share.is_some() || !state.backend.supported_flags().contains(flags) {
            return Err(Error::PermissionDenied);
        }

        let old = state.flags;
        state.flags = flags;
        // Removed permissions always take effect immediately.
        if self.platform.arch.reprotects_eagerly() || !flags.contains(old) {
            let asid = self.asid_for_flush();
            self.reprotect(&state, base, table, asid)?;
        }
        log::debug!("AS {}: area {base} flags {old} -> {flags}", self.id);
        Ok(())
    }

    fn reprotect(
        &self,
        state: &AreaState,
        base: VirtualAddress,
        table: &mut A::PageTable,
        asid: Option<Asid>,
    ) -> Result<()> {
        let arch = &self.platform.arch;
        for index in 0..state.pages {
            let page = VirtualAddress::new(base.as_usize() + index * PAGE_SIZE);
            if let Some((frame, _)) = arch.lookup(table, page) {
                arch.install_mapping(table, page, frame, state.flags)?;
                arch.invalidate(asid, page);
            }
        }
        Ok(())
    }

    /// Replaces the attributes of the area containing `address`.
    ///
    /// Clearing [`AreaAttributes::PARTIAL`] completes the staged set-up of an area.
    pub fn area_change_attributes(
        &self,
        address: VirtualAddress,
        attributes: AreaAttributes,
    ) -> Result<()> {
        let inner = self.inner.lock();
        let base = inner.find(address).ok_or(Error::NotFound)?;
        inner.areas[&base].lock().attributes = attributes;
        Ok(())
    }

    /// Flags of the area containing `address`.
    pub fn area_flags(&self, address: VirtualAddress) -> Result<AreaFlags> {
        let inner = self.inner.lock();
        let base = inner.find(address).ok_or(Error::NotFound)?;
        Ok(inner.areas[&base].lock().flags)
    }

    /// Returns true if an area contains `address` and permits `access`.
    pub fn check_access(&self, address: VirtualAddress, access: Access) -> bool {
        self.area_flags(address)
            .is_ok_and(|flags| flags.permits(access))
    }

    /// Size in bytes of the area containing `address`.
    pub fn area_size(&self, address: VirtualAddress) -> Result<usize> {
        let inner = self.inner.lock();
        let base = inner.find(address).ok_or(Error::NotFound)?;
        Ok(inner.areas[&base].lock().pages * PAGE_SIZE)
    }

    /// Snapshot of every area, ordered by base address.
    pub fn areas(&self) -> Vec<AreaInfo> {
        self.inner.lock().areas.values().map(Area::info).collect()
    }

    /// Logs every area of the address space.
    pub fn log_areas(&self) {
        let areas = self.areas();
        log::info!("AS {} ({} areas, asid {:?}):", self.id, areas.len(), self.asid());
        for area in areas {
            log::info!("  {area}");
        }
    }

    /// Frame and effective flags currently mapped at `addr`.
    pub fn translate(&self, addr: VirtualAddress) -> Option<(FrameNumber, AreaFlags)> {
        let inner = self.inner.lock();
        let table = inner.table.as_ref()?;
        self.platform.arch.lookup(table, addr.page_base())
    }

    /// Shares `size` bytes at `src_base` of `src` into a new area of `dst` at `dst_base`.
    ///
    /// Both areas afterwards alias the same frames. The new area gets `flags_mask` as its
    /// flags, which must be a subset of the source area's.
    pub fn area_share(
        src: &Self,
        src_base: VirtualAddress,
        size: usize,
        dst: &Self,
        dst_base: VirtualAddress,
        flags_mask: AreaFlags,
    ) -> Result<VirtualAddress> {
        if size == 0 || !src_base.is_page_aligned() || !dst_base.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }
        let pages = pages_for(size);
        let end = dst.check_range(dst_base, pages)?;

        if src.id == dst.id {
            let mut inner = src.inner.lock();
            let (backend, link) = src.share_source(&mut inner, src_base, pages, flags_mask)?;
            dst.share_destination(&mut inner, dst_base, end, pages, flags_mask, backend, link)
        } else if src.id < dst.id {
            let mut src_inner = src.inner.lock();
            let mut dst_inner = dst.inner.lock();
            let (backend, link) = src.share_source(&mut src_inner, src_base, pages, flags_mask)?;
            dst.share_destination(&mut dst_inner, dst_base, end, pages, flags_mask, backend, link)
        } else {
            let mut dst_inner = dst.inner.lock();
            let mut src_inner = src.inner.lock();
            let (backend, link) = src.share_source(&mut src_inner, src_base, pages, flags_mask)?;
            dst.share_destination(&mut dst_inner, dst_base, end, pages, flags_mask, backend, link)
        }
    }

    /// Makes the source area shared (if needed) and returns what the destination area needs,
    /// with a reference already taken on its behalf.
    fn share_source(
        &self,
        inner: &mut AsInner<A>,
        src_base: VirtualAddress,
        pages: usize,
        flags_mask: AreaFlags,
    ) -> Result<(Backend, ShareLink)> {
        let table = inner.table.as_ref().ok_or(Error::NotFound)?;
        let (base, area) = inner
            .areas
            .range(..=src_base)
            .next_back()
            .filter(|(_, area)| area.contains(src_base.as_usize()))
            .ok_or(Error::NotFound)?;
        if src_base.as_usize() + pages * PAGE_SIZE > area.end() {
            return Err(Error::NotFound);
        }

        let mut state = area.lock();
        if state.is_partial() {
            return Err(Error::NotFound);
        }
        if !state.flags.contains(flags_mask) || !state.backend.is_shareable() {
            return Err(Error::PermissionDenied);
        }

        if state.share.is_none() {
            let info = ShareInfo::new();
            let arch = &self.platform.arch;
            let committed: Vec<(usize, FrameNumber)> = state
                .used_space
                .iter_pages()
                .filter_map(|page| {
                    let (frame, _) = arch.lookup(table, page)?;
                    Some(((page - *base) / PAGE_SIZE, frame))
                })
                .collect();
            state.backend.share(&info, committed)?;
            log::debug!("AS {}: area {base} is now shared", self.id);
            state.share = Some(ShareLink { info, offset: 0 });
        }

        let source = state.share.as_ref().ok_or(Error::Integrity)?;
        source.info.acquire();
        let link = ShareLink {
            info: source.info.clone(),
            offset: source.index_of((src_base - *base) / PAGE_SIZE),
        };
        Ok((state.backend.clone(), link))
    }

    #[allow(clippy::too_many_arguments)]
    fn share_destination(
        &self,
        inner: &mut AsInner<A>,
        dst_base: VirtualAddress,
        end: usize,
        pages: usize,
        flags: AreaFlags,
        backend: Backend,
        link: ShareLink,
    ) -> Result<VirtualAddress> {
        let refused = if inner.table.is_none() {
            Some(Error::NotFound)
        } else if inner.collides(dst_base, end) {
            Some(Error::Overlap)
        } else {
            None
        };
        if let Some(err) = refused {
            link.info.release(&*self.platform.frames);
            return Err(err);
        }

        log::debug!(
            "AS {}: shared area {dst_base} ({pages} pages, {flags}), {} sharers",
            self.id,
            link.info.refcount()
        );
        inner.areas.insert(
            dst_base,
            Area::new(
                self.id,
                dst_base,
                pages,
                flags,
                AreaAttributes::empty(),
                backend,
                Some(link),
            ),
        );
        Ok(dst_base)
    }

    /// Resolves a page fault at `addr`.
    ///
    /// A fault on a page that already has a mapping is only legitimate when the mapping is
    /// weaker than the area's current flags, in which case it is upgraded.
    pub fn page_fault(&self, addr: VirtualAddress, access: Access) -> Result<()> {
        let page = addr.page_base();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let base = inner.find(page).ok_or(Error::NotFound)?;
        let table = inner.table.as_mut().ok_or(Error::NotFound)?;
        let area = &inner.areas[&base];

        let mut state = area.lock();
        if state.is_partial() {
            return Err(Error::NotFound);
        }
        if !state.flags.permits(access) {
            return Err(Error::PermissionDenied);
        }

        let arch = &self.platform.arch;
        let asid = self.asid_for_flush();
        if let Some((frame, current)) = arch.lookup(table, page) {
            if current.permits(access) {
                return Err(Error::Integrity);
            }
            log::trace!("AS {}: upgrading {page} to {}", self.id, state.flags);
            arch.install_mapping(table, page, frame, state.flags)?;
            arch.invalidate(asid, page);
            return Ok(());
        }
        if state.used_space.contains(page) {
            return Err(Error::Integrity);
        }

        let frames = &*self.platform.frames;
        let resolution = {
            let ctx = FaultContext {
                frames,
                area_base: base,
                page,
                share: state.share.as_ref(),
            };
            state.backend.page_fault(&ctx)?
        };
        if let Err(err) = arch.install_mapping(table, page, resolution.frame, state.flags) {
            if resolution.tracked {
                state
                    .backend
                    .frame_free(frames, resolution.frame, state.share.is_some());
            }
            return Err(err);
        }
        if resolution.tracked {
            state.used_space.insert(page, 1);
        }
        log::trace!(
            "AS {}: {page} -> {:?} ({:?})",
            self.id,
            resolution.frame,
            access
        );
        Ok(())
    }

    /// Makes this address space's table current with `asid`.
    pub(crate) fn install(&self, asid: Asid) -> Result<()> {
        let inner = self.inner.lock();
        let table = inner.table.as_ref().ok_or(Error::NotFound)?;
        self.platform.arch.activate(table, asid);
        Ok(())
    }

    /// Destroys every area and discards the page table.
    ///
    /// Fails with [`Error::Integrity`] while tasks still use the address space or it is active
    /// on some processor.
    pub(crate) fn teardown(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.refcount > 0 || self.cpu_refcount() > 0 {
            return Err(Error::Integrity);
        }
        let mut table = inner.table.take().ok_or(Error::NotFound)?;
        let asid = self.asid_for_flush();
        for (_, area) in core::mem::take(&mut inner.areas) {
            self.release_area(area, &mut table, asid);
        }
        self.platform.arch.destroy_table(table);
        log::debug!("AS {}: destroyed", self.id);
        Ok(())
    }
}

impl<A: Arch> fmt::Debug for AddressSpace<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("asid", &self.asid())
            .finish_non_exhaustive()
    }
}
