//! Memory backends.
//!
//! A backend decides where the memory of an area comes from. The address-space core
//! calls into it on every page fault on an unresolved page, when a frame of the area is
//! released and when the area is shared for the first time.

mod anon;
mod image;
mod phys;

use core::fmt;

pub use image::{ImageBackend, ImageSource, SegmentDescriptor};
pub use phys::PhysicalBackend;

use crate::{
    AreaFlags, FrameAllocator, FrameNumber, PAGE_SIZE, Result, ShareInfo, ShareLink,
    VirtualAddress,
};

/// Everything a backend needs to know about the page being faulted in.
pub(crate) struct FaultContext<'a> {
    pub frames: &'a dyn FrameAllocator,
    pub area_base: VirtualAddress,
    pub page: VirtualAddress,
    pub share: Option<&'a ShareLink>,
}

impl FaultContext<'_> {
    /// Index of the faulting page within its area.
    pub fn page_index(&self) -> usize {
        (self.page - self.area_base) / PAGE_SIZE
    }

    /// Produces a frame for the page, going through the share record if the area is shared
    /// so every sharer ends up with the same frame.
    fn commit(&self, populate: impl FnOnce(FrameNumber)) -> Result<FrameNumber> {
        let allocate = || {
            let frame = self.frames.allocate_frame()?;
            populate(frame);
            Ok(frame)
        };
        match self.share {
            Some(link) => link
                .info
                .frame_or_commit(link.index_of(self.page_index()), allocate),
            None => allocate(),
        }
    }
}

/// Outcome of a successful backend fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resolution {
    pub frame: FrameNumber,
    /// Whether the page is recorded in the area's used space.
    pub tracked: bool,
}

/// Source of the memory of an area.
#[derive(Clone)]
pub enum Backend {
    /// Zero-filled memory, allocated on first touch.
    Anonymous,
    /// Memory initialized from a segment of an executable image.
    Image(ImageBackend),
    /// A fixed window of physical frames, such as device memory.
    Physical(PhysicalBackend),
}

impl Backend {
    pub fn anonymous() -> Self {
        Backend::Anonymous
    }

    pub fn image(image: alloc::sync::Arc<dyn ImageSource>, segment: SegmentDescriptor) -> Self {
        Backend::Image(ImageBackend::new(image, segment))
    }

    pub fn physical(base: FrameNumber, frames: usize) -> Self {
        Backend::Physical(PhysicalBackend::new(base, frames))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Anonymous => "anonymous",
            Backend::Image(_) => "image",
            Backend::Physical(_) => "physical",
        }
    }

    /// Flags an area using this backend may carry.
    pub fn supported_flags(&self) -> AreaFlags {
        match self {
            Backend::Anonymous | Backend::Physical(_) => AreaFlags::all(),
            Backend::Image(image) => image.supported_flags(),
        }
    }

    /// Whether areas created with this backend start out partial.
    pub fn requires_staging(&self) -> bool {
        matches!(self, Backend::Image(_))
    }

    /// Whether areas created with this backend may be shared.
    pub fn is_shareable(&self) -> bool {
        !matches!(self, Backend::Physical(_))
    }

    /// Validates an area of `pages` pages with `flags` against the backend.
    pub(crate) fn check_area(&self, flags: AreaFlags, pages: usize) -> Result<()> {
        if !self.supported_flags().contains(flags) {
            return Err(crate::Error::PermissionDenied);
        }
        match self {
            Backend::Physical(phys) => phys.check_pages(pages),
            _ => Ok(()),
        }
    }

    /// Resolves a fault on an unresolved page.
    pub(crate) fn page_fault(&self, ctx: &FaultContext<'_>) -> Result<Resolution> {
        match self {
            Backend::Anonymous => anon::page_fault(ctx),
            Backend::Image(image) => image.page_fault(ctx),
            Backend::Physical(phys) => phys.page_fault(ctx),
        }
    }

    /// Releases a frame that backed a page of the area.
    ///
    /// Frames of shared areas belong to the share record and are left alone.
    pub(crate) fn frame_free(&self, frames: &dyn FrameAllocator, frame: FrameNumber, shared: bool) {
        match self {
            Backend::Anonymous | Backend::Image(_) if !shared => frames.free_frame(frame),
            _ => {}
        }
    }

    /// Hands the area's committed frames over to a fresh share record.
    pub(crate) fn share(
        &self,
        info: &ShareInfo,
        committed: impl IntoIterator<Item = (usize, FrameNumber)>,
    ) -> Result<()> {
        if !self.is_shareable() {
            return Err(crate::Error::PermissionDenied);
        }
        for (index, frame) in committed {
            info.adopt(index, frame);
        }
        Ok(())
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Anonymous => f.write_str("Anonymous"),
            Backend::Image(image) => f.debug_tuple("Image").field(image.segment()).finish(),
            Backend::Physical(phys) => f.debug_tuple("Physical").field(phys).finish(),
        }
    }
}
