//! Direct-physical memory: a fixed window of frames mapped one to one.

use crate::{Error, FrameNumber, Result};

use super::{FaultContext, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalBackend {
    base: FrameNumber,
    frames: usize,
}

impl PhysicalBackend {
    pub fn new(base: FrameNumber, frames: usize) -> Self {
        Self { base, frames }
    }

    pub fn base(&self) -> FrameNumber {
        self.base
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub(super) fn check_pages(&self, pages: usize) -> Result<()> {
        if pages > self.frames {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// The frames are never allocated nor tracked, they are owned by whoever handed out the
    /// window.
    pub(super) fn page_fault(&self, ctx: &FaultContext<'_>) -> Result<Resolution> {
        let index = ctx.page_index();
        if index >= self.frames {
            return Err(Error::NotFound);
        }
        Ok(Resolution {
            frame: self.base + index,
            tracked: false,
        })
    }
}
