//! Interface to the physical frame allocator.

use crate::{FrameNumber, Result};

/// Supplies and reclaims physical frames on behalf of the memory backends.
///
/// Allocation never waits on user-mode progress. An implementation may reclaim memory
/// internally, but it must eventually return a frame or [`crate::Error::OutOfMemory`].
pub trait FrameAllocator: Send + Sync {
    /// Allocates a single frame. Its contents are unspecified.
    fn allocate_frame(&self) -> Result<FrameNumber>;

    /// Returns a frame to the allocator.
    fn free_frame(&self, frame: FrameNumber);

    /// Fills `frame` with zeroes.
    fn zero_frame(&self, frame: FrameNumber);

    /// Copies `data` into `frame` starting at byte `offset`.
    ///
    /// `offset + data.len()` must not exceed the page size.
    fn write_frame(&self, frame: FrameNumber, offset: usize, data: &[u8]);
}
