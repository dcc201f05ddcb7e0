//! Bookkeeping for areas that alias the same backing storage.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::{FrameAllocator, FrameNumber, Result};

struct ShareState {
    /// Number of areas aliasing this record.
    refcount: usize,
    /// Page index within the originally shared area to the frame backing it.
    pagemap: BTreeMap<usize, FrameNumber>,
}

/// Reference-counted record shared by every area that aliases the same storage.
///
/// Once an area is shared, the frames backing it belong to the record rather than to any
/// single area. They are returned to the frame allocator when the last sharer lets go.
/// The record's lock is only taken while the lock of a sharing area is held.
pub struct ShareInfo {
    state: spin::Mutex<ShareState>,
}

impl ShareInfo {
    /// Creates a record with a single sharer.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: spin::Mutex::new(ShareState {
                refcount: 1,
                pagemap: BTreeMap::new(),
            }),
        })
    }

    pub fn refcount(&self) -> usize {
        self.state.lock().refcount
    }

    /// Number of pages with a committed frame.
    pub fn pages(&self) -> usize {
        self.state.lock().pagemap.len()
    }

    /// Frame backing `index`, if one has been committed.
    pub fn frame(&self, index: usize) -> Option<FrameNumber> {
        self.state.lock().pagemap.get(&index).copied()
    }

    /// Registers another sharer.
    pub(crate) fn acquire(&self) {
        self.state.lock().refcount += 1;
    }

    /// Drops one sharer, freeing every committed frame when it was the last one.
    ///
    /// Returns true if the record is now dead.
    pub(crate) fn release(&self, frames: &dyn FrameAllocator) -> bool {
        let mut state = self.state.lock();
        state.refcount -= 1;
        if state.refcount > 0 {
            return false;
        }
        let pagemap = core::mem::take(&mut state.pagemap);
        drop(state);

        log::debug!("share info dead, freeing {} frames", pagemap.len());
        for frame in pagemap.into_values() {
            frames.free_frame(frame);
        }
        true
    }

    /// Hands a committed frame over to the record.
    pub(crate) fn adopt(&self, index: usize, frame: FrameNumber) {
        let previous = self.state.lock().pagemap.insert(index, frame);
        debug_assert!(previous.is_none(), "page {index} adopted twice");
    }

    /// Returns the frame backing `index`, committing one with `commit` if there is none.
    ///
    /// `commit` runs under the record's lock, so concurrent sharers converge on one frame.
    pub(crate) fn frame_or_commit(
        &self,
        index: usize,
        commit: impl FnOnce() -> Result<FrameNumber>,
    ) -> Result<FrameNumber> {
        let mut state = self.state.lock();
        if let Some(frame) = state.pagemap.get(&index) {
            return Ok(*frame);
        }
        let frame = commit()?;
        state.pagemap.insert(index, frame);
        Ok(frame)
    }
}

/// An area's reference to a [`ShareInfo`].
#[derive(Clone)]
pub struct ShareLink {
    pub info: Arc<ShareInfo>,
    /// Page index of the area's first page within the shared storage.
    pub offset: usize,
}

impl ShareLink {
    /// Index within the shared storage of the area's page `page_index`.
    pub fn index_of(&self, page_index: usize) -> usize {
        self.offset + page_index
    }
}
