//! Emulated physical memory.

use alloc::vec;
use alloc::vec::Vec;

use crate::{Error, FrameAllocator, FrameNumber, Result};

use super::{MAX_PHYSICAL_BITS, PAGE_SIZE};

struct MemoryState {
    memory: Vec<u8>,
    /// Free frames, popped from the back so the lowest frame is handed out first.
    free: Vec<FrameNumber>,
    allocated: Vec<bool>,
}

/// Emulated memory for software simulation.
///
/// A byte buffer standing in for physical memory plus a trivial frame pool over it. It is
/// the frame allocator used when the address-space core runs on a development host.
pub struct EmulatedMemory {
    state: spin::Mutex<MemoryState>,
}

impl EmulatedMemory {
    /// Creates an emulated physical memory of `frames` frames.
    ///
    /// # Panics
    /// Panics if the memory would not fit into the emulated physical address width.
    pub fn new(frames: usize) -> Self {
        assert!(
            frames * PAGE_SIZE <= 1 << MAX_PHYSICAL_BITS,
            "emulated memory exceeds the physical address width"
        );
        Self {
            state: spin::Mutex::new(MemoryState {
                memory: vec![0u8; frames * PAGE_SIZE],
                free: (0..frames).rev().map(FrameNumber::new).collect(),
                allocated: vec![false; frames],
            }),
        }
    }

    /// Number of frames currently handed out.
    pub fn allocated_frames(&self) -> usize {
        let state = self.state.lock();
        state.allocated.iter().filter(|allocated| **allocated).count()
    }

    /// Returns true if `frame` is currently handed out.
    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.state
            .lock()
            .allocated
            .get(frame.as_usize())
            .copied()
            .unwrap_or(false)
    }

    /// Copies the contents of `frame` out of emulated memory.
    pub fn read_frame(&self, frame: FrameNumber) -> Vec<u8> {
        let state = self.state.lock();
        let start = frame.start().as_usize();
        state.memory[start..start + PAGE_SIZE].to_vec()
    }
}

impl FrameAllocator for EmulatedMemory {
    fn allocate_frame(&self) -> Result<FrameNumber> {
        let mut state = self.state.lock();
        let frame = state.free.pop().ok_or(Error::OutOfMemory)?;
        state.allocated[frame.as_usize()] = true;
        Ok(frame)
    }

    fn free_frame(&self, frame: FrameNumber) {
        let mut state = self.state.lock();
        assert!(
            state.allocated[frame.as_usize()],
            "double free of emulated {frame:?}"
        );
        state.allocated[frame.as_usize()] = false;
        state.free.push(frame);
    }

    fn zero_frame(&self, frame: FrameNumber) {
        let mut state = self.state.lock();
        let start = frame.start().as_usize();
        state.memory[start..start + PAGE_SIZE].fill(0);
    }

    fn write_frame(&self, frame: FrameNumber, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= PAGE_SIZE, "write crosses the frame boundary");
        let mut state = self.state.lock();
        let start = frame.start().as_usize() + offset;
        state.memory[start..start + data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_lowest_frame_first() {
        let memory = EmulatedMemory::new(4);
        assert_eq!(memory.allocate_frame(), Ok(FrameNumber::new(0)));
        assert_eq!(memory.allocate_frame(), Ok(FrameNumber::new(1)));
        assert_eq!(memory.allocated_frames(), 2);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let memory = EmulatedMemory::new(1);
        let frame = memory.allocate_frame().unwrap();
        assert_eq!(memory.allocate_frame(), Err(Error::OutOfMemory));
        memory.free_frame(frame);
        assert_eq!(memory.allocate_frame(), Ok(frame));
    }

    #[test]
    fn writes_land_in_the_frame() {
        let memory = EmulatedMemory::new(2);
        let frame = memory.allocate_frame().unwrap();
        memory.write_frame(frame, 4, &[1, 2, 3]);
        let contents = memory.read_frame(frame);
        assert_eq!(&contents[4..7], &[1, 2, 3]);
        memory.zero_frame(frame);
        assert!(memory.read_frame(frame).iter().all(|byte| *byte == 0));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let memory = EmulatedMemory::new(1);
        let frame = memory.allocate_frame().unwrap();
        memory.free_frame(frame);
        memory.free_frame(frame);
    }
}
