//! Frame numbers and page-count helpers.

use core::fmt;
use core::ops::Add;

use crate::{address::PhysicalAddress, arch};

/// A physical memory frame number.
///
/// Frame numbers are zero-indexed and correspond to PAGE_SIZE-aligned physical addresses.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    /// Creates a new frame number.
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<usize> for FrameNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// Number of pages needed to hold `bytes`, rounded up.
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(arch::PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_start_address() {
        let frame = FrameNumber::new(3);
        assert_eq!(frame.start().as_usize(), 3 * arch::PAGE_SIZE);
        assert_eq!(frame.start().frame_number(), frame);
    }

    #[test]
    fn frame_offset() {
        assert_eq!(FrameNumber::new(10) + 5, FrameNumber::new(15));
    }

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(arch::PAGE_SIZE), 1);
        assert_eq!(pages_for(arch::PAGE_SIZE + 1), 2);
    }

    #[test]
    fn debug_names_the_type() {
        assert_eq!(format!("{:?}", FrameNumber::new(7)), "FrameNumber(7)");
    }
}
