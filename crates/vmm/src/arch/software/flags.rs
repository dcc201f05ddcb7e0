//! Page table entry flags for software emulation.

use crate::AreaFlags;

/// Page table entry flags for software emulation.
///
/// Four bits, mirroring the x86_64 bits that matter to the address-space core. The scale
/// model has no caching control, so [`AreaFlags::CACHEABLE`] is reported for every mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(usize);

impl PageFlags {
    /// Present bit (bit 0).
    const PRESENT: usize = 1 << 0;

    /// Writable bit (bit 1).
    const WRITABLE: usize = 1 << 1;

    /// User-accessible bit (bit 2).
    const USER: usize = 1 << 2;

    /// No-execute bit (bit 3).
    const NO_EXECUTE: usize = 1 << 3;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds present leaf flags for an area mapping.
    pub fn for_area(flags: AreaFlags, user: bool) -> Self {
        let mut raw = Self::PRESENT;
        if flags.contains(AreaFlags::WRITE) {
            raw |= Self::WRITABLE;
        }
        if !flags.contains(AreaFlags::EXEC) {
            raw |= Self::NO_EXECUTE;
        }
        if user {
            raw |= Self::USER;
        }
        Self(raw)
    }

    /// Converts the hardware bits back into the access policy they enforce.
    pub fn to_area_flags(self) -> AreaFlags {
        let mut flags = AreaFlags::READ | AreaFlags::CACHEABLE;
        if self.is_writable() {
            flags |= AreaFlags::WRITE;
        }
        if !self.is_no_execute() {
            flags |= AreaFlags::EXEC;
        }
        flags
    }

    /// Creates page flags from a raw value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw value of these flags.
    pub const fn to_raw(self) -> usize {
        self.0
    }

    pub fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    pub fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    pub fn is_no_execute(self) -> bool {
        (self.0 & Self::NO_EXECUTE) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_flags_survive_encoding() {
        let rw = AreaFlags::READ | AreaFlags::WRITE | AreaFlags::CACHEABLE;
        let encoded = PageFlags::for_area(rw, true);
        assert!(encoded.is_present());
        assert!(encoded.is_user());
        assert!(encoded.is_no_execute());
        assert_eq!(encoded.to_area_flags(), rw);
    }

    #[test]
    fn executable_mapping_clears_no_execute() {
        let encoded = PageFlags::for_area(AreaFlags::READ | AreaFlags::EXEC, false);
        assert!(!encoded.is_no_execute());
        assert!(!encoded.is_user());
        assert!(!encoded.is_writable());
    }
}
