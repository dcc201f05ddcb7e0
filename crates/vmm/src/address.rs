//! Address types for physical and virtual memory.
//!
//! Architecture-independent wrappers around raw addresses. Validation is delegated to the
//! active architecture module so that the software-emulated scale model rejects addresses
//! the same way real hardware would.

use core::fmt;
use core::ops::Sub;

use crate::{FrameNumber, arch};

/// Macro to define common address type functionality.
///
/// Generates the structure and the methods shared by physical and virtual addresses.
macro_rules! impl_address_common {
    ($name:ident, $validate:path, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates an address if it is valid for the current architecture.
            #[inline]
            pub const fn try_new(addr: usize) -> Option<Self> {
                if $validate(addr) { Some(Self(addr)) } else { None }
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    arch::validate_physical,
    "A physical memory address.\n\n\
     Newtype wrapper around the architecture-dependent representation of a physical address."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the frame containing this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 / arch::PAGE_SIZE)
    }
}

impl_address_common!(
    VirtualAddress,
    arch::validate_virtual,
    "A virtual memory address.\n\n\
     Newtype wrapper around the architecture-dependent representation of a virtual address.\n\
     Only canonical addresses can be constructed."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Returns true if the address sits on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (arch::PAGE_SIZE - 1) == 0
    }

    /// Returns the start of the page containing this address.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(arch::PAGE_SIZE - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_valid_address() {
            let addr = PhysicalAddress::new(0x0100);
            assert_eq!(addr.as_usize(), 0x0100);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_rejects_wide_address() {
            let _ = PhysicalAddress::new(1 << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn frame_number_rounds_down() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 3 + 1);
            assert_eq!(addr.frame_number(), FrameNumber::new(3));
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn try_new_rejects_non_canonical() {
            // Bit 15 set without sign extension is not canonical in the scale model.
            assert!(VirtualAddress::try_new(0x8000).is_none());
            assert!(VirtualAddress::try_new(0x7ff0).is_some());
        }

        #[test]
        fn page_helpers() {
            let addr = VirtualAddress::new(0x1234);
            assert_eq!(addr.page_base(), VirtualAddress::new(0x1230));
            assert!(!addr.is_page_aligned());
            assert!(addr.page_base().is_page_aligned());
        }

        #[test]
        fn formats_as_hex() {
            let addr = VirtualAddress::new(0x1000);
            assert_eq!(format!("{}", addr), "0x1000");
            assert_eq!(format!("{:?}", addr), "VirtualAddress(0x1000)");
        }
    }
}
