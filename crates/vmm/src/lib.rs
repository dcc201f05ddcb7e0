#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The address-space subsystem of the Polaris kernel. It provides:
//!
//! - Address spaces made of non-overlapping areas, each with an access policy and a memory
//!   backend (anonymous, executable image or a fixed window of physical frames).
//! - Demand paging: frames are allocated and mapped when a page is first touched.
//! - Sharing of areas between address spaces through reference-counted share records.
//! - Lazy assignment and recycling of hardware ASIDs.
//! - Software emulation of the MMU for testing in non-kernel environments.
//!
//! The physical frame allocator and the page-table format are supplied by the kernel
//! through the [`FrameAllocator`] and [`Arch`] traits.

extern crate alloc;

mod address;
mod address_space;
mod area;
pub mod arch;
mod asid;
mod backend;
mod error;
mod fault;
mod flags;
mod frame_alloc;
mod numbers;
mod share;
pub mod syscall;
mod used_space;
mod virtual_memory_manager;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, AsId};
pub use area::AreaInfo;
pub use arch::Arch;
pub use asid::{ASID_KERNEL, Asid, AsidAllocator};
pub use backend::{Backend, ImageBackend, ImageSource, PhysicalBackend, SegmentDescriptor};
pub use error::{Error, Result};
pub use fault::{FaultOrigin, FaultOutcome, PageFault, resolve};
pub use flags::{Access, AreaAttributes, AreaFlags, AsFlags};
pub use frame_alloc::FrameAllocator;
pub use numbers::{FrameNumber, pages_for};
pub use share::{ShareInfo, ShareLink};
pub use used_space::UsedSpace;
pub use virtual_memory_manager::{VirtualMemoryManager, VmmConfig};

pub use arch::{KERNEL_SPACE_LAST, KERNEL_SPACE_START, PAGE_SIZE, USER_SPACE_END, USER_SPACE_START};
