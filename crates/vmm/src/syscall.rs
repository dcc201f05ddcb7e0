//! System-call entry points for area management.
//!
//! Each call takes raw register values, forwards to the matching [`AddressSpace`]
//! operation and folds the result into a single status word: the area address or zero on
//! success, a negative [`crate::Error::status`] on failure.

use crate::{AddressSpace, AreaAttributes, AreaFlags, Arch, Backend, Error, Result, VirtualAddress};

fn address(raw: usize) -> Result<VirtualAddress> {
    VirtualAddress::try_new(raw).ok_or(Error::InvalidArgument)
}

fn area_flags(raw: u32) -> Result<AreaFlags> {
    AreaFlags::from_bits(raw).ok_or(Error::InvalidArgument)
}

fn status<T>(result: Result<T>, success: impl FnOnce(T) -> isize) -> isize {
    match result {
        Ok(value) => success(value),
        Err(err) => err.status(),
    }
}

/// Creates an anonymous area. Memory handed to user space is always cacheable.
pub fn sys_as_area_create<A: Arch>(space: &AddressSpace<A>, base: usize, size: usize, flags: u32) -> isize {
    let result = address(base).and_then(|base| {
        let flags = area_flags(flags)? | AreaFlags::CACHEABLE;
        space.area_create(flags, size, base, AreaAttributes::empty(), Backend::anonymous())
    });
    status(result, |base| base.as_usize() as isize)
}

/// Resizes the area starting at `base`. `flags` is reserved and must be zero.
pub fn sys_as_area_resize<A: Arch>(space: &AddressSpace<A>, base: usize, size: usize, flags: u32) -> isize {
    let result = address(base).and_then(|base| {
        if flags != 0 {
            return Err(Error::InvalidArgument);
        }
        space.area_resize(base, size)
    });
    status(result, |()| 0)
}

pub fn sys_as_area_change_flags<A: Arch>(space: &AddressSpace<A>, address_raw: usize, flags: u32) -> isize {
    let result = address(address_raw).and_then(|addr| {
        let flags = area_flags(flags)? | AreaFlags::CACHEABLE;
        space.area_change_flags(addr, flags)
    });
    status(result, |()| 0)
}

pub fn sys_as_area_destroy<A: Arch>(space: &AddressSpace<A>, address_raw: usize) -> isize {
    let result = address(address_raw).and_then(|addr| space.area_destroy(addr));
    status(result, |()| 0)
}

/// Shares part of an area of `src` into `dst`, returning the new area's address.
pub fn sys_as_area_share<A: Arch>(
    src: &AddressSpace<A>,
    src_base: usize,
    size: usize,
    dst: &AddressSpace<A>,
    dst_base: usize,
    flags_mask: u32,
) -> isize {
    let result = address(src_base).and_then(|src_base| {
        let dst_base = address(dst_base)?;
        let mask = area_flags(flags_mask)? | AreaFlags::CACHEABLE;
        AddressSpace::area_share(src, src_base, size, dst, dst_base, mask)
    });
    status(result, |base| base.as_usize() as isize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{EmulatedMemory, SoftwareMmu};
    use crate::{Access, AsFlags, PAGE_SIZE, VirtualMemoryManager, VmmConfig};
    use alloc::sync::Arc;

    const RW: u32 = AreaFlags::READ.bits() | AreaFlags::WRITE.bits();

    fn manager() -> VirtualMemoryManager<SoftwareMmu> {
        let memory = Arc::new(EmulatedMemory::new(8));
        VirtualMemoryManager::new(SoftwareMmu::new(4), memory, VmmConfig::default()).unwrap()
    }

    #[test]
    fn create_returns_address() {
        let vmm = manager();
        let space = vmm.create(AsFlags::empty()).unwrap();

        assert_eq!(sys_as_area_create(&space, 0x1000, 2 * PAGE_SIZE, RW), 0x1000);
        let flags = space.area_flags(VirtualAddress::new(0x1000)).unwrap();
        assert!(flags.contains(AreaFlags::CACHEABLE));
        assert_eq!(
            sys_as_area_create(&space, 0x1000, PAGE_SIZE, RW),
            Error::Overlap.status()
        );
    }

    #[test]
    fn rejects_malformed_arguments() {
        let vmm = manager();
        let space = vmm.create(AsFlags::empty()).unwrap();

        assert_eq!(sys_as_area_create(&space, 0x8000, PAGE_SIZE, RW), Error::InvalidArgument.status());
        assert_eq!(sys_as_area_create(&space, 0x1000, PAGE_SIZE, 1 << 7), Error::InvalidArgument.status());
        assert_eq!(sys_as_area_destroy(&space, 0x1000), Error::NotFound.status());
    }

    #[test]
    fn resize_change_flags_and_destroy() {
        let vmm = manager();
        let space = vmm.create(AsFlags::empty()).unwrap();
        sys_as_area_create(&space, 0x1000, PAGE_SIZE, RW);

        assert_eq!(sys_as_area_resize(&space, 0x1000, 3 * PAGE_SIZE, 0), 0);
        assert_eq!(sys_as_area_resize(&space, 0x1000, PAGE_SIZE, 1), Error::InvalidArgument.status());
        assert_eq!(space.area_size(VirtualAddress::new(0x1000)), Ok(3 * PAGE_SIZE));

        assert_eq!(sys_as_area_change_flags(&space, 0x1000, AreaFlags::READ.bits()), 0);
        assert!(!space.check_access(VirtualAddress::new(0x1000), Access::Write));

        assert_eq!(sys_as_area_destroy(&space, 0x1000 + PAGE_SIZE), 0);
        assert!(space.areas().is_empty());
    }

    #[test]
    fn share_between_spaces() {
        let vmm = manager();
        let src = vmm.create(AsFlags::empty()).unwrap();
        let dst = vmm.create(AsFlags::empty()).unwrap();
        sys_as_area_create(&src, 0x1000, PAGE_SIZE, RW);

        assert_eq!(
            sys_as_area_share(&src, 0x1000, PAGE_SIZE, &dst, 0x2000, AreaFlags::READ.bits()),
            0x2000
        );
        assert_eq!(
            sys_as_area_share(&src, 0x1000, PAGE_SIZE, &dst, 0x3000, AreaFlags::EXEC.bits()),
            Error::PermissionDenied.status()
        );
    }
}
