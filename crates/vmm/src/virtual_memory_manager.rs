//! The virtual memory manager.
//!
//! Owns everything that is shared between address spaces: the architecture hooks, the
//! frame allocator, the ASID pool and the distinguished kernel address space. The kernel
//! creates exactly one manager during boot and hands it to the scheduler, which calls
//! [`VirtualMemoryManager::switch`] on every context switch.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::address_space::Platform;
use crate::fault::{self, FaultOrigin, FaultOutcome, PageFault};
use crate::{
    ASID_KERNEL, AddressSpace, Arch, AsFlags, AsId, AsidAllocator, Error, FrameAllocator, Result,
    arch,
};

/// Runtime configuration of the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmmConfig {
    /// Use at most this many hardware ASIDs (including the kernel's) instead of all the
    /// architecture provides.
    pub asid_count: Option<usize>,
}

impl VmmConfig {
    fn effective_asid_count(&self, available: usize) -> usize {
        self.asid_count.map_or(available, |count| count.min(available))
    }
}

/// Owner of all address spaces.
pub struct VirtualMemoryManager<A: Arch> {
    platform: Arc<Platform<A>>,
    asids: AsidAllocator,
    kernel: Arc<AddressSpace<A>>,
    next_id: AtomicUsize,
}

impl<A: Arch> VirtualMemoryManager<A> {
    /// Creates the manager and the kernel address space.
    pub fn new(arch: A, frames: Arc<dyn FrameAllocator>, config: VmmConfig) -> Result<Self> {
        let asid_count = config.effective_asid_count(arch.asid_count());
        if asid_count == 0 {
            return Err(Error::InvalidArgument);
        }
        let platform = Arc::new(Platform { arch, frames });
        let kernel = Arc::new(AddressSpace::new(
            AsId::new(0),
            AsFlags::KERNEL,
            platform.clone(),
            Some(ASID_KERNEL),
        )?);

        log::info!("VMM: {asid_count} ASIDs, {}-byte pages", arch::PAGE_SIZE);
        Ok(Self {
            platform,
            asids: AsidAllocator::new(asid_count),
            kernel,
            next_id: AtomicUsize::new(1),
        })
    }

    /// The kernel address space.
    pub fn kernel(&self) -> &Arc<AddressSpace<A>> {
        &self.kernel
    }

    pub fn arch(&self) -> &A {
        &self.platform.arch
    }

    pub fn asids(&self) -> &AsidAllocator {
        &self.asids
    }

    /// Creates an empty address space.
    ///
    /// User address spaces get an ASID the first time they are switched to.
    pub fn create(&self, flags: AsFlags) -> Result<Arc<AddressSpace<A>>> {
        let id = AsId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let asid = flags.contains(AsFlags::KERNEL).then_some(ASID_KERNEL);
        let space = AddressSpace::new(id, flags, self.platform.clone(), asid)?;
        log::debug!("VMM: created address space {id} ({flags:?})");
        Ok(Arc::new(space))
    }

    /// Destroys an address space that no task uses and no processor has active.
    pub fn destroy(&self, space: &Arc<AddressSpace<A>>) -> Result<()> {
        if Arc::ptr_eq(space, &self.kernel) {
            return Err(Error::PermissionDenied);
        }
        space.teardown()?;
        if let Some(asid) = self.asids.release(space.id(), &space.binding) {
            if asid != ASID_KERNEL {
                self.platform.arch.invalidate_asid(asid);
            }
        }
        Ok(())
    }

    /// Switches the current processor from `old` to `new`.
    ///
    /// `old` is deactivated first so that its ASID can be reclaimed for `new`. If `new`
    /// cannot be activated, `old` is made current again.
    pub fn switch(
        &self,
        old: Option<&Arc<AddressSpace<A>>>,
        new: &Arc<AddressSpace<A>>,
    ) -> Result<()> {
        if old.is_some_and(|old| Arc::ptr_eq(old, new)) {
            return Ok(());
        }

        if let Some(old) = old {
            self.asids.deactivate(old.id(), &old.binding);
        }
        if let Err(err) = self.enter(new) {
            if let Some(old) = old {
                self.enter(old)?;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Activates `space` on the current processor and installs its table.
    fn enter(&self, space: &Arc<AddressSpace<A>>) -> Result<()> {
        let activation = self.asids.activate(space.id(), &space.binding)?;
        if let Some(evicted) = activation.evicted {
            self.platform.arch.invalidate_asid(evicted);
        }
        if let Err(err) = space.install(activation.asid) {
            // Only destroyed address spaces cannot be installed.
            self.asids.deactivate(space.id(), &space.binding);
            self.asids.release(space.id(), &space.binding);
            return Err(err);
        }
        log::trace!("VMM: switched to address space {} (asid {})", space.id(), activation.asid);
        Ok(())
    }

    /// Resolves a page fault raised while `current` was active.
    ///
    /// Faults on kernel-half addresses, or with no current address space, are resolved
    /// against the kernel address space. Only kernel code may fault on the kernel half.
    pub fn page_fault(
        &self,
        current: Option<&Arc<AddressSpace<A>>>,
        fault: &PageFault,
    ) -> FaultOutcome {
        let kernel_half = fault.address.as_usize() >= arch::KERNEL_SPACE_START;
        if kernel_half && fault.origin != FaultOrigin::Kernel {
            log::warn!(
                "VMM: {:?} fault at kernel address {} refused",
                fault.origin,
                fault.address
            );
            return fault.fail(Error::PermissionDenied);
        }
        let space = match current {
            Some(space) if !kernel_half => space,
            _ => &self.kernel,
        };
        fault::resolve(space, fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{EmulatedMemory, SoftwareMmu};
    use crate::{
        Access, AreaAttributes, AreaFlags, Backend, PAGE_SIZE, VirtualAddress,
    };

    fn manager(asids: usize, frames: usize) -> (VirtualMemoryManager<SoftwareMmu>, Arc<EmulatedMemory>) {
        let memory = Arc::new(EmulatedMemory::new(frames));
        let vmm = VirtualMemoryManager::new(SoftwareMmu::new(asids), memory.clone(), VmmConfig::default())
            .unwrap();
        (vmm, memory)
    }

    #[test]
    fn kernel_space_owns_kernel_asid() {
        let (vmm, _) = manager(4, 4);
        assert!(vmm.kernel().is_kernel());
        assert_eq!(vmm.kernel().asid(), Some(ASID_KERNEL));
        assert_eq!(vmm.destroy(&vmm.kernel().clone()), Err(Error::PermissionDenied));
    }

    #[test]
    fn asid_assigned_on_first_switch() {
        let (vmm, _) = manager(4, 4);
        let space = vmm.create(AsFlags::empty()).unwrap();
        assert_eq!(space.asid(), None);

        vmm.switch(None, &space).unwrap();
        let asid = space.asid().unwrap();
        assert_ne!(asid, ASID_KERNEL);
        assert_eq!(space.cpu_refcount(), 1);
        assert_eq!(vmm.arch().active().map(|(_, active)| active), Some(asid));
    }

    #[test]
    fn switch_to_same_space_is_noop() {
        let (vmm, _) = manager(4, 4);
        let space = vmm.create(AsFlags::empty()).unwrap();
        vmm.switch(None, &space).unwrap();
        vmm.switch(Some(&space), &space).unwrap();
        assert_eq!(space.cpu_refcount(), 1);
    }

    #[test]
    fn recycling_never_steals_from_active_space() {
        // Kernel plus two user ASIDs.
        let (vmm, _) = manager(3, 4);
        let spaces: alloc::vec::Vec<_> = (0..4).map(|_| vmm.create(AsFlags::empty()).unwrap()).collect();

        vmm.switch(None, vmm.kernel()).unwrap();
        let mut current = vmm.kernel().clone();
        for round in 0..3 {
            for space in &spaces {
                vmm.switch(Some(&current), space).unwrap();
                current = space.clone();
                for other in &spaces {
                    if other.cpu_refcount() > 0 {
                        assert!(other.asid().is_some(), "round {round}: active space lost its ASID");
                    }
                }
            }
        }

        let holders = spaces.iter().filter(|space| space.asid().is_some()).count();
        assert_eq!(holders, 2);
        assert!(!vmm.arch().invalidated_asids().is_empty());
    }

    #[test]
    fn exhausted_pool_with_only_active_spaces() {
        // Kernel plus one user ASID, two processors.
        let (vmm, _) = manager(2, 4);
        let first = vmm.create(AsFlags::empty()).unwrap();
        let second = vmm.create(AsFlags::empty()).unwrap();

        vmm.switch(None, &first).unwrap();
        assert_eq!(vmm.switch(None, &second), Err(Error::OutOfMemory));
        assert_eq!(second.asid(), None);
        assert!(first.asid().is_some());
    }

    #[test]
    fn switching_away_frees_asid_for_next_space() {
        // Kernel plus one user ASID, one processor.
        let (vmm, _) = manager(2, 4);
        let first = vmm.create(AsFlags::empty()).unwrap();
        let second = vmm.create(AsFlags::empty()).unwrap();

        vmm.switch(None, &first).unwrap();
        let asid = first.asid().unwrap();
        vmm.switch(Some(&first), &second).unwrap();

        assert_eq!(second.asid(), Some(asid));
        assert_eq!(second.cpu_refcount(), 1);
        assert_eq!(first.asid(), None);
        assert_eq!(first.cpu_refcount(), 0);
        assert!(vmm.arch().invalidated_asids().contains(&asid));

        vmm.switch(Some(&second), &first).unwrap();
        assert_eq!(first.asid(), Some(asid));
        assert_eq!(second.asid(), None);
    }

    #[test]
    fn failed_switch_keeps_old_space_current() {
        let (vmm, _) = manager(2, 4);
        let current = vmm.create(AsFlags::empty()).unwrap();
        let doomed = vmm.create(AsFlags::empty()).unwrap();
        vmm.destroy(&doomed).unwrap();

        vmm.switch(None, &current).unwrap();
        let asid = current.asid().unwrap();
        assert_eq!(vmm.switch(Some(&current), &doomed), Err(Error::NotFound));

        assert_eq!(current.cpu_refcount(), 1);
        assert_eq!(doomed.cpu_refcount(), 0);
        assert_eq!(doomed.asid(), None);
        assert_eq!(current.asid(), Some(asid));
        assert_eq!(vmm.arch().active().map(|(_, active)| active), Some(asid));
        assert_eq!(vmm.asids().inactive_count(), 0);
        assert_eq!(vmm.asids().free_count(), 0);
    }

    #[test]
    fn destroy_requires_idle_space() {
        let (vmm, memory) = manager(4, 4);
        let space = vmm.create(AsFlags::empty()).unwrap();
        space
            .area_create(
                AreaFlags::READ | AreaFlags::WRITE,
                2 * PAGE_SIZE,
                VirtualAddress::new(0x1000),
                AreaAttributes::empty(),
                Backend::anonymous(),
            )
            .unwrap();
        space.page_fault(VirtualAddress::new(0x1000), Access::Write).unwrap();

        vmm.switch(None, &space).unwrap();
        assert_eq!(vmm.destroy(&space), Err(Error::Integrity));

        vmm.switch(Some(&space), vmm.kernel()).unwrap();
        let asid = space.asid().unwrap();
        vmm.destroy(&space).unwrap();

        assert_eq!(memory.allocated_frames(), 0);
        assert_eq!(space.asid(), None);
        assert_eq!(vmm.asids().free_count(), 3);
        assert!(vmm.arch().invalidated_asids().contains(&asid));
        assert_eq!(vmm.switch(Some(vmm.kernel()), &space), Err(Error::NotFound));
        assert_eq!(space.cpu_refcount(), 0);
        assert_eq!(space.asid(), None);
        assert_eq!(vmm.asids().free_count(), 3);
    }

    #[test]
    fn config_limits_asids() {
        let memory = Arc::new(EmulatedMemory::new(1));
        let config = VmmConfig { asid_count: Some(2) };
        let vmm = VirtualMemoryManager::new(SoftwareMmu::new(16), memory, config).unwrap();
        assert_eq!(vmm.asids().free_count(), 1);
    }

    #[test]
    fn kernel_faults_go_to_kernel_space() {
        let (vmm, _) = manager(4, 4);
        let kernel_base = VirtualAddress::new(arch::KERNEL_SPACE_START);
        vmm.kernel()
            .area_create(
                AreaFlags::READ | AreaFlags::WRITE,
                PAGE_SIZE,
                kernel_base,
                AreaAttributes::empty(),
                Backend::anonymous(),
            )
            .unwrap();
        let user = vmm.create(AsFlags::empty()).unwrap();

        let fault = PageFault {
            address: kernel_base,
            access: Access::Write,
            origin: FaultOrigin::Kernel,
        };
        assert_eq!(vmm.page_fault(Some(&user), &fault), FaultOutcome::Resolved);
        assert!(vmm.kernel().translate(kernel_base).is_some());
    }

    #[test]
    fn user_faults_on_kernel_half_are_refused() {
        let (vmm, memory) = manager(4, 4);
        let kernel_base = VirtualAddress::new(arch::KERNEL_SPACE_START);
        vmm.kernel()
            .area_create(
                AreaFlags::READ | AreaFlags::WRITE,
                PAGE_SIZE,
                kernel_base,
                AreaAttributes::empty(),
                Backend::anonymous(),
            )
            .unwrap();
        let user = vmm.create(AsFlags::empty()).unwrap();

        let mut fault = PageFault {
            address: kernel_base,
            access: Access::Write,
            origin: FaultOrigin::User,
        };
        assert_eq!(
            vmm.page_fault(Some(&user), &fault),
            FaultOutcome::Unresolved(Error::PermissionDenied)
        );
        fault.origin = FaultOrigin::UserCopy;
        assert_eq!(
            vmm.page_fault(Some(&user), &fault),
            FaultOutcome::Deferred(Error::PermissionDenied)
        );
        assert!(vmm.kernel().translate(kernel_base).is_none());
        assert_eq!(memory.allocated_frames(), 0);
    }
}
