//! Page-fault resolution.
//!
//! The trap handler describes the fault with a [`PageFault`] and gets back a
//! [`FaultOutcome`] telling it whether to retry the instruction, unwind a user-memory copy
//! or kill the task.

use crate::{Access, AddressSpace, Arch, Error, VirtualAddress};

/// Where the faulting access came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    /// User-mode code.
    User,
    /// Kernel code copying from or to user memory on behalf of a task.
    UserCopy,
    /// Any other kernel code.
    Kernel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub access: Access,
    pub origin: FaultOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A mapping is now in place; retry the access.
    Resolved,
    /// The user-memory copy routine must unwind and report the error to its caller.
    Deferred(Error),
    /// The fault cannot be resolved; the faulting task is terminated.
    Unresolved(Error),
}

impl FaultOutcome {
    pub fn is_resolved(self) -> bool {
        matches!(self, FaultOutcome::Resolved)
    }
}

impl PageFault {
    /// Outcome of a fault that could not be resolved with `err`.
    pub(crate) fn fail(&self, err: Error) -> FaultOutcome {
        if self.origin == FaultOrigin::UserCopy && !err.is_fatal() {
            FaultOutcome::Deferred(err)
        } else {
            FaultOutcome::Unresolved(err)
        }
    }
}

/// Resolves `fault` against `space`.
pub fn resolve<A: Arch>(space: &AddressSpace<A>, fault: &PageFault) -> FaultOutcome {
    let err = match space.page_fault(fault.address, fault.access) {
        Ok(()) => return FaultOutcome::Resolved,
        Err(err) => err,
    };
    let outcome = fault.fail(err);
    match outcome {
        FaultOutcome::Deferred(_) => log::debug!(
            "AS {}: deferring {:?} fault at {}: {err}",
            space.id(),
            fault.access,
            fault.address
        ),
        _ => log::warn!(
            "AS {}: unresolved {:?} fault at {} ({:?}): {err}",
            space.id(),
            fault.access,
            fault.address,
            fault.origin
        ),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{EmulatedMemory, SoftwareMmu};
    use crate::{AreaAttributes, AreaFlags, AsFlags, Backend, PAGE_SIZE, VirtualMemoryManager, VmmConfig};
    use alloc::sync::Arc;

    fn setup() -> (VirtualMemoryManager<SoftwareMmu>, Arc<AddressSpace<SoftwareMmu>>) {
        let memory = Arc::new(EmulatedMemory::new(4));
        let vmm = VirtualMemoryManager::new(SoftwareMmu::new(4), memory, VmmConfig::default())
            .unwrap();
        let space = vmm.create(AsFlags::empty()).unwrap();
        space
            .area_create(
                AreaFlags::READ,
                PAGE_SIZE,
                VirtualAddress::new(0x1000),
                AreaAttributes::empty(),
                Backend::anonymous(),
            )
            .unwrap();
        (vmm, space)
    }

    fn fault(address: usize, access: Access, origin: FaultOrigin) -> PageFault {
        PageFault {
            address: VirtualAddress::new(address),
            access,
            origin,
        }
    }

    #[test]
    fn resolves_read_fault() {
        let (_vmm, space) = setup();
        let outcome = resolve(&space, &fault(0x1004, Access::Read, FaultOrigin::User));
        assert!(outcome.is_resolved());
    }

    #[test]
    fn user_faults_are_unresolved() {
        let (_vmm, space) = setup();
        assert_eq!(
            resolve(&space, &fault(0x1000, Access::Write, FaultOrigin::User)),
            FaultOutcome::Unresolved(Error::PermissionDenied)
        );
        assert_eq!(
            resolve(&space, &fault(0x5000, Access::Read, FaultOrigin::Kernel)),
            FaultOutcome::Unresolved(Error::NotFound)
        );
    }

    #[test]
    fn copy_faults_are_deferred() {
        let (_vmm, space) = setup();
        assert_eq!(
            resolve(&space, &fault(0x5000, Access::Read, FaultOrigin::UserCopy)),
            FaultOutcome::Deferred(Error::NotFound)
        );
    }

    #[test]
    fn integrity_errors_are_never_deferred() {
        let (_vmm, space) = setup();
        resolve(&space, &fault(0x1000, Access::Read, FaultOrigin::User));
        assert_eq!(
            resolve(&space, &fault(0x1000, Access::Read, FaultOrigin::UserCopy)),
            FaultOutcome::Unresolved(Error::Integrity)
        );
    }
}
