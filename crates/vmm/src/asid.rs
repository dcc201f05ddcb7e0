//! Hardware address-space identifiers.
//!
//! ASIDs are scarce, so they are handed out lazily when an address space is first
//! activated and reclaimed from inactive address spaces when the pool runs dry. The
//! allocator keeps the inactive holders in a FIFO so the space that has been idle the
//! longest loses its ASID first.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::{AsId, Error, Result};

/// A hardware address-space identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Asid(usize);

/// The ASID permanently owned by the kernel address space.
pub const ASID_KERNEL: Asid = Asid(0);

impl Asid {
    pub const fn new(asid: usize) -> Self {
        Self(asid)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Asid({})", self.0)
    }
}

impl fmt::Display for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-address-space ASID state.
///
/// Shared between the address space and the allocator's inactive list. The allocator
/// lock is always taken before a binding lock.
#[derive(Debug, Default)]
pub(crate) struct AsidBinding {
    pub asid: Option<Asid>,
    /// Number of processors on which the address space is active.
    pub cpu_refcount: usize,
}

impl AsidBinding {
    pub fn shared(asid: Option<Asid>) -> Arc<spin::Mutex<AsidBinding>> {
        Arc::new(spin::Mutex::new(AsidBinding {
            asid,
            cpu_refcount: 0,
        }))
    }
}

pub(crate) type SharedBinding = Arc<spin::Mutex<AsidBinding>>;

/// Result of activating an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Activation {
    pub asid: Asid,
    /// ASID taken away from an inactive address space, whose translations must be flushed
    /// before `asid` is used.
    pub evicted: Option<Asid>,
}

struct AsidPool {
    free: Vec<Asid>,
    /// Inactive address spaces that still hold an ASID, oldest first.
    inactive: VecDeque<(AsId, SharedBinding)>,
}

impl AsidPool {
    fn forget_inactive(&mut self, id: AsId) {
        self.inactive.retain(|(inactive, _)| *inactive != id);
    }
}

/// Process-wide pool of user ASIDs.
pub struct AsidAllocator {
    pool: spin::Mutex<AsidPool>,
}

impl AsidAllocator {
    /// Creates a pool of `count` ASIDs, one of which is [`ASID_KERNEL`].
    pub fn new(count: usize) -> Self {
        let free = (1..count).rev().map(Asid::new).collect();
        Self {
            pool: spin::Mutex::new(AsidPool {
                free,
                inactive: VecDeque::new(),
            }),
        }
    }

    /// Number of ASIDs neither held nor reserved.
    pub fn free_count(&self) -> usize {
        self.pool.lock().free.len()
    }

    /// Number of inactive address spaces still holding an ASID.
    pub fn inactive_count(&self) -> usize {
        self.pool.lock().inactive.len()
    }

    /// Marks the address space as active on one more processor, assigning it an ASID if it
    /// has none.
    pub(crate) fn activate(&self, id: AsId, binding: &SharedBinding) -> Result<Activation> {
        let mut pool = self.pool.lock();
        let mut state = binding.lock();

        if let Some(asid) = state.asid {
            if state.cpu_refcount == 0 {
                pool.forget_inactive(id);
            }
            state.cpu_refcount += 1;
            return Ok(Activation {
                asid,
                evicted: None,
            });
        }

        let activation = if let Some(asid) = pool.free.pop() {
            Activation {
                asid,
                evicted: None,
            }
        } else {
            let (victim, victim_binding) = pool.inactive.pop_front().ok_or(Error::OutOfMemory)?;
            let mut victim_state = victim_binding.lock();
            debug_assert_eq!(victim_state.cpu_refcount, 0, "evicting from an active space");
            let asid = victim_state.asid.take().ok_or(Error::Integrity)?;
            log::debug!("reclaimed ASID {asid} from inactive address space {victim}");
            Activation {
                asid,
                evicted: Some(asid),
            }
        };

        state.asid = Some(activation.asid);
        state.cpu_refcount += 1;
        Ok(activation)
    }

    /// Marks the address space as no longer active on one processor.
    ///
    /// Once it is inactive everywhere its ASID becomes eligible for reclaim.
    pub(crate) fn deactivate(&self, id: AsId, binding: &SharedBinding) {
        let mut pool = self.pool.lock();
        let mut state = binding.lock();
        debug_assert!(state.cpu_refcount > 0, "deactivating an inactive space");
        state.cpu_refcount = state.cpu_refcount.saturating_sub(1);
        if state.cpu_refcount == 0
            && state.asid.is_some_and(|asid| asid != ASID_KERNEL)
        {
            pool.inactive.push_back((id, binding.clone()));
        }
    }

    /// Returns the address space's ASID to the pool.
    ///
    /// The caller flushes the returned ASID's translations.
    pub(crate) fn release(&self, id: AsId, binding: &SharedBinding) -> Option<Asid> {
        let mut pool = self.pool.lock();
        pool.forget_inactive(id);
        let asid = binding.lock().asid.take()?;
        if asid != ASID_KERNEL {
            pool.free.push(asid);
        }
        Some(asid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(n: usize) -> (AsId, SharedBinding) {
        (AsId::new(n), AsidBinding::shared(None))
    }

    #[test]
    fn hands_out_distinct_asids() {
        let asids = AsidAllocator::new(3);
        let (a, a_binding) = space(1);
        let (b, b_binding) = space(2);

        let first = asids.activate(a, &a_binding).unwrap();
        let second = asids.activate(b, &b_binding).unwrap();

        assert_ne!(first.asid, second.asid);
        assert_ne!(first.asid, ASID_KERNEL);
        assert_eq!(asids.free_count(), 0);
    }

    #[test]
    fn reclaims_from_oldest_inactive_space() {
        let asids = AsidAllocator::new(3);
        let (a, a_binding) = space(1);
        let (b, b_binding) = space(2);
        let (c, c_binding) = space(3);

        let a_asid = asids.activate(a, &a_binding).unwrap().asid;
        asids.activate(b, &b_binding).unwrap();
        asids.deactivate(a, &a_binding);
        asids.deactivate(b, &b_binding);

        let activation = asids.activate(c, &c_binding).unwrap();
        assert_eq!(activation.asid, a_asid);
        assert_eq!(activation.evicted, Some(a_asid));
        assert_eq!(a_binding.lock().asid, None);
        assert!(b_binding.lock().asid.is_some());
    }

    #[test]
    fn never_reclaims_from_active_space() {
        let asids = AsidAllocator::new(2);
        let (a, a_binding) = space(1);
        let (b, b_binding) = space(2);

        asids.activate(a, &a_binding).unwrap();
        assert_eq!(asids.activate(b, &b_binding), Err(Error::OutOfMemory));
        assert!(a_binding.lock().asid.is_some());
        assert_eq!(b_binding.lock().cpu_refcount, 0);
    }

    #[test]
    fn reactivation_keeps_asid() {
        let asids = AsidAllocator::new(2);
        let (a, a_binding) = space(1);

        let asid = asids.activate(a, &a_binding).unwrap().asid;
        asids.deactivate(a, &a_binding);
        assert_eq!(asids.inactive_count(), 1);

        let again = asids.activate(a, &a_binding).unwrap();
        assert_eq!(again.asid, asid);
        assert_eq!(again.evicted, None);
        assert_eq!(asids.inactive_count(), 0);
    }

    #[test]
    fn release_returns_asid_to_pool() {
        let asids = AsidAllocator::new(2);
        let (a, a_binding) = space(1);

        let asid = asids.activate(a, &a_binding).unwrap().asid;
        asids.deactivate(a, &a_binding);
        assert_eq!(asids.release(a, &a_binding), Some(asid));
        assert_eq!(asids.free_count(), 1);
        assert_eq!(asids.inactive_count(), 0);
    }

    #[test]
    fn kernel_asid_is_never_pooled() {
        let asids = AsidAllocator::new(2);
        let kernel = AsId::new(0);
        let binding = AsidBinding::shared(Some(ASID_KERNEL));

        asids.activate(kernel, &binding).unwrap();
        asids.deactivate(kernel, &binding);
        assert_eq!(asids.inactive_count(), 0);
        assert_eq!(asids.free_count(), 1);
    }
}
