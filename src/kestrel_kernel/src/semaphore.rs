//! Semaphores
use core::fmt;

use crate::{hold::table::HolderTable, klock, utils::Init, KernelCfg1};

/// The count of a counting semaphore.
///
/// The wait/post arithmetic lives in the semaphore layer proper, outside this
/// crate. A non-negative value is the number of available counts; a negative
/// value is the negated number of blocked waiters. This crate reads the value
/// only in debug checks.
pub type SemaphoreValue = i16;

/// *Semaphore control block* - the state data of a semaphore that the
/// priority-inheritance core needs to see.
pub struct SemaphoreCb<
    Traits: KernelCfg1,
    HolderTableData: 'static = <<Traits as KernelCfg1>::HolderTable as HolderTable<Traits>>::PerSemaphoreData,
> {
    /// The current semaphore count, maintained by the semaphore layer.
    pub value: klock::CpuLockCell<Traits, SemaphoreValue>,

    /// Suppresses all priority-inheritance bookkeeping for this semaphore.
    /// If no holders are ever recorded, no boosts can ever be applied, so
    /// only [`add_holder`] consults this flag.
    ///
    /// [`add_holder`]: crate::hold::add_holder
    pub(crate) inherit_disabled: bool,

    /// Per-semaphore holder storage. Its layout is decided by
    /// [`KernelCfg1::HolderTable`].
    pub(crate) holders: HolderTableData,
}

impl<Traits: KernelCfg1> SemaphoreCb<Traits> {
    /// Construct a `SemaphoreCb` with the specified initial count.
    pub const fn new(initial_value: SemaphoreValue) -> Self {
        Self {
            value: klock::CpuLockCell::new(initial_value),
            inherit_disabled: false,
            holders: Init::INIT,
        }
    }

    /// Exclude this semaphore from priority inheritance.
    ///
    /// Meant for semaphores used for signaling, where the "holder" notion is
    /// meaningless and the bookkeeping would only leak records.
    pub const fn with_inheritance_disabled(mut self) -> Self {
        self.inherit_disabled = true;
        self
    }

    /// Whether priority inheritance is suppressed for this semaphore.
    #[inline]
    pub fn inheritance_disabled(&self) -> bool {
        self.inherit_disabled
    }
}

impl<Traits: KernelCfg1> Init for SemaphoreCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(0);
}

impl<Traits: crate::KernelTraits, HolderTableData: fmt::Debug + 'static> fmt::Debug
    for SemaphoreCb<Traits, HolderTableData>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("inherit_disabled", &self.inherit_disabled)
            .field("holders", &self.holders)
            .finish()
    }
}
