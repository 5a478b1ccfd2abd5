//! Boost accounting and priority restoration strategies (internal use only).
//!
//! [`RestoreToBase`] keeps no per-boost state. A holder is raised whenever a
//! stronger waiter appears, and every restoration drops it all the way back
//! to its base priority; waiters that are still pending will raise it again
//! the next time they run the wait path. This is cheap and sufficient when
//! tasks rarely hold more than one contended semaphore at a time.
//!
//! [`BoostLedger`] gives each task a bounded list of `(semaphore, priority)`
//! entries so a restoration can compute the exact priority warranted by the
//! boosts that are still outstanding, including those contributed through
//! *other* semaphores the task is holding.
use arrayvec::ArrayVec;
use core::{fmt, marker::PhantomData, ptr};
use num_traits::ToPrimitive;

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    semaphore::SemaphoreCb,
    task::TaskCb,
    utils::Init,
    KernelCfg1, KernelTraits,
};

/// Strategy deciding how waiter-contributed priority boosts are tracked on
/// the holding task and how they are taken back.
///
/// This trait is not intended to be implemented on custom types.
pub trait BoostPolicy<Traits>: 'static + private::Sealed {
    /// Per-task boost storage, embedded in `TaskCb`.
    type PerTaskData: Send + Sync + Init + fmt::Debug + 'static;

    /// A waiter running at `waiter_priority` is about to block on `sem`,
    /// which `htcb` holds counts on. Raise `htcb` as far as the policy
    /// permits. The caller has already confirmed that `htcb` is live.
    fn boost_holder(
        lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static TaskCb<Traits>,
        sem: &'static SemaphoreCb<Traits>,
        waiter_priority: Traits::TaskPriority,
    ) where
        Traits: KernelTraits;

    /// A waiter of `sem` went away. Lower `htcb` to whatever level is still
    /// warranted. `holds_count` tells whether `htcb` still holds unmatched
    /// acquires on `sem`. The caller has already confirmed that `htcb` is
    /// live and currently boosted.
    fn restore_holder(
        lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static TaskCb<Traits>,
        sem: &'static SemaphoreCb<Traits>,
        holds_count: bool,
    ) where
        Traits: KernelTraits;

    /// Debug check that `htcb` carries no residual boost state.
    fn debug_assert_no_boosts(lock: CpuLockTokenRefMut<'_, Traits>, htcb: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;
}

/// Implements [the sealed trait pattern], which prevents [`BoostPolicy`]
/// against downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

/// The stateless policy. See the module documentation.
pub struct RestoreToBase;

impl<Traits: KernelTraits> BoostPolicy<Traits> for RestoreToBase {
    type PerTaskData = ();

    fn boost_holder(
        lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static TaskCb<Traits>,
        _sem: &'static SemaphoreCb<Traits>,
        waiter_priority: Traits::TaskPriority,
    ) {
        // A numerically lower value is a higher priority. Nothing to do if
        // the holder already runs at a sufficient priority.
        if waiter_priority < htcb.effective_priority.get(&*lock) {
            // This cannot cause an immediate context switch; the target is
            // at most marked pending-preemption while the caller still
            // holds the critical section.
            Traits::set_task_priority(lock, htcb, waiter_priority);
        }
    }

    fn restore_holder(
        lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static TaskCb<Traits>,
        _sem: &'static SemaphoreCb<Traits>,
        _holds_count: bool,
    ) {
        // No records to consult, so the only level that can be computed
        // locally is the base priority. Waiters that are still pending will
        // boost the holder again from their wait path.
        let base_priority = htcb.base_priority.get(&*lock);
        Traits::reprioritize_task(lock, htcb, base_priority);
    }

    fn debug_assert_no_boosts(
        _lock: CpuLockTokenRefMut<'_, Traits>,
        _htcb: &'static TaskCb<Traits>,
    ) {
    }
}

impl private::Sealed for RestoreToBase {}

/// One outstanding boost, contributed by some waiter on `sem`.
pub struct SemBoost<Traits: KernelCfg1> {
    sem: &'static SemaphoreCb<Traits>,
    priority: Traits::TaskPriority,
}

impl<Traits: KernelCfg1> Clone for SemBoost<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelCfg1> Copy for SemBoost<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for SemBoost<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemBoost")
            .field("sem", &(self.sem as *const SemaphoreCb<Traits>))
            .field("priority", &self.priority)
            .finish()
    }
}

/// The per-task data of [`BoostLedger`]: a bounded, unordered list of
/// outstanding boosts. Multiple entries for the same semaphore accumulate
/// when several waiters pile up.
pub struct SemBoosts<Traits: KernelCfg1, const N: usize> {
    boosts: CpuLockCell<Traits, ArrayVec<SemBoost<Traits>, N>>,
}

impl<Traits: KernelCfg1, const N: usize> Init for SemBoosts<Traits, N> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { boosts: Init::INIT };
}

impl<Traits: KernelTraits, const N: usize> fmt::Debug for SemBoosts<Traits, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = klock::lock_cpu::<Traits>() {
            f.debug_list().entries(self.boosts.read(&*lock).iter()).finish()
        } else {
            f.write_str("SemBoosts(< locked >)")
        }
    }
}

/// The ledger-based policy with capacity for `N` outstanding boosts per
/// task. See the module documentation.
pub struct BoostLedger<Traits, const N: usize> {
    _phantom: PhantomData<fn() -> Traits>,
}

impl<Traits: KernelTraits, const N: usize> BoostPolicy<Traits> for BoostLedger<Traits, N>
where
    Traits: KernelCfg1<BoostPolicy = Self>,
{
    type PerTaskData = SemBoosts<Traits, N>;

    fn boost_holder(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static TaskCb<Traits>,
        sem: &'static SemaphoreCb<Traits>,
        waiter_priority: Traits::TaskPriority,
    ) {
        // The comparison is against the *base* priority on purpose. Even
        // when some other boost already raised the holder above
        // `waiter_priority`, the dependency must be recorded so that the
        // restore path can account for it.
        if waiter_priority >= htcb.base_priority.get(&*lock) {
            return;
        }

        {
            let boosts = htcb.sem_boosts.boosts.write(&mut *lock);
            if boosts.is_full() {
                log::error!("task {:p} is out of boost slots", htcb);
                return;
            }
            boosts.push(SemBoost {
                sem,
                priority: waiter_priority,
            });
        }

        // If the entry we just recorded is a new maximum, raise the holder
        if waiter_priority < htcb.effective_priority.get(&*lock) {
            log::trace!(
                "boosting holder {:p} to priority {}",
                htcb,
                waiter_priority.to_usize().unwrap_or(usize::MAX)
            );
            Traits::set_task_priority(lock, htcb, waiter_priority);
        }
    }

    fn restore_holder(
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static TaskCb<Traits>,
        sem: &'static SemaphoreCb<Traits>,
        holds_count: bool,
    ) {
        {
            let boosts = htcb.sem_boosts.boosts.write(&mut *lock);
            if !holds_count {
                // The holder gave up its last count on this semaphore.
                // Loitering at an elevated priority would not release the
                // resource any faster anymore, so discard every boost
                // recorded for it.
                boosts.retain(|boost| !ptr::eq(boost.sem, sem));
            } else {
                // The holder still has counts and the strongest waiter for
                // this semaphore has been satisfied. Remove the strongest
                // recorded boost and keep the rest.
                let mut strongest: Option<(usize, Traits::TaskPriority)> = None;
                for (i, boost) in boosts.iter().enumerate() {
                    if ptr::eq(boost.sem, sem)
                        && strongest.map_or(true, |(_, priority)| boost.priority < priority)
                    {
                        strongest = Some((i, boost.priority));
                    }
                }
                if let Some((i, _)) = strongest {
                    boosts.swap_remove(i);
                }
            }
        }

        // Re-evaluate the warranted priority from the remaining entries
        let mut new_priority = htcb.base_priority.get(&*lock);
        for boost in htcb.sem_boosts.boosts.read(&*lock).iter() {
            if boost.priority < new_priority {
                new_priority = boost.priority;
            }
        }

        if new_priority != htcb.effective_priority.get(&*lock) {
            log::trace!(
                "restoring holder {:p} to priority {}",
                htcb,
                new_priority.to_usize().unwrap_or(usize::MAX)
            );
            Traits::set_task_priority(lock, htcb, new_priority);
        }
    }

    fn debug_assert_no_boosts(
        lock: CpuLockTokenRefMut<'_, Traits>,
        htcb: &'static TaskCb<Traits>,
    ) {
        debug_assert!(
            htcb.sem_boosts.boosts.read(&*lock).is_empty(),
            "holder {htcb:p} retains boost entries though no waiters remain"
        );
    }
}

impl<Traits: KernelTraits, const N: usize> private::Sealed for BoostLedger<Traits, N> where
    Traits: KernelCfg1<BoostPolicy = Self>
{
}
