//! Semaphore holder tracking and priority inheritance
//!
//! The semaphore layer drives this module through a small set of hooks: a
//! task acquired a count ([`add_holder`]), a task is about to block waiting
//! for one ([`boost_priority`]), a task gave a count back
//! ([`release_holder`] followed by [`restore_baseprio`]), or a waiter went
//! away without ever getting a count ([`canceled`]). In response, holder
//! records are maintained per semaphore and the effective priorities of the
//! holding tasks are raised and restored through the [`Sched`] interface.
//!
//! Every hook runs inside the caller's critical section, which is what the
//! [`CpuLockTokenRefMut`] parameter stands for. Nothing here blocks, and
//! nothing here reports failure to the caller; when the bookkeeping runs out
//! of room it logs the fact and degrades to weaker inheritance, leaving the
//! semaphore arithmetic unaffected.
//!
//! [`Sched`]: crate::Sched
use core::ptr;

use crate::{
    klock::CpuLockTokenRefMut,
    semaphore::SemaphoreCb,
    task::TaskCb,
    KernelCfg1, KernelTraits,
};

pub mod boost;
pub mod table;

use self::{boost::BoostPolicy, table::HolderTable};

#[inline]
fn holder_table<Traits: KernelTraits>() -> &'static Traits::HolderTable {
    &Traits::state().holder_table
}

/// Set up the holder record storage. Called once during kernel bring-up,
/// before the first semaphore operation.
pub fn initialize_holders<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) {
    holder_table::<Traits>().initialize(lock);
}

/// Reclaim every holder record belonging to `sem`, which is being destroyed.
///
/// The recorded tasks may or may not be alive, and it is common to destroy a
/// semaphore while holding it, so no task priority is adjusted here. Stranded
/// records are simply recovered.
pub fn destroy_holder<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    holder_table::<Traits>().destroy(lock, sem);
}

/// Register the current task as a holder of `sem`. Called from the wait path
/// when the calling task obtains a count.
pub fn add_holder<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    if let Some(rtcb) = Traits::state().running_task.get(&*lock) {
        add_holder_tcb(lock, rtcb, sem);
    }
}

/// Register `htcb` as a holder of `sem`. Called from the post path when the
/// count is handed to a previously blocked waiter.
pub fn add_holder_tcb<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    htcb: &'static TaskCb<Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    // If priority inheritance is disabled for this semaphore, don't add the
    // holder. With no holders on record, no boost can ever be applied.
    if sem.inherit_disabled {
        return;
    }

    let table = holder_table::<Traits>();
    let holder = table
        .find(lock.borrow_mut(), sem, htcb)
        .or_else(|| table.allocate(lock.borrow_mut(), sem));

    // On allocation failure an error has been logged and this acquisition
    // proceeds without inheritance
    if let Some(holder) = holder {
        holder.task.replace(&mut *lock, Some(htcb));
        *holder.counts.write(&mut *lock) += 1;
    }
}

/// Raise the priority of every holder of `sem` that runs weaker than the
/// current task. Called from the wait path right before the current task
/// blocks on `sem`.
pub fn boost_priority<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    let Some(rtcb) = Traits::state().running_task.get(&*lock) else {
        return;
    };
    let waiter_priority = rtcb.effective_priority.get(&*lock);

    holder_table::<Traits>().for_each(lock, sem, |mut lock, holder| {
        let Some(htcb) = holder.task.get(&*lock) else {
            return false;
        };

        // The holder may have exited without releasing its counts. There is
        // no sensible recovery beyond dropping the stranded record; perhaps
        // the program killed a thread and will destroy the semaphore next.
        if !Traits::verify_task(lock.borrow_mut(), htcb) {
            log::warn!("holder {:p} is a stale handle, counts lost", htcb);
            holder_table::<Traits>().free(lock, sem, holder);
            return false;
        }

        <<Traits as KernelCfg1>::BoostPolicy as BoostPolicy<Traits>>::boost_holder(
            lock,
            htcb,
            sem,
            waiter_priority,
        );
        false
    });
}

/// Take back one count held by the current task on `sem`. Called from the
/// post path after the count is given back.
///
/// Only the count is decremented here. The record itself is removed on the
/// restore path, which needs to observe the zero count to pick the right
/// restoration.
pub fn release_holder<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    let Some(rtcb) = Traits::state().running_task.get(&*lock) else {
        return;
    };

    if let Some(holder) = holder_table::<Traits>().find(lock.borrow_mut(), sem, rtcb) {
        let counts = holder.counts.write(&mut *lock);
        if *counts > 0 {
            *counts -= 1;
        }
    }
}

/// Undo the boosts that were contributed by a departed waiter of `sem`.
/// Called from the post path after the count has been handed over.
///
/// `stcb` is the task that received the count, or `None` if the count was
/// simply deposited because nobody was waiting.
///
/// When the post happens in an interrupt handler the poster injects the
/// count from outside without being a participant itself. When it happens in
/// a task, the poster is one of the holders, and lowering its priority may
/// get it preempted on the spot. The holders are therefore settled in two
/// passes, every other holder first and the poster last, so a preemption in
/// the middle never exposes a half-restored holder list.
pub fn restore_baseprio<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    stcb: Option<&'static TaskCb<Traits>>,
    sem: &'static SemaphoreCb<Traits>,
) {
    if Traits::is_interrupt_context() {
        restore_baseprio_irq(lock, stcb, sem);
    } else {
        restore_baseprio_task(lock, stcb, sem);
    }
}

/// A waiter of `sem` was awakened by a signal instead of a count. Undo
/// whatever boosts its wait had contributed, exactly as if it had been
/// satisfied.
pub fn canceled<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    stcb: &'static TaskCb<Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    debug_assert!(sem.value.get(&*lock) <= 0);

    log::trace!("wait on {:p} canceled for task {:p}", sem, stcb);
    restore_holder_prio_all(lock, sem);
}

fn restore_baseprio_irq<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    stcb: Option<&'static TaskCb<Traits>>,
    sem: &'static SemaphoreCb<Traits>,
) {
    if stcb.is_some() {
        // The departed waiter was the strongest one; every holder boosted on
        // its behalf gets to drop to the next pending level
        restore_holder_prio_all(lock.borrow_mut(), sem);
    } else {
        // With no waiters left, every holder is expected to be back at its
        // base priority
        #[cfg(feature = "strict_holder_checks")]
        verify_holders(lock.borrow_mut(), sem);
    }
}

fn restore_baseprio_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    stcb: Option<&'static TaskCb<Traits>>,
    sem: &'static SemaphoreCb<Traits>,
) {
    let Some(rtcb) = Traits::state().running_task.get(&*lock) else {
        return;
    };

    if stcb.is_some() {
        // Settle every holder other than the poster first
        holder_table::<Traits>().for_each(lock.borrow_mut(), sem, |lock, holder| {
            let Some(htcb) = holder.task.get(&*lock) else {
                return false;
            };
            if !ptr::eq(htcb, rtcb) {
                restore_holder_prio(lock, htcb, sem);
            }
            false
        });

        // Now the poster itself, whose drop may trigger preemption
        holder_table::<Traits>().for_each(lock.borrow_mut(), sem, |mut lock, holder| {
            if !holder.holds_task(lock.borrow_mut(), rtcb) {
                return false;
            }

            if <<Traits as KernelCfg1>::HolderTable as HolderTable<Traits>>::INLINE {
                // Only two records exist per semaphore in this
                // configuration. Give the poster's exhausted record back
                // before the preemption window opens, so a slot is free for
                // whoever runs next.
                find_and_free_if_zero(lock.borrow_mut(), sem, rtcb);
            }
            restore_holder_prio(lock, rtcb, sem);
            true
        });
    } else {
        #[cfg(feature = "strict_holder_checks")]
        verify_holders(lock.borrow_mut(), sem);
    }

    // The poster's counts were decremented beforehand in `release_holder`.
    // If none remain, its record leaves the holder list now.
    find_and_free_if_zero(lock.borrow_mut(), sem, rtcb);
}

/// Apply the restore rule to every holder of `sem`.
fn restore_holder_prio_all<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    holder_table::<Traits>().for_each(lock, sem, |lock, holder| {
        if let Some(htcb) = holder.task.get(&*lock) {
            restore_holder_prio(lock, htcb, sem);
        }
        false
    });
}

/// Apply the restore rule to one holder task.
fn restore_holder_prio<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    htcb: &'static TaskCb<Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    let holder = holder_table::<Traits>().find(lock.borrow_mut(), sem, htcb);

    // Stale handles get their record dropped and nothing else; restoring the
    // priority of an exited task would be meaningless
    if !Traits::verify_task(lock.borrow_mut(), htcb) {
        log::warn!("holder {:p} is a stale handle, counts lost", htcb);
        if let Some(holder) = holder {
            holder_table::<Traits>().free(lock, sem, holder);
        }
        return;
    }

    // Was the priority of the holder boosted at all?
    if htcb.effective_priority.get(&*lock) == htcb.base_priority.get(&*lock) {
        return;
    }

    let holds_count = holder.map_or(false, |holder| holder.counts.get(&*lock) > 0);
    <<Traits as KernelCfg1>::BoostPolicy as BoostPolicy<Traits>>::restore_holder(
        lock, htcb, sem, holds_count,
    );
}

/// Remove `tcb`'s holder record once it holds no more counts.
fn find_and_free_if_zero<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
    tcb: &'static TaskCb<Traits>,
) {
    if let Some(holder) = holder_table::<Traits>().find(lock.borrow_mut(), sem, tcb) {
        if holder.counts.get(&*lock) == 0 {
            holder_table::<Traits>().free(lock, sem, holder);
        }
    }
}

/// Debug verification run when a post finds no waiters: every holder is
/// expected to be quiescent.
///
/// The expectation does not hold for every legal calling pattern (a holder
/// may legitimately remain boosted through a different semaphore), which is
/// why this lives behind its own feature gate.
#[cfg(feature = "strict_holder_checks")]
fn verify_holders<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    holder_table::<Traits>().for_each(lock, sem, |mut lock, holder| {
        let Some(htcb) = holder.task.get(&*lock) else {
            return false;
        };
        debug_assert_eq!(
            htcb.effective_priority.get(&*lock),
            htcb.base_priority.get(&*lock),
            "holder {htcb:p} is still boosted though no waiters remain"
        );
        <<Traits as KernelCfg1>::BoostPolicy as BoostPolicy<Traits>>::debug_assert_no_boosts(
            lock.borrow_mut(),
            htcb,
        );
        false
    });
}

/// Log one line per holder record of `sem`.
#[cfg(feature = "holder_debug")]
pub fn enum_holders<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    holder_table::<Traits>().for_each(lock, sem, |lock, holder| {
        log::info!(
            "  {:p}: {:?} {:?} {:04}",
            holder,
            holder.next.get(&*lock).map(|h| h as *const table::HolderCb<Traits>),
            holder.task.get(&*lock).map(|t| t as *const TaskCb<Traits>),
            holder.counts.get(&*lock),
        );
        false
    });
}

/// The number of holder records currently available for allocation. A way to
/// find out which threads are not destroying their semaphores.
#[cfg(feature = "holder_debug")]
pub fn num_free_holders<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
    holder_table::<Traits>().free_count(lock)
}
