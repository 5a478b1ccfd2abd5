//! The counting-semaphore arithmetic surrounding the priority-inheritance
//! hooks.
//!
//! The real semaphore layer lives outside the inheritance core; these
//! functions reproduce its call sequences so tests can drive whole
//! wait/post/cancel flows with one call each. The count convention follows
//! the kernel: a negative value is the negated number of blocked waiters.
use kestrel_kernel::{
    hold,
    klock::CpuLockTokenRefMut,
    semaphore::SemaphoreCb,
    task::TaskCb,
};

use crate::PortInstance;

/// The current task takes a count that is available right away.
pub fn wait_acquired<Traits: PortInstance>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    *sem.value.write(&mut *lock) -= 1;
    hold::add_holder(lock, sem);
}

/// The current task wants a count that is not available and is about to
/// block. The holders of `sem` are boosted before the task yields.
pub fn wait_blocked<Traits: PortInstance>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
) {
    *sem.value.write(&mut *lock) -= 1;
    hold::boost_priority(lock, sem);
}

/// A count is given back, possibly waking `woken`. `woken` should be the
/// highest-priority waiter, the one the semaphore layer would hand the
/// count to; `None` if nobody is waiting.
///
/// Works from both task context and (via
/// [`State::with_interrupt_context`](crate::State::with_interrupt_context))
/// interrupt context.
pub fn post<Traits: PortInstance>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
    woken: Option<&'static TaskCb<Traits>>,
) {
    hold::release_holder(lock.borrow_mut(), sem);
    *sem.value.write(&mut *lock) += 1;
    hold::restore_baseprio(lock.borrow_mut(), woken, sem);
    if let Some(stcb) = woken {
        hold::add_holder_tcb(lock, stcb, sem);
    }
}

/// `waiter`'s wait was aborted by a signal. The boosts its wait contributed
/// are taken back and the count it was charged for is returned.
pub fn cancel<Traits: PortInstance>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sem: &'static SemaphoreCb<Traits>,
    waiter: &'static TaskCb<Traits>,
) {
    hold::canceled(lock.borrow_mut(), waiter, sem);
    *sem.value.write(&mut *lock) += 1;
}
