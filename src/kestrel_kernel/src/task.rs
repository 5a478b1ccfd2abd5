//! Tasks
use core::fmt;

use crate::{hold::boost::BoostPolicy, klock, utils::Init, KernelCfg1};

/// *Task control block* - the portion of a task's state data that the
/// semaphore priority-inheritance core operates on.
///
/// References to a `TaskCb` are used as opaque look-up keys throughout this
/// crate. The referenced task may have exited; the kernel confirms liveness
/// through [`Sched::verify_task`] before trusting anything but the address.
///
/// [`Sched::verify_task`]: crate::Sched::verify_task
pub struct TaskCb<
    Traits: KernelCfg1,
    TaskPriority: 'static = <Traits as KernelCfg1>::TaskPriority,
    SemBoostsData: 'static = <<Traits as KernelCfg1>::BoostPolicy as BoostPolicy<Traits>>::PerTaskData,
> {
    /// The task's base priority. Never altered by priority inheritance.
    pub base_priority: klock::CpuLockCell<Traits, TaskPriority>,

    /// The task's effective priority. This is the priority the scheduler's
    /// ready queue is keyed on. It may be temporarily raised above
    /// `base_priority` while the task holds semaphore counts that
    /// higher-priority tasks are waiting for.
    ///
    /// Only the scheduler writes this field, by way of
    /// [`Sched::set_task_priority`] and [`Sched::reprioritize_task`].
    ///
    /// [`Sched::set_task_priority`]: crate::Sched::set_task_priority
    /// [`Sched::reprioritize_task`]: crate::Sched::reprioritize_task
    pub effective_priority: klock::CpuLockCell<Traits, TaskPriority>,

    /// Storage for the boost restoration strategy selected by
    /// [`KernelCfg1::BoostPolicy`].
    pub(crate) sem_boosts: SemBoostsData,
}

impl<Traits: KernelCfg1> TaskCb<Traits> {
    /// Construct a `TaskCb` with the specified base priority.
    pub const fn new(priority: Traits::TaskPriority) -> Self {
        Self {
            base_priority: klock::CpuLockCell::new(priority),
            effective_priority: klock::CpuLockCell::new(priority),
            sem_boosts: Init::INIT,
        }
    }
}

impl<
        Traits: crate::KernelTraits,
        TaskPriority: fmt::Debug + 'static,
        SemBoostsData: fmt::Debug + 'static,
    > fmt::Debug for TaskCb<Traits, TaskPriority, SemBoostsData>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("sem_boosts", &self.sem_boosts)
            .finish()
    }
}
