//! The Kestrel kernel's semaphore priority-inheritance core.
//!
//! When a high-priority task blocks on a counting semaphore whose counts are
//! held by lower-priority tasks, the holders are temporarily raised to the
//! waiter's effective priority so that unrelated middle-priority work cannot
//! delay them indefinitely. This crate keeps the records that make the
//! subsequent *restoration* exact: which tasks hold counts on which
//! semaphores, and which boosts are still outstanding. The semaphore
//! arithmetic itself and the scheduler's ready queues live elsewhere and are
//! reached through the traits defined at the crate root.
//!
//! # Kernel trait types
//!
//! Like the rest of the kernel, this crate is monomorphized over a *kernel
//! trait type* supplied by the port:
//!
//!  - [`PortThreading`] exposes the execution environment: CPU Lock and the
//!    current execution context.
//!  - [`KernelCfg1`] carries the compile-time configuration: the priority
//!    type, the holder record storage
//!    ([`FreelistTable`](hold::table::FreelistTable) or
//!    [`InlineTable`](hold::table::InlineTable)), and the boost restoration
//!    strategy ([`RestoreToBase`](hold::boost::RestoreToBase) or
//!    [`BoostLedger`](hold::boost::BoostLedger)).
//!  - [`Sched`] is the consumed scheduler interface through which task
//!    priorities are changed and task liveness is checked.
//!  - [`KernelCfg2`] hands out the static kernel [`State`].
//!
//! # Priorities
//!
//! A numerically lower [`KernelCfg1::TaskPriority`] value stands for a
//! higher priority, following the convention used throughout the kernel.
//! Boosting a task therefore means lowering the number stored in its
//! [`effective_priority`](task::TaskCb::effective_priority), and the
//! effective priority of a task is the numeric minimum of its base priority
//! and all boosts recorded against it.
//!
//! # Execution model
//!
//! The hooks in [`hold`] never block and never fail. They are designed to be
//! called with scheduling preemption inhibited; the
//! [`CpuLockTokenRefMut`](klock::CpuLockTokenRefMut) parameter they take can
//! only be produced by entering that state, so the requirement is enforced
//! at compile time. There is no locking inside the crate; mutual exclusion
//! is inherited from the caller's critical section.
#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

use core::fmt;

use num_traits::ToPrimitive;

pub mod error;
pub mod hold;
pub mod klock;
pub mod semaphore;
pub mod task;
pub mod utils;

pub use self::error::BadContextError;

use self::{hold::boost::BoostPolicy, hold::table::HolderTable, utils::Init};

/// Provides access to the execution environment of the kernel.
///
/// # Safety
///
/// The CPU Lock primitives guard every piece of kernel state. Implementing
/// them incorrectly voids the aliasing guarantees of
/// [`CpuLockCell`](klock::CpuLockCell).
pub unsafe trait PortThreading: Sized + 'static {
    /// Attempt to enter a CPU Lock state.
    ///
    /// Returns `false` if CPU Lock is already active.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the CPU Lock state.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel while CPU Lock is active.
    unsafe fn leave_cpu_lock();

    /// Return `true` if CPU Lock is active.
    fn is_cpu_lock_active() -> bool;

    /// Return `true` if the current context is an interrupt context.
    fn is_interrupt_context() -> bool;
}

/// The compile-time configuration of the kernel.
///
/// # Safety
///
/// The associated types select storage layouts that the rest of the kernel
/// builds invariants on. They are only meant to be chosen by a port.
pub unsafe trait KernelCfg1: PortThreading {
    /// The task priority type. A numerically lower value is a higher
    /// priority.
    type TaskPriority: Copy + Ord + Send + Sync + fmt::Debug + ToPrimitive + 'static;

    /// The holder record storage. See [`hold::table`].
    type HolderTable: HolderTable<Self>;

    /// The boost restoration strategy. See [`hold::boost`].
    type BoostPolicy: BoostPolicy<Self>;
}

/// The scheduler interface consumed by the priority-inheritance core.
///
/// # Safety
///
/// [`set_task_priority`](Self::set_task_priority) and
/// [`reprioritize_task`](Self::reprioritize_task) must keep the scheduler's
/// ready queues consistent with
/// [`effective_priority`](task::TaskCb::effective_priority).
pub unsafe trait Sched: KernelCfg1 {
    /// Return `true` iff the task behind `task` still exists.
    ///
    /// Holder records survive their task's exit; the core calls this before
    /// trusting anything about a recorded task.
    fn verify_task(
        lock: klock::CpuLockTokenRefMut<'_, Self>,
        task: &'static task::TaskCb<Self>,
    ) -> bool;

    /// Set the effective priority of `task`.
    ///
    /// This may mark the target pending-preemption; the actual context
    /// switch is deferred until the caller releases preemption.
    fn set_task_priority(
        lock: klock::CpuLockTokenRefMut<'_, Self>,
        task: &'static task::TaskCb<Self>,
        priority: Self::TaskPriority,
    );

    /// Lower the effective priority of `task`, honoring any pending
    /// reprioritization the scheduler may be tracking for it.
    fn reprioritize_task(
        lock: klock::CpuLockTokenRefMut<'_, Self>,
        task: &'static task::TaskCb<Self>,
        priority: Self::TaskPriority,
    );
}

/// Associates static kernel state with a kernel trait type.
///
/// # Safety
///
/// [`state`](Self::state) must return the same instance every time.
pub unsafe trait KernelCfg2: Sched {
    fn state() -> &'static State<Self>;
}

/// The umbrella trait bringing together everything the priority-inheritance
/// core needs from its environment.
pub trait KernelTraits: PortThreading + KernelCfg1 + Sched + KernelCfg2 {}

impl<T: PortThreading + KernelCfg1 + Sched + KernelCfg2> KernelTraits for T {}

/// The static kernel state owned by this crate.
pub struct State<Traits: KernelCfg1> {
    /// The currently running task, maintained by the scheduler. `None` while
    /// booting and while idle.
    pub running_task: klock::CpuLockCell<Traits, Option<&'static task::TaskCb<Traits>>>,

    /// The shared portion of the holder record storage. In the freelist
    /// configuration this is where the record pool lives; in the inline
    /// configuration it is empty.
    pub holder_table: <Traits as KernelCfg1>::HolderTable,
}

impl<Traits: KernelCfg1> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        running_task: Init::INIT,
        holder_table: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field("holder_table", &self.holder_table)
            .finish()
    }
}
