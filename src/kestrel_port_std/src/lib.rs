//! Simulated Kestrel kernel port for hosted environments.
//!
//! This crate stands in for the pieces of the kernel that the semaphore
//! priority-inheritance core treats as its environment: CPU Lock, the
//! interrupt/task context distinction, and the scheduler interface. Nothing
//! is actually scheduled; instead, every priority change requested through
//! [`Sched`] is recorded in an inspectable event log before being applied,
//! which is exactly what the integration tests under `tests/` want.
//!
//! Use [`use_port!`] to define a kernel trait type, then drive the kernel
//! through the hooks in `kestrel_kernel::hold` (or through the [`sem`]
//! module, which packages the call sequences the semaphore layer performs).
//!
//! [`Sched`]: kestrel_kernel::Sched
use std::sync::atomic::{AtomicBool, Ordering};

use kestrel_kernel::{klock::CpuLockTokenRefMut, task::TaskCb, KernelCfg2, KernelTraits};
use spin::Mutex as SpinMutex;

pub mod sem;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate kestrel_kernel as kernel;
/// Used by `use_port!`
#[doc(hidden)]
pub extern crate num_traits;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance: KernelTraits {
    fn port_state() -> &'static State;
}

/// A single priority change requested by the kernel through the scheduler
/// interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioEvent {
    /// The address of the affected `TaskCb`. See [`task_addr`].
    pub task: usize,
    /// The requested effective priority.
    pub priority: usize,
    pub kind: PrioEventKind,
}

/// Which scheduler entry point a [`PrioEvent`] came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrioEventKind {
    Set,
    Reprioritize,
}

/// The internal state of the port. One instance exists per kernel trait
/// type defined by [`use_port!`].
pub struct State {
    cpu_lock: AtomicBool,
    interrupt_context: AtomicBool,
    dead_tasks: SpinMutex<Vec<usize>>,
    priority_events: SpinMutex<Vec<PrioEvent>>,
}

impl State {
    pub const fn new() -> Self {
        Self {
            cpu_lock: AtomicBool::new(false),
            interrupt_context: AtomicBool::new(false),
            dead_tasks: SpinMutex::new(Vec::new()),
            priority_events: SpinMutex::new(Vec::new()),
        }
    }

    pub fn try_enter_cpu_lock(&self) -> bool {
        self.cpu_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn leave_cpu_lock(&self) {
        self.cpu_lock.store(false, Ordering::Release);
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock.load(Ordering::Relaxed)
    }

    pub fn is_interrupt_context(&self) -> bool {
        self.interrupt_context.load(Ordering::Relaxed)
    }

    /// Run `f` as if it were called from an interrupt handler.
    pub fn with_interrupt_context<R>(&self, f: impl FnOnce() -> R) -> R {
        self.interrupt_context.store(true, Ordering::Relaxed);
        let result = f();
        self.interrupt_context.store(false, Ordering::Relaxed);
        result
    }

    /// Simulate the exit of the task at `task`. Subsequent
    /// `Sched::verify_task` calls for it will fail.
    pub fn mark_dead(&self, task: usize) {
        self.dead_tasks.lock().push(task);
    }

    pub fn is_task_dead(&self, task: usize) -> bool {
        self.dead_tasks.lock().contains(&task)
    }

    pub fn clear_dead_tasks(&self) {
        self.dead_tasks.lock().clear();
    }

    pub fn record_priority_event(&self, event: PrioEvent) {
        log::trace!("scheduler: {event:?}");
        self.priority_events.lock().push(event);
    }

    /// The priority changes recorded so far, oldest first.
    pub fn priority_events(&self) -> Vec<PrioEvent> {
        self.priority_events.lock().clone()
    }

    pub fn clear_priority_events(&self) {
        self.priority_events.lock().clear();
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// The address of a `TaskCb`, for comparing against [`PrioEvent::task`].
pub fn task_addr<Traits: PortInstance>(task: &'static TaskCb<Traits>) -> usize {
    task as *const TaskCb<Traits> as usize
}

/// Record `task` as the currently running task, as the dispatcher would
/// after a context switch.
pub fn set_running_task<Traits: PortInstance>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: Option<&'static TaskCb<Traits>>,
) {
    <Traits as KernelCfg2>::state()
        .running_task
        .replace(&mut *lock, task);
}

/// Simulate the exit of `task` without any cleanup, leaving any holder
/// records it appears in stranded.
pub fn mark_task_dead<Traits: PortInstance>(task: &'static TaskCb<Traits>) {
    Traits::port_state().mark_dead(task_addr(task));
}

/// Forward `log` output to the test harness.
pub fn init_test_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Define a kernel trait type backed by this port.
///
/// The generated type implements every trait the kernel needs:
/// `PortThreading` (an atomic-flag CPU Lock plus a settable
/// interrupt-context flag), `KernelCfg1` (with the given priority, holder
/// table, and boost policy types), `Sched` (recording every priority change
/// in the port state's event log before applying it, and consulting the
/// dead-task registry for liveness), and `KernelCfg2`.
#[macro_export]
macro_rules! use_port {
    (unsafe struct $Traits:ident {
        priority: $Priority:ty,
        holder_table: $HolderTable:ty,
        boost_policy: $BoostPolicy:ty $(,)?
    }) => {
        struct $Traits;

        unsafe impl $crate::kernel::PortThreading for $Traits {
            unsafe fn try_enter_cpu_lock() -> bool {
                <$Traits as $crate::PortInstance>::port_state().try_enter_cpu_lock()
            }

            unsafe fn leave_cpu_lock() {
                <$Traits as $crate::PortInstance>::port_state().leave_cpu_lock()
            }

            fn is_cpu_lock_active() -> bool {
                <$Traits as $crate::PortInstance>::port_state().is_cpu_lock_active()
            }

            fn is_interrupt_context() -> bool {
                <$Traits as $crate::PortInstance>::port_state().is_interrupt_context()
            }
        }

        unsafe impl $crate::kernel::KernelCfg1 for $Traits {
            type TaskPriority = $Priority;
            type HolderTable = $HolderTable;
            type BoostPolicy = $BoostPolicy;
        }

        unsafe impl $crate::kernel::Sched for $Traits {
            fn verify_task(
                _lock: $crate::kernel::klock::CpuLockTokenRefMut<'_, Self>,
                task: &'static $crate::kernel::task::TaskCb<Self>,
            ) -> bool {
                !<$Traits as $crate::PortInstance>::port_state()
                    .is_task_dead(task as *const _ as usize)
            }

            fn set_task_priority(
                mut lock: $crate::kernel::klock::CpuLockTokenRefMut<'_, Self>,
                task: &'static $crate::kernel::task::TaskCb<Self>,
                priority: $Priority,
            ) {
                <$Traits as $crate::PortInstance>::port_state().record_priority_event(
                    $crate::PrioEvent {
                        task: task as *const _ as usize,
                        priority: $crate::num_traits::ToPrimitive::to_usize(&priority)
                            .unwrap_or(usize::MAX),
                        kind: $crate::PrioEventKind::Set,
                    },
                );
                task.effective_priority.replace(&mut *lock, priority);
            }

            fn reprioritize_task(
                mut lock: $crate::kernel::klock::CpuLockTokenRefMut<'_, Self>,
                task: &'static $crate::kernel::task::TaskCb<Self>,
                priority: $Priority,
            ) {
                <$Traits as $crate::PortInstance>::port_state().record_priority_event(
                    $crate::PrioEvent {
                        task: task as *const _ as usize,
                        priority: $crate::num_traits::ToPrimitive::to_usize(&priority)
                            .unwrap_or(usize::MAX),
                        kind: $crate::PrioEventKind::Reprioritize,
                    },
                );
                task.effective_priority.replace(&mut *lock, priority);
            }
        }

        unsafe impl $crate::kernel::KernelCfg2 for $Traits {
            fn state() -> &'static $crate::kernel::State<Self> {
                static STATE: $crate::kernel::State<$Traits> =
                    <$crate::kernel::State<$Traits> as $crate::kernel::utils::Init>::INIT;
                &STATE
            }
        }

        unsafe impl $crate::PortInstance for $Traits {
            fn port_state() -> &'static $crate::State {
                static PORT_STATE: $crate::State = $crate::State::new();
                &PORT_STATE
            }
        }
    };
}
