//! Scenarios for the inline holder storage, where every semaphore embeds
//! exactly two records and there is no shared pool.

mod slot_exhaustion {
    use kestrel_kernel::hold::boost::RestoreToBase;
    use kestrel_kernel::hold::table::InlineTable;
    use kestrel_kernel::semaphore::SemaphoreCb;
    use kestrel_kernel::task::TaskCb;
    use kestrel_kernel::{hold, klock};
    use kestrel_port_std::{sem, set_running_task, task_addr, use_port, PortInstance};

    use_port!(unsafe struct SystemTraits {
        priority: u8,
        holder_table: InlineTable<SystemTraits>,
        boost_policy: RestoreToBase,
    });

    static TASK_A: TaskCb<SystemTraits> = TaskCb::new(2);
    static TASK_B: TaskCb<SystemTraits> = TaskCb::new(3);
    static TASK_C: TaskCb<SystemTraits> = TaskCb::new(4);
    static TASK_H: TaskCb<SystemTraits> = TaskCb::new(0);
    static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(3);

    #[test]
    fn run() {
        kestrel_port_std::init_test_log();
        let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
        hold::initialize_holders(lock.borrow_mut());

        // Three distinct tasks acquire; the third acquisition finds both
        // slots taken and proceeds without a record
        set_running_task(lock.borrow_mut(), Some(&TASK_A));
        sem::wait_acquired(lock.borrow_mut(), &SEM);
        set_running_task(lock.borrow_mut(), Some(&TASK_B));
        sem::wait_acquired(lock.borrow_mut(), &SEM);
        set_running_task(lock.borrow_mut(), Some(&TASK_C));
        sem::wait_acquired(lock.borrow_mut(), &SEM);

        // The waiter boosts the recorded holders; the third task is never
        // boosted on anyone's behalf
        set_running_task(lock.borrow_mut(), Some(&TASK_H));
        sem::wait_blocked(lock.borrow_mut(), &SEM);
        assert_eq!(TASK_A.effective_priority.get(&*lock), 0);
        assert_eq!(TASK_B.effective_priority.get(&*lock), 0);
        assert_eq!(TASK_C.effective_priority.get(&*lock), 4);

        // The recordless task posts; no restoration is attempted for it
        set_running_task(lock.borrow_mut(), Some(&TASK_C));
        sem::post(lock.borrow_mut(), &SEM, Some(&TASK_H));
        assert_eq!(TASK_A.effective_priority.get(&*lock), 2);
        assert_eq!(TASK_B.effective_priority.get(&*lock), 3);
        assert_eq!(TASK_C.effective_priority.get(&*lock), 4);
        assert_eq!(TASK_H.effective_priority.get(&*lock), 0);

        let events = SystemTraits::port_state().priority_events();
        assert!(events.iter().all(|event| event.task != task_addr(&TASK_C)));

        set_running_task(lock.borrow_mut(), Some(&TASK_A));
        sem::post(lock.borrow_mut(), &SEM, None);
        set_running_task(lock.borrow_mut(), Some(&TASK_B));
        sem::post(lock.borrow_mut(), &SEM, None);
    }
}

mod slot_reuse {
    use kestrel_kernel::hold::boost::RestoreToBase;
    use kestrel_kernel::hold::table::InlineTable;
    use kestrel_kernel::semaphore::SemaphoreCb;
    use kestrel_kernel::task::TaskCb;
    use kestrel_kernel::{hold, klock};
    use kestrel_port_std::{sem, set_running_task, task_addr, use_port, PortInstance, PrioEventKind};

    use_port!(unsafe struct SystemTraits {
        priority: u8,
        holder_table: InlineTable<SystemTraits>,
        boost_policy: RestoreToBase,
    });

    static TASK_L: TaskCb<SystemTraits> = TaskCb::new(2);
    static TASK_M: TaskCb<SystemTraits> = TaskCb::new(3);
    static TASK_H: TaskCb<SystemTraits> = TaskCb::new(0);
    static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(2);

    #[test]
    fn run() {
        kestrel_port_std::init_test_log();
        let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
        hold::initialize_holders(lock.borrow_mut());

        set_running_task(lock.borrow_mut(), Some(&TASK_L));
        sem::wait_acquired(lock.borrow_mut(), &SEM);
        set_running_task(lock.borrow_mut(), Some(&TASK_M));
        sem::wait_acquired(lock.borrow_mut(), &SEM);

        set_running_task(lock.borrow_mut(), Some(&TASK_H));
        sem::wait_blocked(lock.borrow_mut(), &SEM);
        assert_eq!(TASK_L.effective_priority.get(&*lock), 0);
        assert_eq!(TASK_M.effective_priority.get(&*lock), 0);

        SystemTraits::port_state().clear_priority_events();

        // The poster's exhausted slot is given back before its own drop, so
        // the woken waiter can claim it even though the other slot is still
        // taken. The poster itself is restored last.
        set_running_task(lock.borrow_mut(), Some(&TASK_L));
        sem::post(lock.borrow_mut(), &SEM, Some(&TASK_H));

        let events = SystemTraits::port_state().priority_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].task, task_addr(&TASK_M));
        assert_eq!(events[1].task, task_addr(&TASK_L));
        assert!(events.iter().all(|event| event.kind == PrioEventKind::Reprioritize));

        // Both slots are occupied again (by the remaining holder and by the
        // woken waiter); a later wait boosts exactly the recorded holders
        // that run weaker than it
        set_running_task(lock.borrow_mut(), Some(&TASK_L));
        sem::wait_blocked(lock.borrow_mut(), &SEM);
        assert_eq!(TASK_M.effective_priority.get(&*lock), 2);
        assert_eq!(TASK_H.effective_priority.get(&*lock), 0);

        sem::cancel(lock.borrow_mut(), &SEM, &TASK_L);
        assert_eq!(TASK_M.effective_priority.get(&*lock), 3);

        set_running_task(lock.borrow_mut(), Some(&TASK_M));
        sem::post(lock.borrow_mut(), &SEM, None);
        set_running_task(lock.borrow_mut(), Some(&TASK_H));
        sem::post(lock.borrow_mut(), &SEM, None);
    }
}

mod destroy {
    use kestrel_kernel::hold::boost::RestoreToBase;
    use kestrel_kernel::hold::table::InlineTable;
    use kestrel_kernel::semaphore::SemaphoreCb;
    use kestrel_kernel::task::TaskCb;
    use kestrel_kernel::{hold, klock};
    use kestrel_port_std::{sem, set_running_task, use_port, PortInstance};

    use_port!(unsafe struct SystemTraits {
        priority: u8,
        holder_table: InlineTable<SystemTraits>,
        boost_policy: RestoreToBase,
    });

    static TASK_L: TaskCb<SystemTraits> = TaskCb::new(2);
    static SEM: SemaphoreCb<SystemTraits> = SemaphoreCb::new(1);

    #[test]
    fn run() {
        kestrel_port_std::init_test_log();
        let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
        hold::initialize_holders(lock.borrow_mut());

        // Destroying a semaphore its creator still holds is routine; the
        // record is dropped and the task's priority is left alone
        set_running_task(lock.borrow_mut(), Some(&TASK_L));
        sem::wait_acquired(lock.borrow_mut(), &SEM);
        hold::destroy_holder(lock.borrow_mut(), &SEM);

        assert_eq!(TASK_L.effective_priority.get(&*lock), 2);
        assert!(SystemTraits::port_state().priority_events().is_empty());

        // The slots are usable again afterwards
        sem::wait_acquired(lock.borrow_mut(), &SEM);
        sem::post(lock.borrow_mut(), &SEM, None);
    }
}
