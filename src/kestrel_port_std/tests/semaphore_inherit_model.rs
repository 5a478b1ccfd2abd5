//! Drives the inheritance core with a long pseudo-random event sequence and
//! compares every effective priority against a flat reference model after
//! each step.
//!
//! The model keeps, per task, the multiset of `(semaphore, priority)` boosts
//! that should be outstanding; the expected effective priority is the
//! numeric minimum of the base priority and everything in that multiset.
//! Blocked tasks are constrained to hold nothing so their own priority is
//! stable while they wait.
use kestrel_kernel::hold::boost::BoostLedger;
use kestrel_kernel::hold::table::FreelistTable;
use kestrel_kernel::semaphore::SemaphoreCb;
use kestrel_kernel::task::TaskCb;
use kestrel_kernel::{hold, klock};
use kestrel_port_std::{sem, set_running_task, use_port, PortInstance};

const NUM_TASKS: usize = 4;
const NUM_SEMS: usize = 2;
const LEDGER_CAP: usize = 16;
const NUM_OPS: usize = 20_000;

const BASE_PRIORITIES: [u8; NUM_TASKS] = [4, 5, 6, 7];

use_port!(unsafe struct SystemTraits {
    priority: u8,
    holder_table: FreelistTable<SystemTraits, 8>,
    boost_policy: BoostLedger<SystemTraits, 16>,
});

static TASKS: [TaskCb<SystemTraits>; NUM_TASKS] = [
    TaskCb::new(BASE_PRIORITIES[0]),
    TaskCb::new(BASE_PRIORITIES[1]),
    TaskCb::new(BASE_PRIORITIES[2]),
    TaskCb::new(BASE_PRIORITIES[3]),
];
static SEMS: [SemaphoreCb<SystemTraits>; NUM_SEMS] =
    [SemaphoreCb::new(0), SemaphoreCb::new(0)];

struct Xorshift(u32);

impl Xorshift {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// The reference model.
#[derive(Default)]
struct Model {
    /// Unmatched acquires, per `[sem][task]`.
    holds: [[u16; NUM_TASKS]; NUM_SEMS],
    /// The semaphore each task is blocked on, if any.
    waiting: [Option<usize>; NUM_TASKS],
    /// Outstanding `(sem, priority)` boosts, per task.
    ledger: [Vec<(usize, u8)>; NUM_TASKS],
}

impl Model {
    fn expected_priority(&self, task: usize) -> u8 {
        self.ledger[task]
            .iter()
            .map(|&(_, priority)| priority)
            .fold(BASE_PRIORITIES[task], u8::min)
    }

    fn holds_anything(&self, task: usize) -> bool {
        (0..NUM_SEMS).any(|s| self.holds[s][task] > 0)
    }

    fn strongest_waiter(&self, sem: usize) -> Option<usize> {
        (0..NUM_TASKS)
            .filter(|&w| self.waiting[w] == Some(sem))
            .min_by_key(|&w| BASE_PRIORITIES[w])
    }

    fn record_block(&mut self, sem: usize, waiter_priority: u8) {
        for h in 0..NUM_TASKS {
            if self.holds[sem][h] > 0
                && waiter_priority < BASE_PRIORITIES[h]
                && self.ledger[h].len() < LEDGER_CAP
            {
                self.ledger[h].push((sem, waiter_priority));
            }
        }
    }

    /// One departed waiter of `sem`: every affected holder sheds boosts per
    /// the restore rule. `poster` participates even with zero counts left
    /// because its record is still on the list during the restore.
    fn record_restore(&mut self, sem: usize, poster: Option<usize>) {
        for h in 0..NUM_TASKS {
            let participates = self.holds[sem][h] > 0 || poster == Some(h);
            if !participates || self.expected_priority(h) == BASE_PRIORITIES[h] {
                continue;
            }
            if self.holds[sem][h] > 0 {
                // Drop the strongest boost recorded for this semaphore
                let strongest = self.ledger[h]
                    .iter()
                    .enumerate()
                    .filter(|(_, &(s, _))| s == sem)
                    .min_by_key(|(_, &(_, priority))| priority)
                    .map(|(i, _)| i);
                if let Some(i) = strongest {
                    self.ledger[h].swap_remove(i);
                }
            } else {
                self.ledger[h].retain(|&(s, _)| s != sem);
            }
        }
    }
}

#[test]
fn run() {
    kestrel_port_std::init_test_log();
    let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
    hold::initialize_holders(lock.borrow_mut());

    let mut prng = Xorshift(0x6b8b_4567);
    let mut model = Model::default();

    for step in 0..NUM_OPS {
        let r = prng.next();
        let t = (r % NUM_TASKS as u32) as usize;
        let s = ((r >> 2) % NUM_SEMS as u32) as usize;

        match (r >> 4) % 8 {
            // Acquire a count
            0..=2 => {
                if model.waiting[t].is_none() {
                    set_running_task(lock.borrow_mut(), Some(&TASKS[t]));
                    sem::wait_acquired(lock.borrow_mut(), &SEMS[s]);
                    model.holds[s][t] += 1;
                }
            }

            // Block waiting for a count
            3..=4 => {
                if model.waiting[t].is_none() && !model.holds_anything(t) {
                    set_running_task(lock.borrow_mut(), Some(&TASKS[t]));
                    sem::wait_blocked(lock.borrow_mut(), &SEMS[s]);
                    model.waiting[t] = Some(s);
                    model.record_block(s, BASE_PRIORITIES[t]);
                }
            }

            // Post from task context
            5 => {
                let poster = (0..NUM_TASKS)
                    .map(|i| (t + i) % NUM_TASKS)
                    .find(|&p| model.holds[s][p] > 0);
                if let Some(poster) = poster {
                    let woken = model.strongest_waiter(s);

                    // A post that finds no waiters asserts that all holders
                    // are quiescent; skip it while any of them is boosted
                    let boosted_holder = (0..NUM_TASKS).any(|h| {
                        model.holds[s][h] > 0
                            && model.expected_priority(h) != BASE_PRIORITIES[h]
                    });
                    if woken.is_none() && boosted_holder {
                        continue;
                    }

                    set_running_task(lock.borrow_mut(), Some(&TASKS[poster]));
                    sem::post(lock.borrow_mut(), &SEMS[s], woken.map(|w| &TASKS[w]));

                    model.holds[s][poster] -= 1;
                    if woken.is_some() {
                        model.record_restore(s, Some(poster));
                    }
                    if let Some(w) = woken {
                        model.waiting[w] = None;
                        model.holds[s][w] += 1;
                    }
                }
            }

            // Post from interrupt context
            6 => {
                if let Some(woken) = model.strongest_waiter(s) {
                    set_running_task(lock.borrow_mut(), None);
                    <SystemTraits as PortInstance>::port_state().with_interrupt_context(|| {
                        sem::post(lock.borrow_mut(), &SEMS[s], Some(&TASKS[woken]));
                    });

                    model.record_restore(s, None);
                    model.waiting[woken] = None;
                    model.holds[s][woken] += 1;
                }
            }

            // Cancel a waiter
            _ => {
                let waiter = (0..NUM_TASKS)
                    .map(|i| (t + i) % NUM_TASKS)
                    .find(|&w| model.waiting[w] == Some(s));
                if let Some(waiter) = waiter {
                    sem::cancel(lock.borrow_mut(), &SEMS[s], &TASKS[waiter]);
                    model.record_restore(s, None);
                    model.waiting[waiter] = None;
                }
            }
        }

        // The engine must agree with the model after every step
        for task in 0..NUM_TASKS {
            assert_eq!(
                TASKS[task].effective_priority.get(&*lock),
                model.expected_priority(task),
                "effective priority of task {task} diverged at step {step}",
            );
            assert_eq!(
                TASKS[task].base_priority.get(&*lock),
                BASE_PRIORITIES[task],
                "base priority of task {task} changed at step {step}",
            );
        }

        let live_records = (0..NUM_SEMS)
            .flat_map(|s| (0..NUM_TASKS).map(move |t| (s, t)))
            .filter(|&(s, t)| model.holds[s][t] > 0)
            .count();
        assert_eq!(
            hold::num_free_holders(lock.borrow_mut()),
            8 - live_records,
            "holder record count diverged at step {step}",
        );
    }
}
