//! Holder record storage (internal use only).
//!
//! Two interchangeable layouts are provided. [`FreelistTable`] threads a
//! fixed number of statically allocated records through a process-wide free
//! list. [`InlineTable`] embeds two records in every `SemaphoreCb`, which
//! covers the common case of a semaphore used as a mutex without any global
//! state. Neither performs dynamic allocation.
use core::{fmt, marker::PhantomData, ptr};

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    semaphore::SemaphoreCb,
    task::TaskCb,
    utils::Init,
    KernelCfg1, KernelTraits,
};

/// A holder record, tracking one task's unmatched acquires on one semaphore.
pub struct HolderCb<Traits: KernelCfg1> {
    /// The holding task, or `None` if the record is free.
    ///
    /// This reference is used only as a look-up key. The task may have
    /// exited, in which case the record is stranded and will be reclaimed
    /// the next time the boost or restore path stumbles upon it.
    pub(super) task: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// The number of counts this task acquired on this semaphore and has not
    /// yet released.
    pub(super) counts: CpuLockCell<Traits, u16>,

    /// The next record in the containing list. A record is on its
    /// semaphore's holder list while occupied and on the global free list
    /// while free. Unused by [`InlineTable`].
    pub(super) next: CpuLockCell<Traits, Option<&'static HolderCb<Traits>>>,
}

impl<Traits: KernelCfg1> Init for HolderCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        task: Init::INIT,
        counts: Init::INIT,
        next: Init::INIT,
    };
}

impl<Traits: KernelTraits> HolderCb<Traits> {
    #[inline]
    pub(super) fn holds_task(&self, lock: CpuLockTokenRefMut<'_, Traits>, task: &TaskCb<Traits>) -> bool {
        self.task
            .get(&*lock)
            .is_some_and(|htcb| ptr::eq(htcb, task))
    }
}

impl<Traits: KernelTraits> fmt::Debug for HolderCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = klock::lock_cpu::<Traits>() {
            f.debug_struct("HolderCb")
                .field("self", &(self as *const _))
                .field("task", &self.task.get(&*lock).map(|t| t as *const TaskCb<Traits>))
                .field("counts", &self.counts.get(&*lock))
                .field("next", &self.next.get(&*lock).map(|h| h as *const HolderCb<Traits>))
                .finish()
        } else {
            f.write_str("HolderCb { < locked > }")
        }
    }
}

/// Storage and look-up strategy for the holder records of a semaphore.
///
/// This trait is not intended to be implemented on custom types.
pub trait HolderTable<Traits>: Send + Sync + Init + fmt::Debug + 'static + private::Sealed {
    /// The per-semaphore portion of the storage, embedded in `SemaphoreCb`.
    type PerSemaphoreData: Send + Sync + Init + fmt::Debug + 'static;

    /// `true` if holder records are embedded in each `SemaphoreCb` rather
    /// than drawn from a shared pool. Slots are scarce in that
    /// configuration, and the restore path frees the poster's exhausted
    /// record early to keep one available across a preemption window.
    const INLINE: bool;

    /// Prepare the shared storage. Called once during kernel bring-up.
    fn initialize(&'static self, lock: CpuLockTokenRefMut<'_, Traits>)
    where
        Traits: KernelTraits;

    /// Find the record registering `task` as a holder of `sem`.
    fn find(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        task: &'static TaskCb<Traits>,
    ) -> Option<&'static HolderCb<Traits>>
    where
        Traits: KernelTraits;

    /// Allocate a fresh record for `sem` with zero counts and an unassigned
    /// task. Returns `None`, after logging, if the storage is exhausted; the
    /// caller then simply proceeds without inheritance for this holder.
    fn allocate(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
    ) -> Option<&'static HolderCb<Traits>>
    where
        Traits: KernelTraits;

    /// Clear `holder` and make it available for reuse.
    fn free(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        holder: &'static HolderCb<Traits>,
    ) where
        Traits: KernelTraits;

    /// Call `f` for every occupied record of `sem` until it returns `true`.
    /// Returns whether `f` requested the early exit.
    ///
    /// The successor of the current record is read before `f` runs, so `f`
    /// may [`free`](Self::free) the record it is given.
    fn for_each(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        f: impl FnMut(CpuLockTokenRefMut<'_, Traits>, &'static HolderCb<Traits>) -> bool,
    ) -> bool
    where
        Traits: KernelTraits;

    /// Reclaim every record of `sem`, occupied or not. Task priorities are
    /// deliberately left alone; the semaphore is being destroyed and the
    /// liveness of the recorded tasks is unknown.
    fn destroy(&'static self, lock: CpuLockTokenRefMut<'_, Traits>, sem: &'static SemaphoreCb<Traits>)
    where
        Traits: KernelTraits;

    /// The number of records available for allocation, if the storage is
    /// shared. Always zero for [`InlineTable`].
    fn free_count(&'static self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize
    where
        Traits: KernelTraits;
}

/// Implements [the sealed trait pattern], which prevents [`HolderTable`]
/// against downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

/// The holder list head stored in each `SemaphoreCb` when [`FreelistTable`]
/// is selected.
pub struct HolderList<Traits: KernelCfg1> {
    pub(super) head: CpuLockCell<Traits, Option<&'static HolderCb<Traits>>>,
}

impl<Traits: KernelCfg1> Init for HolderList<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { head: Init::INIT };
}

impl<Traits: KernelTraits> fmt::Debug for HolderList<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(lock) = klock::lock_cpu::<Traits>() {
            f.debug_tuple("HolderList")
                .field(&self.head.get(&*lock).map(|h| h as *const HolderCb<Traits>))
                .finish()
        } else {
            f.write_str("HolderList(< locked >)")
        }
    }
}

/// The holder table implementation that draws records from a process-wide
/// pool of `LEN` statically allocated records threaded on a free list.
pub struct FreelistTable<Traits: KernelCfg1, const LEN: usize> {
    records: [HolderCb<Traits>; LEN],

    /// The head of the free list. Populated once by
    /// [`HolderTable::initialize`] and never torn down.
    free: CpuLockCell<Traits, Option<&'static HolderCb<Traits>>>,
}

impl<Traits: KernelCfg1, const LEN: usize> Init for FreelistTable<Traits, LEN> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        records: Init::INIT,
        free: Init::INIT,
    };
}

impl<Traits: KernelTraits, const LEN: usize> fmt::Debug for FreelistTable<Traits, LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FreelistTable")
            .field("records", &self.records)
            .finish()
    }
}

impl<Traits: KernelTraits, const LEN: usize> HolderTable<Traits> for FreelistTable<Traits, LEN>
where
    Traits: KernelCfg1<HolderTable = Self>,
{
    type PerSemaphoreData = HolderList<Traits>;

    const INLINE: bool = false;

    fn initialize(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let mut head = None;
        for record in self.records.iter().rev() {
            record.next.replace(&mut *lock, head);
            head = Some(record);
        }
        self.free.replace(&mut *lock, head);
    }

    fn find(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        task: &'static TaskCb<Traits>,
    ) -> Option<&'static HolderCb<Traits>> {
        let mut maybe_holder = sem.holders.head.get(&*lock);
        while let Some(holder) = maybe_holder {
            if holder.holds_task(lock.borrow_mut(), task) {
                return Some(holder);
            }
            maybe_holder = holder.next.get(&*lock);
        }
        None
    }

    fn allocate(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
    ) -> Option<&'static HolderCb<Traits>> {
        if let Some(holder) = self.free.get(&*lock) {
            // Move the record from the free list to the semaphore's holder
            // list
            let next_free = holder.next.get(&*lock);
            self.free.replace(&mut *lock, next_free);
            let head = sem.holders.head.get(&*lock);
            holder.next.replace(&mut *lock, head);
            sem.holders.head.replace(&mut *lock, Some(holder));

            holder.counts.replace(&mut *lock, 0);
            Some(holder)
        } else {
            log::error!("insufficient pre-allocated holder records");
            None
        }
    }

    fn free(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        holder: &'static HolderCb<Traits>,
    ) {
        holder.task.replace(&mut *lock, None);
        holder.counts.replace(&mut *lock, 0);

        // Unlink the record from the semaphore's holder list
        let mut prev: Option<&'static HolderCb<Traits>> = None;
        let mut curr = sem.holders.head.get(&*lock);
        while let Some(record) = curr {
            if ptr::eq(record, holder) {
                break;
            }
            prev = curr;
            curr = record.next.get(&*lock);
        }

        if curr.is_some() {
            let successor = holder.next.get(&*lock);
            match prev {
                Some(prev) => prev.next.replace(&mut *lock, successor),
                None => sem.holders.head.replace(&mut *lock, successor),
            };

            // And put it back on the free list
            let old_free = self.free.get(&*lock);
            holder.next.replace(&mut *lock, old_free);
            self.free.replace(&mut *lock, Some(holder));
        }
    }

    fn for_each(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        mut f: impl FnMut(CpuLockTokenRefMut<'_, Traits>, &'static HolderCb<Traits>) -> bool,
    ) -> bool {
        let mut maybe_holder = sem.holders.head.get(&*lock);
        while let Some(holder) = maybe_holder {
            // In case `f` frees this record
            let next = holder.next.get(&*lock);

            if holder.task.get(&*lock).is_some() && f(lock.borrow_mut(), holder) {
                return true;
            }

            maybe_holder = next;
        }
        false
    }

    fn destroy(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, sem: &'static SemaphoreCb<Traits>) {
        if let Some(head) = sem.holders.head.get(&*lock) {
            // There may be an issue if there are multiple holders of the
            // semaphore
            debug_assert!(
                head.next.get(&*lock).is_none(),
                "semaphore destroyed with more than one holder"
            );

            while let Some(holder) = sem.holders.head.get(&*lock) {
                self.free(lock.borrow_mut(), sem, holder);
            }
        }
    }

    fn free_count(&'static self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        let mut n = 0;
        let mut maybe_holder = self.free.get(&*lock);
        while let Some(holder) = maybe_holder {
            n += 1;
            maybe_holder = holder.next.get(&*lock);
        }
        n
    }
}

impl<Traits: KernelTraits, const LEN: usize> private::Sealed for FreelistTable<Traits, LEN> where
    Traits: KernelCfg1<HolderTable = Self>
{
}

/// The holder table implementation that embeds two record slots in every
/// `SemaphoreCb`. There is no shared state; on the other hand, a semaphore
/// acquired by more than two distinct tasks at once exceeds the storage, and
/// the surplus holders are simply never boosted.
pub struct InlineTable<Traits> {
    _phantom: PhantomData<fn() -> Traits>,
}

impl<Traits> Init for InlineTable<Traits> {
    const INIT: Self = Self {
        _phantom: PhantomData,
    };
}

impl<Traits> fmt::Debug for InlineTable<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InlineTable").finish()
    }
}

impl<Traits: KernelTraits> HolderTable<Traits> for InlineTable<Traits>
where
    Traits: KernelCfg1<HolderTable = Self>,
{
    type PerSemaphoreData = [HolderCb<Traits>; 2];

    const INLINE: bool = true;

    fn initialize(&'static self, _lock: CpuLockTokenRefMut<'_, Traits>) {}

    fn find(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        task: &'static TaskCb<Traits>,
    ) -> Option<&'static HolderCb<Traits>> {
        sem.holders
            .iter()
            .find(|holder| holder.holds_task(lock.borrow_mut(), task))
    }

    fn allocate(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
    ) -> Option<&'static HolderCb<Traits>> {
        for holder in sem.holders.iter() {
            if holder.task.get(&*lock).is_none() {
                holder.counts.replace(&mut *lock, 0);
                return Some(holder);
            }
        }

        log::error!("both hard-allocated holder records are in use");
        None
    }

    fn free(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        _sem: &'static SemaphoreCb<Traits>,
        holder: &'static HolderCb<Traits>,
    ) {
        holder.task.replace(&mut *lock, None);
        holder.counts.replace(&mut *lock, 0);
    }

    fn for_each(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        sem: &'static SemaphoreCb<Traits>,
        mut f: impl FnMut(CpuLockTokenRefMut<'_, Traits>, &'static HolderCb<Traits>) -> bool,
    ) -> bool {
        for holder in sem.holders.iter() {
            // The hard-allocated slots may be vacant
            if holder.task.get(&*lock).is_some() && f(lock.borrow_mut(), holder) {
                return true;
            }
        }
        false
    }

    fn destroy(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, sem: &'static SemaphoreCb<Traits>) {
        debug_assert!(
            sem.holders
                .iter()
                .filter(|holder| holder.task.get(&*lock).is_some())
                .count()
                <= 1,
            "semaphore destroyed with more than one holder"
        );

        for holder in sem.holders.iter() {
            holder.task.replace(&mut *lock, None);
            holder.counts.replace(&mut *lock, 0);
        }
    }

    fn free_count(&'static self, _lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        0
    }
}

impl<Traits: KernelTraits> private::Sealed for InlineTable<Traits> where
    Traits: KernelCfg1<HolderTable = Self>
{
}
