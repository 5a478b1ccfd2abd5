//! Kernel state locking mechanism
//!
//! Every mutable piece of kernel state lives in a [`CpuLockCell`], which can
//! only be accessed by presenting a [`CpuLockToken`]. There is at most one
//! such token at any point in time, and it can only be obtained by entering
//! a CPU Lock state. A function that takes [`CpuLockTokenRefMut`] is thereby
//! statically known to run inside the caller's critical section.
use core::{fmt, marker::PhantomData, ops};

use crate::{error::BadContextError, utils::Init, PortThreading};

/// The key that "unlocks" [`CpuLockCell`].
#[non_exhaustive]
pub struct CpuLockToken<Traits> {
    _phantom: PhantomData<fn() -> Traits>,
}

/// The keyhole type for [`tokenlock::TokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub struct CpuLockKeyhole<Traits> {
    _phantom: PhantomData<fn() -> Traits>,
}

impl<Traits> Clone for CpuLockKeyhole<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits> Copy for CpuLockKeyhole<Traits> {}

impl<Traits> fmt::Debug for CpuLockKeyhole<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CpuLockKeyhole").finish()
    }
}

impl<Traits> Init for CpuLockKeyhole<Traits> {
    const INIT: Self = Self {
        _phantom: PhantomData,
    };
}

// This is safe because `CpuLockToken` can only be borrowed from
// `CpuLockGuard`, and there is only one instance of `CpuLockGuard` at any
// point in time
unsafe impl<Traits> tokenlock::Token<CpuLockKeyhole<Traits>> for CpuLockToken<Traits> {
    fn eq_id(&self, _: &CpuLockKeyhole<Traits>) -> bool {
        true
    }
}

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub struct CpuLockCell<Traits, T: ?Sized>(tokenlock::TokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub const fn new(x: T) -> Self {
        Self(tokenlock::TokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // `CpuLockCell` needs to acquire CPU Lock when doing debug formatting
        // and fails to do so if CPU Lock is already active. Nested
        // `CpuLockCell`s won't be printed for this reason.
        if let Ok(lock) = lock_cpu::<Traits>() {
            f.debug_tuple("CpuLockCell").field(self.0.read(&*lock)).finish()
        } else {
            write!(f, "CpuLockCell(< locked >)")
        }
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self(Init::INIT);
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = tokenlock::TokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for CpuLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Attempt to enter a CPU Lock state and get an RAII guard.
/// Return `BadContext` if the kernel is already in a CPU Lock state.
pub fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    // Safety: `try_enter_cpu_lock` is only meant to be called by the kernel
    if unsafe { Traits::try_enter_cpu_lock() } {
        // Safety: We just entered a CPU Lock state. This also means there are
        //         no instances of `CpuLockGuard` existing at this point.
        Ok(unsafe { assume_cpu_lock() })
    } else {
        Err(BadContextError::BadContext)
    }
}

/// Assume a CPU Lock state and get `CpuLockGuard`.
///
/// # Safety
///
/// The system must be really in a CPU Lock state. There must be no instances
/// of `CpuLockGuard` existing at the point of the call.
pub unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        token: CpuLockToken {
            _phantom: PhantomData,
        },
    }
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        CpuLockTokenRefMut {
            token: &mut self.token,
        }
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is currently active, and it's us (the kernel) who
        // are currently controlling the CPU Lock state
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed version of [`CpuLockGuard`]. This is equivalent to
/// `&'a mut CpuLockGuard` but does not own the responsibility of releasing
/// CPU Lock.
///
/// When you pass `&'a mut _` to a function, the compiler automatically
/// reborrows it so that the original `&'a mut _` remains accessible after
/// the function call. This does not happen with `CpuLockTokenRefMut`. You
/// have to call [`borrow_mut`] manually.
///
/// [`borrow_mut`]: CpuLockTokenRefMut::borrow_mut
pub struct CpuLockTokenRefMut<'a, Traits: PortThreading> {
    token: &'a mut CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockTokenRefMut<'_, Traits> {
    /// Construct a `CpuLockTokenRefMut` by reborrowing `self`.
    pub fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        CpuLockTokenRefMut {
            token: &mut *self.token,
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockTokenRefMut<'_, Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockTokenRefMut<'_, Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.token
    }
}
