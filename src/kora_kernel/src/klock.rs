//! CPU Lock: the kernel's single mutual-exclusion domain.
//!
//! Every mutable field of [`KernelState`] sits in a [`CpuLockCell`], an
//! [`UnsyncTokenLock`] keyed to one singleton token per port. The token
//! only comes into existence while all maskable interrupts are disabled,
//! so presenting it *is* the proof that the access happens inside a
//! critical section. Code that forgets to take the lock simply has nothing
//! to open the cells with.
//!
//! [`KernelState`]: crate::KernelState
use core::ops;
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, utils::Init, PortThreading};

pub(crate) struct CpuLockTag<Traits>(Traits);

/// The singleton token tied to a port's CPU Lock state.
pub(crate) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// Zero-sized key identifier stored in every [`CpuLockCell`].
pub(crate) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Reborrowed form of the token, handed down call chains instead of
/// `&mut CpuLockGuard` (it is zero-sized; a reference to the guard is
/// not). Reborrow again with `.borrow_mut()` before each call that
/// consumes one.
pub(crate) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// A kernel-state cell, openable only with the CPU Lock token.
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::new(), x))
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(T::INIT);
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for CpuLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Witness that the calling context holds CPU Lock. Dropping it releases
/// the lock, so a live guard always means "interrupts are masked".
///
/// The guard dereferences to [`CpuLockToken`]; `&*guard` and
/// `&mut *guard` open cells for reading and writing, and
/// `guard.borrow_mut()` produces the [`CpuLockTokenRefMut`] that internal
/// functions take.
pub(crate) struct CpuLockGuard<Traits: PortThreading>(CpuLockToken<Traits>);

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Take CPU Lock, failing with `BadContext` when it is already held
    /// (by the kernel or by application code that masked interrupts
    /// itself).
    pub(crate) fn acquire() -> Result<Self, BadContextError> {
        // Safety: entering CPU Lock is reserved to the kernel, which we are
        if unsafe { Traits::try_enter_cpu_lock() } {
            // Safety: the lock was free a moment ago, so no token exists
            Ok(unsafe { Self::assume() })
        } else {
            Err(BadContextError::BadContext)
        }
    }

    /// Materialize a guard for a CPU Lock state established elsewhere
    /// (an interrupt entry that runs with interrupts masked).
    ///
    /// # Safety
    ///
    /// CPU Lock must actually be active and no other guard or token for
    /// it may exist anywhere.
    pub(crate) unsafe fn assume() -> Self {
        debug_assert!(Traits::is_cpu_lock_active());
        // Safety: uniqueness is the caller's promise
        Self(unsafe { CpuLockToken::new_unchecked() })
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: a live guard implies the kernel owns the CPU Lock state
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
