//! Spinlock wrapper for sharing a [`timer::Wheel`] across threads.
//!
//! `timer` takes `&mut self` everywhere and does no locking of its own
//! (the core's concurrency model: a host that needs cross-thread use wraps
//! the wheel in its own mutex). This crate is that wrapper, generalized
//! from `modules/sync`'s `SpinNoIrqLock` — its `MutexSupport` trait split
//! between the lock itself and what happens around `lock()`/`unlock()` is
//! kept, but the `SpinNoIrq` variant's RISC-V `sstatus` interrupt masking
//! is dropped: this crate is not kernel-resident, so there is no interrupt
//! context to mask.
#![no_std]

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Low-level support for what happens around a lock/unlock, kept separate
/// from the spin loop itself so a host can plug in its own guard behavior
/// (interrupt masking, preemption counting, ...) without touching the spin
/// loop. Mirrors `modules/sync::mutex::MutexSupport`.
pub trait MutexSupport {
    type GuardData;
    fn before_lock() -> Self::GuardData;
    fn after_unlock(_: &mut Self::GuardData);
}

/// The plain spin variant: no guard behavior at all.
pub struct Spin;

impl MutexSupport for Spin {
    type GuardData = ();
    #[inline(always)]
    fn before_lock() -> Self::GuardData {}
    #[inline(always)]
    fn after_unlock(_: &mut Self::GuardData) {}
}

/// A spinlock wrapping `T`, parameterized over what happens around
/// lock/unlock via `S: MutexSupport`.
///
/// `SpinLock<T>` (with `S = Spin`) is the type a host reaches for to share
/// a `Wheel` across threads: `SpinLock::new(Wheel::new())`, then
/// `lock().start(timer)`/`lock().timeout(now)` from any thread.
pub struct SpinMutex<T, S: MutexSupport = Spin> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    _support: core::marker::PhantomData<S>,
}

unsafe impl<T: Send, S: MutexSupport> Sync for SpinMutex<T, S> {}
unsafe impl<T: Send, S: MutexSupport> Send for SpinMutex<T, S> {}

impl<T, S: MutexSupport> SpinMutex<T, S> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            _support: core::marker::PhantomData,
        }
    }

    /// Spins until the lock is acquired, running `S::before_lock`/
    /// `after_unlock` around the critical section.
    pub fn lock(&self) -> SpinMutexGuard<'_, T, S> {
        let mut guard_data = S::before_lock();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let _ = &mut guard_data;
        SpinMutexGuard {
            lock: self,
            guard_data,
        }
    }
}

pub struct SpinMutexGuard<'a, T, S: MutexSupport> {
    lock: &'a SpinMutex<T, S>,
    guard_data: S::GuardData,
}

impl<T, S: MutexSupport> Deref for SpinMutexGuard<'_, T, S> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, S: MutexSupport> DerefMut for SpinMutexGuard<'_, T, S> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, S: MutexSupport> Drop for SpinMutexGuard<'_, T, S> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        S::after_unlock(&mut self.guard_data);
    }
}

/// The ordinary spinlock a host reaches for. `SpinNoIrqLock` (the
/// interrupt-masking variant `modules/sync` ships) has no counterpart
/// here; see the module docs for why.
pub type SpinLock<T> = SpinMutex<T, Spin>;
