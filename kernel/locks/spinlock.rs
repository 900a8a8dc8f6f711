// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a spinlock that raises the interrupt priority and
//! panics if it appears to be deadlocked.

use crate::irql::{self, Irql};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use core::{fmt, hint};

/// Indicates the maximum number of attempts that can be made to
/// acquire a spinlock before a deadlock will be assumed and the
/// kernel will panic.
///
/// There is a fine balance here between a value so small
/// that deadlocks will be declared in safe code (resulting
/// in unnecessary and unwanted kernel panics) and a value
/// so large that there will be an unnecessary delay between
/// a deadlock occurring and being identified.
///
pub const MAX_LOCK_ATTEMPTS: usize = 500_000_000;

/// A spinlock providing mutually-exclusive access to data.
///
/// While the lock is held, the interrupt priority is raised to
/// [`Irql::Dispatch`], so the holder cannot be preempted and must
/// not block. The priority is restored when the guard drops.
///
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    file: UnsafeCell<&'static str>,
    line: UnsafeCell<u32>,
    data: UnsafeCell<T>,
}

/// The spinlock guard, which allows mutable access to the locked
/// data.
///
/// When the guard is dropped, the lock is released and the
/// interrupt priority restored.
///
pub struct SpinLockGuard<'lock, T: ?Sized + 'lock> {
    lock: &'lock AtomicBool,
    restore: Option<Irql>,
    data: &'lock mut T,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new spinlock, containing the given data.
    ///
    #[inline(always)]
    pub const fn new(data: T) -> Self {
        SpinLock {
            lock: AtomicBool::new(false),
            file: UnsafeCell::new("???"),
            line: UnsafeCell::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Returns whether the spinlock is currently locked.
    ///
    /// # Safety
    ///
    /// There is no synchronisation of the return value, so
    /// it can become incorrect immediately. This should
    /// only be used as a hint.
    ///
    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Attempts to acquire the spinlock without spinning or
    /// changing the interrupt priority.
    ///
    #[inline(always)]
    pub fn try_lock(&self) -> Option<SpinLockGuard<T>> {
        if self
            .lock
            .compare_exchange_weak(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: &self.lock,
                restore: None,
                data: unsafe { &mut *self.data.get() },
            })
        } else {
            None
        }
    }
}

/// Acquire the spinlock, raising the interrupt priority to
/// [`Dispatch`](Irql::Dispatch) and panicking with a deadlock if the
/// lock cannot be acquired after [`MAX_LOCK_ATTEMPTS`] attempts.
///
#[macro_export]
macro_rules! lock {
    ($lock:expr) => {{
        let file = file!();
        let line = line!();
        $crate::_lock(&$lock, true, file, line)
    }};
}

/// Acquire the spinlock without touching the interrupt priority.
///
/// This is for thread-inert contexts: early boot, and code that
/// manages the priority state itself.
///
#[macro_export]
macro_rules! lock_inert {
    ($lock:expr) => {{
        let file = file!();
        let line = line!();
        $crate::_lock(&$lock, false, file, line)
    }};
}

/// Acquire the spinlock, returning a guard, which will release
/// it once dropped.
///
#[doc(hidden)]
pub fn _lock<'lock, T: ?Sized>(
    lock: &'lock SpinLock<T>,
    raise: bool,
    file: &'static str,
    line: u32,
) -> SpinLockGuard<'lock, T> {
    // Raise the priority before contending for the
    // lock, so that we cannot be preempted while
    // another CPU is waiting on us.
    let restore = if raise && irql::current() < Irql::Dispatch {
        Some(irql::raise(Irql::Dispatch))
    } else {
        None
    };

    let mut counter = 0_usize;
    while lock
        .lock
        .compare_exchange_weak(false, true, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        while lock.is_locked() {
            counter += 1;
            if counter > MAX_LOCK_ATTEMPTS {
                let lock_file = unsafe { *lock.file.get() };
                let lock_line = unsafe { *lock.line.get() };
                panic!(
                    "DEADLOCK: failed to lock at {}:{}, after lock was taken at {}:{}",
                    file, line, lock_file, lock_line
                );
            }

            hint::spin_loop();
        }
    }

    // Now that we've acquired the lock, we store
    // the file:line where it was taken.
    unsafe {
        *lock.file.get() = file;
        *lock.line.get() = line;
    }

    SpinLockGuard {
        lock: &lock.lock,
        restore,
        data: unsafe { &mut *lock.data.get() },
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "SpinLock {{ data: ")
                .and_then(|()| (*guard).fmt(f))
                .and_then(|()| write!(f, "}}")),
            None => write!(f, "SpinLock {{ <locked> }}"),
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<'lock, T: ?Sized + fmt::Debug> fmt::Debug for SpinLockGuard<'lock, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'lock, T: ?Sized> Deref for SpinLockGuard<'lock, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'lock, T: ?Sized> DerefMut for SpinLockGuard<'lock, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'lock, T: ?Sized> Drop for SpinLockGuard<'lock, T> {
    fn drop(&mut self) {
        self.lock.store(false, Ordering::SeqCst);
        if let Some(old) = self.restore {
            irql::lower(old);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn test_mutual_exclusion() {
        let counter = Arc::new(SpinLock::new(0_usize));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock!(counter) += 1;
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*lock!(counter), 40_000);
    }

    #[test]
    fn test_lock_variants() {
        // The priority level is process-global in the test
        // binary, so we only check that both variants take
        // and release the lock correctly.
        let lock = SpinLock::new(1_u8);
        {
            let guard = lock!(lock);
            assert_eq!(*guard, 1);
        }
        assert!(!lock.is_locked());

        let lock = SpinLock::new(2_u8);
        let guard = lock_inert!(lock);
        assert_eq!(*guard, 2);
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock() {
        let lock = SpinLock::new(5_u8);
        let guard = lock.try_lock().unwrap();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
