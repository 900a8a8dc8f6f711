// Copyright 2024 The Lumen Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a sleepable mutual-exclusion lock.
//!
//! Unlike a [`SpinLock`](crate::SpinLock), a [`Mutex`] may be held
//! across operations that block, such as driver calls. Acquisition
//! spins briefly at raised priority in the hope of a quick handover,
//! then parks the calling thread on a [`WaitObject`] until the
//! holder releases.
//!
//! The lock records its owner. Acquiring a mutex the calling thread
//! already holds fails with [`LockError::RecursiveLock`]; releasing
//! a mutex held by another thread fails with [`LockError::NotOwner`].

use crate::irql::{self, Irql};
use crate::wait::WaitObject;
use crate::{current_thread, LockError};
use core::cell::UnsafeCell;
use core::fmt;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// The number of acquisition attempts made before the calling
/// thread gives up spinning and parks on the wait object.
///
const MAX_SPIN_ACQUIRE: usize = 100_000;

/// The owner value recording that no thread holds the mutex.
///
const NO_OWNER: u64 = u64::MAX;

/// A sleepable lock without a data payload.
///
/// This is the core of [`Mutex`]; it is also usable directly when
/// the protected state cannot be expressed as a single owned value.
///
pub struct RawMutex {
    lock: AtomicBool,
    owner: AtomicU64,
    waiting: WaitObject,
}

impl RawMutex {
    /// Returns a new, unheld mutex.
    ///
    pub const fn new() -> Self {
        RawMutex {
            lock: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
            waiting: WaitObject::new(),
        }
    }

    /// Returns whether the mutex is currently held.
    ///
    /// The value is advisory; it can become incorrect
    /// immediately.
    ///
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Attempts to take the lock flag.
    ///
    fn try_take(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Acquires the mutex, blocking until it is available.
    ///
    /// Fails with [`LockError::RecursiveLock`] if the calling
    /// thread already holds it.
    ///
    pub fn acquire(&self) -> Result<(), LockError> {
        let me = current_thread().as_u64();
        if self.owner.load(Ordering::Acquire) == me {
            return Err(LockError::RecursiveLock);
        }

        // Spin for a bit at raised priority, hoping for
        // a quick handover.
        let restore = if irql::current() < Irql::Dispatch {
            Some(irql::raise(Irql::Dispatch))
        } else {
            None
        };

        let mut acquired = false;
        for _ in 0..MAX_SPIN_ACQUIRE {
            if self.try_take() {
                acquired = true;
                break;
            }

            hint::spin_loop();
        }

        if let Some(old) = restore {
            irql::lower(old);
        }

        // Park until the holder releases. Every release
        // signals one waiter, so this cannot be missed.
        while !acquired {
            self.waiting.wait();
            acquired = self.try_take();
        }

        self.owner.store(me, Ordering::Release);
        Ok(())
    }

    /// Acquires the mutex only if it can be taken without
    /// waiting.
    ///
    pub fn try_acquire(&self) -> bool {
        if self.owner.load(Ordering::Acquire) == current_thread().as_u64() {
            return false;
        }

        if self.try_take() {
            self.owner
                .store(current_thread().as_u64(), Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Releases the mutex.
    ///
    /// Only the owner may release; any other thread gets
    /// [`LockError::NotOwner`]. Releasing an unheld mutex
    /// is a no-op.
    ///
    pub fn release(&self) -> Result<(), LockError> {
        if !self.lock.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.owner.load(Ordering::Acquire) != current_thread().as_u64() {
            return Err(LockError::NotOwner);
        }

        self.force_release();
        Ok(())
    }

    /// Releases the mutex regardless of which thread holds
    /// it.
    ///
    /// This exists for guard teardown and for recovering a
    /// lock whose holder has been destroyed; normal code
    /// paths use [`release`](Self::release).
    ///
    pub fn force_release(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
        self.lock.store(false, Ordering::SeqCst);
        self.waiting.signal_one();
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// A sleepable lock providing mutually-exclusive access to data.
///
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

/// The mutex guard, which allows mutable access to the locked
/// data.
///
/// When the guard is dropped, the mutex is released and one
/// waiting thread is woken.
///
pub struct MutexGuard<'lock, T: ?Sized + 'lock> {
    raw: &'lock RawMutex,
    data: &'lock mut T,
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create a new mutex, containing the given data.
    ///
    pub const fn new(data: T) -> Self {
        Mutex {
            raw: RawMutex::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, blocking until it is available.
    ///
    /// Fails with [`LockError::RecursiveLock`] if the calling
    /// thread already holds it.
    ///
    pub fn lock(&self) -> Result<MutexGuard<T>, LockError> {
        self.raw.acquire()?;
        Ok(MutexGuard {
            raw: &self.raw,
            data: unsafe { &mut *self.data.get() },
        })
    }

    /// Acquires the mutex only if it can be taken without
    /// waiting.
    ///
    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        if self.raw.try_acquire() {
            Some(MutexGuard {
                raw: &self.raw,
                data: unsafe { &mut *self.data.get() },
            })
        } else {
            None
        }
    }

    /// Returns whether the mutex is currently held.
    ///
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "Mutex {{ data: ")
                .and_then(|()| (*guard).fmt(f))
                .and_then(|()| write!(f, "}}")),
            None => write!(f, "Mutex {{ <locked> }}"),
        }
    }
}

impl<'lock, T: ?Sized> Deref for MutexGuard<'lock, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.data
    }
}

impl<'lock, T: ?Sized> DerefMut for MutexGuard<'lock, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.data
    }
}

impl<'lock, T: ?Sized> Drop for MutexGuard<'lock, T> {
    fn drop(&mut self) {
        // The guard proves the lock was acquired by this
        // chain of execution, so no owner check is needed.
        self.raw.force_release();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::identity::with_identity;
    use crate::ThreadId;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn test_recursive_acquire() {
        let mutex = RawMutex::new();
        mutex.acquire().unwrap();
        assert_eq!(mutex.acquire(), Err(LockError::RecursiveLock));
        mutex.release().unwrap();

        // Releasing an unheld mutex is a no-op.
        assert_eq!(mutex.release(), Ok(()));
    }

    #[test]
    fn test_release_authorisation() {
        let mutex = RawMutex::new();

        // Acquire as thread 7, then try to release as
        // thread 8. Only the owner may release.
        with_identity(ThreadId::new(7), || mutex.acquire()).unwrap();
        assert_eq!(
            with_identity(ThreadId::new(8), || mutex.release()),
            Err(LockError::NotOwner)
        );
        assert_eq!(
            with_identity(ThreadId::new(7), || mutex.release()),
            Ok(())
        );
    }

    #[test]
    fn test_guarded_data() {
        let mutex = Mutex::new(41_usize);
        {
            let mut guard = mutex.lock().unwrap();
            *guard += 1;
        }

        assert_eq!(*mutex.lock().unwrap(), 42);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_contended() {
        let counter = Arc::new(Mutex::new(0_usize));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    let mut guard = counter.lock().unwrap();
                    *guard += 1;
                    drop(guard);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock().unwrap(), 4_000);
    }
}
