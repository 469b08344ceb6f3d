//! Poison-tolerant lock acquisition for executor bookkeeping.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquires a mutex, recovering the inner value if a previous holder panicked.
///
/// Executor bookkeeping (lifecycle state, registries) stays consistent across
/// a panic because every critical section either completes its update or
/// leaves the previous value in place.
///
/// # Examples
///
/// ```ignore
/// use std::sync::Mutex;
/// use queuelite::executor::acquire_lock;
///
/// let mutex = Mutex::new(0);
/// *acquire_lock(&mutex) += 1;
/// ```
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("executor mutex was poisoned, recovering");
            metrics::counter!("executor_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Read access to an `RwLock` with poison recovery.
pub fn acquire_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::warn!("executor rwlock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Write access to an `RwLock` with poison recovery.
pub fn acquire_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::warn!("executor rwlock was poisoned, recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_lock_success() {
        let mutex = Mutex::new(42);
        let guard = acquire_lock(&mutex);
        assert_eq!(*guard, 42);
    }

    #[test]
    fn test_acquire_lock_concurrent() {
        let mutex = Arc::new(Mutex::new(0));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    *acquire_lock(&mutex) += 1;
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*acquire_lock(&mutex), 10);
    }

    #[test]
    fn test_acquire_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(7));
        let poisoner = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            std::panic::panic_any("poison the lock");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*acquire_lock(&mutex), 7);
    }

    #[test]
    fn test_rwlock_helpers() {
        let lock = RwLock::new(String::from("a"));
        acquire_write(&lock).push('b');
        assert_eq!(acquire_read(&lock).as_str(), "ab");
    }
}
