use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn read_guard<'a, T>(
    lock: &'a RwLock<T>,
    component: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                component,
                lock_kind = "rwlock.read",
                "recovered from poisoned sync-layer lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn write_guard<'a, T>(
    lock: &'a RwLock<T>,
    component: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                component,
                lock_kind = "rwlock.write",
                "recovered from poisoned sync-layer lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn lock_guard<'a, T>(
    lock: &'a Mutex<T>,
    component: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                component,
                lock_kind = "mutex.lock",
                "recovered from poisoned sync-layer lock"
            );
            poisoned.into_inner()
        }
    }
}
