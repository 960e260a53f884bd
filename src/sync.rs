//! Synchronisation failures are not recoverable: a poisoned mutex
//! means some thread panicked halfway through a critical section,
//! and the data it guards may be torn.  These helpers log and abort
//! instead of surfacing the poison as a `Result`.
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

#[cold]
fn poisoned(what: &str) -> ! {
    log::error!("{} is poisoned; aborting the process.", what);
    std::process::abort()
}

/// Acquires `mutex`, aborting the process if it is poisoned.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(_) => poisoned("mutex"),
    }
}

/// Blocks on `condvar`, aborting the process if the associated mutex
/// is poisoned on wake-up.
#[inline]
pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match condvar.wait(guard) {
        Ok(guard) => guard,
        Err(_) => poisoned("condition variable mutex"),
    }
}

#[test]
fn test_lock_and_wait() {
    use std::sync::Arc;

    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let other = pair.clone();

    let handle = std::thread::spawn(move || {
        let (flag, cond) = &*other;
        *lock(flag) = true;
        cond.notify_one();
    });

    let (flag, cond) = &*pair;
    let mut ready = lock(flag);
    while !*ready {
        ready = wait(cond, ready);
    }
    drop(ready);

    handle.join().expect("thread must not panic");
}
