//! Lock Poisoning Recovery Utilities
//!
//! The origin counter, the log buffer, the in-memory rate limit windows and
//! the memory export sink are `std::sync::Mutex`es shared between request
//! handlers and the periodic tasks. Every acquisition goes through
//! `lock_or_recover`, which logs a poisoning event on the `critical` target
//! and keeps using the data. Each protected structure stays valid after a
//! partial update.

use std::sync::{Mutex, MutexGuard};
use tracing::error;

/// Acquire a Mutex lock, recovering from poisoning if necessary.
///
/// # Arguments
/// * `mutex` - The Mutex to lock
/// * `context` - A description of what the lock protects (for logging)
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                target: "critical",
                "Mutex poisoned for '{}' - recovering with current data",
                context
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_or_recover_normal_operation() {
        let mutex = Mutex::new(vec![1, 2, 3]);
        let guard = lock_or_recover(&mutex, "test buffer");
        assert_eq!(guard.len(), 3);
    }

    #[test]
    fn test_mutex_poisoning_recovery() {
        let mutex = Arc::new(Mutex::new(42));
        let mutex_clone = Arc::clone(&mutex);

        // Poison the lock from another thread
        let handle = thread::spawn(move || {
            let _guard = mutex_clone.lock().unwrap();
            panic!("Intentional panic to poison the lock");
        });
        let _ = handle.join();

        assert!(mutex.is_poisoned());
        let guard = lock_or_recover(&mutex, "poisoned test");
        assert_eq!(*guard, 42);
    }
}
