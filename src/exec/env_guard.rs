use std::env;
use std::sync::{Mutex, MutexGuard};

/// Environment variables that control thread counts in numeric libraries.
pub const THREAD_VARS: [&str; 2] = ["OMP_NUM_THREADS", "MKL_NUM_THREADS"];

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Sets the thread-count variables for the lifetime of the guard, then restores
/// their previous values (or unsets them if they were unset).
///
/// Only one guard exists at a time; a second `set` blocks until the first guard drops.
/// Restoration happens in `Drop`, so it also runs when the guarded body panics.
pub struct ThreadEnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
    _lock: MutexGuard<'static, ()>,
}

impl ThreadEnvGuard {
    pub fn set(threads: usize) -> Self {
        // a panic inside a guarded body poisons the lock, but the env was still restored:
        let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let value = threads.to_string();
        let saved = THREAD_VARS
            .iter()
            .map(|&var| {
                let prev = env::var(var).ok();
                env::set_var(var, &value);
                (var, prev)
            })
            .collect();
        Self { saved, _lock: lock }
    }
}

impl Drop for ThreadEnvGuard {
    fn drop(&mut self) {
        for (var, prev) in &self.saved {
            match prev {
                Some(val) => env::set_var(var, val),
                None => env::remove_var(var),
            }
        }
    }
}
