use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

/// Mutual exclusion scoped to a string key.
///
/// Distinct keys never contend on each other's mutex; the arena mutex is only
/// held while looking up or reclaiming an entry, never while a key is locked.
/// Entries are reference counted and dropped once the last guard for a key
/// is released, so the arena only holds keys that are currently contended.
#[derive(Default)]
pub struct KeyLock {
    entries: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is free and take it.
    pub fn acquire(&self, key: &str) -> KeyGuard<'_> {
        let entry = self
            .entries
            .lock()
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = match entry.try_lock_arc() {
            Some(guard) => guard,
            None => {
                tracing::trace!(key, "waiting on contended key");
                entry.lock_arc()
            }
        };

        KeyGuard {
            owner: self,
            key: key.to_owned(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or waited on.
    pub fn active(&self) -> usize {
        self.entries.lock().len()
    }

    fn release(&self, key: &str) {
        let mut entries = self.entries.lock();
        // New references are only handed out under the arena mutex, so a count
        // of one here means nobody else holds or waits on this key.
        if entries
            .get(key)
            .map_or(false, |entry| Arc::strong_count(entry) == 1)
        {
            entries.remove(key);
        }
    }
}

/// Holds a key until dropped.
pub struct KeyGuard<'a> {
    owner: &'a KeyLock,
    key: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so the guard's reference is gone before reclaiming.
        self.guard.take();
        self.owner.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn entries_are_reclaimed() {
        let locks = KeyLock::new();

        {
            let a = locks.acquire("a");
            let _b = locks.acquire("b");
            assert_eq!(a.key(), "a");
            assert_eq!(locks.active(), 2);
        }

        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn distinct_keys_do_not_block() {
        let locks = Arc::new(KeyLock::new());
        let _held = locks.acquire("held");

        let (tx, rx) = mpsc::channel();
        let other = locks.clone();
        thread::spawn(move || {
            let _guard = other.acquire("free");
            tx.send(()).unwrap();
        });

        // Would time out if "free" waited on "held".
        rx.recv_timeout(Duration::from_secs(5))
            .expect("distinct key was blocked");
    }

    #[test]
    fn same_key_is_serialized() {
        let locks = Arc::new(KeyLock::new());
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let entered = entered.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = locks.acquire("shared");
                        assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                        entered.fetch_add(1, Ordering::SeqCst);
                        thread::yield_now();
                        inside.store(false, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(entered.load(Ordering::SeqCst), 400);
        assert_eq!(locks.active(), 0);
    }
}
