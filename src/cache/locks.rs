//! Per-key write locks.
//!
//! A key is held by at most one thread. The holder may lock it again (the
//! lock counts), anyone else fails straight away instead of waiting.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub(crate) struct KeyLockTable {
    held: Mutex<HashMap<String, (ThreadId, usize)>>,
}

impl KeyLockTable {
    pub(crate) fn try_lock(&self, key: &str) -> Option<KeyLockGuard<'_>> {
        let me = thread::current().id();
        let mut held = self.held.lock();
        match held.get_mut(key) {
            Some((owner, count)) if *owner == me => *count += 1,
            Some(_) => return None,
            None => {
                held.insert(key.to_string(), (me, 1));
            }
        }
        Some(KeyLockGuard {
            table: self,
            key: key.to_string(),
        })
    }

    pub(crate) fn is_locked(&self, key: &str) -> bool {
        self.held.lock().contains_key(key)
    }

    fn release(&self, key: &str) {
        let mut held = self.held.lock();
        if let Some((_, count)) = held.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                held.remove(key);
            }
        }
    }
}

/// Releases one level of a key lock on drop.
#[derive(Debug)]
pub struct KeyLockGuard<'a> {
    table: &'a KeyLockTable,
    key: String,
}

impl KeyLockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}
