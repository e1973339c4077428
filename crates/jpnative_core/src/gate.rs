//! Per-key mutual exclusion.
//!
//! # Invariants
//! - At most one `GateGuard` exists per key at any time.
//! - Dropping a guard (including during unwinding) releases the key and wakes waiters.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Serializes work on equal keys while letting distinct keys proceed in parallel.
#[derive(Debug, Default)]
pub struct KeyedGate {
    held: Mutex<BTreeSet<String>>,
    released: Condvar,
}

impl KeyedGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is free, then holds it until the guard drops.
    pub fn enter(&self, key: &str) -> GateGuard<'_> {
        let mut held = self.lock();
        while held.contains(key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key.to_string());
        GateGuard {
            gate: self,
            key: key.to_string(),
        }
    }

    /// Blocks until no key is held.
    pub fn wait_until_idle(&self) {
        let mut held = self.lock();
        while !held.is_empty() {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Whether some caller currently holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        // The set stays consistent even if a holder panicked.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds one key of a `KeyedGate`.
#[derive(Debug)]
pub struct GateGuard<'g> {
    gate: &'g KeyedGate,
    key: String,
}

impl GateGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.lock().remove(&self.key);
        self.gate.released.notify_all();
    }
}
