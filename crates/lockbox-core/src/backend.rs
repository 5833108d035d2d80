use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::error::BackendError;

/// Synchronous string key/value persistence (browser-style local storage).
/// Implementations own the stored bytes; callers never get references into them.
pub trait RawBackend: Send + Sync {
    /// Read the raw string stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Persist a value under a key, overwriting any existing entry.
    fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Remove a key and its value (idempotent).
    fn remove(&self, key: &str) -> Result<(), BackendError>;

    /// List every key currently stored, in ascending order.
    fn keys(&self) -> Result<Vec<String>, BackendError>;
}

impl<B: RawBackend + ?Sized> RawBackend for Arc<B> {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        (**self).remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        (**self).keys()
    }
}

/// In-memory backend for tests and ephemeral sessions.
///
/// Supports an optional byte capacity (key + value lengths) to emulate a full
/// storage area, and per-key write failures to exercise rollback paths.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, String>,
    capacity: Option<usize>,
    /// Successful writes left per key before writes to it start failing.
    write_budgets: BTreeMap<String, usize>,
}

impl MemoryState {
    fn used_bytes(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that refuses writes once stored keys and values exceed `bytes`.
    pub fn with_capacity_bytes(bytes: usize) -> Self {
        let backend = Self::default();
        if let Ok(mut state) = backend.inner.lock() {
            state.capacity = Some(bytes);
        }
        backend
    }

    /// Make every subsequent write to `key` fail as unavailable.
    pub fn fail_writes_to(&self, key: impl Into<String>) {
        self.fail_writes_after(key, 0);
    }

    /// Let `allowed` more writes to `key` succeed, then fail every later one.
    pub fn fail_writes_after(&self, key: impl Into<String>, allowed: usize) {
        if let Ok(mut state) = self.inner.lock() {
            state.write_budgets.insert(key.into(), allowed);
        }
    }

    /// Undo [`MemoryBackend::fail_writes_to`] for every key.
    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.inner.lock() {
            state.write_budgets.clear();
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, BackendError> {
        self.inner.lock().map_err(|err| BackendError::Unavailable {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

impl RawBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.state()?.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut state = self.state()?;
        match state.write_budgets.get_mut(key) {
            Some(0) => {
                return Err(BackendError::Unavailable {
                    reason: format!("injected write failure for {key}"),
                })
            }
            Some(left) => *left -= 1,
            None => {}
        }

        if let Some(capacity) = state.capacity {
            let replaced = state.entries.get(key).map_or(0, |old| key.len() + old.len());
            let projected = state.used_bytes() - replaced + key.len() + value.len();
            if projected > capacity {
                return Err(BackendError::QuotaExceeded {
                    key: key.to_string(),
                });
            }
        }

        state.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.state()?.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.state()?.entries.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_round_trip() {
        let backend = MemoryBackend::new();
        backend.set("app-profiles", "{\"a\":1}").expect("set");
        assert_eq!(
            backend.get("app-profiles").expect("get").as_deref(),
            Some("{\"a\":1}")
        );

        backend.remove("app-profiles").expect("remove");
        backend.remove("app-profiles").expect("remove again");
        assert_eq!(backend.get("app-profiles").expect("get"), None);
    }

    #[test]
    fn capacity_rejects_oversized_writes_without_partial_state() {
        let backend = MemoryBackend::with_capacity_bytes(16);
        backend.set("k", "0123456789").expect("fits");

        let err = backend
            .set("k2", "0123456789")
            .expect_err("should exceed capacity");
        assert!(matches!(err, BackendError::QuotaExceeded { .. }));
        assert_eq!(backend.get("k2").expect("get"), None);

        // replacing an entry only counts the difference
        backend.set("k", "abcdefghijklmn").expect("replace fits");
    }

    #[test]
    fn write_budget_runs_out() {
        let backend = MemoryBackend::new();
        backend.fail_writes_after("k", 1);
        backend.set("k", "first").expect("within budget");
        assert!(backend.set("k", "second").is_err());
        assert_eq!(backend.get("k").expect("get").as_deref(), Some("first"));
    }

    #[test]
    fn injected_failures_only_hit_named_key() {
        let backend = MemoryBackend::new();
        backend.fail_writes_to("bad");
        assert!(backend.set("bad", "v").is_err());
        backend.set("good", "v").expect("other keys still work");

        backend.clear_failures();
        backend.set("bad", "v").expect("failure cleared");
        assert_eq!(backend.keys().expect("keys"), vec!["bad", "good"]);
    }
}
