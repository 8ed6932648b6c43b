//! Keyed shared state with validation and change notification.
//!
//! One [`StateEntry`] per key for the lifetime of the server process,
//! created lazily and idempotently. Values are only mutated through
//! [`StateEntry::set`], which is the single path for both server-side writes
//! and client-originated `state:change` messages, so validators apply
//! uniformly. Broadcasting to subscribed WebSocket connections is the hub's
//! job; this store only tracks the subscriber sets.

use crate::hub::ConnectionId;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Accepts or rejects a proposed value.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Invoked synchronously after a successful set with `(new, old)`.
pub type ChangeHandler = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// Errors from state mutation.
#[derive(Debug, Error)]
pub enum StateError {
    /// The validator rejected the value; the stored value is unchanged.
    #[error("validator rejected value for key '{0}'")]
    Rejected(String),

    /// No entry exists for the key.
    #[error("unknown state key '{0}'")]
    UnknownKey(String),
}

/// A single shared-state key.
pub struct StateEntry {
    key: String,
    value: RwLock<Value>,
    validator: Option<Validator>,
    handlers: RwLock<Vec<ChangeHandler>>,
    subscribers: RwLock<HashSet<ConnectionId>>,
}

impl StateEntry {
    fn new(key: String, initial: Value, validator: Option<Validator>) -> Self {
        Self {
            key,
            value: RwLock::new(initial),
            validator,
            handlers: RwLock::new(Vec::new()),
            subscribers: RwLock::new(HashSet::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value (cloned).
    pub fn get(&self) -> Value {
        self.value.read().clone()
    }

    /// Store a new value.
    ///
    /// Returns `(old, new)` on success so the caller can broadcast. When the
    /// validator rejects, the stored value is untouched and no handlers run.
    pub fn set(&self, new: Value) -> Result<(Value, Value), StateError> {
        if let Some(validator) = &self.validator {
            if !validator(&new) {
                return Err(StateError::Rejected(self.key.clone()));
            }
        }

        let old = {
            let mut guard = self.value.write();
            std::mem::replace(&mut *guard, new.clone())
        };

        // Handlers run synchronously, outside the locks, so a handler may
        // read the entry or register further handlers.
        let handlers: Vec<ChangeHandler> = self.handlers.read().iter().cloned().collect();
        for handler in handlers {
            handler(&new, &old);
        }

        Ok((old, new))
    }

    /// Register a local change handler.
    pub fn on_change(&self, handler: ChangeHandler) {
        self.handlers.write().push(handler);
    }

    /// Add a connection to this key's subscriber set.
    pub fn subscribe(&self, id: ConnectionId) {
        self.subscribers.write().insert(id);
    }

    /// Remove a connection from this key's subscriber set.
    pub fn unsubscribe(&self, id: ConnectionId) {
        self.subscribers.write().remove(&id);
    }

    /// Snapshot of the current subscribers.
    pub fn subscribers(&self) -> Vec<ConnectionId> {
        self.subscribers.read().iter().copied().collect()
    }
}

/// All shared-state entries for one server instance.
#[derive(Default)]
pub struct SharedStateStore {
    entries: RwLock<HashMap<String, Arc<StateEntry>>>,
}

impl SharedStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for `key`.
    ///
    /// Idempotent: a second call with the same key returns the existing
    /// entry and does not reset its value or validator.
    pub fn create(
        &self,
        key: impl Into<String>,
        initial: Value,
        validator: Option<Validator>,
    ) -> Arc<StateEntry> {
        let key = key.into();
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(StateEntry::new(key, initial, validator))),
        )
    }

    /// Look up an existing entry.
    pub fn get(&self, key: &str) -> Option<Arc<StateEntry>> {
        self.entries.read().get(key).map(Arc::clone)
    }

    /// Remove a disconnected connection from every subscriber set.
    pub fn remove_connection(&self, id: ConnectionId) {
        for entry in self.entries.read().values() {
            entry.unsubscribe(id);
        }
    }
}
