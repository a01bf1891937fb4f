//! Subscription registry for the RPC channel.
//!
//! Subscriptions are keyed by a caller-chosen subscribe key; the registry
//! guarantees at most one live subscribe id per key, so subscribing twice
//! with the same key is idempotent. Entries keep their method and params so
//! the channel can replay them after a reconnect.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

/// A registered subscription.
#[derive(Debug, Clone)]
pub struct Subscription<C> {
    /// Id the server tags notices with.
    pub id: u64,
    /// Caller-chosen key.
    pub key: String,
    /// Method the subscription was made with.
    pub method: String,
    /// Caller params (unwrapped).
    pub params: Value,
    /// Notice handler.
    pub callback: C,
    /// Whether the server acknowledged the subscribe call.
    pub acknowledged: bool,
}

/// Outcome of [`SubscriptionRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new entry was created; the subscribe call must be sent.
    New(u64),
    /// The key was already registered; nothing needs to be sent.
    Existing(u64),
}

impl Registration {
    /// The subscribe id, new or reused.
    pub fn id(self) -> u64 {
        match self {
            Registration::New(id) | Registration::Existing(id) => id,
        }
    }

    /// Whether the entry was just created.
    pub fn is_new(self) -> bool {
        matches!(self, Registration::New(_))
    }
}

/// Live subscriptions, indexed by id and by key.
#[derive(Debug)]
pub struct SubscriptionRegistry<C> {
    next_id: u64,
    by_id: BTreeMap<u64, Subscription<C>>,
    keys: HashMap<String, u64>,
}

impl<C> SubscriptionRegistry<C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            by_id: BTreeMap::new(),
            keys: HashMap::new(),
        }
    }

    /// Register a subscription, or return the id already bound to `key`.
    ///
    /// On [`Registration::Existing`] the stored callback is kept and the
    /// given one is discarded.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        method: impl Into<String>,
        params: Value,
        callback: C,
    ) -> Registration {
        let key = key.into();
        if let Some(&id) = self.keys.get(&key) {
            return Registration::Existing(id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.keys.insert(key.clone(), id);
        self.by_id.insert(
            id,
            Subscription {
                id,
                key,
                method: method.into(),
                params,
                callback,
                acknowledged: false,
            },
        );
        Registration::New(id)
    }

    /// Mark a subscription as acknowledged by the server.
    pub fn acknowledge(&mut self, id: u64) -> bool {
        match self.by_id.get_mut(&id) {
            Some(sub) => {
                sub.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Mark every subscription unacknowledged (connection lost).
    pub fn reset_acknowledgements(&mut self) {
        for sub in self.by_id.values_mut() {
            sub.acknowledged = false;
        }
    }

    /// Look up by subscribe key.
    pub fn by_key(&self, key: &str) -> Option<&Subscription<C>> {
        self.keys.get(key).and_then(|id| self.by_id.get(id))
    }

    /// Look up by subscribe id.
    pub fn by_id(&self, id: u64) -> Option<&Subscription<C>> {
        self.by_id.get(&id)
    }

    /// Remove by subscribe key.
    pub fn remove_by_key(&mut self, key: &str) -> Option<Subscription<C>> {
        let id = self.keys.remove(key)?;
        self.by_id.remove(&id)
    }

    /// Remove by subscribe id.
    pub fn remove(&mut self, id: u64) -> Option<Subscription<C>> {
        let sub = self.by_id.remove(&id)?;
        self.keys.remove(&sub.key);
        Some(sub)
    }

    /// All subscriptions in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription<C>> {
        self.by_id.values()
    }

    /// Subscriptions the server has not acknowledged.
    pub fn unacknowledged(&self) -> impl Iterator<Item = &Subscription<C>> {
        self.by_id.values().filter(|s| !s.acknowledged)
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Check if there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl<C> Default for SubscriptionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
