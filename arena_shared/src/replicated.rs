//! Replicated variables.
//!
//! A [`Replicated`] holds the canonical copy of a value on the server together
//! with an explicit [`FieldPolicy`]. Every mutation attempt goes through
//! [`Replicated::write`], which checks the policy against the verified
//! principal. Successful writes notify every subscriber with `(old, new)`,
//! even when the value did not change, and mark the field dirty so the server
//! republishes it on its next flush.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::{SessionError, SessionResult},
    net::ClientId,
    scope::{Principal, Scope},
};

/// Read/write policy of a replicated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPolicy {
    pub read: Scope,
    pub write: Scope,
}

impl FieldPolicy {
    /// Readable by everyone, writable only by the server.
    pub const SERVER_WRITE: FieldPolicy = FieldPolicy {
        read: Scope::Everyone,
        write: Scope::Server,
    };

    /// Readable by everyone, writable only by the owning client.
    pub const OWNER_WRITE: FieldPolicy = FieldPolicy {
        read: Scope::Everyone,
        write: Scope::Owner,
    };
}

/// Handle returned by [`Replicated::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = Box<dyn FnMut(&T, &T) + Send + Sync>;

/// A value with a permission policy and change notification.
pub struct Replicated<T> {
    value: T,
    policy: FieldPolicy,
    owner: Option<ClientId>,
    listeners: Vec<(SubscriptionId, Listener<T>)>,
    next_subscription: u64,
    dirty: bool,
}

impl<T: Clone> Replicated<T> {
    pub fn new(value: T, policy: FieldPolicy, owner: Option<ClientId>) -> Self {
        Self {
            value,
            policy,
            owner,
            listeners: Vec::new(),
            next_subscription: 0,
            dirty: false,
        }
    }

    /// Returns the cached value.
    pub fn read(&self) -> &T {
        &self.value
    }

    pub fn owner(&self) -> Option<ClientId> {
        self.owner
    }

    /// Whether `observer` may receive this field.
    pub fn can_read(&self, observer: Principal) -> bool {
        self.policy.read.permits(observer, self.owner)
    }

    /// Writes a new value on behalf of `principal`.
    pub fn write(&mut self, new_value: T, principal: Principal) -> SessionResult<()> {
        if !self.policy.write.permits(principal, self.owner) {
            return Err(SessionError::PermissionDenied);
        }

        let old = std::mem::replace(&mut self.value, new_value);
        for (_, listener) in self.listeners.iter_mut() {
            listener(&old, &self.value);
        }
        self.dirty = true;
        Ok(())
    }

    /// Registers a change listener.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&T, &T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Takes the pending replication, if any. Clears the dirty flag.
    pub fn take_dirty(&mut self) -> Option<T> {
        if std::mem::take(&mut self.dirty) {
            Some(self.value.clone())
        } else {
            None
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Replicated<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicated")
            .field("value", &self.value)
            .field("policy", &self.policy)
            .field("owner", &self.owner)
            .field("listeners", &self.listeners.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn server_field_rejects_client_write() {
        let mut ready = Replicated::new(false, FieldPolicy::SERVER_WRITE, Some(ClientId(1)));

        let err = ready.write(true, Principal::Client(ClientId(1)));
        assert_eq!(err, Err(SessionError::PermissionDenied));
        assert!(!*ready.read());
        assert!(!ready.is_dirty());

        ready.write(true, Principal::Server).unwrap();
        assert!(*ready.read());
        assert_eq!(ready.take_dirty(), Some(true));
        assert_eq!(ready.take_dirty(), None);
    }

    #[test]
    fn owner_field_accepts_only_owner() {
        let mut appearance = Replicated::new(0, FieldPolicy::OWNER_WRITE, Some(ClientId(2)));

        assert_eq!(
            appearance.write(5, Principal::Client(ClientId(7))),
            Err(SessionError::PermissionDenied)
        );
        assert_eq!(appearance.write(5, Principal::Server), Err(SessionError::PermissionDenied));

        appearance.write(1, Principal::Client(ClientId(2))).unwrap();
        appearance.write(3, Principal::Client(ClientId(2))).unwrap();

        // Any other principal reads the last authorized value.
        assert!(appearance.can_read(Principal::Client(ClientId(7))));
        assert_eq!(*appearance.read(), 3);
    }

    #[test]
    fn listeners_fire_even_when_value_unchanged() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut health = Replicated::new(100, FieldPolicy::SERVER_WRITE, None);

        let sink = Arc::clone(&seen);
        health.subscribe(move |old, new| sink.lock().unwrap().push((*old, *new)));

        health.write(100, Principal::Server).unwrap();
        health.write(90, Principal::Server).unwrap();
        let _ = health.write(0, Principal::Client(ClientId(0)));

        assert_eq!(*seen.lock().unwrap(), vec![(100, 100), (100, 90)]);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let count = Arc::new(Mutex::new(0));
        let mut ready = Replicated::new(false, FieldPolicy::SERVER_WRITE, None);

        let sink = Arc::clone(&count);
        let id = ready.subscribe(move |_, _| *sink.lock().unwrap() += 1);
        ready.write(true, Principal::Server).unwrap();

        assert!(ready.unsubscribe(id));
        assert!(!ready.unsubscribe(id));
        ready.write(false, Principal::Server).unwrap();

        assert_eq!(*count.lock().unwrap(), 1);
    }
}
