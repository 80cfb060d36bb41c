//! Auth collaborator: bearer sessions for a fixed set of configured users,
//! plus change notifications for anyone interested in sign-in/sign-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Authenticated user identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub uid: String,
    pub signed_in_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(Principal),
    SignedOut(Principal),
}

pub type AuthListener = Box<dyn Fn(&AuthEvent) + Send + Sync>;

type ListenerRegistry = Mutex<HashMap<u64, Arc<AuthListener>>>;

pub trait AuthProvider: Send + Sync {
    /// Principal bound to a bearer credential, if any.
    fn current_principal(&self, credential: Option<&str>) -> Option<Principal>;

    /// Register `listener` for auth changes until the returned handle is dropped.
    fn subscribe(&self, listener: AuthListener) -> Subscription;
}

/// Live registration of an auth listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut listeners) = registry.lock() {
                listeners.remove(&self.id);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("unknown user or wrong secret")]
    InvalidCredentials,
}

/// Session-token auth over users loaded from configuration.
pub struct SessionAuth {
    users: HashMap<String, Zeroizing<String>>,
    sessions: RwLock<HashMap<String, Principal>>,
    listeners: Arc<ListenerRegistry>,
    next_listener_id: AtomicU64,
}

impl SessionAuth {
    pub fn new(users: &[(String, String)]) -> Self {
        Self {
            users: users
                .iter()
                .map(|(uid, secret)| (uid.clone(), Zeroizing::new(secret.clone())))
                .collect(),
            sessions: RwLock::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Check `secret` for `uid` and open a new session, returning its bearer token.
    pub fn sign_in(&self, uid: &str, secret: &str) -> Result<(String, Principal), AuthError> {
        let known = self
            .users
            .get(uid)
            .map(|expected| bool::from(expected.as_bytes().ct_eq(secret.as_bytes())))
            .unwrap_or(false);
        if !known {
            tracing::warn!(uid, "Rejected sign-in");
            return Err(AuthError::InvalidCredentials);
        }

        let principal = Principal {
            uid: uid.to_string(),
            signed_in_at: Utc::now(),
        };
        let token = Uuid::new_v4().simple().to_string();

        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(token.clone(), principal.clone());
        }

        self.notify(&AuthEvent::SignedIn(principal.clone()));
        Ok((token, principal))
    }

    /// Close the session behind `token`. Returns whether one existed.
    pub fn sign_out(&self, token: &str) -> bool {
        let removed = match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(token),
            Err(_) => None,
        };

        match removed {
            Some(principal) => {
                self.notify(&AuthEvent::SignedOut(principal));
                true
            }
            None => false,
        }
    }

    fn notify(&self, event: &AuthEvent) {
        // Snapshot so listeners may subscribe or unsubscribe from inside a callback.
        let listeners: Vec<Arc<AuthListener>> = match self.listeners.lock() {
            Ok(listeners) => listeners.values().cloned().collect(),
            Err(_) => return,
        };

        for listener in listeners {
            (**listener)(event);
        }
    }
}

impl AuthProvider for SessionAuth {
    fn current_principal(&self, credential: Option<&str>) -> Option<Principal> {
        let token = credential?;
        let sessions = self.sessions.read().ok()?;
        sessions.get(token).cloned()
    }

    fn subscribe(&self, listener: AuthListener) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id, Arc::new(listener));
        }

        Subscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }
}
