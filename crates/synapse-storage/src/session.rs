//! Session key state tracking
//!
//! A session key lets the SDK sign on the payer's behalf until it expires.
//! The tracker is pull based: callers report the current time through
//! [`SessionKeyTracker::sync_state`] and listeners hear about transitions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Where a session key stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected { expires_at: DateTime<Utc> },
    Expired,
}

/// Handle returned by [`SessionKeyTracker::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type SessionListener = Arc<dyn Fn(&SessionState) + Send + Sync>;

/// State machine for one session key with its own listeners
pub struct SessionKeyTracker {
    state: Mutex<SessionState>,
    listeners: Mutex<BTreeMap<SubscriptionId, SessionListener>>,
    next_id: AtomicU64,
}

impl Default for SessionKeyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionKeyTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Disconnected),
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Whether the key can sign at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state(), SessionState::Connected { expires_at } if expires_at > now)
    }

    /// Record a key valid until `expires_at`
    pub fn connect(&self, expires_at: DateTime<Utc>) {
        info!(%expires_at, "session key connected");
        self.transition(|_| SessionState::Connected { expires_at });
    }

    pub fn disconnect(&self) {
        self.transition(|_| SessionState::Disconnected);
    }

    /// Expire the key if `now` is past its expiry; returns the new state
    pub fn sync_state(&self, now: DateTime<Utc>) -> SessionState {
        self.transition(|state| match state {
            SessionState::Connected { expires_at } if expires_at <= now => SessionState::Expired,
            other => other,
        })
    }

    pub fn subscribe(&self, listener: SessionListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, listener);
        id
    }

    /// Returns `false` if `id` was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    fn transition(&self, next: impl FnOnce(SessionState) -> SessionState) -> SessionState {
        let (before, after) = {
            let mut state = self.state.lock();
            let before = *state;
            *state = next(before);
            (before, *state)
        };
        if before != after {
            debug!(?before, ?after, "session state changed");
            // Listeners run outside both locks so they may call back in
            let listeners: Vec<SessionListener> = self.listeners.lock().values().cloned().collect();
            for listener in listeners {
                listener(&after);
            }
        }
        after
    }
}
