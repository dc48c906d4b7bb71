//! Presence registry: who is in the room and where their caret is.
//!
//! Presence is throw-away state. Every update overwrites the previous one
//! (last write wins), nothing is persisted, and entries that stop refreshing
//! are pruned after the idle timeout.
//!
//! ```text
//! update_cursor()/update_selection()      presence / join messages
//!             │                                     │
//!             ▼                                     ▼
//!      local PresenceState            remote PresenceState per user
//!             │                                     │
//!             └──────────► PresenceEvent ◄──────────┘
//!                               │
//!                               ▼
//!                     Room (rebroadcast, UI)
//! ```
//!
//! Remote `lastSeenAt` is stamped with the local receive time, so idle
//! expiry never depends on a peer's clock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tandem_core::{Emitter, Subscription};

use crate::protocol::{now_millis, CursorPosition, PresenceState, Selection, User};

/// Changes published by a [`PresenceRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// The local entry changed and should be rebroadcast.
    LocalChanged(PresenceState),
    RemoteChanged { user_id: String, state: PresenceState },
    RemoteLeft { user_id: String },
}

/// A remote member.
#[derive(Debug, Clone)]
struct RemoteMember {
    /// Unknown until the member's `join` arrives.
    user: Option<User>,
    state: PresenceState,
}

#[derive(Debug)]
struct Members {
    local: PresenceState,
    remote: HashMap<String, RemoteMember>,
    /// Identities that outlive idle expiry and disconnects; only an explicit
    /// leave forgets one.
    known: HashMap<String, User>,
}

/// Presence state for everyone in a room.
///
/// Read accessors return copies.
pub struct PresenceRegistry {
    local_user: User,
    idle_timeout: Duration,
    members: Mutex<Members>,
    events: Emitter<PresenceEvent>,
}

impl PresenceRegistry {
    pub fn new(local_user: User, idle_timeout: Duration) -> Self {
        let local = PresenceState::new(local_user.id.clone());
        Self {
            local_user,
            idle_timeout,
            members: Mutex::new(Members {
                local,
                remote: HashMap::new(),
                known: HashMap::new(),
            }),
            events: Emitter::new(),
        }
    }

    pub fn local_user(&self) -> &User {
        &self.local_user
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Current local entry.
    pub fn local_state(&self) -> PresenceState {
        self.lock().local.clone()
    }

    /// Move the local caret.
    pub fn update_cursor(&self, cursor: CursorPosition) -> PresenceState {
        self.update_local(|state| state.cursor = Some(cursor))
    }

    /// Replace the local selection.
    pub fn update_selection(&self, selection: Selection) -> PresenceState {
        self.update_local(|state| state.selection = Some(selection))
    }

    fn update_local(&self, apply: impl FnOnce(&mut PresenceState)) -> PresenceState {
        let state = {
            let mut members = self.lock();
            apply(&mut members.local);
            members.local.last_seen_at = now_millis();
            members.local.clone()
        };
        self.events.emit(&PresenceEvent::LocalChanged(state.clone()));
        state
    }

    /// Overwrite a remote member's awareness state.
    ///
    /// Returns false, and changes nothing, for the local user's own id.
    pub fn apply_awareness_update(&self, user_id: &str, mut state: PresenceState) -> bool {
        if user_id == self.local_user.id {
            return false;
        }
        state.user_id = user_id.to_string();
        state.last_seen_at = now_millis();
        {
            let mut members = self.lock();
            match members.remote.get_mut(user_id) {
                Some(member) => member.state = state.clone(),
                // Expired, or a member whose join we missed
                None => {
                    let user = members.known.get(user_id).cloned();
                    members.remote.insert(
                        user_id.to_string(),
                        RemoteMember {
                            user,
                            state: state.clone(),
                        },
                    );
                }
            }
        }
        self.events.emit(&PresenceEvent::RemoteChanged {
            user_id: user_id.to_string(),
            state,
        });
        true
    }

    /// Seed a full remote entry from a `join`.
    pub fn handle_remote_presence(&self, user_id: &str, user: User, mut presence: PresenceState) -> bool {
        if user_id == self.local_user.id {
            return false;
        }
        presence.user_id = user_id.to_string();
        presence.last_seen_at = now_millis();
        {
            let mut members = self.lock();
            members.known.insert(user_id.to_string(), user.clone());
            members.remote.insert(
                user_id.to_string(),
                RemoteMember {
                    user: Some(user),
                    state: presence.clone(),
                },
            );
        }
        self.events.emit(&PresenceEvent::RemoteChanged {
            user_id: user_id.to_string(),
            state: presence,
        });
        true
    }

    /// Drop a remote member. Returns its last state, if it was known.
    pub fn handle_remote_leave(&self, user_id: &str) -> Option<PresenceState> {
        let removed = {
            let mut members = self.lock();
            members.known.remove(user_id);
            members.remote.remove(user_id)?
        };
        self.events.emit(&PresenceEvent::RemoteLeft {
            user_id: user_id.to_string(),
        });
        Some(removed.state)
    }

    /// Presence of any member, local included.
    pub fn presence(&self, user_id: &str) -> Option<PresenceState> {
        let members = self.lock();
        if user_id == self.local_user.id {
            return Some(members.local.clone());
        }
        members.remote.get(user_id).map(|m| m.state.clone())
    }

    /// Every member's presence, local first, then remote by user id.
    pub fn all_presences(&self) -> Vec<PresenceState> {
        let members = self.lock();
        let mut remote: Vec<PresenceState> =
            members.remote.values().map(|m| m.state.clone()).collect();
        remote.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let mut all = Vec::with_capacity(remote.len() + 1);
        all.push(members.local.clone());
        all.extend(remote);
        all
    }

    /// Identity of a member, when known.
    pub fn user(&self, user_id: &str) -> Option<User> {
        if user_id == self.local_user.id {
            return Some(self.local_user.clone());
        }
        self.lock().remote.get(user_id).and_then(|m| m.user.clone())
    }

    /// Known identities, local first. Members seen only through awareness
    /// updates are left out.
    pub fn users(&self) -> Vec<User> {
        let members = self.lock();
        let mut remote: Vec<User> = members
            .remote
            .values()
            .filter_map(|m| m.user.clone())
            .collect();
        remote.sort_by(|a, b| a.id.cmp(&b.id));

        let mut users = Vec::with_capacity(remote.len() + 1);
        users.push(self.local_user.clone());
        users.extend(remote);
        users
    }

    /// Number of remote members.
    pub fn remote_count(&self) -> usize {
        self.lock().remote.len()
    }

    /// Remove remote members not refreshed within the idle timeout, as of
    /// `now` (ms epoch). Returns the removed ids. Their identity is kept, so
    /// a later awareness update restores the full entry.
    pub fn prune_idle(&self, now: u64) -> Vec<String> {
        let timeout = self.idle_timeout.as_millis() as u64;
        let stale: Vec<String> = {
            let mut members = self.lock();
            let stale: Vec<String> = members
                .remote
                .iter()
                .filter(|(_, m)| now.saturating_sub(m.state.last_seen_at) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                members.remote.remove(id);
            }
            stale
        };

        for user_id in &stale {
            log::debug!("Pruned idle member {user_id}");
            self.events.emit(&PresenceEvent::RemoteLeft {
                user_id: user_id.clone(),
            });
        }
        stale
    }

    /// Forget every remote member, e.g. after losing the connection.
    pub fn clear_remote(&self) -> Vec<String> {
        let mut removed: Vec<String> = self.lock().remote.drain().map(|(id, _)| id).collect();
        removed.sort();
        for user_id in &removed {
            self.events.emit(&PresenceEvent::RemoteLeft {
                user_id: user_id.clone(),
            });
        }
        removed
    }

    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Drop every listener.
    pub fn clear_listeners(&self) {
        self.events.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Members> {
        self.members
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for PresenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceRegistry")
            .field("local_user", &self.local_user.id)
            .field("remote", &self.remote_count())
            .finish()
    }
}
