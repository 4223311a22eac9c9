// src/connection/state.rs
use log::debug;
use serde::Serialize;
use std::{
    fmt,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::{broadcast, watch};

const STATE_CHANGE_CAPACITY: usize = 64;

/// Lifecycle state of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Failed,
}

impl ConnectionState {
    /// States in which outbound messages are handed to the transport.
    pub fn can_emit(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }

    /// States backed by a live transport connection.
    pub fn is_online(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Authenticating | Self::Authenticated
        )
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-session facts that must change together with the state.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct SessionDetails {
    pub(crate) identity: Option<String>,
    pub(crate) failures: u32,
}

/// Shared holder for the current state.
///
/// Every session started by the manager gets an epoch. Writes carrying a
/// stale epoch are discarded, so a stopped session can never overwrite the
/// state, identity or attempt counter that `stop()` or a newer session has
/// set. Epoch checks, writes and the change notification all happen under
/// the watch channel's lock.
pub(crate) struct StateCell {
    current: watch::Sender<ConnectionState>,
    changes: broadcast::Sender<ConnectionState>,
    details: Mutex<SessionDetails>,
    epoch: AtomicU64,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (current, _) = watch::channel(ConnectionState::Disconnected);
        let (changes, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        Self {
            current,
            changes,
            details: Mutex::new(SessionDetails::default()),
            epoch: AtomicU64::new(0),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.current.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }

    pub(crate) fn changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.changes.subscribe()
    }

    pub(crate) fn identity(&self) -> Option<String> {
        self.lock_details().identity.clone()
    }

    pub(crate) fn failures(&self) -> u32 {
        self.lock_details().failures
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Retire whatever session is running, clear its details and move to
    /// `next`. Returns the new epoch and the state that was replaced.
    pub(crate) fn advance(&self, next: ConnectionState) -> (u64, ConnectionState) {
        let mut new_epoch = 0;
        let mut previous = next;
        self.current.send_if_modified(|state| {
            new_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            previous = *state;
            *self.lock_details() = SessionDetails::default();
            self.apply(state, next)
        });
        (new_epoch, previous)
    }

    /// Transition on behalf of the session identified by `epoch`.
    /// Returns false when the session has been retired.
    pub(crate) fn transition(&self, epoch: u64, next: ConnectionState) -> bool {
        self.update(epoch, Some(next), |_| {})
    }

    /// Apply `f` to the session details and optionally transition, both only
    /// if `epoch` is still current.
    pub(crate) fn update<F>(&self, epoch: u64, next: Option<ConnectionState>, f: F) -> bool
    where
        F: FnOnce(&mut SessionDetails),
    {
        let mut accepted = false;
        self.current.send_if_modified(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            accepted = true;
            f(&mut *self.lock_details());
            match next {
                Some(next) => self.apply(state, next),
                None => false,
            }
        });
        accepted
    }

    fn apply(&self, state: &mut ConnectionState, next: ConnectionState) -> bool {
        if *state == next {
            return false;
        }
        debug!("Connection state {} -> {}", state, next);
        *state = next;
        let _ = self.changes.send(next);
        true
    }

    fn lock_details(&self) -> MutexGuard<'_, SessionDetails> {
        match self.details.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_epoch_cannot_change_state() {
        let cell = StateCell::new();
        let (first, _) = cell.advance(ConnectionState::Connecting);
        assert!(cell.transition(first, ConnectionState::Connected));

        cell.advance(ConnectionState::Disconnected);
        assert!(!cell.transition(first, ConnectionState::Authenticated));
        assert_eq!(cell.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn stale_epoch_cannot_set_identity_or_failures() {
        let cell = StateCell::new();
        let (old, _) = cell.advance(ConnectionState::Connecting);
        assert!(cell.update(old, Some(ConnectionState::Connected), |d| d.failures = 0));

        let (current, previous) = cell.advance(ConnectionState::Connecting);
        assert_eq!(previous, ConnectionState::Connected);

        assert!(!cell.update(old, Some(ConnectionState::Authenticated), |d| {
            d.identity = Some("alice".to_string())
        }));
        assert!(!cell.update(old, None, |d| d.failures = 7));
        assert_eq!(cell.identity(), None);
        assert_eq!(cell.failures(), 0);
        assert_eq!(cell.get(), ConnectionState::Connecting);

        assert!(cell.update(current, None, |d| d.failures = 2));
        assert_eq!(cell.failures(), 2);
    }

    #[test]
    fn advance_clears_session_details() {
        let cell = StateCell::new();
        let (epoch, _) = cell.advance(ConnectionState::Connecting);
        cell.update(epoch, Some(ConnectionState::Authenticated), |d| {
            d.identity = Some("alice".to_string());
            d.failures = 3;
        });

        let (_, previous) = cell.advance(ConnectionState::Disconnected);
        assert_eq!(previous, ConnectionState::Authenticated);
        assert_eq!(cell.identity(), None);
        assert_eq!(cell.failures(), 0);
    }

    #[test]
    fn changes_are_published_once_per_transition() {
        let cell = StateCell::new();
        let mut changes = cell.changes();
        let (epoch, _) = cell.advance(ConnectionState::Connecting);
        cell.transition(epoch, ConnectionState::Connecting);
        cell.transition(epoch, ConnectionState::Connected);

        assert_eq!(changes.try_recv().unwrap(), ConnectionState::Connecting);
        assert_eq!(changes.try_recv().unwrap(), ConnectionState::Connected);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn emit_is_only_allowed_when_connected_or_authenticated() {
        use ConnectionState::*;
        let allowed: Vec<_> = [
            Disconnected,
            Connecting,
            Connected,
            Authenticating,
            Authenticated,
            Failed,
        ]
        .into_iter()
        .filter(|s| s.can_emit())
        .collect();
        assert_eq!(allowed, vec![Connected, Authenticated]);
    }
}
