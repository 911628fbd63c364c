//! Consumer adapter over sessions and the event store.
//!
//! [`ProgressWatcher`] is the surface presentation code talks to: it maps
//! the store's views onto operation-scoped queries, manages session
//! lifecycle as the observed user changes, and classifies terminal
//! transitions into one-time success/failure notices (the toast analog).

use std::collections::HashSet;

use tokio::sync::watch;

use crate::connection::{ConnectionConfig, ConnectionState};
use crate::event::{ProgressEvent, ProgressKind};
use crate::session::Session;

/// One-time notice emitted when an observed operation reaches a terminal
/// event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalNotice {
    /// Operation completed; carries the event's message.
    Success(String),
    /// Operation failed; carries the event's message.
    Failure(String),
}

/// Observes one user's operations over a managed session.
///
/// Changing the observed user tears the previous session down (connection
/// closed, store sealed and discarded) and opens a fresh one, so events
/// never leak across users.
#[derive(Debug)]
pub struct ProgressWatcher {
    config: ConnectionConfig,
    session: Option<Session>,
    operation_id: Option<String>,
    /// (user, operation) pairs already notified this session.
    notified: HashSet<(String, String)>,
}

impl ProgressWatcher {
    /// Create a watcher that is not yet observing anyone.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            session: None,
            operation_id: None,
            notified: HashSet::new(),
        }
    }

    /// Begin observing `user_id`.
    ///
    /// A repeat call for the currently observed user is a no-op; a
    /// different user replaces the session and resets notice bookkeeping.
    pub fn observe(&mut self, user_id: &str) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.user_id() == user_id)
        {
            return;
        }
        if let Some(previous) = self.session.take() {
            log::info!("[Watcher] Switching user {} -> {user_id}", previous.user_id());
            previous.close();
        }
        self.notified.clear();
        self.session = Some(Session::open(self.config.clone(), user_id));
    }

    /// Stop observing entirely, tearing down any session.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.notified.clear();
    }

    /// Set (or clear) the operation of interest for status queries.
    pub fn set_operation(&mut self, operation_id: Option<&str>) {
        self.operation_id = operation_id.map(ToString::to_string);
    }

    /// Operation currently filtered on, if any.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        self.operation_id.as_deref()
    }

    /// Observed user, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().map(Session::user_id)
    }

    /// Latest event for the observed (user, operation) pair.
    #[must_use]
    pub fn current_status(&self) -> Option<ProgressEvent> {
        let session = self.session.as_ref()?;
        let operation = self.operation_id.as_deref()?;
        session.store().latest_for(session.user_id(), operation)
    }

    /// Emit the one-time terminal notice for the interest pair, if its
    /// latest event is terminal and not yet reported. Subsequent calls for
    /// the same pair return `None`.
    pub fn take_terminal_notice(&mut self) -> Option<TerminalNotice> {
        let status = self.current_status()?;
        if !status.is_terminal() {
            return None;
        }
        let user = self.session.as_ref()?.user_id().to_string();
        let operation = self.operation_id.clone()?;
        if !self.notified.insert((user, operation)) {
            return None;
        }
        Some(match status.kind {
            ProgressKind::Error => TerminalNotice::Failure(status.message),
            _ => TerminalNotice::Success(status.message),
        })
    }

    /// All events this session, in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.session.as_ref().map_or_else(Vec::new, |s| s.store().all())
    }

    /// Private events for the observed user, in arrival order.
    #[must_use]
    pub fn private_updates(&self) -> Vec<ProgressEvent> {
        self.session
            .as_ref()
            .map_or_else(Vec::new, |s| s.store().private_for(s.user_id()))
    }

    /// Public broadcast events, in arrival order.
    #[must_use]
    pub fn public_updates(&self) -> Vec<ProgressEvent> {
        self.session
            .as_ref()
            .map_or_else(Vec::new, |s| s.store().public_feed())
    }

    /// Manual clear passthrough to the store. Connection state unaffected.
    pub fn clear(&self) {
        if let Some(session) = &self.session {
            session.store().clear();
        }
    }

    /// Connection health of the active session.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map_or(ConnectionState::Disconnected, Session::connection_state)
    }

    /// Watch receiver over store changes, for consumers that render on
    /// update instead of polling.
    #[must_use]
    pub fn store_changes(&self) -> Option<watch::Receiver<u64>> {
        self.session.as_ref().map(|s| s.store().changes())
    }

    /// Watch receiver over connection state transitions.
    #[must_use]
    pub fn state_changes(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.session.as_ref().map(|s| s.connection().state_changes())
    }

    /// Access the active session (mainly for tests and diagnostics).
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }
}
