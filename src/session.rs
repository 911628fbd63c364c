//! Session — the bounded lifetime of observing one user identity.
//!
//! A session owns exactly one [`EventStore`] and one connection attempt at
//! a time. Created when a consumer begins observing a user id; destroyed
//! (connection torn down, store sealed and discarded) when observation
//! stops or the user id changes. Stores are never shared across sessions,
//! so switching users can never leak another user's events.

use std::sync::Arc;

use crate::connection::{ConnectionConfig, ConnectionState, ProgressConnection};
use crate::store::EventStore;

/// One observed user identity: a fresh store plus a managed connection.
#[derive(Debug)]
pub struct Session {
    user_id: String,
    store: Arc<EventStore>,
    connection: ProgressConnection,
}

impl Session {
    /// Open a session for `user_id` with a fresh, empty store.
    #[must_use]
    pub fn open(config: ConnectionConfig, user_id: &str) -> Self {
        let store = EventStore::new();
        let connection = ProgressConnection::open(config, user_id, Arc::clone(&store));
        Self {
            user_id: user_id.to_string(),
            store,
            connection,
        }
    }

    /// The observed user id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The session's event store.
    #[must_use]
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// The session's connection handle.
    #[must_use]
    pub fn connection(&self) -> &ProgressConnection {
        &self.connection
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Tear the session down: seal the store first so late in-flight
    /// frames are dropped, then cancel the connection. After this returns
    /// no further events can be appended.
    pub fn close(self) {
        self.store.seal();
        self.connection.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.store.seal();
        self.connection.close();
    }
}
