//! Opwatch - realtime progress watcher for long-running generation
//! operations.
//!
//! This crate observes server-side "generation" operations in near-real
//! time: it maintains a persistent STOMP-over-WebSocket connection,
//! subscribes to one private (per-user) and one public (broadcast)
//! channel, and keeps a consistent, session-scoped log of the progress
//! events it receives — across reconnects, user switches, and event
//! bursts.
//!
//! # Architecture
//!
//! ```text
//!   ProgressWatcher (consumer adapter)
//!         │ observe(user) / current_status / notices
//!         ▼
//!      Session  ── owns ──►  EventStore (append-only log + views)
//!         │                        ▲
//!         ▼                        │ append decoded events
//!   ProgressConnection  ──►  background task
//!   (state, close)           connect / handshake / subscribe ×2
//!                            route frames / heart-beat / reconnect
//! ```
//!
//! # Modules
//!
//! - [`watcher`] - Consumer adapter: user switching, status, notices
//! - [`session`] - One observed user = one store + one connection
//! - [`connection`] - Connection manager and channel subscriber
//! - [`store`] - Append-only event store with derived views
//! - [`stomp`] - STOMP 1.2 frame codec and heart-beat negotiation
//! - [`ws`] - WebSocket transport wrapper
//! - [`event`] - Progress event model and wire decoding
//! - [`trigger`] - HTTP client for the operation-start endpoint
//! - [`config`] - Configuration loading/saving

// Library modules
pub mod config;
pub mod connection;
pub mod event;
pub mod session;
pub mod stomp;
pub mod store;
pub mod trigger;
pub mod watcher;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use connection::{ConnectionConfig, ConnectionState, ProgressConnection};
pub use event::{ProgressEvent, ProgressKind, Visibility};
pub use session::Session;
pub use store::EventStore;
pub use trigger::TriggerClient;
pub use watcher::{ProgressWatcher, TerminalNotice};
