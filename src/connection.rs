//! STOMP connection manager and channel subscriber.
//!
//! Owns a background task that maintains one logical connection to the
//! progress endpoint: connect, CONNECT/CONNECTED handshake, subscribe to
//! the two progress channels, route MESSAGE frames into the session's
//! [`EventStore`], heart-beat in both directions, and reconnect after a
//! fixed delay on any fault.
//!
//! # Architecture
//!
//! ```text
//!   ProgressConnection (handle)        background task
//!         │                                  │
//!         │  state() / state_changes()       │  connect → handshake
//!         │  decode_faults()                 │  SUBSCRIBE ×2 (per connect)
//!         │  close()                         │  route MESSAGE → store
//!         │                                  │  heart-beat / reconnect
//! ```
//!
//! # Channels
//!
//! Each successful (re)connect opens exactly two subscriptions — they do
//! not survive a transport reconnect:
//!
//! - `/topic/progress.{userId}` (id `sub-private`) → [`Visibility::Private`]
//! - `/topic/system` (id `sub-public`) → [`Visibility::Public`]
//!
//! Visibility is assigned from the `subscription` header of the delivering
//! frame, never from payload content.
//!
//! # Failure policy
//!
//! Transport faults surface only as [`ConnectionState`] transitions plus a
//! last-error string; they never cross this module's boundary as errors.
//! Undecodable frames are dropped and counted, and never affect the
//! connection. Subscriptions are only issued once the handshake completed,
//! so a subscribe can never be silently lost to a not-yet-ready connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};

use crate::event::{ProgressEvent, Visibility};
use crate::stomp::{self, Command, Frame, HeartBeat};
use crate::store::EventStore;
use crate::ws;

/// Subscription id for the per-user channel.
const PRIVATE_SUB_ID: &str = "sub-private";
/// Subscription id for the broadcast channel.
const PUBLIC_SUB_ID: &str = "sub-public";
/// Fixed destination of the broadcast channel.
const PUBLIC_DESTINATION: &str = "/topic/system";

/// Handshake must complete within this window or the attempt counts as failed.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence tolerated before the link counts as dead, as a multiple of the
/// negotiated expect interval.
const HEARTBEAT_GRACE: u32 = 2;

/// Reported connection health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; initial state and terminal-on-close.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Handshake done, channels subscribed.
    Connected,
    /// Last attempt failed; retry pending. Carries a human-readable reason.
    Errored(String),
}

impl ConnectionState {
    /// Whether the connection is live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Errored(reason) => write!(f, "Disconnected ({reason})"),
        }
    }
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Full WebSocket URL of the progress endpoint.
    pub ws_url: String,
    /// Value for the CONNECT `host` header.
    pub host: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Heart-beat capabilities offered in the handshake.
    pub heartbeat: HeartBeat,
}

impl ConnectionConfig {
    /// Build connection parameters from a server base URL and timing knobs.
    #[must_use]
    pub fn new(server_url: &str, reconnect_delay: Duration, heartbeat_ms: u64) -> Self {
        let ws_url = ws::progress_endpoint(server_url);
        Self {
            host: host_of(&ws_url),
            ws_url,
            reconnect_delay,
            heartbeat: HeartBeat {
                send_ms: heartbeat_ms,
                recv_ms: heartbeat_ms,
            },
        }
    }
}

/// Extract the authority (host[:port]) from a URL for the CONNECT header.
fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?']).next().unwrap_or(rest).to_string()
}

/// Destination of the per-user progress channel.
fn private_destination(user_id: &str) -> String {
    format!("/topic/progress.{user_id}")
}

/// Handle to a live progress connection.
///
/// Spawned by [`Self::open`]; dropping the handle (or calling
/// [`Self::close`]) tears the connection down, cancelling any in-flight
/// attempt. One session owns at most one handle at a time — replacing a
/// connection means closing the old handle first, so attempts never race.
#[derive(Debug)]
pub struct ProgressConnection {
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    decode_faults: Arc<AtomicU64>,
}

impl ProgressConnection {
    /// Connect and spawn the background task.
    ///
    /// Decoded events are appended to `store`; a sealed store drops them.
    /// The task retries failed attempts indefinitely at the configured
    /// fixed delay until [`Self::close`].
    #[must_use]
    pub fn open(config: ConnectionConfig, user_id: &str, store: Arc<EventStore>) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let decode_faults = Arc::new(AtomicU64::new(0));

        let task = ConnectionTask {
            config,
            user_id: user_id.to_string(),
            store,
            state_tx,
            shutdown: Arc::clone(&shutdown),
            wake: Arc::clone(&wake),
            decode_faults: Arc::clone(&decode_faults),
        };
        tokio::spawn(task.run());

        Self {
            state_rx,
            shutdown,
            wake,
            decode_faults,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch receiver over state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Human-readable reason of the last failure, if the connection is in
    /// the errored state.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        match &*self.state_rx.borrow() {
            ConnectionState::Errored(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Count of frames dropped because their payload failed to decode.
    #[must_use]
    pub fn decode_faults(&self) -> u64 {
        self.decode_faults.load(Ordering::Relaxed)
    }

    /// Tear the connection down.
    ///
    /// Cancels any in-flight attempt and stops retries. Safe to call if
    /// never connected or already closed; unsubscription over a dropped
    /// transport is a local no-op.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a close racing the task between
        // two awaits is never lost
        self.wake.notify_one();
    }
}

impl Drop for ProgressConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// State owned by the background task.
struct ConnectionTask {
    config: ConnectionConfig,
    user_id: String,
    store: Arc<EventStore>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    decode_faults: Arc<AtomicU64>,
}

/// Why the per-connection message loop exited.
enum LoopExit {
    /// Close requested; stop retrying.
    Shutdown,
    /// Connection died; reconnect after the configured delay.
    Dead(String),
}

impl ConnectionTask {
    fn closing(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        // send() only fails when every handle is gone; shutdown follows
        let _ = self.state_tx.send(state);
    }

    /// Sleep between attempts, cut short by close().
    async fn backoff(&self) {
        tokio::select! {
            () = tokio::time::sleep(self.config.reconnect_delay) => {}
            () = self.wake.notified() => {}
        }
    }

    /// Outer connect/retry loop. One iteration per connection attempt.
    async fn run(self) {
        loop {
            if self.closing() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            log::info!("[Stomp] Connecting to {}", self.config.ws_url);

            let connected = tokio::select! {
                result = self.establish() => result,
                () = self.wake.notified() => {
                    // close() cancels an in-flight attempt
                    break;
                }
            };

            let (mut writer, mut reader, negotiated) = match connected {
                Ok(parts) => parts,
                Err(e) => {
                    log::warn!(
                        "[Stomp] Connection failed: {e:#} (retry in {}s)",
                        self.config.reconnect_delay.as_secs()
                    );
                    self.set_state(ConnectionState::Errored(format!("{e:#}")));
                    self.backoff().await;
                    continue;
                }
            };

            log::info!("[Stomp] Connected, both channels subscribed");
            self.set_state(ConnectionState::Connected);

            match self.message_loop(&mut writer, &mut reader, negotiated).await {
                LoopExit::Shutdown => {
                    // Best effort: the server may already be gone
                    let _ = writer
                        .send_text(&stomp::unsubscribe_frame(PRIVATE_SUB_ID).encode())
                        .await;
                    let _ = writer
                        .send_text(&stomp::unsubscribe_frame(PUBLIC_SUB_ID).encode())
                        .await;
                    let _ = writer
                        .send_text(&Frame::new(Command::Disconnect).encode())
                        .await;
                    let _ = writer.close().await;
                    break;
                }
                LoopExit::Dead(reason) => {
                    log::info!(
                        "[Stomp] Disconnected: {reason} (reconnecting in {}s)",
                        self.config.reconnect_delay.as_secs()
                    );
                    self.set_state(ConnectionState::Errored(reason));
                    self.backoff().await;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        log::info!("[Stomp] Connection closed");
    }

    /// Connect the transport, run the STOMP handshake, and subscribe both
    /// channels. Subscriptions are re-issued here on every reconnect.
    async fn establish(&self) -> anyhow::Result<(ws::WsWriter, ws::WsReader, stomp::Negotiated)> {
        let (mut writer, mut reader) = ws::connect(&self.config.ws_url).await?;

        let connect = stomp::connect_frame(&self.config.host, self.config.heartbeat);
        writer.send_text(&connect.encode()).await?;

        let server_beat = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            wait_for_connected(&mut writer, &mut reader),
        )
        .await
        .map_err(|_| anyhow::anyhow!("handshake timed out"))??;

        let negotiated = self.config.heartbeat.negotiate(server_beat);

        let private = stomp::subscribe_frame(PRIVATE_SUB_ID, &private_destination(&self.user_id));
        writer.send_text(&private.encode()).await?;
        let public = stomp::subscribe_frame(PUBLIC_SUB_ID, PUBLIC_DESTINATION);
        writer.send_text(&public.encode()).await?;

        Ok((writer, reader, negotiated))
    }

    /// Per-connection frame loop: route messages, exchange heart-beats,
    /// detect silent failures.
    async fn message_loop(
        &self,
        writer: &mut ws::WsWriter,
        reader: &mut ws::WsReader,
        negotiated: stomp::Negotiated,
    ) -> LoopExit {
        // A disabled direction still needs an interval for select!; park it
        // on a long period that never matters.
        const PARKED: Duration = Duration::from_secs(3600);

        let mut send_beat = tokio::time::interval(negotiated.send_every.unwrap_or(PARKED));
        send_beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        send_beat.reset(); // skip the immediate first tick

        let expect_within = negotiated.expect_within;
        let mut silence_check =
            tokio::time::interval(expect_within.map_or(PARKED, |d| d * HEARTBEAT_GRACE));
        silence_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        silence_check.reset();

        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                msg = reader.recv() => {
                    last_inbound = Instant::now();
                    match msg {
                        Some(Ok(ws::WsMessage::Text(text))) => {
                            if stomp::is_heartbeat(&text) {
                                continue;
                            }
                            if let Some(exit) = self.handle_frame_text(&text) {
                                return exit;
                            }
                        }
                        Some(Ok(ws::WsMessage::Ping(data))) => {
                            let _ = writer.send_pong(data).await;
                        }
                        Some(Ok(ws::WsMessage::Close { code, reason })) => {
                            return LoopExit::Dead(format!(
                                "closed by server (code {code}{})",
                                if reason.is_empty() { String::new() } else { format!(": {reason}") }
                            ));
                        }
                        Some(Err(e)) => return LoopExit::Dead(format!("transport error: {e:#}")),
                        None => return LoopExit::Dead("stream ended".to_string()),
                    }
                }

                _ = send_beat.tick(), if negotiated.send_every.is_some() => {
                    if let Err(e) = writer.send_text("\n").await {
                        return LoopExit::Dead(format!("heart-beat send failed: {e:#}"));
                    }
                }

                _ = silence_check.tick(), if expect_within.is_some() => {
                    if let Some(expect) = expect_within {
                        if last_inbound.elapsed() >= expect * HEARTBEAT_GRACE {
                            return LoopExit::Dead("heart-beat timeout".to_string());
                        }
                    }
                }

                () = self.wake.notified() => {
                    if self.closing() {
                        return LoopExit::Shutdown;
                    }
                }
            }
        }
    }

    /// Parse and dispatch one inbound STOMP frame. Returns an exit when the
    /// frame ends the connection; decode faults never do.
    fn handle_frame_text(&self, text: &str) -> Option<LoopExit> {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.count_fault(&format!("unparseable frame: {e:#}"));
                return None;
            }
        };

        match frame.command {
            Command::Message => {
                self.route_message(&frame);
                None
            }
            Command::Error => {
                // STOMP servers close the connection after an ERROR frame
                let reason = frame
                    .header("message")
                    .map_or_else(|| "server error".to_string(), ToString::to_string);
                Some(LoopExit::Dead(reason))
            }
            other => {
                log::trace!("[Stomp] Ignoring {} frame", other.as_str());
                None
            }
        }
    }

    /// Append a MESSAGE frame's payload to the store, tagged with the
    /// visibility of the channel that delivered it.
    fn route_message(&self, frame: &Frame) {
        let visibility = match frame.header("subscription") {
            Some(PRIVATE_SUB_ID) => Visibility::Private,
            Some(PUBLIC_SUB_ID) => Visibility::Public,
            other => {
                log::trace!("[Stomp] MESSAGE for unknown subscription: {other:?}");
                return;
            }
        };

        match ProgressEvent::decode(&frame.body, visibility) {
            Ok(event) => {
                if !self.store.append(event) {
                    log::debug!("[Stomp] Store sealed, dropping late frame");
                }
            }
            Err(e) => self.count_fault(&format!("{e:#}")),
        }
    }

    fn count_fault(&self, reason: &str) {
        let total = self.decode_faults.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!("[Stomp] Dropped undecodable frame ({total} total): {reason}");
    }
}

/// Consume frames until the server's CONNECTED arrives, answering pings.
/// Returns the server's heart-beat offer.
async fn wait_for_connected(
    writer: &mut ws::WsWriter,
    reader: &mut ws::WsReader,
) -> anyhow::Result<(u64, u64)> {
    while let Some(msg) = reader.recv().await {
        match msg? {
            ws::WsMessage::Text(text) => {
                if stomp::is_heartbeat(&text) {
                    continue;
                }
                let frame = Frame::parse(&text)?;
                match frame.command {
                    Command::Connected => {
                        let beat = match frame.header("heart-beat") {
                            Some(value) => HeartBeat::parse_header(value)?,
                            None => (0, 0),
                        };
                        return Ok(beat);
                    }
                    Command::Error => {
                        anyhow::bail!(
                            "handshake rejected: {}",
                            frame.header("message").unwrap_or("no reason given")
                        );
                    }
                    other => {
                        log::trace!("[Stomp] Ignoring {} before CONNECTED", other.as_str());
                    }
                }
            }
            ws::WsMessage::Ping(data) => {
                let _ = writer.send_pong(data).await;
            }
            ws::WsMessage::Close { code, .. } => {
                anyhow::bail!("connection closed during handshake (code {code})");
            }
        }
    }
    anyhow::bail!("stream ended during handshake")
}
