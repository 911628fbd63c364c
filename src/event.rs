//! Progress event data model and wire decoding.
//!
//! Events arrive as JSON bodies of STOMP `MESSAGE` frames. The producer is
//! free to encode timestamps as epoch milliseconds or as ISO-8601 strings;
//! both are normalized to a `chrono::DateTime<Utc>` at decode time.
//!
//! Visibility is **not** part of the wire payload. It is assigned by the
//! subscriber from the channel a frame arrived on: frames from the
//! per-user channel are [`Visibility::Private`], frames from the broadcast
//! channel are [`Visibility::Public`], regardless of embedded fields.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Kind of a progress event, determining terminality and presentation.
///
/// Wire spelling follows the producer (`GENERATION_STARTED`, ...); the short
/// forms (`STARTED`, ...) are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressKind {
    /// Operation has started.
    #[serde(rename = "GENERATION_STARTED", alias = "STARTED")]
    Started,
    /// Operation reported intermediate progress.
    #[serde(rename = "GENERATION_PROGRESS", alias = "PROGRESS")]
    Progress,
    /// Operation finished successfully. Terminal.
    #[serde(rename = "GENERATION_COMPLETED", alias = "COMPLETED")]
    Completed,
    /// Operation failed. Terminal.
    #[serde(rename = "GENERATION_ERROR", alias = "ERROR")]
    Error,
    /// System-wide broadcast, not operation-scoped.
    #[serde(rename = "SYSTEM")]
    System,
}

impl ProgressKind {
    /// Whether this kind marks an operation as terminal (no further
    /// meaningful private events expected). Presentation-level policy only;
    /// the store does not enforce it.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Which channel delivered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Addressed to one user via the per-user channel.
    Private,
    /// System-wide broadcast via the public channel.
    Public,
}

/// A received progress notification.
///
/// Immutable once stored. `percentage` stays `None` when the producer did
/// not report one — display code defaults it to 0, but the distinction
/// between "no progress reported" and "0% reported" is preserved.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Addressed user, present on private events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Operation the event describes; absent for some public events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    /// Human-readable label of the current stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Human-readable text.
    pub message: String,
    /// Reported completion 0-100, absent when not reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u8>,
    /// Producer-assigned instant. May be skewed across channels; arrival
    /// order, not timestamp order, is the ordering guarantee.
    pub timestamp: DateTime<Utc>,
    /// Channel-derived tag, never serialized back to the wire.
    #[serde(skip)]
    pub visibility: Visibility,
}

/// Wire shape of an event body (visibility-less).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    user_id: Option<String>,
    operation_id: Option<String>,
    #[serde(rename = "type")]
    kind: ProgressKind,
    step: Option<String>,
    message: String,
    percentage: Option<u8>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Decode a frame body received on the given channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON or does not match the
    /// wire shape. Callers treat this as a protocol fault: drop the frame,
    /// keep the subscription.
    pub fn decode(body: &str, visibility: Visibility) -> Result<Self> {
        let wire: WireEvent =
            serde_json::from_str(body).context("malformed progress event payload")?;
        Ok(Self {
            user_id: wire.user_id,
            operation_id: wire.operation_id,
            kind: wire.kind,
            step: wire.step,
            message: wire.message,
            percentage: wire.percentage,
            timestamp: wire.timestamp,
            visibility,
        })
    }

    /// Percentage for display: absent means 0%.
    #[must_use]
    pub fn display_percentage(&self) -> u8 {
        self.percentage.unwrap_or(0)
    }

    /// Whether this event ends its operation (Completed or Error).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Accept either epoch milliseconds or an ISO-8601 string (with or without
/// a zone offset; zoneless strings are taken as UTC).
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}"))),
        Raw::Text(s) => parse_iso_timestamp(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse an ISO-8601 timestamp string into UTC.
fn parse_iso_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Producer may emit zoneless local date-times (e.g. "2024-05-01T10:30:00")
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| anyhow!("unparseable timestamp {s:?}: {e}"))
}
