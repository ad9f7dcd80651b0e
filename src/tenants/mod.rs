//! Tenant records: durable storage and the token-keyed read-through cache.
//!
//! The [`TenantStore`] is the source of truth. The [`TenantCache`] holds
//! snapshots keyed by auth token so authenticated requests avoid a database
//! round trip. Every mutation is written to the store before the cache.

pub mod cache;
pub mod store;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use self::cache::TenantCache;
pub use self::store::TenantStore;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Webhook event kinds a tenant can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Inbound chat messages.
    Message,
    /// Delivery and read receipts.
    ReadReceipt,
    /// Contact online/offline presence.
    Presence,
    /// History synchronisation snapshots.
    HistorySync,
    /// Typing / recording indicators inside a chat.
    ChatPresence,
    /// Wildcard: every forwarded kind.
    All,
}

impl EventKind {
    /// Returns the label used on the wire and in the `events` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "Message",
            Self::ReadReceipt => "ReadReceipt",
            Self::Presence => "Presence",
            Self::HistorySync => "HistorySync",
            Self::ChatPresence => "ChatPresence",
            Self::All => "All",
        }
    }

    /// Parse a subscription label. Labels are case-sensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Message" => Some(Self::Message),
            "ReadReceipt" => Some(Self::ReadReceipt),
            "Presence" => Some(Self::Presence),
            "HistorySync" => Some(Self::HistorySync),
            "ChatPresence" => Some(Self::ChatPresence),
            "All" => Some(Self::All),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalise a requested subscription list.
///
/// Unrecognised labels are discarded with a warning and duplicates are
/// removed, preserving first-seen order. An empty result (nothing requested,
/// or nothing recognised among blank entries) subscribes to [`EventKind::All`].
pub fn parse_subscriptions<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    let mut requested_any = false;

    for label in labels {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        requested_any = true;
        match EventKind::parse(label) {
            Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Some(_) => {}
            None => warn!(kind = label, "event kind discarded"),
        }
    }

    if kinds.is_empty() && !requested_any {
        kinds.push(EventKind::All);
    }
    kinds
}

/// Parse the comma-separated `events` column.
///
/// Unlike a request, an empty column means nothing is subscribed, so the
/// column is the exact inverse of [`join_subscriptions`].
pub fn parse_event_column(column: &str) -> Vec<EventKind> {
    if column.trim().is_empty() {
        return Vec::new();
    }
    parse_subscriptions(column.split(','))
}

/// Render a subscription list back into the `events` column format.
pub fn join_subscriptions(kinds: &[EventKind]) -> String {
    kinds
        .iter()
        .map(EventKind::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `kind` passes a subscription list (direct match or wildcard).
pub fn is_subscribed(subscriptions: &[EventKind], kind: EventKind) -> bool {
    subscriptions
        .iter()
        .any(|s| *s == kind || *s == EventKind::All)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Snapshot of one tenant row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantRecord {
    /// Primary key.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Auth token presented on every request.
    #[serde(skip_serializing)]
    pub token: String,
    /// Network identity assigned by pairing, if any.
    pub network_identity: Option<String>,
    /// Callback URL for forwarded events (empty when unset).
    pub webhook_url: String,
    /// Subscribed event kinds.
    pub events: Vec<EventKind>,
    /// Persisted connection flag, used to resume sessions on restart.
    pub connected: bool,
    /// Transient pairing artifact (QR data URL or linking code).
    #[serde(skip_serializing)]
    pub pairing_code: String,
}

/// Errors from tenant store and cache operations.
#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No tenant row with the given id.
    #[error("tenant {0} not found")]
    NotFound(i64),
}
