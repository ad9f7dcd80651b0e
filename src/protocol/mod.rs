//! Messaging-protocol boundary.
//!
//! The gateway never speaks the wire protocol itself. It drives an opaque
//! [`ProtocolClient`] handle per tenant, obtained from an [`IdentityStore`],
//! and consumes the client's inbound events as a closed [`InboundEvent`] enum.
//! The [`bridge`] submodule implements both traits against an HTTP sidecar.

pub mod bridge;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Errors from the protocol library boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// HTTP request to the protocol sidecar failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The operation needs a live connection.
    #[error("not connected")]
    NotConnected,

    /// The operation needs an authenticated (paired) identity.
    #[error("not logged in")]
    NotLoggedIn,

    /// Pairing was requested for an identity that is already paired.
    #[error("already logged in")]
    AlreadyLoggedIn,

    /// The identity store could not produce a device.
    #[error("identity store error: {0}")]
    Identity(String),

    /// The protocol library rejected the call.
    #[error("protocol error: {0}")]
    Rejected(String),
}

/// Channel the protocol connection pushes inbound events into.
///
/// Unbounded so the connection never waits on the router.
pub type EventSink = mpsc::UnboundedSender<InboundEvent>;

// ---------------------------------------------------------------------------
// Client traits
// ---------------------------------------------------------------------------

/// One tenant's handle into the protocol library.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Network identity bound to this device, once paired.
    async fn network_identity(&self) -> Option<String>;

    /// Display (push) name configured for the identity, if any.
    async fn display_name(&self) -> Option<String>;

    /// Whether the underlying connection is up.
    async fn is_connected(&self) -> bool;

    /// Whether the device holds valid authentication.
    async fn is_authenticated(&self) -> bool;

    /// Open the connection.
    async fn connect(&self) -> Result<(), ProtocolError>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self);

    /// Unlink the device from the network identity.
    async fn logout(&self) -> Result<(), ProtocolError>;

    /// Request a phone-linking code for `phone`.
    async fn request_phone_linking_code(&self, phone: &str) -> Result<String, ProtocolError>;

    /// Open the QR pairing stream. Must be called before [`connect`](Self::connect).
    async fn open_pairing_channel(&self) -> Result<mpsc::Receiver<PairingEvent>, ProtocolError>;

    /// Install the sink that receives every inbound event.
    fn register_event_handler(&self, sink: EventSink);

    /// Publish our own presence.
    async fn send_presence(&self, state: PresenceState) -> Result<(), ProtocolError>;

    /// Send a message to `recipient`.
    async fn send_message(
        &self,
        recipient: &str,
        message: &OutboundMessage,
    ) -> Result<SendResponse, ProtocolError>;

    /// Fetch and decrypt an attachment.
    async fn download(&self, attachment: &Attachment) -> Result<Vec<u8>, ProtocolError>;
}

/// Device store of the protocol library.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Return the device bound to `known_identity`, or a fresh unpaired
    /// device when none is known or the identity is not in the store.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Identity`] when the store cannot be read.
    async fn lookup_or_create(
        &self,
        known_identity: Option<&str>,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError>;
}

// ---------------------------------------------------------------------------
// Pairing and outbound types
// ---------------------------------------------------------------------------

/// One item from the QR pairing stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "code", rename_all = "lowercase")]
pub enum PairingEvent {
    /// A new code to render and show to the user.
    Code(String),
    /// The pairing window expired.
    Timeout,
    /// Pairing completed.
    Success,
    /// Anything else the library reports (errors, unexpected events).
    #[serde(other)]
    Other,
}

/// Presence we can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    /// Online.
    Available,
    /// Offline.
    Unavailable,
}

/// Outbound text message.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    /// Caller-chosen message id.
    pub id: String,
    /// Message body.
    pub text: String,
}

/// Acknowledgement of a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    /// Server timestamp of the send.
    pub timestamp: DateTime<Utc>,
    /// Message id as accepted by the network.
    pub id: String,
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// Inbound event from a tenant's protocol connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    /// Pairing completed and a network identity was assigned.
    PairSuccess {
        /// Assigned network identity.
        id: String,
        /// Business name, when the account is a business account.
        #[serde(default)]
        business_name: String,
        /// Platform of the linking phone.
        #[serde(default)]
        platform: String,
    },
    /// The connection is live and authenticated.
    Connected,
    /// A chat message.
    Message(MessageEvent),
    /// A delivery or read receipt.
    Receipt(ReceiptEvent),
    /// A contact went online or offline.
    Presence {
        /// Contact identity.
        from: String,
        /// `true` when the contact went offline.
        #[serde(default)]
        unavailable: bool,
        /// Last-seen time, if shared.
        #[serde(default)]
        last_seen: Option<DateTime<Utc>>,
    },
    /// History synchronisation blob.
    HistorySync {
        /// Raw snapshot payload.
        data: serde_json::Value,
    },
    /// Typing / recording indicator inside a chat.
    ChatPresence {
        /// Chat the indicator belongs to.
        chat: String,
        /// Who is typing.
        sender: String,
        /// `composing` or `paused`.
        state: String,
        /// `audio` when recording, empty otherwise.
        #[serde(default)]
        media: String,
    },
    /// The device was unlinked remotely.
    LoggedOut {
        /// Reason reported by the network.
        #[serde(default)]
        reason: String,
    },
    /// An app-state collection finished syncing.
    AppStateSyncComplete {
        /// Collection name.
        name: String,
    },
    /// Another client took over this session's stream.
    StreamReplaced,
    /// An app-state mutation.
    AppState {
        /// Mutation index path.
        #[serde(default)]
        index: Vec<String>,
        /// Mutation payload.
        #[serde(default)]
        action: serde_json::Value,
    },
    /// Call offer, accept, terminate or similar signalling.
    CallSignal {
        /// Signal kind (`offer`, `accept`, `terminate`, ...).
        kind: String,
        /// Caller identity.
        from: String,
        /// Call id.
        call_id: String,
    },
    /// Any event kind this gateway does not model.
    #[serde(skip_deserializing)]
    Unhandled {
        /// Wire kind label.
        kind: String,
    },
}

impl InboundEvent {
    /// Decode a wire event, mapping unknown or malformed kinds to [`InboundEvent::Unhandled`].
    pub fn from_json(value: serde_json::Value) -> Self {
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        match serde_json::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                debug!(kind = %kind, error = %e, "undecodable inbound event");
                Self::Unhandled { kind }
            }
        }
    }

    /// Short kind label for logging.
    pub fn kind(&self) -> &str {
        match self {
            Self::PairSuccess { .. } => "PairSuccess",
            Self::Connected => "Connected",
            Self::Message(_) => "Message",
            Self::Receipt(_) => "Receipt",
            Self::Presence { .. } => "Presence",
            Self::HistorySync { .. } => "HistorySync",
            Self::ChatPresence { .. } => "ChatPresence",
            Self::LoggedOut { .. } => "LoggedOut",
            Self::AppStateSyncComplete { .. } => "AppStateSyncComplete",
            Self::StreamReplaced => "StreamReplaced",
            Self::AppState { .. } => "AppState",
            Self::CallSignal { .. } => "CallSignal",
            Self::Unhandled { kind } => kind.as_str(),
        }
    }
}

/// Inbound chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// Unique message id.
    pub id: String,
    /// Chat the message belongs to.
    pub chat: String,
    /// Sender identity.
    pub sender: String,
    /// Sender's display name.
    #[serde(default)]
    pub push_name: String,
    /// Send time.
    pub timestamp: DateTime<Utc>,
    /// Sent by this device's identity.
    #[serde(default)]
    pub from_me: bool,
    /// Sent inside a group chat.
    #[serde(default)]
    pub is_group: bool,
    /// Text body or caption.
    #[serde(default)]
    pub text: Option<String>,
    /// Downloadable media, if any.
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

/// Downloadable media attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Media category.
    pub kind: MediaKind,
    /// Declared MIME type.
    pub mimetype: String,
    /// Original file name (documents only).
    #[serde(default)]
    pub file_name: Option<String>,
    /// Opaque download reference understood by the protocol library.
    #[serde(default)]
    pub reference: serde_json::Value,
}

/// Media categories the gateway persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Photo.
    Image,
    /// Voice note or audio file.
    Audio,
    /// Arbitrary document.
    Document,
}

/// Receipt for one or more messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEvent {
    /// Messages the receipt covers.
    pub message_ids: Vec<String>,
    /// Chat the messages belong to.
    pub chat: String,
    /// Identity that produced the receipt.
    pub sender: String,
    /// Receipt time.
    pub timestamp: DateTime<Utc>,
    /// Receipt sub-kind.
    #[serde(default)]
    pub receipt_type: ReceiptType,
}

/// Receipt sub-kinds as reported on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReceiptType {
    /// Delivered to the recipient device (empty wire label).
    #[default]
    Delivered,
    /// Read by the recipient.
    Read,
    /// Read on another of our own devices.
    ReadSelf,
    /// Voice note played.
    Played,
    /// Voice note played on another of our own devices.
    PlayedSelf,
    /// Delivered to another of our own devices.
    Sender,
    /// Retry request.
    Retry,
    /// Anything else.
    Other,
}

impl From<String> for ReceiptType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "" | "delivered" => Self::Delivered,
            "read" => Self::Read,
            "read-self" => Self::ReadSelf,
            "played" => Self::Played,
            "played-self" => Self::PlayedSelf,
            "sender" => Self::Sender,
            "retry" => Self::Retry,
            _ => Self::Other,
        }
    }
}

impl From<ReceiptType> for String {
    fn from(t: ReceiptType) -> Self {
        match t {
            ReceiptType::Delivered => "delivered",
            ReceiptType::Read => "read",
            ReceiptType::ReadSelf => "read-self",
            ReceiptType::Played => "played",
            ReceiptType::PlayedSelf => "played-self",
            ReceiptType::Sender => "sender",
            ReceiptType::Retry => "retry",
            ReceiptType::Other => "other",
        }
        .to_owned()
    }
}
