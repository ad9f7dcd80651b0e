//! HTTP client for a protocol sidecar.
//!
//! The sidecar owns the wire protocol and the device store. Each tenant gets
//! a device on the sidecar; the gateway drives it through a small REST API
//! and receives pairing codes and inbound events by long-polling.
//!
//! | Call | Route |
//! |------|-------|
//! | lookup/create device | `POST /devices` |
//! | status | `GET /devices/{id}/status` |
//! | connect / disconnect / logout | `POST /devices/{id}/{op}` |
//! | phone linking | `POST /devices/{id}/pair-phone` |
//! | pairing stream | `GET /devices/{id}/qr/poll` |
//! | inbound events | `GET /devices/{id}/events/poll` |
//! | presence / send / download | `POST /devices/{id}/{op}` |

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Attachment, EventSink, IdentityStore, InboundEvent, OutboundMessage, PairingEvent,
    PresenceState, ProtocolClient, ProtocolError, SendResponse,
};

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for normal operations.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum reconnect backoff (milliseconds).
const MAX_BACKOFF_MS: u64 = 30_000;

/// Buffered pairing events per stream.
const PAIRING_CHANNEL_CAPACITY: usize = 8;

/// Response envelope from the sidecar HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> BridgeResponse<T> {
    fn into_result(self) -> Result<Option<T>, ProtocolError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(ProtocolError::Rejected(
                self.error.unwrap_or_else(|| "unknown sidecar error".to_owned()),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeviceInfo {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceStatus {
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    logged_in: bool,
    #[serde(default)]
    jid: Option<String>,
    #[serde(default)]
    push_name: Option<String>,
}

#[derive(Serialize)]
struct DeviceRequest<'a> {
    jid: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Transport {
    client: reqwest::Client,
    poll_client: reqwest::Client,
    base_url: String,
}

impl Transport {
    fn new(base_url: &str, poll_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        let poll_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(poll_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build long-poll client, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            poll_client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<Option<T>, ProtocolError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.client.post(self.url(path)).json(body).send().await?;
        let envelope: BridgeResponse<T> = resp.json().await?;
        envelope.into_result()
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ProtocolError> {
        let resp = self.client.get(self.url(path)).send().await?;
        let envelope: BridgeResponse<T> = resp.json().await?;
        envelope.into_result()
    }
}

// ---------------------------------------------------------------------------
// Identity store
// ---------------------------------------------------------------------------

/// [`IdentityStore`] backed by the sidecar's device store.
pub struct BridgeProvider {
    transport: Transport,
}

impl BridgeProvider {
    /// Create a provider for the sidecar at `base_url`.
    pub fn new(base_url: &str, poll_timeout: Duration) -> Self {
        Self {
            transport: Transport::new(base_url, poll_timeout),
        }
    }
}

#[async_trait]
impl IdentityStore for BridgeProvider {
    async fn lookup_or_create(
        &self,
        known_identity: Option<&str>,
    ) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        let body = DeviceRequest {
            jid: known_identity,
        };
        let device: DeviceInfo = self
            .transport
            .post("/devices", &body)
            .await
            .map_err(|e| ProtocolError::Identity(e.to_string()))?
            .ok_or_else(|| ProtocolError::Identity("sidecar returned no device".to_owned()))?;

        debug!(device = %device.id, known = known_identity.is_some(), "device acquired");
        Ok(Arc::new(BridgeClient {
            transport: self.transport.clone(),
            device_id: device.id,
            sink: Mutex::new(None),
            listener: Mutex::new(None),
        }))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One device on the sidecar.
pub struct BridgeClient {
    transport: Transport,
    device_id: String,
    sink: Mutex<Option<EventSink>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeClient {
    fn path(&self, op: &str) -> String {
        format!("/devices/{}/{op}", self.device_id)
    }

    async fn status(&self) -> DeviceStatus {
        match self.transport.get::<DeviceStatus>(&self.path("status")).await {
            Ok(status) => status.unwrap_or_default(),
            Err(e) => {
                debug!(device = %self.device_id, error = %e, "status query failed");
                DeviceStatus::default()
            }
        }
    }

    async fn command(&self, op: &str) -> Result<(), ProtocolError> {
        self.transport
            .post::<_, serde_json::Value>(&self.path(op), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    fn start_listener(&self) {
        let Some(sink) = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let url = self.transport.url(&self.path("events/poll"));
        *listener = Some(spawn_event_listener(
            self.transport.poll_client.clone(),
            url,
            sink,
        ));
    }

    fn stop_listener(&self) {
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn network_identity(&self) -> Option<String> {
        self.status().await.jid.filter(|j| !j.is_empty())
    }

    async fn display_name(&self) -> Option<String> {
        self.status().await.push_name.filter(|n| !n.is_empty())
    }

    async fn is_connected(&self) -> bool {
        self.status().await.connected
    }

    async fn is_authenticated(&self) -> bool {
        self.status().await.logged_in
    }

    async fn connect(&self) -> Result<(), ProtocolError> {
        self.start_listener();
        self.command("connect").await
    }

    async fn disconnect(&self) {
        if let Err(e) = self.command("disconnect").await {
            warn!(device = %self.device_id, error = %e, "sidecar disconnect failed");
        }
        self.stop_listener();
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.command("logout").await
    }

    async fn request_phone_linking_code(&self, phone: &str) -> Result<String, ProtocolError> {
        self.transport
            .post(&self.path("pair-phone"), &serde_json::json!({ "phone": phone }))
            .await?
            .ok_or_else(|| ProtocolError::Rejected("no linking code returned".to_owned()))
    }

    async fn open_pairing_channel(&self) -> Result<mpsc::Receiver<PairingEvent>, ProtocolError> {
        if self.is_authenticated().await {
            return Err(ProtocolError::AlreadyLoggedIn);
        }
        let (tx, rx) = mpsc::channel(PAIRING_CHANNEL_CAPACITY);
        let url = self.transport.url(&self.path("qr/poll"));
        tokio::spawn(poll_pairing(self.transport.poll_client.clone(), url, tx));
        Ok(rx)
    }

    fn register_event_handler(&self, sink: EventSink) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    async fn send_presence(&self, state: PresenceState) -> Result<(), ProtocolError> {
        self.transport
            .post::<_, serde_json::Value>(
                &self.path("presence"),
                &serde_json::json!({ "state": state }),
            )
            .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        recipient: &str,
        message: &OutboundMessage,
    ) -> Result<SendResponse, ProtocolError> {
        let body = serde_json::json!({ "to": recipient, "id": message.id, "text": message.text });
        self.transport
            .post(&self.path("send"), &body)
            .await?
            .ok_or_else(|| ProtocolError::Rejected("no send receipt returned".to_owned()))
    }

    async fn download(&self, attachment: &Attachment) -> Result<Vec<u8>, ProtocolError> {
        let resp = self
            .transport
            .client
            .post(self.transport.url(&self.path("download")))
            .json(attachment)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Long-poll loops
// ---------------------------------------------------------------------------

/// Forward pairing events until a terminal one arrives or the receiver goes away.
async fn poll_pairing(client: reqwest::Client, url: String, tx: mpsc::Sender<PairingEvent>) {
    let mut backoff_ms: u64 = 1000;
    loop {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                backoff_ms = 1000;
                let events = match resp.json::<Vec<PairingEvent>>().await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "undecodable pairing poll response");
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        continue;
                    }
                };
                for event in events {
                    let terminal = matches!(event, PairingEvent::Timeout | PairingEvent::Success);
                    if tx.send(event).await.is_err() || terminal {
                        return;
                    }
                }
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "pairing poll returned non-200");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
            }
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!(error = %e, backoff_ms, "pairing poll failed, retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
            }
        }
        if tx.is_closed() {
            return;
        }
    }
}

/// Spawn the inbound event listener for one device.
///
/// Reconnects with exponential backoff; exits when the sink is dropped.
fn spawn_event_listener(client: reqwest::Client, url: String, sink: EventSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff_ms: u64 = 1000;
        info!(url = %url, "connecting to sidecar event stream");

        loop {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    backoff_ms = 1000;
                    let Ok(events) = resp.json::<Vec<serde_json::Value>>().await else {
                        warn!("undecodable event poll response");
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        continue;
                    };
                    for raw in events {
                        if sink.send(InboundEvent::from_json(raw)).is_err() {
                            debug!("event sink closed, stopping listener");
                            return;
                        }
                    }
                }
                Ok(resp) => {
                    debug!(status = %resp.status(), "event poll returned non-200");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                }
                Err(e) if e.is_timeout() => {}
                Err(e) => {
                    warn!(error = %e, backoff_ms, "sidecar event stream error, reconnecting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                }
            }
            if sink.is_closed() {
                return;
            }
        }
    })
}
