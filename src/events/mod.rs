//! Per-tenant event router.
//!
//! Consumes a tenant's inbound protocol events in arrival order, performs the
//! local side effects each kind requires, and hands qualifying events to the
//! [`WebhookDispatcher`]. Delivery runs on its own task, so a slow callback
//! endpoint never holds up the next event. A failure while handling one event
//! is logged and never stops the loop.

pub mod media;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub use self::media::MediaStore;

use crate::protocol::{
    InboundEvent, MessageEvent, PresenceState, ProtocolClient, ReceiptEvent, ReceiptType,
};
use crate::session::registry::{SessionRegistry, TerminationReason};
use crate::session::SessionState;
use crate::tenants::{is_subscribed, EventKind, TenantCache, TenantRecord};
use crate::webhook::{WebhookDispatcher, WebhookJob};

/// What the router did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handed to the dispatcher.
    Forwarded(WebhookJob),
    /// Would have been forwarded but the dispatcher's in-flight cap was reached.
    Throttled,
    /// Tenant is not subscribed to this kind.
    NotSubscribed,
    /// Tenant has no webhook URL.
    NoWebhook,
    /// Side effects only; this kind is never forwarded.
    Handled,
    /// Ignored (unsupported receipt sub-kind, unmodelled event).
    Discarded,
    /// A required side effect failed; nothing was forwarded.
    Failed,
}

/// Routes one tenant's inbound events.
pub struct EventRouter {
    tenant: TenantRecord,
    client: Arc<dyn ProtocolClient>,
    cache: Arc<TenantCache>,
    registry: Arc<SessionRegistry>,
    dispatcher: WebhookDispatcher,
    media: MediaStore,
    state: Arc<watch::Sender<SessionState>>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("tenant_id", &self.tenant.id)
            .finish_non_exhaustive()
    }
}

impl EventRouter {
    /// Create a router for `tenant`.
    pub fn new(
        tenant: TenantRecord,
        client: Arc<dyn ProtocolClient>,
        cache: Arc<TenantCache>,
        registry: Arc<SessionRegistry>,
        dispatcher: WebhookDispatcher,
        media: MediaStore,
        state: Arc<watch::Sender<SessionState>>,
    ) -> Self {
        Self {
            tenant,
            client,
            cache,
            registry,
            dispatcher,
            media,
            state,
        }
    }

    /// Process events until the sending side closes.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<InboundEvent>) {
        while let Some(event) = events.recv().await {
            let kind = event.kind().to_owned();
            let disposition = self.handle(event).await;
            debug!(tenant_id = self.tenant.id, kind = %kind, ?disposition, "event routed");
        }
        debug!(tenant_id = self.tenant.id, "event stream closed");
    }

    /// Handle a single event.
    pub async fn handle(&self, event: InboundEvent) -> Disposition {
        let tenant_id = self.tenant.id;
        match &event {
            InboundEvent::PairSuccess { id, platform, .. } => {
                info!(tenant_id, jid = %id, platform = %platform, "pairing succeeded");
                match self.cache.set_network_identity(&self.tenant, id).await {
                    Ok(()) => Disposition::Handled,
                    Err(e) => {
                        error!(tenant_id, error = %e, "failed to persist network identity");
                        Disposition::Failed
                    }
                }
            }
            InboundEvent::Connected => self.on_connected().await,
            InboundEvent::LoggedOut { reason } => {
                info!(tenant_id, reason = %reason, "logged out by the network");
                if let Err(e) = self.cache.set_connected(&self.tenant, false).await {
                    warn!(tenant_id, error = %e, "failed to clear connected flag");
                }
                self.registry
                    .signal(tenant_id, TerminationReason::LoggedOut)
                    .await;
                Disposition::Handled
            }
            InboundEvent::Message(message) => self.on_message(&event, message).await,
            InboundEvent::Receipt(receipt) => self.on_receipt(&event, receipt).await,
            InboundEvent::Presence {
                from, unavailable, ..
            } => {
                let state = if *unavailable { "offline" } else { "online" };
                info!(tenant_id, from = %from, state, "presence");
                self.forward(EventKind::Presence, &event, Some(state), None)
                    .await
            }
            InboundEvent::ChatPresence {
                chat, state, media, ..
            } => {
                info!(tenant_id, chat = %chat, state = %state, media = %media, "chat presence");
                self.forward(EventKind::ChatPresence, &event, Some(state.as_str()), None)
                    .await
            }
            InboundEvent::HistorySync { data } => {
                match self.media.save_history(tenant_id, data).await {
                    Ok(path) => {
                        info!(tenant_id, path = %path.display(), "history sync saved");
                        self.forward(EventKind::HistorySync, &event, None, None)
                            .await
                    }
                    Err(e) => {
                        error!(tenant_id, error = %e, "failed to save history sync");
                        Disposition::Failed
                    }
                }
            }
            InboundEvent::AppStateSyncComplete { name } => {
                info!(tenant_id, name = %name, "app state sync complete");
                Disposition::Handled
            }
            InboundEvent::AppState { index, .. } => {
                info!(tenant_id, index = ?index, "app state event");
                Disposition::Handled
            }
            InboundEvent::StreamReplaced => {
                info!(tenant_id, "stream replaced by another client");
                Disposition::Handled
            }
            InboundEvent::CallSignal { kind, from, call_id } => {
                info!(tenant_id, kind = %kind, from = %from, call_id = %call_id, "call signal");
                Disposition::Handled
            }
            InboundEvent::Unhandled { kind } => {
                warn!(tenant_id, kind = %kind, "unhandled event");
                Disposition::Discarded
            }
        }
    }

    async fn on_connected(&self) -> Disposition {
        let tenant_id = self.tenant.id;
        let current = *self.state.borrow();
        if current == SessionState::Terminated {
            debug!(tenant_id, "connected after teardown, ignoring");
            return Disposition::Discarded;
        }
        if self.client.display_name().await.is_some() {
            match self.client.send_presence(PresenceState::Available).await {
                Ok(()) => info!(tenant_id, "marked self as available"),
                Err(e) => warn!(tenant_id, error = %e, "failed to send available presence"),
            }
        }
        // Reconnects within one session keep the flag already written.
        if current == SessionState::Connected {
            debug!(tenant_id, "session reconnected");
            return Disposition::Handled;
        }
        if let Err(e) = self.cache.set_connected(&self.tenant, true).await {
            warn!(tenant_id, error = %e, "failed to persist connected flag");
        }
        self.state.send_replace(SessionState::Connected);
        info!(tenant_id, "session connected");
        Disposition::Handled
    }

    async fn on_message(&self, event: &InboundEvent, message: &MessageEvent) -> Disposition {
        let tenant_id = self.tenant.id;
        info!(
            tenant_id,
            id = %message.id,
            chat = %message.chat,
            push_name = %message.push_name,
            "message received"
        );

        let mut file = None;
        if let Some(attachment) = &message.attachment {
            let bytes = match self.client.download(attachment).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(tenant_id, id = %message.id, error = %e, "failed to download attachment");
                    return Disposition::Failed;
                }
            };
            match self
                .media
                .save_attachment(tenant_id, &message.id, attachment, &bytes)
                .await
            {
                Ok(path) => file = Some(path),
                Err(e) => {
                    error!(tenant_id, id = %message.id, error = %e, "failed to save attachment");
                    return Disposition::Failed;
                }
            }
        }

        self.forward(EventKind::Message, event, None, file).await
    }

    async fn on_receipt(&self, event: &InboundEvent, receipt: &ReceiptEvent) -> Disposition {
        let state = match receipt.receipt_type {
            ReceiptType::Read => "Read",
            ReceiptType::ReadSelf => "ReadSelf",
            ReceiptType::Delivered => "Delivered",
            other => {
                debug!(tenant_id = self.tenant.id, receipt_type = ?other, "receipt discarded");
                return Disposition::Discarded;
            }
        };
        info!(
            tenant_id = self.tenant.id,
            ids = ?receipt.message_ids,
            chat = %receipt.chat,
            state,
            "receipt"
        );
        self.forward(EventKind::ReadReceipt, event, Some(state), None)
            .await
    }

    // Applies the subscription and webhook checks, then enqueues delivery.
    async fn forward(
        &self,
        kind: EventKind,
        event: &InboundEvent,
        state: Option<&str>,
        file: Option<PathBuf>,
    ) -> Disposition {
        let tenant = self.current_tenant().await;
        if !is_subscribed(&tenant.events, kind) {
            debug!(tenant_id = tenant.id, kind = %kind, "not subscribed, skipping webhook");
            return Disposition::NotSubscribed;
        }
        if tenant.webhook_url.is_empty() {
            warn!(tenant_id = tenant.id, kind = %kind, "no webhook set for tenant");
            return Disposition::NoWebhook;
        }

        let mut payload = json!({ "type": kind.as_str(), "event": event });
        if let Some(state) = state {
            payload["state"] = json!(state);
        }
        let job = WebhookJob {
            kind: kind.as_str().to_owned(),
            payload: payload.to_string(),
            token: tenant.token.clone(),
            url: tenant.webhook_url.clone(),
            file,
        };
        match self.dispatcher.deliver(job.clone()) {
            Some(_) => Disposition::Forwarded(job),
            None => Disposition::Throttled,
        }
    }

    // Latest snapshot, so webhook and subscription changes apply mid-session.
    async fn current_tenant(&self) -> TenantRecord {
        match self.cache.authenticate(&self.tenant.token).await {
            Ok(Some(record)) => record,
            Ok(None) => self.tenant.clone(),
            Err(e) => {
                warn!(tenant_id = self.tenant.id, error = %e, "tenant lookup failed, using session snapshot");
                self.tenant.clone()
            }
        }
    }
}
