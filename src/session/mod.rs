//! Session lifecycle: starting, supervising and tearing down per-tenant
//! protocol sessions.
//!
//! The [`SessionController`] runs each tenant's session as an independent
//! Tokio task (see [`supervisor`]) and keeps its runtime handles in the
//! [`SessionRegistry`]. A session moves through
//! `Idle → AwaitingIdentity → AwaitingPairing → Connected → Terminated`,
//! skipping pairing when the identity is already authenticated.

pub mod registry;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

pub use self::registry::{SessionHandle, SessionRegistry, TerminationReason, TerminationSignal};

use self::supervisor::Supervisor;
use crate::events::{EventRouter, MediaStore};
use crate::protocol::{IdentityStore, OutboundMessage, ProtocolError, SendResponse};
use crate::tenants::{parse_subscriptions, EventKind, TenantCache, TenantError, TenantRecord};
use crate::webhook::WebhookDispatcher;

// ---------------------------------------------------------------------------
// State and errors
// ---------------------------------------------------------------------------

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Start requested.
    Idle,
    /// Looking up or creating the protocol identity.
    AwaitingIdentity,
    /// Waiting for the user to complete pairing.
    AwaitingPairing,
    /// Live and authenticated.
    Connected,
    /// Torn down.
    Terminated,
}

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Malformed request; nothing was touched.
    #[error("{0}")]
    Validation(String),

    /// Operation does not fit the tenant's current session state.
    #[error("{0}")]
    State(String),

    /// The protocol library call failed.
    #[error("protocol error: {0}")]
    Downstream(#[from] ProtocolError),

    /// A critical store write failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] TenantError),
}

/// Snapshot returned by [`SessionController::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// Protocol connection is up.
    pub connected: bool,
    /// Identity is authenticated.
    pub logged_in: bool,
    /// Lifecycle state.
    pub state: SessionState,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Owns every tenant session in the process.
pub struct SessionController {
    cache: Arc<TenantCache>,
    registry: Arc<SessionRegistry>,
    identities: Arc<dyn IdentityStore>,
    dispatcher: WebhookDispatcher,
    media: MediaStore,
    connect_grace: Duration,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("connect_grace", &self.connect_grace)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create a controller with all shared dependencies.
    pub fn new(
        cache: Arc<TenantCache>,
        identities: Arc<dyn IdentityStore>,
        dispatcher: WebhookDispatcher,
        media: MediaStore,
        connect_grace: Duration,
    ) -> Self {
        Self {
            cache,
            registry: Arc::new(SessionRegistry::new()),
            identities,
            dispatcher,
            media,
            connect_grace,
        }
    }

    /// Tenant cache shared with the HTTP layer.
    pub fn cache(&self) -> &Arc<TenantCache> {
        &self.cache
    }

    /// Live session table.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start a session for `tenant` and return its handle.
    ///
    /// Returns once the session is registered; pairing and connecting happen
    /// on the session's own task.
    ///
    /// # Errors
    ///
    /// - [`SessionError::State`] if the tenant already has a live session.
    /// - [`SessionError::Downstream`] if the identity cannot be looked up or
    ///   created. Nothing is registered in that case.
    pub async fn start(&self, tenant: &TenantRecord) -> Result<SessionHandle, SessionError> {
        self.launch(tenant, None).await
    }

    /// Handle a connect request: start the session, persist subscriptions
    /// once it is registered and, unless `immediate`, wait for it to come up.
    ///
    /// A rejected connect leaves the stored subscriptions untouched.
    ///
    /// # Errors
    ///
    /// - [`SessionError::State`] if a session is already live.
    /// - [`SessionError::Persistence`] if the subscription list cannot be
    ///   stored. The just-registered session is withdrawn.
    /// - [`SessionError::Downstream`] if the session fails to start or does not
    ///   connect within the grace period.
    pub async fn connect(
        &self,
        tenant: &TenantRecord,
        subscribe: &[String],
        immediate: bool,
    ) -> Result<SessionStatus, SessionError> {
        let events = parse_subscriptions(subscribe.iter().map(String::as_str));
        let handle = self.launch(tenant, Some(events.as_slice())).await?;
        if !immediate {
            self.await_connected(&handle).await?;
        }
        Ok(SessionStatus {
            connected: handle.client.is_connected().await,
            logged_in: handle.client.is_authenticated().await,
            state: handle.current_state(),
        })
    }

    // Registers the session, then persists `subscriptions` (if any) before the
    // supervisor and router are spawned. Nothing is written unless `put` wins.
    async fn launch(
        &self,
        tenant: &TenantRecord,
        subscriptions: Option<&[EventKind]>,
    ) -> Result<SessionHandle, SessionError> {
        let tenant_id = tenant.id;
        if self.registry.contains(tenant_id).await {
            return Err(SessionError::State("already connected".to_owned()));
        }

        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let state = Arc::new(state_tx);
        state.send_replace(SessionState::AwaitingIdentity);

        let client = self
            .identities
            .lookup_or_create(tenant.network_identity.as_deref())
            .await
            .inspect_err(|e| warn!(tenant_id, error = %e, "identity lookup failed"))?;

        let handle = SessionHandle {
            tenant_id,
            client: Arc::clone(&client),
            webhook: self.dispatcher.clone(),
            state: state_rx,
        };
        let (signal, termination) = TerminationSignal::new();
        self.registry.put(handle.clone(), signal).await?;

        let mut tenant = tenant.clone();
        if let Some(events) = subscriptions {
            if let Err(e) = self.cache.set_events(&tenant, events).await {
                warn!(tenant_id, error = %e, "failed to persist subscriptions");
                self.registry.remove(tenant_id).await;
                state.send_replace(SessionState::Terminated);
                return Err(e.into());
            }
            tenant.events = events.to_vec();
        }

        let router = EventRouter::new(
            tenant.clone(),
            Arc::clone(&client),
            Arc::clone(&self.cache),
            Arc::clone(&self.registry),
            self.dispatcher.clone(),
            self.media.clone(),
            Arc::clone(&state),
        );
        let supervisor = Supervisor {
            tenant,
            client,
            cache: Arc::clone(&self.cache),
            registry: Arc::clone(&self.registry),
            state,
        };
        tokio::spawn(supervisor.run(router, termination));

        info!(tenant_id, "session started");
        Ok(handle)
    }

    async fn await_connected(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        let mut state = handle.state.clone();
        let settled = tokio::time::timeout(
            self.connect_grace,
            state.wait_for(|s| matches!(s, SessionState::Connected | SessionState::Terminated)),
        )
        .await;

        match settled {
            Ok(Ok(s)) if *s == SessionState::Connected => Ok(()),
            Ok(_) => Err(SessionError::Downstream(ProtocolError::NotConnected)),
            // Still pairing is fine: the QR code is available through `qr`.
            Err(_) if handle.current_state() == SessionState::AwaitingPairing => Ok(()),
            Err(_) => Err(SessionError::Downstream(ProtocolError::Rejected(
                "session did not connect in time".to_owned(),
            ))),
        }
    }

    /// Request termination of the tenant's session.
    ///
    /// # Errors
    ///
    /// [`SessionError::State`] if there is no live, connected and logged-in session.
    pub async fn disconnect(&self, tenant: &TenantRecord) -> Result<(), SessionError> {
        let handle = self.live_session(tenant.id).await?;
        if !handle.client.is_connected().await {
            return Err(SessionError::State(
                "cannot disconnect because it is not connected".to_owned(),
            ));
        }
        if !handle.client.is_authenticated().await {
            return Err(SessionError::State(
                "cannot disconnect because it is not logged in".to_owned(),
            ));
        }
        self.registry
            .signal(tenant.id, TerminationReason::Requested)
            .await;
        info!(tenant_id = tenant.id, "disconnect requested");
        Ok(())
    }

    /// Unlink the device from the network identity and terminate the session.
    ///
    /// # Errors
    ///
    /// - [`SessionError::State`] without a live, connected, logged-in session.
    /// - [`SessionError::Downstream`] if the protocol logout fails.
    pub async fn logout(&self, tenant: &TenantRecord) -> Result<(), SessionError> {
        let handle = self.live_session(tenant.id).await?;
        if !handle.client.is_authenticated().await || !handle.client.is_connected().await {
            return Err(SessionError::State(
                "could not logout as it was not logged in".to_owned(),
            ));
        }
        handle.client.logout().await?;
        self.registry
            .signal(tenant.id, TerminationReason::Requested)
            .await;
        info!(tenant_id = tenant.id, "logged out");
        Ok(())
    }

    /// Connection status of the tenant's session.
    ///
    /// # Errors
    ///
    /// [`SessionError::State`] if there is no live session.
    pub async fn status(&self, tenant: &TenantRecord) -> Result<SessionStatus, SessionError> {
        let handle = self.live_session(tenant.id).await?;
        Ok(SessionStatus {
            connected: handle.client.is_connected().await,
            logged_in: handle.client.is_authenticated().await,
            state: handle.current_state(),
        })
    }

    /// Current pairing QR code as a data URL (empty until the first code arrives).
    ///
    /// # Errors
    ///
    /// - [`SessionError::State`] if there is no live session, it is not
    ///   connected, or it is already logged in.
    /// - [`SessionError::Persistence`] if the store read fails.
    pub async fn qr(&self, tenant: &TenantRecord) -> Result<String, SessionError> {
        let handle = self.live_session(tenant.id).await?;
        if !handle.client.is_connected().await {
            return Err(SessionError::State("not connected".to_owned()));
        }
        if handle.client.is_authenticated().await {
            return Err(SessionError::State("already logged in".to_owned()));
        }
        Ok(self.cache.store().pairing_code(tenant.id).await?)
    }

    /// Request a phone-linking code for `phone`.
    ///
    /// The code is persisted as the pairing snapshot and returned.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Validation`] for an empty phone number.
    /// - [`SessionError::State`] without a live session or when already paired.
    /// - [`SessionError::Downstream`] if the protocol call fails.
    pub async fn pair_phone(
        &self,
        tenant: &TenantRecord,
        phone: &str,
    ) -> Result<String, SessionError> {
        let phone = phone.trim();
        if phone.is_empty() {
            return Err(SessionError::Validation("missing Phone in payload".to_owned()));
        }
        let handle = self.live_session(tenant.id).await?;
        if handle.client.is_authenticated().await {
            return Err(SessionError::State("already paired".to_owned()));
        }

        let code = handle.client.request_phone_linking_code(phone).await?;
        if let Err(e) = self.cache.store().set_pairing_code(tenant.id, &code).await {
            warn!(tenant_id = tenant.id, error = %e, "failed to persist linking code");
        }
        info!(tenant_id = tenant.id, "phone linking code issued");
        Ok(code)
    }

    /// Send a text message through the tenant's session.
    ///
    /// A missing `id` is generated.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Validation`] for a missing phone or body.
    /// - [`SessionError::State`] without a live session.
    /// - [`SessionError::Downstream`] if the send fails.
    pub async fn send_text(
        &self,
        tenant: &TenantRecord,
        phone: &str,
        body: &str,
        id: Option<String>,
    ) -> Result<SendResponse, SessionError> {
        if phone.trim().is_empty() {
            return Err(SessionError::Validation("missing Phone in payload".to_owned()));
        }
        if body.is_empty() {
            return Err(SessionError::Validation("missing Body in payload".to_owned()));
        }
        let handle = self.live_session(tenant.id).await?;

        let message = OutboundMessage {
            id: id
                .filter(|i| !i.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string().to_uppercase()),
            text: body.to_owned(),
        };
        let recipient = recipient_address(phone);
        let response = handle.client.send_message(&recipient, &message).await?;
        info!(tenant_id = tenant.id, id = %response.id, "message sent");
        Ok(response)
    }

    /// Start a session for every tenant whose persisted `connected` flag is set.
    ///
    /// Failures are logged per tenant and never stop the others. Returns the
    /// number of sessions started.
    ///
    /// # Errors
    ///
    /// Returns an error only if the connected tenants cannot be listed.
    pub async fn resume_connected(&self) -> Result<usize, TenantError> {
        let tenants = self.cache.store().connected_tenants().await?;
        let mut started: usize = 0;
        for tenant in tenants {
            info!(tenant_id = tenant.id, events = ?tenant.events, "resuming session");
            self.cache.insert(tenant.clone()).await;
            match self.start(&tenant).await {
                Ok(_) => started = started.saturating_add(1),
                Err(e) => warn!(tenant_id = tenant.id, error = %e, "failed to resume session"),
            }
        }
        Ok(started)
    }

    /// Disconnect every session without clearing the persisted `connected`
    /// flag, then wait up to `wait` for the supervisors to finish teardown.
    pub async fn shutdown_all(&self, wait: Duration) {
        let handles = self.registry.handles().await;
        let signalled = self.registry.signal_all(TerminationReason::Shutdown).await;
        info!(signalled, "shutting down sessions");

        let settled = tokio::time::timeout(wait, async {
            for handle in handles {
                let mut state = handle.state.clone();
                // Err means the supervisor is already gone.
                let _ = state.wait_for(|s| *s == SessionState::Terminated).await;
            }
        })
        .await;
        match settled {
            Ok(()) => info!("all sessions shut down"),
            Err(_) => warn!(
                remaining = self.registry.len().await,
                "sessions still live at shutdown deadline"
            ),
        }
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    async fn live_session(&self, tenant_id: i64) -> Result<SessionHandle, SessionError> {
        self.registry
            .get(tenant_id)
            .await
            .ok_or_else(|| SessionError::State("no session".to_owned()))
    }
}

/// Turn a bare phone number into a user address; full addresses pass through.
pub fn recipient_address(phone: &str) -> String {
    let phone = phone.trim().trim_start_matches('+');
    if phone.contains('@') {
        phone.to_owned()
    } else {
        format!("{phone}@s.whatsapp.net")
    }
}
