//! Tenant id → live session table.
//!
//! Readers (HTTP handlers, status queries) share a read lock; registering and
//! unregistering take the write lock briefly. Nothing awaits while a guard is
//! held, so one tenant's mutation never stalls lookups for another.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, watch, RwLock};
use tracing::debug;

use super::{SessionError, SessionState};
use crate::protocol::ProtocolClient;
use crate::webhook::WebhookDispatcher;

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Disconnect or logout requested through the API.
    Requested,
    /// The network unlinked the device.
    LoggedOut,
    /// Process shutdown; the persisted `connected` flag is kept so the session resumes.
    Shutdown,
}

impl TerminationReason {
    /// Whether teardown should persist `connected = false`.
    pub fn clears_connected_flag(self) -> bool {
        !matches!(self, Self::Shutdown)
    }
}

/// Sending half of a session's one-shot termination channel.
#[derive(Debug)]
pub struct TerminationSignal(oneshot::Sender<TerminationReason>);

impl TerminationSignal {
    /// Create a signal and the receiver its supervisor waits on.
    pub fn new() -> (Self, oneshot::Receiver<TerminationReason>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Deliver `reason`. Never blocks; returns `false` if the supervisor is gone.
    pub fn fire(self, reason: TerminationReason) -> bool {
        self.0.send(reason).is_ok()
    }
}

/// Runtime handles for one live session.
#[derive(Clone)]
pub struct SessionHandle {
    /// Owning tenant.
    pub tenant_id: i64,
    /// Protocol connection for this tenant.
    pub client: Arc<dyn ProtocolClient>,
    /// Outbound HTTP client used for this tenant's webhooks.
    pub webhook: WebhookDispatcher,
    /// Lifecycle state published by the supervisor and event router.
    pub state: watch::Receiver<SessionState>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("tenant_id", &self.tenant_id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Current lifecycle state.
    pub fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }
}

struct Entry {
    handle: SessionHandle,
    // Taken on first signal; a second signal finds `None`.
    signal: Option<TerminationSignal>,
}

/// Concurrency-safe registry of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<i64, Entry>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::State`] if the tenant already has a live
    /// session; the existing entry is left untouched.
    pub async fn put(
        &self,
        handle: SessionHandle,
        signal: TerminationSignal,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let tenant_id = handle.tenant_id;
        if sessions.contains_key(&tenant_id) {
            return Err(SessionError::State("already connected".to_owned()));
        }
        sessions.insert(
            tenant_id,
            Entry {
                handle,
                signal: Some(signal),
            },
        );
        debug!(tenant_id, "session registered");
        Ok(())
    }

    /// Live session for `tenant_id`, if any.
    pub async fn get(&self, tenant_id: i64) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&tenant_id)
            .map(|e| e.handle.clone())
    }

    /// Whether `tenant_id` has a live session.
    pub async fn contains(&self, tenant_id: i64) -> bool {
        self.sessions.read().await.contains_key(&tenant_id)
    }

    /// Unregister a session. Called by its supervisor on exit, or by the
    /// controller when a start is withdrawn before its supervisor runs.
    pub async fn remove(&self, tenant_id: i64) -> Option<SessionHandle> {
        let removed = self.sessions.write().await.remove(&tenant_id);
        if removed.is_some() {
            debug!(tenant_id, "session unregistered");
        }
        removed.map(|e| e.handle)
    }

    /// Ask the tenant's supervisor to terminate.
    ///
    /// Returns immediately. An absent tenant, or one already signalled, is
    /// treated as already terminating and yields `false`.
    pub async fn signal(&self, tenant_id: i64, reason: TerminationReason) -> bool {
        let signal = self
            .sessions
            .write()
            .await
            .get_mut(&tenant_id)
            .and_then(|e| e.signal.take());
        match signal {
            Some(signal) => signal.fire(reason),
            None => {
                debug!(tenant_id, "no live session to signal");
                false
            }
        }
    }

    /// Signal every live session.
    pub async fn signal_all(&self, reason: TerminationReason) -> usize {
        let signals: Vec<TerminationSignal> = self
            .sessions
            .write()
            .await
            .values_mut()
            .filter_map(|e| e.signal.take())
            .collect();
        signals
            .into_iter()
            .map(|s| s.fire(reason))
            .filter(|delivered| *delivered)
            .count()
    }

    /// Handles of every live session.
    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .await
            .values()
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session is live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Ids of every live session.
    pub async fn tenant_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
