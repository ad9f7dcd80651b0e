//! Token-keyed read-through cache over [`TenantStore`].
//!
//! Consistency rule: every mutation goes to the store first and only touches
//! the cached snapshot once the store write has succeeded. A failed store
//! write leaves the cache as it was.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use super::{EventKind, TenantError, TenantRecord, TenantStore};

/// Concurrent read-through cache of tenant snapshots.
#[derive(Debug)]
pub struct TenantCache {
    store: TenantStore,
    entries: RwLock<HashMap<String, TenantRecord>>,
}

impl TenantCache {
    /// Create an empty cache backed by `store`.
    pub fn new(store: TenantStore) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Backing store.
    pub fn store(&self) -> &TenantStore {
        &self.store
    }

    /// Resolve an auth token to a tenant, loading from the store on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`TenantError::Database`] if the store lookup fails.
    pub async fn authenticate(&self, token: &str) -> Result<Option<TenantRecord>, TenantError> {
        if let Some(record) = self.get(token).await {
            return Ok(Some(record));
        }

        let Some(record) = self.store.find_by_token(token).await? else {
            return Ok(None);
        };
        debug!(tenant_id = record.id, "tenant cache filled from store");
        self.insert(record.clone()).await;
        Ok(Some(record))
    }

    /// Cached snapshot for `token`, without touching the store.
    pub async fn get(&self, token: &str) -> Option<TenantRecord> {
        self.entries.read().await.get(token).cloned()
    }

    /// Replace the cached snapshot for the record's token.
    pub async fn insert(&self, record: TenantRecord) {
        self.entries
            .write()
            .await
            .insert(record.token.clone(), record);
    }

    /// Drop the cached snapshot for `token`.
    pub async fn invalidate(&self, token: &str) {
        self.entries.write().await.remove(token);
    }

    /// Re-read the tenant from the store and replace the cached snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails or the tenant is gone.
    pub async fn refresh(&self, tenant_id: i64) -> Result<TenantRecord, TenantError> {
        let record = self
            .store
            .find_by_id(tenant_id)
            .await?
            .ok_or(TenantError::NotFound(tenant_id))?;
        self.insert(record.clone()).await;
        Ok(record)
    }

    /// Persist a new webhook URL, then update the cached snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails; the cache is left untouched.
    pub async fn set_webhook(&self, tenant: &TenantRecord, url: &str) -> Result<(), TenantError> {
        self.store.set_webhook(tenant.id, url).await?;
        self.patch(tenant, |r| r.webhook_url = url.to_owned()).await;
        Ok(())
    }

    /// Persist a subscription list, then update the cached snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails; the cache is left untouched.
    pub async fn set_events(
        &self,
        tenant: &TenantRecord,
        events: &[EventKind],
    ) -> Result<(), TenantError> {
        self.store.set_events(tenant.id, events).await?;
        self.patch(tenant, |r| r.events = events.to_vec()).await;
        Ok(())
    }

    /// Persist a newly assigned network identity, then update the cached snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails; the cache is left untouched.
    pub async fn set_network_identity(
        &self,
        tenant: &TenantRecord,
        identity: &str,
    ) -> Result<(), TenantError> {
        self.store.set_network_identity(tenant.id, identity).await?;
        self.patch(tenant, |r| r.network_identity = Some(identity.to_owned()))
            .await;
        Ok(())
    }

    /// Persist the connection flag, then update the cached snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails; the cache is left untouched.
    pub async fn set_connected(
        &self,
        tenant: &TenantRecord,
        connected: bool,
    ) -> Result<(), TenantError> {
        self.store.set_connected(tenant.id, connected).await?;
        self.patch(tenant, |r| r.connected = connected).await;
        Ok(())
    }

    // Applies `f` to the cached entry, seeding it from `tenant` if absent.
    async fn patch(&self, tenant: &TenantRecord, f: impl FnOnce(&mut TenantRecord)) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(tenant.token.clone())
            .or_insert_with(|| tenant.clone());
        f(entry);
    }
}
