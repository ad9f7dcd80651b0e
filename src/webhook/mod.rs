//! Webhook dispatcher: at-most-once, fire-and-forget delivery of forwarded
//! events to a tenant's callback URL.
//!
//! Each job runs on its own task so the event router never waits on a slow
//! endpoint. Failures are logged and dropped. An optional in-flight cap
//! bounds the number of concurrent deliveries; jobs beyond the cap are
//! dropped with a warning rather than queued.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;

/// Errors from a single delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Transport failure (timeout, refused connection, too many redirects).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("endpoint returned {0}")]
    Status(reqwest::StatusCode),

    /// The attachment could not be read.
    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        /// Attachment path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// One delivery, consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookJob {
    /// Event kind label, for logs.
    pub kind: String,
    /// Serialized event, sent as the `jsonData` form field.
    pub payload: String,
    /// Tenant auth token, sent as the `token` form field.
    pub token: String,
    /// Callback URL.
    pub url: String,
    /// Attachment sent as the multipart `file` part.
    pub file: Option<PathBuf>,
}

/// Outbound webhook sender shared by every tenant session.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    permits: Option<Arc<Semaphore>>,
}

impl std::fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDispatcher")
            .field("max_in_flight", &self.permits.as_ref().map(|_| "bounded"))
            .finish_non_exhaustive()
    }
}

impl WebhookDispatcher {
    /// Build a dispatcher from webhook settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &WebhookConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        let permits = config
            .max_in_flight
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Ok(Self { client, permits })
    }

    /// Hand a job to its own delivery task and return immediately.
    ///
    /// Returns `None` when the in-flight cap is reached and the job was dropped.
    pub fn deliver(&self, job: WebhookJob) -> Option<JoinHandle<()>> {
        let permit = match &self.permits {
            Some(sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(kind = %job.kind, url = %job.url, "webhook in-flight limit reached, dropping event");
                    return None;
                }
            },
            None => None,
        };

        let this = self.clone();
        Some(tokio::spawn(async move {
            let _permit = permit;
            match this.post(&job).await {
                Ok(()) => debug!(kind = %job.kind, url = %job.url, "webhook delivered"),
                Err(e) => warn!(kind = %job.kind, url = %job.url, error = %e, "webhook delivery failed"),
            }
        }))
    }

    /// Perform one delivery attempt. Never retried.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] on transport failure, non-2xx status, or an
    /// unreadable attachment.
    pub async fn post(&self, job: &WebhookJob) -> Result<(), DeliveryError> {
        let request = match &job.file {
            Some(path) => {
                info!(url = %job.url, path = %path.display(), "sending webhook with attachment");
                let form = Form::new()
                    .text("jsonData", job.payload.clone())
                    .text("token", job.token.clone())
                    .part("file", file_part(path).await?);
                self.client.post(&job.url).multipart(form)
            }
            None => {
                info!(url = %job.url, "sending webhook");
                self.client.post(&job.url).form(&[
                    ("jsonData", job.payload.as_str()),
                    ("token", job.token.as_str()),
                ])
            }
        };

        let status = request.send().await?.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status));
        }
        Ok(())
    }
}

async fn file_part(path: &Path) -> Result<Part, DeliveryError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| DeliveryError::Attachment {
            path: path.to_path_buf(),
            source,
        })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_owned());
    Ok(Part::bytes(bytes).file_name(name))
}
