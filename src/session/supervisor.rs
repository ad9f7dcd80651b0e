//! Per-tenant supervisor task: pairing, connect, then wait for termination.
//!
//! One supervisor runs per live session. It owns the receiving half of the
//! termination signal and is the only code that unregisters the session.

use std::io::Cursor;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{ImageFormat, Luma};
use qrcode::QrCode;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::registry::{SessionRegistry, TerminationReason};
use super::SessionState;
use crate::events::EventRouter;
use crate::protocol::{PairingEvent, ProtocolClient};
use crate::tenants::{TenantCache, TenantRecord};

/// Edge length of rendered pairing QR codes, in pixels.
const QR_SIZE_PX: u32 = 256;

/// Everything a supervisor needs, moved into its task.
pub(crate) struct Supervisor {
    pub(crate) tenant: TenantRecord,
    pub(crate) client: Arc<dyn ProtocolClient>,
    pub(crate) cache: Arc<TenantCache>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) state: Arc<watch::Sender<SessionState>>,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Terminated(TerminationReason),
    PairingTimedOut,
    ConnectFailed,
}

impl Supervisor {
    /// Drive the session to completion.
    pub(crate) async fn run(
        self,
        router: EventRouter,
        mut termination: oneshot::Receiver<TerminationReason>,
    ) {
        let tenant_id = self.tenant.id;

        let (sink, events) = mpsc::unbounded_channel();
        self.client.register_event_handler(sink);
        let router = tokio::spawn(router.run(events));

        let outcome = match self.establish(&mut termination).await {
            Some(outcome) => outcome,
            None => {
                debug!(tenant_id, "supervisor waiting for termination");
                // A dropped sender means the entry was torn out from under us.
                let reason = (&mut termination)
                    .await
                    .unwrap_or(TerminationReason::Requested);
                Outcome::Terminated(reason)
            }
        };

        self.teardown(outcome).await;
        router.abort();
    }

    // Returns `Some` when the session ended before reaching the supervisory wait.
    async fn establish(
        &self,
        termination: &mut oneshot::Receiver<TerminationReason>,
    ) -> Option<Outcome> {
        let tenant_id = self.tenant.id;

        if self.client.is_authenticated().await {
            info!(tenant_id, "identity already paired, connecting");
            if let Err(e) = self.client.connect().await {
                error!(tenant_id, error = %e, "failed to connect");
                return Some(Outcome::ConnectFailed);
            }
            return None;
        }

        self.state.send_replace(SessionState::AwaitingPairing);
        let mut pairing = match self.client.open_pairing_channel().await {
            Ok(rx) => rx,
            Err(e) => {
                error!(tenant_id, error = %e, "failed to open pairing channel");
                return Some(Outcome::ConnectFailed);
            }
        };
        if let Err(e) = self.client.connect().await {
            error!(tenant_id, error = %e, "failed to connect");
            return Some(Outcome::ConnectFailed);
        }

        loop {
            tokio::select! {
                reason = &mut *termination => {
                    return Some(Outcome::Terminated(
                        reason.unwrap_or(TerminationReason::Requested),
                    ));
                }
                event = pairing.recv() => match event {
                    Some(PairingEvent::Code(code)) => self.store_qr(&code).await,
                    Some(PairingEvent::Success) => {
                        info!(tenant_id, "pairing succeeded");
                        self.clear_pairing_code().await;
                        return None;
                    }
                    Some(PairingEvent::Timeout) | None => {
                        info!(tenant_id, "pairing timed out");
                        self.clear_pairing_code().await;
                        return Some(Outcome::PairingTimedOut);
                    }
                    Some(PairingEvent::Other) => {
                        debug!(tenant_id, "ignoring pairing event");
                    }
                },
            }
        }
    }

    async fn store_qr(&self, code: &str) {
        let tenant_id = self.tenant.id;
        let data_url = match render_qr_data_url(code) {
            Ok(url) => url,
            Err(e) => {
                error!(tenant_id, error = %e, "failed to render pairing QR code");
                return;
            }
        };
        match self
            .cache
            .store()
            .set_pairing_code(tenant_id, &data_url)
            .await
        {
            Ok(()) => info!(tenant_id, "pairing QR code updated"),
            Err(e) => error!(tenant_id, error = %e, "failed to persist pairing QR code"),
        }
    }

    async fn clear_pairing_code(&self) {
        if let Err(e) = self.cache.store().set_pairing_code(self.tenant.id, "").await {
            warn!(tenant_id = self.tenant.id, error = %e, "failed to clear pairing code");
        }
    }

    async fn teardown(&self, outcome: Outcome) {
        let tenant_id = self.tenant.id;
        self.client.disconnect().await;

        let clear_flag = match outcome {
            Outcome::Terminated(reason) => reason.clears_connected_flag(),
            Outcome::PairingTimedOut | Outcome::ConnectFailed => true,
        };
        if clear_flag {
            if let Err(e) = self.cache.set_connected(&self.tenant, false).await {
                warn!(tenant_id, error = %e, "failed to clear connected flag");
            }
        }

        self.registry.remove(tenant_id).await;
        self.state.send_replace(SessionState::Terminated);
        info!(tenant_id, ?outcome, "session terminated");
    }
}

/// Render a pairing code as a `data:image/png;base64,...` QR image.
///
/// # Errors
///
/// Returns an error if the code does not fit in a QR symbol or PNG encoding fails.
pub fn render_qr_data_url(code: &str) -> anyhow::Result<String> {
    let qr = QrCode::new(code.as_bytes())?;
    let img = qr
        .render::<Luma<u8>>()
        .min_dimensions(QR_SIZE_PX, QR_SIZE_PX)
        .build();
    let mut png = Cursor::new(Vec::new());
    img.write_to(&mut png, ImageFormat::Png)?;
    Ok(format!(
        "data:image/png;base64,{}",
        BASE64.encode(png.into_inner())
    ))
}
