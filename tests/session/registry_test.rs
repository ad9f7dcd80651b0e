//! Session registry: single occupancy per tenant and one-shot signals.

use std::sync::Arc;

use tokio::sync::watch;

use switchboard::protocol::ProtocolClient;
use switchboard::session::{
    SessionError, SessionHandle, SessionRegistry, SessionState, TerminationReason,
    TerminationSignal,
};

use crate::support::{dispatcher, FakeClient};

fn handle(tenant_id: i64) -> (SessionHandle, watch::Sender<SessionState>) {
    let (tx, rx) = watch::channel(SessionState::Idle);
    let client: Arc<dyn ProtocolClient> = Arc::new(FakeClient::new(true));
    let handle = SessionHandle {
        tenant_id,
        client,
        webhook: dispatcher(),
        state: rx,
    };
    (handle, tx)
}

#[tokio::test]
async fn occupied_tenant_rejects_second_put() {
    let registry = SessionRegistry::new();
    let (first, _tx1) = handle(1);
    let (second, _tx2) = handle(1);
    let (signal, _rx) = TerminationSignal::new();
    registry.put(first, signal).await.expect("first put");

    let (signal, _rx2) = TerminationSignal::new();
    let err = registry.put(second, signal).await.expect_err("occupied");
    assert!(matches!(err, SessionError::State(_)));
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn signal_is_delivered_once() {
    let registry = SessionRegistry::new();
    let (h, _tx) = handle(7);
    let (signal, rx) = TerminationSignal::new();
    registry.put(h, signal).await.expect("put");

    assert!(registry.signal(7, TerminationReason::LoggedOut).await);
    assert!(!registry.signal(7, TerminationReason::Requested).await);
    assert_eq!(rx.await.expect("reason"), TerminationReason::LoggedOut);

    // Signalling never unregisters; the supervisor does.
    assert!(registry.contains(7).await);
    assert!(registry.remove(7).await.is_some());
    assert!(registry.remove(7).await.is_none());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn signal_all_skips_already_signalled() {
    let registry = SessionRegistry::new();
    let mut receivers = Vec::new();
    for id in [3, 1, 2] {
        let (h, tx) = handle(id);
        let (signal, rx) = TerminationSignal::new();
        registry.put(h, signal).await.expect("put");
        receivers.push((rx, tx));
    }
    assert_eq!(registry.tenant_ids().await, vec![1, 2, 3]);

    assert!(registry.signal(2, TerminationReason::Requested).await);
    assert_eq!(registry.signal_all(TerminationReason::Shutdown).await, 2);
    assert_eq!(registry.signal_all(TerminationReason::Shutdown).await, 0);
    assert_eq!(registry.handles().await.len(), 3);
}

#[tokio::test]
async fn dropped_supervisor_reports_undelivered() {
    let registry = SessionRegistry::new();
    let (h, _tx) = handle(5);
    let (signal, rx) = TerminationSignal::new();
    drop(rx);
    registry.put(h, signal).await.expect("put");

    assert!(!registry.signal(5, TerminationReason::Requested).await);
    assert_eq!(
        registry.get(5).await.expect("still registered").current_state(),
        SessionState::Idle
    );
}
