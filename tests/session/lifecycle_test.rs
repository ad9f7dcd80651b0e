//! Session lifecycle: pairing, connect, termination and resume.

use std::sync::atomic::Ordering;
use std::time::Duration;

use switchboard::protocol::{InboundEvent, PairingEvent};
use switchboard::session::{SessionError, SessionHandle, SessionState, TerminationReason};
use switchboard::tenants::EventKind;

use crate::support::{
    connected_writes, harness, seed_tenant, set_identity, track_connected_writes, wait_until,
};

async fn reach(handle: &SessionHandle, target: SessionState) {
    let mut state = handle.state.clone();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == target))
        .await
        .expect("state reached in time")
        .expect("state channel open");
}

#[tokio::test]
async fn unpaired_tenant_pairs_by_qr_and_connects() {
    let h = harness().await;
    let tenant = seed_tenant(h.store(), 7, "abc123", "", "All", false).await;

    let handle = h.controller.start(&tenant).await.expect("start");
    reach(&handle, SessionState::AwaitingPairing).await;
    let client = h.identities.last_client().expect("device created");
    let client = client.as_ref();
    assert!(wait_until(move || async move { client.calls().contains(&"connect".to_owned()) }).await);
    assert_eq!(h.identities.known.lock().expect("known").clone(), vec![None]);

    client
        .pairing_tx
        .send(PairingEvent::Code("2@abcdef,ghijkl".to_owned()))
        .await
        .expect("pairing channel");
    let store = h.store();
    assert!(
        wait_until(move || async move {
            store
                .pairing_code(7)
                .await
                .is_ok_and(|c| c.starts_with("data:image/png;base64,"))
        })
        .await
    );
    let qr = h.controller.qr(&tenant).await.expect("qr while pairing");
    assert!(qr.starts_with("data:image/png;base64,"));

    assert!(client.emit(InboundEvent::PairSuccess {
        id: "5491155553935@s.whatsapp.net".to_owned(),
        business_name: String::new(),
        platform: "android".to_owned(),
    }));
    client
        .pairing_tx
        .send(PairingEvent::Success)
        .await
        .expect("pairing channel");
    client.authenticated.store(true, Ordering::SeqCst);
    assert!(client.emit(InboundEvent::Connected));
    reach(&handle, SessionState::Connected).await;

    let row = store.find_by_id(7).await.expect("query").expect("row");
    assert_eq!(
        row.network_identity.as_deref(),
        Some("5491155553935@s.whatsapp.net")
    );
    assert!(row.connected);
    assert!(wait_until(move || async move { store.pairing_code(7).await.is_ok_and(|c| c.is_empty()) }).await);

    let status = h.controller.status(&tenant).await.expect("status");
    assert!(status.connected);
    assert!(status.logged_in);
    assert_eq!(status.state, SessionState::Connected);
}

#[tokio::test]
async fn pairing_timeout_tears_session_down() {
    let h = harness().await;
    let tenant = seed_tenant(h.store(), 7, "abc123", "", "All", true).await;

    let handle = h.controller.start(&tenant).await.expect("start");
    reach(&handle, SessionState::AwaitingPairing).await;
    let client = h.identities.last_client().expect("device created");
    client
        .pairing_tx
        .send(PairingEvent::Timeout)
        .await
        .expect("pairing channel");

    reach(&handle, SessionState::Terminated).await;
    assert!(!h.controller.registry().contains(7).await);
    assert!(client.calls().contains(&"disconnect".to_owned()));
    let row = h.store().find_by_id(7).await.expect("query").expect("row");
    assert!(!row.connected);
    assert_eq!(h.store().pairing_code(7).await.expect("code"), "");
}

#[tokio::test]
async fn second_start_is_rejected() {
    let h = harness().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);
    let tenant = seed_tenant(h.store(), 3, "tok-3", "", "All", false).await;

    let _handle = h.controller.start(&tenant).await.expect("first start");
    let err = h.controller.start(&tenant).await.expect_err("second start");
    assert!(matches!(err, SessionError::State(_)));
    assert_eq!(h.controller.session_count().await, 1);
}

#[tokio::test]
async fn concurrent_starts_register_one_session() {
    let h = harness().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);
    let tenant = seed_tenant(h.store(), 3, "tok-3", "", "All", false).await;

    let (a, b) = tokio::join!(h.controller.start(&tenant), h.controller.start(&tenant));
    let ok = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(ok, 1);
    assert_eq!(h.controller.registry().tenant_ids().await, vec![3]);
}

#[tokio::test]
async fn signalling_absent_tenant_returns_immediately() {
    let h = harness().await;
    let tenant = seed_tenant(h.store(), 9, "tok-9", "", "All", false).await;

    let signalled = tokio::time::timeout(
        Duration::from_millis(100),
        h.controller
            .registry()
            .signal(9, TerminationReason::Requested),
    )
    .await
    .expect("signal never blocks");
    assert!(!signalled);

    let err = h.controller.disconnect(&tenant).await.expect_err("no session");
    assert!(matches!(err, SessionError::State(_)));
    let err = h.controller.status(&tenant).await.expect_err("no session");
    assert!(matches!(err, SessionError::State(_)));
}

#[tokio::test]
async fn disconnect_clears_connected_flag() {
    let h = harness().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);
    let tenant = seed_tenant(h.store(), 4, "tok-4", "", "All", false).await;

    let status = h
        .controller
        .connect(&tenant, &[], false)
        .await
        .expect("connect");
    assert!(status.connected);
    assert!(status.logged_in);
    assert_eq!(status.state, SessionState::Connected);
    let store = h.store();
    assert!(store.find_by_id(4).await.expect("query").expect("row").connected);

    let handle = h.controller.registry().get(4).await.expect("live");
    h.controller.disconnect(&tenant).await.expect("disconnect");
    reach(&handle, SessionState::Terminated).await;

    assert!(!h.controller.registry().contains(4).await);
    assert!(!store.find_by_id(4).await.expect("query").expect("row").connected);
}

#[tokio::test]
async fn shutdown_keeps_connected_flag() {
    let h = harness().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);
    let first = seed_tenant(h.store(), 1, "tok-1", "", "All", false).await;
    let second = seed_tenant(h.store(), 2, "tok-2", "", "All", false).await;

    for tenant in [&first, &second] {
        let handle = h.controller.start(tenant).await.expect("start");
        reach(&handle, SessionState::Connected).await;
    }

    h.controller.shutdown_all(Duration::from_secs(2)).await;
    assert!(h.controller.registry().is_empty().await);
    let connected = h.store().connected_tenants().await.expect("query");
    assert_eq!(connected.len(), 2);
}

#[tokio::test]
async fn identity_failure_registers_nothing() {
    let h = harness().await;
    h.identities.fail.store(true, Ordering::SeqCst);
    let tenant = seed_tenant(h.store(), 5, "tok-5", "", "All", false).await;

    let err = h.controller.start(&tenant).await.expect_err("lookup fails");
    assert!(matches!(err, SessionError::Downstream(_)));
    assert_eq!(h.controller.session_count().await, 0);
}

#[tokio::test]
async fn failed_connect_reports_downstream_and_unregisters() {
    let h = harness().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);
    h.identities.fail_connect_new.store(true, Ordering::SeqCst);
    let tenant = seed_tenant(h.store(), 6, "tok-6", "", "All", true).await;

    let err = h
        .controller
        .connect(&tenant, &[], false)
        .await
        .expect_err("connect fails");
    assert!(matches!(err, SessionError::Downstream(_)));

    let registry = h.controller.registry();
    assert!(wait_until(move || async move { !registry.contains(6).await }).await);
    assert!(!h.store().find_by_id(6).await.expect("query").expect("row").connected);
}

#[tokio::test]
async fn remote_logout_terminates_session() {
    let h = harness().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);
    let tenant = seed_tenant(h.store(), 8, "tok-8", "", "All", false).await;

    let handle = h.controller.start(&tenant).await.expect("start");
    reach(&handle, SessionState::Connected).await;
    let client = h.identities.last_client().expect("device");
    assert!(client.emit(InboundEvent::LoggedOut {
        reason: "device removed".to_owned(),
    }));

    reach(&handle, SessionState::Terminated).await;
    assert!(!h.controller.registry().contains(8).await);
    assert!(!h.store().find_by_id(8).await.expect("query").expect("row").connected);
}

#[tokio::test]
async fn logout_unlinks_then_terminates() {
    let h = harness().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);
    let tenant = seed_tenant(h.store(), 8, "tok-8", "", "All", false).await;

    let err = h.controller.logout(&tenant).await.expect_err("no session");
    assert!(matches!(err, SessionError::State(_)));

    let handle = h.controller.start(&tenant).await.expect("start");
    reach(&handle, SessionState::Connected).await;
    h.controller.logout(&tenant).await.expect("logout");
    reach(&handle, SessionState::Terminated).await;

    let client = h.identities.last_client().expect("device");
    assert!(client.calls().contains(&"logout".to_owned()));
    assert!(!h.controller.registry().contains(8).await);
}

#[tokio::test]
async fn resume_starts_only_connected_tenants() {
    let h = harness().await;
    seed_tenant(h.store(), 1, "tok-1", "", "All", true).await;
    set_identity(h.store(), 1, "111@s.whatsapp.net").await;
    seed_tenant(h.store(), 2, "tok-2", "", "Message", true).await;
    seed_tenant(h.store(), 3, "tok-3", "", "All", false).await;

    let started = h.controller.resume_connected().await.expect("resume");
    assert_eq!(started, 2);
    assert_eq!(h.controller.registry().tenant_ids().await, vec![1, 2]);

    let known = h.identities.known.lock().expect("known").clone();
    assert_eq!(known, vec![Some("111@s.whatsapp.net".to_owned()), None]);
    assert!(h.cache.get("tok-2").await.is_some());
}

#[tokio::test]
async fn connect_persists_subscriptions_and_tolerates_pending_pairing() {
    let h = harness().await;
    let tenant = seed_tenant(h.store(), 7, "abc123", "", "All", false).await;

    let subscribe = vec!["Message".to_owned(), "Bogus".to_owned(), "Presence".to_owned()];
    let status = h
        .controller
        .connect(&tenant, &subscribe, false)
        .await
        .expect("pending pairing is not an error");
    assert!(!status.logged_in);
    assert_eq!(status.state, SessionState::AwaitingPairing);

    let row = h.store().find_by_id(7).await.expect("query").expect("row");
    assert_eq!(row.events, vec![EventKind::Message, EventKind::Presence]);

    let err = h
        .controller
        .connect(&tenant, &[], true)
        .await
        .expect_err("already live");
    assert!(matches!(err, SessionError::State(_)));
    let row = h.store().find_by_id(7).await.expect("query").expect("row");
    assert_eq!(row.events, vec![EventKind::Message, EventKind::Presence]);
}

#[tokio::test]
async fn losing_connect_keeps_winner_subscriptions() {
    let h = harness().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);
    let tenant = seed_tenant(h.store(), 7, "abc123", "", "All", false).await;

    let message = vec!["Message".to_owned()];
    let presence = vec!["Presence".to_owned()];
    let (a, b) = tokio::join!(
        h.controller.connect(&tenant, &message, true),
        h.controller.connect(&tenant, &presence, true),
    );
    let (winner, loser) = if a.is_ok() {
        (vec![EventKind::Message], b)
    } else {
        (vec![EventKind::Presence], a)
    };
    assert!(matches!(loser, Err(SessionError::State(_))));
    assert_eq!(h.controller.session_count().await, 1);

    let row = h.store().find_by_id(7).await.expect("query").expect("row");
    assert_eq!(row.events, winner);
    let cached = h.cache.get("abc123").await.expect("cached");
    assert_eq!(cached.events, winner);
}

#[tokio::test]
async fn unknown_only_subscriptions_survive_a_reload() {
    let h = harness().await;
    let tenant = seed_tenant(h.store(), 7, "abc123", "", "All", true).await;

    h.controller
        .connect(&tenant, &["Bogus".to_owned()], true)
        .await
        .expect("connect");

    let cached = h.cache.get("abc123").await.expect("cached");
    assert!(cached.events.is_empty());
    let stored = h.store().find_by_id(7).await.expect("query").expect("row");
    assert!(stored.events.is_empty());
    let refreshed = h.cache.refresh(7).await.expect("refresh");
    assert_eq!(refreshed.events, cached.events);

    let resumed = h.store().connected_tenants().await.expect("query");
    assert_eq!(resumed.len(), 1);
    assert!(resumed[0].events.is_empty());
}

#[tokio::test]
async fn connected_flag_written_once_through_session() {
    let h = harness().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);
    let tenant = seed_tenant(h.store(), 4, "tok-4", "", "All", false).await;
    track_connected_writes(h.store()).await;

    let handle = h.controller.start(&tenant).await.expect("start");
    reach(&handle, SessionState::Connected).await;
    let client = h.identities.last_client().expect("device");
    assert!(client.emit(InboundEvent::Connected));
    assert!(client.emit(InboundEvent::Connected));

    h.controller.disconnect(&tenant).await.expect("disconnect");
    reach(&handle, SessionState::Terminated).await;
    assert_eq!(connected_writes(h.store()).await, vec![true, false]);
}

#[tokio::test]
async fn pair_phone_issues_linking_code() {
    let h = harness().await;
    let tenant = seed_tenant(h.store(), 7, "abc123", "", "All", false).await;

    let handle = h.controller.start(&tenant).await.expect("start");
    reach(&handle, SessionState::AwaitingPairing).await;

    let err = h.controller.pair_phone(&tenant, "  ").await.expect_err("empty");
    assert!(matches!(err, SessionError::Validation(_)));

    let code = h
        .controller
        .pair_phone(&tenant, "+5491155553935")
        .await
        .expect("code");
    assert_eq!(code, "ABCD-EFGH");
    assert_eq!(h.store().pairing_code(7).await.expect("stored"), "ABCD-EFGH");

    h.identities
        .last_client()
        .expect("device")
        .authenticated
        .store(true, Ordering::SeqCst);
    let err = h
        .controller
        .pair_phone(&tenant, "+5491155553935")
        .await
        .expect_err("already paired");
    assert!(matches!(err, SessionError::State(_)));
    let err = h.controller.qr(&tenant).await.expect_err("already paired");
    assert!(matches!(err, SessionError::State(_)));
}

#[tokio::test]
async fn send_text_addresses_recipient_and_generates_id() {
    let h = harness().await;
    h.identities.authenticate_new.store(true, Ordering::SeqCst);
    let tenant = seed_tenant(h.store(), 2, "tok-2", "", "All", false).await;

    let handle = h.controller.start(&tenant).await.expect("start");
    reach(&handle, SessionState::Connected).await;

    let sent = h
        .controller
        .send_text(&tenant, "+5491155553935", "hello", None)
        .await
        .expect("send");
    assert_eq!(sent.id.len(), 32);
    assert_eq!(sent.id, sent.id.to_uppercase());

    let sent = h
        .controller
        .send_text(&tenant, "5491155553935", "again", Some("MYID".to_owned()))
        .await
        .expect("send");
    assert_eq!(sent.id, "MYID");

    let calls = h.identities.last_client().expect("device").calls();
    assert!(calls.contains(&"send:5491155553935@s.whatsapp.net:hello".to_owned()));

    let err = h
        .controller
        .send_text(&tenant, "5491155553935", "", None)
        .await
        .expect_err("empty body");
    assert!(matches!(err, SessionError::Validation(_)));
}
