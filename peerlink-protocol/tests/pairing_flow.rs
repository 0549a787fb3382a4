//! End-to-end pairing between registries over loopback UDP and TLS

mod common;

use common::*;
use peerlink_protocol::{
    DeviceEvent, DeviceState, MemoryTrustStore, Packet, PluginRegistry, ProtocolError, TrustStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_alice_and_bob_pair_exchange_and_unpair() {
    let (bob_plugins, mut bob_pings) = create_ping_plugins();
    let bob_trust = Arc::new(MemoryTrustStore::new());
    let bob = create_test_registry("bob", nowhere(), bob_plugins, bob_trust.clone());
    let mut bob_events = bob.subscribe();
    bob.start().await.unwrap();

    // Alice announces straight to Bob's discovery socket
    let (alice_plugins, _alice_pings) = create_ping_plugins();
    let alice_trust = Arc::new(MemoryTrustStore::new());
    let alice = create_test_registry(
        "alice",
        bob.discovery_addr().unwrap(),
        alice_plugins,
        alice_trust.clone(),
    );
    let mut alice_events = alice.subscribe();
    alice.start().await.unwrap();

    wait_for_state(&alice, "bob", DeviceState::ConnectedUnpaired).await;
    wait_for_state(&bob, "alice", DeviceState::ConnectedUnpaired).await;

    // Unpaired devices exchange nothing but control packets
    assert!(matches!(
        alice.send_packet("bob", Packet::new("ping", json!({}))).await,
        Err(ProtocolError::NotPaired)
    ));

    alice.request_pairing("bob").await.unwrap();

    match expect_event(&mut bob_events, |e| {
        matches!(e, DeviceEvent::PairingRequested { .. })
    })
    .await
    {
        DeviceEvent::PairingRequested {
            device_id,
            fingerprint,
            ..
        } => {
            assert_eq!(device_id, "alice");
            assert_eq!(fingerprint, alice.fingerprint());
        }
        _ => unreachable!(),
    }
    bob.accept_pairing("alice").await.unwrap();

    expect_event(&mut alice_events, |e| matches!(e, DeviceEvent::Paired { .. })).await;
    wait_for_state(&alice, "bob", DeviceState::PairedConnected).await;
    wait_for_state(&bob, "alice", DeviceState::PairedConnected).await;

    assert_eq!(
        alice_trust.fingerprint("bob").unwrap().as_deref(),
        Some(bob.fingerprint())
    );
    assert_eq!(
        bob_trust.fingerprint("alice").unwrap().as_deref(),
        Some(alice.fingerprint())
    );
    assert_eq!(alice.device_plugins("bob").await.unwrap(), vec!["ping"]);

    alice
        .send_packet("bob", Packet::new("ping", json!({"message": "hello"})))
        .await
        .unwrap();
    let ping = timeout(WAIT, bob_pings.recv()).await.unwrap().unwrap();
    assert_eq!(ping.get_body_field::<String>("message").as_deref(), Some("hello"));

    alice.unpair("bob").await.unwrap();
    expect_event(&mut bob_events, |e| matches!(e, DeviceEvent::Unpaired { .. })).await;
    wait_for_state(&bob, "alice", DeviceState::Discovered).await;
    assert_eq!(alice.device("bob").await.unwrap().state, DeviceState::Discovered);
    assert_eq!(alice_trust.fingerprint("bob").unwrap(), None);
    assert_eq!(bob_trust.fingerprint("alice").unwrap(), None);

    // Both sides remember each other as known devices
    assert_eq!(alice_trust.known_devices().unwrap(), vec!["bob"]);
    assert_eq!(bob_trust.known_devices().unwrap(), vec!["alice"]);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_rejected_request_leaves_both_unpaired() {
    let bob = create_test_registry(
        "bob",
        nowhere(),
        PluginRegistry::new(),
        Arc::new(MemoryTrustStore::new()),
    );
    let mut bob_events = bob.subscribe();
    bob.start().await.unwrap();

    let alice = create_test_registry(
        "alice",
        nowhere(),
        PluginRegistry::new(),
        Arc::new(MemoryTrustStore::new()),
    );
    let mut alice_events = alice.subscribe();
    alice.start().await.unwrap();
    alice.connect_to(bob.tcp_addr().unwrap()).unwrap();

    wait_for_state(&alice, "bob", DeviceState::ConnectedUnpaired).await;
    wait_for_state(&bob, "alice", DeviceState::ConnectedUnpaired).await;

    alice.request_pairing("bob").await.unwrap();
    expect_event(&mut bob_events, |e| {
        matches!(e, DeviceEvent::PairingRequested { .. })
    })
    .await;
    bob.reject_pairing("alice").await.unwrap();

    match expect_event(&mut alice_events, |e| {
        matches!(e, DeviceEvent::PairingRejected { .. })
    })
    .await
    {
        DeviceEvent::PairingRejected { device_id, .. } => assert_eq!(device_id, "bob"),
        _ => unreachable!(),
    }
    wait_for_state(&alice, "bob", DeviceState::ConnectedUnpaired).await;
    assert_eq!(bob.device("alice").await.unwrap().state, DeviceState::ConnectedUnpaired);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_pinned_fingerprint_mismatch_is_refused() {
    // Bob paired with an "alice" whose certificate is not the one below
    let bob_trust = Arc::new(MemoryTrustStore::new());
    bob_trust
        .store_fingerprint("alice", &create_test_certificate("alice").fingerprint)
        .unwrap();
    bob_trust.set_known_devices(&["alice".to_string()]).unwrap();

    let bob = create_test_registry("bob", nowhere(), PluginRegistry::new(), bob_trust.clone());
    let mut bob_events = bob.subscribe();
    bob.start().await.unwrap();
    assert_eq!(
        bob.device("alice").await.unwrap().state,
        DeviceState::PairedDisconnected
    );

    let impostor = create_test_registry(
        "alice",
        nowhere(),
        PluginRegistry::new(),
        Arc::new(MemoryTrustStore::new()),
    );
    impostor.start().await.unwrap();
    impostor.connect_to(bob.tcp_addr().unwrap()).unwrap();

    match expect_event(&mut bob_events, |e| {
        matches!(e, DeviceEvent::TrustViolation { .. })
    })
    .await
    {
        DeviceEvent::TrustViolation { actual, .. } => assert_eq!(actual, impostor.fingerprint()),
        _ => unreachable!(),
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        bob.device("alice").await.unwrap().state,
        DeviceState::PairedDisconnected
    );
    assert!(bob_trust.fingerprint("alice").unwrap().is_some());

    impostor.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_restores_pairing() {
    let (bob_plugins, _bob_pings) = create_ping_plugins();
    let bob = create_test_registry("bob", nowhere(), bob_plugins, Arc::new(MemoryTrustStore::new()));
    bob.start().await.unwrap();

    let alice_cert = create_test_certificate("alice");
    let alice_trust = Arc::new(MemoryTrustStore::new());
    let (alice_plugins, _alice_pings) = create_ping_plugins();
    let alice = peerlink_protocol::DeviceRegistry::new(
        alice_cert.clone(),
        create_test_config("alice", nowhere()),
        alice_plugins,
        alice_trust.clone(),
    )
    .unwrap();
    let mut alice_events = alice.subscribe();
    alice.start().await.unwrap();
    alice.connect_to(bob.tcp_addr().unwrap()).unwrap();

    wait_for_state(&bob, "alice", DeviceState::ConnectedUnpaired).await;
    wait_for_state(&alice, "bob", DeviceState::ConnectedUnpaired).await;
    bob.request_pairing("alice").await.unwrap();
    expect_event(&mut alice_events, |e| {
        matches!(e, DeviceEvent::PairingRequested { .. })
    })
    .await;
    alice.accept_pairing("bob").await.unwrap();
    wait_for_state(&bob, "alice", DeviceState::PairedConnected).await;

    // Alice goes away; Bob keeps the pairing
    alice.shutdown().await;
    wait_for_state(&bob, "alice", DeviceState::PairedDisconnected).await;

    // Alice comes back with the same certificate and trust records
    let (alice_plugins, _alice_pings) = create_ping_plugins();
    let alice = peerlink_protocol::DeviceRegistry::new(
        alice_cert,
        create_test_config("alice", nowhere()),
        alice_plugins,
        alice_trust,
    )
    .unwrap();
    alice.start().await.unwrap();
    assert_eq!(
        alice.device("bob").await.unwrap().state,
        DeviceState::PairedDisconnected
    );
    alice.connect_to(bob.tcp_addr().unwrap()).unwrap();

    wait_for_state(&bob, "alice", DeviceState::PairedConnected).await;
    wait_for_state(&alice, "bob", DeviceState::PairedConnected).await;

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_notification_relay_skips_unpaired_devices() {
    let bob = create_test_registry(
        "bob",
        nowhere(),
        PluginRegistry::new(),
        Arc::new(MemoryTrustStore::new()),
    );
    bob.start().await.unwrap();

    let alice = create_test_registry(
        "alice",
        nowhere(),
        PluginRegistry::new(),
        Arc::new(MemoryTrustStore::new()),
    );
    alice.start().await.unwrap();
    alice.connect_to(bob.tcp_addr().unwrap()).unwrap();
    wait_for_state(&alice, "bob", DeviceState::ConnectedUnpaired).await;

    let notification = peerlink_protocol::NotificationEvent {
        id: "1".to_string(),
        app_name: "mail".to_string(),
        title: "New mail".to_string(),
        text: "Hello".to_string(),
        icon: None,
    };
    assert_eq!(alice.relay_notification(notification).await, 0);

    alice.shutdown().await;
    bob.shutdown().await;
}
