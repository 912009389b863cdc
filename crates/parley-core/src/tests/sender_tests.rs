use super::{conversation, recipients, spawn_peer, test_config};
use crate::error::CoreError;
use crate::outbox::Outbox;
use crate::time::now_ms;
use crate::transport::InMemoryBackend;
use crate::Core;
use parley_api::types::{ClientId, ClientMismatch, QualifiedId, UserClients};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn mismatch_deleted(user: &QualifiedId, clients: &[&ClientId]) -> ClientMismatch {
    ClientMismatch {
        deleted: vec![UserClients {
            user: user.clone(),
            clients: clients.iter().map(|c| (*c).clone()).collect(),
        }],
        ..ClientMismatch::default()
    }
}

fn mismatch_missing(user: &QualifiedId, clients: &[&ClientId]) -> ClientMismatch {
    ClientMismatch {
        missing: vec![UserClients {
            user: user.clone(),
            clients: clients.iter().map(|c| (*c).clone()).collect(),
        }],
        ..ClientMismatch::default()
    }
}

#[tokio::test]
async fn stale_deleted_device_is_reconciled_once() {
    let backend = InMemoryBackend::new();
    let alice = spawn_peer(&backend, "alice", "a1").await;
    let bob1 = spawn_peer(&backend, "bob", "b1").await;
    let bob2 = spawn_peer(&backend, "bob", "b2").await;
    backend
        .prime_mismatch(mismatch_deleted(&bob2.qualified(), &[&bob2.client()]))
        .await;

    let summary = alice
        .core
        .send_message(
            &conversation("conv-1"),
            b"reconciled",
            &recipients(&[(&bob1.user, &bob1.device), (&bob2.user, &bob2.device)]),
        )
        .await
        .expect("send succeeds after reconcile");

    assert_eq!(summary.delivered, vec![(bob1.user.clone(), bob1.device.clone())]);
    let posted = backend.posted().await;
    // Only the corrected envelope reached the server.
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].1.client_count(), 1);
    assert_eq!(posted[0].1.recipients[0].clients[0].client, bob1.client());
    let pending = Outbox::new(alice.store.clone())
        .load_all_due(now_ms() + 120_000, 16)
        .await
        .expect("outbox");
    assert!(pending.is_empty());
}

#[tokio::test]
async fn missing_device_is_added_on_retry() {
    let backend = InMemoryBackend::new();
    let alice = spawn_peer(&backend, "alice", "a1").await;
    let bob1 = spawn_peer(&backend, "bob", "b1").await;
    let bob2 = spawn_peer(&backend, "bob", "b2").await;
    backend
        .prime_mismatch(mismatch_missing(&bob2.qualified(), &[&bob2.client()]))
        .await;

    let summary = alice
        .core
        .send_message(
            &conversation("conv-1"),
            b"grown",
            &recipients(&[(&bob1.user, &bob1.device)]),
        )
        .await
        .expect("send");

    assert_eq!(summary.delivered.len(), 2);
    let posted = backend.posted().await;
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].1.client_count(), 2);
}

#[tokio::test]
async fn second_mismatch_is_recipients_unstable() {
    let backend = InMemoryBackend::new();
    let alice = spawn_peer(&backend, "alice", "a1").await;
    let bob1 = spawn_peer(&backend, "bob", "b1").await;
    let bob2 = spawn_peer(&backend, "bob", "b2").await;
    backend
        .prime_mismatch(mismatch_deleted(&bob2.qualified(), &[&bob2.client()]))
        .await;
    backend
        .prime_mismatch(mismatch_deleted(&bob1.qualified(), &[&bob1.client()]))
        .await;

    let err = alice
        .core
        .send_message(
            &conversation("conv-1"),
            b"unstable",
            &recipients(&[(&bob1.user, &bob1.device), (&bob2.user, &bob2.device)]),
        )
        .await
        .expect_err("two mismatches");
    assert_eq!(err, CoreError::RecipientsUnstable);

    // The corrected envelope stays durably queued.
    let pending = Outbox::new(alice.store.clone())
        .load_all_due(now_ms() + 120_000, 16)
        .await
        .expect("outbox");
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn transport_failure_resubmits_identical_envelope() {
    let backend = InMemoryBackend::new();
    let alice = spawn_peer(&backend, "alice", "a1").await;
    let bob = spawn_peer(&backend, "bob", "b1").await;
    backend.fail_next_posts(1).await;

    let err = alice
        .core
        .send_message(
            &conversation("conv-1"),
            b"retry me",
            &recipients(&[(&bob.user, &bob.device)]),
        )
        .await
        .expect_err("post fails");
    assert!(matches!(err, CoreError::Transport(_)));

    let outbox = Outbox::new(alice.store.clone());
    let pending = outbox
        .load_all_due(now_ms() + 120_000, 16)
        .await
        .expect("outbox");
    assert_eq!(pending.len(), 1);
    let queued = pending[0].message.clone();

    sleep(Duration::from_millis(120)).await;
    let flushed = alice.core.resume_pending_sends().await.expect("flush");
    assert_eq!(flushed, 1);
    let posted = backend.posted().await;
    assert_eq!(posted.len(), 1);
    // Byte-identical resubmission, never re-encoded.
    assert_eq!(posted[0].1, queued);
    assert!(outbox
        .load_all_due(now_ms() + 120_000, 16)
        .await
        .expect("outbox")
        .is_empty());
}

#[tokio::test]
async fn queued_send_survives_restart() {
    let backend = InMemoryBackend::new();
    let alice = spawn_peer(&backend, "alice", "a1").await;
    let bob = spawn_peer(&backend, "bob", "b1").await;
    backend.fail_next_posts(1).await;

    alice
        .core
        .send_message(
            &conversation("conv-1"),
            b"crash in flight",
            &recipients(&[(&bob.user, &bob.device)]),
        )
        .await
        .expect_err("post fails");
    let queued = Outbox::new(alice.store.clone())
        .load_all_due(now_ms() + 120_000, 16)
        .await
        .expect("outbox")[0]
        .message
        .clone();

    // Same durable store, fresh process.
    let restored = Arc::new(crate::storage::InMemoryStore::restore(alice.store.snapshot().await).await);
    let sink = Arc::new(crate::transport::InMemorySink::new());
    let core2 = Core::init(
        test_config("alice", "a1"),
        super::test_policy(),
        restored,
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        sink,
    )
    .await
    .expect("restart");

    sleep(Duration::from_millis(120)).await;
    let flushed = core2.resume_pending_sends().await.expect("resume");
    assert_eq!(flushed, 1);
    let posted = backend.posted().await;
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].1, queued);
}

#[tokio::test]
async fn delivered_message_reaches_recipient_after_resubmit() {
    let backend = InMemoryBackend::new();
    let alice = spawn_peer(&backend, "alice", "a1").await;
    let bob = spawn_peer(&backend, "bob", "b1").await;
    let engine = bob.core.sync_engine();
    engine.bootstrap().await.expect("bootstrap");
    engine.slow_sync().await.expect("slow sync");

    backend.fail_next_posts(1).await;
    alice
        .core
        .send_message(
            &conversation("conv-1"),
            b"eventually",
            &recipients(&[(&bob.user, &bob.device)]),
        )
        .await
        .expect_err("first attempt fails");
    sleep(Duration::from_millis(120)).await;
    alice.core.resume_pending_sends().await.expect("flush");

    super::deliver_posted(&backend, &alice, &bob).await;
    engine.run_live_once().await.expect("live");
    let messages = bob.sink.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].plaintext, b"eventually");
}
