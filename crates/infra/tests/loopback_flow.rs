use std::sync::Arc;

use parley_domain::client::{HydrateThreadOptions, MessagingClient, MessagingClientConfig};
use parley_domain::controller::{ControllerOptions, MessagingController};
use parley_domain::ports::{
    MessagingFetch, MessagingMutations, MessagingSubscriptions, SendMessageArgs, UploadTransport,
};
use parley_domain::thread::DeliveryState;
use parley_domain::uploads::UploadStatus;
use parley_domain::util::SequenceIdSource;
use parley_infra::loopback::LoopbackTransport;
use serde_json::{json, Value};

fn build_client(transport: Arc<LoopbackTransport>) -> MessagingClient {
    let controller = MessagingController::new(ControllerOptions {
        viewer_user_id: Some("viewer".to_string()),
        clock: Some(Arc::new(|| 100_000)),
        ids: Some(Arc::new(SequenceIdSource::default())),
        ..Default::default()
    });
    MessagingClient::new(
        controller,
        MessagingClientConfig {
            fetch: Arc::clone(&transport) as Arc<dyn MessagingFetch>,
            subscriptions: Arc::clone(&transport) as Arc<dyn MessagingSubscriptions>,
            mutations: Arc::clone(&transport) as Arc<dyn MessagingMutations>,
            uploads: Arc::clone(&transport) as Arc<dyn UploadTransport>,
            clock: Some(Arc::new(|| 100_000)),
            ids: Some(Arc::new(SequenceIdSource::default())),
            status_poll_interval_ms: Some(1),
            status_poll_max_attempts: Some(3),
        },
    )
}

fn seed_thread_payload(transport: &LoopbackTransport) {
    transport.set_thread_payload(
        "thr-1",
        json!({
            "thread": {"id": "thr-1", "kind": "PROJECT", "status": "open"},
            "messages": [
                {"id": "msg-1", "createdAt": 50_000, "authorUserId": "peer", "body": "hello"}
            ],
            "participants": [{"id": "viewer", "role": "buyer"}]
        }),
    );
}

#[tokio::test]
async fn hydrate_subscribe_and_send_round_trip() {
    let transport = Arc::new(LoopbackTransport::new());
    seed_thread_payload(&transport);
    transport.set_inbox_payload(json!({"threads": []}));

    let client = build_client(Arc::clone(&transport));
    client
        .hydrate_thread(
            "thr-1",
            HydrateThreadOptions {
                subscribe: true,
                ..Default::default()
            },
        )
        .await
        .expect("hydrated");
    assert_eq!(transport.subscriber_counts().1, 1);

    // a late out-of-order envelope lands in sorted position
    transport.publish_thread_envelope(
        "thr-1",
        json!({
            "eventType": "messageCreated",
            "payload": {"message": {"id": "msg-0", "createdAt": 40_000,
                                      "authorUserId": "peer", "body": "earlier"}}
        }),
    );

    let ack = client
        .send_message(
            "thr-1",
            SendMessageArgs {
                client_id: "c-1".to_string(),
                body: Some("reply".to_string()),
                created_at_ms: Some(60_000),
                ..Default::default()
            },
        )
        .await
        .expect("sent")
        .expect("ack");

    let controller = client.controller();
    let guard = match controller.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let thread = guard.thread("thr-1").expect("thread");
    assert_eq!(
        thread.message_order(),
        ["msg-0", "msg-1", &ack.message_id[..]]
    );
    assert_eq!(
        thread.message(&ack.message_id).map(|m| m.delivery_state),
        Some(DeliveryState::Sent)
    );
    assert!(thread.message("temp:c-1").is_none());
    // only the peer's envelope counted as unread, never the viewer's send
    assert_eq!(guard.total_unread(), 1);
    drop(guard);

    client.dispose();
    assert_eq!(transport.subscriber_counts(), (0, 0));
}

#[tokio::test]
async fn rejected_send_keeps_a_visible_failed_entry() {
    let transport = Arc::new(LoopbackTransport::new());
    seed_thread_payload(&transport);
    let client = build_client(Arc::clone(&transport));
    client
        .hydrate_thread("thr-1", HydrateThreadOptions::default())
        .await
        .expect("hydrated");

    transport.reject_intent("sendMessage");
    let err = client
        .send_message(
            "thr-1",
            SendMessageArgs {
                client_id: "c-2".to_string(),
                body: Some("doomed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "LOOPBACK_REJECTED");

    let controller = client.controller();
    let guard = match controller.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let message = guard
        .thread("thr-1")
        .and_then(|thread| thread.message("temp:c-2").cloned())
        .expect("failed entry retained");
    assert_eq!(message.delivery_state, DeliveryState::Failed);
    assert_eq!(message.error_code.as_deref(), Some("LOOPBACK_REJECTED"));
}

#[tokio::test]
async fn upload_round_trip_reaches_ready() {
    let transport = Arc::new(LoopbackTransport::new());
    seed_thread_payload(&transport);
    let client = build_client(Arc::clone(&transport));
    client
        .hydrate_thread("thr-1", HydrateThreadOptions::default())
        .await
        .expect("hydrated");

    let item = client
        .prepare_upload(
            "thr-1",
            parley_domain::client::UploadRequest {
                file_name: Some("brief.pdf".to_string()),
                mime_type: Some("application/pdf".to_string()),
                size_bytes: Some(2_048),
                ..Default::default()
            },
        )
        .await
        .expect("uploaded");
    assert_eq!(item.status, UploadStatus::Ready);
    assert!(item.attachment_id.is_some());
    assert!(transport
        .mutation_log()
        .iter()
        .any(|(intent, _)| intent == "completeUpload"));
}

#[tokio::test]
async fn subscription_failure_rehydrates_from_fetch() {
    let transport = Arc::new(LoopbackTransport::new());
    seed_thread_payload(&transport);
    let client = build_client(Arc::clone(&transport));
    client
        .hydrate_thread(
            "thr-1",
            HydrateThreadOptions {
                subscribe: true,
                ..Default::default()
            },
        )
        .await
        .expect("hydrated");

    // replace the canned payload, then drop the stream; the client should
    // recover by re-reading the authority
    transport.set_thread_payload(
        "thr-1",
        json!({
            "thread": {"id": "thr-1", "kind": "PROJECT", "status": "LOCKED"},
            "messages": []
        }),
    );
    transport.fail_thread_subscription("thr-1", "STREAM_DROPPED");

    // the refresh happens on a spawned task
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let controller = client.controller();
    let guard = match controller.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    assert_eq!(
        guard.thread("thr-1").map(|thread| thread.thread.status.clone()),
        Some("LOCKED".to_string())
    );
}

#[tokio::test]
async fn mutation_log_records_the_intent_vocabulary() {
    let transport = Arc::new(LoopbackTransport::new());
    seed_thread_payload(&transport);
    transport.set_inbox_payload(json!({
        "threads": [{"id": "thr-1", "lastMessageAt": 50_000}]
    }));
    let client = build_client(Arc::clone(&transport));
    client.refresh_inbox(Value::Null).await.expect("inbox");
    client
        .hydrate_thread("thr-1", HydrateThreadOptions::default())
        .await
        .expect("hydrated");
    client.pin_thread("thr-1", Value::Null).await.expect("pin");
    client
        .archive_thread("thr-1", Value::Null)
        .await
        .expect("archive");
    client
        .mark_thread_read("thr-1", Default::default(), Value::Null)
        .await
        .expect("read");

    let intents: Vec<String> = transport
        .mutation_log()
        .into_iter()
        .map(|(intent, _)| intent)
        .collect();
    assert_eq!(intents, ["pinThread", "archiveThread", "markThreadRead"]);
}
