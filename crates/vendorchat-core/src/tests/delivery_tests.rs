use super::{conv, core_with, fast_policy, quiet_config, wait_for_status, wait_until};
use crate::delivery::DeliveryState;
use crate::error::CoreError;
use crate::messaging::{MockTransport, SendEvent};
use crate::policy::Policy;
use vendorchat_api::{AttachmentRef, MessageStatus, ValidationError};

#[tokio::test]
async fn same_conversation_sends_strictly_in_order() {
    let transport = MockTransport::new();
    transport.set_send_delay(30).await;
    let core = core_with(&transport, quiet_config(), fast_policy()).await;

    let a = core.send_message(&conv("c1"), "first", None).expect("send a");
    let b = core.send_message(&conv("c1"), "second", None).expect("send b");
    assert!(wait_for_status(&core, &conv("c1"), &b, MessageStatus::Sent).await);
    assert!(wait_for_status(&core, &conv("c1"), &a, MessageStatus::Sent).await);

    assert_eq!(
        transport.send_events().await,
        vec![
            SendEvent::Started(a),
            SendEvent::Finished(a),
            SendEvent::Started(b),
            SendEvent::Finished(b),
        ]
    );
    let bodies: Vec<String> = core
        .snapshot(&conv("c1"))
        .expect("snapshot")
        .iter()
        .map(|m| m.body.clone())
        .collect();
    assert_eq!(bodies, vec!["first", "second"]);
}

#[tokio::test]
async fn different_conversations_send_concurrently() {
    let transport = MockTransport::new();
    transport.set_send_delay(50).await;
    let core = core_with(&transport, quiet_config(), fast_policy()).await;

    let a = core.send_message(&conv("c1"), "to one", None).expect("send a");
    let b = core.send_message(&conv("c2"), "to two", None).expect("send b");
    assert!(wait_for_status(&core, &conv("c1"), &a, MessageStatus::Sent).await);
    assert!(wait_for_status(&core, &conv("c2"), &b, MessageStatus::Sent).await);

    let events = transport.send_events().await;
    assert!(matches!(events[0], SendEvent::Started(_)));
    assert!(matches!(events[1], SendEvent::Started(_)));
}

#[tokio::test]
async fn invalid_drafts_are_rejected_before_enqueue() {
    let transport = MockTransport::new();
    let core = core_with(&transport, quiet_config(), Policy {
        max_body_bytes: 8,
        ..fast_policy()
    })
    .await;

    let err = core.send_message(&conv("c1"), "   ", None).unwrap_err();
    assert_eq!(err, CoreError::Validation(ValidationError::MissingContent));
    let err = core
        .send_message(&conv("c1"), "far too long", None)
        .unwrap_err();
    assert_eq!(err, CoreError::Validation(ValidationError::TooLong("body")));
    assert!(core.snapshot(&conv("c1")).is_err());
    assert_eq!(transport.calls().await.send_message, 0);
}

#[tokio::test]
async fn attachment_only_message_is_accepted() {
    let transport = MockTransport::new();
    let core = core_with(&transport, quiet_config(), fast_policy()).await;
    let id = core
        .send_message(&conv("c1"), "", Some(AttachmentRef::new("upload-7")))
        .expect("send");
    assert!(wait_for_status(&core, &conv("c1"), &id, MessageStatus::Sent).await);
    let accepted = transport.accepted().await;
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].attachment_ref, Some(AttachmentRef::new("upload-7")));
}

#[tokio::test]
async fn first_send_creates_conversation_locally() {
    let transport = MockTransport::new();
    let core = core_with(&transport, quiet_config(), fast_policy()).await;
    assert!(core.list_conversations(None).is_empty());
    core.send_message(&conv("new-guest"), "welcome", None)
        .expect("send");
    let list = core.list_conversations(None);
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].participant_ref, "new-guest");
    assert_eq!(list[0].last_message_preview, "welcome");
}

#[tokio::test]
async fn lost_ack_is_retried_with_same_client_id() {
    let transport = MockTransport::new();
    transport.lose_acks(1).await;
    let core = core_with(&transport, quiet_config(), fast_policy()).await;

    let id = core.send_message(&conv("c1"), "once", None).expect("send");
    assert!(wait_for_status(&core, &conv("c1"), &id, MessageStatus::Sent).await);

    assert_eq!(transport.calls().await.send_message, 2);
    let accepted = transport.accepted().await;
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].client_id, Some(id));
    let snapshot = core.snapshot(&conv("c1")).expect("snapshot");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.messages()[0].server_id, Some(accepted[0].id.clone()));
}

#[tokio::test]
async fn cancel_stops_backoff_and_discards_message() {
    let transport = MockTransport::new();
    transport.set_online(false).await;
    let core = core_with(&transport, quiet_config(), Policy {
        backoff_initial_ms: 200,
        backoff_max_ms: 200,
        backoff_jitter_ms: 0,
        ..Policy::default()
    })
    .await;

    let id = core.send_message(&conv("c1"), "never mind", None).expect("send");
    assert!(
        wait_until(|| matches!(core.delivery_state(&id), Some(DeliveryState::Backoff { .. })))
            .await
    );
    assert!(core.cancel_message(&id).expect("cancel"));
    assert!(core.snapshot(&conv("c1")).expect("snapshot").is_empty());
    assert_eq!(core.delivery_state(&id), None);

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(transport.calls().await.send_message, 1);
}

#[tokio::test]
async fn retry_of_confirmed_message_is_a_no_op() {
    let transport = MockTransport::new();
    let core = core_with(&transport, quiet_config(), fast_policy()).await;
    let id = core.send_message(&conv("c1"), "done", None).expect("send");
    assert!(wait_for_status(&core, &conv("c1"), &id, MessageStatus::Sent).await);
    assert!(!core.retry_message(&id).expect("retry"));
    assert!(!core.cancel_message(&id).expect("cancel"));
    assert_eq!(transport.calls().await.send_message, 1);
}

#[tokio::test]
async fn retry_of_unknown_message_is_not_found() {
    let transport = MockTransport::new();
    let core = core_with(&transport, quiet_config(), fast_policy()).await;
    let err = core
        .retry_message(&vendorchat_api::ClientId::random())
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn cancelled_failed_send_leaves_no_preview_behind() {
    let transport = MockTransport::new();
    transport.set_online(false).await;
    let core = core_with(&transport, quiet_config(), Policy {
        max_send_attempts: 1,
        ..fast_policy()
    })
    .await;

    let id = core
        .send_message(&conv("c9"), "oops wrong text", None)
        .expect("send");
    assert!(
        wait_until(|| core.delivery_state(&id) == Some(DeliveryState::Failed { attempts: 1 }))
            .await
    );
    assert!(core.cancel_message(&id).expect("cancel"));

    let listed = core.list_conversations(None);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].last_message_preview, "");
    assert_eq!(listed[0].last_activity_ms, 0);
    assert!(core.list_conversations(Some("oops")).is_empty());
}

#[tokio::test]
async fn record_discarded_mid_send_is_abandoned() {
    let transport = MockTransport::new();
    transport.set_online(false).await;
    transport.set_send_delay(40).await;
    let core = core_with(&transport, quiet_config(), Policy {
        backoff_initial_ms: 500,
        backoff_max_ms: 500,
        backoff_jitter_ms: 0,
        ..Policy::default()
    })
    .await;

    let id = core.send_message(&conv("c1"), "gone", None).expect("send");
    assert!(
        wait_until(|| matches!(core.delivery_state(&id), Some(DeliveryState::Sending { .. })))
            .await
    );
    assert!(core.store.discard_unsent(&id).expect("discard"));

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    assert_eq!(core.delivery_state(&id), None);
    assert_eq!(core.stats().backing_off_deliveries, 0);
    assert_eq!(transport.calls().await.send_message, 1);
}
