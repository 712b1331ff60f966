use super::*;
use serde_json::json;
use vendorchat_api::MessageStatus as CoreStatus;

#[tokio::test]
async fn health_endpoint_ok() {
    let core = build_core(&test_config()).await;
    let (status, body) = dispatch_request(core, build_request("GET", "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["meta"]["api_version"], API_VERSION);
}

#[tokio::test]
async fn conversations_listed_and_filtered() {
    let core = build_core(&test_config()).await;
    let (status, body) =
        dispatch_request(core.clone(), build_request("GET", "/conversations", None)).await;
    assert_eq!(status, StatusCode::OK);
    let listed = body["data"]["conversations"].as_array().unwrap();
    assert_eq!(listed.len(), 2);
    // the second seed arrived last
    assert_eq!(listed[0]["id"], "guest-2");
    assert_eq!(listed[0]["last_message_preview"], "Thanks!");

    let (_, body) = dispatch_request(
        core.clone(),
        build_request("GET", "/conversations?q=table+4", None),
    )
    .await;
    let filtered = body["data"]["conversations"].as_array().unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0]["participant"], "Ana Table 4");

    let (_, body) = dispatch_request(
        core,
        build_request("GET", "/conversations?q=table%204", None),
    )
    .await;
    let filtered = body["data"]["conversations"].as_array().unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0]["participant"], "Ana Table 4");
}

#[test]
fn query_params_are_percent_decoded() {
    assert_eq!(
        query_param(Some("q=caf%C3%A9%20terrace&x=1"), "q").as_deref(),
        Some("café terrace")
    );
    assert_eq!(query_param(Some("q=a+b"), "q").as_deref(), Some("a b"));
    assert_eq!(query_param(Some("other=1"), "q"), None);
    assert_eq!(query_param(None, "q"), None);
}

#[tokio::test]
async fn open_thread_and_mark_read() {
    let core = build_core(&test_config()).await;
    let (status, body) = dispatch_request(
        core.clone(),
        build_request("GET", "/conversations/guest-1/messages", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = body["data"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["direction"], "Incoming");
    assert_eq!(body["data"]["conversation"]["unread_count"], 1);

    let (status, body) = dispatch_request(
        core.clone(),
        build_request("POST", "/conversations/guest-1/read", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["marked"], 1);
    assert_eq!(core.total_unread(), 0);

    let (_, body) = dispatch_request(
        core.clone(),
        build_request("POST", "/conversations/guest-1/close", None),
    )
    .await;
    assert_eq!(body["data"]["changed"], true);
    assert_eq!(core.stats().active_conversations, 0);
}

#[tokio::test]
async fn unknown_thread_is_not_found() {
    let core = build_core(&test_config()).await;
    let (status, body) = dispatch_request(
        core,
        build_request("GET", "/conversations/nobody/messages", None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn send_message_is_accepted_and_delivered() {
    let core = build_core(&test_config()).await;
    let (status, body) = dispatch_request(
        core.clone(),
        build_request(
            "POST",
            "/conversations/guest-1/messages",
            Some(json!({"body": "Yes, until 10pm"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["status"], "Pending");
    let client_id = ClientId::parse(body["data"]["client_id"].as_str().unwrap()).unwrap();

    let mut status = None;
    for _ in 0..200 {
        status = core
            .snapshot(&ConversationId::new("guest-1"))
            .ok()
            .and_then(|s| s.find_by_client(&client_id).map(|m| m.status));
        if status == Some(CoreStatus::Sent) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, Some(CoreStatus::Sent));

    let path = format!("/messages/{}/retry", client_id);
    let (status, body) = dispatch_request(core, build_request("POST", &path, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["changed"], false);
}

#[tokio::test]
async fn invalid_messages_are_rejected() {
    let core = build_core(&test_config()).await;
    let (status, body) = dispatch_request(
        core.clone(),
        build_request("POST", "/conversations/guest-1/messages", Some(json!({"body": "  "}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION");

    let (status, _) = dispatch_request(
        core.clone(),
        build_request("POST", "/conversations/guest-1/messages", Some(json!({"text": 1}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = dispatch_request(
        core.clone(),
        build_request("POST", "/messages/not-a-uuid/cancel", None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let path = format!("/messages/{}/retry", ClientId::random());
    let (status, _) = dispatch_request(core, build_request("POST", &path, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_and_unknown_routes() {
    let core = build_core(&test_config()).await;
    let (status, body) = dispatch_request(core.clone(), build_request("GET", "/stats", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["conversations"], 2);
    assert_eq!(body["data"]["failed_deliveries"], 0);

    let (status, body) = dispatch_request(core, build_request("DELETE", "/conversations", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}
