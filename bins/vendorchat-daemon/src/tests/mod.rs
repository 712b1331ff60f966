use super::*;
use crate::config::{ApiConfig, LoggingConfig, SeedConversation};
use http_body_util::BodyExt;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::duplex;
use vendorchat_core::config::CoreConfig;
use vendorchat_core::policy::Policy;

mod ui_api_tests;

#[tokio::test]
async fn config_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("conf.toml");
    let cfg = r#"
[core]
polling_interval_ms = 500
conversation_poll_interval_ms = 0
prefer_push = false

[policy]
max_body_bytes = 2048
backoff_initial_ms = 100
backoff_max_ms = 1000
max_send_attempts = 3

[api]
bind_addr = "127.0.0.1:0"

[logging]
level = "debug"

[[seed.conversations]]
id = "guest-1"
participant = "Ana"
messages = ["Hello", "Are you open?"]
"#;
    std::fs::write(&path, cfg).unwrap();
    let loaded = config::load_config(&path).unwrap();
    assert_eq!(loaded.core.polling_interval_ms, 500);
    assert!(!loaded.core.prefer_push);
    assert_eq!(loaded.core.preview_max_chars, CoreConfig::default().preview_max_chars);
    assert_eq!(loaded.policy.max_send_attempts, 3);
    assert_eq!(loaded.policy.backoff_factor, Policy::default().backoff_factor);
    assert_eq!(loaded.seed.conversations[0].messages.len(), 2);
    assert!(loaded.validate().is_ok());
}

#[tokio::test]
async fn config_rejects_unknown_keys() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("conf.toml");
    std::fs::write(&path, "[logging]\nlevel = \"info\"\n\n[core]\nturbo = true\n").unwrap();
    assert!(matches!(config::load_config(&path), Err(ConfigError::Parse)));
    assert!(matches!(
        config::load_config(&dir.path().join("missing.toml")),
        Err(ConfigError::Io)
    ));
}

#[tokio::test]
async fn daemon_starts_and_stops() {
    let cfg = test_config();
    let core = build_core(&cfg).await;
    let (tx, rx) = oneshot::channel();
    let (addr, handle) = start_control_server(core.clone(), &cfg.api.bind_addr, rx)
        .await
        .unwrap();
    assert!(addr.ip().is_loopback());
    let _ = tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    core.shutdown();
}

pub(super) fn test_config() -> DaemonConfig {
    DaemonConfig {
        core: CoreConfig {
            polling_interval_ms: 0,
            conversation_poll_interval_ms: 0,
            prefer_push: false,
            ..CoreConfig::default()
        },
        policy: Policy {
            backoff_initial_ms: 5,
            backoff_max_ms: 20,
            backoff_jitter_ms: 0,
            ..Policy::default()
        },
        api: ApiConfig {
            bind_addr: "127.0.0.1:0".to_string(),
        },
        logging: LoggingConfig {
            level: "error".to_string(),
        },
        seed: SeedConfig {
            conversations: vec![
                SeedConversation {
                    id: "guest-1".to_string(),
                    participant: "Ana Table 4".to_string(),
                    messages: vec!["Is the terrace open?".to_string()],
                },
                SeedConversation {
                    id: "guest-2".to_string(),
                    participant: "Ben".to_string(),
                    messages: vec!["Thanks!".to_string()],
                },
            ],
        },
    }
}

pub(super) async fn build_core(cfg: &DaemonConfig) -> Arc<Core> {
    init_logging(cfg);
    init_core(cfg).await.unwrap()
}

pub(super) fn build_request(method: &str, path: &str, body: Option<serde_json::Value>) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("host", "localhost");
    if body.is_some() {
        builder = builder.header(CONTENT_TYPE, "application/json");
    }
    let bytes = body
        .map(|value| value.to_string().into_bytes())
        .unwrap_or_default();
    builder.body(Full::from(Bytes::from(bytes))).unwrap()
}

pub(super) async fn dispatch_request(core: Arc<Core>, req: Request<Full<Bytes>>) -> (StatusCode, serde_json::Value) {
    let (client, server) = duplex(64 * 1024);
    let service = service_fn(move |incoming: Request<Incoming>| {
        let inner = core.clone();
        async move { handle_request(inner, incoming).await }
    });
    tokio::spawn(async move {
        let io = TokioIo::new(server);
        let _ = server_http1::Builder::new().serve_connection(io, service).await;
    });
    let io = TokioIo::new(client);
    let (mut sender, connection) = client_http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    let response = sender.send_request(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap();
    (status, value)
}
