mod config;
mod dto;

use bytes::Bytes;
use config::{ConfigError, DaemonConfig, SeedConfig};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{info, warn, LevelFilter};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;
use vendorchat_api::{AttachmentRef, ClientId, ConversationId};
use vendorchat_core::error::CoreError;
use vendorchat_core::messaging::MockTransport;
use vendorchat_core::time::now_ms;
use vendorchat_core::Core;
use vendorchat_ui_api::{
    ActionResponse, ApiError, ApiMeta, ApiResponse, ConversationListDto, MarkReadResponse,
    MessageStatus, SendMessageRequest, SendMessageResponse, API_VERSION,
};

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config {0}")]
    Config(#[from] ConfigError),
    #[error("core")]
    Core,
    #[error("bind")]
    Bind,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("vendorchat.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path)?;
    cfg.validate()?;
    init_logging(&cfg);
    let core = init_core(&cfg).await?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (addr, server) = start_control_server(core.clone(), &cfg.api.bind_addr, shutdown_rx).await?;
    info!("control server listening on {}", addr);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let _ = ctrl_c.as_mut().await;
    let _ = shutdown_tx.send(());
    let _ = server.await;
    core.shutdown();
    Ok(())
}

fn init_logging(cfg: &DaemonConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

async fn seed_transport(transport: &MockTransport, seed: &SeedConfig) {
    for conversation in &seed.conversations {
        let id = ConversationId::new(conversation.id.clone());
        transport.add_conversation(&id, &conversation.participant).await;
        for body in &conversation.messages {
            transport.receive_incoming(&id, body).await;
        }
    }
}

async fn init_core(cfg: &DaemonConfig) -> Result<Arc<Core>, DaemonError> {
    let transport = if cfg.core.prefer_push {
        MockTransport::with_push(cfg.core.event_capacity)
    } else {
        MockTransport::new()
    };
    seed_transport(&transport, &cfg.seed).await;
    Core::init(cfg.core.clone(), cfg.policy.clone(), Arc::new(transport))
        .await
        .map(Arc::new)
        .map_err(|_| DaemonError::Core)
}

async fn start_control_server(
    core: Arc<Core>,
    bind_addr: &str,
    shutdown: oneshot::Receiver<()>,
) -> Result<(SocketAddr, JoinHandle<()>), DaemonError> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|_| DaemonError::Bind)?;
    let addr = listener.local_addr().map_err(|_| DaemonError::Bind)?;
    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let core_clone = core.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let core = core_clone.clone();
                                    async move { handle_request(core, req).await }
                                });
                                let _ = http1::Builder::new().serve_connection(io, service).await;
                            });
                        }
                        Err(err) => {
                            warn!("accept failed: {}", err);
                            break;
                        }
                    }
                }
            }
        }
    });
    Ok((addr, handle))
}

fn meta() -> ApiMeta {
    ApiMeta {
        api_version: API_VERSION,
        request_id: Uuid::new_v4(),
        timestamp_ms: now_ms(),
    }
}

fn respond<T: Serialize>(status: StatusCode, envelope: &ApiResponse<T>) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(envelope).unwrap_or_default();
    let mut response = Response::new(Full::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_response<T: Serialize>(status: StatusCode, data: T) -> Response<Full<Bytes>> {
    respond(
        status,
        &ApiResponse {
            meta: meta(),
            data: Some(data),
            error: None,
        },
    )
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response<Full<Bytes>> {
    respond::<()>(
        status,
        &ApiResponse {
            meta: meta(),
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.into(),
                details: None,
            }),
        },
    )
}

fn core_error_response(err: CoreError) -> Response<Full<Bytes>> {
    match err {
        CoreError::NotFound(what) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", what),
        CoreError::Validation(err) => {
            error_response(StatusCode::BAD_REQUEST, "VALIDATION", err.to_string())
        }
        CoreError::Transport(err) => {
            error_response(StatusCode::BAD_GATEWAY, "TRANSPORT", err.to_string())
        }
    }
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

async fn handle_request(core: Arc<Core>, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let response = match (method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => json_response(StatusCode::OK, serde_json::json!({"status":"ok"})),
        ("GET", ["stats"]) => json_response(StatusCode::OK, dto::stats_dto(&core.stats())),
        ("GET", ["conversations"]) => {
            let filter = query_param(query.as_deref(), "q");
            let conversations = core
                .list_conversations(filter.as_deref())
                .iter()
                .map(dto::conversation_dto)
                .collect();
            json_response(
                StatusCode::OK,
                ConversationListDto {
                    conversations,
                    total_unread: core.total_unread(),
                },
            )
        }
        ("GET", ["conversations", id, "messages"]) => {
            let id = ConversationId::new(*id);
            match core.open_conversation(&id) {
                Ok(view) => {
                    view.synced().await;
                    match view.snapshot() {
                        Ok(snapshot) => json_response(StatusCode::OK, dto::thread_dto(&snapshot)),
                        Err(err) => {
                            core.close_conversation(&id);
                            core_error_response(err)
                        }
                    }
                }
                Err(err) => core_error_response(err),
            }
        }
        ("POST", ["conversations", id, "messages"]) => {
            let id = ConversationId::new(*id);
            let body = req.into_body().collect().await?.to_bytes();
            match serde_json::from_slice::<SendMessageRequest>(&body) {
                Ok(request) => {
                    let attachment = request.attachment_ref.map(AttachmentRef::new);
                    match core.send_message(&id, &request.body, attachment) {
                        Ok(client_id) => json_response(
                            StatusCode::ACCEPTED,
                            SendMessageResponse {
                                client_id: client_id.to_string(),
                                status: MessageStatus::Pending,
                            },
                        ),
                        Err(err) => core_error_response(err),
                    }
                }
                Err(err) => error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", err.to_string()),
            }
        }
        ("POST", ["conversations", id, "read"]) => {
            let id = ConversationId::new(*id);
            match core.mark_conversation_read(&id).await {
                Ok(marked) => json_response(StatusCode::OK, MarkReadResponse { marked }),
                Err(err) => core_error_response(err),
            }
        }
        ("POST", ["conversations", id, "close"]) => {
            let changed = core.close_conversation(&ConversationId::new(*id));
            json_response(StatusCode::OK, ActionResponse { changed })
        }
        ("POST", ["messages", client_id, action @ ("retry" | "cancel")]) => {
            match ClientId::parse(client_id) {
                Some(client_id) => {
                    let result = if *action == "retry" {
                        core.retry_message(&client_id)
                    } else {
                        core.cancel_message(&client_id)
                    };
                    match result {
                        Ok(changed) => json_response(StatusCode::OK, ActionResponse { changed }),
                        Err(err) => core_error_response(err),
                    }
                }
                None => error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", "invalid client id"),
            }
        }
        _ => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "not found"),
    };
    Ok(response)
}

#[cfg(test)]
mod tests;
