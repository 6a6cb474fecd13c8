use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::time::Instant;

use crate::bus::{Event, EventBus};
use crate::errors::ServiceError;
use crate::service::{BuildService, LogSubscription};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: BuildService,
    pub bus: EventBus,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PushWebhook {
    pub repo_url: String,
    /// Branch name; a full `refs/heads/...` ref is accepted too.
    #[serde(alias = "ref")]
    pub branch: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(msg) => ApiError::NotFound(msg),
            ServiceError::BadRequest(msg) => ApiError::BadRequest(msg),
            other => {
                tracing::error!(error = %other, "Request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/builds/{id}", get(get_build))
        .route("/api/builds/{id}/cancel", post(cancel_build))
        .route("/api/builds/{id}/retry", post(retry_build))
        .route("/api/builds/{id}/log", get(get_build_log))
        .route("/api/builds/{id}/log/ws", get(tail_build_log))
        .route("/api/webhooks/push", post(push_webhook))
        .route("/health", get(health_check))
}

pub fn build_router(state: SharedState) -> Router {
    api_router()
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_build(&id).await?))
}

async fn cancel_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.cancel_build(&id).await?))
}

async fn retry_build(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let build = state.service.retry_build(&id).await?;
    Ok((StatusCode::CREATED, Json(build)))
}

async fn get_build_log(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let log = state.service.get_build_log(&id).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log))
}

/// Upgrade to a WebSocket that streams the running build's log.
///
/// Validation happens before the upgrade so errors come back as plain HTTP.
async fn tail_build_log(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sub = state.service.subscribe_build_log(&id).await?;
    Ok(ws.on_upgrade(move |socket| {
        let (sender, receiver) = socket.split();
        run_socket_loop(sender, receiver, sub)
    }))
}

async fn push_webhook(
    State(state): State<SharedState>,
    Json(payload): Json<PushWebhook>,
) -> Result<impl IntoResponse, ApiError> {
    let branch = payload
        .branch
        .strip_prefix("refs/heads/")
        .unwrap_or(&payload.branch)
        .to_string();
    if payload.repo_url.is_empty() || branch.is_empty() {
        return Err(ApiError::BadRequest("repo_url and branch are required".into()));
    }
    tracing::info!(repo_url = %payload.repo_url, branch = %branch, "Push received");
    state.bus.publish(Event::RepositoryPushed {
        repo_url: payload.repo_url,
        branch,
    });
    Ok(StatusCode::ACCEPTED)
}

// ── Live log socket ───────────────────────────────────────────────────

/// Forward log chunks to the client with ping/pong keepalive.
///
/// Ends when the build settles (subscription closed), the client goes away,
/// or no Pong arrives within [`PONG_TIMEOUT`] of a Ping.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut sub: LogSubscription,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            chunk = sub.recv() => {
                match chunk {
                    Some(chunk) => {
                        if sender.send(Message::Text(chunk.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Topic;
    use crate::coordinator::Coordinator;
    use crate::logstream::LogStreamService;
    use crate::storage::{LocalStorage, Storage, build_log_key};
    use crate::store::{BuildStore, SqliteStore};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use kiln_common::{Build, BuildStatus};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: Arc<SqliteStore>,
        storage: Arc<LocalStorage>,
        bus: EventBus,
        _dir: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let storage = Arc::new(LocalStorage::new(dir.path()));
        let bus = EventBus::default();
        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(LogStreamService::new()),
            bus.clone(),
            4,
        );
        let state = Arc::new(AppState {
            service: BuildService::new(store.clone(), storage.clone(), coordinator),
            bus: bus.clone(),
        });
        TestApp {
            router: api_router().with_state(state),
            store,
            storage,
            bus,
            _dir: dir,
        }
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = app.router.oneshot(request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_get_build() {
        let app = test_app();
        let build = Build::queued("app1", "abc123");
        app.store.create_build(&build).await.unwrap();

        let response = app
            .router
            .oneshot(request("GET", &format!("/api/builds/{}", build.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["id"], build.id);
        assert_eq!(json["status"], "queued");
    }

    #[tokio::test]
    async fn test_get_build_not_found() {
        let app = test_app();
        let response = app
            .router
            .oneshot(request("GET", "/api/builds/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response.into_body()).await;
        assert!(json["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_cancel_queued_build() {
        let app = test_app();
        let build = Build::queued("app1", "abc123");
        app.store.create_build(&build).await.unwrap();

        let response = app
            .router
            .clone()
            .oneshot(request("POST", &format!("/api/builds/{}/cancel", build.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response.into_body()).await["status"], "canceled");

        let again = app
            .router
            .oneshot(request("POST", &format!("/api/builds/{}/cancel", build.id)))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retry_creates_new_build() {
        let app = test_app();
        let mut build = Build::queued("app1", "abc123");
        build.retriable = true;
        app.store.create_build(&build).await.unwrap();
        app.store
            .update_build_if(&build.id, BuildStatus::Queued, BuildStatus::Skipped)
            .await
            .unwrap();

        let response = app
            .router
            .oneshot(request("POST", &format!("/api/builds/{}/retry", build.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["status"], "queued");
        assert_eq!(json["commit"], "abc123");
        assert_ne!(json["id"], build.id);
    }

    #[tokio::test]
    async fn test_stored_log_served_as_text() {
        let app = test_app();
        let build = Build::queued("app1", "abc123");
        app.store.create_build(&build).await.unwrap();
        app.store
            .update_build_if(&build.id, BuildStatus::Queued, BuildStatus::Canceled)
            .await
            .unwrap();
        app.storage
            .save(&build_log_key(&build.id), b"done\n".to_vec())
            .await
            .unwrap();

        let response = app
            .router
            .oneshot(request("GET", &format!("/api/builds/{}/log", build.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"done\n");
    }

    #[tokio::test]
    async fn test_push_webhook_publishes_event() {
        let app = test_app();
        let mut sub = app.bus.subscribe(&[Topic::RepositoryPushed]);

        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/push")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "repo_url": "https://git.example.com/blog.git",
                            "ref": "refs/heads/main"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            sub.recv().await.unwrap(),
            Event::RepositoryPushed {
                repo_url: "https://git.example.com/blog.git".into(),
                branch: "main".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_push_webhook_rejects_empty_branch() {
        let app = test_app();
        let response = app
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/push")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"repo_url": "https://git.example.com/blog.git", "branch": ""}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
