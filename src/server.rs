//! HTTP chat server.
//!
//! Each HTTP session is one [`ChatSession`] held in memory behind its own
//! mutex, so turns within a session run one at a time while sessions are
//! independent of each other. Sessions live until deleted, or until they
//! have been idle for `[server] session_idle_secs`; idle sessions are
//! dropped whenever a new session is opened.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/sessions` | Open a session (welcome message seeded) |
//! | `GET`  | `/sessions/{id}/messages` | Conversation log |
//! | `DELETE` | `/sessions/{id}` | End a session |
//! | `POST` | `/sessions/{id}/messages` | Single-shot turn, `{"content": "..."}` |
//! | `POST` | `/sessions/{id}/messages/stream` | Streaming turn over SSE |
//! | `POST` | `/sessions/{id}/document` | Upload a PDF (raw body, optional `x-filename`) |
//!
//! The streaming endpoint emits `fragment` events (`{"text": "..."}`, already
//! post-processed), then exactly one `done` (`{"message": {...}}`) or
//! `error` event.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "generation_failure", "message": "answer generation failed: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `missing_resource` (404),
//! `extraction_failure` (422), `index_error` (500), `embedding_failure` (502),
//! `generation_failure` (502), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::Config;
use crate::error::DocentError;
use crate::extract::DocumentSource;
use crate::models::Message;
use crate::session::{ChatServices, ChatSession};

const DEFAULT_UPLOAD_NAME: &str = "upload.pdf";

struct SessionSlot {
    session: Arc<Mutex<ChatSession>>,
    last_used: Instant,
}

type SessionMap = HashMap<Uuid, SessionSlot>;

#[derive(Clone)]
struct AppState {
    services: Arc<ChatServices>,
    sessions: Arc<RwLock<SessionMap>>,
    idle_timeout: Option<Duration>,
}

fn parse_session_id(id: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(id).map_err(|_| not_found(format!("no session {}", id)))
}

impl AppState {
    async fn session(&self, id: &str) -> Result<Arc<Mutex<ChatSession>>, AppError> {
        let id = parse_session_id(id)?;
        let mut sessions = self.sessions.write().await;
        let slot = sessions
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("no session {}", id)))?;
        slot.last_used = Instant::now();
        Ok(slot.session.clone())
    }

    /// Drops sessions idle for longer than the timeout. A turn already
    /// running keeps its session alive until it finishes.
    fn evict_idle(&self, sessions: &mut SessionMap) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let before = sessions.len();
        sessions.retain(|_, slot| slot.last_used.elapsed() < timeout);
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = sessions.len(), "idle sessions dropped");
        }
    }
}

/// Starts the HTTP server on `[server] bind`.
///
/// The API key is read and the providers are built before the socket is
/// bound, so a misconfiguration fails at startup.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let services = Arc::new(ChatServices::from_config(config.clone())?);
    let app = router(services);

    tracing::info!(bind = %bind_addr, "docent server listening");
    println!("docent server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Builds the application router around `services`.
pub fn router(services: Arc<ChatServices>) -> Router {
    let upload_limit = services.config().server.max_upload_bytes;
    let idle_secs = services.config().server.session_idle_secs;
    let state = AppState {
        services,
        sessions: Arc::new(RwLock::new(HashMap::new())),
        idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sessions", post(handle_create_session))
        .route("/sessions/{id}", delete(handle_delete_session))
        .route(
            "/sessions/{id}/messages",
            get(handle_list_messages).post(handle_ask),
        )
        .route("/sessions/{id}/messages/stream", post(handle_ask_stream))
        .route(
            "/sessions/{id}/document",
            post(handle_upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                code: self.code.clone(),
                message: self.message.clone(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

impl From<DocentError> for AppError {
    fn from(err: DocentError) -> Self {
        let status = match &err {
            DocentError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DocentError::MissingResource { .. } => StatusCode::NOT_FOUND,
            DocentError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DocentError::Embedding(_) | DocentError::Generation(_) => StatusCode::BAD_GATEWAY,
            DocentError::Index(_) | DocentError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Sessions ============

#[derive(Serialize)]
struct SessionResponse {
    id: Uuid,
    messages: Vec<Message>,
}

async fn handle_create_session(
    State(state): State<AppState>,
) -> (StatusCode, Json<SessionResponse>) {
    let session = ChatSession::new(state.services.clone());
    let response = SessionResponse {
        id: session.id(),
        messages: session.messages().to_vec(),
    };
    let mut sessions = state.sessions.write().await;
    state.evict_idle(&mut sessions);
    sessions.insert(
        session.id(),
        SessionSlot {
            session: Arc::new(Mutex::new(session)),
            last_used: Instant::now(),
        },
    );
    drop(sessions);
    tracing::info!(session = %response.id, "session opened");
    (StatusCode::CREATED, Json(response))
}

async fn handle_list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.session(&id).await?;
    let session = session.lock().await;
    Ok(Json(SessionResponse {
        id: session.id(),
        messages: session.messages().to_vec(),
    }))
}

async fn handle_delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_session_id(&id)?;
    state
        .sessions
        .write()
        .await
        .remove(&id)
        .ok_or_else(|| not_found(format!("no session {}", id)))?;
    tracing::info!(session = %id, "session closed");
    Ok(StatusCode::NO_CONTENT)
}

// ============ Turns ============

#[derive(Deserialize)]
struct AskRequest {
    content: String,
}

#[derive(Serialize)]
struct AskResponse {
    message: Message,
    messages: Vec<Message>,
}

fn ask_content(body: Result<Json<AskRequest>, JsonRejection>) -> Result<String, AppError> {
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    if request.content.trim().is_empty() {
        return Err(bad_request("content must not be empty"));
    }
    Ok(request.content)
}

async fn handle_ask(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Json<AskResponse>, AppError> {
    let content = ask_content(body)?;
    let session = state.session(&id).await?;
    let mut session = session.lock().await;

    let message = session.ask(&content).await?;
    Ok(Json(AskResponse {
        message,
        messages: session.messages().to_vec(),
    }))
}

#[derive(Serialize)]
struct FragmentEvent<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct DoneEvent {
    message: Message,
}

fn json_event<T: Serialize>(name: &str, payload: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

async fn handle_ask_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let content = ask_content(body)?;
    let session = state.session(&id).await?;

    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    tokio::spawn(async move {
        let mut session = session.lock().await;
        let fragments = tx.clone();
        let result = session
            .ask_streaming(&content, |text| {
                let _ = fragments.send(json_event("fragment", &FragmentEvent { text }));
            })
            .await;

        let last = match result {
            Ok(message) => json_event("done", &DoneEvent { message }),
            Err(e) => json_event("error", &AppError::from(e).body()),
        };
        let _ = tx.send(last);
    });

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ============ POST /sessions/{id}/document ============

#[derive(Serialize)]
struct DocumentResponse {
    name: String,
    chars: usize,
}

async fn handle_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DocumentResponse>, AppError> {
    if body.is_empty() {
        return Err(bad_request("request body must contain a PDF"));
    }
    let name = headers
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_UPLOAD_NAME)
        .to_string();

    let session = state.session(&id).await?;
    let mut session = session.lock().await;
    let text = session
        .set_document(DocumentSource::upload(name.clone(), body.to_vec()))
        .await?;

    Ok(Json(DocumentResponse {
        name,
        chars: text.chars().count(),
    }))
}
