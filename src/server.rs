//! HTTP API server.
//!
//! Exposes the full question-answering surface over JSON, plus the chat
//! persistence CRUD used by UI clients.
//!
//! # Endpoints
//!
//! | Method   | Path                   | Description |
//! |----------|------------------------|-------------|
//! | `POST`   | `/session`             | Create a session |
//! | `POST`   | `/session/{id}/index`  | Build the session index from a file or URL |
//! | `POST`   | `/session/{id}/ask`    | Ask a question; streams tokens over SSE |
//! | `GET`    | `/chat/{session_id}`   | List stored Q&A rows for a session |
//! | `POST`   | `/chat`                | Insert a Q&A row |
//! | `PUT`    | `/chat/{id}`           | Update a Q&A row |
//! | `DELETE` | `/chat/{id}`           | Delete a Q&A row |
//! | `GET`    | `/health`              | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses carry one body shape:
//!
//! ```json
//! { "error": { "code": "session_busy", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `unsupported_format` (400),
//! `extraction_failed` (400), `not_found` (404), `no_index_bound` (409),
//! `session_busy` (409), `index_build_failed` (500), `generation_failed`
//! (500), `internal` (500).
//!
//! # Streaming
//!
//! `POST /session/{id}/ask` responds with SSE: zero or more `token` events
//! (`{"token": "..."}`), then exactly one `done` event
//! (`{"answer", "seq", "row_id"}`) once the turn is committed and persisted.
//! If the chat-store write fails, `done` carries `row_id: null` and a
//! `persist_error` message. Closing the connection before `done` cancels
//! the turn.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::QaError;
use crate::extract;
use crate::index::SessionIndex;
use crate::llm::LanguageModel;
use crate::models::{NewChatRow, SourceKind};
use crate::rag::{self, AnswerEvent};
use crate::session::SessionRegistry;
use crate::store;

/// How long a URL fetch may take during index building.
const URL_FETCH_TIMEOUT_SECS: u64 = 30;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
}

/// Starts the HTTP server.
///
/// Binds to `[server].bind`, runs the chat store migrations, and serves
/// until the process is terminated.
pub async fn run_server(
    config: &Config,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
) -> anyhow::Result<()> {
    let pool = store::connect(&config.chat_db.path).await?;
    store::run_migrations(&pool).await?;

    let bind_addr = config.server.bind.clone();
    let state = AppState {
        config: Arc::new(config.clone()),
        registry: Arc::new(SessionRegistry::new()),
        pool,
        embedder,
        llm,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/session", post(handle_create_session))
        .route("/session/{id}/index", post(handle_build_index))
        .route("/session/{id}/ask", post(handle_ask))
        .route("/chat", post(handle_insert_chat))
        .route(
            "/chat/{id}",
            get(handle_list_chat)
                .put(handle_update_chat)
                .delete(handle_delete_chat),
        )
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("ThreadQA server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
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

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<QaError> for AppError {
    fn from(err: QaError) -> Self {
        let status = match &err {
            QaError::UnsupportedFormat(_) | QaError::ExtractionFailed(_) => StatusCode::BAD_REQUEST,
            QaError::SessionNotFound(_) | QaError::TurnNotFound(_) => StatusCode::NOT_FOUND,
            QaError::NoIndexBound | QaError::SessionBusy => StatusCode::CONFLICT,
            QaError::EmbeddingFailed(_)
            | QaError::StorageFailed(_)
            | QaError::GenerationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Constructs a 404 Not Found error.
fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Constructs a 500 error for unexpected failures.
fn internal_error(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
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

// ============ POST /session ============

#[derive(Deserialize)]
struct CreateSessionRequest {
    label: String,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    label: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

async fn handle_create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, AppError> {
    if req.label.trim().is_empty() {
        return Err(bad_request("label must not be empty"));
    }

    let session = state.registry.create(req.label).await;
    tracing::info!(session_id = %session.id, "session created");

    Ok(Json(CreateSessionResponse {
        session_id: session.id.clone(),
        label: session.label.clone(),
        created_at: session.created_at,
    }))
}

// ============ POST /session/{id}/index ============

/// Index build request: either an uploaded file or a URL to fetch.
#[derive(Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
enum IndexRequest {
    File {
        filename: String,
        content_base64: String,
    },
    Url {
        url: String,
    },
}

async fn handle_build_index(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<IndexRequest>,
) -> Result<Json<crate::index::BuildSummary>, AppError> {
    let session = state.registry.get(&id).await?;

    let (text, kind) = match req {
        IndexRequest::File {
            filename,
            content_base64,
        } => {
            let file_kind = extract::kind_for_path(&filename)?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(content_base64.as_bytes())
                .map_err(|e| bad_request(format!("invalid base64 content: {}", e)))?;
            (extract::extract_file(&bytes, file_kind)?, SourceKind::File)
        }
        IndexRequest::Url { url } => (
            extract::extract_url(&url, Duration::from_secs(URL_FETCH_TIMEOUT_SECS)).await?,
            SourceKind::Url,
        ),
    };

    let (index, summary) = SessionIndex::build(
        &state.config,
        state.embedder.as_ref(),
        &session.id,
        kind,
        &text,
    )
    .await?;

    session.attach_index(Arc::new(index)).await;
    tracing::info!(
        session_id = %session.id,
        chunks = summary.chunks,
        "index built"
    );

    Ok(Json(summary))
}

// ============ POST /session/{id}/ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
    /// When set, re-answers the given turn: the new turn supersedes it.
    edit_of: Option<i64>,
}

async fn handle_ask(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AskRequest>,
) -> Result<Sse<ReceiverStream<Result<Event, Infallible>>>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let session = state.registry.get(&id).await?;

    let mut events = match req.edit_of {
        Some(seq) => {
            rag::regenerate(
                session.clone(),
                state.embedder.clone(),
                state.llm.clone(),
                &state.config,
                seq,
                &req.question,
            )
            .await?
        }
        None => {
            rag::answer(
                session.clone(),
                state.embedder.clone(),
                state.llm.clone(),
                &state.config,
                &req.question,
            )
            .await?
        }
    };

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(32);
    let pool = state.pool.clone();

    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                AnswerEvent::Token(token) => {
                    let sse = Event::default()
                        .event("token")
                        .json_data(serde_json::json!({ "token": token }));
                    let Ok(sse) = sse else { continue };
                    if tx.send(Ok(sse)).await.is_err() {
                        return; // client went away; dropping `events` cancels
                    }
                }
                AnswerEvent::Done(turn) => {
                    // `original_msg_id` carries the superseded turn's
                    // sequence number so histories rehydrate losslessly.
                    let new_row = NewChatRow {
                        session_id: session.id.clone(),
                        label: session.label.clone(),
                        question: turn.question.clone(),
                        answer: Some(turn.answer.clone()),
                        original_msg_id: turn.supersedes,
                    };
                    let persisted = store::insert_turn(&pool, &new_row).await;
                    if let Err(e) = &persisted {
                        tracing::warn!(error = %e, "failed to persist committed turn");
                    }

                    let sse = Event::default()
                        .event("done")
                        .json_data(done_payload(&turn, persisted));
                    if let Ok(sse) = sse {
                        let _ = tx.send(Ok(sse)).await;
                    }
                    return;
                }
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)))
}

/// Body of the terminal `done` SSE event.
///
/// The turn is committed to memory either way; a store write failure is
/// reported as `row_id: null` plus `persist_error`, so clients can tell
/// "committed but not persisted" apart from the normal case.
fn done_payload(
    turn: &crate::models::ConversationTurn,
    persisted: anyhow::Result<crate::models::ChatRow>,
) -> serde_json::Value {
    match persisted {
        Ok(row) => serde_json::json!({
            "answer": turn.answer,
            "seq": turn.seq,
            "row_id": row.id,
        }),
        Err(e) => serde_json::json!({
            "answer": turn.answer,
            "seq": turn.seq,
            "row_id": null,
            "persist_error": e.to_string(),
        }),
    }
}

// ============ Chat persistence CRUD ============

async fn handle_insert_chat(
    State(state): State<AppState>,
    Json(new_row): Json<NewChatRow>,
) -> Result<Json<crate::models::ChatRow>, AppError> {
    if new_row.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let row = store::insert_turn(&state.pool, &new_row)
        .await
        .map_err(internal_error)?;
    Ok(Json(row))
}

async fn handle_list_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<crate::models::ChatRow>>, AppError> {
    // Unknown sessions list empty rather than 404.
    let rows = store::list_by_session(&state.pool, &session_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(rows))
}

async fn handle_update_chat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<store::ChatRowUpdate>,
) -> Result<Json<crate::models::ChatRow>, AppError> {
    let updated = store::update_row(&state.pool, id, &update)
        .await
        .map_err(internal_error)?;
    match updated {
        Some(row) => Ok(Json(row)),
        None => Err(not_found(format!("chat row {} not found", id))),
    }
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn handle_delete_chat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = store::delete_row(&state.pool, id)
        .await
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found(format!("chat row {} not found", id)));
    }
    Ok(Json(DeleteResponse { deleted: true }))
}
