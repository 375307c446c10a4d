use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, Method},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use palaver_shared::constants::DEFAULT_CHAT_PAGE_SIZE;
use palaver_shared::parts::MessagePart;
use palaver_shared::{Bucket, ChatId, MessageId, Visibility};
use palaver_store::{Chat, ChatMessage, Database};

use crate::access::{self, ChatAccess, ChatAccessCache};
use crate::auth::require_session;
use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::deletion::{self, DeletionSummary};
use crate::error::ServerError;
use crate::messages::{self, PostMessage, Vote};
use crate::quota::{self, FilesRateLimitResult, RateLimitResult};
use crate::storage::{self, FileUpload, StoredFile};

/// Largest page a chat listing returns.
const MAX_CHAT_PAGE_SIZE: u32 = 100;

/// Room for multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub blob_store: Arc<BlobStore>,
    pub access_cache: ChatAccessCache,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/rate-limit", get(rate_limit))
        .route("/rate-limit/files", get(files_rate_limit))
        .route("/chats", get(list_chats).delete(delete_all_chats))
        .route("/chats/{id}", delete(delete_chat))
        .route("/chats/{id}/access", get(chat_access))
        .route("/chats/{id}/visibility", patch(set_visibility))
        .route("/chats/{id}/branch", post(branch_chat))
        .route("/chats/{id}/messages", get(get_messages).post(post_message))
        .route("/chats/{id}/messages/{message_id}", put(update_message))
        .route(
            "/chats/{id}/messages/{message_id}/trailing",
            delete(delete_trailing_messages),
        )
        .route("/chats/{id}/messages/{message_id}/vote", post(vote_message))
        .route("/chats/{id}/files", post(upload_file))
        .route("/files/duplicate", post(duplicate_file))
        .route("/storage/v1/object/public/{bucket}/{*path}", get(download_object))
        .route("/preferences", get(get_preferences).put(put_preferences))
        .route("/account", delete(delete_account))
        .layer(DefaultBodyLimit::max(
            state.config.max_upload_size + MULTIPART_OVERHEAD,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Envelope and extraction helpers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Envelope<T> {
    success: bool,
    data: T,
}

type ApiResult<T> = Result<Json<Envelope<T>>, ServerError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        success: true,
        data,
    }))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServerError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ServerError::Validation(e.body_text()))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct Page {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
struct VisibilityRequest {
    visibility: Visibility,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BranchRequest {
    message_id: MessageId,
}

#[derive(Deserialize)]
struct UpdateMessageRequest {
    parts: Vec<MessagePart>,
}

#[derive(Deserialize)]
struct VoteRequest {
    vote: Vote,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DuplicateRequest {
    url: String,
    name: String,
    chat_id: ChatId,
    bucket: Bucket,
}

#[derive(Serialize)]
struct DeletedCount {
    deleted: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn rate_limit(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<RateLimitResult> {
    let user = require_session(&state, &headers).await?;
    let db = state.db.lock().await;
    ok(quota::check_rate_limit(&db, user.id, Some(user.role))?)
}

async fn files_rate_limit(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<FilesRateLimitResult> {
    let user = require_session(&state, &headers).await?;
    let db = state.db.lock().await;
    ok(quota::check_files_rate_limit(&db, user.id, Some(user.role))?)
}

async fn list_chats(
    headers: HeaderMap,
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> ApiResult<Vec<Chat>> {
    let user = require_session(&state, &headers).await?;
    let limit = page
        .limit
        .unwrap_or(DEFAULT_CHAT_PAGE_SIZE)
        .clamp(1, MAX_CHAT_PAGE_SIZE);
    let db = state.db.lock().await;
    ok(access::list_chats(&db, user.id, limit, page.offset.unwrap_or(0))?)
}

async fn delete_all_chats(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<DeletionSummary> {
    let user = require_session(&state, &headers).await?;
    let summary = deletion::delete_all_user_chats(&state.db, &state.blob_store, user.id).await?;
    state.access_cache.invalidate_user(user.id).await;
    ok(summary)
}

async fn chat_access(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ChatAccess> {
    let user = require_session(&state, &headers).await?;
    let chat_id = ChatId::parse(&id)?;
    ok(state
        .access_cache
        .get_chat_access(&state.db, chat_id, user.id)
        .await?)
}

async fn set_visibility(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<VisibilityRequest>, JsonRejection>,
) -> ApiResult<Chat> {
    let user = require_session(&state, &headers).await?;
    let chat_id = ChatId::parse(&id)?;
    let request = body(payload)?;

    let chat = {
        let db = state.db.lock().await;
        access::set_chat_visibility(&db, chat_id, user.id, request.visibility)?
    };
    state.access_cache.invalidate(chat_id).await;
    info!(chat = %chat_id, visibility = %chat.visibility, "Chat visibility changed");
    ok(chat)
}

async fn delete_chat(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeletionSummary> {
    let user = require_session(&state, &headers).await?;
    let chat_id = ChatId::parse(&id)?;
    let summary = deletion::delete_chat(&state.db, &state.blob_store, chat_id, user.id).await?;
    state.access_cache.invalidate(chat_id).await;
    ok(summary)
}

async fn branch_chat(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<BranchRequest>, JsonRejection>,
) -> ApiResult<Chat> {
    let user = require_session(&state, &headers).await?;
    let chat_id = ChatId::parse(&id)?;
    let request = body(payload)?;
    ok(storage::branch_chat(&state.db, &state.blob_store, user.id, chat_id, request.message_id).await?)
}

async fn get_messages(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ChatMessage>> {
    let user = require_session(&state, &headers).await?;
    let chat_id = ChatId::parse(&id)?;
    let access = state
        .access_cache
        .get_chat_access(&state.db, chat_id, user.id)
        .await?;
    let db = state.db.lock().await;
    ok(messages::read_messages(&db, chat_id, &access, true)?)
}

async fn post_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<PostMessage>, JsonRejection>,
) -> ApiResult<ChatMessage> {
    let user = require_session(&state, &headers).await?;
    let chat_id = ChatId::parse(&id)?;
    let post = body(payload)?;
    let db = state.db.lock().await;
    ok(messages::post_message(&db, &user, chat_id, post)?)
}

async fn update_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
    payload: Result<Json<UpdateMessageRequest>, JsonRejection>,
) -> ApiResult<ChatMessage> {
    let user = require_session(&state, &headers).await?;
    let chat_id = ChatId::parse(&id)?;
    let message_id = MessageId::parse(&message_id)?;
    let request = body(payload)?;
    let db = state.db.lock().await;
    ok(messages::update_message(&db, chat_id, user.id, message_id, &request.parts)?)
}

async fn delete_trailing_messages(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
) -> ApiResult<DeletedCount> {
    let user = require_session(&state, &headers).await?;
    let chat_id = ChatId::parse(&id)?;
    let message_id = MessageId::parse(&message_id)?;
    let db = state.db.lock().await;
    let deleted = messages::delete_messages_from(&db, chat_id, user.id, message_id)?;
    ok(DeletedCount { deleted })
}

async fn vote_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((id, message_id)): Path<(String, String)>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> ApiResult<()> {
    let user = require_session(&state, &headers).await?;
    let chat_id = ChatId::parse(&id)?;
    let message_id = MessageId::parse(&message_id)?;
    let request = body(payload)?;
    let db = state.db.lock().await;
    messages::set_message_vote(&db, chat_id, user.id, message_id, request.vote)?;
    ok(())
}

async fn upload_file(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<StoredFile> {
    let user = require_session(&state, &headers).await?;
    let chat_id = ChatId::parse(&id)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::Validation(format!("Multipart error: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let name = field.file_name().unwrap_or("file").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ServerError::Validation(format!("Failed to read field: {e}")))?;

        let upload = FileUpload {
            name,
            data,
            content_type,
        };
        let stored = storage::upload_file(
            &state.db,
            &state.blob_store,
            &user,
            chat_id,
            upload,
            state.config.max_upload_size,
        )
        .await?;
        return ok(stored);
    }

    Err(ServerError::Validation(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn duplicate_file(
    headers: HeaderMap,
    State(state): State<AppState>,
    payload: Result<Json<DuplicateRequest>, JsonRejection>,
) -> ApiResult<StoredFile> {
    let user = require_session(&state, &headers).await?;
    let request = body(payload)?;

    {
        let db = state.db.lock().await;
        let target = access::get_chat_access(&db, request.chat_id, user.id)?;
        if target.chat_found && !target.is_owner {
            return Err(ServerError::AccessDenied(
                "Only the chat owner can add files".to_string(),
            ));
        }
    }

    ok(storage::duplicate_file(
        &state.blob_store,
        &request.url,
        &request.name,
        request.chat_id,
        user.id,
        request.bucket,
    )
    .await?)
}

async fn download_object(
    State(state): State<AppState>,
    Path((bucket, path)): Path<(String, String)>,
) -> Result<Response, ServerError> {
    let bucket: Bucket = bucket.parse()?;
    let (data, content_type) = state.blob_store.download(bucket, &path).await?;
    debug!(%bucket, path = %path, size = data.len(), "Serving object");
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}

async fn get_preferences(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<serde_json::Value> {
    let user = require_session(&state, &headers).await?;
    let db = state.db.lock().await;
    let prefs = db
        .get_preferences(user.id)
        .map_err(ServerError::store("load preferences"))?;
    ok(prefs
        .map(|p| p.preferences)
        .unwrap_or_else(|| serde_json::json!({})))
}

async fn put_preferences(
    headers: HeaderMap,
    State(state): State<AppState>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> ApiResult<serde_json::Value> {
    let user = require_session(&state, &headers).await?;
    let preferences = body(payload)?;
    if !preferences.is_object() {
        return Err(ServerError::Validation(
            "preferences must be a JSON object".to_string(),
        ));
    }

    let db = state.db.lock().await;
    db.upsert_preferences(user.id, &preferences, chrono::Utc::now())
        .map_err(ServerError::store("save preferences"))?;
    ok(preferences)
}

async fn delete_account(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<DeletionSummary> {
    let user = require_session(&state, &headers).await?;
    let summary = deletion::delete_account(&state.db, &state.blob_store, user.id).await?;
    state.access_cache.invalidate_user(user.id).await;
    info!(user = %user.id, "Account deleted");
    ok(summary)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use palaver_shared::{Role, UserId};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SESSION: &str = "x-palaver-session";

    async fn test_state() -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            storage_path: dir.path().to_path_buf(),
            storage_base_url: "http://localhost:8080".to_string(),
            max_upload_size: 1024,
            ..ServerConfig::default()
        };
        let blob_store = BlobStore::new(config.storage_path.clone(), config.storage_base_url.clone())
            .await
            .unwrap();
        let state = AppState {
            db: Arc::new(Mutex::new(Database::open_in_memory().unwrap())),
            blob_store: Arc::new(blob_store),
            access_cache: ChatAccessCache::new(Duration::from_secs(60)),
            config: Arc::new(config),
        };
        (state, dir)
    }

    fn session(id: UserId, role: Role) -> String {
        json!({"user": {"id": id, "name": "Tester", "role": role}}).to_string()
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn request(method: &str, uri: &str, user: UserId, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(SESSION, session(user, Role::User));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn user_message(text: &str) -> Value {
        json!({
            "id": MessageId::new(),
            "role": "user",
            "parts": [{"type": "text", "text": text}],
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _dir) = test_state().await;
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_session_is_unauthorized() {
        let (state, _dir) = test_state().await;
        let req = Request::builder().uri("/chats").body(Body::empty()).unwrap();
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_invalid_chat_id_is_bad_request() {
        let (state, _dir) = test_state().await;
        let req = request("GET", "/chats/not-a-uuid/messages", UserId::new(), None);
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_conversation_flow() {
        let (state, _dir) = test_state().await;
        let owner = UserId::new();
        let chat = ChatId::new();

        let (status, body) = send(
            &state,
            request("POST", &format!("/chats/{chat}/messages"), owner, Some(user_message("Hello there"))),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["content"], "Hello there");

        let (_, body) = send(&state, request("GET", "/chats", owner, None)).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["title"], "Hello there");

        let (_, body) = send(&state, request("GET", "/rate-limit", owner, None)).await;
        assert_eq!(body["data"]["isOverLimit"], false);
        assert_eq!(body["data"]["messagesCounter"], 1);

        let (_, body) = send(&state, request("GET", &format!("/chats/{chat}/messages"), owner, None)).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_visibility_change_invalidates_cached_access() {
        let (state, _dir) = test_state().await;
        let owner = UserId::new();
        let stranger = UserId::new();
        let chat = ChatId::new();
        send(
            &state,
            request("POST", &format!("/chats/{chat}/messages"), owner, Some(user_message("secret"))),
        )
        .await;

        let access_uri = format!("/chats/{chat}/access");
        let (_, body) = send(&state, request("GET", &access_uri, stranger, None)).await;
        assert_eq!(body["data"]["allowed"], false);
        assert_eq!(body["data"]["visibility"], "private");

        let (status, _) = send(
            &state,
            request("PATCH", &format!("/chats/{chat}/visibility"), stranger, Some(json!({"visibility": "public"}))),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        send(
            &state,
            request("PATCH", &format!("/chats/{chat}/visibility"), owner, Some(json!({"visibility": "public"}))),
        )
        .await;
        let (_, body) = send(&state, request("GET", &access_uri, stranger, None)).await;
        assert_eq!(body["data"]["allowed"], true);
        assert_eq!(body["data"]["isOwner"], false);
    }

    #[tokio::test]
    async fn test_upload_download_and_account_deletion() {
        let (state, _dir) = test_state().await;
        let owner = UserId::new();
        let chat = ChatId::new();

        let boundary = "palaver-test-boundary";
        let multipart = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             hello world\r\n\
             --{boundary}--\r\n"
        );
        let req = Request::builder()
            .method("POST")
            .uri(format!("/chats/{chat}/files"))
            .header(SESSION, session(owner, Role::User))
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(multipart))
            .unwrap();
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let url = body["data"]["url"].as_str().unwrap().to_string();
        let path = url.strip_prefix("http://localhost:8080").unwrap();
        let response = build_router(state.clone())
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");

        let (status, body) = send(&state, request("DELETE", "/account", owner, None)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["files"], 1);

        let response = build_router(state.clone())
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trailing_delete_and_missing_target() {
        let (state, _dir) = test_state().await;
        let owner = UserId::new();
        let chat = ChatId::new();
        let first = user_message("one");
        let first_id = first["id"].as_str().unwrap().to_string();
        send(&state, request("POST", &format!("/chats/{chat}/messages"), owner, Some(first))).await;
        send(&state, request("POST", &format!("/chats/{chat}/messages"), owner, Some(user_message("two")))).await;

        let uri = format!("/chats/{chat}/messages/{first_id}/trailing");
        let (status, body) = send(&state, request("DELETE", &uri, owner, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["deleted"], 2);

        let (status, body) = send(&state, request("DELETE", &uri, owner, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Target message not found");
    }

    #[tokio::test]
    async fn test_preferences_round_trip() {
        let (state, _dir) = test_state().await;
        let user = UserId::new();

        let (_, body) = send(&state, request("GET", "/preferences", user, None)).await;
        assert_eq!(body["data"], json!({}));

        let (status, _) = send(&state, request("PUT", "/preferences", user, Some(json!([1, 2])))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        send(&state, request("PUT", "/preferences", user, Some(json!({"model": "fast"})))).await;
        let (_, body) = send(&state, request("GET", "/preferences", user, None)).await;
        assert_eq!(body["data"]["model"], "fast");
    }
}
