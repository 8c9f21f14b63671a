//! Request handlers for the HTTP API.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{bearer_token, AuthenticatedUser};
use crate::objects::ObjectStore;
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::storage::{Conversation, Document};

/// Signed download URLs stay valid for an hour.
const DOWNLOAD_URL_TTL_SECS: i64 = 3600;

/// Resolve the caller from the Authorization header.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<AuthenticatedUser> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(ApiError::Unauthorized)?;
    Ok(state.auth.authenticate(token).await?)
}

/// Load a document and check it belongs to the caller. A document owned by
/// someone else reads as not found rather than forbidden.
fn owned_document(state: &AppState, user_id: Uuid, id: Uuid) -> ApiResult<Document> {
    let store = state
        .store
        .lock()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let document = store
        .get_document(id)?
        .filter(|d| d.user_id == user_id)
        .ok_or_else(|| ApiError::NotFound(format!("Document {id} not found")))?;
    Ok(document)
}

// ===== Documents =====

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_name: String,
    pub module: String,
    /// Declared content type, stored for later download only. Ingestion
    /// sniffs the real type from the bytes.
    pub content_type: Option<String>,
    pub content_base64: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResponse {
    #[serde(flatten)]
    pub document: Document,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

fn with_download_url(objects: &ObjectStore, document: Document) -> DocumentResponse {
    let download_url = objects
        .create_signed_url(&document.storage_path, DOWNLOAD_URL_TTL_SECS)
        .ok();
    DocumentResponse {
        document,
        download_url,
    }
}

pub async fn upload_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UploadRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = authenticate(&state, &headers).await?;

    if req.file_name.trim().is_empty() {
        return Err(ApiError::Validation("fileName is required".to_string()));
    }
    if req.module.trim().is_empty() {
        return Err(ApiError::Validation("module is required".to_string()));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&req.content_base64)
        .map_err(|_| ApiError::Validation("contentBase64 is not valid base64".to_string()))?;
    if bytes.is_empty() {
        return Err(ApiError::Validation("Uploaded file is empty".to_string()));
    }

    let storage_path = ObjectStore::namespaced_path(user.id, &req.file_name);
    state.objects.upload(
        &storage_path,
        &bytes,
        req.content_type.as_deref().unwrap_or("application/octet-stream"),
    )?;

    let ingested = state
        .pipeline
        .ingest(user.id, req.file_name.trim(), req.module.trim(), &storage_path)
        .await;
    let document = match ingested {
        Ok(document) => document,
        Err(e) => {
            // A rejected upload leaves nothing behind.
            if let Err(cleanup) = state.objects.remove(std::slice::from_ref(&storage_path)) {
                log::warn!("Failed to remove rejected upload {storage_path}: {cleanup}");
            }
            return Err(e.into());
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(with_download_url(&state.objects, document)),
    ))
}

#[derive(Deserialize)]
pub struct ListDocumentsQuery {
    pub module: Option<String>,
}

pub async fn list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListDocumentsQuery>,
) -> ApiResult<impl IntoResponse> {
    let user = authenticate(&state, &headers).await?;
    let documents = {
        let store = state
            .store
            .lock()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        store.list_documents(user.id, query.module.as_deref())?
    };
    let listed: Vec<DocumentResponse> = documents
        .into_iter()
        .map(|d| with_download_url(&state.objects, d))
        .collect();
    Ok(Json(listed))
}

pub async fn get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let user = authenticate(&state, &headers).await?;
    let document = owned_document(&state, user.id, id)?;
    Ok(Json(with_download_url(&state.objects, document)))
}

pub async fn delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let user = authenticate(&state, &headers).await?;
    let document = owned_document(&state, user.id, id)?;
    state.pipeline.delete_document(&document)?;
    log::info!("Deleted document {id} for user {}", user.id);
    Ok(StatusCode::NO_CONTENT)
}

// ===== Chat =====

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub question: String,
    pub module: String,
    pub document_id: Option<Uuid>,
}

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = authenticate(&state, &headers).await?;
    if req.module.trim().is_empty() {
        return Err(ApiError::Validation("module is required".to_string()));
    }
    // A scope to someone else's (or a missing) document fails fast.
    if let Some(document_id) = req.document_id {
        owned_document(&state, user.id, document_id)?;
    }
    let answer = state
        .assistant
        .answer(user.id, &req.question, req.module.trim(), req.document_id)
        .await?;
    Ok(Json(answer))
}

// ===== Conversations =====

pub async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(module): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let user = authenticate(&state, &headers).await?;
    let conversation = {
        let store = state
            .store
            .lock()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        store.get_conversation(user.id, &module)?
    };
    // A module with no history reads as an empty conversation.
    let conversation =
        conversation.unwrap_or_else(|| Conversation::new(user.id, module.clone()));
    Ok(Json(conversation))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(module): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let user = authenticate(&state, &headers).await?;
    {
        let store = state
            .store
            .lock()
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        store.delete_conversation(user.id, &module)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ===== Usage =====

pub async fn get_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user = authenticate(&state, &headers).await?;
    let allowance = state.usage.check_allowed(user.id)?;
    let today = state.usage.today(user.id)?;
    Ok(Json(json!({
        "queryCount": allowance.query_count,
        "dailyLimit": allowance.daily_limit,
        "remaining": (allowance.daily_limit - allowance.query_count).max(0),
        "resetTime": allowance.reset_time,
        "inputTokens": today.input_tokens,
        "outputTokens": today.output_tokens,
        "cost": today.cost,
    })))
}

// ===== Objects and health =====

#[derive(Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub sig: String,
}

/// Serve a stored object through its signed URL. The signature is the
/// authorization; no bearer token required.
pub async fn serve_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<SignedQuery>,
) -> ApiResult<Response> {
    state.objects.verify_signed(&path, query.expires, &query.sig)?;
    let bytes = state.objects.download(&path)?;
    let content_type = state
        .objects
        .content_type(&path)
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
