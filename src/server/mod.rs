//! HTTP server: shared state, routing, and lifecycle.

mod error;
mod handlers;

pub use error::{ApiError, ApiResult};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::auth::AuthProvider;
use crate::objects::ObjectStore;
use crate::rag::{Assistant, IngestionPipeline, UsageMeter};
use crate::storage::Store;

/// Uploads above this size are rejected before any handler runs.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// State shared across requests.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Mutex<Store>>,
    pub objects: Arc<ObjectStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub pipeline: IngestionPipeline,
    pub assistant: Arc<Assistant>,
    pub usage: Arc<UsageMeter>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route(
            "/api/documents",
            post(handlers::upload_document).get(handlers::list_documents),
        )
        .route(
            "/api/documents/{id}",
            get(handlers::get_document).delete(handlers::delete_document),
        )
        .route("/api/chat", post(handlers::chat))
        .route(
            "/api/conversations/{module}",
            get(handlers::get_conversation).delete(handlers::delete_conversation),
        )
        .route("/api/usage", get(handlers::get_usage))
        .route("/objects/{*path}", get(handlers::serve_object))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handle for a running server.
pub struct ServerHandle {
    /// Address the server is listening on.
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Signal the server to shut down gracefully.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the server task to finish.
    pub async fn stopped(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Bind and start serving. Returns a handle for shutdown.
pub async fn start(state: AppState, bind: &str) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    log::info!("Listening on http://{addr}");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(state);

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                log::info!("Server shutting down");
            })
            .await
            .ok();
    });

    Ok(ServerHandle {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticTokenProvider, TokenEntry};
    use crate::config::AppConfig;
    use crate::rag::embedder::EmbeddingClient;
    use crate::rag::generator::{Completion, GenerationClient, PromptMessage};
    use crate::search::LexicalIndex;
    use crate::storage::DocumentStatus;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use base64::Engine;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct StubEmbeddings;

    #[async_trait]
    impl EmbeddingClient for StubEmbeddings {
        async fn embed(
            &self,
            texts: &[String],
        ) -> crate::rag::embedder::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct StubGenerator;

    #[async_trait]
    impl GenerationClient for StubGenerator {
        async fn complete(
            &self,
            _messages: &[PromptMessage],
            _max_tokens: u32,
            _temperature: f64,
        ) -> crate::rag::generator::Result<Completion> {
            Ok(Completion {
                text: "A grounded answer [1].".to_string(),
                input_tokens: 10,
                output_tokens: 5,
            })
        }
    }

    const TOKEN: &str = "tok-test";

    fn test_state(user_id: Uuid) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default();
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let lexical = Arc::new(Mutex::new(
            LexicalIndex::new(dir.path().join("lexical")).unwrap(),
        ));
        let objects = Arc::new(
            ObjectStore::new(dir.path().join("objects"), "secret".to_string()).unwrap(),
        );
        let embeddings: Arc<dyn EmbeddingClient> = Arc::new(StubEmbeddings);
        let generator: Arc<dyn GenerationClient> = Arc::new(StubGenerator);

        let pipeline = IngestionPipeline::new(
            Arc::clone(&store),
            Arc::clone(&lexical),
            Arc::clone(&objects),
            Arc::clone(&embeddings),
            config.chunking.clone(),
        );
        let assistant = Arc::new(Assistant::new(
            Arc::clone(&store),
            Arc::clone(&lexical),
            Arc::clone(&embeddings),
            Arc::clone(&generator),
            UsageMeter::new(Arc::clone(&store), config.usage.clone()),
            config.retrieval.clone(),
            config.chat.clone(),
            config.generation.clone(),
        ));
        let usage = Arc::new(UsageMeter::new(Arc::clone(&store), config.usage.clone()));
        let auth = Arc::new(StaticTokenProvider::new(vec![TokenEntry {
            token: TOKEN.to_string(),
            user_id,
            email: "test@example.com".to_string(),
        }]));

        let state = AppState {
            store,
            objects,
            auth,
            pipeline,
            assistant,
            usage,
        };
        (state, dir)
    }

    fn authed(builder: axum::http::request::Builder) -> axum::http::request::Builder {
        builder.header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let (state, _dir) = test_state(Uuid::new_v4());
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let (state, _dir) = test_state(Uuid::new_v4());
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/documents")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_upload_then_list() {
        let user = Uuid::new_v4();
        let (state, _dir) = test_state(user);
        let app = router(state.clone());

        let content: String = (0..300).map(|i| format!("word{i} ")).collect();
        let payload = serde_json::json!({
            "fileName": "notes.txt",
            "module": "Biology",
            "contentType": "text/plain",
            "contentBase64": base64::engine::general_purpose::STANDARD.encode(content),
        });
        let response = app
            .clone()
            .oneshot(
                authed(Request::builder().method("POST").uri("/api/documents"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let uploaded = body_json(response).await;
        assert_eq!(uploaded["status"], "processing");
        let id = Uuid::parse_str(uploaded["id"].as_str().unwrap()).unwrap();

        // Let the detached ingestion phase finish.
        for _ in 0..50 {
            let status = state
                .store
                .lock()
                .unwrap()
                .get_document(id)
                .unwrap()
                .unwrap()
                .status;
            if status != DocumentStatus::Processing {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let response = app
            .oneshot(
                authed(Request::builder().uri("/api/documents?module=Biology"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["status"], "ready");
        assert!(listed[0]["downloadUrl"].as_str().unwrap().starts_with("/objects/"));
    }

    #[tokio::test]
    async fn test_rejected_upload_leaves_no_object() {
        let user = Uuid::new_v4();
        let (state, _dir) = test_state(user);

        // Neither a PDF signature nor valid UTF-8.
        let payload = serde_json::json!({
            "fileName": "junk.bin",
            "module": "Biology",
            "contentBase64": base64::engine::general_purpose::STANDARD
                .encode([0xffu8, 0xfe, 0x00, 0x80, 0xff]),
        });
        let response = router(state.clone())
            .oneshot(
                authed(Request::builder().method("POST").uri("/api/documents"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        // The stored bytes and sidecar were cleaned up with the rejection.
        let path = crate::objects::ObjectStore::namespaced_path(user, "junk.bin");
        assert!(matches!(
            state.objects.download(&path),
            Err(crate::objects::ObjectError::NotFound(_))
        ));
        assert!(state.objects.content_type(&path).is_none());
    }

    #[tokio::test]
    async fn test_chat_requires_module() {
        let (state, _dir) = test_state(Uuid::new_v4());
        let payload = serde_json::json!({ "question": "hi", "module": "  " });
        let response = router(state)
            .oneshot(
                authed(Request::builder().method("POST").uri("/api/chat"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_signed_object_url_roundtrip() {
        let user = Uuid::new_v4();
        let (state, _dir) = test_state(user);
        let path = format!("{user}/paper.txt");
        state.objects.upload(&path, b"hello", "text/plain").unwrap();
        let url = state.objects.create_signed_url(&path, 60).unwrap();

        let response = router(state.clone())
            .oneshot(Request::builder().uri(&url).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");

        // A tampered signature is rejected.
        let bad = url.replace("sig=", "sig=0");
        let response = router(state)
            .oneshot(Request::builder().uri(&bad).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_usage_endpoint() {
        let (state, _dir) = test_state(Uuid::new_v4());
        let response = router(state)
            .oneshot(
                authed(Request::builder().uri("/api/usage"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let usage = body_json(response).await;
        assert_eq!(usage["queryCount"], 0);
        assert_eq!(usage["remaining"], usage["dailyLimit"]);
    }
}
