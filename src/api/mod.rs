mod error;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::validate_request::ValidateRequestHeaderLayer;
use validator::Validate;

pub use error::{ApiError, ApiMessage, DOCUMENT_NOT_FOUND};

use crate::config::BasicAuthSettings;
use crate::database::{CursorQuery, DocumentId, MAX_PAGE_SIZE};
use crate::llm::{ChatService, RagService};
use crate::providers::traits::{ChatMessage, ChatStream};

type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    rag: Arc<RagService>,
    chat: Arc<ChatService>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct DocumentRequest {
    #[validate(length(min = 1, message = "content must not be empty"))]
    content: String,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    cursor: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    q: Option<String>,
    #[serde(rename = "topK")]
    top_k: Option<String>,
}

#[derive(Serialize)]
struct CreatedResponse {
    message: String,
    id: DocumentId,
}

#[derive(Serialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Serialize)]
struct ChatDelta {
    content: String,
}

/// Create and configure the API router
pub fn create_api(
    rag: Arc<RagService>,
    chat: Arc<ChatService>,
    basic_auth: Option<&BasicAuthSettings>,
) -> Router {
    let state = AppState { rag, chat };

    let mut protected = Router::new()
        .route("/document", post(create_document).get(list_documents))
        .route(
            "/document/:id",
            get(get_document).put(update_document).delete(delete_document),
        )
        .route("/document/:id/chunks", get(document_chunks))
        .route("/search/document", get(search_documents))
        .route("/chat", post(chat_handler));

    if let Some(auth) = basic_auth {
        info!("Basic auth enabled for document and chat routes");
        protected = protected.route_layer(ValidateRequestHeaderLayer::basic(
            &auth.username,
            &auth.password,
        ));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    let api = Router::new()
        .route("/health", get(health_check))
        .merge(protected);

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn(log_requests))
        .layer(cors)
        .with_state(state)
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let elapsed = started.elapsed();
    if status.is_server_error() {
        warn!("{} {} -> {} ({:?})", method, uri, status, elapsed);
    } else {
        info!("{} {} -> {} ({:?})", method, uri, status, elapsed);
    }
    response
}

fn parse_document_id(raw: &str) -> ApiResult<DocumentId> {
    raw.parse::<DocumentId>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::BadRequest("invalid document id".to_string()))
}

fn parse_document_request(
    payload: Result<Json<DocumentRequest>, JsonRejection>,
) -> ApiResult<DocumentRequest> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    request
        .validate()
        .map_err(|errors| ApiError::BadRequest(errors.to_string()))?;
    Ok(request)
}

async fn health_check() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_document(
    State(state): State<AppState>,
    payload: Result<Json<DocumentRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = parse_document_request(payload)?;
    let id = state.rag.insert_document(&request.content).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            message: "success".to_string(),
            id,
        }),
    ))
}

async fn list_documents(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<impl IntoResponse> {
    let query = CursorQuery {
        cursor: params.cursor,
        limit: params.limit.and_then(|limit| limit.trim().parse().ok()),
    };

    Ok(Json(state.rag.list_documents(query).await?))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_document_id(&id)?;
    Ok(Json(state.rag.get_document(id).await?))
}

async fn document_chunks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_document_id(&id)?;
    Ok(Json(state.rag.document_chunks(id).await?))
}

async fn update_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<DocumentRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let id = parse_document_id(&id)?;
    let request = parse_document_request(payload)?;
    state.rag.update_document(id, &request.content).await?;

    Ok(Json(ApiMessage::new("success")))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_document_id(&id)?;

    if state.rag.delete_document(id).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Ok((StatusCode::NOT_FOUND, Json(ApiMessage::new(DOCUMENT_NOT_FOUND))).into_response())
    }
}

async fn search_documents(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<impl IntoResponse> {
    let query = params
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("query parameter 'q' is required".to_string()))?;

    let top_k = match params.top_k {
        Some(raw) => Some(
            raw.trim()
                .parse::<usize>()
                .ok()
                .filter(|k| *k > 0)
                .ok_or_else(|| ApiError::BadRequest("invalid topK".to_string()))?
                .min(MAX_PAGE_SIZE),
        ),
        None => None,
    };

    Ok(Json(state.rag.get_relevant_chunks(&query, top_k).await?))
}

async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = payload.map_err(|_| ApiError::BadRequest("invalid json".to_string()))?;

    let messages = match body.get("messages") {
        Some(messages @ Value::Array(_)) => messages.clone(),
        _ => return Err(ApiError::BadRequest("messages must be an array".to_string())),
    };
    let messages: Vec<ChatMessage> = serde_json::from_value(messages)
        .map_err(|e| ApiError::BadRequest(format!("invalid messages: {}", e)))?;

    if wants_stream(&headers, &body) {
        let deltas = state.chat.chat_stream(messages).await?;
        return Ok(reply_events(deltas).into_response());
    }

    let reply = state.chat.chat(messages).await?;
    Ok(Json(ChatResponse { message: reply }).into_response())
}

/// `"stream": true` in the body or an `Accept: text/event-stream` header.
fn wants_stream(headers: &HeaderMap, body: &Value) -> bool {
    let accepts_events = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));

    accepts_events || body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

/// One `data: {"content": ...}` event per delta, then `event: done`.
/// A failure mid-reply becomes an `event: error` before the stream closes.
fn reply_events(deltas: ChatStream) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let events = deltas
        .map(|delta| match delta {
            Ok(content) => Event::default().json_data(ChatDelta { content }),
            Err(e) => {
                error!("Chat stream failed: {:#}", e);
                Ok(Event::default().event("error").data("upstream service error"))
            }
        })
        .chain(stream::once(async {
            Ok(Event::default().event("done").data("[DONE]"))
        }));

    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryDocumentRepository;
    use crate::document::Chunker;
    use crate::testing::{FakeChat, FakeEmbedder, DIMENSIONS};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use tower::ServiceExt;

    fn app_with(basic_auth: Option<&BasicAuthSettings>) -> Router {
        let rag = Arc::new(RagService::new(
            Arc::new(InMemoryDocumentRepository::new()),
            Arc::new(FakeEmbedder::default()),
            Chunker::new(10, 3).unwrap(),
            DIMENSIONS,
            3,
        ));
        let chat = Arc::new(ChatService::new(
            rag.clone(),
            Arc::new(FakeChat::default()),
            "Be brief.".to_string(),
        ));
        create_api(rag, chat, basic_auth)
    }

    fn app() -> Router {
        app_with(None)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(), Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_document_lifecycle() {
        let app = app();

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/document",
            Some(r#"{"content":"abcdefghijklmnopqrstuvwxy"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["message"], "success");
        let id = body["id"].as_i64().unwrap();

        let (status, body) = send(&app, Method::GET, &format!("/api/document/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "abcdefghijklmnopqrstuvwxy");
        assert!(body["createdAt"].is_string());

        let (status, body) =
            send(&app, Method::GET, &format!("/api/document/{}/chunks", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 4);

        let (status, _) = send(
            &app,
            Method::PUT,
            &format!("/api/document/{}", id),
            Some(r#"{"content":"short"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&app, Method::GET, &format!("/api/document/{}/chunks", id), None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["chunk"], "short");

        let (status, body) = send(&app, Method::DELETE, &format!("/api/document/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(body, Value::Null);

        let (status, body) = send(&app, Method::DELETE, &format!("/api/document/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "document not found");
    }

    #[tokio::test]
    async fn test_empty_content_rejected_by_schema() {
        let (status, body) =
            send(&app(), Method::POST, "/api/document", Some(r#"{"content":""}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("content must not be empty"));
    }

    #[tokio::test]
    async fn test_bad_document_payloads() {
        let app = app();

        let (status, body) = send(&app, Method::POST, "/api/document", Some("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].is_string());

        let (status, _) = send(&app, Method::POST, "/api/document", Some(r#"{"text":"x"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::PUT, "/api/document/1", Some(r#"{"content":""}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_documents() {
        let app = app();

        let (status, body) = send(&app, Method::DELETE, "/api/document/5", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "document not found");

        let (status, _) = send(&app, Method::GET, "/api/document/5", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            send(&app, Method::PUT, "/api/document/5", Some(r#"{"content":"new"}"#)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, Method::DELETE, "/api/document/abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "invalid document id");

        let (status, _) = send(&app, Method::DELETE, "/api/document/0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cursor_listing() {
        let app = app();
        for content in ["first", "second", "third"] {
            let body = format!(r#"{{"content":"{}"}}"#, content);
            send(&app, Method::POST, "/api/document", Some(&body)).await;
        }

        let (status, body) = send(&app, Method::GET, "/api/document?limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["content"], "third");
        assert_eq!(items[1]["content"], "second");
        let cursor = body["nextCursor"].as_str().unwrap().to_string();

        let (_, body) = send(
            &app,
            Method::GET,
            &format!("/api/document?limit=2&cursor={}", cursor),
            None,
        )
        .await;
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["content"], "first");
        assert_eq!(body["nextCursor"], Value::Null);

        let (status, body) = send(&app, Method::GET, "/api/document?limit=lots", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_search() {
        let app = app();
        send(&app, Method::POST, "/api/document", Some(r#"{"content":"zebra zoo"}"#)).await;
        send(&app, Method::POST, "/api/document", Some(r#"{"content":"apple pie"}"#)).await;

        let (status, body) = send(&app, Method::GET, "/api/search/document?q=zoo&topK=1", None).await;
        assert_eq!(status, StatusCode::OK);
        let results = body.as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0]["chunk"].as_str().unwrap().contains('z'));
        assert!(results[0]["distance"].is_number());

        let (status, body) = send(&app, Method::GET, "/api/search/document", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "query parameter 'q' is required");

        let (status, _) = send(&app, Method::GET, "/api/search/document?q=zoo&topK=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat() {
        let app = app();
        send(&app, Method::POST, "/api/document", Some(r#"{"content":"opening hours"}"#)).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/chat",
            Some(r#"{"messages":[{"role":"user","content":"when open?"}]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"]["role"], "assistant");
        assert_eq!(body["message"]["content"], "echo: when open?");

        let (status, body) =
            send(&app, Method::POST, "/api/chat", Some(r#"{"messages":"hi"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "messages must be an array");

        let (status, body) = send(&app, Method::POST, "/api/chat", Some("{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "messages must be an array");

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/chat",
            Some(r#"{"messages":[{"role":"wizard","content":"x"}]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    async fn stream_chat(app: &Router, request: Request<Body>) -> (StatusCode, String, String) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
    }

    /// Concatenated `content` of every JSON data line.
    fn streamed_text(body: &str) -> String {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .filter_map(|data| serde_json::from_str::<Value>(data).ok())
            .filter_map(|event| event["content"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_chat_streams_events() {
        let app = app();
        send(&app, Method::POST, "/api/document", Some(r#"{"content":"opening hours"}"#)).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::from(
                r#"{"messages":[{"role":"user","content":"when open?"}]}"#,
            ))
            .unwrap();
        let (status, content_type, body) = stream_chat(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/event-stream"));
        assert_eq!(streamed_text(&body), "echo: when open?");
        assert!(body.matches("data: {").count() >= 2);
        assert!(body.contains("event: done"));
        assert!(!body.contains("event: error"));
    }

    #[tokio::test]
    async fn test_chat_stream_flag_in_body() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"stream":true,"messages":[{"role":"user","content":"hi there"}]}"#,
            ))
            .unwrap();
        let (status, content_type, body) = stream_chat(&app(), request).await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.starts_with("text/event-stream"));
        assert_eq!(streamed_text(&body), "echo: hi there");
    }

    #[tokio::test]
    async fn test_chat_stream_failure_midway() {
        let rag = Arc::new(RagService::new(
            Arc::new(InMemoryDocumentRepository::new()),
            Arc::new(FakeEmbedder::default()),
            Chunker::new(10, 3).unwrap(),
            DIMENSIONS,
            3,
        ));
        let chat = Arc::new(ChatService::new(
            rag.clone(),
            Arc::new(FakeChat::breaking_stream()),
            "Be brief.".to_string(),
        ));
        let app = create_api(rag, chat, None);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::from(r#"{"messages":[{"role":"user","content":"hi there"}]}"#))
            .unwrap();
        let (status, _, body) = stream_chat(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(streamed_text(&body), "echo: ");
        assert!(body.contains("event: error"));
        assert!(body.contains("data: upstream service error"));
        assert!(body.contains("event: done"));
    }

    #[tokio::test]
    async fn test_chat_stream_rejects_bad_input_as_json() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream")
            .body(Body::from(r#"{"messages":[]}"#))
            .unwrap();
        let (status, content_type, _) = stream_chat(&app(), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(content_type.starts_with("application/json"));
    }

    #[tokio::test]
    async fn test_basic_auth_guards_all_but_health() {
        let auth = BasicAuthSettings {
            username: "admin".to_string(),
            password: "secret".to_string(),
        };
        let app = app_with(Some(&auth));

        let (status, _) = send(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/document")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // "admin:secret" in base64
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/document")
                    .header(header::AUTHORIZATION, "Basic YWRtaW46c2VjcmV0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
