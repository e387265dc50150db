use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::cache::CACHE_EXPIRES_AFTER;
use crate::error::ApiError;
use crate::{AppState, REPOST_ADDRESS};

static KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+$").expect("static regex"));
static PATTERN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w?*^\-]+$").expect("static regex"));

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/properties", get(properties))
        .route("/sign", post(sign))
        .route("/api/v0/ipfs/pubsub/pub", post(repost))
        .route("/api/v0/p2p/pubsub/pub", post(repost))
        .route("/cache/", get(list_keys))
        .route(
            "/cache/{*key}",
            get(get_key).put(put_key).delete(delete_key),
        )
        .fallback(proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Copy an upstream response: status, content type and body.
async fn relay(response: reqwest::Response) -> Result<Response, ApiError> {
    let status = response.status();
    let content_type = response.headers().get(CONTENT_TYPE).cloned();
    let body = response.bytes().await?;

    let mut reply = (status, body).into_response();
    if let Some(content_type) = content_type {
        reply.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    Ok(reply)
}

/// Read-only passthrough to the ledger API.
async fn proxy(State(state): State<AppState>, method: Method, uri: Uri) -> Result<Response, ApiError> {
    if !matches!(method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return Err(ApiError::MethodNotAllowed);
    }
    let tail = uri.path().trim_start_matches('/');
    let url = match uri.query() {
        Some(query) => format!("{}/{}?{}", state.settings.api_server, tail, query),
        None => format!("{}/{}", state.settings.api_server, tail),
    };
    debug!(url = %url, "proxying to ledger API");

    let response = state.client.request(method, url).send().await?;
    relay(response).await
}

async fn properties(State(state): State<AppState>) -> Result<Response, ApiError> {
    debug!("forwarding signing properties");
    let url = format!("{}/properties", state.settings.connector);
    relay(state.client.get(url).send().await?).await
}

/// Parse the JSON document embedded as a string in `message.item_content`.
fn item_content(message: &Value) -> Result<serde_json::Map<String, Value>, ApiError> {
    let raw = message
        .get("item_content")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("Message has no item_content".into()))?;
    serde_json::from_str(raw)
        .map_err(|e| ApiError::BadRequest(format!("Invalid item_content: {}", e)))
}

/// Forward a signing request, but only for messages sent as this VM.
async fn sign(State(state): State<AppState>, Json(message): Json<Value>) -> Result<Response, ApiError> {
    let content = item_content(&message)?;
    if content.get("address").and_then(Value::as_str) != Some(state.settings.vm_hash.as_str()) {
        return Err(ApiError::BadRequest(
            "Message address does not match VM item_hash".into(),
        ));
    }

    info!("forwarding signing request to connector");
    let url = format!("{}/sign", state.settings.connector);
    relay(state.client.post(url).json(&message).send().await?).await
}

#[derive(Debug, Deserialize)]
struct PubsubRequest {
    topic: Value,
    data: String,
}

/// Rewrite the sender of a pubsub message and forward it to the connector.
async fn repost(
    State(state): State<AppState>,
    uri: Uri,
    Json(request): Json<PubsubRequest>,
) -> Result<Response, ApiError> {
    let mut message: Value = serde_json::from_str(&request.data)
        .map_err(|e| ApiError::BadRequest(format!("Invalid message data: {}", e)))?;
    let mut content = item_content(&message)?;
    content.insert("address".into(), Value::from(REPOST_ADDRESS));
    let content = Value::Object(content).to_string();
    match message.as_object_mut() {
        Some(fields) => {
            fields.insert("item_content".into(), Value::from(content));
        }
        None => return Err(ApiError::BadRequest("Message is not an object".into())),
    }

    let body = serde_json::json!({
        "topic": request.topic,
        "data": message.to_string(),
    });
    let url = match uri.query() {
        Some(query) => format!("{}{}?{}", state.settings.connector, uri.path(), query),
        None => format!("{}{}", state.settings.connector, uri.path()),
    };
    debug!(url = %url, "reposting pubsub message");
    relay(state.client.post(url).json(&body).send().await?).await
}

fn checked_key(key: &str) -> Result<&str, ApiError> {
    if KEY_RE.is_match(key) {
        Ok(key)
    } else {
        Err(ApiError::InvalidKey)
    }
}

async fn get_key(State(state): State<AppState>, Path(key): Path<String>) -> Result<Response, ApiError> {
    let key = checked_key(&key)?;
    match state.cache.get(&state.cache_key(key)) {
        Some(value) => Ok((StatusCode::OK, value).into_response()),
        None => Err(ApiError::CacheMiss),
    }
}

async fn put_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<bool>, ApiError> {
    let key = checked_key(&key)?;
    Ok(Json(state.cache.set(
        &state.cache_key(key),
        body.to_vec(),
        CACHE_EXPIRES_AFTER,
    )))
}

async fn delete_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<usize>, ApiError> {
    let key = checked_key(&key)?;
    Ok(Json(state.cache.delete(&state.cache_key(key))))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    pattern: Option<String>,
}

async fn list_keys(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let pattern = query.pattern.unwrap_or_else(|| "*".into());
    if !PATTERN_RE.is_match(&pattern) {
        return Err(ApiError::InvalidKey);
    }
    let prefix_len = state.settings.vm_hash.len() + 1;
    let keys = state
        .cache
        .keys(&state.cache_key(&pattern))
        .into_iter()
        .map(|key| key[prefix_len..].to_string())
        .collect();
    Ok(Json(keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryCache};
    use crate::Settings;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    /// Local stand-in for both the ledger API and the connector.
    async fn upstream() -> String {
        async fn echo_body(uri: Uri, body: String) -> String {
            format!("{} {}", uri, body)
        }
        async fn echo_uri(uri: Uri) -> impl IntoResponse {
            ([(CONTENT_TYPE, "application/json")], format!("\"{}\"", uri))
        }

        let app = Router::new()
            .route("/properties", get(|| async { Json(serde_json::json!({"chain": "ETH"})) }))
            .route("/sign", post(echo_body))
            .route("/api/v0/p2p/pubsub/pub", post(echo_body))
            .route("/{*tail}", get(echo_uri));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn state_with(vm_hash: &str, base: &str, cache: Arc<dyn CacheStore>) -> AppState {
        AppState::new(
            Settings {
                vm_hash: vm_hash.into(),
                api_server: base.into(),
                connector: base.into(),
            },
            cache,
        )
        .unwrap()
    }

    fn app(vm_hash: &str) -> Router {
        router(state_with(vm_hash, "http://127.0.0.1:9", Arc::new(MemoryCache::new())))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: impl Into<Body>) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let app = app("vm1");

        assert_eq!(send(&app, "PUT", "/cache/greeting", "hello").await, (StatusCode::OK, "true".into()));
        assert_eq!(send(&app, "GET", "/cache/greeting", Body::empty()).await, (StatusCode::OK, "hello".into()));
        assert_eq!(
            send(&app, "GET", "/cache/", Body::empty()).await,
            (StatusCode::OK, r#"["greeting"]"#.into())
        );
        assert_eq!(send(&app, "DELETE", "/cache/greeting", Body::empty()).await, (StatusCode::OK, "1".into()));
        assert_eq!(
            send(&app, "GET", "/cache/greeting", Body::empty()).await,
            (StatusCode::NOT_FOUND, "No such key in cache".into())
        );
    }

    #[tokio::test]
    async fn test_cache_is_namespaced_by_vm() {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let first = router(state_with("vm1", "http://127.0.0.1:9", cache.clone()));
        let second = router(state_with("vm2", "http://127.0.0.1:9", cache));

        send(&first, "PUT", "/cache/shared", "one").await;
        assert_eq!(send(&second, "GET", "/cache/shared", Body::empty()).await.0, StatusCode::NOT_FOUND);
        assert_eq!(send(&second, "GET", "/cache/", Body::empty()).await.1, "[]");
    }

    #[tokio::test]
    async fn test_list_with_pattern() {
        let app = app("vm");
        for key in ["user_1", "user_2", "session"] {
            send(&app, "PUT", &format!("/cache/{}", key), "x").await;
        }
        assert_eq!(
            send(&app, "GET", "/cache/?pattern=user_*", Body::empty()).await.1,
            r#"["user_1","user_2"]"#
        );
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let app = app("vm");
        for uri in ["/cache/bad-key", "/cache/a/b", "/cache/a.b"] {
            assert_eq!(
                send(&app, "GET", uri, Body::empty()).await,
                (StatusCode::BAD_REQUEST, "Invalid key".into()),
                "{}",
                uri
            );
        }
        assert_eq!(
            send(&app, "PUT", "/cache/no%20spaces", "x").await.0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            send(&app, "GET", "/cache/?pattern=a%20b", Body::empty()).await.0,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_sign_requires_own_address() {
        let base = upstream().await;
        let app = router(state_with("vmhash", &base, Arc::new(MemoryCache::new())));

        let foreign = serde_json::json!({"item_content": r#"{"address": "someone"}"#}).to_string();
        let (status, body) = send(&app, "POST", "/sign", foreign).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Message address does not match VM item_hash");

        let own = serde_json::json!({"item_content": r#"{"address": "vmhash"}"#}).to_string();
        let (status, body) = send(&app, "POST", "/sign", own).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("/sign "), "{}", body);
        assert!(body.contains("vmhash"), "{}", body);
    }

    #[tokio::test]
    async fn test_repost_rewrites_address() {
        let base = upstream().await;
        let app = router(state_with("vmhash", &base, Arc::new(MemoryCache::new())));

        let message = serde_json::json!({
            "chain": "ETH",
            "item_content": r#"{"address": "0xabc", "content": 1}"#,
        });
        let request = serde_json::json!({"topic": "ALEPH-TEST", "data": message.to_string()}).to_string();
        let (status, body) = send(&app, "POST", "/api/v0/p2p/pubsub/pub?x=1", request).await;
        assert_eq!(status, StatusCode::OK);

        let (uri, forwarded) = body.split_once(' ').unwrap();
        assert_eq!(uri, "/api/v0/p2p/pubsub/pub?x=1");
        let forwarded: Value = serde_json::from_str(forwarded).unwrap();
        assert_eq!(forwarded["topic"], "ALEPH-TEST");
        let message: Value = serde_json::from_str(forwarded["data"].as_str().unwrap()).unwrap();
        assert_eq!(message["chain"], "ETH");
        let content: Value = serde_json::from_str(message["item_content"].as_str().unwrap()).unwrap();
        assert_eq!(content["address"], REPOST_ADDRESS);
        assert_eq!(content["content"], 1);
    }

    #[tokio::test]
    async fn test_properties_forwarded() {
        let base = upstream().await;
        let app = router(state_with("vm", &base, Arc::new(MemoryCache::new())));
        assert_eq!(
            send(&app, "GET", "/properties", Body::empty()).await,
            (StatusCode::OK, r#"{"chain":"ETH"}"#.into())
        );
    }

    #[tokio::test]
    async fn test_proxy_preserves_path_query_and_content_type() {
        let base = upstream().await;
        let app = router(state_with("vm", &base, Arc::new(MemoryCache::new())));

        let request = Request::builder()
            .uri("/api/v0/messages.json?hashes=abc")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], br#""/api/v0/messages.json?hashes=abc""#);
    }

    #[tokio::test]
    async fn test_proxy_is_read_only() {
        let app = app("vm");
        assert_eq!(
            send(&app, "POST", "/api/v0/messages.json", "{}").await.0,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let app = app("vm");
        assert_eq!(send(&app, "GET", "/properties", Body::empty()).await.0, StatusCode::BAD_GATEWAY);
    }
}
