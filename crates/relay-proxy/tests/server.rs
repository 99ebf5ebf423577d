use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use relay_config::{ApiKey, ProxySettings};
use relay_core::{ChatMessage, Result};
use relay_proxy::{router, CompletionApi, CompletionRequest, HttpUpstream, RelayProxy, UpstreamReply};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Answers every completion with a canned reply and remembers the requests.
struct CannedUpstream {
    status: u16,
    body: String,
    seen: Mutex<Vec<CompletionRequest>>,
}

impl CannedUpstream {
    fn new(status: u16, body: Value) -> Arc<Self> {
        Arc::new(Self {
            status,
            body: body.to_string(),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionApi for CannedUpstream {
    async fn complete(&self, request: &CompletionRequest) -> Result<UpstreamReply> {
        self.seen.lock().unwrap().push(request.clone());
        Ok(UpstreamReply::new(self.status, self.body.clone()))
    }
}

fn settings() -> ProxySettings {
    ProxySettings {
        default_model: "test-model".into(),
        service_name: "relay test".into(),
        service_version: "9.9.9".into(),
        ..ProxySettings::default()
    }
}

fn app(upstream: Arc<CannedUpstream>) -> Router {
    router(Arc::new(RelayProxy::new(upstream, settings())))
}

fn hi_there() -> Value {
    json!({
        "id": "cmpl-42",
        "choices": [{ "message": { "role": "assistant", "content": "Hi there" } }],
        "usage": { "prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8 }
    })
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn post_chat(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

#[tokio::test]
async fn test_chat_success_contract() {
    let upstream = CannedUpstream::new(200, hi_there());
    let body = json!({ "message": "Hello", "conversation": [] }).to_string();

    let (status, headers, body) = send(app(upstream.clone()), post_chat(body)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("x-response-time"));
    assert_eq!(body["success"], true);
    assert_eq!(body["response"], "Hi there");
    assert_eq!(body["usage"]["prompt_tokens"], 5);
    assert_eq!(body["usage"]["completion_tokens"], 3);
    assert_eq!(body["usage"]["total_tokens"], 8);
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["id"], "cmpl-42");
    assert!(body["timestamp"].is_string());
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_rate_limit_is_relayed_with_status() {
    let upstream = CannedUpstream::new(429, json!({ "error": { "message": "slow down" } }));

    let (status, _, body) = send(app(upstream), post_chat(r#"{"message":"Hello"}"#)).await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Rate limit exceeded. Please try again later.");
    assert_eq!(body["status"], 429);
    assert_eq!(body["kind"], "rate_limited");
}

#[tokio::test]
async fn test_empty_message_is_rejected_before_upstream() {
    let upstream = CannedUpstream::new(200, hi_there());

    let (status, _, body) = send(app(upstream.clone()), post_chat(r#"{"message":"   "}"#)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Message is required and must be a non-empty string");
    assert_eq!(body["kind"], "invalid_request");
    assert!(body.get("status").is_none());
    assert_eq!(upstream.calls(), 0);
}

#[tokio::test]
async fn test_bad_json_and_wrong_types_are_invalid_requests() {
    for raw in ["{not json", r#"{"message": 42}"#, r#"{"message":"hi","conversation":"nope"}"#, ""] {
        let upstream = CannedUpstream::new(200, hi_there());
        let (status, _, body) = send(app(upstream.clone()), post_chat(raw)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "body {:?}", raw);
        assert_eq!(body["kind"], "invalid_request");
        assert_eq!(upstream.calls(), 0);
    }
}

#[tokio::test]
async fn test_malformed_upstream_success_is_500() {
    let upstream = CannedUpstream::new(200, json!({ "choices": [] }));

    let (status, _, body) = send(app(upstream), post_chat(r#"{"message":"Hello"}"#)).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "malformed_upstream_response");
}

#[tokio::test]
async fn test_health_on_both_paths() {
    for uri in ["/chat", "/health"] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, _, body) = send(app(CannedUpstream::new(200, hi_there())), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "online");
        assert_eq!(body["service"], "relay test");
        assert_eq!(body["version"], "9.9.9");
    }
}

#[tokio::test]
async fn test_options_is_empty_with_cors_headers() {
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/chat")
        .header("origin", "https://chat.example.com")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();

    let upstream = CannedUpstream::new(200, hi_there());
    let (status, headers, body) = send(app(upstream.clone()), request).await;

    assert!(status.is_success());
    assert_eq!(body, Value::Null);
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert_eq!(headers["access-control-max-age"], "86400");
    let methods = headers["access-control-allow-methods"].to_str().unwrap();
    assert!(methods.contains("POST"));
    assert_eq!(upstream.calls(), 0);
}

#[tokio::test]
async fn test_unsupported_method_is_405() {
    let request = Request::builder()
        .method("DELETE")
        .uri("/chat")
        .body(Body::empty())
        .unwrap();

    let (status, _, body) = send(app(CannedUpstream::new(200, hi_there())), request).await;

    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Method not allowed");
    assert_eq!(body["kind"], "invalid_request");
}

#[derive(Default)]
struct Captured {
    authorization: Option<String>,
    body: Option<Value>,
}

async fn fake_completions(
    State(captured): State<Arc<Mutex<Captured>>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let mut captured = captured.lock().unwrap();
    captured.authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    captured.body = Some(body);
    (StatusCode::OK, Json(hi_there()))
}

async fn rejecting_completions() -> (StatusCode, Json<Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": { "message": "key sk-test-secret is over capacity" } })),
    )
}

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1/chat/completions", addr)
}

#[tokio::test]
async fn test_http_upstream_sends_bearer_and_sampling() {
    let captured = Arc::new(Mutex::new(Captured::default()));
    let fake = Router::new()
        .route("/v1/chat/completions", post(fake_completions))
        .with_state(captured.clone());
    let url = spawn(fake).await;

    let settings = ProxySettings {
        upstream_url: url,
        ..ProxySettings::default()
    };
    let upstream = HttpUpstream::new(&settings, ApiKey::new("sk-test-secret")).unwrap();
    let request = CompletionRequest::new(
        "m",
        vec![ChatMessage::system("sys"), ChatMessage::user("Hello")],
        &settings.sampling,
    );

    let reply = upstream.complete(&request).await.unwrap();
    assert_eq!(reply.status, 200);

    let captured = captured.lock().unwrap();
    assert_eq!(captured.authorization.as_deref(), Some("Bearer sk-test-secret"));
    let body = captured.body.as_ref().unwrap();
    assert_eq!(body["model"], "m");
    assert_eq!(body["stream"], false);
    assert_eq!(body["max_tokens"], 1024);
    assert_eq!(body["messages"][1]["content"], "Hello");
}

#[tokio::test]
async fn test_http_upstream_redacts_credential_in_errors() {
    let url = spawn(Router::new().route("/v1/chat/completions", post(rejecting_completions))).await;
    let settings = ProxySettings {
        upstream_url: url,
        ..ProxySettings::default()
    };
    let upstream = HttpUpstream::new(&settings, ApiKey::new("sk-test-secret")).unwrap();
    let request = CompletionRequest::new("m", vec![ChatMessage::user("Hello")], &settings.sampling);

    let reply = upstream.complete(&request).await.unwrap();

    assert_eq!(reply.status, 503);
    assert!(!reply.body.contains("sk-test-secret"));
}

#[tokio::test]
async fn test_unreachable_upstream_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let settings = ProxySettings {
        upstream_url: format!("http://{}/v1/chat/completions", addr),
        ..ProxySettings::default()
    };
    let upstream = Arc::new(HttpUpstream::new(&settings, ApiKey::new("k")).unwrap());
    let app = router(Arc::new(RelayProxy::new(upstream, settings)));

    let (status, _, body) = send(app, post_chat(r#"{"message":"Hello"}"#)).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["kind"], "transport_error");
}
