//! Gateway HTTP server - hands every request to the tenant router
//!
//! The tenant is chosen by the `Host` header. Dispatch runs on the blocking
//! pool and the body is streamed back through a channel, so a client that
//! disconnects drops the body and closes the tenant's isolation window.

use axum::{
    body::Body,
    extract::State,
    http::{header, request::Parts, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use tenant_gateway_sdk::environ::keys;
use tenant_gateway_sdk::Environ;

use crate::config::AppConfig;
use crate::error::TenantError;
use crate::router::TenantRouter;

/// Chunks buffered between the tenant and the client
const STREAM_BUFFER: usize = 16;

/// Shared gateway state
pub struct GatewayState {
    pub config: AppConfig,
    pub router: Arc<TenantRouter>,
}

/// Create the gateway router that handles all incoming requests
pub fn create_gateway_router() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/_gateway/health", get(health_check))
        .route("/{*path}", any(handle_tenant_request))
        .route("/", any(handle_tenant_request))
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    tenants: Vec<String>,
    change_detector: bool,
}

/// Health check endpoint for the gateway itself
async fn health_check(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(HealthStatus {
        status: "ok",
        tenants: state.router.hosts(),
        change_detector: state.router.is_running(),
    })
}

/// Handle an incoming request for a tenant
async fn handle_tenant_request(
    State(state): State<Arc<GatewayState>>,
    request: Request<Body>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let (parts, body) = request.into_parts();

    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        path = %parts.uri.path(),
        "Incoming request"
    );

    let input = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(request_id = %request_id, "Failed to read body: {}", e);
            return (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({ "error": e.to_string() }))).into_response();
        }
    };

    let environ = environ_from_parts(&parts, input, &state.config.script_name, &request_id);
    let router = Arc::clone(&state.router);
    let (response_tx, response_rx) = oneshot::channel();

    tokio::task::spawn_blocking(move || run_tenant(&router, &environ, response_tx));

    match response_rx.await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(request_id = %request_id, "Tenant dispatch ended without a response");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "no response" }))).into_response()
        }
    }
}

/// Dispatch on the current (blocking) thread, hand the response head back,
/// then produce the body into the response stream.
fn run_tenant(router: &TenantRouter, environ: &Environ, response_tx: oneshot::Sender<Response>) {
    let request_id = environ.get(keys::REQUEST_ID).unwrap_or_default();
    let tenant = environ.get(keys::HTTP_HOST).unwrap_or_default();
    let mut head = ResponseHead::default();

    let mut body = match router.dispatch(environ, &mut head) {
        Ok(body) => body,
        Err(err) => {
            let _ = response_tx.send(error_response(&err, request_id));
            return;
        }
    };

    let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Bytes, io::Error>>(STREAM_BUFFER);
    let stream = futures::stream::unfold(chunk_rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });

    if response_tx.send(head.into_response(Body::from_stream(stream))).is_err() {
        return;
    }

    for chunk in &mut body {
        let failed = chunk.is_err();
        let item = chunk.map_err(|e| {
            tracing::error!(request_id = %request_id, tenant = %tenant, "Tenant body failed: {}", e);
            io::Error::other(e.to_string())
        });

        // A closed channel means the client went away
        if chunk_tx.blocking_send(item).is_err() || failed {
            break;
        }
    }
}

/// Status and headers captured from the tenant's `start_response`
#[derive(Debug, Default)]
struct ResponseHead {
    status: Option<u16>,
    headers: Vec<(String, String)>,
}

impl tenant_gateway_sdk::StartResponse for ResponseHead {
    fn start(&mut self, status: u16, headers: Vec<(String, String)>) {
        self.status = Some(status);
        self.headers = headers;
    }
}

impl ResponseHead {
    fn into_response(self, body: Body) -> Response {
        let status = self
            .status
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or(StatusCode::OK);

        let mut response = Response::new(body);
        *response.status_mut() = status;

        for (key, value) in self.headers {
            match (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str())) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => tracing::warn!(header = %key, "Dropping invalid response header"),
            }
        }

        response
    }
}

/// Build the request environment for a tenant
pub fn environ_from_parts(parts: &Parts, input: Bytes, script_name: &str, request_id: &str) -> Environ {
    let mut environ = Environ::new()
        .with(keys::REQUEST_METHOD, parts.method.as_str())
        .with(keys::SCRIPT_NAME, script_name)
        .with(keys::PATH_INFO, parts.uri.path())
        .with(keys::QUERY_STRING, parts.uri.query().unwrap_or_default())
        .with(keys::REQUEST_ID, request_id);

    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else { continue };

        if name == header::CONTENT_TYPE {
            environ.insert(keys::CONTENT_TYPE, value);
        } else if name == header::CONTENT_LENGTH {
            environ.insert(keys::CONTENT_LENGTH, value);
        } else {
            let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
            environ.insert(key, value);
        }
    }

    // Extract the host name (strip port if present)
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| parts.uri.host())
        .map(strip_port);
    if let Some(host) = host {
        environ.insert(keys::HTTP_HOST, host);
    }

    environ.with_input(input)
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal
        return host.split_once(']').map_or(host, |(addr, _)| &host[..addr.len() + 1]);
    }
    host.split(':').next().unwrap_or(host)
}

/// Convert a tenant error into a JSON response
fn error_response(err: &TenantError, request_id: &str) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_server_error() {
        tracing::error!(request_id = %request_id, "Tenant error: {}", err);
    } else {
        tracing::debug!(request_id = %request_id, "Rejected request: {}", err);
    }

    (status, Json(json!({ "error": err.to_string(), "request_id": request_id }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{FixtureLoader, Sandbox};
    use crate::runtime::ModuleHost;
    use tower::ServiceExt;

    fn parts(request: Request<()>) -> Parts {
        request.into_parts().0
    }

    #[test]
    fn test_environ_from_parts() {
        let parts = parts(
            Request::builder()
                .method("POST")
                .uri("/hello/world?name=aries")
                .header("host", "aries.example.com:8080")
                .header("content-type", "application/json")
                .header("x-trace-id", "abc")
                .body(())
                .unwrap(),
        );

        let environ = environ_from_parts(&parts, Bytes::from_static(b"{}"), "/app", "req-1");
        assert_eq!(environ.get("HTTP_HOST"), Some("aries.example.com"));
        assert_eq!(environ.get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(environ.get("PATH_INFO"), Some("/hello/world"));
        assert_eq!(environ.get("QUERY_STRING"), Some("name=aries"));
        assert_eq!(environ.get("SCRIPT_NAME"), Some("/app"));
        assert_eq!(environ.get("CONTENT_TYPE"), Some("application/json"));
        assert_eq!(environ.get("HTTP_X_TRACE_ID"), Some("abc"));
        assert_eq!(environ.get("gateway.request_id"), Some("req-1"));
        assert_eq!(environ.input.as_ref(), b"{}");
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("aries"), "aries");
        assert_eq!(strip_port("aries:8080"), "aries");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
    }

    #[test]
    fn test_response_head() {
        let head = ResponseHead {
            status: Some(201),
            headers: vec![
                ("X-Tenant".into(), "aries".into()),
                ("bad header".into(), "x".into()),
            ],
        };
        let response = head.into_response(Body::empty());
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-tenant"], "aries");
        assert_eq!(response.headers().len(), 1);
    }

    async fn send(app: Router, host: &str, path: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(path).header("host", host).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_gateway_routes_by_host() {
        let sandbox = Sandbox::new();
        sandbox.zodiac();
        sandbox.write("leo/wsgi/app.mod", "app app leo $PATH_INFO");

        let router = Arc::new(TenantRouter::start(sandbox.config(), ModuleHost::new(FixtureLoader)));
        let state = Arc::new(GatewayState {
            config: AppConfig {
                router: sandbox.config(),
                listen_port: 0,
                max_body_bytes: 1024,
                script_name: "test".into(),
            },
            router: Arc::clone(&router),
        });
        let app = create_gateway_router().with_state(state);

        assert_eq!(send(app.clone(), "aries:8080", "/").await, (StatusCode::OK, "aries test".into()));
        assert_eq!(send(app.clone(), "taurus", "/x").await, (StatusCode::OK, "taurus delta".into()));
        assert_eq!(send(app.clone(), "leo", "/roar").await, (StatusCode::OK, "leo /roar".into()));

        let (status, body) = send(app.clone(), "scorpio", "/").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("\"error\""));

        let (status, body) = send(app, "aries", "/_gateway/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("aries"));

        router.shutdown().await;
    }
}
