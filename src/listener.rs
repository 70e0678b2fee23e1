//! HTTP listener.
//!
//! Serves every request through [`SimulationEngine::handle`]. There are no
//! fixed routes: the engine's configuration decides what exists.

use crate::engine::{MockRequest, MockResponse, SimulationEngine};
use crate::error::{SimulatorError, SimulatorResult};
use crate::events::EventKind;
use crate::matcher::parse_query_string;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Build the axum router that feeds requests to the engine.
pub fn router(engine: Arc<SimulationEngine>) -> Router {
    Router::new().fallback(handle_request).with_state(engine)
}

async fn handle_request(
    State(engine): State<Arc<SimulationEngine>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut request_headers = HashMap::new();
    for (name, value) in &headers {
        // Repeated headers keep their first value
        if let Ok(value) = value.to_str() {
            request_headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    let request = MockRequest {
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        headers: request_headers,
        query: uri.query().map(parse_query_string).unwrap_or_default(),
        body: body.to_vec(),
    };

    into_http(engine.handle(request).await)
}

fn into_http(response: MockResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut http = (status, response.body).into_response();

    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                http.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid response header"),
        }
    }
    http
}

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// Start/stop lifecycle around the HTTP server.
pub struct Listener {
    engine: Arc<SimulationEngine>,
    running: Mutex<Option<Running>>,
}

impl Listener {
    pub fn new(engine: Arc<SimulationEngine>) -> Self {
        Self {
            engine,
            running: Mutex::new(None),
        }
    }

    /// Bind `addr` and start serving. Returns the bound address, which
    /// differs from `addr` when port 0 was requested. Starting an already
    /// running listener returns its current address.
    pub async fn start(&self, addr: SocketAddr) -> SimulatorResult<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            debug!(address = %current.local_addr, "Listener already running");
            return Ok(current.local_addr);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SimulatorError::ListenerBind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| SimulatorError::ListenerBind { addr, source })?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let app = router(self.engine.clone());
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await
        });

        info!(address = %local_addr, "Mock simulator listening");
        self.engine
            .events()
            .publish(EventKind::ServerStarted, json!({ "address": local_addr.to_string() }));

        *running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop accepting connections and wait for in-flight requests to finish.
    /// Does nothing when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(());
        match running.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Listener terminated with an error"),
            Err(e) => warn!(error = %e, "Listener task failed"),
        }

        info!(address = %running.local_addr, "Mock simulator stopped");
        self.engine.events().publish(
            EventKind::ServerStopped,
            json!({ "address": running.local_addr.to_string() }),
        );
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::store::EmbeddedSource;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    const CONFIG: &str = r#"
endpoints:
  - pathPattern: /users/{id}
    method: GET
    responses:
      - id: r1
        headers:
          X-Mock: users
        bodyTemplate: '{"id": "{{path.id}}", "verbose": "{{query.verbose}}", "agent": "{{headers.user-agent}}"}'
  - pathPattern: /echo
    method: POST
    responses:
      - id: echo
        status: 202
        headers:
          Content-Type: text/plain
        bodyTemplate: "got {{json.name}}"
  - pathPattern: /slow
    method: GET
    responses:
      - id: slow
        staticDelayMs: 400
        headers:
          Content-Type: text/plain
        body: finished
"#;

    async fn engine() -> Arc<SimulationEngine> {
        let engine = Arc::new(SimulationEngine::new(
            Arc::new(EmbeddedSource::new("test", CONFIG)),
            EngineOptions::default(),
        ));
        engine.load().await.unwrap();
        engine
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_request_translation() {
        let app = router(engine().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/users/42?verbose=yes&verbose=no")
                    .header("User-Agent", "test-client")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get("x-mock").unwrap(), "users");
        assert_eq!(
            body_string(response).await,
            r#"{"id": "42", "verbose": "yes", "agent": "test-client"}"#
        );
    }

    #[tokio::test]
    async fn test_request_body_and_status() {
        let app = router(engine().await);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .body(Body::from(r#"{"name": "widget"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(body_string(response).await, "got widget");
    }

    #[tokio::test]
    async fn test_unmatched_is_not_found() {
        let app = router(engine().await);

        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_serves_and_stop_is_idempotent() {
        let engine = engine().await;
        let mut events = engine.subscribe();
        let listener = Listener::new(engine.clone());

        let addr = listener.start(localhost()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.start(localhost()).await.unwrap(), addr);
        assert!(listener.is_running().await);
        assert_eq!(listener.local_addr().await, Some(addr));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /users/7 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK"));
        assert!(raw.contains(r#""id": "7""#));

        listener.stop().await;
        listener.stop().await;
        assert!(!listener.is_running().await);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());

        let mut kinds = Vec::new();
        while let Some(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&EventKind::ServerStarted));
        assert_eq!(kinds.last(), Some(&EventKind::ServerStopped));
        assert_eq!(
            kinds.iter().filter(|k| **k == EventKind::ServerStarted).count(),
            1
        );
        assert_eq!(
            kinds.iter().filter(|k| **k == EventKind::ServerStopped).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_requests() {
        let engine = engine().await;
        let mut events = engine.subscribe();
        let listener = Listener::new(engine.clone());
        let addr = listener.start(localhost()).await.unwrap();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut raw = String::new();
            stream.read_to_string(&mut raw).await.unwrap();
            raw
        });

        // Stop only once the request is inside its delay
        while let Some(event) = events.recv().await {
            if event.kind == EventKind::RequestReceived {
                break;
            }
        }
        listener.stop().await;
        assert!(!listener.is_running().await);

        let raw = client.await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK"));
        assert!(raw.ends_with("finished"));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let engine = engine().await;
        let first = Listener::new(engine.clone());
        let addr = first.start(localhost()).await.unwrap();

        let second = Listener::new(engine);
        let err = second.start(addr).await.unwrap_err();
        assert!(matches!(err, SimulatorError::ListenerBind { .. }));
        assert!(!second.is_running().await);

        first.stop().await;
    }

    #[test]
    fn test_invalid_headers_are_skipped() {
        let response = into_http(MockResponse {
            status: 201,
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Bad Header".to_string(), "x".to_string()),
                ("X-Ok".to_string(), "1".to_string()),
            ],
            body: "hi".to_string(),
            applied_delay_ms: 0,
        });

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-ok").unwrap(), "1");
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        assert!(response.headers().get("bad header").is_none());
    }
}
