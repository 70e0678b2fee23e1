//! Simulation engine.
//!
//! Turns the active configuration into request handling: route, select,
//! render, delay, respond. Every request is recorded in the history and
//! reported on the event stream.

use crate::config::{Endpoint, Response, Rule};
use crate::delay;
use crate::error::{SimulatorError, SimulatorResult, TemplateError};
use crate::events::{EventBus, EventKind, Subscription};
use crate::history::{History, HistoryEntry, Outcome, RequestSummary, ResponseSummary};
use crate::matcher::{self, RequestView};
use crate::router::RouteMatch;
use crate::selector;
use crate::store::{ConfigSource, ConfigStore, Snapshot};
use crate::template::{TemplateContext, TemplateRegistry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// An inbound request, as handed to the engine by the listener.
#[derive(Debug, Clone, Default)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl MockRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// The simulated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub applied_delay_ms: u64,
}

impl MockResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn synthetic(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.to_string(),
            applied_delay_ms: 0,
        }
    }
}

/// Tunables that are not part of the configuration document.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Number of requests kept in the history
    pub history_capacity: usize,
    /// Queue length of each event subscriber
    pub event_buffer: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            history_capacity: 200,
            event_buffer: 256,
        }
    }
}

/// Engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_requests: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub errored: u64,
    pub config_version: u64,
    pub config_loaded_at: DateTime<Utc>,
    pub endpoints: usize,
    pub history_len: usize,
    pub history_capacity: usize,
    pub subscribers: usize,
    pub dropped_events: u64,
    pub template_engines: Vec<String>,
}

/// Mock simulation engine.
///
/// Constructed once per process and shared by reference (usually in an
/// `Arc`) with whatever serves requests.
pub struct SimulationEngine {
    store: ConfigStore,
    templates: TemplateRegistry,
    events: EventBus,
    history: History,
    /// Total requests handled.
    requests_total: AtomicU64,
    /// Requests answered by a configured response.
    requests_matched: AtomicU64,
    /// Requests no endpoint matched.
    requests_unmatched: AtomicU64,
    /// Requests that failed with a synthetic error response.
    requests_errored: AtomicU64,
}

/// What the per-request pipeline produced.
struct Handled {
    outcome: Outcome,
    endpoint_key: Option<String>,
    response_id: Option<String>,
    response: MockResponse,
}

impl SimulationEngine {
    /// Create an engine over a configuration source. The configuration stays
    /// empty until [`SimulationEngine::load`] is called.
    pub fn new(source: Arc<dyn ConfigSource>, options: EngineOptions) -> Self {
        Self {
            store: ConfigStore::new(source),
            templates: TemplateRegistry::new(),
            events: EventBus::new(options.event_buffer),
            history: History::new(options.history_capacity),
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
            requests_errored: AtomicU64::new(0),
        }
    }

    /// Replace the template engine registry.
    pub fn with_templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = templates;
        self
    }

    /// Initial load. On failure the engine keeps serving an empty
    /// configuration; the error is returned for the caller to report.
    pub async fn load(&self) -> SimulatorResult<()> {
        let result = self.store.reload().await;
        let snapshot = self.store.snapshot();

        match &result {
            Ok(_) => info!(
                source = %self.store.source_name(),
                endpoints = snapshot.config.endpoints.len(),
                "Configuration loaded"
            ),
            Err(e) => warn!(
                source = %self.store.source_name(),
                error = %e,
                "Configuration load failed, starting with no endpoints"
            ),
        }

        self.events.publish(
            EventKind::ConfigLoaded,
            json!({
                "source": self.store.source_name(),
                "version": snapshot.version,
                "endpoints": snapshot.config.endpoints.len(),
                "error": result.as_ref().err().map(|e| e.to_string()),
            }),
        );
        result.map(|_| ())
    }

    /// Handle one request. Never fails: unmatched and failing requests get
    /// synthetic responses.
    pub async fn handle(&self, request: MockRequest) -> MockResponse {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.events.publish(
            EventKind::RequestReceived,
            json!({ "method": request.method, "path": request.path }),
        );

        // One load per request; a concurrent reload cannot mix configurations.
        let snapshot = self.store.snapshot();
        let handled = match route(&snapshot, &request) {
            Some(route) => self.respond(&snapshot, route, &request).await,
            None => self.unmatched(&snapshot, &request),
        };

        let counter = match handled.outcome {
            Outcome::Matched => &self.requests_matched,
            Outcome::Unmatched => &self.requests_unmatched,
            Outcome::Errored => &self.requests_errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        self.history.record(HistoryEntry {
            timestamp: Utc::now(),
            outcome: handled.outcome,
            endpoint_key: handled.endpoint_key.clone(),
            matched_response_id: handled.response_id.clone(),
            request: RequestSummary {
                method: request.method.clone(),
                path: request.path.clone(),
                query: request.query.clone(),
                headers: request.headers.clone(),
                body_bytes: request.body.len(),
            },
            response: ResponseSummary {
                status: handled.response.status,
                applied_delay_ms: handled.response.applied_delay_ms,
                body_bytes: handled.response.body.len(),
            },
        });

        self.events.publish(
            EventKind::ResponseSent,
            json!({
                "outcome": handled.outcome,
                "endpoint": handled.endpoint_key,
                "responseId": handled.response_id,
                "status": handled.response.status,
                "appliedDelayMs": handled.response.applied_delay_ms,
            }),
        );

        handled.response
    }

    async fn respond(
        &self,
        snapshot: &Snapshot,
        route: RouteMatch<'_>,
        request: &MockRequest,
    ) -> Handled {
        let endpoint = route.endpoint;
        let key = endpoint.key().to_string();
        let settings = &snapshot.config.settings;
        let view = RequestView::new(request, &route.bindings);

        let selected = snapshot
            .state(route.index)
            .ok_or_else(|| SimulatorError::EndpointNotFound {
                endpoint: key.clone(),
            })
            .and_then(|state| selector::select(endpoint, state, &view));
        let response = match selected {
            Ok(response) => response,
            Err(e) => {
                error!(endpoint = %key, error = %e, "Endpoint cannot produce a response");
                return Handled {
                    outcome: Outcome::Errored,
                    endpoint_key: Some(key.clone()),
                    response_id: None,
                    response: MockResponse::synthetic(
                        500,
                        json!({
                            "error": "no_responses_configured",
                            "message": e.to_string(),
                            "endpoint": key,
                        }),
                    ),
                };
            }
        };

        if settings.log_matches {
            info!(
                endpoint = %key,
                response_id = %response.id,
                method = %request.method,
                path = %request.path,
                "Request matched endpoint"
            );
        }
        self.events.publish(
            EventKind::ResponseSelected,
            json!({
                "endpoint": key,
                "responseId": response.id,
                "policy": endpoint.selection_policy,
                "bindings": route.bindings,
                "tags": response.tags,
                "category": response.category,
            }),
        );

        let body = match self.render_body(&key, response, &view) {
            Ok(body) => body,
            Err(e) => {
                return Handled {
                    outcome: Outcome::Errored,
                    endpoint_key: Some(key.clone()),
                    response_id: Some(response.id.clone()),
                    response: MockResponse::synthetic(
                        500,
                        json!({
                            "error": "template_error",
                            "message": e.to_string(),
                            "endpoint": key,
                            "responseId": response.id,
                        }),
                    ),
                };
            }
        };

        let delay_ms = delay::resolve(response, &view, settings.default_delay_ms);
        if delay_ms > 0 {
            debug!(endpoint = %key, response_id = %response.id, delay_ms, "Applying delay");
        }
        delay::apply(delay_ms).await;

        Handled {
            outcome: Outcome::Matched,
            endpoint_key: Some(key),
            response_id: Some(response.id.clone()),
            response: MockResponse {
                status: response.status,
                headers: response_headers(response, &settings.default_content_type),
                body,
                applied_delay_ms: delay_ms,
            },
        }
    }

    /// Render the body template, falling back to the static body on failure.
    fn render_body(
        &self,
        key: &str,
        response: &Response,
        view: &RequestView<'_>,
    ) -> Result<String, TemplateError> {
        let Some(template) = &response.body_template else {
            return Ok(response.body.clone().unwrap_or_default());
        };

        let context = TemplateContext::from_request(view).to_value();
        match self
            .templates
            .render(&response.template_engine, template, &context)
        {
            Ok(body) => Ok(body),
            Err(e) => {
                error!(
                    endpoint = %key,
                    response_id = %response.id,
                    engine = %response.template_engine,
                    template = %template,
                    error = %e,
                    "Template rendering failed"
                );
                response.body.clone().ok_or(e)
            }
        }
    }

    fn unmatched(&self, snapshot: &Snapshot, request: &MockRequest) -> Handled {
        let e = SimulatorError::RouteNotFound {
            method: request.method.clone(),
            path: request.path.clone(),
        };
        if snapshot.config.settings.log_unmatched {
            debug!(error = %e, "No matching endpoint found");
        }

        Handled {
            outcome: Outcome::Unmatched,
            endpoint_key: None,
            response_id: None,
            response: MockResponse::synthetic(
                404,
                json!({
                    "error": "not_found",
                    "message": e.to_string(),
                    "method": request.method,
                    "path": request.path,
                }),
            ),
        }
    }

    /// Make `response_id` the sticky response of an endpoint until cleared or
    /// until the next reload. `path` is the endpoint's path pattern or a
    /// concrete path it routes.
    pub fn set_active_response(
        &self,
        method: &str,
        path: &str,
        response_id: &str,
    ) -> SimulatorResult<()> {
        let snapshot = self.store.snapshot();
        let (index, endpoint) = find_endpoint(&snapshot, method, path)?;
        if endpoint.response(response_id).is_none() {
            return Err(SimulatorError::ResponseNotFound {
                endpoint: endpoint.key().to_string(),
                response_id: response_id.to_string(),
            });
        }

        if let Some(state) = snapshot.state(index) {
            state.set_active(response_id);
        }
        info!(endpoint = %endpoint.key(), response_id, "Active response set");
        Ok(())
    }

    /// Drop the sticky response of an endpoint.
    pub fn clear_active_response(&self, method: &str, path: &str) -> SimulatorResult<()> {
        let snapshot = self.store.snapshot();
        let (index, endpoint) = find_endpoint(&snapshot, method, path)?;
        if let Some(state) = snapshot.state(index) {
            state.clear_active();
        }
        info!(endpoint = %endpoint.key(), "Active response cleared");
        Ok(())
    }

    /// The sticky response of an endpoint, if one is set.
    pub fn active_response(&self, method: &str, path: &str) -> SimulatorResult<Option<String>> {
        let snapshot = self.store.snapshot();
        let (index, _) = find_endpoint(&snapshot, method, path)?;
        Ok(snapshot
            .state(index)
            .and_then(|state| state.active())
            .map(|id| id.as_ref().clone()))
    }

    /// Reload the configuration now. On failure the active configuration stays.
    pub async fn reload(&self) -> SimulatorResult<()> {
        match self.store.reload().await {
            Ok(snapshot) => {
                self.publish_reloaded(&snapshot, "manual");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Configuration reload rejected, keeping previous configuration");
                Err(e)
            }
        }
    }

    /// Reload only if the source changed. Used by the reload watcher.
    pub async fn reload_if_changed(&self) -> SimulatorResult<bool> {
        match self.store.reload_if_changed().await {
            Ok(Some(snapshot)) => {
                self.publish_reloaded(&snapshot, "watcher");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e @ SimulatorError::ConfigSource { .. }) => {
                debug!(error = %e, "Configuration source unavailable");
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Configuration change rejected, keeping previous configuration");
                Err(e)
            }
        }
    }

    fn publish_reloaded(&self, snapshot: &Snapshot, trigger: &str) {
        info!(
            version = snapshot.version,
            endpoints = snapshot.config.endpoints.len(),
            trigger,
            "Configuration reloaded"
        );
        self.events.publish(
            EventKind::ConfigReloaded,
            json!({
                "source": self.store.source_name(),
                "version": snapshot.version,
                "endpoints": snapshot.config.endpoints.len(),
                "trigger": trigger,
            }),
        );
    }

    /// Poll the configuration source every `interval` and reload on change.
    ///
    /// The watcher stops when the returned handle is dropped or the engine
    /// goes away.
    pub fn spawn_reload_watcher(self: &Arc<Self>, interval: Duration) -> ReloadWatcher {
        let engine: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the initial load already ran.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                // Failures are reported inside and never stop the watcher.
                let _ = engine.reload_if_changed().await;
            }
        });

        info!(interval_ms = interval.as_millis() as u64, "Configuration watcher started");
        ReloadWatcher { handle }
    }

    /// Render a template outside of live traffic.
    pub fn test_template(
        &self,
        engine: &str,
        template: &str,
        context: &serde_json::Value,
    ) -> Result<String, TemplateError> {
        let result = self.templates.render(engine, template, context);
        self.events.publish(
            EventKind::TemplateTested,
            json!({
                "engine": engine,
                "ok": result.is_ok(),
                "error": result.as_ref().err().map(|e| e.to_string()),
            }),
        );
        result
    }

    /// Evaluate a rule against a value outside of live traffic.
    pub fn test_matcher(&self, rule: &Rule, value: Option<&str>) -> bool {
        let matched = matcher::evaluate(rule, value);
        self.events.publish(
            EventKind::MatcherTested,
            json!({
                "kind": rule.kind,
                "operator": rule.operator,
                "value": value,
                "matched": matched,
            }),
        );
        matched
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Subscribe with a queue of `capacity` events instead of the default.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        self.events.subscribe_with_capacity(capacity)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Recorded requests, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.entries()
    }

    pub fn clear_history(&self) {
        self.history.clear();
    }

    /// The active configuration snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot()
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Get total requests processed.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineStats {
        let snapshot = self.store.snapshot();
        EngineStats {
            total_requests: self.total_requests(),
            matched: self.requests_matched.load(Ordering::Relaxed),
            unmatched: self.requests_unmatched.load(Ordering::Relaxed),
            errored: self.requests_errored.load(Ordering::Relaxed),
            config_version: snapshot.version,
            config_loaded_at: snapshot.loaded_at,
            endpoints: snapshot.config.endpoints.len(),
            history_len: self.history.len(),
            history_capacity: self.history.capacity(),
            subscribers: self.events.subscriber_count(),
            dropped_events: self.events.dropped_events(),
            template_engines: self.templates.names().into_iter().map(String::from).collect(),
        }
    }
}

/// Handle to a running reload watcher. Dropping it stops the watcher.
pub struct ReloadWatcher {
    handle: JoinHandle<()>,
}

impl ReloadWatcher {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for ReloadWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// First endpoint fitting the request whose own matchers also pass.
fn route<'a>(snapshot: &'a Snapshot, request: &'a MockRequest) -> Option<RouteMatch<'a>> {
    snapshot
        .router
        .candidates(&snapshot.config.endpoints, &request.method, &request.path)
        .find(|candidate| {
            let view = RequestView::new(request, &candidate.bindings);
            matcher::matches_all(&candidate.endpoint.matchers, &view)
        })
}

fn find_endpoint<'a>(
    snapshot: &'a Snapshot,
    method: &str,
    path: &str,
) -> SimulatorResult<(usize, &'a Endpoint)> {
    snapshot
        .find_endpoint(method, path)
        .ok_or_else(|| SimulatorError::EndpointNotFound {
            endpoint: format!("{} {}", method.to_uppercase(), path),
        })
}

/// Configured headers, with a `Content-Type` added when missing.
fn response_headers(response: &Response, default_content_type: &str) -> Vec<(String, String)> {
    let content_type = response
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.clone())
        .unwrap_or_else(|| default_content_type.to_string());

    let mut headers: Vec<(String, String)> = response
        .headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("content-type"))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    headers.sort();
    headers.insert(0, ("Content-Type".to_string(), content_type));
    headers
}
