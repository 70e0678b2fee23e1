//! Response selection policies.

use crate::config::{Endpoint, Response, SelectionPolicy};
use crate::error::{SimulatorError, SimulatorResult};
use crate::matcher::{matches_all, RequestView};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Runtime state of one endpoint, living as long as its configuration snapshot.
#[derive(Debug, Default)]
pub struct EndpointState {
    /// Sequence cursor
    cursor: AtomicU64,
    /// Operator-selected response id
    active: ArcSwapOption<String>,
}

impl EndpointState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `response_id` the sticky response for the `manual` policy.
    pub fn set_active(&self, response_id: &str) {
        self.active.store(Some(Arc::new(response_id.to_string())));
    }

    pub fn clear_active(&self) {
        self.active.store(None);
    }

    pub fn active(&self) -> Option<Arc<String>> {
        self.active.load_full()
    }

    /// Current cursor position, without advancing.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Relaxed)
    }

    fn advance(&self) -> u64 {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }
}

/// Pick a response for the request according to the endpoint's policy.
///
/// Only fails when the endpoint has no responses at all.
pub fn select<'a>(
    endpoint: &'a Endpoint,
    state: &EndpointState,
    request: &RequestView<'_>,
) -> SimulatorResult<&'a Response> {
    let default = endpoint
        .default_response()
        .ok_or_else(|| SimulatorError::NoResponsesConfigured {
            endpoint: endpoint.key().to_string(),
        })?;

    let selected = match endpoint.selection_policy {
        SelectionPolicy::Manual => state
            .active()
            .and_then(|id| endpoint.response(&id))
            .unwrap_or(default),
        SelectionPolicy::Sequence => {
            let len = endpoint.responses.len() as u64;
            &endpoint.responses[(state.advance() % len) as usize]
        }
        SelectionPolicy::Conditional => endpoint
            .responses
            .iter()
            .find(|r| matches_all(&r.matchers, request))
            .unwrap_or(default),
    };

    Ok(selected)
}
