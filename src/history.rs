//! Bounded request history.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// How a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Matched,
    Unmatched,
    Errored,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSummary {
    pub status: u16,
    pub applied_delay_ms: u64,
    pub body_bytes: usize,
}

/// One handled request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub endpoint_key: Option<String>,
    pub matched_response_id: Option<String>,
    pub request: RequestSummary,
    pub response: ResponseSummary,
}

/// Ring buffer of the most recent requests; the oldest entry is evicted first.
///
/// Readers load an immutable snapshot and never wait on appends. An append
/// copies the entry pointers into a new buffer and swaps it in.
pub struct History {
    entries: ArcSwap<VecDeque<Arc<HistoryEntry>>>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: ArcSwap::from_pointee(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, entry: HistoryEntry) {
        let entry = Arc::new(entry);
        self.entries.rcu(|current| {
            let mut next = VecDeque::with_capacity(self.capacity);
            let skip = (current.len() + 1).saturating_sub(self.capacity);
            next.extend(current.iter().skip(skip).cloned());
            next.push_back(entry.clone());
            next
        });
    }

    /// The stored entries as an immutable snapshot, oldest first.
    pub fn snapshot(&self) -> Arc<VecDeque<Arc<HistoryEntry>>> {
        self.entries.load_full()
    }

    /// Copy of the stored entries, oldest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.snapshot().iter().map(|e| e.as_ref().clone()).collect()
    }

    pub fn clear(&self) {
        self.entries.store(Arc::new(VecDeque::new()));
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
