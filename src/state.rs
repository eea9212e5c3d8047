//! In-memory view of recent results: latest per scanner plus a bounded
//! history ring. Volatile by design; the durable record lives in
//! `storage::results`.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scanner::{MetricValue, ScanResult, Severity, Status};

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct ResultSummary {
    pub scanner_name: String,
    pub status: Status,
    pub findings: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub metadata: HashMap<String, MetricValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FindingSummary {
    pub scanner_name: String,
    pub severity: Severity,
    pub category: String,
    pub description: String,
    pub occurred_at: Option<DateTime<Utc>>,
    pub evidence: serde_json::Value,
}

pub struct ResultCache {
    inner: RwLock<Inner>,
}

struct Inner {
    latest: HashMap<String, ScanResult>,
    history: VecDeque<ScanResult>,
    limit: usize,
}

impl ResultCache {
    pub fn new(limit: usize) -> Self {
        let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
        Self {
            inner: RwLock::new(Inner {
                latest: HashMap::new(),
                history: VecDeque::with_capacity(limit),
                limit,
            }),
        }
    }

    pub fn add(&self, result: ScanResult) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .latest
            .insert(result.scanner_name.clone(), result.clone());
        if inner.history.len() == inner.limit {
            inner.history.pop_front();
        }
        inner.history.push_back(result);
    }

    pub fn latest(&self) -> Vec<ResultSummary> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ResultSummary> = inner.latest.values().map(summarize).collect();
        out.sort_by(|a, b| a.scanner_name.cmp(&b.scanner_name));
        out
    }

    /// All retained summaries in insertion order.
    pub fn history(&self) -> Vec<ResultSummary> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.history.iter().map(summarize).collect()
    }

    /// Flattens findings across the retained history, annotated with the
    /// enclosing result's scanner and finish time.
    pub fn findings_history(&self) -> Vec<FindingSummary> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for result in &inner.history {
            for finding in &result.findings {
                out.push(FindingSummary {
                    scanner_name: result.scanner_name.clone(),
                    severity: finding.severity,
                    category: finding.category.clone(),
                    description: finding.description.clone(),
                    occurred_at: result.finished_at,
                    evidence: finding.evidence.clone(),
                });
            }
        }
        out
    }
}

fn summarize(result: &ScanResult) -> ResultSummary {
    ResultSummary {
        scanner_name: result.scanner_name.clone(),
        status: result.status,
        findings: result.findings.len(),
        started_at: result.started_at,
        finished_at: result.finished_at,
        duration_ms: result.duration_ms,
        metadata: result.metadata.clone(),
    }
}
