//! Scanner plugin contract and the shared result data model.
//!
//! Every scanner runs in-process behind the [`Plugin`] trait and produces a
//! [`ScanResult`] carrying metadata and zero or more [`Finding`]s. The
//! [`Registry`] maps unique plugin names to boxed implementations.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Outcome of one scanner execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Success,
    Failed,
    Partial,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Partial => "partial",
        };
        f.write_str(s)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Lenient parse used for config values; anything unknown maps to `Info`.
    pub fn parse(value: &str) -> Severity {
        match value.to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discriminated metadata value. Only `Float`/`Int`/`Uint` feed the
/// detection layer; `Text` and `Flag` are informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Flag(bool),
    Uint(u64),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    /// Numeric widening for the detection layer. Text and flags do not
    /// coerce; `u64` values above 2^53 would silently lose precision and
    /// are rejected.
    pub fn as_f64(&self) -> Option<f64> {
        const MAX_EXACT: u64 = 1 << 53;
        match self {
            MetricValue::Float(v) => Some(*v),
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Uint(v) if *v <= MAX_EXACT => Some(*v as f64),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Uint(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Flag(v) => write!(f, "{v}"),
            MetricValue::Uint(v) => write!(f, "{v}"),
            MetricValue::Int(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v}"),
            MetricValue::Text(v) => f.write_str(v),
        }
    }
}

/// A discrete observation attached to a result.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub evidence: serde_json::Value,
    #[serde(default)]
    pub remediation: String,
}

/// Output of one job execution. The scheduler owns `started_at`,
/// `finished_at` and `duration_ms`; plugins must leave them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub scanner_name: String,
    pub status: Status,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: HashMap<String, MetricValue>,
}

impl ScanResult {
    pub fn new(scanner_name: impl Into<String>, status: Status) -> Self {
        Self {
            scanner_name: scanner_name.into(),
            status,
            findings: Vec::new(),
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            metadata: HashMap::new(),
        }
    }
}

/// Contract every in-process scanner implements. `run` observes the
/// per-attempt cancellation token; a cancelled run returns an error which
/// the scheduler records as a failed attempt.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Re-applies configuration; called at startup and on hot reload.
    fn init(&self, config: &serde_json::Map<String, serde_json::Value>) -> Result<()>;

    async fn run(&self, cancel: CancellationToken) -> Result<ScanResult>;

    async fn halt(&self) -> Result<()> {
        Ok(())
    }
}

/// Registration by unique name; lookup hands out shared plugin handles.
#[derive(Default)]
pub struct Registry {
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name();
        if name.is_empty() {
            anyhow::bail!("plugin name is required");
        }
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        if plugins.contains_key(name) {
            anyhow::bail!("plugin {name:?} already registered");
        }
        plugins.insert(name.to_string(), plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("plugin {name:?} not found"))
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPlugin;

    #[async_trait]
    impl Plugin for NoopPlugin {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn init(&self, _config: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
            Ok(())
        }

        async fn run(&self, _cancel: CancellationToken) -> Result<ScanResult> {
            Ok(ScanResult::new("noop", Status::Success))
        }
    }

    #[test]
    fn registry_rejects_duplicates() {
        let registry = Registry::new();
        registry.register(Arc::new(NoopPlugin)).unwrap();
        assert!(registry.register(Arc::new(NoopPlugin)).is_err());
        assert!(registry.get("noop").is_ok());
        assert!(registry.get("missing").is_err());
        assert_eq!(registry.list(), vec!["noop".to_string()]);
    }

    #[test]
    fn metric_value_coercion() {
        assert_eq!(MetricValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(MetricValue::Int(-3).as_f64(), Some(-3.0));
        assert_eq!(MetricValue::Uint(42).as_f64(), Some(42.0));
        assert_eq!(MetricValue::Uint(u64::MAX).as_f64(), None);
        assert_eq!(MetricValue::Text("95".into()).as_f64(), None);
        assert_eq!(MetricValue::Flag(true).as_f64(), None);
    }

    #[test]
    fn metric_value_json_roundtrip() {
        let raw = r#"{"used_pct": 95.5, "count": 12, "path": "/", "ok": true}"#;
        let map: HashMap<String, MetricValue> = serde_json::from_str(raw).unwrap();
        assert_eq!(map["used_pct"], MetricValue::Float(95.5));
        assert_eq!(map["count"], MetricValue::Uint(12));
        assert_eq!(map["path"], MetricValue::Text("/".into()));
        assert_eq!(map["ok"], MetricValue::Flag(true));
    }
}
