//! The single on-result pipeline installed on the scheduler.
//!
//! Serializes all result processing behind one mutex: baseline drift and
//! update, rule evaluation, correlation, caching, durable persistence, and
//! alert emission. Storage failures are logged and never stop the daemon.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::warn;

use crate::alerting::{self, Alert};
use crate::detect::{BaselineManager, Correlator, RuleEngine};
use crate::scanner::{Finding, ScanResult, Severity};
use crate::scheduler::ResultSink;
use crate::state::ResultCache;
use crate::storage::results::ResultsStore;

pub struct Pipeline {
    inner: Mutex<Inner>,
}

struct Inner {
    baselines: Arc<BaselineManager>,
    rules: RuleEngine,
    correlator: Correlator,
    cache: Arc<ResultCache>,
    results: ResultsStore,
    alerts: Arc<alerting::Engine>,
    drift_consecutive: u32,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        baselines: Arc<BaselineManager>,
        rules: RuleEngine,
        correlator: Correlator,
        cache: Arc<ResultCache>,
        results: ResultsStore,
        alerts: Arc<alerting::Engine>,
        drift_consecutive: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                baselines,
                rules,
                correlator,
                cache,
                results,
                alerts,
                drift_consecutive,
            }),
        })
    }

    /// Swaps the reloadable detection pieces in one step.
    pub fn replace_detection(
        &self,
        rules: RuleEngine,
        correlator: Correlator,
        alerts: Arc<alerting::Engine>,
        drift_consecutive: u32,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.rules = rules;
        inner.correlator = correlator;
        inner.alerts = alerts;
        inner.drift_consecutive = drift_consecutive;
    }
}

impl ResultSink for Pipeline {
    fn on_result(&self, mut result: ScanResult) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let mut metrics: Vec<(String, f64)> = result
            .metadata
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|v| (k.clone(), v)))
            .collect();
        metrics.sort_by(|a, b| a.0.cmp(&b.0));

        for (metric, value) in metrics {
            match inner.baselines.detect_drift(
                &result.scanner_name,
                &metric,
                value,
                inner.drift_consecutive,
            ) {
                Ok((true, _)) => result.findings.push(Finding {
                    id: "metric_drift".to_string(),
                    severity: Severity::High,
                    category: "drift".to_string(),
                    description: "Metric drift detected beyond baseline.".to_string(),
                    evidence: json!({ "metric": metric, "value": value }),
                    remediation: "Review system changes affecting this metric.".to_string(),
                }),
                Ok(_) => {}
                Err(err) => warn!(
                    scanner = %result.scanner_name,
                    metric = %metric,
                    error = %err,
                    "drift check failed"
                ),
            }
            if let Err(err) = inner
                .baselines
                .update(&result.scanner_name, &metric, value)
            {
                warn!(
                    scanner = %result.scanner_name,
                    metric = %metric,
                    error = %err,
                    "baseline update failed"
                );
            }
        }

        let rule_findings = inner.rules.evaluate(&result);
        result.findings.extend(rule_findings);

        let correlation_findings = inner.correlator.add(&result);
        result.findings.extend(correlation_findings);

        inner.cache.add(result.clone());
        if let Err(err) = inner.results.save(&result) {
            warn!(scanner = %result.scanner_name, error = %err, "result persist failed");
        }

        for finding in &result.findings {
            inner.alerts.send(Alert::new(
                &result.scanner_name,
                finding.clone(),
                "finding_detected",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertingConfig;
    use crate::detect::rules::{Operator, Rule};
    use crate::scanner::{MetricValue, Status};
    use std::time::Duration;

    fn pipeline_over(store: Arc<crate::storage::SledStore>) -> (Arc<Pipeline>, Arc<ResultCache>) {
        let store: Arc<dyn crate::storage::Store> = store;
        let cache = Arc::new(ResultCache::new(10));
        let alerts = alerting::Engine::new(&AlertingConfig::default(), Vec::new());
        let pipeline = Pipeline::new(
            Arc::new(BaselineManager::new(Arc::clone(&store))),
            RuleEngine::new(vec![Rule {
                name: "disk".to_string(),
                scanner: "system.disk_usage".to_string(),
                metric: "used_pct".to_string(),
                operator: Operator::Gte,
                threshold: 90.0,
                severity: Severity::High,
                description: String::new(),
            }]),
            Correlator::new(Duration::from_secs(60), 2, Duration::from_secs(60)),
            Arc::clone(&cache),
            ResultsStore::new(store),
            alerts,
            3,
        );
        (pipeline, cache)
    }

    #[test]
    fn rule_findings_are_appended_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::storage::open(&dir.path().join("kv"), "").unwrap();
        let (pipeline, cache) = pipeline_over(store);

        let mut result = ScanResult::new("system.disk_usage", Status::Success);
        result
            .metadata
            .insert("used_pct".to_string(), MetricValue::Float(95.0));
        pipeline.on_result(result);

        let findings = cache.findings_history();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, "rule");

        let history = cache.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].findings, 1);
    }

    #[test]
    fn baselines_learn_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::storage::open(&dir.path().join("kv"), "").unwrap();
        let (pipeline, _cache) = pipeline_over(Arc::clone(&store));

        let mut result = ScanResult::new("system.load_avg", Status::Success);
        result
            .metadata
            .insert("load1".to_string(), MetricValue::Float(0.5));
        pipeline.on_result(result);

        let store: Arc<dyn crate::storage::Store> = store;
        let baselines = BaselineManager::new(store);
        let baseline = baselines.get("system.load_avg", "load1").unwrap();
        assert_eq!(baseline.count, 1);
        assert_eq!(baseline.mean, 0.5);
    }
}
