//! Stateless threshold rules over result metadata.

use serde_json::json;

use crate::scanner::{Finding, ScanResult, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Operator {
    pub fn parse(value: &str) -> Option<Operator> {
        match value.to_ascii_lowercase().as_str() {
            "gt" => Some(Operator::Gt),
            "gte" => Some(Operator::Gte),
            "lt" => Some(Operator::Lt),
            "lte" => Some(Operator::Lte),
            "eq" => Some(Operator::Eq),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Eq => "eq",
        }
    }

    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Gte => value >= threshold,
            Operator::Lt => value < threshold,
            Operator::Lte => value <= threshold,
            Operator::Eq => value == threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    /// Scanner name, or `*` to match every scanner.
    pub scanner: String,
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
    pub severity: Severity,
    pub description: String,
}

pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Emits one finding per rule whose scanner matches, whose metric is
    /// present and numeric, and whose threshold test holds.
    pub fn evaluate(&self, result: &ScanResult) -> Vec<Finding> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            if rule.scanner != result.scanner_name && rule.scanner != "*" {
                continue;
            }
            let Some(value) = result.metadata.get(&rule.metric).and_then(|v| v.as_f64()) else {
                continue;
            };
            if !rule.operator.holds(value, rule.threshold) {
                continue;
            }
            let description = if rule.description.is_empty() {
                format!("Rule {} triggered for {}", rule.name, rule.metric)
            } else {
                rule.description.clone()
            };
            findings.push(Finding {
                id: format!("rule_{}", rule.name.to_lowercase()),
                severity: rule.severity,
                category: "rule".to_string(),
                description,
                evidence: json!({
                    "metric": rule.metric,
                    "value": value,
                    "threshold": rule.threshold,
                    "operator": rule.operator.as_str(),
                }),
                remediation: "Review rule configuration and system state.".to_string(),
            });
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{MetricValue, Status};

    fn disk_rule() -> Rule {
        Rule {
            name: "disk".to_string(),
            scanner: "system.disk_usage".to_string(),
            metric: "used_pct".to_string(),
            operator: Operator::Gte,
            threshold: 90.0,
            severity: Severity::High,
            description: String::new(),
        }
    }

    #[test]
    fn threshold_rule_fires() {
        let engine = RuleEngine::new(vec![disk_rule()]);
        let mut result = ScanResult::new("system.disk_usage", Status::Success);
        result
            .metadata
            .insert("used_pct".to_string(), MetricValue::Float(95.0));

        let findings = engine.evaluate(&result);
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.id, "rule_disk");
        assert_eq!(finding.category, "rule");
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.evidence["metric"], "used_pct");
        assert_eq!(finding.evidence["value"], 95.0);
        assert_eq!(finding.evidence["threshold"], 90.0);
        assert_eq!(finding.evidence["operator"], "gte");
    }

    #[test]
    fn below_threshold_is_silent() {
        let engine = RuleEngine::new(vec![disk_rule()]);
        let mut result = ScanResult::new("system.disk_usage", Status::Success);
        result
            .metadata
            .insert("used_pct".to_string(), MetricValue::Float(50.0));
        assert!(engine.evaluate(&result).is_empty());
    }

    #[test]
    fn scanner_mismatch_and_wildcard() {
        let mut wildcard = disk_rule();
        wildcard.scanner = "*".to_string();
        let engine = RuleEngine::new(vec![disk_rule(), wildcard]);

        let mut result = ScanResult::new("other.scanner", Status::Success);
        result
            .metadata
            .insert("used_pct".to_string(), MetricValue::Float(95.0));

        // Only the wildcard rule matches a different scanner.
        assert_eq!(engine.evaluate(&result).len(), 1);
    }

    #[test]
    fn non_numeric_metric_is_skipped() {
        let engine = RuleEngine::new(vec![disk_rule()]);
        let mut result = ScanResult::new("system.disk_usage", Status::Success);
        result
            .metadata
            .insert("used_pct".to_string(), MetricValue::Text("95".into()));
        assert!(engine.evaluate(&result).is_empty());
    }

    #[test]
    fn operator_parse() {
        assert_eq!(Operator::parse("GTE"), Some(Operator::Gte));
        assert_eq!(Operator::parse("eq"), Some(Operator::Eq));
        assert_eq!(Operator::parse("between"), None);
    }
}
