//! Uptime scanner: /proc/uptime with a recent-reboot finding.

use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::scanner::{Finding, MetricValue, Plugin, ScanResult, Severity, Status};

const DEFAULT_MIN_UPTIME_SECONDS: f64 = 600.0;

pub struct Uptime {
    min_uptime_seconds: RwLock<f64>,
}

impl Uptime {
    pub fn new() -> Self {
        Self {
            min_uptime_seconds: RwLock::new(DEFAULT_MIN_UPTIME_SECONDS),
        }
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for Uptime {
    fn name(&self) -> &'static str {
        "system.uptime"
    }

    fn init(&self, config: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let mut min_uptime = DEFAULT_MIN_UPTIME_SECONDS;
        if let Some(v) = config.get("min_uptime_seconds").and_then(|v| v.as_f64()) {
            if v < 0.0 {
                anyhow::bail!("min_uptime_seconds must be >= 0");
            }
            min_uptime = v;
        }
        *self
            .min_uptime_seconds
            .write()
            .unwrap_or_else(|e| e.into_inner()) = min_uptime;
        Ok(())
    }

    async fn run(&self, _cancel: CancellationToken) -> Result<ScanResult> {
        let raw = std::fs::read_to_string("/proc/uptime").context("read /proc/uptime")?;
        let (uptime, idle) = parse_uptime(&raw)?;
        let min_uptime = *self
            .min_uptime_seconds
            .read()
            .unwrap_or_else(|e| e.into_inner());

        let mut result = ScanResult::new(self.name(), Status::Success);
        result
            .metadata
            .insert("uptime_seconds".to_string(), MetricValue::Float(uptime));
        result
            .metadata
            .insert("idle_seconds".to_string(), MetricValue::Float(idle));

        if uptime < min_uptime {
            result.findings.push(Finding {
                id: "recent_reboot".to_string(),
                severity: Severity::Info,
                category: "system".to_string(),
                description: format!("Host rebooted {uptime:.0}s ago"),
                evidence: json!({ "uptime_seconds": uptime }),
                remediation: "Confirm the reboot was expected.".to_string(),
            });
        }

        Ok(result)
    }
}

fn parse_uptime(raw: &str) -> Result<(f64, f64)> {
    let mut fields = raw.split_whitespace();
    let (Some(uptime), Some(idle)) = (fields.next(), fields.next()) else {
        anyhow::bail!("invalid uptime format");
    };
    let uptime: f64 = uptime.parse().context("parse uptime")?;
    let idle: f64 = idle.parse().context("parse idle")?;
    Ok((uptime, idle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uptime_line() {
        let (uptime, idle) = parse_uptime("350735.47 234388.90\n").unwrap();
        assert_eq!(uptime, 350735.47);
        assert_eq!(idle, 234388.90);
        assert!(parse_uptime("garbage").is_err());
        assert!(parse_uptime("").is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn run_reports_uptime() {
        let plugin = Uptime::new();
        let result = plugin.run(CancellationToken::new()).await.unwrap();
        assert!(result.metadata["uptime_seconds"].as_f64().unwrap() > 0.0);
    }
}
