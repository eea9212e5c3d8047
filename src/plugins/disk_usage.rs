//! Filesystem usage scanner via statvfs.

use std::ffi::CString;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::scanner::{Finding, MetricValue, Plugin, ScanResult, Severity, Status};

struct Settings {
    path: String,
    warn_percent: f64,
    crit_percent: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            warn_percent: 85.0,
            crit_percent: 95.0,
        }
    }
}

pub struct DiskUsage {
    settings: RwLock<Settings>,
}

impl DiskUsage {
    pub fn new() -> Self {
        Self {
            settings: RwLock::new(Settings::default()),
        }
    }
}

impl Default for DiskUsage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for DiskUsage {
    fn name(&self) -> &'static str {
        "system.disk_usage"
    }

    fn init(&self, config: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let mut settings = Settings::default();
        if let Some(path) = config.get("path").and_then(|v| v.as_str()) {
            if !path.is_empty() {
                settings.path = path.to_string();
            }
        }
        if let Some(v) = config.get("warn_percent").and_then(|v| v.as_f64()) {
            if v > 0.0 {
                settings.warn_percent = v;
            }
        }
        if let Some(v) = config.get("crit_percent").and_then(|v| v.as_f64()) {
            if v > 0.0 {
                settings.crit_percent = v;
            }
        }
        if settings.warn_percent >= settings.crit_percent {
            anyhow::bail!("warn_percent must be less than crit_percent");
        }
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    async fn run(&self, _cancel: CancellationToken) -> Result<ScanResult> {
        let (path, warn_percent, crit_percent) = {
            let settings = self.settings.read().unwrap_or_else(|e| e.into_inner());
            (
                settings.path.clone(),
                settings.warn_percent,
                settings.crit_percent,
            )
        };

        let (total, free) = statvfs(&path)?;
        let used = total - free;
        let used_pct = if total > 0.0 {
            (used / total) * 100.0
        } else {
            0.0
        };

        let mut result = ScanResult::new(self.name(), Status::Success);
        result
            .metadata
            .insert("path".to_string(), MetricValue::Text(path.clone()));
        result
            .metadata
            .insert("total_bytes".to_string(), MetricValue::Float(total));
        result
            .metadata
            .insert("used_bytes".to_string(), MetricValue::Float(used));
        result
            .metadata
            .insert("used_pct".to_string(), MetricValue::Float(used_pct));

        if used_pct >= crit_percent {
            result.findings.push(Finding {
                id: "disk_usage_critical".to_string(),
                severity: Severity::Critical,
                category: "resource".to_string(),
                description: format!("Disk usage {used_pct:.2}% exceeds critical threshold"),
                evidence: json!({ "path": path, "used_pct": used_pct }),
                remediation: "Free disk space or expand storage.".to_string(),
            });
        } else if used_pct >= warn_percent {
            result.findings.push(Finding {
                id: "disk_usage_warning".to_string(),
                severity: Severity::Medium,
                category: "resource".to_string(),
                description: format!("Disk usage {used_pct:.2}% exceeds warning threshold"),
                evidence: json!({ "path": path, "used_pct": used_pct }),
                remediation: "Investigate disk usage growth.".to_string(),
            });
        }

        Ok(result)
    }
}

fn statvfs(path: &str) -> Result<(f64, f64)> {
    let c_path = CString::new(path).context("path contains NUL")?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("statvfs {path}"));
    }
    let total = stat.f_blocks as f64 * stat.f_frsize as f64;
    let free = stat.f_bavail as f64 * stat.f_frsize as f64;
    Ok((total, free))
}
