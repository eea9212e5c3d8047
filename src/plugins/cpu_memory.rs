//! CPU and memory scanner: /proc/stat sampled over a short window plus
//! /proc/meminfo.

use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::scanner::{MetricValue, Plugin, ScanResult, Status};

struct Settings {
    sample_ms: u64,
    include_swap: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_ms: 200,
            include_swap: true,
        }
    }
}

pub struct CpuMemory {
    settings: RwLock<Settings>,
}

impl CpuMemory {
    pub fn new() -> Self {
        Self {
            settings: RwLock::new(Settings::default()),
        }
    }
}

impl Default for CpuMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for CpuMemory {
    fn name(&self) -> &'static str {
        "system.cpu_memory"
    }

    fn init(&self, config: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let mut settings = Settings::default();
        if let Some(v) = config.get("sample_ms").and_then(|v| v.as_u64()) {
            if v == 0 {
                anyhow::bail!("sample_ms must be > 0");
            }
            settings.sample_ms = v;
        }
        if let Some(v) = config.get("include_swap").and_then(|v| v.as_bool()) {
            settings.include_swap = v;
        }
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<ScanResult> {
        let (sample_ms, include_swap) = {
            let settings = self.settings.read().unwrap_or_else(|e| e.into_inner());
            (settings.sample_ms, settings.include_swap)
        };

        let first = read_cpu_stat()?;
        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
            _ = tokio::time::sleep(Duration::from_millis(sample_ms)) => {}
        }
        let second = read_cpu_stat()?;

        let delta_total = second.total.saturating_sub(first.total);
        let delta_idle = second.idle.saturating_sub(first.idle);
        let cpu_usage = if delta_total > 0 {
            (delta_total.saturating_sub(delta_idle) as f64 / delta_total as f64) * 100.0
        } else {
            0.0
        };

        let mem = read_meminfo()?;
        let mem_used = mem.mem_total.saturating_sub(mem.mem_available);
        let mem_used_pct = if mem.mem_total > 0 {
            (mem_used as f64 / mem.mem_total as f64) * 100.0
        } else {
            0.0
        };

        let mut result = ScanResult::new(self.name(), Status::Success);
        result
            .metadata
            .insert("cpu_usage_pct".to_string(), MetricValue::Float(cpu_usage));
        result
            .metadata
            .insert("mem_used_pct".to_string(), MetricValue::Float(mem_used_pct));
        result.metadata.insert(
            "mem_total_bytes".to_string(),
            MetricValue::Uint(mem.mem_total),
        );
        result
            .metadata
            .insert("mem_used_bytes".to_string(), MetricValue::Uint(mem_used));

        if include_swap && mem.swap_total > 0 {
            let swap_used = mem.swap_total.saturating_sub(mem.swap_free);
            let swap_used_pct = (swap_used as f64 / mem.swap_total as f64) * 100.0;
            result.metadata.insert(
                "swap_used_pct".to_string(),
                MetricValue::Float(swap_used_pct),
            );
            result
                .metadata
                .insert("swap_used_bytes".to_string(), MetricValue::Uint(swap_used));
        }

        Ok(result)
    }
}

struct CpuStat {
    total: u64,
    idle: u64,
}

fn read_cpu_stat() -> Result<CpuStat> {
    let raw = std::fs::read_to_string("/proc/stat").context("read /proc/stat")?;
    parse_cpu_stat(&raw)
}

fn parse_cpu_stat(raw: &str) -> Result<CpuStat> {
    for line in raw.lines() {
        let Some(rest) = line.strip_prefix("cpu ") else {
            continue;
        };
        let values: Vec<u64> = rest
            .split_whitespace()
            .map(|p| p.parse::<u64>())
            .collect::<Result<_, _>>()
            .context("parse cpu stat")?;
        if values.len() < 4 {
            anyhow::bail!("invalid cpu stat line");
        }
        let total = values.iter().sum();
        // idle + iowait when present.
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        return Ok(CpuStat { total, idle });
    }
    anyhow::bail!("cpu stat line not found")
}

struct MemInfo {
    mem_total: u64,
    mem_available: u64,
    swap_total: u64,
    swap_free: u64,
}

fn read_meminfo() -> Result<MemInfo> {
    let raw = std::fs::read_to_string("/proc/meminfo").context("read /proc/meminfo")?;
    parse_meminfo(&raw)
}

fn parse_meminfo(raw: &str) -> Result<MemInfo> {
    let mut info = MemInfo {
        mem_total: 0,
        mem_available: 0,
        swap_total: 0,
        swap_free: 0,
    };
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u64>() else {
            continue;
        };
        let bytes = value * 1024;
        match key.trim_end_matches(':') {
            "MemTotal" => info.mem_total = bytes,
            "MemAvailable" => info.mem_available = bytes,
            "SwapTotal" => info.swap_total = bytes,
            "SwapFree" => info.swap_free = bytes,
            _ => {}
        }
    }
    if info.mem_total == 0 || info.mem_available == 0 {
        anyhow::bail!("meminfo missing MemTotal/MemAvailable");
    }
    Ok(info)
}
