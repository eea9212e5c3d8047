//! Load average scanner: /proc/loadavg plus a per-core normalization.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::scanner::{MetricValue, Plugin, ScanResult, Status};

pub struct LoadAverage;

#[async_trait]
impl Plugin for LoadAverage {
    fn name(&self) -> &'static str {
        "system.load_avg"
    }

    fn init(&self, _config: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        Ok(())
    }

    async fn run(&self, _cancel: CancellationToken) -> Result<ScanResult> {
        let raw = std::fs::read_to_string("/proc/loadavg").context("read /proc/loadavg")?;
        let parsed = parse_loadavg(&raw)?;
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;

        let mut result = ScanResult::new(self.name(), Status::Success);
        result
            .metadata
            .insert("load1".to_string(), MetricValue::Float(parsed.load1));
        result
            .metadata
            .insert("load5".to_string(), MetricValue::Float(parsed.load5));
        result
            .metadata
            .insert("load15".to_string(), MetricValue::Float(parsed.load15));
        result.metadata.insert(
            "load1_per_core".to_string(),
            MetricValue::Float(parsed.load1 / cores),
        );
        result
            .metadata
            .insert("runnable".to_string(), MetricValue::Uint(parsed.runnable));
        result.metadata.insert(
            "total_threads".to_string(),
            MetricValue::Uint(parsed.total_threads),
        );
        Ok(result)
    }
}

struct LoadAvg {
    load1: f64,
    load5: f64,
    load15: f64,
    runnable: u64,
    total_threads: u64,
}

fn parse_loadavg(raw: &str) -> Result<LoadAvg> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() < 4 {
        anyhow::bail!("invalid loadavg format");
    }
    let load1: f64 = fields[0].parse().context("parse load1")?;
    let load5: f64 = fields[1].parse().context("parse load5")?;
    let load15: f64 = fields[2].parse().context("parse load15")?;

    let (runnable, total_threads) = fields[3]
        .split_once('/')
        .context("invalid loadavg running format")?;
    let runnable: u64 = runnable.parse().context("parse runnable")?;
    let total_threads: u64 = total_threads.parse().context("parse total threads")?;

    Ok(LoadAvg {
        load1,
        load5,
        load15,
        runnable,
        total_threads,
    })
}
