//! Alerting engine -- fingerprint deduplication, throttling, and async
//! fan-out to channels with per-channel retries.
//!
//! `send` is producer-side and never blocks: throttled or overflowing
//! alerts are dropped with a log line. A single worker task drains the
//! queue in enqueue order.

pub mod channels;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::AlertingConfig;
use crate::scanner::{Finding, Severity};
use channels::Channel;

const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub severity: Severity,
    pub scanner_name: String,
    pub finding: Finding,
    pub reason: String,
}

impl Alert {
    pub fn new(scanner_name: impl Into<String>, finding: Finding, reason: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            timestamp: None,
            severity: finding.severity,
            scanner_name: scanner_name.into(),
            finding,
            reason: reason.into(),
        }
    }
}

/// Stable dedup hash over the identity fields of an alert.
pub fn fingerprint(alert: &Alert) -> String {
    let mut hasher = Sha256::new();
    hasher.update(alert.scanner_name.as_bytes());
    hasher.update(b"|");
    hasher.update(alert.severity.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(alert.finding.id.as_bytes());
    hasher.update(b"|");
    hasher.update(alert.finding.description.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct Engine {
    enabled: bool,
    dedup_window: Duration,
    retry_max: u32,
    retry_backoff: Duration,
    channels: Vec<Arc<dyn Channel>>,
    last_seen: Mutex<HashMap<String, Instant>>,
    tx: mpsc::Sender<Alert>,
    rx: Mutex<Option<mpsc::Receiver<Alert>>>,
}

impl Engine {
    pub fn new(cfg: &AlertingConfig, channels: Vec<Arc<dyn Channel>>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Arc::new(Self {
            enabled: cfg.enabled,
            dedup_window: cfg.dedup_window_duration(),
            retry_max: cfg.retry_max,
            retry_backoff: cfg.retry_backoff_duration(),
            channels,
            last_seen: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Spawns the delivery worker. A disabled engine never starts one.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        if !self.enabled {
            return;
        }
        let Some(mut rx) = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    alert = rx.recv() => match alert {
                        Some(alert) => engine.deliver(alert).await,
                        None => return,
                    },
                }
            }
        });
    }

    /// Fingerprints, throttles, and enqueues. Never blocks the caller.
    pub fn send(&self, mut alert: Alert) {
        if !self.enabled {
            return;
        }
        if alert.id.is_empty() {
            alert.id = fingerprint(&alert);
        }
        if alert.timestamp.is_none() {
            alert.timestamp = Some(Utc::now());
        }

        if self.throttled(&alert.id) {
            warn!(alert_id = %alert.id, "alert throttled");
            return;
        }

        if self.tx.try_send(alert).is_err() {
            warn!("alert queue full, dropping");
        }
    }

    /// Atomically tests and stamps the dedup window for a fingerprint.
    fn throttled(&self, id: &str) -> bool {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(last) = last_seen.get(id) {
            if now.duration_since(*last) < self.dedup_window {
                return true;
            }
        }
        last_seen.insert(id.to_string(), now);
        false
    }

    /// Delivers to every channel; a failing channel does not affect the
    /// others.
    async fn deliver(&self, alert: Alert) {
        for channel in &self.channels {
            let mut last_err = None;
            for attempt in 0..=self.retry_max {
                match channel.send(&alert).await {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(err) => last_err = Some(err),
                }
                if attempt < self.retry_max {
                    let backoff = self
                        .retry_backoff
                        .saturating_mul(1u32 << attempt.min(20));
                    tokio::time::sleep(backoff).await;
                }
            }
            if let Some(err) = last_err {
                error!(channel = channel.name(), error = %err, "alert delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

    struct FlakyChannel {
        failures_left: AtomicI32,
        calls: AtomicU32,
    }

    impl FlakyChannel {
        fn new(failures: i32) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicI32::new(failures),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Channel for FlakyChannel {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn send(&self, _alert: &Alert) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.fetch_sub(1, Ordering::SeqCst) > 0 {
                anyhow::bail!("test error");
            }
            Ok(())
        }
    }

    fn test_alert() -> Alert {
        Alert::new(
            "test",
            Finding {
                id: "x".to_string(),
                severity: Severity::High,
                description: "test".to_string(),
                ..Finding::default()
            },
            "finding_detected",
        )
    }

    fn engine_config() -> AlertingConfig {
        AlertingConfig {
            enabled: true,
            dedup_window: "1s".to_string(),
            retry_max: 2,
            retry_backoff: "10ms".to_string(),
            channels: Vec::new(),
        }
    }

    #[test]
    fn fingerprint_is_stable_over_identity_fields() {
        let a = test_alert();
        let mut b = test_alert();
        assert_eq!(fingerprint(&a), fingerprint(&b));

        b.finding.description = "different".to_string();
        assert_ne!(fingerprint(&a), fingerprint(&b));

        let mut c = test_alert();
        c.severity = Severity::Low;
        assert_ne!(fingerprint(&a), fingerprint(&c));

        // Reason and timestamp are not identity.
        let mut d = test_alert();
        d.reason = "other".to_string();
        d.timestamp = Some(Utc::now());
        assert_eq!(fingerprint(&a), fingerprint(&d));
    }

    #[tokio::test]
    async fn dedup_and_retry() {
        let channel = FlakyChannel::new(1);
        let engine = Engine::new(&engine_config(), vec![channel.clone() as Arc<dyn Channel>]);
        let cancel = CancellationToken::new();
        engine.start(cancel.clone());

        // Same fingerprint twice inside the window: one delivery pass, two
        // channel calls (fail then success).
        engine.send(test_alert());
        engine.send(test_alert());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(channel.calls.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn disabled_engine_drops_everything() {
        let channel = FlakyChannel::new(0);
        let cfg = AlertingConfig {
            enabled: false,
            ..engine_config()
        };
        let engine = Engine::new(&cfg, vec![channel.clone() as Arc<dyn Channel>]);
        engine.start(CancellationToken::new());
        engine.send(test_alert());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_do_not_block_later_alerts() {
        let channel = FlakyChannel::new(100);
        let engine = Engine::new(&engine_config(), vec![channel.clone() as Arc<dyn Channel>]);
        let cancel = CancellationToken::new();
        engine.start(cancel.clone());

        engine.send(test_alert());
        let mut other = test_alert();
        other.finding.id = "y".to_string();
        engine.send(other);

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Both alerts got their 3 attempts.
        assert_eq!(channel.calls.load(Ordering::SeqCst), 6);
        cancel.cancel();
    }
}
