//! Sliding-window correlation of findings across scanners.
//!
//! Any result carrying findings contributes an event. When enough distinct
//! scanners report within the window, one high-severity correlation finding
//! is emitted, then the correlator goes quiet for the cooldown.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::scanner::{Finding, ScanResult, Severity};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MIN_SCANNERS: usize = 2;

pub struct Correlator {
    window: Duration,
    min_scanners: usize,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    events: VecDeque<(DateTime<Utc>, String)>,
    last_triggered: Option<DateTime<Utc>>,
}

impl Correlator {
    /// Zero or out-of-range parameters fall back to the defaults
    /// (window 5m, min 2 scanners, cooldown = window).
    pub fn new(window: Duration, min_scanners: usize, cooldown: Duration) -> Self {
        let window = if window.is_zero() {
            DEFAULT_WINDOW
        } else {
            window
        };
        let min_scanners = if min_scanners < 1 {
            DEFAULT_MIN_SCANNERS
        } else {
            min_scanners
        };
        let cooldown = if cooldown.is_zero() { window } else { cooldown };
        Self {
            window,
            min_scanners,
            cooldown,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn add(&self, result: &ScanResult) -> Vec<Finding> {
        if result.findings.is_empty() {
            return Vec::new();
        }
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *inner;

        inner.events.push_back((now, result.scanner_name.clone()));
        let cutoff = now
            - chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::zero());
        while matches!(inner.events.front(), Some((at, _)) if *at <= cutoff) {
            inner.events.pop_front();
        }

        let unique: HashSet<&str> = inner.events.iter().map(|(_, name)| name.as_str()).collect();
        if unique.len() < self.min_scanners {
            return Vec::new();
        }

        let cooldown = chrono::Duration::from_std(self.cooldown)
            .unwrap_or_else(|_| chrono::Duration::zero());
        if matches!(inner.last_triggered, Some(last) if now - last < cooldown) {
            return Vec::new();
        }

        inner.last_triggered = Some(now);
        vec![Finding {
            id: "correlation_multi_scanner".to_string(),
            severity: Severity::High,
            category: "correlation".to_string(),
            description: "Multiple scanners reported findings within correlation window."
                .to_string(),
            evidence: json!({
                "unique_scanners": unique.len(),
                "window": format!("{:?}", self.window),
            }),
            remediation: "Investigate combined signals for coordinated activity.".to_string(),
        }]
    }
}
