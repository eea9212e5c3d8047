//! Schedule expression parsing: duration intervals and 5-field cron.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use crate::config::parse_duration;

#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Interval(Duration),
    Cron(CronSchedule),
}

impl ScheduleSpec {
    /// Next fire time strictly after `from`.
    pub fn next(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ScheduleSpec::Interval(interval) => from + to_chrono(*interval),
            // A cron expression with no future match (possible with fixed
            // day/month combinations) parks the job a year out.
            ScheduleSpec::Cron(schedule) => schedule
                .after(&from)
                .next()
                .unwrap_or_else(|| from + chrono::Duration::days(365)),
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            ScheduleSpec::Interval(interval) => Some(*interval),
            ScheduleSpec::Cron(_) => None,
        }
    }
}

pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Accepts `30s` / `2m` / `1h` style intervals (optionally prefixed with
/// `@every `) or a 5-field `minute hour dom month dow` cron expression.
pub fn parse_schedule(expr: &str) -> Result<ScheduleSpec> {
    let expr = expr.trim();
    if expr.is_empty() {
        anyhow::bail!("schedule is required");
    }
    let expr = expr.strip_prefix("@every ").unwrap_or(expr);

    if let Some(interval) = parse_duration(expr) {
        if interval.is_zero() {
            anyhow::bail!("schedule interval must be positive");
        }
        return Ok(ScheduleSpec::Interval(interval));
    }

    // The cron crate wants a seconds field; configs use the POSIX form.
    if expr.split_whitespace().count() == 5 {
        let with_seconds = format!("0 {expr}");
        if let Ok(schedule) = CronSchedule::from_str(&with_seconds) {
            return Ok(ScheduleSpec::Cron(schedule));
        }
    }

    anyhow::bail!("unsupported schedule {expr:?} (use a duration or 5-field cron)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_as_interval() {
        for expr in ["30s", "@every 1s", " 2m ", "1h30m"] {
            let spec = parse_schedule(expr).unwrap();
            assert!(spec.interval().is_some(), "expr {expr:?}");
        }
    }

    #[test]
    fn five_field_cron_parses() {
        let spec = parse_schedule("*/5 * * * *").unwrap();
        assert!(spec.interval().is_none());

        let now = Utc::now();
        let next = spec.next(now);
        assert!(next > now);
        assert!(next - now <= chrono::Duration::minutes(5));
        assert_eq!(next.timestamp() % 300, 0);
    }

    #[test]
    fn invalid_schedules_rejected() {
        assert!(parse_schedule("").is_err());
        assert!(parse_schedule("   ").is_err());
        assert!(parse_schedule("0s").is_err());
        assert!(parse_schedule("nonsense").is_err());
        assert!(parse_schedule("* * *").is_err());
        assert!(parse_schedule("61 * * * *").is_err());
    }

    #[test]
    fn interval_next_adds_interval() {
        let spec = parse_schedule("2m").unwrap();
        let now = Utc::now();
        assert_eq!(spec.next(now), now + chrono::Duration::minutes(2));
    }
}
