//! JSON configuration: defaults, file loading, validation, environment
//! overrides, and redaction for logging.
//!
//! Duration-valued settings stay strings in the model (`"30s"`, `"2m"`) and
//! are resolved through accessor methods, so a config written for the
//! daemon round-trips byte-for-byte.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "configs/config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub signatures: SignaturesConfig,
    pub api: ApiConfig,
    pub web_ui: WebUiConfig,
    pub scanners: Vec<ScannerConfig>,
    pub detection: DetectionConfig,
    pub alerting: AlertingConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub log_level: String,
    pub log_format: String,
    pub shutdown_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub retention_days: i64,
    pub encryption_key_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignaturesConfig {
    pub enabled: bool,
    pub airgap_import_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub read_only: bool,
    pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebUiConfig {
    pub enabled: bool,
    pub bind_addr: String,
    pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub name: String,
    pub plugin: String,
    pub enabled: bool,
    pub schedule: String,
    pub timeout: String,
    pub max_retries: u32,
    pub retry_backoff: String,
    pub retry_max: String,
    pub allow_overlap: bool,
    pub run_on_start: bool,
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub correlation_window: String,
    pub correlation_min_scanners: usize,
    pub correlation_cooldown: String,
    pub drift_consecutive: u32,
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuleConfig {
    pub name: String,
    pub scanner: String,
    pub metric: String,
    pub operator: String,
    pub threshold: f64,
    pub severity: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub enabled: bool,
    pub dedup_window: String,
    pub retry_max: u32,
    pub retry_backoff: String,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelConfig {
    pub r#type: String,
    pub enabled: bool,
    pub severity: Vec<String>,

    pub url: String,

    pub syslog_network: String,
    pub syslog_address: String,
    pub syslog_tag: String,

    pub smtp_server: String,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub self_integrity: bool,
    pub expected_sha256: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            storage: StorageConfig::default(),
            signatures: SignaturesConfig::default(),
            api: ApiConfig::default(),
            web_ui: WebUiConfig::default(),
            scanners: Vec::new(),
            detection: DetectionConfig::default(),
            alerting: AlertingConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            shutdown_timeout: "10s".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "/var/lib/arcsent/db".to_string(),
            retention_days: 30,
            encryption_key_base64: String::new(),
        }
    }
}

impl Default for SignaturesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            airgap_import_path: String::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: "127.0.0.1:8788".to_string(),
            read_only: true,
            auth_token: String::new(),
        }
    }
}

impl Default for WebUiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: "127.0.0.1:8787".to_string(),
            auth_token: String::new(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            plugin: String::new(),
            enabled: false,
            schedule: String::new(),
            timeout: String::new(),
            max_retries: 0,
            retry_backoff: String::new(),
            retry_max: String::new(),
            allow_overlap: false,
            run_on_start: false,
            config: serde_json::Map::new(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            correlation_window: "5m".to_string(),
            correlation_min_scanners: 2,
            correlation_cooldown: "5m".to_string(),
            drift_consecutive: 3,
            rules: Vec::new(),
        }
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dedup_window: "5m".to_string(),
            retry_max: 3,
            retry_backoff: "2s".to_string(),
            channels: vec![ChannelConfig {
                r#type: "log".to_string(),
                enabled: true,
                ..ChannelConfig::default()
            }],
        }
    }
}

/// Loads, applies `ARCSENT_*` env overrides, and validates.
pub fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let mut cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ARCSENT_API_ENABLED") {
        if let Ok(parsed) = v.parse::<bool>() {
            cfg.api.enabled = parsed;
        }
    }
    if let Ok(v) = std::env::var("ARCSENT_API_TOKEN") {
        if !v.is_empty() {
            cfg.api.auth_token = v;
        }
    }
    if let Ok(v) = std::env::var("ARCSENT_WEB_UI_ENABLED") {
        if let Ok(parsed) = v.parse::<bool>() {
            cfg.web_ui.enabled = parsed;
        }
    }
    if let Ok(v) = std::env::var("ARCSENT_WEB_UI_TOKEN") {
        if !v.is_empty() {
            cfg.web_ui.auth_token = v;
        }
    }
    if let Ok(v) = std::env::var("ARCSENT_SIGNATURES_ENABLED") {
        if let Ok(parsed) = v.parse::<bool>() {
            cfg.signatures.enabled = parsed;
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let mut errs: Vec<String> = Vec::new();

        match self.daemon.log_level.to_ascii_lowercase().as_str() {
            "debug" | "info" | "warn" | "error" => {}
            _ => errs.push("daemon.log_level must be one of: debug, info, warn, error".into()),
        }
        match self.daemon.log_format.to_ascii_lowercase().as_str() {
            "json" | "text" => {}
            _ => errs.push("daemon.log_format must be one of: json, text".into()),
        }
        if !self.daemon.shutdown_timeout.is_empty()
            && parse_duration(&self.daemon.shutdown_timeout).is_none()
        {
            errs.push("daemon.shutdown_timeout must be a valid duration (e.g. 10s)".into());
        }

        if self.storage.db_path.is_empty() {
            errs.push("storage.db_path is required".into());
        } else if !Path::new(&self.storage.db_path).is_absolute() {
            errs.push("storage.db_path must be an absolute path".into());
        }
        if self.storage.retention_days < 0 {
            errs.push("storage.retention_days must be >= 0".into());
        }
        if !self.storage.encryption_key_base64.is_empty() {
            match base64::engine::general_purpose::STANDARD
                .decode(&self.storage.encryption_key_base64)
            {
                Ok(key) if key.len() == 32 => {}
                Ok(_) => errs.push("storage.encryption_key_base64 must decode to 32 bytes".into()),
                Err(_) => errs.push("storage.encryption_key_base64 must be valid base64".into()),
            }
        }

        if !self.signatures.airgap_import_path.is_empty()
            && !Path::new(&self.signatures.airgap_import_path).is_absolute()
        {
            errs.push("signatures.airgap_import_path must be an absolute path if set".into());
        }

        if self.api.enabled {
            if self.api.bind_addr.is_empty() {
                errs.push("api.bind_addr is required when enabled".into());
            }
            if self.api.auth_token.is_empty() {
                errs.push("api.auth_token is required when enabled".into());
            }
        }
        if self.web_ui.enabled {
            if self.web_ui.bind_addr.is_empty() {
                errs.push("web_ui.bind_addr is required when enabled".into());
            }
            if self.web_ui.auth_token.is_empty() {
                errs.push("web_ui.auth_token is required when enabled".into());
            }
        }

        for (i, sc) in self.scanners.iter().enumerate() {
            if sc.name.is_empty() {
                errs.push(format!("scanners[{i}].name is required"));
            }
            if sc.plugin.is_empty() {
                errs.push(format!("scanners[{i}].plugin is required"));
            }
            if sc.enabled && sc.schedule.is_empty() {
                errs.push(format!("scanners[{i}].schedule is required when enabled"));
            }
            for (field, value) in [
                ("timeout", &sc.timeout),
                ("retry_backoff", &sc.retry_backoff),
                ("retry_max", &sc.retry_max),
            ] {
                if !value.is_empty() && parse_duration(value).is_none() {
                    errs.push(format!("scanners[{i}].{field} must be a valid duration"));
                }
            }
        }

        for (field, value) in [
            ("correlation_window", &self.detection.correlation_window),
            ("correlation_cooldown", &self.detection.correlation_cooldown),
        ] {
            if !value.is_empty() && parse_duration(value).is_none() {
                errs.push(format!("detection.{field} must be a valid duration"));
            }
        }
        if self.detection.correlation_min_scanners < 1 {
            errs.push("detection.correlation_min_scanners must be >= 1".into());
        }
        if self.detection.drift_consecutive < 1 {
            errs.push("detection.drift_consecutive must be >= 1".into());
        }
        for (i, rule) in self.detection.rules.iter().enumerate() {
            if rule.name.is_empty() {
                errs.push(format!("detection.rules[{i}].name is required"));
            }
            if rule.scanner.is_empty() {
                errs.push(format!("detection.rules[{i}].scanner is required"));
            }
            if rule.metric.is_empty() {
                errs.push(format!("detection.rules[{i}].metric is required"));
            }
            if crate::detect::rules::Operator::parse(&rule.operator).is_none() {
                errs.push(format!(
                    "detection.rules[{i}].operator must be one of gt,gte,lt,lte,eq"
                ));
            }
        }

        for (field, value) in [
            ("dedup_window", &self.alerting.dedup_window),
            ("retry_backoff", &self.alerting.retry_backoff),
        ] {
            if !value.is_empty() && parse_duration(value).is_none() {
                errs.push(format!("alerting.{field} must be a valid duration"));
            }
        }
        for (i, ch) in self.alerting.channels.iter().enumerate() {
            if ch.r#type.is_empty() {
                errs.push(format!("alerting.channels[{i}].type is required"));
            }
        }

        if self.security.self_integrity && self.security.expected_sha256.is_empty() {
            errs.push("security.expected_sha256 is required when self_integrity is enabled".into());
        }

        if errs.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("{}", errs.join("; "))
        }
    }

    /// Copy with secrets masked; safe to log.
    pub fn redacted(&self) -> Config {
        let mut clone = self.clone();
        if !clone.api.auth_token.is_empty() {
            clone.api.auth_token = "REDACTED".to_string();
        }
        if !clone.web_ui.auth_token.is_empty() {
            clone.web_ui.auth_token = "REDACTED".to_string();
        }
        if !clone.storage.encryption_key_base64.is_empty() {
            clone.storage.encryption_key_base64 = "REDACTED".to_string();
        }
        for ch in &mut clone.alerting.channels {
            if !ch.smtp_pass.is_empty() {
                ch.smtp_pass = "REDACTED".to_string();
            }
        }
        clone
    }
}

impl DaemonConfig {
    pub fn shutdown_timeout_duration(&self) -> Duration {
        parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(10))
    }
}

impl ScannerConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::ZERO)
    }

    pub fn retry_backoff_duration(&self) -> Duration {
        parse_duration(&self.retry_backoff).unwrap_or(Duration::ZERO)
    }

    pub fn retry_max_duration(&self) -> Duration {
        parse_duration(&self.retry_max).unwrap_or(Duration::ZERO)
    }
}

impl DetectionConfig {
    pub fn correlation_window_duration(&self) -> Duration {
        parse_duration(&self.correlation_window).unwrap_or(Duration::ZERO)
    }

    pub fn correlation_cooldown_duration(&self) -> Duration {
        parse_duration(&self.correlation_cooldown).unwrap_or(Duration::ZERO)
    }
}

impl AlertingConfig {
    pub fn dedup_window_duration(&self) -> Duration {
        parse_duration(&self.dedup_window).unwrap_or(Duration::from_secs(5 * 60))
    }

    pub fn retry_backoff_duration(&self) -> Duration {
        parse_duration(&self.retry_backoff).unwrap_or(Duration::from_secs(2))
    }
}

/// Parses compound duration literals: `500ms`, `30s`, `2m`, `1h`, `1h30m`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = s.chars().peekable();
    let mut seen_segment = false;
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        if number.is_empty() {
            return None;
        }
        let mut unit = String::from(c);
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        let seconds = match unit.as_str() {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            _ => return None,
        };
        total += Duration::from_secs_f64(seconds);
        seen_segment = true;
    }
    // Trailing bare number (no unit) is invalid.
    if !number.is_empty() || !seen_segment {
        return None;
    }
    Some(total)
}
