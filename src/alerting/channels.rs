//! Alert delivery channels: log, webhook, syslog, email.
//!
//! Each channel may carry a severity allow-list; an empty list allows
//! everything. A non-matching alert reports success without sending.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::warn;

use crate::config::{AlertingConfig, ChannelConfig};
use crate::scanner::Severity;

use super::Alert;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, alert: &Alert) -> Result<()>;
}

fn severity_allowed(allow: &[Severity], severity: Severity) -> bool {
    allow.is_empty() || allow.contains(&severity)
}

fn parse_allow_list(raw: &[String]) -> Vec<Severity> {
    raw.iter().map(|s| Severity::parse(s)).collect()
}

/// Builds the configured channel set. Falls back to a single log channel
/// when nothing is enabled.
pub fn build_channels(cfg: &AlertingConfig) -> Result<Vec<Arc<dyn Channel>>> {
    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
    for ch in &cfg.channels {
        if !ch.enabled {
            continue;
        }
        match ch.r#type.as_str() {
            "log" => channels.push(Arc::new(LogChannel)),
            "webhook" => {
                if ch.url.is_empty() {
                    anyhow::bail!("webhook url required");
                }
                channels.push(Arc::new(WebhookChannel::new(
                    ch.url.clone(),
                    parse_allow_list(&ch.severity),
                )?));
            }
            "syslog" => channels.push(Arc::new(SyslogChannel::new(
                ch,
                parse_allow_list(&ch.severity),
            ))),
            "email" => channels.push(Arc::new(EmailChannel::new(
                ch.clone(),
                parse_allow_list(&ch.severity),
            ))),
            other => anyhow::bail!("unknown alert channel type: {other}"),
        }
    }
    if channels.is_empty() {
        channels.push(Arc::new(LogChannel));
    }
    Ok(channels)
}

pub struct LogChannel;

#[async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        warn!(
            id = %alert.id,
            severity = %alert.severity,
            scanner = %alert.scanner_name,
            finding = %alert.finding.description,
            reason = %alert.reason,
            "alert"
        );
        Ok(())
    }
}

pub struct WebhookChannel {
    url: String,
    severity: Vec<Severity>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: String, severity: Vec<Severity>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("build webhook client")?;
        Ok(Self {
            url,
            severity,
            client,
        })
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        if !severity_allowed(&self.severity, alert.severity) {
            return Ok(());
        }
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .context("webhook post")?;
        let status = response.status();
        if status.as_u16() >= 300 {
            anyhow::bail!("webhook status {status}");
        }
        Ok(())
    }
}

pub struct SyslogChannel {
    severity: Vec<Severity>,
    writer: Mutex<Option<Logger<LoggerBackend, Formatter3164>>>,
}

impl SyslogChannel {
    pub fn new(cfg: &ChannelConfig, severity: Vec<Severity>) -> Self {
        let network = if cfg.syslog_network.is_empty() {
            "unixgram"
        } else {
            cfg.syslog_network.as_str()
        };
        let tag = if cfg.syslog_tag.is_empty() {
            "arcsent".to_string()
        } else {
            cfg.syslog_tag.clone()
        };
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: tag,
            pid: 0,
        };
        let writer = match network {
            "tcp" => syslog::tcp(formatter, cfg.syslog_address.as_str()).ok(),
            "udp" => syslog::udp(formatter, "0.0.0.0:0", cfg.syslog_address.as_str()).ok(),
            _ => syslog::unix(formatter).ok(),
        };
        Self {
            severity,
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Channel for SyslogChannel {
    fn name(&self) -> &'static str {
        "syslog"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        if !severity_allowed(&self.severity, alert.severity) {
            return Ok(());
        }
        let message = format!(
            "[{}] {} - {}",
            alert.severity, alert.scanner_name, alert.finding.description
        );
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let Some(writer) = writer.as_mut() else {
            anyhow::bail!("syslog writer not available");
        };
        let sent = match alert.severity {
            Severity::Critical | Severity::High => writer.err(message),
            Severity::Medium => writer.warning(message),
            _ => writer.info(message),
        };
        sent.map_err(|e| anyhow::anyhow!("syslog write: {e}"))
    }
}

pub struct EmailChannel {
    cfg: ChannelConfig,
    severity: Vec<Severity>,
}

impl EmailChannel {
    pub fn new(cfg: ChannelConfig, severity: Vec<Severity>) -> Self {
        Self { cfg, severity }
    }

    fn build_message(&self, alert: &Alert) -> Result<Message> {
        let subject = if self.cfg.subject.is_empty() {
            "ArcSent Alert"
        } else {
            self.cfg.subject.as_str()
        };
        let body = format!(
            "Severity: {}\nScanner: {}\nDescription: {}\n",
            alert.severity, alert.scanner_name, alert.finding.description
        );
        let mut builder = Message::builder()
            .from(self.cfg.from.parse::<Mailbox>().context("parse from")?)
            .subject(subject);
        for to in &self.cfg.to {
            builder = builder.to(to.parse::<Mailbox>().context("parse to")?);
        }
        builder.body(body).context("build email")
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        if !severity_allowed(&self.severity, alert.severity) {
            return Ok(());
        }
        if self.cfg.smtp_server.is_empty() || self.cfg.from.is_empty() || self.cfg.to.is_empty() {
            anyhow::bail!("email channel not configured");
        }

        let message = self.build_message(alert)?;
        let (host, port) = match self.cfg.smtp_server.split_once(':') {
            Some((host, port)) => (host.to_string(), port.parse::<u16>().unwrap_or(25)),
            None => (self.cfg.smtp_server.clone(), 25),
        };
        let mut builder = SmtpTransport::builder_dangerous(&host).port(port);
        if !self.cfg.smtp_user.is_empty() && !self.cfg.smtp_pass.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.cfg.smtp_user.clone(),
                self.cfg.smtp_pass.clone(),
            ));
        }
        let mailer = builder.build();

        // lettre's SMTP transport is blocking.
        tokio::task::spawn_blocking(move || mailer.send(&message))
            .await
            .context("email send task")?
            .context("smtp send")?;
        Ok(())
    }
}
