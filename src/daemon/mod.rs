//! Daemon supervisor -- wires storage, detection, alerting, scheduler, and
//! the admin API together, then runs the signal loop (SIGHUP hot reload,
//! SIGINT/SIGTERM graceful shutdown).

pub mod integrity;
pub mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerting::{
    self,
    channels::{build_channels, Channel, LogChannel},
};
use crate::api::{self, AppState};
use crate::config::{Config, RuleConfig, ScannerConfig};
use crate::detect::rules::{Operator, Rule};
use crate::detect::{BaselineManager, Correlator, RuleEngine};
use crate::scanner::{Registry, Severity};
use crate::scheduler::{JobConfig, Scheduler};
use crate::signatures::{SignatureStore, Status as SignatureStatus};
use crate::state::ResultCache;
use crate::storage::{results::ResultsStore, Store};
use pipeline::Pipeline;

pub struct Runner {
    cfg: Config,
    config_path: PathBuf,
}

impl Runner {
    pub fn new(cfg: Config, config_path: PathBuf) -> Self {
        Self { cfg, config_path }
    }

    pub async fn run(self) -> Result<()> {
        let cfg = self.cfg;

        if cfg.security.self_integrity {
            integrity::verify_self_integrity(&cfg.security.expected_sha256)
                .context("self-integrity check")?;
            info!("self-integrity check passed");
        }
        warn!("running without privilege drop");

        let root = CancellationToken::new();

        let store = crate::storage::open(
            Path::new(&cfg.storage.db_path),
            &cfg.storage.encryption_key_base64,
        )
        .context("open storage")?;
        let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;

        let registry = Arc::new(Registry::new());
        crate::plugins::register_builtin(&registry)?;
        init_plugins(&registry, &cfg.scanners);

        let baselines = Arc::new(BaselineManager::new(Arc::clone(&store_dyn)));
        let results = ResultsStore::new(Arc::clone(&store_dyn));
        if cfg.storage.retention_days > 0 {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(cfg.storage.retention_days);
            if let Err(err) = results.prune_older_than(cutoff) {
                warn!(error = %err, "results retention prune failed");
            }
            if let Err(err) = baselines.prune_older_than(cutoff) {
                warn!(error = %err, "baseline retention prune failed");
            }
        }

        let cache = Arc::new(ResultCache::new(50));
        let signatures = Arc::new(SignatureStore::new(Arc::clone(&store_dyn)));
        seed_signature_status(&signatures, &cfg);

        let alert_cancel = root.child_token();
        let alerts = build_alert_engine(&cfg, alert_cancel.clone());

        let scheduler = Scheduler::new(Arc::clone(&registry));
        scheduler.set_state_store(Arc::clone(&store_dyn));

        let pipeline = Pipeline::new(
            Arc::clone(&baselines),
            RuleEngine::new(build_rules(&cfg.detection.rules)),
            Correlator::new(
                cfg.detection.correlation_window_duration(),
                cfg.detection.correlation_min_scanners,
                cfg.detection.correlation_cooldown_duration(),
            ),
            Arc::clone(&cache),
            ResultsStore::new(Arc::clone(&store_dyn)),
            Arc::clone(&alerts),
            cfg.detection.drift_consecutive,
        );
        scheduler.set_on_result(Arc::clone(&pipeline) as Arc<dyn crate::scheduler::ResultSink>);

        for sc in cfg.scanners.iter().filter(|sc| sc.enabled) {
            if let Err(err) = scheduler.add_job(job_config(sc)) {
                error!(job = %sc.name, error = %err, "failed to schedule job");
            }
        }
        scheduler.start(root.clone());
        info!("daemon started");

        let api_state = if cfg.api.enabled {
            let state = Arc::new(AppState {
                cfg: RwLock::new(cfg.api.clone()),
                registry: Arc::clone(&registry),
                scheduler: Arc::clone(&scheduler),
                cache: Arc::clone(&cache),
                baselines: Arc::clone(&baselines),
                signatures: Arc::clone(&signatures),
            });
            let server_state = Arc::clone(&state);
            let server_cancel = root.clone();
            tokio::spawn(async move {
                if let Err(err) = api::serve(server_state, server_cancel).await {
                    error!(error = %err, "admin api exited");
                }
            });
            Some(state)
        } else {
            None
        };

        let mut running = Running {
            cfg,
            config_path: self.config_path,
            registry,
            scheduler: Arc::clone(&scheduler),
            pipeline,
            signatures,
            api_state,
            root: root.clone(),
            alert_cancel,
        };

        let mut sighup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("config reload requested");
                    running.reload().await;
                }
                _ = sigint.recv() => {
                    warn!(signal = "SIGINT", "shutdown signal received");
                    break;
                }
                _ = sigterm.recv() => {
                    warn!(signal = "SIGTERM", "shutdown signal received");
                    break;
                }
                _ = root.cancelled() => break,
            }
        }

        let timeout = running.cfg.daemon.shutdown_timeout_duration();
        info!(timeout = ?timeout, "shutdown starting");
        root.cancel();
        scheduler.stop();
        // Let in-flight plugin calls and the alert worker drain briefly.
        tokio::time::sleep(Duration::from_millis(100).min(timeout)).await;
        if let Err(err) = store.close() {
            error!(error = %err, "store close failed");
        }
        info!("shutdown complete");
        Ok(())
    }
}

struct Running {
    cfg: Config,
    config_path: PathBuf,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    pipeline: Arc<Pipeline>,
    signatures: Arc<SignatureStore>,
    api_state: Option<Arc<AppState>>,
    root: CancellationToken,
    alert_cancel: CancellationToken,
}

impl Running {
    async fn reload(&mut self) {
        let new_cfg = match crate::config::load(&self.config_path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "config reload failed");
                return;
            }
        };

        if new_cfg.api.bind_addr != self.cfg.api.bind_addr {
            warn!(
                old = %self.cfg.api.bind_addr,
                new = %new_cfg.api.bind_addr,
                "api.bind_addr change requires restart"
            );
        }
        if new_cfg.web_ui.bind_addr != self.cfg.web_ui.bind_addr {
            warn!(
                old = %self.cfg.web_ui.bind_addr,
                new = %new_cfg.web_ui.bind_addr,
                "web_ui.bind_addr change requires restart"
            );
        }
        if new_cfg.storage.db_path != self.cfg.storage.db_path {
            warn!(
                old = %self.cfg.storage.db_path,
                new = %new_cfg.storage.db_path,
                "storage.db_path change requires restart"
            );
        }

        // Old worker stops with its token; the new engine gets a fresh one.
        self.alert_cancel.cancel();
        self.alert_cancel = self.root.child_token();
        let alerts = build_alert_engine(&new_cfg, self.alert_cancel.clone());

        self.pipeline.replace_detection(
            RuleEngine::new(build_rules(&new_cfg.detection.rules)),
            Correlator::new(
                new_cfg.detection.correlation_window_duration(),
                new_cfg.detection.correlation_min_scanners,
                new_cfg.detection.correlation_cooldown_duration(),
            ),
            alerts,
            new_cfg.detection.drift_consecutive,
        );

        init_plugins(&self.registry, &new_cfg.scanners);

        let jobs: Vec<JobConfig> = new_cfg
            .scanners
            .iter()
            .filter(|sc| sc.enabled)
            .map(job_config)
            .collect();
        if let Err(err) = self.scheduler.replace_jobs(self.root.clone(), jobs).await {
            error!(error = %err, "scheduler reload failed");
        }

        if let Some(state) = &self.api_state {
            state.update_config(new_cfg.api.clone());
        }
        seed_signature_status(&self.signatures, &new_cfg);

        self.cfg = new_cfg;
        info!("config reload complete");
    }
}

fn build_alert_engine(cfg: &Config, cancel: CancellationToken) -> Arc<alerting::Engine> {
    let channels = match build_channels(&cfg.alerting) {
        Ok(channels) => channels,
        Err(err) => {
            error!(error = %err, "alert channel setup failed");
            vec![Arc::new(LogChannel) as Arc<dyn Channel>]
        }
    };
    let engine = alerting::Engine::new(&cfg.alerting, channels);
    engine.start(cancel);
    engine
}

fn init_plugins(registry: &Registry, scanners: &[ScannerConfig]) {
    for sc in scanners {
        let plugin = match registry.get(&sc.plugin) {
            Ok(plugin) => plugin,
            Err(_) => {
                error!(plugin = %sc.plugin, "plugin not found");
                continue;
            }
        };
        if let Err(err) = plugin.init(&sc.config) {
            error!(plugin = %sc.plugin, error = %err, "plugin init failed");
        }
    }
}

fn job_config(sc: &ScannerConfig) -> JobConfig {
    JobConfig {
        name: sc.name.clone(),
        plugin: sc.plugin.clone(),
        schedule: sc.schedule.clone(),
        timeout: sc.timeout_duration(),
        max_retries: sc.max_retries,
        retry_backoff: sc.retry_backoff_duration(),
        retry_max: sc.retry_max_duration(),
        allow_overlap: sc.allow_overlap,
        run_on_start: sc.run_on_start,
    }
}

fn build_rules(rules: &[RuleConfig]) -> Vec<Rule> {
    rules
        .iter()
        .filter_map(|rule| {
            let Some(operator) = Operator::parse(&rule.operator) else {
                warn!(rule = %rule.name, operator = %rule.operator, "skipping rule with bad operator");
                return None;
            };
            Some(Rule {
                name: rule.name.clone(),
                scanner: rule.scanner.clone(),
                metric: rule.metric.clone(),
                operator,
                threshold: rule.threshold,
                severity: Severity::parse(&rule.severity),
                description: rule.description.clone(),
            })
        })
        .collect()
}

fn seed_signature_status(signatures: &SignatureStore, cfg: &Config) {
    let mut status = match signatures.load_status() {
        Ok(status) => status,
        Err(err) => {
            warn!(error = %err, "signature status load failed");
            SignatureStatus::default()
        }
    };
    status.airgap_mode = !cfg.signatures.airgap_import_path.is_empty();
    status.airgap_import_path = cfg.signatures.airgap_import_path.clone();
    if let Err(err) = signatures.save_status(&status) {
        warn!(error = %err, "signature status save failed");
    }
    debug!(enabled = cfg.signatures.enabled, "signature status seeded");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_config_maps_scanner_config() {
        let sc = ScannerConfig {
            name: "disk".to_string(),
            plugin: "system.disk_usage".to_string(),
            enabled: true,
            schedule: "30s".to_string(),
            timeout: "1m".to_string(),
            max_retries: 2,
            retry_backoff: "1s".to_string(),
            retry_max: "10s".to_string(),
            allow_overlap: false,
            run_on_start: true,
            config: serde_json::Map::new(),
        };
        let job = job_config(&sc);
        assert_eq!(job.name, "disk");
        assert_eq!(job.timeout, Duration::from_secs(60));
        assert_eq!(job.retry_max, Duration::from_secs(10));
        assert!(job.run_on_start);
    }

    #[test]
    fn bad_rules_are_skipped() {
        let rules = build_rules(&[
            RuleConfig {
                name: "good".to_string(),
                scanner: "*".to_string(),
                metric: "m".to_string(),
                operator: "gt".to_string(),
                threshold: 1.0,
                severity: "high".to_string(),
                description: String::new(),
            },
            RuleConfig {
                name: "bad".to_string(),
                scanner: "*".to_string(),
                metric: "m".to_string(),
                operator: "between".to_string(),
                threshold: 1.0,
                severity: "high".to_string(),
                description: String::new(),
            },
        ]);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].severity, Severity::High);
    }
}
