//! Job scheduler -- one long-lived task per job, with retries, overlap
//! control, per-attempt timeouts, panic isolation, and crash-persisted
//! next-run state.
//!
//! The scheduler owns `JobConfig` and `JobState` exclusively. Results are
//! handed to a single [`ResultSink`] installed by the supervisor; the sink
//! is responsible for its own thread safety.

pub mod schedule;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::scanner::{Registry, ScanResult, Status};
use crate::storage::Store;
use schedule::{parse_schedule, to_chrono, ScheduleSpec};

const STATE_BUCKET: &str = "scheduler_state";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub name: String,
    pub plugin: String,
    pub schedule: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub retry_max: Duration,
    pub allow_overlap: bool,
    pub run_on_start: bool,
}

/// Persisted per job; survives restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobState {
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<Status>,
    #[serde(default)]
    pub last_error_message: String,
    #[serde(default)]
    pub consecutive_failures: u32,
}

/// Receives every result the scheduler produces, in execution order per job.
pub trait ResultSink: Send + Sync {
    fn on_result(&self, result: ScanResult);
}

impl<F> ResultSink for F
where
    F: Fn(ScanResult) + Send + Sync,
{
    fn on_result(&self, result: ScanResult) {
        self(result)
    }
}

struct Job {
    cfg: JobConfig,
    spec: ScheduleSpec,
    running: AtomicBool,
    started: AtomicBool,
    stop: CancellationToken,
    state: Mutex<JobState>,
    next_run: Mutex<DateTime<Utc>>,
}

pub struct Scheduler {
    registry: Arc<Registry>,
    jobs: Mutex<HashMap<String, Arc<Job>>>,
    sink: Mutex<Option<Arc<dyn ResultSink>>>,
    state_store: Mutex<Option<Arc<dyn Store>>>,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            jobs: Mutex::new(HashMap::new()),
            sink: Mutex::new(None),
            state_store: Mutex::new(None),
        })
    }

    pub fn set_state_store(&self, store: Arc<dyn Store>) {
        *self.state_store.lock().unwrap_or_else(|e| e.into_inner()) = Some(store);
    }

    pub fn set_on_result(&self, sink: Arc<dyn ResultSink>) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    fn sink(&self) -> Option<Arc<dyn ResultSink>> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn state_store(&self) -> Option<Arc<dyn Store>> {
        self.state_store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Registers a job: rejects duplicates, fills numeric defaults, restores
    /// persisted state, and computes the initial next-run.
    pub fn add_job(&self, mut cfg: JobConfig) -> Result<()> {
        if cfg.name.is_empty() {
            anyhow::bail!("job name is required");
        }
        if cfg.plugin.is_empty() {
            anyhow::bail!("job plugin is required");
        }
        let spec = parse_schedule(&cfg.schedule)?;
        if cfg.timeout.is_zero() {
            cfg.timeout = DEFAULT_TIMEOUT;
        }
        if cfg.retry_backoff.is_zero() {
            cfg.retry_backoff = DEFAULT_RETRY_BACKOFF;
        }
        if cfg.retry_max.is_zero() {
            cfg.retry_max = DEFAULT_RETRY_MAX;
        }

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.contains_key(&cfg.name) {
            anyhow::bail!("job {:?} already exists", cfg.name);
        }

        let state = self.load_state(&cfg.name).unwrap_or_default();
        let job = Arc::new(Job {
            spec,
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
            next_run: Mutex::new(Utc::now()),
            state: Mutex::new(state),
            cfg,
        });
        let next = self.compute_next_run(&job, Utc::now());
        *job.next_run.lock().unwrap_or_else(|e| e.into_inner()) = next;
        jobs.insert(job.cfg.name.clone(), job);
        Ok(())
    }

    /// Spawns the dispatch loop for every job not yet started.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for job in jobs.values() {
            if job.started.swap(true, Ordering::SeqCst) {
                continue;
            }
            tokio::spawn(Arc::clone(self).run_job(cancel.clone(), Arc::clone(job)));
        }
    }

    pub fn stop(&self) {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        for job in jobs.values() {
            if job.started.swap(false, Ordering::SeqCst) {
                job.stop.cancel();
            }
        }
    }

    /// Atomic reconfiguration: stops all loops, swaps the job set, restarts.
    /// In-flight plugin calls drain to completion before their loop exits.
    pub async fn replace_jobs(
        self: &Arc<Self>,
        cancel: CancellationToken,
        configs: Vec<JobConfig>,
    ) -> Result<()> {
        {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            for job in jobs.values() {
                if job.started.swap(false, Ordering::SeqCst) {
                    job.stop.cancel();
                }
            }
            jobs.clear();
        }
        for cfg in configs {
            self.add_job(cfg)?;
        }
        self.start(cancel);
        Ok(())
    }

    pub fn list_jobs(&self) -> Vec<JobConfig> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<JobConfig> = jobs.values().map(|j| j.cfg.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn job_state(&self, name: &str) -> Option<JobState> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(name)
            .map(|j| j.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    pub fn next_run(&self, name: &str) -> Option<DateTime<Utc>> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(name)
            .map(|j| *j.next_run.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Ad-hoc single execution for the admin API. Bypasses the scheduling
    /// loop and overlap guard; the result still flows through the sink.
    pub async fn run_once(&self, plugin_name: &str, timeout: Duration) -> Result<ScanResult> {
        let plugin = self.registry.get(plugin_name)?;
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };

        let started = Utc::now();
        let begin = Instant::now();
        let cancel = CancellationToken::new();
        let mut handle = tokio::spawn({
            let plugin = Arc::clone(&plugin);
            let token = cancel.clone();
            async move { plugin.run(token).await }
        });

        let mut result = match tokio::time::timeout(timeout, &mut handle).await {
            Err(_) => {
                cancel.cancel();
                handle.abort();
                anyhow::bail!("plugin {plugin_name:?} timed out after {timeout:?}");
            }
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(plugin = plugin_name, "run-once panic recovered");
                anyhow::bail!("plugin {plugin_name:?} panicked");
            }
            Ok(Err(_)) => anyhow::bail!("plugin {plugin_name:?} task cancelled"),
            Ok(Ok(run)) => run?,
        };

        let finished = Utc::now();
        result.started_at = Some(started);
        result.finished_at = Some(finished);
        result.duration_ms = begin.elapsed().as_millis() as u64;
        if let Some(sink) = self.sink() {
            sink.on_result(result.clone());
        }
        Ok(result)
    }

    async fn run_job(self: Arc<Self>, cancel: CancellationToken, job: Arc<Job>) {
        let run_on_start = job.cfg.run_on_start
            && job
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .last_run
                .is_none();
        if run_on_start {
            self.execute_job(&cancel, &job).await;
        }

        loop {
            let next = *job.next_run.lock().unwrap_or_else(|e| e.into_inner());
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = job.stop.cancelled() => return,
                _ = tokio::time::sleep(wait) => {
                    self.execute_job(&cancel, &job).await;
                    let next = self.compute_next_run(&job, Utc::now());
                    *job.next_run.lock().unwrap_or_else(|e| e.into_inner()) = next;
                }
            }
        }
    }

    async fn execute_job(&self, cancel: &CancellationToken, job: &Job) {
        if !job.cfg.allow_overlap
            && job
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            warn!(job = %job.cfg.name, "job skipped due to overlap");
            return;
        }

        let outcome = self.execute_with_retry(cancel, job).await;
        if !job.cfg.allow_overlap {
            job.running.store(false, Ordering::SeqCst);
        }

        match outcome {
            Ok(result) => {
                self.update_state(job, result.status, None);
                if let Some(sink) = self.sink() {
                    sink.on_result(result);
                }
            }
            Err(err) => {
                error!(job = %job.cfg.name, error = %err, "job failed");
                self.update_state(job, Status::Failed, Some(err));
            }
        }
    }

    /// Runs up to `max_retries + 1` attempts, each under a fresh timeout,
    /// sleeping `min(backoff * 2^attempt, retry_max)` between attempts.
    /// Shutdown cancels pending retries.
    async fn execute_with_retry(
        &self,
        cancel: &CancellationToken,
        job: &Job,
    ) -> Result<ScanResult> {
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..=job.cfg.max_retries {
            let started = Utc::now();
            let begin = Instant::now();
            match self.run_attempt(cancel, job).await {
                Ok(mut result) => {
                    result.started_at = Some(started);
                    result.finished_at = Some(Utc::now());
                    result.duration_ms = begin.elapsed().as_millis() as u64;
                    info!(
                        job = %job.cfg.name,
                        status = %result.status,
                        duration_ms = result.duration_ms,
                        findings = result.findings.len(),
                        "job completed"
                    );
                    return Ok(result);
                }
                Err(err) => last_err = Some(err),
            }

            if attempt < job.cfg.max_retries {
                let backoff = job
                    .cfg
                    .retry_backoff
                    .saturating_mul(1u32 << attempt.min(20))
                    .min(job.cfg.retry_max);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("job failed")))
    }

    async fn run_attempt(&self, cancel: &CancellationToken, job: &Job) -> Result<ScanResult> {
        let plugin = self.registry.get(&job.cfg.plugin)?;
        let attempt_cancel = cancel.child_token();
        let mut handle = tokio::spawn({
            let plugin = Arc::clone(&plugin);
            let token = attempt_cancel.clone();
            async move { plugin.run(token).await }
        });

        match tokio::time::timeout(job.cfg.timeout, &mut handle).await {
            Err(_) => {
                attempt_cancel.cancel();
                handle.abort();
                anyhow::bail!("attempt timed out after {:?}", job.cfg.timeout)
            }
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(job = %job.cfg.name, "job panic recovered");
                anyhow::bail!("plugin panicked")
            }
            Ok(Err(_)) => anyhow::bail!("plugin task cancelled"),
            Ok(Ok(run)) => run,
        }
    }

    fn update_state(&self, job: &Job, status: Status, err: Option<anyhow::Error>) {
        let now = Utc::now();
        let snapshot = {
            let mut state = job.state.lock().unwrap_or_else(|e| e.into_inner());
            state.last_run = Some(now);
            state.last_status = Some(status);
            match err {
                Some(err) => {
                    state.last_error = Some(now);
                    state.last_error_message = err.to_string();
                    state.consecutive_failures += 1;
                }
                None => {
                    state.last_success = Some(now);
                    state.last_error_message.clear();
                    state.consecutive_failures = 0;
                }
            }
            state.clone()
        };
        self.save_state(&job.cfg.name, &snapshot);
    }

    fn load_state(&self, name: &str) -> Option<JobState> {
        let store = self.state_store()?;
        let raw = store.get(STATE_BUCKET, name).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn save_state(&self, name: &str, state: &JobState) {
        let Some(store) = self.state_store() else {
            return;
        };
        let raw = match serde_json::to_vec(state) {
            Ok(raw) => raw,
            Err(err) => {
                error!(job = name, error = %err, "encode job state failed");
                return;
            }
        };
        if let Err(err) = store.put(STATE_BUCKET, name, &raw) {
            error!(job = name, error = %err, "persist job state failed");
        }
    }

    /// Interval jobs keep their cadence across restarts: the persisted
    /// `last_run` anchors the next fire time as long as it is still in the
    /// future.
    fn compute_next_run(&self, job: &Job, now: DateTime<Utc>) -> DateTime<Utc> {
        let last_run = job
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_run;
        if let (Some(last_run), Some(interval)) = (last_run, job.spec.interval()) {
            let candidate = last_run + to_chrono(interval);
            if candidate > now {
                return candidate;
            }
        }
        job.spec.next(now)
    }
}
