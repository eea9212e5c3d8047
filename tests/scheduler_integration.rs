//! End-to-end: a real plugin scheduled through the full on-result
//! pipeline, with baselines and the result cache fed from live runs.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use arcsent::alerting;
use arcsent::config::AlertingConfig;
use arcsent::daemon::pipeline::Pipeline;
use arcsent::detect::rules::{Operator, Rule};
use arcsent::detect::{BaselineManager, Correlator, RuleEngine};
use arcsent::scanner::Registry;
use arcsent::scheduler::{JobConfig, ResultSink, Scheduler};
use arcsent::state::ResultCache;
use arcsent::storage::{results::ResultsStore, Store};

#[tokio::test]
async fn scheduled_scan_flows_through_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = arcsent::storage::open(&dir.path().join("kv"), "").unwrap();

    let registry = Arc::new(Registry::new());
    arcsent::plugins::register_builtin(&registry).unwrap();

    let baselines = Arc::new(BaselineManager::new(Arc::clone(&store)));
    let cache = Arc::new(ResultCache::new(10));
    let alerts = alerting::Engine::new(&AlertingConfig::default(), Vec::new());
    let pipeline = Pipeline::new(
        Arc::clone(&baselines),
        RuleEngine::new(vec![Rule {
            name: "disk".to_string(),
            scanner: "system.disk_usage".to_string(),
            metric: "used_pct".to_string(),
            operator: Operator::Gte,
            // Always fires, so the alert path is exercised too.
            threshold: 0.0,
            severity: arcsent::scanner::Severity::High,
            description: String::new(),
        }]),
        Correlator::new(Duration::from_secs(60), 2, Duration::from_secs(60)),
        Arc::clone(&cache),
        ResultsStore::new(Arc::clone(&store)),
        alerts,
        3,
    );

    let scheduler = Scheduler::new(Arc::clone(&registry));
    scheduler.set_state_store(Arc::clone(&store));
    scheduler.set_on_result(Arc::clone(&pipeline) as Arc<dyn ResultSink>);
    scheduler
        .add_job(JobConfig {
            name: "disk".to_string(),
            plugin: "system.disk_usage".to_string(),
            schedule: "20ms".to_string(),
            timeout: Duration::from_secs(1),
            run_on_start: true,
            ..JobConfig::default()
        })
        .unwrap();

    let cancel = CancellationToken::new();
    scheduler.start(cancel.clone());
    tokio::time::sleep(Duration::from_millis(120)).await;
    cancel.cancel();
    scheduler.stop();

    let latest = cache.latest();
    assert!(!latest.is_empty(), "expected results to be recorded");
    assert_eq!(latest[0].scanner_name, "system.disk_usage");
    assert!(latest[0].finished_at.is_some());

    // Numeric metadata learned into baselines.
    let learned = baselines.list().unwrap();
    assert!(
        learned
            .iter()
            .any(|b| b.scanner_name == "system.disk_usage" && b.metric == "used_pct"),
        "expected used_pct baseline to be updated"
    );

    // The always-on rule produced findings for every run.
    let findings = cache.findings_history();
    assert!(findings.iter().any(|f| f.category == "rule"));

    // Durable results were appended.
    let stored = ResultsStore::new(store).list().unwrap();
    assert!(!stored.is_empty());

    // Job state reflects the successful runs.
    let state = scheduler.job_state("disk").unwrap();
    assert_eq!(state.consecutive_failures, 0);
    assert!(state.last_success.is_some());
}

#[tokio::test]
async fn job_state_survives_scheduler_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = arcsent::storage::open(&dir.path().join("kv"), "").unwrap();

    let registry = Arc::new(Registry::new());
    arcsent::plugins::register_builtin(&registry).unwrap();

    let job = || JobConfig {
        name: "uptime".to_string(),
        plugin: "system.uptime".to_string(),
        schedule: "2m".to_string(),
        run_on_start: true,
        ..JobConfig::default()
    };

    // First scheduler generation runs the job once.
    {
        let scheduler = Scheduler::new(Arc::clone(&registry));
        scheduler.set_state_store(Arc::clone(&store));
        scheduler.add_job(job()).unwrap();
        let cancel = CancellationToken::new();
        scheduler.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel.cancel();
        scheduler.stop();
        assert!(scheduler.job_state("uptime").unwrap().last_run.is_some());
    }

    // Second generation restores the persisted state: run_on_start does not
    // fire again, and the next run keeps the 2m cadence.
    let scheduler = Scheduler::new(registry);
    scheduler.set_state_store(store);
    scheduler.add_job(job()).unwrap();

    let state = scheduler.job_state("uptime").unwrap();
    assert!(state.last_run.is_some(), "state should be restored");

    let next = scheduler.next_run("uptime").unwrap();
    let until = next - chrono::Utc::now();
    assert!(until > chrono::Duration::seconds(60));
    assert!(until <= chrono::Duration::seconds(120));
}
