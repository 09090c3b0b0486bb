use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use hostwatch::agent::run_once;
use hostwatch::alerter::Dispatcher;
use hostwatch::analyzer::baseline::BaselineRecord;
use hostwatch::analyzer::trend::{DailyAggregate, TrendCheckRecord};
use hostwatch::collector::Collector;
use hostwatch::config::Config;
use hostwatch::history::RunHistory;
use hostwatch::log_watcher::SourceRecord;
use hostwatch::storage::{source_identifier, StateDir};
use hostwatch::types::{Alert, Level, MetricKind};

#[derive(Default)]
struct RecordingDispatcher {
    fail: AtomicBool,
    sent: Mutex<Vec<Alert>>,
}

impl RecordingDispatcher {
    fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn sent(&self) -> Vec<Alert> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, alert: &Alert) -> bool {
        if self.fail.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push(alert.clone());
        true
    }
}

struct Fixed(MetricKind, f64);

#[async_trait]
impl Collector for Fixed {
    fn name(&self) -> &str {
        "fixed"
    }

    fn metric(&self) -> MetricKind {
        self.0
    }

    async fn collect(&mut self) -> anyhow::Result<f64> {
        Ok(self.1)
    }
}

fn config(state_dir: &Path, targets: &[&str]) -> Config {
    let mut toml = format!(
        "[agent]\nhostname = \"test-host\"\nstate_dir = \"{}\"\n\n[logs.targets]\n",
        state_dir.display()
    );
    for t in targets {
        toml.push_str(&format!("\"{}\" = true\n", t));
    }
    Config::from_toml(&toml).unwrap()
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

/// 01:00 local time on `day`, so a run and a few hours after it share a date
fn local_morning(day: NaiveDate) -> DateTime<Utc> {
    let naive = day.and_hms_opt(1, 0, 0).unwrap();
    Local.from_local_datetime(&naive).earliest().unwrap().with_timezone(&Utc)
}

fn seed_history(state: &Path, id: &str, days: &[(NaiveDate, u64)]) {
    let entries: Vec<DailyAggregate> = days.iter().map(|&(date, line_count)| DailyAggregate { date, line_count }).collect();
    StateDir::open(state).unwrap().save("history", id, &entries).unwrap();
}

fn append_lines(path: &Path, n: usize) {
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path).unwrap();
    for i in 0..n {
        writeln!(f, "line {}", i).unwrap();
    }
}

#[tokio::test]
async fn cpu_alert_is_throttled_then_escalates() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &[]);
    let dispatcher = RecordingDispatcher::default();
    let t0 = start();

    let mut hot: Vec<Box<dyn Collector>> = vec![Box::new(Fixed(MetricKind::Cpu, 90.0))];

    let report = run_once(cfg.clone(), &mut hot, &dispatcher, t0).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    let alert = &report.dispatched[0];
    assert_eq!(alert.level, Level::Alert);
    assert_eq!(alert.reason, "level_increase");
    assert_eq!(alert.hostname, "test-host");
    assert_eq!(alert.threshold, Some(85.0));

    let report = run_once(cfg.clone(), &mut hot, &dispatcher, t0 + Duration::minutes(5)).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.suppressed, 1);

    let report = run_once(cfg.clone(), &mut hot, &dispatcher, t0 + Duration::minutes(61)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].reason, "escalation");
    assert!(report.dispatched[0].message.ends_with("(at alert for 61 min)"));

    let report = run_once(cfg.clone(), &mut hot, &dispatcher, t0 + Duration::minutes(65)).await.unwrap();
    assert!(report.dispatched.is_empty());

    // recovery is silent, and a later rise pages again immediately
    let mut cool: Vec<Box<dyn Collector>> = vec![Box::new(Fixed(MetricKind::Cpu, 10.0))];
    let report = run_once(cfg.clone(), &mut cool, &dispatcher, t0 + Duration::minutes(66)).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.suppressed, 0);

    let report = run_once(cfg.clone(), &mut hot, &dispatcher, t0 + Duration::minutes(67)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].reason, "level_increase");

    assert_eq!(dispatcher.sent().len(), 3);

    // every run leaves a usage sample; only delivered alerts are kept
    let runs = RunHistory::new(StateDir::open(dir.path()).unwrap(), cfg.history.clone());
    let usage = runs.usage().unwrap();
    assert_eq!(usage.len(), 6);
    assert_eq!(usage[5].cpu, Some(90.0));
    assert_eq!(usage[4].cpu, Some(10.0));
    let sent = runs.notifications(None).unwrap();
    let reasons: Vec<&str> = sent.iter().map(|n| n.reason.as_str()).collect();
    assert_eq!(reasons, vec!["level_increase", "escalation", "level_increase"]);
}

#[tokio::test]
async fn failed_dispatch_is_retried_next_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &[]);
    let dispatcher = RecordingDispatcher::default();
    let mut collectors: Vec<Box<dyn Collector>> = vec![Box::new(Fixed(MetricKind::Mem, 95.0))];

    dispatcher.set_failing(true);
    let report = run_once(cfg.clone(), &mut collectors, &dispatcher, start()).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert!(report.diagnostics.iter().any(|d| d.kind == "DispatchFailed" && d.subject == "mem"));

    dispatcher.set_failing(false);
    let report = run_once(cfg, &mut collectors, &dispatcher, start() + Duration::minutes(1)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].level, Level::Critical);
    assert_eq!(report.dispatched[0].reason, "level_increase");
}

#[tokio::test]
async fn log_growth_alerts_and_rotation_resets_position() {
    let state = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    let log = logs.path().join("app.log");
    let log_str = log.to_str().unwrap().to_string();
    let id = source_identifier(&log_str);

    append_lines(&log, 5);
    let cfg = config(state.path(), &[&log_str]);
    let dispatcher = RecordingDispatcher::default();
    let mut none: Vec<Box<dyn Collector>> = Vec::new();
    let t0 = start();

    // first sight only records the position
    let report = run_once(cfg.clone(), &mut none, &dispatcher, t0).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert!(report.diagnostics.is_empty());

    append_lines(&log, 150);
    let report = run_once(cfg.clone(), &mut none, &dispatcher, t0 + Duration::minutes(1)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    let alert = &report.dispatched[0];
    assert_eq!(alert.metric, MetricKind::Log);
    assert_eq!(alert.source.as_deref(), Some(id.as_str()));
    assert_eq!(alert.level, Level::Warning);
    assert_eq!(alert.value, 150.0);
    assert_eq!(alert.throttle_key(), format!("log.{}", id));

    let store = StateDir::open(state.path()).unwrap();
    let rec: SourceRecord = store.load("positions", &id).unwrap().unwrap();
    assert_eq!(rec.offset_lines, 155);

    std::fs::rename(&log, logs.path().join("app.log.1")).unwrap();
    append_lines(&log, 3);

    let report = run_once(cfg, &mut none, &dispatcher, t0 + Duration::minutes(2)).await.unwrap();
    assert!(report.dispatched.is_empty());
    let rec: SourceRecord = store.load("positions", &id).unwrap().unwrap();
    assert_eq!(rec.offset_lines, 3);
}

#[tokio::test]
async fn unavailable_sources_become_diagnostics() {
    let state = tempfile::tempdir().unwrap();
    let missing = state.path().join("nope.log");
    let missing_str = missing.to_str().unwrap().to_string();
    let cfg = config(state.path(), &[&missing_str, "systemd journal"]);
    let dispatcher = RecordingDispatcher::default();
    let mut collectors: Vec<Box<dyn Collector>> = vec![Box::new(Fixed(MetricKind::Disk, 20.0))];

    let report = run_once(cfg, &mut collectors, &dispatcher, start()).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.diagnostics.len(), 2);
    assert!(report.diagnostics.iter().all(|d| d.kind == "SourceUnavailable"));
    assert!(report.diagnostics.iter().any(|d| d.subject == missing_str));
}

#[tokio::test]
async fn corrupt_throttle_state_is_reseeded() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), &[]);
    let store = StateDir::open(dir.path()).unwrap();
    let blob = store.blob_path("throttle", "cpu");
    std::fs::create_dir_all(blob.parent().unwrap()).unwrap();
    std::fs::write(&blob, b"{ not json").unwrap();

    let dispatcher = RecordingDispatcher::default();
    let mut collectors: Vec<Box<dyn Collector>> = vec![Box::new(Fixed(MetricKind::Cpu, 99.0))];

    let report = run_once(cfg, &mut collectors, &dispatcher, start()).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.dispatched[0].reason, "level_increase");
    assert!(report.diagnostics.iter().any(|d| d.kind == "StateCorrupt"));

    // the blob was rewritten with valid state
    let reread: Option<serde_json::Value> = store.load("throttle", "cpu").unwrap();
    assert!(reread.is_some());
}

#[tokio::test]
async fn log_state_blobs_follow_each_run() {
    let state = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    let log = logs.path().join("app.log");
    let log_str = log.to_str().unwrap().to_string();
    let id = source_identifier(&log_str);
    let store = StateDir::open(state.path()).unwrap();
    let cfg = config(state.path(), &[&log_str]);
    let dispatcher = RecordingDispatcher::default();
    let mut none: Vec<Box<dyn Collector>> = Vec::new();
    let t0 = start();
    let today = t0.with_timezone(&Local).date_naive();

    let baseline = || store.load::<BaselineRecord>("baselines", &id).unwrap().map(|r| r.baseline_lines);
    let today_count = || {
        store
            .load::<Vec<DailyAggregate>>("history", &id)
            .unwrap()
            .and_then(|h| h.iter().find(|e| e.date == today).map(|e| e.line_count))
    };
    let offset = || store.load::<SourceRecord>("positions", &id).unwrap().unwrap().offset_lines;

    append_lines(&log, 5);
    run_once(cfg.clone(), &mut none, &dispatcher, t0).await.unwrap();
    assert_eq!(offset(), 5);
    assert_eq!(baseline(), None);
    assert_eq!(today_count(), None);

    append_lines(&log, 10);
    let report = run_once(cfg.clone(), &mut none, &dispatcher, t0 + Duration::minutes(1)).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(offset(), 15);
    assert_eq!(baseline(), Some(10.0));
    assert_eq!(today_count(), Some(10));

    // twice the baseline: a Warning from the baseline alone, well under log_lines
    append_lines(&log, 20);
    let report = run_once(cfg.clone(), &mut none, &dispatcher, t0 + Duration::minutes(2)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    let alert = &report.dispatched[0];
    assert_eq!(alert.metric, MetricKind::Log);
    assert_eq!(alert.level, Level::Warning);
    assert_eq!(alert.threshold, None);
    assert!(alert.message.contains("surged"), "{}", alert.message);
    assert!((baseline().unwrap() - 11.0).abs() < 1e-9);
    assert_eq!(today_count(), Some(30));

    std::fs::rename(&log, logs.path().join("app.log.1")).unwrap();
    append_lines(&log, 3);
    let report = run_once(cfg.clone(), &mut none, &dispatcher, t0 + Duration::minutes(3)).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(offset(), 3);
    assert!((baseline().unwrap() - 11.0).abs() < 1e-9);
    assert_eq!(today_count(), Some(30));

    // truncate in place, keeping the inode
    std::fs::OpenOptions::new().write(true).truncate(true).open(&log).unwrap();
    append_lines(&log, 1);
    let report = run_once(cfg, &mut none, &dispatcher, t0 + Duration::minutes(4)).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(offset(), 1);
    assert!((baseline().unwrap() - 11.0).abs() < 1e-9);
    assert_eq!(today_count(), Some(30));
}

#[tokio::test]
async fn daily_spike_pages_once_per_day() {
    let state = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    let log = logs.path().join("app.log");
    let log_str = log.to_str().unwrap().to_string();
    let id = source_identifier(&log_str);
    let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();

    let day = |back: i64| today - Duration::days(back);
    seed_history(state.path(), &id, &[(day(4), 100), (day(3), 100), (day(2), 100), (day(1), 300)]);
    append_lines(&log, 5);

    let cfg = config(state.path(), &[&log_str]);
    let dispatcher = RecordingDispatcher::default();
    let mut none: Vec<Box<dyn Collector>> = Vec::new();
    let t0 = local_morning(today);

    // undelivered, so the day is judged again on the next run
    dispatcher.set_failing(true);
    let report = run_once(cfg.clone(), &mut none, &dispatcher, t0).await.unwrap();
    assert_eq!(report.failed.len(), 1);
    dispatcher.set_failing(false);

    let mut pages = Vec::new();
    for hour in 1..=20 {
        append_lines(&log, 5);
        let report = run_once(cfg.clone(), &mut none, &dispatcher, t0 + Duration::hours(hour)).await.unwrap();
        pages.extend(report.dispatched);
    }

    assert_eq!(pages.len(), 1);
    let page = &pages[0];
    assert_eq!(page.metric, MetricKind::LogTrend);
    assert_eq!(page.level, Level::Warning);
    assert_eq!(page.value, 300.0);
    assert_eq!(page.throttle_key(), format!("log_trend.{}", id));
    assert_eq!(page.timestamp, t0 + Duration::hours(1));

    let store = StateDir::open(state.path()).unwrap();
    let check: TrendCheckRecord = store.load("trend_checks", &id).unwrap().unwrap();
    assert_eq!(check.last_evaluated, today);

    // the next day sees an ordinary day and clears the trend state silently
    let next = local_morning(today + Duration::days(1));
    append_lines(&log, 5);
    let report = run_once(cfg, &mut none, &dispatcher, next).await.unwrap();
    assert!(report.dispatched.is_empty());
    assert_eq!(report.suppressed, 0);
    let check: TrendCheckRecord = store.load("trend_checks", &id).unwrap().unwrap();
    assert_eq!(check.last_evaluated, today + Duration::days(1));
    let history: Vec<DailyAggregate> = store.load("history", &id).unwrap().unwrap();
    assert_eq!(history.iter().find(|e| e.date == today).map(|e| e.line_count), Some(100));
}

#[tokio::test]
async fn repeated_spikes_raise_an_alert() {
    let state = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    let log = logs.path().join("app.log");
    let log_str = log.to_str().unwrap().to_string();
    let id = source_identifier(&log_str);
    let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();

    let days: Vec<(NaiveDate, u64)> = (1..=7)
        .rev()
        .map(|back| (today - Duration::days(back), if back <= 3 { 200 } else { 100 }))
        .collect();
    seed_history(state.path(), &id, &days);
    append_lines(&log, 5);

    let cfg = config(state.path(), &[&log_str]);
    let dispatcher = RecordingDispatcher::default();
    let mut none: Vec<Box<dyn Collector>> = Vec::new();

    let report = run_once(cfg, &mut none, &dispatcher, local_morning(today)).await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    let alert = &report.dispatched[0];
    assert_eq!(alert.metric, MetricKind::LogTrend);
    assert_eq!(alert.level, Level::Alert);
    assert!(alert.message.contains("spiked 3 days in a row"), "{}", alert.message);
    assert!(alert.message.contains("50.0% above"), "{}", alert.message);
}

#[tokio::test]
async fn colliding_identifiers_are_reported() {
    let state = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    std::fs::create_dir(logs.path().join("a")).unwrap();
    let nested = logs.path().join("a").join("b.log");
    let flat = logs.path().join("a_b.log");
    append_lines(&nested, 1);
    append_lines(&flat, 1);
    let nested_str = nested.to_str().unwrap().to_string();
    let flat_str = flat.to_str().unwrap().to_string();
    assert_eq!(source_identifier(&nested_str), source_identifier(&flat_str));

    let cfg = config(state.path(), &[&nested_str, &flat_str]);
    let dispatcher = RecordingDispatcher::default();
    let mut none: Vec<Box<dyn Collector>> = Vec::new();

    let report = run_once(cfg, &mut none, &dispatcher, start()).await.unwrap();
    let invalid: Vec<_> = report.diagnostics.iter().filter(|d| d.kind == "ConfigInvalid").collect();
    assert_eq!(invalid.len(), 1);
    assert!(invalid[0].subject == nested_str || invalid[0].subject == flat_str);
    assert!(invalid[0].detail.contains("already used by"));
}
