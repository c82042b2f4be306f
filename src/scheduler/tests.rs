use super::jobs::{expiry_key, parse_function_call, parse_job_file, plan_jobs};
use super::registry::{BUILTIN_HANDLERS, EXPIRY_CHECK, REMINDER_DISPATCH, TASK_CHECK};
use super::*;
use crate::clock::{ManualClock, SystemClock};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

struct CountingHandler {
    calls: AtomicUsize,
    params: std::sync::Mutex<Vec<String>>,
}

impl CountingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            params: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn execute(&self, ctx: JobContext) -> AppResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.params.lock().expect("lock").push(ctx.parameters);
        Ok(())
    }
}

struct BlockingHandler {
    release: Arc<Notify>,
    started: Arc<Notify>,
}

#[async_trait]
impl JobHandler for BlockingHandler {
    async fn execute(&self, _ctx: JobContext) -> AppResult<()> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl JobHandler for FailingHandler {
    async fn execute(&self, _ctx: JobContext) -> AppResult<()> {
        Err(AppError::Transient("smtp password=hunter2 rejected".to_string()))
    }
}

fn builtin(name: &str) -> bool {
    BUILTIN_HANDLERS.contains(&name)
}

fn clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()))
}

#[test]
fn function_calls_split_name_and_parameter() {
    assert_eq!(
        parse_function_call("url_check(https://example.com/health)"),
        ("url_check".to_string(), "https://example.com/health".to_string())
    );
    assert_eq!(parse_function_call(" task_check "), ("task_check".to_string(), String::new()));
    assert_eq!(parse_function_call("task_check()"), ("task_check".to_string(), String::new()));
    assert_eq!(parse_function_call("broken)("), ("broken)(".to_string(), String::new()));
}

#[test]
fn expiry_keys_replace_spaces() {
    assert_eq!(expiry_key("nightly report"), "task:nightly_report:expiry");
}

#[test]
fn plan_reads_jobs_and_installs_defaults() {
    let file = parse_job_file(
        r#"
jobs:
  - name: health
    schedule: "*/30 * * * * *"
    function: url_check(http://localhost:8080/health)
    deadline: "2030-01-01T00:00:00Z"
  - name: dispatch
    schedule: "0 */5 * * * *"
    function: reminder_dispatch
"#,
    )
    .expect("parse");

    let plan = plan_jobs(&file, builtin).expect("plan");
    assert!(plan.warnings.is_empty(), "{:?}", plan.warnings);

    let health = plan.job("health").expect("health");
    assert_eq!(health.handler, "url_check");
    assert_eq!(health.parameters, "http://localhost:8080/health");
    assert_eq!(health.deadline, Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()));

    // dispatch covers reminder_dispatch, so only task_check and expiry are added.
    assert!(plan.job(REMINDER_DISPATCH).is_none());
    assert_eq!(plan.job(TASK_CHECK).expect("default").expression, "0 0 * * * *");
    assert!(plan.job(EXPIRY_CHECK).is_some());
    assert_eq!(plan.jobs.len(), 4);
}

#[test]
fn malformed_cron_is_fatal() {
    let file = parse_job_file(
        r#"
tasks:
  - name: bad
    schedule: "every minute"
    function: task_check
"#,
    )
    .expect("parse");
    let err = plan_jobs(&file, builtin).unwrap_err();
    assert!(matches!(err, AppError::Configuration(_)));

    let five_fields = parse_job_file("tasks:\n  - name: short\n    schedule: \"* * * * *\"\n")
        .expect("parse");
    assert!(plan_jobs(&five_fields, builtin).is_err());
}

#[test]
fn unknown_handler_is_fatal_only_when_required() {
    let optional = parse_job_file(
        "tasks:\n  - name: blog\n    schedule: \"0 0 6 * * *\"\n    function: writeBlog\n",
    )
    .expect("parse");
    let plan = plan_jobs(&optional, builtin).expect("plan");
    assert_eq!(plan.warnings.len(), 1);
    assert!(plan.job("blog").is_some());

    let required = parse_job_file(
        "tasks:\n  - name: blog\n    schedule: \"0 0 6 * * *\"\n    function: writeBlog\n    required: true\n",
    )
    .expect("parse");
    let err = plan_jobs(&required, builtin).unwrap_err();
    assert!(err.to_string().contains("writeBlog"));
}

#[test]
fn duplicate_names_and_bad_deadlines() {
    let duplicate = parse_job_file(
        "tasks:\n  - name: a\n    schedule: \"0 * * * * *\"\n    function: task_check\n  - name: a\n    schedule: \"0 * * * * *\"\n    function: task_check\n",
    )
    .expect("parse");
    assert!(plan_jobs(&duplicate, builtin).is_err());

    let deadline = parse_job_file(
        "tasks:\n  - name: a\n    schedule: \"0 * * * * *\"\n    function: task_check\n    deadline: tomorrow\n",
    )
    .expect("parse");
    let plan = plan_jobs(&deadline, builtin).expect("plan");
    assert_eq!(plan.job("a").expect("job").deadline, None);
    assert_eq!(plan.warnings.len(), 1);
}

#[test]
fn next_fire_time_has_second_precision() {
    let job = JobDefinition::new("tick", "*/15 * * * * *", "task_check", "").expect("job");
    let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 7).unwrap();
    assert_eq!(job.next_after(at).unwrap(), Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 15).unwrap());
}

#[tokio::test]
async fn runner_reports_missing_handler_and_failures() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register("fail", Arc::new(FailingHandler));
    let runner = JobRunner::new(registry, clock());
    let cancel = CancellationToken::new();

    let missing = JobDefinition::new("ghost", "0 * * * * *", "nope", "").expect("job");
    assert_eq!(runner.invoke(&missing, &cancel).await, InvocationOutcome::NoHandler);

    let failing = JobDefinition::new("fail", "0 * * * * *", "fail", "").expect("job");
    match runner.invoke(&failing, &cancel).await {
        InvocationOutcome::Failed(message) => assert!(!message.contains("hunter2")),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn same_job_never_runs_twice_at_once() {
    let registry = Arc::new(HandlerRegistry::new());
    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    registry.register(
        "slow",
        Arc::new(BlockingHandler {
            release: release.clone(),
            started: started.clone(),
        }),
    );
    let counter = CountingHandler::new();
    registry.register("fast", counter.clone());

    let runner = JobRunner::new(registry, clock());
    let cancel = CancellationToken::new();
    let slow = Arc::new(JobDefinition::new("slow", "0 * * * * *", "slow", "").expect("job"));

    let first = {
        let runner = runner.clone();
        let slow = slow.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.invoke(&slow, &cancel).await })
    };
    started.notified().await;

    assert_eq!(runner.invoke(&slow, &cancel).await, InvocationOutcome::Busy);

    // A different job is not held back.
    let fast = JobDefinition::new("fast", "0 * * * * *", "fast", "p").expect("job");
    assert_eq!(runner.invoke(&fast, &cancel).await, InvocationOutcome::Completed);

    release.notify_one();
    assert_eq!(first.await.expect("join"), InvocationOutcome::Completed);
    assert_eq!(runner.invoke(&fast, &cancel).await, InvocationOutcome::Completed);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn slow_handler_is_abandoned_after_timeout() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(
        "stuck",
        Arc::new(BlockingHandler {
            release: Arc::new(Notify::new()),
            started: Arc::new(Notify::new()),
        }),
    );
    let runner = JobRunner::new(registry, clock()).with_handler_timeout(Duration::from_millis(50));
    let job = JobDefinition::new("stuck", "0 * * * * *", "stuck", "").expect("job");
    let cancel = CancellationToken::new();

    assert_eq!(runner.invoke(&job, &cancel).await, InvocationOutcome::TimedOut);
    // The guard is released, so the next tick runs again.
    assert_eq!(runner.invoke(&job, &cancel).await, InvocationOutcome::TimedOut);
}

#[tokio::test]
async fn expiry_watcher_publishes_passed_deadlines() {
    let store: Arc<dyn ExpiryStore> = Arc::new(InMemoryExpiryStore::new());
    let watcher = ExpiryWatcher::new(store.clone(), clock());
    let mut events = watcher.subscribe();

    let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
    watcher
        .record_deadline("nightly report", now - ChronoDuration::minutes(1))
        .await
        .expect("record");
    watcher
        .record_deadline("later", now + ChronoDuration::hours(1))
        .await
        .expect("record");

    assert_eq!(watcher.check(now).await.expect("check"), 1);
    let event = events.recv().await.expect("event");
    assert_eq!(event.channel, EXPIRY_CHANNEL);
    assert_eq!(event.job_name, "nightly_report");

    assert_eq!(store.keys("task:").await.expect("keys"), vec!["task:later:expiry".to_string()]);
    assert_eq!(watcher.check(now).await.expect("check again"), 0);
}

#[tokio::test]
async fn expiry_without_subscribers_still_clears_key() {
    let store: Arc<dyn ExpiryStore> = Arc::new(InMemoryExpiryStore::new());
    let watcher = ExpiryWatcher::new(store.clone(), clock());
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
    watcher.record_deadline("once", now).await.expect("record");

    assert_eq!(watcher.check(now).await.expect("check"), 1);
    assert!(store.get("task:once:expiry").await.expect("get").is_none());
}

#[tokio::test]
async fn scheduler_fires_jobs_and_stops_on_cancel() {
    let registry = Arc::new(HandlerRegistry::new());
    let counter = CountingHandler::new();
    registry.register("tick", counter.clone());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let plan = JobPlan {
        jobs: vec![JobDefinition::new("every-second", "* * * * * *", "tick", "x").expect("job")],
        warnings: Vec::new(),
    };
    let runner = JobRunner::new(registry, clock.clone());
    let scheduler = Scheduler::new(plan, runner, clock).with_shutdown_grace(Duration::from_secs(1));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(scheduler.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(2500)).await;
    cancel.cancel();
    handle.await.expect("scheduler task");

    let calls = counter.calls.load(Ordering::SeqCst);
    assert!(calls >= 1, "expected at least one tick, saw {}", calls);
    assert!(counter.params.lock().expect("lock").iter().all(|p| p == "x"));
}

#[tokio::test]
async fn deadlines_are_recorded_at_startup() {
    let file = parse_job_file(
        "tasks:\n  - name: report run\n    schedule: \"0 0 * * * *\"\n    function: task_check\n    deadline: \"2030-01-01T00:00:00Z\"\n",
    )
    .expect("parse");
    let plan = plan_jobs(&file, builtin).expect("plan");
    let clock = clock();
    let scheduler = Scheduler::new(plan, JobRunner::new(Arc::new(HandlerRegistry::new()), clock.clone()), clock.clone());

    let store: Arc<dyn ExpiryStore> = Arc::new(InMemoryExpiryStore::new());
    let watcher = ExpiryWatcher::new(store.clone(), clock);
    scheduler.record_deadlines(&watcher).await.expect("record");

    assert_eq!(
        store.get("task:report_run:expiry").await.expect("get"),
        Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap().timestamp())
    );
}
