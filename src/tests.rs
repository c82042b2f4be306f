use super::*;
use crate::channels::{ChannelError, RecipientProfile};
use crate::clock::ManualClock;
use crate::reminder::{CreateReminderRequest, ReminderStatus};
use crate::scheduler::registry::BUILTIN_HANDLERS;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::io::Write;
use std::sync::Mutex;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, from: &str, recipients: &[String], _message: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .expect("lock")
            .push((from.to_string(), recipients.to_vec()));
        Ok(())
    }
}

fn mail_config() -> MailConfig {
    MailConfig {
        host: "smtp.example.com".into(),
        port: 25,
        username: "bot@example.com".into(),
        password: "pw".into(),
        use_ssl: false,
        use_tls: false,
        sender: "bot@example.com".into(),
        default_receiver: Some("ops@example.com".into()),
    }
}

async fn runtime(
    clock: Arc<ManualClock>,
    transport: Option<Arc<RecordingTransport>>,
) -> Runtime {
    let config = AppConfig::from_lookup(|_| None).expect("default config");
    let pool = db::memory_pool().await.expect("sqlite memory");
    let keys: Arc<dyn KeyProvider> = Arc::new(KeyRing::new(1, [3u8; 32]).expect("key ring"));
    let mail = transport.map(|t| (mail_config(), t as Arc<dyn MailTransport>));
    Runtime::assemble(config, pool, clock, keys, mail).expect("assemble")
}

fn start() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

#[tokio::test]
async fn assembled_runtime_registers_builtin_handlers() {
    let rt = runtime(Arc::new(ManualClock::new(start())), None).await;
    let mut expected: Vec<String> = BUILTIN_HANDLERS.iter().map(|s| s.to_string()).collect();
    expected.sort();
    assert_eq!(rt.registry.names(), expected);
    assert!(rt.mailer.is_none());

    rt.shutdown().await;
}

#[tokio::test]
async fn manual_reminder_dispatch_sends_mail() {
    let clock = Arc::new(ManualClock::new(start()));
    let transport = Arc::new(RecordingTransport::default());
    let rt = runtime(clock.clone(), Some(transport.clone())).await;

    SqliteRecipientDirectory::new(rt.pool.clone())
        .upsert(&RecipientProfile {
            user_id: "alice".into(),
            username: "alice".into(),
            email: Some("alice@example.com".into()),
            webhook_url: None,
            im_handle: None,
        })
        .await
        .expect("upsert recipient");

    let reminder = rt
        .reminders
        .create_reminder(
            "realm-1",
            "alice",
            CreateReminderRequest {
                name: "Renew certificate".into(),
                content: "Expires on Friday".into(),
                remind_time: start() + Duration::hours(1),
                methods: vec!["email".into()],
                targets: None,
                tags: vec![],
            },
        )
        .await
        .expect("create reminder");

    rt.run_job(REMINDER_DISPATCH, "").await.expect("nothing due yet");
    assert!(transport.sent.lock().expect("lock").is_empty());

    clock.advance(Duration::hours(2));
    rt.run_job(REMINDER_DISPATCH, "").await.expect("dispatch");

    let sent = transport.sent.lock().expect("lock").clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "bot@example.com");
    assert_eq!(sent[0].1, vec!["alice@example.com".to_string()]);

    let stored = rt
        .reminders
        .get_reminder("realm-1", &reminder.id)
        .await
        .expect("reminder");
    assert_eq!(stored.status, ReminderStatus::Completed);
}

#[tokio::test]
async fn manual_run_reports_unknown_and_failing_handlers() {
    let rt = runtime(Arc::new(ManualClock::new(start())), None).await;

    let err = rt.run_job("backup_db", "").await.expect_err("unknown");
    assert!(matches!(err, AppError::NotFound(_)));

    let err = rt.run_job(URL_CHECK, "").await.expect_err("empty url");
    assert!(matches!(err, AppError::Internal(_)));
}

#[tokio::test]
async fn job_file_is_optional_but_must_parse() {
    let mut rt = runtime(Arc::new(ManualClock::new(start())), None).await;

    let dir = tempfile::tempdir().expect("tempdir");
    rt.config.jobs_file = dir.path().join("missing.yml");
    let plan = rt.plan(&rt.load_jobs().expect("missing file")).expect("plan");
    let mut names: Vec<&str> = plan.jobs.iter().map(|j| j.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec![REMINDER_DISPATCH, TASK_CHECK, EXPIRY_CHECK]);

    let path = dir.path().join("jobs.yml");
    let mut file = std::fs::File::create(&path).expect("create");
    writeln!(
        file,
        "tasks:\n  - name: ping\n    schedule: \"*/30 * * * * *\"\n    function: url_check(http://localhost:9/health)"
    )
    .expect("write");
    rt.config.jobs_file = path.clone();
    let plan = rt.plan(&rt.load_jobs().expect("load")).expect("plan");
    let ping = plan.job("ping").expect("ping planned");
    assert_eq!(ping.handler, URL_CHECK);
    assert_eq!(ping.parameters, "http://localhost:9/health");

    std::fs::write(&path, "tasks: [ {name: broken").expect("overwrite");
    assert!(rt.load_jobs().is_err());
}

#[tokio::test]
async fn send_mail_falls_back_to_default_receiver() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));
    let transport = Arc::new(RecordingTransport::default());
    let mailer = Mailer::new(&mail_config(), transport.clone(), clock);

    deliver(&mailer, "Nightly report", "All green", vec![], vec!["cc@example.com".into()])
        .await
        .expect("deliver");
    let sent = transport.sent.lock().expect("lock").clone();
    assert_eq!(
        sent[0].1,
        vec!["ops@example.com".to_string(), "cc@example.com".to_string()]
    );

    let err = deliver(&mailer, " ", "body", vec![], vec![])
        .await
        .expect_err("empty subject");
    assert!(matches!(err, AppError::Validation(_)));
}
