use crate::channels::{
    ChannelAdapter, ChannelError, DeliveryMethod, DeliveryOutcome, RecipientProfile,
};
use crate::clock::Clock;
use crate::config::parse_flag;
use crate::error::{AppError, AppResult};
use crate::reminder::Reminder;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

const DEFAULT_SMTP_PORT: u16 = 587;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SMTP settings read from the `MAIL_*` environment block.
#[derive(Clone, PartialEq, Eq)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_ssl: bool,
    pub use_tls: bool,
    pub sender: String,
    /// Used when a message names no recipient of its own.
    pub default_receiver: Option<String>,
}

impl fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("use_ssl", &self.use_ssl)
            .field("use_tls", &self.use_tls)
            .field("sender", &self.sender)
            .field("default_receiver", &self.default_receiver)
            .finish()
    }
}

impl MailConfig {
    pub fn from_env() -> AppResult<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `Ok(None)` when `MAIL_SERVER` is unset: email delivery is simply not
    /// configured. A server without credentials is an error.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let Some(host) = non_empty("MAIL_SERVER") else {
            return Ok(None);
        };

        let port = match non_empty("MAIL_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| AppError::configuration(format!("Invalid MAIL_PORT: {}", raw)))?,
            None => DEFAULT_SMTP_PORT,
        };

        let username = non_empty("MAIL_USERNAME").ok_or_else(|| {
            AppError::configuration("MAIL_USERNAME environment variable is required")
        })?;
        let password = lookup("MAIL_PASSWORD").filter(|v| !v.is_empty()).ok_or_else(|| {
            AppError::configuration("MAIL_PASSWORD environment variable is required")
        })?;

        Ok(Some(Self {
            host,
            port,
            sender: non_empty("MAIL_SENDER").unwrap_or_else(|| username.clone()),
            username,
            password,
            use_ssl: parse_flag(lookup("MAIL_USE_SSL").as_deref(), false),
            use_tls: parse_flag(lookup("MAIL_USE_TLS").as_deref(), true),
            default_receiver: non_empty("MAIL_RECEIVER"),
        }))
    }
}

/// Hands a rendered message to a mail server.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, from: &str, recipients: &[String], message: &str) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub date: DateTime<Utc>,
    pub message_id: String,
}

impl EmailMessage {
    /// RFC 5322 text with CRLF line endings. Non-ASCII subjects use RFC 2047
    /// base64 encoded words.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 512);
        push_header(&mut out, "From", &self.from);
        push_header(&mut out, "To", &self.to.join(", "));
        if !self.cc.is_empty() {
            push_header(&mut out, "Cc", &self.cc.join(", "));
        }
        push_header(&mut out, "Subject", &encode_header_value(&self.subject));
        push_header(&mut out, "Date", &self.date.to_rfc2822());
        push_header(&mut out, "Message-ID", &self.message_id);
        push_header(&mut out, "MIME-Version", "1.0");
        push_header(&mut out, "Content-Type", "text/plain; charset=UTF-8");
        push_header(&mut out, "Content-Transfer-Encoding", "8bit");
        out.push_str("\r\n");
        out.push_str(&normalize_newlines(&self.body));
        if !out.ends_with("\r\n") {
            out.push_str("\r\n");
        }
        out
    }

    pub fn recipients(&self) -> Vec<String> {
        self.to.iter().chain(self.cc.iter()).cloned().collect()
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    // Header injection guard: a value never spans lines.
    out.push_str(&value.replace(['\r', '\n'], " "));
    out.push_str("\r\n");
}

pub fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Fills in sender and default receiver before handing messages to the
/// transport.
#[derive(Clone)]
pub struct Mailer {
    sender: String,
    default_receiver: Option<String>,
    transport: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,
}

impl Mailer {
    pub fn new(config: &MailConfig, transport: Arc<dyn MailTransport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sender: config.sender.clone(),
            default_receiver: config.default_receiver.clone(),
            transport,
            clock,
        }
    }

    /// Builds a message addressed to `to`, or to the default receiver when
    /// `to` is empty.
    pub fn compose(
        &self,
        subject: &str,
        body: &str,
        to: Vec<String>,
        cc: Vec<String>,
    ) -> Result<EmailMessage, ChannelError> {
        if subject.trim().is_empty() {
            return Err(ChannelError::permanent("email subject is required"));
        }
        if body.trim().is_empty() {
            return Err(ChannelError::permanent("email body is required"));
        }
        let to = if to.is_empty() {
            match &self.default_receiver {
                Some(default) => vec![default.clone()],
                None => {
                    return Err(ChannelError::permanent(
                        "no recipients specified and no default receiver configured",
                    ))
                }
            }
        } else {
            to
        };

        let domain = self.sender.rsplit('@').next().unwrap_or("localhost");
        Ok(EmailMessage {
            from: self.sender.clone(),
            to,
            cc,
            subject: subject.to_string(),
            body: body.to_string(),
            date: self.clock.now(),
            message_id: format!("<{}@{}>", uuid::Uuid::new_v4(), domain),
        })
    }

    pub async fn send(&self, message: &EmailMessage) -> Result<(), ChannelError> {
        self.transport
            .send(&message.from, &message.recipients(), &message.render())
            .await
    }
}

/// Email delivery. The recipient's address goes to `To`; addresses found in
/// the reminder's targets are copied in `Cc`.
pub struct EmailAdapter {
    mailer: Mailer,
}

impl EmailAdapter {
    pub fn new(mailer: Mailer) -> Self {
        Self { mailer }
    }

    fn body(&self, reminder: &Reminder, recipient: &RecipientProfile) -> String {
        let name = if recipient.username.trim().is_empty() {
            recipient.user_id.as_str()
        } else {
            recipient.username.as_str()
        };
        format!(
            "Hello {},\n\nThis is your scheduled reminder:\n\n\
             Title: {}\n\
             Content: {}\n\
             Scheduled Time: {}\n\
             Tags: {}\n\
             Notification Methods: {}\n\
             Targets: {}\n\n\
             ---\n\
             Sent at {}",
            name,
            reminder.name,
            reminder.content,
            reminder.remind_time.format(TIME_FORMAT),
            reminder.tags.join(", "),
            reminder.methods.join(", "),
            reminder.targets.as_deref().unwrap_or(""),
            self.mailer.clock.now().format(TIME_FORMAT),
        )
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Email
    }

    async fn send(&self, reminder: &Reminder, recipient: &RecipientProfile) -> DeliveryOutcome {
        let Some(address) = recipient
            .email
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
        else {
            return DeliveryOutcome::Skipped("no-address".to_string());
        };

        let cc: Vec<String> = target_addresses(reminder.targets.as_deref())
            .into_iter()
            .filter(|a| !a.eq_ignore_ascii_case(address))
            .collect();

        let subject = format!("🔔 Reminder: {}", reminder.name);
        let message = match self.mailer.compose(
            &subject,
            &self.body(reminder, recipient),
            vec![address.to_string()],
            cc,
        ) {
            Ok(message) => message,
            Err(err) => return DeliveryOutcome::Failed(err),
        };

        match self.mailer.send(&message).await {
            Ok(()) => {
                log::info!("Sent reminder email for '{}' to {}", reminder.id, address);
                DeliveryOutcome::Delivered
            }
            Err(err) => DeliveryOutcome::Failed(err),
        }
    }
}

/// Email-looking entries of a comma separated target list, de-duplicated.
pub fn target_addresses(targets: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for part in targets.unwrap_or("").split(',') {
        let candidate = part.trim();
        if !looks_like_address(candidate) {
            continue;
        }
        if !out.iter().any(|a| a.eq_ignore_ascii_case(candidate)) {
            out.push(candidate.to_string());
        }
    }
    out
}

fn looks_like_address(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !value.chars().any(|c| c.is_whitespace() || c == '<' || c == '>')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::reminder::ReminderStatus;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, Vec<String>, String)>>,
        fail_with: Option<ChannelError>,
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(&self, from: &str, recipients: &[String], message: &str) -> Result<(), ChannelError> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            self.sent
                .lock()
                .expect("lock")
                .push((from.to_string(), recipients.to_vec(), message.to_string()));
            Ok(())
        }
    }

    fn config() -> MailConfig {
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

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()))
    }

    fn reminder(targets: Option<&str>) -> Reminder {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        Reminder {
            id: "rem-1".into(),
            realm_id: "r1".into(),
            name: "Stand-up".into(),
            content: "Daily sync".into(),
            remind_time: at,
            status: ReminderStatus::Pending,
            methods: vec!["email".into()],
            targets: targets.map(str::to_string),
            tags: vec!["work".into()],
            created_by: "u1".into(),
            created_at: at,
            updated_by: "u1".into(),
            updated_at: at,
        }
    }

    fn recipient(email: Option<&str>) -> RecipientProfile {
        RecipientProfile {
            user_id: "u1".into(),
            username: "alice".into(),
            email: email.map(str::to_string),
            webhook_url: None,
            im_handle: None,
        }
    }

    #[test]
    fn config_requires_credentials_once_server_is_set() {
        let env = |pairs: &[(&str, &str)]| {
            let map: HashMap<String, String> = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            move |key: &str| map.get(key).cloned()
        };

        assert_eq!(MailConfig::from_lookup(env(&[])).expect("unset"), None);

        let err = MailConfig::from_lookup(env(&[("MAIL_SERVER", "smtp.example.com")]))
            .expect_err("missing username");
        assert!(matches!(err, AppError::Configuration(_)));

        let loaded = MailConfig::from_lookup(env(&[
            ("MAIL_SERVER", "smtp.example.com"),
            ("MAIL_USERNAME", "bot@example.com"),
            ("MAIL_PASSWORD", "secret"),
            ("MAIL_RECEIVER", "ops@example.com"),
        ]))
        .expect("valid")
        .expect("configured");
        assert_eq!(loaded.port, 587);
        assert!(loaded.use_tls);
        assert!(!loaded.use_ssl);
        assert_eq!(loaded.sender, "bot@example.com");
        assert_eq!(loaded.default_receiver.as_deref(), Some("ops@example.com"));
        assert!(!format!("{:?}", loaded).contains("secret"));

        let err = MailConfig::from_lookup(env(&[
            ("MAIL_SERVER", "smtp.example.com"),
            ("MAIL_PORT", "smtp"),
        ]))
        .expect_err("bad port");
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn render_uses_crlf_and_encodes_subject() {
        let message = EmailMessage {
            from: "bot@example.com".into(),
            to: vec!["a@example.com".into()],
            cc: vec!["b@example.com".into(), "c@example.com".into()],
            subject: "🔔 Reminder: Café".into(),
            body: "line one\nline two".into(),
            date: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            message_id: "<id@example.com>".into(),
        };
        let text = message.render();
        assert!(text.starts_with("From: bot@example.com\r\nTo: a@example.com\r\n"));
        assert!(text.contains("Cc: b@example.com, c@example.com\r\n"));
        assert!(text.contains("Subject: =?UTF-8?B?"));
        assert!(text.contains("MIME-Version: 1.0\r\n"));
        assert!(text.contains("\r\n\r\nline one\r\nline two\r\n"));
        assert!(!text.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn header_values_cannot_inject_lines() {
        let message = EmailMessage {
            from: "bot@example.com".into(),
            to: vec!["a@example.com".into()],
            cc: Vec::new(),
            subject: "hi\r\nBcc: evil@example.com".into(),
            body: "x".into(),
            date: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            message_id: "<id@example.com>".into(),
        };
        assert!(!message.render().contains("\r\nBcc:"));
    }

    #[test]
    fn compose_falls_back_to_default_receiver() {
        let mailer = Mailer::new(&config(), Arc::new(RecordingTransport::default()), clock());
        let message = mailer
            .compose("Test", "Body", Vec::new(), Vec::new())
            .expect("compose");
        assert_eq!(message.to, vec!["ops@example.com"]);
        assert!(message.message_id.ends_with("@example.com>"));

        let mut no_default = config();
        no_default.default_receiver = None;
        let mailer = Mailer::new(&no_default, Arc::new(RecordingTransport::default()), clock());
        assert!(mailer.compose("Test", "Body", Vec::new(), Vec::new()).is_err());
    }

    #[tokio::test]
    async fn adapter_skips_recipients_without_email() {
        let transport = Arc::new(RecordingTransport::default());
        let adapter = EmailAdapter::new(Mailer::new(&config(), transport.clone(), clock()));
        let outcome = adapter.send(&reminder(None), &recipient(None)).await;
        assert_eq!(outcome, DeliveryOutcome::Skipped("no-address".into()));
        assert!(transport.sent.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn adapter_sends_to_recipient_and_copies_targets() {
        let transport = Arc::new(RecordingTransport::default());
        let adapter = EmailAdapter::new(Mailer::new(&config(), transport.clone(), clock()));
        let outcome = adapter
            .send(
                &reminder(Some("team@example.com, alice@example.com, #general")),
                &recipient(Some("alice@example.com")),
            )
            .await;
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let sent = transport.sent.lock().expect("lock");
        let (from, recipients, text) = &sent[0];
        assert_eq!(from, "bot@example.com");
        assert_eq!(recipients, &vec!["alice@example.com".to_string(), "team@example.com".to_string()]);
        assert!(text.contains("To: alice@example.com\r\n"));
        assert!(text.contains("Cc: team@example.com\r\n"));
        assert!(text.contains("Hello alice,"));
        assert!(text.contains("Scheduled Time: 2024-05-01 09:00:00"));
    }

    #[tokio::test]
    async fn adapter_reports_transport_failures() {
        let transport = Arc::new(RecordingTransport {
            fail_with: Some(ChannelError::transient("421 try later")),
            ..Default::default()
        });
        let adapter = EmailAdapter::new(Mailer::new(&config(), transport, clock()));
        let outcome = adapter
            .send(&reminder(None), &recipient(Some("alice@example.com")))
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Failed(err) if err.is_transient()));
    }

    #[test]
    fn targets_keep_only_addresses() {
        assert_eq!(
            target_addresses(Some("a@example.com, slack:#ops ,A@example.com, b@x.io")),
            vec!["a@example.com", "b@x.io"]
        );
        assert!(target_addresses(None).is_empty());
    }
}
