use crate::channels::email::{MailConfig, MailTransport};
use crate::channels::ChannelError;
use crate::error::{AppError, AppResult};
use crate::security::redact_sensitive_text;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::native_tls;
use zeroize::Zeroizing;

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// How the session is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    Plain,
    /// TLS from the first byte (`MAIL_USE_SSL`, usually port 465).
    Implicit,
    /// Plain greeting upgraded with `STARTTLS` (`MAIL_USE_TLS`, usually 587).
    StartTls,
}

impl SmtpSecurity {
    pub fn from_config(config: &MailConfig) -> Self {
        if config.use_ssl {
            Self::Implicit
        } else if config.use_tls {
            Self::StartTls
        } else {
            Self::Plain
        }
    }
}

trait MailIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> MailIo for T {}

/// SMTP client: EHLO, optional STARTTLS, AUTH PLAIN, MAIL/RCPT/DATA, QUIT.
///
/// With STARTTLS configured, a server that does not offer the upgrade is an
/// error; the session never falls back to plain text.
pub struct SmtpTransport {
    host: String,
    port: u16,
    username: String,
    password: Zeroizing<String>,
    helo_name: String,
    io_timeout: Duration,
    security: SmtpSecurity,
    extra_roots: Vec<native_tls::Certificate>,
}

impl SmtpTransport {
    pub fn new(config: &MailConfig) -> AppResult<Self> {
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password: Zeroizing::new(config.password.clone()),
            helo_name: "localhost".to_string(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            security: SmtpSecurity::from_config(config),
            extra_roots: Vec::new(),
        })
    }

    pub fn with_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Trusts an extra PEM certificate besides the system roots, for relays
    /// signed by a private CA.
    pub fn with_root_certificate(mut self, pem: &[u8]) -> AppResult<Self> {
        let certificate = native_tls::Certificate::from_pem(pem).map_err(|e| {
            AppError::configuration(format!("Invalid SMTP root certificate: {}", e))
        })?;
        self.extra_roots.push(certificate);
        Ok(self)
    }

    pub fn security(&self) -> SmtpSecurity {
        self.security
    }

    /// Opens a session, greets and authenticates, then quits. Used to check
    /// configuration without sending anything.
    pub async fn test_connection(&self) -> Result<(), ChannelError> {
        let mut session = self.open().await?;
        session.quit().await;
        Ok(())
    }

    fn connector(&self) -> Result<tokio_native_tls::TlsConnector, ChannelError> {
        let mut builder = native_tls::TlsConnector::builder();
        for root in &self.extra_roots {
            builder.add_root_certificate(root.clone());
        }
        builder
            .build()
            .map(tokio_native_tls::TlsConnector::from)
            .map_err(|e| ChannelError::permanent(format!("failed to set up TLS: {}", e)))
    }

    async fn handshake(&self, stream: Box<dyn MailIo>) -> Result<Box<dyn MailIo>, ChannelError> {
        let connector = self.connector()?;
        let tls = timeout(self.io_timeout, connector.connect(&self.host, stream))
            .await
            .map_err(|_| ChannelError::transient(format!("timed out negotiating TLS with {}", self.host)))?
            .map_err(|e| {
                ChannelError::permanent(format!("TLS handshake with {} failed: {}", self.host, e))
            })?;
        Ok(Box::new(tls))
    }

    async fn open(&self) -> Result<Session, ChannelError> {
        let tcp = timeout(self.io_timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| {
                ChannelError::transient(format!(
                    "timed out connecting to {}:{}",
                    self.host, self.port
                ))
            })?
            .map_err(|e| {
                ChannelError::transient(format!(
                    "failed to connect to {}:{}: {}",
                    self.host, self.port, e
                ))
            })?;

        let mut stream: Box<dyn MailIo> = Box::new(tcp);
        if self.security == SmtpSecurity::Implicit {
            stream = self.handshake(stream).await?;
        }

        let mut session = Session {
            stream: BufReader::new(stream),
            io_timeout: self.io_timeout,
        };
        session.expect("greeting", &[220]).await?;
        let ehlo = format!("EHLO {}", self.helo_name);
        let capabilities = session.command(&ehlo, "EHLO", &[250]).await?;

        if self.security == SmtpSecurity::StartTls {
            if !offers_extension(&capabilities, "STARTTLS") {
                return Err(ChannelError::permanent(format!(
                    "SMTP server {} does not offer STARTTLS",
                    self.host
                )));
            }
            session.command("STARTTLS", "STARTTLS", &[220]).await?;
            let plain = session.stream.into_inner();
            session.stream = BufReader::new(self.handshake(plain).await?);
            session.command(&ehlo, "EHLO", &[250]).await?;
        }

        if !self.username.is_empty() {
            let token = Zeroizing::new(STANDARD.encode(format!(
                "\0{}\0{}",
                self.username,
                self.password.as_str()
            )));
            session
                .command(&format!("AUTH PLAIN {}", token.as_str()), "AUTH", &[235])
                .await?;
        }
        Ok(session)
    }
}

fn offers_extension(capabilities: &str, keyword: &str) -> bool {
    capabilities
        .split_whitespace()
        .any(|word| word.eq_ignore_ascii_case(keyword))
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, from: &str, recipients: &[String], message: &str) -> Result<(), ChannelError> {
        if recipients.is_empty() {
            return Err(ChannelError::permanent("no recipients"));
        }

        let mut session = self.open().await?;
        session
            .command(&format!("MAIL FROM:<{}>", from), "MAIL FROM", &[250])
            .await?;
        for recipient in recipients {
            session
                .command(&format!("RCPT TO:<{}>", recipient), "RCPT TO", &[250, 251])
                .await?;
        }
        session.command("DATA", "DATA", &[354]).await?;
        session.write(&dot_stuff(message)).await?;
        session.write(".\r\n").await?;
        session.expect("message body", &[250]).await?;
        session.quit().await;

        log::debug!(
            "SMTP accepted message for {} recipient(s) via {}:{}",
            recipients.len(),
            self.host,
            self.port
        );
        Ok(())
    }
}

struct Session {
    stream: BufReader<Box<dyn MailIo>>,
    io_timeout: Duration,
}

impl Session {
    async fn command(&mut self, line: &str, label: &str, expected: &[u16]) -> Result<String, ChannelError> {
        self.write(&format!("{}\r\n", line)).await?;
        self.expect(label, expected).await
    }

    async fn write(&mut self, data: &str) -> Result<(), ChannelError> {
        timeout(self.io_timeout, self.stream.write_all(data.as_bytes()))
            .await
            .map_err(|_| ChannelError::transient("timed out writing to SMTP server"))?
            .map_err(|e| ChannelError::transient(format!("failed to write to SMTP server: {}", e)))
    }

    async fn expect(&mut self, label: &str, expected: &[u16]) -> Result<String, ChannelError> {
        let (code, text) = self.read_reply().await?;
        if expected.contains(&code) {
            return Ok(text);
        }
        let message = redact_sensitive_text(&format!("SMTP {} rejected: {} {}", label, code, text));
        Err(classify_reply(code, message))
    }

    // Multi-line replies use `NNN-` on every line but the last.
    async fn read_reply(&mut self) -> Result<(u16, String), ChannelError> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = timeout(self.io_timeout, self.stream.read_line(&mut line))
                .await
                .map_err(|_| ChannelError::transient("timed out waiting for SMTP reply"))?
                .map_err(|e| ChannelError::transient(format!("failed to read SMTP reply: {}", e)))?;
            if read == 0 {
                return Err(ChannelError::transient("SMTP server closed the connection"));
            }

            let line = line.trim_end_matches(['\r', '\n']);
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| ChannelError::permanent(format!("malformed SMTP reply: {}", line)))?;
            lines.push(line.get(4..).unwrap_or("").to_string());

            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok((code, lines.join(" ")));
            }
        }
    }

    async fn quit(&mut self) {
        if let Err(err) = self.command("QUIT", "QUIT", &[221]).await {
            log::debug!("SMTP QUIT failed: {}", err);
        }
    }
}

fn classify_reply(code: u16, message: String) -> ChannelError {
    if (400..500).contains(&code) {
        ChannelError::transient(message)
    } else {
        ChannelError::permanent(message)
    }
}

/// Escapes lines starting with '.' and guarantees a trailing CRLF, ready to
/// be followed by the `.` terminator.
fn dot_stuff(message: &str) -> String {
    let body = message.strip_suffix("\r\n").unwrap_or(message);
    let mut out = String::with_capacity(body.len() + 16);
    for line in body.split("\r\n") {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}
