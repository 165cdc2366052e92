//! End-of-execution mail to a configuration's active recipients.
//!
//! Speaks SMTP to a relay, upgraded with STARTTLS or wrapped in TLS from the
//! first byte. `AUTH PLAIN` is only ever sent inside TLS.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use rustls::crypto::ring::default_provider;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, ServerName};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::config::{SmtpConfig, SmtpTls};
use crate::model::Execution;
use crate::retry::{self, Backoff, Retryable};
use crate::truncate_chars;

/// Trust store used when `smtp.ca_file` is unset.
const SYSTEM_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";

const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("SMTP relay is not configured")]
    NotConfigured,

    #[error("SMTP server replied {code}: {text}")]
    Rejected { code: u16, text: String },

    #[error("SMTP connection closed unexpectedly")]
    Closed,

    #[error("SMTP session timed out after {0:?}")]
    Timeout(Duration),

    #[error("SMTP transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("SMTP framing error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("SMTP TLS setup failed: {0}")]
    Tls(String),

    #[error("refusing to send SMTP credentials over an unencrypted session")]
    InsecureAuth,
}

impl Retryable for NotifyError {
    fn is_transient(&self) -> bool {
        match self {
            NotifyError::Rejected { code, .. } => (400..500).contains(code),
            NotifyError::Closed | NotifyError::Timeout(_) | NotifyError::Transport(_) => true,
            NotifyError::Codec(_)
            | NotifyError::NotConfigured
            | NotifyError::Tls(_)
            | NotifyError::InsecureAuth => false,
        }
    }
}

/// A composed message, ready for transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
}

impl Notification {
    pub fn compose(
        configuration_name: &str,
        execution: &Execution,
        recipients: &[String],
        excerpt_chars: usize,
    ) -> Self {
        let excerpt = truncate_chars(&execution.report, excerpt_chars);
        let ellipsis = if excerpt.len() < execution.report.len() { "..." } else { "" };
        let body = format!(
            "The test '{configuration_name}' has finished.\n\
             Status: {} ({})\n\n\
             Report:\n{excerpt}{ellipsis}\n",
            execution.status.label(),
            execution.status,
        );
        Self {
            subject: format!("Test finished: {configuration_name}"),
            body,
            recipients: recipients.to_vec(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Mail a summary of `execution` to `recipients`.
    async fn notify(
        &self,
        execution: &Execution,
        configuration_name: &str,
        recipients: &[String],
    ) -> Result<(), NotifyError>;
}

#[derive(Clone)]
pub struct SmtpNotifier {
    host: Option<String>,
    port: u16,
    tls: SmtpTls,
    connector: Option<TlsConnector>,
    sender: String,
    credentials: Option<(String, String)>,
    timeout: Duration,
    excerpt_chars: usize,
    backoff: Backoff,
}

impl SmtpNotifier {
    /// Fails when TLS is requested and the trust store cannot be loaded.
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let credentials = match (&config.username, &config.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        let host = config.host.clone().filter(|h| !h.is_empty());
        let connector = match (&host, config.tls) {
            (Some(_), SmtpTls::Starttls | SmtpTls::Implicit) => {
                Some(tls_connector(config.ca_file.as_deref())?)
            }
            _ => None,
        };
        if host.is_some() && config.tls == SmtpTls::None && credentials.is_some() {
            warn!("smtp.tls is \"none\": credentials will not be sent and deliveries will fail");
        }
        Ok(Self {
            host,
            port: config.port,
            tls: config.tls,
            connector,
            sender: config.sender.clone(),
            credentials,
            timeout: Duration::from_secs(config.timeout_secs),
            excerpt_chars: config.excerpt_chars,
            backoff: Backoff::new(config.max_attempts, Duration::from_millis(config.backoff_ms)),
        })
    }

    async fn deliver(&self, host: &str, message: &Notification) -> Result<(), NotifyError> {
        match tokio::time::timeout(self.timeout, self.session(host, message)).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(self.timeout)),
        }
    }

    async fn session(&self, host: &str, message: &Notification) -> Result<(), NotifyError> {
        let stream = TcpStream::connect((host, self.port)).await?;

        match (self.tls, &self.connector) {
            (SmtpTls::None, _) => {
                let mut smtp = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
                expect(&mut smtp, &[220]).await?;
                self.ehlo(&mut smtp).await?;
                self.transaction(&mut smtp, message, false).await
            }
            (SmtpTls::Implicit, Some(connector)) => {
                let stream = connector.connect(server_name(host)?, stream).await?;
                let mut smtp = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
                expect(&mut smtp, &[220]).await?;
                self.ehlo(&mut smtp).await?;
                self.transaction(&mut smtp, message, true).await
            }
            (SmtpTls::Starttls, Some(connector)) => {
                let mut plain = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
                expect(&mut plain, &[220]).await?;
                self.ehlo(&mut plain).await?;
                command(&mut plain, "STARTTLS", &[220]).await?;

                let parts = plain.into_parts();
                if !parts.read_buf.is_empty() {
                    return Err(NotifyError::Tls("server sent data ahead of the TLS handshake".into()));
                }
                let stream = connector.connect(server_name(host)?, parts.io).await?;
                let mut smtp = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
                // The pre-TLS EHLO reply is discarded (RFC 3207 §4.2).
                self.ehlo(&mut smtp).await?;
                self.transaction(&mut smtp, message, true).await
            }
            (SmtpTls::Starttls | SmtpTls::Implicit, None) => {
                Err(NotifyError::Tls("no TLS connector was built".into()))
            }
        }
    }

    async fn ehlo<S>(&self, smtp: &mut Framed<S, LinesCodec>) -> Result<(), NotifyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let helo_domain = self.sender.rsplit('@').next().unwrap_or("localhost");
        command(smtp, &format!("EHLO {helo_domain}"), &[250]).await
    }

    /// AUTH (if configured), envelope, DATA, QUIT.
    async fn transaction<S>(
        &self,
        smtp: &mut Framed<S, LinesCodec>,
        message: &Notification,
        secure: bool,
    ) -> Result<(), NotifyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some((user, password)) = &self.credentials {
            if !secure {
                let _ = send_line(smtp, "QUIT").await;
                return Err(NotifyError::InsecureAuth);
            }
            let token = BASE64.encode(format!("\0{user}\0{password}"));
            command(smtp, &format!("AUTH PLAIN {token}"), &[235]).await?;
        }

        command(smtp, &format!("MAIL FROM:<{}>", self.sender), &[250]).await?;
        for rcpt in &message.recipients {
            command(smtp, &format!("RCPT TO:<{rcpt}>"), &[250, 251]).await?;
        }
        command(smtp, "DATA", &[354]).await?;

        for line in render(&self.sender, message).lines() {
            // Dot-stuffing.
            if line.starts_with('.') {
                send_line(smtp, &format!(".{line}")).await?;
            } else {
                send_line(smtp, line).await?;
            }
        }
        command(smtp, ".", &[250]).await?;

        if let Err(e) = command(smtp, "QUIT", &[221]).await {
            debug!(error = %e, "SMTP QUIT not acknowledged");
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(
        &self,
        execution: &Execution,
        configuration_name: &str,
        recipients: &[String],
    ) -> Result<(), NotifyError> {
        if recipients.is_empty() {
            info!(execution_id = execution.id, "no active recipients, skipping notification");
            return Ok(());
        }
        let Some(host) = &self.host else {
            return Err(NotifyError::NotConfigured);
        };

        let message = Notification::compose(configuration_name, execution, recipients, self.excerpt_chars);
        retry::with_backoff("smtp delivery", self.backoff, || self.deliver(host, &message)).await?;
        info!(
            execution_id = execution.id,
            recipients = message.recipients.len(),
            "notification sent"
        );
        Ok(())
    }
}

/// Client config trusting the PEM certificates in `ca_file` (or the system bundle).
fn tls_connector(ca_file: Option<&Path>) -> Result<TlsConnector, NotifyError> {
    let path = ca_file.unwrap_or(Path::new(SYSTEM_CA_BUNDLE));
    let certs = CertificateDer::pem_file_iter(path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| NotifyError::Tls(format!("cannot load CA certificates from {}: {e}", path.display())))?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(NotifyError::Tls(format!("no usable CA certificates in {}", path.display())));
    }
    debug!(added, ignored, ca_file = %path.display(), "loaded SMTP trust anchors");

    let config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| NotifyError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

fn server_name(host: &str) -> Result<ServerName<'static>, NotifyError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| NotifyError::Tls(format!("invalid SMTP server name {host:?}: {e}")))
}

/// Headers plus body of the DATA section.
fn render(sender: &str, message: &Notification) -> String {
    format!(
        "From: {sender}\n\
         To: {}\n\
         Subject: {}\n\
         Date: {}\n\
         MIME-Version: 1.0\n\
         Content-Type: text/plain; charset=utf-8\n\
         Content-Transfer-Encoding: 8bit\n\
         \n\
         {}",
        message.recipients.join(", "),
        encode_header(&message.subject),
        chrono::Utc::now().to_rfc2822(),
        message.body,
    )
}

/// RFC 2047 encoded-word for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", BASE64.encode(value))
    }
}

// LinesCodec terminates lines with a bare \n; SMTP wants CRLF.
async fn send_line<S>(smtp: &mut Framed<S, LinesCodec>, line: &str) -> Result<(), NotifyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    smtp.send(format!("{line}\r")).await?;
    Ok(())
}

async fn command<S>(smtp: &mut Framed<S, LinesCodec>, line: &str, accept: &[u16]) -> Result<(), NotifyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_line(smtp, line).await?;
    expect(smtp, accept).await
}

/// Read a (possibly multi-line) reply and check its code.
async fn expect<S>(smtp: &mut Framed<S, LinesCodec>, accept: &[u16]) -> Result<(), NotifyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let line = smtp.next().await.ok_or(NotifyError::Closed)??;
        let code = line.get(..3).and_then(|c| c.parse::<u16>().ok()).ok_or_else(|| {
            NotifyError::Rejected { code: 0, text: line.clone() }
        })?;
        if line.as_bytes().get(3) == Some(&b'-') {
            continue;
        }
        if accept.contains(&code) {
            return Ok(());
        }
        return Err(NotifyError::Rejected {
            code,
            text: line.get(4..).unwrap_or_default().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionStatus;
    use rustls::ServerConfig;
    use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum ServerMode {
        Plain,
        Starttls,
        Implicit,
    }

    /// Commands seen by the server, each tagged with whether TLS was up.
    #[derive(Default, Debug)]
    struct Captured {
        commands: Vec<(bool, String)>,
        data: Vec<String>,
    }

    impl Captured {
        fn saw(&self, command: &str) -> bool {
            self.commands.iter().any(|(_, c)| c == command)
        }

        fn auth_lines(&self) -> Vec<&(bool, String)> {
            self.commands.iter().filter(|(_, c)| c.starts_with("AUTH")).collect()
        }
    }

    struct FakeSmtp {
        port: u16,
        captured: Arc<Mutex<Captured>>,
        ca_file: PathBuf,
        _dir: tempfile::TempDir,
    }

    /// Self-signed certificate for localhost/127.0.0.1; returns the acceptor and the PEM.
    fn test_acceptor() -> (TlsAcceptor, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .unwrap();
        (TlsAcceptor::from(Arc::new(config)), cert.pem())
    }

    /// Minimal SMTP server; answers `rcpt_code` to RCPT TO.
    async fn fake_smtp(mode: ServerMode, rcpt_code: u16) -> FakeSmtp {
        let dir = tempfile::tempdir().unwrap();
        let (acceptor, pem) = test_acceptor();
        let ca_file = dir.path().join("ca.pem");
        std::fs::write(&ca_file, pem).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let captured = Arc::new(Mutex::new(Captured::default()));
        let sink = captured.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            if mode == ServerMode::Implicit {
                let Ok(tls) = acceptor.accept(stream).await else { return };
                let mut conn = Framed::new(tls, LinesCodec::new());
                conn.send("220 fake ESMTP\r").await.unwrap();
                converse(conn, true, false, &sink, rcpt_code).await;
                return;
            }
            let mut conn = Framed::new(stream, LinesCodec::new());
            conn.send("220 fake ESMTP\r").await.unwrap();
            let offer = mode == ServerMode::Starttls;
            if let Some(io) = converse(conn, false, offer, &sink, rcpt_code).await {
                let Ok(tls) = acceptor.accept(io).await else { return };
                converse(Framed::new(tls, LinesCodec::new()), true, false, &sink, rcpt_code).await;
            }
        });
        FakeSmtp { port, captured, ca_file, _dir: dir }
    }

    /// Serve one SMTP dialogue. Returns the raw stream when the client asks for STARTTLS.
    async fn converse<S>(
        mut conn: Framed<S, LinesCodec>,
        secure: bool,
        offer_starttls: bool,
        sink: &Mutex<Captured>,
        rcpt_code: u16,
    ) -> Option<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut in_data = false;
        while let Some(Ok(line)) = conn.next().await {
            let line = line.trim_end_matches('\r').to_string();
            if in_data {
                if line == "." {
                    in_data = false;
                    conn.send("250 queued\r").await.unwrap();
                } else {
                    sink.lock().unwrap().data.push(line);
                }
                continue;
            }
            sink.lock().unwrap().commands.push((secure, line.clone()));
            let reply = if line.starts_with("EHLO") {
                if offer_starttls {
                    "250-fake\r\n250 STARTTLS".to_string()
                } else {
                    "250-fake\r\n250 AUTH PLAIN".to_string()
                }
            } else if line == "STARTTLS" {
                if offer_starttls {
                    conn.send("220 ready to start TLS\r").await.unwrap();
                    return Some(conn.into_inner());
                }
                "502 not supported".to_string()
            } else if line.starts_with("RCPT") {
                format!("{rcpt_code} rcpt")
            } else if line == "DATA" {
                in_data = true;
                "354 go ahead".to_string()
            } else if line == "QUIT" {
                let _ = conn.send("221 bye\r").await;
                break;
            } else if line.starts_with("AUTH") {
                "235 ok".to_string()
            } else {
                "250 ok".to_string()
            };
            conn.send(format!("{reply}\r")).await.unwrap();
        }
        None
    }

    fn execution(report: &str) -> Execution {
        Execution {
            id: 9,
            configuration_id: 1,
            status: ExecutionStatus::Error,
            started_at: None,
            ended_at: None,
            report: report.to_string(),
            log_path: None,
            ticket_id: None,
        }
    }

    fn smtp_config(server: &FakeSmtp, tls: SmtpTls) -> SmtpConfig {
        SmtpConfig {
            host: Some("127.0.0.1".into()),
            port: server.port,
            tls,
            ca_file: Some(server.ca_file.clone()),
            sender: "snapflow@example.com".into(),
            username: Some("bot".into()),
            password: Some("pw".into()),
            max_attempts: 1,
            backoff_ms: 1,
            timeout_secs: 5,
            excerpt_chars: 500,
        }
    }

    #[test]
    fn test_compose_truncates_report() {
        let exec = execution(&"x".repeat(600));
        let n = Notification::compose("checkout", &exec, &["a@b.c".into()], 500);
        assert_eq!(n.subject, "Test finished: checkout");
        assert!(n.body.contains("Status: Not conclusive (error)"));
        assert!(n.body.contains(&format!("{}...", "x".repeat(500))));
        assert!(!n.body.contains(&"x".repeat(501)));

        let short = Notification::compose("checkout", &execution("ok"), &[], 500);
        assert!(short.body.ends_with("Report:\nok\n"));
    }

    #[test]
    fn test_non_ascii_subject_is_encoded() {
        assert_eq!(encode_header("plain"), "plain");
        assert!(encode_header("Test terminé").starts_with("=?UTF-8?B?"));
    }

    #[tokio::test]
    async fn test_starttls_upgrades_before_auth() {
        let server = fake_smtp(ServerMode::Starttls, 250).await;
        let notifier = SmtpNotifier::new(&smtp_config(&server, SmtpTls::Starttls)).unwrap();
        let recipients = vec!["qa@example.com".to_string(), "lead@example.com".to_string()];
        notifier
            .notify(&execution("line one\n.hidden dot"), "checkout", &recipients)
            .await
            .unwrap();

        let captured = server.captured.lock().unwrap();
        assert!(captured.commands.contains(&(false, "STARTTLS".to_string())));
        let expected_auth = format!("AUTH PLAIN {}", BASE64.encode("\0bot\0pw"));
        assert_eq!(captured.auth_lines(), vec![&(true, expected_auth)]);
        assert!(captured.commands.contains(&(true, "MAIL FROM:<snapflow@example.com>".to_string())));
        assert!(captured.saw("RCPT TO:<qa@example.com>"));
        assert!(captured.saw("RCPT TO:<lead@example.com>"));
        assert!(captured.data.iter().any(|l| l == "Subject: Test finished: checkout"));
        assert!(captured.data.iter().any(|l| l == "..hidden dot"));
    }

    #[tokio::test]
    async fn test_implicit_tls_session() {
        let server = fake_smtp(ServerMode::Implicit, 250).await;
        let notifier = SmtpNotifier::new(&smtp_config(&server, SmtpTls::Implicit)).unwrap();
        notifier
            .notify(&execution("r"), "checkout", &["qa@example.com".into()])
            .await
            .unwrap();

        let captured = server.captured.lock().unwrap();
        assert!(!captured.commands.is_empty());
        assert!(captured.commands.iter().all(|(secure, _)| *secure));
        assert_eq!(captured.auth_lines().len(), 1);
        assert!(captured.saw("RCPT TO:<qa@example.com>"));
    }

    #[tokio::test]
    async fn test_plaintext_session_refuses_credentials() {
        let server = fake_smtp(ServerMode::Plain, 250).await;
        let notifier = SmtpNotifier::new(&smtp_config(&server, SmtpTls::None)).unwrap();
        let err = notifier
            .notify(&execution("r"), "checkout", &["qa@example.com".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::InsecureAuth));
        assert!(!err.is_transient());

        let captured = server.captured.lock().unwrap();
        assert!(captured.auth_lines().is_empty());
        assert!(!captured.saw("MAIL FROM:<snapflow@example.com>"));
    }

    #[tokio::test]
    async fn test_plaintext_session_without_credentials() {
        let server = fake_smtp(ServerMode::Plain, 250).await;
        let config = SmtpConfig {
            username: None,
            password: None,
            ..smtp_config(&server, SmtpTls::None)
        };
        let notifier = SmtpNotifier::new(&config).unwrap();
        notifier
            .notify(&execution("r"), "checkout", &["qa@example.com".into()])
            .await
            .unwrap();

        let captured = server.captured.lock().unwrap();
        assert!(captured.auth_lines().is_empty());
        assert!(captured.saw("RCPT TO:<qa@example.com>"));
    }

    #[tokio::test]
    async fn test_rejected_recipient_is_an_error() {
        let server = fake_smtp(ServerMode::Starttls, 550).await;
        let notifier = SmtpNotifier::new(&smtp_config(&server, SmtpTls::Starttls)).unwrap();
        let err = notifier
            .notify(&execution("r"), "checkout", &["nobody@example.com".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Rejected { code: 550, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_untrusted_certificate_is_refused() {
        let server = fake_smtp(ServerMode::Implicit, 250).await;
        let other = tempfile::tempdir().unwrap();
        let (_, foreign_pem) = test_acceptor();
        let foreign = other.path().join("other.pem");
        std::fs::write(&foreign, foreign_pem).unwrap();

        let config = SmtpConfig {
            ca_file: Some(foreign),
            ..smtp_config(&server, SmtpTls::Implicit)
        };
        let err = SmtpNotifier::new(&config)
            .unwrap()
            .notify(&execution("r"), "checkout", &["qa@example.com".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Transport(_)));
        assert!(server.captured.lock().unwrap().commands.is_empty());
    }

    #[test]
    fn test_unreadable_ca_file_fails_construction() {
        let config = SmtpConfig {
            host: Some("mail.example.com".into()),
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..SmtpConfig::default()
        };
        assert!(matches!(SmtpNotifier::new(&config), Err(NotifyError::Tls(_))));

        let plain = SmtpConfig {
            host: Some("mail.example.com".into()),
            tls: SmtpTls::None,
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..SmtpConfig::default()
        };
        assert!(SmtpNotifier::new(&plain).is_ok());
    }

    #[tokio::test]
    async fn test_no_recipients_sends_nothing() {
        let notifier = SmtpNotifier::new(&SmtpConfig::default()).unwrap();
        notifier.notify(&execution("r"), "checkout", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_unconfigured_host() {
        let notifier = SmtpNotifier::new(&SmtpConfig::default()).unwrap();
        let err = notifier
            .notify(&execution("r"), "checkout", &["qa@example.com".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured));
    }
}
