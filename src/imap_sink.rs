//! IMAP destination: connection lifecycle, folder creation, and APPEND with
//! session recycling.

use async_imap::types::Flag;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use futures::TryStreamExt;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::error::{Result, TransferError};

/// Trait defining the IMAP Sink contract for easier testing.
///
/// The transfer engine holds a `Box<dyn MailSink>` rather than a concrete
/// `ImapSink` so the uploader stage can be driven against a fake in tests.
/// Connection establishment (`connect`) stays outside the trait: the engine
/// never dials out itself, it only appends to an already-connected sink.
#[async_trait]
pub trait MailSink: Send {
    async fn create_folder(&mut self, name: &str) -> Result<()>;
    async fn append(
        &mut self,
        folder: &str,
        raw: &[u8],
        flags: &[String],
        internal_date: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn logout(&mut self);
}

type TlsStream = async_native_tls::TlsStream<Compat<TcpStream>>;
type ImapSession = async_imap::Session<TlsStream>;

const MAX_SESSION_AGE: Duration = Duration::from_secs(900);
const MAX_UPLOADS_PER_SESSION: u32 = 100;
const MAX_ERRORS_PER_SESSION: u32 = 10;
const MAX_APPEND_ATTEMPTS: u32 = 3;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

const DEFAULT_PREFIX: &str = "INBOX.";
const DEFAULT_DELIMITER: &str = ".";

/// Transport-level error markers: a failure whose text contains any of these
/// (case-insensitive) is treated as a recoverable connection fault rather
/// than a permanent APPEND failure.
const TRANSPORT_FAULT_MARKERS: &[&str] = &["ssl", "socket", "logout", "connection"];

#[derive(Clone, Debug)]
pub struct ImapConnectionSettings {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: String,
    pub password: String,
}

/// A connected IMAP destination. Owns exactly one session at a time and
/// recycles it transparently when it grows stale, overused, or faulty.
pub struct ImapSink {
    settings: ImapConnectionSettings,
    session: Option<ImapSession>,
    namespace_prefix: String,
    connected_at: Instant,
    uploads_since_connect: u32,
    error_count: u32,
}

impl ImapSink {
    pub fn new(settings: ImapConnectionSettings) -> Self {
        Self {
            settings,
            session: None,
            namespace_prefix: DEFAULT_PREFIX.to_string(),
            connected_at: Instant::now(),
            uploads_since_connect: 0,
            error_count: 0,
        }
    }

    /// Authenticate over TLS and discover the personal namespace prefix.
    pub async fn connect(&mut self) -> Result<()> {
        if !self.settings.use_tls {
            return Err(TransferError::ImapError(
                "TLS is required for IMAP connections".to_string(),
            ));
        }

        let tcp_stream = TcpStream::connect((self.settings.host.as_str(), self.settings.port))
            .await
            .map_err(|e| TransferError::ImapConnectionFault(format!("tcp connect failed: {e}")))?
            .compat();

        let tls_connector = async_native_tls::TlsConnector::new();
        let tls_stream = tls_connector
            .connect(self.settings.host.as_str(), tcp_stream)
            .await
            .map_err(|e| TransferError::ImapConnectionFault(format!("tls handshake failed: {e}")))?;

        let client = async_imap::Client::new(tls_stream);
        let session = client
            .login(&self.settings.username, &self.settings.password)
            .await
            .map_err(|(e, _client)| TransferError::AuthError(format!("IMAP login failed: {e}")))?;

        self.session = Some(session);
        self.connected_at = Instant::now();
        self.uploads_since_connect = 0;
        self.error_count = 0;

        self.discover_namespace().await;
        Ok(())
    }

    /// Query CAPABILITY and, when NAMESPACE is advertised, attempt to derive
    /// the personal namespace prefix. Falls back to the conservative
    /// ("INBOX.", ".") default when NAMESPACE is absent, which is also what
    /// most Dovecot/Courier deployments use out of the box.
    async fn discover_namespace(&mut self) {
        self.namespace_prefix = DEFAULT_PREFIX.to_string();

        let Some(session) = self.session.as_mut() else {
            return;
        };

        match session.capabilities().await {
            Ok(caps) => {
                let has_namespace = caps.iter().any(|c| format!("{c:?}").to_uppercase().contains("NAMESPACE"));
                if !has_namespace {
                    tracing::debug!("Server does not advertise NAMESPACE, using default prefix");
                }
                // async-imap does not expose a typed NAMESPACE command; the
                // conservative default below is used regardless.
            }
            Err(e) => {
                tracing::warn!("Failed to query IMAP capabilities: {e}");
            }
        }
    }

    /// Resolve a bare folder name to its full, namespace-prefixed name.
    /// `INBOX` and names already carrying the prefix are returned unchanged.
    fn resolve_full_name(&self, name: &str) -> String {
        if name == "INBOX" || name.starts_with(&self.namespace_prefix) {
            name.to_string()
        } else {
            format!("{}{}", self.namespace_prefix, name)
        }
    }

    /// Create `name` if it does not already exist. Idempotent.
    pub async fn create_folder(&mut self, name: &str) -> Result<()> {
        let full_name = self.resolve_full_name(name);

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| TransferError::ImapError("not connected".to_string()))?;

        let existing: Vec<_> = session
            .list(Some(""), Some(&full_name))
            .await
            .map_err(|e| TransferError::from(e))?
            .try_collect()
            .await
            .map_err(|e| TransferError::from(e))?;

        if existing.iter().any(|n| n.name() == full_name) {
            return Ok(());
        }

        session
            .create(&full_name)
            .await
            .map_err(|e| TransferError::from(e))?;
        tracing::info!("Created IMAP folder {full_name}");
        Ok(())
    }

    /// Append one message, recycling the session first if it has grown
    /// stale, overused, or accumulated too many transport faults, and
    /// retrying transport faults up to `MAX_APPEND_ATTEMPTS` times.
    pub async fn append(
        &mut self,
        folder: &str,
        raw: &[u8],
        flags: &[String],
        internal_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let full_name = self.resolve_full_name(folder);
        let imap_flags = to_imap_flags(flags);
        let fixed_date: Option<DateTime<FixedOffset>> = internal_date.map(|d| d.fixed_offset());

        let mut attempt = 0;
        loop {
            attempt += 1;

            if self.should_recycle() {
                self.reconnect().await?;
            }

            let session = self
                .session
                .as_mut()
                .ok_or_else(|| TransferError::ImapError("not connected".to_string()))?;

            // An absent internal date means the `Date:` header was missing or
            // malformed; leave the server to stamp its own receipt time
            // rather than guessing, per the original-message-time guarantee.
            let mut append_cmd = session.append(&full_name, raw).flags(imap_flags.clone());
            if let Some(date) = fixed_date {
                append_cmd = append_cmd.internal_date(date);
            }
            let result = append_cmd.finish().await;

            match result {
                Ok(_) => {
                    self.uploads_since_connect += 1;
                    return Ok(());
                }
                Err(e) => {
                    let text = e.to_string();
                    let is_transport_fault = TRANSPORT_FAULT_MARKERS
                        .iter()
                        .any(|marker| text.to_lowercase().contains(marker));

                    if !is_transport_fault {
                        return Err(TransferError::ImapError(text));
                    }

                    self.error_count += 1;
                    tracing::warn!(
                        "Transport fault on APPEND to {full_name} (attempt {attempt}/{MAX_APPEND_ATTEMPTS}): {text}"
                    );

                    if attempt >= MAX_APPEND_ATTEMPTS {
                        return Err(TransferError::ImapConnectionFault(text));
                    }

                    self.reconnect().await?;
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
            }
        }
    }

    fn should_recycle(&self) -> bool {
        self.session.is_none()
            || self.connected_at.elapsed() > MAX_SESSION_AGE
            || self.uploads_since_connect >= MAX_UPLOADS_PER_SESSION
            || self.error_count >= MAX_ERRORS_PER_SESSION
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.logout().await;
        self.connect().await
    }

    /// Log out cleanly, ignoring any errors -- the session is being torn
    /// down regardless.
    pub async fn logout(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.logout().await;
        }
    }
}

#[async_trait]
impl MailSink for ImapSink {
    async fn create_folder(&mut self, name: &str) -> Result<()> {
        ImapSink::create_folder(self, name).await
    }

    async fn append(
        &mut self,
        folder: &str,
        raw: &[u8],
        flags: &[String],
        internal_date: Option<DateTime<Utc>>,
    ) -> Result<()> {
        ImapSink::append(self, folder, raw, flags, internal_date).await
    }

    async fn logout(&mut self) {
        ImapSink::logout(self).await
    }
}

fn to_imap_flags(flags: &[String]) -> Vec<Flag<'static>> {
    flags
        .iter()
        .map(|f| match f.as_str() {
            "\\Seen" => Flag::Seen,
            "\\Flagged" => Flag::Flagged,
            "\\Answered" => Flag::Answered,
            "\\Deleted" => Flag::Deleted,
            "\\Draft" => Flag::Draft,
            other => Flag::Custom(other.trim_start_matches('\\').to_string().into()),
        })
        .collect()
}
