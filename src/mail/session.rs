//! Mailbox session seam and its IMAP implementation.
//!
//! The watcher talks to the server only through [`MailboxConnector`] and
//! [`MailboxSession`]; tests substitute in-memory doubles.

use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::types::UnsolicitedResponse;
use async_trait::async_trait;
use futures::TryStreamExt;
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::config::ImapConfig;
use crate::error::MailError;

/// IDLE is re-issued after this long, well under the 29-minute server limit.
const IDLE_REFRESH: Duration = Duration::from_secs(300);

/// NOOP poll interval for servers without IDLE.
const NOOP_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// What ended a wait for mailbox changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleEvent {
    /// The server reported the message count (EXISTS) changed.
    NewMail { exists: u32 },
    /// The host asked the session to stop waiting.
    Interrupted,
    /// Keepalive elapsed or an unrelated update arrived.
    Refresh,
}

/// An authenticated session with the configured mailbox selected.
#[async_trait]
pub trait MailboxSession: Send {
    /// Sequence numbers of unseen messages whose From matches `sender`.
    async fn search_unseen_from(&mut self, sender: &str) -> Result<Vec<u32>, MailError>;

    /// Full raw body of one message, without setting `\Seen`.
    async fn fetch_raw(&mut self, seq: u32) -> Result<Vec<u8>, MailError>;

    /// Add the `\Seen` flag.
    async fn mark_seen(&mut self, seq: u32) -> Result<(), MailError>;

    /// Wait for a mailbox change, or until `interrupt` is notified.
    async fn wait_for_change(&mut self, interrupt: &Notify) -> Result<IdleEvent, MailError>;

    /// Close the session.
    async fn logout(&mut self) -> Result<(), MailError>;
}

/// Opens new sessions. Called once at start and again on every reconnect.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailError>;
}

// ── IMAP ────────────────────────────────────────────────────────────

/// Any byte stream the IMAP client can run over (plain TCP or TLS).
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

impl<T> ImapStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

type Session = async_imap::Session<Box<dyn ImapStream>>;

/// Connects to the IMAP server described by [`ImapConfig`].
pub struct ImapConnector {
    config: ImapConfig,
    mailbox: String,
}

impl ImapConnector {
    pub fn new(config: ImapConfig, mailbox: impl Into<String>) -> Self {
        Self {
            config,
            mailbox: mailbox.into(),
        }
    }

    async fn open_stream(&self) -> Result<Box<dyn ImapStream>, MailError> {
        let cfg = &self.config;
        let connect_err = |reason: String| MailError::Connect {
            host: cfg.host.clone(),
            port: cfg.port,
            reason,
        };

        let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port))
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        if !cfg.tls {
            return Ok(Box::new(tcp));
        }

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(cfg.host.clone())
            .map_err(|e| connect_err(format!("invalid TLS server name: {e}")))?;
        let tls = tokio_rustls::TlsConnector::from(tls_config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| connect_err(format!("TLS handshake failed: {e}")))?;

        Ok(Box::new(tls))
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailError> {
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            user = %self.config.user,
            "Connecting to IMAP server"
        );

        let stream = self.open_stream().await?;
        let mut client = async_imap::Client::new(stream);
        let _greeting = client.read_response().await;

        let mut session = client
            .login(&self.config.user, self.config.password.expose_secret())
            .await
            .map_err(|(e, _client)| MailError::AuthFailed {
                user: self.config.user.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!("IMAP connection established");

        let supports_idle = session
            .capabilities()
            .await
            .map(|caps| caps.has_str("IDLE"))
            .unwrap_or(false);

        let mailbox = session
            .select(&self.mailbox)
            .await
            .map_err(|e| MailError::MailboxUnavailable {
                mailbox: self.mailbox.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            mailbox = %self.mailbox,
            total_messages = mailbox.exists,
            recent_messages = mailbox.recent,
            idle = supports_idle,
            "Mailbox opened successfully"
        );

        Ok(Box::new(ImapSession {
            session: Some(session),
            supports_idle,
        }))
    }
}

/// A logged-in IMAP session. `session` is `None` only while IDLE owns it
/// or after a failed IDLE left it unusable.
pub struct ImapSession {
    session: Option<Session>,
    supports_idle: bool,
}

impl ImapSession {
    fn session(&mut self) -> Result<&mut Session, MailError> {
        self.session
            .as_mut()
            .ok_or_else(|| MailError::ConnectionLost("session lost during IDLE".into()))
    }

    async fn idle(&mut self, interrupt: &Notify) -> Result<IdleEvent, MailError> {
        let session = self
            .session
            .take()
            .ok_or_else(|| MailError::ConnectionLost("session lost during IDLE".into()))?;

        let mut handle = session.idle();
        handle.init().await?;

        let response = {
            let (wait, stop) = handle.wait_with_timeout(IDLE_REFRESH);
            tokio::pin!(wait);
            tokio::select! {
                response = &mut wait => response,
                _ = interrupt.notified() => {
                    drop(stop);
                    wait.await
                }
            }
        }?;

        self.session = Some(handle.done().await?);

        Ok(match response {
            IdleResponse::NewData(data) => match data.parsed() {
                Response::MailboxData(MailboxDatum::Exists(exists)) => {
                    IdleEvent::NewMail { exists: *exists }
                }
                _ => IdleEvent::Refresh,
            },
            IdleResponse::ManualInterrupt => IdleEvent::Interrupted,
            IdleResponse::Timeout => IdleEvent::Refresh,
        })
    }

    async fn poll(&mut self, interrupt: &Notify) -> Result<IdleEvent, MailError> {
        tokio::select! {
            _ = tokio::time::sleep(NOOP_POLL_INTERVAL) => {}
            _ = interrupt.notified() => return Ok(IdleEvent::Interrupted),
        }

        self.session()?.noop().await?;
        Ok(self.drain_unsolicited().unwrap_or(IdleEvent::Refresh))
    }

    /// EXISTS updates the server sent alongside earlier commands.
    fn drain_unsolicited(&mut self) -> Option<IdleEvent> {
        let session = self.session.as_mut()?;
        let mut event = None;
        while let Ok(update) = session.unsolicited_responses.try_recv() {
            if let UnsolicitedResponse::Exists(exists) = update {
                event = Some(IdleEvent::NewMail { exists });
            }
        }
        event
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn search_unseen_from(&mut self, sender: &str) -> Result<Vec<u32>, MailError> {
        let query = format!("UNSEEN FROM {}", quote_imap_string(sender));
        let hits = self.session()?.search(query).await?;
        let mut seqs: Vec<u32> = hits.into_iter().collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn fetch_raw(&mut self, seq: u32) -> Result<Vec<u8>, MailError> {
        let session = self.session()?;
        let fetches: Vec<_> = session
            .fetch(seq.to_string(), "BODY.PEEK[]")
            .await?
            .try_collect()
            .await?;

        fetches
            .iter()
            .find_map(|f| f.body().map(<[u8]>::to_vec))
            .ok_or_else(|| MailError::Command(format!("FETCH {seq} returned no body")))
    }

    async fn mark_seen(&mut self, seq: u32) -> Result<(), MailError> {
        let session = self.session()?;
        let _updates: Vec<_> = session
            .store(seq.to_string(), "+FLAGS (\\Seen)")
            .await?
            .try_collect()
            .await?;
        Ok(())
    }

    async fn wait_for_change(&mut self, interrupt: &Notify) -> Result<IdleEvent, MailError> {
        if let Some(event) = self.drain_unsolicited() {
            return Ok(event);
        }
        if self.supports_idle {
            self.idle(interrupt).await
        } else {
            self.poll(interrupt).await
        }
    }

    async fn logout(&mut self) -> Result<(), MailError> {
        if let Some(mut session) = self.session.take() {
            session.logout().await?;
        }
        Ok(())
    }
}

/// Quote a string for use as an IMAP search argument.
fn quote_imap_string(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
