//! Mailbox watcher — owns the session, turns mailbox events into at most one
//! dispatched message per fetch cycle, and reconnects on unexpected drops.
//!
//! One spawned task owns the [`MailboxSession`] and consumes a command queue
//! (manual checks, shutdown) interleaved with server notifications, so fetch
//! cycles never overlap.
//!
//! State flow:
//! `Connecting → Connected ⇄ IdleListening`, and on an unexpected drop
//! `Disconnected → ReconnectScheduled → Connecting → ...` until a connect
//! succeeds. Reconnect attempts use a fixed delay and never give up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MailConfig;
use crate::error::{MailError, PipelineError};
use crate::mail::link::{LinkOptions, extract_link};
use crate::mail::message::{DeliveryMetadata, is_from_target_sender, parse_message};
use crate::mail::session::{IdleEvent, MailboxConnector, MailboxSession};

/// Delay before each reconnection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connectivity state of the watcher's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Disconnected,
    Connecting,
    Connected,
    IdleListening,
    ReconnectScheduled,
}

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub target_sender: String,
    pub mark_as_read: bool,
    pub link: LinkOptions,
    pub reconnect_delay: Duration,
}

impl WatcherConfig {
    pub fn new(target_sender: impl Into<String>) -> Self {
        Self {
            target_sender: target_sender.into(),
            mark_as_read: true,
            link: LinkOptions::default(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    pub fn from_mail_config(mail: &MailConfig) -> Self {
        Self {
            target_sender: mail.target_sender.clone(),
            mark_as_read: mail.mark_as_read,
            link: mail.link.clone(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

/// A message accepted for dispatch.
#[derive(Debug, Clone)]
pub struct AcceptedMessage {
    pub link: String,
    pub metadata: DeliveryMetadata,
    pub seq: u32,
}

/// Downstream consumer of accepted messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: AcceptedMessage) -> Result<(), PipelineError>;
}

/// How a single fetch cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Search found no unread message from the target sender.
    NoCandidates,
    /// The message could not be parsed.
    Unparseable { seq: u32 },
    /// The recheck on the parsed From header failed.
    NotFromTarget { seq: u32 },
    /// No link in the HTML body.
    NoLink { seq: u32 },
    /// The handler was invoked once for this message.
    Dispatched { seq: u32 },
}

enum Command {
    Check,
    Shutdown,
}

enum Exit {
    Shutdown,
    Dropped(MailError),
}

/// Control handle for a running watcher. Cheap to clone.
#[derive(Clone)]
pub struct WatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
    interrupt: Arc<Notify>,
    state: watch::Receiver<WatcherState>,
}

impl WatcherHandle {
    /// Queue a manual fetch cycle. Interrupts IDLE if the session is waiting.
    pub fn check_now(&self) {
        if self.commands.send(Command::Check).is_ok() {
            self.interrupt.notify_one();
        }
    }

    /// Ask the watcher to log out and stop. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).is_ok() {
            self.interrupt.notify_one();
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state.clone()
    }
}

/// Mailbox watcher, before it is started.
pub struct MailboxWatcher {
    connector: Arc<dyn MailboxConnector>,
    handler: Arc<dyn MessageHandler>,
    config: WatcherConfig,
    state: watch::Sender<WatcherState>,
}

impl MailboxWatcher {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        handler: Arc<dyn MessageHandler>,
        config: WatcherConfig,
    ) -> Self {
        let (state, _rx) = watch::channel(WatcherState::Disconnected);
        Self {
            connector,
            handler,
            config,
            state,
        }
    }

    /// Connect, then spawn the watch loop.
    ///
    /// A failure on this first attempt is returned to the caller; later drops
    /// are retried forever inside the loop.
    pub async fn start(self) -> Result<(WatcherHandle, JoinHandle<()>), MailError> {
        self.set_state(WatcherState::Connecting);
        let session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "IMAP connection error");
                self.set_state(WatcherState::Disconnected);
                return Err(e);
            }
        };
        self.set_state(WatcherState::Connected);

        let (tx, rx) = mpsc::unbounded_channel();
        let interrupt = Arc::new(Notify::new());
        let handle = WatcherHandle {
            commands: tx,
            interrupt: Arc::clone(&interrupt),
            state: self.state.subscribe(),
        };

        let task = tokio::spawn(self.run(session, rx, interrupt));
        Ok((handle, task))
    }

    /// One fetch cycle: search, pick the newest match, fetch, recheck,
    /// extract, dispatch.
    ///
    /// Returns `Err` only for session-level failures; everything else is a
    /// [`CycleOutcome`].
    pub async fn fetch_new_emails(
        &self,
        session: &mut dyn MailboxSession,
    ) -> Result<CycleOutcome, MailError> {
        info!("Fetching new emails from target sender");

        let seqs = session
            .search_unseen_from(&self.config.target_sender)
            .await?;
        let Some(&latest) = seqs.iter().max() else {
            info!("No new unread emails from target sender");
            return Ok(CycleOutcome::NoCandidates);
        };
        info!(
            found = seqs.len(),
            seq = latest,
            "Found unread email(s) from target sender, processing the latest"
        );

        let raw = session.fetch_raw(latest).await?;
        let message = match parse_message(&raw) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, seq = latest, "Error parsing email");
                return Ok(CycleOutcome::Unparseable { seq: latest });
            }
        };

        if !is_from_target_sender(&message, &self.config.target_sender) {
            info!(from = %message.from, seq = latest, "Email not from target sender, skipping");
            return Ok(CycleOutcome::NotFromTarget { seq: latest });
        }

        let Some(link) = extract_link(message.html.as_deref(), &self.config.link) else {
            warn!(
                from = %message.from,
                subject = %message.subject,
                "No link found in email"
            );
            return Ok(CycleOutcome::NoLink { seq: latest });
        };

        let accepted = AcceptedMessage {
            metadata: DeliveryMetadata::new(&message, link.clone()),
            link,
            seq: latest,
        };
        if let Err(e) = self.handler.handle(accepted).await {
            warn!(error = %e, stage = e.stage(), seq = latest, "Message handler failed");
        }

        if self.config.mark_as_read {
            match session.mark_seen(latest).await {
                Ok(()) => info!(seq = latest, "Email marked as read"),
                Err(e) => error!(error = %e, seq = latest, "Error marking email as read"),
            }
        }

        Ok(CycleOutcome::Dispatched { seq: latest })
    }

    fn set_state(&self, state: WatcherState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "Watcher state changed");
        }
    }

    async fn run(
        self,
        first: Box<dyn MailboxSession>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        interrupt: Arc<Notify>,
    ) {
        let mut session = first;
        loop {
            match self.listen(session.as_mut(), &mut commands, &interrupt).await {
                Exit::Shutdown => {
                    self.disconnect(session).await;
                    return;
                }
                Exit::Dropped(e) => {
                    warn!(error = %e, "IMAP connection ended");
                    self.set_state(WatcherState::Disconnected);
                    match self.reconnect(&mut commands).await {
                        Some(next) => session = next,
                        None => {
                            info!("Watcher stopped while disconnected");
                            self.set_state(WatcherState::Disconnected);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Serve one session until it drops or shutdown is requested.
    async fn listen(
        &self,
        session: &mut dyn MailboxSession,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        interrupt: &Notify,
    ) -> Exit {
        // Catch up on anything that arrived while we were not listening.
        if let Err(e) = self.run_cycle(session).await {
            return Exit::Dropped(e);
        }

        loop {
            let mut check_requested = false;
            while let Ok(command) = commands.try_recv() {
                match command {
                    Command::Shutdown => return Exit::Shutdown,
                    Command::Check => check_requested = true,
                }
            }
            if check_requested {
                info!("Manual check triggered");
                if let Err(e) = self.run_cycle(session).await {
                    return Exit::Dropped(e);
                }
                continue;
            }

            self.set_state(WatcherState::IdleListening);
            let event = session.wait_for_change(interrupt).await;
            self.set_state(WatcherState::Connected);

            match event {
                Ok(IdleEvent::NewMail { exists }) => {
                    info!(exists, "New mail notification");
                    if let Err(e) = self.run_cycle(session).await {
                        return Exit::Dropped(e);
                    }
                }
                Ok(IdleEvent::Interrupted | IdleEvent::Refresh) => {}
                Err(e) if e.is_connection_fault() => return Exit::Dropped(e),
                Err(e) => warn!(error = %e, "Error while waiting for mailbox changes"),
            }
        }
    }

    /// Run a fetch cycle, keeping the session on anything but a connection fault.
    async fn run_cycle(&self, session: &mut dyn MailboxSession) -> Result<(), MailError> {
        match self.fetch_new_emails(session).await {
            Ok(outcome) => {
                debug!(?outcome, "Fetch cycle finished");
                Ok(())
            }
            Err(e) if e.is_connection_fault() => Err(e),
            Err(e) => {
                error!(error = %e, "Error fetching new emails");
                Ok(())
            }
        }
    }

    /// Wait the fixed delay, try to connect, repeat until it works.
    ///
    /// Returns `None` if shutdown was requested while waiting.
    async fn reconnect(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<Box<dyn MailboxSession>> {
        let delay = self.config.reconnect_delay;
        loop {
            self.set_state(WatcherState::ReconnectScheduled);
            info!(delay_ms = delay.as_millis() as u64, "Scheduling reconnection");

            let timer = tokio::time::sleep(delay);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = &mut timer => break,
                    command = commands.recv() => match command {
                        Some(Command::Shutdown) => return None,
                        Some(Command::Check) => {
                            warn!("Manual check ignored: not connected to mailbox");
                        }
                        None => {
                            (&mut timer).await;
                            break;
                        }
                    },
                }
            }

            self.set_state(WatcherState::Connecting);
            info!("Attempting to reconnect");
            match self.connector.connect().await {
                Ok(session) => {
                    self.set_state(WatcherState::Connected);
                    info!("Reconnected to mailbox");
                    return Some(session);
                }
                Err(e) => {
                    error!(error = %e, "Reconnection failed");
                    self.set_state(WatcherState::Disconnected);
                }
            }
        }
    }

    async fn disconnect(&self, mut session: Box<dyn MailboxSession>) {
        match session.logout().await {
            Ok(()) => info!("IMAP client disconnected"),
            Err(e) => error!(error = %e, "Error disconnecting"),
        }
        self.set_state(WatcherState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;

    const TARGET: &str = "notice@example.com";

    fn raw_mail(from: &str, subject: &str, html: &str) -> Vec<u8> {
        format!(
            "From: {from}\r\nTo: me@daum.net\r\nSubject: {subject}\r\n\
             MIME-Version: 1.0\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html}\r\n"
        )
        .into_bytes()
    }

    fn link_mail(n: u32) -> Vec<u8> {
        raw_mail(
            "Notices <notice@example.com>",
            &format!("Message {n}"),
            &format!(r#"<a href="https://example.com/verify/{n}">go</a>"#),
        )
    }

    // ── Test doubles ────────────────────────────────────────────────

    #[derive(Default)]
    struct MailboxState {
        unseen: Vec<u32>,
        bodies: HashMap<u32, Vec<u8>>,
        fetched: Vec<u32>,
        seen: Vec<u32>,
        idle_script: VecDeque<Result<IdleEvent, MailError>>,
        searches: usize,
        logouts: usize,
    }

    #[derive(Clone, Default)]
    struct FakeMailbox(Arc<Mutex<MailboxState>>);

    impl FakeMailbox {
        fn with_messages(msgs: &[(u32, Vec<u8>)]) -> Self {
            let mailbox = Self::default();
            {
                let mut state = mailbox.0.lock().unwrap();
                for (seq, body) in msgs {
                    state.unseen.push(*seq);
                    state.bodies.insert(*seq, body.clone());
                }
            }
            mailbox
        }

        fn session(&self) -> FakeSession {
            FakeSession(self.clone())
        }

        fn script_idle(&self, event: Result<IdleEvent, MailError>) {
            self.0.lock().unwrap().idle_script.push_back(event);
        }
    }

    struct FakeSession(FakeMailbox);

    #[async_trait]
    impl MailboxSession for FakeSession {
        async fn search_unseen_from(&mut self, _sender: &str) -> Result<Vec<u32>, MailError> {
            let mut state = self.0.0.lock().unwrap();
            state.searches += 1;
            Ok(state.unseen.clone())
        }

        async fn fetch_raw(&mut self, seq: u32) -> Result<Vec<u8>, MailError> {
            let mut state = self.0.0.lock().unwrap();
            state.fetched.push(seq);
            state
                .bodies
                .get(&seq)
                .cloned()
                .ok_or_else(|| MailError::Command(format!("no message {seq}")))
        }

        async fn mark_seen(&mut self, seq: u32) -> Result<(), MailError> {
            let mut state = self.0.0.lock().unwrap();
            state.unseen.retain(|s| *s != seq);
            state.seen.push(seq);
            Ok(())
        }

        async fn wait_for_change(&mut self, interrupt: &Notify) -> Result<IdleEvent, MailError> {
            let scripted = self.0.0.lock().unwrap().idle_script.pop_front();
            match scripted {
                Some(event) => event,
                None => {
                    interrupt.notified().await;
                    Ok(IdleEvent::Interrupted)
                }
            }
        }

        async fn logout(&mut self) -> Result<(), MailError> {
            self.0.0.lock().unwrap().logouts += 1;
            Ok(())
        }
    }

    /// Hands out sessions on a shared mailbox; fails the scripted attempts.
    struct FakeConnector {
        mailbox: FakeMailbox,
        failures: Mutex<VecDeque<bool>>,
        attempts: Mutex<Vec<Instant>>,
        attempt_tx: mpsc::UnboundedSender<Instant>,
    }

    impl FakeConnector {
        fn new(mailbox: FakeMailbox, fail_pattern: &[bool]) -> (Arc<Self>, mpsc::UnboundedReceiver<Instant>) {
            let (attempt_tx, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                mailbox,
                failures: Mutex::new(fail_pattern.iter().copied().collect()),
                attempts: Mutex::new(Vec::new()),
                attempt_tx,
            });
            (connector, rx)
        }
    }

    #[async_trait]
    impl MailboxConnector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailError> {
            let now = Instant::now();
            self.attempts.lock().unwrap().push(now);
            let _ = self.attempt_tx.send(now);
            let fail = self.failures.lock().unwrap().pop_front().unwrap_or(false);
            if fail {
                return Err(MailError::Connect {
                    host: "imap.test.com".into(),
                    port: 993,
                    reason: "connection refused".into(),
                });
            }
            Ok(Box::new(self.mailbox.session()))
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<AcceptedMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, message: AcceptedMessage) -> Result<(), PipelineError> {
            self.calls.lock().unwrap().push(message);
            if self.fail {
                return Err(PipelineError::Render(crate::error::RenderError::NotRunning));
            }
            Ok(())
        }
    }

    fn watcher_with(
        connector: Arc<dyn MailboxConnector>,
        handler: Arc<RecordingHandler>,
    ) -> MailboxWatcher {
        MailboxWatcher::new(connector, handler, WatcherConfig::new(TARGET))
    }

    fn unused_connector() -> Arc<dyn MailboxConnector> {
        FakeConnector::new(FakeMailbox::default(), &[]).0
    }

    // ── fetch_new_emails ────────────────────────────────────────────

    #[tokio::test]
    async fn three_unread_dispatches_only_latest() {
        let mailbox =
            FakeMailbox::with_messages(&[(3, link_mail(3)), (7, link_mail(7)), (5, link_mail(5))]);
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher_with(unused_connector(), Arc::clone(&handler));

        let outcome = watcher
            .fetch_new_emails(&mut mailbox.session())
            .await
            .unwrap();

        assert_eq!(outcome, CycleOutcome::Dispatched { seq: 7 });
        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].seq, 7);
        assert_eq!(calls[0].link, "https://example.com/verify/7");
        assert_eq!(calls[0].metadata.subject, "Message 7");
        assert_eq!(mailbox.0.lock().unwrap().fetched, vec![7]);
    }

    #[tokio::test]
    async fn dispatch_marks_source_read() {
        let mailbox = FakeMailbox::with_messages(&[(4, link_mail(4))]);
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher_with(unused_connector(), handler);

        watcher.fetch_new_emails(&mut mailbox.session()).await.unwrap();
        assert_eq!(mailbox.0.lock().unwrap().seen, vec![4]);
    }

    #[tokio::test]
    async fn mark_as_read_disabled_leaves_flags() {
        let mailbox = FakeMailbox::with_messages(&[(4, link_mail(4))]);
        let handler = Arc::new(RecordingHandler::default());
        let mut config = WatcherConfig::new(TARGET);
        config.mark_as_read = false;
        let watcher = MailboxWatcher::new(unused_connector(), handler, config);

        watcher.fetch_new_emails(&mut mailbox.session()).await.unwrap();
        assert!(mailbox.0.lock().unwrap().seen.is_empty());
    }

    #[tokio::test]
    async fn handler_failure_does_not_fail_cycle() {
        let mailbox = FakeMailbox::with_messages(&[(2, link_mail(2))]);
        let handler = Arc::new(RecordingHandler {
            fail: true,
            ..Default::default()
        });
        let watcher = watcher_with(unused_connector(), Arc::clone(&handler));

        let outcome = watcher.fetch_new_emails(&mut mailbox.session()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Dispatched { seq: 2 });
        assert_eq!(handler.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_candidates_is_quiet() {
        let mailbox = FakeMailbox::default();
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher_with(unused_connector(), Arc::clone(&handler));

        let outcome = watcher.fetch_new_emails(&mut mailbox.session()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::NoCandidates);
        assert!(handler.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn message_without_link_is_not_dispatched() {
        let body = raw_mail(TARGET, "No link", "<p>nothing to click</p>");
        let mailbox = FakeMailbox::with_messages(&[(9, body)]);
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher_with(unused_connector(), Arc::clone(&handler));

        let outcome = watcher.fetch_new_emails(&mut mailbox.session()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::NoLink { seq: 9 });
        assert!(handler.calls.lock().unwrap().is_empty());
        assert!(mailbox.0.lock().unwrap().seen.is_empty());
    }

    #[tokio::test]
    async fn recheck_rejects_other_sender() {
        let body = raw_mail("other@x.com", "Hi", r#"<a href="https://x.com">x</a>"#);
        let mailbox = FakeMailbox::with_messages(&[(1, body)]);
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher_with(unused_connector(), Arc::clone(&handler));

        let outcome = watcher.fetch_new_emails(&mut mailbox.session()).await.unwrap();
        assert_eq!(outcome, CycleOutcome::NotFromTarget { seq: 1 });
        assert!(handler.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_command_error_propagates_as_non_connection_fault() {
        let mailbox = FakeMailbox::default();
        mailbox.0.lock().unwrap().unseen.push(11);
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher_with(unused_connector(), handler);

        let err = watcher
            .fetch_new_emails(&mut mailbox.session())
            .await
            .unwrap_err();
        assert!(!err.is_connection_fault());
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    #[tokio::test]
    async fn initial_connect_failure_is_returned() {
        let (connector, _attempts) = FakeConnector::new(FakeMailbox::default(), &[true]);
        let handler = Arc::new(RecordingHandler::default());
        let watcher = watcher_with(connector, handler);
        assert!(watcher.start().await.is_err());
    }

    #[tokio::test]
    async fn catch_up_cycle_runs_after_connect() {
        let mailbox = FakeMailbox::with_messages(&[(1, link_mail(1))]);
        let (connector, _attempts) = FakeConnector::new(mailbox.clone(), &[]);
        let handler = Arc::new(RecordingHandler::default());
        let (handle, task) = watcher_with(connector, Arc::clone(&handler))
            .start()
            .await
            .unwrap();

        let mut state = handle.subscribe();
        state
            .wait_for(|s| *s == WatcherState::IdleListening)
            .await
            .unwrap();
        assert_eq!(handler.calls.lock().unwrap().len(), 1);

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(mailbox.0.lock().unwrap().logouts, 1);
        assert_eq!(handle.state(), WatcherState::Disconnected);
    }

    #[tokio::test]
    async fn manual_check_interrupts_idle_and_runs_cycle() {
        let mailbox = FakeMailbox::default();
        let (connector, _attempts) = FakeConnector::new(mailbox.clone(), &[]);
        let handler = Arc::new(RecordingHandler::default());
        let (handle, task) = watcher_with(connector, Arc::clone(&handler))
            .start()
            .await
            .unwrap();

        let mut state = handle.subscribe();
        state
            .wait_for(|s| *s == WatcherState::IdleListening)
            .await
            .unwrap();
        assert_eq!(mailbox.0.lock().unwrap().searches, 1);

        {
            let mut s = mailbox.0.lock().unwrap();
            s.unseen.push(2);
            s.bodies.insert(2, link_mail(2));
        }
        handle.check_now();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.calls.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handler.calls.lock().unwrap()[0].seq, 2);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (connector, _attempts) = FakeConnector::new(FakeMailbox::default(), &[]);
        let handler = Arc::new(RecordingHandler::default());
        let (handle, task) = watcher_with(connector, handler).start().await.unwrap();

        handle.shutdown();
        handle.shutdown();
        task.await.unwrap();
        handle.shutdown();
        handle.check_now();
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_drop_reconnects_after_fixed_delay_without_bound() {
        let mailbox = FakeMailbox::default();
        mailbox.script_idle(Err(MailError::ConnectionLost("end".into())));
        // initial ok, then three failed reconnects, then success
        let (connector, mut attempts) =
            FakeConnector::new(mailbox.clone(), &[false, true, true, true, false]);
        let handler = Arc::new(RecordingHandler::default());
        let (handle, task) = watcher_with(connector.clone(), handler)
            .start()
            .await
            .unwrap();

        let first = attempts.recv().await.unwrap();
        let mut previous = first;
        for _ in 0..4 {
            let next = tokio::time::timeout(Duration::from_secs(60), attempts.recv())
                .await
                .unwrap()
                .unwrap();
            let gap = next - previous;
            assert!(gap >= RECONNECT_DELAY, "gap {gap:?} shorter than delay");
            assert!(gap < RECONNECT_DELAY * 2, "gap {gap:?} implies a skipped or doubled timer");
            previous = next;
        }

        let mut state = handle.subscribe();
        state
            .wait_for(|s| *s == WatcherState::IdleListening)
            .await
            .unwrap();
        assert_eq!(connector.attempts.lock().unwrap().len(), 5);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drop_enters_reconnect_scheduled() {
        let mailbox = FakeMailbox::default();
        mailbox.script_idle(Err(MailError::ConnectionLost("end".into())));
        let (connector, _attempts) = FakeConnector::new(mailbox, &[false, true, true]);
        let handler = Arc::new(RecordingHandler::default());
        let (handle, task) = watcher_with(connector, handler).start().await.unwrap();

        let mut state = handle.subscribe();
        state
            .wait_for(|s| *s == WatcherState::ReconnectScheduled)
            .await
            .unwrap();

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(handle.state(), WatcherState::Disconnected);
    }

    #[tokio::test]
    async fn non_connection_idle_error_keeps_session() {
        let mailbox = FakeMailbox::default();
        mailbox.script_idle(Err(MailError::Command("BAD IDLE".into())));
        let (connector, _attempts) = FakeConnector::new(mailbox.clone(), &[]);
        let handler = Arc::new(RecordingHandler::default());
        let (handle, task) = watcher_with(connector.clone(), handler).start().await.unwrap();

        let mut state = handle.subscribe();
        state
            .wait_for(|s| *s == WatcherState::IdleListening)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.attempts.lock().unwrap().len(), 1);

        handle.shutdown();
        task.await.unwrap();
    }
}
