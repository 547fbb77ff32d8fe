use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use mail_pdf_relay::config::Config;
use mail_pdf_relay::mail::{ImapConnector, MailboxWatcher, WatcherConfig, WatcherHandle};
use mail_pdf_relay::notify::telegram::TelegramNotifier;
use mail_pdf_relay::pipeline::dispatch::{DispatchPipeline, TEMP_PURGE_INTERVAL, spawn_temp_purge};
use mail_pdf_relay::publish::Publisher;
use mail_pdf_relay::publish::pages::PagesPublisher;
use mail_pdf_relay::render::chromium::ChromiumRenderer;
use mail_pdf_relay::render::{RenderOptions, Renderer, TEMP_MAX_AGE};

/// How long the watcher gets to log out on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let log_guard = init_tracing(&config.logs_dir);

    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "Failed to start service");
            1
        }
    };

    // Flush the file log before exiting.
    drop(log_guard);
    std::process::exit(code);
}

/// Stderr plus a daily-rolling file in `logs_dir`.
fn init_tracing(logs_dir: &Path) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match std::fs::create_dir_all(logs_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(logs_dir, "mail-pdf-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            warn!(dir = %logs_dir.display(), error = %e, "Could not create log directory, logging to stderr only");
            None
        }
    }
}

async fn run(config: Config) -> anyhow::Result<i32> {
    eprintln!("📧 Mail PDF Relay v{}", env!("CARGO_PKG_VERSION"));

    // ── Renderer ─────────────────────────────────────────────────────
    info!("Initializing PDF renderer");
    let renderer: Arc<dyn Renderer> = Arc::new(
        ChromiumRenderer::launch(config.browser.clone(), config.temp_dir.clone()).await?,
    );

    // ── Publisher + notifier ─────────────────────────────────────────
    let publisher = Arc::new(PagesPublisher::from_config(&config.publish));

    let mut pipeline = DispatchPipeline::new(Arc::clone(&renderer), publisher.clone())
        .with_render_options(RenderOptions {
            wait_for_selector: config.browser.wait_for_selector.clone(),
        })
        .with_error_notifications(config.notify_errors);

    match &config.telegram {
        Some(tg) => {
            let notifier = TelegramNotifier::new(tg)?;
            match notifier.initialize().await {
                Ok(_) => pipeline = pipeline.with_notifier(Arc::new(notifier)),
                Err(e) => {
                    warn!(error = %e, "Failed to initialize Telegram bot, continuing without chat notifications");
                }
            }
        }
        None => info!("Telegram not configured, chat notifications disabled"),
    }

    // ── Watcher ──────────────────────────────────────────────────────
    let connector = Arc::new(ImapConnector::new(
        config.imap.clone(),
        config.mail.mailbox.clone(),
    ));
    let watcher = MailboxWatcher::new(
        connector,
        Arc::new(pipeline),
        WatcherConfig::from_mail_config(&config.mail),
    );

    info!("Connecting to IMAP server");
    let (handle, mut watcher_task) = match watcher.start().await {
        Ok(started) => started,
        Err(e) => {
            renderer.close().await;
            return Err(e.into());
        }
    };

    let purge = spawn_temp_purge(config.temp_dir.clone(), TEMP_PURGE_INTERVAL, TEMP_MAX_AGE);
    let stdin = spawn_stdin_trigger(handle.clone());

    info!(
        target_sender = %config.mail.target_sender,
        mailbox = %config.mail.mailbox,
        page_url = publisher.page_url(),
        "Service started successfully, waiting for emails"
    );
    eprintln!("   Press Enter to check for new mail manually.\n");

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT signal");
            0
        }
        _ = terminate_signal() => {
            info!("Received SIGTERM signal");
            0
        }
        result = &mut watcher_task => {
            error!(?result, "Mailbox watcher stopped unexpectedly");
            1
        }
    };

    info!("Stopping service");
    handle.shutdown();
    if code == 0 && tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut watcher_task).await.is_err() {
        warn!("Watcher did not stop in time, aborting");
        watcher_task.abort();
    }
    purge.abort();
    stdin.abort();
    renderer.close().await;

    info!("Service stopped successfully");
    Ok(code)
}

/// Each line on stdin requests a manual check. EOF only disables the trigger.
fn spawn_stdin_trigger(handle: WatcherHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(_)) => handle.check_now(),
                Ok(None) => {
                    debug!("stdin closed, manual checks disabled");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Error reading stdin");
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
