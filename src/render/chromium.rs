//! Chromium renderer built on chromiumoxide.
//!
//! One browser process is launched with a persistent profile directory so
//! logins survive restarts. Each render opens a fresh page, waits for the
//! navigation to go network-idle, prints it to PDF and closes the page again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as LaunchConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetTimezoneOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    EventLifecycleEvent, NavigateParams, PrintToPdfParams, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Handler, Page};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrowserConfig;
use crate::error::RenderError;
use crate::render::{RenderOptions, Renderer, pdf_filename};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(60);
const SETTLE_DELAY: Duration = Duration::from_secs(2);
const SELECTOR_TIMEOUT: Duration = Duration::from_secs(10);
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const VIEWPORT_WIDTH: u32 = 1920;
const VIEWPORT_HEIGHT: u32 = 1080;

/// A4 in inches.
const PAPER_WIDTH_IN: f64 = 8.27;
const PAPER_HEIGHT_IN: f64 = 11.69;
/// 20 CSS pixels at 96 px per inch.
const MARGIN_IN: f64 = 20.0 / 96.0;

/// Renders pages with a locally launched Chromium.
pub struct ChromiumRenderer {
    config: BrowserConfig,
    temp_dir: PathBuf,
    browser: Mutex<Option<RunningBrowser>>,
}

struct RunningBrowser {
    browser: Browser,
    /// Drives the CDP connection; finishes when the browser goes away.
    handler: JoinHandle<()>,
    /// Blank page kept open in headed mode for manual login.
    _login_page: Option<Page>,
}

impl RunningBrowser {
    fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn shutdown(mut self) {
        let graceful = tokio::time::timeout(CLOSE_TIMEOUT, self.browser.close()).await;
        if !matches!(graceful, Ok(Ok(_))) {
            debug!("Browser.close did not complete, killing process");
            let _ = self.browser.kill().await;
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, self.browser.wait())
            .await
            .is_err()
        {
            warn!("Browser process did not exit in time");
        }
        self.handler.abort();
    }
}

impl ChromiumRenderer {
    /// Create a renderer; the browser is started on first use.
    pub fn new(config: BrowserConfig, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            temp_dir: temp_dir.into(),
            browser: Mutex::new(None),
        }
    }

    /// Create a renderer and start the browser immediately.
    pub async fn launch(
        config: BrowserConfig,
        temp_dir: impl Into<PathBuf>,
    ) -> Result<Self, RenderError> {
        let renderer = Self::new(config, temp_dir);
        let browser = launch_browser(&renderer.config).await?;
        *renderer.browser.lock().await = Some(browser);
        Ok(renderer)
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<PathBuf, RenderError> {
        let mut guard = self.browser.lock().await;
        if let Some(dead) = guard.take_if(|b| !b.is_alive()) {
            warn!("Browser connection lost, relaunching");
            dead.shutdown().await;
        }
        if guard.is_none() {
            *guard = Some(launch_browser(&self.config).await?);
        }
        let running = guard.as_ref().ok_or(RenderError::NotRunning)?;

        let result = render_page(
            &running.browser,
            url,
            options,
            &self.config.timezone,
            &self.temp_dir,
        )
        .await;
        let alive = running.is_alive();

        result.map_err(|e| {
            let e = classify_failure(e, alive);
            error!(error = %e, url, "Failed to generate PDF");
            if matches!(e, RenderError::NotRunning) {
                // Relaunch on the next render.
                *guard = None;
            }
            e
        })
    }

    async fn close(&self) {
        let Some(running) = self.browser.lock().await.take() else {
            return;
        };
        running.shutdown().await;
        info!("Browser closed successfully");
    }
}

/// A failure after the CDP connection died means the browser is gone,
/// whatever the command reported.
fn classify_failure(err: RenderError, connection_alive: bool) -> RenderError {
    if connection_alive {
        err
    } else {
        RenderError::NotRunning
    }
}

// ── Launch ──────────────────────────────────────────────────────────

async fn launch_browser(config: &BrowserConfig) -> Result<RunningBrowser, RenderError> {
    tokio::fs::create_dir_all(&config.session_dir).await?;
    let session_dir = std::path::absolute(&config.session_dir)?;

    info!(
        bin = %config.bin,
        session_dir = %session_dir.display(),
        headless = config.headless,
        "Launching browser with persistent profile"
    );

    let launch = launch_config(config, &session_dir).map_err(|reason| RenderError::Launch {
        bin: config.bin.clone(),
        reason,
    })?;
    let (browser, handler) = Browser::launch(launch)
        .await
        .map_err(|e| RenderError::Launch {
            bin: config.bin.clone(),
            reason: e.to_string(),
        })?;
    let handler = spawn_handler(handler);

    let login_page = if config.headless {
        None
    } else {
        let page = browser.new_page("about:blank").await?;
        warn!("Browser is running in headed mode for manual login");
        warn!("If you need to login to any sites, do it now; sessions are saved and reused");
        Some(page)
    };

    info!("Browser initialized successfully");
    Ok(RunningBrowser {
        browser,
        handler,
        _login_page: login_page,
    })
}

fn launch_config(config: &BrowserConfig, session_dir: &Path) -> Result<LaunchConfig, String> {
    let mut builder = LaunchConfig::builder()
        .chrome_executable(&config.bin)
        .user_data_dir(session_dir)
        .window_size(VIEWPORT_WIDTH, VIEWPORT_HEIGHT)
        .viewport(Viewport {
            width: VIEWPORT_WIDTH,
            height: VIEWPORT_HEIGHT,
            ..Default::default()
        })
        .request_timeout(REQUEST_TIMEOUT)
        .args(launch_args(config));
    if !config.headless {
        builder = builder.with_head();
    }
    builder.build()
}

fn launch_args(config: &BrowserConfig) -> Vec<String> {
    vec![
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        format!("--user-agent={}", config.user_agent),
        format!("--lang={}", config.locale),
    ]
}

fn spawn_handler(mut handler: Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            match event {
                Ok(()) => {}
                Err(e @ CdpError::Ws(_)) => {
                    warn!(error = %e, "Browser connection closed");
                    break;
                }
                Err(e) => debug!(error = %e, "Browser handler error"),
            }
        }
        debug!("Browser handler stopped");
    })
}

// ── Render ──────────────────────────────────────────────────────────

async fn render_page(
    browser: &Browser,
    url: &str,
    options: &RenderOptions,
    timezone: &str,
    temp_dir: &Path,
) -> Result<PathBuf, RenderError> {
    let page = browser.new_page("about:blank").await?;
    let result = print_page(&page, url, options, timezone, temp_dir).await;
    if let Err(e) = page.close().await {
        warn!(error = %e, "Failed to close page");
    }
    result
}

async fn print_page(
    page: &Page,
    url: &str,
    options: &RenderOptions,
    timezone: &str,
    temp_dir: &Path,
) -> Result<PathBuf, RenderError> {
    page.execute(SetTimezoneOverrideParams::new(timezone))
        .await?;
    let mut lifecycle = page.event_listener::<EventLifecycleEvent>().await?;
    page.execute(SetLifecycleEventsEnabledParams::new(true))
        .await?;

    info!(url, "Navigating to URL");
    tokio::time::timeout(NAVIGATION_TIMEOUT, async {
        let nav = page.execute(NavigateParams::new(url)).await?;
        if let Some(reason) = nav.result.error_text.as_deref().filter(|e| !e.is_empty()) {
            return Err(RenderError::Navigation {
                url: url.to_string(),
                reason: reason.to_string(),
            });
        }
        let loader = nav.result.loader_id.as_ref().map(|id| id.inner().clone());
        while let Some(event) = lifecycle.next().await {
            if is_network_idle(&event.name, event.loader_id.inner(), loader.as_deref()) {
                return Ok(());
            }
        }
        Err(RenderError::NotRunning)
    })
    .await
    .map_err(|_| RenderError::Timeout {
        stage: "navigation".into(),
        timeout: NAVIGATION_TIMEOUT,
    })??;

    // Let late scripts settle.
    tokio::time::sleep(SETTLE_DELAY).await;

    if let Some(selector) = options.wait_for_selector.as_deref() {
        info!(selector, "Waiting for selector");
        tokio::time::timeout(SELECTOR_TIMEOUT, async {
            while page.find_element(selector).await.is_err() {
                tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
            }
        })
        .await
        .map_err(|_| RenderError::Timeout {
            stage: format!("waiting for selector {selector}"),
            timeout: SELECTOR_TIMEOUT,
        })?;
    }

    tokio::fs::create_dir_all(temp_dir).await?;
    let path = temp_dir.join(pdf_filename(url, Utc::now()));
    info!(file = %path.display(), "Generating PDF");

    let bytes = page.pdf(print_params()).await?;
    tokio::fs::write(&path, &bytes).await?;

    info!(
        path = %path.display(),
        size_kb = bytes.len() / 1024,
        "PDF generated successfully"
    );
    Ok(path)
}

fn print_params() -> PrintToPdfParams {
    PrintToPdfParams {
        paper_width: Some(PAPER_WIDTH_IN),
        paper_height: Some(PAPER_HEIGHT_IN),
        margin_top: Some(MARGIN_IN),
        margin_right: Some(MARGIN_IN),
        margin_bottom: Some(MARGIN_IN),
        margin_left: Some(MARGIN_IN),
        print_background: Some(true),
        prefer_css_page_size: Some(false),
        ..Default::default()
    }
}

/// `networkIdle` for our navigation's loader, or any loader when the
/// navigation did not report one.
fn is_network_idle(name: &str, loader: &str, expected: Option<&str>) -> bool {
    name == "networkIdle" && expected.is_none_or(|l| l == loader)
}
