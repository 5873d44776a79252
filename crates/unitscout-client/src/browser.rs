use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::task::JoinHandle;
use unitscout_core::{AppError, ScrapeFailure, ScrapeFailureKind, SessionLauncher};
use url::Url;

/// Launches one headless Chromium process per pooled session.
///
/// Requires a Chromium / Chrome binary reachable via `$CHROME_BIN`, one of
/// the well-known install paths, or the default lookup of `chromiumoxide`.
#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher {
    chrome_bin: Option<PathBuf>,
}

impl ChromiumLauncher {
    pub fn new() -> Self {
        Self {
            chrome_bin: find_chrome_binary(),
        }
    }

    pub fn with_chrome_bin(path: impl Into<PathBuf>) -> Self {
        Self {
            chrome_bin: Some(path.into()),
        }
    }

    fn browser_config(&self) -> Result<BrowserConfig, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();
        if let Some(bin) = &self.chrome_bin {
            builder = builder.chrome_executable(bin);
        }

        builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::BrowserError(format!("Browser config error: {e}")))
    }
}

impl SessionLauncher for ChromiumLauncher {
    type Session = BrowserSession;

    async fn launch(&self) -> Result<BrowserSession, AppError> {
        let config = self.browser_config()?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::BrowserError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(BrowserSession { browser, handler })
    }

    async fn destroy(&self, mut session: BrowserSession) {
        if let Err(e) = session.browser.close().await {
            tracing::warn!(error = %e, "Failed to close browser cleanly");
        }
        if let Err(e) = session.browser.wait().await {
            tracing::warn!(error = %e, "Failed to reap browser process");
        }
        session.handler.abort();
    }
}

/// One Chromium process and its CDP event loop.
pub struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

/// A fully rendered page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub title: String,
    pub html: String,
}

impl BrowserSession {
    /// Open `url` in a fresh tab, wait for `ready_selector`, and return the
    /// rendered DOM. The tab is closed on every path.
    pub async fn render(
        &self,
        url: &Url,
        ready_selector: &str,
        timeout: Duration,
    ) -> Result<RenderedPage, ScrapeFailure> {
        let result = tokio::time::timeout(timeout, async {
            let page = self.browser.new_page(url.as_str()).await.map_err(|e| {
                navigation_failure(format!("Failed to navigate to {url}: {e}"))
            })?;

            let rendered = async {
                page.find_element(ready_selector).await.map_err(|e| {
                    ScrapeFailure::from_message(format!(
                        "Page {url} did not render '{ready_selector}': {e}"
                    ))
                })?;
                let title = page
                    .get_title()
                    .await
                    .map_err(|e| ScrapeFailure::from_message(format!("Failed to read title: {e}")))?
                    .unwrap_or_default();
                let html = page.content().await.map_err(|e| {
                    ScrapeFailure::from_message(format!("Failed to read page content: {e}"))
                })?;
                Ok(RenderedPage {
                    url: url.to_string(),
                    title,
                    html,
                })
            }
            .await;

            let _ = page.close().await;
            rendered
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ScrapeFailure::new(
                ScrapeFailureKind::Timeout,
                format!("Timed out after {}s loading {url}", timeout.as_secs()),
            )),
        }
    }
}

/// Navigation errors are classified by their text (CDP reports e.g.
/// `net::ERR_HTTP_RESPONSE_CODE_FAILURE` or a 429), defaulting to a failed
/// navigation.
fn navigation_failure(message: String) -> ScrapeFailure {
    match ScrapeFailureKind::classify_message(&message) {
        ScrapeFailureKind::Other => {
            ScrapeFailure::new(ScrapeFailureKind::NavigationFailed, message)
        }
        kind => ScrapeFailure::new(kind, message),
    }
}

/// Tries to locate the real Chrome/Chromium binary.
///
/// On systems where Chromium is installed via **snap**, the wrapper at
/// `/snap/bin/chromium` strips unknown CLI flags, breaking headless mode,
/// so the binary inside the snap is preferred. Returns `None` to let
/// `chromiumoxide` do its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    const CANDIDATES: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
        tracing::warn!(path = %p, "CHROME_BIN does not exist, falling back to defaults");
    }

    CANDIDATES.iter().map(PathBuf::from).find(|p| p.exists())
}
